use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::models::{DeadLetter, NewOutboxRecord, NewUser, OutboxRecord, Role, RoleName, User};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

// ============================================================================
// Store Abstractions
// ============================================================================
//
// Two sides share the outbox table:
//
// - Write side: `TransactionalStore::begin` opens a local transaction in which
//   the Directory mutation and the outbox insert happen together. Dropping a
//   transaction without `commit` rolls both back.
// - Relay side: `OutboxStore` reads pending records and deletes them once the
//   broker has acknowledged. It never inserts.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Carries the name of the violated constraint
    #[error("Unique constraint violated: {0}")]
    Conflict(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Unique constraints on `users`, as named by PostgreSQL
pub const USERNAME_UNIQUE: &str = "users_username_key";
pub const EMAIL_UNIQUE: &str = "users_email_key";

/// Directory operations available inside a transaction
#[async_trait]
pub trait DirectoryTx: Send {
    async fn find_role(&mut self, name: RoleName) -> StoreResult<Option<Role>>;

    async fn username_exists(&mut self, username: &str) -> StoreResult<bool>;

    async fn email_exists(&mut self, email: &str) -> StoreResult<bool>;

    async fn find_user(&mut self, id: i64) -> StoreResult<Option<User>>;

    /// Insert a user and its role links; returns the stored user with its id
    async fn insert_user(&mut self, user: NewUser) -> StoreResult<User>;

    /// Overwrite attributes and role links of an existing user
    async fn update_user(&mut self, user: &User) -> StoreResult<()>;

    async fn delete_user(&mut self, id: i64) -> StoreResult<bool>;
}

/// Insert-only access to the outbox inside a transaction
#[async_trait]
pub trait OutboxTx: Send {
    /// Returns the id assigned to the new record
    async fn insert_outbox(&mut self, record: NewOutboxRecord) -> StoreResult<i64>;
}

#[async_trait]
pub trait StoreTransaction: DirectoryTx + OutboxTx {
    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

#[async_trait]
pub trait TransactionalStore: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>>;
}

/// Relay-side view of the outbox
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Pending records in insertion order, optionally for one topic
    async fn fetch_pending(&self, topic: Option<&str>, limit: i64) -> StoreResult<Vec<OutboxRecord>>;

    /// Returns `false` when the row was already gone
    async fn delete(&self, id: i64) -> StoreResult<bool>;

    async fn pending_count(&self, topic: Option<&str>) -> StoreResult<i64>;

    /// Move a record to the dead-letter table and remove it from the outbox
    /// in one transaction. Returns `false` if the record had already left the
    /// outbox.
    async fn dead_letter(&self, record: &OutboxRecord, error: &str, failed_attempts: i32) -> StoreResult<bool>;

    async fn dead_letters(&self, limit: i64) -> StoreResult<Vec<DeadLetter>>;

    /// Claim or renew the lease on a relay lane. Succeeds when the lane is
    /// free, expired, or already held by `owner`.
    async fn try_claim_lane(&self, lane: &str, owner: Uuid, ttl: Duration) -> StoreResult<bool>;

    async fn release_lane(&self, lane: &str, owner: Uuid) -> StoreResult<()>;
}
