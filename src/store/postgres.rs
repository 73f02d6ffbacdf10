use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

use crate::models::{DeadLetter, NewOutboxRecord, NewUser, OutboxRecord, Role, RoleName, User};
use super::{
    DirectoryTx, OutboxStore, OutboxTx, StoreError, StoreResult, StoreTransaction,
    TransactionalStore,
};

// ============================================================================
// PostgreSQL Store
// ============================================================================
//
// Tables (see migrations/):
// - users, roles, users_roles   Directory
// - outbox                      pending events
// - outbox_dead_letters         records the relay gave up on
// - relay_leases                one row per relay lane
//
// ============================================================================

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;

        tracing::info!(max_connections, "Connected to PostgreSQL");
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Database schema is up to date");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_conflict(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(
            db.constraint()
                .map(str::to_string)
                .unwrap_or_else(|| db.message().to_string()),
        ),
        _ => StoreError::Database(err),
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    username: String,
    email: String,
    password: String,
}

#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: i64,
    topic: String,
    key: i64,
    payload: String,
    created_at: DateTime<Utc>,
}

impl From<OutboxRow> for OutboxRecord {
    fn from(row: OutboxRow) -> Self {
        Self {
            id: row.id,
            topic: row.topic,
            key: row.key,
            payload: row.payload,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    id: i64,
    outbox_id: i64,
    topic: String,
    key: i64,
    payload: String,
    error: String,
    failed_attempts: i32,
    dead_lettered_at: DateTime<Utc>,
}

impl From<DeadLetterRow> for DeadLetter {
    fn from(row: DeadLetterRow) -> Self {
        Self {
            id: row.id,
            outbox_id: row.outbox_id,
            topic: row.topic,
            key: row.key,
            payload: row.payload,
            error: row.error,
            failed_attempts: row.failed_attempts,
            dead_lettered_at: row.dead_lettered_at,
        }
    }
}

// ============================================================================
// Write side
// ============================================================================

/// Open local transaction. Dropping it without `commit` rolls back.
pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgTransaction {
    async fn link_roles(&mut self, user_id: i64, roles: &[RoleName]) -> StoreResult<()> {
        let names: Vec<String> = roles.iter().map(|r| r.as_str().to_string()).collect();
        sqlx::query(
            "INSERT INTO users_roles (user_id, role_id)
             SELECT $1, id FROM roles WHERE name = ANY($2)",
        )
        .bind(user_id)
        .bind(&names)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn load_roles(&mut self, user_id: i64) -> StoreResult<BTreeSet<RoleName>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT r.name FROM roles r
             JOIN users_roles ur ON ur.role_id = r.id
             WHERE ur.user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&mut *self.tx)
        .await?;

        names
            .iter()
            .map(|name| name.parse::<RoleName>().map_err(|e| StoreError::Corrupt(e.to_string())))
            .collect()
    }
}

#[async_trait]
impl DirectoryTx for PgTransaction {
    async fn find_role(&mut self, name: RoleName) -> StoreResult<Option<Role>> {
        let id: Option<i32> = sqlx::query_scalar("SELECT id FROM roles WHERE name = $1")
            .bind(name.as_str())
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(id.map(|id| Role { id, name }))
    }

    async fn username_exists(&mut self, username: &str) -> StoreResult<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE username = $1)")
            .bind(username)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(exists)
    }

    async fn email_exists(&mut self, email: &str) -> StoreResult<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE email = $1)")
            .bind(email)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(exists)
    }

    async fn find_user(&mut self, id: i64) -> StoreResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, email, password FROM users WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let roles = self.load_roles(row.id).await?;

        Ok(Some(User {
            id: row.id,
            username: row.username,
            email: row.email,
            password_hash: row.password,
            roles,
        }))
    }

    async fn insert_user(&mut self, user: NewUser) -> StoreResult<User> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO users (username, email, password) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_conflict)?;

        for role in &user.roles {
            sqlx::query("INSERT INTO users_roles (user_id, role_id) VALUES ($1, $2)")
                .bind(id)
                .bind(role.id)
                .execute(&mut *self.tx)
                .await?;
        }

        Ok(User {
            id,
            username: user.username,
            email: user.email,
            password_hash: user.password_hash,
            roles: user.roles.iter().map(|r| r.name).collect(),
        })
    }

    async fn update_user(&mut self, user: &User) -> StoreResult<()> {
        sqlx::query("UPDATE users SET username = $2, email = $3, password = $4 WHERE id = $1")
            .bind(user.id)
            .bind(&user.username)
            .bind(&user.email)
            .bind(&user.password_hash)
            .execute(&mut *self.tx)
            .await
            .map_err(map_conflict)?;

        sqlx::query("DELETE FROM users_roles WHERE user_id = $1")
            .bind(user.id)
            .execute(&mut *self.tx)
            .await?;

        let roles: Vec<RoleName> = user.roles.iter().copied().collect();
        self.link_roles(user.id, &roles).await
    }

    async fn delete_user(&mut self, id: i64) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl OutboxTx for PgTransaction {
    async fn insert_outbox(&mut self, record: NewOutboxRecord) -> StoreResult<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO outbox (topic, key, payload) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(&record.topic)
        .bind(record.key)
        .bind(&record.payload)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let PgTransaction { tx } = *self;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl TransactionalStore for PgStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }
}

// ============================================================================
// Relay side
// ============================================================================

#[async_trait]
impl OutboxStore for PgStore {
    async fn fetch_pending(&self, topic: Option<&str>, limit: i64) -> StoreResult<Vec<OutboxRecord>> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            "SELECT id, topic, key, payload, created_at FROM outbox
             WHERE ($1::text IS NULL OR topic = $1)
             ORDER BY id
             LIMIT $2",
        )
        .bind(topic)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(OutboxRecord::from).collect())
    }

    async fn delete(&self, id: i64) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM outbox WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn pending_count(&self, topic: Option<&str>) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM outbox WHERE ($1::text IS NULL OR topic = $1)",
        )
        .bind(topic)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn dead_letter(&self, record: &OutboxRecord, error: &str, failed_attempts: i32) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM outbox WHERE id = $1")
            .bind(record.id)
            .execute(&mut *tx)
            .await?;
        if removed.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO outbox_dead_letters (outbox_id, topic, key, payload, error, failed_attempts)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(record.id)
        .bind(&record.topic)
        .bind(record.key)
        .bind(&record.payload)
        .bind(error)
        .bind(failed_attempts)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn dead_letters(&self, limit: i64) -> StoreResult<Vec<DeadLetter>> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            "SELECT id, outbox_id, topic, key, payload, error, failed_attempts, dead_lettered_at
             FROM outbox_dead_letters
             ORDER BY id
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(DeadLetter::from).collect())
    }

    async fn try_claim_lane(&self, lane: &str, owner: Uuid, ttl: Duration) -> StoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO relay_leases (lane, owner, expires_at)
             VALUES ($1, $2, now() + $3::double precision * interval '1 millisecond')
             ON CONFLICT (lane) DO UPDATE
                SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
                WHERE relay_leases.owner = EXCLUDED.owner OR relay_leases.expires_at < now()",
        )
        .bind(lane)
        .bind(owner)
        .bind(ttl.as_millis() as f64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lane(&self, lane: &str, owner: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM relay_leases WHERE lane = $1 AND owner = $2")
            .bind(lane)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
