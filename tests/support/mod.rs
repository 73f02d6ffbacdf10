#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use users_outbox::config::RelayConfig;
use users_outbox::messaging::{Broker, BrokerAck, BrokerError, OutboundMessage};
use users_outbox::models::{DeadLetter, NewOutboxRecord, NewUser, OutboxRecord, Role, RoleName, User};
use users_outbox::store::{
    DirectoryTx, InMemoryStore, OutboxStore, OutboxTx, StoreError, StoreResult, StoreTransaction,
    TransactionalStore,
};
use users_outbox::writer::Registration;

pub fn registration(name: &str) -> Registration {
    Registration {
        username: name.to_string(),
        email: format!("{}@example.com", name),
        password_hash: "$2a$10$7EqJtq98hPqEX7fNZaFWoO".to_string(),
    }
}

pub fn relay_config() -> RelayConfig {
    RelayConfig {
        poll_interval: Duration::from_millis(50),
        publish_timeout: Duration::from_millis(200),
        cycle_timeout: Duration::from_secs(2),
        lease_ttl: Duration::from_secs(5),
        max_decode_failures: 3,
        ..RelayConfig::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerMode {
    Ack,
    Fail,
    Hang,
}

/// Broker that remembers every acknowledged message
pub struct RecordingBroker {
    mode: Mutex<BrokerMode>,
    delivered: Mutex<Vec<OutboundMessage>>,
    attempts: AtomicUsize,
    delay: Mutex<Duration>,
}

impl RecordingBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(BrokerMode::Ack),
            delivered: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn set_mode(&self, mode: BrokerMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Delay applied before each acknowledgement
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn delivered(&self) -> Vec<OutboundMessage> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for RecordingBroker {
    async fn publish(&self, message: &OutboundMessage) -> Result<BrokerAck, BrokerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();
        let delay = *self.delay.lock().unwrap();

        match mode {
            BrokerMode::Fail => Err(BrokerError::Unavailable("connection refused".to_string())),
            BrokerMode::Hang => std::future::pending().await,
            BrokerMode::Ack => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                self.delivered.lock().unwrap().push(message.clone());
                Ok(BrokerAck)
            }
        }
    }
}

/// Wraps a store to inject failures at the points that matter for
/// delivery guarantees.
#[derive(Clone)]
pub struct FaultyStore<S = InMemoryStore> {
    inner: S,
    fail_deletes: Arc<AtomicBool>,
    fail_outbox_inserts: Arc<AtomicBool>,
    skip_existence_checks: Arc<AtomicBool>,
}

impl<S> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_deletes: Arc::new(AtomicBool::new(false)),
            fail_outbox_inserts: Arc::new(AtomicBool::new(false)),
            skip_existence_checks: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulates the relay dying after the acknowledgement
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_outbox_inserts(&self, fail: bool) {
        self.fail_outbox_inserts.store(fail, Ordering::SeqCst);
    }

    /// Username and email lookups report "free", as they would for a
    /// writer racing another one past the checks.
    pub fn skip_existence_checks(&self, skip: bool) {
        self.skip_existence_checks.store(skip, Ordering::SeqCst);
    }
}

#[async_trait]
impl<S: OutboxStore> OutboxStore for FaultyStore<S> {
    async fn fetch_pending(&self, topic: Option<&str>, limit: i64) -> StoreResult<Vec<OutboxRecord>> {
        self.inner.fetch_pending(topic, limit).await
    }

    async fn delete(&self, id: i64) -> StoreResult<bool> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        self.inner.delete(id).await
    }

    async fn pending_count(&self, topic: Option<&str>) -> StoreResult<i64> {
        self.inner.pending_count(topic).await
    }

    async fn dead_letter(&self, record: &OutboxRecord, error: &str, failed_attempts: i32) -> StoreResult<bool> {
        self.inner.dead_letter(record, error, failed_attempts).await
    }

    async fn dead_letters(&self, limit: i64) -> StoreResult<Vec<DeadLetter>> {
        self.inner.dead_letters(limit).await
    }

    async fn try_claim_lane(&self, lane: &str, owner: Uuid, ttl: Duration) -> StoreResult<bool> {
        self.inner.try_claim_lane(lane, owner, ttl).await
    }

    async fn release_lane(&self, lane: &str, owner: Uuid) -> StoreResult<()> {
        self.inner.release_lane(lane, owner).await
    }
}

#[async_trait]
impl<S: TransactionalStore> TransactionalStore for FaultyStore<S> {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        Ok(Box::new(FaultyTransaction {
            inner: self.inner.begin().await?,
            fail_outbox_inserts: self.fail_outbox_inserts.load(Ordering::SeqCst),
            skip_existence_checks: self.skip_existence_checks.load(Ordering::SeqCst),
        }))
    }
}

struct FaultyTransaction {
    inner: Box<dyn StoreTransaction>,
    fail_outbox_inserts: bool,
    skip_existence_checks: bool,
}

#[async_trait]
impl DirectoryTx for FaultyTransaction {
    async fn find_role(&mut self, name: RoleName) -> StoreResult<Option<Role>> {
        self.inner.find_role(name).await
    }

    async fn username_exists(&mut self, username: &str) -> StoreResult<bool> {
        if self.skip_existence_checks {
            return Ok(false);
        }
        self.inner.username_exists(username).await
    }

    async fn email_exists(&mut self, email: &str) -> StoreResult<bool> {
        if self.skip_existence_checks {
            return Ok(false);
        }
        self.inner.email_exists(email).await
    }

    async fn find_user(&mut self, id: i64) -> StoreResult<Option<User>> {
        self.inner.find_user(id).await
    }

    async fn insert_user(&mut self, user: NewUser) -> StoreResult<User> {
        self.inner.insert_user(user).await
    }

    async fn update_user(&mut self, user: &User) -> StoreResult<()> {
        self.inner.update_user(user).await
    }

    async fn delete_user(&mut self, id: i64) -> StoreResult<bool> {
        self.inner.delete_user(id).await
    }
}

#[async_trait]
impl OutboxTx for FaultyTransaction {
    async fn insert_outbox(&mut self, record: NewOutboxRecord) -> StoreResult<i64> {
        if self.fail_outbox_inserts {
            return Err(StoreError::Unavailable("disk full".to_string()));
        }
        self.inner.insert_outbox(record).await
    }
}

#[async_trait]
impl StoreTransaction for FaultyTransaction {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.inner.commit().await
    }
}
