use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::models::{DeadLetter, NewOutboxRecord, NewUser, OutboxRecord, Role, RoleName, User};
use super::{
    DirectoryTx, OutboxStore, OutboxTx, StoreError, StoreResult, StoreTransaction,
    TransactionalStore, EMAIL_UNIQUE, USERNAME_UNIQUE,
};

// ============================================================================
// In-Memory Store
// ============================================================================
//
// Same contract as the PostgreSQL store, kept in process memory. A
// transaction holds the state lock for its whole lifetime and works on a
// copy; `commit` swaps the copy in, dropping the transaction discards it.
// Identifiers come from counters outside the state so a rolled back insert
// never hands its id to a later one, as with database sequences.
//
// ============================================================================

#[derive(Clone, Default)]
struct State {
    roles: Vec<Role>,
    users: BTreeMap<i64, User>,
    outbox: BTreeMap<i64, OutboxRecord>,
    dead_letters: Vec<DeadLetter>,
    leases: HashMap<String, (Uuid, Instant)>,
}

#[derive(Default)]
struct Sequences {
    user: AtomicI64,
    outbox: AtomicI64,
    dead_letter: AtomicI64,
}

impl Sequences {
    fn next(counter: &AtomicI64) -> i64 {
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
    sequences: Arc<Sequences>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Store seeded with the built-in roles
    pub fn new() -> Self {
        let state = State {
            roles: vec![
                Role { id: 1, name: RoleName::User },
                Role { id: 2, name: RoleName::Admin },
            ],
            ..State::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            sequences: Arc::new(Sequences::default()),
        }
    }

    /// Store without any roles, for exercising missing-role paths
    pub fn without_roles() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            sequences: Arc::new(Sequences::default()),
        }
    }

    pub async fn users(&self) -> Vec<User> {
        self.state.lock().await.users.values().cloned().collect()
    }

    pub async fn user(&self, id: i64) -> Option<User> {
        self.state.lock().await.users.get(&id).cloned()
    }

    /// Every pending record across all topics, in insertion order
    pub async fn outbox(&self) -> Vec<OutboxRecord> {
        self.state.lock().await.outbox.values().cloned().collect()
    }

    /// Insert a record outside any Directory mutation. Lets tests plant
    /// records the writer would never produce.
    pub async fn enqueue_raw(&self, record: NewOutboxRecord) -> i64 {
        let id = Sequences::next(&self.sequences.outbox);
        let mut state = self.state.lock().await;
        state.outbox.insert(id, outbox_record(id, record));
        id
    }
}

fn outbox_record(id: i64, record: NewOutboxRecord) -> OutboxRecord {
    OutboxRecord {
        id,
        topic: record.topic,
        key: record.key,
        payload: record.payload,
        created_at: Utc::now(),
    }
}

pub struct InMemoryTransaction {
    guard: OwnedMutexGuard<State>,
    working: State,
    sequences: Arc<Sequences>,
}

impl InMemoryTransaction {
    fn check_unique(&self, id: Option<i64>, username: &str, email: &str) -> StoreResult<()> {
        for user in self.working.users.values() {
            if Some(user.id) == id {
                continue;
            }
            if user.username == username {
                return Err(StoreError::Conflict(USERNAME_UNIQUE.to_string()));
            }
            if user.email == email {
                return Err(StoreError::Conflict(EMAIL_UNIQUE.to_string()));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DirectoryTx for InMemoryTransaction {
    async fn find_role(&mut self, name: RoleName) -> StoreResult<Option<Role>> {
        Ok(self.working.roles.iter().find(|r| r.name == name).cloned())
    }

    async fn username_exists(&mut self, username: &str) -> StoreResult<bool> {
        Ok(self.working.users.values().any(|u| u.username == username))
    }

    async fn email_exists(&mut self, email: &str) -> StoreResult<bool> {
        Ok(self.working.users.values().any(|u| u.email == email))
    }

    async fn find_user(&mut self, id: i64) -> StoreResult<Option<User>> {
        Ok(self.working.users.get(&id).cloned())
    }

    async fn insert_user(&mut self, user: NewUser) -> StoreResult<User> {
        self.check_unique(None, &user.username, &user.email)?;

        let id = Sequences::next(&self.sequences.user);
        let stored = User {
            id,
            username: user.username,
            email: user.email,
            password_hash: user.password_hash,
            roles: user.roles.iter().map(|r| r.name).collect(),
        };
        self.working.users.insert(id, stored.clone());
        Ok(stored)
    }

    async fn update_user(&mut self, user: &User) -> StoreResult<()> {
        self.check_unique(Some(user.id), &user.username, &user.email)?;

        match self.working.users.get_mut(&user.id) {
            Some(existing) => {
                *existing = user.clone();
                Ok(())
            }
            None => Err(StoreError::Corrupt(format!("user {} vanished inside transaction", user.id))),
        }
    }

    async fn delete_user(&mut self, id: i64) -> StoreResult<bool> {
        Ok(self.working.users.remove(&id).is_some())
    }
}

#[async_trait]
impl OutboxTx for InMemoryTransaction {
    async fn insert_outbox(&mut self, record: NewOutboxRecord) -> StoreResult<i64> {
        let id = Sequences::next(&self.sequences.outbox);
        self.working.outbox.insert(id, outbox_record(id, record));
        Ok(id)
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let InMemoryTransaction { mut guard, working, .. } = *self;
        *guard = working;
        Ok(())
    }
}

#[async_trait]
impl TransactionalStore for InMemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(InMemoryTransaction {
            guard,
            working,
            sequences: self.sequences.clone(),
        }))
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn fetch_pending(&self, topic: Option<&str>, limit: i64) -> StoreResult<Vec<OutboxRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .values()
            .filter(|r| topic.map_or(true, |t| r.topic == t))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn delete(&self, id: i64) -> StoreResult<bool> {
        Ok(self.state.lock().await.outbox.remove(&id).is_some())
    }

    async fn pending_count(&self, topic: Option<&str>) -> StoreResult<i64> {
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .values()
            .filter(|r| topic.map_or(true, |t| r.topic == t))
            .count() as i64)
    }

    async fn dead_letter(&self, record: &OutboxRecord, error: &str, failed_attempts: i32) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state.outbox.remove(&record.id).is_none() {
            return Ok(false);
        }

        let id = Sequences::next(&self.sequences.dead_letter);
        state.dead_letters.push(DeadLetter {
            id,
            outbox_id: record.id,
            topic: record.topic.clone(),
            key: record.key,
            payload: record.payload.clone(),
            error: error.to_string(),
            failed_attempts,
            dead_lettered_at: Utc::now(),
        });
        Ok(true)
    }

    async fn dead_letters(&self, limit: i64) -> StoreResult<Vec<DeadLetter>> {
        let state = self.state.lock().await;
        Ok(state.dead_letters.iter().take(limit.max(0) as usize).cloned().collect())
    }

    async fn try_claim_lane(&self, lane: &str, owner: Uuid, ttl: Duration) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let claimable = match state.leases.get(lane) {
            Some((holder, expires_at)) => *holder == owner || *expires_at <= now,
            None => true,
        };
        if claimable {
            state.leases.insert(lane.to_string(), (owner, now + ttl));
        }
        Ok(claimable)
    }

    async fn release_lane(&self, lane: &str, owner: Uuid) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if matches!(state.leases.get(lane), Some((holder, _)) if *holder == owner) {
            state.leases.remove(lane);
        }
        Ok(())
    }
}
