use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::events::{CodecError, EventCodec, EventEnvelope, UserEvent, UserSnapshot};
use crate::models::{NewOutboxRecord, NewUser, RoleName, User, UserChanges};
use crate::store::{
    DirectoryTx, OutboxTx, StoreError, StoreTransaction, TransactionalStore, EMAIL_UNIQUE, USERNAME_UNIQUE,
};

// ============================================================================
// Unit-of-Work Writer
// ============================================================================
//
// Every mutating Directory operation runs in one local transaction together
// with the insert of its outbox record:
//
//   begin → Directory mutation → snapshot → encode → outbox insert → commit
//
// Any error before `commit` returns drops the transaction, so neither the
// user change nor the record survives. The broker is never contacted here.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("Username {0} is already taken")]
    UsernameTaken(String),

    #[error("Email {0} is already taken")]
    EmailTaken(String),

    #[error("Role {0} was not found")]
    RoleNotFound(RoleName),

    #[error("User {0} was not found")]
    UserNotFound(i64),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Registration input. The credential arrives already hashed.
#[derive(Debug, Clone)]
pub struct Registration {
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

/// Result of a committed write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    /// State of the user as captured in the event
    pub user: User,
    pub outbox_id: i64,
    pub event_id: Uuid,
}

pub struct UserWriter {
    store: Arc<dyn TransactionalStore>,
    codec: EventCodec,
}

impl UserWriter {
    pub fn new(store: Arc<dyn TransactionalStore>) -> Self {
        Self {
            store,
            codec: EventCodec::new(),
        }
    }

    pub async fn register(&self, registration: Registration) -> Result<Committed, WriteError> {
        let mut tx = self.store.begin().await?;

        if tx.username_exists(&registration.username).await? {
            return Err(WriteError::UsernameTaken(registration.username));
        }
        if tx.email_exists(&registration.email).await? {
            return Err(WriteError::EmailTaken(registration.email));
        }

        let role = tx
            .find_role(RoleName::DEFAULT)
            .await?
            .ok_or(WriteError::RoleNotFound(RoleName::DEFAULT))?;

        let (username, email) = (registration.username.clone(), registration.email.clone());
        let user = tx
            .insert_user(NewUser {
                username: registration.username,
                email: registration.email,
                password_hash: registration.password_hash,
                roles: vec![role],
            })
            .await
            .map_err(|e| taken(e, &username, &email))?;

        let event = UserEvent::Created(UserSnapshot::from(&user));
        self.commit_with_event(tx, user, event).await
    }

    pub async fn update(&self, id: i64, changes: UserChanges) -> Result<Committed, WriteError> {
        let mut tx = self.store.begin().await?;

        let mut user = tx.find_user(id).await?.ok_or(WriteError::UserNotFound(id))?;

        if let Some(username) = changes.username {
            if username != user.username && tx.username_exists(&username).await? {
                return Err(WriteError::UsernameTaken(username));
            }
            user.username = username;
        }
        if let Some(email) = changes.email {
            if email != user.email && tx.email_exists(&email).await? {
                return Err(WriteError::EmailTaken(email));
            }
            user.email = email;
        }
        if let Some(password_hash) = changes.password_hash {
            user.password_hash = password_hash;
        }
        if let Some(names) = changes.roles.filter(|names| !names.is_empty()) {
            let mut roles = BTreeSet::new();
            for name in names {
                let role = tx.find_role(name).await?.ok_or(WriteError::RoleNotFound(name))?;
                roles.insert(role.name);
            }
            user.roles = roles;
        }

        tx.update_user(&user)
            .await
            .map_err(|e| taken(e, &user.username, &user.email))?;

        let event = UserEvent::Updated(UserSnapshot::from(&user));
        self.commit_with_event(tx, user, event).await
    }

    pub async fn delete(&self, id: i64) -> Result<Committed, WriteError> {
        let mut tx = self.store.begin().await?;

        let user = tx.find_user(id).await?.ok_or(WriteError::UserNotFound(id))?;
        if !tx.delete_user(id).await? {
            return Err(WriteError::UserNotFound(id));
        }

        self.commit_with_event(tx, user, UserEvent::Deleted { id }).await
    }

    async fn commit_with_event(
        &self,
        mut tx: Box<dyn StoreTransaction>,
        user: User,
        event: UserEvent,
    ) -> Result<Committed, WriteError> {
        let envelope = EventEnvelope::new(event);
        let payload = self.codec.encode(&envelope)?;

        let outbox_id = tx
            .insert_outbox(NewOutboxRecord {
                topic: envelope.topic().to_string(),
                key: envelope.key(),
                payload,
            })
            .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = user.id,
            outbox_id,
            topic = %envelope.topic(),
            event_id = %envelope.event_id,
            "Committed user change with outbox record"
        );

        Ok(Committed {
            user,
            outbox_id,
            event_id: envelope.event_id,
        })
    }
}

/// A unique violation that slipped past the existence checks (a concurrent
/// writer got there first) is still reported as the taken value.
fn taken(err: StoreError, username: &str, email: &str) -> WriteError {
    match err {
        StoreError::Conflict(constraint) if constraint == USERNAME_UNIQUE => {
            WriteError::UsernameTaken(username.to_string())
        }
        StoreError::Conflict(constraint) if constraint == EMAIL_UNIQUE => {
            WriteError::EmailTaken(email.to_string())
        }
        other => WriteError::Store(other),
    }
}
