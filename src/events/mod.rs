use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::models::{RoleName, User};

mod codec;

pub use codec::{CodecError, EventCodec, SCHEMA_VERSION};

// ============================================================================
// User Domain Events
// ============================================================================
//
// Events carry a snapshot of the user taken inside the writing transaction.
// They never reference live Directory state and are immutable once built.
//
// ============================================================================

/// Destination channels, one per event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    UserCreated,
    UserUpdated,
    UserDeleted,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::UserCreated, Topic::UserUpdated, Topic::UserDeleted];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::UserCreated => "user.created",
            Topic::UserUpdated => "user.updated",
            Topic::UserDeleted => "user.deleted",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| CodecError::UnknownTopic(s.to_string()))
    }
}

/// What subscribers learn about a user. The password hash stays behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserSnapshot {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub roles: BTreeSet<RoleName>,
}

impl From<&User> for UserSnapshot {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            roles: user.roles.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", deny_unknown_fields)]
pub enum UserEvent {
    #[serde(rename = "user.created")]
    Created(UserSnapshot),
    #[serde(rename = "user.updated")]
    Updated(UserSnapshot),
    #[serde(rename = "user.deleted")]
    Deleted { id: i64 },
}

impl UserEvent {
    pub fn topic(&self) -> Topic {
        match self {
            UserEvent::Created(_) => Topic::UserCreated,
            UserEvent::Updated(_) => Topic::UserUpdated,
            UserEvent::Deleted { .. } => Topic::UserDeleted,
        }
    }

    /// Partition key: the aggregate identifier
    pub fn key(&self) -> i64 {
        match self {
            UserEvent::Created(snapshot) | UserEvent::Updated(snapshot) => snapshot.id,
            UserEvent::Deleted { id } => *id,
        }
    }
}

/// Wraps an event with the identity consumers deduplicate on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventEnvelope {
    pub schema_version: u32,
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub event: UserEvent,
}

impl EventEnvelope {
    pub fn new(event: UserEvent) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            event_id: Uuid::now_v7(),
            occurred_at: Utc::now(),
            event,
        }
    }

    pub fn topic(&self) -> Topic {
        self.event.topic()
    }

    pub fn key(&self) -> i64 {
        self.event.key()
    }
}
