use async_trait::async_trait;
use uuid::Uuid;

mod kafka;

pub use kafka::KafkaBroker;

// ============================================================================
// Broker Collaborator
// ============================================================================
//
// The relay is the only caller. `publish` resolves once the broker has
// durably accepted the message; any error means "not acknowledged" and the
// record stays pending.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub key: i64,
    pub payload: String,
    /// Carried as a header so consumers can drop duplicates
    pub event_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BrokerAck;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Broker rejected message: {0}")]
    Rejected(String),

    #[error("Broker client error: {0}")]
    Client(String),
}

impl BrokerError {
    /// Short label for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            BrokerError::Unavailable(_) => "unavailable",
            BrokerError::Rejected(_) => "rejected",
            BrokerError::Client(_) => "client",
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, message: &OutboundMessage) -> Result<BrokerAck, BrokerError>;
}
