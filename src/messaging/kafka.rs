use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;

use crate::metrics::RelayMetrics;
use crate::utils::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
use super::{Broker, BrokerAck, BrokerError, OutboundMessage};

// ============================================================================
// Kafka Broker
// ============================================================================
//
// `acks=all` plus idempotence means a delivery report is only produced once
// every in-sync replica has the message; that report is what the relay
// treats as the acknowledgement. The record key is the aggregate id as a
// decimal string so each user's events land on one partition.
//
// Every send is bounded by `delivery_timeout` inside the circuit breaker, so
// a broker that never answers still counts as a failure. Keep it below the
// relay's publish timeout, which otherwise drops the send first.
//
// ============================================================================

pub struct KafkaBroker {
    producer: FutureProducer,
    circuit_breaker: CircuitBreaker,
    delivery_timeout: Duration,
    metrics: Option<Arc<RelayMetrics>>,
}

impl KafkaBroker {
    pub fn new(brokers: &str, delivery_timeout: Duration) -> Result<Self, BrokerError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", delivery_timeout.as_millis().to_string())
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| BrokerError::Client(e.to_string()))?;

        tracing::info!(brokers, "Kafka producer created");

        Ok(Self {
            producer,
            circuit_breaker: CircuitBreaker::new(CircuitBreakerConfig::default()),
            delivery_timeout,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state().await
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), BrokerError> {
        let key = message.key.to_string();
        let event_id = message.event_id.to_string();
        let headers = OwnedHeaders::new().insert(Header {
            key: "event_id",
            value: Some(event_id.as_str()),
        });

        let record = FutureRecord::to(&message.topic)
            .key(&key)
            .payload(&message.payload)
            .headers(headers);

        let delivery = self.producer.send(record, Timeout::After(self.delivery_timeout));
        match tokio::time::timeout(self.delivery_timeout, delivery).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((e, _))) => Err(classify(&e)),
            Err(_) => Err(BrokerError::Unavailable(format!(
                "no delivery report within {:?}",
                self.delivery_timeout
            ))),
        }
    }
}

/// Transport and availability problems are worth retrying; anything else
/// means Kafka refused this message.
fn classify(error: &KafkaError) -> BrokerError {
    let transient = match error {
        KafkaError::Canceled => true,
        KafkaError::MessageProduction(code) => matches!(
            code,
            RDKafkaErrorCode::MessageTimedOut
                | RDKafkaErrorCode::QueueFull
                | RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::OperationTimedOut
                | RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::NetworkException
                | RDKafkaErrorCode::LeaderNotAvailable
                | RDKafkaErrorCode::NotLeaderForPartition
                | RDKafkaErrorCode::NotEnoughReplicas
                | RDKafkaErrorCode::NotEnoughReplicasAfterAppend
        ),
        _ => false,
    };

    if transient {
        BrokerError::Unavailable(error.to_string())
    } else {
        BrokerError::Rejected(error.to_string())
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn publish(&self, message: &OutboundMessage) -> Result<BrokerAck, BrokerError> {
        let result = self.circuit_breaker.call(self.send(message)).await;

        if let Some(metrics) = &self.metrics {
            metrics.set_circuit_breaker_state(self.circuit_breaker.state().await.as_gauge());
        }

        match result {
            Ok(()) => {
                tracing::debug!(
                    topic = %message.topic,
                    key = message.key,
                    event_id = %message.event_id,
                    "Kafka acknowledged message"
                );
                Ok(BrokerAck)
            }
            Err(CircuitBreakerError::CircuitOpen) => {
                tracing::warn!(topic = %message.topic, "Circuit breaker open, Kafka considered unavailable");
                Err(BrokerError::Unavailable("circuit breaker open".to_string()))
            }
            Err(CircuitBreakerError::OperationFailed(e)) => {
                tracing::error!(error = %e, topic = %message.topic, key = message.key, "Kafka send failed");
                Err(e)
            }
        }
    }
}
