use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::{LaneMode, RelayConfig};
use crate::events::{CodecError, EventCodec, EventEnvelope, Topic};
use crate::messaging::{Broker, OutboundMessage};
use crate::metrics::RelayMetrics;
use crate::models::OutboxRecord;
use crate::scheduler::Scheduler;
use crate::store::{OutboxStore, StoreError};

// ============================================================================
// Outbox Relay
// ============================================================================
//
// One cycle per lane:
//
// 1. Claim (or renew) the lease of every topic the lane covers; skip the
//    cycle if another instance holds any of them.
// 2. Fetch pending records in insertion order.
// 3. For each record: decode, publish, wait for the acknowledgement, then
//    delete. Delete never happens before the acknowledgement.
// 4. A publish error or timeout ends the cycle; the record stays pending and
//    records deleted earlier in the cycle stay deleted.
// 5. An undecodable record is left in place and its key is blocked for the
//    rest of the cycle so later events for the same user do not overtake it.
//    After `max_decode_failures` cycles it is moved to the dead-letter table.
//
// Delivery is at-least-once: a crash between acknowledgement and delete
// republishes the record on the next cycle.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A slice of the outbox drained by one scheduled task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayLane {
    name: String,
    topic: Option<Topic>,
}

impl RelayLane {
    pub fn for_topic(topic: Topic) -> Self {
        Self {
            name: topic.as_str().to_string(),
            topic: Some(topic),
        }
    }

    /// A single lane covering every topic
    pub fn all_topics() -> Self {
        Self {
            name: "all".to_string(),
            topic: None,
        }
    }

    pub fn for_mode(mode: LaneMode) -> Vec<Self> {
        match mode {
            LaneMode::Single => vec![Self::all_topics()],
            LaneMode::PerTopic => Topic::ALL.into_iter().map(Self::for_topic).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> Option<Topic> {
        self.topic
    }

    /// Topics whose leases this lane needs. Leases are always per topic, so
    /// lanes of different modes exclude each other.
    pub fn topics(&self) -> Vec<Topic> {
        match self.topic {
            Some(topic) => vec![topic],
            None => Topic::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every fetched record was handled
    Drained,
    /// Another relay instance owns the lane
    LeaseHeld,
    /// A publish failed or timed out; the record is retried next cycle
    Aborted { outbox_id: i64, reason: String },
    /// The cycle deadline passed before all records were handled
    DeadlineReached,
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Drained => "drained",
            CycleOutcome::LeaseHeld => "lease_held",
            CycleOutcome::Aborted { .. } => "aborted",
            CycleOutcome::DeadlineReached => "deadline",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub lane: String,
    pub fetched: usize,
    pub published: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub dead_lettered: usize,
    pub outcome: CycleOutcome,
}

impl CycleReport {
    fn new(lane: &RelayLane) -> Self {
        Self {
            lane: lane.name().to_string(),
            fetched: 0,
            published: 0,
            deleted: 0,
            skipped: 0,
            dead_lettered: 0,
            outcome: CycleOutcome::Drained,
        }
    }
}

pub struct Relay {
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn Broker>,
    codec: EventCodec,
    config: RelayConfig,
    instance_id: Uuid,
    metrics: Option<Arc<RelayMetrics>>,
    decode_failures: Mutex<HashMap<i64, u32>>,
}

impl Relay {
    pub fn new(store: Arc<dyn OutboxStore>, broker: Arc<dyn Broker>, config: RelayConfig) -> Self {
        Self {
            store,
            broker,
            codec: EventCodec::new(),
            config,
            instance_id: Uuid::new_v4(),
            metrics: None,
            decode_failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Run one read-publish-delete pass over `lane`
    pub async fn run_cycle(&self, lane: &RelayLane) -> Result<CycleReport, RelayError> {
        let deadline = Instant::now() + self.config.cycle_timeout;
        let mut report = CycleReport::new(lane);

        if !self.claim(lane).await? {
            tracing::debug!(lane = lane.name(), "Lane leased by another relay instance");
            report.outcome = CycleOutcome::LeaseHeld;
            self.record_cycle(&report);
            return Ok(report);
        }

        let topic = lane.topic().map(|t| t.as_str());
        let records = self.store.fetch_pending(topic, self.config.batch_size).await?;
        report.fetched = records.len();

        let mut blocked_keys = HashSet::new();

        for record in records {
            if Instant::now() >= deadline {
                tracing::warn!(lane = lane.name(), outbox_id = record.id, "Relay cycle deadline reached");
                report.outcome = CycleOutcome::DeadlineReached;
                break;
            }

            if blocked_keys.contains(&record.key) {
                tracing::debug!(
                    outbox_id = record.id,
                    key = record.key,
                    "Holding back record behind an undecodable one with the same key"
                );
                report.skipped += 1;
                continue;
            }

            let decoded = self
                .codec
                .decode_record(&record)
                .and_then(|envelope| self.codec.encode(&envelope).map(|payload| (envelope, payload)));

            let (envelope, payload) = match decoded {
                Ok(decoded) => {
                    self.decode_failures.lock().await.remove(&record.id);
                    decoded
                }
                Err(e) => {
                    if !self.handle_undecodable(&record, &e, &mut report).await? {
                        blocked_keys.insert(record.key);
                    }
                    continue;
                }
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = remaining.min(self.config.publish_timeout);

            if let Err(reason) = self.publish(&record, &envelope, payload, wait).await {
                report.outcome = CycleOutcome::Aborted {
                    outbox_id: record.id,
                    reason,
                };
                break;
            }
            report.published += 1;

            if self.store.delete(record.id).await? {
                report.deleted += 1;
            } else {
                tracing::debug!(outbox_id = record.id, "Outbox record already deleted");
            }
        }

        if let Some(metrics) = &self.metrics {
            let pending = self.store.pending_count(topic).await?;
            metrics.set_pending(lane.name(), pending);
        }
        self.record_cycle(&report);

        if report.fetched > 0 {
            tracing::info!(
                lane = lane.name(),
                fetched = report.fetched,
                published = report.published,
                skipped = report.skipped,
                dead_lettered = report.dead_lettered,
                outcome = report.outcome.label(),
                "Relay cycle finished"
            );
        }

        Ok(report)
    }

    /// Register one fixed-delay task per lane
    pub fn schedule(self: &Arc<Self>, scheduler: &mut Scheduler, lanes: &[RelayLane]) {
        for lane in lanes {
            let relay = Arc::clone(self);
            let lane = lane.clone();
            let name = format!("outbox-relay:{}", lane.name());

            scheduler.every(name, self.config.poll_interval, move || {
                let relay = Arc::clone(&relay);
                let lane = lane.clone();
                async move {
                    if let Err(e) = relay.run_cycle(&lane).await {
                        tracing::error!(lane = lane.name(), error = %e, "Relay cycle failed");
                        if let Some(metrics) = &relay.metrics {
                            metrics.record_cycle(lane.name(), "error");
                        }
                    }
                }
            });
        }
    }

    /// Give up the lane lease so another instance can take over at once
    pub async fn release(&self, lane: &RelayLane) -> Result<(), RelayError> {
        for topic in lane.topics() {
            self.store.release_lane(topic.as_str(), self.instance_id).await?;
        }
        tracing::info!(lane = lane.name(), instance_id = %self.instance_id, "Released relay lane");
        Ok(())
    }

    /// Claim or renew every topic lease of `lane`. All or nothing: on the
    /// first lease held elsewhere the ones taken here are given back.
    async fn claim(&self, lane: &RelayLane) -> Result<bool, RelayError> {
        let mut claimed = Vec::new();

        for topic in lane.topics() {
            let ok = self
                .store
                .try_claim_lane(topic.as_str(), self.instance_id, self.config.lease_ttl)
                .await?;
            if !ok {
                for taken in claimed {
                    self.store.release_lane(taken, self.instance_id).await?;
                }
                return Ok(false);
            }
            claimed.push(topic.as_str());
        }

        Ok(true)
    }

    /// Publish and wait for the acknowledgement. Returns the failure reason
    /// when the broker errors or `wait` elapses.
    async fn publish(
        &self,
        record: &OutboxRecord,
        envelope: &EventEnvelope,
        payload: String,
        wait: Duration,
    ) -> Result<(), String> {
        let message = OutboundMessage {
            topic: record.topic.clone(),
            key: record.key,
            payload,
            event_id: envelope.event_id,
        };

        let started = Instant::now();
        let (reason, label) = match tokio::time::timeout(wait, self.broker.publish(&message)).await {
            Ok(Ok(_ack)) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_published(&record.topic, started.elapsed().as_secs_f64());
                }
                tracing::debug!(
                    outbox_id = record.id,
                    topic = %record.topic,
                    key = record.key,
                    event_id = %envelope.event_id,
                    "Broker acknowledged outbox record"
                );
                return Ok(());
            }
            Ok(Err(e)) => (e.to_string(), e.reason()),
            Err(_) => (format!("no acknowledgement within {:?}", wait), "timeout"),
        };

        tracing::warn!(
            outbox_id = record.id,
            topic = %record.topic,
            key = record.key,
            error = %reason,
            "Publish failed, record stays pending"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_publish_failure(&record.topic, label);
        }
        Err(reason)
    }

    /// Returns `true` when the record has left the outbox
    async fn handle_undecodable(
        &self,
        record: &OutboxRecord,
        error: &CodecError,
        report: &mut CycleReport,
    ) -> Result<bool, RelayError> {
        let attempts = {
            let mut failures = self.decode_failures.lock().await;
            let count = failures.entry(record.id).or_insert(0);
            *count += 1;
            *count
        };

        if attempts < self.config.max_decode_failures {
            tracing::warn!(
                outbox_id = record.id,
                topic = %record.topic,
                key = record.key,
                attempts,
                max_attempts = self.config.max_decode_failures,
                error = %error,
                "Undecodable outbox record left pending"
            );
            report.skipped += 1;
            return Ok(false);
        }

        let moved = self
            .store
            .dead_letter(record, &error.to_string(), attempts as i32)
            .await?;
        self.decode_failures.lock().await.remove(&record.id);

        if moved {
            tracing::error!(
                outbox_id = record.id,
                topic = %record.topic,
                key = record.key,
                attempts,
                error = %error,
                "Moved undecodable outbox record to dead letters"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_dead_letter(&record.topic);
            }
            report.dead_lettered += 1;
        }
        Ok(true)
    }

    fn record_cycle(&self, report: &CycleReport) {
        if let Some(metrics) = &self.metrics {
            metrics.record_cycle(&report.lane, report.outcome.label());
        }
    }
}
