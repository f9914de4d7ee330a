//! # Forwarder
//!
//! Drains the outbox to cloud ingestion with retry, backoff and
//! dead-lettering.
//!
//! ## Forwarding Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Forwarder Cycle                                  │
//! │                                                                         │
//! │   trigger: poll tick │ new-record notify                                │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌────────┐  lease_batch()  ┌─────────┐  client.send()  ┌──────────┐   │
//! │  │  Idle  │ ──────────────► │ Leasing │ ──────────────► │ Sending  │   │
//! │  └────────┘                 └─────────┘                 └────┬─────┘   │
//! │       ▲                                                      │         │
//! │       │              2xx results                             │ error / │
//! │       │         ┌────────────────────────────────────────────┤ timeout │
//! │       │         ▼                                            ▼         │
//! │       │    ┌─────────┐  rejected / missing ids      ┌────────────┐     │
//! │       ├─── │ Acking  │ ───────────────────────────► │  Retrying  │     │
//! │       │    └─────────┘                              └─────┬──────┘     │
//! │       │                                                   │            │
//! │       └───────────────────────────────────────────────────┘            │
//! │                                                                         │
//! │  PARTIAL: accepted ids are acked; rejected and missing ids are retried.│
//! │  A failed resolve leaves the lease in place until the next cycle       │
//! │  returns it to Pending.                                                │
//! │                                                                         │
//! │  BACKOFF (full failure only, exponential with ±25% jitter)             │
//! │  ───────────────────────────────────────────────────────               │
//! │  Failure 1: ~500ms   Failure 2: ~1s   Failure 3: ~2s  ...  Max: 60s    │
//! │  Reset after any fully accepted batch.                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use tokio::sync::{watch, Notify};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use agrilink_core::OutboxRecord;
use agrilink_db::OutboxRepository;

use crate::cloud_client::IngestClient;
use crate::config::EdgeConfig;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{DeliveryReport, IngestBatch};

// =============================================================================
// Forwarder Phase
// =============================================================================

/// Where the forwarder is within its current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderPhase {
    Idle,
    Leasing,
    Sending,
    Acking,
    Retrying,
}

impl fmt::Display for ForwarderPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwarderPhase::Idle => write!(f, "idle"),
            ForwarderPhase::Leasing => write!(f, "leasing"),
            ForwarderPhase::Sending => write!(f, "sending"),
            ForwarderPhase::Acking => write!(f, "acking"),
            ForwarderPhase::Retrying => write!(f, "retrying"),
        }
    }
}

/// Result of one forwarding cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Nothing was leasable.
    Empty,

    /// Every leased record was accepted.
    Delivered { acked: u64, full_batch: bool },

    /// Some records accepted, the rest returned for retry.
    Partial {
        acked: u64,
        retried: usize,
        dead_lettered: usize,
    },

    /// The batch failed as a whole; the forwarder waits `backoff`.
    Failed {
        retried: usize,
        dead_lettered: usize,
        error: String,
        backoff: Duration,
    },
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives forwarding events for operational telemetry.
pub trait ForwarderEventEmitter: Send + Sync {
    /// Called after every cycle that leased records.
    fn emit_cycle(&self, outcome: &CycleOutcome);

    /// Called for each record that exhausted its attempts.
    fn emit_dead_letter(&self, record: &OutboxRecord);
}

/// Emitter that discards every event.
pub struct NoOpEmitter;

impl ForwarderEventEmitter for NoOpEmitter {
    fn emit_cycle(&self, _outcome: &CycleOutcome) {}
    fn emit_dead_letter(&self, _record: &OutboxRecord) {}
}

// =============================================================================
// Forwarder Configuration
// =============================================================================

/// Tuning for the forwarder loop.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub batch_size: u32,
    pub max_batch_bytes: usize,
    pub poll_interval: Duration,
    pub send_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub purge_interval: Duration,

    /// Acked records older than this are purged.
    pub retention: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        ForwarderConfig {
            batch_size: 100,
            max_batch_bytes: 1024 * 1024,
            poll_interval: Duration::from_secs(2),
            send_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            purge_interval: Duration::from_secs(300),
            retention: Duration::from_secs(24 * 3600),
        }
    }
}

impl ForwarderConfig {
    pub fn from_config(config: &EdgeConfig) -> Self {
        let settings = &config.forwarder;
        ForwarderConfig {
            batch_size: settings.batch_size,
            max_batch_bytes: settings.max_batch_bytes,
            poll_interval: settings.poll_interval(),
            send_timeout: settings.send_timeout(),
            initial_backoff: settings.initial_backoff(),
            max_backoff: settings.max_backoff(),
            purge_interval: settings.purge_interval(),
            retention: Duration::from_secs(config.storage.retention_hours * 3600),
        }
    }
}

// =============================================================================
// Forwarder Handle
// =============================================================================

/// Handle for observing and stopping a running forwarder.
#[derive(Clone)]
pub struct ForwarderHandle {
    phase_rx: watch::Receiver<ForwarderPhase>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl ForwarderHandle {
    /// Current phase of the forwarding cycle.
    pub fn phase(&self) -> ForwarderPhase {
        *self.phase_rx.borrow()
    }

    /// Requests a graceful stop. Observed between cycles, so a send in
    /// progress completes or times out first.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

// =============================================================================
// Forwarder
// =============================================================================

/// Background task draining the outbox. Exactly one per outbox.
pub struct Forwarder {
    outbox: OutboxRepository,
    client: Arc<dyn IngestClient>,
    config: ForwarderConfig,
    new_records: Arc<Notify>,
    emitter: Arc<dyn ForwarderEventEmitter>,
    backoff: ExponentialBackoff,
    phase_tx: watch::Sender<ForwarderPhase>,
    shutdown_rx: watch::Receiver<bool>,
    /// Set while leases may be orphaned (startup, or a cycle that failed
    /// after leasing). Cleared once `recover_in_flight` succeeds.
    recover_pending: bool,
}

impl Forwarder {
    /// Creates a forwarder and the handle controlling it.
    pub fn new(
        outbox: OutboxRepository,
        client: Arc<dyn IngestClient>,
        config: ForwarderConfig,
        new_records: Arc<Notify>,
        emitter: Arc<dyn ForwarderEventEmitter>,
    ) -> (Self, ForwarderHandle) {
        let (phase_tx, phase_rx) = watch::channel(ForwarderPhase::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backoff = create_backoff(&config);

        let forwarder = Forwarder {
            outbox,
            client,
            config,
            new_records,
            emitter,
            backoff,
            phase_tx,
            shutdown_rx,
            recover_pending: true,
        };

        let handle = ForwarderHandle {
            phase_rx,
            shutdown_tx: Arc::new(shutdown_tx),
        };

        (forwarder, handle)
    }

    /// Runs the forwarder loop until shutdown.
    ///
    /// This should be spawned as a background task.
    pub async fn run(mut self) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval = ?self.config.poll_interval,
            "Forwarder starting"
        );

        let mut poll = interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut purge = interval(self.config.purge_interval);
        purge.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'outer: loop {
            if self.shutdown_requested() {
                break;
            }

            tokio::select! {
                _ = poll.tick() => {}
                _ = self.new_records.notified() => {
                    debug!("Woken by new record");
                }
                _ = purge.tick() => {
                    self.purge().await;
                    continue;
                }
                _ = self.shutdown_rx.changed() => {
                    break;
                }
            }

            // Drain: keep cycling while batches come back full or after backoff.
            loop {
                match self.cycle().await {
                    Ok(CycleOutcome::Delivered { full_batch: true, .. }) => {
                        if self.shutdown_requested() {
                            break 'outer;
                        }
                    }
                    Ok(CycleOutcome::Failed { backoff, .. }) => {
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = self.shutdown_rx.changed() => {
                                info!("Shutdown during backoff");
                                break 'outer;
                            }
                        }
                    }
                    Ok(_) => break,
                    Err(e) => {
                        error!(?e, "Forwarding cycle failed");
                        self.set_phase(ForwarderPhase::Idle);
                        break;
                    }
                }
            }
        }

        self.set_phase(ForwarderPhase::Idle);
        info!("Forwarder stopped");
    }

    /// Runs one lease, send, resolve cycle.
    async fn cycle(&mut self) -> SyncResult<CycleOutcome> {
        self.set_phase(ForwarderPhase::Leasing);
        if self.recover_pending {
            let recovered = self.outbox.recover_in_flight().await?;
            if recovered > 0 {
                info!(recovered, "Returned orphaned in-flight records to pending");
            }
            self.recover_pending = false;
        }

        let records = self
            .outbox
            .lease_batch(self.config.batch_size, self.config.max_batch_bytes)
            .await?;

        if records.is_empty() {
            self.set_phase(ForwarderPhase::Idle);
            return Ok(CycleOutcome::Empty);
        }

        let batch = IngestBatch::from_records(&records);
        debug!(batch_id = %batch.batch_id, records = batch.len(), "Forwarding batch");

        self.set_phase(ForwarderPhase::Sending);
        let sent = match timeout(self.config.send_timeout, self.client.send(&batch)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(self.config.send_timeout)),
        };

        let resolved = match sent {
            Ok(report) => self.resolve(&records, &report).await,
            Err(e) => self.fail(&batch, e).await,
        };
        let outcome = match resolved {
            Ok(outcome) => outcome,
            Err(e) => {
                // Some of the batch may still be InFlight, which blocks its devices.
                self.recover_pending = true;
                self.set_phase(ForwarderPhase::Idle);
                return Err(e);
            }
        };

        self.emitter.emit_cycle(&outcome);
        self.set_phase(ForwarderPhase::Idle);
        Ok(outcome)
    }

    /// Applies per-record results.
    async fn resolve(
        &mut self,
        records: &[OutboxRecord],
        report: &DeliveryReport,
    ) -> SyncResult<CycleOutcome> {
        let plan = plan_resolution(records, report);

        self.set_phase(ForwarderPhase::Acking);
        let acked = self.outbox.acknowledge(&plan.ack).await?;

        if plan.retry.is_empty() {
            self.backoff.reset();
            let full_batch = records.len() as u32 >= self.config.batch_size;
            info!(acked, "Batch delivered");
            return Ok(CycleOutcome::Delivered { acked, full_batch });
        }

        self.set_phase(ForwarderPhase::Retrying);
        let mut retried = 0;
        let mut dead_lettered = 0;
        for (reason, ids) in &plan.retry {
            let outcome = self.outbox.retry(ids, reason).await?;
            retried += ids.len();
            dead_lettered += outcome.dead_lettered.len();
            for record in &outcome.dead_lettered {
                self.emitter.emit_dead_letter(record);
            }
        }

        warn!(acked, retried, dead_lettered, "Batch partially accepted");
        Ok(CycleOutcome::Partial {
            acked,
            retried,
            dead_lettered,
        })
    }

    /// Returns the whole batch for retry and computes the next backoff.
    async fn fail(&mut self, batch: &IngestBatch, err: SyncError) -> SyncResult<CycleOutcome> {
        self.set_phase(ForwarderPhase::Retrying);

        let message = err.to_string();
        let ids = batch.ids();
        let outcome = self.outbox.retry(&ids, &message).await?;
        for record in &outcome.dead_lettered {
            self.emitter.emit_dead_letter(record);
        }

        let backoff = self
            .backoff
            .next_backoff()
            .unwrap_or(self.config.max_backoff);

        warn!(
            batch_id = %batch.batch_id,
            records = ids.len(),
            dead_lettered = outcome.dead_lettered.len(),
            error = %message,
            ?backoff,
            "Batch delivery failed"
        );

        Ok(CycleOutcome::Failed {
            retried: ids.len(),
            dead_lettered: outcome.dead_lettered.len(),
            error: message,
            backoff,
        })
    }

    async fn purge(&self) {
        let retention = match chrono::Duration::from_std(self.config.retention) {
            Ok(retention) => retention,
            Err(e) => {
                warn!(?e, "Retention out of range, skipping purge");
                return;
            }
        };

        match self.outbox.purge_acked(Utc::now() - retention).await {
            Ok(0) => {}
            Ok(purged) => info!(purged, "Purged acked records"),
            Err(e) => error!(?e, "Failed to purge acked records"),
        }
    }

    fn set_phase(&self, phase: ForwarderPhase) {
        self.phase_tx.send_replace(phase);
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}

fn create_backoff(config: &ForwarderConfig) -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: config.initial_backoff,
        current_interval: config.initial_backoff,
        randomization_factor: 0.25,
        multiplier: 2.0,
        max_interval: config.max_backoff,
        max_elapsed_time: None,
        ..Default::default()
    }
}

// =============================================================================
// Partial Success
// =============================================================================

#[derive(Debug, Default, PartialEq)]
struct Resolution {
    ack: Vec<i64>,
    /// Retry reason → ids, so each reason is stored once per call.
    retry: BTreeMap<String, Vec<i64>>,
}

/// Splits a batch into ids to acknowledge and ids to retry.
///
/// Accepted ids are acknowledged. Rejected ids and ids missing from the
/// report are retried, grouped by reason.
fn plan_resolution(records: &[OutboxRecord], report: &DeliveryReport) -> Resolution {
    let accepted: HashSet<i64> = report.accepted.iter().copied().collect();
    let rejected: HashMap<i64, Option<&str>> = report
        .rejected
        .iter()
        .map(|(id, reason)| (*id, reason.as_deref()))
        .collect();

    let mut ids: Vec<i64> = records.iter().map(|r| r.id).collect();
    ids.sort_unstable();

    let mut resolution = Resolution::default();
    for id in ids {
        let reason = match rejected.get(&id) {
            Some(Some(reason)) => format!("rejected by cloud: {}", reason),
            Some(None) => "rejected by cloud".to_string(),
            None if accepted.contains(&id) => {
                resolution.ack.push(id);
                continue;
            }
            None => "missing from cloud response".to_string(),
        };
        resolution.retry.entry(reason).or_default().push(id);
    }

    resolution
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use agrilink_core::{NewOutboxRecord, SyncStatus};
    use agrilink_db::{Database, DbConfig};

    // =========================================================================
    // Fakes
    // =========================================================================

    #[derive(Debug, Clone, PartialEq)]
    enum Cloud {
        Unreachable,
        AcceptAll,
        Reject(Vec<i64>),
        Omit(Vec<i64>),
        Hang,
    }

    struct FakeCloud {
        mode: Mutex<Cloud>,
        received: Mutex<Vec<IngestBatch>>,
    }

    impl FakeCloud {
        fn new(mode: Cloud) -> Arc<Self> {
            Arc::new(FakeCloud {
                mode: Mutex::new(mode),
                received: Mutex::new(Vec::new()),
            })
        }

        fn set(&self, mode: Cloud) {
            *self.mode.lock().unwrap() = mode;
        }
    }

    #[async_trait]
    impl IngestClient for FakeCloud {
        async fn send(&self, batch: &IngestBatch) -> SyncResult<DeliveryReport> {
            let mode = self.mode.lock().unwrap().clone();
            if mode == Cloud::Hang {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if mode == Cloud::Unreachable {
                return Err(SyncError::DeliveryFailure("connection refused".into()));
            }
            self.received.lock().unwrap().push(batch.clone());

            let mut report = DeliveryReport::default();
            for id in batch.ids() {
                match &mode {
                    Cloud::Reject(ids) if ids.contains(&id) => {
                        report.rejected.push((id, Some("schema".into())))
                    }
                    Cloud::Omit(ids) if ids.contains(&id) => {}
                    _ => report.accepted.push(id),
                }
            }
            Ok(report)
        }
    }

    #[derive(Default)]
    struct Recorder {
        cycles: Mutex<Vec<CycleOutcome>>,
        dead: Mutex<Vec<i64>>,
    }

    impl ForwarderEventEmitter for Recorder {
        fn emit_cycle(&self, outcome: &CycleOutcome) {
            self.cycles.lock().unwrap().push(outcome.clone());
        }

        fn emit_dead_letter(&self, record: &OutboxRecord) {
            self.dead.lock().unwrap().push(record.id);
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn test_config() -> ForwarderConfig {
        ForwarderConfig {
            poll_interval: Duration::from_millis(20),
            send_timeout: Duration::from_millis(100),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(10),
            ..Default::default()
        }
    }

    fn setup(
        db: &Database,
        cloud: Arc<FakeCloud>,
        config: ForwarderConfig,
    ) -> (Forwarder, ForwarderHandle, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let (forwarder, handle) = Forwarder::new(
            db.outbox(),
            cloud,
            config,
            Arc::new(Notify::new()),
            recorder.clone(),
        );
        (forwarder, handle, recorder)
    }

    async fn append(db: &Database, device: &str) -> OutboxRecord {
        db.outbox()
            .append(NewOutboxRecord {
                tenant_id: "t1".into(),
                device_id: device.into(),
                topic: format!("iot/telemetry/t1/f1/b1/{}/temperature", device),
                payload: br#"{"v":21.5}"#.to_vec(),
                captured_at: Utc::now(),
                correlation_id: "req-1".into(),
            })
            .await
            .unwrap()
    }

    fn record(id: i64, device: &str) -> OutboxRecord {
        OutboxRecord {
            id,
            sequence: id,
            tenant_id: "t1".into(),
            device_id: device.into(),
            topic: format!("iot/telemetry/t1/f1/b1/{}/temperature", device),
            payload: b"1".to_vec(),
            captured_at: Utc::now(),
            sync_status: SyncStatus::InFlight,
            attempt_count: 0,
            last_attempt_at: None,
            last_error: None,
            correlation_id: "req".into(),
            acked_at: None,
            dead_lettered_at: None,
        }
    }

    // =========================================================================
    // Resolution planning
    // =========================================================================

    #[test]
    fn test_plan_acks_every_accepted_id() {
        let records = vec![
            record(1, "dev-a"),
            record(2, "dev-a"),
            record(3, "dev-a"),
            record(4, "dev-b"),
            record(5, "dev-b"),
        ];
        let report = DeliveryReport {
            accepted: vec![1, 3, 4],
            rejected: vec![(2, None)],
        };

        let plan = plan_resolution(&records, &report);
        // 3 follows the rejected 2 but the cloud already has it
        assert_eq!(plan.ack, vec![1, 3, 4]);
        assert_eq!(plan.retry.len(), 2);
        assert_eq!(plan.retry["rejected by cloud"], vec![2]);
        assert_eq!(plan.retry["missing from cloud response"], vec![5]);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(ForwarderPhase::Sending.to_string(), "sending");
        assert_eq!(ForwarderPhase::Idle.to_string(), "idle");
    }

    // =========================================================================
    // Cycles
    // =========================================================================

    #[tokio::test]
    async fn test_happy_path_acks_record() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let cloud = FakeCloud::new(Cloud::AcceptAll);
        let (mut forwarder, handle, recorder) = setup(&db, cloud.clone(), test_config());

        let stored = append(&db, "dev-7").await;
        assert_eq!(stored.sequence, 1);

        let outcome = forwarder.cycle().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Delivered {
                acked: 1,
                full_batch: false
            }
        );
        assert_eq!(handle.phase(), ForwarderPhase::Idle);

        let acked = db.outbox().get(stored.id).await.unwrap().unwrap();
        assert_eq!(acked.sync_status, SyncStatus::Acked);
        assert!(acked.acked_at.is_some());

        let sent = cloud.received.lock().unwrap();
        assert_eq!(sent[0].records[0].correlation_id, "req-1");
        assert_eq!(recorder.cycles.lock().unwrap().len(), 1);

        // Nothing left
        drop(sent);
        assert_eq!(forwarder.cycle().await.unwrap(), CycleOutcome::Empty);
    }

    #[tokio::test]
    async fn test_unreachable_cloud_backs_off_strictly_increasing() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let cloud = FakeCloud::new(Cloud::Unreachable);
        let (mut forwarder, _handle, _recorder) = setup(&db, cloud, test_config());

        let stored = append(&db, "dev-7").await;

        let mut backoffs = Vec::new();
        for _ in 0..3 {
            match forwarder.cycle().await.unwrap() {
                CycleOutcome::Failed { backoff, retried, .. } => {
                    assert_eq!(retried, 1);
                    backoffs.push(backoff);
                }
                other => panic!("expected failure, got {:?}", other),
            }

            let between = db.outbox().get(stored.id).await.unwrap().unwrap();
            assert_eq!(between.sync_status, SyncStatus::Pending);
        }

        assert!(backoffs[0] < backoffs[1]);
        assert!(backoffs[1] < backoffs[2]);

        let record = db.outbox().get(stored.id).await.unwrap().unwrap();
        assert_eq!(record.attempt_count, 3);
        assert!(record.last_error.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_backoff_resets_after_success() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let cloud = FakeCloud::new(Cloud::Unreachable);
        let (mut forwarder, _handle, _recorder) = setup(&db, cloud.clone(), test_config());

        append(&db, "dev-7").await;
        forwarder.cycle().await.unwrap();
        forwarder.cycle().await.unwrap();

        cloud.set(Cloud::AcceptAll);
        assert!(matches!(
            forwarder.cycle().await.unwrap(),
            CycleOutcome::Delivered { acked: 1, .. }
        ));

        cloud.set(Cloud::Unreachable);
        append(&db, "dev-7").await;
        let CycleOutcome::Failed { backoff, .. } = forwarder.cycle().await.unwrap() else {
            panic!("expected failure");
        };
        // Back at the initial interval, within jitter
        assert!(backoff <= Duration::from_millis(13));
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_attempts() {
        let db = Database::new(DbConfig::in_memory().max_attempts(2)).await.unwrap();
        let cloud = FakeCloud::new(Cloud::Unreachable);
        let (mut forwarder, _handle, recorder) = setup(&db, cloud, test_config());

        let stored = append(&db, "dev-7").await;
        for _ in 0..2 {
            assert!(matches!(
                forwarder.cycle().await.unwrap(),
                CycleOutcome::Failed { dead_lettered: 0, .. }
            ));
        }
        assert!(matches!(
            forwarder.cycle().await.unwrap(),
            CycleOutcome::Failed { dead_lettered: 1, .. }
        ));

        let record = db.outbox().get(stored.id).await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::DeadLettered);
        assert_eq!(*recorder.dead.lock().unwrap(), vec![stored.id]);

        // Terminal: never leased again
        assert_eq!(forwarder.cycle().await.unwrap(), CycleOutcome::Empty);
    }

    #[tokio::test]
    async fn test_partial_success_acks_accepted_and_retries_rejected() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let a1 = append(&db, "dev-a").await;
        let a2 = append(&db, "dev-a").await;
        let a3 = append(&db, "dev-a").await;
        let b1 = append(&db, "dev-b").await;

        let cloud = FakeCloud::new(Cloud::Reject(vec![a2.id]));
        let (mut forwarder, _handle, _recorder) = setup(&db, cloud.clone(), test_config());

        assert_eq!(
            forwarder.cycle().await.unwrap(),
            CycleOutcome::Partial {
                acked: 3,
                retried: 1,
                dead_lettered: 0
            }
        );

        let status = |id| {
            let outbox = db.outbox();
            async move { outbox.get(id).await.unwrap().unwrap().sync_status }
        };
        assert_eq!(status(a1.id).await, SyncStatus::Acked);
        assert_eq!(status(a2.id).await, SyncStatus::Pending);
        assert_eq!(status(a3.id).await, SyncStatus::Acked);
        assert_eq!(status(b1.id).await, SyncStatus::Acked);

        let rejected = db.outbox().get(a2.id).await.unwrap().unwrap();
        assert_eq!(rejected.attempt_count, 1);
        assert_eq!(rejected.last_error.as_deref(), Some("rejected by cloud: schema"));

        // Only the rejected record goes out again
        cloud.set(Cloud::AcceptAll);
        forwarder.cycle().await.unwrap();
        let sent = cloud.received.lock().unwrap();
        let ids: Vec<i64> = sent[1].records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![a2.id]);
    }

    #[tokio::test]
    async fn test_accepted_record_never_dead_letters_behind_rejected_one() {
        let db = Database::new(DbConfig::in_memory().max_attempts(1)).await.unwrap();
        let a1 = append(&db, "dev-a").await;
        let a2 = append(&db, "dev-a").await;

        let cloud = FakeCloud::new(Cloud::Reject(vec![a1.id]));
        let (mut forwarder, _handle, recorder) = setup(&db, cloud, test_config());

        forwarder.cycle().await.unwrap();
        forwarder.cycle().await.unwrap();

        let accepted = db.outbox().get(a2.id).await.unwrap().unwrap();
        assert_eq!(accepted.sync_status, SyncStatus::Acked);
        assert_eq!(accepted.attempt_count, 0);
        assert!(accepted.last_error.is_none());

        let rejected = db.outbox().get(a1.id).await.unwrap().unwrap();
        assert_eq!(rejected.sync_status, SyncStatus::DeadLettered);
        assert_eq!(*recorder.dead.lock().unwrap(), vec![a1.id]);
    }

    #[tokio::test]
    async fn test_failed_resolve_does_not_strand_device() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let cloud = FakeCloud::new(Cloud::AcceptAll);
        let (mut forwarder, handle, _recorder) = setup(&db, cloud, test_config());

        let first = append(&db, "dev-a").await;

        sqlx::query(
            "CREATE TRIGGER fail_ack BEFORE UPDATE OF sync_status ON outbox_records \
             WHEN NEW.sync_status = 'acked' \
             BEGIN SELECT RAISE(ABORT, 'disk write failed'); END",
        )
        .execute(db.pool())
        .await
        .unwrap();

        assert!(forwarder.cycle().await.is_err());
        assert_eq!(handle.phase(), ForwarderPhase::Idle);
        let stuck = db.outbox().get(first.id).await.unwrap().unwrap();
        assert_eq!(stuck.sync_status, SyncStatus::InFlight);

        sqlx::query("DROP TRIGGER fail_ack")
            .execute(db.pool())
            .await
            .unwrap();
        let second = append(&db, "dev-a").await;

        assert_eq!(
            forwarder.cycle().await.unwrap(),
            CycleOutcome::Delivered {
                acked: 2,
                full_batch: false
            }
        );
        for id in [first.id, second.id] {
            let record = db.outbox().get(id).await.unwrap().unwrap();
            assert_eq!(record.sync_status, SyncStatus::Acked);
            assert_eq!(record.attempt_count, 0);
        }
    }

    #[tokio::test]
    async fn test_missing_results_are_retried() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let first = append(&db, "dev-7").await;
        let second = append(&db, "dev-8").await;

        let cloud = FakeCloud::new(Cloud::Omit(vec![second.id]));
        let (mut forwarder, _handle, _recorder) = setup(&db, cloud, test_config());

        forwarder.cycle().await.unwrap();

        let missing = db.outbox().get(second.id).await.unwrap().unwrap();
        assert_eq!(missing.sync_status, SyncStatus::Pending);
        assert_eq!(missing.attempt_count, 1);
        assert_eq!(
            db.outbox().get(first.id).await.unwrap().unwrap().sync_status,
            SyncStatus::Acked
        );
    }

    #[tokio::test]
    async fn test_send_timeout_is_full_failure() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let cloud = FakeCloud::new(Cloud::Hang);
        let (mut forwarder, _handle, _recorder) = setup(&db, cloud, test_config());

        let stored = append(&db, "dev-7").await;
        let CycleOutcome::Failed { error, .. } = forwarder.cycle().await.unwrap() else {
            panic!("expected failure");
        };
        assert!(error.contains("timed out after 100ms"));

        let record = db.outbox().get(stored.id).await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert_eq!(record.attempt_count, 1);
        assert_eq!(record.last_error.as_deref(), Some(error.as_str()));
    }

    #[tokio::test]
    async fn test_batch_respects_size_and_reports_full_batch() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        for _ in 0..3 {
            append(&db, "dev-7").await;
        }

        let cloud = FakeCloud::new(Cloud::AcceptAll);
        let config = ForwarderConfig {
            batch_size: 2,
            ..test_config()
        };
        let (mut forwarder, _handle, _recorder) = setup(&db, cloud, config);

        assert_eq!(
            forwarder.cycle().await.unwrap(),
            CycleOutcome::Delivered {
                acked: 2,
                full_batch: true
            }
        );
        assert_eq!(
            forwarder.cycle().await.unwrap(),
            CycleOutcome::Delivered {
                acked: 1,
                full_batch: false
            }
        );
    }

    // =========================================================================
    // Loop
    // =========================================================================

    #[tokio::test]
    async fn test_loop_eventually_resolves_everything() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let cloud = FakeCloud::new(Cloud::Unreachable);
        let config = ForwarderConfig {
            batch_size: 3,
            ..test_config()
        };
        let (forwarder, handle, _recorder) = setup(&db, cloud.clone(), config);

        for i in 0..10 {
            append(&db, if i % 2 == 0 { "dev-a" } else { "dev-b" }).await;
        }

        let task = tokio::spawn(forwarder.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        cloud.set(Cloud::AcceptAll);

        let resolved = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let stats = db.outbox().count_by_status().await.unwrap();
                if stats.acked == 10 {
                    break stats;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(resolved.unresolved(), 0);

        handle.shutdown();
        task.await.unwrap();
        assert_eq!(handle.phase(), ForwarderPhase::Idle);

        // Per device, delivered sequences never go backwards
        let sent = cloud.received.lock().unwrap();
        let mut last: HashMap<String, i64> = HashMap::new();
        for record in sent.iter().flat_map(|b| b.records.iter()) {
            let prev = last.insert(record.device_id.clone(), record.sequence);
            assert!(prev.map_or(true, |p| p <= record.sequence));
        }
    }

    #[tokio::test]
    async fn test_loop_recovers_in_flight_on_start() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let stored = append(&db, "dev-7").await;

        // Simulates a crash after leasing
        db.outbox().lease_batch(10, 1024).await.unwrap();

        let cloud = FakeCloud::new(Cloud::AcceptAll);
        let (forwarder, handle, _recorder) = setup(&db, cloud, test_config());
        let task = tokio::spawn(forwarder.run());

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let record = db.outbox().get(stored.id).await.unwrap().unwrap();
                if record.sync_status == SyncStatus::Acked {
                    assert_eq!(record.attempt_count, 0);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        handle.shutdown();
        task.await.unwrap();
    }
}
