//! Asynchronous security-event pipeline.
//!
//! Gateway workers hand events over a bounded queue to a single consumer
//! task that enriches (risk level), analyzes (anomalies), persists, and
//! alerts — in that order, so storage is durable before an event counts as
//! complete. Events enqueue in causal order per request; the queue is FIFO,
//! so the pipeline observes them in arrival order.

pub mod alert;
pub mod anomaly;
pub mod event;
pub mod storage;

pub use alert::{AlertSink, MemoryAlertSink, StderrAlertSink};
pub use anomaly::{Anomaly, AnomalyDetector, AnomalySeverity, AnomalyThresholds, AnomalyType};
pub use event::{AiEvent, EventProcessor, RiskLevel};
pub use storage::{EventStorage, StorageError, StorageStats};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// What the enqueue path does when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued event to make room
    #[default]
    DropOldest,
    /// Wait briefly for space, then drop the incoming event
    Backpressure,
}

impl std::str::FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "drop-oldest" | "drop_oldest" => Ok(OverflowPolicy::DropOldest),
            "backpressure" => Ok(OverflowPolicy::Backpressure),
            _ => Err(format!("Invalid overflow policy: {}", s)),
        }
    }
}

/// Pipeline tuning knobs
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    /// Cadence of pattern-level anomaly analysis
    pub flush_interval: Duration,
    /// In-memory history retained for spike baselines and pattern windows
    pub history_capacity: usize,
    /// How long a backpressured enqueue waits for space before dropping
    pub enqueue_wait: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            overflow: OverflowPolicy::DropOldest,
            flush_interval: Duration::from_secs(30),
            history_capacity: 1024,
            enqueue_wait: Duration::from_millis(50),
        }
    }
}

/// Re-evaluating the same pattern window every flush would re-emit identical
/// anomalies; suppress repeats of a type within this interval.
const PATTERN_COOLDOWN_SECS: i64 = 300;

struct Shared {
    queue: Mutex<VecDeque<AiEvent>>,
    capacity: usize,
    overflow: OverflowPolicy,
    enqueue_wait: Duration,
    work_notify: Notify,
    space_notify: Notify,
    done_notify: Notify,
    /// Queued plus in-processing events
    inflight: AtomicUsize,
    pattern_requested: AtomicBool,
    closed: AtomicBool,
    dropped: AtomicU64,
}

/// Handle for emitting events into the pipeline. Cheap to clone.
#[derive(Clone)]
pub struct EventPipeline {
    shared: Arc<Shared>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EventPipeline {
    /// Spawn the consumer task and return the emitting handle.
    pub fn spawn(
        config: PipelineConfig,
        processor: EventProcessor,
        detector: AnomalyDetector,
        storage: Arc<EventStorage>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(config.queue_capacity)),
            capacity: config.queue_capacity,
            overflow: config.overflow,
            enqueue_wait: config.enqueue_wait,
            work_notify: Notify::new(),
            space_notify: Notify::new(),
            done_notify: Notify::new(),
            inflight: AtomicUsize::new(0),
            pattern_requested: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });

        let worker = tokio::spawn(run_worker(
            shared.clone(),
            processor,
            detector,
            storage,
            alerts,
            config.flush_interval,
            config.history_capacity,
        ));

        Self {
            shared,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    /// Enqueue one event.
    ///
    /// Non-blocking in the common case. On a full queue the configured
    /// overflow policy applies; either way this returns quickly and the
    /// request path is never stalled beyond `enqueue_wait`.
    pub async fn emit(&self, event: AiEvent) {
        if self.shared.closed.load(Ordering::SeqCst) {
            warn!(request_id = %event.request_id, "event pipeline closed; dropping event");
            return;
        }

        loop {
            {
                let mut queue = self.shared.queue.lock().expect("event queue poisoned");
                if queue.len() < self.shared.capacity {
                    queue.push_back(event);
                    self.shared.inflight.fetch_add(1, Ordering::SeqCst);
                    self.shared.work_notify.notify_one();
                    return;
                }
                if self.shared.overflow == OverflowPolicy::DropOldest {
                    if let Some(evicted) = queue.pop_front() {
                        self.shared.inflight.fetch_sub(1, Ordering::SeqCst);
                        self.shared.dropped.fetch_add(1, Ordering::SeqCst);
                        warn!(request_id = %evicted.request_id, "event queue full; dropped oldest");
                    }
                    queue.push_back(event);
                    self.shared.inflight.fetch_add(1, Ordering::SeqCst);
                    self.shared.work_notify.notify_one();
                    return;
                }
            }

            // Backpressure: wait briefly for the worker to free space
            let waited = tokio::time::timeout(
                self.shared.enqueue_wait,
                self.shared.space_notify.notified(),
            )
            .await;
            if waited.is_err() {
                self.shared.dropped.fetch_add(1, Ordering::SeqCst);
                warn!(request_id = %event.request_id, "event queue full; dropped after backpressure wait");
                return;
            }
        }
    }

    /// Trigger pattern-level analysis outside the flush cadence.
    pub fn request_pattern_scan(&self) {
        self.shared.pattern_requested.store(true, Ordering::SeqCst);
        self.shared.work_notify.notify_one();
    }

    /// Wait until every emitted event has been fully processed and any
    /// requested pattern scan has run. Test and shutdown helper.
    pub async fn drain(&self) {
        loop {
            let idle = self.shared.inflight.load(Ordering::SeqCst) == 0
                && !self.shared.pattern_requested.load(Ordering::SeqCst);
            if idle {
                return;
            }
            let _ = tokio::time::timeout(
                Duration::from_millis(20),
                self.shared.done_notify.notified(),
            )
            .await;
        }
    }

    /// Events dropped due to overflow since startup
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::SeqCst)
    }

    /// Stop accepting events, drain what is queued within `deadline`, then
    /// abort. Returns true when the worker exited cleanly.
    pub async fn shutdown(&self, deadline: Duration) -> bool {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.work_notify.notify_one();

        let handle = self.worker.lock().expect("worker handle poisoned").take();
        match handle {
            Some(handle) => match tokio::time::timeout(deadline, handle).await {
                Ok(_) => true,
                Err(_) => {
                    warn!("event pipeline drain exceeded shutdown deadline; aborting");
                    false
                }
            },
            None => true,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    shared: Arc<Shared>,
    processor: EventProcessor,
    detector: AnomalyDetector,
    storage: Arc<EventStorage>,
    alerts: Arc<dyn AlertSink>,
    flush_interval: Duration,
    history_capacity: usize,
) {
    let mut history: Vec<AiEvent> = Vec::with_capacity(history_capacity.min(4096));
    let mut last_pattern_alert: HashMap<AnomalyType, chrono::DateTime<Utc>> = HashMap::new();
    let mut flush = tokio::time::interval(flush_interval);
    flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    flush.tick().await; // first tick fires immediately; consume it

    loop {
        // Drain everything currently queued
        loop {
            let next = shared
                .queue
                .lock()
                .expect("event queue poisoned")
                .pop_front();
            let Some(mut event) = next else { break };
            shared.space_notify.notify_one();

            process_one(
                &processor, &detector, &storage, &alerts, &mut event, &history,
            )
            .await;

            if history.len() == history_capacity {
                history.remove(0);
            }
            history.push(event);

            shared.inflight.fetch_sub(1, Ordering::SeqCst);
            shared.done_notify.notify_waiters();
        }

        // The flag clears only after the analysis completes, so drain()
        // cannot observe a half-finished scan
        if shared.pattern_requested.load(Ordering::SeqCst) {
            run_pattern_analysis(&detector, &storage, &alerts, &history, &mut last_pattern_alert)
                .await;
            shared.pattern_requested.store(false, Ordering::SeqCst);
            shared.done_notify.notify_waiters();
        }

        if shared.closed.load(Ordering::SeqCst)
            && shared.queue.lock().expect("event queue poisoned").is_empty()
        {
            run_pattern_analysis(&detector, &storage, &alerts, &history, &mut last_pattern_alert)
                .await;
            debug!("event pipeline worker exiting");
            return;
        }

        tokio::select! {
            _ = shared.work_notify.notified() => {}
            _ = flush.tick() => {
                run_pattern_analysis(&detector, &storage, &alerts, &history, &mut last_pattern_alert)
                    .await;
            }
        }
    }
}

async fn process_one(
    processor: &EventProcessor,
    detector: &AnomalyDetector,
    storage: &EventStorage,
    alerts: &Arc<dyn AlertSink>,
    event: &mut AiEvent,
    history: &[AiEvent],
) {
    processor.process(event);
    let anomalies = detector.evaluate_event(event, history);

    // Persistence first; alerting is best-effort and must not gate it
    if let Err(e) = storage.insert_event(event) {
        error!(request_id = %event.request_id, error = %e, "failed to persist event");
    }
    for anomaly in &anomalies {
        if let Err(e) = storage.insert_anomaly(anomaly) {
            error!(anomaly_id = %anomaly.anomaly_id, error = %e, "failed to persist anomaly");
        }
    }
    for anomaly in &anomalies {
        if alert::should_alert(anomaly) {
            alerts.emit(anomaly).await;
        }
    }
}

async fn run_pattern_analysis(
    detector: &AnomalyDetector,
    storage: &EventStorage,
    alerts: &Arc<dyn AlertSink>,
    history: &[AiEvent],
    last_alerted: &mut HashMap<AnomalyType, chrono::DateTime<Utc>>,
) {
    let now = Utc::now();
    let window_start = now - chrono::Duration::hours(1);
    let window: Vec<AiEvent> = history
        .iter()
        .filter(|e| e.timestamp >= window_start)
        .cloned()
        .collect();
    if window.is_empty() {
        return;
    }

    for anomaly in detector.evaluate_patterns(&window, now) {
        let repeat = last_alerted
            .get(&anomaly.anomaly_type)
            .is_some_and(|t| (now - *t).num_seconds() < PATTERN_COOLDOWN_SECS);
        if repeat {
            continue;
        }
        last_alerted.insert(anomaly.anomaly_type, now);

        if let Err(e) = storage.insert_anomaly(&anomaly) {
            error!(anomaly_id = %anomaly.anomaly_id, error = %e, "failed to persist anomaly");
        }
        if alert::should_alert(&anomaly) {
            alerts.emit(&anomaly).await;
        }
    }
}
