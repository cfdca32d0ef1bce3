//! Delivery engine: the single owner of the queue and dedup window.
//!
//! Tasks enter through a bounded intake channel, wait in per-recipient FIFO
//! queues and are handed to the [`OutboundSender`] one at a time per
//! recipient. Each attempt runs on its own tokio task and reports back over
//! a channel, so a slow or failing recipient never blocks another one.
//!
//! Per-task state machine:
//!
//! ```text
//! Pending -> InFlight -> Delivered
//!                     -> Pending   (transient failure, budget left, after backoff)
//!                     -> Failed    (permanent failure or budget exhausted)
//! Pending -> Dropped                (rejected before any attempt)
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::common::messages::EngineCommand;
use crate::common::types::{ForwardTask, Payload, TaskId, TaskStatus};
use crate::config::types::DeliveryConfig;
use crate::delivery::activity::{ActivityEntry, ActivityLog};
use crate::delivery::clock::Clock;
use crate::delivery::dedup::DedupWindow;
use crate::delivery::journal::{Journal, JournalState};
use crate::delivery::queue::{DeliveryQueue, QueueKey, QueuedTask};
use crate::delivery::retry::RetryPolicy;
use crate::delivery::status::{BackoffState, StatusSnapshot};
use crate::outbound::{OutboundSender, SendOutcome};

/// Tunables for the engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub policy: RetryPolicy,
    pub dedup_capacity: usize,
    pub dedup_ttl: Option<Duration>,
    /// Queued tasks above which the intake channel is no longer read.
    pub queue_capacity: usize,
    /// Buffer of the intake channel.
    pub intake_buffer: usize,
    /// Longest a single send call may take before it counts as failed.
    pub attempt_timeout: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            policy: RetryPolicy::from_config(config),
            dedup_capacity: config.dedup_capacity,
            dedup_ttl: config.dedup_ttl(),
            queue_capacity: config.queue_capacity,
            intake_buffer: config.inbound_buffer,
            attempt_timeout: config.attempt_timeout(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}

/// Result of one attempt, sent back from the attempt task.
#[derive(Debug)]
struct AttemptReport {
    recipient: String,
    key: QueueKey,
    outcome: SendOutcome,
}

/// Control and status access for the rest of the bridge.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    control_tx: mpsc::UnboundedSender<EngineCommand>,
    status_rx: watch::Receiver<StatusSnapshot>,
}

impl EngineHandle {
    /// Resume dequeuing. Returns false if the engine has exited.
    pub fn start(&self) -> bool {
        self.control_tx.send(EngineCommand::Start).is_ok()
    }

    /// Stop dequeuing; queued tasks are kept and in-flight attempts finish.
    pub fn stop(&self) -> bool {
        self.control_tx.send(EngineCommand::Stop).is_ok()
    }

    /// Latest published snapshot.
    pub fn status(&self) -> StatusSnapshot {
        self.status_rx.borrow().clone()
    }
}

struct EngineInbox {
    intake_rx: mpsc::Receiver<ForwardTask>,
    control_rx: mpsc::UnboundedReceiver<EngineCommand>,
    reports_rx: mpsc::UnboundedReceiver<AttemptReport>,
}

/// State owned by the engine loop.
struct EngineCore {
    settings: EngineSettings,
    sender: Arc<dyn OutboundSender>,
    clock: Arc<dyn Clock>,
    activity: Box<dyn ActivityLog>,
    journal: Option<Journal>,
    /// Queue or dedup window changed since the last journal save.
    journal_dirty: bool,
    queue: DeliveryQueue,
    dedup: DedupWindow,
    running: bool,
    paused_until: Option<Instant>,
    delivered: u64,
    failed: u64,
    dropped: u64,
    last_delivery_at: Option<DateTime<Utc>>,
    /// Entries the activity log has not accepted yet.
    backlog: Vec<ActivityEntry>,
    status_tx: watch::Sender<StatusSnapshot>,
    reports_tx: mpsc::UnboundedSender<AttemptReport>,
}

/// The delivery queue and retry engine.
pub struct DeliveryEngine {
    core: EngineCore,
    inbox: EngineInbox,
}

impl DeliveryEngine {
    /// Create an engine plus the intake sender and a control handle.
    ///
    /// The engine exits once every intake sender is dropped and the queue
    /// has drained, or on shutdown.
    pub fn new(
        settings: EngineSettings,
        sender: Arc<dyn OutboundSender>,
        activity: Box<dyn ActivityLog>,
        clock: Arc<dyn Clock>,
    ) -> (Self, mpsc::Sender<ForwardTask>, EngineHandle) {
        let (intake_tx, intake_rx) = mpsc::channel(settings.intake_buffer.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(StatusSnapshot {
            running: true,
            ..StatusSnapshot::default()
        });

        let core = EngineCore {
            dedup: DedupWindow::new(settings.dedup_capacity, settings.dedup_ttl),
            settings,
            sender,
            clock,
            activity,
            journal: None,
            journal_dirty: false,
            queue: DeliveryQueue::default(),
            running: true,
            paused_until: None,
            delivered: 0,
            failed: 0,
            dropped: 0,
            last_delivery_at: None,
            backlog: Vec::new(),
            status_tx,
            reports_tx,
        };

        let engine = Self {
            core,
            inbox: EngineInbox {
                intake_rx,
                control_rx,
                reports_rx,
            },
        };
        let handle = EngineHandle {
            control_tx,
            status_rx,
        };
        (engine, intake_tx, handle)
    }

    /// Keep `journal` in step with the queue and dedup window.
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.core.journal = Some(journal);
        self.core.journal_dirty = true;
        self
    }

    /// Start out stopped; dequeuing begins on the first `start`.
    pub fn paused(mut self) -> Self {
        self.core.running = false;
        self
    }

    /// Requeue journaled tasks ahead of new traffic and refill the dedup
    /// window with the ids seen before the restart.
    pub fn restore(&mut self, state: JournalState) {
        let core = &mut self.core;
        let now = core.clock.now();
        for id in state.seen {
            core.dedup.observe(id, now);
        }
        for task in state.pending {
            if task.status != TaskStatus::Pending {
                warn!(task = %task.id, "Skipping journaled task in status {}", task.status);
                continue;
            }
            core.dedup.observe(task.id, now);
            debug!(task = %task.id, recipient = %task.recipient, "Requeued from journal");
            core.queue.push(QueuedTask {
                task,
                not_before: now,
            });
        }
        core.journal_dirty = true;
    }

    /// Run until shutdown, or until intake closes and the queue drains.
    ///
    /// On shutdown no new attempts start and in-flight attempts are awaited.
    /// Returns the final snapshot.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> StatusSnapshot {
        let DeliveryEngine { mut core, inbox } = self;
        let EngineInbox {
            mut intake_rx,
            mut control_rx,
            mut reports_rx,
        } = inbox;
        let clock = Arc::clone(&core.clock);

        let mut intake_open = true;
        let mut control_open = true;
        let mut shutdown_open = true;
        let mut shutting_down = false;

        info!(
            "Delivery engine started ({} queued, max {} attempts)",
            core.queue.len(),
            core.settings.policy.max_attempts
        );

        loop {
            core.dispatch();
            core.publish();
            core.save_journal();

            if shutting_down && core.in_flight() == 0 {
                break;
            }
            if !intake_open && core.queue.is_empty() {
                info!("Intake closed and queue drained");
                break;
            }

            let accepting =
                intake_open && !shutting_down && core.queue.len() < core.settings.queue_capacity;
            let wake = if shutting_down { None } else { core.next_wakeup() };

            tokio::select! {
                biased;
                changed = shutdown.changed(), if shutdown_open && !shutting_down => {
                    match changed {
                        Ok(()) if *shutdown.borrow() => {
                            info!(
                                "Shutdown requested, waiting for {} in-flight attempt(s)",
                                core.in_flight()
                            );
                            shutting_down = true;
                            core.running = false;
                        }
                        Ok(()) => {}
                        Err(_) => shutdown_open = false,
                    }
                }
                Some(report) = reports_rx.recv() => core.handle_report(report),
                command = control_rx.recv(), if control_open => match command {
                    Some(EngineCommand::Start) => core.set_running(true),
                    Some(EngineCommand::Stop) => core.set_running(false),
                    None => control_open = false,
                },
                task = intake_rx.recv(), if accepting => match task {
                    Some(task) => core.submit(task),
                    None => intake_open = false,
                },
                _ = sleep_until(&clock, wake) => {}
            }
        }

        core.flush_backlog();
        if !core.backlog.is_empty() {
            error!(
                "{} activity entr(ies) could not be written and are lost",
                core.backlog.len()
            );
        }
        core.save_journal();
        if core.journal.is_none() && !core.queue.is_empty() {
            warn!(
                "{} queued task(s) discarded on exit (no state file configured)",
                core.queue.len()
            );
        }
        core.publish();
        info!("Delivery engine stopped");
        core.snapshot()
    }
}

async fn sleep_until(clock: &Arc<dyn Clock>, wake: Option<Instant>) {
    match wake {
        Some(deadline) => clock.sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

impl EngineCore {
    fn submit(&mut self, mut task: ForwardTask) {
        if task.status != TaskStatus::Pending {
            debug!(
                task = %task.id,
                reason = task.last_error.as_deref().unwrap_or(""),
                "Not queued ({})",
                task.status
            );
            self.finish(task);
            return;
        }

        let now = self.clock.now();
        if !self.dedup.observe(task.id, now) {
            debug!(task = %task.id, "Duplicate message discarded");
            let reason = format!("duplicate of already seen message {}", task.id);
            task.drop_with(reason);
            self.finish(task);
            return;
        }

        debug!(task = %task.id, recipient = %task.recipient, "Queued");
        self.queue.push(QueuedTask {
            task,
            not_before: now,
        });
        self.journal_dirty = true;
    }

    fn set_running(&mut self, running: bool) {
        if self.running != running {
            info!(
                "Delivery {} ({} queued)",
                if running { "started" } else { "stopped" },
                self.queue.len()
            );
        }
        self.running = running;
    }

    /// Launch an attempt for every recipient whose head is due.
    fn dispatch(&mut self) {
        if !self.running {
            return;
        }

        let now = self.clock.now();
        if let Some(until) = self.paused_until {
            if until > now {
                return;
            }
            info!("Rate-limit pause over, resuming delivery");
            self.paused_until = None;
        }

        let mut launches = Vec::new();
        for queue in self.queue.recipients_mut() {
            let Some(head) = queue.ready_head(now) else {
                continue;
            };
            if !head.task.advance(TaskStatus::InFlight) {
                continue;
            }
            head.task.attempt_count += 1;
            let key = head.key();
            launches.push((
                head.task.id,
                key,
                head.task.recipient.clone(),
                head.task.payload.clone(),
                head.task.attempt_count,
            ));
            queue.begin_attempt(key);
        }

        if !launches.is_empty() {
            self.journal_dirty = true;
        }
        for (id, key, recipient, payload, attempt) in launches {
            self.launch(id, key, recipient, payload, attempt);
        }
    }

    fn launch(&self, id: TaskId, key: QueueKey, recipient: String, payload: Payload, attempt: u32) {
        debug!(task = %id, %recipient, attempt, "Delivering");

        let sender = Arc::clone(&self.sender);
        let reports = self.reports_tx.clone();
        let timeout = self.settings.attempt_timeout;

        tokio::spawn(async move {
            let call = AssertUnwindSafe(sender.send(&recipient, &payload)).catch_unwind();
            let outcome = match tokio::time::timeout(timeout, call).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => SendOutcome::transient("sender panicked"),
                Err(_) => SendOutcome::transient(format!(
                    "no response within {:.1}s",
                    timeout.as_secs_f64()
                )),
            };
            // The engine is gone only during shutdown, when the result no longer matters.
            let _ = reports.send(AttemptReport {
                recipient,
                key,
                outcome,
            });
        });
    }

    fn handle_report(&mut self, report: AttemptReport) {
        let now = self.clock.now();
        let AttemptReport {
            recipient,
            key,
            outcome,
        } = report;

        let Some(queued) = self.queue.recipient_mut(&recipient).and_then(|q| {
            q.end_attempt(&key);
            q.get_mut(&key)
        }) else {
            warn!(%recipient, "Attempt result for unknown task {}", key.1);
            return;
        };
        let task = &mut queued.task;

        let next = match outcome {
            SendOutcome::Delivered => {
                info!(task = %task.id, attempt = task.attempt_count, "Delivered to {}", recipient);
                TaskStatus::Delivered
            }
            SendOutcome::PermanentFailure { reason } => {
                error!(task = %task.id, attempt = task.attempt_count, "Delivery rejected: {}", reason);
                task.last_error = Some(reason);
                TaskStatus::Failed
            }
            SendOutcome::TransientFailure {
                reason,
                retry_after,
            } => {
                if let Some(hint) = retry_after {
                    let until = now + hint;
                    if self.paused_until.map_or(true, |current| current < until) {
                        self.paused_until = Some(until);
                    }
                    warn!(
                        task = %task.id,
                        "Rate limited, pausing delivery for {:.1}s",
                        hint.as_secs_f64()
                    );
                }

                let next = if self.settings.policy.allows_another(task.attempt_count) {
                    let delay = self.settings.policy.delay_for(task.attempt_count);
                    queued.not_before = now + delay;
                    warn!(
                        task = %task.id,
                        attempt = task.attempt_count,
                        "Delivery failed ({}), retrying in {:.1}s",
                        reason,
                        delay.as_secs_f64()
                    );
                    TaskStatus::Pending
                } else {
                    error!(
                        task = %task.id,
                        attempt = task.attempt_count,
                        "Delivery failed ({}), giving up",
                        reason
                    );
                    TaskStatus::Failed
                };
                task.last_error = Some(reason);
                next
            }
        };

        if !task.advance(next) {
            warn!(task = %task.id, "Ignoring move from {} to {}", task.status, next);
            return;
        }
        self.journal_dirty = true;

        if next.is_terminal() {
            if let Some(queued) = self.queue.remove(&recipient, &key) {
                self.finish(queued.task);
            }
        }
    }

    /// Count and record a task that reached a terminal status.
    fn finish(&mut self, task: ForwardTask) {
        let finished_at = self.clock.utc_now();
        match task.status {
            TaskStatus::Delivered => {
                self.delivered += 1;
                self.last_delivery_at = Some(finished_at);
            }
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Dropped => self.dropped += 1,
            status => {
                warn!(task = %task.id, "Refusing to finish task in status {}", status);
                return;
            }
        }

        self.backlog.push(ActivityEntry::from_task(&task, finished_at));
        self.flush_backlog();
    }

    fn flush_backlog(&mut self) {
        let mut written = 0;
        for entry in &self.backlog {
            if let Err(e) = self.activity.append(entry) {
                warn!(
                    "Activity log write failed, {} entr(ies) held back: {}",
                    self.backlog.len() - written,
                    e
                );
                break;
            }
            written += 1;
        }
        self.backlog.drain(..written);
    }

    fn in_flight(&self) -> usize {
        self.queue
            .tasks()
            .filter(|q| q.task.status == TaskStatus::InFlight)
            .count()
    }

    fn next_wakeup(&self) -> Option<Instant> {
        if !self.running {
            return None;
        }
        if let Some(until) = self.paused_until {
            if until > self.clock.now() {
                return Some(until);
            }
        }
        self.queue.next_due()
    }

    fn snapshot(&self) -> StatusSnapshot {
        let now = self.clock.now();
        let mut pending = 0;
        let mut in_flight = 0;
        let mut retrying = 0;
        let mut next_attempt: Option<Instant> = None;

        for queued in self.queue.tasks() {
            match queued.task.status {
                TaskStatus::Pending => {
                    pending += 1;
                    if queued.task.attempt_count > 0 {
                        retrying += 1;
                        if queued.not_before > now
                            && next_attempt.map_or(true, |n| queued.not_before < n)
                        {
                            next_attempt = Some(queued.not_before);
                        }
                    }
                }
                TaskStatus::InFlight => in_flight += 1,
                _ => {}
            }
        }

        StatusSnapshot {
            running: self.running,
            pending,
            in_flight,
            delivered: self.delivered,
            failed: self.failed,
            dropped: self.dropped,
            last_delivery_at: self.last_delivery_at,
            backoff: BackoffState {
                paused_until: self
                    .paused_until
                    .filter(|until| *until > now)
                    .map(|until| self.clock.to_utc(until)),
                retrying,
                next_attempt_at: next_attempt.map(|at| self.clock.to_utc(at)),
            },
        }
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.status_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    /// Write the queue and dedup window to the journal if either changed.
    ///
    /// A failed write is retried on the next change.
    fn save_journal(&mut self) {
        if !self.journal_dirty {
            return;
        }
        let Some(journal) = &self.journal else {
            return;
        };

        let state = JournalState {
            pending: self.queue.tasks().map(|q| q.task.clone()).collect(),
            seen: self.dedup.ids().collect(),
        };
        match journal.save(&state) {
            Ok(()) => self.journal_dirty = false,
            Err(e) => error!("Failed to save delivery state: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;

    use super::*;
    use crate::delivery::activity::MemoryActivityLog;
    use crate::delivery::clock::TokioClock;

    /// Sender returning scripted outcomes keyed by message text.
    #[derive(Default)]
    struct ScriptedSender {
        script: Mutex<HashMap<String, VecDeque<SendOutcome>>>,
        calls: Mutex<Vec<(String, String, Instant)>>,
        latency: Duration,
        active: Mutex<HashMap<String, usize>>,
        max_active_per_recipient: Mutex<usize>,
        max_active_total: Mutex<usize>,
    }

    impl ScriptedSender {
        fn new() -> Self {
            Self::default()
        }

        fn with_latency(latency: Duration) -> Self {
            Self {
                latency,
                ..Self::default()
            }
        }

        fn script(&self, text: &str, outcomes: Vec<SendOutcome>) {
            self.script
                .lock()
                .unwrap()
                .insert(text.to_string(), outcomes.into());
        }

        fn calls(&self) -> Vec<(String, String, Instant)> {
            self.calls.lock().unwrap().clone()
        }

        fn texts(&self) -> Vec<String> {
            self.calls().into_iter().map(|(_, text, _)| text).collect()
        }
    }

    #[async_trait]
    impl OutboundSender for ScriptedSender {
        async fn send(&self, recipient: &str, payload: &Payload) -> SendOutcome {
            let text = payload.filter_text().to_string();
            self.calls
                .lock()
                .unwrap()
                .push((recipient.to_string(), text.clone(), Instant::now()));

            {
                let mut active = self.active.lock().unwrap();
                let count = active.entry(recipient.to_string()).or_default();
                *count += 1;
                let mut max = self.max_active_per_recipient.lock().unwrap();
                *max = (*max).max(*count);
                let total: usize = active.values().sum();
                let mut max_total = self.max_active_total.lock().unwrap();
                *max_total = (*max_total).max(total);
            }

            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }

            if let Some(count) = self.active.lock().unwrap().get_mut(recipient) {
                *count -= 1;
            }

            if text == "panic" {
                panic!("sender blew up");
            }

            self.script
                .lock()
                .unwrap()
                .get_mut(&text)
                .and_then(VecDeque::pop_front)
                .unwrap_or(SendOutcome::Delivered)
        }
    }

    fn settings(max_attempts: u32) -> EngineSettings {
        EngineSettings {
            policy: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                jitter: false,
            },
            dedup_capacity: 100,
            dedup_ttl: None,
            queue_capacity: 100,
            intake_buffer: 16,
            attempt_timeout: Duration::from_secs(30),
        }
    }

    fn task(recipient: &str, message_id: i64, text: &str) -> ForwardTask {
        ForwardTask::new(
            TaskId::new(-100, message_id),
            recipient.to_string(),
            Payload::Text(text.to_string()),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + chrono::Duration::seconds(message_id),
        )
    }

    fn build(
        settings: EngineSettings,
        sender: Arc<ScriptedSender>,
        log: &MemoryActivityLog,
    ) -> (DeliveryEngine, mpsc::Sender<ForwardTask>, EngineHandle) {
        DeliveryEngine::new(settings, sender, Box::new(log.clone()), Arc::new(TokioClock))
    }

    fn entry_for(log: &MemoryActivityLog, message_id: i64) -> ActivityEntry {
        log.entries()
            .into_iter()
            .find(|e| e.id.message_id == message_id)
            .unwrap()
    }

    /// Feed tasks, close intake and run the engine to completion.
    async fn run_to_end(
        settings: EngineSettings,
        sender: Arc<ScriptedSender>,
        tasks: Vec<ForwardTask>,
    ) -> (StatusSnapshot, MemoryActivityLog) {
        let log = MemoryActivityLog::new();
        let (engine, intake, _handle) = build(settings, sender, &log);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(engine.run(shutdown_rx));

        for task in tasks {
            intake.send(task).await.unwrap();
        }
        drop(intake);

        (run.await.unwrap(), log)
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_twice_then_delivered() {
        let sender = Arc::new(ScriptedSender::new());
        sender.script(
            "hello",
            vec![
                SendOutcome::transient("timeout"),
                SendOutcome::transient("HTTP 503"),
                SendOutcome::Delivered,
            ],
        );

        let start = Instant::now();
        let (snapshot, log) =
            run_to_end(settings(5), sender.clone(), vec![task("a", 1, "hello")]).await;

        let entry = entry_for(&log, 1);
        assert_eq!(entry.status, TaskStatus::Delivered);
        assert_eq!(entry.attempt_count, 3);
        assert_eq!(snapshot.delivered, 1);
        assert!(snapshot.last_delivery_at.is_some());

        // Backoff of 1s then 2s between the attempts.
        let calls = sender.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[1].2 - calls[0].2 >= Duration::from_secs(1));
        assert!(calls[2].2 - calls[1].2 >= Duration::from_secs(2));
        assert!(Instant::now() - start >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_not_retried() {
        let sender = Arc::new(ScriptedSender::new());
        sender.script("bad", vec![SendOutcome::permanent("invalid recipient")]);

        let start = Instant::now();
        let (snapshot, log) =
            run_to_end(settings(5), sender.clone(), vec![task("a", 1, "bad")]).await;

        let entry = entry_for(&log, 1);
        assert_eq!(entry.status, TaskStatus::Failed);
        assert_eq!(entry.attempt_count, 1);
        assert_eq!(entry.last_error.as_deref(), Some("invalid recipient"));
        assert_eq!(sender.calls().len(), 1);
        assert_eq!(snapshot.failed, 1);
        assert!(Instant::now() - start < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted() {
        let sender = Arc::new(ScriptedSender::new());
        sender.script(
            "flaky",
            (0..10).map(|_| SendOutcome::transient("HTTP 502")).collect(),
        );

        let (snapshot, log) =
            run_to_end(settings(3), sender.clone(), vec![task("a", 1, "flaky")]).await;

        let entry = entry_for(&log, 1);
        assert_eq!(entry.status, TaskStatus::Failed);
        assert_eq!(entry.attempt_count, 3);
        assert_eq!(entry.last_error.as_deref(), Some("HTTP 502"));
        assert_eq!(sender.calls().len(), 3);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(log.entries().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_delivered_once() {
        let sender = Arc::new(ScriptedSender::new());
        let (snapshot, log) = run_to_end(
            settings(5),
            sender.clone(),
            vec![task("a", 1, "news"), task("a", 1, "news")],
        )
        .await;

        assert_eq!(sender.calls().len(), 1);
        assert_eq!(snapshot.delivered, 1);
        assert_eq!(snapshot.dropped, 1);

        let statuses: Vec<TaskStatus> = log.entries().iter().map(|e| e.status).collect();
        assert!(statuses.contains(&TaskStatus::Dropped));
        assert!(statuses.contains(&TaskStatus::Delivered));
        let dropped = log
            .entries()
            .into_iter()
            .find(|e| e.status == TaskStatus::Dropped)
            .unwrap();
        assert!(dropped.last_error.unwrap().contains("duplicate"));
        assert_eq!(dropped.attempt_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pre_dropped_task_logged_without_call() {
        let sender = Arc::new(ScriptedSender::new());
        let mut rejected = task("a", 1, "spam");
        rejected.drop_with("filtered: contains excluded keyword 'spam'");

        let (snapshot, log) = run_to_end(settings(5), sender.clone(), vec![rejected]).await;

        assert!(sender.calls().is_empty());
        assert_eq!(snapshot.dropped, 1);
        assert_eq!(entry_for(&log, 1).status, TaskStatus::Dropped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_order_preserved_behind_retrying_head() {
        let sender = Arc::new(ScriptedSender::new());
        sender.script("first", vec![SendOutcome::transient("timeout")]);

        let (_, log) = run_to_end(
            settings(5),
            sender.clone(),
            vec![task("a", 1, "first"), task("a", 2, "second")],
        )
        .await;

        assert_eq!(sender.texts(), vec!["first", "first", "second"]);
        let first = entry_for(&log, 1);
        let second = entry_for(&log, 2);
        assert!(first.finished_at <= second.finished_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_pauses_all_recipients() {
        let sender = Arc::new(ScriptedSender::new());
        sender.script(
            "limited",
            vec![SendOutcome::rate_limited("HTTP 429", Duration::from_secs(30))],
        );

        let log = MemoryActivityLog::new();
        let (engine, intake, _handle) = build(settings(5), sender.clone(), &log);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(engine.run(shutdown_rx));

        intake.send(task("a", 1, "limited")).await.unwrap();
        // Let the first attempt complete before the second recipient shows up.
        tokio::time::sleep(Duration::from_millis(10)).await;
        intake.send(task("b", 2, "other")).await.unwrap();
        drop(intake);
        run.await.unwrap();

        let calls = sender.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].1, "limited");
        let window_start = calls[0].2;
        for (_, _, at) in &calls[1..] {
            assert!(*at - window_start >= Duration::from_secs(30));
        }
        let entry = entry_for(&log, 1);
        assert_eq!(entry.status, TaskStatus::Delivered);
        assert_eq!(entry.attempt_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_keeps_pending_until_start() {
        let sender = Arc::new(ScriptedSender::new());
        let log = MemoryActivityLog::new();
        let (engine, intake, handle) = build(settings(5), sender.clone(), &log);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = engine.paused();
        let run = tokio::spawn(engine.run(shutdown_rx));

        intake.send(task("a", 1, "held")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(sender.calls().is_empty());
        let status = handle.status();
        assert!(!status.running);
        assert_eq!(status.pending, 1);

        assert!(handle.start());
        drop(intake);
        let snapshot = run.await.unwrap();

        assert_eq!(sender.calls().len(), 1);
        assert_eq!(snapshot.delivered, 1);
        assert!(snapshot.running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_attempt_in_flight_per_recipient() {
        let sender = Arc::new(ScriptedSender::with_latency(Duration::from_secs(2)));
        let tasks = vec![
            task("a", 1, "a1"),
            task("b", 2, "b1"),
            task("a", 3, "a2"),
            task("b", 4, "b2"),
        ];

        let (snapshot, _) = run_to_end(settings(5), sender.clone(), tasks).await;

        assert_eq!(snapshot.delivered, 4);
        assert_eq!(*sender.max_active_per_recipient.lock().unwrap(), 1);
        assert_eq!(*sender.max_active_total.lock().unwrap(), 2);
        let a_calls: Vec<String> = sender
            .calls()
            .into_iter()
            .filter(|(r, _, _)| r == "a")
            .map(|(_, t, _)| t)
            .collect();
        assert_eq!(a_calls, vec!["a1", "a2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_task_waits_for_in_flight_attempt() {
        let sender = Arc::new(ScriptedSender::with_latency(Duration::from_secs(5)));
        let log = MemoryActivityLog::new();
        let (engine, intake, _handle) = build(settings(5), sender.clone(), &log);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(engine.run(shutdown_rx));

        intake.send(task("a", 10, "later")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        // Sorts ahead of the attempt already running for "a".
        intake.send(task("a", 5, "earlier")).await.unwrap();
        drop(intake);
        let snapshot = run.await.unwrap();

        assert_eq!(snapshot.delivered, 2);
        assert_eq!(*sender.max_active_per_recipient.lock().unwrap(), 1);
        let calls = sender.calls();
        assert_eq!(sender.texts(), vec!["later", "earlier"]);
        assert!(calls[1].2 - calls[0].2 >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_sender_is_isolated() {
        let sender = Arc::new(ScriptedSender::new());
        let (snapshot, log) = run_to_end(
            settings(2),
            sender.clone(),
            vec![task("a", 1, "panic"), task("b", 2, "fine")],
        )
        .await;

        let broken = entry_for(&log, 1);
        assert_eq!(broken.status, TaskStatus::Failed);
        assert_eq!(broken.last_error.as_deref(), Some("sender panicked"));
        assert_eq!(entry_for(&log, 2).status, TaskStatus::Delivered);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.delivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_sender_times_out() {
        let sender = Arc::new(ScriptedSender::with_latency(Duration::from_secs(120)));
        let (_, log) = run_to_end(settings(1), sender, vec![task("a", 1, "slow")]).await;

        let entry = entry_for(&log, 1);
        assert_eq!(entry.status, TaskStatus::Failed);
        assert!(entry.last_error.unwrap().contains("no response within"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_in_flight_and_saves_journal() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().join("pending.json"));
        let sender = Arc::new(ScriptedSender::with_latency(Duration::from_secs(5)));
        let log = MemoryActivityLog::new();
        let (engine, intake, _handle) = build(settings(5), sender.clone(), &log);
        let engine = engine.with_journal(journal.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(engine.run(shutdown_rx));

        intake.send(task("a", 1, "in-flight")).await.unwrap();
        intake.send(task("a", 2, "waiting")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown_tx.send(true).unwrap();

        let snapshot = run.await.unwrap();
        assert_eq!(snapshot.delivered, 1);
        assert_eq!(sender.texts(), vec!["in-flight"]);

        let restored = journal.load().unwrap();
        assert_eq!(restored.pending.len(), 1);
        assert_eq!(restored.pending[0].id, TaskId::new(-100, 2));
        assert_eq!(restored.pending[0].status, TaskStatus::Pending);
        assert_eq!(restored.seen, vec![TaskId::new(-100, 1), TaskId::new(-100, 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_journal_survives_unclean_exit() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().join("pending.json"));
        journal
            .save(&JournalState {
                pending: vec![task("a", 1, "old")],
                seen: Vec::new(),
            })
            .unwrap();

        let sender = Arc::new(ScriptedSender::with_latency(Duration::from_secs(20)));
        let log = MemoryActivityLog::new();
        let (mut engine, intake, _handle) = build(settings(5), sender.clone(), &log);
        engine.restore(journal.load().unwrap());
        let engine = engine.with_journal(journal.clone());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(engine.run(shutdown_rx));

        intake.send(task("a", 2, "new")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        // Killed mid-attempt, without a graceful shutdown.
        run.abort();
        assert!(run.await.is_err());

        let state = journal.load().unwrap();
        let mut pending: Vec<(i64, u32)> = state
            .pending
            .iter()
            .map(|t| (t.id.message_id, t.attempt_count))
            .collect();
        pending.sort();
        assert_eq!(pending, vec![(1, 1), (2, 0)]);
        assert_eq!(sender.texts(), vec!["old"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replayed_events_after_restart_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().join("pending.json"));

        let first = Arc::new(ScriptedSender::new());
        let (engine, intake, _handle) = build(settings(5), first.clone(), &MemoryActivityLog::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(engine.with_journal(journal.clone()).run(shutdown_rx));
        intake.send(task("a", 1, "news")).await.unwrap();
        drop(intake);
        assert_eq!(run.await.unwrap().delivered, 1);

        // The listener hands over the same update again after the restart.
        let second = Arc::new(ScriptedSender::new());
        let log = MemoryActivityLog::new();
        let (mut engine, intake, _handle) = build(settings(5), second.clone(), &log);
        engine.restore(journal.load().unwrap());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(engine.with_journal(journal.clone()).run(shutdown_rx));
        intake.send(task("a", 1, "news")).await.unwrap();
        drop(intake);
        let snapshot = run.await.unwrap();

        assert!(second.calls().is_empty());
        assert_eq!(snapshot.dropped, 1);
        assert!(entry_for(&log, 1).last_error.unwrap().contains("duplicate"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_backlog_kept_in_order_after_write_failure() {
        let sender = Arc::new(ScriptedSender::new());
        let log = MemoryActivityLog::new();
        log.fail_next(1);
        let (engine, intake, _handle) = build(settings(5), sender, &log);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(engine.run(shutdown_rx));

        intake.send(task("a", 1, "one")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        // First outcome is held back while the log is unavailable.
        assert!(log.entries().is_empty());

        intake.send(task("a", 2, "two")).await.unwrap();
        drop(intake);
        run.await.unwrap();

        let ids: Vec<i64> = log.entries().iter().map(|e| e.id.message_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_backlog_flushed_on_exit() {
        let sender = Arc::new(ScriptedSender::new());
        let log = MemoryActivityLog::new();
        log.fail_next(1);
        let (engine, intake, _handle) = build(settings(5), sender, &log);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(engine.run(shutdown_rx));

        intake.send(task("a", 1, "only")).await.unwrap();
        drop(intake);
        let snapshot = run.await.unwrap();

        assert_eq!(snapshot.delivered, 1);
        assert_eq!(entry_for(&log, 1).status, TaskStatus::Delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restored_tasks_are_delivered_first() {
        let sender = Arc::new(ScriptedSender::new());
        let log = MemoryActivityLog::new();
        let (mut engine, intake, _handle) = build(settings(5), sender.clone(), &log);
        let mut restored = task("a", 1, "old");
        restored.attempt_count = 2;
        engine.restore(JournalState {
            pending: vec![restored],
            seen: vec![TaskId::new(-100, 7)],
        });

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(engine.run(shutdown_rx));
        intake.send(task("a", 2, "new")).await.unwrap();
        // Replayed source events must not be delivered twice.
        intake.send(task("a", 1, "old")).await.unwrap();
        intake.send(task("a", 7, "delivered before restart")).await.unwrap();
        drop(intake);
        let snapshot = run.await.unwrap();

        assert_eq!(sender.texts(), vec!["old", "new"]);
        let delivered = log
            .entries()
            .into_iter()
            .find(|e| e.id.message_id == 1 && e.status == TaskStatus::Delivered)
            .unwrap();
        assert_eq!(delivered.attempt_count, 3);
        assert_eq!(snapshot.dropped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_applies_backpressure() {
        let sender = Arc::new(ScriptedSender::new());
        let mut settings = settings(5);
        settings.queue_capacity = 1;
        settings.intake_buffer = 1;
        let (engine, intake, _handle) = build(settings, sender, &MemoryActivityLog::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let _run = tokio::spawn(engine.paused().run(shutdown_rx));

        intake.send(task("a", 1, "one")).await.unwrap();
        intake.send(task("a", 2, "two")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // One task queued, one buffered: the producer now has to wait.
        let mut third = tokio_test::task::spawn(intake.send(task("a", 3, "three")));
        tokio_test::assert_pending!(third.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_backoff() {
        let sender = Arc::new(ScriptedSender::new());
        sender.script("retry", vec![SendOutcome::transient("timeout")]);
        let (engine, intake, handle) = build(settings(5), sender, &MemoryActivityLog::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(engine.run(shutdown_rx));

        intake.send(task("a", 1, "retry")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = handle.status();
        assert_eq!(status.pending, 1);
        assert_eq!(status.backoff.retrying, 1);
        assert!(status.backoff.next_attempt_at.is_some());

        drop(intake);
        let snapshot = run.await.unwrap();
        assert_eq!(snapshot.delivered, 1);
        assert_eq!(snapshot.backoff, BackoffState::default());
    }
}
