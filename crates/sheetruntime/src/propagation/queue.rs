use super::{Cooldown, EnqueueOutcome, PropagationKey, PropagationTask, TaskId, TaskStatus};
use crate::config::PropagationConfig;
use crate::schema_registry::SchemaRegistry;
use chrono::Utc;
use sheetcore::{EntityId, EventSink, EventStatus, StatusEvent, WorkflowRef};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Slot {
    task: PropagationTask,
    not_before: Instant,
    finished_at: Option<Instant>,
    /// Source changed again while this task was processing
    rerun: bool,
}

struct QueueState {
    slots: Vec<Slot>,
    cooldown: Cooldown,
}

/// What happened to the task handled by one worker step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub attempts: u32,
    /// Delay before the next try, when rescheduled
    pub retry_in: Option<Duration>,
}

enum Attempt {
    Propagated(usize),
    Retry(String),
}

/// Retrying queue that copies source schemas onto their targets.
///
/// Tasks are deduplicated per (workflow, source, target, sheet) while live and
/// handled one at a time.
pub struct PropagationQueue {
    registry: SchemaRegistry,
    config: PropagationConfig,
    state: Mutex<QueueState>,
    step: Mutex<()>,
    notify: Notify,
    worker_running: AtomicBool,
    events: Option<Arc<dyn EventSink>>,
}

impl PropagationQueue {
    pub fn new(registry: SchemaRegistry, config: PropagationConfig) -> Self {
        let cooldown = Cooldown::new(config.cooldown());
        Self {
            registry,
            config,
            state: Mutex::new(QueueState {
                slots: Vec::new(),
                cooldown,
            }),
            step: Mutex::new(()),
            notify: Notify::new(),
            worker_running: AtomicBool::new(false),
            events: None,
        }
    }

    /// Publish terminal failures as warnings on this sink
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &PropagationConfig {
        &self.config
    }

    pub async fn enqueue(
        &self,
        workflow: &WorkflowRef,
        source: &str,
        target: &str,
        sheet_name: Option<&str>,
    ) -> EnqueueOutcome {
        self.enqueue_with(workflow, source, target, sheet_name, false)
            .await
    }

    /// Enqueue even if the pair is inside its cooldown window
    pub async fn enqueue_forced(
        &self,
        workflow: &WorkflowRef,
        source: &str,
        target: &str,
        sheet_name: Option<&str>,
    ) -> EnqueueOutcome {
        self.enqueue_with(workflow, source, target, sheet_name, true)
            .await
    }

    async fn enqueue_with(
        &self,
        workflow: &WorkflowRef,
        source: &str,
        target: &str,
        sheet_name: Option<&str>,
        force: bool,
    ) -> EnqueueOutcome {
        let key = PropagationKey {
            workflow: workflow.clone(),
            source: source.to_string(),
            target: target.to_string(),
            sheet_name: sheet_name.map(str::to_string),
        };
        let now = Instant::now();
        let mut state = self.state.lock().await;

        if let Some(slot) = state
            .slots
            .iter_mut()
            .find(|s| !s.task.status.is_terminal() && s.task.key() == key)
        {
            slot.task.updated_at = Utc::now();
            match slot.task.status {
                TaskStatus::Pending => slot.not_before = now,
                _ => slot.rerun = true,
            }
            debug!(key = %key, task_id = %slot.task.id, "propagation task refreshed");
            let id = slot.task.id;
            drop(state);
            self.notify.notify_one();
            return EnqueueOutcome::Updated(id);
        }

        if !force && state.cooldown.is_cooling(&key, now) {
            debug!(key = %key, "propagation suppressed by cooldown");
            return EnqueueOutcome::Suppressed;
        }

        let task = PropagationTask::new(&key);
        let id = task.id;
        state.slots.push(Slot {
            task,
            not_before: now,
            finished_at: None,
            rerun: false,
        });
        drop(state);

        debug!(key = %key, task_id = %id, "propagation task queued");
        self.notify.notify_one();
        EnqueueOutcome::Queued(id)
    }

    /// Handle the oldest due task, if any.
    pub async fn process_next(&self) -> Option<StepOutcome> {
        let _step = self.step.lock().await;

        let task = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let slot = state
                .slots
                .iter_mut()
                .find(|s| s.task.status == TaskStatus::Pending && s.not_before <= now)?;
            slot.task.status = TaskStatus::Processing;
            slot.task.updated_at = Utc::now();
            slot.task.clone()
        };

        let attempt = self.attempt(&task).await;
        Some(self.settle(task.id, attempt).await)
    }

    /// Process every task that is due right now. Returns how many were handled.
    pub async fn drain(&self) -> usize {
        let mut handled = 0;
        while self.process_next().await.is_some() {
            handled += 1;
        }
        handled
    }

    async fn attempt(&self, task: &PropagationTask) -> Attempt {
        let sheet = task.sheet_name.as_deref();
        let source = match self
            .registry
            .resolve_sheet(&task.workflow, &task.source, sheet)
            .await
        {
            Ok(Some(record)) => record,
            Ok(None) => return Attempt::Retry(format!("source {} has no schema yet", task.source)),
            Err(e) => return Attempt::Retry(e.to_string()),
        };

        let columns = source.columns.clone();
        let count = columns.len();
        match self
            .registry
            .put_schema(&task.workflow, &task.target, sheet, columns)
            .await
        {
            Ok(_) => Attempt::Propagated(count),
            Err(e) => Attempt::Retry(e.to_string()),
        }
    }

    async fn settle(&self, id: TaskId, attempt: Attempt) -> StepOutcome {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let QueueState { slots, cooldown } = &mut *state;

        let Some(slot) = slots.iter_mut().find(|s| s.task.id == id) else {
            // Purged while processing; nothing left to record
            return StepOutcome {
                task_id: id,
                status: TaskStatus::Failed,
                attempts: 0,
                retry_in: None,
            };
        };
        slot.task.updated_at = Utc::now();

        let mut failure = None;
        let retry_in = match attempt {
            Attempt::Propagated(columns) => {
                info!(
                    workflow = %slot.task.workflow,
                    source = %slot.task.source,
                    target = %slot.task.target,
                    columns,
                    "schema propagated"
                );
                slot.task.last_error = None;
                cooldown.mark(slot.task.key(), now);
                if slot.rerun {
                    slot.rerun = false;
                    slot.task.status = TaskStatus::Pending;
                    slot.task.attempts = 0;
                    slot.not_before = now;
                    Some(Duration::ZERO)
                } else {
                    slot.task.status = TaskStatus::Success;
                    slot.finished_at = Some(now);
                    None
                }
            }
            Attempt::Retry(reason) => {
                slot.task.attempts += 1;
                slot.task.last_error = Some(reason.clone());
                if slot.task.attempts >= self.config.max_attempts {
                    slot.task.status = TaskStatus::Failed;
                    slot.finished_at = Some(now);
                    failure = Some(reason);
                    None
                } else {
                    let delay = self.config.backoff_delay(slot.task.attempts);
                    slot.task.status = TaskStatus::Pending;
                    slot.not_before = now + delay;
                    debug!(
                        task_id = %id,
                        attempts = slot.task.attempts,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "propagation rescheduled"
                    );
                    Some(delay)
                }
            }
        };

        let outcome = StepOutcome {
            task_id: id,
            status: slot.task.status,
            attempts: slot.task.attempts,
            retry_in,
        };

        if let Some(reason) = failure {
            let task = slot.task.clone();
            drop(state);
            self.report_failure(&task, &reason);
        } else if retry_in == Some(Duration::ZERO) {
            drop(state);
            self.notify.notify_one();
        }
        outcome
    }

    fn report_failure(&self, task: &PropagationTask, reason: &str) {
        let message = format!(
            "Schema from {} could not be applied to {} after {} attempts: {}",
            task.source, task.target, task.attempts, reason
        );
        warn!(workflow = %task.workflow, task_id = %task.id, "{}", message);
        if let Some(events) = &self.events {
            events.publish(
                StatusEvent::new(EntityId::Node(task.target.clone()), EventStatus::Warning)
                    .in_workflow(task.workflow.clone())
                    .with_message(message),
            );
        }
    }

    /// Remove terminal tasks older than the retention window.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let retention = self.config.retention();
        let mut state = self.state.lock().await;
        let before = state.slots.len();
        state.slots.retain(|s| match s.finished_at {
            Some(at) => now.saturating_duration_since(at) < retention,
            None => true,
        });
        state.cooldown.prune(now);
        let purged = before - state.slots.len();
        if purged > 0 {
            debug!(purged, "expired propagation tasks removed");
        }
        purged
    }

    pub async fn task(&self, id: TaskId) -> Option<PropagationTask> {
        let state = self.state.lock().await;
        state
            .slots
            .iter()
            .find(|s| s.task.id == id)
            .map(|s| s.task.clone())
    }

    pub async fn tasks(&self) -> Vec<PropagationTask> {
        let state = self.state.lock().await;
        state.slots.iter().map(|s| s.task.clone()).collect()
    }

    /// Earliest moment a pending task becomes due
    async fn next_due(&self) -> Option<Instant> {
        let state = self.state.lock().await;
        state
            .slots
            .iter()
            .filter(|s| s.task.status == TaskStatus::Pending)
            .map(|s| s.not_before)
            .min()
    }

    /// Worker loop: handles due tasks, sleeps until the next one, and purges
    /// expired tasks on a fixed interval.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut gc = tokio::time::interval(self.config.gc_interval());
        gc.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            self.drain().await;

            let wake_at = self.next_due().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = gc.tick() => {
                    self.purge_expired().await;
                }
                _ = async {
                    match wake_at {
                        Some(at) => sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {}
            }
        }
        debug!("propagation worker stopped");
    }

    /// Spawn the single worker for this queue. `None` if one is already running.
    pub fn spawn_worker(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if self.worker_running.swap(true, Ordering::SeqCst) {
            return None;
        }
        let queue = Arc::clone(self);
        Some(tokio::spawn(async move {
            queue.run(cancel).await;
            queue.worker_running.store(false, Ordering::SeqCst);
        }))
    }
}
