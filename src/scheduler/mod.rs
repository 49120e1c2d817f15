//! The task scheduler: a single coordinator loop that owns every task
//! lifecycle transition.
//!
//! Outcomes move only here: `Queued → Running → (Completed | Failed)`, and
//! any task found `Running` without a live runner is reset to `Queued` so
//! restarts are idempotent.

use crate::bus::TaskMessageBus;
use crate::constants::{
    ERROR_BACKOFF_MS, EXIT_CODE_IRRECOVERABLE_ERROR, MAX_TASKS_PROMOTED_PER_TICK,
    TASK_POLL_INTERVAL_MS,
};
use crate::ids::{MessageId, ProjectId, TaskId, UserReference};
use crate::messages::Message;
use crate::models::{Project, Task, TaskInputs, TaskOutcome};
use crate::store::{Store, TaskFilter, Transaction};
use crate::{AtelierError, Result};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[cfg(test)]
mod tests;

/// An in-process owner of one task's execution.
#[async_trait::async_trait]
pub trait Runner: Send + Sync {
    fn start(&self);
    fn is_alive(&self) -> bool;
    /// Request a stop; the runner drains and exits on its own.
    fn stop(&self);
    async fn join(&self);
    /// The error the runner finished with, if any. Consumed once.
    fn take_error(&self) -> Option<AtelierError>;
}

/// Creates a runner for one task. The concrete factory wires tasks to agent
/// runners; tests substitute their own.
pub trait RunnerFactory: Send + Sync {
    fn create_runner(&self, task: &Task) -> Arc<dyn Runner>;
}

/// Repeated errors of the same type within the backoff window are logged
/// once. Bounded so an adversarial error mix cannot grow it forever.
pub(crate) struct ErrorDebounceCache {
    timestamps: Mutex<HashMap<String, Instant>>,
    window: Duration,
    max_items: usize,
}

impl ErrorDebounceCache {
    pub fn new(window: Duration) -> Self {
        ErrorDebounceCache {
            timestamps: Mutex::new(HashMap::new()),
            window,
            max_items: 1024,
        }
    }

    /// True when the caller should log this occurrence.
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock().unwrap();
        if let Some(last) = timestamps.get(key) {
            if now.duration_since(*last) < self.window {
                return false;
            }
        }
        if timestamps.len() >= self.max_items && !timestamps.contains_key(key) {
            // Evict the stalest entry.
            if let Some(oldest) = timestamps
                .iter()
                .min_by_key(|(_, t)| **t)
                .map(|(k, _)| k.clone())
            {
                timestamps.remove(&oldest);
            }
        }
        timestamps.insert(key.to_string(), now);
        true
    }
}

struct SchedulerState {
    runner_by_id: HashMap<TaskId, Arc<dyn Runner>>,
    completion_deadline: HashMap<TaskId, DateTime<Utc>>,
    activated_projects: HashSet<ProjectId>,
}

pub struct TaskScheduler {
    store: Store,
    bus: TaskMessageBus,
    factory: Arc<dyn RunnerFactory>,
    /// Periodic tasks are suppressed in tests.
    is_periodic_enabled: bool,
    state: Mutex<SchedulerState>,
    errors: ErrorDebounceCache,
    stop: watch::Sender<bool>,
}

impl TaskScheduler {
    pub fn new(
        store: Store,
        bus: TaskMessageBus,
        factory: Arc<dyn RunnerFactory>,
        is_periodic_enabled: bool,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        TaskScheduler {
            store,
            bus,
            factory,
            is_periodic_enabled,
            state: Mutex::new(SchedulerState {
                runner_by_id: HashMap::new(),
                completion_deadline: HashMap::new(),
                activated_projects: HashSet::new(),
            }),
            errors: ErrorDebounceCache::new(Duration::from_millis(ERROR_BACKOFF_MS)),
            stop,
        }
    }

    /// Record a new task. The caller owns the transaction; the scheduler
    /// picks the task up on a subsequent tick.
    pub fn create_task(&self, task: &Task, transaction: &mut Transaction) -> Result<()> {
        transaction.upsert_task(task)?;
        Ok(())
    }

    /// The coordinator loop. Returns when [`TaskScheduler::shutdown`] runs.
    pub async fn run(self: Arc<Self>) {
        info!("task scheduler started");
        if let Err(e) = self.stop_deleted_tasks().await {
            warn!("failed to enqueue stops for deleting tasks: {}", e);
        }
        let mut stop = self.stop.subscribe();
        loop {
            if *stop.borrow_and_update() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(TASK_POLL_INTERVAL_MS)).await;
            if let Err(e) = self.tick().await {
                if e.is_irrecoverable() {
                    // One telemetry event, then immediate exit: continuing
                    // with a broken database can only corrupt state.
                    error!(target: "telemetry", error = %e, "irrecoverable scheduler error");
                    std::process::exit(EXIT_CODE_IRRECOVERABLE_ERROR);
                }
                if self.errors.should_log(error_key(&e)) {
                    warn!("error in scheduler tick: {}", e);
                }
            }
        }
        self.drain_runners().await;
        info!("task scheduler stopped");
    }

    /// One pass over every active project.
    pub async fn tick(&self) -> Result<()> {
        let projects = self.get_active_projects().await?;
        for project in projects {
            let newly_activated = self
                .state
                .lock()
                .unwrap()
                .activated_projects
                .insert(project.object_id.clone());
            if newly_activated {
                self.reset_orphaned_running_tasks(&project).await?;
            }
            self.stop_expired_runners().await;
            self.reap_dead_runners().await?;
            if self.is_periodic_enabled {
                self.create_queued_periodic_tasks(&project).await?;
            }
            let promoted = self.promote_queued_tasks(&project.object_id).await?;
            self.register_runners(promoted);
        }
        Ok(())
    }

    async fn get_active_projects(&self) -> Result<Vec<Project>> {
        let transaction = self.store.transaction(None).await?;
        let projects = transaction.get_projects()?;
        Ok(projects
            .into_iter()
            .filter(|project| project.is_path_accessible)
            .collect())
    }

    /// Any task marked RUNNING with no live runner is an orphan from a
    /// previous process; return it to QUEUED so it is picked up again.
    /// Runs exactly once per project activation.
    async fn reset_orphaned_running_tasks(&self, project: &Project) -> Result<()> {
        let mut transaction = self.store.transaction(None).await?;
        let running = transaction.get_tasks_for_project(
            &project.object_id,
            &TaskFilter {
                outcomes: Some(vec![TaskOutcome::Running]),
                is_archived: Some(false),
                max_results: None,
            },
        )?;
        for task in running {
            let has_runner = self
                .state
                .lock()
                .unwrap()
                .runner_by_id
                .contains_key(&task.object_id);
            if has_runner {
                continue;
            }
            info!(task_id = %task.object_id, "resetting orphaned RUNNING task to QUEUED");
            let queued = task.clone().with_outcome(TaskOutcome::Queued);
            transaction.upsert_task(&queued)?;
            self.bus.create_message(
                Message::TaskStatusRunner {
                    message_id: MessageId::new(),
                    outcome: TaskOutcome::Queued,
                },
                &task.object_id,
                &mut transaction,
            )?;
        }
        transaction.commit()?;
        Ok(())
    }

    async fn stop_expired_runners(&self) {
        let expired: Vec<(TaskId, Arc<dyn Runner>)> = {
            let state = self.state.lock().unwrap();
            state
                .completion_deadline
                .iter()
                .filter(|(task_id, deadline)| {
                    Utc::now() > **deadline
                        && state
                            .runner_by_id
                            .get(*task_id)
                            .map(|runner| runner.is_alive())
                            .unwrap_or(false)
                })
                .map(|(task_id, _)| {
                    (task_id.clone(), state.runner_by_id[task_id].clone())
                })
                .collect()
        };
        for (task_id, runner) in expired {
            warn!(task_id = %task_id, "task ran past its deadline, shutting it down");
            runner.stop();
            runner.join().await;
        }
    }

    /// Remove entries whose runner is no longer alive.
    ///
    /// A runner that died with a recoverable error leaves its task
    /// re-queued for another attempt; an irrecoverable error marks the task
    /// FAILED with the serialized error stored and re-raises. A clean exit
    /// completes the task.
    async fn reap_dead_runners(&self) -> Result<()> {
        let dead: Vec<(TaskId, Arc<dyn Runner>)> = {
            let mut state = self.state.lock().unwrap();
            let dead_ids: Vec<TaskId> = state
                .runner_by_id
                .iter()
                .filter(|(_, runner)| !runner.is_alive())
                .map(|(task_id, _)| task_id.clone())
                .collect();
            dead_ids
                .into_iter()
                .map(|task_id| {
                    let runner = state.runner_by_id.remove(&task_id).unwrap();
                    state.completion_deadline.remove(&task_id);
                    (task_id, runner)
                })
                .collect()
        };
        for (task_id, runner) in dead {
            info!(task_id = %task_id, "runner is no longer alive");
            match runner.take_error() {
                Some(error) if error.is_irrecoverable() => {
                    self.finish_task(&task_id, TaskOutcome::Failed, Some(&error)).await?;
                    return Err(error);
                }
                Some(error) => {
                    warn!(task_id = %task_id, "runner failed recoverably, re-queueing: {}", error);
                    self.finish_task(&task_id, TaskOutcome::Queued, None).await?;
                }
                None => {
                    self.finish_task(&task_id, TaskOutcome::Completed, None).await?;
                }
            }
        }
        Ok(())
    }

    async fn finish_task(
        &self,
        task_id: &TaskId,
        outcome: TaskOutcome,
        error: Option<&AtelierError>,
    ) -> Result<()> {
        let mut transaction = self.store.transaction(None).await?;
        if let Some(task) = transaction.get_task(task_id)? {
            if task.outcome != TaskOutcome::Running {
                // The runner already wrote a terminal outcome itself.
                transaction.commit()?;
                return Ok(());
            }
            let mut finished = task.with_outcome(outcome);
            finished.error = error.map(crate::messages::SerializedError::from_error);
            transaction.upsert_task(&finished)?;
            self.bus.create_message(
                Message::TaskStatusRunner {
                    message_id: MessageId::new(),
                    outcome,
                },
                task_id,
                &mut transaction,
            )?;
        }
        transaction.commit()?;
        Ok(())
    }

    /// Ensure each periodic input kind has one task QUEUED, RUNNING, or
    /// finished within its interval; create a fresh one otherwise.
    async fn create_queued_periodic_tasks(&self, project: &Project) -> Result<()> {
        let mut transaction = self.store.transaction(None).await?;
        let existing = transaction.get_tasks_for_project(
            &project.object_id,
            &TaskFilter {
                is_archived: Some(false),
                ..Default::default()
            },
        )?;
        for inputs in TaskInputs::periodic_set() {
            let interval = inputs.interval().expect("periodic inputs carry an interval");
            let is_covered = existing.iter().any(|task| {
                task.input_data.is_same_kind(&inputs)
                    && (Utc::now() - task.created_at < interval
                        || matches!(task.outcome, TaskOutcome::Queued | TaskOutcome::Running))
            });
            if is_covered {
                continue;
            }
            debug!(project_id = %project.object_id, "creating periodic task");
            let task = Task {
                object_id: TaskId::new(),
                organization_reference: project.organization_reference.clone(),
                user_reference: UserReference::anonymous(),
                project_id: project.object_id.clone(),
                parent_task_id: None,
                max_seconds: Some(interval.num_seconds() as f64),
                input_data: inputs,
                current_state: None,
                outcome: TaskOutcome::Queued,
                error: None,
                is_archived: false,
                is_deleted: false,
                is_deleting: false,
                created_at: Utc::now(),
            };
            self.create_task(&task, &mut transaction)?;
        }
        transaction.commit()?;
        Ok(())
    }

    /// Retrieve a batch of queued tasks and mark them RUNNING in the same
    /// transaction so they are not retrieved again.
    async fn promote_queued_tasks(&self, project_id: &ProjectId) -> Result<Vec<Task>> {
        let mut transaction = self.store.transaction(None).await?;
        let queued = transaction.get_tasks_for_project(
            project_id,
            &TaskFilter {
                outcomes: Some(vec![TaskOutcome::Queued]),
                is_archived: Some(false),
                max_results: Some(MAX_TASKS_PROMOTED_PER_TICK),
            },
        )?;
        let mut promoted = Vec::new();
        for task in queued {
            let running = task.with_outcome(TaskOutcome::Running);
            transaction.upsert_task(&running)?;
            self.bus.create_message(
                Message::TaskStatusRunner {
                    message_id: MessageId::new(),
                    outcome: TaskOutcome::Running,
                },
                &running.object_id,
                &mut transaction,
            )?;
            promoted.push(running);
        }
        transaction.commit()?;
        Ok(promoted)
    }

    fn register_runners(&self, tasks: Vec<Task>) {
        for task in tasks {
            let task_id = task.object_id.clone();
            let mut state = self.state.lock().unwrap();
            if state.runner_by_id.contains_key(&task_id) {
                continue;
            }
            info!(task_id = %task_id, "starting new runner");
            let runner = self.factory.create_runner(&task);
            if let Some(max_seconds) = task.max_seconds {
                state.completion_deadline.insert(
                    task_id.clone(),
                    Utc::now() + chrono::Duration::milliseconds((max_seconds * 1000.0) as i64),
                );
            }
            runner.start();
            state.runner_by_id.insert(task_id, runner);
        }
    }

    /// Any task flagged `is_deleting` gets a synthetic stop message; its
    /// runner drains and exits.
    async fn stop_deleted_tasks(&self) -> Result<()> {
        let projects = self.get_active_projects().await?;
        let mut transaction = self.store.transaction(None).await?;
        for project in projects {
            let tasks = transaction.get_tasks_for_project(
                &project.object_id,
                &TaskFilter {
                    is_archived: Some(false),
                    ..Default::default()
                },
            )?;
            for task in tasks {
                if task.is_deleting {
                    self.bus.create_message(
                        Message::StopAgentUser {
                            message_id: MessageId::new(),
                        },
                        &task.object_id,
                        &mut transaction,
                    )?;
                }
            }
        }
        transaction.commit()?;
        Ok(())
    }

    /// Begin shutdown: the run loop drains after the current tick.
    pub fn shutdown(&self) {
        info!("task scheduler shutdown requested");
        let _ = self.stop.send(true);
    }

    /// Send stop messages to every RUNNING task, then join each runner.
    /// Long joins are logged but never force-killed, so agents can
    /// checkpoint.
    async fn drain_runners(&self) {
        let runners: Vec<(TaskId, Arc<dyn Runner>)> = {
            let state = self.state.lock().unwrap();
            state
                .runner_by_id
                .iter()
                .map(|(id, runner)| (id.clone(), runner.clone()))
                .collect()
        };

        if let Ok(mut transaction) = self.store.transaction(None).await {
            for (task_id, _) in &runners {
                let is_running = transaction
                    .get_task(task_id)
                    .ok()
                    .flatten()
                    .map(|task| task.outcome == TaskOutcome::Running)
                    .unwrap_or(false);
                if is_running {
                    let _ = self.bus.create_message(
                        Message::StopAgentUser {
                            message_id: MessageId::new(),
                        },
                        task_id,
                        &mut transaction,
                    );
                }
            }
            let _ = transaction.commit();
        }

        for (task_id, runner) in runners {
            let start = Instant::now();
            info!(task_id = %task_id, "joining runner");
            runner.join().await;
            info!(
                task_id = %task_id,
                elapsed_seconds = start.elapsed().as_secs_f64(),
                "joined runner"
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn live_runner_count(&self) -> usize {
        self.state.lock().unwrap().runner_by_id.len()
    }
}

fn error_key(error: &AtelierError) -> &'static str {
    match error {
        AtelierError::EnvironmentCrashed { .. } => "EnvironmentCrashed",
        AtelierError::Process { .. } => "Process",
        AtelierError::GitRepo { .. } => "GitRepo",
        AtelierError::GitCommandFailure { .. } => "GitCommandFailure",
        AtelierError::MutagenSync { .. } => "MutagenSync",
        AtelierError::Database(_) => "Database",
        AtelierError::MissingSqlTable { .. } => "MissingSqlTable",
        AtelierError::Serialization(_) => "Serialization",
        AtelierError::Io(_) => "Io",
        _ => "Other",
    }
}
