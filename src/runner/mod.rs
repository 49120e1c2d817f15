//! The agent runner: drives one agent through its lifetime, mediating
//! between the task message bus (input) and the agent process (a child
//! process emitting JSONL on stdout).

use crate::bus::TaskMessageBus;
use crate::constants::AGENT_TERMINATE_GRACE_SECONDS;
use crate::diff::DiffTracker;
use crate::env::{Environment, LocalEnvironment, ProcessSpec};
use crate::ids::MessageId;
use crate::messages::{
    Check, CheckTrigger, ContentBlock, Message, SerializedError, Suggestion, ToolContent,
};
use crate::models::{AgentConfig, Task, TaskInputs};
use crate::{AtelierError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod checks;
pub mod housekeeping;
pub mod session;
pub mod surgery;
pub mod telemetry;

#[cfg(test)]
mod tests;

pub use housekeeping::HousekeepingRunner;

/// Runner lifecycle. A stop request moves to `ShuttingDown` from any state;
/// from `Processing` the agent is interrupted and its journal repaired
/// first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Init,
    Starting,
    Ready,
    Processing,
    ShuttingDown,
    Exited,
}

struct Shared {
    state: Mutex<RunnerState>,
    error: Mutex<Option<AtelierError>>,
    alive: AtomicBool,
    session_id: Mutex<Option<String>>,
}

pub struct AgentRunner {
    task: Task,
    agent_config: AgentConfig,
    bus: TaskMessageBus,
    environment: Arc<dyn Environment>,
    credentials: Option<session::AgentCredentials>,
    secrets: HashMap<String, String>,
    shared: Arc<Shared>,
    stop: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AgentRunner {
    pub fn new(
        task: Task,
        bus: TaskMessageBus,
        environment: Arc<dyn Environment>,
        credentials: Option<session::AgentCredentials>,
        secrets: HashMap<String, String>,
    ) -> Result<Arc<Self>> {
        let agent_config = match &task.input_data {
            TaskInputs::AgentTaskInputs { agent_config, .. } => agent_config.clone(),
            other => {
                return Err(AtelierError::Validation(format!(
                    "task {} is not an agent task: {other:?}",
                    task.object_id,
                )))
            }
        };
        let (stop, _) = watch::channel(false);
        Ok(Arc::new(AgentRunner {
            task,
            agent_config,
            bus,
            environment,
            credentials,
            secrets,
            shared: Arc::new(Shared {
                state: Mutex::new(RunnerState::Init),
                error: Mutex::new(None),
                alive: AtomicBool::new(true),
                session_id: Mutex::new(None),
            }),
            stop,
            handle: Mutex::new(None),
        }))
    }

    pub fn state(&self) -> RunnerState {
        *self.shared.state.lock().unwrap()
    }

    fn set_state(&self, state: RunnerState) {
        debug!(task_id = %self.task.object_id, ?state, "runner state transition");
        *self.shared.state.lock().unwrap() = state;
    }

    async fn run_loop(self: Arc<Self>) {
        let result = self.clone().run_loop_inner().await;
        if let Err(error) = result {
            warn!(task_id = %self.task.object_id, "runner finished with error: {}", error);
            self.publish_error(&error).await;
            *self.shared.error.lock().unwrap() = Some(error);
        }
        self.set_state(RunnerState::Exited);
        self.shared.alive.store(false, Ordering::SeqCst);
    }

    async fn run_loop_inner(self: Arc<Self>) -> Result<()> {
        self.set_state(RunnerState::Starting);
        telemetry::assert_telemetry_coverage()?;
        if let Some(credentials) = &self.credentials {
            session::populate_agent_settings(self.environment.as_ref(), credentials).await?;
        }

        let mut subscription = self
            .bus
            .subscribe_to_user_and_system_messages(&self.task.object_id)
            .await?;
        let mut diff_tracker = DiffTracker::new(self.environment.clone(), None);
        let mut local_sync: Option<crate::sync::LocalSyncEngine> = None;
        let mut stop = self.stop.subscribe();

        let defined_checks = checks::load_checks_from_environment(self.environment.as_ref()).await;
        self.publish_defined_checks(&defined_checks).await?;
        self.set_state(RunnerState::Ready);

        loop {
            let message = tokio::select! {
                message = subscription.recv() => message,
                _ = stop.changed() => None,
            };
            if *stop.borrow() {
                break;
            }
            let Some(message) = message else { break };

            match message {
                Message::ChatInputUser { message_id, text }
                | Message::CommandInputUser {
                    message_id, text, ..
                } => {
                    self.set_state(RunnerState::Processing);
                    let outcome = self
                        .process_request(&text, &message_id, &mut diff_tracker)
                        .await;
                    match outcome {
                        Ok(RequestOutcome::Completed) => {
                            self.run_agent_message_checks(&defined_checks).await?;
                            self.set_state(RunnerState::Ready);
                        }
                        Ok(RequestOutcome::Interrupted) => {
                            // The interrupt left dangling tool calls behind.
                            self.repair_journal().await?;
                            if *stop.borrow() {
                                break;
                            }
                            self.set_state(RunnerState::Ready);
                        }
                        Err(e) if matches!(e, AtelierError::EnvironmentCrashed { .. }) => {
                            self.publish(Message::EnvironmentCrashedRunner {
                                message_id: MessageId::new(),
                                error: SerializedError::from_error(&e),
                            })
                            .await?;
                            return Err(e);
                        }
                        Err(e) => {
                            self.publish(Message::RequestFailureAgent {
                                message_id: MessageId::new(),
                                request_id: message_id,
                                error: SerializedError::from_error(&e),
                            })
                            .await?;
                            self.set_state(RunnerState::Ready);
                        }
                    }
                }
                Message::LocalSyncSetupAndEnabled { branch_name, .. } => {
                    match self.start_local_sync(&branch_name).await {
                        Ok(engine) => {
                            if let Some(previous) = local_sync.replace(engine) {
                                previous.stop().await;
                            }
                        }
                        Err(e) => {
                            warn!(task_id = %self.task.object_id, "local sync setup failed: {}", e);
                            self.publish(Message::WarningRunner {
                                message_id: MessageId::new(),
                                message: format!("local sync could not be enabled: {e}"),
                                error: Some(SerializedError::from_error(&e)),
                            })
                            .await?;
                        }
                    }
                }
                Message::StopAgentUser { .. } => break,
                other => {
                    debug!(task_id = %self.task.object_id, "ignoring message {}", other.object_type());
                }
            }
        }

        self.set_state(RunnerState::ShuttingDown);
        if let Some(engine) = local_sync.take() {
            engine.stop().await;
        }
        self.repair_journal().await?;
        self.environment.persist().await?;
        Ok(())
    }

    /// Enable local sync between the user's repo and this environment; the
    /// pause notices the engine emits are forwarded onto the bus.
    async fn start_local_sync(&self, branch_name: &str) -> Result<crate::sync::LocalSyncEngine> {
        let project = {
            let transaction = self.bus.store().transaction(None).await?;
            transaction
                .get_project(&self.task.project_id)?
                .ok_or_else(|| {
                    AtelierError::ProjectNotFound(self.task.project_id.to_string())
                })?
        };
        let repo_url = project.user_git_repo_url.ok_or_else(|| {
            AtelierError::Validation("project has no git repository URL".to_string())
        })?;
        let repo_path = url::Url::parse(&repo_url)
            .ok()
            .and_then(|parsed| parsed.to_file_path().ok())
            .ok_or_else(|| {
                AtelierError::Validation(format!("project repo URL is not a file path: {repo_url}"))
            })?;

        let sync_config = crate::config::SyncConfig {
            debounce_seconds: crate::constants::LOCAL_SYNC_DEBOUNCE_SECONDS,
            max_debounce_seconds: crate::constants::LOCAL_SYNC_MAX_DEBOUNCE_SECONDS,
        };
        let (engine, mut lifecycle) = crate::sync::LocalSyncEngine::start(
            branch_name,
            repo_path,
            self.environment.clone(),
            &sync_config,
            false,
        )
        .await?;

        // Surface pause notices to the user as warnings on the task.
        let bus = self.bus.clone();
        let task_id = self.task.object_id.clone();
        tokio::spawn(async move {
            while let Some(event) = lifecycle.recv().await {
                if let crate::sync::SyncLifecycleEvent::HandlingPaused { notices } = event {
                    for notice in notices {
                        if let crate::messages::LocalSyncNotice::Pause { reason, .. } = notice {
                            let Ok(mut transaction) = bus.store().transaction(None).await else {
                                continue;
                            };
                            let _ = bus.create_message(
                                Message::WarningRunner {
                                    message_id: MessageId::new(),
                                    message: format!("local sync paused: {reason}"),
                                    error: None,
                                },
                                &task_id,
                                &mut transaction,
                            );
                            let _ = transaction.commit();
                        }
                    }
                }
            }
        });
        Ok(engine)
    }

    /// Run one agent request to completion, streaming its output onto the
    /// bus.
    async fn process_request(
        &self,
        text: &str,
        request_id: &MessageId,
        diff_tracker: &mut DiffTracker,
    ) -> Result<RequestOutcome> {
        self.publish(Message::RequestStartedAgent {
            message_id: MessageId::new(),
            request_id: request_id.clone(),
        })
        .await?;

        let mut command = self.agent_config.command.clone();
        let resumable = {
            let session_id = self.shared.session_id.lock().unwrap().clone();
            match session_id {
                Some(id) => {
                    session::is_session_id_valid(self.environment.as_ref(), &id, false)
                        .await
                        .then_some(id)
                }
                None => None,
            }
        };
        if let Some(session_id) = &resumable {
            command.push("--resume".to_string());
            command.push(session_id.clone());
            self.publish(Message::ResumeAgentResponseRunner {
                message_id: MessageId::new(),
            })
            .await?;
        }
        command.push(text.to_string());

        let spec = ProcessSpec::new(command)
            .with_cwd(
                self.environment
                    .get_workspace_path()
                    .to_string_lossy()
                    .into_owned(),
            )
            .with_secrets(self.secrets.clone())
            .with_shutdown(self.stop.subscribe())
            .unchecked();
        let process = self.environment.run_process_in_background(spec).await?;

        let mut stdout = process.stream_stdout();
        let mut tool_use_map: HashMap<String, (String, serde_json::Value)> = HashMap::new();
        let mut stop = self.stop.subscribe();

        loop {
            tokio::select! {
                line = stdout.recv() => {
                    match line {
                        Ok(line) => {
                            match self
                                .handle_agent_line(&line, request_id, &mut tool_use_map, diff_tracker)
                                .await
                            {
                                Ok(ParsedLine::Final) => {}
                                Ok(ParsedLine::Continue) => continue,
                                Err(e) => {
                                    warn!("failed to handle agent line: {}", e);
                                    continue;
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("agent output lagged, skipped {} lines", skipped);
                            continue;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {}
                    }
                    break;
                }
                _ = stop.changed() => {
                    info!(task_id = %self.task.object_id, "interrupting agent");
                    process.terminate(AGENT_TERMINATE_GRACE_SECONDS).await?;
                    return Ok(RequestOutcome::Interrupted);
                }
            }
        }

        // Stream closed: drain the exit code.
        let code = process.wait().await?;
        if *self.stop.borrow() {
            return Ok(RequestOutcome::Interrupted);
        }
        if code == 0 {
            self.publish(Message::RequestSuccessAgent {
                message_id: MessageId::new(),
                request_id: request_id.clone(),
            })
            .await?;
        } else {
            self.publish(Message::RequestFailureAgent {
                message_id: MessageId::new(),
                request_id: request_id.clone(),
                error: SerializedError {
                    error_type: "AgentExit".to_string(),
                    message: format!("agent exited with code {code}: {}", process.read_stderr()),
                    traceback: None,
                },
            })
            .await?;
        }
        Ok(RequestOutcome::Completed)
    }

    /// Parse one JSONL line from the agent and publish what it carries.
    async fn handle_agent_line(
        &self,
        line: &str,
        request_id: &MessageId,
        tool_use_map: &mut HashMap<String, (String, serde_json::Value)>,
        diff_tracker: &mut DiffTracker,
    ) -> Result<ParsedLine> {
        let record: serde_json::Value = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(_) => {
                debug!("skipping non-JSON agent output line");
                return Ok(ParsedLine::Continue);
            }
        };

        match record.get("type").and_then(|t| t.as_str()) {
            Some("system") => {
                if let Some(session_id) = record.get("session_id").and_then(|s| s.as_str()) {
                    *self.shared.session_id.lock().unwrap() = Some(session_id.to_string());
                }
                Ok(ParsedLine::Continue)
            }
            Some("assistant") => {
                let mut content = Vec::new();
                for block in content_blocks(&record) {
                    match block.get("type").and_then(|t| t.as_str()) {
                        Some("text") => content.push(ContentBlock::Text {
                            text: block
                                .get("text")
                                .and_then(|t| t.as_str())
                                .unwrap_or_default()
                                .to_string(),
                        }),
                        Some("tool_use") => {
                            let id = block
                                .get("id")
                                .and_then(|i| i.as_str())
                                .unwrap_or_default()
                                .to_string();
                            let name = block
                                .get("name")
                                .and_then(|n| n.as_str())
                                .unwrap_or_default()
                                .to_string();
                            let input = block.get("input").cloned().unwrap_or(serde_json::Value::Null);
                            tool_use_map.insert(id.clone(), (name.clone(), input.clone()));
                            content.push(ContentBlock::ToolUse { id, name, input });
                        }
                        _ => {}
                    }
                }
                if content.is_empty() {
                    return Ok(ParsedLine::Continue);
                }
                self.publish(Message::ResponseBlockAgent {
                    message_id: MessageId::new(),
                    request_id: request_id.clone(),
                    content,
                })
                .await?;
                Ok(ParsedLine::Continue)
            }
            Some("user") => {
                let mut content = Vec::new();
                for block in content_blocks(&record) {
                    if block.get("type").and_then(|t| t.as_str()) != Some("tool_result") {
                        continue;
                    }
                    let tool_use_id = block
                        .get("tool_use_id")
                        .and_then(|i| i.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let is_error = block
                        .get("is_error")
                        .and_then(|e| e.as_bool())
                        .unwrap_or(false);
                    let raw_content = block.get("content").cloned().unwrap_or_default();
                    let (tool_name, tool_input) = tool_use_map
                        .get(&tool_use_id)
                        .cloned()
                        .unwrap_or_default();

                    // File-editing tools get their result enriched with the
                    // tracked diff.
                    let tool_content = match diff_tracker
                        .compute_diff_for_tool(&tool_name, &tool_input)
                        .await
                    {
                        Some(diff) if !diff.is_empty() => ToolContent::Diff {
                            diff,
                            file_path: tool_input
                                .get("file_path")
                                .and_then(|p| p.as_str())
                                .unwrap_or_default()
                                .to_string(),
                        },
                        _ => ToolContent::Generic {
                            text: stringify_tool_content(&raw_content),
                        },
                    };
                    content.push(ContentBlock::ToolResult {
                        tool_use_id,
                        tool_name,
                        content: tool_content,
                        is_error,
                    });
                }
                if content.is_empty() {
                    return Ok(ParsedLine::Continue);
                }
                self.publish(Message::ResponseBlockAgent {
                    message_id: MessageId::new(),
                    request_id: request_id.clone(),
                    content,
                })
                .await?;
                Ok(ParsedLine::Continue)
            }
            Some("result") => Ok(ParsedLine::Final),
            _ => Ok(ParsedLine::Continue),
        }
    }

    /// Announce the loaded check set, sorted by name so the message is
    /// stable across restarts.
    async fn publish_defined_checks(&self, checks: &HashMap<String, Check>) -> Result<()> {
        let mut defined: Vec<Check> = checks.values().cloned().collect();
        defined.sort_by(|a, b| a.name.cmp(&b.name));
        self.publish(Message::ChecksDefinedRunner {
            message_id: MessageId::new(),
            checks: defined,
        })
        .await
    }

    /// Run every enabled agent-message check after a completed request,
    /// announcing each launch and result; a failing check also surfaces a
    /// suggestion.
    async fn run_agent_message_checks(&self, checks: &HashMap<String, Check>) -> Result<()> {
        let mut names: Vec<&String> = checks.keys().collect();
        names.sort();
        for name in names {
            let check = &checks[name];
            if !check.is_enabled
                || check.config_error.is_some()
                || check.trigger != CheckTrigger::AgentMessage
            {
                continue;
            }
            let Some(command) = &check.command else { continue };

            let run_id = uuid::Uuid::new_v4().simple().to_string();
            self.publish(Message::CheckLaunchedRunner {
                message_id: MessageId::new(),
                name: check.name.clone(),
                run_id: run_id.clone(),
            })
            .await?;

            let spec = ProcessSpec::new(vec![
                "sh".to_string(),
                "-c".to_string(),
                command.clone(),
            ])
            .with_cwd(
                self.environment
                    .get_workspace_path()
                    .to_string_lossy()
                    .into_owned(),
            )
            .with_timeout(Duration::from_secs(check.timeout_seconds))
            .unchecked();
            let (exit_code, output_tail) =
                match self.environment.run_process_to_completion(spec).await {
                    Ok(process) => {
                        let code = process.returncode().unwrap_or(-1);
                        let stderr = process.read_stderr();
                        let tail = if stderr.trim().is_empty() {
                            process.read_stdout()
                        } else {
                            stderr
                        };
                        (code, tail)
                    }
                    Err(e) => {
                        warn!("check {} could not run: {}", check.name, e);
                        (-1, e.to_string())
                    }
                };
            debug!(check = %check.name, exit_code, "check finished");
            self.publish(Message::CheckFinishedRunner {
                message_id: MessageId::new(),
                name: check.name.clone(),
                run_id,
                exit_code,
            })
            .await?;

            if exit_code != 0 {
                self.publish(Message::NewSuggestionRunner {
                    message_id: MessageId::new(),
                    suggestions: vec![Suggestion {
                        title: format!("Fix failing check `{}`", check.name),
                        description: output_tail.trim().to_string(),
                        severity_score: 1.0,
                        confidence_score: 0.5,
                    }],
                })
                .await?;
            }
        }
        Ok(())
    }

    /// After any interrupt, remove dangling tool calls from the agent's
    /// session journal so the next resume does not fail.
    async fn repair_journal(&self) -> Result<()> {
        let session_id = self.shared.session_id.lock().unwrap().clone();
        let Some(session_id) = session_id else {
            return Ok(());
        };
        let journal_path = session::session_journal_path(self.environment.as_ref(), &session_id);
        surgery::cancel_pending_tool_calls(
            self.environment.as_ref(),
            &journal_path.to_string_lossy(),
        )
        .await
    }

    async fn publish(&self, message: Message) -> Result<()> {
        let mut transaction = self.bus.store().transaction(None).await?;
        self.bus
            .create_message(message, &self.task.object_id, &mut transaction)?;
        transaction.commit()
    }

    async fn publish_error(&self, error: &AtelierError) {
        let message = match error {
            AtelierError::EnvironmentCrashed { .. } => Message::EnvironmentCrashedRunner {
                message_id: MessageId::new(),
                error: SerializedError::from_error(error),
            },
            _ => Message::UnexpectedErrorRunner {
                message_id: MessageId::new(),
                error: SerializedError::from_error(error),
            },
        };
        if let Err(e) = self.publish(message).await {
            warn!("failed to publish runner error: {}", e);
        }
    }
}

enum RequestOutcome {
    Completed,
    Interrupted,
}

enum ParsedLine {
    Continue,
    Final,
}

fn content_blocks(record: &serde_json::Value) -> Vec<serde_json::Value> {
    record
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_array())
        .cloned()
        .unwrap_or_default()
}

fn stringify_tool_content(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[async_trait::async_trait]
impl crate::scheduler::Runner for AgentRunner {
    fn start(&self) {
        let this = Arc::new(self.clone_for_loop());
        let handle = tokio::spawn(this.run_loop());
        *self.handle.lock().unwrap() = Some(handle);
    }

    fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        let _ = self.stop.send(true);
    }

    async fn join(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn take_error(&self) -> Option<AtelierError> {
        self.shared.error.lock().unwrap().take()
    }
}

impl AgentRunner {
    /// The run loop holds its own handle to the shared pieces; the
    /// scheduler-facing wrapper keeps the join handle.
    fn clone_for_loop(&self) -> AgentRunner {
        AgentRunner {
            task: self.task.clone(),
            agent_config: self.agent_config.clone(),
            bus: self.bus.clone(),
            environment: self.environment.clone(),
            credentials: self.credentials.clone(),
            secrets: self.secrets.clone(),
            shared: self.shared.clone(),
            stop: self.stop.clone(),
            handle: Mutex::new(None),
        }
    }
}

/// Production factory: one local environment per task under the
/// environments directory, housekeeping runners for everything else.
pub struct AgentRunnerFactory {
    bus: TaskMessageBus,
    paths: crate::config::PathsConfig,
    environments_dir: PathBuf,
    credentials: Option<session::AgentCredentials>,
    secrets: HashMap<String, String>,
}

impl AgentRunnerFactory {
    pub fn new(
        bus: TaskMessageBus,
        paths: crate::config::PathsConfig,
        credentials: Option<session::AgentCredentials>,
        secrets: HashMap<String, String>,
    ) -> Self {
        let environments_dir = paths.data_dir.join("environments");
        AgentRunnerFactory {
            bus,
            paths,
            environments_dir,
            credentials,
            secrets,
        }
    }
}

impl crate::scheduler::RunnerFactory for AgentRunnerFactory {
    fn create_runner(&self, task: &Task) -> Arc<dyn crate::scheduler::Runner> {
        match &task.input_data {
            TaskInputs::AgentTaskInputs { .. } => {}
            other => {
                // Non-agent tasks run as short housekeeping runners.
                debug!(task_id = %task.object_id, "creating housekeeping runner for {other:?}");
                return Arc::new(HousekeepingRunner::new(
                    task.clone(),
                    self.bus.clone(),
                    self.paths.clone(),
                ));
            }
        }
        let environment = LocalEnvironment::new(
            format!("env-{}", task.object_id),
            task.project_id.clone(),
            self.environments_dir.join(task.object_id.to_string()),
            self.environments_dir.join("images"),
        )
        .map(Arc::new);
        match environment {
            Ok(environment) => match AgentRunner::new(
                task.clone(),
                self.bus.clone(),
                environment,
                self.credentials.clone(),
                self.secrets.clone(),
            ) {
                Ok(runner) => runner,
                Err(e) => Arc::new(FailedRunner::new(e)),
            },
            Err(e) => Arc::new(FailedRunner::new(e)),
        }
    }
}

/// Placeholder runner for tasks whose setup failed before a real runner
/// could exist; reports the error through the normal reaping path.
struct FailedRunner {
    error: Mutex<Option<AtelierError>>,
}

impl FailedRunner {
    fn new(error: AtelierError) -> Self {
        FailedRunner {
            error: Mutex::new(Some(error)),
        }
    }
}

#[async_trait::async_trait]
impl crate::scheduler::Runner for FailedRunner {
    fn start(&self) {}

    fn is_alive(&self) -> bool {
        false
    }

    fn stop(&self) {}

    async fn join(&self) {}

    fn take_error(&self) -> Option<AtelierError> {
        self.error.lock().unwrap().take()
    }
}
