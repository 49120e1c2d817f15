//! The message sum type shared by the bus, the store, the runner, and the
//! streaming façade.
//!
//! Every message carries its own `message_id`; the discriminator field
//! (`object_type`) doubles as the wire tag, so the stored JSON shape is part
//! of the persisted contract and is frozen by schema snapshot tests in the
//! store module.

use crate::env::ImageSpec;
use crate::ids::{MessageId, TaskId};
use serde::{Deserialize, Serialize};

/// Who originated a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageSource {
    User,
    Agent,
    Runner,
    System,
}

/// The stored form of a failure, attached to messages and failed tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl SerializedError {
    pub fn from_error(error: &crate::AtelierError) -> Self {
        SerializedError {
            error_type: error_variant_name(error).to_string(),
            message: error.to_string(),
            traceback: None,
        }
    }
}

fn error_variant_name(error: &crate::AtelierError) -> &'static str {
    use crate::AtelierError::*;
    match error {
        EnvironmentCrashed { .. } => "EnvironmentCrashed",
        Process { .. } => "ProcessError",
        GitRepo { .. } => "GitRepoError",
        GitCommandFailure { .. } => "GitCommandFailure",
        MutagenSync { .. } => "MutagenSyncError",
        FileNotFound { .. } => "FileNotFound",
        IsADirectory { .. } => "IsADirectory",
        TaskNotFound(_) => "TaskNotFound",
        ProjectNotFound(_) => "ProjectNotFound",
        InvalidToken => "InvalidToken",
        InvalidEmail(_) => "InvalidEmail",
        MissingSqlTable { .. } => "MissingSqlTable",
        Database(_) => "Database",
        Serialization(_) => "Serialization",
        Configuration(_) => "Configuration",
        Validation(_) => "Validation",
        Timeout { .. } => "Timeout",
        Io(_) => "Io",
        ConcurrencyGroup { .. } => "ConcurrencyGroup",
        Internal(_) => "Internal",
    }
}

/// Content carried by a tool result: plain text, or a tracked diff for
/// file-editing tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "content_type")]
pub enum ToolContent {
    Generic { text: String },
    Diff { diff: String, file_path: String },
}

/// One block of a chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "block_type")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        tool_name: String,
        content: ToolContent,
        is_error: bool,
    },
    Command {
        command: String,
        is_automated: bool,
    },
    Error {
        message: String,
        error_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        traceback: Option<String>,
    },
    Warning {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        warning_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        traceback: Option<String>,
    },
    ResumeResponse {},
    ContextSummary {
        text: String,
    },
    ForkedTo {
        forked_to_task_id: TaskId,
    },
    ForkedFrom {
        forked_from_task_id: TaskId,
    },
}

/// A named artifact the agent produced or refreshed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// When a check is re-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckTrigger {
    AgentMessage,
    FileChange,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckSource {
    User,
    System,
}

pub const DEFAULT_CHECK_TIMEOUT_SECONDS: u64 = 600;

fn default_check_timeout() -> u64 {
    DEFAULT_CHECK_TIMEOUT_SECONDS
}

fn default_true() -> bool {
    true
}

/// One check from `checks.toml` (or a built-in system check).
///
/// A check with an invalid configuration is retained with `config_error`
/// populated instead of being dropped, so the UI can surface the problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_check_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub trigger: CheckTrigger,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default = "default_true")]
    pub is_visible: bool,
    #[serde(default)]
    pub is_forked: bool,
    #[serde(default)]
    pub is_local_concurrency_allowed: bool,
    #[serde(default)]
    pub source: CheckSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_error: Option<String>,
}

impl Default for CheckTrigger {
    fn default() -> Self {
        CheckTrigger::AgentMessage
    }
}

impl Default for CheckSource {
    fn default() -> Self {
        CheckSource::User
    }
}

/// A suggestion surfaced to the user by a finished check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub title: String,
    pub description: String,
    pub severity_score: f64,
    pub confidence_score: f64,
}

/// Every message that can appear in a task's log.
///
/// Per-task ordering is total (insertion order); across tasks no ordering is
/// guaranteed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "object_type")]
pub enum Message {
    // User-originated
    ChatInputUser {
        message_id: MessageId,
        text: String,
    },
    CommandInputUser {
        message_id: MessageId,
        text: String,
        #[serde(default)]
        is_automated_command: bool,
    },
    StopAgentUser {
        message_id: MessageId,
    },
    SetUserConfigurationDataUser {
        message_id: MessageId,
        is_usage_data_enabled: bool,
    },
    SetProjectConfigurationDataUser {
        message_id: MessageId,
        default_system_prompt: Option<String>,
    },
    LocalSyncSetupAndEnabled {
        message_id: MessageId,
        branch_name: String,
    },

    // Agent-originated
    ResponseBlockAgent {
        message_id: MessageId,
        request_id: MessageId,
        content: Vec<ContentBlock>,
    },
    /// A streaming chunk of an in-progress response. The only variant for
    /// which `SavedAgentMessage.is_partial` is true.
    PartialResponseBlockAgent {
        message_id: MessageId,
        request_id: MessageId,
        content: Vec<ContentBlock>,
    },
    RequestStartedAgent {
        message_id: MessageId,
        request_id: MessageId,
    },
    RequestSuccessAgent {
        message_id: MessageId,
        request_id: MessageId,
    },
    RequestFailureAgent {
        message_id: MessageId,
        request_id: MessageId,
        error: SerializedError,
    },
    RemoveQueuedMessageAgent {
        message_id: MessageId,
        removed_message_id: MessageId,
    },
    ServerReadyAgent {
        message_id: MessageId,
        name: String,
        url: String,
    },
    WarningAgent {
        message_id: MessageId,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<SerializedError>,
    },
    UpdatedArtifactAgent {
        message_id: MessageId,
        artifact: Artifact,
    },
    ContextSummary {
        message_id: MessageId,
        content: String,
    },

    // Runner-originated
    ResumeAgentResponseRunner {
        message_id: MessageId,
    },
    ChecksDefinedRunner {
        message_id: MessageId,
        checks: Vec<Check>,
    },
    CheckLaunchedRunner {
        message_id: MessageId,
        name: String,
        run_id: String,
    },
    CheckFinishedRunner {
        message_id: MessageId,
        name: String,
        run_id: String,
        exit_code: i32,
    },
    NewSuggestionRunner {
        message_id: MessageId,
        suggestions: Vec<Suggestion>,
    },
    EnvironmentCrashedRunner {
        message_id: MessageId,
        error: SerializedError,
    },
    UnexpectedErrorRunner {
        message_id: MessageId,
        error: SerializedError,
    },
    AgentCrashedRunner {
        message_id: MessageId,
        error: SerializedError,
    },
    WarningRunner {
        message_id: MessageId,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<SerializedError>,
    },
    TaskStatusRunner {
        message_id: MessageId,
        outcome: crate::models::TaskOutcome,
    },
    AgentSnapshotRunner {
        message_id: MessageId,
        image: ImageSpec,
    },

    // System-originated
    ForkAgentSystem {
        message_id: MessageId,
        parent_task_id: TaskId,
        child_task_id: TaskId,
        fork_point_message_id: MessageId,
    },
}

impl Message {
    pub fn message_id(&self) -> &MessageId {
        use Message::*;
        match self {
            ChatInputUser { message_id, .. }
            | CommandInputUser { message_id, .. }
            | StopAgentUser { message_id }
            | SetUserConfigurationDataUser { message_id, .. }
            | SetProjectConfigurationDataUser { message_id, .. }
            | LocalSyncSetupAndEnabled { message_id, .. }
            | ResponseBlockAgent { message_id, .. }
            | PartialResponseBlockAgent { message_id, .. }
            | RequestStartedAgent { message_id, .. }
            | RequestSuccessAgent { message_id, .. }
            | RequestFailureAgent { message_id, .. }
            | RemoveQueuedMessageAgent { message_id, .. }
            | ServerReadyAgent { message_id, .. }
            | WarningAgent { message_id, .. }
            | UpdatedArtifactAgent { message_id, .. }
            | ContextSummary { message_id, .. }
            | ResumeAgentResponseRunner { message_id }
            | ChecksDefinedRunner { message_id, .. }
            | CheckLaunchedRunner { message_id, .. }
            | CheckFinishedRunner { message_id, .. }
            | NewSuggestionRunner { message_id, .. }
            | EnvironmentCrashedRunner { message_id, .. }
            | UnexpectedErrorRunner { message_id, .. }
            | AgentCrashedRunner { message_id, .. }
            | WarningRunner { message_id, .. }
            | TaskStatusRunner { message_id, .. }
            | AgentSnapshotRunner { message_id, .. }
            | ForkAgentSystem { message_id, .. } => message_id,
        }
    }

    pub fn source(&self) -> MessageSource {
        use Message::*;
        match self {
            ChatInputUser { .. }
            | CommandInputUser { .. }
            | StopAgentUser { .. }
            | SetUserConfigurationDataUser { .. }
            | SetProjectConfigurationDataUser { .. }
            | LocalSyncSetupAndEnabled { .. } => MessageSource::User,
            ResponseBlockAgent { .. }
            | PartialResponseBlockAgent { .. }
            | RequestStartedAgent { .. }
            | RequestSuccessAgent { .. }
            | RequestFailureAgent { .. }
            | RemoveQueuedMessageAgent { .. }
            | ServerReadyAgent { .. }
            | WarningAgent { .. }
            | UpdatedArtifactAgent { .. }
            | ContextSummary { .. } => MessageSource::Agent,
            ResumeAgentResponseRunner { .. }
            | ChecksDefinedRunner { .. }
            | CheckLaunchedRunner { .. }
            | CheckFinishedRunner { .. }
            | NewSuggestionRunner { .. }
            | EnvironmentCrashedRunner { .. }
            | UnexpectedErrorRunner { .. }
            | AgentCrashedRunner { .. }
            | WarningRunner { .. }
            | TaskStatusRunner { .. }
            | AgentSnapshotRunner { .. } => MessageSource::Runner,
            ForkAgentSystem { .. } => MessageSource::System,
        }
    }

    /// True iff this is a streaming partial-response chunk.
    pub fn is_partial(&self) -> bool {
        matches!(self, Message::PartialResponseBlockAgent { .. })
    }

    /// The wire tag, used for telemetry map lookups and schema freezing.
    pub fn object_type(&self) -> &'static str {
        use Message::*;
        match self {
            ChatInputUser { .. } => "ChatInputUser",
            CommandInputUser { .. } => "CommandInputUser",
            StopAgentUser { .. } => "StopAgentUser",
            SetUserConfigurationDataUser { .. } => "SetUserConfigurationDataUser",
            SetProjectConfigurationDataUser { .. } => "SetProjectConfigurationDataUser",
            LocalSyncSetupAndEnabled { .. } => "LocalSyncSetupAndEnabled",
            ResponseBlockAgent { .. } => "ResponseBlockAgent",
            PartialResponseBlockAgent { .. } => "PartialResponseBlockAgent",
            RequestStartedAgent { .. } => "RequestStartedAgent",
            RequestSuccessAgent { .. } => "RequestSuccessAgent",
            RequestFailureAgent { .. } => "RequestFailureAgent",
            RemoveQueuedMessageAgent { .. } => "RemoveQueuedMessageAgent",
            ServerReadyAgent { .. } => "ServerReadyAgent",
            WarningAgent { .. } => "WarningAgent",
            UpdatedArtifactAgent { .. } => "UpdatedArtifactAgent",
            ContextSummary { .. } => "ContextSummary",
            ResumeAgentResponseRunner { .. } => "ResumeAgentResponseRunner",
            ChecksDefinedRunner { .. } => "ChecksDefinedRunner",
            CheckLaunchedRunner { .. } => "CheckLaunchedRunner",
            CheckFinishedRunner { .. } => "CheckFinishedRunner",
            NewSuggestionRunner { .. } => "NewSuggestionRunner",
            EnvironmentCrashedRunner { .. } => "EnvironmentCrashedRunner",
            UnexpectedErrorRunner { .. } => "UnexpectedErrorRunner",
            AgentCrashedRunner { .. } => "AgentCrashedRunner",
            WarningRunner { .. } => "WarningRunner",
            TaskStatusRunner { .. } => "TaskStatusRunner",
            AgentSnapshotRunner { .. } => "AgentSnapshotRunner",
            ForkAgentSystem { .. } => "ForkAgentSystem",
        }
    }

    /// Every wire tag, for exhaustiveness checks against the telemetry maps.
    pub fn all_object_types() -> &'static [&'static str] {
        &[
            "ChatInputUser",
            "CommandInputUser",
            "StopAgentUser",
            "SetUserConfigurationDataUser",
            "SetProjectConfigurationDataUser",
            "LocalSyncSetupAndEnabled",
            "ResponseBlockAgent",
            "PartialResponseBlockAgent",
            "RequestStartedAgent",
            "RequestSuccessAgent",
            "RequestFailureAgent",
            "RemoveQueuedMessageAgent",
            "ServerReadyAgent",
            "WarningAgent",
            "UpdatedArtifactAgent",
            "ContextSummary",
            "ResumeAgentResponseRunner",
            "ChecksDefinedRunner",
            "CheckLaunchedRunner",
            "CheckFinishedRunner",
            "NewSuggestionRunner",
            "EnvironmentCrashedRunner",
            "UnexpectedErrorRunner",
            "AgentCrashedRunner",
            "WarningRunner",
            "TaskStatusRunner",
            "AgentSnapshotRunner",
            "ForkAgentSystem",
        ]
    }

    /// Wire tags of all user-originated variants.
    pub fn user_object_types() -> &'static [&'static str] {
        &[
            "ChatInputUser",
            "CommandInputUser",
            "StopAgentUser",
            "SetUserConfigurationDataUser",
            "SetProjectConfigurationDataUser",
            "LocalSyncSetupAndEnabled",
        ]
    }

    /// Wire tags of all agent-originated variants (messages parsed from the
    /// agent's output stream).
    pub fn agent_object_types() -> &'static [&'static str] {
        &[
            "ResponseBlockAgent",
            "PartialResponseBlockAgent",
            "RequestStartedAgent",
            "RequestSuccessAgent",
            "RequestFailureAgent",
            "RemoveQueuedMessageAgent",
            "ServerReadyAgent",
            "WarningAgent",
            "UpdatedArtifactAgent",
            "ContextSummary",
        ]
    }
}

/// A notice emitted by a local-sync reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "object_type")]
pub enum LocalSyncNotice {
    /// Sync must not proceed until the described condition clears.
    Pause { source_tag: String, reason: String },
    /// Informational only; does not block sync.
    Info { source_tag: String, message: String },
}

impl LocalSyncNotice {
    pub fn is_pause(&self) -> bool {
        matches!(self, LocalSyncNotice::Pause { .. })
    }
}

/// Whether any notice in the batch requires pausing sync.
pub fn is_pause_necessary(notices: &[LocalSyncNotice]) -> bool {
    notices.iter().any(|n| n.is_pause())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_matches_variant_family() {
        let msg = Message::ChatInputUser {
            message_id: MessageId::new(),
            text: "hello".to_string(),
        };
        assert_eq!(msg.source(), MessageSource::User);

        let msg = Message::TaskStatusRunner {
            message_id: MessageId::new(),
            outcome: crate::models::TaskOutcome::Queued,
        };
        assert_eq!(msg.source(), MessageSource::Runner);
    }

    #[test]
    fn test_only_partial_response_is_partial() {
        let partial = Message::PartialResponseBlockAgent {
            message_id: MessageId::new(),
            request_id: MessageId::new(),
            content: vec![],
        };
        assert!(partial.is_partial());

        let full = Message::ResponseBlockAgent {
            message_id: MessageId::new(),
            request_id: MessageId::new(),
            content: vec![],
        };
        assert!(!full.is_partial());
    }

    #[test]
    fn test_object_type_is_the_wire_tag() {
        let msg = Message::StopAgentUser {
            message_id: MessageId::new(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["object_type"], msg.object_type());
    }

    #[test]
    fn test_all_object_types_covers_every_variant_tag() {
        // Serialize one of each family and confirm its tag is enumerated.
        let samples = vec![
            Message::LocalSyncSetupAndEnabled {
                message_id: MessageId::new(),
                branch_name: "main".to_string(),
            },
            Message::ForkAgentSystem {
                message_id: MessageId::new(),
                parent_task_id: TaskId::new(),
                child_task_id: TaskId::new(),
                fork_point_message_id: MessageId::new(),
            },
        ];
        for msg in samples {
            assert!(Message::all_object_types().contains(&msg.object_type()));
        }
    }

    #[test]
    fn test_pause_necessary_detection() {
        let notices = vec![
            LocalSyncNotice::Info {
                source_tag: "local_git_sync".to_string(),
                message: "synced".to_string(),
            },
            LocalSyncNotice::Pause {
                source_tag: "local_git_state_guardian".to_string(),
                reason: "cannot sync filetree while rebase is in progress".to_string(),
            },
        ];
        assert!(is_pause_necessary(&notices));
        assert!(!is_pause_necessary(&notices[..1]));
    }
}
