//! Core persistent entities.
//!
//! Entity graphs are by-id, not by-pointer: the dual-table store is the
//! authority and in-memory caches hold values. Every tagged union here uses
//! `object_type` as its discriminator, which doubles as the wire tag.

use crate::env::{EnvironmentSpec, ImageConfig, ImageSpec};
use crate::ids::{
    MessageId, NotificationId, OrganizationReference, ProjectId, TaskId, UserReference,
    UserSettingsId,
};
use crate::messages::{Message, MessageSource, SerializedError};
use crate::{AtelierError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A project is a container for related tasks with at most one git
/// repository associated with it.
///
/// Created with a `file://` URL when the server is first started inside a
/// git repository. Mutated only to update accessibility or mirror settings;
/// never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub object_id: ProjectId,
    pub organization_reference: OrganizationReference,
    /// Display name; currently the name of the folder containing the project.
    pub name: String,
    /// The user's git repository URL (a `file://` path).
    pub user_git_repo_url: Option<String>,
    /// Our own mirror of that repository, if any. Never contains a token.
    pub our_git_repo_url: Option<String>,
    /// Whether the project path exists and is accessible.
    pub is_path_accessible: bool,
    pub default_system_prompt: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// How to launch an agent: the full command plus its prompt configuration.
/// The concrete agent is otherwise opaque to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

/// The inputs that define what a task does. Tasks are executed by
/// dispatching on this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "object_type")]
pub enum TaskInputs {
    /// The primary task: run an agent inside an environment.
    AgentTaskInputs {
        agent_config: AgentConfig,
        image_config: ImageConfig,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        environment_config: Option<EnvironmentSpec>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        available_secrets: Option<Vec<String>>,
        /// `git rev-parse HEAD` at task creation time. Advisory: the real
        /// git state comes from copying the folder into the environment.
        git_hash: String,
        /// Branch name at task creation time (may be empty).
        initial_branch: String,
        /// When true the above completely defines the environment's git
        /// state (`git reset --hard` is run); otherwise the current state is
        /// used untouched.
        is_git_state_clean: bool,
    },
    SendEmailTaskInputs {
        subject: String,
        message: String,
    },
    /// Periodic: cleans up excess images created by deleted and archived
    /// tasks.
    CleanupImagesInputs {
        #[serde(default = "CleanupImagesDefaults::interval_seconds")]
        interval_seconds: i64,
    },
    /// Periodic: refreshes the cached copy of the user repo so it can be
    /// baked into images.
    CacheReposInputs {
        #[serde(default = "CacheReposDefaults::interval_seconds")]
        interval_seconds: i64,
    },
    /// Used in testing to make sure we can shut down tasks that do nothing
    /// but wait.
    MustBeShutDownTaskInputs {},
}

struct CleanupImagesDefaults;
impl CleanupImagesDefaults {
    fn interval_seconds() -> i64 {
        600
    }
}

struct CacheReposDefaults;
impl CacheReposDefaults {
    fn interval_seconds() -> i64 {
        86_400
    }
}

impl TaskInputs {
    pub fn cleanup_images() -> Self {
        TaskInputs::CleanupImagesInputs {
            interval_seconds: CleanupImagesDefaults::interval_seconds(),
        }
    }

    pub fn cache_repos() -> Self {
        TaskInputs::CacheReposInputs {
            interval_seconds: CacheReposDefaults::interval_seconds(),
        }
    }

    /// The repetition interval for periodic inputs, None otherwise.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            TaskInputs::CleanupImagesInputs { interval_seconds }
            | TaskInputs::CacheReposInputs { interval_seconds } => {
                Some(Duration::seconds(*interval_seconds))
            }
            _ => None,
        }
    }

    /// One fresh instance of every periodic input kind. The scheduler keeps
    /// exactly one live task per kind.
    pub fn periodic_set() -> Vec<TaskInputs> {
        vec![TaskInputs::cleanup_images(), TaskInputs::cache_repos()]
    }

    /// Whether two inputs are the same periodic kind.
    pub fn is_same_kind(&self, other: &TaskInputs) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Snapshot of a running task's progress so the task can be resumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "object_type")]
pub enum TaskRunState {
    AgentTaskState {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<ImageSpec>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        environment_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_processed_message_id: Option<MessageId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_repo_path: Option<PathBuf>,
    },
    SendEmailTaskState {
        is_sent: bool,
    },
    CleanupImagesTaskState {},
    CacheReposTaskState {},
}

/// Lifecycle outcome of a task. Transitions happen only inside the
/// scheduler: `Queued → Running → (Completed | Failed)`, with any
/// non-terminal state reset to `Queued` on restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOutcome {
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskOutcome::Completed | TaskOutcome::Failed)
    }
}

/// A task run by the server on behalf of a user.
///
/// Tasks must be idempotent: they are restarted until completed or failed,
/// and may save their current state as they work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub object_id: TaskId,
    pub organization_reference: OrganizationReference,
    pub user_reference: UserReference,
    pub project_id: ProjectId,
    /// The parent task, if any; top-level tasks have none.
    pub parent_task_id: Option<TaskId>,
    pub input_data: TaskInputs,
    /// Optional timeout. Agents normally run until completion, so agent
    /// tasks leave this unset.
    pub max_seconds: Option<f64>,
    pub current_state: Option<TaskRunState>,
    pub outcome: TaskOutcome,
    /// Set iff outcome is `Failed`.
    pub error: Option<SerializedError>,
    pub is_archived: bool,
    pub is_deleted: bool,
    pub is_deleting: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn with_outcome(mut self, outcome: TaskOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Content equality ignoring `created_at`, used to skip no-op upserts.
    pub fn is_content_equal(&self, other: &Task) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.created_at = b.created_at;
        a == b
    }
}

/// One entry of a task's message log.
///
/// The id, source and partial flag are denormalized from the message itself
/// so they can be queried directly; `build` is the only way to construct one
/// and enforces the coherence invariants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedAgentMessage {
    pub object_id: MessageId,
    pub task_id: TaskId,
    pub message: Message,
    pub source: MessageSource,
    pub is_partial: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl SavedAgentMessage {
    pub fn build(message: Message, task_id: TaskId) -> Self {
        SavedAgentMessage {
            object_id: message.message_id().clone(),
            task_id,
            source: message.source(),
            is_partial: message.is_partial(),
            message,
            created_at: Utc::now(),
        }
    }

    /// Validate the denormalized fields against the inner message.
    pub fn validate(&self) -> Result<()> {
        if &self.object_id != self.message.message_id() {
            return Err(AtelierError::Validation(format!(
                "SavedAgentMessage object_id {} does not match message id {}",
                self.object_id,
                self.message.message_id(),
            )));
        }
        if self.source != self.message.source() {
            return Err(AtelierError::Validation(format!(
                "SavedAgentMessage source {:?} does not match message source {:?}",
                self.source,
                self.message.source(),
            )));
        }
        if self.is_partial != self.message.is_partial() {
            return Err(AtelierError::Validation(format!(
                "SavedAgentMessage is_partial {} does not match message type {}",
                self.is_partial,
                self.message.object_type(),
            )));
        }
        Ok(())
    }
}

/// Importance tiers for user-visible notifications, following the platform
/// notification guidelines they map onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationImportance {
    Passive,
    Active,
    TimeSensitive,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub object_id: NotificationId,
    pub user_reference: UserReference,
    /// Roughly markdown; only the first line is shown directly.
    pub message: String,
    pub importance: NotificationImportance,
    pub task_id: Option<TaskId>,
    pub url: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// What repositories the user allows us to log for product improvement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductLoggingPermission {
    None,
    OpenSource,
    All,
}

/// Settings for a locally stored user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
    pub object_id: UserSettingsId,
    pub user_reference: UserReference,
    pub is_usage_data_enabled: bool,
    pub allowed_product_logging: ProductLoggingPermission,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task_id() -> TaskId {
        TaskId::new()
    }

    #[test]
    fn test_saved_message_build_is_coherent() {
        let message = Message::ChatInputUser {
            message_id: MessageId::new(),
            text: "do the thing".to_string(),
        };
        let saved = SavedAgentMessage::build(message, sample_task_id());
        saved.validate().unwrap();
        assert_eq!(saved.source, MessageSource::User);
        assert!(!saved.is_partial);
    }

    #[test]
    fn test_saved_message_rejects_mismatched_id() {
        let message = Message::ChatInputUser {
            message_id: MessageId::new(),
            text: "hi".to_string(),
        };
        let mut saved = SavedAgentMessage::build(message, sample_task_id());
        saved.object_id = MessageId::new();
        assert!(saved.validate().is_err());
    }

    #[test]
    fn test_saved_message_rejects_mismatched_partial_flag() {
        let message = Message::PartialResponseBlockAgent {
            message_id: MessageId::new(),
            request_id: MessageId::new(),
            content: vec![],
        };
        let mut saved = SavedAgentMessage::build(message, sample_task_id());
        assert!(saved.is_partial);
        saved.is_partial = false;
        assert!(saved.validate().is_err());
    }

    #[test]
    fn test_periodic_set_kinds() {
        let set = TaskInputs::periodic_set();
        assert_eq!(set.len(), 2);
        assert!(set.iter().all(|inputs| inputs.interval().is_some()));
        assert!(set[0].is_same_kind(&TaskInputs::cleanup_images()));
        assert!(!set[0].is_same_kind(&set[1]));
    }

    #[test]
    fn test_agent_inputs_are_not_periodic() {
        let inputs = TaskInputs::MustBeShutDownTaskInputs {};
        assert!(inputs.interval().is_none());
    }

    #[test]
    fn test_outcome_terminality() {
        assert!(!TaskOutcome::Queued.is_terminal());
        assert!(!TaskOutcome::Running.is_terminal());
        assert!(TaskOutcome::Completed.is_terminal());
        assert!(TaskOutcome::Failed.is_terminal());
    }
}
