//! Converts the raw per-task message log into the pure UI state pushed over
//! the task stream.
//!
//! The conversion is a fold: user input enters the queued list, a request
//! start promotes it, response blocks accumulate on the in-progress
//! assistant message, and success/failure finalize it.

use crate::ids::{MessageId, RequestId, TaskId};
use crate::messages::{ContentBlock, Message, SerializedError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatMessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: ChatMessageRole,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    fn empty_assistant(id: MessageId) -> Self {
        ChatMessage {
            id,
            role: ChatMessageRole::Assistant,
            content: Vec::new(),
        }
    }
}

/// A message inserted out of band (fork markers), anchored after an
/// existing message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertedChatMessage {
    pub message: ChatMessage,
    pub after_message_id: MessageId,
}

/// One push on the per-task stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub task_id: Option<TaskId>,
    pub chat_messages: Vec<ChatMessage>,
    pub in_progress_chat_message: Option<ChatMessage>,
    pub queued_chat_messages: Vec<ChatMessage>,
    pub updated_artifacts: Vec<String>,
    pub finished_request_ids: Vec<RequestId>,
    pub logs: Vec<String>,
    pub in_progress_user_message_id: Option<MessageId>,
    pub check_update_messages: Vec<Message>,
    pub new_suggestion_messages: Vec<Message>,
    pub inserted_messages: Vec<InsertedChatMessage>,
}

/// One item of the stream feeding the fold: a task message, a completed
/// transaction's request id, or a build log line.
#[derive(Debug, Clone)]
pub enum TaskFeedItem {
    Message(Message),
    CompletedTransaction(RequestId),
    Log(String),
}

/// Fold a batch of feed items into a [`TaskUpdate`], carrying the queued
/// and in-progress state over from `current_state`.
pub fn convert_messages_to_task_update(
    items: &[TaskFeedItem],
    task_id: &TaskId,
    current_state: Option<&TaskUpdate>,
) -> TaskUpdate {
    let mut completed: Vec<ChatMessage> = Vec::new();
    let mut queued: Vec<ChatMessage> = current_state
        .map(|state| state.queued_chat_messages.clone())
        .unwrap_or_default();
    let mut in_progress: Option<ChatMessage> = current_state
        .and_then(|state| state.in_progress_chat_message.clone());
    let mut current_request_id: Option<MessageId> = current_state
        .and_then(|state| state.in_progress_user_message_id.clone());
    let mut artifacts: BTreeSet<String> = BTreeSet::new();
    let mut finished_request_ids: Vec<RequestId> = Vec::new();
    let mut logs: Vec<String> = Vec::new();
    let mut check_update_messages: Vec<Message> = Vec::new();
    let mut new_suggestion_messages: Vec<Message> = Vec::new();
    let mut inserted_messages: Vec<InsertedChatMessage> = Vec::new();

    for item in items {
        match item {
            TaskFeedItem::Message(message) => match message {
                Message::ChatInputUser { message_id, text } => {
                    queued.push(ChatMessage {
                        id: message_id.clone(),
                        role: ChatMessageRole::User,
                        content: vec![ContentBlock::Text { text: text.clone() }],
                    });
                }
                Message::CommandInputUser {
                    message_id,
                    text,
                    is_automated_command,
                } => {
                    queued.push(ChatMessage {
                        id: message_id.clone(),
                        role: ChatMessageRole::User,
                        content: vec![ContentBlock::Command {
                            command: text.clone(),
                            is_automated: *is_automated_command,
                        }],
                    });
                }
                Message::RequestStartedAgent { request_id, .. } => {
                    // Promote the queued message to completed.
                    if let Some(index) = queued.iter().position(|m| &m.id == request_id) {
                        completed.push(queued.remove(index));
                        current_request_id = Some(request_id.clone());
                    }
                }
                Message::RemoveQueuedMessageAgent {
                    removed_message_id, ..
                } => {
                    queued.retain(|m| &m.id != removed_message_id);
                }
                Message::ResponseBlockAgent {
                    message_id,
                    content,
                    ..
                }
                | Message::PartialResponseBlockAgent {
                    message_id,
                    content,
                    ..
                } => {
                    in_progress = Some(apply_response_blocks(
                        in_progress.take(),
                        content,
                        message_id,
                    ));
                }
                Message::ResumeAgentResponseRunner { message_id } => {
                    in_progress = Some(apply_response_blocks(
                        in_progress.take(),
                        &[ContentBlock::ResumeResponse {}],
                        message_id,
                    ));
                }
                Message::ContextSummary {
                    message_id,
                    content,
                } => {
                    let message = append_block(
                        in_progress.take(),
                        ContentBlock::ContextSummary {
                            text: content.clone(),
                        },
                        message_id,
                    );
                    completed.push(message);
                }
                Message::RequestSuccessAgent { request_id, .. } => {
                    if current_request_id.as_ref() == Some(request_id) {
                        if let Some(message) = in_progress.take() {
                            completed.push(message);
                        }
                        current_request_id = None;
                    }
                }
                Message::RequestFailureAgent {
                    message_id,
                    request_id,
                    error,
                } => {
                    in_progress = Some(append_block(
                        in_progress.take(),
                        error_block(error),
                        message_id,
                    ));
                    if current_request_id.as_ref() == Some(request_id) {
                        if let Some(message) = in_progress.take() {
                            completed.push(message);
                        }
                        current_request_id = None;
                    }
                }
                Message::EnvironmentCrashedRunner { message_id, error }
                | Message::UnexpectedErrorRunner { message_id, error }
                | Message::AgentCrashedRunner { message_id, error } => {
                    let had_in_progress = in_progress.is_some();
                    let message = append_block(in_progress.take(), error_block(error), message_id);
                    if had_in_progress {
                        in_progress = Some(message);
                    } else {
                        completed.push(message);
                    }
                }
                Message::WarningAgent {
                    message_id,
                    message: warning,
                    error,
                }
                | Message::WarningRunner {
                    message_id,
                    message: warning,
                    error,
                } => {
                    let block = ContentBlock::Warning {
                        message: warning.clone(),
                        warning_type: error.as_ref().map(|e| e.error_type.clone()),
                        traceback: error.as_ref().and_then(|e| e.traceback.clone()),
                    };
                    let had_in_progress = in_progress.is_some();
                    let message = append_block(in_progress.take(), block, message_id);
                    if had_in_progress {
                        in_progress = Some(message);
                    } else {
                        completed.push(message);
                    }
                }
                Message::UpdatedArtifactAgent { artifact, .. } => {
                    artifacts.insert(artifact.name.clone());
                }
                Message::ForkAgentSystem {
                    message_id,
                    parent_task_id,
                    child_task_id,
                    fork_point_message_id,
                } => {
                    let block = if parent_task_id == task_id {
                        ContentBlock::ForkedTo {
                            forked_to_task_id: child_task_id.clone(),
                        }
                    } else {
                        ContentBlock::ForkedFrom {
                            forked_from_task_id: parent_task_id.clone(),
                        }
                    };
                    let mut message = ChatMessage::empty_assistant(message_id.clone());
                    message.content.push(block);
                    inserted_messages.push(InsertedChatMessage {
                        message,
                        after_message_id: fork_point_message_id.clone(),
                    });
                }
                Message::ChecksDefinedRunner { .. }
                | Message::CheckLaunchedRunner { .. }
                | Message::CheckFinishedRunner { .. } => {
                    check_update_messages.push(message.clone());
                }
                Message::NewSuggestionRunner { .. } => {
                    new_suggestion_messages.push(message.clone());
                }
                // Remaining variants carry no chat-visible state.
                _ => {}
            },
            TaskFeedItem::CompletedTransaction(request_id) => {
                finished_request_ids.push(request_id.clone());
            }
            TaskFeedItem::Log(line) => logs.push(reformat_log(line)),
        }
    }

    TaskUpdate {
        task_id: Some(task_id.clone()),
        chat_messages: completed,
        in_progress_chat_message: in_progress,
        queued_chat_messages: queued,
        updated_artifacts: artifacts.into_iter().collect(),
        finished_request_ids,
        logs,
        in_progress_user_message_id: current_request_id,
        check_update_messages,
        new_suggestion_messages,
        inserted_messages,
    }
}

/// Append text/tool-use blocks; tool results replace their matching tool
/// use in place.
fn apply_response_blocks(
    in_progress: Option<ChatMessage>,
    blocks: &[ContentBlock],
    message_id: &MessageId,
) -> ChatMessage {
    let mut message =
        in_progress.unwrap_or_else(|| ChatMessage::empty_assistant(message_id.clone()));
    for block in blocks {
        match block {
            ContentBlock::ToolResult { tool_use_id, .. } => {
                let replaced = message.content.iter_mut().any(|existing| {
                    if matches!(existing, ContentBlock::ToolUse { id, .. } if id == tool_use_id) {
                        *existing = block.clone();
                        true
                    } else {
                        false
                    }
                });
                if !replaced {
                    warn!("no tool use found for result {tool_use_id}, appending");
                    message.content.push(block.clone());
                }
            }
            other => message.content.push(other.clone()),
        }
    }
    message
}

fn append_block(
    in_progress: Option<ChatMessage>,
    block: ContentBlock,
    message_id: &MessageId,
) -> ChatMessage {
    let mut message =
        in_progress.unwrap_or_else(|| ChatMessage::empty_assistant(message_id.clone()));
    message.content.push(block);
    message
}

fn error_block(error: &SerializedError) -> ContentBlock {
    ContentBlock::Error {
        message: error.message.clone(),
        error_type: error.error_type.clone(),
        traceback: error.traceback.clone(),
    }
}

/// Trim structured log lines down to `time|level| message`.
fn reformat_log(line: &str) -> String {
    let mut parts = line.splitn(3, '|');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(timestamp), Some(level), Some(rest)) => match rest.split_once("- ") {
            Some((_, useful)) => format!("{timestamp}|{level}| {}", useful.trim()),
            None => line.to_string(),
        },
        _ => line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ToolContent;

    fn chat_input(text: &str) -> (MessageId, TaskFeedItem) {
        let id = MessageId::new();
        (
            id.clone(),
            TaskFeedItem::Message(Message::ChatInputUser {
                message_id: id,
                text: text.to_string(),
            }),
        )
    }

    fn feed(message: Message) -> TaskFeedItem {
        TaskFeedItem::Message(message)
    }

    #[test]
    fn test_user_message_queues_then_promotes_on_request_start() {
        let task_id = TaskId::new();
        let (user_id, input) = chat_input("do it");

        let update = convert_messages_to_task_update(&[input.clone()], &task_id, None);
        assert_eq!(update.queued_chat_messages.len(), 1);
        assert!(update.chat_messages.is_empty());

        let started = feed(Message::RequestStartedAgent {
            message_id: MessageId::new(),
            request_id: user_id.clone(),
        });
        let update = convert_messages_to_task_update(&[started], &task_id, Some(&update));
        assert!(update.queued_chat_messages.is_empty());
        assert_eq!(update.chat_messages.len(), 1);
        assert_eq!(update.in_progress_user_message_id, Some(user_id));
    }

    #[test]
    fn test_response_blocks_accumulate_and_success_finalizes() {
        let task_id = TaskId::new();
        let (user_id, input) = chat_input("do it");
        let items = vec![
            input,
            feed(Message::RequestStartedAgent {
                message_id: MessageId::new(),
                request_id: user_id.clone(),
            }),
            feed(Message::ResponseBlockAgent {
                message_id: MessageId::new(),
                request_id: user_id.clone(),
                content: vec![ContentBlock::Text {
                    text: "thinking".to_string(),
                }],
            }),
        ];
        let update = convert_messages_to_task_update(&items, &task_id, None);
        let in_progress = update.in_progress_chat_message.as_ref().unwrap();
        assert_eq!(in_progress.content.len(), 1);

        let success = feed(Message::RequestSuccessAgent {
            message_id: MessageId::new(),
            request_id: user_id,
        });
        let update = convert_messages_to_task_update(&[success], &task_id, Some(&update));
        assert!(update.in_progress_chat_message.is_none());
        assert_eq!(update.chat_messages.len(), 1);
        assert!(update.in_progress_user_message_id.is_none());
    }

    #[test]
    fn test_tool_result_replaces_its_tool_use() {
        let task_id = TaskId::new();
        let (user_id, input) = chat_input("run ls");
        let items = vec![
            input,
            feed(Message::RequestStartedAgent {
                message_id: MessageId::new(),
                request_id: user_id.clone(),
            }),
            feed(Message::ResponseBlockAgent {
                message_id: MessageId::new(),
                request_id: user_id.clone(),
                content: vec![ContentBlock::ToolUse {
                    id: "tool-1".to_string(),
                    name: "Bash".to_string(),
                    input: serde_json::json!({"command": "ls"}),
                }],
            }),
            feed(Message::ResponseBlockAgent {
                message_id: MessageId::new(),
                request_id: user_id,
                content: vec![ContentBlock::ToolResult {
                    tool_use_id: "tool-1".to_string(),
                    tool_name: "Bash".to_string(),
                    content: ToolContent::Generic {
                        text: "README.md".to_string(),
                    },
                    is_error: false,
                }],
            }),
        ];
        let update = convert_messages_to_task_update(&items, &task_id, None);
        let in_progress = update.in_progress_chat_message.unwrap();
        assert_eq!(in_progress.content.len(), 1);
        assert!(matches!(
            &in_progress.content[0],
            ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "tool-1"
        ));
    }

    #[test]
    fn test_request_failure_appends_error_and_finalizes() {
        let task_id = TaskId::new();
        let (user_id, input) = chat_input("break");
        let items = vec![
            input,
            feed(Message::RequestStartedAgent {
                message_id: MessageId::new(),
                request_id: user_id.clone(),
            }),
            feed(Message::RequestFailureAgent {
                message_id: MessageId::new(),
                request_id: user_id,
                error: SerializedError {
                    error_type: "AgentExit".to_string(),
                    message: "agent exited with code 9".to_string(),
                    traceback: None,
                },
            }),
        ];
        let update = convert_messages_to_task_update(&items, &task_id, None);
        assert!(update.in_progress_chat_message.is_none());
        assert_eq!(update.chat_messages.len(), 2);
        let last = update.chat_messages.last().unwrap();
        assert!(matches!(
            &last.content[0],
            ContentBlock::Error { message, .. } if message.contains("code 9")
        ));
    }

    #[test]
    fn test_remove_queued_message_drops_it() {
        let task_id = TaskId::new();
        let (user_id, input) = chat_input("never mind");
        let items = vec![
            input,
            feed(Message::RemoveQueuedMessageAgent {
                message_id: MessageId::new(),
                removed_message_id: user_id,
            }),
        ];
        let update = convert_messages_to_task_update(&items, &task_id, None);
        assert!(update.queued_chat_messages.is_empty());
        assert!(update.chat_messages.is_empty());
    }

    #[test]
    fn test_fork_message_inserts_anchored_blocks() {
        let parent_task = TaskId::new();
        let child_task = TaskId::new();
        let anchor = MessageId::new();
        let fork = feed(Message::ForkAgentSystem {
            message_id: MessageId::new(),
            parent_task_id: parent_task.clone(),
            child_task_id: child_task.clone(),
            fork_point_message_id: anchor.clone(),
        });

        // Seen from the parent: a forked-to marker.
        let update = convert_messages_to_task_update(&[fork.clone()], &parent_task, None);
        assert_eq!(update.inserted_messages.len(), 1);
        assert_eq!(update.inserted_messages[0].after_message_id, anchor);
        assert!(matches!(
            update.inserted_messages[0].message.content[0],
            ContentBlock::ForkedTo { .. }
        ));

        // Seen from the child: a forked-from marker.
        let update = convert_messages_to_task_update(&[fork], &child_task, None);
        assert!(matches!(
            update.inserted_messages[0].message.content[0],
            ContentBlock::ForkedFrom { .. }
        ));
    }

    #[test]
    fn test_checks_suggestions_artifacts_and_transactions_accumulate() {
        let task_id = TaskId::new();
        let request_id = RequestId::new();
        let items = vec![
            feed(Message::CheckLaunchedRunner {
                message_id: MessageId::new(),
                name: "tests".to_string(),
                run_id: "run-1".to_string(),
            }),
            feed(Message::NewSuggestionRunner {
                message_id: MessageId::new(),
                suggestions: vec![],
            }),
            feed(Message::UpdatedArtifactAgent {
                message_id: MessageId::new(),
                artifact: crate::messages::Artifact {
                    name: "diff".to_string(),
                    url: None,
                },
            }),
            TaskFeedItem::CompletedTransaction(request_id.clone()),
            TaskFeedItem::Log("12:00:00.000|INFO|module:route - did a thing".to_string()),
        ];
        let update = convert_messages_to_task_update(&items, &task_id, None);
        assert_eq!(update.check_update_messages.len(), 1);
        assert_eq!(update.new_suggestion_messages.len(), 1);
        assert_eq!(update.updated_artifacts, vec!["diff".to_string()]);
        assert_eq!(update.finished_request_ids, vec![request_id]);
        assert_eq!(update.logs, vec!["12:00:00.000|INFO| did a thing".to_string()]);
    }
}
