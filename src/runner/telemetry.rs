//! Telemetry event naming for message traffic.
//!
//! Two exhaustive maps translate message kinds to event names: one for
//! user-originated messages, one for messages parsed from the agent's
//! output stream. Adding a message variant without extending its map is a
//! startup-time failure, so coverage can never silently rot.

use crate::messages::Message;
use std::collections::HashMap;

/// Event name per user-originated message kind.
pub fn user_message_event_by_type() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("ChatInputUser", "task_chat_input_sent"),
        ("CommandInputUser", "task_command_input_sent"),
        ("StopAgentUser", "task_stop_requested"),
        ("SetUserConfigurationDataUser", "user_configuration_updated"),
        ("SetProjectConfigurationDataUser", "project_configuration_updated"),
        ("LocalSyncSetupAndEnabled", "local_sync_enabled"),
    ])
}

/// Event name per parsed agent message kind.
pub fn agent_message_event_by_type() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("ResponseBlockAgent", "agent_response_block"),
        ("PartialResponseBlockAgent", "agent_partial_response_block"),
        ("RequestStartedAgent", "agent_request_started"),
        ("RequestSuccessAgent", "agent_request_succeeded"),
        ("RequestFailureAgent", "agent_request_failed"),
        ("RemoveQueuedMessageAgent", "agent_queued_message_removed"),
        ("ServerReadyAgent", "agent_server_ready"),
        ("WarningAgent", "agent_warning"),
        ("UpdatedArtifactAgent", "agent_artifact_updated"),
        ("ContextSummary", "agent_context_summarized"),
    ])
}

/// Fail fast when any message variant lacks an event mapping. Called once
/// at runner startup.
pub fn assert_telemetry_coverage() -> crate::Result<()> {
    let user_map = user_message_event_by_type();
    for object_type in Message::user_object_types() {
        if !user_map.contains_key(object_type) {
            return Err(crate::AtelierError::Validation(format!(
                "user message type {object_type} has no telemetry event mapping"
            )));
        }
    }
    let agent_map = agent_message_event_by_type();
    for object_type in Message::agent_object_types() {
        if !agent_map.contains_key(object_type) {
            return Err(crate::AtelierError::Validation(format!(
                "agent message type {object_type} has no telemetry event mapping"
            )));
        }
    }
    Ok(())
}

/// The event name for one message, when its kind is tracked.
pub fn event_name_for(message: &Message) -> Option<&'static str> {
    let object_type = message.object_type();
    if let Some(name) = user_message_event_by_type().get(object_type) {
        return Some(name);
    }
    agent_message_event_by_type().get(object_type).copied()
}
