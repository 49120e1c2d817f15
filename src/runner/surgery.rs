//! Journal surgery: removing cancelled tool calls from an agent's on-disk
//! JSONL session journal.
//!
//! After an interrupt the journal can contain `tool_use` records without a
//! matching `tool_result`, which makes the agent fail on resume. The fix is
//! a targeted rewrite: drop every line referencing a cancelled tool-use id
//! and re-thread the `parentUuid` chain of the survivors so they are
//! contiguous again.

use crate::env::Environment;
use crate::Result;
use regex::Regex;
use std::collections::HashSet;
use tracing::{debug, info};

/// Find tool-use ids that were started but never completed.
///
/// Malformed lines are logged and skipped; the two sets make the scan
/// robust to records appearing out of order.
pub fn isolate_cancelled_tool_calls(file_contents: &str) -> HashSet<String> {
    let mut started: HashSet<String> = HashSet::new();
    let mut completed: HashSet<String> = HashSet::new();

    for line in file_contents.lines() {
        if line.is_empty() {
            continue;
        }
        let record: serde_json::Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(_) => {
                info!("skipping malformed history line {:?}", line);
                continue;
            }
        };
        let record_type = record.get("type").and_then(|t| t.as_str());
        let blocks = record
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_array());
        let Some(blocks) = blocks else { continue };

        for block in blocks {
            match (record_type, block.get("type").and_then(|t| t.as_str())) {
                (Some("assistant"), Some("tool_use")) => {
                    if let Some(id) = block.get("id").and_then(|i| i.as_str()) {
                        started.insert(id.to_string());
                    }
                }
                (Some("user"), Some("tool_result")) => {
                    if let Some(id) = block.get("tool_use_id").and_then(|i| i.as_str()) {
                        completed.insert(id.to_string());
                    }
                }
                _ => {}
            }
        }
    }

    debug!(
        "started {} tool use ids, completed {}",
        started.len(),
        completed.len()
    );
    started.difference(&completed).cloned().collect()
}

/// Rewrite journal contents so no cancelled tool call remains.
///
/// Returns `None` when there is nothing to cancel (the journal is left
/// untouched). Lines without a `uuid` field (for example bare error
/// markers) are preserved verbatim and do not participate in the parent
/// chain.
pub fn remove_cancelled_tool_calls(file_contents: &str) -> Option<String> {
    let cancelled = isolate_cancelled_tool_calls(file_contents);
    if cancelled.is_empty() {
        return None;
    }
    info!(
        "uncompleted tool calls detected: {:?}; surgically removing their lines",
        cancelled
    );

    let pattern = cancelled
        .iter()
        .map(|id| regex::escape(id))
        .collect::<Vec<_>>()
        .join("|");
    let cancelled_re = Regex::new(&pattern).expect("escaped ids form a valid pattern");

    let filtered: Vec<&str> = file_contents
        .trim()
        .split('\n')
        .filter(|line| !cancelled_re.is_match(line))
        .collect();

    // Re-thread the parentUuid chain over the surviving lines.
    let mut completed_lines: Vec<String> = Vec::new();
    let mut parent_uuid: Option<String> = None;
    for line in filtered {
        let Ok(mut record) = serde_json::from_str::<serde_json::Value>(line) else {
            completed_lines.push(line.to_string());
            continue;
        };
        let Some(object) = record.as_object_mut() else {
            completed_lines.push(line.to_string());
            continue;
        };
        let uuid = match object.get("uuid").and_then(|u| u.as_str()) {
            Some(uuid) => uuid.to_string(),
            None => {
                // Lines like bare API-error markers carry no uuid.
                completed_lines.push(line.to_string());
                continue;
            }
        };
        object.insert(
            "parentUuid".to_string(),
            match &parent_uuid {
                Some(parent) => serde_json::Value::String(parent.clone()),
                None => serde_json::Value::Null,
            },
        );
        parent_uuid = Some(uuid);
        completed_lines.push(serde_json::to_string(&record).expect("round-tripping a parsed value"));
    }

    Some(completed_lines.join("\n") + "\n")
}

/// Apply surgery to the agent's session journal inside the environment.
///
/// Must only be called while the agent process is stopped; rewriting a
/// journal mid-write corrupts it.
pub async fn cancel_pending_tool_calls(
    environment: &dyn Environment,
    journal_path: &str,
) -> Result<()> {
    if !environment.exists(journal_path).await {
        info!("journal {} does not exist, nothing to repair", journal_path);
        return Ok(());
    }
    let contents = environment.read_file(journal_path).await?;
    if let Some(patched) = remove_cancelled_tool_calls(&contents) {
        environment.write_file(journal_path, patched.as_bytes()).await?;
    }
    Ok(())
}
