//! Agent session plumbing: journal paths, resumability checks, and the
//! settings/credentials layout the agent process expects to find inside
//! its environment.

use crate::env::Environment;
use crate::Result;
use serde_json::json;
use std::path::PathBuf;
use tracing::{debug, info};

/// Directory (under the environment root) where the agent keeps its session
/// journals. The leaf segment is derived from the workspace path the same
/// way the agent derives it: slashes become dashes.
pub fn session_directory(environment: &dyn Environment) -> PathBuf {
    let workspace = environment.get_workspace_path();
    let flattened = workspace.to_string_lossy().replace('/', "-");
    environment
        .get_root_path()
        .join(".claude")
        .join("projects")
        .join(flattened)
}

pub fn session_journal_path(environment: &dyn Environment, session_id: &str) -> PathBuf {
    session_directory(environment).join(format!("{session_id}.jsonl"))
}

/// Whether a session can be resumed.
///
/// A session is resumable iff its journal file exists and contains at least
/// one JSON line whose `sessionId` equals the session id. Malformed lines
/// are tolerated while the session is currently running (the agent is
/// mid-write) and treated as fatal otherwise.
pub async fn is_session_id_valid(
    environment: &dyn Environment,
    session_id: &str,
    is_session_running: bool,
) -> bool {
    let journal_path = session_journal_path(environment, session_id);
    let journal_path = journal_path.to_string_lossy();
    if !environment.exists(&journal_path).await {
        info!(
            "session id {} is not valid because {} does not exist",
            session_id, journal_path
        );
        return false;
    }
    let Ok(contents) = environment.read_file(&journal_path).await else {
        return false;
    };
    for line in contents.trim().lines() {
        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(record) => {
                if record.get("sessionId").and_then(|s| s.as_str()) == Some(session_id) {
                    return true;
                }
            }
            Err(_) => {
                if is_session_running {
                    debug!(
                        "skipping malformed history line {:?} - the agent may still be writing",
                        line
                    );
                } else {
                    debug!("found malformed history line {:?} - treating session as invalid", line);
                    return false;
                }
            }
        }
    }
    false
}

/// Credentials handed to the agent.
#[derive(Debug, Clone)]
pub enum AgentCredentials {
    ApiKey { api_key: String },
    Oauth { credentials_json: String },
}

/// Number of trailing characters of an API key recorded for approval
/// tracking in the agent's settings file.
const API_KEY_SUFFIX_LENGTH: usize = 20;

fn project_entry(workspace_path: &str) -> serde_json::Value {
    json!({
        "allowedTools": [],
        "history": [],
        "dontCrawlDirectory": false,
        "mcpContextUris": [],
        "mcpServers": {},
        "enabledMcpjsonServers": [],
        "disabledMcpjsonServers": [],
        "hasTrustDialogAccepted": true,
        "ignorePatterns": [],
        "projectOnboardingSeenCount": 1,
        "hasClaudeMdExternalIncludesApproved": false,
        "hasClaudeMdExternalIncludesWarningShown": false,
        "_workspace": workspace_path,
    })
}

/// Write the settings and credentials files the agent expects into the
/// environment: one JSON settings object at `.claude.json` with the
/// workspace registered as a trusted project, and one credentials file
/// under `.claude/.credentials.json` shaped by the credential kind.
pub async fn populate_agent_settings(
    environment: &dyn Environment,
    credentials: &AgentCredentials,
) -> Result<()> {
    info!("populating agent settings");
    let workspace_host = environment
        .to_host_path(&environment.get_workspace_path())
        .to_string_lossy()
        .into_owned();

    let mut projects = serde_json::Map::new();
    projects.insert(workspace_host.clone(), project_entry(&workspace_host));
    let mut settings = json!({
        "numStartups": 1,
        "customApiKeyResponses": { "approved": [], "rejected": [] },
        "projects": serde_json::Value::Object(projects),
        "hasCompletedOnboarding": true,
    });

    let credentials_path = environment
        .get_root_path()
        .join(".claude")
        .join(".credentials.json");
    let credentials_path = credentials_path.to_string_lossy();
    match credentials {
        AgentCredentials::ApiKey { api_key } => {
            // The trailing key fragment must be pre-approved or the agent
            // prompts interactively and hangs headless runs.
            let suffix_start = api_key.len().saturating_sub(API_KEY_SUFFIX_LENGTH);
            settings["customApiKeyResponses"]["approved"] =
                json!([api_key[suffix_start..].to_string()]);
            environment.write_file(&credentials_path, b"").await?;
        }
        AgentCredentials::Oauth { credentials_json } => {
            environment
                .write_file(&credentials_path, credentials_json.as_bytes())
                .await?;
        }
    }

    let settings_path = environment.get_root_path().join(".claude.json");
    environment
        .write_file(
            &settings_path.to_string_lossy(),
            serde_json::to_string(&settings)?.as_bytes(),
        )
        .await?;
    info!("populated agent settings");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::LocalEnvironment;
    use crate::ids::ProjectId;

    fn make_env(temp: &tempfile::TempDir) -> LocalEnvironment {
        LocalEnvironment::new(
            "env-session-test",
            ProjectId::new(),
            temp.path().join("root"),
            temp.path().join("images"),
        )
        .unwrap()
    }

    fn journal_line(session_id: &str) -> String {
        json!({"type": "assistant", "sessionId": session_id, "uuid": "u-1"}).to_string()
    }

    #[test]
    fn test_session_directory_flattens_workspace_path() {
        let temp = tempfile::tempdir().unwrap();
        let env = make_env(&temp);
        let dir = session_directory(&env);
        assert!(dir.ends_with(".claude/projects/-code"));
    }

    #[tokio::test]
    async fn test_missing_journal_is_not_resumable() {
        let temp = tempfile::tempdir().unwrap();
        let env = make_env(&temp);
        assert!(!is_session_id_valid(&env, "session-1", false).await);
    }

    #[tokio::test]
    async fn test_journal_with_matching_session_id_is_resumable() {
        let temp = tempfile::tempdir().unwrap();
        let env = make_env(&temp);
        let path = session_journal_path(&env, "session-1");
        env.write_file(&path.to_string_lossy(), journal_line("session-1").as_bytes())
            .await
            .unwrap();
        assert!(is_session_id_valid(&env, "session-1", false).await);
    }

    #[tokio::test]
    async fn test_journal_for_other_session_is_not_resumable() {
        let temp = tempfile::tempdir().unwrap();
        let env = make_env(&temp);
        let path = session_journal_path(&env, "session-1");
        env.write_file(&path.to_string_lossy(), journal_line("session-2").as_bytes())
            .await
            .unwrap();
        assert!(!is_session_id_valid(&env, "session-1", false).await);
    }

    #[tokio::test]
    async fn test_malformed_line_is_fatal_only_when_not_running() {
        let temp = tempfile::tempdir().unwrap();
        let env = make_env(&temp);
        let path = session_journal_path(&env, "session-1");
        let contents = format!("half-written garbage\n{}", journal_line("session-1"));
        env.write_file(&path.to_string_lossy(), contents.as_bytes())
            .await
            .unwrap();

        assert!(!is_session_id_valid(&env, "session-1", false).await);
        // The agent is mid-write; tolerate and keep scanning.
        assert!(is_session_id_valid(&env, "session-1", true).await);
    }

    #[tokio::test]
    async fn test_populate_agent_settings_writes_expected_layout() {
        let temp = tempfile::tempdir().unwrap();
        let env = make_env(&temp);
        let credentials = AgentCredentials::ApiKey {
            api_key: "sk-test-0123456789abcdefghijklmnop".to_string(),
        };
        populate_agent_settings(&env, &credentials).await.unwrap();

        let settings_raw = env.read_file("/.claude.json").await.unwrap();
        let settings: serde_json::Value = serde_json::from_str(&settings_raw).unwrap();
        assert_eq!(settings["hasCompletedOnboarding"], true);
        let approved = settings["customApiKeyResponses"]["approved"]
            .as_array()
            .unwrap();
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].as_str().unwrap().len(), API_KEY_SUFFIX_LENGTH);

        assert!(env.exists("/.claude/.credentials.json").await);
        let projects = settings["projects"].as_object().unwrap();
        assert_eq!(projects.len(), 1);
    }
}
