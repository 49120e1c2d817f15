//! Loading check definitions from `checks.toml`.
//!
//! The file is a well-formed TOML document where each top-level entry names
//! a check, defined either as a bare command string (defaults for
//! everything else) or as a table of check attributes. Only the versioned
//! file in the repo is read; unversioned machine-local files would make it
//! impossible to propagate changes to other tasks.

use crate::env::Environment;
use crate::messages::{Check, CheckSource, CheckTrigger, DEFAULT_CHECK_TIMEOUT_SECONDS};
use std::collections::HashMap;
use tracing::debug;

/// Repo-relative location of the check configuration.
pub const CHECK_CONFIG_PATH: &str = "checks.toml";

/// Name of the built-in configuration check.
pub const SYSTEM_CHECK_NAME: &str = "system_configuration";

/// Load checks from their canonical location in the workspace, merged over
/// the default system checks (user entries win on name collision).
///
/// A missing file just yields the defaults. Per-check errors land in each
/// check's `config_error`; a file-level parse error yields the defaults
/// plus an error marker check so the problem is visible.
pub async fn load_checks_from_environment(environment: &dyn Environment) -> HashMap<String, Check> {
    let config_path = environment.get_workspace_path().join(CHECK_CONFIG_PATH);
    let mut checks: HashMap<String, Check> =
        default_checks().into_iter().map(|c| (c.name.clone(), c)).collect();

    match environment.read_file(&config_path.to_string_lossy()).await {
        Ok(contents) => match load_checks(contents.trim()) {
            Ok(user_checks) => checks.extend(user_checks),
            Err(parse_error) => {
                debug!("failed to parse {}: {}", CHECK_CONFIG_PATH, parse_error);
                checks.insert(
                    CHECK_CONFIG_PATH.to_string(),
                    Check {
                        name: CHECK_CONFIG_PATH.to_string(),
                        command: None,
                        description: format!("Fix the check configuration in {CHECK_CONFIG_PATH}"),
                        timeout_seconds: DEFAULT_CHECK_TIMEOUT_SECONDS,
                        trigger: CheckTrigger::Manual,
                        is_enabled: false,
                        is_visible: true,
                        is_forked: false,
                        is_local_concurrency_allowed: false,
                        source: CheckSource::System,
                        config_error: Some(parse_error),
                    },
                );
            }
        },
        Err(_) => debug!("no {} in workspace, using default checks", CHECK_CONFIG_PATH),
    }
    checks
}

/// Parse check definitions from file contents.
///
/// Returns `Err` only when the document itself is not valid TOML; invalid
/// values inside a recognized entry produce a check with `config_error`
/// set instead of discarding the check.
pub fn load_checks(file_contents: &str) -> Result<HashMap<String, Check>, String> {
    if file_contents.is_empty() {
        return Ok(HashMap::new());
    }
    let data: toml::Table = toml::from_str(file_contents).map_err(|e| e.to_string())?;

    let mut checks = HashMap::new();
    for (check_name, check_value) in data {
        let check = match check_value {
            // A simple check: just the command to run.
            toml::Value::String(command) => Check {
                name: check_name.clone(),
                command: Some(command),
                description: String::new(),
                timeout_seconds: DEFAULT_CHECK_TIMEOUT_SECONDS,
                trigger: CheckTrigger::AgentMessage,
                is_enabled: true,
                is_visible: true,
                is_forked: false,
                is_local_concurrency_allowed: false,
                source: CheckSource::User,
                config_error: None,
            },
            toml::Value::Table(table) => match parse_check_table(&check_name, &table) {
                Ok(check) => check,
                Err(config_error) => Check {
                    name: check_name.clone(),
                    command: table
                        .get("command")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    description: String::new(),
                    timeout_seconds: DEFAULT_CHECK_TIMEOUT_SECONDS,
                    trigger: CheckTrigger::AgentMessage,
                    is_enabled: true,
                    is_visible: true,
                    is_forked: false,
                    is_local_concurrency_allowed: false,
                    source: CheckSource::User,
                    config_error: Some(config_error),
                },
            },
            other => {
                return Err(format!(
                    "invalid check data for key '{check_name}': expected a string or table, got {other}"
                ))
            }
        };
        checks.insert(check_name, check);
    }
    Ok(checks)
}

fn parse_check_table(check_name: &str, table: &toml::Table) -> Result<Check, String> {
    if let Some(source) = table.get("source") {
        let source_str = source.as_str().unwrap_or_default();
        if !source_str.eq_ignore_ascii_case("USER") {
            return Err(format!(
                "invalid check source ({source}), must be omitted or set to USER"
            ));
        }
    }
    let trigger = match table.get("trigger") {
        None => CheckTrigger::AgentMessage,
        Some(value) => match value.as_str() {
            Some("AGENT_MESSAGE") => CheckTrigger::AgentMessage,
            Some("FILE_CHANGE") => CheckTrigger::FileChange,
            Some("MANUAL") => CheckTrigger::Manual,
            _ => return Err(format!("invalid check trigger ({value})")),
        },
    };
    if let Some(name) = table.get("name") {
        if name.as_str() != Some(check_name) {
            return Err(format!(
                "check name in config ({name}) does not match key '{check_name}' -- either omit or make them match"
            ));
        }
    }
    let timeout_seconds = match table.get("timeout") {
        None => DEFAULT_CHECK_TIMEOUT_SECONDS,
        Some(value) => value
            .as_integer()
            .filter(|t| *t > 0)
            .map(|t| t as u64)
            .ok_or_else(|| format!("invalid check timeout ({value})"))?,
    };
    let get_bool = |key: &str, default: bool| -> Result<bool, String> {
        match table.get(key) {
            None => Ok(default),
            Some(value) => value
                .as_bool()
                .ok_or_else(|| format!("invalid boolean for '{key}' ({value})")),
        }
    };

    Ok(Check {
        name: check_name.to_string(),
        command: table
            .get("command")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        description: table
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        timeout_seconds,
        trigger,
        is_enabled: get_bool("is_enabled", true)?,
        is_visible: get_bool("is_visible", true)?,
        is_forked: get_bool("is_forked", false)?,
        is_local_concurrency_allowed: get_bool("is_local_concurrency_allowed", false)?,
        source: CheckSource::User,
        config_error: None,
    })
}

/// Built-in checks that are always available and not user-editable.
fn default_checks() -> Vec<Check> {
    vec![Check {
        name: SYSTEM_CHECK_NAME.to_string(),
        command: None,
        description: "Checks basic system configuration.".to_string(),
        timeout_seconds: DEFAULT_CHECK_TIMEOUT_SECONDS,
        trigger: CheckTrigger::FileChange,
        is_enabled: true,
        is_visible: true,
        is_forked: false,
        is_local_concurrency_allowed: false,
        source: CheckSource::System,
        config_error: None,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_string_entry_uses_defaults() {
        let checks = load_checks(r#"lint = "cargo clippy""#).unwrap();
        let check = &checks["lint"];
        assert_eq!(check.command.as_deref(), Some("cargo clippy"));
        assert_eq!(check.timeout_seconds, DEFAULT_CHECK_TIMEOUT_SECONDS);
        assert_eq!(check.trigger, CheckTrigger::AgentMessage);
        assert!(check.is_enabled);
        assert!(check.config_error.is_none());
    }

    #[test]
    fn test_table_entry_with_attributes() {
        let checks = load_checks(
            r#"
[tests]
command = "cargo test"
timeout = 120
description = "run the unit tests"
trigger = "FILE_CHANGE"
is_forked = true
"#,
        )
        .unwrap();
        let check = &checks["tests"];
        assert_eq!(check.command.as_deref(), Some("cargo test"));
        assert_eq!(check.timeout_seconds, 120);
        assert_eq!(check.trigger, CheckTrigger::FileChange);
        assert!(check.is_forked);
    }

    #[test]
    fn test_invalid_subfield_is_kept_with_config_error() {
        let checks = load_checks(
            r#"
[broken]
command = "make check"
trigger = "ON_FULL_MOON"
"#,
        )
        .unwrap();
        let check = &checks["broken"];
        assert_eq!(check.command.as_deref(), Some("make check"));
        let error = check.config_error.as_deref().unwrap();
        assert!(error.contains("invalid check trigger"));
    }

    #[test]
    fn test_mismatched_name_is_a_config_error() {
        let checks = load_checks(
            r#"
[alpha]
command = "true"
name = "beta"
"#,
        )
        .unwrap();
        assert!(checks["alpha"].config_error.is_some());
    }

    #[test]
    fn test_non_user_source_is_rejected() {
        let checks = load_checks(
            r#"
[sneaky]
command = "true"
source = "SYSTEM"
"#,
        )
        .unwrap();
        assert!(checks["sneaky"]
            .config_error
            .as_deref()
            .unwrap()
            .contains("source"));
    }

    #[test]
    fn test_document_level_error_is_returned() {
        assert!(load_checks("this is not [ valid toml").is_err());
        assert!(load_checks("numeric_entry = 42").is_err());
    }

    #[test]
    fn test_empty_contents_yield_no_checks() {
        assert!(load_checks("").unwrap().is_empty());
    }
}
