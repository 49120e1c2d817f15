//! Helpers around the external mutagen binary and its daemon.
//!
//! Filetree sync is delegated to mutagen sessions; sessions created by this
//! system share a fixed name prefix so stale ones can be enumerated and
//! terminated.

use crate::{AtelierError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, trace, warn};

/// All our session names carry this prefix.
pub const SESSION_NAME_PREFIX: &str = "atelier-";

const MUTAGEN_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Sync direction and conflict policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Replace the local side with the remote once (session is transient).
    OverwriteLocalWithRemote,
    /// Two-way sync where the user's side wins every conflict, including
    /// deletions.
    BidirectionalUserWins,
}

impl SyncMode {
    /// (alpha, beta, mutagen mode name) for one session.
    fn alpha_beta_mode<'a>(
        &self,
        local: &'a str,
        remote: &'a str,
    ) -> (&'a str, &'a str, &'static str) {
        match self {
            SyncMode::OverwriteLocalWithRemote => (remote, local, "one-way-replica"),
            SyncMode::BidirectionalUserWins => (local, remote, "two-way-resolved"),
        }
    }
}

async fn run_mutagen(args: &[&str]) -> Result<String> {
    trace!("running mutagen {:?}", args);
    let output = tokio::time::timeout(
        MUTAGEN_COMMAND_TIMEOUT,
        Command::new("mutagen").args(args).output(),
    )
    .await
    .map_err(|_| AtelierError::Timeout {
        message: format!("mutagen {args:?} timed out"),
    })??;
    if !output.status.success() {
        return Err(AtelierError::Process {
            command: format!("mutagen {}", args.join(" ")),
            returncode: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Names of all live sessions carrying our prefix.
pub async fn get_all_session_names() -> Vec<String> {
    let output = match run_mutagen(&["sync", "list", "--template", "{{range .}}{{.Name}}\n{{end}}"])
        .await
    {
        Ok(output) => output,
        Err(e) => {
            debug!("mutagen sync list failed: {}", e);
            return Vec::new();
        }
    };
    output
        .lines()
        .map(str::trim)
        .filter(|name| name.starts_with(SESSION_NAME_PREFIX))
        .map(str::to_string)
        .collect()
}

/// Whether the daemon still knows a session by this name.
pub async fn is_session_running(session_name: &str) -> bool {
    get_all_session_names()
        .await
        .iter()
        .any(|name| name == session_name)
}

pub async fn terminate_session(session_name: &str) {
    if let Err(e) = run_mutagen(&["sync", "terminate", session_name]).await {
        debug!("terminating session {} failed: {}", session_name, e);
    }
}

/// One mutagen sync session between the user's tree and the agent's tree.
pub struct MutagenSession {
    pub name: String,
    pub local: PathBuf,
    /// Mutagen endpoint string for the remote side; a plain path for local
    /// providers, `[user@]host[:port]:path` over SSH otherwise.
    pub remote_url: String,
    pub mode: SyncMode,
    /// Exclusions beyond the remote's own ignore handling.
    pub ignore_patterns: Vec<String>,
    last_attempted_action: Option<&'static str>,
}

impl MutagenSession {
    pub fn new(
        name: impl Into<String>,
        local: PathBuf,
        remote_url: impl Into<String>,
        mode: SyncMode,
        ignore_patterns: Vec<String>,
    ) -> Self {
        let name = name.into();
        debug_assert!(
            name.starts_with(SESSION_NAME_PREFIX),
            "all session names must carry the {SESSION_NAME_PREFIX} prefix"
        );
        MutagenSession {
            name,
            local,
            remote_url: remote_url.into(),
            mode,
            ignore_patterns,
            last_attempted_action: None,
        }
    }

    /// The remote side as a filesystem path (the trailing endpoint
    /// component).
    pub fn remote_path(&self) -> PathBuf {
        PathBuf::from(self.remote_url.rsplit(':').next().unwrap_or(&self.remote_url))
    }

    fn track(&mut self, action: &'static str) -> Option<&'static str> {
        self.last_attempted_action.replace(action)
    }

    pub async fn create(&mut self) -> Result<()> {
        match self.track("create") {
            None => trace!("{}.create()", self.name),
            Some("terminate") => trace!("{}.create() after terminate: restarting session", self.name),
            Some(_) => {
                let is_already_running = is_session_running(&self.name).await;
                debug!(
                    "suspicious: {}.create() double-tapped, is_session_running={}",
                    self.name, is_already_running
                );
                if is_already_running {
                    return Ok(());
                }
            }
        }

        let local = self.local.to_string_lossy().into_owned();
        let (alpha, beta, mode) = self.mode.alpha_beta_mode(&local, &self.remote_url);
        let mut args = vec![
            "sync".to_string(),
            "create".to_string(),
            format!("--name={}", self.name),
            format!("--sync-mode={mode}"),
        ];
        for pattern in &self.ignore_patterns {
            args.push(format!("--ignore={pattern}"));
        }
        args.push(alpha.to_string());
        args.push(beta.to_string());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        run_mutagen(&arg_refs).await.map_err(|e| self.to_error("create", e))?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.track("flush");
        run_mutagen(&["sync", "flush", &self.name])
            .await
            .map_err(|e| self.to_error("flush", e))?;
        Ok(())
    }

    pub async fn terminate(&mut self) {
        let last = self.track("terminate");
        if last.is_none() {
            trace!("skipping termination of uncreated session {}", self.name);
            return;
        }
        terminate_session(&self.name).await;
    }

    fn to_error(&self, operation: &str, cause: AtelierError) -> AtelierError {
        warn!("mutagen {} failed for {}: {}", operation, self.name, cause);
        AtelierError::MutagenSync {
            operation: operation.to_string(),
            session_name: self.name.clone(),
            message: cause.to_string(),
        }
    }
}

/// Mutagen ignore patterns for everything git ignores in the local tree.
pub async fn git_ignored_patterns(local_repo: &Path) -> Vec<String> {
    let repo = crate::git::open_local_user_git_repo_for_read(local_repo).await;
    match repo.get_ignored_paths().await {
        Ok(paths) => paths
            .into_iter()
            .map(|path| {
                let trimmed = path.trim_end_matches('/');
                format!("{trimmed}/**")
            })
            .collect(),
        Err(e) => {
            debug!("could not list git-ignored paths: {}", e);
            Vec::new()
        }
    }
}

/// Seed the user's checkout from the remote once, through a transient
/// one-way session.
pub async fn overwrite_local_with_remote_once(
    local_path: PathBuf,
    remote_url: String,
    session_name: String,
    ignore_patterns: Vec<String>,
) -> Result<()> {
    debug!("creating initial one-way sync session to pull task changes");
    let mut session = MutagenSession::new(
        session_name,
        local_path,
        remote_url,
        SyncMode::OverwriteLocalWithRemote,
        ignore_patterns,
    );
    session.create().await?;
    let flush_result = session.flush().await;
    session.terminate().await;
    flush_result
}
