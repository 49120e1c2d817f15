//! The branch-ref reconciler: keeps one branch's HEAD in sync between the
//! user's repository and the agent's in-environment repository.
//!
//! It watches exactly two files (the branch's head pointer in each repo)
//! and synchronizes fast-forwards in whichever direction is needed. When
//! neither side is an ancestor of the other, the divergence requires manual
//! merging and sync pauses.

use super::scheduler::{HandleOutcome, Reconciler};
use crate::env::{Environment, ProcessSpec};
use crate::git;
use crate::messages::LocalSyncNotice;
use crate::{AtelierError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, trace};

pub const LOCAL_GIT_SYNC_TAG: &str = "local_git_sync";

/// Watcher storms without any ref change are a sign of a broken watcher;
/// report once past this count.
const SUSPICIOUS_EVENTS_WITHOUT_CHANGE: u64 = 100_000;

pub struct BranchSyncReconciler {
    branch_name: String,
    user_repo_path: PathBuf,
    environment: Arc<dyn Environment>,
    /// Last seen content of each head pointer file, so watcher noise
    /// without actual divergence can be ignored.
    last_seen_contents: HashMap<PathBuf, String>,
    events_since_last_change: u64,
    is_suspicious_watcher_reported: bool,
}

impl BranchSyncReconciler {
    /// Build the reconciler and validate both repos carry the branch; the
    /// user's local ref is created from the agent's when missing.
    pub async fn build(
        branch_name: impl Into<String>,
        user_repo_path: PathBuf,
        environment: Arc<dyn Environment>,
    ) -> Result<Self> {
        let branch_name = branch_name.into();
        let agent_repo_url = environment.get_repo_url()?;
        {
            let user_repo = git::open_local_user_git_repo_for_write(&user_repo_path).await;
            user_repo
                .ensure_local_branch_has_remote_branch_ref(agent_repo_url.as_str(), &branch_name)
                .await?;
        }

        let mut reconciler = BranchSyncReconciler {
            branch_name,
            user_repo_path,
            environment,
            last_seen_contents: HashMap::new(),
            events_since_last_change: 0,
            is_suspicious_watcher_reported: false,
        };

        let user_ref = reconciler.user_ref_path().await;
        let agent_ref = reconciler.agent_ref_host_path();
        for ref_path in [&user_ref, &agent_ref] {
            let content = tokio::fs::read_to_string(ref_path).await.map_err(|e| {
                AtelierError::Validation(format!(
                    "head ref {} missing for branch {}: {e}",
                    ref_path.display(),
                    reconciler.branch_name,
                ))
            })?;
            reconciler
                .last_seen_contents
                .insert(ref_path.clone(), content.trim().to_string());
        }
        Ok(reconciler)
    }

    async fn user_ref_path(&self) -> PathBuf {
        let repo = git::open_local_user_git_repo_for_read(&self.user_repo_path).await;
        repo.head_ref_path(&self.branch_name)
    }

    /// Host-side location of the agent repo's head pointer file.
    fn agent_ref_host_path(&self) -> PathBuf {
        let env_ref = self
            .environment
            .get_workspace_path()
            .join(".git")
            .join("refs")
            .join("heads")
            .join(&self.branch_name);
        self.environment.to_host_path(&env_ref)
    }

    fn agent_workspace_host_path(&self) -> PathBuf {
        self.environment
            .to_host_path(&self.environment.get_workspace_path())
    }

    async fn user_head(&self) -> Result<String> {
        let repo = git::open_local_user_git_repo_for_read(&self.user_repo_path).await;
        repo.get_branch_head_commit_hash(&self.branch_name).await
    }

    async fn agent_head(&self) -> Result<String> {
        self.run_agent_git(&["rev-parse", &format!("refs/heads/{}", self.branch_name)])
            .await
            .map(|output| output.trim().to_string())
    }

    async fn run_agent_git(&self, args: &[&str]) -> Result<String> {
        let mut command = vec!["git".to_string()];
        command.extend(args.iter().map(|s| s.to_string()));
        let spec = ProcessSpec::new(command)
            .with_cwd(
                self.environment
                    .get_workspace_path()
                    .to_string_lossy()
                    .into_owned(),
            )
            .unchecked();
        let process = self.environment.run_process_to_completion(spec).await?;
        let code = process.returncode().unwrap_or(-1);
        if code != 0 {
            return Err(AtelierError::GitRepo {
                branch: Some(self.branch_name.clone()),
                stderr: process.read_stderr(),
            });
        }
        Ok(process.read_stdout())
    }

    async fn is_agent_branch_child_of(&self, commit: &str) -> bool {
        self.run_agent_git(&[
            "merge-base",
            "--is-ancestor",
            commit,
            &format!("refs/heads/{}", self.branch_name),
        ])
        .await
        .is_ok()
    }

    async fn heads_diverge(&self) -> Result<bool> {
        Ok(self.user_head().await? != self.agent_head().await?)
    }

    /// Whether the current divergence is a plain fast-forward in one
    /// direction or the other.
    async fn is_currently_easily_syncable(&self) -> Result<bool> {
        if !self.heads_diverge().await? {
            return Ok(true);
        }
        let user_head = self.user_head().await?;
        let agent_head = self.agent_head().await?;
        let user_repo = git::open_local_user_git_repo_for_read(&self.user_repo_path).await;
        if user_repo.is_branch_child_of(&self.branch_name, &agent_head).await {
            return Ok(true);
        }
        if self.is_agent_branch_child_of(&user_head).await {
            return Ok(true);
        }
        Ok(false)
    }

    async fn notice_if_ref_files_missing(&self) -> Option<LocalSyncNotice> {
        let user_ref = self.user_ref_path().await;
        let agent_ref = self.agent_ref_host_path();
        let missing: Vec<&Path> = [user_ref.as_path(), agent_ref.as_path()]
            .into_iter()
            .filter(|path| !path.exists())
            .collect();
        if missing.is_empty() {
            return None;
        }
        let mut reason = format!(
            "ref for {} missing in repo {}",
            self.branch_name,
            missing[0].display()
        );
        if missing.len() == 2 {
            reason.push_str(&format!(" and {}", missing[1].display()));
        }
        Some(LocalSyncNotice::Pause {
            source_tag: LOCAL_GIT_SYNC_TAG.to_string(),
            reason,
        })
    }

    /// Fetch the agent's commits into the user repo and mixed-reset so the
    /// working tree keeps its changes.
    async fn pull_user_from_agent(&self) -> Result<()> {
        let agent_repo_url = self.environment.get_repo_url()?;
        let refspec = format!(
            "refs/heads/{branch}:refs/heads/{branch}",
            branch = self.branch_name
        );
        let user_repo = git::open_local_user_git_repo_for_write(&self.user_repo_path).await;
        let head_before = user_repo
            .get_branch_head_commit_hash(&self.branch_name)
            .await?;
        let is_sync_branch_checked_out =
            user_repo.get_current_git_branch().await? == self.branch_name;

        user_repo
            .fetch(agent_repo_url.as_str(), &refspec, is_sync_branch_checked_out)
            .await?;

        if !is_sync_branch_checked_out {
            debug!(
                "user repo is on a different branch than {}, fetched without reset",
                self.branch_name
            );
            return Ok(());
        }
        let head_after = user_repo
            .get_branch_head_commit_hash(&self.branch_name)
            .await?;
        if head_before == head_after {
            debug!("no head change after fetch from agent repo");
            return Ok(());
        }
        debug!("head moved after fetch, running reset --mixed");
        user_repo
            .reset_mixed(&format!("refs/heads/{}", self.branch_name))
            .await?;
        Ok(())
    }

    /// Forward the user's commits into the agent repo through a temporary
    /// branch, then fetch them onto the agent's branch and mixed-reset.
    async fn push_agent_from_user(&self) -> Result<()> {
        let temp_branch = format!("sync-transport-{}", uuid::Uuid::new_v4().simple());
        self.environment
            .push_into_environment_repo(&self.user_repo_path, &self.branch_name, &temp_branch)
            .await?;

        let agent_branch_checked_out = self
            .run_agent_git(&["rev-parse", "--abbrev-ref", "HEAD"])
            .await?
            .trim()
            == self.branch_name;
        let head_before = self.agent_head().await?;

        let refspec = format!("{temp_branch}:refs/heads/{}", self.branch_name);
        let mut fetch_args = vec!["fetch", "--show-forced-updates"];
        if agent_branch_checked_out {
            fetch_args.push("--update-head-ok");
        }
        fetch_args.push(".");
        fetch_args.push(&refspec);
        let fetch_result = self.run_agent_git(&fetch_args).await;
        self.run_agent_git(&["branch", "-D", &temp_branch]).await.ok();
        fetch_result?;

        if !agent_branch_checked_out {
            return Ok(());
        }
        if self.agent_head().await? != head_before {
            self.run_agent_git(&["reset", "--mixed", &format!("refs/heads/{}", self.branch_name)])
                .await?;
        }
        Ok(())
    }

    /// Synchronize the two heads based on which ref file changed; on
    /// failure, try the reverse direction before giving up.
    async fn sync_heads(&mut self, changed_path: &Path) -> Result<HandleOutcome> {
        if let Some(notice) = self.notice_if_ref_files_missing().await {
            return Ok(HandleOutcome::Paused(vec![notice]));
        }
        if !self.heads_diverge().await? {
            trace!("head commits equal despite change signal in {:?}", changed_path);
            return Ok(HandleOutcome::Handled);
        }

        let user_ref = self.user_ref_path().await;
        let agent_ref = self.agent_ref_host_path();
        let result = if changed_path == user_ref {
            debug!("user change triggered head sync on {}", self.branch_name);
            match self.push_agent_from_user().await {
                Ok(()) => Ok(()),
                Err(e) => {
                    debug!("forward sync failed ({e}), attempting reverse");
                    self.pull_user_from_agent().await
                }
            }
        } else if changed_path == agent_ref {
            debug!("agent change triggered head sync on {}", self.branch_name);
            match self.pull_user_from_agent().await {
                Ok(()) => Ok(()),
                Err(e) => {
                    debug!("forward sync failed ({e}), attempting reverse");
                    self.push_agent_from_user().await
                }
            }
        } else {
            return Err(AtelierError::Validation(format!(
                "{LOCAL_GIT_SYNC_TAG}: unexpected changed path {changed_path:?}"
            )));
        };

        match result {
            Ok(()) => Ok(HandleOutcome::Handled),
            Err(AtelierError::GitRepo { .. }) => {
                // Both directions failed: surface the divergence notice.
                let notices = self.get_notices().await;
                if crate::messages::is_pause_necessary(&notices) {
                    Ok(HandleOutcome::Paused(notices))
                } else {
                    Err(AtelierError::GitRepo {
                        branch: Some(self.branch_name.clone()),
                        stderr: "head sync failed in both directions".to_string(),
                    })
                }
            }
            Err(other) => Err(other),
        }
    }

    fn track_event_and_report_if_watcher_suspicious(&mut self) {
        self.events_since_last_change += 1;
        if self.is_suspicious_watcher_reported
            || self.events_since_last_change < SUSPICIOUS_EVENTS_WITHOUT_CHANGE
        {
            return;
        }
        error!(
            "too many ref watch events without a content change ({})",
            self.events_since_last_change
        );
        self.is_suspicious_watcher_reported = true;
    }

    fn fallback_to_cache(&mut self, path: &Path, content: Option<String>) -> String {
        match content {
            None => {
                trace!("ref file missing (hopefully temporarily) at {:?}", path);
                self.last_seen_contents.get(path).cloned().unwrap_or_default()
            }
            Some(content) => {
                let content = content.trim().to_string();
                if self.last_seen_contents.get(path) != Some(&content) {
                    self.last_seen_contents.insert(path.to_path_buf(), content.clone());
                    self.events_since_last_change = 0;
                }
                content
            }
        }
    }
}

#[async_trait::async_trait]
impl Reconciler for BranchSyncReconciler {
    fn tag(&self) -> &str {
        LOCAL_GIT_SYNC_TAG
    }

    fn dirs_to_watch(&self) -> Vec<PathBuf> {
        let user_refs_dir = self
            .user_repo_path
            .join(".git")
            .join("refs")
            .join("heads");
        let agent_refs_dir = self
            .agent_ref_host_path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.agent_workspace_host_path());
        vec![user_refs_dir, agent_refs_dir]
    }

    async fn is_relevant_subpath(&mut self, path: &Path) -> bool {
        let user_ref = self.user_ref_path().await;
        let agent_ref = self.agent_ref_host_path();
        if path != user_ref && path != agent_ref {
            return false;
        }
        // Only react when the two refs actually diverge; plain watcher
        // noise (touches, re-writes of the same hash) is dropped here.
        let user_content = tokio::fs::read_to_string(&user_ref).await.ok();
        let agent_content = tokio::fs::read_to_string(&agent_ref).await.ok();
        let user_content = self.fallback_to_cache(&user_ref, user_content);
        let agent_content = self.fallback_to_cache(&agent_ref, agent_content);
        if user_content == agent_content {
            self.track_event_and_report_if_watcher_suspicious();
            trace!(
                "ignoring ref event without divergence ({} events since change)",
                self.events_since_last_change
            );
            return false;
        }
        true
    }

    async fn get_notices(&mut self) -> Vec<LocalSyncNotice> {
        if let Some(notice) = self.notice_if_ref_files_missing().await {
            return vec![notice];
        }
        match self.is_currently_easily_syncable().await {
            Ok(true) => vec![],
            Ok(false) => {
                let local_head = self.user_head().await.unwrap_or_default();
                let agent_head = self.agent_head().await.unwrap_or_default();
                vec![LocalSyncNotice::Pause {
                    source_tag: LOCAL_GIT_SYNC_TAG.to_string(),
                    reason: format!(
                        "local head@{} and agent head@{} require manual merging",
                        &local_head[..local_head.len().min(8)],
                        &agent_head[..agent_head.len().min(8)],
                    ),
                }]
            }
            Err(e) => vec![LocalSyncNotice::Pause {
                source_tag: LOCAL_GIT_SYNC_TAG.to_string(),
                reason: format!("cannot inspect branch state: {e}"),
            }],
        }
    }

    async fn handle_path_changes(&mut self, paths: &[PathBuf]) -> Result<HandleOutcome> {
        let Some(first) = paths.first() else {
            return Ok(HandleOutcome::Handled);
        };
        let first = first.clone();
        self.sync_heads(&first).await
    }
}
