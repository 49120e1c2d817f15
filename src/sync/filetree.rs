//! The filetree reconciler: two-way file sync between the user's working
//! tree and the agent's, with the user winning conflicts, guarded against
//! unsafe git states.

use super::mutagen::{self, MutagenSession};
use super::scheduler::{HandleOutcome, Reconciler};
use crate::git;
use crate::messages::LocalSyncNotice;
use crate::Result;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{debug, info, trace};

pub const LOCAL_FILESYNC_TAG: &str = "local_filetree_sync";
pub const LOCAL_GIT_STATE_GUARDIAN_TAG: &str = "local_git_state_guardian";

/// Subpaths excluded from filetree sync on both sides, beyond whatever git
/// ignores.
pub const DEFAULT_FILETREE_EXCLUSIONS: &[&str] =
    &[".git/", "node_modules/", ".venv/", "build/", "dist/", ".claude/"];

/// Blocks filetree flushes while the user's repo is in a state where a sync
/// could clobber an in-progress operation. Not foolproof: the user can race
/// us from their own shell.
pub struct GitStateGuardian {
    repo_path: PathBuf,
    branch_name: String,
}

impl GitStateGuardian {
    pub fn new(repo_path: PathBuf, branch_name: impl Into<String>) -> Self {
        GitStateGuardian {
            repo_path,
            branch_name: branch_name.into(),
        }
    }

    async fn blockers(&self) -> Vec<String> {
        let repo = git::open_local_user_git_repo_for_read(&self.repo_path).await;
        let mut blockers = Vec::new();
        let mut is_in_multi_step_op = false;
        if repo.is_rebase_in_progress() {
            is_in_multi_step_op = true;
            blockers.push("rebase is in progress (finish or abort to resume)".to_string());
        }
        if repo.is_merge_in_progress() {
            is_in_multi_step_op = true;
            blockers.push("merge is in progress (finish or abort to resume)".to_string());
        }
        if repo.is_cherry_pick_in_progress() {
            is_in_multi_step_op = true;
            blockers.push("cherry-pick is in progress (finish or abort to resume)".to_string());
        }

        match repo.get_current_git_branch().await {
            Ok(current) if current == "HEAD" => {
                if !is_in_multi_step_op {
                    blockers.push(format!(
                        "detached HEAD state (switch back to `{}` to resume)",
                        self.branch_name
                    ));
                }
            }
            Ok(current) if current != self.branch_name => {
                blockers.push(format!(
                    "switched to `{current}` (switch back to `{}` to resume)",
                    self.branch_name
                ));
            }
            Ok(_) => {}
            Err(e) => blockers.push(format!("cannot determine current branch: {e}")),
        }
        blockers
    }

    pub async fn get_notices(&self) -> Vec<LocalSyncNotice> {
        self.blockers()
            .await
            .into_iter()
            .map(|reason| LocalSyncNotice::Pause {
                source_tag: LOCAL_GIT_STATE_GUARDIAN_TAG.to_string(),
                reason: format!("cannot sync filetree while {reason}"),
            })
            .collect()
    }
}

/// Runs a mutagen session between the two working trees.
///
/// Both endpoints are watched, so each flush triggers another (empty)
/// batch; that echo settles after one quiet debounce window.
pub struct FiletreeSyncReconciler {
    session: MutagenSession,
    guardian: GitStateGuardian,
    excluded_absolute_paths: Vec<PathBuf>,
    root_paths: Vec<PathBuf>,
    stop: watch::Receiver<bool>,
}

impl FiletreeSyncReconciler {
    pub fn new(
        session: MutagenSession,
        guardian: GitStateGuardian,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let root_paths = vec![session.local.clone(), session.remote_path()];
        let excluded_absolute_paths = DEFAULT_FILETREE_EXCLUSIONS
            .iter()
            .flat_map(|subpath| {
                let subpath = subpath.trim_end_matches('/');
                root_paths.iter().map(move |root| root.join(subpath))
            })
            .collect();
        FiletreeSyncReconciler {
            session,
            guardian,
            excluded_absolute_paths,
            root_paths,
            stop,
        }
    }

    /// The mutagen session is ours, so if its daemon dies mid-flush we
    /// recreate the session and flush once more before giving up.
    async fn flush_with_resurrection_if_dead(&mut self) -> Result<()> {
        match self.session.flush().await {
            Ok(()) => Ok(()),
            Err(e) => {
                if *self.stop.borrow() {
                    // Shutdown races the daemon teardown; the top level has
                    // taken control.
                    debug!("flush failed during shutdown: {}", e);
                    return Ok(());
                }
                info!("mutagen flush failed: {}", e);
                if mutagen::is_session_running(&self.session.name).await {
                    // Nothing killed the session yet the flush failed:
                    // undefined state, let it surface.
                    return Err(e);
                }
                // Something external killed the daemon; boot it back up.
                self.session.create().await?;
                self.session.flush().await
            }
        }
    }
}

#[async_trait::async_trait]
impl Reconciler for FiletreeSyncReconciler {
    fn tag(&self) -> &str {
        LOCAL_FILESYNC_TAG
    }

    fn dirs_to_watch(&self) -> Vec<PathBuf> {
        self.root_paths.clone()
    }

    async fn is_relevant_subpath(&mut self, path: &Path) -> bool {
        // Events on the roots themselves always accompany nested events.
        if self.root_paths.iter().any(|root| root == path) {
            trace!("ignoring root directory event: {:?}", path);
            return false;
        }
        if !self.root_paths.iter().any(|root| path.starts_with(root)) {
            return false;
        }
        !self
            .excluded_absolute_paths
            .iter()
            .any(|excluded| path.starts_with(excluded))
    }

    async fn get_notices(&mut self) -> Vec<LocalSyncNotice> {
        self.guardian.get_notices().await
    }

    async fn handle_path_changes(&mut self, _paths: &[PathBuf]) -> Result<HandleOutcome> {
        let notices = self.guardian.get_notices().await;
        if !notices.is_empty() {
            return Ok(HandleOutcome::Paused(notices));
        }
        self.flush_with_resurrection_if_dead().await?;
        Ok(HandleOutcome::Handled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::mutagen::SyncMode;

    async fn init_repo(path: &Path) {
        std::fs::create_dir_all(path).unwrap();
        for args in [
            vec!["init", "--initial-branch=main"],
            vec!["config", "user.email", "t@example.com"],
            vec!["config", "user.name", "t"],
        ] {
            let output = tokio::process::Command::new("git")
                .arg("-C")
                .arg(path)
                .args(&args)
                .output()
                .await
                .unwrap();
            assert!(output.status.success());
        }
        std::fs::write(path.join("README.md"), "hi\n").unwrap();
        let output = tokio::process::Command::new("git")
            .arg("-C")
            .arg(path)
            .args(["add", "."])
            .output()
            .await
            .unwrap();
        assert!(output.status.success());
        let output = tokio::process::Command::new("git")
            .arg("-C")
            .arg(path)
            .args(["commit", "-m", "initial"])
            .output()
            .await
            .unwrap();
        assert!(output.status.success());
    }

    #[tokio::test]
    async fn test_guardian_passes_clean_repo() {
        let temp = tempfile::tempdir().unwrap();
        init_repo(temp.path()).await;
        let guardian = GitStateGuardian::new(temp.path().to_path_buf(), "main");
        assert!(guardian.get_notices().await.is_empty());
    }

    #[tokio::test]
    async fn test_guardian_pauses_on_rebase_in_progress() {
        let temp = tempfile::tempdir().unwrap();
        init_repo(temp.path()).await;
        std::fs::create_dir_all(temp.path().join(".git").join("rebase-merge")).unwrap();

        let guardian = GitStateGuardian::new(temp.path().to_path_buf(), "main");
        let notices = guardian.get_notices().await;
        assert_eq!(notices.len(), 1);
        match &notices[0] {
            LocalSyncNotice::Pause { reason, source_tag } => {
                assert!(reason.contains("rebase is in progress"));
                assert_eq!(source_tag, LOCAL_GIT_STATE_GUARDIAN_TAG);
            }
            other => panic!("expected pause notice, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_guardian_pauses_on_wrong_branch() {
        let temp = tempfile::tempdir().unwrap();
        init_repo(temp.path()).await;
        let output = tokio::process::Command::new("git")
            .arg("-C")
            .arg(temp.path())
            .args(["checkout", "-b", "other"])
            .output()
            .await
            .unwrap();
        assert!(output.status.success());

        let guardian = GitStateGuardian::new(temp.path().to_path_buf(), "main");
        let notices = guardian.get_notices().await;
        assert_eq!(notices.len(), 1);
        assert!(matches!(
            &notices[0],
            LocalSyncNotice::Pause { reason, .. } if reason.contains("switched to `other`")
        ));
    }

    #[tokio::test]
    async fn test_guardian_pauses_on_detached_head() {
        let temp = tempfile::tempdir().unwrap();
        init_repo(temp.path()).await;
        let head = tokio::process::Command::new("git")
            .arg("-C")
            .arg(temp.path())
            .args(["rev-parse", "HEAD"])
            .output()
            .await
            .unwrap();
        let head = String::from_utf8_lossy(&head.stdout).trim().to_string();
        let output = tokio::process::Command::new("git")
            .arg("-C")
            .arg(temp.path())
            .args(["checkout", &head])
            .output()
            .await
            .unwrap();
        assert!(output.status.success());

        let guardian = GitStateGuardian::new(temp.path().to_path_buf(), "main");
        let notices = guardian.get_notices().await;
        assert!(matches!(
            &notices[0],
            LocalSyncNotice::Pause { reason, .. } if reason.contains("detached HEAD")
        ));
    }

    #[tokio::test]
    async fn test_reconciler_filters_excluded_subpaths() {
        let temp = tempfile::tempdir().unwrap();
        init_repo(temp.path()).await;
        let local = temp.path().to_path_buf();
        let remote = temp.path().join("remote");
        std::fs::create_dir_all(&remote).unwrap();

        let session = MutagenSession::new(
            "atelier-test-session",
            local.clone(),
            remote.to_string_lossy().into_owned(),
            SyncMode::BidirectionalUserWins,
            vec![],
        );
        let guardian = GitStateGuardian::new(local.clone(), "main");
        let (_stop_tx, stop_rx) = watch::channel(false);
        let mut reconciler = FiletreeSyncReconciler::new(session, guardian, stop_rx);

        assert!(reconciler.is_relevant_subpath(&local.join("src/main.rs")).await);
        assert!(!reconciler.is_relevant_subpath(&local.join(".git/index")).await);
        assert!(
            !reconciler
                .is_relevant_subpath(&local.join("node_modules/pkg/index.js"))
                .await
        );
        assert!(!reconciler.is_relevant_subpath(&local).await);
        assert!(!reconciler.is_relevant_subpath(Path::new("/outside/file")).await);
        assert!(reconciler.is_relevant_subpath(&remote.join("lib.rs")).await);
    }

    #[tokio::test]
    async fn test_handle_pauses_instead_of_flushing_during_rebase() {
        let temp = tempfile::tempdir().unwrap();
        init_repo(temp.path()).await;
        std::fs::create_dir_all(temp.path().join(".git").join("rebase-merge")).unwrap();

        let local = temp.path().to_path_buf();
        let session = MutagenSession::new(
            "atelier-test-pause",
            local.clone(),
            "/nonexistent-remote",
            SyncMode::BidirectionalUserWins,
            vec![],
        );
        let guardian = GitStateGuardian::new(local.clone(), "main");
        let (_stop_tx, stop_rx) = watch::channel(false);
        let mut reconciler = FiletreeSyncReconciler::new(session, guardian, stop_rx);

        // Exactly one pause notice naming the rebase; no flush is
        // attempted (a flush against the dead session name would error).
        let outcome = reconciler
            .handle_path_changes(&[local.join("file.txt")])
            .await
            .unwrap();
        match outcome {
            HandleOutcome::Paused(notices) => {
                assert_eq!(notices.len(), 1);
                assert!(matches!(
                    &notices[0],
                    LocalSyncNotice::Pause { reason, .. } if reason.contains("rebase is in progress")
                ));
            }
            HandleOutcome::Handled => panic!("expected a pause"),
        }
    }
}
