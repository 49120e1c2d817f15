//! The git-repo service: all access to the user's local repository goes
//! through here.
//!
//! A process-global read/write lock keyed by canonical repository path
//! serializes our own access. These locks do NOT protect against the user's
//! shell running git commands concurrently; that race is tolerated.

use crate::{AtelierError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::process::Command;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;


static REPO_LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>> = OnceLock::new();

fn lock_for_path(path: &Path) -> Arc<RwLock<()>> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let locks = REPO_LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    locks
        .lock()
        .entry(canonical)
        .or_insert_with(|| Arc::new(RwLock::new(())))
        .clone()
}

/// Counts of changed files in a working directory.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GitRepoFileStatus {
    pub unstaged: usize,
    pub staged: usize,
    pub untracked: usize,
    pub deleted: usize,
    pub ignored: usize,
}

impl GitRepoFileStatus {
    pub fn are_clean_including_untracked(&self) -> bool {
        self.unstaged == 0 && self.staged == 0 && self.deleted == 0 && self.untracked == 0
    }
}

/// Current status of a git repository: file counts plus whether a
/// multi-step operation is in flight.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GitRepoStatus {
    pub files: GitRepoFileStatus,
    pub is_merging: bool,
    pub is_rebasing: bool,
    pub is_cherry_picking: bool,
}

impl GitRepoStatus {
    pub fn is_in_intermediate_state(&self) -> bool {
        self.is_merging || self.is_rebasing || self.is_cherry_picking
    }

    pub fn is_clean_and_safe_to_operate_on(&self) -> bool {
        self.files.are_clean_including_untracked() && !self.is_in_intermediate_state()
    }
}

/// Handle over one local repository. Constructed only through
/// [`open_local_user_git_repo_for_read`] / [`open_local_user_git_repo_for_write`]
/// so every use is covered by the path lock the guard carries.
pub struct LocalGitRepo {
    repo_path: PathBuf,
}

/// Read access to a repo; holds a shared lock for its lifetime.
pub struct GitRepoReadGuard {
    repo: LocalGitRepo,
    _guard: OwnedRwLockReadGuard<()>,
}

impl std::ops::Deref for GitRepoReadGuard {
    type Target = LocalGitRepo;
    fn deref(&self) -> &LocalGitRepo {
        &self.repo
    }
}

/// Write access to a repo; holds the exclusive lock for its lifetime.
pub struct GitRepoWriteGuard {
    repo: LocalGitRepo,
    _guard: OwnedRwLockWriteGuard<()>,
}

impl std::ops::Deref for GitRepoWriteGuard {
    type Target = LocalGitRepo;
    fn deref(&self) -> &LocalGitRepo {
        &self.repo
    }
}

pub async fn open_local_user_git_repo_for_read(repo_path: &Path) -> GitRepoReadGuard {
    let guard = lock_for_path(repo_path).read_owned().await;
    GitRepoReadGuard {
        repo: LocalGitRepo {
            repo_path: repo_path.to_path_buf(),
        },
        _guard: guard,
    }
}

pub async fn open_local_user_git_repo_for_write(repo_path: &Path) -> GitRepoWriteGuard {
    let guard = lock_for_path(repo_path).write_owned().await;
    GitRepoWriteGuard {
        repo: LocalGitRepo {
            repo_path: repo_path.to_path_buf(),
        },
        _guard: guard,
    }
}

/// Create or refresh a bare mirror of a repository.
///
/// The periodic repo-cache task keeps one mirror per project so images can
/// be built from it without touching the user's working copy. The mirror
/// path is guarded by the same path-keyed lock as any other repo.
pub async fn mirror_repository(source_url: &str, mirror_path: &Path) -> Result<()> {
    let lock = lock_for_path(mirror_path);
    let _guard = lock.write_owned().await;

    let output = if mirror_path.join("HEAD").exists() {
        debug!("refreshing repo mirror at {:?}", mirror_path);
        Command::new("git")
            .arg("-C")
            .arg(mirror_path)
            .args(["fetch", "--prune", "origin"])
            .output()
            .await?
    } else {
        if let Some(parent) = mirror_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        debug!("creating repo mirror at {:?}", mirror_path);
        Command::new("git")
            .args(["clone", "--mirror", source_url])
            .arg(mirror_path)
            .output()
            .await?
    };
    if !output.status.success() {
        return Err(AtelierError::GitRepo {
            branch: None,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

impl LocalGitRepo {
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn repo_url(&self) -> Result<url::Url> {
        url::Url::from_file_path(&self.repo_path)
            .map_err(|_| AtelierError::Validation(format!("non-absolute repo path: {:?}", self.repo_path)))
    }

    async fn run_git(&self, args: &[&str]) -> Result<String> {
        self.run_git_with_branch_context(args, None).await
    }

    async fn run_git_with_branch_context(
        &self,
        args: &[&str],
        branch: Option<&str>,
    ) -> Result<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo_path)
            .args(args)
            .output()
            .await?;
        if !output.status.success() {
            return Err(AtelierError::GitRepo {
                branch: branch.map(str::to_string),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub async fn is_bare_repo(&self) -> bool {
        matches!(
            self.run_git(&["rev-parse", "--is-bare-repository"]).await,
            Ok(output) if output.trim() == "true"
        )
    }

    fn git_dir(&self) -> PathBuf {
        let dotgit = self.repo_path.join(".git");
        if dotgit.is_dir() {
            dotgit
        } else {
            self.repo_path.clone()
        }
    }

    /// Directory holding branch head pointer files.
    pub fn head_refs_dir(&self) -> PathBuf {
        self.git_dir().join("refs").join("heads")
    }

    /// The pointer file of one branch's head ref.
    pub fn head_ref_path(&self, branch_name: &str) -> PathBuf {
        self.head_refs_dir().join(branch_name)
    }

    pub async fn get_current_git_branch(&self) -> Result<String> {
        Ok(self
            .run_git(&["rev-parse", "--abbrev-ref", "HEAD"])
            .await?
            .trim()
            .to_string())
    }

    pub async fn get_current_commit_hash(&self) -> Result<String> {
        Ok(self.run_git(&["rev-parse", "HEAD"]).await?.trim().to_string())
    }

    pub async fn get_branch_head_commit_hash(&self, branch_name: &str) -> Result<String> {
        Ok(self
            .run_git_with_branch_context(
                &["rev-parse", &format!("refs/heads/{branch_name}")],
                Some(branch_name),
            )
            .await?
            .trim()
            .to_string())
    }

    /// Whether `commit` is an ancestor of the branch head ("the branch is a
    /// child of the commit").
    pub async fn is_branch_child_of(&self, branch_name: &str, commit: &str) -> bool {
        self.run_git_with_branch_context(
            &["merge-base", "--is-ancestor", commit, &format!("refs/heads/{branch_name}")],
            Some(branch_name),
        )
        .await
        .is_ok()
    }

    /// Fetch a refspec from a remote. `--show-forced-updates` is always
    /// displayed; `--update-head-ok` only when the caller knows the sync
    /// branch is checked out and intends the head to move.
    pub async fn fetch(
        &self,
        remote: &str,
        refspec: &str,
        dangerously_update_head: bool,
    ) -> Result<()> {
        let mut args = vec!["fetch", "--show-forced-updates"];
        if dangerously_update_head {
            args.push("--update-head-ok");
        }
        args.push(remote);
        args.push(refspec);
        self.run_git(&args).await?;
        Ok(())
    }

    /// `reset --mixed` to a ref, keeping working-tree changes.
    pub async fn reset_mixed(&self, reference: &str) -> Result<()> {
        self.run_git(&["reset", "--mixed", reference]).await?;
        Ok(())
    }

    pub async fn delete_branch(&self, branch_name: &str) -> Result<()> {
        self.run_git_with_branch_context(&["branch", "-D", branch_name], Some(branch_name))
            .await?;
        Ok(())
    }

    /// Make sure a local ref for the remote branch exists, fetching it when
    /// missing.
    pub async fn ensure_local_branch_has_remote_branch_ref(
        &self,
        remote_url: &str,
        branch_name: &str,
    ) -> Result<()> {
        if self.get_branch_head_commit_hash(branch_name).await.is_ok() {
            return Ok(());
        }
        debug!("fetching missing local ref for {branch_name} from {remote_url}");
        self.fetch(
            remote_url,
            &format!("refs/heads/{branch_name}:refs/heads/{branch_name}"),
            false,
        )
        .await
    }

    pub async fn git_checkout_branch(&self, branch_name: &str) -> Result<()> {
        self.run_git_with_branch_context(&["checkout", branch_name], Some(branch_name))
            .await?;
        Ok(())
    }

    pub async fn create_git_stash(&self, stash_message: &str) -> Result<bool> {
        let output = self
            .run_git(&["stash", "push", "--include-untracked", "-m", stash_message])
            .await?;
        Ok(!output.contains("No local changes to save"))
    }

    pub async fn restore_git_stash(&self, stash_message: &str) -> Result<()> {
        let list = self.run_git(&["stash", "list"]).await?;
        let entry = list
            .lines()
            .find(|line| line.contains(stash_message))
            .ok_or_else(|| AtelierError::GitRepo {
                branch: None,
                stderr: format!("no stash entry matching {stash_message:?}"),
            })?;
        let reference = entry.split(':').next().unwrap_or("stash@{0}");
        self.run_git(&["stash", "pop", reference]).await?;
        Ok(())
    }

    pub fn is_rebase_in_progress(&self) -> bool {
        let git_dir = self.git_dir();
        git_dir.join("rebase-merge").exists() || git_dir.join("rebase-apply").exists()
    }

    pub fn is_merge_in_progress(&self) -> bool {
        self.git_dir().join("MERGE_HEAD").exists()
    }

    pub fn is_cherry_pick_in_progress(&self) -> bool {
        self.git_dir().join("CHERRY_PICK_HEAD").exists()
    }

    /// Patterns matched by `git status --ignored`, for the filetree sync
    /// exclusion list.
    pub async fn get_ignored_paths(&self) -> Result<Vec<String>> {
        let output = self
            .run_git(&["status", "--porcelain", "--ignored=matching"])
            .await?;
        Ok(output
            .lines()
            .filter(|line| line.starts_with("!!"))
            .map(|line| line[3..].trim().to_string())
            .collect())
    }

    pub async fn get_current_status(&self) -> Result<GitRepoStatus> {
        let output = self
            .run_git(&["status", "--porcelain", "--ignored=matching"])
            .await?;
        let mut files = GitRepoFileStatus {
            unstaged: 0,
            staged: 0,
            untracked: 0,
            deleted: 0,
            ignored: 0,
        };
        for line in output.lines() {
            if line.len() < 2 {
                continue;
            }
            let index = line.as_bytes()[0] as char;
            let worktree = line.as_bytes()[1] as char;
            match (index, worktree) {
                ('?', '?') => files.untracked += 1,
                ('!', '!') => files.ignored += 1,
                _ => {
                    if index == 'D' || worktree == 'D' {
                        files.deleted += 1;
                    }
                    if index != ' ' && index != 'D' {
                        files.staged += 1;
                    }
                    if worktree != ' ' && worktree != 'D' {
                        files.unstaged += 1;
                    }
                }
            }
        }
        Ok(GitRepoStatus {
            files,
            is_merging: self.is_merge_in_progress(),
            is_rebasing: self.is_rebase_in_progress(),
            is_cherry_picking: self.is_cherry_pick_in_progress(),
        })
    }
}
