//! Tracks file changes made by agent tools and computes unified diffs.
//!
//! The tracker keeps an in-memory snapshot of the last observed content per
//! file and asks git itself to produce each diff, so the output is
//! byte-for-byte what `git diff --no-index --binary` emits, with the
//! temp-file paths rewritten to the environment-relative path.

use crate::env::{Environment, ProcessSpec};
use crate::{AtelierError, Result};
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

#[cfg(test)]
mod tests;

/// Tools whose results carry a file edit worth diffing.
pub const FILE_CHANGE_TOOL_NAMES: &[&str] = &["Write", "Edit", "MultiEdit"];

const GIT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// File content as observed from the environment; binary when the bytes are
/// not valid UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    Text(String),
    Binary(Vec<u8>),
}

impl FileContent {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => FileContent::Text(text),
            Err(err) => FileContent::Binary(err.into_bytes()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            FileContent::Text(text) => text.as_bytes(),
            FileContent::Binary(bytes) => bytes,
        }
    }
}

impl From<&str> for FileContent {
    fn from(value: &str) -> Self {
        FileContent::Text(value.to_string())
    }
}

/// Tracks file changes and computes diffs using in-memory snapshots.
pub struct DiffTracker {
    environment: Arc<dyn Environment>,
    /// Last observed content per environment path; `None` records a file
    /// known to be absent from the initial tree.
    file_snapshot_by_path: HashMap<String, Option<FileContent>>,
    initial_tree_sha: Option<String>,
}

impl DiffTracker {
    pub fn new(environment: Arc<dyn Environment>, initial_tree_sha: Option<String>) -> Self {
        DiffTracker {
            environment,
            file_snapshot_by_path: HashMap::new(),
            initial_tree_sha,
        }
    }

    /// Update the initial git tree SHA and clear snapshots.
    pub fn update_initial_tree_sha(&mut self, new_tree_sha: String) {
        debug!("updated initial_tree_sha to {}, clearing file snapshots", new_tree_sha);
        self.initial_tree_sha = Some(new_tree_sha);
        self.file_snapshot_by_path.clear();
    }

    /// Compute the diff for one tool invocation, then update the snapshot.
    ///
    /// Returns `None` for tools that do not edit files, for files outside
    /// the workspace, and for absent files (deletions are not reported).
    pub async fn compute_diff_for_tool(
        &mut self,
        tool_name: &str,
        tool_input: &serde_json::Value,
    ) -> Option<String> {
        if !FILE_CHANGE_TOOL_NAMES.contains(&tool_name) {
            return None;
        }
        let file_path = tool_input.get("file_path")?.as_str()?;
        if file_path.is_empty() {
            return None;
        }
        // The agent emits absolute host paths; convert to an
        // environment-relative path before tracking.
        let env_path = self
            .environment
            .to_environment_path(Path::new(file_path))
            .to_string_lossy()
            .into_owned();
        self.compute_diff_for_file_path(&env_path).await
    }

    async fn compute_diff_for_file_path(&mut self, file_path: &str) -> Option<String> {
        if !self.environment.exists(file_path).await {
            debug!("file {} does not exist, skipping diff", file_path);
            return None;
        }
        let workspace = self.environment.get_workspace_path();
        if !Path::new(file_path).starts_with(&workspace) {
            debug!("file {} is outside workspace, skipping diff", file_path);
            return None;
        }

        let old_content = self.get_file_snapshot(file_path).await;
        let new_content = match self.environment.read_file_bytes(file_path).await {
            Ok(bytes) => FileContent::from_bytes(bytes),
            Err(e) => {
                warn!("failed to read {} for diff: {}", file_path, e);
                return None;
            }
        };

        let diff = match create_unified_diff(file_path, old_content.as_ref(), &new_content) {
            Ok(diff) => diff,
            Err(e) => {
                warn!("failed to compute diff for {}: {}", file_path, e);
                return None;
            }
        };

        // TODO: this cache can race: another process mutating the file
        // between the read above and here leaves the next diff computed
        // against a stale baseline.
        self.file_snapshot_by_path
            .insert(file_path.to_string(), Some(new_content));
        diff
    }

    /// The most recent snapshot of a file, falling back to the initial git
    /// tree, else `None` (the file is new).
    async fn get_file_snapshot(&self, file_path: &str) -> Option<FileContent> {
        if let Some(snapshot) = self.file_snapshot_by_path.get(file_path) {
            return snapshot.clone();
        }
        if self.initial_tree_sha.is_some() {
            return self.get_file_from_git_tree(file_path).await;
        }
        None
    }

    async fn get_file_from_git_tree(&self, file_path: &str) -> Option<FileContent> {
        let tree_sha = self.initial_tree_sha.as_deref()?;
        let workspace = self.environment.get_workspace_path();
        let relative = match Path::new(file_path).strip_prefix(&workspace) {
            Ok(relative) => relative.to_string_lossy().into_owned(),
            Err(_) => {
                error!(
                    "file path {} is not under the workspace path {}",
                    file_path,
                    workspace.display()
                );
                return None;
            }
        };

        if !self.is_file_present_at_commit(tree_sha, &relative).await {
            return None;
        }

        let output = self
            .run_git_in_environment(vec![
                "git".to_string(),
                "show".to_string(),
                format!("{tree_sha}:{relative}"),
            ])
            .await?;
        Some(FileContent::Text(output.trim().to_string()))
    }

    async fn is_file_present_at_commit(&self, tree_sha: &str, relative: &str) -> bool {
        match self
            .run_git_in_environment(vec![
                "git".to_string(),
                "ls-tree".to_string(),
                tree_sha.to_string(),
                "--".to_string(),
                relative.to_string(),
            ])
            .await
        {
            Some(stdout) => !stdout.trim().is_empty(),
            None => false,
        }
    }

    async fn run_git_in_environment(&self, command: Vec<String>) -> Option<String> {
        let workspace = self.environment.get_workspace_path();
        let spec = ProcessSpec::new(command.clone())
            .with_cwd(workspace.to_string_lossy().into_owned())
            .with_timeout(GIT_QUERY_TIMEOUT);
        match self.environment.run_process_to_completion(spec).await {
            Ok(process) => Some(process.read_stdout()),
            Err(e) => {
                warn!("git command {:?} failed: {}", command, e);
                None
            }
        }
    }
}

/// Create a unified diff between old and new content using git itself.
///
/// Handles file creation (`old_content` is `None`), both text and binary
/// content, and rewrites the scratch-file paths in the output to the actual
/// path. Returns `Some("")` when old and new are identical, and `None` when
/// git produced no output.
pub fn create_unified_diff(
    filepath: &str,
    old_content: Option<&FileContent>,
    new_content: &FileContent,
) -> Result<Option<String>> {
    if old_content == Some(new_content) {
        return Ok(Some(String::new()));
    }

    let old_dir = tempfile::tempdir()?;
    let new_dir = tempfile::tempdir()?;

    // Same generated basename on both sides so git pairs the files.
    let temp_filename = uuid::Uuid::new_v4().simple().to_string();
    let old_path = old_dir.path().join(&temp_filename);
    let new_path = new_dir.path().join(&temp_filename);

    if let Some(old) = old_content {
        std::fs::write(&old_path, old.as_bytes())?;
    }
    std::fs::write(&new_path, new_content.as_bytes())?;

    let output = Command::new("git")
        .args(["diff", "--no-index", "--binary"])
        .arg(old_dir.path())
        .arg(new_dir.path())
        .output()?;
    let returncode = output.status.code().unwrap_or(-1);

    // 0 = no diff, 1 = diff found; anything else is a real failure.
    if returncode != 0 && returncode != 1 {
        return Err(AtelierError::GitCommandFailure {
            message: format!("git diff returned unexpected code {returncode}"),
            returncode,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    let mut diff = String::from_utf8_lossy(&output.stdout).into_owned();

    let old_path_in_diff = format!("{}/{}", old_dir.path().to_string_lossy(), temp_filename);
    let new_path_in_diff = format!("{}/{}", new_dir.path().to_string_lossy(), temp_filename);
    let actual_path = if filepath.starts_with('/') {
        filepath.to_string()
    } else {
        format!("/{filepath}")
    };

    // The `diff --git` header has two spellings: creation spells the new
    // path twice, modification spells old then new. The temp paths are
    // absolute, so git concatenates them to a/b without adding a slash.
    if old_content.is_none() {
        diff = diff.replace(
            &format!("diff --git a{new_path_in_diff} b{new_path_in_diff}"),
            &format!("diff --git a{actual_path} b{actual_path}"),
        );
    } else {
        diff = diff.replace(
            &format!("diff --git a{old_path_in_diff} b{new_path_in_diff}"),
            &format!("diff --git a{actual_path} b{actual_path}"),
        );
    }
    diff = diff.replace(
        &format!("--- a{old_path_in_diff}"),
        &format!("--- a{actual_path}"),
    );
    diff = diff.replace(
        &format!("+++ b{new_path_in_diff}"),
        &format!("+++ b{actual_path}"),
    );
    // /dev/null stays verbatim for creation and deletion.

    if diff.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(diff))
}
