//! The local provider: a bare filesystem environment under one directory
//! prefix. This is the simplest provider and the reference implementation of
//! the [`Environment`](super::Environment) trait; container providers follow
//! the same contract.

use super::{
    crashed, zeroed_server_port_by_name, Environment, EnvironmentSpec, ImageSpec, ProcessSpec,
    RunningProcess,
};
use crate::constants::TERMINAL_SERVER_NAME;
use crate::ids::{ImageId, ProjectId};
use crate::{AtelierError, Result};
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};
use url::Url;

/// The agent's working tree inside any environment.
pub const WORKSPACE_DIRECTORY: &str = "/code";

pub struct LocalEnvironment {
    environment_id: String,
    project_id: ProjectId,
    config: EnvironmentSpec,
    /// Host directory acting as the environment's root filesystem.
    root_prefix: PathBuf,
    /// Where snapshots (directory "images") are materialized.
    snapshot_dir: PathBuf,
    /// Host-side ephemeral port per declared service.
    bound_port_by_name: HashMap<String, u16>,
    /// Per-environment auth token for the terminal proxy. Generated once,
    /// never persisted; checked on both a query parameter and a cookie so
    /// iframe embedding works.
    terminal_auth_token: String,
    is_alive: AtomicBool,
}

impl LocalEnvironment {
    pub fn new(
        environment_id: impl Into<String>,
        project_id: ProjectId,
        root_prefix: PathBuf,
        snapshot_dir: PathBuf,
    ) -> Result<Self> {
        let environment_id = environment_id.into();
        std::fs::create_dir_all(root_prefix.join(WORKSPACE_DIRECTORY.trim_start_matches('/')))?;
        std::fs::create_dir_all(&snapshot_dir)?;

        let config = EnvironmentSpec::LocalEnvironmentConfig {
            server_port_by_name: zeroed_server_port_by_name(),
        };
        let bound_port_by_name = config
            .server_port_by_name()
            .keys()
            .map(|name| Ok((name.clone(), reserve_ephemeral_port()?)))
            .collect::<Result<HashMap<_, _>>>()?;

        let terminal_auth_token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(48)
            .map(char::from)
            .collect();

        info!(environment_id = %environment_id, "created local environment");
        Ok(LocalEnvironment {
            environment_id,
            project_id,
            config,
            root_prefix,
            snapshot_dir,
            bound_port_by_name,
            terminal_auth_token,
            is_alive: AtomicBool::new(true),
        })
    }

    /// The per-environment terminal proxy token.
    pub fn terminal_auth_token(&self) -> &str {
        &self.terminal_auth_token
    }

    fn host_path(&self, path: &str) -> PathBuf {
        self.to_host_path(Path::new(path))
    }

    fn ensure_alive(&self) -> Result<()> {
        if !self.is_alive() {
            return Err(AtelierError::environment_crashed(format!(
                "environment {} is closed",
                self.environment_id
            )));
        }
        Ok(())
    }
}

fn reserve_ephemeral_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

#[async_trait]
impl Environment for LocalEnvironment {
    fn environment_id(&self) -> &str {
        &self.environment_id
    }

    fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    fn config(&self) -> &EnvironmentSpec {
        &self.config
    }

    fn get_root_path(&self) -> PathBuf {
        PathBuf::from("/")
    }

    fn get_workspace_path(&self) -> PathBuf {
        PathBuf::from(WORKSPACE_DIRECTORY)
    }

    fn to_host_path(&self, path: &Path) -> PathBuf {
        match path.strip_prefix("/") {
            Ok(relative) => self.root_prefix.join(relative),
            Err(_) => self.root_prefix.join(path),
        }
    }

    fn to_environment_path(&self, path: &Path) -> PathBuf {
        match path.strip_prefix(&self.root_prefix) {
            Ok(relative) => Path::new("/").join(relative),
            Err(_) => path.to_path_buf(),
        }
    }

    async fn run_process_in_background(&self, mut spec: ProcessSpec) -> Result<RunningProcess> {
        self.ensure_alive()?;
        let cwd = spec
            .cwd
            .as_deref()
            .unwrap_or(WORKSPACE_DIRECTORY)
            .to_string();
        spec.cwd = Some(self.host_path(&cwd).to_string_lossy().into_owned());
        RunningProcess::spawn_local(spec)
    }

    async fn snapshot(&self) -> Result<ImageSpec> {
        self.ensure_alive()?;
        let image_id = ImageId::new();
        let image_path = self.snapshot_dir.join(image_id.to_string());
        // cp -a keeps permissions and symlinks intact, which plain
        // directory-walking copies get wrong for git worktrees.
        let process = RunningProcess::spawn_local(ProcessSpec::new(vec![
            "cp".to_string(),
            "-a".to_string(),
            self.root_prefix.to_string_lossy().into_owned(),
            image_path.to_string_lossy().into_owned(),
        ]))?;
        process.wait().await?;
        debug!(image_id = %image_id, "snapshotted local environment");
        Ok(ImageSpec::LocalImage {
            image_id,
            project_id: self.project_id.clone(),
            image_path,
        })
    }

    async fn persist(&self) -> Result<()> {
        // Local environments live on the host filesystem already.
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::SeqCst)
    }

    async fn exists(&self, path: &str) -> bool {
        tokio::fs::metadata(self.host_path(path)).await.is_ok()
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let host_path = self.host_path(path);
        match tokio::fs::read_to_string(&host_path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AtelierError::FileNotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(crashed("read_file")(e)),
        }
    }

    async fn read_file_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let host_path = self.host_path(path);
        match tokio::fs::read(&host_path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AtelierError::FileNotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(crashed("read_file_bytes")(e)),
        }
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let host_path = self.host_path(path);
        if let Some(parent) = host_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(crashed("write_file"))?;
        }
        tokio::fs::write(&host_path, content)
            .await
            .map_err(crashed("write_file"))
    }

    async fn move_file(&self, original_path: &str, new_path: &str) -> Result<()> {
        let from = self.host_path(original_path);
        let to = self.host_path(new_path);
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(crashed("move_file"))?;
        }
        tokio::fs::rename(&from, &to).await.map_err(crashed("move_file"))
    }

    async fn copy_from_local(
        &self,
        local_path: &Path,
        env_path: &str,
        recursive: bool,
    ) -> Result<()> {
        let metadata = tokio::fs::metadata(local_path).await?;
        if metadata.is_dir() && !recursive {
            return Err(AtelierError::IsADirectory {
                path: local_path.to_string_lossy().into_owned(),
            });
        }
        let destination = self.host_path(env_path);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if metadata.is_dir() {
            copy_tree(local_path, &destination).await
        } else {
            tokio::fs::copy(local_path, &destination).await?;
            Ok(())
        }
    }

    async fn copy_to_local(
        &self,
        env_path: &str,
        local_path: &Path,
        recursive: bool,
    ) -> Result<()> {
        let source = self.host_path(env_path);
        let metadata = tokio::fs::metadata(&source)
            .await
            .map_err(|_| AtelierError::FileNotFound {
                path: env_path.to_string(),
            })?;
        if metadata.is_dir() && !recursive {
            return Err(AtelierError::IsADirectory {
                path: env_path.to_string(),
            });
        }
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if metadata.is_dir() {
            copy_tree(&source, local_path).await
        } else {
            tokio::fs::copy(&source, local_path).await?;
            Ok(())
        }
    }

    fn get_server_url(&self, name: &str) -> Result<Url> {
        let port = self
            .bound_port_by_name
            .get(name)
            .ok_or_else(|| AtelierError::Validation(format!("unknown service: {name}")))?;
        let mut url = Url::parse(&format!("http://127.0.0.1:{port}/"))
            .map_err(|e| AtelierError::Validation(e.to_string()))?;
        if name == TERMINAL_SERVER_NAME {
            url.query_pairs_mut()
                .append_pair("token", &self.terminal_auth_token);
        }
        Ok(url)
    }

    fn get_repo_url(&self) -> Result<Url> {
        let workspace = self.to_host_path(&self.get_workspace_path());
        Url::from_file_path(&workspace)
            .map_err(|_| AtelierError::Validation(format!("non-absolute workspace: {workspace:?}")))
    }

    fn get_repo_url_for_mutagen(&self) -> Result<String> {
        Ok(self
            .to_host_path(&self.get_workspace_path())
            .to_string_lossy()
            .into_owned())
    }

    async fn push_into_environment_repo(
        &self,
        user_repo_path: &Path,
        src_branch: &str,
        dst_branch: &str,
    ) -> Result<()> {
        let repo_url = self.get_repo_url()?;
        let process = RunningProcess::spawn_local(ProcessSpec::new(vec![
            "git".to_string(),
            "-C".to_string(),
            user_repo_path.to_string_lossy().into_owned(),
            "push".to_string(),
            repo_url.to_string(),
            format!("{src_branch}:{dst_branch}"),
        ]))?;
        process.wait().await.map_err(|e| match e {
            AtelierError::Process { stderr, .. } => AtelierError::GitRepo {
                branch: Some(src_branch.to_string()),
                stderr,
            },
            other => other,
        })?;
        Ok(())
    }

    async fn get_file_mtime(&self, path: &str) -> Result<f64> {
        let metadata = tokio::fs::metadata(self.host_path(path))
            .await
            .map_err(|_| AtelierError::FileNotFound {
                path: path.to_string(),
            })?;
        let modified = metadata.modified().map_err(crashed("get_file_mtime"))?;
        let since_epoch = modified
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Ok(since_epoch.as_secs_f64())
    }

    async fn close(&self) -> Result<()> {
        self.is_alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.close().await?;
        if self.root_prefix.exists() {
            tokio::fs::remove_dir_all(&self.root_prefix).await?;
        }
        Ok(())
    }
}

async fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    let process = RunningProcess::spawn_local(ProcessSpec::new(vec![
        "cp".to_string(),
        "-a".to_string(),
        from.to_string_lossy().into_owned(),
        to.to_string_lossy().into_owned(),
    ]))?;
    process.wait().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_env(temp: &tempfile::TempDir) -> LocalEnvironment {
        LocalEnvironment::new(
            "env-test",
            ProjectId::new(),
            temp.path().join("root"),
            temp.path().join("images"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_path_mapping_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let env = make_env(&temp);
        let env_path = Path::new("/code/src/main.rs");
        let host = env.to_host_path(env_path);
        assert!(host.starts_with(temp.path()));
        assert_eq!(env.to_environment_path(&host), env_path);
    }

    #[tokio::test]
    async fn test_read_missing_file_is_file_not_found() {
        let temp = tempfile::tempdir().unwrap();
        let env = make_env(&temp);
        let err = env.read_file("/code/nope.txt").await.unwrap_err();
        assert!(matches!(err, AtelierError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn test_write_then_read_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let env = make_env(&temp);
        env.write_file("/code/a/b.txt", b"payload").await.unwrap();
        assert!(env.exists("/code/a/b.txt").await);
        assert_eq!(env.read_file("/code/a/b.txt").await.unwrap(), "payload");
    }

    #[tokio::test]
    async fn test_copy_from_local_directory_requires_recursive() {
        let temp = tempfile::tempdir().unwrap();
        let env = make_env(&temp);
        let src_dir = temp.path().join("srcdir");
        std::fs::create_dir_all(&src_dir).unwrap();
        let err = env
            .copy_from_local(&src_dir, "/code/dest", false)
            .await
            .unwrap_err();
        assert!(matches!(err, AtelierError::IsADirectory { .. }));
    }

    #[tokio::test]
    async fn test_terminal_url_carries_auth_token() {
        let temp = tempfile::tempdir().unwrap();
        let env = make_env(&temp);
        let url = env.get_server_url(TERMINAL_SERVER_NAME).unwrap();
        assert!(url
            .query_pairs()
            .any(|(k, v)| k == "token" && v == env.terminal_auth_token()));
    }

    #[tokio::test]
    async fn test_closed_environment_refuses_processes() {
        let temp = tempfile::tempdir().unwrap();
        let env = make_env(&temp);
        env.close().await.unwrap();
        let err = env
            .run_process_in_background(ProcessSpec::new(["true"]))
            .await
            .unwrap_err();
        assert!(matches!(err, AtelierError::EnvironmentCrashed { .. }));
    }
}
