//! The environment abstraction: an isolated filesystem plus process
//! namespace in which one agent runs.
//!
//! Providers sit behind the [`Environment`] trait with a fixed operation
//! set. Every operation may fail with `EnvironmentCrashed`, which is always
//! recoverable at a higher level (the scheduler restarts the runner).

use crate::ids::{ImageId, ProjectId};
use crate::{AtelierError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use url::Url;

pub mod images;
pub mod local;
pub mod process;

pub use images::{calculate_image_ids_to_delete, DeletionTier, TaskImageMetadata};
pub use local::LocalEnvironment;
pub use process::{ProcessSpec, RunningProcess};

use crate::constants::{
    SSHD_SERVER_NAME, SSHD_SERVER_PORT, TERMINAL_SERVER_NAME, TERMINAL_SERVER_PORT,
};

/// Default in-environment service ports.
///
/// The terminal port points at the auth reverse proxy in front of the
/// terminal process, not the terminal itself.
pub fn default_server_port_by_name() -> HashMap<String, u16> {
    HashMap::from([
        (TERMINAL_SERVER_NAME.to_string(), TERMINAL_SERVER_PORT),
        (SSHD_SERVER_NAME.to_string(), SSHD_SERVER_PORT),
    ])
}

/// All default ports reset to zero, for providers that share the host port
/// space; the provider binds ephemeral ports instead so that concurrent
/// environments do not collide.
pub fn zeroed_server_port_by_name() -> HashMap<String, u16> {
    default_server_port_by_name()
        .into_keys()
        .map(|name| (name, 0))
        .collect()
}

/// Provider-tagged environment configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "object_type")]
pub enum EnvironmentSpec {
    /// Bare filesystem under one directory prefix.
    LocalEnvironmentConfig {
        #[serde(default = "zeroed_server_port_by_name")]
        server_port_by_name: HashMap<String, u16>,
    },
    /// A container built from the user's devcontainer.json (or the default
    /// image when none is present).
    DockerEnvironmentConfig {
        #[serde(default = "default_server_port_by_name")]
        server_port_by_name: HashMap<String, u16>,
    },
    /// A remote sandbox.
    RemoteSandboxEnvironmentConfig {
        #[serde(default = "default_server_port_by_name")]
        server_port_by_name: HashMap<String, u16>,
        #[serde(default = "RemoteSandboxDefaults::timeout_seconds")]
        timeout_seconds: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cpu: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        memory_mib: Option<u64>,
    },
}

struct RemoteSandboxDefaults;
impl RemoteSandboxDefaults {
    fn timeout_seconds() -> u64 {
        600
    }
}

impl EnvironmentSpec {
    pub fn server_port_by_name(&self) -> &HashMap<String, u16> {
        match self {
            EnvironmentSpec::LocalEnvironmentConfig { server_port_by_name }
            | EnvironmentSpec::DockerEnvironmentConfig { server_port_by_name }
            | EnvironmentSpec::RemoteSandboxEnvironmentConfig {
                server_port_by_name,
                ..
            } => server_port_by_name,
        }
    }
}

/// Provider-tagged image configuration: how to build the image an
/// environment is forked from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "object_type")]
pub enum ImageConfig {
    /// An "image" that is just a directory on the local filesystem.
    LocalImageConfig { code_directory: PathBuf },
    /// Built from a devcontainer.json in the user's tree, falling back to
    /// the default image when absent.
    DockerDevcontainerImageConfig { devcontainer_json_path: String },
    RemoteSandboxImageConfig { dockerfile_path: String },
}

/// A snapshottable immutable handle from which environments can be forked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "object_type")]
pub enum ImageSpec {
    LocalImage {
        image_id: ImageId,
        project_id: ProjectId,
        image_path: PathBuf,
    },
    DockerImage {
        image_id: ImageId,
        project_id: ProjectId,
        docker_image_tag: String,
    },
    RemoteSandboxImage {
        image_id: ImageId,
        project_id: ProjectId,
        app_name: String,
    },
}

impl ImageSpec {
    pub fn image_id(&self) -> &ImageId {
        match self {
            ImageSpec::LocalImage { image_id, .. }
            | ImageSpec::DockerImage { image_id, .. }
            | ImageSpec::RemoteSandboxImage { image_id, .. } => image_id,
        }
    }

    pub fn project_id(&self) -> &ProjectId {
        match self {
            ImageSpec::LocalImage { project_id, .. }
            | ImageSpec::DockerImage { project_id, .. }
            | ImageSpec::RemoteSandboxImage { project_id, .. } => project_id,
        }
    }
}

/// An isolated filesystem + process namespace owned by one task.
#[async_trait]
pub trait Environment: Send + Sync {
    fn environment_id(&self) -> &str;

    fn project_id(&self) -> &ProjectId;

    fn config(&self) -> &EnvironmentSpec;

    /// Root path inside the environment; all other paths are relative to it.
    fn get_root_path(&self) -> PathBuf;

    /// The agent's working tree inside the environment.
    fn get_workspace_path(&self) -> PathBuf;

    fn get_state_path(&self) -> PathBuf {
        self.get_root_path().join(crate::constants::STATE_DIRECTORY)
    }

    fn get_artifacts_path(&self) -> PathBuf {
        self.get_root_path().join(crate::constants::ARTIFACTS_DIRECTORY)
    }

    /// Convert an environment-absolute path into one that is valid on the
    /// host (for local environments this prefixes the root folder; container
    /// providers return the input unchanged).
    fn to_host_path(&self, path: &Path) -> PathBuf {
        path.to_path_buf()
    }

    /// The reverse of [`Environment::to_host_path`].
    fn to_environment_path(&self, path: &Path) -> PathBuf {
        path.to_path_buf()
    }

    /// Launch a process inside the environment and return a handle to it.
    async fn run_process_in_background(&self, spec: ProcessSpec) -> Result<RunningProcess>;

    /// Blocking wrapper over [`Environment::run_process_in_background`];
    /// raises `Process` if the spec is checked and the exit code is nonzero.
    async fn run_process_to_completion(&self, spec: ProcessSpec) -> Result<RunningProcess> {
        let process = self.run_process_in_background(spec).await?;
        process.wait().await?;
        Ok(process)
    }

    /// Snapshot the current filesystem as a new image. Providers may
    /// deduplicate identical layers.
    async fn snapshot(&self) -> Result<ImageSpec>;

    /// Ensure all data is saved. No-op on always-persistent providers;
    /// snapshots on ephemeral ones.
    async fn persist(&self) -> Result<()>;

    fn is_alive(&self) -> bool;

    async fn exists(&self, path: &str) -> bool;

    /// Read a file as UTF-8 text. `FileNotFound` on a missing path.
    async fn read_file(&self, path: &str) -> Result<String>;

    /// Read a file as raw bytes. `FileNotFound` on a missing path.
    async fn read_file_bytes(&self, path: &str) -> Result<Vec<u8>>;

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()>;

    async fn move_file(&self, original_path: &str, new_path: &str) -> Result<()>;

    /// Copy from the host into the environment. `IsADirectory` when the
    /// source is a directory and `recursive` is false.
    async fn copy_from_local(&self, local_path: &Path, env_path: &str, recursive: bool)
        -> Result<()>;

    async fn copy_to_local(&self, env_path: &str, local_path: &Path, recursive: bool)
        -> Result<()>;

    /// Full host-reachable URL for the named service.
    ///
    /// The environment takes care of transport; the caller is responsible
    /// for service-level auth, because these URLs may be publicly
    /// accessible.
    fn get_server_url(&self, name: &str) -> Result<Url>;

    /// URL of the environment's git repository, as reachable from the host.
    fn get_repo_url(&self) -> Result<Url>;

    /// Endpoint string understood by the filetree sync binary.
    fn get_repo_url_for_mutagen(&self) -> Result<String>;

    /// Forward-transport commits from a local repo into the environment's
    /// repo, `src_branch` onto `dst_branch`.
    async fn push_into_environment_repo(
        &self,
        user_repo_path: &Path,
        src_branch: &str,
        dst_branch: &str,
    ) -> Result<()>;

    /// Modification time (seconds since the epoch) of a path, used by local
    /// sync to break ties on concurrent updates.
    async fn get_file_mtime(&self, path: &str) -> Result<f64>;

    /// Quiesce the environment so it can be reopened later. Processes stop,
    /// ephemeral data is cleaned; volumes and images survive.
    async fn close(&self) -> Result<()>;

    /// Release all storage. Superset of [`Environment::close`].
    async fn destroy(&self) -> Result<()>;
}

/// Fold a lower-level failure into the recoverable environment-crash error.
pub fn crashed<E: std::fmt::Display>(context: &str) -> impl FnOnce(E) -> AtelierError + '_ {
    move |e| AtelierError::EnvironmentCrashed {
        message: format!("{context}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_config_zeroes_default_ports() {
        let ports = zeroed_server_port_by_name();
        assert_eq!(ports.get(TERMINAL_SERVER_NAME), Some(&0));
        assert_eq!(ports.get(SSHD_SERVER_NAME), Some(&0));
    }

    #[test]
    fn test_default_ports() {
        let ports = default_server_port_by_name();
        assert_eq!(ports.get(TERMINAL_SERVER_NAME), Some(&80));
        assert_eq!(ports.get(SSHD_SERVER_NAME), Some(&2222));
    }

    #[test]
    fn test_image_spec_roundtrip_keeps_tag() {
        let image = ImageSpec::DockerImage {
            image_id: ImageId::new(),
            project_id: ProjectId::new(),
            docker_image_tag: "atelier-task:abc".to_string(),
        };
        let json = serde_json::to_value(&image).unwrap();
        assert_eq!(json["object_type"], "DockerImage");
        let back: ImageSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, image);
    }
}
