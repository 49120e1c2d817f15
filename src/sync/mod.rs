//! The local-sync engine: keeps a user's on-disk repository consistent with
//! an agent's in-environment repository in real time, across two axes (git
//! branch HEAD refs and filetree contents).

use crate::config::SyncConfig;
use crate::env::Environment;
use crate::{AtelierError, Result};
use notify::{RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod branch;
pub mod debounce;
pub mod filetree;
pub mod mutagen;
pub mod scheduler;


pub use scheduler::{HandleOutcome, PathBatchScheduler, Reconciler, SyncLifecycleEvent};

/// One running local-sync engine for one task's environment.
///
/// Owns the filesystem watcher, the batch scheduler and the mutagen
/// session; dropping the engine (after [`LocalSyncEngine::stop`]) tears the
/// whole pipeline down.
pub struct LocalSyncEngine {
    stop: watch::Sender<bool>,
    scheduler_handle: JoinHandle<()>,
    // The watcher delivers events for as long as it is alive.
    _watcher: notify::RecommendedWatcher,
    session_name: String,
}

impl LocalSyncEngine {
    /// Build and start the engine: a branch-ref reconciler and a filetree
    /// reconciler under one batch scheduler (in that registration order),
    /// fed by one recursive watcher.
    ///
    /// When `is_initial_overwrite` is set, the user's checkout is first
    /// seeded from the agent's tree through a transient one-way session.
    pub async fn start(
        branch_name: &str,
        user_repo_path: PathBuf,
        environment: Arc<dyn Environment>,
        config: &SyncConfig,
        is_initial_overwrite: bool,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SyncLifecycleEvent>)> {
        let (stop_tx, stop_rx) = watch::channel(false);

        let branch_reconciler = branch::BranchSyncReconciler::build(
            branch_name,
            user_repo_path.clone(),
            environment.clone(),
        )
        .await?;

        let remote_url = environment.get_repo_url_for_mutagen()?;
        let session_name = format!(
            "{}{}",
            mutagen::SESSION_NAME_PREFIX,
            environment.environment_id(),
        );
        let mut ignore_patterns: Vec<String> = filetree::DEFAULT_FILETREE_EXCLUSIONS
            .iter()
            .map(|subpath| format!("{}**", subpath))
            .collect();
        ignore_patterns.extend(mutagen::git_ignored_patterns(&user_repo_path).await);

        if is_initial_overwrite {
            mutagen::overwrite_local_with_remote_once(
                user_repo_path.clone(),
                remote_url.clone(),
                format!("{session_name}-initial"),
                ignore_patterns.clone(),
            )
            .await?;
        }

        let mut session = mutagen::MutagenSession::new(
            session_name.clone(),
            user_repo_path.clone(),
            remote_url,
            mutagen::SyncMode::BidirectionalUserWins,
            ignore_patterns,
        );
        session.create().await?;
        session.flush().await?;

        let guardian = filetree::GitStateGuardian::new(user_repo_path.clone(), branch_name);
        let filetree_reconciler =
            filetree::FiletreeSyncReconciler::new(session, guardian, stop_rx.clone());

        let (batch_scheduler, lifecycle_rx) = PathBatchScheduler::new(
            vec![Box::new(branch_reconciler), Box::new(filetree_reconciler)],
            Duration::from_secs_f64(config.debounce_seconds),
            Duration::from_secs_f64(config.max_debounce_seconds),
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let watch_dirs = batch_scheduler.dirs_to_watch();
        let mut watcher = notify::recommended_watcher(
            move |event: std::result::Result<notify::Event, notify::Error>| match event {
                Ok(event) => {
                    for path in event.paths {
                        let _ = events_tx.send(path);
                    }
                }
                Err(e) => warn!("filesystem watcher error: {}", e),
            },
        )
        .map_err(|e| AtelierError::Internal(anyhow::anyhow!("failed to create watcher: {e}")))?;
        for dir in &watch_dirs {
            if let Err(e) = watcher.watch(dir, RecursiveMode::Recursive) {
                warn!("cannot watch {:?}: {}", dir, e);
            } else {
                debug!("watching {:?}", dir);
            }
        }

        let scheduler_handle = tokio::spawn(batch_scheduler.run(events_rx, stop_rx));

        info!(branch = branch_name, "local sync engine started");
        Ok((
            LocalSyncEngine {
                stop: stop_tx,
                scheduler_handle,
                _watcher: watcher,
                session_name,
            },
            lifecycle_rx,
        ))
    }

    /// Stop the pipeline and terminate the mutagen session.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.scheduler_handle.await;
        mutagen::terminate_session(&self.session_name).await;
        info!("local sync engine stopped");
    }
}
