//! The path batch scheduler: routes filesystem events into per-reconciler
//! batches and runs the reconcilers when the debounce timer fires.

use super::debounce::DebounceController;
use crate::messages::{is_pause_necessary, LocalSyncNotice};
use crate::Result;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Outcome of one reconciler handling a batch.
pub enum HandleOutcome {
    Handled,
    /// The reconciler cannot proceed until the described conditions clear.
    Paused(Vec<LocalSyncNotice>),
}

/// One unit of local-sync logic; either branch-ref or filetree.
#[async_trait::async_trait]
pub trait Reconciler: Send {
    fn tag(&self) -> &str;

    /// Directories whose events this reconciler wants, watched recursively.
    fn dirs_to_watch(&self) -> Vec<PathBuf>;

    /// Whether one event path is interesting. May consult cached state.
    async fn is_relevant_subpath(&mut self, path: &Path) -> bool;

    /// Current notices independent of any batch (pause conditions).
    async fn get_notices(&mut self) -> Vec<LocalSyncNotice>;

    async fn handle_path_changes(&mut self, paths: &[PathBuf]) -> Result<HandleOutcome>;
}

/// Lifecycle events emitted while processing batches.
#[derive(Debug, Clone)]
pub enum SyncLifecycleEvent {
    BatchHandled { tag: String, path_count: usize },
    HandlingPaused { notices: Vec<LocalSyncNotice> },
}

/// Routes watcher events into per-reconciler batches, debounces them, and
/// invokes reconcilers in registration order when the timer fires.
///
/// If any reconciler reports a pause notice, later reconcilers in that
/// batch are not invoked and the batch is retried on the next debounce
/// tick; there is no indefinite retry loop beyond that. Errors during
/// handling are equivalent to a synthesized pause notice and never halt the
/// observer.
pub struct PathBatchScheduler {
    reconcilers: Vec<Box<dyn Reconciler>>,
    batches: Vec<BTreeSet<PathBuf>>,
    debounce: DebounceController,
    /// Taken by `run`; present until then.
    fire_rx: Option<mpsc::UnboundedReceiver<()>>,
    lifecycle_tx: mpsc::UnboundedSender<SyncLifecycleEvent>,
    /// One retry has been armed for a paused batch.
    is_retry_armed: bool,
}

impl PathBatchScheduler {
    pub fn new(
        reconcilers: Vec<Box<dyn Reconciler>>,
        debounce: Duration,
        max_debounce: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<SyncLifecycleEvent>) {
        let (controller, fire_rx) =
            DebounceController::new("local_sync_batches", debounce, max_debounce);
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let batches = reconcilers.iter().map(|_| BTreeSet::new()).collect();
        (
            PathBatchScheduler {
                reconcilers,
                batches,
                debounce: controller,
                fire_rx: Some(fire_rx),
                lifecycle_tx,
                is_retry_armed: false,
            },
            lifecycle_rx,
        )
    }

    /// All directories any reconciler wants watched.
    pub fn dirs_to_watch(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self
            .reconcilers
            .iter()
            .flat_map(|reconciler| reconciler.dirs_to_watch())
            .collect();
        dirs.sort();
        dirs.dedup();
        dirs
    }

    /// Main loop: consume watcher events until the stop signal fires.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<PathBuf>,
        mut stop: watch::Receiver<bool>,
    ) {
        info!("local sync batch scheduler started");
        let mut fire_rx = self.fire_rx.take().expect("run is called once");
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(path) => self.route_event(path).await,
                        None => break,
                    }
                }
                fired = fire_rx.recv() => {
                    if fired.is_none() {
                        break;
                    }
                    self.process_batches().await;
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
        info!("local sync batch scheduler stopped");
    }

    async fn route_event(&mut self, path: PathBuf) {
        let mut any_added = false;
        for (index, reconciler) in self.reconcilers.iter_mut().enumerate() {
            let watched = reconciler
                .dirs_to_watch()
                .iter()
                .any(|dir| path.starts_with(dir));
            if !watched {
                continue;
            }
            if reconciler.is_relevant_subpath(&path).await {
                self.batches[index].insert(path.clone());
                any_added = true;
            }
        }
        if any_added {
            self.is_retry_armed = false;
            self.debounce.start_or_bounce();
        }
    }

    /// Invoke reconcilers in registration order on their accumulated paths.
    async fn process_batches(&mut self) {
        for index in 0..self.reconcilers.len() {
            if self.batches[index].is_empty() {
                continue;
            }

            let notices = self.reconcilers[index].get_notices().await;
            if is_pause_necessary(&notices) {
                self.pause(notices);
                return;
            }

            let paths: Vec<PathBuf> = self.batches[index].iter().cloned().collect();
            let outcome = self.reconcilers[index].handle_path_changes(&paths).await;
            match outcome {
                Ok(HandleOutcome::Handled) => {
                    let tag = self.reconcilers[index].tag().to_string();
                    debug!(tag = %tag, paths = paths.len(), "sync batch handled");
                    self.batches[index].clear();
                    let _ = self.lifecycle_tx.send(SyncLifecycleEvent::BatchHandled {
                        tag,
                        path_count: paths.len(),
                    });
                }
                Ok(HandleOutcome::Paused(notices)) => {
                    self.pause(notices);
                    return;
                }
                Err(error) => {
                    // Exceptions during handling are equivalent to a pause
                    // notice carrying the error text; the observer lives on.
                    warn!(
                        tag = self.reconcilers[index].tag(),
                        "sync handling failed: {}", error
                    );
                    self.pause(vec![LocalSyncNotice::Pause {
                        source_tag: self.reconcilers[index].tag().to_string(),
                        reason: error.to_string(),
                    }]);
                    return;
                }
            }
        }
        self.is_retry_armed = false;
    }

    fn pause(&mut self, notices: Vec<LocalSyncNotice>) {
        let _ = self
            .lifecycle_tx
            .send(SyncLifecycleEvent::HandlingPaused { notices });
        // Retry the held batches on one more debounce tick; after that,
        // only fresh events re-arm the timer.
        if !self.is_retry_armed {
            self.is_retry_armed = true;
            self.debounce.start_or_bounce();
        }
    }
}
