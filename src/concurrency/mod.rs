//! Concurrency groups: scoped accounting of spawned tasks and child
//! processes ("strands").
//!
//! Groups form a tree rooted at application start. All long-running strands
//! are created through the current group, which refuses new strands once it
//! or any ancestor has failed, waits for its strands on exit, and collects
//! timeouts and failures into one aggregate error with duplicate process
//! errors removed. A shared stop signal propagates down the tree for global
//! shutdown.

use crate::constants::{DEFAULT_EXIT_TIMEOUT_SECONDS, DEFAULT_SHUTDOWN_TIMEOUT_SECONDS};
use crate::env::RunningProcess;
use crate::{AtelierError, Result};
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[cfg(test)]
mod tests;

/// A group is used exactly once and moves through these states in order
/// (`Exiting` may be skipped when nothing was spawned).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Instantiated,
    Active,
    Exiting,
    Exited,
}

struct Strand {
    name: String,
    handle: JoinHandle<Result<()>>,
}

struct Inner {
    name: String,
    state: Mutex<GroupState>,
    strands: Mutex<Vec<Strand>>,
    processes: Mutex<Vec<Arc<RunningProcess>>>,
    children: Mutex<Vec<ConcurrencyGroup>>,
    parent: Option<Weak<Inner>>,
    exit_timeout: Duration,
    shutdown_timeout: Duration,
    /// Set when this group exited with an error; descendants consult it.
    exit_error: Mutex<Option<String>>,
    stop: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct ConcurrencyGroup {
    inner: Arc<Inner>,
}

impl ConcurrencyGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_timeouts(
            name,
            Duration::from_secs_f64(DEFAULT_EXIT_TIMEOUT_SECONDS),
            Duration::from_secs_f64(DEFAULT_SHUTDOWN_TIMEOUT_SECONDS),
        )
    }

    pub fn with_timeouts(
        name: impl Into<String>,
        exit_timeout: Duration,
        shutdown_timeout: Duration,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        ConcurrencyGroup {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(GroupState::Instantiated),
                strands: Mutex::new(Vec::new()),
                processes: Mutex::new(Vec::new()),
                children: Mutex::new(Vec::new()),
                parent: None,
                exit_timeout,
                shutdown_timeout,
                exit_error: Mutex::new(None),
                stop,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> GroupState {
        *self.inner.state.lock().unwrap()
    }

    /// Activate the group. A group can be used exactly once.
    pub fn activate(&self) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if *state != GroupState::Instantiated {
            return Err(AtelierError::Validation(format!(
                "concurrency group {} already activated (state {:?})",
                self.inner.name, *state,
            )));
        }
        *state = GroupState::Active;
        Ok(())
    }

    /// Receiver for the shared stop signal, for strands and process specs.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.inner.stop.subscribe()
    }

    /// Propagate shutdown to this group and its whole subtree.
    pub fn signal_shutdown(&self) {
        let _ = self.inner.stop.send(true);
        for child in self.inner.children.lock().unwrap().iter() {
            child.signal_shutdown();
        }
    }

    pub fn is_shutdown_signaled(&self) -> bool {
        *self.inner.stop.subscribe().borrow()
    }

    fn ensure_active(&self) -> Result<()> {
        let state = self.state();
        if state != GroupState::Active {
            return Err(AtelierError::Validation(format!(
                "concurrency group {} not active (state {:?})",
                self.inner.name, state,
            )));
        }
        Ok(())
    }

    /// Spawn a named strand. Refused when the group is not active or when
    /// any ancestor has failed.
    pub fn spawn<F>(&self, name: impl Into<String>, future: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.raise_if_any_strands_or_ancestors_failed()?;
        self.ensure_active()?;
        let name = name.into();
        debug!(group = %self.inner.name, strand = %name, "spawning strand");
        let handle = tokio::spawn(future);
        self.inner.strands.lock().unwrap().push(Strand { name, handle });
        Ok(())
    }

    /// Track a process launched in an environment so exit accounting covers
    /// it.
    pub fn register_process(&self, process: Arc<RunningProcess>) -> Result<()> {
        self.raise_if_any_strands_or_ancestors_failed()?;
        self.ensure_active()?;
        self.inner.processes.lock().unwrap().push(process);
        Ok(())
    }

    /// Create a child group tracked by this one. The child sees ancestor
    /// failures; the parent checks the child exited.
    pub fn make_child(&self, name: impl Into<String>) -> Result<ConcurrencyGroup> {
        self.raise_if_any_strands_or_ancestors_failed()?;
        self.ensure_active()?;
        let (stop, _) = watch::channel(self.is_shutdown_signaled());
        let child = ConcurrencyGroup {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(GroupState::Instantiated),
                strands: Mutex::new(Vec::new()),
                processes: Mutex::new(Vec::new()),
                children: Mutex::new(Vec::new()),
                parent: Some(Arc::downgrade(&self.inner)),
                exit_timeout: self.inner.exit_timeout,
                shutdown_timeout: self.inner.shutdown_timeout,
                exit_error: Mutex::new(None),
                stop,
            }),
        };
        self.inner.children.lock().unwrap().push(child.clone());
        Ok(child)
    }

    /// Check finished strands and ancestors for failures without exiting.
    pub fn raise_if_any_strands_or_ancestors_failed(&self) -> Result<()> {
        // Strand results are consumed at exit; between spawns only process
        // exits and ancestor failures are observable.
        let mut failures = Vec::new();
        {
            let processes = self.inner.processes.lock().unwrap();
            for process in processes.iter() {
                if !process.is_checked {
                    continue;
                }
                if let Some(code) = process.returncode() {
                    if code != 0 {
                        failures.push(process.to_process_error(code).to_string());
                    }
                }
            }
        }
        if let Some(ancestor_error) = self.closest_ancestor_error() {
            failures.push(format!("an ancestor concurrency group failed: {ancestor_error}"));
        }

        if failures.is_empty() {
            return Ok(());
        }
        Err(aggregate(failures, None))
    }

    fn closest_ancestor_error(&self) -> Option<String> {
        let mut current = self.inner.parent.clone();
        while let Some(weak) = current {
            let parent = weak.upgrade()?;
            if *parent.state.lock().unwrap() == GroupState::Exited {
                if let Some(error) = parent.exit_error.lock().unwrap().clone() {
                    return Some(error);
                }
            }
            current = parent.parent.clone();
        }
        None
    }

    /// Exit the group: wait for every strand and process within the exit
    /// budget (the shutdown budget when global shutdown is in progress),
    /// then aggregate timeouts and failures into one error.
    pub async fn exit(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state != GroupState::Active {
                return Err(AtelierError::Validation(format!(
                    "concurrency group {} cannot exit from state {:?}",
                    self.inner.name, *state,
                )));
            }
            *state = GroupState::Exiting;
        }

        let timeout = if self.is_shutdown_signaled() {
            self.inner.shutdown_timeout
        } else {
            self.inner.exit_timeout
        };
        let deadline = Instant::now() + timeout;
        let mut failures: Vec<String> = Vec::new();

        let processes: Vec<Arc<RunningProcess>> =
            std::mem::take(&mut *self.inner.processes.lock().unwrap());
        for process in &processes {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match process.wait_with_timeout(remaining.max(Duration::from_millis(1))).await {
                Ok(Some(code)) => {
                    if process.is_checked && code != 0 {
                        failures.push(process.to_process_error(code).to_string());
                    }
                }
                Ok(None) => {
                    failures.push(format!(
                        "process {:?} did not terminate in time and was killed (stdout: {}, stderr: {})",
                        process.command(),
                        truncate(&process.read_stdout(), 1024),
                        truncate(&process.read_stderr(), 1024),
                    ));
                    let _ = process.terminate(0.0).await;
                }
                Err(e) => failures.push(e.to_string()),
            }
        }

        let strands: Vec<Strand> = std::mem::take(&mut *self.inner.strands.lock().unwrap());
        for strand in strands {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining.max(Duration::from_millis(1)), strand.handle).await
            {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => failures.push(e.to_string()),
                Ok(Err(join_error)) => {
                    failures.push(format!("strand {} panicked: {join_error}", strand.name));
                }
                Err(_) => {
                    failures.push(format!(
                        "strand {} did not finish in time and is still alive",
                        strand.name,
                    ));
                }
            }
        }

        // Every child should have exited (or never activated) by now.
        for child in self.inner.children.lock().unwrap().iter() {
            let child_state = child.state();
            if child_state != GroupState::Exited && child_state != GroupState::Instantiated {
                failures.push(format!(
                    "child concurrency group {} did not exit (state {child_state:?})",
                    child.name(),
                ));
            }
        }

        if let Some(ancestor_error) = self.closest_ancestor_error() {
            failures.push(format!("an ancestor concurrency group failed: {ancestor_error}"));
        }

        let result = if failures.is_empty() {
            Ok(())
        } else {
            let error = aggregate(failures, None);
            *self.inner.exit_error.lock().unwrap() = Some(error.to_string());
            warn!(group = %self.inner.name, "concurrency group exited with failures");
            Err(error)
        };
        *self.inner.state.lock().unwrap() = GroupState::Exited;
        result
    }
}

/// Deduplicate and fold failure messages into one aggregate error.
///
/// Identical process errors show up twice when the same failure is observed
/// both by a waiting caller and by the exit sweep; keep one of each.
fn aggregate(failures: Vec<String>, main: Option<String>) -> AtelierError {
    let mut deduplicated: Vec<String> = Vec::new();
    for failure in failures {
        if !deduplicated.contains(&failure) {
            deduplicated.push(failure);
        }
    }
    let main_message = main
        .or_else(|| deduplicated.first().cloned())
        .unwrap_or_default();
    AtelierError::ConcurrencyGroup {
        count: deduplicated.len(),
        main_message,
        messages: deduplicated,
    }
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}
