//! Runners for housekeeping tasks: the periodic image cleanup, the
//! periodic repo cache refresh, and the shutdown probe used in testing.

use crate::bus::TaskMessageBus;
use crate::config::PathsConfig;
use crate::env::{calculate_image_ids_to_delete, DeletionTier, TaskImageMetadata};
use crate::git;
use crate::messages::Message;
use crate::models::{Task, TaskInputs, TaskOutcome, TaskRunState};
use crate::{AtelierError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Runner for non-agent tasks. Performs the task's work inline and exits,
/// but still honors stop requests so shutdown probes behave like agents.
pub struct HousekeepingRunner {
    task: Task,
    bus: TaskMessageBus,
    paths: PathsConfig,
    alive: Arc<AtomicBool>,
    error: Arc<Mutex<Option<AtelierError>>>,
    stop: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HousekeepingRunner {
    pub fn new(task: Task, bus: TaskMessageBus, paths: PathsConfig) -> Self {
        let (stop, _) = watch::channel(false);
        HousekeepingRunner {
            task,
            bus,
            paths,
            alive: Arc::new(AtomicBool::new(true)),
            error: Arc::new(Mutex::new(None)),
            stop,
            handle: Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl crate::scheduler::Runner for HousekeepingRunner {
    fn start(&self) {
        let task = self.task.clone();
        let bus = self.bus.clone();
        let paths = self.paths.clone();
        let alive = self.alive.clone();
        let error = self.error.clone();
        let mut stop = self.stop.subscribe();
        let handle = tokio::spawn(async move {
            let result = match &task.input_data {
                TaskInputs::MustBeShutDownTaskInputs {} => {
                    wait_for_stop(&task, &bus, &mut stop).await
                }
                TaskInputs::CleanupImagesInputs { .. } => {
                    run_image_cleanup(&task, &bus, &paths).await
                }
                TaskInputs::CacheReposInputs { .. } => run_repo_cache(&task, &bus, &paths).await,
                TaskInputs::SendEmailTaskInputs { subject, .. } => {
                    info!("no email transport is configured, not sending {subject:?}");
                    Ok(())
                }
                TaskInputs::AgentTaskInputs { .. } => Ok(()),
            };
            if let Err(e) = result {
                warn!(task_id = %task.object_id, "housekeeping task failed: {}", e);
                *error.lock().unwrap() = Some(e);
            }
            alive.store(false, Ordering::SeqCst);
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        let _ = self.stop.send(true);
    }

    async fn join(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn take_error(&self) -> Option<AtelierError> {
        self.error.lock().unwrap().take()
    }
}

/// Wait for the stop signal or a stop message, whichever arrives first.
async fn wait_for_stop(
    task: &Task,
    bus: &TaskMessageBus,
    stop: &mut watch::Receiver<bool>,
) -> Result<()> {
    let mut subscription = bus
        .subscribe_to_user_and_system_messages(&task.object_id)
        .await?;
    loop {
        tokio::select! {
            message = subscription.recv() => {
                match message {
                    Some(Message::StopAgentUser { .. }) | None => return Ok(()),
                    _ => continue,
                }
            }
            _ = stop.changed() => return Ok(()),
        }
    }
}

/// One image-cleanup pass: reclaim the historical images of archived tasks
/// and every image owned only by deleted tasks, keeping active tasks'
/// history and anything backing a running container.
pub(crate) async fn run_image_cleanup(
    task: &Task,
    bus: &TaskMessageBus,
    paths: &PathsConfig,
) -> Result<()> {
    let snapshots = {
        let transaction = bus.store().transaction(None).await?;
        transaction.get_task_snapshots_for_project(&task.project_id)?
    };

    // Rebuild each task's image history from its snapshot trail; the last
    // recorded image is the latest.
    let mut metadata_by_task_id: HashMap<String, TaskImageMetadata> = HashMap::new();
    let mut current_by_task_id: HashMap<String, &Task> = HashMap::new();
    for snapshot in &snapshots {
        let entry = metadata_by_task_id
            .entry(snapshot.object_id.to_string())
            .or_insert_with(|| TaskImageMetadata {
                image_ids: Vec::new(),
                is_archived: false,
                is_deleted: false,
            });
        if let Some(TaskRunState::AgentTaskState {
            image: Some(image), ..
        }) = &snapshot.current_state
        {
            let image_id = image.image_id().to_string();
            if entry.image_ids.last() != Some(&image_id) {
                entry.image_ids.push(image_id);
            }
        }
        entry.is_archived = snapshot.is_archived;
        entry.is_deleted = snapshot.is_deleted;
        current_by_task_id.insert(snapshot.object_id.to_string(), snapshot);
    }

    // Images backing a running container are protected regardless of tier.
    let mut active_image_ids: HashSet<String> = HashSet::new();
    for (task_id, current) in &current_by_task_id {
        if current.outcome != TaskOutcome::Running {
            continue;
        }
        if let Some(latest) = metadata_by_task_id
            .get(task_id)
            .and_then(|metadata| metadata.image_ids.last())
        {
            active_image_ids.insert(latest.clone());
        }
    }

    let images_dir = paths.data_dir.join("environments").join("images");
    let mut existing_image_ids: HashSet<String> = HashSet::new();
    if images_dir.exists() {
        let mut entries = tokio::fs::read_dir(&images_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            existing_image_ids.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }

    let to_delete = calculate_image_ids_to_delete(
        &metadata_by_task_id,
        &active_image_ids,
        &existing_image_ids,
        DeletionTier::RarelyDelete,
    );
    info!(
        candidates = existing_image_ids.len(),
        deleting = to_delete.len(),
        "image cleanup pass"
    );
    for image_id in to_delete {
        let image_path = images_dir.join(&image_id);
        match tokio::fs::remove_dir_all(&image_path).await {
            Ok(()) => debug!("deleted image {}", image_id),
            Err(e) => warn!("failed to delete image {}: {}", image_id, e),
        }
    }
    Ok(())
}

/// Refresh the cached mirror of the project's repository so images can be
/// built from it without touching the user's working copy.
pub(crate) async fn run_repo_cache(
    task: &Task,
    bus: &TaskMessageBus,
    paths: &PathsConfig,
) -> Result<()> {
    let project = {
        let transaction = bus.store().transaction(None).await?;
        transaction
            .get_project(&task.project_id)?
            .ok_or_else(|| AtelierError::ProjectNotFound(task.project_id.to_string()))?
    };
    let repo_url = project.user_git_repo_url.ok_or_else(|| {
        AtelierError::Validation("project has no git repository URL to cache".to_string())
    })?;
    let mirror_path = paths.cached_repo_path(&project.object_id);
    git::mirror_repository(&repo_url, &mirror_path).await?;
    info!(project_id = %project.object_id, "refreshed cached repo");
    Ok(())
}
