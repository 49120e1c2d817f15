use super::*;
use crate::ids::OrganizationReference;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A runner that records lifecycle calls and finishes on request.
struct FakeRunner {
    started: AtomicBool,
    alive: AtomicBool,
    stopped: AtomicBool,
    error: Mutex<Option<AtelierError>>,
}

impl FakeRunner {
    fn new() -> Arc<Self> {
        Arc::new(FakeRunner {
            started: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            error: Mutex::new(None),
        })
    }

    fn finish(&self, error: Option<AtelierError>) {
        *self.error.lock().unwrap() = error;
        self.alive.store(false, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Runner for FakeRunner {
    fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
    }

    async fn join(&self) {}

    fn take_error(&self) -> Option<AtelierError> {
        self.error.lock().unwrap().take()
    }
}

struct FakeFactory {
    created: Mutex<Vec<(TaskId, Arc<FakeRunner>)>>,
    create_count: AtomicUsize,
}

impl FakeFactory {
    fn new() -> Arc<Self> {
        Arc::new(FakeFactory {
            created: Mutex::new(Vec::new()),
            create_count: AtomicUsize::new(0),
        })
    }

    fn runner_for(&self, task_id: &TaskId) -> Option<Arc<FakeRunner>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| id == task_id)
            .map(|(_, runner)| runner.clone())
    }
}

impl RunnerFactory for FakeFactory {
    fn create_runner(&self, task: &Task) -> Arc<dyn Runner> {
        self.create_count.fetch_add(1, Ordering::SeqCst);
        let runner = FakeRunner::new();
        self.created
            .lock()
            .unwrap()
            .push((task.object_id.clone(), runner.clone()));
        runner
    }
}

struct Fixture {
    store: Store,
    bus: TaskMessageBus,
    scheduler: Arc<TaskScheduler>,
    factory: Arc<FakeFactory>,
    project: Project,
}

async fn fixture(is_periodic_enabled: bool) -> Fixture {
    let store = Store::open_in_memory().unwrap();
    let bus = TaskMessageBus::new(store.clone());
    let factory = FakeFactory::new();
    let scheduler = Arc::new(TaskScheduler::new(
        store.clone(),
        bus.clone(),
        factory.clone(),
        is_periodic_enabled,
    ));

    let project = Project {
        object_id: ProjectId::new(),
        organization_reference: OrganizationReference("org-1".to_string()),
        name: "demo".to_string(),
        user_git_repo_url: Some("file:///tmp/demo".to_string()),
        our_git_repo_url: None,
        is_path_accessible: true,
        default_system_prompt: None,
        created_at: Utc::now(),
    };
    let mut txn = store.transaction(None).await.unwrap();
    txn.upsert_project(&project).unwrap();
    txn.commit().unwrap();

    Fixture {
        store,
        bus,
        scheduler,
        factory,
        project,
    }
}

fn make_task(project: &Project, outcome: TaskOutcome) -> Task {
    Task {
        object_id: TaskId::new(),
        organization_reference: project.organization_reference.clone(),
        user_reference: UserReference("user-1".to_string()),
        project_id: project.object_id.clone(),
        parent_task_id: None,
        input_data: TaskInputs::MustBeShutDownTaskInputs {},
        max_seconds: None,
        current_state: None,
        outcome,
        error: None,
        is_archived: false,
        is_deleted: false,
        is_deleting: false,
        created_at: Utc::now(),
    }
}

async fn insert_task(fixture: &Fixture, task: &Task) {
    let mut txn = fixture.store.transaction(None).await.unwrap();
    txn.upsert_task(task).unwrap();
    txn.commit().unwrap();
}

async fn load_task(fixture: &Fixture, task_id: &TaskId) -> Task {
    let txn = fixture.store.transaction(None).await.unwrap();
    txn.get_task(task_id).unwrap().unwrap()
}

async fn status_messages(fixture: &Fixture, task_id: &TaskId) -> Vec<TaskOutcome> {
    let txn = fixture.store.transaction(None).await.unwrap();
    txn.get_messages_for_task(task_id)
        .unwrap()
        .into_iter()
        .filter_map(|saved| match saved.message {
            Message::TaskStatusRunner { outcome, .. } => Some(outcome),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_orphaned_running_task_is_reset_to_queued_exactly_once() {
    let fixture = fixture(false).await;
    let orphan = make_task(&fixture.project, TaskOutcome::Running);
    insert_task(&fixture, &orphan).await;

    fixture.scheduler.tick().await.unwrap();

    // The orphan reset happens and is immediately followed by promotion, so
    // the log reads QUEUED then RUNNING.
    let statuses = status_messages(&fixture, &orphan.object_id).await;
    assert_eq!(statuses, vec![TaskOutcome::Queued, TaskOutcome::Running]);

    // Later ticks must not reset again.
    fixture.scheduler.tick().await.unwrap();
    fixture.scheduler.tick().await.unwrap();
    let statuses = status_messages(&fixture, &orphan.object_id).await;
    assert_eq!(
        statuses
            .iter()
            .filter(|outcome| **outcome == TaskOutcome::Queued)
            .count(),
        1,
    );
}

#[tokio::test]
async fn test_queued_task_is_promoted_and_started_once() {
    let fixture = fixture(false).await;
    let task = make_task(&fixture.project, TaskOutcome::Queued);
    insert_task(&fixture, &task).await;

    fixture.scheduler.tick().await.unwrap();
    assert_eq!(load_task(&fixture, &task.object_id).await.outcome, TaskOutcome::Running);
    let runner = fixture.factory.runner_for(&task.object_id).unwrap();
    assert!(runner.started.load(Ordering::SeqCst));

    // No re-promotion while the runner lives.
    fixture.scheduler.tick().await.unwrap();
    fixture.scheduler.tick().await.unwrap();
    assert_eq!(fixture.factory.create_count.load(Ordering::SeqCst), 1);
    let statuses = status_messages(&fixture, &task.object_id).await;
    assert_eq!(
        statuses
            .iter()
            .filter(|outcome| **outcome == TaskOutcome::Running)
            .count(),
        1,
    );
}

#[tokio::test]
async fn test_at_most_eight_promotions_per_tick() {
    let fixture = fixture(false).await;
    for _ in 0..12 {
        insert_task(&fixture, &make_task(&fixture.project, TaskOutcome::Queued)).await;
    }

    fixture.scheduler.tick().await.unwrap();
    assert_eq!(fixture.factory.create_count.load(Ordering::SeqCst), 8);

    fixture.scheduler.tick().await.unwrap();
    assert_eq!(fixture.factory.create_count.load(Ordering::SeqCst), 12);
}

#[tokio::test]
async fn test_archived_and_deleted_tasks_are_not_promoted() {
    let fixture = fixture(false).await;
    let mut archived = make_task(&fixture.project, TaskOutcome::Queued);
    archived.is_archived = true;
    insert_task(&fixture, &archived).await;
    let mut deleted = make_task(&fixture.project, TaskOutcome::Queued);
    deleted.is_deleted = true;
    insert_task(&fixture, &deleted).await;

    fixture.scheduler.tick().await.unwrap();
    assert_eq!(fixture.factory.create_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_recoverably_failed_runner_requeues_the_task() {
    let fixture = fixture(false).await;
    let task = make_task(&fixture.project, TaskOutcome::Queued);
    insert_task(&fixture, &task).await;

    fixture.scheduler.tick().await.unwrap();
    let runner = fixture.factory.runner_for(&task.object_id).unwrap();
    runner.finish(Some(AtelierError::environment_crashed("container gone")));

    // The reap re-queues, and the same tick promotes and starts a fresh
    // runner for another attempt.
    fixture.scheduler.tick().await.unwrap();
    assert_eq!(load_task(&fixture, &task.object_id).await.outcome, TaskOutcome::Running);
    assert_eq!(fixture.factory.create_count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_cleanly_finished_runner_completes_the_task() {
    let fixture = fixture(false).await;
    let task = make_task(&fixture.project, TaskOutcome::Queued);
    insert_task(&fixture, &task).await;

    fixture.scheduler.tick().await.unwrap();
    let runner = fixture.factory.runner_for(&task.object_id).unwrap();
    runner.finish(None);

    fixture.scheduler.tick().await.unwrap();
    assert_eq!(fixture.scheduler.live_runner_count(), 0);
    let completed = load_task(&fixture, &task.object_id).await;
    assert_eq!(completed.outcome, TaskOutcome::Completed);
    assert!(completed.error.is_none());
}

#[tokio::test]
async fn test_periodic_tasks_are_created_once_per_kind() {
    let fixture = fixture(true).await;

    fixture.scheduler.tick().await.unwrap();
    let txn = fixture.store.transaction(None).await.unwrap();
    let tasks = txn
        .get_tasks_for_project(&fixture.project.object_id, &Default::default())
        .unwrap();
    drop(txn);

    let periodic: Vec<&Task> = tasks
        .iter()
        .filter(|task| task.input_data.interval().is_some())
        .collect();
    assert_eq!(periodic.len(), 2);
    assert!(periodic.iter().all(|task| task.max_seconds.is_some()));

    // A second tick finds them QUEUED/RUNNING and creates nothing new.
    fixture.scheduler.tick().await.unwrap();
    let txn = fixture.store.transaction(None).await.unwrap();
    let tasks = txn
        .get_tasks_for_project(&fixture.project.object_id, &Default::default())
        .unwrap();
    assert_eq!(
        tasks
            .iter()
            .filter(|task| task.input_data.interval().is_some())
            .count(),
        2,
    );
}

#[tokio::test]
async fn test_expired_runner_is_stopped() {
    let fixture = fixture(false).await;
    let mut task = make_task(&fixture.project, TaskOutcome::Queued);
    task.max_seconds = Some(0.0);
    insert_task(&fixture, &task).await;

    fixture.scheduler.tick().await.unwrap();
    let runner = fixture.factory.runner_for(&task.object_id).unwrap();
    assert!(runner.is_alive());

    tokio::time::sleep(Duration::from_millis(20)).await;
    fixture.scheduler.tick().await.unwrap();
    assert!(runner.stopped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_deleting_task_gets_stop_message() {
    let fixture = fixture(false).await;
    let mut task = make_task(&fixture.project, TaskOutcome::Running);
    task.is_deleting = true;
    insert_task(&fixture, &task).await;

    fixture.scheduler.stop_deleted_tasks().await.unwrap();

    let txn = fixture.store.transaction(None).await.unwrap();
    let messages = txn.get_messages_for_task(&task.object_id).unwrap();
    assert!(messages
        .iter()
        .any(|saved| matches!(saved.message, Message::StopAgentUser { .. })));
}

#[tokio::test]
async fn test_shutdown_sends_stop_to_running_tasks_and_joins() {
    let fixture = fixture(false).await;
    let task = make_task(&fixture.project, TaskOutcome::Queued);
    insert_task(&fixture, &task).await;
    fixture.scheduler.tick().await.unwrap();

    let mut subscription = fixture.bus.subscribe_to_task(&task.object_id).await.unwrap();
    fixture.scheduler.drain_runners().await;

    let mut saw_stop = false;
    while let Some(message) = subscription.try_recv() {
        if matches!(message, Message::StopAgentUser { .. }) {
            saw_stop = true;
        }
    }
    assert!(saw_stop);
}

#[test]
fn test_error_debounce_window() {
    let cache = ErrorDebounceCache::new(Duration::from_millis(100));
    assert!(cache.should_log("Database"));
    assert!(!cache.should_log("Database"));
    assert!(cache.should_log("Io"));
    std::thread::sleep(Duration::from_millis(120));
    assert!(cache.should_log("Database"));
}
