//! The persistent store: dual-table snapshots with a change broadcast.
//!
//! Each automanaged entity is backed by two tables. `T` holds one immutable
//! row per write, keyed by a unique snapshot id; `T_latest` holds one row
//! per `object_id`, kept in lockstep by a `BEFORE INSERT` trigger on `T`.
//! Full audit history is retained while "current state" queries stay O(1)
//! per id. Never update rows in a snapshots table; only insert.
//!
//! The triggers are defined declaratively from the table definitions below
//! so initialization can drop and recreate them idempotently. SQLite cannot
//! assign fields inside a `BEFORE INSERT` trigger, so an `AFTER INSERT`
//! trigger stamps `created_at` on the snapshot row instead.

use crate::ids::{
    MessageId, OrganizationReference, ProjectId, RequestId, SnapshotId, TaskId, UserReference,
};
use crate::models::{
    Notification, Project, SavedAgentMessage, Task, TaskOutcome, UserSettings,
};
use crate::{AtelierError, Result};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};


/// Bump when the table layout changes; older binaries opening a newer file
/// trigger the downgrade handler.
const SCHEMA_VERSION: i64 = 1;

/// One model updated inside a transaction, as broadcast to subscribers.
#[derive(Debug, Clone)]
pub enum UpdatedModel {
    Task(Task),
    Project(Project),
    Message(SavedAgentMessage),
    Notification(Notification),
    UserSettings(UserSettings),
}

impl UpdatedModel {
    /// Whether a subscriber scoped to this user/organization should see the
    /// update. Messages are task-scoped; per-task filtering happens on the
    /// bus, so they are delivered to every subscriber of the organization.
    fn is_relevant_to(&self, user: &UserReference, organization: &OrganizationReference) -> bool {
        match self {
            UpdatedModel::Task(task) => {
                &task.user_reference == user || &task.organization_reference == organization
            }
            UpdatedModel::Project(project) => &project.organization_reference == organization,
            UpdatedModel::Message(_) => true,
            UpdatedModel::Notification(notification) => &notification.user_reference == user,
            UpdatedModel::UserSettings(settings) => &settings.user_reference == user,
        }
    }
}

/// Broadcast to all relevant subscribers when a transaction commits.
/// Either all of a transaction's updated models are observed together or
/// none are.
#[derive(Debug, Clone)]
pub struct CompletedTransaction {
    pub request_id: Option<RequestId>,
    pub updated_models: Vec<Arc<UpdatedModel>>,
}

struct Subscriber {
    user_reference: UserReference,
    organization_reference: OrganizationReference,
    sink: mpsc::UnboundedSender<CompletedTransaction>,
}

/// Invoked when the on-disk schema version is newer than this binary's; may
/// back up and reset the database file.
pub type DowngradeHandler = Box<dyn Fn(&Path) -> Result<()> + Send + Sync>;

struct TableDef {
    name: &'static str,
    /// Columns beyond `snapshot_id`; every table carries `object_id`,
    /// `data` (the serialized entity) and `created_at`.
    columns: &'static [&'static str],
}

const TABLES: &[TableDef] = &[
    TableDef {
        name: "tasks",
        columns: &[
            "object_id",
            "project_id",
            "user_reference",
            "organization_reference",
            "outcome",
            "is_archived",
            "is_deleted",
            "is_deleting",
            "data",
            "created_at",
        ],
    },
    TableDef {
        name: "projects",
        columns: &["object_id", "organization_reference", "name", "data", "created_at"],
    },
    TableDef {
        name: "agent_messages",
        columns: &["object_id", "task_id", "source", "is_partial", "data", "created_at"],
    },
    TableDef {
        name: "notifications",
        columns: &["object_id", "user_reference", "data", "created_at"],
    },
    TableDef {
        name: "user_settings",
        columns: &["object_id", "user_reference", "data", "created_at"],
    },
];

fn create_table_sql(table: &TableDef) -> Vec<String> {
    let column_defs: Vec<String> = table
        .columns
        .iter()
        .map(|col| format!("{col} TEXT NOT NULL"))
        .collect();
    let latest_column_defs: Vec<String> = table
        .columns
        .iter()
        .map(|col| {
            if *col == "object_id" {
                format!("{col} TEXT NOT NULL PRIMARY KEY")
            } else {
                format!("{col} TEXT NOT NULL")
            }
        })
        .collect();
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {} (snapshot_id TEXT NOT NULL PRIMARY KEY, {})",
            table.name,
            column_defs.join(", "),
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {}_latest ({})",
            table.name,
            latest_column_defs.join(", "),
        ),
    ]
}

fn create_trigger_sql(table: &TableDef) -> Vec<String> {
    let names = table.columns.join(", ");
    let values: Vec<String> = table
        .columns
        .iter()
        .map(|col| format!("NEW.{col}"))
        .collect();
    let updates: Vec<String> = table
        .columns
        .iter()
        .filter(|col| **col != "object_id" && **col != "created_at")
        .map(|col| format!("{col} = excluded.{col}"))
        .collect();
    // Initialization runs on every server start; dropping and recreating the
    // triggers keeps them in sync with the binary's definitions. This
    // assumes a single process owns the database file.
    vec![
        format!("DROP TRIGGER IF EXISTS {}_before_insert", table.name),
        format!(
            "CREATE TRIGGER {name}_before_insert BEFORE INSERT ON {name} \
             BEGIN \
             INSERT INTO {name}_latest ({names}) VALUES ({values}) \
             ON CONFLICT (object_id) DO UPDATE SET {updates}; \
             END",
            name = table.name,
            names = names,
            values = values.join(", "),
            updates = updates.join(", "),
        ),
        format!("DROP TRIGGER IF EXISTS set_{}_created_at", table.name),
        format!(
            "CREATE TRIGGER set_{name}_created_at AFTER INSERT ON {name} \
             FOR EACH ROW \
             BEGIN \
             UPDATE {name} SET created_at = datetime('now') \
             WHERE snapshot_id = NEW.snapshot_id; \
             END",
            name = table.name,
        ),
    ]
}

fn map_sql_error(error: rusqlite::Error) -> AtelierError {
    let message = error.to_string();
    if let Some(rest) = message.split("no such table: ").nth(1) {
        return AtelierError::MissingSqlTable {
            table: rest.split_whitespace().next().unwrap_or(rest).to_string(),
        };
    }
    AtelierError::Database(error)
}

/// The store owning the SQLite connection and the subscriber registry.
#[derive(Clone)]
pub struct Store {
    connection: Arc<Mutex<Connection>>,
    subscribers: Arc<std::sync::Mutex<Vec<Subscriber>>>,
    path: PathBuf,
}

impl Store {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_downgrade_handler(path, None)
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection = Connection::open_in_memory()?;
        Self::initialize(connection, PathBuf::from(":memory:"), None)
    }

    pub fn open_with_downgrade_handler(
        path: impl Into<PathBuf>,
        downgrade_handler: Option<DowngradeHandler>,
    ) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let connection = Connection::open(&path)?;
        Self::initialize(connection, path, downgrade_handler)
    }

    fn initialize(
        connection: Connection,
        path: PathBuf,
        downgrade_handler: Option<DowngradeHandler>,
    ) -> Result<Self> {
        connection.pragma_update(None, "journal_mode", "WAL")?;
        connection.pragma_update(None, "foreign_keys", "ON")?;
        connection.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER NOT NULL PRIMARY KEY)",
            [],
        )?;

        let stored_version: Option<i64> = connection
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
            .unwrap_or(None);
        if let Some(version) = stored_version {
            if version > SCHEMA_VERSION {
                warn!(
                    stored = version,
                    supported = SCHEMA_VERSION,
                    "database file is from a newer build"
                );
                if let Some(handler) = &downgrade_handler {
                    handler(&path)?;
                } else {
                    return Err(AtelierError::Configuration(format!(
                        "database schema version {version} is newer than supported {SCHEMA_VERSION}"
                    )));
                }
            }
        }

        for table in TABLES {
            for statement in create_table_sql(table) {
                connection.execute(&statement, [])?;
            }
            for statement in create_trigger_sql(table) {
                connection.execute(&statement, [])?;
            }
        }
        connection.execute(
            "INSERT OR IGNORE INTO schema_migrations (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;

        info!(path = %path.display(), "store initialized");
        Ok(Store {
            connection: Arc::new(Mutex::new(connection)),
            subscribers: Arc::new(std::sync::Mutex::new(Vec::new())),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register a user-scoped subscriber for completed transactions.
    pub fn observe_user_changes(
        &self,
        user_reference: UserReference,
        organization_reference: OrganizationReference,
    ) -> mpsc::UnboundedReceiver<CompletedTransaction> {
        let (sink, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(Subscriber {
            user_reference,
            organization_reference,
            sink,
        });
        receiver
    }

    /// Open a transaction bound to one request. Only one writer runs at a
    /// time; the connection lock serializes transactions.
    pub async fn transaction(&self, request_id: Option<RequestId>) -> Result<Transaction> {
        let guard = self.connection.clone().lock_owned().await;
        guard.execute_batch("BEGIN").map_err(map_sql_error)?;
        Ok(Transaction {
            guard,
            request_id,
            updated_models: Vec::new(),
            subscribers: self.subscribers.clone(),
            finished: false,
        })
    }

    fn broadcast(
        subscribers: &std::sync::Mutex<Vec<Subscriber>>,
        completed: CompletedTransaction,
    ) {
        let mut subscribers = subscribers.lock().unwrap();
        subscribers.retain(|subscriber| {
            let relevant = completed.updated_models.iter().any(|model| {
                model.is_relevant_to(&subscriber.user_reference, &subscriber.organization_reference)
            });
            if !relevant && !completed.updated_models.is_empty() {
                return !subscriber.sink.is_closed();
            }
            subscriber.sink.send(completed.clone()).is_ok()
        });
    }
}

/// A scoped handle over one request's reads and writes.
///
/// Dropping without calling [`Transaction::commit`] rolls everything back
/// and broadcasts nothing.
pub struct Transaction {
    guard: OwnedMutexGuard<Connection>,
    request_id: Option<RequestId>,
    updated_models: Vec<Arc<UpdatedModel>>,
    subscribers: Arc<std::sync::Mutex<Vec<Subscriber>>>,
    finished: bool,
}

impl Transaction {
    pub fn commit(mut self) -> Result<()> {
        self.guard.execute_batch("COMMIT").map_err(map_sql_error)?;
        self.finished = true;
        let completed = CompletedTransaction {
            request_id: self.request_id.clone(),
            updated_models: std::mem::take(&mut self.updated_models),
        };
        Store::broadcast(&self.subscribers, completed);
        Ok(())
    }

    pub fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>> {
        self.get_latest_by_object_id("tasks", task_id.as_str())
    }

    pub fn get_tasks_for_project(
        &self,
        project_id: &ProjectId,
        filter: &TaskFilter,
    ) -> Result<Vec<Task>> {
        let mut sql = String::from(
            "SELECT data FROM tasks_latest WHERE project_id = ?1 AND is_deleted = 'false'",
        );
        if let Some(is_archived) = filter.is_archived {
            sql.push_str(&format!(" AND is_archived = '{is_archived}'"));
        }
        if let Some(outcomes) = &filter.outcomes {
            let list: Vec<String> = outcomes
                .iter()
                .map(|o| format!("'{}'", outcome_str(o)))
                .collect();
            sql.push_str(&format!(" AND outcome IN ({})", list.join(", ")));
        }
        sql.push_str(" ORDER BY object_id");
        if let Some(max) = filter.max_results {
            sql.push_str(&format!(" LIMIT {max}"));
        }
        let mut statement = self.guard.prepare(&sql).map_err(map_sql_error)?;
        let rows = statement
            .query_map(params![project_id.as_str()], |row| row.get::<_, String>(0))
            .map_err(map_sql_error)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(serde_json::from_str(&row?)?);
        }
        Ok(tasks)
    }

    /// Every snapshot row of every task in the project, in write order,
    /// deleted tasks included. Image cleanup reads this to reconstruct each
    /// task's full image history; the latest tables cannot answer that.
    pub fn get_task_snapshots_for_project(&self, project_id: &ProjectId) -> Result<Vec<Task>> {
        self.collect_latest(
            "SELECT data FROM tasks WHERE project_id = ?1 ORDER BY snapshot_id",
            params![project_id.as_str()],
        )
    }

    /// Insert a fresh snapshot of the task. No-op when the current latest
    /// row has identical content apart from `created_at`.
    pub fn upsert_task(&mut self, task: &Task) -> Result<()> {
        if let Some(existing) = self.get_task(&task.object_id)? {
            if existing.is_content_equal(task) {
                debug!(task_id = %task.object_id, "skipping no-op task upsert");
                return Ok(());
            }
        }
        let data = serde_json::to_string(task)?;
        self.guard
            .execute(
                "INSERT INTO tasks (snapshot_id, object_id, project_id, user_reference, \
                 organization_reference, outcome, is_archived, is_deleted, is_deleting, data, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    SnapshotId::new().as_str(),
                    task.object_id.as_str(),
                    task.project_id.as_str(),
                    task.user_reference.0,
                    task.organization_reference.0,
                    outcome_str(&task.outcome),
                    task.is_archived.to_string(),
                    task.is_deleted.to_string(),
                    task.is_deleting.to_string(),
                    data,
                    task.created_at.to_rfc3339(),
                ],
            )
            .map_err(map_sql_error)?;
        self.updated_models
            .push(Arc::new(UpdatedModel::Task(task.clone())));
        Ok(())
    }

    pub fn get_project(&self, project_id: &ProjectId) -> Result<Option<Project>> {
        self.get_latest_by_object_id("projects", project_id.as_str())
    }

    pub fn get_projects(&self) -> Result<Vec<Project>> {
        self.collect_latest("SELECT data FROM projects_latest ORDER BY object_id", [])
    }

    pub fn upsert_project(&mut self, project: &Project) -> Result<()> {
        let data = serde_json::to_string(project)?;
        self.guard
            .execute(
                "INSERT INTO projects (snapshot_id, object_id, organization_reference, name, data, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    SnapshotId::new().as_str(),
                    project.object_id.as_str(),
                    project.organization_reference.0,
                    project.name,
                    data,
                    project.created_at.to_rfc3339(),
                ],
            )
            .map_err(map_sql_error)?;
        self.updated_models
            .push(Arc::new(UpdatedModel::Project(project.clone())));
        Ok(())
    }

    /// Append one message to a task's log. The message id is the row id;
    /// validation of the denormalized fields happens here, at the insert.
    pub fn insert_message(&mut self, saved: &SavedAgentMessage) -> Result<()> {
        saved.validate()?;
        let data = serde_json::to_string(saved)?;
        self.guard
            .execute(
                "INSERT INTO agent_messages (snapshot_id, object_id, task_id, source, is_partial, data, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    SnapshotId::new().as_str(),
                    saved.object_id.as_str(),
                    saved.task_id.as_str(),
                    serde_json::to_string(&saved.source)?.trim_matches('"'),
                    saved.is_partial.to_string(),
                    data,
                    saved.created_at.to_rfc3339(),
                ],
            )
            .map_err(map_sql_error)?;
        self.updated_models
            .push(Arc::new(UpdatedModel::Message(saved.clone())));
        Ok(())
    }

    /// All messages of a task in insertion order.
    pub fn get_messages_for_task(&self, task_id: &TaskId) -> Result<Vec<SavedAgentMessage>> {
        self.collect_latest(
            "SELECT data FROM agent_messages WHERE task_id = ?1 ORDER BY snapshot_id",
            params![task_id.as_str()],
        )
    }

    pub fn get_message(&self, message_id: &MessageId) -> Result<Option<SavedAgentMessage>> {
        self.get_latest_by_object_id("agent_messages", message_id.as_str())
    }

    pub fn insert_notification(&mut self, notification: &Notification) -> Result<()> {
        let data = serde_json::to_string(notification)?;
        self.guard
            .execute(
                "INSERT INTO notifications (snapshot_id, object_id, user_reference, data, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    SnapshotId::new().as_str(),
                    notification.object_id.as_str(),
                    notification.user_reference.0,
                    data,
                    notification.created_at.to_rfc3339(),
                ],
            )
            .map_err(map_sql_error)?;
        self.updated_models
            .push(Arc::new(UpdatedModel::Notification(notification.clone())));
        Ok(())
    }

    pub fn get_notifications(&self, user: &UserReference) -> Result<Vec<Notification>> {
        self.collect_latest(
            "SELECT data FROM notifications_latest WHERE user_reference = ?1 ORDER BY object_id",
            params![user.0],
        )
    }

    pub fn upsert_user_settings(&mut self, settings: &UserSettings) -> Result<()> {
        let data = serde_json::to_string(settings)?;
        self.guard
            .execute(
                "INSERT INTO user_settings (snapshot_id, object_id, user_reference, data, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    SnapshotId::new().as_str(),
                    settings.object_id.as_str(),
                    settings.user_reference.0,
                    data,
                    settings.created_at.to_rfc3339(),
                ],
            )
            .map_err(map_sql_error)?;
        self.updated_models
            .push(Arc::new(UpdatedModel::UserSettings(settings.clone())));
        Ok(())
    }

    pub fn get_user_settings(&self, user: &UserReference) -> Result<Option<UserSettings>> {
        let mut results: Vec<UserSettings> = self.collect_latest(
            "SELECT data FROM user_settings_latest WHERE user_reference = ?1",
            params![user.0],
        )?;
        Ok(results.pop())
    }

    fn get_latest_by_object_id<T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        object_id: &str,
    ) -> Result<Option<T>> {
        let sql = format!("SELECT data FROM {table}_latest WHERE object_id = ?1");
        let result = self
            .guard
            .query_row(&sql, params![object_id], |row| row.get::<_, String>(0));
        match result {
            Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(map_sql_error(e)),
        }
    }

    fn collect_latest<T: serde::de::DeserializeOwned, P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<T>> {
        let mut statement = self.guard.prepare(sql).map_err(map_sql_error)?;
        let rows = statement
            .query_map(params, |row| row.get::<_, String>(0))
            .map_err(map_sql_error)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(serde_json::from_str(&row?)?);
        }
        Ok(results)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.guard.execute_batch("ROLLBACK") {
                warn!("transaction rollback failed: {}", e);
            }
        }
    }
}

/// Filters for task listing queries. Deleted tasks are always excluded.
#[derive(Debug, Default, Clone)]
pub struct TaskFilter {
    pub outcomes: Option<Vec<TaskOutcome>>,
    pub is_archived: Option<bool>,
    pub max_results: Option<usize>,
}

impl TaskFilter {
    pub fn with_outcomes(outcomes: impl IntoIterator<Item = TaskOutcome>) -> Self {
        TaskFilter {
            outcomes: Some(outcomes.into_iter().collect()),
            ..Default::default()
        }
    }
}

fn outcome_str(outcome: &TaskOutcome) -> &'static str {
    match outcome {
        TaskOutcome::Queued => "QUEUED",
        TaskOutcome::Running => "RUNNING",
        TaskOutcome::Completed => "COMPLETED",
        TaskOutcome::Failed => "FAILED",
    }
}
