//! The HTTP API server: typed event-stream endpoints pushed to UI clients.
//!
//! Four push streams are published over SSE, each emitting JSON objects:
//! the per-project task list, the per-task chat state, the per-user
//! notification state, and a throttled local-repo status probe.

use crate::auth::{auth_middleware, create_auth_state, AuthenticatedUser};
use crate::bus::TaskMessageBus;
use crate::config::Config;
use crate::constants::{
    REPO_INFO_INTERVAL_SECONDS, STREAM_KEEPALIVE_SECONDS, STREAM_POLL_SECONDS,
};
use crate::git::GitRepoStatus;
use crate::ids::{ProjectId, RequestId, TaskId, UserReference};
use crate::models::{Notification, Project, Task, UserSettings};
use crate::store::Store;
use crate::{AtelierError, Result};
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Json;
use axum::routing::get;
use axum::{Extension, Router};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub mod updates;


pub use updates::{convert_messages_to_task_update, TaskFeedItem, TaskUpdate};

const SERVICE_NAME: &str = "atelier";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

const ROUTE_HEALTH: &str = "/health";
const ROUTE_TASK_LIST_STREAM: &str = "/tasks/stream";
const ROUTE_TASK_STREAM: &str = "/tasks/{task_id}/stream";
const ROUTE_NOTIFICATIONS_STREAM: &str = "/notifications/stream";
const ROUTE_REPO_INFO: &str = "/repo-info";

/// Push payload of `/tasks/stream`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskListUpdate {
    pub task_by_task_id: HashMap<String, Task>,
    pub finished_request_ids: Vec<RequestId>,
}

/// Push payload of `/notifications/stream`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserUpdate {
    pub user_settings: Option<UserSettings>,
    pub projects: Vec<Project>,
    pub notifications: Vec<Notification>,
    pub finished_request_ids: Vec<RequestId>,
    pub local_repo_info: Option<LocalRepoInfo>,
}

/// Push payload of `/repo-info`, at most one every three seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalRepoInfo {
    pub status: GitRepoStatus,
    pub current_branch: String,
    pub project_id: ProjectId,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    service: &'static str,
    version: &'static str,
    status: &'static str,
}

#[derive(Clone)]
pub struct ApiState {
    store: Store,
    bus: TaskMessageBus,
}

pub struct ApiServer {
    config: Config,
    state: ApiState,
}

impl ApiServer {
    pub fn new(config: Config, store: Store, bus: TaskMessageBus) -> Self {
        ApiServer {
            config,
            state: ApiState { store, bus },
        }
    }

    pub fn build_router(&self) -> Result<Router> {
        let auth_state = create_auth_state(&self.config.api)?;
        Ok(Router::new()
            .route(ROUTE_TASK_LIST_STREAM, get(task_list_stream))
            .route(ROUTE_TASK_STREAM, get(task_stream))
            .route(ROUTE_NOTIFICATIONS_STREAM, get(notifications_stream))
            .route(ROUTE_REPO_INFO, get(repo_info_stream))
            .layer(middleware::from_fn_with_state(auth_state, auth_middleware))
            .route(ROUTE_HEALTH, get(health))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone()))
    }

    pub async fn serve(&self) -> Result<()> {
        let router = self.build_router()?;
        let address = format!("{}:{}", self.config.api.host, self.config.api.port);
        info!("API server listening on {}", address);
        let listener = tokio::net::TcpListener::bind(&address).await?;
        axum::serve(listener, router)
            .await
            .map_err(|e| AtelierError::Internal(anyhow::anyhow!("server failed: {e}")))
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        service: SERVICE_NAME,
        version: SERVICE_VERSION,
        status: "ok",
    })
}

#[derive(Debug, Deserialize)]
struct TaskListQuery {
    project_id: String,
}

/// `/tasks/stream`: the full task map on connect, then incremental maps as
/// transactions complete.
async fn task_list_stream(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(query): Query<TaskListQuery>,
) -> std::result::Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>, StatusCode>
{
    let project_id: ProjectId = query
        .project_id
        .parse()
        .map_err(|_| StatusCode::NOT_FOUND)?;
    let mut containers = state
        .bus
        .subscribe_to_complete_tasks_for_user(&user.user_reference, &project_id)
        .await
        .map_err(internal_error)?;

    let stream = futures::stream::unfold(containers, |mut containers| async move {
        loop {
            match tokio::time::timeout(
                Duration::from_secs(STREAM_KEEPALIVE_SECONDS),
                containers.recv(),
            )
            .await
            {
                Ok(Some(container)) => {
                    let update = TaskListUpdate {
                        task_by_task_id: container
                            .tasks
                            .into_iter()
                            .map(|task| (task.object_id.to_string(), task))
                            .collect(),
                        finished_request_ids: Vec::new(),
                    };
                    let event = match Event::default().json_data(&update) {
                        Ok(event) => event,
                        Err(_) => continue,
                    };
                    return Some((Ok(event), containers));
                }
                // Queue drained for a while: yield an empty keepalive
                // payload so proxies do not drop the connection.
                Err(_) => {
                    let event = Event::default().comment("keepalive");
                    return Some((Ok(event), containers));
                }
                Ok(None) => return None,
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(keep_alive()))
}

/// `/tasks/{id}/stream`: the folded chat state, incrementally.
async fn task_stream(
    State(state): State<ApiState>,
    AxumPath(task_id): AxumPath<String>,
) -> std::result::Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>, StatusCode>
{
    let task_id: TaskId = task_id.parse().map_err(|_| StatusCode::NOT_FOUND)?;
    {
        let transaction = state.store.transaction(None).await.map_err(internal_error)?;
        if transaction
            .get_task(&task_id)
            .map_err(internal_error)?
            .is_none()
        {
            return Err(StatusCode::NOT_FOUND);
        }
    }

    let subscription = state
        .bus
        .subscribe_to_task(&task_id)
        .await
        .map_err(internal_error)?;

    struct StreamState {
        subscription: crate::bus::TaskSubscription,
        task_id: TaskId,
        current: TaskUpdate,
    }

    let initial = StreamState {
        subscription,
        task_id,
        current: TaskUpdate::default(),
    };

    let stream = futures::stream::unfold(initial, |mut stream_state| async move {
        let mut items: Vec<TaskFeedItem> = Vec::new();
        match tokio::time::timeout(
            Duration::from_secs(STREAM_POLL_SECONDS),
            stream_state.subscription.recv(),
        )
        .await
        {
            Ok(Some(message)) => {
                items.push(TaskFeedItem::Message(message));
                // Drain whatever else is already pending into one batch.
                while let Some(message) = stream_state.subscription.try_recv() {
                    items.push(TaskFeedItem::Message(message));
                }
            }
            Ok(None) => return None,
            Err(_) => {
                let event = Event::default().comment("keepalive");
                return Some((Ok(event), stream_state));
            }
        }

        let update = convert_messages_to_task_update(
            &items,
            &stream_state.task_id,
            Some(&stream_state.current),
        );
        stream_state.current = update.clone();
        let event = Event::default()
            .json_data(&update)
            .unwrap_or_else(|_| Event::default().comment("serialization-failure"));
        Some((Ok(event), stream_state))
    });

    Ok(Sse::new(stream).keep_alive(keep_alive()))
}

/// `/notifications/stream`: user settings, projects and notifications on
/// connect and after every relevant transaction.
async fn notifications_stream(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> std::result::Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>, StatusCode>
{
    let organization = {
        let transaction = state.store.transaction(None).await.map_err(internal_error)?;
        transaction
            .get_projects()
            .map_err(internal_error)?
            .first()
            .map(|project| project.organization_reference.clone())
            .unwrap_or_else(|| crate::ids::OrganizationReference("".to_string()))
    };
    let changes = state
        .store
        .observe_user_changes(user.user_reference.clone(), organization);

    struct StreamState {
        store: Store,
        user: UserReference,
        changes: tokio::sync::mpsc::UnboundedReceiver<crate::store::CompletedTransaction>,
        is_first: bool,
    }

    let initial = StreamState {
        store: state.store.clone(),
        user: user.user_reference,
        changes,
        is_first: true,
    };

    let stream = futures::stream::unfold(initial, |mut stream_state| async move {
        let mut finished_request_ids = Vec::new();
        if stream_state.is_first {
            stream_state.is_first = false;
        } else {
            match tokio::time::timeout(
                Duration::from_secs(STREAM_KEEPALIVE_SECONDS),
                stream_state.changes.recv(),
            )
            .await
            {
                Ok(Some(completed)) => {
                    if let Some(request_id) = completed.request_id {
                        finished_request_ids.push(request_id);
                    }
                }
                Ok(None) => return None,
                Err(_) => {
                    let event = Event::default().comment("keepalive");
                    return Some((Ok(event), stream_state));
                }
            }
        }

        let update = match build_user_update(&stream_state.store, &stream_state.user).await {
            Ok(mut update) => {
                update.finished_request_ids = finished_request_ids;
                update
            }
            Err(e) => {
                warn!("failed to build user update: {}", e);
                UserUpdate::default()
            }
        };
        let event = Event::default()
            .json_data(&update)
            .unwrap_or_else(|_| Event::default().comment("serialization-failure"));
        Some((Ok(event), stream_state))
    });

    Ok(Sse::new(stream).keep_alive(keep_alive()))
}

async fn build_user_update(store: &Store, user: &UserReference) -> Result<UserUpdate> {
    let transaction = store.transaction(None).await?;
    Ok(UserUpdate {
        user_settings: transaction.get_user_settings(user)?,
        projects: transaction.get_projects()?,
        notifications: transaction.get_notifications(user)?,
        finished_request_ids: Vec::new(),
        local_repo_info: None,
    })
}

/// `/repo-info`: the user repo's status, at most every three seconds.
async fn repo_info_stream(
    State(state): State<ApiState>,
) -> std::result::Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>, StatusCode>
{
    let project = {
        let transaction = state.store.transaction(None).await.map_err(internal_error)?;
        transaction
            .get_projects()
            .map_err(internal_error)?
            .into_iter()
            .next()
            .ok_or(StatusCode::NOT_FOUND)?
    };
    let repo_path = project
        .user_git_repo_url
        .as_deref()
        .and_then(|repo_url| url::Url::parse(repo_url).ok())
        .and_then(|repo_url| repo_url.to_file_path().ok())
        .ok_or(StatusCode::NOT_FOUND)?;

    let stream = futures::stream::unfold(
        (project.object_id.clone(), repo_path),
        |(project_id, repo_path)| async move {
            let info = read_repo_info(&project_id, &repo_path).await;
            let event = match info {
                Some(info) => Event::default()
                    .json_data(&info)
                    .unwrap_or_else(|_| Event::default().comment("serialization-failure")),
                None => Event::default().comment("repo-unavailable"),
            };
            tokio::time::sleep(Duration::from_secs(REPO_INFO_INTERVAL_SECONDS)).await;
            Some((
                Ok::<_, Infallible>(event),
                (project_id, repo_path),
            ))
        },
    );

    Ok(Sse::new(stream).keep_alive(keep_alive()))
}

async fn read_repo_info(project_id: &ProjectId, repo_path: &PathBuf) -> Option<LocalRepoInfo> {
    let repo = crate::git::open_local_user_git_repo_for_read(repo_path).await;
    let status = repo.get_current_status().await.ok()?;
    let current_branch = repo.get_current_git_branch().await.ok()?;
    Some(LocalRepoInfo {
        status,
        current_branch,
        project_id: project_id.clone(),
    })
}

fn keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(STREAM_KEEPALIVE_SECONDS))
        .text("keepalive")
}

fn internal_error(error: AtelierError) -> StatusCode {
    warn!("API internal error: {}", error);
    StatusCode::INTERNAL_SERVER_ERROR
}
