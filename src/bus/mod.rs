//! The per-task message bus.
//!
//! Fans every task message out to durable storage (through the caller's
//! transaction), live per-task subscribers, and user-wide list-view
//! subscribers. Messages for a given task are totally ordered by insertion;
//! across tasks no ordering is guaranteed.

use crate::ids::{ProjectId, TaskId, UserReference};
use crate::messages::{Message, MessageSource};
use crate::models::{SavedAgentMessage, Task};
use crate::store::{Store, Transaction, UpdatedModel};
use crate::Result;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;


/// One batch of list-view updates: task mutations plus per-task messages.
#[derive(Debug, Clone, Default)]
pub struct TaskMessageContainer {
    pub tasks: Vec<Task>,
    pub messages: Vec<(Message, TaskId)>,
}

type SubscriberMap = Arc<Mutex<HashMap<TaskId, Vec<mpsc::UnboundedSender<Message>>>>>;

#[derive(Clone)]
pub struct TaskMessageBus {
    store: Store,
    subscribers: SubscriberMap,
    /// When set, every created message is also appended to the per-task
    /// JSONL log under `state/tasks/<task_id>.json`.
    task_log_paths: Option<crate::config::PathsConfig>,
}

impl TaskMessageBus {
    pub fn new(store: Store) -> Self {
        TaskMessageBus {
            store,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            task_log_paths: None,
        }
    }

    pub fn with_task_log_paths(mut self, paths: crate::config::PathsConfig) -> Self {
        self.task_log_paths = Some(paths);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Append a message to the task's log in the given transaction and
    /// publish it to live subscribers. The message's own id is the row id.
    pub fn create_message(
        &self,
        message: Message,
        task_id: &TaskId,
        transaction: &mut Transaction,
    ) -> Result<()> {
        let saved = SavedAgentMessage::build(message.clone(), task_id.clone());
        transaction.insert_message(&saved)?;
        if let Some(paths) = &self.task_log_paths {
            if let Ok(line) = serde_json::to_string(&saved) {
                crate::logs::append_task_log_line(paths, task_id, &line);
            }
        }
        self.publish(task_id, message);
        Ok(())
    }

    fn publish(&self, task_id: &TaskId, message: Message) {
        let mut subscribers = self.subscribers.lock().unwrap();
        if let Some(senders) = subscribers.get_mut(task_id) {
            // Senders whose subscription has been dropped fail and are
            // unregistered here.
            senders.retain(|sender| sender.send(message.clone()).is_ok());
            if senders.is_empty() {
                subscribers.remove(task_id);
            }
        }
    }

    /// Subscribe to every message of a task, historical and new. Dropping
    /// the returned subscription unregisters it.
    pub async fn subscribe_to_task(&self, task_id: &TaskId) -> Result<TaskSubscription> {
        self.subscribe_filtered(task_id, None).await
    }

    /// Subscribe to user-originated and runner/system messages only.
    pub async fn subscribe_to_user_and_system_messages(
        &self,
        task_id: &TaskId,
    ) -> Result<TaskSubscription> {
        self.subscribe_filtered(
            task_id,
            Some(vec![
                MessageSource::User,
                MessageSource::Runner,
                MessageSource::System,
            ]),
        )
        .await
    }

    async fn subscribe_filtered(
        &self,
        task_id: &TaskId,
        sources: Option<Vec<MessageSource>>,
    ) -> Result<TaskSubscription> {
        // Register before replaying history so nothing is lost in between;
        // the id set below deduplicates the overlap.
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap()
            .entry(task_id.clone())
            .or_default()
            .push(sender);

        let transaction = self.store.transaction(None).await?;
        let history: Vec<Message> = transaction
            .get_messages_for_task(task_id)?
            .into_iter()
            .map(|saved| saved.message)
            .collect();
        drop(transaction);

        let seen: HashSet<_> = history.iter().map(|m| m.message_id().clone()).collect();
        debug!(task_id = %task_id, history = history.len(), "subscribed to task");
        Ok(TaskSubscription {
            history: history.into(),
            seen,
            receiver,
            sources,
        })
    }

    /// Subscribe to the list view of one user's project: task mutations and
    /// per-task messages, mixed. An initial container carries the current
    /// tasks.
    pub async fn subscribe_to_complete_tasks_for_user(
        &self,
        user_reference: &UserReference,
        project_id: &ProjectId,
    ) -> Result<mpsc::UnboundedReceiver<TaskMessageContainer>> {
        let transaction = self.store.transaction(None).await?;
        let initial_tasks =
            transaction.get_tasks_for_project(project_id, &Default::default())?;
        let organization = initial_tasks
            .first()
            .map(|task| task.organization_reference.clone())
            .unwrap_or_else(|| crate::ids::OrganizationReference("".to_string()));
        drop(transaction);

        let mut changes = self
            .store
            .observe_user_changes(user_reference.clone(), organization);
        let (sender, receiver) = mpsc::unbounded_channel();

        let _ = sender.send(TaskMessageContainer {
            tasks: initial_tasks,
            messages: Vec::new(),
        });

        let project_id = project_id.clone();
        tokio::spawn(async move {
            while let Some(completed) = changes.recv().await {
                let mut container = TaskMessageContainer::default();
                for model in &completed.updated_models {
                    match model.as_ref() {
                        UpdatedModel::Task(task) if task.project_id == project_id => {
                            container.tasks.push(task.clone());
                        }
                        UpdatedModel::Message(saved) => {
                            container
                                .messages
                                .push((saved.message.clone(), saved.task_id.clone()));
                        }
                        _ => {}
                    }
                }
                if container.tasks.is_empty() && container.messages.is_empty() {
                    continue;
                }
                if sender.send(container).is_err() {
                    break;
                }
            }
        });

        Ok(receiver)
    }
}

/// A live subscription to one task's messages. Replays history first, then
/// yields new messages as they are published; duplicates across the
/// replay/live boundary are filtered by message id.
pub struct TaskSubscription {
    history: std::collections::VecDeque<Message>,
    seen: HashSet<crate::ids::MessageId>,
    receiver: mpsc::UnboundedReceiver<Message>,
    sources: Option<Vec<MessageSource>>,
}

impl TaskSubscription {
    /// The next message, or `None` once the bus side is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            let message = match self.history.pop_front() {
                Some(message) => message,
                None => loop {
                    let live = self.receiver.recv().await?;
                    if self.seen.contains(live.message_id()) {
                        continue;
                    }
                    break live;
                },
            };
            if let Some(sources) = &self.sources {
                if !sources.contains(&message.source()) {
                    continue;
                }
            }
            return Some(message);
        }
    }

    /// Non-blocking variant; `None` when nothing is pending right now.
    pub fn try_recv(&mut self) -> Option<Message> {
        loop {
            let message = match self.history.pop_front() {
                Some(message) => message,
                None => loop {
                    let live = self.receiver.try_recv().ok()?;
                    if self.seen.contains(live.message_id()) {
                        continue;
                    }
                    break live;
                },
            };
            if let Some(sources) = &self.sources {
                if !sources.contains(&message.source()) {
                    continue;
                }
            }
            return Some(message);
        }
    }

    /// Wait up to `timeout` for the next message.
    pub async fn recv_timeout(&mut self, timeout: std::time::Duration) -> Option<Message> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }
}
