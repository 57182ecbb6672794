use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::store::{RecordStore, TASKS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    New,
    Running,
    Completed,
    Exception,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Exception)
    }
}

/// The tracked unit of any asynchronous operation. Mutable only through
/// `TaskService::update`; immutable once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub state: TaskState,
    pub percent: u8,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub messages: Vec<String>,
}

/// Partial update applied to a task record.
#[derive(Debug, Default)]
pub struct TaskUpdate {
    pub state: Option<TaskState>,
    pub percent: Option<u8>,
    pub message: Option<String>,
    pub end: bool,
}

impl TaskUpdate {
    pub fn state(state: TaskState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn progress(percent: u8, message: impl Into<String>) -> Self {
        Self {
            percent: Some(percent),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

struct TaskInner {
    tasks: HashMap<String, Task>,
    handles: HashMap<String, JoinHandle<()>>,
}

/// Tracks the lifecycle of every background operation in the process.
///
/// `run_background` gives each spawned job a join point, so shutdown can
/// drain in-flight work instead of abandoning detached tasks.
pub struct TaskService {
    store: Arc<RecordStore>,
    inner: Mutex<TaskInner>,
}

impl TaskService {
    pub fn new(store: Arc<RecordStore>) -> Result<Self> {
        // Reload the ledger so restarts keep task history visible.
        let existing: Vec<Task> = store.list(TASKS)?;
        let tasks = existing.into_iter().map(|t| (t.id.clone(), t)).collect();
        Ok(Self {
            store,
            inner: Mutex::new(TaskInner {
                tasks,
                handles: HashMap::new(),
            }),
        })
    }

    pub fn create(&self, name: impl Into<String>) -> Result<Task> {
        let task = Task {
            id: Uuid::new_v4().simple().to_string(),
            name: name.into(),
            state: TaskState::New,
            percent: 0,
            start_time: Utc::now(),
            end_time: None,
            messages: Vec::new(),
        };
        self.store.put(TASKS, &task.id, &task)?;
        let mut inner = self.inner.lock().unwrap();
        inner.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    /// Apply a partial update. Updates to a terminal task are ignored, and a
    /// `percent` below the current value is ignored while `Running`, keeping
    /// progress monotonic.
    pub fn update(&self, task_id: &str, update: TaskUpdate) -> Result<()> {
        let task = {
            let mut inner = self.inner.lock().unwrap();
            let task = inner
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| Error::not_found("task", task_id))?;

            if task.state.is_terminal() {
                return Ok(());
            }
            if let Some(state) = update.state {
                task.state = state;
            }
            if let Some(percent) = update.percent {
                if percent > task.percent {
                    task.percent = percent.min(100);
                }
            }
            if let Some(message) = update.message {
                task.messages.push(message);
            }
            if update.end {
                task.end_time = Some(Utc::now());
            }
            task.clone()
        };
        self.store.put(TASKS, task_id, &task)
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.inner.lock().unwrap().tasks.get(task_id).cloned()
    }

    pub fn list(&self) -> Vec<Task> {
        let inner = self.inner.lock().unwrap();
        let mut tasks: Vec<_> = inner.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        tasks
    }

    /// Create a task and run `job` in the background under its supervision.
    ///
    /// The job receives the task id and reports failure by returning an
    /// error; the runner turns that (or a panic) into a terminal `Exception`
    /// record. Nothing propagates past this boundary.
    pub fn run_background<F, Fut>(self: &Arc<Self>, name: impl Into<String>, job: F) -> Result<Task>
    where
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let task = self.create(name)?;
        let service = Arc::clone(self);
        let task_id = task.id.clone();

        let handle = tokio::spawn(async move {
            let _ = service.update(
                &task_id,
                TaskUpdate {
                    state: Some(TaskState::Running),
                    percent: Some(1),
                    ..Default::default()
                },
            );

            let outcome = AssertUnwindSafe(job(task_id.clone())).catch_unwind().await;
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(panic) => Some(
                    panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "background job panicked".to_string()),
                ),
            };

            match failure {
                None => {
                    let _ = service.update(
                        &task_id,
                        TaskUpdate {
                            state: Some(TaskState::Completed),
                            percent: Some(100),
                            end: true,
                            ..Default::default()
                        },
                    );
                    info!(task_id = %task_id, "Background task completed");
                }
                Some(message) => {
                    error!(task_id = %task_id, error = %message, "Background task failed");
                    let _ = service.update(
                        &task_id,
                        TaskUpdate {
                            state: Some(TaskState::Exception),
                            message: Some(message),
                            end: true,
                            ..Default::default()
                        },
                    );
                }
            }
        });

        self.inner
            .lock()
            .unwrap()
            .handles
            .insert(task.id.clone(), handle);
        Ok(task)
    }

    /// Wait for one background task to reach its terminal state.
    pub async fn join(&self, task_id: &str) -> Result<Task> {
        let handle = self.inner.lock().unwrap().handles.remove(task_id);
        if let Some(handle) = handle {
            // The runner catches panics itself; a join error here means the
            // task was aborted externally.
            let _ = handle.await;
        }
        self.get(task_id)
            .ok_or_else(|| Error::not_found("task", task_id))
    }

    /// Wait for every tracked background task. Used at shutdown.
    pub async fn drain(&self) {
        loop {
            let next = {
                let mut inner = self.inner.lock().unwrap();
                let key = inner.handles.keys().next().cloned();
                key.and_then(|k| inner.handles.remove(&k))
            };
            match next {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => break,
            }
        }
    }
}
