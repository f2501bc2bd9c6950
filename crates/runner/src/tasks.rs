//! Multi-thread task fan-out: consensus and different-tasks modes, status
//! aggregation, and the auto-summary child.

use std::{collections::HashMap, sync::Arc};

use {
    serde::{Deserialize, Serialize},
    tokio::sync::RwLock,
    tracing::{info, warn},
};

use {
    crate::orchestrator::Orchestrator,
    hearth_common::ToolError,
    hearth_protocol::ServerEvent,
    hearth_sessions::SessionStatus,
};

/// Fan-out mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TaskMode {
    /// N children share one prompt and one model.
    Consensus {
        prompt: String,
        model: Option<String>,
        count: usize,
    },
    /// One child per entry.
    DifferentTasks { entries: Vec<TaskEntry> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
}

/// Derived task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Created,
    Running,
    Completed,
    Error,
}

/// Host-supplied creation parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub title: String,
    #[serde(flatten)]
    pub mode: TaskMode,
    #[serde(default)]
    pub auto_summary: bool,
    /// When false, the shared web cache is cleared at task start so the
    /// children run isolated.
    #[serde(default = "default_true")]
    pub share_web_cache: bool,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub summary_model: Option<String>,
}

fn default_true() -> bool {
    true
}

/// One fan-out task and its children.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiThreadTask {
    pub id: String,
    pub title: String,
    #[serde(flatten)]
    pub mode: TaskMode,
    pub thread_ids: Vec<String>,
    pub status: TaskStatus,
    pub auto_summary: bool,
    pub share_web_cache: bool,
    #[serde(skip)]
    workspace: Option<String>,
    #[serde(skip)]
    summary_model: Option<String>,
    #[serde(skip)]
    summary_started: bool,
}

/// Owns all multi-thread tasks. Children are ordinary sessions scoped to
/// their task; deleting the task deletes them.
pub struct TaskManager {
    orchestrator: Arc<Orchestrator>,
    tasks: RwLock<HashMap<String, MultiThreadTask>>,
    events: tokio::sync::mpsc::UnboundedSender<ServerEvent>,
}

impl TaskManager {
    #[must_use]
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        events: tokio::sync::mpsc::UnboundedSender<ServerEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            tasks: RwLock::new(HashMap::new()),
            events,
        })
    }

    /// Wire status aggregation: the orchestrator notifies the manager on
    /// every child transition. Uses a weak reference so the listener does
    /// not keep the manager alive.
    pub async fn attach(manager: &Arc<Self>) {
        let weak = Arc::downgrade(manager);
        manager
            .orchestrator
            .set_status_listener(Arc::new(move |session_id, status| {
                if let Some(manager) = weak.upgrade() {
                    let session_id = session_id.to_string();
                    tokio::spawn(async move {
                        manager.on_child_status(&session_id, status).await;
                    });
                }
            }))
            .await;
    }

    /// Create a task and its child sessions (idle until `start`).
    pub async fn create(&self, spec: TaskSpec) -> Result<MultiThreadTask, ToolError> {
        let task_id = uuid::Uuid::new_v4().to_string();

        let children: Vec<(String, Option<String>)> = match &spec.mode {
            TaskMode::Consensus { prompt, model, count } => {
                if *count == 0 {
                    return Err(ToolError::user("consensus count must be at least 1"));
                }
                (0..*count)
                    .map(|_| (prompt.clone(), model.clone()))
                    .collect()
            },
            TaskMode::DifferentTasks { entries } => {
                if entries.is_empty() {
                    return Err(ToolError::user("different_tasks needs at least one entry"));
                }
                entries
                    .iter()
                    .map(|e| (e.prompt.clone(), e.model.clone()))
                    .collect()
            },
        };

        let mut thread_ids = Vec::with_capacity(children.len());
        for (index, (_, model)) in children.iter().enumerate() {
            let child = self
                .orchestrator
                .store()
                .create(
                    &format!("{} #{}", spec.title, index + 1),
                    spec.workspace.clone().map(Into::into),
                    model
                        .as_deref()
                        .unwrap_or(self.orchestrator.default_model()),
                    vec![],
                    None,
                    Some(task_id.clone()),
                )
                .await;
            thread_ids.push(child.id);
        }

        let task = MultiThreadTask {
            id: task_id.clone(),
            title: spec.title,
            mode: spec.mode,
            thread_ids,
            status: TaskStatus::Created,
            auto_summary: spec.auto_summary,
            share_web_cache: spec.share_web_cache,
            workspace: spec.workspace,
            summary_model: spec.summary_model,
            summary_started: false,
        };

        self.tasks.write().await.insert(task_id.clone(), task.clone());
        let _ = self.events.send(ServerEvent::TaskCreated {
            task: serde_json::to_value(&task).unwrap_or_default(),
        });
        info!(id = %task_id, children = task.thread_ids.len(), "multi-thread task created");
        Ok(task)
    }

    /// Start every child runner in parallel.
    pub async fn start(&self, task_id: &str) -> Result<(), ToolError> {
        let task = self
            .tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| ToolError::user(format!("unknown task: {task_id}")))?;

        if !task.share_web_cache {
            // Isolate the children from earlier cached lookups.
            self.orchestrator.web_cache().clear();
        }

        let prompts: Vec<String> = match &task.mode {
            TaskMode::Consensus { prompt, .. } => {
                task.thread_ids.iter().map(|_| prompt.clone()).collect()
            },
            TaskMode::DifferentTasks { entries } => {
                entries.iter().map(|e| e.prompt.clone()).collect()
            },
        };

        for (child_id, prompt) in task.thread_ids.iter().zip(prompts) {
            self.orchestrator
                .continue_session(child_id, &prompt, None)
                .await?;
        }
        Ok(())
    }

    /// Stop every child runner.
    pub async fn stop(&self, task_id: &str) -> Result<(), ToolError> {
        let thread_ids = self
            .tasks
            .read()
            .await
            .get(task_id)
            .map(|t| t.thread_ids.clone())
            .ok_or_else(|| ToolError::user(format!("unknown task: {task_id}")))?;
        for child_id in thread_ids {
            self.orchestrator.stop(&child_id).await;
        }
        Ok(())
    }

    /// Delete the task and all of its children — children may not outlive
    /// the task.
    pub async fn delete(&self, task_id: &str) -> Result<(), ToolError> {
        let task = self
            .tasks
            .write()
            .await
            .remove(task_id)
            .ok_or_else(|| ToolError::user(format!("unknown task: {task_id}")))?;
        for child_id in &task.thread_ids {
            self.orchestrator.delete_session(child_id).await;
        }
        let _ = self.events.send(ServerEvent::TaskDeleted {
            task_id: task_id.to_string(),
        });
        Ok(())
    }

    pub async fn get(&self, task_id: &str) -> Option<MultiThreadTask> {
        self.tasks.read().await.get(task_id).cloned()
    }

    pub async fn list(&self) -> Vec<MultiThreadTask> {
        self.tasks.read().await.values().cloned().collect()
    }

    /// Child sessions of a task, in thread order.
    pub async fn threads(&self, task_id: &str) -> Vec<hearth_sessions::SessionSnapshot> {
        let thread_ids = match self.tasks.read().await.get(task_id) {
            Some(task) => task.thread_ids.clone(),
            None => return Vec::new(),
        };
        let mut out = Vec::with_capacity(thread_ids.len());
        for id in &thread_ids {
            if let Some(snapshot) = self.orchestrator.store().get(id).await {
                out.push(snapshot);
            }
        }
        out
    }

    /// Recompute a task's status after one of its children transitioned.
    async fn on_child_status(&self, session_id: &str, _status: SessionStatus) {
        let task_id = {
            let tasks = self.tasks.read().await;
            match tasks
                .values()
                .find(|t| t.thread_ids.iter().any(|id| id == session_id))
            {
                Some(task) => task.id.clone(),
                None => return,
            }
        };
        self.recompute(&task_id).await;
    }

    /// Derivation: running if any child running; else error if any child
    /// errored; else completed if all children completed; else the created
    /// value.
    async fn recompute(&self, task_id: &str) {
        let (thread_ids, previous) = {
            let tasks = self.tasks.read().await;
            match tasks.get(task_id) {
                Some(task) => (task.thread_ids.clone(), task.status),
                None => return,
            }
        };

        let mut statuses = Vec::with_capacity(thread_ids.len());
        for id in &thread_ids {
            if let Some(snapshot) = self.orchestrator.store().get(id).await {
                statuses.push(snapshot.status);
            }
        }

        let derived = if statuses.iter().any(|s| *s == SessionStatus::Running) {
            TaskStatus::Running
        } else if statuses.iter().any(|s| *s == SessionStatus::Error) {
            TaskStatus::Error
        } else if !statuses.is_empty() && statuses.iter().all(|s| *s == SessionStatus::Completed) {
            TaskStatus::Completed
        } else {
            TaskStatus::Created
        };

        {
            let mut tasks = self.tasks.write().await;
            if let Some(task) = tasks.get_mut(task_id) {
                task.status = derived;
            }
        }

        if derived != previous {
            let _ = self.events.send(ServerEvent::TaskStatus {
                task_id: task_id.to_string(),
                status: task_status_str(derived).to_string(),
                thread_ids: thread_ids.clone(),
            });
        }

        if derived == TaskStatus::Completed {
            self.maybe_start_summary(task_id).await;
        }
    }

    /// When a task completes with auto-summary set, append one more child
    /// whose prompt contains every child transcript and run it.
    async fn maybe_start_summary(&self, task_id: &str) {
        let (thread_ids, title, summary_model) = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(task_id) else {
                return;
            };
            if !task.auto_summary || task.summary_started {
                return;
            }
            task.summary_started = true;
            (
                task.thread_ids.clone(),
                task.title.clone(),
                task.summary_model.clone(),
            )
        };

        let mut transcripts = String::new();
        for (index, id) in thread_ids.iter().enumerate() {
            let Some(snapshot) = self.orchestrator.store().get(id).await else {
                continue;
            };
            transcripts.push_str(&format!("\n## Thread {}\n", index + 1));
            for message in &snapshot.messages {
                transcripts.push_str(&message.as_transcript_line());
                transcripts.push('\n');
            }
        }

        let prompt = format!(
            "Summarize the following {} independent attempts at the task \
             \"{title}\". Compare their conclusions, note agreements and \
             disagreements, and state the best combined answer.\n{transcripts}",
            thread_ids.len(),
        );

        let model = summary_model.unwrap_or_else(|| self.orchestrator.default_model().to_string());
        let workspace = {
            let tasks = self.tasks.read().await;
            tasks.get(task_id).and_then(|t| t.workspace.clone())
        };

        // Register the child before starting it so aggregation sees every
        // one of its status transitions.
        let summary = self
            .orchestrator
            .store()
            .create(
                &format!("{title} — summary"),
                workspace.map(Into::into),
                &model,
                vec![],
                None,
                Some(task_id.to_string()),
            )
            .await;
        {
            let mut tasks = self.tasks.write().await;
            if let Some(task) = tasks.get_mut(task_id) {
                task.thread_ids.push(summary.id.clone());
            }
        }

        match self
            .orchestrator
            .continue_session(&summary.id, &prompt, None)
            .await
        {
            Ok(()) => info!(task = task_id, summary = %summary.id, "auto-summary child started"),
            Err(e) => {
                warn!(task = task_id, error = %e, "failed to start auto-summary");
                let _ = self.events.send(ServerEvent::TaskError {
                    task_id: task_id.to_string(),
                    error: e.to_string(),
                });
            },
        }
    }
}

fn task_status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Created => "created",
        TaskStatus::Running => "running",
        TaskStatus::Completed => "completed",
        TaskStatus::Error => "error",
    }
}
