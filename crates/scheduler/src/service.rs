//! The scheduler service: CRUD plus the 30-second tick loop.

use std::{collections::HashSet, future::Future, pin::Pin, sync::Arc, time::Duration};

use {
    anyhow::{bail, Result},
    tokio::sync::Mutex,
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use crate::{
    schedule::{calculate_next, is_valid},
    store::{ScheduledTask, TaskCreate, TaskPatch, TaskStore},
};
use hearth_common::now_ms;

/// Fixed sweep interval.
pub const TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Notifications the scheduler emits toward the host.
#[derive(Debug, Clone)]
pub enum TaskNotification {
    /// The notify-before window opened; fires once per armed cycle.
    Upcoming { task: ScheduledTask },
    /// The task is due (reminder).
    Due { task: ScheduledTask },
}

/// Callback for task notifications.
pub type NotifyFn = Arc<dyn Fn(TaskNotification) + Send + Sync>;

/// Callback executing a task's prompt, typically through the runner
/// orchestrator.
pub type ExecuteFn = Arc<
    dyn Fn(ScheduledTask) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync,
>;

/// Owns the store, the notified-set, and the tick task.
pub struct SchedulerService {
    store: TaskStore,
    /// Task ids whose pre-notification already fired this armed cycle.
    notified: Mutex<HashSet<String>>,
    on_notify: NotifyFn,
    on_execute: ExecuteFn,
    shutdown: CancellationToken,
}

impl SchedulerService {
    pub fn new(store: TaskStore, on_notify: NotifyFn, on_execute: ExecuteFn) -> Arc<Self> {
        Arc::new(Self {
            store,
            notified: Mutex::new(HashSet::new()),
            on_notify,
            on_execute,
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawn the tick loop. Returns immediately.
    pub fn start(self: &Arc<Self>) {
        let svc = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = svc.run_tick(now_ms()).await {
                            error!(error = %e, "scheduler tick failed");
                        }
                    },
                    () = svc.shutdown.cancelled() => {
                        info!("scheduler stopped");
                        return;
                    },
                }
            }
        });
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    // ── CRUD ────────────────────────────────────────────────────────────

    /// Create a task. The schedule expression is validated here — an
    /// unrecognized form is a user error at create time, not a silent
    /// disable later.
    pub async fn create(&self, input: TaskCreate) -> Result<ScheduledTask> {
        if !is_valid(&input.schedule) {
            bail!(
                "unrecognized schedule '{}' (expected 'every <n><m|h|d>' or 'daily HH:MM')",
                input.schedule
            );
        }
        let now = now_ms();
        let next_run = calculate_next(&input.schedule, now)
            .ok_or_else(|| anyhow::anyhow!("schedule '{}' has no next run", input.schedule))?;

        let task = ScheduledTask {
            id: uuid::Uuid::new_v4().to_string(),
            title: input.title,
            prompt: input.prompt.filter(|p| !p.trim().is_empty()),
            schedule: input.schedule,
            next_run,
            is_recurring: input.is_recurring,
            notify_before: input.notify_before,
            enabled: true,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(&task).await?;
        info!(id = %task.id, title = %task.title, schedule = %task.schedule, "scheduled task created");
        Ok(task)
    }

    pub async fn update(&self, id: &str, patch: TaskPatch) -> Result<ScheduledTask> {
        let mut task = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("task not found: {id}"))?;

        if let Some(title) = patch.title {
            task.title = title;
        }
        if let Some(prompt) = patch.prompt {
            task.prompt = prompt.filter(|p| !p.trim().is_empty());
        }
        if let Some(schedule) = patch.schedule {
            if !is_valid(&schedule) {
                bail!("unrecognized schedule '{schedule}'");
            }
            task.next_run = calculate_next(&schedule, now_ms())
                .ok_or_else(|| anyhow::anyhow!("schedule '{schedule}' has no next run"))?;
            task.schedule = schedule;
            // The cycle re-arms: a pending pre-notification is void.
            self.notified.lock().await.remove(id);
        }
        if let Some(recurring) = patch.is_recurring {
            task.is_recurring = recurring;
        }
        if let Some(notify_before) = patch.notify_before {
            task.notify_before = notify_before;
        }
        if let Some(enabled) = patch.enabled {
            task.enabled = enabled;
        }

        self.store.update(&task).await?;
        Ok(task)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.store.delete(id).await?;
        self.notified.lock().await.remove(id);
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<ScheduledTask>> {
        self.store.list().await
    }

    pub async fn get(&self, id: &str) -> Result<Option<ScheduledTask>> {
        self.store.get(id).await
    }

    // ── Tick ────────────────────────────────────────────────────────────

    /// One sweep: notification phase then execution phase. Public so tests
    /// can drive time explicitly. A failing task never stops the sweep.
    pub async fn run_tick(&self, now: u64) -> Result<()> {
        self.notification_phase(now).await;
        self.execution_phase(now).await;
        Ok(())
    }

    async fn notification_phase(&self, now: u64) {
        let upcoming = match self.store.in_notify_window(now).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "notify-window query failed");
                return;
            },
        };

        for task in upcoming {
            let mut notified = self.notified.lock().await;
            if notified.contains(&task.id) {
                continue;
            }
            notified.insert(task.id.clone());
            drop(notified);

            debug!(id = %task.id, "pre-notification");
            (self.on_notify)(TaskNotification::Upcoming { task });
        }
    }

    async fn execution_phase(&self, now: u64) {
        let due = match self.store.due(now).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "due-task query failed");
                return;
            },
        };

        for task in due {
            // The armed cycle is over; clear the notified marker so the
            // next cycle can pre-notify again.
            self.notified.lock().await.remove(&task.id);

            (self.on_notify)(TaskNotification::Due { task: task.clone() });

            // Advance or disable in one transaction *before* executing, so
            // a crash between fire and execution cannot double-run.
            let next = if task.is_recurring {
                calculate_next(&task.schedule, now_ms())
            } else {
                None
            };
            if let Err(e) = self.store.mark_fired(&task.id, next).await {
                error!(id = %task.id, error = %e, "failed to record task fire");
                continue;
            }

            if let Some(ref prompt) = task.prompt {
                debug!(id = %task.id, prompt = %prompt, "executing scheduled task");
                if let Err(e) = (self.on_execute)(task.clone()).await {
                    warn!(id = %task.id, error = %e, "scheduled task execution failed");
                }
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::atomic::{AtomicUsize, Ordering},
        std::sync::Mutex as StdMutex,
    };

    struct Recorded {
        notifications: StdMutex<Vec<String>>,
        executions: AtomicUsize,
    }

    async fn service_with(
        recorded: Arc<Recorded>,
        fail_execution: bool,
    ) -> Arc<SchedulerService> {
        let store = TaskStore::open("sqlite::memory:").await.unwrap();
        let rec_notify = Arc::clone(&recorded);
        let on_notify: NotifyFn = Arc::new(move |n| {
            let label = match n {
                TaskNotification::Upcoming { task } => format!("upcoming:{}", task.id),
                TaskNotification::Due { task } => format!("due:{}", task.id),
            };
            rec_notify.notifications.lock().unwrap().push(label);
        });
        let rec_exec = Arc::clone(&recorded);
        let on_execute: ExecuteFn = Arc::new(move |_task| {
            let rec = Arc::clone(&rec_exec);
            Box::pin(async move {
                rec.executions.fetch_add(1, Ordering::SeqCst);
                if fail_execution {
                    bail!("boom");
                }
                Ok(())
            })
        });
        SchedulerService::new(store, on_notify, on_execute)
    }

    fn recorder() -> Arc<Recorded> {
        Arc::new(Recorded {
            notifications: StdMutex::new(Vec::new()),
            executions: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn create_validates_schedule() {
        let svc = service_with(recorder(), false).await;
        let err = svc
            .create(TaskCreate {
                title: "bad".into(),
                prompt: None,
                schedule: "fortnightly".into(),
                is_recurring: true,
                notify_before: None,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unrecognized schedule"));
    }

    #[tokio::test]
    async fn create_computes_next_run() {
        let svc = service_with(recorder(), false).await;
        let before = now_ms();
        let task = svc
            .create(TaskCreate {
                title: "standup".into(),
                prompt: Some("post the standup summary".into()),
                schedule: "every 30m".into(),
                is_recurring: true,
                notify_before: Some(5),
            })
            .await
            .unwrap();
        assert!(task.next_run >= before + 30 * 60_000);
        assert!(task.enabled);
    }

    #[tokio::test]
    async fn due_recurring_task_executes_and_reschedules() {
        let recorded = recorder();
        let svc = service_with(Arc::clone(&recorded), false).await;
        let task = svc
            .create(TaskCreate {
                title: "t".into(),
                prompt: Some("do the thing".into()),
                schedule: "every 30m".into(),
                is_recurring: true,
                notify_before: None,
            })
            .await
            .unwrap();

        // Drive time past next_run.
        svc.run_tick(task.next_run + 1).await.unwrap();

        assert_eq!(recorded.executions.load(Ordering::SeqCst), 1);
        let labels = recorded.notifications.lock().unwrap().clone();
        assert!(labels.contains(&format!("due:{}", task.id)));

        // Rescheduled ~30m from the firing instant and still enabled.
        let after = svc.get(&task.id).await.unwrap().unwrap();
        assert!(after.enabled);
        assert!(after.next_run >= task.next_run);
    }

    #[tokio::test]
    async fn due_one_shot_task_disables() {
        let recorded = recorder();
        let svc = service_with(Arc::clone(&recorded), false).await;
        let task = svc
            .create(TaskCreate {
                title: "once".into(),
                prompt: Some("one shot".into()),
                schedule: "every 5m".into(),
                is_recurring: false,
                notify_before: None,
            })
            .await
            .unwrap();

        svc.run_tick(task.next_run + 1).await.unwrap();

        let after = svc.get(&task.id).await.unwrap().unwrap();
        assert!(!after.enabled);
        assert_eq!(recorded.executions.load(Ordering::SeqCst), 1);

        // A later tick does not re-run it.
        svc.run_tick(task.next_run + 10_000_000).await.unwrap();
        assert_eq!(recorded.executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn prompt_less_task_notifies_without_executing() {
        let recorded = recorder();
        let svc = service_with(Arc::clone(&recorded), false).await;
        let task = svc
            .create(TaskCreate {
                title: "reminder only".into(),
                prompt: None,
                schedule: "every 5m".into(),
                is_recurring: false,
                notify_before: None,
            })
            .await
            .unwrap();

        svc.run_tick(task.next_run + 1).await.unwrap();
        assert_eq!(recorded.executions.load(Ordering::SeqCst), 0);
        let labels = recorded.notifications.lock().unwrap().clone();
        assert!(labels.iter().any(|l| l.starts_with("due:")));
    }

    #[tokio::test]
    async fn notify_before_fires_exactly_once_per_cycle() {
        let recorded = recorder();
        let svc = service_with(Arc::clone(&recorded), false).await;
        let task = svc
            .create(TaskCreate {
                title: "meeting".into(),
                prompt: None,
                schedule: "every 30m".into(),
                is_recurring: true,
                notify_before: Some(5),
            })
            .await
            .unwrap();

        let window_open = task.next_run - 4 * 60_000;
        svc.run_tick(window_open).await.unwrap();
        svc.run_tick(window_open + 30_000).await.unwrap();
        svc.run_tick(window_open + 60_000).await.unwrap();

        let labels = recorded.notifications.lock().unwrap().clone();
        let upcoming_count = labels
            .iter()
            .filter(|l| *l == &format!("upcoming:{}", task.id))
            .count();
        assert_eq!(upcoming_count, 1, "exactly one pre-notification per cycle");
    }

    #[tokio::test]
    async fn notified_set_clears_when_task_fires() {
        let recorded = recorder();
        let svc = service_with(Arc::clone(&recorded), false).await;
        let task = svc
            .create(TaskCreate {
                title: "m".into(),
                prompt: None,
                schedule: "every 30m".into(),
                is_recurring: true,
                notify_before: Some(5),
            })
            .await
            .unwrap();

        // First cycle: pre-notify then fire.
        svc.run_tick(task.next_run - 60_000).await.unwrap();
        svc.run_tick(task.next_run + 1).await.unwrap();

        // Second cycle: window opens again and pre-notifies again.
        let after = svc.get(&task.id).await.unwrap().unwrap();
        svc.run_tick(after.next_run - 60_000).await.unwrap();

        let labels = recorded.notifications.lock().unwrap().clone();
        let upcoming_count = labels
            .iter()
            .filter(|l| *l == &format!("upcoming:{}", task.id))
            .count();
        assert_eq!(upcoming_count, 2, "one pre-notification per armed cycle");
    }

    #[tokio::test]
    async fn failing_execution_does_not_stop_tick() {
        let recorded = recorder();
        let svc = service_with(Arc::clone(&recorded), true).await;
        let t1 = svc
            .create(TaskCreate {
                title: "a".into(),
                prompt: Some("x".into()),
                schedule: "every 5m".into(),
                is_recurring: false,
                notify_before: None,
            })
            .await
            .unwrap();
        let t2 = svc
            .create(TaskCreate {
                title: "b".into(),
                prompt: Some("y".into()),
                schedule: "every 5m".into(),
                is_recurring: false,
                notify_before: None,
            })
            .await
            .unwrap();

        let latest = t1.next_run.max(t2.next_run) + 1;
        svc.run_tick(latest).await.unwrap();

        // Both executed (and both failed), both disabled.
        assert_eq!(recorded.executions.load(Ordering::SeqCst), 2);
        assert!(!svc.get(&t1.id).await.unwrap().unwrap().enabled);
        assert!(!svc.get(&t2.id).await.unwrap().unwrap().enabled);
    }

    #[tokio::test]
    async fn update_reschedules_and_validates() {
        let svc = service_with(recorder(), false).await;
        let task = svc
            .create(TaskCreate {
                title: "t".into(),
                prompt: None,
                schedule: "every 30m".into(),
                is_recurring: true,
                notify_before: None,
            })
            .await
            .unwrap();

        assert!(svc
            .update(&task.id, TaskPatch {
                schedule: Some("whenever".into()),
                ..TaskPatch::default()
            })
            .await
            .is_err());

        let updated = svc
            .update(&task.id, TaskPatch {
                schedule: Some("every 1h".into()),
                enabled: Some(false),
                ..TaskPatch::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.schedule, "every 1h");
        assert!(!updated.enabled);
    }

    #[tokio::test]
    async fn blank_prompt_stored_as_none() {
        let svc = service_with(recorder(), false).await;
        let task = svc
            .create(TaskCreate {
                title: "t".into(),
                prompt: Some("   ".into()),
                schedule: "every 5m".into(),
                is_recurring: false,
                notify_before: None,
            })
            .await
            .unwrap();
        assert_eq!(task.prompt, None);
    }
}
