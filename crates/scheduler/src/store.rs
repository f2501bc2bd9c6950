//! SQLite persistence for scheduled tasks (`scheduler.db`).

use {
    anyhow::{bail, Context, Result},
    serde::{Deserialize, Serialize},
    sqlx::{sqlite::SqliteConnectOptions, Row, SqlitePool},
};

use hearth_common::now_ms;

/// One scheduled task, column-for-column with the `scheduled_tasks` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: String,
    pub title: String,
    /// Prompt routed to the task-execution callback; `None` means
    /// notification-only.
    pub prompt: Option<String>,
    pub schedule: String,
    pub next_run: u64,
    pub is_recurring: bool,
    /// Minutes before `next_run` at which a pre-notification fires.
    pub notify_before: Option<u64>,
    pub enabled: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Input for creating a task.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCreate {
    pub title: String,
    #[serde(default)]
    pub prompt: Option<String>,
    pub schedule: String,
    pub is_recurring: bool,
    #[serde(default)]
    pub notify_before: Option<u64>,
}

/// Patch for updating a task.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    pub title: Option<String>,
    pub prompt: Option<Option<String>>,
    pub schedule: Option<String>,
    pub is_recurring: Option<bool>,
    pub notify_before: Option<Option<u64>>,
    pub enabled: Option<bool>,
}

/// SQLite-backed task store.
pub struct TaskStore {
    pool: SqlitePool,
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> ScheduledTask {
    ScheduledTask {
        id: row.get("id"),
        title: row.get("title"),
        prompt: row.get("prompt"),
        schedule: row.get("schedule"),
        next_run: row.get::<i64, _>("next_run") as u64,
        is_recurring: row.get::<i64, _>("is_recurring") != 0,
        notify_before: row
            .get::<Option<i64>, _>("notify_before")
            .map(|v| v as u64),
        enabled: row.get::<i64, _>("enabled") != 0,
        created_at: row.get::<i64, _>("created_at") as u64,
        updated_at: row.get::<i64, _>("updated_at") as u64,
    }
}

impl TaskStore {
    /// Open (creating if needed) the database at `database_url` and ensure
    /// the schema exists.
    pub async fn open(database_url: &str) -> Result<Self> {
        let options: SqliteConnectOptions = database_url
            .parse::<SqliteConnectOptions>()
            .context("invalid scheduler database URL")?
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .context("failed to open scheduler database")?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS scheduled_tasks (
                id            TEXT PRIMARY KEY,
                title         TEXT NOT NULL,
                prompt        TEXT NULL,
                schedule      TEXT NOT NULL,
                next_run      INTEGER NOT NULL,
                is_recurring  INTEGER NOT NULL,
                notify_before INTEGER NULL,
                enabled       INTEGER NOT NULL,
                created_at    INTEGER NOT NULL,
                updated_at    INTEGER NOT NULL
            )"#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub async fn insert(&self, task: &ScheduledTask) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO scheduled_tasks
               (id, title, prompt, schedule, next_run, is_recurring, notify_before, enabled, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&task.id)
        .bind(&task.title)
        .bind(&task.prompt)
        .bind(&task.schedule)
        .bind(task.next_run as i64)
        .bind(task.is_recurring as i64)
        .bind(task.notify_before.map(|v| v as i64))
        .bind(task.enabled as i64)
        .bind(task.created_at as i64)
        .bind(task.updated_at as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update(&self, task: &ScheduledTask) -> Result<()> {
        let result = sqlx::query(
            r#"UPDATE scheduled_tasks SET
               title = ?, prompt = ?, schedule = ?, next_run = ?, is_recurring = ?,
               notify_before = ?, enabled = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(&task.title)
        .bind(&task.prompt)
        .bind(&task.schedule)
        .bind(task.next_run as i64)
        .bind(task.is_recurring as i64)
        .bind(task.notify_before.map(|v| v as i64))
        .bind(task.enabled as i64)
        .bind(now_ms() as i64)
        .bind(&task.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("task not found: {}", task.id);
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM scheduled_tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("task not found: {id}");
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<ScheduledTask>> {
        let row = sqlx::query("SELECT * FROM scheduled_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_task))
    }

    /// All tasks, soonest next-run first.
    pub async fn list(&self) -> Result<Vec<ScheduledTask>> {
        let rows = sqlx::query("SELECT * FROM scheduled_tasks ORDER BY next_run ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_task).collect())
    }

    /// Enabled tasks due at or before `now`.
    pub async fn due(&self, now: u64) -> Result<Vec<ScheduledTask>> {
        let rows = sqlx::query(
            "SELECT * FROM scheduled_tasks WHERE enabled = 1 AND next_run <= ? ORDER BY next_run ASC",
        )
        .bind(now as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_task).collect())
    }

    /// Enabled tasks with a notify window open at `now`:
    /// `next_run − notify_before·60000 ≤ now < next_run`.
    pub async fn in_notify_window(&self, now: u64) -> Result<Vec<ScheduledTask>> {
        let rows = sqlx::query(
            r#"SELECT * FROM scheduled_tasks
               WHERE enabled = 1
                 AND notify_before IS NOT NULL
                 AND next_run - notify_before * 60000 <= ?
                 AND ? < next_run"#,
        )
        .bind(now as i64)
        .bind(now as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_task).collect())
    }

    /// Record a fire: advance `next_run` or disable, in one transaction.
    /// This is what makes a crash mid-tick safe — a restarted sweep sees
    /// either the un-fired row or the fully advanced one, never a half
    /// state that double-executes.
    pub async fn mark_fired(&self, id: &str, next_run: Option<u64>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        match next_run {
            Some(next) => {
                sqlx::query(
                    "UPDATE scheduled_tasks SET next_run = ?, updated_at = ? WHERE id = ?",
                )
                .bind(next as i64)
                .bind(now_ms() as i64)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            },
            None => {
                sqlx::query("UPDATE scheduled_tasks SET enabled = 0, updated_at = ? WHERE id = ?")
                    .bind(now_ms() as i64)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            },
        }
        tx.commit().await?;
        Ok(())
    }
}
