//! The `schedule_task` tool: lets the LLM manage scheduled tasks.

use async_trait::async_trait;

use {
    crate::registry::{Tool, ToolCtx},
    hearth_common::ToolError,
    hearth_scheduler::{TaskCreate, TaskPatch},
};

pub struct ScheduleTaskTool;

#[async_trait]
impl Tool for ScheduleTaskTool {
    fn name(&self) -> &str {
        "schedule_task"
    }

    fn description(&self) -> &str {
        "Manage scheduled tasks. action='create' needs title and schedule \
         ('every <n><m|h|d>' or 'daily HH:MM') and an optional prompt to \
         run when due; 'list' returns all tasks; 'update' patches a task by \
         id; 'delete' removes one."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["create", "list", "update", "delete"],
                    "description": "What to do"
                },
                "id": {
                    "type": "string",
                    "description": "Task id (update/delete)"
                },
                "title": {
                    "type": "string",
                    "description": "Task title (create)"
                },
                "schedule": {
                    "type": "string",
                    "description": "Schedule expression (create/update)"
                },
                "prompt": {
                    "type": "string",
                    "description": "Prompt executed when the task fires (optional)"
                },
                "recurring": {
                    "type": "boolean",
                    "description": "Repeat after firing (default true)"
                },
                "notify_before": {
                    "type": "integer",
                    "description": "Minutes before the run to pre-notify (optional)"
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolCtx,
    ) -> Result<serde_json::Value, ToolError> {
        let scheduler = ctx
            .scheduler
            .as_ref()
            .ok_or_else(|| ToolError::internal("scheduler not wired into tool context"))?;

        let action = args
            .get("action")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::user("missing 'action' parameter"))?;

        match action {
            "create" => {
                let title = args
                    .get("title")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ToolError::user("create requires 'title'"))?;
                let schedule = args
                    .get("schedule")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ToolError::user("create requires 'schedule'"))?;
                let task = scheduler
                    .create(TaskCreate {
                        title: title.to_string(),
                        prompt: args.get("prompt").and_then(|v| v.as_str()).map(String::from),
                        schedule: schedule.to_string(),
                        is_recurring: args
                            .get("recurring")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(true),
                        notify_before: args.get("notify_before").and_then(|v| v.as_u64()),
                    })
                    .await
                    .map_err(|e| ToolError::user(e.to_string()))?;
                serde_json::to_value(&task).map_err(|e| ToolError::internal(e.to_string()))
            },
            "list" => {
                let tasks = scheduler
                    .list()
                    .await
                    .map_err(|e| ToolError::external(e.to_string()))?;
                Ok(serde_json::json!({ "tasks": tasks }))
            },
            "update" => {
                let id = args
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ToolError::user("update requires 'id'"))?;
                let patch = TaskPatch {
                    title: args.get("title").and_then(|v| v.as_str()).map(String::from),
                    prompt: args
                        .get("prompt")
                        .map(|v| v.as_str().map(String::from)),
                    schedule: args
                        .get("schedule")
                        .and_then(|v| v.as_str())
                        .map(String::from),
                    is_recurring: args.get("recurring").and_then(|v| v.as_bool()),
                    notify_before: args
                        .get("notify_before")
                        .map(|v| v.as_u64()),
                    enabled: args.get("enabled").and_then(|v| v.as_bool()),
                };
                let task = scheduler
                    .update(id, patch)
                    .await
                    .map_err(|e| ToolError::user(e.to_string()))?;
                serde_json::to_value(&task).map_err(|e| ToolError::internal(e.to_string()))
            },
            "delete" => {
                let id = args
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ToolError::user("delete requires 'id'"))?;
                scheduler
                    .delete(id)
                    .await
                    .map_err(|e| ToolError::user(e.to_string()))?;
                Ok(serde_json::json!({ "deleted": id }))
            },
            other => Err(ToolError::user(format!("unknown action '{other}'"))),
        }
    }
}
