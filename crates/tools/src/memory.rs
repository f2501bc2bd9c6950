//! The `save_memory` tool: appends durable notes to the workspace-local
//! `MEMORY.md`.

use {async_trait::async_trait, tracing::debug};

use {
    crate::registry::{Tool, ToolCtx},
    hearth_common::ToolError,
    hearth_sessions::FileChange,
};

const MEMORY_FILE: &str = "MEMORY.md";

pub struct SaveMemoryTool;

#[async_trait]
impl Tool for SaveMemoryTool {
    fn name(&self) -> &str {
        "save_memory"
    }

    fn description(&self) -> &str {
        "Append a note to the workspace MEMORY.md so it survives across \
         sessions. Use for durable facts, decisions, and preferences."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "note": {
                    "type": "string",
                    "description": "The note to remember (markdown)"
                }
            },
            "required": ["note"]
        })
    }

    fn requires_workspace(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolCtx,
    ) -> Result<serde_json::Value, ToolError> {
        let note = args
            .get("note")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ToolError::user("missing 'note' parameter"))?;

        let path = ctx.path_guard.resolve(MEMORY_FILE)?;
        let existing = tokio::fs::read_to_string(&path).await.unwrap_or_default();

        let mut updated = existing.clone();
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str("- ");
        updated.push_str(note);
        updated.push('\n');

        tokio::fs::write(&path, &updated)
            .await
            .map_err(|e| ToolError::external(format!("cannot write {MEMORY_FILE}: {e}")))?;

        debug!(bytes = note.len(), "memory note appended");
        ctx.record_file_change(FileChange::pending(MEMORY_FILE, 1, 0));

        Ok(serde_json::json!({ "saved": true, "file": MEMORY_FILE }))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        hearth_approval::ChatContext,
        hearth_guard::PathGuard,
        std::sync::Arc,
    };

    fn ctx(dir: &tempfile::TempDir) -> ToolCtx {
        ToolCtx::new(
            "s1",
            "chat1",
            ChatContext::Private,
            Arc::new(PathGuard::new(Some(dir.path().to_path_buf()))),
        )
    }

    #[tokio::test]
    async fn creates_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(&dir);

        SaveMemoryTool
            .execute(serde_json::json!({"note": "prefers tabs"}), &c)
            .await
            .unwrap();
        SaveMemoryTool
            .execute(serde_json::json!({"note": "deploys on Fridays"}), &c)
            .await
            .unwrap();

        let content = std::fs::read_to_string(dir.path().join("MEMORY.md")).unwrap();
        assert_eq!(content, "- prefers tabs\n- deploys on Fridays\n");
    }

    #[tokio::test]
    async fn appends_after_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("MEMORY.md"), "# Memory\nintro text").unwrap();

        SaveMemoryTool
            .execute(serde_json::json!({"note": "new fact"}), &ctx(&dir))
            .await
            .unwrap();

        let content = std::fs::read_to_string(dir.path().join("MEMORY.md")).unwrap();
        assert!(content.starts_with("# Memory\nintro text\n"));
        assert!(content.ends_with("- new fact\n"));
    }

    #[tokio::test]
    async fn blank_note_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = SaveMemoryTool
            .execute(serde_json::json!({"note": "   "}), &ctx(&dir))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "user");
    }
}
