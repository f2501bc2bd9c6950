//! File-operation tools. Every path goes through the session's
//! [`hearth_guard::PathGuard`]; writes record pending file changes.

use {async_trait::async_trait, tracing::debug};

use {
    crate::registry::{Tool, ToolCtx},
    hearth_common::ToolError,
    hearth_sessions::FileChange,
};

/// Line count of a text blob, for diff stats.
fn line_count(s: &str) -> u64 {
    if s.is_empty() {
        0
    } else {
        s.lines().count() as u64
    }
}

// ── read_file ───────────────────────────────────────────────────────────────

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from the workspace. Returns its content as text."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, relative to the workspace root"
                }
            },
            "required": ["path"]
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
        let path = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::user("missing 'path' parameter"))?;
        let resolved = ctx.path_guard.resolve(path)?;

        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| ToolError::user(format!("cannot read '{path}': {e}")))?;

        Ok(serde_json::json!({
            "path": path,
            "content": content,
            "lines": line_count(&content),
        }))
    }
}

// ── write_file ──────────────────────────────────────────────────────────────

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file in the workspace with the given content. \
         Parent directories are created as needed."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, relative to the workspace root"
                },
                "content": {
                    "type": "string",
                    "description": "Full new file content"
                }
            },
            "required": ["path", "content"]
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
        let path = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::user("missing 'path' parameter"))?;
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::user("missing 'content' parameter"))?;
        let resolved = ctx.path_guard.resolve(path)?;

        let previous = tokio::fs::read_to_string(&resolved).await.unwrap_or_default();

        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::external(format!("cannot create directories: {e}")))?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| ToolError::external(format!("cannot write '{path}': {e}")))?;

        debug!(path, bytes = content.len(), "file written");
        ctx.record_file_change(FileChange::pending(
            path,
            line_count(content),
            line_count(&previous),
        ));

        Ok(serde_json::json!({ "path": path, "bytes": content.len() }))
    }
}

// ── edit_file ───────────────────────────────────────────────────────────────

pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace an exact text snippet in a workspace file. The snippet must \
         occur exactly once; use a larger snippet to disambiguate."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, relative to the workspace root"
                },
                "old_text": {
                    "type": "string",
                    "description": "Exact text to replace (must match once)"
                },
                "new_text": {
                    "type": "string",
                    "description": "Replacement text"
                }
            },
            "required": ["path", "old_text", "new_text"]
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
        let path = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::user("missing 'path' parameter"))?;
        let old_text = args
            .get("old_text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::user("missing 'old_text' parameter"))?;
        let new_text = args
            .get("new_text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::user("missing 'new_text' parameter"))?;
        let resolved = ctx.path_guard.resolve(path)?;

        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| ToolError::user(format!("cannot read '{path}': {e}")))?;

        let occurrences = content.matches(old_text).count();
        if occurrences == 0 {
            return Err(ToolError::user(format!(
                "old_text not found in '{path}'"
            )));
        }
        if occurrences > 1 {
            return Err(ToolError::user(format!(
                "old_text occurs {occurrences} times in '{path}' — provide more context"
            )));
        }

        let updated = content.replacen(old_text, new_text, 1);
        tokio::fs::write(&resolved, &updated)
            .await
            .map_err(|e| ToolError::external(format!("cannot write '{path}': {e}")))?;

        ctx.record_file_change(FileChange::pending(
            path,
            line_count(new_text),
            line_count(old_text),
        ));

        Ok(serde_json::json!({ "path": path, "replaced": true }))
    }
}

// ── list_dir ────────────────────────────────────────────────────────────────

pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the entries of a workspace directory."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory path, relative to the workspace root (default: the root)"
                }
            },
            "required": []
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
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let resolved = ctx.path_guard.resolve(path)?;

        let mut reader = tokio::fs::read_dir(&resolved)
            .await
            .map_err(|e| ToolError::user(format!("cannot list '{path}': {e}")))?;

        let mut entries = Vec::new();
        while let Ok(Some(entry)) = reader.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push(serde_json::json!({ "name": name, "dir": is_dir }));
        }
        entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));

        Ok(serde_json::json!({ "path": path, "entries": entries }))
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
    async fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(&dir);

        let out = WriteFileTool
            .execute(
                serde_json::json!({"path": "notes.txt", "content": "line one\nline two\n"}),
                &c,
            )
            .await
            .unwrap();
        assert_eq!(out["bytes"], 18);

        let out = ReadFileTool
            .execute(serde_json::json!({"path": "notes.txt"}), &c)
            .await
            .unwrap();
        assert_eq!(out["content"], "line one\nline two\n");
        assert_eq!(out["lines"], 2);
    }

    #[tokio::test]
    async fn write_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(&dir);
        WriteFileTool
            .execute(
                serde_json::json!({"path": "a/b/c.txt", "content": "x"}),
                &c,
            )
            .await
            .unwrap();
        assert!(dir.path().join("a/b/c.txt").exists());
    }

    #[tokio::test]
    async fn path_escape_rejected_and_fs_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(&dir);
        let err = WriteFileTool
            .execute(
                serde_json::json!({"path": "../../etc/passwd", "content": "evil"}),
                &c,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("outside the working directory"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("passwd"), "secret").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let c = ctx(&dir);
        let err = ReadFileTool
            .execute(serde_json::json!({"path": "link/passwd"}), &c)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("outside the working directory"));
    }

    #[tokio::test]
    async fn read_missing_file_is_user_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ReadFileTool
            .execute(serde_json::json!({"path": "nope.txt"}), &ctx(&dir))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "user");
    }

    #[tokio::test]
    async fn edit_replaces_unique_snippet() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(&dir);
        std::fs::write(dir.path().join("main.rs"), "fn main() {\n    old();\n}\n").unwrap();

        EditFileTool
            .execute(
                serde_json::json!({
                    "path": "main.rs",
                    "old_text": "    old();",
                    "new_text": "    new();",
                }),
                &c,
            )
            .await
            .unwrap();

        let content = std::fs::read_to_string(dir.path().join("main.rs")).unwrap();
        assert!(content.contains("new();"));
        assert!(!content.contains("old();"));
    }

    #[tokio::test]
    async fn edit_rejects_ambiguous_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(&dir);
        std::fs::write(dir.path().join("f.txt"), "dup\ndup\n").unwrap();

        let err = EditFileTool
            .execute(
                serde_json::json!({"path": "f.txt", "old_text": "dup", "new_text": "x"}),
                &c,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("2 times"));

        let err = EditFileTool
            .execute(
                serde_json::json!({"path": "f.txt", "old_text": "absent", "new_text": "x"}),
                &c,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn list_dir_sorted_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::write(dir.path().join("a.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let out = ListDirTool
            .execute(serde_json::json!({}), &ctx(&dir))
            .await
            .unwrap();
        let entries = out["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0]["name"], "a.txt");
        assert_eq!(entries[2]["name"], "sub");
        assert_eq!(entries[2]["dir"], true);
    }

    #[tokio::test]
    async fn overwrite_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(&dir);
        std::fs::write(dir.path().join("f.txt"), "one\ntwo\nthree\n").unwrap();

        WriteFileTool
            .execute(
                serde_json::json!({"path": "f.txt", "content": "one\n"}),
                &c,
            )
            .await
            .unwrap();
        let content = std::fs::read_to_string(dir.path().join("f.txt")).unwrap();
        assert_eq!(content, "one\n");
    }
}
