//! Regex search over the working tree
//!
//! Read-only, so any number of searches may run side by side. Results are
//! cached per session for the cache TTL.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use super::{ProgressSink, Tool, ToolContext, ToolOutput};
use crate::{Error, Result};

/// Files larger than this are skipped
const MAX_FILE_BYTES: u64 = 1024 * 1024;

pub struct SearchTool {
    max_results: usize,
}

impl SearchTool {
    pub fn new(max_results: usize) -> Self {
        Self { max_results }
    }
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    if entry.depth() == 0 || !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || name == "target" || name == "node_modules"
}

/// Matching lines as `path:line: text`, relative to `root`
fn search_tree(root: &Path, pattern: &Regex, max_results: usize) -> Vec<String> {
    let mut hits = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_skipped_dir(e))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file());

    for entry in walker {
        if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
            continue;
        }
        // Binary and unreadable files are skipped
        let Ok(text) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let shown = entry.path().strip_prefix(root).unwrap_or(entry.path());
        for (number, line) in text.lines().enumerate() {
            if pattern.is_match(line) {
                hits.push(format!("{}:{}: {}", shown.display(), number + 1, line.trim()));
                if hits.len() >= max_results {
                    return hits;
                }
            }
        }
    }
    hits
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "Search"
    }

    fn description(&self) -> &str {
        "Search files under a directory for lines matching a regular expression"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string", "minLength": 1},
                "path": {"type": "string"},
                "max_results": {"type": "integer", "minimum": 1}
            },
            "required": ["pattern"]
        })
    }

    fn is_concurrency_safe(&self, _input: &Value) -> bool {
        true
    }

    async fn validate_input(&self, input: &Value, _ctx: &ToolContext) -> Result<()> {
        let pattern = input.get("pattern").and_then(Value::as_str).unwrap_or_default();
        Regex::new(pattern).map_err(|e| Error::Tool(format!("Invalid pattern: {}", e)))?;
        Ok(())
    }

    async fn call(
        &self,
        input: Value,
        ctx: &ToolContext,
        _progress: &ProgressSink,
    ) -> Result<ToolOutput> {
        let pattern = input
            .get("pattern")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Tool("pattern is required".to_string()))?
            .to_string();
        let root = match input.get("path").and_then(Value::as_str) {
            Some(path) => ctx.context.cwd.join(shellexpand::tilde(path).as_ref()),
            None => ctx.context.cwd.clone(),
        };
        let max_results = input
            .get("max_results")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(self.max_results)
            .min(self.max_results.max(1));

        let cache_key = format!("search:{}:{}:{}", root.display(), pattern, max_results);
        if let Some(hit) = ctx.session.cache.get(&cache_key) {
            debug!("Search cache hit: {}", cache_key);
            return Ok(ToolOutput::success(hit));
        }

        let regex = Regex::new(&pattern).map_err(|e| Error::Tool(e.to_string()))?;
        let walk_root: PathBuf = root.clone();
        let hits = tokio::select! {
            hits = tokio::task::spawn_blocking(move || search_tree(&walk_root, &regex, max_results)) => {
                hits.map_err(|e| Error::Tool(format!("search task failed: {}", e)))?
            }
            _ = ctx.abort.cancelled() => return Err(Error::Cancelled),
        };

        let content = if hits.is_empty() {
            format!("No matches for {} under {}", pattern, root.display())
        } else {
            hits.join("\n")
        };
        ctx.session.cache.insert(cache_key, content.clone());
        Ok(ToolOutput::success(content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::AbortScope;
    use crate::session::SessionContext;
    use crate::tools::ToolUseContext;
    use std::sync::Arc;
    use std::time::Duration;

    fn ctx(cwd: &Path) -> ToolContext {
        ToolContext {
            tool_use_id: "toolu_s".to_string(),
            context: ToolUseContext::new(cwd.to_path_buf()),
            session: Arc::new(SessionContext::new("s", "u", "popper", Duration::from_secs(60))),
            abort: AbortScope::new(),
        }
    }

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha\nbeta\ngamma beta\n").unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/config"), "beta\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_finds_lines_and_skips_hidden_dirs() {
        let dir = tree();
        let tool = SearchTool::new(10);
        let output = tool
            .call(json!({"pattern": "beta"}), &ctx(dir.path()), &ProgressSink::discard())
            .await
            .unwrap();
        assert_eq!(output.content, "a.txt:2: beta\na.txt:3: gamma beta");
    }

    #[tokio::test]
    async fn test_results_are_capped() {
        let dir = tree();
        let tool = SearchTool::new(1);
        let output = tool
            .call(
                json!({"pattern": "beta", "max_results": 50}),
                &ctx(dir.path()),
                &ProgressSink::discard(),
            )
            .await
            .unwrap();
        assert_eq!(output.content.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_repeat_search_is_served_from_cache() {
        let dir = tree();
        let context = ctx(dir.path());
        let tool = SearchTool::new(10);
        let first = tool
            .call(json!({"pattern": "alpha"}), &context, &ProgressSink::discard())
            .await
            .unwrap();
        std::fs::write(dir.path().join("b.txt"), "alpha again\n").unwrap();
        let second = tool
            .call(json!({"pattern": "alpha"}), &context, &ProgressSink::discard())
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(context.session.cache.len(), 1);
    }

    #[tokio::test]
    async fn test_bad_regex_rejected() {
        let dir = tree();
        let tool = SearchTool::new(10);
        assert!(tool
            .validate_input(&json!({"pattern": "("}), &ctx(dir.path()))
            .await
            .is_err());
    }
}
