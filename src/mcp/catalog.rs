// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Start-up population of the dispatcher registries.
//!
//! Prompts and resources are read from the watched directories; the only
//! built-in tool is `run_command`, a thin wrapper over the executor.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::engine_core::errors::{McpError, McpResult};
use crate::engine_core::models::{PromptDefinition, ResourceDefinition, ToolDefinition};
use crate::mcp::bridge::{file_uri, NotificationSink};
use crate::mcp::dispatcher::{handler_fn, Dispatcher, ToolHandler};

const MAX_SCAN_DEPTH: usize = 8;

fn collect_files(dir: &Path, depth: usize, out: &mut Vec<PathBuf>) -> McpResult<()> {
    if depth > MAX_SCAN_DEPTH {
        return Ok(());
    }
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, depth + 1, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

fn guess_mime(path: &Path) -> Option<&'static str> {
    match path.extension()?.to_str()? {
        "md" | "markdown" => Some("text/markdown"),
        "txt" => Some("text/plain"),
        "json" => Some("application/json"),
        "yaml" | "yml" => Some("application/yaml"),
        "html" | "htm" => Some("text/html"),
        "rs" | "py" | "js" | "ts" | "sh" | "toml" => Some("text/plain"),
        _ => None,
    }
}

/// One resource per file, addressed by its `file://` URI.
pub fn scan_resources(dir: &Path) -> McpResult<Vec<ResourceDefinition>> {
    let root = std::fs::canonicalize(dir)?;
    let mut files = Vec::new();
    collect_files(&root, 0, &mut files)?;
    Ok(files
        .into_iter()
        .map(|path| {
            let name = path
                .strip_prefix(&root)
                .unwrap_or(&path)
                .display()
                .to_string();
            let mut def = ResourceDefinition::new(file_uri(&path), name);
            def.mime_type = guess_mime(&path).map(str::to_string);
            def
        })
        .collect())
}

/// One prompt per text file; the file stem is the name and the content the
/// template. The first line, if it starts with `#`, doubles as description.
pub fn scan_prompts(dir: &Path) -> McpResult<Vec<PromptDefinition>> {
    let mut files = Vec::new();
    collect_files(dir, 0, &mut files)?;
    let mut prompts = Vec::new();
    for path in files {
        if !matches!(guess_mime(&path), Some("text/markdown" | "text/plain")) {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let template = std::fs::read_to_string(&path)?;
        let description = template
            .lines()
            .next()
            .and_then(|l| l.strip_prefix('#'))
            .map(|l| l.trim_start_matches('#').trim().to_string())
            .unwrap_or_else(|| name.to_string());
        debug!(prompt = name, path = %path.display(), "Loaded prompt");
        prompts.push(PromptDefinition {
            name: name.to_string(),
            description,
            arguments: None,
            template: Some(template),
        });
    }
    Ok(prompts)
}

/// Registers everything found under the given directories.
pub fn load_directories(
    dispatcher: &Dispatcher,
    prompts_dir: Option<&Path>,
    resources_dir: Option<&Path>,
) -> McpResult<()> {
    if let Some(dir) = prompts_dir {
        let prompts = scan_prompts(dir)?;
        info!(count = prompts.len(), dir = %dir.display(), "Registered prompts");
        prompts.into_iter().for_each(|p| dispatcher.register_prompt(p));
    }
    if let Some(dir) = resources_dir {
        let resources = scan_resources(dir)?;
        info!(count = resources.len(), dir = %dir.display(), "Registered resources");
        resources
            .into_iter()
            .for_each(|r| dispatcher.register_resource(r));
    }
    Ok(())
}

/// Notification sink that registers newly added files before announcing the
/// list change. Registries have no deletion, so removed files stay listed and
/// fail on read.
pub struct RescanningSink {
    dispatcher: Arc<Dispatcher>,
    prompts_dir: Option<PathBuf>,
    resources_dir: Option<PathBuf>,
}

impl RescanningSink {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        prompts_dir: Option<PathBuf>,
        resources_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            dispatcher,
            prompts_dir,
            resources_dir,
        }
    }
}

impl NotificationSink for RescanningSink {
    fn prompts_list_changed(&self) {
        if let Some(dir) = &self.prompts_dir {
            match scan_prompts(dir) {
                Ok(prompts) => prompts
                    .into_iter()
                    .for_each(|p| self.dispatcher.register_prompt(p)),
                Err(e) => warn!(dir = %dir.display(), "Prompt rescan failed: {}", e),
            }
        }
        self.dispatcher.emit_prompts_list_changed();
    }

    fn resources_list_changed(&self) {
        if let Some(dir) = &self.resources_dir {
            match scan_resources(dir) {
                Ok(resources) => resources
                    .into_iter()
                    .for_each(|r| self.dispatcher.register_resource(r)),
                Err(e) => warn!(dir = %dir.display(), "Resource rescan failed: {}", e),
            }
        }
        self.dispatcher.emit_resources_list_changed();
    }

    fn resource_updated(&self, uri: &str) {
        self.dispatcher.emit_resource_updated(uri);
    }

    fn tools_list_changed(&self) {
        self.dispatcher.emit_tools_list_changed();
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunCommandArgs {
    argv: Vec<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// `run_command`: executes an allow-listed command through the executor.
pub fn run_command_tool() -> (ToolDefinition, Arc<dyn ToolHandler>) {
    let definition = ToolDefinition::new(
        "run_command",
        "Run an allow-listed command without a shell and return its output",
        json!({
            "type": "object",
            "properties": {
                "argv": { "type": "array", "items": { "type": "string" }, "minItems": 1 },
                "timeoutMs": { "type": "integer", "minimum": 1 }
            },
            "required": ["argv"]
        }),
    );
    let handler = handler_fn(|arguments: Value, ctx| async move {
        let args: RunCommandArgs = serde_json::from_value(arguments)
            .map_err(|e| McpError::Validation(format!("Invalid run_command arguments: {}", e)))?;
        let output = ctx
            .executor()?
            .execute_command(&args.argv, args.timeout_ms.map(Duration::from_millis))
            .await?;
        serde_json::to_value(output)
            .map_err(|e| McpError::tool("E_INTERNAL", format!("Unserializable output: {}", e)))
    });
    (definition, handler)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_resources_skips_hidden_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.md"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join(".hidden"), "x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/c.json"), "{}").unwrap();

        let resources = scan_resources(dir.path()).unwrap();
        let names: Vec<_> = resources.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.md", "sub/c.json"]);
        assert!(resources[0].uri.starts_with("file://"));
        assert_eq!(resources[1].mime_type.as_deref(), Some("text/markdown"));
    }

    #[tokio::test]
    async fn test_rescan_registers_new_files() {
        use crate::config::Config;

        let dir = tempfile::tempdir().unwrap();
        let dispatcher = Arc::new(Dispatcher::new(&Config::default()));
        let mut notes = dispatcher.take_notifications().unwrap();
        let sink = RescanningSink::new(dispatcher.clone(), None, Some(dir.path().to_path_buf()));

        std::fs::write(dir.path().join("new.md"), "fresh").unwrap();
        sink.resources_list_changed();

        assert_eq!(dispatcher.stats().resources, 1);
        let note = notes.recv().await.unwrap();
        assert_eq!(note.method, "notifications/resources/list_changed");
    }

    #[test]
    fn test_scan_prompts_uses_heading() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("review.md"), "# Code review\nReview {{file}}").unwrap();
        std::fs::write(dir.path().join("data.bin"), [0u8, 1, 2]).unwrap();

        let prompts = scan_prompts(dir.path()).unwrap();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].name, "review");
        assert_eq!(prompts[0].description, "Code review");
    }
}
