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

//! Notification Bridge.
//!
//! Turns filesystem events under the prompts/resources/tools roots into
//! coalesced `list_changed` and `resources/updated` notifications. The first
//! queued signal starts a debounce window; when it closes the queue is
//! drained in one step and emitted in a fixed order.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use notify::event::{CreateKind, ModifyKind, RemoveKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::WatchConfig;
use crate::engine_core::constants::watcher;
use crate::engine_core::errors::{McpError, McpResult};

/// Receives flushed notifications, typically the dispatcher.
pub trait NotificationSink: Send + Sync {
    fn prompts_list_changed(&self);
    fn resources_list_changed(&self);
    fn resource_updated(&self, uri: &str);
    fn tools_list_changed(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchRoot {
    Prompts,
    Resources,
    Tools,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsChange {
    Added,
    Removed,
    /// File content changed.
    Changed,
    DirAdded,
    DirRemoved,
    Renamed,
}

impl FsChange {
    /// Maps a `notify` event kind; `None` for kinds that never notify.
    pub fn from_kind(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::Create(CreateKind::Folder) => Some(FsChange::DirAdded),
            EventKind::Create(_) => Some(FsChange::Added),
            EventKind::Remove(RemoveKind::Folder) => Some(FsChange::DirRemoved),
            EventKind::Remove(_) => Some(FsChange::Removed),
            EventKind::Modify(ModifyKind::Name(_)) => Some(FsChange::Renamed),
            EventKind::Modify(ModifyKind::Metadata(_)) => None,
            EventKind::Modify(_) => Some(FsChange::Changed),
            _ => None,
        }
    }
}

/// Pending signals for the current debounce window.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NotificationQueue {
    pub prompts: bool,
    pub resources: bool,
    pub tools: bool,
    pub resource_updates: BTreeSet<String>,
}

impl NotificationQueue {
    pub fn is_empty(&self) -> bool {
        !self.prompts && !self.resources && !self.tools && self.resource_updates.is_empty()
    }
}

pub fn file_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}

fn is_ignored(path: &Path) -> bool {
    let in_ignored_dir = path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .map(|s| watcher::IGNORED_COMPONENTS.contains(&s))
            .unwrap_or(false)
    });
    if in_ignored_dir {
        return true;
    }
    // Editor swap and backup files
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    name.ends_with('~')
        || name.ends_with(".swp")
        || name.ends_with(".swx")
        || name.starts_with(".#")
        || name == "4913"
}

struct Shared {
    roots: Vec<(WatchRoot, PathBuf)>,
    queue: Mutex<NotificationQueue>,
    wake: Notify,
    sink: Arc<dyn NotificationSink>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, NotificationQueue> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The root kind plus the path relative to that root.
    fn classify<'p>(&self, path: &'p Path) -> Option<(WatchRoot, &'p Path)> {
        self.roots.iter().find_map(|(kind, root)| {
            path.strip_prefix(root).ok().map(|relative| (*kind, relative))
        })
    }

    fn record(&self, path: &Path, change: FsChange) -> bool {
        let Some((root, relative)) = self.classify(path) else {
            return false;
        };
        // Only components below the root count; the root's ancestors may be
        // named `build` or `.cache` themselves.
        if is_ignored(relative) {
            trace!(path = %path.display(), "Ignoring change");
            return false;
        }
        {
            let mut queue = self.lock();
            match (root, change) {
                (WatchRoot::Prompts, _) => queue.prompts = true,
                (WatchRoot::Tools, _) => queue.tools = true,
                (WatchRoot::Resources, FsChange::Changed) => {
                    queue.resource_updates.insert(file_uri(path));
                }
                (WatchRoot::Resources, _) => queue.resources = true,
            }
        }
        debug!(path = %path.display(), ?root, ?change, "Queued change");
        self.wake.notify_one();
        true
    }

    fn flush(&self) -> NotificationQueue {
        let drained = std::mem::take(&mut *self.lock());
        if drained.is_empty() {
            return drained;
        }
        if drained.prompts {
            self.sink.prompts_list_changed();
        }
        if drained.resources {
            self.sink.resources_list_changed();
        }
        for uri in &drained.resource_updates {
            self.sink.resource_updated(uri);
        }
        if drained.tools {
            self.sink.tools_list_changed();
        }
        debug!(
            prompts = drained.prompts,
            resources = drained.resources,
            updates = drained.resource_updates.len(),
            tools = drained.tools,
            "Flushed notifications"
        );
        drained
    }
}

pub struct NotificationBridge {
    debounce: Duration,
    shared: Arc<Shared>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    debouncer: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationBridge {
    pub fn new(
        roots: Vec<(WatchRoot, PathBuf)>,
        debounce: Duration,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        // notify reports canonical paths, so compare against canonical roots.
        let roots = roots
            .into_iter()
            .map(|(kind, path)| (kind, std::fs::canonicalize(&path).unwrap_or(path)))
            .collect();
        Self {
            debounce,
            shared: Arc::new(Shared {
                roots,
                queue: Mutex::new(NotificationQueue::default()),
                wake: Notify::new(),
                sink,
            }),
            watcher: Mutex::new(None),
            debouncer: Mutex::new(None),
        }
    }

    pub fn from_config(config: &WatchConfig, sink: Arc<dyn NotificationSink>) -> Self {
        let roots = [
            (WatchRoot::Prompts, &config.prompts_dir),
            (WatchRoot::Resources, &config.resources_dir),
            (WatchRoot::Tools, &config.tools_dir),
        ]
        .into_iter()
        .filter_map(|(kind, dir)| dir.clone().map(|d| (kind, d)))
        .collect();
        Self::new(roots, Duration::from_millis(config.debounce_ms), sink)
    }

    pub fn roots(&self) -> &[(WatchRoot, PathBuf)] {
        &self.shared.roots
    }

    /// Queues one filesystem change. Returns false if it was ignored.
    pub fn record(&self, path: &Path, change: FsChange) -> bool {
        self.shared.record(path, change)
    }

    pub fn queue_snapshot(&self) -> NotificationQueue {
        self.shared.lock().clone()
    }

    /// Drains and emits immediately, bypassing the timer.
    pub fn flush_now(&self) -> NotificationQueue {
        self.shared.flush()
    }

    /// Starts the debounce task and the filesystem watcher.
    pub fn start(&self) -> McpResult<()> {
        self.spawn_debouncer();
        self.watch()
    }

    /// Starts only the debounce task; changes come from [`record`](Self::record).
    pub fn spawn_debouncer(&self) {
        let Ok(mut slot) = self.debouncer.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }
        let shared = self.shared.clone();
        let debounce = self.debounce;
        *slot = Some(tokio::spawn(async move {
            loop {
                shared.wake.notified().await;
                // Each new change restarts the window; flush after `debounce` of quiet.
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(debounce) => break,
                        _ = shared.wake.notified() => {}
                    }
                }
                shared.flush();
            }
        }));
    }

    fn watch(&self) -> McpResult<()> {
        let shared = self.shared.clone();
        let mut fs_watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    if let Some(change) = FsChange::from_kind(&event.kind) {
                        for path in &event.paths {
                            shared.record(path, change);
                        }
                    }
                }
                Err(e) => warn!("Watch error: {}", e),
            }
        })
        .map_err(|e| McpError::Configuration(format!("Failed to create watcher: {}", e)))?;

        for (kind, root) in &self.shared.roots {
            fs_watcher
                .watch(root, RecursiveMode::Recursive)
                .map_err(|e| {
                    McpError::Configuration(format!(
                        "Cannot watch {:?} root {}: {}",
                        kind,
                        root.display(),
                        e
                    ))
                })?;
            info!(?kind, root = %root.display(), "Watching");
        }

        if let Ok(mut slot) = self.watcher.lock() {
            *slot = Some(fs_watcher);
        }
        Ok(())
    }

    /// Stops watching and discards anything still queued.
    pub fn stop(&self) {
        if let Ok(mut slot) = self.watcher.lock() {
            slot.take();
        }
        if let Some(task) = self.debouncer.lock().ok().and_then(|mut t| t.take()) {
            task.abort();
        }
        *self.shared.lock() = NotificationQueue::default();
    }
}

impl Drop for NotificationBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl NotificationSink for RecordingSink {
        fn prompts_list_changed(&self) {
            self.calls.lock().unwrap().push("prompts".into());
        }
        fn resources_list_changed(&self) {
            self.calls.lock().unwrap().push("resources".into());
        }
        fn resource_updated(&self, uri: &str) {
            self.calls.lock().unwrap().push(format!("updated:{}", uri));
        }
        fn tools_list_changed(&self) {
            self.calls.lock().unwrap().push("tools".into());
        }
    }

    fn bridge(sink: Arc<RecordingSink>) -> NotificationBridge {
        NotificationBridge::new(
            vec![
                (WatchRoot::Prompts, PathBuf::from("/srv/prompts")),
                (WatchRoot::Resources, PathBuf::from("/srv/resources")),
                (WatchRoot::Tools, PathBuf::from("/srv/tools")),
            ],
            Duration::from_millis(300),
            sink,
        )
    }

    #[test]
    fn test_kind_mapping() {
        use notify::event::{DataChange, MetadataKind, RenameMode};
        assert_eq!(
            FsChange::from_kind(&EventKind::Create(CreateKind::Folder)),
            Some(FsChange::DirAdded)
        );
        assert_eq!(
            FsChange::from_kind(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            Some(FsChange::Changed)
        );
        assert_eq!(
            FsChange::from_kind(&EventKind::Modify(ModifyKind::Name(RenameMode::Both))),
            Some(FsChange::Renamed)
        );
        assert_eq!(
            FsChange::from_kind(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any))),
            None
        );
    }

    #[test]
    fn test_classification_and_ignores() {
        let sink = Arc::new(RecordingSink::default());
        let b = bridge(sink);
        assert!(!b.record(Path::new("/srv/resources/.git/HEAD"), FsChange::Changed));
        assert!(!b.record(Path::new("/srv/resources/a.md.swp"), FsChange::Changed));
        assert!(!b.record(Path::new("/elsewhere/a.md"), FsChange::Changed));
        assert!(b.record(Path::new("/srv/resources/a.md"), FsChange::Changed));
        assert!(b.record(Path::new("/srv/resources/new"), FsChange::DirAdded));
        assert!(b.record(Path::new("/srv/tools/t.json"), FsChange::Changed));

        let q = b.queue_snapshot();
        assert!(q.resources && q.tools && !q.prompts);
        assert_eq!(
            q.resource_updates.iter().collect::<Vec<_>>(),
            vec!["file:///srv/resources/a.md"]
        );
    }

    #[test]
    fn test_flush_order_and_clear() {
        let sink = Arc::new(RecordingSink::default());
        let b = bridge(sink.clone());
        b.record(Path::new("/srv/tools/x"), FsChange::Added);
        b.record(Path::new("/srv/resources/b.md"), FsChange::Changed);
        b.record(Path::new("/srv/resources/a.md"), FsChange::Changed);
        b.record(Path::new("/srv/resources/c.md"), FsChange::Removed);
        b.record(Path::new("/srv/prompts/p.md"), FsChange::Changed);
        b.flush_now();

        assert_eq!(
            sink.calls(),
            vec![
                "prompts",
                "resources",
                "updated:file:///srv/resources/a.md",
                "updated:file:///srv/resources/b.md",
                "tools",
            ]
        );
        assert!(b.queue_snapshot().is_empty());
        assert!(b.flush_now().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_edits_coalesce_into_one_update() {
        let sink = Arc::new(RecordingSink::default());
        let b = bridge(sink.clone());
        b.spawn_debouncer();

        for _ in 0..10 {
            b.record(Path::new("/srv/resources/a.md"), FsChange::Changed);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(sink.calls(), vec!["updated:file:///srv/resources/a.md"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_emitted_before_window_closes() {
        let sink = Arc::new(RecordingSink::default());
        let b = bridge(sink.clone());
        b.spawn_debouncer();

        b.record(Path::new("/srv/prompts/p.md"), FsChange::Added);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sink.calls().is_empty());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sink.calls(), vec!["prompts"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_edits_longer_than_window_flush_once() {
        let sink = Arc::new(RecordingSink::default());
        let b = bridge(sink.clone());
        b.spawn_debouncer();

        // 10 edits 100ms apart span 900ms, three times the 300ms window,
        // but there is never 300ms of quiet between them.
        for _ in 0..10 {
            b.record(Path::new("/srv/resources/a.md"), FsChange::Changed);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(sink.calls().is_empty());
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(sink.calls(), vec!["updated:file:///srv/resources/a.md"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_bursts_flush_separately() {
        let sink = Arc::new(RecordingSink::default());
        let b = bridge(sink.clone());
        b.spawn_debouncer();

        b.record(Path::new("/srv/tools/t.json"), FsChange::Changed);
        tokio::time::sleep(Duration::from_millis(400)).await;
        b.record(Path::new("/srv/tools/t.json"), FsChange::Changed);
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(sink.calls(), vec!["tools", "tools"]);
    }

    #[test]
    fn test_root_below_ignored_directory_name_still_reports() {
        let sink = Arc::new(RecordingSink::default());
        let b = NotificationBridge::new(
            vec![
                (WatchRoot::Resources, PathBuf::from("/home/u/build/resources")),
                (WatchRoot::Prompts, PathBuf::from("/home/u/.cache/prompts")),
            ],
            Duration::from_millis(300),
            sink,
        );
        assert!(b.record(Path::new("/home/u/build/resources/a.md"), FsChange::Changed));
        assert!(b.record(Path::new("/home/u/.cache/prompts/p.md"), FsChange::Added));
        // Ignored names below the root are still filtered.
        assert!(!b.record(
            Path::new("/home/u/build/resources/target/out.md"),
            FsChange::Changed
        ));
        assert!(!b.record(Path::new("/home/u/build/resources/a.md~"), FsChange::Changed));

        let q = b.queue_snapshot();
        assert!(q.prompts);
        assert_eq!(
            q.resource_updates.iter().collect::<Vec<_>>(),
            vec!["file:///home/u/build/resources/a.md"]
        );
    }
}
