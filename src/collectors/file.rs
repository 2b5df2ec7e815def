//! File activity observer over user-data directories. Notification-driven by
//! default, with a recursive walk for scan mode and on-demand reconciliation.
//! Both paths share the skip rules and the per-path debounce cache.

use super::{hash_file, new_event_id, normalize_path, EventSender, FileEvent, FileEventType, Severity};
use crate::config::{FileConfig, FileMode};
use crate::error::CollectError;
use crate::shutdown::Shutdown;
use chrono::{DateTime, Utc};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const SKIP_EXTENSIONS: &[&str] = &[".tmp", ".log", ".bak", ".old", ".cache"];
const SYSTEM_DIRS: &[&str] = &["/windows/", "/program files/", "/programdata/", "/proc/", "/sys/"];

const SUSPICIOUS_FILE_DIRS: &[&str] = &[
    "/temp/",
    "/tmp/",
    "/downloads/",
    "/desktop/",
    "/appdata/local/temp/",
    "/appdata/roaming/temp/",
];
const EXECUTABLE_EXTENSIONS: &[&str] = &[".exe", ".bat", ".cmd", ".ps1", ".vbs", ".js"];
const LARGE_FILE_BYTES: u64 = 500 * 1024 * 1024;

/// Raw notifications buffered between the watcher thread and the observer task
const WATCH_BUFFER: usize = 4096;

/// Operation class derived from a change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
}

impl From<ChangeKind> for FileEventType {
    fn from(k: ChangeKind) -> Self {
        match k {
            ChangeKind::Create => FileEventType::Create,
            ChangeKind::Modify => FileEventType::Modify,
            ChangeKind::Delete => FileEventType::Delete,
        }
    }
}

/// Map a notification to (path, change) pairs. Access, directory and unclassified events yield nothing.
fn classify(event: &notify::Event) -> Vec<(PathBuf, ChangeKind)> {
    let single = |kind: ChangeKind| -> Vec<(PathBuf, ChangeKind)> {
        event.paths.iter().map(|p| (p.clone(), kind)).collect()
    };
    match &event.kind {
        // a removed directory has no metadata left for accept() to inspect
        EventKind::Create(CreateKind::Folder) | EventKind::Remove(RemoveKind::Folder) => Vec::new(),
        EventKind::Create(_) => single(ChangeKind::Create),
        EventKind::Remove(_) => single(ChangeKind::Delete),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => single(ChangeKind::Create),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => event
            .paths
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let kind = if i == 0 { ChangeKind::Delete } else { ChangeKind::Create };
                (p.clone(), kind)
            })
            .collect(),
        EventKind::Modify(ModifyKind::Name(_)) => single(ChangeKind::Delete),
        EventKind::Modify(_) => single(ChangeKind::Modify),
        _ => Vec::new(),
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

/// Temp files, logs and system directories are never reported
pub fn should_skip_path(path: &Path) -> bool {
    let ext = extension_of(path);
    if SKIP_EXTENSIONS.contains(&ext.as_str()) {
        return true;
    }
    let lower = normalize_path(&path.to_string_lossy());
    SYSTEM_DIRS.iter().any(|d| lower.contains(d))
}

/// Severity of a file event. Pure: depends only on path and size.
pub fn file_severity(path: &Path, size: Option<u64>) -> Severity {
    let lower = normalize_path(&path.to_string_lossy());
    if SUSPICIOUS_FILE_DIRS.iter().any(|d| lower.contains(d)) {
        return Severity::Medium;
    }
    if EXECUTABLE_EXTENSIONS.contains(&extension_of(path).as_str()) {
        return Severity::Medium;
    }
    if size.map_or(false, |s| s > LARGE_FILE_BYTES) {
        return Severity::Medium;
    }
    Severity::Low
}

pub struct FileObserver {
    agent_id: String,
    dirs: Vec<PathBuf>,
    mode: FileMode,
    scan_interval: Duration,
    max_depth: usize,
    debounce: chrono::Duration,
    retention: chrono::Duration,
    hash_limit: u64,
    /// path -> last time an event was emitted for it
    recent: Mutex<HashMap<PathBuf, DateTime<Utc>>>,
    tx: EventSender<FileEvent>,
}

impl FileObserver {
    pub fn new(agent_id: impl Into<String>, config: &FileConfig, tx: EventSender<FileEvent>) -> Self {
        Self {
            agent_id: agent_id.into(),
            dirs: config.resolved_dirs(),
            mode: config.mode,
            scan_interval: Duration::from_secs(config.scan_interval_secs.max(1)),
            max_depth: config.scan_max_depth,
            debounce: chrono::Duration::seconds(config.debounce_secs as i64),
            retention: chrono::Duration::seconds(config.retention_secs as i64),
            hash_limit: config.hash_limit_bytes,
            recent: Mutex::new(HashMap::new()),
            tx,
        }
    }

    /// Apply skip and debounce rules; on acceptance the path is marked seen and an event built.
    pub fn accept(&self, path: &Path, change: FileEventType, now: DateTime<Utc>) -> Option<FileEvent> {
        let meta = std::fs::metadata(path).ok();
        match &meta {
            Some(m) if m.is_dir() => return None,
            None if change != FileEventType::Delete => return None,
            _ => {}
        }
        if should_skip_path(path) {
            return None;
        }
        {
            let mut recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(last) = recent.get(path) {
                if now.signed_duration_since(*last) < self.debounce {
                    return None;
                }
            }
            recent.insert(path.to_path_buf(), now);
        }

        let size = meta.as_ref().map(|m| m.len());
        let file_hash = match size {
            Some(s) if s < self.hash_limit => hash_file(path, self.hash_limit),
            _ => None,
        };
        Some(FileEvent {
            id: new_event_id(),
            agent_id: self.agent_id.clone(),
            process_id: None,
            process_name: None,
            file_path: path.to_string_lossy().to_string(),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            file_type: extension_of(path),
            file_size: size,
            file_hash,
            event_type: change,
            timestamp: now,
            severity: file_severity(path, size),
            created_at: now,
        })
    }

    /// Handle one classified notification; returns whether an event was queued
    pub fn handle_change(&self, path: &Path, change: ChangeKind, now: DateTime<Utc>) -> bool {
        match self.accept(path, change.into(), now) {
            Some(ev) => {
                debug!(path = %ev.file_path, kind = ev.event_type.as_str(), "file event");
                self.tx.push(ev)
            }
            None => false,
        }
    }

    /// Recursive walk of every observed directory, producing `monitor` events
    pub fn scan(&self, now: DateTime<Utc>) -> Vec<FileEvent> {
        let mut events = Vec::new();
        for root in &self.dirs {
            if !root.exists() {
                continue;
            }
            for entry in WalkDir::new(root)
                .max_depth(self.max_depth)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Some(ev) = self.accept(entry.path(), FileEventType::Monitor, now) {
                    events.push(ev);
                }
            }
        }
        events
    }

    /// Drop cache entries older than the retention window
    pub fn evict(&self, now: DateTime<Utc>) -> usize {
        let mut recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
        let before = recent.len();
        let cutoff = now - self.retention;
        recent.retain(|_, seen| *seen >= cutoff);
        before - recent.len()
    }

    pub fn cached_paths(&self) -> usize {
        self.recent.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn dropped(&self) -> u64 {
        self.tx.dropped()
    }

    fn start_watcher(
        &self,
    ) -> Result<(RecommendedWatcher, mpsc::Receiver<notify::Result<notify::Event>>), CollectError> {
        let (raw_tx, raw_rx) = mpsc::channel(WATCH_BUFFER);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                // never block the notification thread
                let _ = raw_tx.try_send(res);
            },
            Config::default(),
        )?;
        let mut watched = 0;
        for dir in &self.dirs {
            match watcher.watch(dir, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    watched += 1;
                    debug!(dir = %dir.display(), "watching directory");
                }
                Err(e) => warn!(dir = %dir.display(), error = %e, "failed to watch directory"),
            }
        }
        info!(watched, "file notifications active");
        Ok((watcher, raw_rx))
    }

    /// Notification loop, or periodic scan when configured (or when no watcher is available)
    pub async fn run(self: Arc<Self>, shutdown: Shutdown) {
        if self.mode == FileMode::Notify {
            match self.start_watcher() {
                Ok((watcher, rx)) => {
                    self.watch_loop(watcher, rx, shutdown).await;
                    return;
                }
                Err(e) => warn!(error = %e, "file watcher unavailable, falling back to periodic scan"),
            }
        }
        self.scan_loop(shutdown).await;
    }

    async fn watch_loop(
        self: Arc<Self>,
        _watcher: RecommendedWatcher,
        mut rx: mpsc::Receiver<notify::Result<notify::Event>>,
        mut shutdown: Shutdown,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.wait() => break,
                msg = rx.recv() => match msg {
                    Some(Ok(event)) => event,
                    Some(Err(e)) => {
                        warn!(error = %e, "file watcher error");
                        continue;
                    }
                    None => break,
                },
            };
            let changes = classify(&event);
            if changes.is_empty() {
                continue;
            }
            // metadata and hashing touch the disk
            let observer = Arc::clone(&self);
            let handled = tokio::task::spawn_blocking(move || {
                let now = Utc::now();
                for (path, change) in changes {
                    observer.handle_change(&path, change, now);
                }
            });
            tokio::select! {
                _ = shutdown.wait() => break,
                res = handled => {
                    if let Err(e) = res {
                        warn!(error = %e, "file change task failed");
                    }
                }
            }
        }
        info!("file monitoring stopped");
    }

    async fn scan_loop(self: Arc<Self>, mut shutdown: Shutdown) {
        info!(interval_secs = self.scan_interval.as_secs(), "periodic file scan started");
        let mut ticker = tokio::time::interval(self.scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }
            let observer = Arc::clone(&self);
            let walk = tokio::task::spawn_blocking(move || {
                for ev in observer.scan(Utc::now()) {
                    observer.tx.push(ev);
                }
            });
            tokio::select! {
                _ = shutdown.wait() => break,
                res = walk => {
                    if let Err(e) = res {
                        warn!(error = %e, "file scan task failed");
                    }
                }
            }
        }
        info!("file monitoring stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, DataChange};

    fn event(kind: EventKind, paths: &[&str]) -> notify::Event {
        paths
            .iter()
            .fold(notify::Event::new(kind), |ev, p| ev.add_path(PathBuf::from(p)))
    }

    fn kinds(ev: &notify::Event) -> Vec<(String, ChangeKind)> {
        classify(ev)
            .into_iter()
            .map(|(p, k)| (p.to_string_lossy().to_string(), k))
            .collect()
    }

    #[test]
    fn create_and_remove() {
        let created = event(EventKind::Create(CreateKind::File), &["/w/a.txt"]);
        assert_eq!(kinds(&created), vec![("/w/a.txt".to_string(), ChangeKind::Create)]);
        let removed = event(EventKind::Remove(RemoveKind::File), &["/w/a.txt"]);
        assert_eq!(kinds(&removed), vec![("/w/a.txt".to_string(), ChangeKind::Delete)]);
        let removed_any = event(EventKind::Remove(RemoveKind::Any), &["/w/b.txt"]);
        assert_eq!(kinds(&removed_any), vec![("/w/b.txt".to_string(), ChangeKind::Delete)]);
    }

    #[test]
    fn directories_are_ignored() {
        assert!(classify(&event(EventKind::Create(CreateKind::Folder), &["/w/sub"])).is_empty());
        assert!(classify(&event(EventKind::Remove(RemoveKind::Folder), &["/w/sub"])).is_empty());
    }

    #[test]
    fn renames() {
        let both = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/w/old.txt", "/w/new.txt"],
        );
        assert_eq!(
            kinds(&both),
            vec![
                ("/w/old.txt".to_string(), ChangeKind::Delete),
                ("/w/new.txt".to_string(), ChangeKind::Create),
            ]
        );
        let to = event(EventKind::Modify(ModifyKind::Name(RenameMode::To)), &["/w/new.txt"]);
        assert_eq!(kinds(&to), vec![("/w/new.txt".to_string(), ChangeKind::Create)]);
        let from = event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &["/w/old.txt"]);
        assert_eq!(kinds(&from), vec![("/w/old.txt".to_string(), ChangeKind::Delete)]);
    }

    #[test]
    fn modify_and_access() {
        let written = event(EventKind::Modify(ModifyKind::Data(DataChange::Content)), &["/w/a.txt"]);
        assert_eq!(kinds(&written), vec![("/w/a.txt".to_string(), ChangeKind::Modify)]);
        assert!(classify(&event(EventKind::Access(AccessKind::Any), &["/w/a.txt"])).is_empty());
        assert!(classify(&event(EventKind::Other, &["/w/a.txt"])).is_empty());
    }

    #[test]
    fn removed_directory_never_reaches_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("subdir");
        std::fs::create_dir(&sub).unwrap();
        std::fs::remove_dir(&sub).unwrap();

        let (tx, mut rx) = crate::collectors::event_queue("file", 8);
        let config = FileConfig {
            watch_dirs: vec![dir.path().to_path_buf()],
            ..FileConfig::default()
        };
        let observer = FileObserver::new("agent-1", &config, tx);
        let ev = event(EventKind::Remove(RemoveKind::Folder), &[sub.to_str().unwrap()]);
        for (path, change) in classify(&ev) {
            observer.handle_change(&path, change, Utc::now());
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(observer.cached_paths(), 0);
    }
}
