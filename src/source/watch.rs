//! Dynamic discovery of files in a watched directory.
//!
//! A polling scanner diffs directory snapshots into Created/Modified/Removed
//! events; the registry turns those into tail tasks, one per file, each with
//! its own cancel token. Files tailed this way start at their current end
//! and are never checkpointed: the target is short-lived, frequently rotated
//! files where replay after a restart is not required.

use crate::broker::Producer;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Filesystem change relevant to the registry. Closed set; every consumer
/// matches exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Modified,
    Removed,
}

#[derive(Debug, Clone)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: EventKind,
}

/// What the registry decided about an observed event.
#[derive(Debug)]
pub enum Observation {
    /// Path was unknown and passed the name filter: the caller must spawn a
    /// tail task bound to this token.
    StartTailing(CancellationToken),
    /// A task for this path is already running.
    AlreadyTailing,
    /// Base name did not match the configured pattern.
    Rejected,
    /// A tracked path went away; its token has been fired.
    Retired,
    /// A removal for a path that was never tracked; nothing to do.
    Untracked,
}

/// Path to cancel-token map, the single source of truth for which files are
/// currently tailed. One lock serializes registration and removal; it is
/// held only for the map mutation, never across I/O; tokens are fired and
/// tasks spawned after release.
pub struct FileRegistry {
    entries: Mutex<HashMap<PathBuf, CancellationToken>>,
    name_filter: Option<regex::Regex>,
    shutdown: CancellationToken,
}

impl FileRegistry {
    pub fn new(name_filter: Option<regex::Regex>, shutdown: CancellationToken) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            name_filter,
            shutdown,
        }
    }

    pub fn observe(&self, event: &FileEvent) -> Observation {
        match event.kind {
            EventKind::Removed => {
                let removed = self.entries.lock().unwrap().remove(&event.path);
                match removed {
                    Some(token) => {
                        // Idempotent: firing an already-cancelled token is a
                        // no-op, as is removing an unknown path.
                        token.cancel();
                        Observation::Retired
                    }
                    None => Observation::Untracked,
                }
            }
            EventKind::Created | EventKind::Modified => {
                if !self.name_matches(&event.path) {
                    return Observation::Rejected;
                }
                let mut entries = self.entries.lock().unwrap();
                if entries.contains_key(&event.path) {
                    return Observation::AlreadyTailing;
                }
                // Child of the shutdown token, so global shutdown reaches
                // every tail task without touching the registry.
                let token = self.shutdown.child_token();
                entries.insert(event.path.clone(), token.clone());
                Observation::StartTailing(token)
            }
        }
    }

    pub fn tracked(&self, path: &Path) -> bool {
        self.entries.lock().unwrap().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    fn name_matches(&self, path: &Path) -> bool {
        let Some(filter) = &self.name_filter else {
            return true;
        };
        match path.file_name() {
            Some(name) => filter.is_match(&name.to_string_lossy()),
            None => false,
        }
    }
}

/// Diff directory snapshots on an interval and emit events. Subdirectories
/// are ignored; only regular files are considered.
pub async fn scan_directory(
    dir: PathBuf,
    interval: Duration,
    events: mpsc::Sender<FileEvent>,
    cancel: CancellationToken,
) -> Result<(), WatchError> {
    let mut known: HashMap<PathBuf, (u64, Option<SystemTime>)> = HashMap::new();
    let mut tick = tokio::time::interval(interval);
    info!(dir = %dir.display(), "watching directory");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(dir = %dir.display(), "directory watch stopped");
                return Ok(());
            }
            _ = tick.tick() => {}
        }

        let mut seen: HashMap<PathBuf, (u64, Option<SystemTime>)> = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };
            seen.insert(entry.path(), (meta.len(), meta.modified().ok()));
        }

        for (path, state) in &seen {
            let kind = match known.get(path) {
                None => Some(EventKind::Created),
                Some(prev) if prev != state => Some(EventKind::Modified),
                Some(_) => None,
            };
            if let Some(kind) = kind {
                if events
                    .send(FileEvent { path: path.clone(), kind })
                    .await
                    .is_err()
                {
                    return Ok(());
                }
            }
        }
        for path in known.keys() {
            if !seen.contains_key(path) {
                if events
                    .send(FileEvent { path: path.clone(), kind: EventKind::Removed })
                    .await
                    .is_err()
                {
                    return Ok(());
                }
            }
        }
        known = seen;
    }
}

/// Tail one discovered file from its current end, publishing each line
/// individually. Once the token fires, reading continues until end of
/// stream is observed, then the task stops and the descriptor closes.
pub async fn tail_from_end(
    path: PathBuf,
    topic: String,
    producer: Arc<tokio::sync::Mutex<Box<dyn Producer>>>,
    backoff: Duration,
    cancel: CancellationToken,
) -> Result<(), WatchError> {
    let file = File::open(&path).await?;
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::End(0)).await?;
    info!(path = %path.display(), topic = %topic, "tailing discovered file");

    let mut line: Vec<u8> = Vec::new();
    loop {
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 || !line.ends_with(b"\n") {
            if cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(backoff) => {}
            }
            continue;
        }

        let mut conn = producer.lock().await;
        if let Err(e) = conn.publish(&topic, &line).await {
            warn!(path = %path.display(), error = %e, "publish failed, line dropped");
        }
        drop(conn);
        line.clear();
    }

    debug!(path = %path.display(), "discovered file retired");
    Ok(())
}

/// Drive registry decisions: consume scanner events, spawn a tail task per
/// newly registered file.
pub async fn run_registry(
    registry: Arc<FileRegistry>,
    mut events: mpsc::Receiver<FileEvent>,
    topic: String,
    producer: Arc<tokio::sync::Mutex<Box<dyn Producer>>>,
    backoff: Duration,
) {
    while let Some(event) = events.recv().await {
        match registry.observe(&event) {
            Observation::StartTailing(token) => {
                let path = event.path.clone();
                let topic = topic.clone();
                let producer = Arc::clone(&producer);
                tokio::spawn(async move {
                    if let Err(e) = tail_from_end(path.clone(), topic, producer, backoff, token).await {
                        warn!(path = %path.display(), error = %e, "tail task ended");
                    }
                });
            }
            Observation::AlreadyTailing
            | Observation::Rejected
            | Observation::Retired
            | Observation::Untracked => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{MemoryBroker, MemoryBrokerHandle};
    use crate::broker::Connect;
    use std::io::Write;
    use tempfile::TempDir;

    fn event(path: &Path, kind: EventKind) -> FileEvent {
        FileEvent { path: path.to_path_buf(), kind }
    }

    #[test]
    fn first_write_starts_tailing_once() {
        let registry = FileRegistry::new(None, CancellationToken::new());
        let path = Path::new("/watched/app.log");

        assert!(matches!(
            registry.observe(&event(path, EventKind::Created)),
            Observation::StartTailing(_)
        ));
        assert!(matches!(
            registry.observe(&event(path, EventKind::Modified)),
            Observation::AlreadyTailing
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn removal_fires_the_token_and_is_idempotent() {
        let registry = FileRegistry::new(None, CancellationToken::new());
        let path = Path::new("/watched/app.log");

        let Observation::StartTailing(token) = registry.observe(&event(path, EventKind::Created))
        else {
            panic!("expected start");
        };
        assert!(!token.is_cancelled());

        assert!(matches!(
            registry.observe(&event(path, EventKind::Removed)),
            Observation::Retired
        ));
        assert!(token.is_cancelled());
        assert!(registry.is_empty());

        // Removing again is a no-op, not an error.
        assert!(matches!(
            registry.observe(&event(path, EventKind::Removed)),
            Observation::Untracked
        ));
    }

    #[test]
    fn name_filter_rejects_before_registration() {
        let registry = FileRegistry::new(
            Some(regex::Regex::new(r"\.log$").unwrap()),
            CancellationToken::new(),
        );

        assert!(matches!(
            registry.observe(&event(Path::new("/watched/core.dump"), EventKind::Created)),
            Observation::Rejected
        ));
        assert!(registry.is_empty());

        assert!(matches!(
            registry.observe(&event(Path::new("/watched/app.log"), EventKind::Created)),
            Observation::StartTailing(_)
        ));
    }

    #[test]
    fn shutdown_token_reaches_every_entry() {
        let shutdown = CancellationToken::new();
        let registry = FileRegistry::new(None, shutdown.clone());

        let Observation::StartTailing(a) =
            registry.observe(&event(Path::new("/w/a.log"), EventKind::Created))
        else {
            panic!("expected start");
        };
        let Observation::StartTailing(b) =
            registry.observe(&event(Path::new("/w/b.log"), EventKind::Created))
        else {
            panic!("expected start");
        };

        shutdown.cancel();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }

    #[tokio::test]
    async fn scanner_emits_created_modified_removed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");

        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let scan = tokio::spawn(scan_directory(
            dir.path().to_path_buf(),
            Duration::from_millis(20),
            tx,
            cancel.clone(),
        ));

        std::fs::write(&path, b"x\n").unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Created);
        assert_eq!(ev.path, path);

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"y\n").unwrap();
        drop(f);
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Modified);

        std::fs::remove_file(&path).unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Removed);

        cancel.cancel();
        scan.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn tails_from_current_end_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"before\n").unwrap();

        let broker = MemoryBroker::new();
        let handle = MemoryBrokerHandle(Arc::clone(&broker));
        let producer = Arc::new(tokio::sync::Mutex::new(handle.connect().await.unwrap()));

        let cancel = CancellationToken::new();
        let tail = tokio::spawn(tail_from_end(
            path.clone(),
            "watched".to_string(),
            producer,
            Duration::from_millis(10),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"after\n").unwrap();
        drop(f);

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        tail.await.unwrap().unwrap();

        // The pre-existing line is never replayed.
        assert_eq!(broker.queued("watched"), vec![b"after\n".to_vec()]);
    }

    #[tokio::test]
    async fn cancelled_tailer_drains_to_end_of_stream() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"").unwrap();

        let broker = MemoryBroker::new();
        let handle = MemoryBrokerHandle(Arc::clone(&broker));
        let producer = Arc::new(tokio::sync::Mutex::new(handle.connect().await.unwrap()));

        let cancel = CancellationToken::new();
        let tail = tokio::spawn(tail_from_end(
            path.clone(),
            "watched".to_string(),
            producer,
            Duration::from_millis(10),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(40)).await;

        // Lines written just before cancellation still go out.
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"late-1\nlate-2\n").unwrap();
        drop(f);
        cancel.cancel();

        tail.await.unwrap().unwrap();
        assert_eq!(
            broker.queued("watched"),
            vec![b"late-1\n".to_vec(), b"late-2\n".to_vec()]
        );
    }
}
