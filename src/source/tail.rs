//! Checkpointed polling tailer for one log file.
//!
//! Resumes from the persisted offset unless the file has shrunk below it
//! (taken as rotation, restart at zero). At end of stream it waits one poll
//! interval and retries before re-opening the path and comparing sizes, so
//! a slow writer is not mistaken for a rotated file.

use crate::checkpoint::CheckpointStore;
use crate::pipeline::{Batch, Item, Sender};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum TailError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("publish queue closed")]
    QueueClosed,
}

pub struct FileTailer {
    topic: String,
    path: PathBuf,
    key: String,
    store: Arc<CheckpointStore>,
    batch_limit: usize,
    poll_interval: Duration,
    checkpoint_interval: Duration,
}

impl FileTailer {
    pub fn new(
        topic: impl Into<String>,
        path: impl Into<PathBuf>,
        store: Arc<CheckpointStore>,
        batch_limit: usize,
        poll_interval: Duration,
        checkpoint_interval: Duration,
    ) -> Self {
        let path = path.into();
        let key = CheckpointStore::source_key(&path);
        Self {
            topic: topic.into(),
            path,
            key,
            store,
            batch_limit,
            poll_interval,
            checkpoint_interval,
        }
    }

    /// Tail the file until cancelled. Open and seek errors terminate this
    /// tailer only; the caller logs them and other sources keep running.
    pub async fn run(self, queue: Sender, cancel: CancellationToken) -> Result<(), TailError> {
        let saved = self.store.load(&self.key);
        let file = File::open(&self.path).await?;
        let size = file.metadata().await?.len();

        // Only a shrink means rotation; growth past the checkpoint is the
        // normal case and resumes exactly there.
        let mut pos = if size < saved {
            info!(path = %self.path.display(), saved, size, "file smaller than checkpoint, reading from start");
            0
        } else {
            saved
        };

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(pos)).await?;
        info!(path = %self.path.display(), topic = %self.topic, offset = pos, "tailing file");

        let mut batch = Batch::new(self.topic.as_str());
        let mut line: Vec<u8> = Vec::new();
        let mut last_save = Instant::now();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if last_save.elapsed() >= self.checkpoint_interval {
                self.flush(&mut batch, &queue).await?;
                // A consumed but still incomplete line is not part of the
                // checkpoint; a restart re-reads it from its first byte.
                self.store.save(&self.key, pos - line.len() as u64);
                last_save = Instant::now();
            }

            let n = reader.read_until(b'\n', &mut line).await? as u64;
            pos += n;
            if line.ends_with(b"\n") {
                self.accept(&mut line, &mut batch, &queue).await?;
                continue;
            }

            // End of stream, possibly holding a partial write. Wait one
            // interval and retry before concluding anything.
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            let retried = reader.read_until(b'\n', &mut line).await? as u64;
            pos += retried;
            if line.ends_with(b"\n") {
                self.accept(&mut line, &mut batch, &queue).await?;
                continue;
            }

            if n == 0 && retried == 0 {
                // Nothing new through two reads: re-open by path to catch a
                // rename-based rotation and compare against our position.
                let file = File::open(&self.path).await?;
                let new_size = file.metadata().await?.len();
                let mut reopened = BufReader::new(file);
                if new_size < pos {
                    info!(path = %self.path.display(), pos, new_size, "file replaced, reading from start");
                    pos = 0;
                    line.clear();
                }
                reopened.seek(SeekFrom::Start(pos)).await?;
                reader = reopened;
            }
        }

        // The checkpoint save must happen even if the publish side is
        // already gone; an unflushed final batch is within the shutdown
        // policy, a lost checkpoint is not.
        if let Err(e) = self.flush(&mut batch, &queue).await {
            debug!(path = %self.path.display(), error = %e, "final batch not flushed");
        }
        self.store.save(&self.key, pos - line.len() as u64);
        debug!(path = %self.path.display(), offset = pos, "tailer stopped");
        Ok(())
    }

    async fn accept(
        &self,
        line: &mut Vec<u8>,
        batch: &mut Batch,
        queue: &Sender,
    ) -> Result<(), TailError> {
        batch.records.push(std::mem::take(line));
        if batch.len() >= self.batch_limit {
            self.flush(batch, queue).await?;
        }
        Ok(())
    }

    async fn flush(&self, batch: &mut Batch, queue: &Sender) -> Result<(), TailError> {
        if batch.is_empty() {
            return Ok(());
        }
        let full = std::mem::replace(batch, Batch::new(self.topic.as_str()));
        queue
            .send(Item::Batch(full))
            .await
            .map_err(|_| TailError::QueueClosed)
    }
}
