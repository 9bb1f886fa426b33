//! Pool of publisher workers draining the shared queue.
//!
//! Each worker owns one broker connection. Stream-sourced records are
//! screened through the drop filter and accumulated into per-topic batches;
//! file-sourced items arrive pre-batched and publish as-is. A failed publish
//! reconnects the worker's connection and discards that batch: an explicit
//! at-most-once policy under broker outages, deliberately not a retry.

use crate::broker::{BrokerError, Connect, Producer};
use crate::filter::DropFilter;
use crate::pipeline::{Item, Receiver};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    /// Flush threshold for record-at-a-time sources.
    pub batch_limit: usize,
    /// Maximum latency before a sub-limit batch is flushed anyway.
    pub flush_interval: Duration,
}

pub struct PublisherPool {
    connector: Arc<dyn Connect>,
    filter: Option<Arc<DropFilter>>,
    config: PoolConfig,
}

impl PublisherPool {
    pub fn new(
        connector: Arc<dyn Connect>,
        filter: Option<Arc<DropFilter>>,
        config: PoolConfig,
    ) -> Self {
        Self {
            connector,
            filter,
            config,
        }
    }

    /// Connect every worker, then drain the queue until cancelled. An
    /// initial connection failure is fatal; later failures reconnect.
    pub async fn run(self, queue: Receiver, cancel: CancellationToken) -> Result<(), BrokerError> {
        let queue = Arc::new(Mutex::new(queue));
        let mut workers = Vec::with_capacity(self.config.workers);
        for id in 0..self.config.workers {
            let producer = self.connector.connect().await?;
            workers.push(tokio::spawn(run_worker(
                id,
                producer,
                Arc::clone(&queue),
                self.filter.clone(),
                self.config.clone(),
                cancel.clone(),
            )));
        }
        info!(workers = self.config.workers, "publisher pool started");

        for worker in workers {
            let _ = worker.await;
        }
        info!("publisher pool stopped");
        Ok(())
    }
}

async fn run_worker(
    id: usize,
    mut producer: Box<dyn Producer>,
    queue: Arc<Mutex<Receiver>>,
    filter: Option<Arc<DropFilter>>,
    config: PoolConfig,
    cancel: CancellationToken,
) {
    let mut pending: HashMap<String, Vec<Vec<u8>>> = HashMap::new();
    let mut tick = tokio::time::interval(config.flush_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Fast shutdown wins over last-batch durability: whatever is
                // still accumulated is dropped with the connection.
                debug!(worker = id, pending = pending.values().map(Vec::len).sum::<usize>(),
                    "worker stopping");
                return;
            }
            _ = tick.tick() => {
                for (topic, bodies) in pending.drain() {
                    if !bodies.is_empty() {
                        publish(&mut producer, &topic, &bodies).await;
                    }
                }
            }
            item = recv_shared(&queue) => {
                let Some(item) = item else {
                    // All sources gone: flush what we have and finish.
                    for (topic, bodies) in pending.drain() {
                        if !bodies.is_empty() {
                            publish(&mut producer, &topic, &bodies).await;
                        }
                    }
                    debug!(worker = id, "publish queue closed");
                    return;
                };
                match item {
                    Item::Batch(batch) => {
                        publish(&mut producer, &batch.topic, &batch.records).await;
                    }
                    Item::Record(record) => {
                        if let Some(filter) = &filter {
                            if filter.should_drop(&record.raw) {
                                continue;
                            }
                        }
                        let bodies = pending.entry(record.topic.clone()).or_default();
                        bodies.push(record.raw);
                        if bodies.len() >= config.batch_limit {
                            let full = std::mem::take(bodies);
                            publish(&mut producer, &record.topic, &full).await;
                        }
                    }
                }
            }
        }
    }
}

async fn recv_shared(queue: &Arc<Mutex<Receiver>>) -> Option<Item> {
    queue.lock().await.recv().await
}

/// One atomic multi-record call. On failure the batch is gone; the worker
/// reconnects and moves on.
async fn publish(producer: &mut Box<dyn Producer>, topic: &str, bodies: &[Vec<u8>]) {
    if let Err(e) = producer.multi_publish(topic, bodies).await {
        warn!(topic = %topic, count = bodies.len(), error = %e, "publish failed, batch discarded");
        if let Err(e) = producer.reconnect().await {
            warn!(error = %e, "reconnect failed");
        }
    }
}
