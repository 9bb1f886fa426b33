//! In-process broker used by the integration tests: one FIFO queue per
//! topic, redelivery by pushing a failed message back to the front.

use super::{BrokerError, Connect, Consumer, Handler, Producer};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const REDELIVERY_DELAY: Duration = Duration::from_millis(20);

#[derive(Default)]
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    notify: Notify,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of everything currently queued on a topic, oldest first.
    pub fn queued(&self, topic: &str) -> Vec<Vec<u8>> {
        let topics = self.topics.lock().unwrap();
        topics
            .get(topic)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn queued_len(&self, topic: &str) -> usize {
        let topics = self.topics.lock().unwrap();
        topics.get(topic).map(|q| q.len()).unwrap_or(0)
    }

    fn push_back(&self, topic: &str, body: Vec<u8>) {
        let mut topics = self.topics.lock().unwrap();
        topics.entry(topic.to_string()).or_default().push_back(body);
        drop(topics);
        self.notify.notify_waiters();
    }

    fn push_front(&self, topic: &str, body: Vec<u8>) {
        let mut topics = self.topics.lock().unwrap();
        topics.entry(topic.to_string()).or_default().push_front(body);
        drop(topics);
        self.notify.notify_waiters();
    }

    fn pop_front(&self, topic: &str) -> Option<Vec<u8>> {
        let mut topics = self.topics.lock().unwrap();
        topics.get_mut(topic).and_then(|q| q.pop_front())
    }
}

pub struct MemoryProducer {
    broker: Arc<MemoryBroker>,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn publish(&mut self, topic: &str, body: &[u8]) -> Result<(), BrokerError> {
        self.broker.push_back(topic, body.to_vec());
        Ok(())
    }

    async fn multi_publish(&mut self, topic: &str, bodies: &[Vec<u8>]) -> Result<(), BrokerError> {
        let mut topics = self.broker.topics.lock().unwrap();
        let queue = topics.entry(topic.to_string()).or_default();
        for body in bodies {
            queue.push_back(body.clone());
        }
        drop(topics);
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// `Connect`/`Consumer` wrapper around the shared broker handle.
#[derive(Clone)]
pub struct MemoryBrokerHandle(pub Arc<MemoryBroker>);

#[async_trait]
impl Connect for MemoryBrokerHandle {
    async fn connect(&self) -> Result<Box<dyn Producer>, BrokerError> {
        Ok(Box::new(MemoryProducer {
            broker: Arc::clone(&self.0),
        }))
    }
}

#[async_trait]
impl Consumer for MemoryBrokerHandle {
    async fn consume(
        &self,
        topic: &str,
        _channel: &str,
        _max_in_flight: usize,
        handler: Arc<dyn Handler>,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        loop {
            let body = match self.0.pop_front(topic) {
                Some(body) => body,
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = self.0.notify.notified() => continue,
                    }
                }
            };

            if let Err(e) = handler.handle(body.clone()).await {
                tracing::debug!(topic = %topic, error = %e, "handler failed, requeueing message");
                self.0.push_front(topic, body);
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(REDELIVERY_DELAY) => {}
                }
            }
        }
    }
}
