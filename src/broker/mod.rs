//! Seams for the message broker the pipeline publishes to and consumes from.
//!
//! The broker's storage and delivery semantics live outside this crate; the
//! pipeline only relies on these traits. `memory` is an in-process broker
//! used by the test suite, `tcp` a thin length-prefix-framed transport.

pub mod memory;
pub mod tcp;

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("not connected")]
    NotConnected,

    #[error("downstream delivery failed: {0}")]
    Delivery(String),
}

/// One live publishing connection to the broker. Each publisher-pool worker
/// owns exactly one producer; none of these methods are called concurrently
/// on the same instance.
#[async_trait]
pub trait Producer: Send {
    async fn publish(&mut self, topic: &str, body: &[u8]) -> Result<(), BrokerError>;

    /// Publish a whole batch as one atomic multi-record call.
    async fn multi_publish(&mut self, topic: &str, bodies: &[Vec<u8>]) -> Result<(), BrokerError>;

    /// Tear down and re-establish the underlying connection.
    async fn reconnect(&mut self) -> Result<(), BrokerError>;
}

/// Factory handing out one producer per worker.
#[async_trait]
pub trait Connect: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Producer>, BrokerError>;
}

/// Invoked once per delivered message. `Ok` acknowledges the message,
/// `Err` asks the broker to redeliver it.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, body: Vec<u8>) -> Result<(), BrokerError>;
}

/// Subscription side of the broker: drives the handler until cancelled.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn consume(
        &self,
        topic: &str,
        channel: &str,
        max_in_flight: usize,
        handler: Arc<dyn Handler>,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError>;
}
