//! Wires configuration into running pipelines, one entry point per mode.

use crate::broker::tcp::{TcpConnector, TcpConsumer};
use crate::broker::{BrokerError, Connect, Consumer, Handler};
use crate::checkpoint::CheckpointStore;
use crate::config::{load_config, ConfigError};
use crate::filter::envelope::SyslogParser;
use crate::filter::store::HttpRuleStore;
use crate::filter::{run_refresh, DropFilter};
use crate::forward::{ForwardError, Forwarder};
use crate::pipeline::publish_queue;
use crate::publish::{PoolConfig, PublisherPool};
use crate::source::net::{bind_tcp, bind_udp, run_tcp, run_udp, ServerError};
use crate::source::tail::FileTailer;
use crate::source::watch::{run_registry, scan_directory, FileRegistry};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Bounded window after the shutdown signal for checkpoint saves and other
/// in-flight flushes to complete.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("server error: {0}")]
    Server(#[from] ServerError),

    #[error("forwarder error: {0}")]
    Forward(#[from] ForwardError),

    #[error("config has no `{0}` section")]
    MissingMode(&'static str),
}

pub async fn ship(config_path: &Path) -> Result<(), RunError> {
    let config = load_config(config_path)?;
    let ship = config.ship.clone().ok_or(RunError::MissingMode("ship"))?;
    let cancel = CancellationToken::new();

    let connector: Arc<dyn Connect> = Arc::new(TcpConnector::new(config.broker.address.as_str()));
    let (queue_tx, queue_rx) = publish_queue(config.broker.queue_capacity);
    let store = Arc::new(CheckpointStore::new(&ship.state_dir));

    for (topic, path) in &ship.files {
        let tailer = FileTailer::new(
            topic.as_str(),
            path,
            Arc::clone(&store),
            ship.batch_limit,
            ship.poll_interval,
            ship.checkpoint_interval,
        );
        let queue = queue_tx.clone();
        let cancel = cancel.clone();
        let topic = topic.clone();
        let path = path.clone();
        tokio::spawn(async move {
            if let Err(e) = tailer.run(queue, cancel).await {
                error!(topic = %topic, path = %path.display(), error = %e, "tailer terminated");
            }
        });
    }

    if let Some(watch) = &ship.watch {
        let pattern = match &watch.name_pattern {
            Some(p) => Some(regex::Regex::new(p).map_err(|e| {
                ConfigError::Validation(format!("ship.watch.name_pattern: {}", e))
            })?),
            None => None,
        };
        let registry = Arc::new(FileRegistry::new(pattern, cancel.clone()));
        let producer = Arc::new(tokio::sync::Mutex::new(connector.connect().await?));
        let (event_tx, event_rx) = mpsc::channel(64);

        let dir = watch.dir.clone();
        let interval = watch.scan_interval;
        let scan_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = scan_directory(dir.clone(), interval, event_tx, scan_cancel).await {
                error!(dir = %dir.display(), error = %e, "directory watch terminated");
            }
        });
        tokio::spawn(run_registry(
            registry,
            event_rx,
            watch.topic.clone(),
            producer,
            watch.backoff,
        ));
    }
    drop(queue_tx);

    let pool = PublisherPool::new(
        connector,
        None,
        PoolConfig {
            workers: config.broker.pool_size,
            batch_limit: ship.batch_limit,
            flush_interval: ship.checkpoint_interval,
        },
    );
    let pool_task = tokio::spawn(pool.run(queue_rx, cancel.clone()));

    info!("ship pipeline started");
    run_until_shutdown(pool_task, &cancel).await
}

pub async fn stream(config_path: &Path) -> Result<(), RunError> {
    let config = load_config(config_path)?;
    let stream = config
        .stream
        .clone()
        .ok_or(RunError::MissingMode("stream"))?;
    let cancel = CancellationToken::new();

    let filter = match &stream.filter {
        Some(filter_cfg) => {
            let filter = Arc::new(DropFilter::new(Box::new(SyslogParser)));
            let store = Arc::new(HttpRuleStore::new(
                &filter_cfg.address,
                filter_cfg.datacenter.clone(),
                filter_cfg.token.clone(),
            ));
            tokio::spawn(run_refresh(
                Arc::clone(&filter),
                store,
                filter_cfg.key_prefix.clone(),
                filter_cfg.refresh_interval,
                cancel.clone(),
            ));
            Some(filter)
        }
        None => None,
    };

    let (queue_tx, queue_rx) = publish_queue(config.broker.queue_capacity);

    // Bind before spawning anything: an unusable ingress address is fatal.
    if let Some(addr) = &stream.udp_listen {
        let socket = bind_udp(addr).await?;
        let topic = stream.topic.clone();
        let queue = queue_tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = run_udp(socket, topic, queue, cancel).await {
                error!(error = %e, "udp listener terminated");
            }
        });
    }
    if let Some(addr) = &stream.tcp_listen {
        let listener = bind_tcp(addr).await?;
        let topic = stream.topic.clone();
        let queue = queue_tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = run_tcp(listener, topic, queue, cancel).await {
                error!(error = %e, "tcp listener terminated");
            }
        });
    }
    drop(queue_tx);

    let connector: Arc<dyn Connect> = Arc::new(TcpConnector::new(config.broker.address.as_str()));
    let pool = PublisherPool::new(
        connector,
        filter,
        PoolConfig {
            workers: config.broker.pool_size,
            batch_limit: stream.batch_limit,
            flush_interval: stream.flush_interval,
        },
    );
    let pool_task = tokio::spawn(pool.run(queue_rx, cancel.clone()));

    info!("stream pipeline started");
    run_until_shutdown(pool_task, &cancel).await
}

pub async fn forward(config_path: &Path) -> Result<(), RunError> {
    let config = load_config(config_path)?;
    let forward = config
        .forward
        .clone()
        .ok_or(RunError::MissingMode("forward"))?;
    let cancel = CancellationToken::new();

    let (forwarder, dispatcher) = Forwarder::bind(&forward.listen).await?;
    tokio::spawn(forwarder.run(cancel.clone()));

    let consumer = TcpConsumer::new(config.broker.address.as_str());
    let handler: Arc<dyn Handler> = Arc::new(dispatcher);
    let consume_cancel = cancel.clone();
    let consume_task = tokio::spawn(async move {
        consumer
            .consume(
                &forward.topic,
                &forward.channel,
                forward.max_in_flight,
                handler,
                consume_cancel,
            )
            .await
    });

    info!("forward pipeline started");
    run_until_shutdown(consume_task, &cancel).await
}

/// Block until the termination signal or the watched task ends, then give
/// every task the grace window to observe the cancellation and flush.
async fn run_until_shutdown(
    mut task: JoinHandle<Result<(), BrokerError>>,
    cancel: &CancellationToken,
) -> Result<(), RunError> {
    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
        finished = &mut task => {
            match finished {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(RunError::Broker(e)),
                Err(e) => {
                    warn!(error = %e, "pipeline task panicked");
                    Ok(())
                }
            }
        }
    };

    cancel.cancel();
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    info!("shutdown complete");
    result
}
