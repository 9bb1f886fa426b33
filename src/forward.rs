//! Reverse path: broker messages fan in to downstream TCP consumers.
//!
//! Each accepted connection is a session with its own inbox. A broker
//! delivery is handed to exactly one live session and the handler blocks
//! until that session reports the write outcome: success acknowledges the
//! message, a failed write or the absence of any session asks the broker to
//! redeliver. Broker-side flow control therefore tracks downstream write
//! capacity without an extra buffering layer. Payloads are written
//! verbatim, no framing added.

use crate::broker::{BrokerError, Handler};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// One broker message on its way to a session, with the channel the write
/// outcome travels back on.
struct Dispatch {
    body: Vec<u8>,
    outcome: oneshot::Sender<Result<(), BrokerError>>,
}

/// Live session inboxes. A session that dies drops its receiver; any
/// dispatch still queued there resolves as a failed outcome, so no message
/// is ever stranded.
type SessionList = Arc<Mutex<Vec<mpsc::Sender<Dispatch>>>>;

fn remove_session(sessions: &SessionList, inbox: &mpsc::Sender<Dispatch>) {
    sessions
        .lock()
        .unwrap()
        .retain(|s| !s.same_channel(inbox));
}

/// Broker-facing half: routes each delivery to one live session and waits
/// for its verdict.
pub struct SessionDispatcher {
    sessions: SessionList,
}

impl SessionDispatcher {
    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[async_trait]
impl Handler for SessionDispatcher {
    async fn handle(&self, body: Vec<u8>) -> Result<(), BrokerError> {
        loop {
            let inbox = self.sessions.lock().unwrap().first().cloned();
            let Some(inbox) = inbox else {
                return Err(BrokerError::Delivery("no active downstream session".into()));
            };

            let (outcome_tx, outcome_rx) = oneshot::channel();
            if inbox
                .send(Dispatch {
                    body: body.clone(),
                    outcome: outcome_tx,
                })
                .await
                .is_err()
            {
                // Session closed between pick and send; forget it and try
                // the next one.
                remove_session(&self.sessions, &inbox);
                continue;
            }

            return match outcome_rx.await {
                Ok(result) => result,
                Err(_) => Err(BrokerError::Delivery("session went away mid-write".into())),
            };
        }
    }
}

/// Downstream TCP listener plus the dispatcher the broker consumer drives.
pub struct Forwarder {
    listener: TcpListener,
    sessions: SessionList,
}

impl Forwarder {
    /// Bind the downstream listener; a bind failure is fatal at startup.
    pub async fn bind(addr: &str) -> Result<(Self, SessionDispatcher), ForwardError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| ForwardError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        let sessions: SessionList = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = SessionDispatcher {
            sessions: Arc::clone(&sessions),
        };
        Ok((Self { listener, sessions }, dispatcher))
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Accept downstream consumers until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        info!(addr = ?self.local_addr(), "forwarder listening for downstream consumers");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("forwarder stopped");
                    return;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            // Inbox holds a single in-flight message; the
                            // broker handler already blocks per message.
                            let (inbox_tx, inbox_rx) = mpsc::channel(1);
                            self.sessions.lock().unwrap().push(inbox_tx.clone());
                            let sessions = Arc::clone(&self.sessions);
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                run_session(stream, peer.to_string(), inbox_rx, cancel).await;
                                remove_session(&sessions, &inbox_tx);
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
    }
}

/// Write dispatched messages to one downstream connection until it fails or
/// the process shuts down. A write error tears this session down; the
/// message is nacked and redelivered to whichever session survives.
async fn run_session(
    mut stream: TcpStream,
    peer: String,
    mut inbox: mpsc::Receiver<Dispatch>,
    cancel: CancellationToken,
) {
    info!(peer = %peer, "downstream session opened");
    loop {
        let dispatch = tokio::select! {
            _ = cancel.cancelled() => break,
            received = inbox.recv() => {
                match received {
                    Some(dispatch) => dispatch,
                    None => break,
                }
            }
        };

        let written = async {
            stream.write_all(&dispatch.body).await?;
            stream.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                let _ = dispatch.outcome.send(Ok(()));
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "downstream write failed, closing session");
                let _ = dispatch
                    .outcome
                    .send(Err(BrokerError::Delivery(e.to_string())));
                break;
            }
        }
    }
    info!(peer = %peer, "downstream session closed");
}
