//! UDP and TCP ingestion listeners.
//!
//! Both produce one record per datagram or line with the remote address as
//! origin and hand it to the publish queue unbatched; publisher workers do
//! the batching. Binding happens up front so an unusable listen address is
//! fatal at startup rather than a background log line.

use crate::pipeline::{Item, Record, Sender};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receive buffer for one datagram.
const UDP_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("publish queue closed")]
    QueueClosed,
}

pub async fn bind_udp(addr: &str) -> Result<UdpSocket, ServerError> {
    UdpSocket::bind(addr).await.map_err(|e| ServerError::Bind {
        addr: addr.to_string(),
        source: e,
    })
}

pub async fn bind_tcp(addr: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr).await.map_err(|e| ServerError::Bind {
        addr: addr.to_string(),
        source: e,
    })
}

/// Read datagrams until cancelled; each datagram is one record.
pub async fn run_udp(
    socket: UdpSocket,
    topic: String,
    queue: Sender,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    info!(addr = ?socket.local_addr().ok(), topic = %topic, "udp listener started");
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("udp listener stopped");
                return Ok(());
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, peer)) => {
                        let record = Record::new(topic.as_str(), peer.to_string(), buf[..len].to_vec());
                        queue
                            .send(Item::Record(record))
                            .await
                            .map_err(|_| ServerError::QueueClosed)?;
                    }
                    Err(e) => {
                        warn!(error = %e, "udp receive failed");
                    }
                }
            }
        }
    }
}

/// Accept connections until cancelled; one scanning task per connection.
pub async fn run_tcp(
    listener: TcpListener,
    topic: String,
    queue: Sender,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    info!(addr = ?listener.local_addr().ok(), topic = %topic, "tcp listener started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("tcp listener stopped");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let topic = topic.clone();
                        let queue = queue.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = read_lines(stream, peer.to_string(), topic, queue, cancel).await {
                                debug!(peer = %peer, error = %e, "connection ended");
                            }
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

/// One record per line; a closed connection is normal termination.
async fn read_lines(
    stream: TcpStream,
    peer: String,
    topic: String,
    queue: Sender,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    let mut reader = BufReader::new(stream);
    let mut line: Vec<u8> = Vec::new();
    loop {
        line.clear();
        let n = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = reader.read_until(b'\n', &mut line) => read?,
        };
        if n == 0 {
            return Ok(());
        }
        while line.ends_with(b"\n") || line.ends_with(b"\r") {
            line.pop();
        }
        let record = Record::new(topic.as_str(), peer.clone(), line.clone());
        queue
            .send(Item::Record(record))
            .await
            .map_err(|_| ServerError::QueueClosed)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::publish_queue;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn udp_datagrams_become_records() {
        let socket = bind_udp("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        let (tx, mut rx) = publish_queue(16);
        let cancel = CancellationToken::new();
        let server = tokio::spawn(run_udp(socket, "net".to_string(), tx, cancel.clone()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"<34>Oct 11 22:14:15 h app: hi", addr).await.unwrap();

        let Item::Record(record) = rx.recv().await.unwrap() else { panic!("expected record") };
        assert_eq!(record.topic, "net");
        assert_eq!(record.raw, b"<34>Oct 11 22:14:15 h app: hi".to_vec());
        assert_eq!(record.origin, client.local_addr().unwrap().to_string());

        cancel.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn tcp_lines_become_records() {
        let listener = bind_tcp("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, mut rx) = publish_queue(16);
        let cancel = CancellationToken::new();
        let server = tokio::spawn(run_tcp(listener, "net".to_string(), tx, cancel.clone()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"first\nsecond\r\n").await.unwrap();
        client.shutdown().await.unwrap();

        let Item::Record(first) = rx.recv().await.unwrap() else { panic!("expected record") };
        let Item::Record(second) = rx.recv().await.unwrap() else { panic!("expected record") };
        assert_eq!(first.raw, b"first".to_vec());
        assert_eq!(second.raw, b"second".to_vec());
        assert_eq!(first.origin, second.origin);

        cancel.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn closed_connection_is_not_a_fault() {
        let listener = bind_tcp("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, mut rx) = publish_queue(16);
        let cancel = CancellationToken::new();
        let server = tokio::spawn(run_tcp(listener, "net".to_string(), tx, cancel.clone()));

        // Connect and immediately close without sending anything.
        drop(TcpStream::connect(addr).await.unwrap());

        // The listener keeps serving new connections.
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"still alive\n").await.unwrap();
        let Item::Record(record) = rx.recv().await.unwrap() else { panic!("expected record") };
        assert_eq!(record.raw, b"still alive".to_vec());

        cancel.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = bind_tcp("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let result = bind_tcp(&addr).await;
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }
}
