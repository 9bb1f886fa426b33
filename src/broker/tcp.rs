//! Minimal TCP transport for the broker seam.
//!
//! Every message on the wire is a frame: a 4-byte big-endian length prefix
//! followed by that many payload bytes. A producer identifies itself once
//! per connection, then issues `PUB`/`MPUB` commands and reads an `OK` or
//! `E <reason>` reply per command. A consumer subscribes with `SUB` and
//! answers each pushed message frame with `FIN` (ack) or `REQ` (redeliver).

use super::{BrokerError, Connect, Consumer, Handler, Producer};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on a single frame, matching the ingestion side's limit.
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<(), BrokerError> {
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, BrokerError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(BrokerError::Protocol(format!(
            "frame size {} exceeds limit {}",
            len, MAX_FRAME_SIZE
        )));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

async fn expect_ok(stream: &mut TcpStream) -> Result<(), BrokerError> {
    let reply = read_frame(stream).await?;
    if reply == b"OK" {
        Ok(())
    } else {
        Err(BrokerError::Protocol(
            String::from_utf8_lossy(&reply).into_owned(),
        ))
    }
}

fn client_id() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "logship".to_string())
}

async fn dial(addr: &str) -> Result<TcpStream, BrokerError> {
    let mut stream = TcpStream::connect(addr).await?;
    write_frame(&mut stream, format!("ID logship/{}", client_id()).as_bytes()).await?;
    expect_ok(&mut stream).await?;
    Ok(stream)
}

pub struct TcpProducer {
    addr: String,
    stream: Option<TcpStream>,
}

impl TcpProducer {
    fn stream(&mut self) -> Result<&mut TcpStream, BrokerError> {
        self.stream.as_mut().ok_or(BrokerError::NotConnected)
    }
}

#[async_trait]
impl Producer for TcpProducer {
    async fn publish(&mut self, topic: &str, body: &[u8]) -> Result<(), BrokerError> {
        let mut payload = format!("PUB {}\n", topic).into_bytes();
        payload.extend_from_slice(body);
        let stream = self.stream()?;
        write_frame(stream, &payload).await?;
        expect_ok(stream).await
    }

    async fn multi_publish(&mut self, topic: &str, bodies: &[Vec<u8>]) -> Result<(), BrokerError> {
        let mut payload = format!("MPUB {} {}\n", topic, bodies.len()).into_bytes();
        for body in bodies {
            payload.extend_from_slice(&(body.len() as u32).to_be_bytes());
            payload.extend_from_slice(body);
        }
        let stream = self.stream()?;
        write_frame(stream, &payload).await?;
        expect_ok(stream).await
    }

    async fn reconnect(&mut self) -> Result<(), BrokerError> {
        self.stream = None;
        let stream = dial(&self.addr).await?;
        debug!(addr = %self.addr, "producer reconnected");
        self.stream = Some(stream);
        Ok(())
    }
}

/// Dials one producer connection per pool worker.
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connect for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn Producer>, BrokerError> {
        let stream = dial(&self.addr).await?;
        Ok(Box::new(TcpProducer {
            addr: self.addr.clone(),
            stream: Some(stream),
        }))
    }
}

/// Subscribing side: pushes each delivered frame through the handler and
/// answers `FIN` or `REQ` depending on the outcome.
pub struct TcpConsumer {
    addr: String,
}

impl TcpConsumer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Consumer for TcpConsumer {
    async fn consume(
        &self,
        topic: &str,
        channel: &str,
        max_in_flight: usize,
        handler: Arc<dyn Handler>,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        let mut stream = dial(&self.addr).await?;
        write_frame(
            &mut stream,
            format!("SUB {} {} {}", topic, channel, max_in_flight).as_bytes(),
        )
        .await?;
        expect_ok(&mut stream).await?;
        info!(addr = %self.addr, topic = %topic, channel = %channel, "subscribed");

        loop {
            let body = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write_frame(&mut stream, b"CLS").await;
                    return Ok(());
                }
                frame = read_frame(&mut stream) => frame?,
            };

            let reply: &[u8] = match handler.handle(body).await {
                Ok(()) => b"FIN",
                Err(e) => {
                    warn!(topic = %topic, error = %e, "message handler failed, requeueing");
                    b"REQ"
                }
            };
            write_frame(&mut stream, reply).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    async fn read_server_frame(stream: &mut TcpStream) -> Vec<u8> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let mut payload = vec![0u8; u32::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut payload).await.unwrap();
        payload
    }

    async fn write_server_frame(stream: &mut TcpStream, payload: &[u8]) {
        stream
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(payload).await.unwrap();
    }

    /// Accepts one connection, replies OK to every command, records payloads.
    async fn one_shot_server(listener: TcpListener, seen: Arc<Mutex<Vec<Vec<u8>>>>) {
        let (mut stream, _) = listener.accept().await.unwrap();
        loop {
            let mut len_buf = [0u8; 4];
            if stream.read_exact(&mut len_buf).await.is_err() {
                return;
            }
            let mut payload = vec![0u8; u32::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut payload).await.unwrap();
            seen.lock().unwrap().push(payload);
            write_server_frame(&mut stream, b"OK").await;
        }
    }

    #[tokio::test]
    async fn producer_identifies_and_publishes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let seen = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(one_shot_server(listener, Arc::clone(&seen)));

        let connector = TcpConnector::new(addr);
        let mut producer = connector.connect().await.unwrap();
        producer.publish("logs", b"hello").await.unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen[0].starts_with(b"ID logship/"));
        assert_eq!(seen[1], b"PUB logs\nhello".to_vec());
    }

    #[tokio::test]
    async fn multi_publish_frames_every_body() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let seen = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(one_shot_server(listener, Arc::clone(&seen)));

        let connector = TcpConnector::new(addr);
        let mut producer = connector.connect().await.unwrap();
        producer
            .multi_publish("logs", &[b"a".to_vec(), b"bb".to_vec()])
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        let mut expected = b"MPUB logs 2\n".to_vec();
        expected.extend_from_slice(&1u32.to_be_bytes());
        expected.extend_from_slice(b"a");
        expected.extend_from_slice(&2u32.to_be_bytes());
        expected.extend_from_slice(b"bb");
        assert_eq!(seen[1], expected);
    }

    struct CollectHandler(Mutex<Vec<Vec<u8>>>);

    #[async_trait]
    impl Handler for CollectHandler {
        async fn handle(&self, body: Vec<u8>) -> Result<(), BrokerError> {
            self.0.lock().unwrap().push(body);
            Ok(())
        }
    }

    #[tokio::test]
    async fn consumer_acks_delivered_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let id = read_server_frame(&mut stream).await;
            assert!(id.starts_with(b"ID "));
            write_server_frame(&mut stream, b"OK").await;
            let sub = read_server_frame(&mut stream).await;
            assert_eq!(sub, b"SUB logs ship 200".to_vec());
            write_server_frame(&mut stream, b"OK").await;

            write_server_frame(&mut stream, b"payload-1").await;
            let reply = read_server_frame(&mut stream).await;
            assert_eq!(reply, b"FIN".to_vec());
        });

        let handler = Arc::new(CollectHandler(Mutex::new(Vec::new())));
        let cancel = CancellationToken::new();
        let consumer = TcpConsumer::new(addr);

        let consume = {
            let handler = Arc::clone(&handler) as Arc<dyn Handler>;
            let cancel = cancel.clone();
            tokio::spawn(async move { consumer.consume("logs", "ship", 200, handler, cancel).await })
        };

        server.await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        let _ = consume.await.unwrap();

        assert_eq!(
            handler.0.lock().unwrap().as_slice(),
            &[b"payload-1".to_vec()]
        );
    }
}
