//! C2: Publisher / Subscriber.
//!
//! A topic-prefixed fan-out with subscriber-side filtering, built on a
//! `tokio::sync::broadcast` channel as the in-process fan-out primitive
//! underneath each publisher connection.
//!
//! A publisher binds one TCP listener; every subscriber that connects gets
//! its own forwarding task fed by a `tokio::sync::broadcast` channel, so one
//! slow subscriber cannot stall another (mirroring the ZeroMQ PUB socket's
//! per-subscriber queue semantics). Topic filtering happens subscriber-side:
//! a subscriber sends its list of topic prefixes once at connect time and
//! only frames matching one of those prefixes (or an empty list, meaning
//! "all") are forwarded to it.

use crate::error::Result;
use crate::transport::wire::{read_frame, write_frame, Envelope};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::broadcast;

/// Default per-subscriber broadcast channel capacity. A subscriber that
/// falls this far behind the publisher starts missing messages, mirroring
/// a PUB socket's high-water-mark drop behavior rather than unbounded
/// buffering.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Publishes serialized payloads on named topics to any number of connected
/// subscribers. Cheap to clone: every clone shares the same underlying
/// broadcast channel and subscriber set.
#[derive(Clone)]
pub struct Publisher {
    tx: broadcast::Sender<Envelope<Vec<u8>>>,
}

impl Publisher {
    /// Bind a publisher on `addr` and start accepting subscriber
    /// connections in the background.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (tx, _rx) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        let accept_tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, _peer)) => {
                        let rx = accept_tx.subscribe();
                        tokio::spawn(serve_subscriber(socket, rx));
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "publisher accept failed");
                        break;
                    }
                }
            }
        });
        Ok(Self { tx })
    }

    /// Publish `payload` under `topic` to every currently-connected
    /// subscriber whose filter matches. Returns without error even if no
    /// subscriber is currently connected (matching PUB socket semantics:
    /// publishing is fire-and-forget).
    pub fn publish<T: serde::Serialize>(&self, topic: impl Into<String>, payload: &T) -> Result<()> {
        let bytes = bincode::serialize(payload)?;
        let envelope = Envelope::new(topic, bytes);
        let _ = self.tx.send(envelope);
        Ok(())
    }

    /// Send the reserved `KILL` topic, signaling every subscriber to shut
    /// down.
    pub fn send_kill_signal(&self) -> Result<()> {
        self.publish("KILL", &())
    }
}

async fn serve_subscriber(mut socket: TcpStream, mut rx: broadcast::Receiver<Envelope<Vec<u8>>>) {
    let filters: Vec<String> = match read_frame(&mut socket).await {
        Ok(filters) => filters,
        Err(err) => {
            tracing::warn!(error = %err, "failed to read subscriber topic filter");
            return;
        }
    };
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                if matches_filter(&envelope.topic, &filters) {
                    if write_frame(&mut socket, &envelope).await.is_err() {
                        break;
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "subscriber fell behind publisher, messages dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn matches_filter(topic: &str, filters: &[String]) -> bool {
    filters.is_empty() || filters.iter().any(|f| topic.starts_with(f.as_str()))
}

/// Subscribes to a [`Publisher`] over a topic-filtered TCP connection.
pub struct Subscriber {
    socket: TcpStream,
}

impl Subscriber {
    /// Connect to a publisher at `addr`, registering interest in `topics`
    /// (an empty slice subscribes to everything).
    pub async fn connect(addr: impl ToSocketAddrs, topics: &[String]) -> Result<Self> {
        let mut socket = TcpStream::connect(addr).await?;
        write_frame(&mut socket, &topics.to_vec()).await?;
        Ok(Self { socket })
    }

    /// Receive the next matching envelope, decoding its payload as `T`.
    pub async fn recv<T: serde::de::DeserializeOwned>(&mut self) -> Result<Envelope<T>> {
        let envelope: Envelope<Vec<u8>> = read_frame(&mut self.socket).await?;
        let payload = bincode::deserialize(&envelope.payload)?;
        Ok(Envelope::new(envelope.topic, payload))
    }

    /// True if the given envelope topic is the reserved shutdown signal.
    pub fn is_kill_topic(topic: &str) -> bool {
        topic == "KILL"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_matching_subscriber() {
        let publisher = Publisher::bind("127.0.0.1:0").await;
        // bind("127.0.0.1:0") picks an ephemeral port; a real deployment
        // passes a fixed configured address instead. This test exercises
        // the logic end to end using the loopback-bound port 0 is not
        // retrievable through `TcpListener` after this abstraction, so
        // full socket-level roundtrip is covered in `tests/pubsub.rs`
        // where a concrete, queryable port is used.
        assert!(publisher.is_ok());
    }

    #[test]
    fn filter_matching() {
        assert!(matches_filter("scan.image", &[]));
        assert!(matches_filter("scan.image", &["scan".to_string()]));
        assert!(!matches_filter("scan.image", &["spec".to_string()]));
    }
}
