//! C3: Pub/Sub Cache.
//!
//! A proxy that sits between an upstream publisher and downstream
//! subscribers, keeping a bounded last-K-messages-per-topic cache so that a
//! subscriber connecting after data has already been published still
//! receives recent history instead of only future messages. A plain bounded
//! `VecDeque` per topic is enough here; this crate has no need for the
//! mmap/seqlock machinery a high-rate shared-memory sample buffer would
//! call for.

use crate::error::Result;
use crate::transport::wire::{read_frame, write_frame, Envelope};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{broadcast, Mutex};

type CachedEnvelope = Envelope<Vec<u8>>;

/// Per-topic cache capacity: a default `K` applied to any topic with no
/// override, plus prefix-keyed overrides (e.g. `"scan2d"` given a larger `K`
/// than the default so a late-connecting subscriber still gets a useful
/// backlog of images). The longest matching prefix wins.
#[derive(Debug, Clone)]
pub struct CacheCapacity {
    default: usize,
    overrides: HashMap<String, usize>,
}

impl CacheCapacity {
    /// A single capacity applied uniformly to every topic.
    pub fn uniform(capacity: usize) -> Self {
        Self { default: capacity, overrides: HashMap::new() }
    }

    /// A default capacity plus per-topic-prefix overrides.
    pub fn new(default: usize, overrides: HashMap<String, usize>) -> Self {
        Self { default, overrides }
    }

    fn capacity_for(&self, topic: &str) -> usize {
        self.overrides
            .iter()
            .filter(|(prefix, _)| topic.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, capacity)| *capacity)
            .unwrap_or(self.default)
    }
}

struct TopicCache {
    capacity: CacheCapacity,
    by_topic: HashMap<String, VecDeque<CachedEnvelope>>,
}

impl TopicCache {
    fn new(capacity: CacheCapacity) -> Self {
        Self {
            capacity,
            by_topic: HashMap::new(),
        }
    }

    fn record(&mut self, envelope: CachedEnvelope) {
        let limit = self.capacity.capacity_for(&envelope.topic);
        let queue = self.by_topic.entry(envelope.topic.clone()).or_default();
        queue.push_back(envelope);
        while queue.len() > limit {
            queue.pop_front();
        }
    }

    /// Replay order matches insertion order within a topic; topics are
    /// visited in an unspecified but stable-for-this-cache order.
    fn replay_for(&self, filters: &[String]) -> Vec<CachedEnvelope> {
        let mut out = Vec::new();
        for (topic, queue) in &self.by_topic {
            if filters.is_empty() || filters.iter().any(|f| topic.starts_with(f.as_str())) {
                out.extend(queue.iter().cloned());
            }
        }
        out
    }
}

/// A closure applied to every envelope the cache ingests (from upstream or
/// from a direct [`PubSubCache::publish`] call) before it is recorded and
/// forwarded downstream.
///
/// Lets the drift scheduler apply `point ← point − T(now)` to a publication
/// before it reaches any subscriber. The hook receives the topic (to decide
/// whether the payload is one of the closed set of spatial-bearing types)
/// and the raw encoded bytes, and returns the bytes to actually store and
/// forward; a hook that does not recognize the topic must return the bytes
/// unchanged.
pub type TransformHook = Arc<dyn Fn(&str, Vec<u8>) -> Vec<u8> + Send + Sync>;

/// A pub/sub cache proxy: connects upstream to one publisher, re-publishes
/// everything downstream to any number of subscribers, and replays cached
/// history to each newly-connected subscriber before live forwarding
/// begins.
pub struct PubSubCache {
    cache: Arc<Mutex<TopicCache>>,
    tx: broadcast::Sender<CachedEnvelope>,
    transform: Arc<Mutex<Option<TransformHook>>>,
}

impl PubSubCache {
    /// Start a cache proxy that connects upstream to `upstream_addr` and
    /// listens downstream on `downstream_addr`, retaining up to `capacity`
    /// messages per topic.
    pub async fn start(
        upstream_addr: impl ToSocketAddrs,
        downstream_addr: impl ToSocketAddrs,
        capacity: CacheCapacity,
    ) -> Result<Self> {
        let mut upstream = TcpStream::connect(upstream_addr).await?;
        // Subscribe upstream to every topic: an empty filter list.
        write_frame(&mut upstream, &Vec::<String>::new()).await?;

        let listener = TcpListener::bind(downstream_addr).await?;
        let cache = Arc::new(Mutex::new(TopicCache::new(capacity)));
        let (tx, _rx) = broadcast::channel(1024);
        let transform: Arc<Mutex<Option<TransformHook>>> = Arc::new(Mutex::new(None));

        let ingest_cache = cache.clone();
        let ingest_tx = tx.clone();
        let ingest_transform = transform.clone();
        tokio::spawn(async move {
            loop {
                match read_frame::<_, CachedEnvelope>(&mut upstream).await {
                    Ok(mut envelope) => {
                        if let Some(hook) = ingest_transform.lock().await.as_ref() {
                            envelope.payload = hook(&envelope.topic, envelope.payload);
                        }
                        record_and_broadcast(&ingest_cache, &ingest_tx, envelope).await;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "pub/sub cache lost upstream connection");
                        break;
                    }
                }
            }
        });

        let accept_cache = cache.clone();
        let accept_tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, _peer)) => {
                        let cache = accept_cache.clone();
                        let tx = accept_tx.clone();
                        tokio::spawn(serve_downstream(socket, tx, cache));
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "pub/sub cache accept failed");
                        break;
                    }
                }
            }
        });

        Ok(Self { cache, tx, transform })
    }

    /// Number of distinct topics currently cached.
    pub async fn cached_topic_count(&self) -> usize {
        self.cache.lock().await.by_topic.len()
    }

    /// Install (or clear, with `None`) the per-envelope transform hook
    /// applied to every message this cache ingests, upstream or direct.
    /// Replaces any previously-installed hook.
    pub async fn set_transform(&self, hook: Option<TransformHook>) {
        *self.transform.lock().await = hook;
    }

    /// Record and forward `payload` under `topic` directly, without an
    /// upstream publisher round-trip.
    ///
    /// Lets a locally-computed value (a `ControlState` the router just
    /// changed, or the last requested `ScanParameters2D` the drift
    /// scheduler's rescan trigger wants republished) enter the same cache
    /// its translator data flows through, so every downstream subscriber
    /// sees it through one uniform channel.
    pub async fn publish<T: serde::Serialize>(&self, topic: impl Into<String>, payload: &T) -> Result<()> {
        let bytes = bincode::serialize(payload)?;
        let topic = topic.into();
        let transformed = match self.transform.lock().await.as_ref() {
            Some(hook) => hook(&topic, bytes),
            None => bytes,
        };
        let envelope = Envelope::new(topic, transformed);
        record_and_broadcast(&self.cache, &self.tx, envelope).await;
        Ok(())
    }

    /// Publish the reserved `KILL` topic to every downstream subscriber and
    /// record it so a subscriber connecting after shutdown still observes
    /// it via replay.
    pub async fn publish_kill(&self) -> Result<()> {
        self.publish(crate::topics::KILL, &()).await
    }
}

/// Records `envelope` and broadcasts it to live subscribers as one atomic
/// step under the cache lock, so [`subscribe_and_replay`] can never observe
/// a message as both "already in the replay snapshot" and "not yet
/// broadcast" (or the reverse) — either it was recorded and sent before a
/// new subscriber's snapshot was taken, in which case the snapshot already
/// carries it, or the subscriber's lock was held first, in which case the
/// subscription already exists before this send happens. Either way the
/// message reaches the subscriber exactly once.
async fn record_and_broadcast(
    cache: &Mutex<TopicCache>,
    tx: &broadcast::Sender<CachedEnvelope>,
    envelope: CachedEnvelope,
) {
    let mut guard = cache.lock().await;
    guard.record(envelope.clone());
    let _ = tx.send(envelope);
}

/// Subscribes to live messages and takes the replay snapshot as one atomic
/// step under the cache lock, paired with [`record_and_broadcast`]'s own
/// lock-held send so a message ingested concurrently with a new subscriber
/// connecting is delivered exactly once rather than via both the replay and
/// the live forward.
async fn subscribe_and_replay(
    cache: &Mutex<TopicCache>,
    tx: &broadcast::Sender<CachedEnvelope>,
    filters: &[String],
) -> (broadcast::Receiver<CachedEnvelope>, Vec<CachedEnvelope>) {
    let guard = cache.lock().await;
    let rx = tx.subscribe();
    let replay = guard.replay_for(filters);
    (rx, replay)
}

async fn serve_downstream(
    mut socket: TcpStream,
    tx: broadcast::Sender<CachedEnvelope>,
    cache: Arc<Mutex<TopicCache>>,
) {
    let filters: Vec<String> = match read_frame(&mut socket).await {
        Ok(filters) => filters,
        Err(err) => {
            tracing::warn!(error = %err, "failed to read downstream subscriber filter");
            return;
        }
    };

    let (mut rx, replay) = subscribe_and_replay(&cache, &tx, &filters).await;
    for envelope in replay {
        if write_frame(&mut socket, &envelope).await.is_err() {
            return;
        }
    }

    loop {
        match rx.recv().await {
            Ok(envelope) => {
                let matches = filters.is_empty()
                    || filters.iter().any(|f| envelope.topic.starts_with(f.as_str()));
                if matches && write_frame(&mut socket, &envelope).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "downstream subscriber fell behind cache, messages dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_cache_bounds_to_capacity() {
        let mut cache = TopicCache::new(CacheCapacity::uniform(2));
        for i in 0..5u32 {
            cache.record(Envelope::new("t", bincode::serialize(&i).unwrap()));
        }
        assert_eq!(cache.by_topic.get("t").unwrap().len(), 2);
    }

    #[test]
    fn per_topic_override_beats_default_capacity() {
        let overrides = HashMap::from([("scan2d".to_string(), 5usize)]);
        let mut cache = TopicCache::new(CacheCapacity::new(1, overrides));
        for i in 0..5u32 {
            cache.record(Envelope::new("scan2d.image", bincode::serialize(&i).unwrap()));
            cache.record(Envelope::new("scan1d.curve", bincode::serialize(&i).unwrap()));
        }
        assert_eq!(cache.by_topic.get("scan2d.image").unwrap().len(), 5);
        assert_eq!(cache.by_topic.get("scan1d.curve").unwrap().len(), 1);
    }

    #[test]
    fn longest_matching_prefix_wins() {
        let overrides =
            HashMap::from([("scan".to_string(), 2usize), ("scan2d".to_string(), 6usize)]);
        let capacity = CacheCapacity::new(1, overrides);
        assert_eq!(capacity.capacity_for("scan2d.image"), 6);
        assert_eq!(capacity.capacity_for("scan1d.curve"), 2);
        assert_eq!(capacity.capacity_for("spec.curve"), 1);
    }

    #[test]
    fn replay_respects_filters() {
        let mut cache = TopicCache::new(CacheCapacity::uniform(4));
        cache.record(Envelope::new("scan.image", vec![1]));
        cache.record(Envelope::new("spec.curve", vec![2]));
        let replay = cache.replay_for(&["scan".to_string()]);
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].topic, "scan.image");
    }

    #[test]
    fn empty_filter_replays_every_topic() {
        let mut cache = TopicCache::new(CacheCapacity::uniform(4));
        cache.record(Envelope::new("scan.image", vec![1]));
        cache.record(Envelope::new("spec.curve", vec![2]));
        assert_eq!(cache.replay_for(&[]).len(), 2);
    }

    #[tokio::test]
    async fn subscriber_connecting_during_ingest_gets_each_message_once() {
        let cache = Arc::new(Mutex::new(TopicCache::new(CacheCapacity::uniform(16))));
        let (tx, _rx) = broadcast::channel(16);

        record_and_broadcast(&cache, &tx, Envelope::new("scan.image", vec![1])).await;

        let (mut rx, replay) = subscribe_and_replay(&cache, &tx, &[]).await;
        assert_eq!(replay.len(), 1);

        record_and_broadcast(&cache, &tx, Envelope::new("scan.image", vec![2])).await;

        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded.payload, vec![2]);
        assert!(rx.try_recv().is_err());
    }
}
