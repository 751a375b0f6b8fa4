use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use crc::Crc;
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::reliability::scheduler::Scheduler;

/// Turns a resource's status value into its wire representation for a given content format.
pub trait StatusSerializer<T>: Send + Sync + 'static {
    /// the content formats this serializer supports, in order of preference
    fn content_formats(&self) -> Vec<u16>;

    /// `None` if the content format is not supported
    fn serialize(&self, status: &T, content_format: u16) -> Option<Bytes>;
}

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct ETag(pub u64);
impl Debug for ETag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x?}", self.0)
    }
}
impl ETag {
    pub fn new(content_format: u16, content: &[u8]) -> ETag {
        let hasher = Crc::<u64>::new(&crc::CRC_64_REDIS);
        let mut digest = hasher.digest();

        digest.update(&content_format.to_be_bytes());
        digest.update(content);

        ETag(digest.finalize())
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.0.to_be_bytes())
    }
}

/// A status representation together with the metadata that belongs to it. All fields originate
///  from the same status update.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WrappedStatus {
    pub content: Bytes,
    pub content_format: u16,
    pub etag: ETag,
    /// remaining freshness in whole seconds
    pub max_age: u32,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StatusEvent {
    /// carries the sequence number of the new status
    Updated(u64),
    Shutdown,
}

struct Representation {
    content: Bytes,
    etag: ETag,
}

struct StatusSnapshot<T> {
    value: Arc<T>,
    representations: FxHashMap<u16, Representation>,
    expiry: Instant,
    sequence: u64,
}

impl<T: 'static> StatusSnapshot<T> {
    fn new(value: T, lifetime: Duration, sequence: u64, serializer: &dyn StatusSerializer<T>) -> StatusSnapshot<T> {
        let mut representations = FxHashMap::default();
        for content_format in serializer.content_formats() {
            match serializer.serialize(&value, content_format) {
                Some(content) => {
                    let etag = ETag::new(content_format, &content);
                    representations.insert(content_format, Representation { content, etag });
                }
                None => warn!("serializer announced content format {} but does not support it", content_format),
            }
        }

        StatusSnapshot {
            value: Arc::new(value),
            representations,
            expiry: Instant::now() + lifetime,
            sequence,
        }
    }

    fn max_age(&self) -> u32 {
        let remaining = self.expiry.saturating_duration_since(Instant::now()).as_secs();
        remaining.min(u32::MAX as u64) as u32
    }

    fn wrapped(&self, content_format: u16) -> Option<WrappedStatus> {
        let representation = self.representations.get(&content_format)?;
        Some(WrappedStatus {
            content: representation.content.clone(),
            content_format,
            etag: representation.etag,
            max_age: self.max_age(),
        })
    }
}

/// Holds the current status of an observable resource with its serialized representations,
///  ETags and freshness.
///
/// Status updates are serialized through the scheduler and applied under the write lock, so every
///  read sees the content, ETag and max age of one and the same update. Updates are numbered when
///  [ResourceStatusCache::set_status] is called; an update that is overtaken by a newer one is
///  discarded.
pub struct ResourceStatusCache<T: Send + Sync + 'static> {
    path: String,
    scheduler: Arc<dyn Scheduler>,
    serializer: Arc<dyn StatusSerializer<T>>,
    myself: Weak<ResourceStatusCache<T>>,
    status: RwLock<StatusSnapshot<T>>,
    next_sequence: AtomicU64,
    events: broadcast::Sender<StatusEvent>,
}

impl<T: Send + Sync + 'static> ResourceStatusCache<T> {
    pub fn new(
        path: impl Into<String>,
        initial_status: T,
        lifetime: Duration,
        serializer: Arc<dyn StatusSerializer<T>>,
        scheduler: Arc<dyn Scheduler>,
        event_channel_capacity: usize,
    ) -> Arc<ResourceStatusCache<T>> {
        let initial = StatusSnapshot::new(initial_status, lifetime, 0, serializer.as_ref());
        let (events, _) = broadcast::channel(event_channel_capacity);

        Arc::new_cyclic(|myself| ResourceStatusCache {
            path: path.into(),
            scheduler,
            serializer,
            myself: myself.clone(),
            status: RwLock::new(initial),
            next_sequence: AtomicU64::new(1),
            events,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Schedules a status update. It is applied asynchronously, and observers are notified once it
    ///  is in place.
    pub fn set_status(&self, status: T, lifetime: Duration) {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        trace!("scheduling status update #{} for {}", sequence, self.path);

        let myself = self.myself.clone();
        self.scheduler.submit(Box::pin(async move {
            if let Some(cache) = myself.upgrade() {
                cache.apply_status(status, lifetime, sequence).await;
            }
        }));
    }

    async fn apply_status(&self, status: T, lifetime: Duration, sequence: u64) {
        {
            let mut current = self.status.write().await;
            if current.sequence > sequence {
                debug!("status update #{} for {} was overtaken by #{} - discarding", sequence, self.path, current.sequence);
                return;
            }
            *current = StatusSnapshot::new(status, lifetime, sequence, self.serializer.as_ref());
        }
        debug!("status of {} updated (#{})", self.path, sequence);
        let _ = self.events.send(StatusEvent::Updated(sequence));
    }

    pub async fn status(&self) -> Arc<T> {
        self.status.read().await.value.clone()
    }

    pub async fn sequence(&self) -> u64 {
        self.status.read().await.sequence
    }

    pub async fn max_age(&self) -> u32 {
        self.status.read().await.max_age()
    }

    pub fn content_formats(&self) -> Vec<u16> {
        self.serializer.content_formats()
    }

    pub async fn get_wrapped_status(&self, content_format: u16) -> Option<WrappedStatus> {
        self.status.read().await.wrapped(content_format)
    }

    /// the representation for the first of the given content formats that is supported
    pub async fn get_wrapped_status_any(&self, content_formats: &[u16]) -> Option<WrappedStatus> {
        let status = self.status.read().await;
        content_formats.iter()
            .find_map(|cf| status.wrapped(*cf))
    }

    /// notifies observers that the resource is gone
    pub fn shutdown(&self) {
        debug!("shutting down resource {}", self.path);
        let _ = self.events.send(StatusEvent::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use tokio::runtime::Builder;
    use super::*;
    use crate::reliability::scheduler::TokioScheduler;

    const TEXT_PLAIN: u16 = 0;
    const APPLICATION_JSON: u16 = 50;

    struct CounterSerializer;
    impl StatusSerializer<u64> for CounterSerializer {
        fn content_formats(&self) -> Vec<u16> {
            vec![TEXT_PLAIN, APPLICATION_JSON]
        }

        fn serialize(&self, status: &u64, content_format: u16) -> Option<Bytes> {
            match content_format {
                TEXT_PLAIN => Some(Bytes::from(status.to_string())),
                APPLICATION_JSON => Some(Bytes::from(format!("{{\"counter\":{}}}", status))),
                _ => None,
            }
        }
    }

    fn new_cache(lifetime: Duration) -> Arc<ResourceStatusCache<u64>> {
        let scheduler = Arc::new(TokioScheduler::new().unwrap());
        ResourceStatusCache::new("counter", 0, lifetime, Arc::new(CounterSerializer), scheduler, 16)
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrapped_status() {
        let cache = new_cache(Duration::from_secs(60));

        let wrapped = cache.get_wrapped_status(APPLICATION_JSON).await.unwrap();
        assert_eq!(wrapped.content, Bytes::from_static(b"{\"counter\":0}"));
        assert_eq!(wrapped.content_format, APPLICATION_JSON);
        assert_eq!(wrapped.etag, ETag::new(APPLICATION_JSON, b"{\"counter\":0}"));
        assert_eq!(wrapped.max_age, 60);

        assert!(cache.get_wrapped_status(42).await.is_none());

        let wrapped = cache.get_wrapped_status_any(&[42, TEXT_PLAIN, APPLICATION_JSON]).await.unwrap();
        assert_eq!(wrapped.content_format, TEXT_PLAIN);
        assert_eq!(wrapped.content, Bytes::from_static(b"0"));
        assert!(cache.get_wrapped_status_any(&[42, 43]).await.is_none());
    }

    #[test]
    fn test_etag() {
        assert_eq!(ETag::new(0, b"abc"), ETag::new(0, b"abc"));
        assert_ne!(ETag::new(0, b"abc"), ETag::new(0, b"abd"));
        assert_ne!(ETag::new(0, b"abc"), ETag::new(50, b"abc"));
        assert_eq!(ETag(0x0102030405060708).to_bytes().as_ref(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_age_never_negative() {
        let cache = new_cache(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(cache.max_age().await, 6);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(cache.max_age().await, 0);
        // stale status is still served
        let wrapped = cache.get_wrapped_status(TEXT_PLAIN).await.unwrap();
        assert_eq!(wrapped.max_age, 0);
        assert_eq!(wrapped.content, Bytes::from_static(b"0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_status_notifies() {
        let cache = new_cache(Duration::from_secs(10));
        let mut events = cache.subscribe();

        cache.set_status(7, Duration::from_secs(100));
        assert_eq!(events.recv().await.unwrap(), StatusEvent::Updated(1));

        assert_eq!(*cache.status().await, 7);
        assert_eq!(cache.sequence().await, 1);
        let wrapped = cache.get_wrapped_status(TEXT_PLAIN).await.unwrap();
        assert_eq!(wrapped.content, Bytes::from_static(b"7"));
        assert_eq!(wrapped.etag, ETag::new(TEXT_PLAIN, b"7"));
        assert_eq!(wrapped.max_age, 100);

        cache.shutdown();
        assert_eq!(events.recv().await.unwrap(), StatusEvent::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overtaken_update_is_discarded() {
        let cache = new_cache(Duration::from_secs(10));
        let mut events = cache.subscribe();

        // sequence numbers are taken when set_status is called, so applying #1 after #2 is a no-op
        cache.apply_status(2, Duration::from_secs(10), 2).await;
        cache.apply_status(1, Duration::from_secs(10), 1).await;

        assert_eq!(*cache.status().await, 2);
        assert_eq!(events.recv().await.unwrap(), StatusEvent::Updated(2));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_reads_are_consistent_under_concurrent_updates() {
        let rt = Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build().unwrap();
        rt.block_on(async {
            let cache = new_cache(Duration::from_secs(60));

            let writer = {
                let cache = cache.clone();
                tokio::spawn(async move {
                    for i in 1..=500u64 {
                        cache.set_status(i, Duration::from_secs(60));
                        tokio::task::yield_now().await;
                    }
                })
            };

            let readers: Vec<_> = (0..4)
                .map(|_| {
                    let cache = cache.clone();
                    tokio::spawn(async move {
                        for _ in 0..500 {
                            let wrapped = cache.get_wrapped_status(TEXT_PLAIN).await.unwrap();
                            assert_eq!(wrapped.etag, ETag::new(TEXT_PLAIN, &wrapped.content));
                            tokio::task::yield_now().await;
                        }
                    })
                })
                .collect();

            writer.await.unwrap();
            for r in readers {
                r.await.unwrap();
            }

            let mut events = cache.subscribe();
            while cache.sequence().await < 500 {
                let _ = events.recv().await;
            }
            assert_eq!(*cache.status().await, 500);
        });
    }
}
