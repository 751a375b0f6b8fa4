use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use crate::config::CoapConfig;
use crate::error::ExchangeError;
use crate::message::token::Token;
use crate::reliability::scheduler::{Scheduler, TimerHandle};
use crate::util::random::{Random, RngRandom};

/// the number of distinct message ids
pub const MODULUS: usize = 65536;

#[async_trait]
pub trait MessageIdReleaseListener: Send + Sync + 'static {
    /// Called whenever a message id is released, either explicitly or because its exchange
    ///  lifetime expired. `token` is empty if the id was not allocated.
    async fn on_message_id_released(&self, remote: SocketAddr, message_id: u16, token: Token);
}

struct Allocation {
    token: Token,
    /// distinguishes an allocation from a later allocation of the same id, so that an expiry
    ///  timer that fires late does not release its successor
    serial: u64,
    expiry_timer: Option<TimerHandle>,
}

/// Issues message ids per remote endpoint and keeps them reserved for the exchange lifetime.
///
/// An id is never handed out twice for the same endpoint while it is live. Ids are released after
///  [CoapConfig::exchange_lifetime] at the latest, which bounds the number of live ids per
///  endpoint to [MODULUS].
pub struct MessageIdAllocator {
    config: Arc<CoapConfig>,
    scheduler: Arc<dyn Scheduler>,
    myself: Weak<MessageIdAllocator>,
    allocations: RwLock<FxHashMap<SocketAddr, BTreeMap<u16, Allocation>>>,
    next_serial: AtomicU64,
    release_listeners: RwLock<Vec<Weak<dyn MessageIdReleaseListener>>>,
}

impl MessageIdAllocator {
    pub fn new(config: Arc<CoapConfig>, scheduler: Arc<dyn Scheduler>) -> Arc<MessageIdAllocator> {
        Arc::new_cyclic(|myself| MessageIdAllocator {
            config,
            scheduler,
            myself: myself.clone(),
            allocations: Default::default(),
            next_serial: AtomicU64::new(0),
            release_listeners: Default::default(),
        })
    }

    /// Listeners are held weakly, so registering does not keep them alive.
    pub async fn add_release_listener(&self, listener: Weak<dyn MessageIdReleaseListener>) {
        let mut listeners = self.release_listeners.write().await;
        listeners.retain(|l| l.strong_count() > 0);
        listeners.push(listener);
    }

    pub async fn allocate(&self, remote: SocketAddr, token: Token) -> Result<u16, ExchangeError> {
        if self.num_allocated(remote).await >= MODULUS {
            warn!("no message id available for {:?}", remote);
            return Err(ExchangeError::NoMessageIdAvailable { remote });
        }

        let mut allocations = self.allocations.write().await;
        let ids = allocations.entry(remote).or_default();
        if ids.len() >= MODULUS {
            warn!("no message id available for {:?}", remote);
            return Err(ExchangeError::NoMessageIdAvailable { remote });
        }

        let message_id = next_free_id(ids, RngRandom::gen_u16);
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let expiry_timer = self.schedule_expiry(remote, message_id, serial);

        trace!("allocated message id {} for {:?} ({:?})", message_id, remote, token);
        ids.insert(message_id, Allocation {
            token,
            serial,
            expiry_timer: Some(expiry_timer),
        });
        Ok(message_id)
    }

    fn schedule_expiry(&self, remote: SocketAddr, message_id: u16, serial: u64) -> TimerHandle {
        let myself = self.myself.clone();
        self.scheduler.schedule_after(self.config.exchange_lifetime, Box::pin(async move {
            if let Some(allocator) = myself.upgrade() {
                allocator.on_expiry(remote, message_id, serial).await;
            }
        }))
    }

    async fn on_expiry(&self, remote: SocketAddr, message_id: u16, serial: u64) {
        let token = {
            let mut allocations = self.allocations.write().await;
            let Some(ids) = allocations.get_mut(&remote) else {
                return;
            };
            match ids.get(&message_id) {
                Some(a) if a.serial == serial => {}
                _ => {
                    trace!("expiry of message id {} for {:?} is stale - ignoring", message_id, remote);
                    return;
                }
            }
            let allocation = ids.remove(&message_id);
            if ids.is_empty() {
                allocations.remove(&remote);
            }
            allocation.map(|a| a.token).unwrap_or_default()
        };

        debug!("message id {} for {:?} expired", message_id, remote);
        self.notify_released(remote, message_id, token).await;
    }

    /// Releases an id explicitly. Listeners are notified even if the id was not allocated.
    ///
    /// Exchanges do not release their id when they complete: the remote endpoint detects
    ///  duplicates by message id for up to EXCHANGE_LIFETIME, so reusing an id earlier could get a
    ///  new message discarded as a duplicate. This is for callers that know the remote endpoint
    ///  holds no state for the id, e.g. because the message was never sent.
    pub async fn release(&self, remote: SocketAddr, message_id: u16) {
        let removed = {
            let mut allocations = self.allocations.write().await;
            let removed = allocations.get_mut(&remote)
                .and_then(|ids| ids.remove(&message_id));
            if allocations.get(&remote).map(|ids| ids.is_empty()).unwrap_or(false) {
                allocations.remove(&remote);
            }
            removed
        };

        let token = match removed {
            Some(allocation) => {
                if let Some(timer) = &allocation.expiry_timer {
                    timer.cancel();
                }
                allocation.token
            }
            None => {
                debug!("releasing message id {} for {:?} that was not allocated", message_id, remote);
                Token::empty()
            }
        };

        self.notify_released(remote, message_id, token).await;
    }

    async fn notify_released(&self, remote: SocketAddr, message_id: u16, token: Token) {
        let listeners: Vec<_> = self.release_listeners.read().await
            .iter()
            .filter_map(|l| l.upgrade())
            .collect();

        for listener in listeners {
            listener.on_message_id_released(remote, message_id, token.clone()).await;
        }
    }

    pub async fn num_allocated(&self, remote: SocketAddr) -> usize {
        self.allocations.read().await
            .get(&remote)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }

    pub async fn is_allocated(&self, remote: SocketAddr, message_id: u16) -> bool {
        self.allocations.read().await
            .get(&remote)
            .map(|ids| ids.contains_key(&message_id))
            .unwrap_or(false)
    }
}

/// A random id if there is no live id, otherwise the id following the highest live id. After
///  wrap-around, the candidate is advanced past ids that are still live.
///
/// Callers must ensure there is at least one free id.
fn next_free_id(live: &BTreeMap<u16, Allocation>, random_start: impl FnOnce() -> u16) -> u16 {
    let mut candidate = match live.last_key_value() {
        None => return random_start(),
        Some((highest, _)) => highest.wrapping_add(1),
    };
    while live.contains_key(&candidate) {
        candidate = candidate.wrapping_add(1);
    }
    candidate
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use rstest::rstest;
    use tokio::runtime::Builder;
    use super::*;
    use crate::reliability::scheduler::TokioScheduler;
    use crate::test_util::addr::test_addr_from_number;
    use crate::test_util::listener::CollectingReleaseListener;

    fn live_map(ids: &[u16]) -> BTreeMap<u16, Allocation> {
        ids.iter()
            .map(|&id| (id, Allocation { token: Token::empty(), serial: 0, expiry_timer: None }))
            .collect()
    }

    #[rstest]
    #[case::empty(vec![], 1234)]
    #[case::single(vec![5], 6)]
    #[case::highest_plus_one(vec![3, 9, 4], 10)]
    #[case::wrap_around(vec![65535], 0)]
    #[case::wrap_around_skips_live(vec![0, 1, 2, 65535], 3)]
    fn test_next_free_id(#[case] live: Vec<u16>, #[case] expected: u16) {
        assert_eq!(next_free_id(&live_map(&live), || 1234), expected);
    }

    async fn new_allocator() -> (Arc<MessageIdAllocator>, Arc<CollectingReleaseListener>) {
        let config = Arc::new(CoapConfig::new(test_addr_from_number(1)));
        let allocator = MessageIdAllocator::new(config, Arc::new(TokioScheduler::new().unwrap()));
        let listener = Arc::new(CollectingReleaseListener::default());
        let weak: Weak<dyn MessageIdReleaseListener> = Arc::downgrade(&listener) as _;
        allocator.add_release_listener(weak).await;
        (allocator, listener)
    }

    #[test]
    fn test_exhaustion_and_expiry() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let (allocator, listener) = new_allocator().await;
            let remote = test_addr_from_number(2);

            let mut ids = std::collections::BTreeSet::new();
            for _ in 0..MODULUS {
                let id = allocator.allocate(remote, Token::empty()).await.unwrap();
                assert!(ids.insert(id), "message id {} was allocated twice", id);
            }
            assert_eq!(
                allocator.allocate(remote, Token::empty()).await,
                Err(ExchangeError::NoMessageIdAvailable { remote }),
            );

            // other endpoints are not affected
            assert!(allocator.allocate(test_addr_from_number(3), Token::empty()).await.is_ok());

            tokio::time::sleep(Duration::from_secs(248)).await;

            let released = listener.released();
            let released_for_remote: Vec<_> = released.iter()
                .filter(|(r, _, _)| *r == remote)
                .map(|(_, id, _)| *id)
                .collect();
            assert_eq!(released_for_remote.len(), MODULUS);
            let distinct: std::collections::BTreeSet<_> = released_for_remote.into_iter().collect();
            assert_eq!(distinct.len(), MODULUS);

            assert_eq!(allocator.num_allocated(remote).await, 0);
            assert!(allocator.allocate(remote, Token::empty()).await.is_ok());
        });
    }

    #[test]
    fn test_sequential_ids() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let (allocator, _) = new_allocator().await;
            let remote = test_addr_from_number(2);

            let first = allocator.allocate(remote, Token::empty()).await.unwrap();
            let second = allocator.allocate(remote, Token::empty()).await.unwrap();
            assert_eq!(second, first.wrapping_add(1));
        });
    }

    #[test]
    fn test_explicit_release() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let (allocator, listener) = new_allocator().await;
            let remote = test_addr_from_number(2);

            let id = allocator.allocate(remote, Token::from_u64(7)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            allocator.release(remote, id).await;
            assert!(!allocator.is_allocated(remote, id).await);
            assert_eq!(listener.released(), vec![(remote, id, Token::from_u64(7))]);

            // release of an id that is not allocated still signals
            allocator.release(remote, id).await;
            assert_eq!(listener.released().len(), 2);
            assert_eq!(listener.released()[1], (remote, id, Token::empty()));

            // the expiry of the released allocation does not signal again
            tokio::time::sleep(Duration::from_secs(300)).await;
            assert_eq!(listener.released().len(), 2);
        });
    }

    #[test]
    fn test_stale_expiry_does_not_release_reallocated_id() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let (allocator, listener) = new_allocator().await;
            let remote = test_addr_from_number(2);

            let id = allocator.allocate(remote, Token::from_u64(1)).await.unwrap();
            allocator.release(remote, id).await;

            tokio::time::sleep(Duration::from_secs(100)).await;
            // the endpoint has no live ids, so the next id is random - allocate until we get the
            //  same id again or give up
            let mut reallocated = None;
            for _ in 0..MODULUS {
                let candidate = allocator.allocate(remote, Token::from_u64(2)).await.unwrap();
                if candidate == id {
                    reallocated = Some(candidate);
                    break;
                }
            }
            assert_eq!(reallocated, Some(id));

            // the first allocation would have expired at 247s
            tokio::time::sleep(Duration::from_secs(200)).await;
            assert!(allocator.is_allocated(remote, id).await);
            assert_eq!(listener.released().len(), 1);
        });
    }

    #[test]
    fn test_listener_dropped() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let (allocator, listener) = new_allocator().await;
            drop(listener);
            let remote = test_addr_from_number(2);
            let id = allocator.allocate(remote, Token::empty()).await.unwrap();
            allocator.release(remote, id).await;
        });
    }
}
