use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, trace, warn};

use crate::codec::encoder::{encode, set_message_id};
use crate::config::CoapConfig;
use crate::error::ExchangeError;
use crate::message::coap_message::CoapMessage;
use crate::message::message_type::MessageType;
use crate::message::token::Token;
use crate::reliability::backoff::retransmission_delay;
use crate::reliability::channel::DatagramChannel;
use crate::reliability::events::{ExchangeEvent, ExchangeEventNotifier, ExchangeKey};
use crate::reliability::message_id::{MessageIdAllocator, MessageIdReleaseListener};
use crate::reliability::scheduler::{Scheduler, TimerHandle};
use crate::util::random::RngRandom;

/// What happened to a response handed to [ServerExchangeManager::send_response]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ResponseDisposition {
    /// the response was sent with the given message id
    Sent(u16),
    /// the response replaced the content of a confirmable update notification that is still being
    ///  retransmitted under the given message id. It is not sent now, but with the next
    ///  retransmission. Once the last retransmission is out, an update is sent with a new message
    ///  id instead.
    Updated(u16),
}

struct TrackedResponse {
    message_type: MessageType,
    message_id: u16,
    datagram: Bytes,
    serial: u64,
    /// the next retransmission for CON, the removal after the grace period for NON
    timer: Option<TimerHandle>,
}

#[derive(Default)]
struct Transfers {
    by_message_id: FxHashMap<(SocketAddr, u16), Token>,
    by_token: FxHashMap<(SocketAddr, Token), TrackedResponse>,
}

impl Transfers {
    fn insert(&mut self, remote: SocketAddr, token: Token, tracked: TrackedResponse) {
        self.by_message_id.insert((remote, tracked.message_id), token.clone());
        self.by_token.insert((remote, token), tracked);
    }

    fn remove_by_token(&mut self, remote: SocketAddr, token: &Token) -> Option<TrackedResponse> {
        let tracked = self.by_token.remove(&(remote, token.clone()))?;
        self.by_message_id.remove(&(remote, tracked.message_id));
        Some(tracked)
    }

    fn remove_by_message_id(&mut self, remote: SocketAddr, message_id: u16) -> Option<(Token, TrackedResponse)> {
        let token = self.by_message_id.remove(&(remote, message_id))?;
        let tracked = self.by_token.remove(&(remote, token.clone()))?;
        Some((token, tracked))
    }
}

/// Drives outbound responses: separate CON responses and update notifications are retransmitted
///  until they are acknowledged, NON update notifications are kept for a grace period so that an
///  RST can still be correlated.
///
/// Retransmissions are scheduled one at a time, each firing schedules the next. That allows the
///  content of a confirmable update notification to be replaced while it is being retransmitted.
pub struct ServerExchangeManager {
    config: Arc<CoapConfig>,
    scheduler: Arc<dyn Scheduler>,
    channel: Arc<dyn DatagramChannel>,
    allocator: Arc<MessageIdAllocator>,
    myself: Weak<ServerExchangeManager>,
    transfers: RwLock<Transfers>,
    next_serial: AtomicU64,
    events: ExchangeEventNotifier,
}

impl ServerExchangeManager {
    pub async fn new(
        config: Arc<CoapConfig>,
        scheduler: Arc<dyn Scheduler>,
        channel: Arc<dyn DatagramChannel>,
        allocator: Arc<MessageIdAllocator>,
    ) -> Arc<ServerExchangeManager> {
        let events = ExchangeEventNotifier::new(config.event_channel_capacity);
        let result = Arc::new_cyclic(|myself| ServerExchangeManager {
            config,
            scheduler,
            channel,
            allocator: allocator.clone(),
            myself: myself.clone(),
            transfers: Default::default(),
            next_serial: AtomicU64::new(0),
            events,
        });

        allocator.add_release_listener(Arc::downgrade(&result) as Weak<dyn MessageIdReleaseListener>).await;
        result
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExchangeEvent> {
        self.events.subscribe()
    }

    pub async fn send_response(&self, remote: SocketAddr, mut response: CoapMessage) -> Result<ResponseDisposition, ExchangeError> {
        let mut datagram = encode(&response)?;

        if response.is_update_notification() && response.message_type != MessageType::Ack {
            if let Some(message_id) = self.update_in_place(remote, &response.token, &mut datagram).await {
                return Ok(ResponseDisposition::Updated(message_id));
            }
            response.message_id = None;
        }

        let message_id = match response.message_id {
            Some(id) => id,
            None => match self.allocator.allocate(remote, response.token.clone()).await {
                Ok(id) => {
                    self.events.send_event(ExchangeEvent::MessageIdAssigned(ExchangeKey::new(remote, id, response.token.clone())));
                    id
                }
                Err(e) => {
                    self.events.send_event(ExchangeEvent::NoMessageIdAvailable { remote, token: response.token.clone() });
                    return Err(e);
                }
            }
        };
        set_message_id(&mut datagram, message_id);
        let datagram = datagram.freeze();
        let key = ExchangeKey::new(remote, message_id, response.token.clone());

        match response.message_type {
            MessageType::Con => {
                self.track(&key, MessageType::Con, datagram.clone(), |serial| {
                    self.schedule_retransmission(key.clone(), serial, 1)
                }).await;
            }
            MessageType::Non if response.is_update_notification() => {
                self.track(&key, MessageType::Non, datagram.clone(), |serial| {
                    self.schedule_grace_period_removal(key.clone(), serial)
                }).await;
            }
            _ => {}
        }

        trace!("sending response {:?} to {:?} with message id {}", response, remote, message_id);
        self.send_datagram(&key, &datagram).await;
        Ok(ResponseDisposition::Sent(message_id))
    }

    /// Replaces the content of a tracked CON update notification for the same token, so the next
    ///  retransmission carries the new content (including its Observe number).
    ///
    /// If there is no retransmission left to carry the update, or the tracked notification is NON,
    ///  the tracked notification is removed instead, and the new notification is sent with a new
    ///  message id.
    async fn update_in_place(&self, remote: SocketAddr, token: &Token, datagram: &mut [u8]) -> Option<u16> {
        if !self.transfers.read().await.by_token.contains_key(&(remote, token.clone())) {
            return None;
        }

        let mut transfers = self.transfers.write().await;
        let tracked = transfers.by_token.get_mut(&(remote, token.clone()))?;
        let retransmission_pending = tracked.timer.as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false);
        if tracked.message_type == MessageType::Con && retransmission_pending {
            set_message_id(datagram, tracked.message_id);
            tracked.datagram = Bytes::copy_from_slice(datagram);
            info!("updated content of confirmable notification {:?} / {} in place", token, tracked.message_id);
            return Some(tracked.message_id);
        }

        if let Some(previous) = transfers.remove_by_token(remote, token) {
            debug!("replacing {:?} notification {:?} / {}", previous.message_type, token, previous.message_id);
            if let Some(timer) = previous.timer {
                timer.cancel();
            }
        }
        None
    }

    async fn track(&self, key: &ExchangeKey, message_type: MessageType, datagram: Bytes, schedule: impl FnOnce(u64) -> TimerHandle) {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);

        let mut transfers = self.transfers.write().await;
        if let Some(previous) = transfers.remove_by_token(key.remote, &key.token) {
            debug!("response {:?} replaces a tracked response with message id {}", key, previous.message_id);
            if let Some(timer) = previous.timer {
                timer.cancel();
            }
        }
        transfers.insert(key.remote, key.token.clone(), TrackedResponse {
            message_type,
            message_id: key.message_id,
            datagram,
            serial,
            timer: Some(schedule(serial)),
        });
    }

    fn schedule_retransmission(&self, key: ExchangeKey, serial: u64, retransmission: u32) -> TimerHandle {
        let delay = retransmission_delay::<RngRandom>(retransmission, &self.config);
        debug!("scheduling retransmission #{} for {:?} after {:?}", retransmission, key, delay);

        let myself = self.myself.clone();
        self.scheduler.schedule_after(delay, Box::pin(async move {
            if let Some(manager) = myself.upgrade() {
                manager.on_retransmission_due(key, serial, retransmission).await;
            }
        }))
    }

    async fn on_retransmission_due(&self, key: ExchangeKey, serial: u64, retransmission: u32) {
        {
            let transfers = self.transfers.read().await;
            let datagram = match transfers.by_token.get(&(key.remote, key.token.clone())) {
                Some(t) if t.serial == serial => t.datagram.clone(),
                _ => {
                    trace!("retransmission #{} for {:?} is no longer due", retransmission, key);
                    return;
                }
            };

            debug!("retransmission #{} for {:?}", retransmission, key);
            if self.send_datagram(&key, &datagram).await {
                self.events.send_event(ExchangeEvent::MessageRetransmitted { key: key.clone(), retransmission });
            }
        }

        if retransmission >= self.config.max_retransmissions {
            warn!("no more retransmissions for {:?}", key);
            return;
        }

        let mut transfers = self.transfers.write().await;
        if let Some(t) = transfers.by_token.get_mut(&(key.remote, key.token.clone())) {
            if t.serial == serial {
                t.timer = Some(self.schedule_retransmission(key, serial, retransmission + 1));
            }
        }
    }

    fn schedule_grace_period_removal(&self, key: ExchangeKey, serial: u64) -> TimerHandle {
        let myself = self.myself.clone();
        self.scheduler.schedule_after(self.config.non_notification_grace_period, Box::pin(async move {
            if let Some(manager) = myself.upgrade() {
                let mut transfers = manager.transfers.write().await;
                let is_same = transfers.by_token.get(&(key.remote, key.token.clone()))
                    .map(|t| t.serial == serial)
                    .unwrap_or(false);
                if is_same {
                    // this is the running timer, so it is not cancelled
                    transfers.remove_by_token(key.remote, &key.token);
                    debug!("removed non-confirmable notification {:?} - an RST can not be correlated anymore", key);
                }
            }
        }))
    }

    /// returns `true` if the datagram was sent successfully
    async fn send_datagram(&self, key: &ExchangeKey, datagram: &[u8]) -> bool {
        match self.channel.send(key.remote, datagram).await {
            Ok(()) => true,
            Err(e) => {
                warn!("error sending response to {:?}: {}", key.remote, e);
                self.events.send_event(ExchangeEvent::TransmissionFailed { key: key.clone(), reason: e.to_string() });
                false
            }
        }
    }

    /// Stops tracking the response sent with a given message id, returning its token if it was
    ///  tracked. Removing an entry that is not tracked (anymore) is a no-op.
    pub async fn remove_transfer(&self, remote: SocketAddr, message_id: u16) -> Option<Token> {
        if !self.transfers.read().await.by_message_id.contains_key(&(remote, message_id)) {
            return None;
        }

        let (token, tracked) = self.transfers.write().await
            .remove_by_message_id(remote, message_id)?;
        if let Some(timer) = tracked.timer {
            timer.cancel();
        }
        Some(token)
    }

    /// Stops tracking the response for a given token, returning its message id if it was
    ///  tracked.
    pub async fn remove_transfer_by_token(&self, remote: SocketAddr, token: &Token) -> Option<u16> {
        let tracked = self.transfers.write().await
            .remove_by_token(remote, token)?;
        if let Some(timer) = tracked.timer {
            timer.cancel();
        }
        Some(tracked.message_id)
    }

    pub async fn is_tracked(&self, remote: SocketAddr, token: &Token) -> bool {
        self.transfers.read().await
            .by_token.contains_key(&(remote, token.clone()))
    }

    /// Processes an inbound message. Returns `true` if the message should be processed further,
    ///  `false` if it was fully handled here.
    pub async fn on_inbound(&self, remote: SocketAddr, message: &CoapMessage) -> bool {
        if !message.is_empty() || message.message_type == MessageType::Con {
            return true;
        }
        let Some(message_id) = message.message_id else {
            return false;
        };

        match self.remove_transfer(remote, message_id).await {
            Some(token) => {
                let key = ExchangeKey::new(remote, message_id, token);
                if message.message_type == MessageType::Rst {
                    info!("received RST for response {:?}", key);
                    self.events.send_event(ExchangeEvent::ResetReceived(key));
                }
                else {
                    info!("received empty ACK for response {:?}", key);
                    self.events.send_event(ExchangeEvent::EmptyAckReceived(key));
                }
            }
            None => {
                debug!("no open transfer for empty {:?} from {:?} with message id {}", message.message_type, remote, message_id);
            }
        }
        false
    }
}

#[async_trait]
impl MessageIdReleaseListener for ServerExchangeManager {
    async fn on_message_id_released(&self, remote: SocketAddr, message_id: u16, token: Token) {
        let removed = {
            let mut transfers = self.transfers.write().await;
            let is_same_exchange = transfers.by_token.get(&(remote, token.clone()))
                .map(|t| t.message_id == message_id)
                .unwrap_or(false);
            if is_same_exchange {
                transfers.remove_by_token(remote, &token)
            }
            else {
                None
            }
        };

        let key = ExchangeKey::new(remote, message_id, token);
        match removed {
            Some(tracked) if tracked.message_type == MessageType::Con => {
                if let Some(timer) = tracked.timer {
                    timer.cancel();
                }
                warn!("transmission timeout for response {:?}", key);
                self.events.send_event(ExchangeEvent::TransmissionTimeout(key));
            }
            _ => {
                trace!("message id released for {:?}", key);
                self.events.send_event(ExchangeEvent::MessageIdReleased(key));
            }
        }
    }
}
