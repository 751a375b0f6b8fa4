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
use crate::reliability::backoff::transmission_schedule;
use crate::reliability::channel::DatagramChannel;
use crate::reliability::events::{ExchangeEvent, ExchangeEventNotifier, ExchangeKey};
use crate::reliability::message_id::{MessageIdAllocator, MessageIdReleaseListener};
use crate::reliability::scheduler::{Scheduler, TimerHandle};
use crate::util::random::RngRandom;

/// an outbound CON message with all its (re)transmissions scheduled up front
struct Transmission {
    token: Token,
    serial: u64,
    timers: Vec<TimerHandle>,
}

/// Drives outbound requests (and pings): assigns message ids, sends, retransmits CON messages
///  until they are acknowledged, and correlates inbound ACK / RST with them.
pub struct ClientExchangeManager {
    config: Arc<CoapConfig>,
    scheduler: Arc<dyn Scheduler>,
    channel: Arc<dyn DatagramChannel>,
    allocator: Arc<MessageIdAllocator>,
    myself: Weak<ClientExchangeManager>,
    transmissions: RwLock<FxHashMap<(SocketAddr, u16), Transmission>>,
    next_serial: AtomicU64,
    events: ExchangeEventNotifier,
}

impl ClientExchangeManager {
    pub async fn new(
        config: Arc<CoapConfig>,
        scheduler: Arc<dyn Scheduler>,
        channel: Arc<dyn DatagramChannel>,
        allocator: Arc<MessageIdAllocator>,
    ) -> Arc<ClientExchangeManager> {
        let events = ExchangeEventNotifier::new(config.event_channel_capacity);
        let result = Arc::new_cyclic(|myself| ClientExchangeManager {
            config,
            scheduler,
            channel,
            allocator: allocator.clone(),
            myself: myself.clone(),
            transmissions: Default::default(),
            next_serial: AtomicU64::new(0),
            events,
        });

        allocator.add_release_listener(Arc::downgrade(&result) as Weak<dyn MessageIdReleaseListener>).await;
        result
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExchangeEvent> {
        self.events.subscribe()
    }

    /// Sends a message, returning the message id it was sent with.
    ///
    /// Requests and pings get a fresh message id, CON requests are retransmitted until they are
    ///  acknowledged or retransmissions are exhausted. Other messages (e.g. empty ACKs for
    ///  separate responses) are sent once with their own message id.
    pub async fn send(&self, remote: SocketAddr, message: CoapMessage) -> Result<u16, ExchangeError> {
        let mut datagram = encode(&message)?;

        if !(message.is_request() || message.is_ping()) {
            let message_id = message.message_id.unwrap_or(0);
            trace!("sending untracked message {:?} to {:?}", message, remote);
            self.send_datagram(&ExchangeKey::new(remote, message_id, message.token.clone()), &datagram).await;
            return Ok(message_id);
        }

        let message_id = match self.allocator.allocate(remote, message.token.clone()).await {
            Ok(id) => id,
            Err(e) => {
                self.events.send_event(ExchangeEvent::NoMessageIdAvailable { remote, token: message.token.clone() });
                return Err(e);
            }
        };
        set_message_id(&mut datagram, message_id);

        let key = ExchangeKey::new(remote, message_id, message.token.clone());
        debug!("message id {} assigned to {:?} for {:?}", message_id, message, remote);
        self.events.send_event(ExchangeEvent::MessageIdAssigned(key.clone()));

        let datagram = datagram.freeze();
        if message.message_type == MessageType::Con {
            self.schedule_transmissions(key, datagram).await;
        }
        else {
            let channel = self.channel.clone();
            let myself = self.myself.clone();
            self.scheduler.submit(Box::pin(async move {
                if let Err(e) = channel.send(key.remote, &datagram).await {
                    if let Some(manager) = myself.upgrade() {
                        manager.on_send_failed(key, e);
                    }
                }
            }));
        }
        Ok(message_id)
    }

    async fn schedule_transmissions(&self, key: ExchangeKey, datagram: Bytes) {
        let schedule = transmission_schedule::<RngRandom>(&self.config);
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);

        // timers are scheduled while holding the write lock so that even a transmission with no
        //  delay finds its entry in the table
        let mut transmissions = self.transmissions.write().await;
        let timers = schedule.into_iter()
            .enumerate()
            .map(|(n, delay)| {
                debug!("scheduling transmission #{} for {:?} after {:?}", n + 1, key, delay);
                let myself = self.myself.clone();
                let key = key.clone();
                let datagram = datagram.clone();
                self.scheduler.schedule_after(delay, Box::pin(async move {
                    if let Some(manager) = myself.upgrade() {
                        manager.on_transmission_due(key, serial, n as u32, datagram).await;
                    }
                }))
            })
            .collect();

        transmissions.insert((key.remote, key.message_id), Transmission {
            token: key.token,
            serial,
            timers,
        });
    }

    async fn on_transmission_due(&self, key: ExchangeKey, serial: u64, retransmission: u32, datagram: Bytes) {
        // holding the lock while sending ensures nothing is sent after retransmissions are stopped
        let transmissions = self.transmissions.read().await;
        match transmissions.get(&(key.remote, key.message_id)) {
            Some(t) if t.serial == serial => {}
            _ => {
                trace!("transmission #{} for {:?} is no longer due", retransmission + 1, key);
                return;
            }
        }

        if retransmission > 0 {
            debug!("retransmission #{} for {:?}", retransmission, key);
        }
        match self.channel.send(key.remote, &datagram).await {
            Ok(()) => {
                if retransmission > 0 {
                    self.events.send_event(ExchangeEvent::MessageRetransmitted { key, retransmission });
                }
            }
            Err(e) => self.on_send_failed(key, e),
        }
    }

    async fn send_datagram(&self, key: &ExchangeKey, datagram: &[u8]) {
        if let Err(e) = self.channel.send(key.remote, datagram).await {
            self.on_send_failed(key.clone(), e);
        }
    }

    fn on_send_failed(&self, key: ExchangeKey, e: anyhow::Error) {
        warn!("error sending message to {:?}: {}", key.remote, e);
        self.events.send_event(ExchangeEvent::TransmissionFailed { key, reason: e.to_string() });
    }

    /// Cancels all pending transmissions for a message id, returning the exchange's token if it
    ///  was still tracked.
    async fn stop_transmissions(&self, remote: SocketAddr, message_id: u16) -> Option<Token> {
        let transmission = self.transmissions.write().await
            .remove(&(remote, message_id))?;

        for (n, timer) in transmission.timers.iter().enumerate() {
            if timer.cancel() {
                debug!("cancelled transmission #{} for {:?} / {}", n + 1, remote, message_id);
            }
        }
        Some(transmission.token)
    }

    /// Processes an inbound message. Returns `true` if the message should be processed further,
    ///  `false` if it was fully handled here.
    pub async fn on_inbound(&self, remote: SocketAddr, message: &CoapMessage) -> bool {
        let Some(message_id) = message.message_id else {
            return true;
        };

        if message.is_empty() {
            if message.message_type == MessageType::Con {
                // pings are answered by inbound processing
                return true;
            }
            let Some(token) = self.stop_transmissions(remote, message_id).await else {
                return true;
            };

            let key = ExchangeKey::new(remote, message_id, token);
            match message.message_type {
                MessageType::Ack => {
                    info!("received empty ACK for {:?}", key);
                    self.events.send_event(ExchangeEvent::EmptyAckReceived(key));
                }
                _ => {
                    info!("received RST for {:?}", key);
                    self.events.send_event(ExchangeEvent::ResetReceived(key));
                }
            }
            return false;
        }

        if message.is_response() && message.message_type == MessageType::Ack {
            if self.stop_transmissions(remote, message_id).await.is_some() {
                return true;
            }
            warn!("received ACK from {:?} for unknown message id {} - dropping", remote, message_id);
            return false;
        }

        true
    }

    pub async fn is_tracked(&self, remote: SocketAddr, message_id: u16) -> bool {
        self.transmissions.read().await
            .contains_key(&(remote, message_id))
    }
}

#[async_trait]
impl MessageIdReleaseListener for ClientExchangeManager {
    async fn on_message_id_released(&self, remote: SocketAddr, message_id: u16, token: Token) {
        let timed_out = self.transmissions.write().await
            .remove(&(remote, message_id));

        match timed_out {
            Some(transmission) => {
                let key = ExchangeKey::new(remote, message_id, transmission.token);
                warn!("transmission timeout for {:?}", key);
                self.events.send_event(ExchangeEvent::TransmissionTimeout(key));
            }
            None => {
                trace!("message id {} for {:?} released", message_id, remote);
                self.events.send_event(ExchangeEvent::MessageIdReleased(ExchangeKey::new(remote, message_id, token)));
            }
        }
    }
}
