use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use crate::codec::encoder::encode;
use crate::config::CoapConfig;
use crate::message::coap_message::CoapMessage;
use crate::message::message_type::MessageType;
use crate::message::token::Token;
use crate::reliability::channel::DatagramChannel;
use crate::reliability::scheduler::{Scheduler, TimerHandle};

async fn send_empty(channel: &dyn DatagramChannel, remote: SocketAddr, message: CoapMessage) {
    match encode(&message) {
        Ok(datagram) => {
            if let Err(e) = channel.send(remote, &datagram).await {
                warn!("error sending {:?} to {:?}: {}", message, remote, e);
            }
        }
        Err(e) => warn!("error encoding {:?}: {}", message, e),
    }
}

#[derive(Default)]
struct UnprocessedRequests {
    tokens: FxHashMap<(SocketAddr, u16), Token>,
    scheduled_empty_acks: FxHashMap<(SocketAddr, u16), TimerHandle>,
}

/// Inbound reliability for requests: suppresses duplicates, acknowledges CON requests with an
///  empty ACK if the response takes longer than [CoapConfig::empty_ack_delay], and turns fast
///  responses into piggybacked ones.
pub struct ServerInboundReliability {
    config: Arc<CoapConfig>,
    scheduler: Arc<dyn Scheduler>,
    channel: Arc<dyn DatagramChannel>,
    myself: Weak<ServerInboundReliability>,
    unprocessed: RwLock<UnprocessedRequests>,
}

impl ServerInboundReliability {
    pub fn new(config: Arc<CoapConfig>, scheduler: Arc<dyn Scheduler>, channel: Arc<dyn DatagramChannel>) -> Arc<ServerInboundReliability> {
        Arc::new_cyclic(|myself| ServerInboundReliability {
            config,
            scheduler,
            channel,
            myself: myself.clone(),
            unprocessed: Default::default(),
        })
    }

    /// Returns `true` if the message should be passed on for processing.
    pub async fn on_inbound(&self, remote: SocketAddr, message: &CoapMessage) -> bool {
        let Some(message_id) = message.message_id else {
            return true;
        };

        if message.is_ping() {
            debug!("received ping from {:?} (message id {}) - replying with RST", remote, message_id);
            send_empty(self.channel.as_ref(), remote, CoapMessage::new_empty_reset(message_id)).await;
            return false;
        }
        if !message.is_request() {
            return true;
        }

        let key = (remote, message_id);
        let mut unprocessed = self.unprocessed.write().await;
        if unprocessed.tokens.contains_key(&key) {
            info!("duplicate request from {:?} (message id {})", remote, message_id);
            if message.message_type != MessageType::Con {
                return false;
            }
            let ack_pending = unprocessed.scheduled_empty_acks.get(&key)
                .map(|t| !t.is_finished())
                .unwrap_or(false);
            drop(unprocessed);

            if ack_pending {
                debug!("empty ACK for {} is not sent yet - ignoring the duplicate", message_id);
            }
            else {
                debug!("duplicate CON - sending immediate empty ACK");
                send_empty(self.channel.as_ref(), remote, CoapMessage::new_empty_ack(message_id)).await;
            }
            return false;
        }

        unprocessed.tokens.insert(key, message.token.clone());
        self.schedule_forget(remote, message_id, message.token.clone());
        if message.message_type == MessageType::Con {
            let timer = self.schedule_empty_ack(remote, message_id);
            unprocessed.scheduled_empty_acks.insert(key, timer);
        }
        true
    }

    /// requests that never get a response are remembered for duplicate detection until their
    ///  message id may be reused
    fn schedule_forget(&self, remote: SocketAddr, message_id: u16, token: Token) {
        let myself = self.myself.clone();
        let _ = self.scheduler.schedule_after(self.config.exchange_lifetime, Box::pin(async move {
            let Some(handler) = myself.upgrade() else {
                return;
            };
            let mut unprocessed = handler.unprocessed.write().await;
            if unprocessed.tokens.get(&(remote, message_id)) == Some(&token) {
                trace!("forgetting unanswered request {:?} / {}", remote, message_id);
                unprocessed.tokens.remove(&(remote, message_id));
            }
        }));
    }

    fn schedule_empty_ack(&self, remote: SocketAddr, message_id: u16) -> TimerHandle {
        trace!("scheduling empty ACK for {:?} / {}", remote, message_id);
        let myself = self.myself.clone();
        self.scheduler.schedule_after(self.config.empty_ack_delay, Box::pin(async move {
            let Some(handler) = myself.upgrade() else {
                return;
            };
            // whoever removes the entry decides between empty ACK and piggybacked response
            let was_scheduled = handler.unprocessed.write().await
                .scheduled_empty_acks.remove(&(remote, message_id))
                .is_some();
            if was_scheduled {
                debug!("sending empty ACK to {:?} for message id {}", remote, message_id);
                send_empty(handler.channel.as_ref(), remote, CoapMessage::new_empty_ack(message_id)).await;
            }
        }))
    }

    /// Prepares a response to a request received earlier. The response must carry the request's
    ///  message id. If the request's empty ACK was not sent yet, it is cancelled and the response
    ///  becomes a piggybacked ACK. Otherwise it becomes a separate response and its message id is
    ///  cleared so that a fresh one is assigned.
    pub async fn prepare_response(&self, remote: SocketAddr, response: &mut CoapMessage) {
        let Some(message_id) = response.message_id else {
            return;
        };
        let key = (remote, message_id);

        let mut unprocessed = self.unprocessed.write().await;
        if unprocessed.tokens.get(&key) == Some(&response.token) {
            unprocessed.tokens.remove(&key);
        }

        match unprocessed.scheduled_empty_acks.remove(&key) {
            Some(timer) if timer.cancel() => {
                debug!("cancelled empty ACK for {:?} / {} - piggybacking the response", remote, message_id);
                response.message_type = MessageType::Ack;
            }
            _ => {
                debug!("sending separate response for {:?} / {}", remote, message_id);
                response.message_id = None;
                if response.message_type == MessageType::Ack {
                    response.message_type = MessageType::Con;
                }
            }
        }
    }
}

/// Inbound reliability for responses: only responses to requests that were actually sent are
///  passed on, unexpected ones are rejected with RST. CON responses are acknowledged.
pub struct ClientInboundReliability {
    channel: Arc<dyn DatagramChannel>,
    awaited: RwLock<FxHashMap<SocketAddr, FxHashSet<Token>>>,
}

impl ClientInboundReliability {
    pub fn new(channel: Arc<dyn DatagramChannel>) -> ClientInboundReliability {
        ClientInboundReliability {
            channel,
            awaited: Default::default(),
        }
    }

    pub async fn await_response(&self, remote: SocketAddr, token: Token) {
        trace!("awaiting response from {:?} for {:?}", remote, token);
        self.awaited.write().await
            .entry(remote)
            .or_default()
            .insert(token);
    }

    pub async fn release_token(&self, remote: SocketAddr, token: &Token) -> bool {
        let mut awaited = self.awaited.write().await;
        let Some(tokens) = awaited.get_mut(&remote) else {
            return false;
        };
        let removed = tokens.remove(token);
        if tokens.is_empty() {
            awaited.remove(&remote);
        }
        removed
    }

    pub async fn is_awaited(&self, remote: SocketAddr, token: &Token) -> bool {
        self.awaited.read().await
            .get(&remote)
            .map(|tokens| tokens.contains(token))
            .unwrap_or(false)
    }

    /// Returns `true` if the message should be passed on for processing.
    pub async fn on_inbound(&self, remote: SocketAddr, message: &CoapMessage) -> bool {
        if !message.is_response() {
            return true;
        }
        let message_id = message.message_id.unwrap_or(0);

        if !self.is_awaited(remote, &message.token).await {
            let needs_reset = message.message_type == MessageType::Con
                || (message.message_type == MessageType::Non && message.is_update_notification());
            if needs_reset {
                send_empty(self.channel.as_ref(), remote, CoapMessage::new_empty_reset(message_id)).await;
            }
            debug!("unexpected response from {:?} for {:?} - dropping", remote, message.token);
            return false;
        }

        if message.message_type == MessageType::Con {
            send_empty(self.channel.as_ref(), remote, CoapMessage::new_empty_ack(message_id)).await;
        }
        if !message.is_update_notification() {
            self.release_token(remote, &message.token).await;
        }
        true
    }
}
