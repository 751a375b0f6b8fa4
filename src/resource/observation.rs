use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::message::coap_message::CoapMessage;
use crate::message::message_code::MessageCode;
use crate::message::message_type::MessageType;
use crate::message::option;
use crate::message::token::Token;
use crate::reliability::events::ExchangeEvent;
use crate::reliability::server::ServerExchangeManager;
use crate::resource::status::{ResourceStatusCache, StatusEvent, WrappedStatus};

/// Observe sequence numbers are 24 bit
pub const OBSERVE_MODULUS: u32 = 1 << 24;

/// The part of a resource's status cache that observation delivery needs, independent of the
///  status type.
#[async_trait]
pub trait ObservableResource: Send + Sync + 'static {
    fn path(&self) -> &str;
    fn subscribe(&self) -> broadcast::Receiver<StatusEvent>;
    fn content_formats(&self) -> Vec<u16>;
    async fn get_wrapped_status_any(&self, content_formats: &[u16]) -> Option<WrappedStatus>;
}

#[async_trait]
impl<T: Send + Sync + 'static> ObservableResource for ResourceStatusCache<T> {
    fn path(&self) -> &str {
        ResourceStatusCache::path(self)
    }

    fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        ResourceStatusCache::subscribe(self)
    }

    fn content_formats(&self) -> Vec<u16> {
        ResourceStatusCache::content_formats(self)
    }

    async fn get_wrapped_status_any(&self, content_formats: &[u16]) -> Option<WrappedStatus> {
        ResourceStatusCache::get_wrapped_status_any(self, content_formats).await
    }
}

#[derive(Debug, Clone)]
struct Observation {
    resource: String,
    /// `None` means the resource's preferred content format
    content_format: Option<u16>,
    confirmable: bool,
    /// the Observe value of the most recent notification
    sequence: u32,
}

#[derive(Default)]
struct Observations {
    by_observer: FxHashMap<(SocketAddr, Token), Observation>,
    by_resource: FxHashMap<String, FxHashSet<(SocketAddr, Token)>>,
}

impl Observations {
    fn insert(&mut self, remote: SocketAddr, token: Token, observation: Observation) {
        self.remove(remote, &token);
        self.by_resource.entry(observation.resource.clone())
            .or_default()
            .insert((remote, token.clone()));
        self.by_observer.insert((remote, token), observation);
    }

    fn remove(&mut self, remote: SocketAddr, token: &Token) -> Option<Observation> {
        let observation = self.by_observer.remove(&(remote, token.clone()))?;
        if let Some(observers) = self.by_resource.get_mut(&observation.resource) {
            observers.remove(&(remote, token.clone()));
            if observers.is_empty() {
                self.by_resource.remove(&observation.resource);
            }
        }
        Some(observation)
    }

    fn remove_resource(&mut self, resource: &str) -> Vec<(SocketAddr, Token)> {
        let observers: Vec<_> = self.by_resource.remove(resource)
            .map(|o| o.into_iter().collect())
            .unwrap_or_default();
        for (remote, token) in &observers {
            self.by_observer.remove(&(*remote, token.clone()));
        }
        observers
    }
}

struct Notification {
    remote: SocketAddr,
    token: Token,
    content_format: Option<u16>,
    confirmable: bool,
    sequence: u32,
}

/// Delivers update notifications to the observers of resources, and ends observations when the
///  observer goes away.
pub struct ObservationHandler {
    server: Arc<ServerExchangeManager>,
    myself: Weak<ObservationHandler>,
    observations: RwLock<Observations>,
}

impl ObservationHandler {
    pub fn new(server: Arc<ServerExchangeManager>) -> Arc<ObservationHandler> {
        Arc::new_cyclic(|myself| ObservationHandler {
            server,
            myself: myself.clone(),
            observations: Default::default(),
        })
    }

    /// Starts delivering status changes of a resource to its observers. This spawns a task that
    ///  runs until the resource is shut down.
    pub fn register_resource(&self, resource: Arc<dyn ObservableResource>) {
        let mut status_events = resource.subscribe();
        let myself = self.myself.clone();

        debug!("registering observable resource {}", resource.path());
        tokio::spawn(async move {
            loop {
                let evt = status_events.recv().await;
                let Some(handler) = myself.upgrade() else {
                    break;
                };
                match evt {
                    Ok(StatusEvent::Updated(_)) | Err(RecvError::Lagged(_)) => {
                        handler.notify_observers(resource.as_ref()).await;
                    }
                    Ok(StatusEvent::Shutdown) | Err(RecvError::Closed) => {
                        handler.on_resource_shutdown(resource.path()).await;
                        break;
                    }
                }
            }
        });
    }

    /// Registers an observer, replacing an earlier observation with the same token. Returns the
    ///  Observe value for the response to the registering request.
    pub async fn start_observation(&self, remote: SocketAddr, token: Token, resource: &str, content_format: Option<u16>, confirmable: bool) -> u32 {
        info!("{:?} starts observing {} with token {:?}", remote, resource, token);
        self.observations.write().await
            .insert(remote, token, Observation {
                resource: resource.to_string(),
                content_format,
                confirmable,
                sequence: 0,
            });
        0
    }

    pub async fn stop_observation(&self, remote: SocketAddr, token: &Token) -> bool {
        match self.observations.write().await.remove(remote, token) {
            Some(observation) => {
                info!("{:?} stopped observing {} (token {:?})", remote, observation.resource, token);
                true
            }
            None => false,
        }
    }

    pub async fn is_observing(&self, remote: SocketAddr, token: &Token) -> bool {
        self.observations.read().await
            .by_observer.contains_key(&(remote, token.clone()))
    }

    pub async fn num_observers(&self, resource: &str) -> usize {
        self.observations.read().await
            .by_resource.get(resource)
            .map(|o| o.len())
            .unwrap_or(0)
    }

    /// A request reusing an observation's token ends the observation, and a notification that is
    ///  still being retransmitted for it is dropped.
    pub async fn on_request(&self, remote: SocketAddr, request: &CoapMessage) {
        if self.stop_observation(remote, &request.token).await {
            if let Some(message_id) = self.server.remove_transfer_by_token(remote, &request.token).await {
                debug!("dropped pending notification {} for {:?} / {:?}", message_id, remote, request.token);
            }
        }
    }

    /// a response that is not an update notification ends the observation
    pub async fn on_response_sent(&self, remote: SocketAddr, response: &CoapMessage) {
        if !response.is_update_notification() {
            self.stop_observation(remote, &response.token).await;
        }
    }

    pub async fn on_exchange_event(&self, event: &ExchangeEvent) {
        match event {
            ExchangeEvent::ResetReceived(key) => {
                if self.stop_observation(key.remote, &key.token).await {
                    debug!("observation {:?} ended by RST", key);
                }
            }
            ExchangeEvent::TransmissionTimeout(key) => {
                if self.stop_observation(key.remote, &key.token).await {
                    warn!("observation {:?} ended by transmission timeout", key);
                }
            }
            _ => {}
        }
    }

    async fn notify_observers(&self, resource: &dyn ObservableResource) {
        let notifications: Vec<Notification> = {
            let mut observations = self.observations.write().await;
            let Some(observers) = observations.by_resource.get(resource.path()).cloned() else {
                return;
            };
            observers.into_iter()
                .filter_map(|(remote, token)| {
                    let observation = observations.by_observer.get_mut(&(remote, token.clone()))?;
                    observation.sequence = (observation.sequence + 1) % OBSERVE_MODULUS;
                    Some(Notification {
                        remote,
                        token,
                        content_format: observation.content_format,
                        confirmable: observation.confirmable,
                        sequence: observation.sequence,
                    })
                })
                .collect()
        };

        debug!("sending {} update notification(s) for {}", notifications.len(), resource.path());
        for notification in notifications {
            let content_formats = match notification.content_format {
                Some(cf) => vec![cf],
                None => resource.content_formats(),
            };

            let response = match resource.get_wrapped_status_any(&content_formats).await {
                Some(status) => Self::update_notification(&notification, status),
                None => {
                    warn!("content format {:?} of {} is no longer supported - ending observation", notification.content_format, resource.path());
                    self.stop_observation(notification.remote, &notification.token).await;
                    CoapMessage::new_error_response(MessageType::Non, MessageCode::NOT_ACCEPTABLE_406, notification.token.clone(), "content format not supported")
                }
            };
            if let Err(e) = self.server.send_response(notification.remote, response).await {
                warn!("could not send update notification to {:?}: {}", notification.remote, e);
            }
        }
    }

    fn update_notification(notification: &Notification, status: WrappedStatus) -> CoapMessage {
        let message_type = if notification.confirmable { MessageType::Con } else { MessageType::Non };
        let mut response = CoapMessage::new_response(message_type, MessageCode::CONTENT_205, notification.token.clone());
        response.set_uint_option(option::OBSERVE, notification.sequence as u64);
        response.set_option(option::ETAG, status.etag.to_bytes());
        response.set_uint_option(option::CONTENT_FORMAT, status.content_format as u64);
        response.set_uint_option(option::MAX_AGE, status.max_age as u64);
        response.payload = status.content;
        response
    }

    async fn on_resource_shutdown(&self, resource: &str) {
        let observers = self.observations.write().await
            .remove_resource(resource);

        info!("resource {} shut down - ending {} observation(s)", resource, observers.len());
        for (remote, token) in observers {
            let response = CoapMessage::new_error_response(MessageType::Non, MessageCode::NOT_FOUND_404, token, "resource was shut down");
            if let Err(e) = self.server.send_response(remote, response).await {
                warn!("could not notify {:?} of shutdown of {}: {}", remote, resource, e);
            }
        }
    }
}
