use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::codec::decoder::decode;
use crate::codec::encoder::encode;
use crate::config::CoapConfig;
use crate::error::{DecodeError, ExchangeError};
use crate::message::coap_message::CoapMessage;
use crate::message::message_code::MessageCode;
use crate::message::message_type::MessageType;
use crate::message::option;
use crate::message_sink::MessageSink;
use crate::reliability::channel::DatagramChannel;
use crate::reliability::client::ClientExchangeManager;
use crate::reliability::events::{ExchangeEvent, ExchangeEventNotifier};
use crate::reliability::inbound::{ClientInboundReliability, ServerInboundReliability};
use crate::reliability::message_id::MessageIdAllocator;
use crate::reliability::scheduler::{Scheduler, TokioScheduler};
use crate::reliability::server::{ResponseDisposition, ServerExchangeManager};
use crate::resource::observation::{ObservableResource, ObservationHandler};

/// CoapEndpoint is where everything comes together: it listens on a UDP socket, passes received
///  messages through the reliability layer and on to a [MessageSink], and has an API for
///  application code to send requests and responses.
pub struct CoapEndpoint {
    config: Arc<CoapConfig>,
    socket: Arc<UdpSocket>,
    client: Arc<ClientExchangeManager>,
    server: Arc<ServerExchangeManager>,
    client_inbound: Arc<ClientInboundReliability>,
    server_inbound: Arc<ServerInboundReliability>,
    observations: Arc<ObservationHandler>,
    sink: Arc<dyn MessageSink>,
    events: Arc<ExchangeEventNotifier>,
    event_tasks: Vec<AbortHandle>,
}

impl CoapEndpoint {
    /// Binds the socket and sets up the reliability layer. This must be called from inside a tokio
    ///  runtime. Receiving starts with [CoapEndpoint::recv_loop].
    pub async fn bind(config: CoapConfig, sink: Arc<dyn MessageSink>) -> anyhow::Result<CoapEndpoint> {
        config.validate()?;
        let config = Arc::new(config);

        let socket = Arc::new(UdpSocket::bind(config.self_addr).await?);
        info!("bound CoAP socket to {:?}", socket.local_addr()?);

        let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new()?);
        let channel: Arc<dyn DatagramChannel> = socket.clone();

        let client_allocator = MessageIdAllocator::new(config.clone(), scheduler.clone());
        let server_allocator = if config.share_message_id_allocator {
            debug!("client and server share a message id allocator");
            client_allocator.clone()
        }
        else {
            MessageIdAllocator::new(config.clone(), scheduler.clone())
        };

        let client = ClientExchangeManager::new(config.clone(), scheduler.clone(), channel.clone(), client_allocator).await;
        let server = ServerExchangeManager::new(config.clone(), scheduler.clone(), channel.clone(), server_allocator).await;
        let client_inbound = Arc::new(ClientInboundReliability::new(channel.clone()));
        let server_inbound = ServerInboundReliability::new(config.clone(), scheduler, channel);
        let observations = ObservationHandler::new(server.clone());

        let events = Arc::new(ExchangeEventNotifier::new(config.event_channel_capacity));
        let event_tasks = vec![
            Self::spawn_client_event_task(client.subscribe(), client_inbound.clone(), events.clone()),
            Self::spawn_server_event_task(server.subscribe(), observations.clone(), events.clone()),
        ];

        Ok(CoapEndpoint {
            config,
            socket,
            client,
            server,
            client_inbound,
            server_inbound,
            observations,
            sink,
            events,
            event_tasks,
        })
    }

    /// a request whose exchange ended without a response no longer expects one
    fn spawn_client_event_task(mut client_events: broadcast::Receiver<ExchangeEvent>, client_inbound: Arc<ClientInboundReliability>, events: Arc<ExchangeEventNotifier>) -> AbortHandle {
        tokio::spawn(async move {
            loop {
                match client_events.recv().await {
                    Ok(evt) => {
                        if let ExchangeEvent::ResetReceived(key) | ExchangeEvent::TransmissionTimeout(key) = &evt {
                            client_inbound.release_token(key.remote, &key.token).await;
                        }
                        events.send_event(evt);
                    }
                    Err(RecvError::Lagged(n)) => warn!("client exchange events lagged, skipped {} events", n),
                    Err(RecvError::Closed) => break,
                }
            }
        }).abort_handle()
    }

    fn spawn_server_event_task(mut server_events: broadcast::Receiver<ExchangeEvent>, observations: Arc<ObservationHandler>, events: Arc<ExchangeEventNotifier>) -> AbortHandle {
        tokio::spawn(async move {
            loop {
                match server_events.recv().await {
                    Ok(evt) => {
                        observations.on_exchange_event(&evt).await;
                        events.send_event(evt);
                    }
                    Err(RecvError::Lagged(n)) => warn!("server exchange events lagged, skipped {} events", n),
                    Err(RecvError::Closed) => break,
                }
            }
        }).abort_handle()
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn config(&self) -> &CoapConfig {
        &self.config
    }

    /// exchange lifecycle events of both the client and the server side
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExchangeEvent> {
        self.events.subscribe()
    }

    pub fn observations(&self) -> &Arc<ObservationHandler> {
        &self.observations
    }

    pub fn register_resource(&self, resource: Arc<dyn ObservableResource>) {
        self.observations.register_resource(resource);
    }

    /// Sends a request, returning the message id it was sent with. Responses for the request's
    ///  token are accepted until the exchange completes.
    pub async fn send_request(&self, remote: SocketAddr, request: CoapMessage) -> Result<u16, ExchangeError> {
        let token = request.token.clone();
        self.client_inbound.await_response(remote, token.clone()).await;

        let result = self.client.send(remote, request).await;
        if result.is_err() {
            self.client_inbound.release_token(remote, &token).await;
        }
        result
    }

    /// Sends a response to a request that was received earlier. The response should carry the
    ///  request's message id: it is piggybacked on the ACK if the request was not acknowledged
    ///  yet, and is sent as a separate response with a fresh message id otherwise. Update
    ///  notifications without a message id always get a fresh one.
    ///
    /// A success response without a Max-Age option gets the configured default Max-Age.
    pub async fn send_response(&self, remote: SocketAddr, mut response: CoapMessage) -> Result<ResponseDisposition, ExchangeError> {
        apply_default_max_age(&self.config, &mut response);
        self.server_inbound.prepare_response(remote, &mut response).await;
        self.observations.on_response_sent(remote, &response).await;
        self.server.send_response(remote, response).await
    }

    /// Sends a CoAP ping (an empty CON message). The remote endpoint's RST shows up as
    ///  [ExchangeEvent::ResetReceived].
    pub async fn send_ping(&self, remote: SocketAddr) -> Result<u16, ExchangeError> {
        self.client.send(remote, CoapMessage::new_ping(None)).await
    }

    pub async fn recv_loop(&self) {
        info!("starting receive loop");

        let mut buf = vec![0u8; self.config.max_datagram_size];
        loop {
            let (num_read, from) = match self.socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "datagram_received", ?correlation_id, ?from);
            self.on_datagram(from, &buf[..num_read])
                .instrument(span)
                .await;
        }
    }

    async fn on_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        trace!("received datagram from {:?}: {:?}", from, datagram);

        match decode(datagram, from) {
            Ok(message) => self.dispatch(from, message).await,
            Err(e) => {
                warn!("{}", e);
                self.reply_to_decode_error(&e).await;
                self.sink.on_decode_error(e).await;
            }
        }
    }

    async fn reply_to_decode_error(&self, e: &DecodeError) {
        let Some(message_id) = e.message_id() else {
            debug!("no message id in malformed message from {:?}, ignoring it", e.remote());
            return;
        };

        let reply = match e {
            DecodeError::Header { .. } => CoapMessage::new_empty_reset(message_id),
            DecodeError::BadOption { token, message_type, number, .. } => {
                let reply_type = if *message_type == MessageType::Con { MessageType::Ack } else { MessageType::Non };
                let mut reply = CoapMessage::new_error_response(reply_type, MessageCode::BAD_OPTION_402, token.clone(), &format!("bad option {}", number));
                reply.message_id = Some(message_id);
                reply
            }
        };

        match encode(&reply) {
            Ok(datagram) => {
                if let Err(err) = DatagramChannel::send(self.socket.as_ref(), e.remote(), &datagram).await {
                    warn!("error replying to malformed message from {:?}: {}", e.remote(), err);
                }
            }
            Err(err) => warn!("error encoding {:?}: {}", reply, err),
        }
    }

    async fn dispatch(&self, from: SocketAddr, message: CoapMessage) {
        if message.is_empty() {
            if !self.client.on_inbound(from, &message).await {
                return;
            }
            if !self.server.on_inbound(from, &message).await {
                return;
            }
            self.server_inbound.on_inbound(from, &message).await;
            return;
        }

        if message.is_response() {
            if !self.client.on_inbound(from, &message).await {
                return;
            }
            if !self.client_inbound.on_inbound(from, &message).await {
                return;
            }
        }
        else {
            if !self.server_inbound.on_inbound(from, &message).await {
                return;
            }
            self.observations.on_request(from, &message).await;
        }

        debug!("passing {:?} from {:?} to the sink", message, from);
        self.sink.on_message(from, message).await;
    }
}

/// Max-Age 60 s is what a client assumes if the option is missing, so it is not sent explicitly
fn apply_default_max_age(config: &CoapConfig, response: &mut CoapMessage) {
    if response.code.class() != 2 || response.has_option(option::MAX_AGE) {
        return;
    }
    let max_age = u32::try_from(config.default_max_age.as_secs()).unwrap_or(u32::MAX);
    if max_age != option::DEFAULT_MAX_AGE {
        response.set_uint_option(option::MAX_AGE, max_age as u64);
    }
}

impl Drop for CoapEndpoint {
    fn drop(&mut self) {
        for task in &self.event_tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use rstest::rstest;
    use tokio::time::timeout;
    use super::*;
    use crate::codec::decoder::decode;
    use crate::message::token::Token;
    use crate::message_sink::MockMessageSink;
    use crate::test_util::addr::test_addr_from_number;

    fn local_config() -> CoapConfig {
        CoapConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let mut config = local_config();
        config.ack_random_factor = 0.5;
        assert!(CoapEndpoint::bind(config, Arc::new(MockMessageSink::new())).await.is_err());
    }

    #[tokio::test]
    async fn test_send_request_failure_releases_token() {
        let mut config = local_config();
        config.share_message_id_allocator = true;
        let endpoint = CoapEndpoint::bind(config, Arc::new(MockMessageSink::new())).await.unwrap();
        let remote = test_addr_from_number(9);

        // an option delta that cannot be encoded
        let mut request = CoapMessage::new_request(MessageType::Non, MessageCode::GET, Token::from_u64(3));
        request.add_option(1, vec![0u8; 70000]);

        assert!(endpoint.send_request(remote, request).await.is_err());
        assert!(!endpoint.client_inbound.is_awaited(remote, &Token::from_u64(3)).await);
    }

    #[tokio::test]
    async fn test_request_passes_to_sink_once() {
        let mut sink = MockMessageSink::new();
        sink.expect_on_message()
            .times(1)
            .return_const(());
        let endpoint = CoapEndpoint::bind(local_config(), Arc::new(sink)).await.unwrap();
        let remote = test_addr_from_number(9);

        let mut request = CoapMessage::new_request(MessageType::Non, MessageCode::GET, Token::from_u64(3));
        request.message_id = Some(77);
        endpoint.dispatch(remote, request.clone()).await;
        endpoint.dispatch(remote, request).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_unexpected_response_does_not_reach_sink() {
        let mut sink = MockMessageSink::new();
        sink.expect_on_message()
            .never();
        let endpoint = CoapEndpoint::bind(local_config(), Arc::new(sink)).await.unwrap();

        let mut response = CoapMessage::new_response(MessageType::Non, MessageCode::CONTENT_205, Token::from_u64(3));
        response.message_id = Some(5);
        endpoint.dispatch(test_addr_from_number(9), response).await;
    }

    async fn peer_socket() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    async fn recv_message(socket: &UdpSocket) -> CoapMessage {
        let mut buf = vec![0u8; 1152];
        let (len, from) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf)).await
            .expect("timed out waiting for a datagram")
            .unwrap();
        decode(&buf[..len], from).unwrap()
    }

    #[rstest]
    #[case::protocol_default(60, MessageCode::CONTENT_205, None, None)]
    #[case::configured(300, MessageCode::CONTENT_205, None, Some(300))]
    #[case::explicit_max_age_wins(300, MessageCode::CONTENT_205, Some(5), Some(5))]
    #[case::changed(10, MessageCode::CHANGED_204, None, Some(10))]
    #[case::error_response(300, MessageCode::NOT_FOUND_404, None, None)]
    fn test_default_max_age(#[case] default_secs: u64, #[case] code: MessageCode, #[case] explicit: Option<u64>, #[case] expected: Option<u64>) {
        let mut config = local_config();
        config.default_max_age = Duration::from_secs(default_secs);

        let mut response = CoapMessage::new_response(MessageType::Non, code, Token::from_u64(1));
        if let Some(max_age) = explicit {
            response.set_uint_option(option::MAX_AGE, max_age);
        }
        apply_default_max_age(&config, &mut response);
        assert_eq!(response.uint_option(option::MAX_AGE), expected);
    }

    #[tokio::test]
    async fn test_response_carries_default_max_age() {
        let mut config = local_config();
        config.default_max_age = Duration::from_secs(3600);
        let endpoint = CoapEndpoint::bind(config, Arc::new(MockMessageSink::new())).await.unwrap();
        let (peer, peer_addr) = peer_socket().await;

        let mut response = CoapMessage::new_response(MessageType::Non, MessageCode::CONTENT_205, Token::from_u64(3));
        response.payload = bytes::Bytes::from_static(b"x");
        endpoint.send_response(peer_addr, response).await.unwrap();

        let received = recv_message(&peer).await;
        assert_eq!(received.max_age(), 3600);
    }

    #[tokio::test]
    async fn test_decode_error_reply_uses_message_id() {
        let mut sink = MockMessageSink::new();
        sink.expect_on_decode_error()
            .times(2)
            .return_const(());
        let endpoint = CoapEndpoint::bind(local_config(), Arc::new(sink)).await.unwrap();
        let (peer, peer_addr) = peer_socket().await;

        // too short to carry a message id, so there is nobody to reply to
        endpoint.on_datagram(peer_addr, &[0x50, 0x01, 0x00]).await;
        // token length 9
        endpoint.on_datagram(peer_addr, &[0x59, 0x01, 0x00, 0x07, 1, 2, 3, 4, 5, 6, 7, 8, 9]).await;

        let reply = recv_message(&peer).await;
        assert!(reply.is_empty_reset());
        assert_eq!(reply.message_id, Some(7));
    }

    #[tokio::test]
    async fn test_ping_is_answered_with_reset() {
        let mut sink = MockMessageSink::new();
        sink.expect_on_message()
            .never();
        let endpoint = CoapEndpoint::bind(local_config(), Arc::new(sink)).await.unwrap();
        let (peer, peer_addr) = peer_socket().await;

        endpoint.dispatch(peer_addr, CoapMessage::new_ping(Some(0x1234))).await;

        let reply = recv_message(&peer).await;
        assert!(reply.is_empty_reset());
        assert_eq!(reply.message_id, Some(0x1234));
    }

    #[tokio::test]
    async fn test_empty_ack_for_separate_response_reaches_server() {
        let mut sink = MockMessageSink::new();
        sink.expect_on_message()
            .never();
        let endpoint = CoapEndpoint::bind(local_config(), Arc::new(sink)).await.unwrap();
        let (peer, peer_addr) = peer_socket().await;

        let response = CoapMessage::new_response(MessageType::Con, MessageCode::CONTENT_205, Token::from_u64(4));
        let ResponseDisposition::Sent(message_id) = endpoint.send_response(peer_addr, response).await.unwrap() else {
            panic!("expected the response to be sent");
        };
        assert_eq!(recv_message(&peer).await.message_id, Some(message_id));
        assert!(endpoint.server.is_tracked(peer_addr, &Token::from_u64(4)).await);

        endpoint.dispatch(peer_addr, CoapMessage::new_empty_ack(message_id)).await;
        assert!(!endpoint.server.is_tracked(peer_addr, &Token::from_u64(4)).await);
    }

    #[tokio::test]
    async fn test_shared_allocator_keeps_client_and_server_ids_apart() {
        let mut config = local_config();
        config.share_message_id_allocator = true;
        let endpoint = CoapEndpoint::bind(config, Arc::new(MockMessageSink::new())).await.unwrap();
        let (_peer, peer_addr) = peer_socket().await;

        let request = CoapMessage::new_request(MessageType::Con, MessageCode::GET, Token::from_u64(1));
        let request_id = endpoint.send_request(peer_addr, request).await.unwrap();
        let response = CoapMessage::new_response(MessageType::Con, MessageCode::CONTENT_205, Token::from_u64(2));
        let ResponseDisposition::Sent(response_id) = endpoint.send_response(peer_addr, response).await.unwrap() else {
            panic!("expected the response to be sent");
        };
        assert_ne!(request_id, response_id);

        endpoint.dispatch(peer_addr, CoapMessage::new_empty_ack(response_id)).await;
        assert!(!endpoint.server.is_tracked(peer_addr, &Token::from_u64(2)).await);
        assert!(endpoint.client.is_tracked(peer_addr, request_id).await);
    }
}
