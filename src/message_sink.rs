use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;

use crate::error::DecodeError;
use crate::message::coap_message::CoapMessage;

/// Upstream delivery of received messages. Only messages that passed the reliability layer
///  (i.e. no duplicates, no empty ACK / RST) reach the sink.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    async fn on_message(&self, remote: SocketAddr, message: CoapMessage);

    /// called for datagrams that could not be decoded. Replying with RST or 4.02 is done by the
    ///  endpoint before this is called.
    async fn on_decode_error(&self, error: DecodeError);
}
