use std::net::SocketAddr;

use tokio::sync::broadcast;
use tracing::trace;

use crate::message::token::Token;

/// identifies the exchange an event refers to
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ExchangeKey {
    pub remote: SocketAddr,
    pub message_id: u16,
    pub token: Token,
}

impl ExchangeKey {
    pub fn new(remote: SocketAddr, message_id: u16, token: Token) -> ExchangeKey {
        ExchangeKey { remote, message_id, token }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExchangeEvent {
    MessageIdAssigned(ExchangeKey),
    NoMessageIdAvailable {
        remote: SocketAddr,
        token: Token,
    },
    EmptyAckReceived(ExchangeKey),
    ResetReceived(ExchangeKey),
    /// `retransmission` counts from 1 - the initial transmission is not reported
    MessageRetransmitted {
        key: ExchangeKey,
        retransmission: u32,
    },
    /// sending a datagram failed at the transport level. This does not end the exchange.
    TransmissionFailed {
        key: ExchangeKey,
        reason: String,
    },
    /// the message id of a confirmable message expired without an ACK, RST or response
    TransmissionTimeout(ExchangeKey),
    /// the message id of a completed exchange expired and may be reused
    MessageIdReleased(ExchangeKey),
}

pub struct ExchangeEventNotifier {
    sender: broadcast::Sender<ExchangeEvent>,
}
impl ExchangeEventNotifier {
    pub fn new(capacity: usize) -> ExchangeEventNotifier {
        let (sender, _) = broadcast::channel(capacity);

        ExchangeEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExchangeEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: ExchangeEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
