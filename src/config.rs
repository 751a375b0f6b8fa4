use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

#[derive(Debug, Clone)]
pub struct CoapConfig {
    pub self_addr: SocketAddr,

    /// initial timeout for a confirmable message, doubled with every retransmission
    pub ack_timeout: Duration,
    /// the initial timeout is chosen randomly between `ack_timeout` and
    ///  `ack_timeout * ack_random_factor` to avoid synchronized retransmissions
    pub ack_random_factor: f64,
    pub max_retransmissions: u32,

    /// the time after which a message id may safely be reused for the same remote endpoint
    pub exchange_lifetime: Duration,

    /// NON update notifications are kept around for this long after they were sent, so that an
    ///  RST sent in reply can still be correlated
    pub non_notification_grace_period: Duration,

    /// a CON request is acknowledged with an empty ACK if no response is available after this
    ///  delay - a response that is available earlier is piggybacked on the ACK
    pub empty_ack_delay: Duration,

    pub max_datagram_size: usize,
    pub event_channel_capacity: usize,

    /// true: client and server side draw message ids from the same allocator, false: each side
    ///  has its own.
    ///
    /// With separate allocators, a CON request and a CON response or notification to the same
    ///  remote endpoint can be in flight with the same message id. Inbound empty ACKs and RSTs are
    ///  offered to the client side first, so in that case the client side consumes an ACK that was
    ///  meant for the server side. The request then counts as acknowledged although it may have
    ///  been lost, and the response is retransmitted at least once more. Sharing the allocator
    ///  rules this out.
    pub share_message_id_allocator: bool,

    /// Max-Age for success responses that do not carry the option themselves
    pub default_max_age: Duration,
}

impl CoapConfig {
    pub fn new(self_addr: SocketAddr) -> CoapConfig {
        CoapConfig {
            self_addr,
            ack_timeout: Duration::from_millis(2000),
            ack_random_factor: 1.5,
            max_retransmissions: 4,
            exchange_lifetime: Duration::from_secs(247),
            non_notification_grace_period: Duration::from_secs(3),
            empty_ack_delay: Duration::from_millis(1500),
            max_datagram_size: 1152,
            event_channel_capacity: 1024,
            share_message_id_allocator: false,
            default_max_age: Duration::from_secs(60),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ack_timeout.is_zero() {
            bail!("ack timeout must be positive");
        }
        if self.ack_random_factor < 1.0 {
            bail!("ack random factor must be at least 1.0, was {}", self.ack_random_factor);
        }
        if self.max_datagram_size < 4 {
            bail!("max datagram size must allow at least a message header");
        }
        if self.event_channel_capacity == 0 {
            bail!("event channel capacity must be positive");
        }
        if self.exchange_lifetime < self.max_transmit_span() {
            bail!("exchange lifetime {:?} is shorter than the retransmission span {:?}", self.exchange_lifetime, self.max_transmit_span());
        }
        Ok(())
    }

    /// the maximum time from the first transmission of a confirmable message to its last
    ///  retransmission
    pub fn max_transmit_span(&self) -> Duration {
        let factor = ((1u64 << self.max_retransmissions.min(32)) - 1) as f64 * self.ack_random_factor;
        self.ack_timeout.mul_f64(factor)
    }
}
