//! Reliable CoAP messaging (RFC 7252 / RFC 7641) over UDP.
//!
//! ## Structure
//!
//! * [message] is the data model, [codec] turns messages into datagrams and back
//! * [reliability] is where the protocol's message layer lives:
//!   * message ids are allocated per remote endpoint and are blocked for EXCHANGE_LIFETIME after
//!     use, so that a remote endpoint can safely detect duplicates
//!   * CON requests (and pings) are retransmitted with exponential backoff until they are
//!     acknowledged, all retransmissions are scheduled up front
//!   * CON responses and update notifications are retransmitted one at a time, which allows the
//!     content of a notification to be replaced while it is still being retransmitted
//!   * inbound requests are checked for duplicates and acknowledged with an empty ACK if there is
//!     no response after a short delay
//! * [resource] holds observable resource status and delivers update notifications
//! * [endpoint] ties everything to a UDP socket
//!
//! All timer-driven work goes through a scheduler abstraction on top of tokio, nothing in this
//!  crate blocks its caller.
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod message_sink;
pub mod reliability;
pub mod resource;
pub mod test_util;
pub mod util;
