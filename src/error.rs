use std::net::SocketAddr;

use thiserror::Error;

use crate::message::message_type::MessageType;
use crate::message::option::OptionNumber;
use crate::message::token::Token;

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum EncodeError {
    #[error("option {number} follows option {previous} - options must be in ascending order")]
    OptionsOutOfOrder { previous: OptionNumber, number: OptionNumber },

    #[error("option delta {0} exceeds the maximum of 65804")]
    OptionDeltaTooLarge(usize),

    #[error("option {number}: value length {length} exceeds the maximum of 65804")]
    OptionLengthTooLarge { number: OptionNumber, length: usize },
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum DecodeError {
    /// The datagram is not a well-formed CoAP message. If the message id could be read before
    ///  the problem was detected, it is passed along so the receiver can reply with RST.
    #[error("malformed message from {remote:?} (message id {message_id:?}): {reason}")]
    Header {
        remote: SocketAddr,
        message_id: Option<u16>,
        reason: String,
    },

    /// A request contained a critical option that is unrecognized or malformed. The header was
    ///  parsed successfully, so there is enough context for a 4.02 (Bad Option) response.
    #[error("bad option {number} in request from {remote:?} (message id {message_id}, token {token:?}): {reason}")]
    BadOption {
        remote: SocketAddr,
        message_id: u16,
        token: Token,
        message_type: MessageType,
        number: OptionNumber,
        reason: String,
    },
}

impl DecodeError {
    pub fn remote(&self) -> SocketAddr {
        match self {
            DecodeError::Header { remote, .. } => *remote,
            DecodeError::BadOption { remote, .. } => *remote,
        }
    }

    pub fn message_id(&self) -> Option<u16> {
        match self {
            DecodeError::Header { message_id, .. } => *message_id,
            DecodeError::BadOption { message_id, .. } => Some(*message_id),
        }
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ExchangeError {
    #[error("no message id available for {remote:?}")]
    NoMessageIdAvailable { remote: SocketAddr },

    #[error("encoding failed: {0}")]
    Encode(#[from] EncodeError),
}
