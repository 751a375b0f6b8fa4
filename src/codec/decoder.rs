use std::net::SocketAddr;

use bytes::{Buf, Bytes};
use tracing::{debug, trace};

use crate::codec::encoder::PAYLOAD_MARKER;
use crate::error::DecodeError;
use crate::message::coap_message::{CoapMessage, PROTOCOL_VERSION};
use crate::message::message_code::MessageCode;
use crate::message::message_type::MessageType;
use crate::message::option::{self, OptionNumber};
use crate::message::token::{Token, MAX_TOKEN_LENGTH};
use crate::util::buf_ext::BufExt;

/// Parses a datagram received from `remote`.
///
/// Options that are unrecognized or have an invalid value are dropped, except for critical
///  options in a request: those abort decoding with [DecodeError::BadOption] so the receiver
///  can reply with 4.02 (Bad Option).
pub fn decode(datagram: &[u8], remote: SocketAddr) -> Result<CoapMessage, DecodeError> {
    trace!("decoding {} bytes from {:?}: {:02x?}", datagram.len(), remote, datagram);

    let header_error = |message_id: Option<u16>, reason: String| DecodeError::Header { remote, message_id, reason };

    if datagram.len() < 4 {
        return Err(header_error(None, format!("datagram has {} bytes, a header requires 4", datagram.len())));
    }

    let buf = &mut &datagram[..];
    let first = buf.get_u8();
    let code = MessageCode(buf.get_u8());
    let message_id = buf.get_u16();

    let version = first >> 6;
    if version != PROTOCOL_VERSION {
        return Err(header_error(Some(message_id), format!("unsupported protocol version {}", version)));
    }
    let message_type = MessageType::from_header_bits(first >> 4);
    let token_length = (first & 0x0f) as usize;
    if token_length > MAX_TOKEN_LENGTH {
        return Err(header_error(Some(message_id), format!("token length {} exceeds the maximum of 8", token_length)));
    }

    if code.is_empty() {
        if message_type == MessageType::Non {
            return Err(header_error(Some(message_id), "empty NON message".to_string()));
        }
        return Ok(CoapMessage::new(message_type, code, Some(message_id), Token::empty()));
    }

    let token = buf.checked_copy_to_bytes(token_length)
        .ok()
        .and_then(Token::new)
        .ok_or_else(|| header_error(Some(message_id), format!("token length {} exceeds the remaining {} bytes", token_length, datagram.len() - 4)))?;

    let mut message = CoapMessage::new(message_type, code, Some(message_id), token);

    let mut previous: u32 = 0;
    while buf.has_remaining() {
        let first = buf.get_u8();
        if first == PAYLOAD_MARKER {
            if !buf.has_remaining() {
                return Err(header_error(Some(message_id), "payload marker without payload".to_string()));
            }
            message.payload = buf.copy_to_bytes(buf.remaining());
            break;
        }

        let (number, value) = read_option(buf, first, previous)
            .map_err(|e| header_error(Some(message_id), e.to_string()))?;
        previous = number as u32;

        let problem = match option::definition(number) {
            None => Some("unrecognized option"),
            Some(d) if !d.is_valid_value(&value) => Some("invalid option value"),
            Some(_) => None,
        };

        match problem {
            None => message.add_option(number, value),
            Some(reason) if message.is_request() && option::is_critical(number) => {
                debug!("{} {} in request from {:?} is critical - rejecting request", reason, number, remote);
                return Err(DecodeError::BadOption {
                    remote,
                    message_id,
                    token: message.token.clone(),
                    message_type,
                    number,
                    reason: reason.to_string(),
                });
            }
            Some(reason) => {
                debug!("{} {} ({:02x?}) from {:?} - dropping the option", reason, number, value.as_ref(), remote);
            }
        }
    }

    trace!("decoded {:?}", message);
    Ok(message)
}

fn read_option(buf: &mut &[u8], first: u8, previous: u32) -> anyhow::Result<(OptionNumber, Bytes)> {
    let delta = read_extended(buf, first >> 4)?;
    let length = read_extended(buf, first & 0x0f)?;

    let number = previous + delta;
    if number > OptionNumber::MAX as u32 {
        anyhow::bail!("option number {} out of range", number);
    }

    let value = buf.checked_copy_to_bytes(length as usize)?;
    Ok((number as OptionNumber, value))
}

fn read_extended(buf: &mut &[u8], nibble: u8) -> anyhow::Result<u32> {
    match nibble {
        0..=12 => Ok(nibble as u32),
        13 => Ok(buf.checked_get_u8()? as u32 + 13),
        14 => Ok(buf.checked_get_u16()? as u32 + 269),
        _ => anyhow::bail!("reserved option nibble 15"),
    }
}
