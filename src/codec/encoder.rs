use bytes::{BufMut, BytesMut};
use tracing::trace;

use crate::error::EncodeError;
use crate::message::coap_message::{CoapMessage, PROTOCOL_VERSION};
use crate::message::option::OptionNumber;

pub const PAYLOAD_MARKER: u8 = 0xff;

/// the largest value that can be represented by an option delta or length
pub const MAX_OPTION_DELTA_OR_LENGTH: usize = 65804;

/// Serializes a message to its wire representation.
///
/// A message without a message id is encoded with id 0, to be patched by [set_message_id] once an
///  id is assigned.
pub fn encode(message: &CoapMessage) -> Result<BytesMut, EncodeError> {
    let mut buf = BytesMut::with_capacity(64 + message.payload.len());

    if message.is_empty() {
        put_header(&mut buf, message, 0);
        trace!("encoded empty message {:?}", message);
        return Ok(buf);
    }

    put_header(&mut buf, message, message.token.len() as u8);
    buf.put_slice(message.token.as_bytes());

    put_options(&mut buf, message.all_options().map(|(n, v)| (n, v.as_ref())))?;

    if !message.payload.is_empty() {
        buf.put_u8(PAYLOAD_MARKER);
        buf.put_slice(&message.payload);
    }

    trace!("encoded {:?} to {} bytes", message, buf.len());
    Ok(buf)
}

fn put_header(buf: &mut BytesMut, message: &CoapMessage, token_length: u8) {
    let message_type: u8 = message.message_type.into();
    buf.put_u8((PROTOCOL_VERSION << 6) | (message_type << 4) | (token_length & 0x0f));
    buf.put_u8(message.code.0);
    buf.put_u16(message.message_id.unwrap_or(0));
}

/// Overwrites the message id of an already encoded message in place.
pub fn set_message_id(datagram: &mut [u8], message_id: u16) {
    if datagram.len() >= 4 {
        datagram[2..4].copy_from_slice(&message_id.to_be_bytes());
    }
}

/// Writes options as Delta/Length TLVs. Option numbers must be non-decreasing.
pub fn put_options<'a>(buf: &mut BytesMut, options: impl IntoIterator<Item=(OptionNumber, &'a [u8])>) -> Result<(), EncodeError> {
    let mut previous: OptionNumber = 0;
    for (number, value) in options {
        if number < previous {
            return Err(EncodeError::OptionsOutOfOrder { previous, number });
        }
        let delta = (number - previous) as usize;
        if delta > MAX_OPTION_DELTA_OR_LENGTH {
            return Err(EncodeError::OptionDeltaTooLarge(delta));
        }
        if value.len() > MAX_OPTION_DELTA_OR_LENGTH {
            return Err(EncodeError::OptionLengthTooLarge { number, length: value.len() });
        }

        let (delta_nibble, delta_ext) = split_extended(delta);
        let (length_nibble, length_ext) = split_extended(value.len());

        buf.put_u8((delta_nibble << 4) | length_nibble);
        put_extended(buf, delta_ext);
        put_extended(buf, length_ext);
        buf.put_slice(value);

        previous = number;
    }
    Ok(())
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Extended {
    None,
    OneByte(u8),
    TwoBytes(u16),
}

/// splits a delta or length into the 4-bit nibble and its extension bytes
fn split_extended(value: usize) -> (u8, Extended) {
    if value < 13 {
        (value as u8, Extended::None)
    }
    else if value < 269 {
        (13, Extended::OneByte((value - 13) as u8))
    }
    else {
        (14, Extended::TwoBytes((value - 269) as u16))
    }
}

fn put_extended(buf: &mut BytesMut, ext: Extended) {
    match ext {
        Extended::None => {}
        Extended::OneByte(b) => buf.put_u8(b),
        Extended::TwoBytes(v) => buf.put_u16(v),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use super::*;
    use rstest::rstest;
    use crate::message::message_code::MessageCode;
    use crate::message::message_type::MessageType;
    use crate::message::option;
    use crate::message::token::Token;

    #[test]
    fn test_header_only() {
        let msg = CoapMessage::new(MessageType::Non, MessageCode::GET, Some(1), Token::empty());
        assert_eq!(encode(&msg).unwrap().as_ref(), &[0x50, 0x01, 0x00, 0x01]);
    }

    #[test]
    fn test_empty_message_drops_token_options_and_payload() {
        let mut msg = CoapMessage::new(MessageType::Ack, MessageCode::EMPTY, Some(0x1234), Token::from_u64(0xabcd));
        msg.add_option(option::ETAG, vec![1, 2]);
        msg.payload = Bytes::from_static(b"ignored");
        assert_eq!(encode(&msg).unwrap().as_ref(), &[0x60, 0x00, 0x12, 0x34]);
    }

    #[test]
    fn test_token_options_payload() {
        let mut msg = CoapMessage::new(MessageType::Con, MessageCode::GET, Some(0x0102), Token::from_u64(0xaabb));
        msg.add_string_option(option::URI_PATH, "ab");
        msg.set_uint_option(option::CONTENT_FORMAT, 0);
        msg.payload = Bytes::from_static(&[9, 8]);

        assert_eq!(encode(&msg).unwrap().as_ref(), &[
            0x42, 0x01, 0x01, 0x02,
            0xaa, 0xbb,
            0xb2, b'a', b'b',   // Uri-Path: delta 11, length 2
            0x10,               // Content-Format: delta 1, length 0
            0xff, 9, 8,
        ]);
    }

    #[rstest]
    #[case::delta_12(12, vec![0xc0])]
    #[case::delta_13(13, vec![0xd0, 0x00])]
    #[case::delta_14(14, vec![0xd0, 0x01])]
    #[case::delta_268(268, vec![0xd0, 0xff])]
    #[case::delta_269(269, vec![0xe0, 0x00, 0x00])]
    #[case::delta_270(270, vec![0xe0, 0x00, 0x01])]
    #[case::delta_max(65535, vec![0xe0, 0xfe, 0xf2])]
    fn test_extended_delta(#[case] number: OptionNumber, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        put_options(&mut buf, [(number, &[0u8; 0][..])]).unwrap();
        assert_eq!(buf.as_ref(), expected.as_slice());
    }

    #[rstest]
    #[case::length_12(12, vec![0x1c])]
    #[case::length_13(13, vec![0x1d, 0x00])]
    #[case::length_268(268, vec![0x1d, 0xff])]
    #[case::length_269(269, vec![0x1e, 0x00, 0x00])]
    #[case::length_270(270, vec![0x1e, 0x00, 0x01])]
    #[case::length_max(65804, vec![0x1e, 0xff, 0xff])]
    fn test_extended_length(#[case] length: usize, #[case] expected_prefix: Vec<u8>) {
        let value = vec![0x55u8; length];
        let mut buf = BytesMut::new();
        put_options(&mut buf, [(1, value.as_slice())]).unwrap();
        assert_eq!(&buf[..expected_prefix.len()], expected_prefix.as_slice());
        assert_eq!(buf.len(), expected_prefix.len() + length);
    }

    #[test]
    fn test_length_too_large() {
        let value = vec![0u8; 65805];
        let mut buf = BytesMut::new();
        assert_eq!(
            put_options(&mut buf, [(1, value.as_slice())]),
            Err(EncodeError::OptionLengthTooLarge { number: 1, length: 65805 }),
        );
    }

    #[test]
    fn test_out_of_order() {
        let mut buf = BytesMut::new();
        assert_eq!(
            put_options(&mut buf, [(11, &b"a"[..]), (4, &b"b"[..])]),
            Err(EncodeError::OptionsOutOfOrder { previous: 11, number: 4 }),
        );
    }

    #[test]
    fn test_repeated_option_has_zero_delta() {
        let mut buf = BytesMut::new();
        put_options(&mut buf, [(11, &b"a"[..]), (11, &b"b"[..])]).unwrap();
        assert_eq!(buf.as_ref(), &[0xb1, b'a', 0x01, b'b']);
    }

    #[test]
    fn test_set_message_id() {
        let msg = CoapMessage::new_request(MessageType::Con, MessageCode::GET, Token::empty());
        let mut buf = encode(&msg).unwrap();
        assert_eq!(buf.as_ref(), &[0x40, 0x01, 0x00, 0x00]);
        set_message_id(&mut buf, 0xbeef);
        assert_eq!(buf.as_ref(), &[0x40, 0x01, 0xbe, 0xef]);
    }
}
