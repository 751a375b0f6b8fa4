use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};

use bytes::Bytes;

use crate::message::message_code::MessageCode;
use crate::message::message_type::MessageType;
use crate::message::option::{self, OptionNumber};
use crate::message::token::Token;

pub const PROTOCOL_VERSION: u8 = 1;

/// A single CoAP message. Options are kept ordered by option number, and repeated values for
///  the same option number keep their insertion order.
///
/// The message id is optional: requests and separate responses get their id assigned on the way
///  out, while piggybacked responses and empty messages carry the id of the message they refer to.
#[derive(Clone, Eq, PartialEq)]
pub struct CoapMessage {
    pub message_type: MessageType,
    pub code: MessageCode,
    pub message_id: Option<u16>,
    pub token: Token,
    options: BTreeMap<OptionNumber, Vec<Bytes>>,
    pub payload: Bytes,
}

impl Debug for CoapMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?} {:?} id={:?} token={:?}", self.message_type, self.code, self.message_id, self.token)?;
        for (number, values) in &self.options {
            for value in values {
                write!(f, " {}={:02x?}", option::name(*number), value.as_ref())?;
            }
        }
        if !self.payload.is_empty() {
            write!(f, " payload: {} bytes", self.payload.len())?;
        }
        write!(f, "]")
    }
}

impl CoapMessage {
    pub fn new(message_type: MessageType, code: MessageCode, message_id: Option<u16>, token: Token) -> CoapMessage {
        CoapMessage {
            message_type,
            code,
            message_id,
            token,
            options: Default::default(),
            payload: Bytes::new(),
        }
    }

    pub fn new_request(message_type: MessageType, code: MessageCode, token: Token) -> CoapMessage {
        Self::new(message_type, code, None, token)
    }

    pub fn new_response(message_type: MessageType, code: MessageCode, token: Token) -> CoapMessage {
        Self::new(message_type, code, None, token)
    }

    /// an empty CON message
    pub fn new_ping(message_id: Option<u16>) -> CoapMessage {
        Self::new(MessageType::Con, MessageCode::EMPTY, message_id, Token::empty())
    }

    pub fn new_empty_ack(message_id: u16) -> CoapMessage {
        Self::new(MessageType::Ack, MessageCode::EMPTY, Some(message_id), Token::empty())
    }

    pub fn new_empty_reset(message_id: u16) -> CoapMessage {
        Self::new(MessageType::Rst, MessageCode::EMPTY, Some(message_id), Token::empty())
    }

    /// an error response with a diagnostic text payload
    pub fn new_error_response(message_type: MessageType, code: MessageCode, token: Token, text: &str) -> CoapMessage {
        let mut result = Self::new(message_type, code, None, token);
        result.payload = Bytes::copy_from_slice(text.as_bytes());
        result
    }

    pub fn is_request(&self) -> bool {
        self.code.is_request()
    }

    pub fn is_response(&self) -> bool {
        self.code.is_response()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn is_ping(&self) -> bool {
        self.is_empty() && self.message_type == MessageType::Con
    }

    pub fn is_empty_ack(&self) -> bool {
        self.is_empty() && self.message_type == MessageType::Ack
    }

    pub fn is_empty_reset(&self) -> bool {
        self.is_empty() && self.message_type == MessageType::Rst
    }

    /// a response that carries an Observe option, i.e. one that is (or starts) a series of update
    ///  notifications for an observed resource
    pub fn is_update_notification(&self) -> bool {
        self.is_response() && self.has_option(option::OBSERVE)
    }

    pub fn has_option(&self, number: OptionNumber) -> bool {
        self.options.contains_key(&number)
    }

    /// all values for a given option number, in insertion order
    pub fn options(&self, number: OptionNumber) -> &[Bytes] {
        self.options.get(&number)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// the first value for a given option number
    pub fn option(&self, number: OptionNumber) -> Option<&Bytes> {
        self.options(number).first()
    }

    /// all options in ascending order of their option numbers
    pub fn all_options(&self) -> impl Iterator<Item=(OptionNumber, &Bytes)> {
        self.options.iter()
            .flat_map(|(number, values)| values.iter().map(move |v| (*number, v)))
    }

    pub fn add_option(&mut self, number: OptionNumber, value: impl Into<Bytes>) {
        self.options.entry(number)
            .or_default()
            .push(value.into());
    }

    /// replaces all values for the option number
    pub fn set_option(&mut self, number: OptionNumber, value: impl Into<Bytes>) {
        self.options.insert(number, vec![value.into()]);
    }

    pub fn set_uint_option(&mut self, number: OptionNumber, value: u64) {
        self.set_option(number, option::encode_uint(value));
    }

    pub fn add_string_option(&mut self, number: OptionNumber, value: &str) {
        self.add_option(number, Bytes::copy_from_slice(value.as_bytes()));
    }

    pub fn remove_option(&mut self, number: OptionNumber) -> Vec<Bytes> {
        self.options.remove(&number)
            .unwrap_or_default()
    }

    pub fn uint_option(&self, number: OptionNumber) -> Option<u64> {
        self.option(number)
            .and_then(|v| option::decode_uint(v))
    }

    pub fn observe(&self) -> Option<u32> {
        self.uint_option(option::OBSERVE)
            .map(|v| v as u32)
    }

    pub fn content_format(&self) -> Option<u16> {
        self.uint_option(option::CONTENT_FORMAT)
            .map(|v| v as u16)
    }

    pub fn etag(&self) -> Option<&Bytes> {
        self.option(option::ETAG)
    }

    /// the response's freshness in seconds, defaulting to 60 if there is no Max-Age option
    pub fn max_age(&self) -> u32 {
        self.uint_option(option::MAX_AGE)
            .map(|v| v as u32)
            .unwrap_or(option::DEFAULT_MAX_AGE)
    }

    /// the request's path, assembled from its Uri-Path options
    pub fn uri_path(&self) -> String {
        let segments: Vec<&str> = self.options(option::URI_PATH)
            .iter()
            .map(|v| std::str::from_utf8(v).unwrap_or(""))
            .collect();
        format!("/{}", segments.join("/"))
    }

    pub fn set_uri_path(&mut self, path: &str) {
        self.remove_option(option::URI_PATH);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_string_option(option::URI_PATH, segment);
        }
    }
}
