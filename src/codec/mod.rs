//! The CoAP wire format (RFC 7252 section 3).

pub mod decoder;
pub mod encoder;
