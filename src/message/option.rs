//! The option number registry from RFC 7252 (section 12.2), RFC 7641 (Observe) and RFC 7959
//!  (Block1 / Block2 / Size2), plus the two endpoint id options used for connection-less
//!  endpoint identification.
//!
//! Each option number carries a fixed classification (critical / unsafe to forward / no cache
//!  key) and value format constraints. For registered options, the classification is read from
//!  the table below. Option numbers that are not in the table are "unrecognized", and the only
//!  thing we know about them is what RFC 7252 section 5.4.6 encodes into the number itself.

pub type OptionNumber = u16;

pub const IF_MATCH: OptionNumber = 1;
pub const URI_HOST: OptionNumber = 3;
pub const ETAG: OptionNumber = 4;
pub const IF_NONE_MATCH: OptionNumber = 5;
pub const OBSERVE: OptionNumber = 6;
pub const URI_PORT: OptionNumber = 7;
pub const LOCATION_PATH: OptionNumber = 8;
pub const URI_PATH: OptionNumber = 11;
pub const CONTENT_FORMAT: OptionNumber = 12;
pub const MAX_AGE: OptionNumber = 14;
pub const URI_QUERY: OptionNumber = 15;
pub const ACCEPT: OptionNumber = 17;
pub const LOCATION_QUERY: OptionNumber = 20;
pub const BLOCK_2: OptionNumber = 23;
pub const BLOCK_1: OptionNumber = 27;
pub const SIZE_2: OptionNumber = 28;
pub const PROXY_URI: OptionNumber = 35;
pub const PROXY_SCHEME: OptionNumber = 39;
pub const SIZE_1: OptionNumber = 60;
pub const ENDPOINT_ID_1: OptionNumber = 124;
pub const ENDPOINT_ID_2: OptionNumber = 189;

/// Max-Age that applies if a response carries no Max-Age option
pub const DEFAULT_MAX_AGE: u32 = 60;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OptionFormat {
    Empty,
    Opaque,
    Uint,
    String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OptionDefinition {
    pub number: OptionNumber,
    pub name: &'static str,
    pub format: OptionFormat,
    pub min_length: usize,
    pub max_length: usize,
    pub critical: bool,
    pub unsafe_to_forward: bool,
    pub no_cache_key: bool,
}

impl OptionDefinition {
    const fn new(
        number: OptionNumber,
        name: &'static str,
        format: OptionFormat,
        min_length: usize,
        max_length: usize,
        critical: bool,
        unsafe_to_forward: bool,
        no_cache_key: bool,
    ) -> OptionDefinition {
        OptionDefinition { number, name, format, min_length, max_length, critical, unsafe_to_forward, no_cache_key }
    }

    /// checks a raw option value against this option's length bounds and format
    pub fn is_valid_value(&self, value: &[u8]) -> bool {
        if value.len() < self.min_length || value.len() > self.max_length {
            return false;
        }
        match self.format {
            OptionFormat::String => std::str::from_utf8(value).is_ok(),
            _ => true,
        }
    }
}

use OptionFormat::*;

#[rustfmt::skip]
static REGISTRY: [OptionDefinition; 21] = [
    //                     number          name              format   min  max    C      U      N
    OptionDefinition::new(IF_MATCH,       "If-Match",       Opaque,  0,   8,     true,  false, false),
    OptionDefinition::new(URI_HOST,       "Uri-Host",       String,  1,   255,   true,  true,  false),
    OptionDefinition::new(ETAG,           "ETag",           Opaque,  1,   8,     false, false, false),
    OptionDefinition::new(IF_NONE_MATCH,  "If-None-Match",  Empty,   0,   0,     true,  false, false),
    OptionDefinition::new(OBSERVE,        "Observe",        Uint,    0,   3,     false, true,  false),
    OptionDefinition::new(URI_PORT,       "Uri-Port",       Uint,    0,   2,     true,  true,  false),
    OptionDefinition::new(LOCATION_PATH,  "Location-Path",  String,  0,   255,   false, false, false),
    OptionDefinition::new(URI_PATH,       "Uri-Path",       String,  0,   255,   true,  true,  false),
    OptionDefinition::new(CONTENT_FORMAT, "Content-Format", Uint,    0,   2,     false, false, false),
    OptionDefinition::new(MAX_AGE,        "Max-Age",        Uint,    0,   4,     false, true,  false),
    OptionDefinition::new(URI_QUERY,      "Uri-Query",      String,  0,   255,   true,  true,  false),
    OptionDefinition::new(ACCEPT,         "Accept",         Uint,    0,   2,     true,  false, false),
    OptionDefinition::new(LOCATION_QUERY, "Location-Query", String,  0,   255,   false, false, false),
    OptionDefinition::new(BLOCK_2,        "Block2",         Uint,    0,   3,     true,  true,  false),
    OptionDefinition::new(BLOCK_1,        "Block1",         Uint,    0,   3,     true,  true,  false),
    OptionDefinition::new(SIZE_2,         "Size2",          Uint,    0,   4,     false, false, true),
    OptionDefinition::new(PROXY_URI,      "Proxy-Uri",      String,  1,   1034,  true,  true,  false),
    OptionDefinition::new(PROXY_SCHEME,   "Proxy-Scheme",   String,  1,   255,   true,  true,  false),
    OptionDefinition::new(SIZE_1,         "Size1",          Uint,    0,   4,     false, false, true),
    OptionDefinition::new(ENDPOINT_ID_1,  "Endpoint-ID-1",  Opaque,  0,   8,     false, false, true),
    OptionDefinition::new(ENDPOINT_ID_2,  "Endpoint-ID-2",  Opaque,  0,   8,     true,  false, true),
];

/// Returns the registry entry for an option number, or `None` if the option is unrecognized.
pub fn definition(number: OptionNumber) -> Option<&'static OptionDefinition> {
    REGISTRY.iter()
        .find(|d| d.number == number)
}

pub fn is_critical(number: OptionNumber) -> bool {
    match definition(number) {
        Some(d) => d.critical,
        None => number & 0x01 != 0,
    }
}

pub fn is_unsafe_to_forward(number: OptionNumber) -> bool {
    match definition(number) {
        Some(d) => d.unsafe_to_forward,
        None => number & 0x02 != 0,
    }
}

pub fn is_no_cache_key(number: OptionNumber) -> bool {
    match definition(number) {
        Some(d) => d.no_cache_key,
        None => (number & 0x1e) == 0x1c,
    }
}

pub fn name(number: OptionNumber) -> &'static str {
    definition(number)
        .map(|d| d.name)
        .unwrap_or("<unrecognized>")
}

/// encodes an unsigned integer option value in the shortest big-endian representation, i.e. the
///  value 0 is encoded as zero bytes
pub fn encode_uint(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first_used = bytes.iter()
        .position(|&b| b != 0)
        .unwrap_or(bytes.len());
    bytes[first_used..].to_vec()
}

/// decodes an unsigned integer option value, returning `None` for values longer than 8 bytes
pub fn decode_uint(value: &[u8]) -> Option<u64> {
    if value.len() > 8 {
        return None;
    }
    Some(value.iter()
        .fold(0u64, |acc, &b| (acc << 8) | b as u64))
}
