use std::fmt::{Debug, Formatter};

use bytes::Bytes;

pub const MAX_TOKEN_LENGTH: usize = 8;

/// A token correlates a response with its request, independently of message ids. It has between
///  0 and 8 bytes of opaque content.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Token(Bytes);

impl Token {
    pub fn empty() -> Token {
        Token(Bytes::new())
    }

    /// returns `None` if the token would be longer than [MAX_TOKEN_LENGTH]
    pub fn new(bytes: impl Into<Bytes>) -> Option<Token> {
        let bytes = bytes.into();
        if bytes.len() > MAX_TOKEN_LENGTH {
            return None;
        }
        Some(Token(bytes))
    }

    /// a token with a random length between 1 and 8 and random content
    pub fn random() -> Token {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let len = rng.gen_range(1..=MAX_TOKEN_LENGTH);
        let bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        Token(Bytes::from(bytes))
    }

    pub fn from_u64(value: u64) -> Token {
        let bytes = value.to_be_bytes();
        let first_used = bytes.iter()
            .position(|&b| b != 0)
            .unwrap_or(bytes.len());
        Token(Bytes::copy_from_slice(&bytes[first_used..]))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl Debug for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x")?;
        if self.0.is_empty() {
            return write!(f, "<empty>");
        }
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}
