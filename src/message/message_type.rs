use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The two-bit message type from the CoAP header.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum MessageType {
    /// confirmable - retransmitted until acknowledged
    Con = 0,
    /// non-confirmable
    Non = 1,
    Ack = 2,
    Rst = 3,
}

impl MessageType {
    pub fn from_header_bits(bits: u8) -> MessageType {
        match bits & 0x03 {
            0 => MessageType::Con,
            1 => MessageType::Non,
            2 => MessageType::Ack,
            _ => MessageType::Rst,
        }
    }
}
