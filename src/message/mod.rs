pub mod coap_message;
pub mod message_code;
pub mod message_type;
pub mod option;
pub mod token;
