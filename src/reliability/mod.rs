pub mod backoff;
pub mod channel;
pub mod client;
pub mod events;
pub mod inbound;
pub mod message_id;
pub mod scheduler;
pub mod server;
