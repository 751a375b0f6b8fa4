use std::net::SocketAddr;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::message::token::Token;
use crate::reliability::message_id::MessageIdReleaseListener;

#[derive(Default)]
pub struct CollectingReleaseListener {
    released: Mutex<Vec<(SocketAddr, u16, Token)>>,
}

impl CollectingReleaseListener {
    pub fn released(&self) -> Vec<(SocketAddr, u16, Token)> {
        self.released.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageIdReleaseListener for CollectingReleaseListener {
    async fn on_message_id_released(&self, remote: SocketAddr, message_id: u16, token: Token) {
        self.released.lock().unwrap().push((remote, message_id, token));
    }
}
