use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::codec::decoder::decode;
use crate::message::coap_message::CoapMessage;
use crate::reliability::channel::DatagramChannel;

#[derive(Debug, Clone)]
pub struct SentDatagram {
    pub at: Instant,
    pub to: SocketAddr,
    pub datagram: Vec<u8>,
}

impl SentDatagram {
    pub fn message(&self) -> CoapMessage {
        decode(&self.datagram, self.to)
            .expect("sent datagrams should be decodable")
    }
}

/// A [DatagramChannel] that records everything that is sent through it, with (tokio) timestamps
///  so that tests with a paused clock can check send times.
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<SentDatagram>>,
    fail_sends: AtomicBool,
}

impl RecordingChannel {
    pub fn sent(&self) -> Vec<SentDatagram> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_messages(&self) -> Vec<CoapMessage> {
        self.sent().iter()
            .map(|s| s.message())
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    /// subsequent sends are recorded, but report a failure
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DatagramChannel for RecordingChannel {
    async fn send(&self, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(SentDatagram {
            at: Instant::now(),
            to,
            datagram: datagram.to_vec(),
        });
        if self.fail_sends.load(Ordering::SeqCst) {
            anyhow::bail!("simulated send failure");
        }
        Ok(())
    }
}
