use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::trace;

/// This is an abstraction for sending a datagram to a remote endpoint, introduced to facilitate
///  mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramChannel: Send + Sync + 'static {
    async fn send(&self, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()>;
}

#[async_trait]
impl DatagramChannel for UdpSocket {
    async fn send(&self, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", datagram.len(), to);

        let num_sent = self.send_to(datagram, to).await?;
        if num_sent != datagram.len() {
            anyhow::bail!("sent only {} of {} bytes to {:?}", num_sent, datagram.len(), to);
        }
        Ok(())
    }
}
