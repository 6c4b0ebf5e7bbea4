use std::net::SocketAddr;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::trace;


/// Datagram I/O of a [crate::udpconn::Port], abstracted so that tests can run ports over an
///  in-memory pipe or a mock.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketSocket: Send + Sync + 'static {
    fn local_addr(&self) -> anyhow::Result<SocketAddr>;

    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> anyhow::Result<()>;

    async fn recv_from(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)>;
}

#[async_trait]
impl PacketSocket for UdpSocket {
    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(UdpSocket::local_addr(self)?)
    }

    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> anyhow::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", buf.len(), to);
        UdpSocket::send_to(self, buf, to).await?;
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        Ok(UdpSocket::recv_from(self, buf).await?)
    }
}
