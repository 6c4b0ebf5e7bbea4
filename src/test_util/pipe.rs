use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use crate::config::PortConfig;
use crate::netmsg::Registry;
use crate::udpconn::{PacketSocket, Port};


/// Returns `true` for datagrams that should be lost.
pub type DropFilter = Box<dyn FnMut(&[u8]) -> bool + Send>;

type Datagram = (Vec<u8>, SocketAddr);

/// One end of an in-memory datagram link. Datagrams addressed to the peer (or broadcast to the
///  peer's port) arrive there in order, unless the drop filter discards them. Everything else
///  vanishes, like UDP to an address nobody listens on.
pub struct PipeSocket {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    to_peer: mpsc::UnboundedSender<Datagram>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
    drop_filter: Mutex<Option<DropFilter>>,
    num_sent: AtomicUsize,
    num_dropped: AtomicUsize,
}

impl PipeSocket {
    pub fn set_drop_filter(&self, filter: DropFilter) {
        *self.drop_filter.lock().unwrap_or_else(|e| e.into_inner()) = Some(filter);
    }

    pub fn clear_drop_filter(&self) {
        *self.drop_filter.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Number of datagrams passed to `send_to`, including dropped ones.
    pub fn num_sent(&self) -> usize {
        self.num_sent.load(Ordering::Acquire)
    }

    pub fn num_dropped(&self) -> usize {
        self.num_dropped.load(Ordering::Acquire)
    }

    fn reaches_peer(&self, to: SocketAddr) -> bool {
        to == self.peer_addr
            || (to.ip() == IpAddr::V4(Ipv4Addr::BROADCAST) && to.port() == self.peer_addr.port())
    }

    fn should_drop(&self, buf: &[u8]) -> bool {
        let mut filter = self.drop_filter.lock().unwrap_or_else(|e| e.into_inner());
        match filter.as_mut() {
            Some(f) => f(buf),
            None => false,
        }
    }
}

#[async_trait]
impl PacketSocket for PipeSocket {
    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> anyhow::Result<()> {
        self.num_sent.fetch_add(1, Ordering::AcqRel);
        if !self.reaches_peer(to) {
            trace!("pipe {:?}: no receiver for {:?}", self.local_addr, to);
            return Ok(());
        }
        if self.should_drop(buf) {
            trace!("pipe {:?}: dropping datagram to {:?}", self.local_addr, to);
            self.num_dropped.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        }
        // the peer being gone looks the same as a lost datagram
        let _ = self.to_peer.send((buf.to_vec(), self.local_addr));
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        let mut incoming = self.incoming.lock().await;
        let Some((data, from)) = incoming.recv().await else {
            // no sender left: block like a socket nobody writes to
            return std::future::pending().await;
        };
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok((n, from))
    }
}

/// Creates two connected sockets.
pub fn pipe(addr_a: SocketAddr, addr_b: SocketAddr) -> (Arc<PipeSocket>, Arc<PipeSocket>) {
    let (to_a, incoming_a) = mpsc::unbounded_channel();
    let (to_b, incoming_b) = mpsc::unbounded_channel();

    let a = PipeSocket {
        local_addr: addr_a,
        peer_addr: addr_b,
        to_peer: to_b,
        incoming: tokio::sync::Mutex::new(incoming_a),
        drop_filter: Default::default(),
        num_sent: Default::default(),
        num_dropped: Default::default(),
    };
    let b = PipeSocket {
        local_addr: addr_b,
        peer_addr: addr_a,
        to_peer: to_a,
        incoming: tokio::sync::Mutex::new(incoming_b),
        drop_filter: Default::default(),
        num_sent: Default::default(),
        num_dropped: Default::default(),
    };
    (Arc::new(a), Arc::new(b))
}

/// A server port and a client port connected through a pipe, both not yet started.
pub struct PortPair {
    pub server: Arc<Port>,
    pub server_socket: Arc<PipeSocket>,
    pub client: Arc<Port>,
    pub client_socket: Arc<PipeSocket>,
}

impl PortPair {
    pub const SERVER_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 18590);
    pub const CLIENT_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 40000);

    pub fn new(registry: Arc<Registry>, config: PortConfig) -> anyhow::Result<PortPair> {
        let (server_socket, client_socket) = pipe(Self::SERVER_ADDR, Self::CLIENT_ADDR);
        let server = Port::new(server_socket.clone(), registry.clone(), false, config.clone())?;
        let client = Port::new(client_socket.clone(), registry, true, config)?;
        Ok(PortPair {
            server,
            server_socket,
            client,
            client_socket,
        })
    }

    pub fn start(&self) {
        self.server.start();
        self.client.start();
    }

    pub fn close(&self) {
        self.server.close();
        self.client.close();
    }
}
