use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};

use crate::config::PortConfig;
use crate::netmsg::{CodecState, Message, Registry};
use crate::udpconn::{xor_buf, Conn, Header, HandlerList, MessageHandler, PacketSocket, QueueFilter, Seq, Sid};


/// Decides whether a connection to a new peer address is accepted.
pub type ConnHook = dyn Fn(&Arc<Conn>) -> bool + Send + Sync;

/// Shared write side of the socket. The single reused buffer is guarded by an async lock, and
///  holding the lock while a datagram is assembled and sent keeps datagrams in sequence order.
pub(crate) struct Writer {
    socket: Arc<dyn PacketSocket>,
    buf: Mutex<BytesMut>,
}

impl Writer {
    pub(crate) async fn lock(&self) -> WriteGuard<'_> {
        WriteGuard {
            socket: self.socket.as_ref(),
            buf: self.buf.lock().await,
        }
    }
}

pub(crate) struct WriteGuard<'a> {
    socket: &'a dyn PacketSocket,
    buf: MutexGuard<'a, BytesMut>,
}

impl WriteGuard<'_> {
    /// Assembles header and messages into a single datagram, XORs all of it with `xor` (0 leaves
    ///  it in clear text) and sends it.
    pub(crate) async fn write_msg(&mut self, to: SocketAddr, xor: u8, header: Header, codec: &CodecState, msgs: &[&dyn Message]) -> anyhow::Result<()> {
        let buf = &mut *self.buf;
        buf.clear();
        buf.extend_from_slice(&header.encode());
        for &msg in msgs {
            codec.append(buf, msg)?;
        }
        trace!("sending datagram to {:?}: {:?}", to, buf.as_ref());

        xor_buf(xor, buf);
        self.socket.send_to(buf, to).await
    }
}


/// Resolves once the gate is flipped, or once its sender is gone.
pub(crate) async fn wait_closed(mut gate: watch::Receiver<bool>) {
    loop {
        let closed = *gate.borrow_and_update();
        if closed {
            return;
        }
        if gate.changed().await.is_err() {
            return;
        }
    }
}


/// Owns a UDP socket and the connections to all peers talking to it.
pub struct Port {
    config: Arc<PortConfig>,
    codec: CodecState,
    socket: Arc<dyn PacketSocket>,
    writer: Arc<Writer>,
    handlers: Arc<HandlerList>,
    on_conn: RwLock<Option<Arc<ConnHook>>>,
    conns: RwLock<FxHashMap<SocketAddr, Arc<Conn>>>,
    closed: AtomicBool,
    close_gate: watch::Sender<bool>,
}

impl Port {
    /// Binds a broadcast-enabled UDP socket. The port is not started.
    pub async fn bind(addr: SocketAddr, registry: Arc<Registry>, is_client: bool, config: PortConfig) -> anyhow::Result<Arc<Port>> {
        let socket = UdpSocket::bind(addr).await?;
        socket.set_broadcast(true)?;
        info!("bound socket to {:?}", socket.local_addr()?);
        Port::new(Arc::new(socket), registry, is_client, config)
    }

    pub fn new(socket: Arc<dyn PacketSocket>, registry: Arc<Registry>, is_client: bool, config: PortConfig) -> anyhow::Result<Arc<Port>> {
        config.validate()?;

        let (close_gate, _) = watch::channel(false);
        Ok(Arc::new(Port {
            config: Arc::new(config),
            codec: CodecState::new(registry, is_client),
            writer: Arc::new(Writer {
                socket: socket.clone(),
                buf: Mutex::new(BytesMut::new()),
            }),
            socket,
            handlers: Default::default(),
            on_conn: Default::default(),
            conns: Default::default(),
            closed: AtomicBool::new(false),
            close_gate,
        }))
    }

    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    pub fn codec(&self) -> &CodecState {
        &self.codec
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawns the receive loop and the resend loop. Both run until [Port::close] is called.
    pub fn start(self: &Arc<Self>) {
        tokio::spawn(self.clone().recv_loop());
        tokio::spawn(self.clone().resend_loop());
    }

    /// Stops both loops. Calling this more than once has no further effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing port");
        self.close_gate.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Registers a handler for messages that no stream or connection handler claimed.
    pub fn on_message(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers.add(handler);
    }

    pub fn set_on_conn(&self, hook: Arc<ConnHook>) {
        *self.on_conn.write().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    pub fn get_conn(&self, addr: SocketAddr) -> Option<Arc<Conn>> {
        self.conns.read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&addr)
            .cloned()
    }

    /// Returns the connection for `addr`, creating it if necessary. Returns `None` if the
    ///  connection hook rejects a new connection.
    pub fn conn(&self, addr: SocketAddr) -> Option<Arc<Conn>> {
        if let Some(conn) = self.get_conn(addr) {
            return Some(conn);
        }

        let conn = Arc::new(Conn::new(
            addr,
            self.config.clone(),
            self.codec.clone(),
            self.writer.clone(),
            self.handlers.clone(),
            self.close_gate.subscribe(),
        ));

        let hook = self.on_conn.read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(hook) = hook {
            if !hook(&conn) {
                warn!("connection from {:?} rejected", addr);
                return None;
            }
        }

        let mut conns = self.conns.write().unwrap_or_else(|e| e.into_inner());
        let conn = conns.entry(addr)
            .or_insert_with(|| {
                debug!("new connection to {:?}", addr);
                conn
            })
            .clone();
        Some(conn)
    }

    pub fn remove_conn(&self, addr: SocketAddr) -> Option<Arc<Conn>> {
        self.conns.write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&addr)
    }

    /// Resets all connections and forgets them.
    pub fn reset(&self) {
        let conns = std::mem::take(&mut *self.conns.write().unwrap_or_else(|e| e.into_inner()));
        debug!("resetting {} connections", conns.len());
        for conn in conns.values() {
            conn.reset();
        }
    }

    fn all_conns(&self) -> Vec<Arc<Conn>> {
        self.conns.read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub async fn write_msg(&self, to: SocketAddr, xor: u8, header: Header, codec: &CodecState, msgs: &[&dyn Message]) -> anyhow::Result<()> {
        self.writer.lock().await
            .write_msg(to, xor, header, codec, msgs)
            .await
    }

    /// Sends an unreliable, clear-text message to the IPv4 broadcast address. Port 0 stands for
    ///  the configured discovery port.
    pub async fn broadcast_msg(&self, port: u16, msg: &dyn Message) -> anyhow::Result<()> {
        let port = if port == 0 { self.config.discovery_port } else { port };
        let to = SocketAddr::from((Ipv4Addr::BROADCAST, port));
        debug!("broadcasting {:?} to {:?}", msg.net_op(), to);
        self.write_msg(to, 0, Header::unreliable(Sid::SERVER, Seq(0)), &self.codec, &[msg]).await
    }

    async fn recv_loop(self: Arc<Self>) {
        info!("starting receive loop");

        let closed = wait_closed(self.close_gate.subscribe());
        tokio::pin!(closed);

        let mut buf = vec![0u8; self.config.recv_buffer_size];
        loop {
            let (num_read, from) = select! {
                _ = &mut closed => break,
                r = self.socket.recv_from(&mut buf) => match r {
                    Ok(x) => x,
                    Err(e) => {
                        error!("socket error: {}", e);
                        continue;
                    }
                }
            };

            let span = span!(Level::TRACE, "datagram_received", ?from);
            self.handle_datagram(from, &mut buf[..num_read])
                .instrument(span)
                .await;
        }

        info!("receive loop terminated");
    }

    async fn handle_datagram(&self, from: SocketAddr, data: &mut [u8]) {
        if data.len() < Header::SERIALIZED_LEN {
            trace!("dropping datagram of {} bytes from {:?}", data.len(), from);
            return;
        }
        let Some(conn) = self.conn(from) else {
            return;
        };
        conn.handle_packet(data).await;
    }

    async fn resend_loop(self: Arc<Self>) {
        debug!("starting resend loop");

        let closed = wait_closed(self.close_gate.subscribe());
        tokio::pin!(closed);

        let mut ticks = tokio::time::interval(self.config.resend_tick);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            select! {
                _ = &mut closed => break,
                _ = ticks.tick() => {}
            }
            self.resend_all().await;
        }

        debug!("resend loop terminated");
    }

    async fn resend_all(&self) {
        for conn in self.all_conns() {
            if let Err(e) = conn.send_queue(QueueFilter::All).await {
                debug!("error flushing queue for {:?}: {}", conn.remote_addr(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;

    use tokio::runtime::Builder;

    use super::*;
    use crate::msg::{default_registry, MsgDiscover, MsgImportant};
    use crate::netmsg::Op;
    use crate::udpconn::MockPacketSocket;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn mock_port(socket: MockPacketSocket) -> Arc<Port> {
        Port::new(Arc::new(socket), default_registry(), false, PortConfig::default()).unwrap()
    }

    #[test]
    fn test_broadcast() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut socket = MockPacketSocket::new();
            socket.expect_send_to()
                .once()
                .withf(|buf, to| {
                    buf == [0x00, 0x00, Op::SERVER_DISCOVER.0, 0x78, 0x56, 0x34, 0x12].as_slice() &&
                        to == &addr("255.255.255.255:18590")
                })
                .returning(|_, _| Ok(()));
            socket.expect_send_to()
                .once()
                .withf(|_, to| to == &addr("255.255.255.255:1234"))
                .returning(|_, _| Ok(()));

            let port = mock_port(socket);
            port.broadcast_msg(0, &MsgDiscover { token: 0x12345678 }).await.unwrap();
            port.broadcast_msg(1234, &MsgDiscover { token: 1 }).await.unwrap();
        });
    }

    #[test]
    fn test_write_msg_xor_covers_datagram() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let expected = vec![0x80 ^ 0x5a, 0x03 ^ 0x5a, Op::IMPORTANT.0 ^ 0x5a, 0x01 ^ 0x5a, 0x5a, 0x5a, 0x5a];

            let mut socket = MockPacketSocket::new();
            socket.expect_send_to()
                .once()
                .withf(move |buf, to| buf == expected.as_slice() && to == &addr("10.0.0.1:1"))
                .returning(|_, _| Ok(()));

            let port = mock_port(socket);
            port.write_msg(addr("10.0.0.1:1"), 0x5a, Header::reliable(Sid(0), Seq(3)), port.codec(), &[&MsgImportant { id: 1 }])
                .await
                .unwrap();
        });
    }

    #[test]
    fn test_write_error_is_returned() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut socket = MockPacketSocket::new();
            socket.expect_send_to()
                .returning(|_, _| Err(anyhow::anyhow!("network unreachable")));

            let port = mock_port(socket);
            let conn = port.conn(addr("10.0.0.1:1")).unwrap();
            assert!(conn.send_unreliable(Sid(0), &[&MsgImportant { id: 1 }]).await.is_err());
        });
    }

    #[test]
    fn test_conn_table() {
        let port = mock_port(MockPacketSocket::new());
        let a = addr("10.0.0.1:1");

        assert!(port.get_conn(a).is_none());
        let conn = port.conn(a).unwrap();
        assert!(Arc::ptr_eq(&conn, &port.conn(a).unwrap()));
        assert!(Arc::ptr_eq(&conn, &port.get_conn(a).unwrap()));

        assert!(port.remove_conn(a).is_some());
        assert!(port.get_conn(a).is_none());

        port.conn(a).unwrap();
        port.conn(addr("10.0.0.1:2")).unwrap();
        port.reset();
        assert!(port.all_conns().is_empty());
    }

    #[test]
    fn test_on_conn_veto() {
        let port = mock_port(MockPacketSocket::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        port.set_on_conn(Arc::new(move |_| count2.fetch_add(1, Ordering::SeqCst) < 1));

        assert!(port.conn(addr("10.0.0.1:1")).is_some());
        assert!(port.conn(addr("10.0.0.1:2")).is_none());
        assert!(port.get_conn(addr("10.0.0.1:2")).is_none());
        // existing connections are not offered to the hook again
        assert!(port.conn(addr("10.0.0.1:1")).is_some());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_short_datagrams_are_dropped() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let port = mock_port(MockPacketSocket::new());
            let mut data = [0x80u8];
            port.handle_datagram(addr("10.0.0.1:1"), &mut data).await;
            assert!(port.get_conn(addr("10.0.0.1:1")).is_none());
        });
    }

    #[test]
    fn test_close_is_idempotent() {
        let port = mock_port(MockPacketSocket::new());
        assert!(!port.is_closed());
        port.close();
        port.close();
        assert!(port.is_closed());
    }
}
