//! Client side of the connection setup: server discovery by broadcast, the join handshake
//!  (including password) and the connect handshake that assigns the player id and XOR key.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::PortConfig;
use crate::msg::{default_registry, MsgClientAccept, MsgJoinFail, MsgJoinOk, MsgPasswordRequired, MsgServerAccept, MsgServerConnect, MsgServerInfo, MsgServerPass, MsgServerTryJoin, MsgDiscover};
use crate::netmsg::{Message, Op};
use crate::udpconn::{Conn, DeliveryError, MessageHandler, PacketFlags, Port, Sid, Stream};


#[derive(thiserror::Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum JoinError {
    #[error("password required")]
    PasswordRequired,
    #[error("join failed: reason {0}")]
    JoinFailed(u8),
    #[error("unexpected response: {0:?}")]
    UnexpectedResponse(Op),
    #[error("not connected")]
    NotConnected,
    #[error("already joining")]
    AlreadyJoining,
    #[error("server address must be set")]
    NoServer,
}

/// A discovered server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerInfoResp {
    pub addr: SocketAddr,
    /// The token is cleared.
    pub info: MsgServerInfo,
}

#[derive(Clone)]
struct Server {
    conn: Arc<Conn>,
    srv: Stream,
    /// player id and the stream it designates, after a successful connect
    own: Option<(u32, Stream)>,
}

#[derive(Default)]
struct Inner {
    discover: Mutex<FxHashMap<u32, mpsc::Sender<ServerInfoResp>>>,
    join: Mutex<Option<mpsc::Sender<Box<dyn Message>>>>,
    server: RwLock<Option<Server>>,
}

/// Clears the pending join response channel when dropped.
struct JoinGuard<'a>(&'a Inner);

impl Drop for JoinGuard<'_> {
    fn drop(&mut self) {
        *self.0.join.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl Inner {
    fn server(&self) -> Option<Server> {
        self.server.read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn begin_join(&self) -> Result<(JoinGuard<'_>, mpsc::Receiver<Box<dyn Message>>), JoinError> {
        let mut join = self.join.lock().unwrap_or_else(|e| e.into_inner());
        if join.is_some() {
            return Err(JoinError::AlreadyJoining);
        }
        let (tx, rx) = mpsc::channel(1);
        *join = Some(tx);
        Ok((JoinGuard(self), rx))
    }

    fn handle_server_msg(&self, msg: &dyn Message) -> bool {
        let is_response = msg.is::<MsgJoinOk>()
            || msg.is::<MsgPasswordRequired>()
            || msg.is::<MsgJoinFail>()
            || msg.is::<MsgServerAccept>();
        if !is_response {
            debug!("unhandled server message {:?}", msg.net_op());
            return false;
        }

        let join = self.join.lock().unwrap_or_else(|e| e.into_inner());
        match join.as_ref() {
            Some(tx) => {
                // only the first response counts
                let _ = tx.try_send(msg.box_clone());
                true
            }
            None => false,
        }
    }

    fn handle_server_info(&self, from: SocketAddr, info: &MsgServerInfo) {
        let discover = self.discover.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = discover.get(&info.token) else {
            trace!("server info from {:?} with unknown token {}", from, info.token);
            return;
        };
        let info = MsgServerInfo { token: 0, ..info.clone() };
        if tx.try_send(ServerInfoResp { addr: from, info }).is_err() {
            debug!("dropping server info from {:?}", from);
        }
    }
}

struct ClientHandler(Arc<Inner>);

#[async_trait]
impl MessageHandler for ClientHandler {
    async fn on_message(&self, stream: &Stream, msg: &dyn Message, _flags: PacketFlags) -> bool {
        if let Some(server) = self.0.server() {
            if Arc::ptr_eq(&server.conn, stream.conn()) {
                return stream.sid() == Sid::SERVER && self.0.handle_server_msg(msg);
            }
        }
        if stream.sid() != Sid::SERVER {
            return false;
        }
        match msg.downcast_ref::<MsgServerInfo>() {
            Some(info) => {
                self.0.handle_server_info(stream.addr(), info);
                true
            }
            None => false,
        }
    }
}

fn check_response(resp: &dyn Message) -> anyhow::Result<()> {
    if resp.is::<MsgJoinOk>() {
        return Ok(());
    }
    if resp.is::<MsgPasswordRequired>() {
        return Err(JoinError::PasswordRequired.into());
    }
    if let Some(fail) = resp.downcast_ref::<MsgJoinFail>() {
        return Err(JoinError::JoinFailed(fail.reason).into());
    }
    Err(JoinError::UnexpectedResponse(resp.net_op()).into())
}

async fn wait_response(rx: &mut mpsc::Receiver<Box<dyn Message>>, timeout: Duration) -> anyhow::Result<Box<dyn Message>> {
    match tokio::time::timeout(timeout, rx.recv()).await {
        Ok(Some(resp)) => Ok(resp),
        Ok(None) => Err(DeliveryError::Closed.into()),
        Err(_) => Err(DeliveryError::Timeout.into()),
    }
}


/// A game client on top of a [Port]. Besides the handshakes, the port is available for
///  application traffic.
pub struct Client {
    port: Arc<Port>,
    inner: Arc<Inner>,
}

impl Client {
    /// Registers the client's message handler with `port`. Starting the port is left to the
    ///  caller.
    pub fn new(port: Arc<Port>) -> Client {
        let inner = Arc::new(Inner::default());
        port.on_message(Arc::new(ClientHandler(inner.clone())));
        Client { port, inner }
    }

    /// Binds a client port to `addr` and starts it.
    pub async fn bind(addr: SocketAddr, config: PortConfig) -> anyhow::Result<Client> {
        let port = Port::bind(addr, default_registry(), true, config).await?;
        port.start();
        Ok(Client::new(port))
    }

    pub fn port(&self) -> &Arc<Port> {
        &self.port
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.port.local_addr()
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.inner.server().map(|s| s.conn.remote_addr())
    }

    /// The player id the server assigned during [Client::connect].
    pub fn player_id(&self) -> Option<u32> {
        self.inner.server()?.own.map(|(id, _)| id)
    }

    /// Stream 0 to the server.
    pub fn server_stream(&self) -> Option<Stream> {
        self.inner.server().map(|s| s.srv)
    }

    /// The client's own stream, which carries its player id.
    pub fn own_stream(&self) -> Option<Stream> {
        self.inner.server()?.own.map(|(_, s)| s)
    }

    /// Forgets the server and resets all connections.
    pub fn reset(&self) {
        *self.inner.server.write().unwrap_or_else(|e| e.into_inner()) = None;
        self.port.reset();
    }

    pub fn close(&self) {
        self.reset();
        self.port.close();
    }

    /// Switches to a different server, resetting the current connection. `None` just resets.
    pub fn set_server_addr(&self, addr: Option<SocketAddr>) {
        if self.server_addr() == addr {
            return;
        }
        self.reset();
        let Some(addr) = addr else {
            return;
        };
        let Some(conn) = self.port.conn(addr) else {
            warn!("connection to server {:?} was rejected", addr);
            return;
        };
        info!("server address set to {:?}", addr);
        let srv = conn.stream(Sid::SERVER);
        *self.inner.server.write().unwrap_or_else(|e| e.into_inner()) = Some(Server { conn, srv, own: None });
    }

    /// Broadcasts a discovery request to `port` (0 for the configured discovery port) and
    ///  forwards all answers that arrive within `wait` to `out`.
    pub async fn discover(&self, port: u16, wait: Duration, out: mpsc::Sender<ServerInfoResp>) -> anyhow::Result<()> {
        let token = loop {
            let token = rand::random::<u32>();
            let mut discover = self.inner.discover.lock().unwrap_or_else(|e| e.into_inner());
            if token != 0 && !discover.contains_key(&token) {
                discover.insert(token, out.clone());
                break token;
            }
        };
        debug!("discovering servers with token {}", token);

        let result = match self.port.broadcast_msg(port, &MsgDiscover { token }).await {
            Ok(()) => {
                tokio::time::sleep(wait).await;
                Ok(())
            }
            Err(e) => Err(e),
        };
        self.inner.discover.lock().unwrap_or_else(|e| e.into_inner()).remove(&token);
        result
    }

    async fn join_server(&self, req: &dyn Message, timeout: Duration) -> anyhow::Result<()> {
        let server = self.inner.server().ok_or(JoinError::NoServer)?;
        let (_guard, mut rx) = self.inner.begin_join()?;
        server.srv.send_unreliable(&[req]).await?;
        let resp = wait_response(&mut rx, timeout).await?;
        check_response(resp.as_ref())
    }

    /// Asks the server at `addr` whether it accepts the player. Fails with
    ///  [JoinError::PasswordRequired] if [Client::try_password] should follow.
    pub async fn try_join(&self, addr: SocketAddr, req: &MsgServerTryJoin, timeout: Duration) -> anyhow::Result<()> {
        self.set_server_addr(Some(addr));
        self.join_server(req, timeout).await
    }

    pub async fn try_password(&self, pass: &str, timeout: Duration) -> anyhow::Result<()> {
        self.join_server(&MsgServerPass { unk0: 0, pass: pass.to_string() }, timeout).await
    }

    /// Opens the connection: the server assigns a player id and an XOR key, then the client
    ///  introduces itself with `accept` on its own stream.
    pub async fn connect(&self, addr: SocketAddr, accept: &MsgClientAccept, timeout: Duration) -> anyhow::Result<()> {
        self.connect_server(addr, timeout).await?;
        self.client_accept(accept, timeout).await
    }

    async fn connect_server(&self, addr: SocketAddr, timeout: Duration) -> anyhow::Result<()> {
        self.set_server_addr(Some(addr));
        let server = self.inner.server().ok_or(JoinError::NoServer)?;
        let (_guard, mut rx) = self.inner.begin_join()?;

        server.srv.send_reliable(&[&MsgServerConnect], Some(timeout)).await?;
        let resp = wait_response(&mut rx, timeout).await?;
        server.conn.ack().await?;

        let Some(accept) = resp.downcast_ref::<MsgServerAccept>() else {
            return Err(JoinError::UnexpectedResponse(resp.net_op()).into());
        };
        info!("connected to {:?} as player {}", addr, accept.id);
        server.conn.encrypt(accept.xor_key);
        let own = server.conn.stream(Sid::from(accept.id));

        let mut current = self.inner.server.write().unwrap_or_else(|e| e.into_inner());
        match current.as_mut() {
            Some(s) if Arc::ptr_eq(&s.conn, &server.conn) => s.own = Some((accept.id, own)),
            _ => return Err(JoinError::NotConnected.into()),
        }
        Ok(())
    }

    async fn client_accept(&self, accept: &MsgClientAccept, timeout: Duration) -> anyhow::Result<()> {
        let own = self.own_stream().ok_or(JoinError::NotConnected)?;
        own.send_reliable(&[accept], Some(timeout)).await
    }
}
