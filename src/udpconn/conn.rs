use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tokio::select;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::PortConfig;
use crate::netmsg::{CodecState, Message, Op};
use crate::udpconn::port::{wait_closed, Writer};
use crate::udpconn::{xor_buf, DeliveryError, HandlerList, Header, MessageHandler, PacketFlags, PacketId, QueueId, Seq, Sid, Stream};


pub type Callback = Box<dyn FnOnce() + Send>;

/// Delivery parameters of a queued reliable packet. An explicit `deadline` wins over `timeout`;
///  without either, the port's default timeout applies.
#[derive(Default)]
pub struct ReliableOptions {
    pub deadline: Option<Instant>,
    pub timeout: Option<Duration>,
    /// Called once when the peer acknowledges the packet.
    pub on_done: Option<Callback>,
    /// Called once when the packet expires unacknowledged. Not called if the packet is canceled
    ///  or the connection is reset.
    pub on_timeout: Option<Callback>,
}

/// Restricts a queue flush to part of the queue.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum QueueFilter {
    All,
    Packet(PacketId),
    Stream(Sid),
}

impl QueueFilter {
    fn matches(&self, packet: &QueuedPacket) -> bool {
        match *self {
            QueueFilter::All => true,
            QueueFilter::Packet(pid) => packet.pid == pid,
            QueueFilter::Stream(sid) => packet.header.sid == sid,
        }
    }
}

struct QueuedPacket {
    pid: PacketId,
    header: Header,
    /// key at queue time: packets queued before the handshake stay in clear text
    xor: u8,
    last_send: Option<Instant>,
    deadline: Instant,
    msgs: Arc<Vec<Box<dyn Message>>>,
    on_done: Option<Callback>,
    on_timeout: Option<Callback>,
}

impl QueuedPacket {
    fn queue_id(&self) -> QueueId {
        QueueId {
            sid: self.header.sid,
            pid: self.pid,
        }
    }
}

#[derive(Default)]
struct ConnState {
    xor: u8,
    /// sequence number of the next outgoing reliable packet
    syn: Seq,
    /// sequence number of the next expected incoming reliable packet
    ack: Seq,
    need_ack: u32,
    ack_deadline: Option<Instant>,
    queue: Vec<QueuedPacket>,
}

impl ConnState {
    fn take_ack(&mut self) -> (u8, Header) {
        self.need_ack = 0;
        self.ack_deadline = None;
        (self.xor, Header::unreliable(Sid::SERVER, self.ack))
    }
}


/// The reliability engine for a single peer address: sequence numbers, XOR key, retransmission
///  queue and ack batching, shared by all streams to that peer.
pub struct Conn {
    addr: SocketAddr,
    config: Arc<PortConfig>,
    codec: CodecState,
    writer: Arc<Writer>,
    port_handlers: Arc<HandlerList>,
    handlers: HandlerList,
    stream_handlers: RwLock<Vec<(Sid, Arc<dyn MessageHandler>)>>,
    next_pid: AtomicU64,
    closed: watch::Receiver<bool>,
    state: Mutex<ConnState>,
}

impl Conn {
    pub(crate) fn new(
        addr: SocketAddr,
        config: Arc<PortConfig>,
        codec: CodecState,
        writer: Arc<Writer>,
        port_handlers: Arc<HandlerList>,
        closed: watch::Receiver<bool>,
    ) -> Conn {
        Conn {
            addr,
            config,
            codec,
            writer,
            port_handlers,
            handlers: Default::default(),
            stream_handlers: Default::default(),
            next_pid: AtomicU64::new(0),
            closed,
            state: Default::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn codec(&self) -> &CodecState {
        &self.codec
    }

    pub fn stream(self: &Arc<Self>, sid: Sid) -> Stream {
        Stream::new(self.clone(), sid)
    }

    /// Registers a handler for messages from this peer on any stream.
    pub fn on_message(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers.add(handler);
    }

    pub(crate) fn add_stream_handler(&self, sid: Sid, handler: Arc<dyn MessageHandler>) {
        self.stream_handlers.write()
            .unwrap_or_else(|e| e.into_inner())
            .push((sid, handler));
    }

    fn stream_handlers_for(&self, sid: Sid) -> Vec<Arc<dyn MessageHandler>> {
        self.stream_handlers.read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(s, _)| *s == sid)
            .map(|(_, h)| h.clone())
            .collect()
    }

    /// Zeroes sequence numbers, XOR key and ack state, and drops all queued packets without
    ///  calling their timeout callbacks.
    pub fn reset(&self) {
        let dropped = {
            let mut state = self.state();
            let queue = std::mem::take(&mut state.queue);
            *state = ConnState::default();
            queue
        };
        debug!("reset connection to {:?}, dropped {} queued packets", self.addr, dropped.len());
    }

    /// Sets the XOR key for all datagrams sent or received from now on. 0 disables obfuscation.
    pub fn encrypt(&self, key: u8) {
        self.state().xor = key;
    }

    pub fn xor_key(&self) -> u8 {
        self.state().xor
    }

    pub(crate) async fn handle_packet(self: &Arc<Self>, data: &mut [u8]) {
        if data.len() < Header::SERIALIZED_LEN {
            return;
        }

        let (header, done, ack_now) = {
            let mut state = self.state();
            xor_buf(state.xor, data);
            let header = Header::decode([data[0], data[1]]);
            let payload = &data[Header::SERIALIZED_LEN..];

            let mut done = Vec::new();
            let mut ack_now = false;
            if header.flags.is_reliable() {
                trace!("RECV syn={:?} {:?} from {:?}: {:?}", header.seq, header.sid, self.addr, payload);
                let now = Instant::now();
                if header.seq != state.ack {
                    if header.seq.strictly_before(state.ack) {
                        // delivered before, so our ack got lost
                        trace!("duplicate packet {:?}, expected {:?}", header.seq, state.ack);
                        state.ack_deadline.get_or_insert(now + self.config.ack_delay);
                    }
                    else {
                        trace!("out of order packet {:?}, expected {:?}", header.seq, state.ack);
                    }
                    return;
                }
                state.ack = state.ack.next();
                state.need_ack += 1;
                if state.need_ack >= self.config.ack_batch {
                    ack_now = true;
                }
                else {
                    state.ack_deadline.get_or_insert(now + self.config.ack_delay);
                }
            }
            else {
                trace!("RECV ack={:?} {:?} from {:?}: {:?}", header.seq, header.sid, self.addr, payload);
                state.queue.retain_mut(|p| {
                    if !p.header.seq.strictly_before(header.seq) {
                        return true;
                    }
                    if let Some(on_done) = p.on_done.take() {
                        done.push(on_done);
                    }
                    false
                });
            }
            (header, done, ack_now)
        };

        for on_done in done {
            on_done();
        }
        if ack_now {
            if let Err(e) = self.ack().await {
                debug!("error sending ack to {:?}: {}", self.addr, e);
            }
        }

        let stream = self.stream(header.sid);
        let flags = header.flags;
        let mut data = &data[Header::SERIALIZED_LEN..];
        while !data.is_empty() {
            let (msg, num_read) = match self.codec.decode_next(data) {
                Ok(x) => x,
                Err(e) => {
                    warn!("failed to decode {:?} from {:?}: {}", Op(data[0]), self.addr, e);
                    break;
                }
            };
            data = &data[num_read..];
            trace!("RECV {:?} on {:?}", msg, header.sid);
            self.dispatch(&stream, msg.as_ref(), flags).await;
        }
    }

    async fn dispatch(&self, stream: &Stream, msg: &dyn Message, flags: PacketFlags) {
        for handler in self.stream_handlers_for(stream.sid()) {
            if handler.on_message(stream, msg, flags).await {
                return;
            }
        }
        if self.handlers.call(stream, msg, flags).await {
            return;
        }
        if self.port_handlers.call(stream, msg, flags).await {
            return;
        }
        trace!("unhandled message {:?}", msg.net_op());
    }

    /// Sends messages without delivery guarantee. The header carries the current ack, which
    ///  also makes a pending batched ack unnecessary.
    pub async fn send_unreliable(&self, sid: Sid, msgs: &[&dyn Message]) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().await;
        let (xor, header) = {
            let mut state = self.state();
            state.ack_deadline = None;
            (state.xor, Header::unreliable(sid, state.ack))
        };
        trace!("SEND ack={:?} {:?} to {:?}: {:?}", header.seq, sid, self.addr, msgs);
        writer.write_msg(self.addr, xor, header, &self.codec, msgs).await
    }

    /// Sends an ack-only datagram right away.
    pub async fn ack(&self) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().await;
        let (xor, header) = self.state().take_ack();
        trace!("SEND ack={:?} to {:?}", header.seq, self.addr);
        writer.write_msg(self.addr, xor, header, &self.codec, &[]).await
    }

    /// Appends a reliable packet to the queue. It is transmitted by the next queue flush.
    pub fn queue_reliable(&self, sid: Sid, opts: ReliableOptions, msgs: &[&dyn Message]) -> PacketId {
        let msgs = msgs.iter()
            .map(|m| m.box_clone())
            .collect::<Vec<_>>();
        let deadline = opts.deadline.unwrap_or_else(|| {
            Instant::now() + opts.timeout.unwrap_or_else(|| self.config.default_timeout())
        });
        let pid = PacketId(self.next_pid.fetch_add(1, Ordering::Relaxed) + 1);

        let mut state = self.state();
        let seq = state.syn;
        state.syn = seq.next();
        let xor = state.xor;
        trace!("queueing {:?} as syn={:?} {:?} for {:?}", pid, seq, sid, self.addr);
        state.queue.push(QueuedPacket {
            pid,
            header: Header::reliable(sid, seq),
            xor,
            last_send: None,
            deadline,
            msgs: Arc::new(msgs),
            on_done: opts.on_done,
            on_timeout: opts.on_timeout,
        });
        pid
    }

    /// Queues and transmits a reliable packet, and waits for its ack.
    ///
    /// Fails with a [DeliveryError] if the packet expires, is canceled or the port is closed.
    ///  Dropping the returned future removes the packet from the queue.
    pub async fn send_reliable(&self, sid: Sid, msgs: &[&dyn Message], timeout: Option<Duration>) -> anyhow::Result<()> {
        let deadline = Instant::now() + timeout.unwrap_or_else(|| self.config.default_timeout());

        let (tx, rx) = oneshot::channel();
        let on_done_tx = Arc::new(Mutex::new(Some(tx)));
        let on_timeout_tx = on_done_tx.clone();
        let opts = ReliableOptions {
            deadline: Some(deadline),
            timeout: None,
            on_done: Some(Box::new(move || complete(&on_done_tx, Ok(())))),
            on_timeout: Some(Box::new(move || complete(&on_timeout_tx, Err(DeliveryError::Timeout)))),
        };

        let pid = self.queue_reliable(sid, opts, msgs);
        let _cancel = CancelOnDrop { conn: self, pid };
        self.send_queue(QueueFilter::Packet(pid)).await?;

        let result = select! {
            r = rx => r.unwrap_or(Err(DeliveryError::Canceled)),
            _ = tokio::time::sleep_until(deadline) => Err(DeliveryError::Timeout),
            _ = wait_closed(self.closed.clone()) => Err(DeliveryError::Closed),
        };
        Ok(result?)
    }

    /// Flushes the queue, restricted to packets matching `filter`: expired packets are removed
    ///  and their timeout callbacks called, packets not sent within the resend interval are
    ///  (re)transmitted. A due batched ack is sent regardless of the filter.
    ///
    /// Returns the last write error.
    pub async fn send_queue(&self, filter: QueueFilter) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().await;
        let now = Instant::now();

        let (expired, to_send, ack) = {
            let mut state = self.state();

            let mut expired = Vec::new();
            state.queue.retain_mut(|p| {
                if !filter.matches(p) || p.deadline >= now {
                    return true;
                }
                debug!("reliable packet {:?} to {:?} expired", p.pid, self.addr);
                if let Some(on_timeout) = p.on_timeout.take() {
                    expired.push(on_timeout);
                }
                false
            });

            let mut to_send = Vec::new();
            for p in state.queue.iter_mut().filter(|p| filter.matches(p)) {
                let due = match p.last_send {
                    None => true,
                    Some(t) => t + self.config.resend_interval < now,
                };
                if due {
                    p.last_send = Some(now);
                    to_send.push((p.xor, p.header, p.msgs.clone()));
                }
            }

            let ack = match state.ack_deadline {
                Some(d) if d < now => Some(state.take_ack()),
                _ => None,
            };
            (expired, to_send, ack)
        };

        let mut result = Ok(());
        for (xor, header, msgs) in to_send {
            trace!("SEND syn={:?} {:?} to {:?}: {:?}", header.seq, header.sid, self.addr, msgs);
            let msgs = msgs.iter()
                .map(|m| m.as_ref())
                .collect::<Vec<_>>();
            if let Err(e) = writer.write_msg(self.addr, xor, header, &self.codec, &msgs).await {
                result = Err(e);
            }
        }
        if let Some((xor, header)) = ack {
            trace!("SEND ack={:?} to {:?}", header.seq, self.addr);
            if let Err(e) = writer.write_msg(self.addr, xor, header, &self.codec, &[]).await {
                result = Err(e);
            }
        }
        drop(writer);

        for on_timeout in expired {
            on_timeout();
        }
        result
    }

    /// Removes queued packets for which `pred` returns true. Their callbacks are dropped without
    ///  being called.
    pub fn delete_queue(&self, mut pred: impl FnMut(QueueId, &[Box<dyn Message>]) -> bool) {
        let removed: Vec<QueuedPacket> = {
            let mut state = self.state();
            let (removed, kept) = std::mem::take(&mut state.queue)
                .into_iter()
                .partition(|p| pred(p.queue_id(), &p.msgs));
            state.queue = kept;
            removed
        };
        if !removed.is_empty() {
            trace!("removed {} packets from the queue for {:?}", removed.len(), self.addr);
        }
    }

    pub fn cancel_reliable(&self, pid: PacketId) {
        self.delete_queue(|id, _| id.pid == pid);
    }

    /// Drops all queued packets of a single stream.
    pub fn reset_stream(&self, sid: Sid) {
        self.delete_queue(|id, _| id.sid == sid);
    }

    /// Calls `f` for every message of every queued packet, in queue order.
    pub fn view_queue(&self, mut f: impl FnMut(QueueId, &dyn Message)) {
        let state = self.state();
        for p in &state.queue {
            for msg in p.msgs.iter() {
                f(p.queue_id(), msg.as_ref());
            }
        }
    }

    /// Number of queued messages on stream `sid` with one of the given opcodes, or with any
    ///  opcode if `ops` is empty.
    pub fn queued_for(&self, sid: Sid, ops: &[Op]) -> usize {
        let mut result = 0;
        self.view_queue(|id, msg| {
            if id.sid == sid && (ops.is_empty() || ops.contains(&msg.net_op())) {
                result += 1;
            }
        });
        result
    }
}

fn complete(tx: &Mutex<Option<oneshot::Sender<Result<(), DeliveryError>>>>, result: Result<(), DeliveryError>) {
    let tx = tx.lock()
        .unwrap_or_else(|e| e.into_inner())
        .take();
    if let Some(tx) = tx {
        let _ = tx.send(result);
    }
}

struct CancelOnDrop<'a> {
    conn: &'a Conn,
    pid: PacketId,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        self.conn.cancel_reliable(self.pid);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use tokio::runtime::Builder;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::msg::{default_registry, MsgDiscover, MsgImportant};
    use crate::test_util::pipe::PortPair;
    use crate::udpconn::{handler_fn, MockPacketSocket, Port};

    const PEER: &str = "10.0.0.9:1000";

    fn peer() -> SocketAddr {
        PEER.parse().unwrap()
    }

    fn mock_conn(socket: MockPacketSocket) -> (Arc<Port>, Arc<Conn>) {
        let port = Port::new(Arc::new(socket), default_registry(), false, PortConfig::default()).unwrap();
        let conn = port.conn(peer()).unwrap();
        (port, conn)
    }

    fn counter() -> (Arc<AtomicUsize>, Callback) {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        (count, Box::new(move || { count2.fetch_add(1, Ordering::SeqCst); }))
    }

    fn paused_rt() -> tokio::runtime::Runtime {
        Builder::new_current_thread().enable_all().start_paused(true).build().unwrap()
    }

    /// Forwards every message to a channel, optionally acking right away.
    struct Recorder {
        tx: mpsc::UnboundedSender<Box<dyn Message>>,
        ack: bool,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn on_message(&self, stream: &Stream, msg: &dyn Message, _flags: PacketFlags) -> bool {
            if self.ack {
                stream.conn().ack().await.unwrap();
            }
            self.tx.send(msg.box_clone()).unwrap();
            true
        }
    }

    fn started_pair(ack: bool) -> (PortPair, Arc<Conn>, mpsc::UnboundedReceiver<Box<dyn Message>>) {
        let pair = PortPair::new(default_registry(), PortConfig::default()).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        pair.server.on_message(Arc::new(Recorder { tx, ack }));
        pair.client.on_message(handler_fn(|_, _, _| true));
        pair.start();
        let conn = pair.client.conn(PortPair::SERVER_ADDR).unwrap();
        (pair, conn, rx)
    }

    fn token(msg: &dyn Message) -> u32 {
        msg.downcast_ref::<MsgDiscover>().unwrap().token
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential() {
        let (pair, conn, mut rx) = started_pair(true);
        let tick = pair.client.config().resend_tick;

        for i in 0..300u32 {
            conn.send_reliable(Sid::SERVER, &[&MsgDiscover { token: i + 1 }], Some(5 * tick)).await.unwrap();
            let msg = timeout(tick, rx.recv()).await.unwrap().unwrap();
            assert_eq!(token(msg.as_ref()), i + 1);
        }
        assert_eq!(conn.queued_for(Sid::SERVER, &[]), 0);
        pair.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_queue() {
        let (pair, conn, mut rx) = started_pair(false);

        for i in 0..300u32 {
            conn.queue_reliable(Sid::SERVER, ReliableOptions::default(), &[&MsgDiscover { token: i + 1 }]);
        }
        for i in 0..300u32 {
            let msg = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
            assert_eq!(token(msg.as_ref()), i + 1);
        }
        pair.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery() {
        let (pair, conn, mut rx) = started_pair(false);
        let retries = pair.client.config().resend_retries;

        let mut dropped = 0;
        pair.client_socket.set_drop_filter(Box::new(move |_| {
            if dropped < retries - 1 {
                dropped += 1;
                return true;
            }
            false
        }));

        conn.send_reliable(Sid::SERVER, &[&MsgDiscover { token: 0x123 }], None).await.unwrap();
        let msg = rx.try_recv().unwrap();
        assert_eq!(token(msg.as_ref()), 0x123);
        assert!(rx.try_recv().is_err());
        assert_eq!(pair.client_socket.num_dropped(), (retries - 1) as usize);
        pair.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_reliable_timeout() {
        let (pair, conn, mut rx) = started_pair(false);
        pair.client_socket.set_drop_filter(Box::new(|_| true));

        let err = conn.send_reliable(Sid::SERVER, &[&MsgImportant { id: 1 }], Some(Duration::from_millis(300)))
            .await
            .unwrap_err();
        assert_eq!(err.downcast_ref::<DeliveryError>(), Some(&DeliveryError::Timeout));
        assert_eq!(conn.queued_for(Sid::SERVER, &[]), 0);
        assert!(rx.try_recv().is_err());
        pair.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_fails_pending_send() {
        let (pair, conn, _rx) = started_pair(false);
        pair.client_socket.set_drop_filter(Box::new(|_| true));

        let task = tokio::spawn(async move {
            conn.send_reliable(Sid::SERVER, &[&MsgImportant { id: 1 }], None).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        pair.client.close();

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.downcast_ref::<DeliveryError>(), Some(&DeliveryError::Closed));
        pair.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_send_is_canceled() {
        let (pair, conn, _rx) = started_pair(false);
        pair.client_socket.set_drop_filter(Box::new(|_| true));

        let r = timeout(Duration::from_millis(50), conn.send_reliable(Sid::SERVER, &[&MsgImportant { id: 1 }], None)).await;
        assert!(r.is_err());
        assert_eq!(conn.queued_for(Sid::SERVER, &[]), 0);
        pair.close();
    }

    #[test]
    fn test_reset_drops_queue_without_timeouts() {
        let (_port, conn) = mock_conn(MockPacketSocket::new());
        let (timeouts, on_timeout) = counter();

        conn.encrypt(0x11);
        conn.queue_reliable(Sid(1), ReliableOptions { on_timeout: Some(on_timeout), ..Default::default() }, &[&MsgImportant { id: 1 }]);
        conn.queue_reliable(Sid(2), ReliableOptions::default(), &[&MsgImportant { id: 2 }]);
        assert_eq!(conn.queued_for(Sid(1), &[]), 1);

        conn.reset();
        assert_eq!(conn.queued_for(Sid(1), &[]), 0);
        assert_eq!(conn.queued_for(Sid(2), &[]), 0);
        assert_eq!(conn.xor_key(), 0);
        assert_eq!(timeouts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        paused_rt().block_on(async {
            let mut socket = MockPacketSocket::new();
            socket.expect_send_to()
                .once()
                .withf(|buf, _| buf == [0x80, 0x00, Op::IMPORTANT.0, 2, 0, 0, 0].as_slice())
                .returning(|_, _| Ok(()));
            let (_port, conn) = mock_conn(socket);

            conn.queue_reliable(Sid(0), ReliableOptions::default(), &[&MsgImportant { id: 1 }]);
            conn.reset();
            conn.queue_reliable(Sid(0), ReliableOptions::default(), &[&MsgImportant { id: 2 }]);
            conn.send_queue(QueueFilter::All).await.unwrap();
        });
    }

    #[test]
    fn test_cumulative_ack() {
        paused_rt().block_on(async {
            let (_port, conn) = mock_conn(MockPacketSocket::new());
            let (done0, on_done0) = counter();
            let (done1, on_done1) = counter();
            let (done2, on_done2) = counter();
            for on_done in [on_done0, on_done1, on_done2] {
                conn.queue_reliable(Sid(0), ReliableOptions { on_done: Some(on_done), ..Default::default() }, &[&MsgImportant { id: 1 }]);
            }

            conn.handle_packet(&mut [0x00, 0x02]).await;
            assert_eq!(done0.load(Ordering::SeqCst), 1);
            assert_eq!(done1.load(Ordering::SeqCst), 1);
            assert_eq!(done2.load(Ordering::SeqCst), 0);
            assert_eq!(conn.queued_for(Sid(0), &[]), 1);

            conn.handle_packet(&mut [0x00, 0x02]).await;
            assert_eq!(done0.load(Ordering::SeqCst), 1);

            conn.encrypt(0x11);
            conn.handle_packet(&mut [0x00 ^ 0x11, 0x03 ^ 0x11]).await;
            assert_eq!(done2.load(Ordering::SeqCst), 1);
            assert_eq!(conn.queued_for(Sid(0), &[]), 0);
        });
    }

    #[test]
    fn test_batched_ack_after_delay() {
        paused_rt().block_on(async {
            let mut socket = MockPacketSocket::new();
            socket.expect_send_to()
                .times(2)
                .withf(|buf, to| buf == [0x00, 0x01].as_slice() && to == &peer())
                .returning(|_, _| Ok(()));
            let (_port, conn) = mock_conn(socket);

            conn.handle_packet(&mut [0x80, 0x00]).await;
            conn.send_queue(QueueFilter::All).await.unwrap();

            tokio::time::advance(Duration::from_millis(150)).await;
            conn.send_queue(QueueFilter::All).await.unwrap();
            conn.send_queue(QueueFilter::All).await.unwrap();

            // a retransmission of a delivered packet means our ack was lost
            conn.handle_packet(&mut [0x80, 0x00]).await;
            tokio::time::advance(Duration::from_millis(150)).await;
            conn.send_queue(QueueFilter::Stream(Sid(5))).await.unwrap();
        });
    }

    #[test]
    fn test_out_of_order_is_dropped() {
        paused_rt().block_on(async {
            let (port, conn) = mock_conn(MockPacketSocket::new());
            let (count, _) = counter();
            let count2 = count.clone();
            port.on_message(handler_fn(move |_, _, _| { count2.fetch_add(1, Ordering::SeqCst); true }));

            conn.handle_packet(&mut [0x80, 0x01, Op::IMPORTANT.0, 1, 0, 0, 0]).await;
            assert_eq!(count.load(Ordering::SeqCst), 0);
            conn.handle_packet(&mut [0x80, 0x00, Op::IMPORTANT.0, 1, 0, 0, 0]).await;
            assert_eq!(count.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn test_ack_batch_sends_immediately() {
        paused_rt().block_on(async {
            let mut socket = MockPacketSocket::new();
            socket.expect_send_to()
                .once()
                .withf(|buf, _| buf == [0x00, 50].as_slice())
                .returning(|_, _| Ok(()));
            let (_port, conn) = mock_conn(socket);

            for seq in 0..50u8 {
                conn.handle_packet(&mut [0x80, seq]).await;
            }
            // counter and deadline were reset by the ack
            tokio::time::advance(Duration::from_millis(150)).await;
            conn.send_queue(QueueFilter::All).await.unwrap();
        });
    }

    #[test]
    fn test_send_unreliable_carries_ack() {
        paused_rt().block_on(async {
            let mut socket = MockPacketSocket::new();
            socket.expect_send_to()
                .once()
                .withf(|buf, _| buf == [0x03, 0x01, Op::IMPORTANT.0, 7, 0, 0, 0].as_slice())
                .returning(|_, _| Ok(()));
            let (_port, conn) = mock_conn(socket);

            conn.handle_packet(&mut [0x80, 0x00]).await;
            conn.send_unreliable(Sid(3), &[&MsgImportant { id: 7 }]).await.unwrap();
            // the batched ack is no longer needed
            tokio::time::advance(Duration::from_millis(150)).await;
            conn.send_queue(QueueFilter::All).await.unwrap();
        });
    }

    #[test]
    fn test_resend_and_expiry() {
        paused_rt().block_on(async {
            let mut socket = MockPacketSocket::new();
            socket.expect_send_to()
                .times(2)
                .withf(|buf, _| buf == [0x80, 0x00, Op::IMPORTANT.0, 1, 0, 0, 0].as_slice())
                .returning(|_, _| Ok(()));
            let (_port, conn) = mock_conn(socket);
            let (timeouts, on_timeout) = counter();

            conn.queue_reliable(Sid(0), ReliableOptions {
                timeout: Some(Duration::from_millis(1500)),
                on_timeout: Some(on_timeout),
                ..Default::default()
            }, &[&MsgImportant { id: 1 }]);

            conn.send_queue(QueueFilter::All).await.unwrap();
            conn.send_queue(QueueFilter::All).await.unwrap();
            tokio::time::advance(Duration::from_millis(1100)).await;
            conn.send_queue(QueueFilter::All).await.unwrap();
            assert_eq!(timeouts.load(Ordering::SeqCst), 0);

            tokio::time::advance(Duration::from_millis(500)).await;
            conn.send_queue(QueueFilter::All).await.unwrap();
            assert_eq!(timeouts.load(Ordering::SeqCst), 1);
            assert_eq!(conn.queued_for(Sid(0), &[]), 0);
        });
    }

    #[test]
    fn test_queued_packet_keeps_its_key() {
        paused_rt().block_on(async {
            let imp = Op::IMPORTANT.0;
            let mut socket = MockPacketSocket::new();
            socket.expect_send_to()
                .once()
                .withf(move |buf, _| buf == [0x80, 0x00, imp, 1, 0, 0, 0].as_slice())
                .returning(|_, _| Ok(()));
            socket.expect_send_to()
                .once()
                .withf(move |buf, _| buf == [0x80 ^ 0x5a, 0x01 ^ 0x5a, imp ^ 0x5a, 2 ^ 0x5a, 0x5a, 0x5a, 0x5a].as_slice())
                .returning(|_, _| Ok(()));
            let (_port, conn) = mock_conn(socket);

            conn.queue_reliable(Sid(0), ReliableOptions::default(), &[&MsgImportant { id: 1 }]);
            conn.encrypt(0x5a);
            conn.queue_reliable(Sid(0), ReliableOptions::default(), &[&MsgImportant { id: 2 }]);
            conn.send_queue(QueueFilter::All).await.unwrap();
        });
    }

    #[test]
    fn test_filtered_flush() {
        paused_rt().block_on(async {
            let mut socket = MockPacketSocket::new();
            socket.expect_send_to()
                .once()
                .withf(|buf, _| buf == [0x82, 0x01, Op::IMPORTANT.0, 2, 0, 0, 0].as_slice())
                .returning(|_, _| Ok(()));
            let (_port, conn) = mock_conn(socket);

            conn.queue_reliable(Sid(1), ReliableOptions::default(), &[&MsgImportant { id: 1 }]);
            conn.queue_reliable(Sid(2), ReliableOptions::default(), &[&MsgImportant { id: 2 }]);
            conn.send_queue(QueueFilter::Stream(Sid(2))).await.unwrap();
        });
    }

    #[test]
    fn test_queue_inspection() {
        let (_port, conn) = mock_conn(MockPacketSocket::new());

        let a = conn.queue_reliable(Sid(1), ReliableOptions::default(), &[&MsgImportant { id: 1 }, &MsgDiscover { token: 1 }]);
        let b = conn.queue_reliable(Sid(1), ReliableOptions::default(), &[&MsgImportant { id: 2 }]);
        conn.queue_reliable(Sid(2), ReliableOptions::default(), &[&MsgImportant { id: 3 }]);
        assert_ne!(a, b);

        assert_eq!(conn.queued_for(Sid(1), &[]), 3);
        assert_eq!(conn.queued_for(Sid(1), &[Op::IMPORTANT]), 2);
        assert_eq!(conn.queued_for(Sid(1), &[Op::SERVER_DISCOVER, Op::IMPORTANT]), 3);
        assert_eq!(conn.queued_for(Sid(3), &[]), 0);

        let mut seen = Vec::new();
        conn.view_queue(|id, msg| seen.push((id.sid, msg.net_op())));
        assert_eq!(seen, vec![
            (Sid(1), Op::IMPORTANT),
            (Sid(1), Op::SERVER_DISCOVER),
            (Sid(1), Op::IMPORTANT),
            (Sid(2), Op::IMPORTANT),
        ]);

        conn.cancel_reliable(a);
        assert_eq!(conn.queued_for(Sid(1), &[]), 1);

        conn.reset_stream(Sid(2));
        assert_eq!(conn.queued_for(Sid(2), &[]), 0);
        assert_eq!(conn.queued_for(Sid(1), &[]), 1);

        conn.delete_queue(|id, msgs| id.pid == b && msgs.len() == 1);
        assert_eq!(conn.queued_for(Sid(1), &[]), 0);
    }

    #[test]
    fn test_handler_chain_order() {
        paused_rt().block_on(async {
            let (port, conn) = mock_conn(MockPacketSocket::new());
            let log = Arc::new(Mutex::new(Vec::new()));

            let l = log.clone();
            port.on_message(handler_fn(move |_, _, _| { l.lock().unwrap().push("port"); true }));
            let l = log.clone();
            conn.on_message(handler_fn(move |_, msg, _| { l.lock().unwrap().push("conn"); msg.is::<MsgDiscover>() }));
            let l = log.clone();
            conn.stream(Sid(0)).on_message(handler_fn(move |_, _, _| { l.lock().unwrap().push("stream 0"); false }));
            let l = log.clone();
            conn.stream(Sid(1)).on_message(handler_fn(move |_, _, _| { l.lock().unwrap().push("stream 1"); true }));

            conn.handle_packet(&mut [0x00, 0x00, Op::SERVER_DISCOVER.0, 1, 0, 0, 0]).await;
            assert_eq!(*log.lock().unwrap(), vec!["stream 0", "conn"]);

            log.lock().unwrap().clear();
            conn.handle_packet(&mut [0x00, 0x00, Op::IMPORTANT.0, 1, 0, 0, 0]).await;
            assert_eq!(*log.lock().unwrap(), vec!["stream 0", "conn", "port"]);

            log.lock().unwrap().clear();
            conn.handle_packet(&mut [0x01, 0x00, Op::IMPORTANT.0, 1, 0, 0, 0]).await;
            assert_eq!(*log.lock().unwrap(), vec!["stream 1"]);
        });
    }

    #[test]
    fn test_decode_error_stops_datagram() {
        paused_rt().block_on(async {
            let (port, conn) = mock_conn(MockPacketSocket::new());
            let ops = Arc::new(Mutex::new(Vec::new()));
            let o = ops.clone();
            port.on_message(handler_fn(move |_, msg, _| { o.lock().unwrap().push(msg.net_op()); true }));

            // the second message is truncated, the third one is never reached
            conn.handle_packet(&mut [0x00, 0x00, Op::IMPORTANT.0, 1, 0, 0, 0, Op::IMPORTANT.0, 1]).await;
            assert_eq!(*ops.lock().unwrap(), vec![Op::IMPORTANT]);
        });
    }
}
