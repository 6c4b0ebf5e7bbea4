use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::netmsg::Message;
use crate::udpconn::{Conn, MessageHandler, PacketId, QueueFilter, ReliableOptions, Sid};


/// A view of a [Conn] scoped to a single stream id. Streams share their connection's sequence
///  numbers and XOR key, but are dispatched and flushed independently.
#[derive(Clone)]
pub struct Stream {
    conn: Arc<Conn>,
    sid: Sid,
}

impl Stream {
    pub fn new(conn: Arc<Conn>, sid: Sid) -> Stream {
        Stream { conn, sid }
    }

    pub fn conn(&self) -> &Arc<Conn> {
        &self.conn
    }

    pub fn sid(&self) -> Sid {
        self.sid
    }

    pub fn addr(&self) -> SocketAddr {
        self.conn.remote_addr()
    }

    pub async fn send_unreliable(&self, msgs: &[&dyn Message]) -> anyhow::Result<()> {
        self.conn.send_unreliable(self.sid, msgs).await
    }

    pub async fn send_reliable(&self, msgs: &[&dyn Message], timeout: Option<Duration>) -> anyhow::Result<()> {
        self.conn.send_reliable(self.sid, msgs, timeout).await
    }

    pub fn queue_reliable(&self, opts: ReliableOptions, msgs: &[&dyn Message]) -> PacketId {
        self.conn.queue_reliable(self.sid, opts, msgs)
    }

    pub fn cancel_reliable(&self, pid: PacketId) {
        self.conn.cancel_reliable(pid);
    }

    /// Flushes this stream's part of the queue.
    pub async fn send_queue(&self) -> anyhow::Result<()> {
        self.conn.send_queue(QueueFilter::Stream(self.sid)).await
    }

    /// Drops this stream's queued packets.
    pub fn reset(&self) {
        self.conn.reset_stream(self.sid);
    }

    /// Registers a handler that only sees messages arriving on this stream id.
    pub fn on_message(&self, handler: Arc<dyn MessageHandler>) {
        self.conn.add_stream_handler(self.sid, handler);
    }
}

impl PartialEq for Stream {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.conn, &other.conn) && self.sid == other.sid
    }
}

impl Eq for Stream {}

impl Debug for Stream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Stream({:?}, {:?})", self.conn.remote_addr(), self.sid)
    }
}
