//! Chunked transfer of named byte blobs (e.g. map downloads or the message of the day) on top of
//!  a connection's reliable and unreliable send paths.
//!
//! The sender announces a transfer with `Start`, the receiver allocates a slot and answers with
//!  `Accept`. Chunks are then sent unreliably, a few at a time, and resent until the receiver acks
//!  them. Once all data is reassembled, the receiver sends `Done`. Either side can end a transfer
//!  early: the sender with `Cancel`, the receiver with `Abort`.
//!
//! [Sender] and [Receiver] are plain state machines driven by incoming messages and by periodic
//!  calls to `update` with a monotonic timestamp. They do not lock; applications typically keep a
//!  [State] behind an async mutex shared between a message handler and a timer task.

mod msg;
mod receive;
mod send;

pub use msg::*;
pub use receive::{ReceiveFn, Receiver};
pub use send::{AbortFn, DoneFn, Sender};

use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::config::XferConfig;
use crate::udpconn::{QueueFilter, ReliableOptions, Stream};


pub type SendId = u8;
pub type RecvId = u8;
pub type Chunk = u16;

/// A blob to transfer. `action` and `typ` are passed through to the receiver unchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Data {
    pub action: u8,
    pub typ: String,
    pub data: Vec<u8>,
}

#[derive(thiserror::Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum XferError {
    #[error("transfer closed")]
    Closed,
    #[error("transfer timed out on the sending side")]
    SendTimeout,
    #[error("transfer timed out on the receiving side")]
    RecvTimeout,
    #[error("too many concurrent transfers")]
    TooManyTransfers,
    #[error("data is too large for a transfer")]
    TooLarge,
}

impl XferError {
    /// Reason code in `Cancel` and `Abort` messages.
    pub fn reason_code(&self) -> u8 {
        match self {
            XferError::SendTimeout => 2,
            XferError::RecvTimeout => 3,
            _ => 1,
        }
    }

    /// Unknown codes are treated as a plain close.
    pub fn from_reason_code(code: u8) -> XferError {
        match code {
            2 => XferError::SendTimeout,
            3 => XferError::RecvTimeout,
            _ => XferError::Closed,
        }
    }
}


/// The peer of a transfer. Implementations are compared to match incoming messages with the
///  transfers they belong to.
#[async_trait]
pub trait XferConn: Clone + PartialEq + Send + Sync + 'static {
    async fn send_reliable_msg(&self, msg: &MsgXfer) -> anyhow::Result<()>;

    async fn send_unreliable_msg(&self, msg: &MsgXfer) -> anyhow::Result<()>;
}

#[async_trait]
impl XferConn for Stream {
    /// Queues the message and transmits it right away, without waiting for the ack: transfer
    ///  messages are usually sent from the receive loop, which also processes acks.
    async fn send_reliable_msg(&self, msg: &MsgXfer) -> anyhow::Result<()> {
        let pid = self.queue_reliable(ReliableOptions::default(), &[msg]);
        self.conn().send_queue(QueueFilter::Packet(pid)).await
    }

    async fn send_unreliable_msg(&self, msg: &MsgXfer) -> anyhow::Result<()> {
        self.send_unreliable(&[msg]).await
    }
}


/// Sender and receiver for one endpoint.
pub struct State<C: XferConn> {
    pub sender: Sender<C>,
    pub receiver: Receiver<C>,
}

impl <C: XferConn> State<C> {
    pub fn new(config: &XferConfig) -> State<C> {
        State {
            sender: Sender::new(config),
            receiver: Receiver::new(config),
        }
    }

    /// Drops all transfers in both directions without notifying anybody.
    pub fn reset(&mut self) {
        self.sender.reset();
        self.receiver.reset();
    }

    pub async fn update(&mut self, ts: Duration) {
        self.sender.update(ts).await;
        self.receiver.update(ts).await;
    }

    /// Routes a message from `conn` to the sender or the receiver.
    pub async fn handle(&mut self, conn: &C, ts: Duration, msg: &MsgXfer) {
        trace!("handling {:?}", msg.code());
        match msg {
            MsgXfer::Start(m) => self.receiver.handle_start(conn, ts, m).await,
            MsgXfer::Accept(m) => self.sender.handle_accept(conn, m),
            MsgXfer::Data(m) => self.receiver.handle_data(conn, ts, m).await,
            MsgXfer::Ack(m) => self.sender.handle_ack(conn, m),
            MsgXfer::Done(m) => self.sender.handle_done(conn, m),
            MsgXfer::Cancel(m) => self.receiver.handle_cancel(conn, m),
            MsgXfer::Abort(m) => self.sender.handle_abort(conn, m),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_conn {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Records sent messages instead of delivering them, so that a test can pass them on
    ///  explicitly (or drop them).
    #[derive(Clone)]
    pub struct TestConn {
        pub name: &'static str,
        pub sent: Arc<Mutex<Vec<(MsgXfer, bool)>>>,
    }

    impl TestConn {
        pub fn new(name: &'static str) -> TestConn {
            TestConn {
                name,
                sent: Default::default(),
            }
        }

        /// Messages sent since the last call, with their 'reliable' flag.
        pub fn take(&self) -> Vec<(MsgXfer, bool)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }

        pub fn take_msgs(&self) -> Vec<MsgXfer> {
            self.take().into_iter().map(|(m, _)| m).collect()
        }
    }

    impl PartialEq for TestConn {
        fn eq(&self, other: &Self) -> bool {
            self.name == other.name
        }
    }

    #[async_trait]
    impl XferConn for TestConn {
        async fn send_reliable_msg(&self, msg: &MsgXfer) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push((msg.clone(), true));
            Ok(())
        }

        async fn send_unreliable_msg(&self, msg: &MsgXfer) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push((msg.clone(), false));
            Ok(())
        }
    }
}
