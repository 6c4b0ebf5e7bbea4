//! Reliable and unreliable message delivery over a single UDP socket.
//!
//! A [Port] owns the socket and demultiplexes incoming datagrams by peer address into [Conn]s.
//!  Each `Conn` keeps one reliable sequence per direction, shared by all its [Stream]s.
//!
//! Datagram layout: `[stream id | reliable flag][seq][message]*`. For reliable datagrams, `seq` is
//!  the packet's own sequence number; for unreliable ones, it is the sender's cumulative ack.

mod conn;
mod handler;
mod port;
mod socket;
mod stream;

pub use conn::{Callback, Conn, QueueFilter, ReliableOptions};
pub use handler::{handler_fn, HandlerList, MessageHandler};
pub use port::{ConnHook, Port};
pub use socket::PacketSocket;
#[cfg(test)] pub use socket::MockPacketSocket;
pub use stream::Stream;

use std::fmt::{Debug, Formatter};


pub const MAX_STREAMS: u8 = 128;
const SID_MASK: u8 = MAX_STREAMS - 1;
const RELIABLE_FLAG: u8 = MAX_STREAMS;

/// Window around the sequence number wrap that is still considered 'in order'.
pub const SEQ_WINDOW: u8 = 50;


/// Stream id: 7 bits on the wire.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default, Ord, PartialOrd)]
pub struct Sid(pub u8);

impl Sid {
    /// Control stream between client and server.
    pub const SERVER: Sid = Sid(0);
    pub const MAX: Sid = Sid(MAX_STREAMS - 1);
}

impl Debug for Sid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "sid:{}", self.0)
    }
}

impl From<u32> for Sid {
    /// Player ids double as stream ids; only the low 7 bits survive on the wire.
    fn from(value: u32) -> Self {
        Sid((value & SID_MASK as u32) as u8)
    }
}


#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const UNRELIABLE: PacketFlags = PacketFlags(0);
    pub const RELIABLE: PacketFlags = PacketFlags(1);

    pub fn has(&self, other: PacketFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_reliable(&self) -> bool {
        self.has(PacketFlags::RELIABLE)
    }
}

impl Debug for PacketFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_reliable() {
            write!(f, "reliable")
        }
        else {
            write!(f, "unreliable")
        }
    }
}


/// One-byte wrapping sequence number.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct Seq(pub u8);

impl Seq {
    /// Wrap-aware 'at or before': plain comparison, except that values close to the upper end of
    ///  the range are also before small values they would reach within [SEQ_WINDOW] increments.
    pub fn before(self, other: Seq) -> bool {
        self.0 <= other.0
            || (self.0 >= 0xff - SEQ_WINDOW && other.0.wrapping_sub(self.0) < SEQ_WINDOW)
    }

    /// `before`, excluding equality.
    pub fn strictly_before(self, other: Seq) -> bool {
        self != other && self.before(other)
    }

    pub fn next(self) -> Seq {
        Seq(self.0.wrapping_add(1))
    }
}

impl Debug for Seq {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}


#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct Header {
    pub sid: Sid,
    pub seq: Seq,
    pub flags: PacketFlags,
}

impl Header {
    pub const SERIALIZED_LEN: usize = 2;

    pub fn reliable(sid: Sid, seq: Seq) -> Header {
        Header { sid, seq, flags: PacketFlags::RELIABLE }
    }

    pub fn unreliable(sid: Sid, ack: Seq) -> Header {
        Header { sid, seq: ack, flags: PacketFlags::UNRELIABLE }
    }

    pub fn encode(&self) -> [u8; 2] {
        let mut b0 = self.sid.0 & SID_MASK;
        if self.flags.is_reliable() {
            b0 |= RELIABLE_FLAG;
        }
        [b0, self.seq.0]
    }

    pub fn decode(b: [u8; 2]) -> Header {
        let flags = if b[0] & RELIABLE_FLAG != 0 {
            PacketFlags::RELIABLE
        }
        else {
            PacketFlags::UNRELIABLE
        };
        Header {
            sid: Sid(b[0] & SID_MASK),
            seq: Seq(b[1]),
            flags,
        }
    }
}


/// Identifies a queued reliable packet within its connection.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct PacketId(pub u64);

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct QueueId {
    pub sid: Sid,
    pub pid: PacketId,
}


/// Outcome of a reliable send that did not get acknowledged.
#[derive(thiserror::Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeliveryError {
    #[error("reliable packet was not acknowledged before its deadline")]
    Timeout,
    #[error("reliable packet was canceled")]
    Canceled,
    #[error("port is closed")]
    Closed,
}


pub(crate) fn xor_buf(key: u8, buf: &mut [u8]) {
    if key == 0 {
        return;
    }
    for b in buf {
        *b ^= key;
    }
}
