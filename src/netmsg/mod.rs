//! Message capability, opcode registry and the opcode-prefixed codec.
//!
//! Every message on the wire is `[opcode: u8][payload]`. The payload layout is owned by the
//!  message type itself; this module only frames it and maps opcodes back to types when decoding.

mod codec;
mod registry;

pub use codec::CodecState;
pub use registry::{MessageFactory, MessageKind, Registry, RegistryBuilder};

use std::any::Any;
use std::fmt::{Debug, Formatter};

use crate::binenc::check_capacity;


/// One-byte message type discriminator.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Op(pub u8);

impl Op {
    pub const SERVER_CONNECT: Op = Op(0);
    pub const SERVER_ACCEPT: Op = Op(1);
    pub const CLIENT_PING: Op = Op(6);
    pub const CLIENT_PONG: Op = Op(8);
    pub const CLIENT_CLOSE: Op = Op(10);
    pub const SERVER_CLOSE: Op = Op(11);
    pub const SERVER_DISCOVER: Op = Op(12);
    pub const SERVER_INFO: Op = Op(13);
    pub const SERVER_TRY_JOIN: Op = Op(14);
    pub const PASSWORD_REQUIRED: Op = Op(15);
    pub const SERVER_PING: Op = Op(16);
    pub const SERVER_PASSWORD: Op = Op(17);
    pub const SERVER_PONG: Op = Op(18);
    pub const SERVER_ERROR: Op = Op(19);
    pub const SERVER_JOIN_OK: Op = Op(20);
    pub const SERVER_JOIN_FAIL: Op = Op(21);
    pub const ACCEPTED: Op = Op(31);
    pub const CLIENT_ACCEPT: Op = Op(32);
    pub const SERVER_CLOSE_ACK: Op = Op(33);
    pub const CLIENT_CLOSE_ACK: Op = Op(34);
    pub const PING: Op = Op(36);
    pub const TIMESTAMP: Op = Op(39);
    pub const FULL_TIMESTAMP: Op = Op(40);
    pub const TEXT_MESSAGE: Op = Op(168);
    pub const IMPORTANT: Op = Op(170);
    pub const IMPORTANT_ACK: Op = Op(171);
    pub const KEEP_ALIVE: Op = Op(190);
    pub const XFER_MSG: Op = Op(194);
    pub const SERVER_QUIT: Op = Op(199);
    pub const SEQ_IMPORTANT: Op = Op(204);

    pub fn name(&self) -> Option<&'static str> {
        let name = match *self {
            Op::SERVER_CONNECT => "MSG_SERVER_CONNECT",
            Op::SERVER_ACCEPT => "MSG_SERVER_ACCEPT",
            Op::CLIENT_PING => "MSG_CLIENT_PING",
            Op::CLIENT_PONG => "MSG_CLIENT_PONG",
            Op::CLIENT_CLOSE => "MSG_CLIENT_CLOSE",
            Op::SERVER_CLOSE => "MSG_SERVER_CLOSE",
            Op::SERVER_DISCOVER => "MSG_SERVER_DISCOVER",
            Op::SERVER_INFO => "MSG_SERVER_INFO",
            Op::SERVER_TRY_JOIN => "MSG_SERVER_TRY_JOIN",
            Op::PASSWORD_REQUIRED => "MSG_PASSWORD_REQUIRED",
            Op::SERVER_PING => "MSG_SERVER_PING",
            Op::SERVER_PASSWORD => "MSG_SERVER_PASSWORD",
            Op::SERVER_PONG => "MSG_SERVER_PONG",
            Op::SERVER_ERROR => "MSG_SERVER_ERROR",
            Op::SERVER_JOIN_OK => "MSG_SERVER_JOIN_OK",
            Op::SERVER_JOIN_FAIL => "MSG_SERVER_JOIN_FAIL",
            Op::ACCEPTED => "MSG_ACCEPTED",
            Op::CLIENT_ACCEPT => "MSG_CLIENT_ACCEPT",
            Op::SERVER_CLOSE_ACK => "MSG_SERVER_CLOSE_ACK",
            Op::CLIENT_CLOSE_ACK => "MSG_CLIENT_CLOSE_ACK",
            Op::PING => "MSG_PING",
            Op::TIMESTAMP => "MSG_TIMESTAMP",
            Op::FULL_TIMESTAMP => "MSG_FULL_TIMESTAMP",
            Op::TEXT_MESSAGE => "MSG_TEXT_MESSAGE",
            Op::IMPORTANT => "MSG_IMPORTANT",
            Op::IMPORTANT_ACK => "MSG_IMPORTANT_ACK",
            Op::KEEP_ALIVE => "MSG_KEEP_ALIVE",
            Op::XFER_MSG => "MSG_XFER_MSG",
            Op::SERVER_QUIT => "MSG_SERVER_QUIT",
            Op::SEQ_IMPORTANT => "MSG_SEQ_IMPORTANT",
            _ => return None,
        };
        Some(name)
    }
}

impl Debug for Op {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}(0x{:02x})", name, self.0),
            None => write!(f, "Op(0x{:02x})", self.0),
        }
    }
}


/// A message knows its opcode and owns the layout of its payload (everything after the opcode
///  byte). `encode` and `decode` return the number of payload bytes written / consumed.
///
/// Messages that need the codec state for encoding or decoding (role-dependent layouts, nested
///  messages) additionally implement [ComplexMessage] and expose it through `as_complex`.
pub trait Message: Debug + Send + Sync + 'static {
    fn net_op(&self) -> Op;

    fn encode_size(&self) -> usize;

    fn encode(&self, buf: &mut [u8]) -> anyhow::Result<usize>;

    fn decode(&mut self, data: &[u8]) -> anyhow::Result<usize>;

    fn as_any(&self) -> &dyn Any;

    fn box_clone(&self) -> Box<dyn Message>;

    fn as_complex(&self) -> Option<&dyn ComplexMessage> {
        None
    }

    fn as_complex_mut(&mut self) -> Option<&mut dyn ComplexMessage> {
        None
    }
}

impl dyn Message {
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn is<T: Message>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

impl Clone for Box<dyn Message> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Extension of [Message] for payloads whose layout depends on the shared codec state.
pub trait ComplexMessage: Message {
    fn encode_size_with(&self, state: &CodecState) -> usize;

    fn encode_with(&self, state: &CodecState, buf: &mut [u8]) -> anyhow::Result<usize>;

    fn decode_with(&mut self, state: &CodecState, data: &[u8]) -> anyhow::Result<usize>;
}

/// Implements the type plumbing of [Message] (`as_any`, `box_clone`) for a `Clone` message type.
#[macro_export]
macro_rules! message_common {
    () => {
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        fn box_clone(&self) -> Box<dyn $crate::netmsg::Message> {
            Box::new(self.clone())
        }
    };
}


/// Payload of an opcode that has no registered type. It is kept verbatim so it can be forwarded
///  or logged, and it encodes back to exactly the bytes it was decoded from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Unknown {
    pub op: Op,
    pub data: Vec<u8>,
}

impl Message for Unknown {
    fn net_op(&self) -> Op {
        self.op
    }

    fn encode_size(&self) -> usize {
        self.data.len()
    }

    fn encode(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        check_capacity(buf, self.data.len())?;
        buf[..self.data.len()].copy_from_slice(&self.data);
        Ok(self.data.len())
    }

    /// The opcode is not part of the payload, so decoding takes everything that is offered.
    fn decode(&mut self, data: &[u8]) -> anyhow::Result<usize> {
        self.data = data.to_vec();
        Ok(data.len())
    }

    message_common!();
}
