//! Control messages used by the transport itself: discovery, the connect / join handshake and the
//!  'important' acknowledgement wrappers.

use std::sync::Arc;

use anyhow::bail;

use crate::binenc::*;
use crate::message_common;
use crate::netmsg::{CodecState, ComplexMessage, Message, Op, Registry, RegistryBuilder};
use crate::netxfer::MsgXfer;


macro_rules! empty_message {
    ($name:ident, $op:expr) => {
        #[derive(Clone, Debug, Default, PartialEq, Eq)]
        pub struct $name;

        impl Message for $name {
            fn net_op(&self) -> Op {
                $op
            }

            fn encode_size(&self) -> usize {
                0
            }

            fn encode(&self, _buf: &mut [u8]) -> anyhow::Result<usize> {
                Ok(0)
            }

            fn decode(&mut self, _data: &[u8]) -> anyhow::Result<usize> {
                Ok(0)
            }

            message_common!();
        }
    };
}

empty_message!(MsgServerConnect, Op::SERVER_CONNECT);
empty_message!(MsgJoinOk, Op::SERVER_JOIN_OK);
empty_message!(MsgPasswordRequired, Op::PASSWORD_REQUIRED);


/// Broadcast by clients looking for servers; the token is echoed in [MsgServerInfo].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MsgDiscover {
    pub token: u32,
}

impl Message for MsgDiscover {
    fn net_op(&self) -> Op {
        Op::SERVER_DISCOVER
    }

    fn encode_size(&self) -> usize {
        4
    }

    fn encode(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        check_capacity(buf, 4)?;
        put_u32(buf, self.token);
        Ok(4)
    }

    fn decode(&mut self, data: &[u8]) -> anyhow::Result<usize> {
        check_len(data, 4)?;
        self.token = get_u32(data);
        Ok(4)
    }

    message_common!();
}


const SERVER_INFO_FIXED: usize = 19;

/// Reply to [MsgDiscover]. The server name is a variable-length, zero-terminated tail.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MsgServerInfo {
    pub players_cur: u8,
    pub players_max: u8,
    pub map_name: String,
    pub flags: u16,
    pub token: u32,
    pub server_name: String,
}

impl Message for MsgServerInfo {
    fn net_op(&self) -> Op {
        Op::SERVER_INFO
    }

    fn encode_size(&self) -> usize {
        SERVER_INFO_FIXED + cstr_prefix(&self.server_name, usize::MAX).len() + 1
    }

    fn encode(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let size = self.encode_size();
        check_capacity(buf, size)?;
        buf[0] = self.players_cur;
        buf[1] = self.players_max;
        put_cstring(&mut buf[2..11], &self.map_name);
        put_u16(&mut buf[11..], self.flags);
        put_u32(&mut buf[13..], self.token);
        buf[17] = 0;
        buf[18] = 0;
        put_cstring(&mut buf[SERVER_INFO_FIXED..size], &self.server_name);
        Ok(size)
    }

    fn decode(&mut self, data: &[u8]) -> anyhow::Result<usize> {
        check_len(data, SERVER_INFO_FIXED + 1)?;
        self.players_cur = data[0];
        self.players_max = data[1];
        self.map_name = cstring(&data[2..11]);
        self.flags = get_u16(&data[11..]);
        self.token = get_u32(&data[13..]);

        let tail = &data[SERVER_INFO_FIXED..];
        let Some(end) = tail.iter().position(|&b| b == 0) else {
            bail!("server name is not terminated");
        };
        self.server_name = cstring(&tail[..end]);
        Ok(SERVER_INFO_FIXED + end + 1)
    }

    message_common!();
}


/// Server's answer to [MsgServerConnect]: the player id (which is also the id of the client's own
///  stream) and the XOR key for everything that follows.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MsgServerAccept {
    pub id: u32,
    pub xor_key: u8,
}

impl Message for MsgServerAccept {
    fn net_op(&self) -> Op {
        Op::SERVER_ACCEPT
    }

    fn encode_size(&self) -> usize {
        5
    }

    fn encode(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        check_capacity(buf, 5)?;
        put_u32(buf, self.id);
        buf[4] = self.xor_key;
        Ok(5)
    }

    fn decode(&mut self, data: &[u8]) -> anyhow::Result<usize> {
        check_len(data, 5)?;
        self.id = get_u32(data);
        self.xor_key = data[4];
        Ok(5)
    }

    message_common!();
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MsgAccepted {
    pub id: u8,
}

impl Message for MsgAccepted {
    fn net_op(&self) -> Op {
        Op::ACCEPTED
    }

    fn encode_size(&self) -> usize {
        1
    }

    fn encode(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        check_capacity(buf, 1)?;
        buf[0] = self.id;
        Ok(1)
    }

    fn decode(&mut self, data: &[u8]) -> anyhow::Result<usize> {
        check_len(data, 1)?;
        self.id = data[0];
        Ok(1)
    }

    message_common!();
}


const TRY_JOIN_SIZE: usize = 58;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MsgServerTryJoin {
    pub player_name: String,
    pub serial: String,
    pub version: u32,
}

impl Message for MsgServerTryJoin {
    fn net_op(&self) -> Op {
        Op::SERVER_TRY_JOIN
    }

    fn encode_size(&self) -> usize {
        TRY_JOIN_SIZE
    }

    fn encode(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        check_capacity(buf, TRY_JOIN_SIZE)?;
        put_cstring16(&mut buf[0..32], &self.player_name);
        put_cstring(&mut buf[32..54], &self.serial);
        put_u32(&mut buf[54..], self.version);
        Ok(TRY_JOIN_SIZE)
    }

    fn decode(&mut self, data: &[u8]) -> anyhow::Result<usize> {
        check_len(data, TRY_JOIN_SIZE)?;
        self.player_name = cstring16(&data[0..32]);
        self.serial = cstring(&data[32..54]);
        self.version = get_u32(&data[54..]);
        Ok(TRY_JOIN_SIZE)
    }

    message_common!();
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MsgJoinFail {
    pub reason: u8,
}

impl Message for MsgJoinFail {
    fn net_op(&self) -> Op {
        Op::SERVER_JOIN_FAIL
    }

    fn encode_size(&self) -> usize {
        1
    }

    fn encode(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        check_capacity(buf, 1)?;
        buf[0] = self.reason;
        Ok(1)
    }

    fn decode(&mut self, data: &[u8]) -> anyhow::Result<usize> {
        check_len(data, 1)?;
        self.reason = data[0];
        Ok(1)
    }

    message_common!();
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MsgServerPass {
    pub unk0: u8,
    pub pass: String,
}

impl Message for MsgServerPass {
    fn net_op(&self) -> Op {
        Op::SERVER_PASSWORD
    }

    fn encode_size(&self) -> usize {
        19
    }

    fn encode(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        check_capacity(buf, 19)?;
        buf[0] = self.unk0;
        put_cstring16(&mut buf[1..19], &self.pass);
        Ok(19)
    }

    fn decode(&mut self, data: &[u8]) -> anyhow::Result<usize> {
        check_len(data, 19)?;
        self.unk0 = data[0];
        self.pass = cstring16(&data[1..19]);
        Ok(19)
    }

    message_common!();
}


const CLIENT_ACCEPT_SIZE: usize = 62;

/// Sent by the client on its own stream once the server assigned it an id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MsgClientAccept {
    pub player_name: String,
    pub screen_width: u32,
    pub screen_height: u32,
    pub serial: String,
}

impl Message for MsgClientAccept {
    fn net_op(&self) -> Op {
        Op::CLIENT_ACCEPT
    }

    fn encode_size(&self) -> usize {
        CLIENT_ACCEPT_SIZE
    }

    fn encode(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        check_capacity(buf, CLIENT_ACCEPT_SIZE)?;
        put_cstring16(&mut buf[0..32], &self.player_name);
        put_u32(&mut buf[32..], self.screen_width);
        put_u32(&mut buf[36..], self.screen_height);
        put_cstring(&mut buf[40..62], &self.serial);
        Ok(CLIENT_ACCEPT_SIZE)
    }

    fn decode(&mut self, data: &[u8]) -> anyhow::Result<usize> {
        check_len(data, CLIENT_ACCEPT_SIZE)?;
        self.player_name = cstring16(&data[0..32]);
        self.screen_width = get_u32(&data[32..]);
        self.screen_height = get_u32(&data[36..]);
        self.serial = cstring(&data[40..62]);
        Ok(CLIENT_ACCEPT_SIZE)
    }

    message_common!();
}


#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MsgImportant {
    pub id: u32,
}

impl Message for MsgImportant {
    fn net_op(&self) -> Op {
        Op::IMPORTANT
    }

    fn encode_size(&self) -> usize {
        4
    }

    fn encode(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        check_capacity(buf, 4)?;
        put_u32(buf, self.id);
        Ok(4)
    }

    fn decode(&mut self, data: &[u8]) -> anyhow::Result<usize> {
        check_len(data, 4)?;
        self.id = get_u32(data);
        Ok(4)
    }

    message_common!();
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MsgImportantAck {
    pub id: u32,
}

impl Message for MsgImportantAck {
    fn net_op(&self) -> Op {
        Op::IMPORTANT_ACK
    }

    fn encode_size(&self) -> usize {
        4
    }

    fn encode(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        check_capacity(buf, 4)?;
        put_u32(buf, self.id);
        Ok(4)
    }

    fn decode(&mut self, data: &[u8]) -> anyhow::Result<usize> {
        check_len(data, 4)?;
        self.id = get_u32(data);
        Ok(4)
    }

    message_common!();
}


/// Sequenced wrapper around a single nested message: `[id: u16][size: u8][message]`.
#[derive(Clone, Debug, Default)]
pub struct MsgSeqImportant {
    pub id: u16,
    pub msg: Option<Box<dyn Message>>,
}

impl Message for MsgSeqImportant {
    fn net_op(&self) -> Op {
        Op::SEQ_IMPORTANT
    }

    fn encode_size(&self) -> usize {
        let inner = self.msg.as_ref()
            .map(|m| 1 + m.encode_size())
            .unwrap_or(0);
        3 + inner.min(0xff)
    }

    fn encode(&self, _buf: &mut [u8]) -> anyhow::Result<usize> {
        bail!("{:?} requires a codec state", self.net_op())
    }

    fn decode(&mut self, _data: &[u8]) -> anyhow::Result<usize> {
        bail!("{:?} requires a codec state", self.net_op())
    }

    fn as_complex(&self) -> Option<&dyn ComplexMessage> {
        Some(self)
    }

    fn as_complex_mut(&mut self) -> Option<&mut dyn ComplexMessage> {
        Some(self)
    }

    message_common!();
}

impl ComplexMessage for MsgSeqImportant {
    fn encode_size_with(&self, state: &CodecState) -> usize {
        let inner = self.msg.as_ref()
            .map(|m| state.encode_size(m.as_ref()))
            .unwrap_or(0);
        3 + inner.min(0xff)
    }

    fn encode_with(&self, state: &CodecState, buf: &mut [u8]) -> anyhow::Result<usize> {
        let Some(msg) = &self.msg else {
            bail!("no nested message");
        };
        let size = state.encode_size(msg.as_ref());
        if size > 0xff {
            bail!("nested message is too large: {} bytes", size);
        }
        check_capacity(buf, 3 + size)?;
        put_u16(buf, self.id);
        buf[2] = size as u8;
        let n = state.encode(&mut buf[3..], msg.as_ref())?;
        Ok(3 + n)
    }

    fn decode_with(&mut self, state: &CodecState, data: &[u8]) -> anyhow::Result<usize> {
        check_len(data, 3)?;
        self.id = get_u16(data);
        let size = data[2] as usize;
        check_len(data, 3 + size)?;

        self.msg = None;
        let (msg, n) = state.decode_next(&data[3..3 + size])?;
        if n != size {
            bail!("partial message decoded: {:?}", msg.net_op());
        }
        self.msg = Some(msg);
        Ok(3 + size)
    }
}


/// Registers the messages of this crate, including the transfer envelope.
pub fn register_all(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .register::<MsgServerConnect>(false)
        .register::<MsgServerAccept>(false)
        .register::<MsgAccepted>(false)
        .register::<MsgClientAccept>(false)
        .register::<MsgDiscover>(false)
        .register::<MsgServerInfo>(true)
        .register::<MsgServerTryJoin>(false)
        .register::<MsgPasswordRequired>(false)
        .register::<MsgServerPass>(false)
        .register::<MsgJoinOk>(false)
        .register::<MsgJoinFail>(false)
        .register::<MsgImportant>(false)
        .register::<MsgImportantAck>(false)
        .register::<MsgSeqImportant>(true)
        .register::<MsgXfer>(true)
        .known_len(Op::CLIENT_PING, 4)
        .known_len(Op::CLIENT_PONG, 4)
        .known_len(Op::SERVER_PING, 4)
        .known_len(Op::SERVER_PONG, 4)
        .known_len(Op::TIMESTAMP, 2)
        .known_len(Op::FULL_TIMESTAMP, 4)
        .known_len(Op::KEEP_ALIVE, 0)
        .known_len(Op::SERVER_QUIT, 0)
}

pub fn default_registry() -> Arc<Registry> {
    Arc::new(register_all(RegistryBuilder::new()).build())
}
