use anyhow::bail;
use bytes::Bytes;

use crate::binenc::*;
use crate::message_common;
use crate::netmsg::{Message, Op};
use crate::netxfer::{Chunk, RecvId, SendId};


const TYPE_FIELD_LEN: usize = 128;

/// Sub-code in the first payload byte of [Op::XFER_MSG].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum XferCode {
    Start = 0,
    Accept = 1,
    Data = 2,
    Ack = 3,
    Done = 4,
    Cancel = 5,
    Abort = 6,
}

impl TryFrom<u8> for XferCode {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => XferCode::Start,
            1 => XferCode::Accept,
            2 => XferCode::Data,
            3 => XferCode::Ack,
            4 => XferCode::Done,
            5 => XferCode::Cancel,
            6 => XferCode::Abort,
            _ => bail!("unknown transfer message code {}", value),
        })
    }
}

/// Announces a transfer: sent reliably by the sender, answered with [XferAccept].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XferStart {
    pub action: u8,
    pub unk1: u8,
    pub size: u32,
    pub typ: String,
    pub send_id: SendId,
    pub unk5: [u8; 3],
}

impl XferStart {
    const LEN: usize = 1 + 1 + 4 + TYPE_FIELD_LEN + 1 + 3;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct XferAccept {
    pub recv_id: RecvId,
    pub send_id: SendId,
}

/// Chunk numbers start at 1.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XferData {
    pub token: u8,
    pub recv_id: RecvId,
    pub chunk: Chunk,
    pub data: Bytes,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct XferAck {
    pub token: u8,
    pub recv_id: RecvId,
    pub chunk: Chunk,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct XferDone {
    pub recv_id: RecvId,
}

/// Sent by the sender to end a transfer the receiver accepted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct XferCancel {
    pub reason: u8,
    pub recv_id: RecvId,
}

/// Sent by the receiver to give up on a transfer. If the receiver had no free slot, `recv_id`
///  carries the sender's id instead.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct XferAbort {
    pub reason: u8,
    pub recv_id: RecvId,
}

/// Envelope for all transfer protocol messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MsgXfer {
    Start(XferStart),
    Accept(XferAccept),
    Data(XferData),
    Ack(XferAck),
    Done(XferDone),
    Cancel(XferCancel),
    Abort(XferAbort),
}

impl Default for MsgXfer {
    fn default() -> Self {
        MsgXfer::Done(XferDone::default())
    }
}

impl MsgXfer {
    pub fn code(&self) -> XferCode {
        match self {
            MsgXfer::Start(_) => XferCode::Start,
            MsgXfer::Accept(_) => XferCode::Accept,
            MsgXfer::Data(_) => XferCode::Data,
            MsgXfer::Ack(_) => XferCode::Ack,
            MsgXfer::Done(_) => XferCode::Done,
            MsgXfer::Cancel(_) => XferCode::Cancel,
            MsgXfer::Abort(_) => XferCode::Abort,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            MsgXfer::Start(_) => XferStart::LEN,
            MsgXfer::Accept(_) => 2,
            MsgXfer::Data(m) => 6 + m.data.len(),
            MsgXfer::Ack(_) => 4,
            MsgXfer::Done(_) => 1,
            MsgXfer::Cancel(_) | MsgXfer::Abort(_) => 2,
        }
    }
}

impl Message for MsgXfer {
    fn net_op(&self) -> Op {
        Op::XFER_MSG
    }

    fn encode_size(&self) -> usize {
        1 + self.body_len()
    }

    fn encode(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let n = self.encode_size();
        check_capacity(buf, n)?;
        buf[0] = self.code() as u8;
        let body = &mut buf[1..n];
        match self {
            MsgXfer::Start(m) => {
                body[0] = m.action;
                body[1] = m.unk1;
                put_u32(&mut body[2..], m.size);
                put_cstring(&mut body[6..6 + TYPE_FIELD_LEN], &m.typ);
                body[6 + TYPE_FIELD_LEN] = m.send_id;
                body[7 + TYPE_FIELD_LEN..].copy_from_slice(&m.unk5);
            }
            MsgXfer::Accept(m) => {
                body[0] = m.recv_id;
                body[1] = m.send_id;
            }
            MsgXfer::Data(m) => {
                if m.data.len() > u16::MAX as usize {
                    bail!("chunk too large: {} bytes", m.data.len());
                }
                body[0] = m.token;
                body[1] = m.recv_id;
                put_u16(&mut body[2..], m.chunk);
                put_u16(&mut body[4..], m.data.len() as u16);
                body[6..].copy_from_slice(&m.data);
            }
            MsgXfer::Ack(m) => {
                body[0] = m.token;
                body[1] = m.recv_id;
                put_u16(&mut body[2..], m.chunk);
            }
            MsgXfer::Done(m) => {
                body[0] = m.recv_id;
            }
            MsgXfer::Cancel(XferCancel { reason, recv_id }) | MsgXfer::Abort(XferAbort { reason, recv_id }) => {
                body[0] = *reason;
                body[1] = *recv_id;
            }
        }
        Ok(n)
    }

    fn decode(&mut self, data: &[u8]) -> anyhow::Result<usize> {
        check_len(data, 1)?;
        let code = XferCode::try_from(data[0])?;
        let body = &data[1..];
        let (msg, n) = match code {
            XferCode::Start => {
                check_len(body, XferStart::LEN)?;
                let mut unk5 = [0u8; 3];
                unk5.copy_from_slice(&body[7 + TYPE_FIELD_LEN..XferStart::LEN]);
                (MsgXfer::Start(XferStart {
                    action: body[0],
                    unk1: body[1],
                    size: get_u32(&body[2..]),
                    typ: cstring(&body[6..6 + TYPE_FIELD_LEN]),
                    send_id: body[6 + TYPE_FIELD_LEN],
                    unk5,
                }), XferStart::LEN)
            }
            XferCode::Accept => {
                check_len(body, 2)?;
                (MsgXfer::Accept(XferAccept { recv_id: body[0], send_id: body[1] }), 2)
            }
            XferCode::Data => {
                check_len(body, 6)?;
                let len = get_u16(&body[4..]) as usize;
                check_len(body, 6 + len)?;
                (MsgXfer::Data(XferData {
                    token: body[0],
                    recv_id: body[1],
                    chunk: get_u16(&body[2..]),
                    data: Bytes::copy_from_slice(&body[6..6 + len]),
                }), 6 + len)
            }
            XferCode::Ack => {
                check_len(body, 4)?;
                (MsgXfer::Ack(XferAck { token: body[0], recv_id: body[1], chunk: get_u16(&body[2..]) }), 4)
            }
            XferCode::Done => {
                check_len(body, 1)?;
                (MsgXfer::Done(XferDone { recv_id: body[0] }), 1)
            }
            XferCode::Cancel => {
                check_len(body, 2)?;
                (MsgXfer::Cancel(XferCancel { reason: body[0], recv_id: body[1] }), 2)
            }
            XferCode::Abort => {
                check_len(body, 2)?;
                (MsgXfer::Abort(XferAbort { reason: body[0], recv_id: body[1] }), 2)
            }
        };
        *self = msg;
        Ok(1 + n)
    }

    message_common!();
}
