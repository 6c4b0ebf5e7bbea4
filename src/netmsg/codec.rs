use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::BytesMut;

use crate::binenc::check_capacity;
use crate::netmsg::{Message, Op, Registry, Unknown};


/// Encoding context of one endpoint. Role-dependent opcodes resolve through `is_client`, and
///  nested messages are decoded against the same registry.
#[derive(Clone)]
pub struct CodecState {
    pub is_client: bool,
    registry: Arc<Registry>,
}

impl std::fmt::Debug for CodecState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecState")
            .field("is_client", &self.is_client)
            .finish()
    }
}

impl CodecState {
    pub fn new(registry: Arc<Registry>, is_client: bool) -> CodecState {
        CodecState {
            is_client,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Encoded size including the opcode byte.
    pub fn encode_size(&self, msg: &dyn Message) -> usize {
        match msg.as_complex() {
            Some(complex) => 1 + complex.encode_size_with(self),
            None => 1 + msg.encode_size(),
        }
    }

    pub fn encode(&self, buf: &mut [u8], msg: &dyn Message) -> anyhow::Result<usize> {
        check_capacity(buf, self.encode_size(msg))?;
        buf[0] = msg.net_op().0;
        let n = match msg.as_complex() {
            Some(complex) => complex.encode_with(self, &mut buf[1..])?,
            None => msg.encode(&mut buf[1..])?,
        };
        Ok(1 + n)
    }

    /// Appends the encoded message. On failure, `buf` is left as it was.
    pub fn append(&self, buf: &mut BytesMut, msg: &dyn Message) -> anyhow::Result<()> {
        let offs = buf.len();
        let size = self.encode_size(msg);
        buf.resize(offs + size, 0);
        match self.encode(&mut buf[offs..], msg) {
            Ok(n) => {
                buf.truncate(offs + n);
                Ok(())
            }
            Err(e) => {
                buf.truncate(offs);
                Err(e)
            }
        }
    }

    /// Decodes into a message of a known type, checking that the opcode matches.
    pub fn decode(&self, data: &[u8], msg: &mut dyn Message) -> anyhow::Result<usize> {
        if data.is_empty() {
            bail!("unexpected end of data");
        }
        let (got, expected) = (Op(data[0]), msg.net_op());
        if got != expected {
            bail!("expected message {:?}, got {:?}", expected, got);
        }

        let n = match msg.as_complex_mut() {
            Some(complex) => complex.decode_with(self, &data[1..])?,
            None => msg.decode(&data[1..])?,
        };
        Ok(1 + n)
    }

    /// Decodes the message at the start of `data` into whatever type is registered for its opcode,
    ///  returning it together with the number of bytes consumed.
    ///
    /// Unregistered opcodes become [Unknown]: with the registered or known payload length if the
    ///  data holds that many bytes, and with the whole rest of `data` otherwise.
    pub fn decode_next(&self, data: &[u8]) -> anyhow::Result<(Box<dyn Message>, usize)> {
        let op = Op(*data.first()
            .ok_or_else(|| anyhow!("unexpected end of data"))?);

        match self.registry.lookup(op, self.is_client) {
            Some((mut msg, _)) => {
                let n = match msg.as_complex_mut() {
                    Some(complex) => complex.decode_with(self, &data[1..])?,
                    None => msg.decode(&data[1..])?,
                };
                Ok((msg, 1 + n))
            }
            None => {
                let end = match self.registry.op_len(op) {
                    Some(n) if 1 + n <= data.len() => 1 + n,
                    _ => data.len(),
                };
                let unknown = Unknown {
                    op,
                    data: data[1..end].to_vec(),
                };
                Ok((Box::new(unknown), end))
            }
        }
    }
}
