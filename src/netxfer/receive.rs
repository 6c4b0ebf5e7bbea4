use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::config::XferConfig;
use crate::netxfer::{Chunk, Data, MsgXfer, RecvId, XferAbort, XferAccept, XferAck, XferCancel, XferConn, XferData, XferDone, XferError, XferStart};


/// Called with every completely received blob.
pub type ReceiveFn<C> = Box<dyn FnMut(&C, Data) + Send>;

struct Transfer<C> {
    conn: C,
    id: RecvId,
    action: u8,
    typ: String,
    buf: Vec<u8>,
    received: usize,
    next_chunk: Chunk,
    /// chunks that arrived ahead of `next_chunk`
    ahead: BTreeMap<Chunk, Bytes>,
    ahead_bytes: usize,
    last_update: Duration,
}

impl <C> Transfer<C> {
    fn append(&mut self, data: &[u8]) {
        let n = data.len().min(self.buf.len() - self.received);
        self.buf[self.received..self.received + n].copy_from_slice(&data[..n]);
        self.received += n;
        self.next_chunk = self.next_chunk.wrapping_add(1);
    }

    fn add_chunk(&mut self, chunk: Chunk, data: &Bytes) {
        if chunk == 0 || chunk < self.next_chunk {
            trace!("transfer {}: ignoring chunk {}", self.id, chunk);
            return;
        }
        if chunk > self.next_chunk {
            if self.ahead.contains_key(&chunk) {
                return;
            }
            // buffered data can never exceed what is still missing
            if self.received + self.ahead_bytes + data.len() > self.buf.len() {
                trace!("transfer {}: chunk {} exceeds the announced size", self.id, chunk);
                return;
            }
            self.ahead_bytes += data.len();
            self.ahead.insert(chunk, data.clone());
            return;
        }
        self.append(data);
        while let Some(data) = self.ahead.remove(&self.next_chunk) {
            self.ahead_bytes -= data.len();
            self.append(&data);
        }
    }

    fn is_complete(&self) -> bool {
        self.received >= self.buf.len()
    }
}


/// Incoming transfers.
pub struct Receiver<C: XferConn> {
    config: XferConfig,
    slots: Vec<Option<Transfer<C>>>,
    active: usize,
    on_receive: Option<ReceiveFn<C>>,
}

impl <C: XferConn> Receiver<C> {
    pub fn new(config: &XferConfig) -> Receiver<C> {
        Receiver {
            config: config.clone(),
            slots: (0..config.effective_streams()).map(|_| None).collect(),
            active: 0,
            on_receive: None,
        }
    }

    pub fn on_receive(&mut self, f: ReceiveFn<C>) {
        self.on_receive = Some(f);
    }

    /// Drops all transfers without notifying the senders.
    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.active = 0;
    }

    pub fn active(&self) -> usize {
        self.active
    }

    fn take(&mut self, index: usize) -> Option<Transfer<C>> {
        let t = self.slots.get_mut(index)?.take();
        if t.is_some() {
            self.active -= 1;
        }
        t
    }

    fn get_mut(&mut self, conn: &C, id: RecvId) -> Option<&mut Transfer<C>> {
        self.slots.get_mut(id as usize)?
            .as_mut()
            .filter(|t| t.conn == *conn)
    }

    async fn send(conn: &C, msg: MsgXfer) {
        if let Err(e) = conn.send_reliable_msg(&msg).await {
            debug!("error sending {:?}: {}", msg.code(), e);
        }
    }

    pub async fn handle_start(&mut self, conn: &C, ts: Duration, msg: &XferStart) {
        let size = msg.size as usize;
        let index = if size > self.config.max_size() {
            warn!("rejecting transfer of {:?}: {} bytes is too large", msg.typ, size);
            None
        }
        else {
            self.slots.iter().position(Option::is_none)
        };
        let Some(index) = index else {
            debug!("cannot accept transfer {} of {:?}", msg.send_id, msg.typ);
            // the sender does not know our id yet and looks it up by its own
            Self::send(conn, MsgXfer::Abort(XferAbort { reason: XferError::Closed.reason_code(), recv_id: msg.send_id })).await;
            return;
        };

        let id = index as RecvId;
        debug!("accepting transfer {} of {:?} ({} bytes) as {}", msg.send_id, msg.typ, size, id);
        self.slots[index] = Some(Transfer {
            conn: conn.clone(),
            id,
            action: msg.action,
            typ: msg.typ.clone(),
            buf: vec![0; size],
            received: 0,
            next_chunk: 1,
            ahead: BTreeMap::new(),
            ahead_bytes: 0,
            last_update: ts,
        });
        self.active += 1;

        Self::send(conn, MsgXfer::Accept(XferAccept { recv_id: id, send_id: msg.send_id })).await;
        if size == 0 {
            self.complete(index).await;
        }
    }

    /// Acks every chunk of a known transfer, including duplicates, so that a lost ack does not
    ///  stall the sender.
    pub async fn handle_data(&mut self, conn: &C, ts: Duration, msg: &XferData) {
        let Some(t) = self.get_mut(conn, msg.recv_id) else {
            trace!("data for unknown transfer {}", msg.recv_id);
            return;
        };
        t.last_update = ts;
        Self::send(conn, MsgXfer::Ack(XferAck { token: msg.token, recv_id: msg.recv_id, chunk: msg.chunk })).await;
        if msg.data.is_empty() {
            return;
        }

        t.add_chunk(msg.chunk, &msg.data);
        if t.is_complete() {
            self.complete(msg.recv_id as usize).await;
        }
    }

    pub fn handle_cancel(&mut self, conn: &C, msg: &XferCancel) {
        if self.get_mut(conn, msg.recv_id).is_none() {
            return;
        }
        if let Some(t) = self.take(msg.recv_id as usize) {
            debug!("transfer {} of {:?} canceled by sender: {}", t.id, t.typ, XferError::from_reason_code(msg.reason));
        }
    }

    /// Gives up on a transfer, notifying its sender.
    pub async fn cancel(&mut self, id: RecvId) {
        self.abort(id as usize, XferError::Closed).await;
    }

    /// Aborts transfers without activity for longer than the receive timeout.
    pub async fn update(&mut self, ts: Duration) {
        if self.active == 0 {
            return;
        }
        for index in 0..self.slots.len() {
            let expired = match &self.slots[index] {
                Some(t) => ts > t.last_update + self.config.recv_timeout,
                None => false,
            };
            if expired {
                self.abort(index, XferError::RecvTimeout).await;
            }
        }
    }

    async fn abort(&mut self, index: usize, reason: XferError) {
        let Some(t) = self.take(index) else {
            return;
        };
        warn!("aborting transfer {} of {:?}: {}", t.id, t.typ, reason);
        Self::send(&t.conn, MsgXfer::Abort(XferAbort { reason: reason.reason_code(), recv_id: t.id })).await;
    }

    async fn complete(&mut self, index: usize) {
        let Some(t) = self.take(index) else {
            return;
        };
        debug!("transfer {} of {:?} complete", t.id, t.typ);
        Self::send(&t.conn, MsgXfer::Done(XferDone { recv_id: t.id })).await;
        if let Some(on_receive) = self.on_receive.as_mut() {
            on_receive(&t.conn, Data {
                action: t.action,
                typ: t.typ,
                data: t.buf,
            });
        }
    }
}
