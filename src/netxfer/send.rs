use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::config::XferConfig;
use crate::netxfer::{Chunk, Data, MsgXfer, RecvId, SendId, XferAbort, XferAccept, XferAck, XferCancel, XferConn, XferData, XferDone, XferError, XferStart};


pub type DoneFn = Box<dyn FnOnce() + Send>;
pub type AbortFn = Box<dyn FnOnce(XferError) + Send>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum SendState {
    Started,
    Accepted,
}

struct SendChunk {
    index: Chunk,
    data: Bytes,
    last_sent: Option<Duration>,
    retries: u32,
}

struct Transfer<C> {
    conn: C,
    id: SendId,
    recv_id: RecvId,
    state: SendState,
    /// timestamp of the first update after the start, for the accept timeout
    started: Option<Duration>,
    /// chunks not acked yet, in order
    pending: VecDeque<SendChunk>,
    on_done: Option<DoneFn>,
    on_abort: Option<AbortFn>,
}

impl <C: XferConn> Transfer<C> {
    fn done(mut self) {
        debug!("transfer {} done", self.id);
        if let Some(on_done) = self.on_done.take() {
            on_done();
        }
    }

    fn abort(mut self, reason: XferError) {
        debug!("transfer {} aborted: {}", self.id, reason);
        if let Some(on_abort) = self.on_abort.take() {
            on_abort(reason);
        }
    }

    /// Ends the transfer from this side. The receiver only knows about it once it accepted.
    async fn cancel(self, reason: XferError) {
        if self.state == SendState::Accepted {
            let msg = MsgXfer::Cancel(XferCancel { reason: reason.reason_code(), recv_id: self.recv_id });
            if let Err(e) = self.conn.send_reliable_msg(&msg).await {
                debug!("error sending cancel for transfer {}: {}", self.id, e);
            }
        }
        self.abort(reason);
    }

    /// Sends the first `window` pending chunks if they were never sent or are due for a retry.
    async fn send_window(&mut self, ts: Duration, config: &XferConfig) -> Result<(), XferError> {
        for chunk in self.pending.iter_mut().take(config.window) {
            match chunk.last_sent {
                None => {}
                Some(last) if ts > last + config.retry_interval => {
                    if chunk.retries >= config.max_retries {
                        warn!("transfer {}: chunk {} was not acked after {} retries", self.id, chunk.index, chunk.retries);
                        return Err(XferError::SendTimeout);
                    }
                    chunk.retries += 1;
                    trace!("transfer {}: resending chunk {}", self.id, chunk.index);
                }
                Some(_) => continue,
            }
            chunk.last_sent = Some(ts);

            let msg = MsgXfer::Data(XferData {
                token: 0,
                recv_id: self.recv_id,
                chunk: chunk.index,
                data: chunk.data.clone(),
            });
            if let Err(e) = self.conn.send_unreliable_msg(&msg).await {
                debug!("transfer {}: error sending chunk {}: {}", self.id, chunk.index, e);
            }
        }
        Ok(())
    }
}


/// Outgoing transfers. Transfer ids are slot indexes, so an id is never reused while its
///  transfer is still running.
pub struct Sender<C: XferConn> {
    config: XferConfig,
    slots: Vec<Option<Transfer<C>>>,
    active: usize,
}

impl <C: XferConn> Sender<C> {
    pub fn new(config: &XferConfig) -> Sender<C> {
        Sender {
            config: config.clone(),
            slots: (0..config.effective_streams()).map(|_| None).collect(),
            active: 0,
        }
    }

    /// Drops all transfers without calling their callbacks.
    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.active = 0;
    }

    /// Number of running transfers.
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

    fn find_accepted(&self, conn: &C, recv_id: RecvId) -> Option<usize> {
        self.slots.iter().position(|s| match s {
            Some(t) => t.state == SendState::Accepted && t.recv_id == recv_id && t.conn == *conn,
            None => false,
        })
    }

    /// Splits `data` into chunks, occupies a slot and announces the transfer to `conn`. Exactly
    ///  one of the callbacks is called eventually, unless the sender is reset.
    pub async fn start_send(&mut self, conn: C, data: Data, on_done: Option<DoneFn>, on_abort: Option<AbortFn>) -> Result<SendId, XferError> {
        let size = data.data.len();
        if size > self.config.max_size() || size > u32::MAX as usize {
            return Err(XferError::TooLarge);
        }
        let Some(index) = self.slots.iter().position(Option::is_none) else {
            warn!("cannot send {:?}: all {} transfer slots are in use", data.typ, self.slots.len());
            return Err(XferError::TooManyTransfers);
        };
        let id = index as SendId;

        let chunk_size = self.config.chunk_size;
        let bytes = Bytes::from(data.data);
        let pending = (0..size.div_ceil(chunk_size))
            .map(|i| SendChunk {
                index: (i + 1) as Chunk,
                data: bytes.slice(i * chunk_size..((i + 1) * chunk_size).min(size)),
                last_sent: None,
                retries: 0,
            })
            .collect::<VecDeque<_>>();

        debug!("starting transfer {} of {:?}: {} bytes in {} chunks", id, data.typ, size, pending.len());
        let start = MsgXfer::Start(XferStart {
            action: data.action,
            size: size as u32,
            typ: data.typ,
            send_id: id,
            ..Default::default()
        });
        if let Err(e) = conn.send_reliable_msg(&start).await {
            debug!("error starting transfer {}: {}", id, e);
        }

        self.slots[index] = Some(Transfer {
            conn,
            id,
            recv_id: 0,
            state: SendState::Started,
            started: None,
            pending,
            on_done,
            on_abort,
        });
        self.active += 1;
        Ok(id)
    }

    /// Like [Sender::start_send], with the outcome delivered through a channel.
    pub async fn start_send_awaitable(&mut self, conn: C, data: Data) -> Result<(SendId, oneshot::Receiver<Result<(), XferError>>), XferError> {
        let (tx, rx) = oneshot::channel();
        let on_done_tx = Arc::new(Mutex::new(Some(tx)));
        let on_abort_tx = on_done_tx.clone();

        let id = self.start_send(
            conn,
            data,
            Some(Box::new(move || finish(&on_done_tx, Ok(())))),
            Some(Box::new(move |reason| finish(&on_abort_tx, Err(reason)))),
        ).await?;
        Ok((id, rx))
    }

    pub fn handle_accept(&mut self, conn: &C, msg: &XferAccept) {
        let Some(t) = self.slots.get_mut(msg.send_id as usize).and_then(Option::as_mut) else {
            trace!("accept for unknown transfer {}", msg.send_id);
            return;
        };
        if t.state != SendState::Started || t.conn != *conn {
            trace!("ignoring accept for transfer {}", msg.send_id);
            return;
        }
        debug!("transfer {} accepted as {}", t.id, msg.recv_id);
        t.recv_id = msg.recv_id;
        t.state = SendState::Accepted;
    }

    pub fn handle_ack(&mut self, conn: &C, msg: &XferAck) {
        let Some(index) = self.find_accepted(conn, msg.recv_id) else {
            return;
        };
        if let Some(t) = self.slots[index].as_mut() {
            t.pending.retain(|c| c.index != msg.chunk);
        }
    }

    pub fn handle_done(&mut self, conn: &C, msg: &XferDone) {
        let Some(index) = self.find_accepted(conn, msg.recv_id) else {
            return;
        };
        if let Some(t) = self.take(index) {
            t.done();
        }
    }

    /// The receiver gave up. Before accepting, a receiver without free slots refers to the
    ///  transfer by our own id.
    pub fn handle_abort(&mut self, conn: &C, msg: &XferAbort) {
        let index = self.find_accepted(conn, msg.recv_id).or_else(|| {
            match self.slots.get(msg.recv_id as usize) {
                Some(Some(t)) if t.state == SendState::Started && t.conn == *conn => Some(msg.recv_id as usize),
                _ => None,
            }
        });
        if let Some(t) = index.and_then(|i| self.take(i)) {
            t.abort(XferError::from_reason_code(msg.reason));
        }
    }

    pub async fn cancel(&mut self, id: SendId) {
        if let Some(t) = self.take(id as usize) {
            t.cancel(XferError::Closed).await;
        }
    }

    /// Cancels all transfers to `conn`, e.g. when the peer disconnects.
    pub async fn cancel_all(&mut self, conn: &C) {
        for index in 0..self.slots.len() {
            let matches = matches!(&self.slots[index], Some(t) if t.conn == *conn);
            if !matches {
                continue;
            }
            if let Some(t) = self.take(index) {
                t.cancel(XferError::Closed).await;
            }
        }
    }

    /// Sends due chunks and enforces the retry limit and the accept timeout.
    pub async fn update(&mut self, ts: Duration) {
        if self.active == 0 {
            return;
        }
        for index in 0..self.slots.len() {
            let Some(t) = self.slots[index].as_mut() else {
                continue;
            };
            match t.state {
                SendState::Started => {
                    let started = *t.started.get_or_insert(ts);
                    if ts > started + self.config.accept_timeout {
                        warn!("transfer {} was not accepted in time", t.id);
                        if let Some(t) = self.take(index) {
                            t.abort(XferError::SendTimeout);
                        }
                    }
                }
                SendState::Accepted => {
                    if let Err(reason) = t.send_window(ts, &self.config).await {
                        if let Some(t) = self.take(index) {
                            t.cancel(reason).await;
                        }
                    }
                }
            }
        }
    }
}

fn finish(tx: &Mutex<Option<oneshot::Sender<Result<(), XferError>>>>, result: Result<(), XferError>) {
    let tx = tx.lock()
        .unwrap_or_else(|e| e.into_inner())
        .take();
    if let Some(tx) = tx {
        let _ = tx.send(result);
    }
}
