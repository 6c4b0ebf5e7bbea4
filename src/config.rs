use std::time::Duration;

use anyhow::bail;


/// Port used for discovery broadcasts when no explicit port is given.
pub const DEFAULT_PORT: u16 = 18590;

/// Largest number of concurrent transfers per direction; transfer ids are a single byte.
pub const MAX_XFER_STREAMS: usize = 256;

/// Bytes of a datagram carrying one transfer chunk, besides the chunk itself: packet header,
///  opcode, transfer code and the data message's fields.
pub const XFER_DATA_OVERHEAD: usize = 2 + 1 + 1 + 6;

#[derive(Clone, Debug)]
pub struct PortConfig {
    /// Interval of the resend loop. Every tick, each connection's queue is flushed: expired
    ///  packets are dropped, stale ones are resent, and due batched acks go out.
    pub resend_tick: Duration,
    /// Minimum time between two transmissions of the same reliable packet.
    pub resend_interval: Duration,
    /// Together with `resend_interval`, this determines the default lifetime of a reliable packet.
    pub resend_retries: u32,
    /// Upper bound for delaying the ack of a received reliable packet.
    pub ack_delay: Duration,
    /// Number of unacknowledged reliable packets that triggers an immediate ack.
    pub ack_batch: u32,

    pub recv_buffer_size: usize,
    pub discovery_port: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        PortConfig {
            resend_tick: Duration::from_millis(20),
            resend_interval: Duration::from_secs(1),
            resend_retries: 5,
            ack_delay: Duration::from_millis(100),
            ack_batch: 50,
            recv_buffer_size: 4096,
            discovery_port: DEFAULT_PORT,
        }
    }
}

impl PortConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.resend_tick.is_zero() {
            bail!("resend tick must be positive");
        }
        if self.resend_interval < self.resend_tick {
            bail!("resend interval {:?} is shorter than the resend tick {:?}", self.resend_interval, self.resend_tick);
        }
        if self.ack_batch == 0 {
            bail!("ack batch size must be positive");
        }
        if self.recv_buffer_size < 2 {
            bail!("receive buffer cannot hold a packet header");
        }
        Ok(())
    }

    /// Lifetime of a reliable packet that was queued without an explicit deadline or timeout.
    pub fn default_timeout(&self) -> Duration {
        self.resend_interval * self.resend_retries + self.resend_tick
    }
}


#[derive(Clone, Debug)]
pub struct XferConfig {
    /// Size of the transfer pool per direction, clamped to `1..=MAX_XFER_STREAMS`.
    pub streams: usize,
    /// Must leave room for [XFER_DATA_OVERHEAD] in the receiving port's buffer, see
    ///  [XferConfig::validate_for].
    pub chunk_size: usize,
    pub retry_interval: Duration,
    /// A chunk that was sent this many times without being acked fails the whole transfer.
    pub max_retries: u32,
    /// Number of pending chunks considered per transfer and update.
    pub window: usize,
    /// Receiving transfers without activity for this long are aborted.
    pub recv_timeout: Duration,
    /// Outgoing transfers that were not accepted within this time are aborted.
    pub accept_timeout: Duration,
}

impl Default for XferConfig {
    fn default() -> Self {
        XferConfig {
            streams: 16,
            chunk_size: 512,
            retry_interval: Duration::from_secs(1),
            max_retries: 20,
            window: 2,
            recv_timeout: Duration::from_secs(30),
            accept_timeout: Duration::from_secs(30),
        }
    }
}

impl XferConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size == 0 || self.chunk_size > u16::MAX as usize {
            bail!("chunk size must be in 1..={}", u16::MAX);
        }
        if self.window == 0 {
            bail!("window must be positive");
        }
        Ok(())
    }

    /// Like [XferConfig::validate], and additionally checks that a chunk fits into a datagram
    ///  received by a port with the given config.
    pub fn validate_for(&self, port: &PortConfig) -> anyhow::Result<()> {
        self.validate()?;
        let max_chunk = port.recv_buffer_size.saturating_sub(XFER_DATA_OVERHEAD);
        if self.chunk_size > max_chunk {
            bail!("chunk size {} does not fit into a receive buffer of {} bytes, the maximum is {}", self.chunk_size, port.recv_buffer_size, max_chunk);
        }
        Ok(())
    }

    pub fn effective_streams(&self) -> usize {
        self.streams.clamp(1, MAX_XFER_STREAMS)
    }

    /// Largest transfer that fits, given that chunk numbers are 16 bit and start at 1.
    pub fn max_size(&self) -> usize {
        self.chunk_size * u16::MAX as usize
    }
}
