//! Queue transport seam. The broker itself (delivery, partitioning, offsets)
//! is an external collaborator behind the [MessageSource] and [MessageSink]
//! traits; the engine only sees byte payloads. [QueueAdapter] sits between a
//! source and a queue spout: it buffers decoded records FIFO and throttles
//! upstream consumption with high/low-watermark hysteresis.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use crate::Result;
use crate::config::WatermarkSpec;

pub mod inmem;

/// Pull side of a queue client. `fetch` is a non-blocking batch poll: an
/// empty vec means nothing is pending right now. `pause`/`resume` control
/// the client's own intake (e.g. a consumer group); clients without that
/// notion keep the no-op defaults, since a paused adapter stops fetching
/// anyway.
#[async_trait]
pub trait MessageSource: Send {
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn fetch(&mut self) -> Result<Vec<Bytes>>;

    async fn pause(&mut self) -> Result<()> {
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Push side of a queue client.
#[async_trait]
pub trait MessageSink: Send {
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn publish(&mut self, payload: Bytes) -> Result<()>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// FIFO buffer over a [MessageSource] with pause/resume hysteresis.
///
/// Intake stops once the buffer reaches `high_water` (the source is paused
/// and the adapter enters the clearing state); it resumes only after `next`
/// drains the buffer to `low_water`, so a consumer hovering around the
/// threshold does not flap the source on and off.
pub struct QueueAdapter {
    source: Box<dyn MessageSource>,
    buffer: VecDeque<Value>,
    high_water: usize,
    low_water: usize,
    high_water_clearing: bool,
    enabled: bool,
}

impl QueueAdapter {
    pub fn new(source: Box<dyn MessageSource>, watermarks: WatermarkSpec) -> Self {
        Self {
            source,
            buffer: VecDeque::new(),
            high_water: watermarks.high_water,
            low_water: watermarks.low_water,
            high_water_clearing: false,
            enabled: true,
        }
    }

    /// Connection failures here are startup failures for the owning spout;
    /// the lifecycle manager escalates them, they are never swallowed.
    pub async fn connect(&mut self) -> Result<()> {
        self.source.connect().await
    }

    /// Resume intake. Deferred while the adapter is clearing a high-water
    /// episode; `next` performs the actual resume once the buffer drains to
    /// the low watermark.
    pub async fn enable(&mut self) -> Result<()> {
        if !self.enabled {
            if !self.high_water_clearing {
                self.source.resume().await?;
            }
            self.enabled = true;
        }
        Ok(())
    }

    /// Pause intake.
    pub async fn disable(&mut self) -> Result<()> {
        if self.enabled {
            if !self.high_water_clearing {
                self.source.pause().await?;
            }
            self.enabled = false;
        }
        Ok(())
    }

    /// Poll the source once and buffer what it delivered. A no-op while the
    /// adapter is disabled or clearing. Returns the number of records
    /// accepted into the buffer.
    pub async fn intake(&mut self) -> Result<usize> {
        if !self.enabled || self.high_water_clearing {
            return Ok(0);
        }
        let batch = self.source.fetch().await?;
        let mut accepted = 0;
        for payload in batch {
            if self.push(payload).await? {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    /// Buffer one raw payload. Empty and malformed payloads are dropped
    /// before they enter the graph. Returns whether the record was accepted.
    pub async fn push(&mut self, payload: Bytes) -> Result<bool> {
        if payload.is_empty() {
            debug!("dropping empty payload");
            return Ok(false);
        }
        let value: Value = match serde_json::from_slice(&payload) {
            Ok(value) => value,
            Err(e) => {
                debug!(err = %e, "dropping malformed payload");
                return Ok(false);
            }
        };
        self.buffer.push_back(value);
        if self.buffer.len() >= self.high_water {
            self.high_water_clearing = true;
            self.source.pause().await?;
        }
        Ok(true)
    }

    /// Pop the oldest buffered record. Returns `None` while disabled or
    /// empty. Draining to the low watermark ends a clearing episode and
    /// resumes the source.
    pub async fn next(&mut self) -> Result<Option<Value>> {
        if !self.enabled {
            return Ok(None);
        }
        let Some(value) = self.buffer.pop_front() else {
            return Ok(None);
        };
        if self.high_water_clearing && self.buffer.len() <= self.low_water {
            self.high_water_clearing = false;
            self.source.resume().await?;
        }
        Ok(Some(value))
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_clearing(&self) -> bool {
        self.high_water_clearing
    }

    pub async fn close(&mut self) -> Result<()> {
        self.source.close().await
    }
}
