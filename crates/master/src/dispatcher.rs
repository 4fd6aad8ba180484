//! Frame dispatch into the shared ingestion queue.
//!
//! All sessions feed one bounded queue drained by the training loop. Frames
//! are tagged with their client id so the consumer can rebuild per-client
//! order. A full queue is never waited on past `enqueue_wait`; the caller gets
//! `Dispatch::Saturated` back and answers the worker with WAIT.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError};
use tracing::debug;
use vecfarm_array::Array;
use vecfarm_wire::{ClientId, Nonce, ResponseCode};

use crate::error::{MasterError, Result};

/// Validated observation frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub observation: Array,
    pub reward: f64,
    pub done: bool,
    /// Opaque auxiliary bytes.
    pub info: Vec<u8>,
    pub nonce: Nonce,
}

impl TryFrom<vecfarm_wire::Frame> for Frame {
    type Error = MasterError;

    fn try_from(frame: vecfarm_wire::Frame) -> Result<Self> {
        let observation = frame.observation.ok_or(MasterError::MissingObservation)?;
        Ok(Self {
            observation: Array::try_from(observation)?,
            reward: frame.reward,
            done: frame.done,
            info: frame.info,
            nonce: frame.nonce,
        })
    }
}

/// Outcome of handing a frame to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Enqueued; `depth` is the queue length right after.
    Accepted { depth: usize },
    /// Queue full; the frame was not consumed.
    Saturated,
}

/// Choose between OK and OK_ENCOURAGE for an accepted request.
///
/// Encouragement is only given while the queue holds fewer than `watermark`
/// frames and the session trails the most advanced streaming session.
pub fn admission_code(depth: usize, watermark: usize, lagging: bool) -> ResponseCode {
    if lagging && depth < watermark {
        ResponseCode::OkEncourage
    } else {
        ResponseCode::Ok
    }
}

/// Producer side of the ingestion queue.
pub struct FrameDispatcher {
    tx: Sender<(ClientId, Frame)>,
    rx: Receiver<(ClientId, Frame)>,
    enqueue_wait: Duration,
    encourage_watermark: usize,
}

impl FrameDispatcher {
    /// Create a dispatcher over a queue of `capacity` frames.
    pub fn new(capacity: usize, enqueue_wait: Duration, encourage_watermark: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self {
            tx,
            rx,
            enqueue_wait,
            encourage_watermark,
        }
    }

    /// Forward a validated frame.
    pub fn dispatch(&self, client_id: ClientId, frame: Frame) -> Result<Dispatch> {
        let nonce = frame.nonce;
        match self.tx.send_timeout((client_id, frame), self.enqueue_wait) {
            Ok(()) => Ok(Dispatch::Accepted { depth: self.len() }),
            Err(SendTimeoutError::Timeout(_)) => {
                debug!(client_id, nonce, "ingestion queue saturated");
                Ok(Dispatch::Saturated)
            }
            Err(SendTimeoutError::Disconnected(_)) => Err(MasterError::QueueClosed),
        }
    }

    /// Non-blocking pop.
    pub fn pop(&self) -> Option<(ClientId, Frame)> {
        self.rx.try_recv().ok()
    }

    /// Consumer handle for the training loop.
    pub fn queue(&self) -> IngestionQueue {
        IngestionQueue {
            rx: self.rx.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn is_saturated(&self) -> bool {
        self.tx.is_full()
    }

    /// OK / OK_ENCOURAGE for a session at `last_nonce` while the most
    /// advanced streaming session is at `leading_nonce`.
    pub fn admission_for(&self, last_nonce: Nonce, leading_nonce: Nonce) -> ResponseCode {
        admission_code(self.len(), self.encourage_watermark, last_nonce < leading_nonce)
    }
}

/// Consumer side of the ingestion queue.
#[derive(Clone)]
pub struct IngestionQueue {
    rx: Receiver<(ClientId, Frame)>,
}

impl IngestionQueue {
    /// Non-blocking pop; `None` when empty.
    pub fn pop(&self) -> Option<(ClientId, Frame)> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Pop, waiting up to `timeout` for a frame to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<(ClientId, Frame)> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Drain up to `max` frames without waiting.
    pub fn drain(&self, max: usize) -> Vec<(ClientId, Frame)> {
        self.rx.try_iter().take(max).collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
