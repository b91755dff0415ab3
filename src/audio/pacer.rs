//! Outbound pacing: a μ-law ring buffer drained in strict 20 ms frames.
//!
//! The per-call loop ticks every 20 ms and asks the buffer what to emit.
//! While a response is active the carrier sees exactly one 160-byte frame
//! per tick: partial tails are padded, gaps are filled with silence, and
//! the buffer reports drain once the model is done and the bytes are out.

use super::{FRAME_BYTES, ULAW_SILENCE};
use std::collections::VecDeque;

/// What the pacer does on one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickAction {
    /// Pacer not running; keep cadence silently.
    Idle,
    /// Emit one full frame.
    Frame(Vec<u8>),
    /// Emit one final (padded) frame, then the response is drained.
    FinalFrame(Vec<u8>),
    /// Response drained with nothing left to emit.
    Drained,
}

/// μ-law bytes queued for the carrier, plus the end-of-stream flag.
#[derive(Debug, Default)]
pub struct OutboundBuffer {
    data: VecDeque<u8>,
    model_done: bool,
    active: bool,
}

impl OutboundBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the buffer for a new response. Clears any stale bytes.
    pub fn begin_response(&mut self) {
        self.data.clear();
        self.model_done = false;
        self.active = true;
    }

    /// Append model audio bytes.
    pub fn append(&mut self, bytes: &[u8]) {
        if self.active {
            self.data.extend(bytes);
        }
    }

    /// The model signalled end-of-stream for the current response.
    pub fn mark_done(&mut self) {
        self.model_done = true;
    }

    /// Cancel: drop everything and stop pacing immediately.
    pub fn cancel(&mut self) {
        self.data.clear();
        self.model_done = true;
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_done(&self) -> bool {
        self.model_done
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Decide the action for one 20 ms tick.
    pub fn plan_tick(&mut self) -> TickAction {
        if !self.active {
            return TickAction::Idle;
        }

        if self.data.len() >= FRAME_BYTES {
            return TickAction::Frame(self.take(FRAME_BYTES));
        }

        if self.model_done {
            if self.data.is_empty() {
                self.active = false;
                return TickAction::Drained;
            }
            let mut frame = self.take(self.data.len());
            frame.resize(FRAME_BYTES, ULAW_SILENCE);
            self.active = false;
            return TickAction::FinalFrame(frame);
        }

        if !self.data.is_empty() {
            let mut frame = self.take(self.data.len());
            frame.resize(FRAME_BYTES, ULAW_SILENCE);
            return TickAction::Frame(frame);
        }

        // Mid-response underrun: hold cadence with silence.
        TickAction::Frame(vec![ULAW_SILENCE; FRAME_BYTES])
    }

    fn take(&mut self, n: usize) -> Vec<u8> {
        self.data.drain(..n).collect()
    }
}
