//! Barge-in: cancel the assistant when the caller talks over it.
//!
//! Runs only while the assistant is audibly speaking. Sustained caller
//! speech past the cooldown fires a cancel; the most recent inbound
//! frames are kept in a small ring so the caller's first words survive
//! the round trip and can be replayed to the model after the cancel.

use crate::config::BargeInConfig;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Outcome of feeding one inbound frame while the assistant speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BargeInDecision {
    /// Keep listening.
    Hold,
    /// Cancel the in-flight response now.
    FireCancel,
}

/// Per-call barge-in accumulator and replay ring.
#[derive(Debug)]
pub struct BargeInState {
    config: BargeInConfig,
    sustained_ms: u64,
    ring: VecDeque<Vec<u8>>,
    pending_replay: bool,
    last_fire_at: Option<Instant>,
}

impl BargeInState {
    pub fn new(config: BargeInConfig) -> Self {
        Self {
            ring: VecDeque::with_capacity(config.ring_slots),
            config,
            sustained_ms: 0,
            pending_replay: false,
            last_fire_at: None,
        }
    }

    /// Reset the speech accumulator for a new assistant response.
    pub fn reset_for_response(&mut self) {
        self.sustained_ms = 0;
        self.ring.clear();
    }

    /// Feed one non-silence inbound frame observed while the assistant is
    /// speaking. `frame_ms` is the frame duration.
    pub fn on_voiced_frame(
        &mut self,
        frame: &[u8],
        frame_ms: u64,
        now: Instant,
        ai_audio_started_at: Option<Instant>,
        last_ai_done_at: Option<Instant>,
    ) -> BargeInDecision {
        self.sustained_ms = (self.sustained_ms + frame_ms).min(self.config.sustained_speech_cap_ms);

        if self.ring.len() == self.config.ring_slots {
            let _ = self.ring.pop_front();
        }
        self.ring.push_back(frame.to_vec());

        let Some(audio_start) = ai_audio_started_at else {
            return BargeInDecision::Hold;
        };

        // A late done beats any cancel: the response already finished.
        if let Some(done) = last_ai_done_at {
            if done >= audio_start {
                return BargeInDecision::Hold;
            }
        }

        let cooldown = Duration::from_millis(self.config.cooldown_from_audio_start_ms);
        if now.duration_since(audio_start) < cooldown {
            return BargeInDecision::Hold;
        }

        if self.sustained_ms < self.config.sustained_speech_ms {
            return BargeInDecision::Hold;
        }

        let throttle = Duration::from_millis(self.config.cancel_throttle_ms);
        if let Some(last) = self.last_fire_at {
            if now.duration_since(last) < throttle {
                return BargeInDecision::Hold;
            }
        }

        self.last_fire_at = Some(now);
        self.sustained_ms = 0;
        self.pending_replay = true;
        BargeInDecision::FireCancel
    }

    /// Frames captured before the cancel, oldest first. Emptied on call;
    /// clears the replay flag.
    pub fn take_replay(&mut self) -> Vec<Vec<u8>> {
        self.pending_replay = false;
        self.ring.drain(..).collect()
    }

    /// A cancel fired and its ring has not been flushed yet.
    pub fn replay_pending(&self) -> bool {
        self.pending_replay
    }
}
