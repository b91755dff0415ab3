//! Per-call state, phase controller, watchdogs, and the event loop.
//!
//! Each live telephony stream owns one [`CallState`] driven by a single
//! task: carrier frames, model events, timer fires and the 20 ms pacer
//! tick all arrive through one channel (plus the inline ticker), so no
//! two handlers ever run concurrently over the same call.

pub mod barge_in;
pub mod turn_gate;

use crate::audio::pacer::{OutboundBuffer, TickAction};
use crate::audio::{InboundClassifier, FRAME_MS};
use crate::booking;
use crate::config::Config;
use crate::control::{self, ControlBlock};
use crate::crm::{
    billable_minutes, BookAppointmentRequest, CallContext, CrmClient, OutcomeRequest, UsageRequest,
};
use crate::openai::events::{ClientEvent, ResponseParams, ServerEvent};
use crate::openai::{self, ModelIncoming, ModelLink};
use crate::script::{ScriptKey, ScriptSet, ScriptVars};
use crate::telephony::{StreamEvent, TelephonyOut};
use barge_in::{BargeInDecision, BargeInState};
use base64::Engine;
use rand::Rng;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Call lifecycle phase. `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    AwaitingGreetingReply,
    InCall,
    Ended,
}

/// Owned watchdog/delay timers. Fires carry a generation so a cleared
/// timer's late fire is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Human-pause delay before `response.create`.
    HumanPause,
    /// Filler-only transcript grace window.
    FillerGrace,
    /// Force-commit when the model misses the post-stop commit.
    PostStopCommit,
    /// Force-commit when `speech_stopped` never arrives.
    StuckSpeech,
    /// Drop a pending turn that never got a transcript.
    PendingTurnTtl,
    /// Pre-greeting `answeredBy` re-check.
    AnsweredByRefresh,
}

#[derive(Debug, Clone, Copy)]
pub struct TimerFire {
    pub kind: TimerKind,
    pub generation: u64,
}

/// Everything that can wake a call's event loop.
#[derive(Debug)]
pub enum CallEvent {
    Carrier(StreamEvent),
    CarrierClosed,
    Model(Box<ModelIncoming>),
    ModelClosed,
    Timer(TimerFire),
}

/// A committed user turn that could not be processed immediately.
#[derive(Debug, Clone)]
pub struct PendingCommittedTurn {
    pub best_transcript: String,
    pub audio_ms: u64,
    pub at: Instant,
    pub item_id: Option<String>,
}

#[derive(Debug, Default)]
pub(crate) struct ItemTranscript {
    partial: String,
    completed: Option<String>,
}

/// Registry entry for one live call.
pub struct CallHandle {
    pub cancel: CancellationToken,
    pub started_at: Instant,
}

/// Process-wide registry of live calls, keyed by stream id. Inserted and
/// removed only by the telephony session handler.
pub type CallRegistry = Arc<Mutex<HashMap<String, CallHandle>>>;

/// Inputs assembled by the telephony handler before the loop starts.
pub struct CallParams {
    pub stream_sid: String,
    pub call_sid: String,
    pub session_id: String,
    pub lead_id: String,
    pub context: CallContext,
    pub config: Arc<Config>,
    pub crm: CrmClient,
    pub model: ModelLink,
    pub carrier_tx: mpsc::UnboundedSender<TelephonyOut>,
    pub events_tx: mpsc::UnboundedSender<CallEvent>,
}

/// All mutable state for one call. Owned exclusively by its event loop.
pub struct CallState {
    // Identity.
    pub(crate) stream_sid: String,
    pub(crate) call_sid: String,
    pub(crate) session_id: String,
    pub(crate) lead_id: String,

    // Immutable after load.
    pub(crate) context: CallContext,
    pub(crate) vars: ScriptVars,
    pub(crate) script: ScriptSet,
    pub(crate) config: Arc<Config>,

    // Phase and flags.
    pub(crate) phase: Phase,
    pub(crate) waiting_for_response: bool,
    pub(crate) ai_speaking: bool,
    pub(crate) response_in_flight: bool,
    pub(crate) voicemail_skip_armed: bool,
    pub(crate) greeting_advance_pending: Option<usize>,
    pub(crate) greeting_audio_seen: bool,

    // Stepper cursor and turn scratchpad.
    pub(crate) step_index: usize,
    pub(crate) last_spoken_line: Option<(String, Instant)>,
    pub(crate) last_accepted_answer: Option<String>,
    pub(crate) last_exact_time_at: Option<Instant>,
    pub(crate) offered_pair: Option<(crate::script::ClockTime, crate::script::ClockTime)>,
    pub(crate) ladder_rung: usize,
    pub(crate) reprompt_rung: usize,
    pub(crate) discovery_count: u32,
    pub(crate) low_signal_count: u32,

    // Audio plane.
    pub(crate) outbound: OutboundBuffer,
    pub(crate) classifier: InboundClassifier,
    pub(crate) barge_in: BargeInState,

    // Timing anchors.
    pub(crate) call_started_at: Instant,
    pub(crate) ai_audio_started_at: Option<Instant>,
    pub(crate) last_ai_done_at: Option<Instant>,
    pub(crate) last_cancel_at: Option<Instant>,
    pub(crate) last_prompt_sent_at: Option<Instant>,
    pub(crate) last_response_create_at: Option<Instant>,
    pub(crate) last_listen_enabled_at: Option<Instant>,
    pub(crate) last_speech_started_at: Option<Instant>,
    pub(crate) last_speech_stopped_at: Option<Instant>,

    // Transcript bookkeeping.
    pub(crate) transcripts: HashMap<String, ItemTranscript>,
    pub(crate) recent_items: Vec<String>,
    pub(crate) last_transcript: String,
    pub(crate) committed_audio_ms: u64,

    pub(crate) pending_turn: Option<PendingCommittedTurn>,
    pub(crate) filler_turn: Option<PendingCommittedTurn>,
    pub(crate) pending_instructions: Option<String>,

    // Terminal bookkeeping.
    pub(crate) final_outcome_sent: bool,
    pub(crate) usage_reported: bool,
    pub(crate) answered_by_checks: u32,

    timer_generations: HashMap<TimerKind, u64>,

    pub(crate) model: ModelLink,
    pub(crate) carrier_tx: mpsc::UnboundedSender<TelephonyOut>,
    pub(crate) events_tx: mpsc::UnboundedSender<CallEvent>,
    pub(crate) crm: CrmClient,
}

impl CallState {
    pub fn new(params: CallParams) -> Self {
        let vars = ScriptVars {
            first_name: params.context.lead_first_name_or_default().to_owned(),
            agent_first_name: params.context.agent_first_name().to_owned(),
            assistant_name: params.context.voice.assistant_name.clone(),
        };
        let key = ScriptKey::parse(params.context.script_key.as_deref().unwrap_or_default());
        let script = ScriptSet::build(key, &vars);
        let barge_in = BargeInState::new(params.config.barge_in.clone());

        Self {
            stream_sid: params.stream_sid,
            call_sid: params.call_sid,
            session_id: params.session_id,
            lead_id: params.lead_id,
            context: params.context,
            vars,
            script,
            config: params.config,
            phase: Phase::Init,
            waiting_for_response: false,
            ai_speaking: false,
            response_in_flight: false,
            voicemail_skip_armed: false,
            greeting_advance_pending: None,
            greeting_audio_seen: false,
            step_index: 0,
            last_spoken_line: None,
            last_accepted_answer: None,
            last_exact_time_at: None,
            offered_pair: None,
            ladder_rung: 0,
            reprompt_rung: 0,
            discovery_count: 0,
            low_signal_count: 0,
            outbound: OutboundBuffer::new(),
            classifier: InboundClassifier::default(),
            barge_in,
            call_started_at: Instant::now(),
            ai_audio_started_at: None,
            last_ai_done_at: None,
            last_cancel_at: None,
            last_prompt_sent_at: None,
            last_response_create_at: None,
            last_listen_enabled_at: None,
            last_speech_started_at: None,
            last_speech_stopped_at: None,
            transcripts: HashMap::new(),
            recent_items: Vec::new(),
            last_transcript: String::new(),
            committed_audio_ms: 0,
            pending_turn: None,
            filler_turn: None,
            pending_instructions: None,
            final_outcome_sent: false,
            usage_reported: false,
            answered_by_checks: 0,
            timer_generations: HashMap::new(),
            model: params.model,
            carrier_tx: params.carrier_tx,
            events_tx: params.events_tx,
            crm: params.crm,
        }
    }

    // ── Canonical setters ───────────────────────────────────────────

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        if self.phase == phase || self.phase == Phase::Ended {
            return;
        }
        info!(
            call_sid = %self.call_sid,
            from = ?self.phase,
            to = ?phase,
            "phase transition"
        );
        self.phase = phase;
    }

    pub(crate) fn set_waiting_for_response(&mut self, value: bool) {
        if self.waiting_for_response != value {
            debug!(call_sid = %self.call_sid, value, "waiting_for_response");
            self.waiting_for_response = value;
        }
    }

    pub(crate) fn set_ai_speaking(&mut self, value: bool) {
        if self.ai_speaking != value {
            debug!(call_sid = %self.call_sid, value, "ai_speaking");
            self.ai_speaking = value;
        }
    }

    pub(crate) fn set_response_in_flight(&mut self, value: bool) {
        if self.response_in_flight != value {
            debug!(call_sid = %self.call_sid, value, "response_in_flight");
            self.response_in_flight = value;
        }
    }

    pub(crate) fn busy(&self) -> bool {
        self.response_in_flight || self.waiting_for_response || self.ai_speaking
    }

    // ── Timers ──────────────────────────────────────────────────────

    pub(crate) fn arm_timer(&mut self, kind: TimerKind, delay: Duration) {
        let generation = self.bump_timer(kind);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(CallEvent::Timer(TimerFire { kind, generation }));
        });
    }

    pub(crate) fn clear_timer(&mut self, kind: TimerKind) {
        let _ = self.bump_timer(kind);
    }

    fn bump_timer(&mut self, kind: TimerKind) -> u64 {
        let slot = self.timer_generations.entry(kind).or_insert(0);
        *slot += 1;
        *slot
    }

    fn timer_is_current(&self, fire: TimerFire) -> bool {
        self.timer_generations.get(&fire.kind).copied() == Some(fire.generation)
    }

    fn clear_all_timers(&mut self) {
        for kind in [
            TimerKind::HumanPause,
            TimerKind::FillerGrace,
            TimerKind::PostStopCommit,
            TimerKind::StuckSpeech,
            TimerKind::PendingTurnTtl,
            TimerKind::AnsweredByRefresh,
        ] {
            let _ = self.bump_timer(kind);
        }
    }

    // ── Transcripts ─────────────────────────────────────────────────

    fn touch_item(&mut self, item_id: &str) {
        self.recent_items.retain(|id| id != item_id);
        self.recent_items.push(item_id.to_owned());
    }

    pub(crate) fn note_transcript_delta(&mut self, item_id: &str, delta: &str) {
        self.touch_item(item_id);
        self.transcripts
            .entry(item_id.to_owned())
            .or_default()
            .partial
            .push_str(delta);
    }

    pub(crate) fn note_transcript_completed(&mut self, item_id: &str, transcript: &str) {
        self.touch_item(item_id);
        self.transcripts
            .entry(item_id.to_owned())
            .or_default()
            .completed = Some(transcript.to_owned());
        if !transcript.trim().is_empty() {
            self.last_transcript = transcript.to_owned();
        }
    }

    /// Best-known transcript: the committed item's completed text, then
    /// its partial, then the most recent completed/partial of any item,
    /// then the last-known scalar.
    pub(crate) fn best_transcript_for(&self, item_id: Option<&str>) -> String {
        if let Some(id) = item_id {
            if let Some(entry) = self.transcripts.get(id) {
                if let Some(completed) = &entry.completed {
                    if !completed.trim().is_empty() {
                        return completed.clone();
                    }
                }
                if !entry.partial.trim().is_empty() {
                    return entry.partial.clone();
                }
            }
        }
        for id in self.recent_items.iter().rev() {
            if let Some(entry) = self.transcripts.get(id) {
                if let Some(completed) = &entry.completed {
                    if !completed.trim().is_empty() {
                        return completed.clone();
                    }
                }
                if !entry.partial.trim().is_empty() {
                    return entry.partial.clone();
                }
            }
        }
        self.last_transcript.clone()
    }

    // ── Outbound helpers ────────────────────────────────────────────

    fn send_media(&self, frame: Vec<u8>) {
        let _ = self.carrier_tx.send(TelephonyOut::Media(frame));
    }

    pub(crate) fn model_append(&self, frame: &[u8]) {
        let audio = BASE64.encode(frame);
        if self
            .model
            .send(ClientEvent::InputAudioBufferAppend { audio })
            .is_err()
        {
            debug!(call_sid = %self.call_sid, "append after model close dropped");
        }
    }

    /// Queue a response: flags flip immediately, the `response.create`
    /// goes out after a short human pause.
    pub(crate) fn queue_response(&mut self, instructions: String, advance_after_audio: Option<usize>) {
        if self.response_in_flight {
            warn!(call_sid = %self.call_sid, "response already in flight, not queueing another");
            return;
        }
        self.set_waiting_for_response(true);
        self.set_ai_speaking(true);
        self.set_response_in_flight(true);
        self.outbound.begin_response();
        self.ai_audio_started_at = None;
        self.barge_in.reset_for_response();
        self.greeting_advance_pending = advance_after_audio;
        self.pending_instructions = Some(instructions);
        self.last_prompt_sent_at = Some(Instant::now());

        let pause = {
            let gate = &self.config.turn_gate;
            let mut rng = rand::thread_rng();
            rng.gen_range(gate.human_pause_min_ms..=gate.human_pause_max_ms)
        };
        self.arm_timer(TimerKind::HumanPause, Duration::from_millis(pause));
    }

    fn create_pending_response(&mut self) {
        let Some(instructions) = self.pending_instructions.take() else {
            return;
        };
        if self.phase == Phase::Ended || self.voicemail_skip_armed {
            return;
        }
        self.last_response_create_at = Some(Instant::now());
        let event = ClientEvent::ResponseCreate {
            response: ResponseParams {
                modalities: vec!["audio".to_owned(), "text".to_owned()],
                instructions,
                temperature: self.config.model.temperature,
            },
        };
        if self.model.send(event).is_err() {
            warn!(call_sid = %self.call_sid, "model link gone at response.create");
            self.reopen_listening();
        }
    }

    /// Abort bookkeeping after a failed or cancelled response: the caller
    /// must be able to speak again immediately.
    pub(crate) fn reopen_listening(&mut self) {
        self.outbound.cancel();
        self.set_ai_speaking(false);
        self.set_waiting_for_response(false);
        self.set_response_in_flight(false);
        self.last_listen_enabled_at = Some(Instant::now());
        self.try_replay_pending();
    }

    // ── Event dispatch ──────────────────────────────────────────────

    async fn handle_event(&mut self, event: CallEvent) -> ControlFlow<()> {
        match event {
            CallEvent::Carrier(stream_event) => self.on_carrier_event(stream_event).await,
            CallEvent::CarrierClosed => {
                self.finish("carrier socket closed").await;
                ControlFlow::Break(())
            }
            CallEvent::Model(incoming) => {
                self.on_model_event(*incoming).await;
                ControlFlow::Continue(())
            }
            CallEvent::ModelClosed => {
                if self.phase != Phase::Ended {
                    self.finish("model link closed").await;
                }
                ControlFlow::Continue(())
            }
            CallEvent::Timer(fire) => {
                self.on_timer(fire).await;
                ControlFlow::Continue(())
            }
        }
    }

    async fn on_carrier_event(&mut self, event: StreamEvent) -> ControlFlow<()> {
        match event {
            StreamEvent::Media { media, .. } => {
                self.on_media(&media.payload, media.track.as_deref());
                ControlFlow::Continue(())
            }
            StreamEvent::Stop { .. } => {
                self.finish("carrier stop").await;
                ControlFlow::Break(())
            }
            // `start` is consumed by the telephony handler; marks and
            // connected frames carry nothing for us.
            StreamEvent::Start { .. } | StreamEvent::Connected { .. } | StreamEvent::Mark { .. } => {
                ControlFlow::Continue(())
            }
        }
    }

    fn on_media(&mut self, payload: &str, track: Option<&str>) {
        if track == Some("outbound") {
            return;
        }
        if self.phase == Phase::Ended || self.voicemail_skip_armed {
            return;
        }
        let frame = match BASE64.decode(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(call_sid = %self.call_sid, error = %e, "undecodable media frame dropped");
                return;
            }
        };

        let silence = self.classifier.is_silence(&frame);
        if !silence {
            self.committed_audio_ms += FRAME_MS;
        }

        if !silence && self.ai_speaking && self.response_in_flight && !self.outbound.is_done() {
            let decision = self.barge_in.on_voiced_frame(
                &frame,
                FRAME_MS,
                Instant::now(),
                self.ai_audio_started_at,
                self.last_ai_done_at,
            );
            if decision == BargeInDecision::FireCancel {
                self.do_cancel();
                // The triggering frame sits in the replay ring.
                return;
            }
        }

        // Nothing is forwarded before the session is configured.
        if self.phase == Phase::Init {
            return;
        }

        if self.barge_in.replay_pending() {
            for buffered in self.barge_in.take_replay() {
                self.model_append(&buffered);
            }
        }
        self.model_append(&frame);
    }

    /// Cancel the in-flight response. Atomic from the call's view:
    /// model-side cancel+clear, local buffer drop, flags reopened.
    pub(crate) fn do_cancel(&mut self) {
        info!(call_sid = %self.call_sid, "barge-in cancel");
        let _ = self.model.send(ClientEvent::ResponseCancel);
        let _ = self.model.send(ClientEvent::InputAudioBufferClear);
        self.outbound.cancel();
        self.set_ai_speaking(false);
        self.set_waiting_for_response(false);
        self.set_response_in_flight(false);
        self.last_cancel_at = Some(Instant::now());
        self.pending_instructions = None;
        self.clear_timer(TimerKind::HumanPause);
    }

    async fn on_model_event(&mut self, incoming: ModelIncoming) {
        if let Some(block) = control::extract_control(&incoming.raw) {
            self.dispatch_control(block).await;
        }

        match incoming.event {
            ServerEvent::SessionCreated => {}
            ServerEvent::SessionUpdated => self.on_session_ready().await,
            ServerEvent::SpeechStarted { .. } => {
                self.last_speech_started_at = Some(Instant::now());
                let stuck = self.config.turn_gate.stuck_speech_ms;
                self.arm_timer(TimerKind::StuckSpeech, Duration::from_millis(stuck));
            }
            ServerEvent::SpeechStopped { .. } => {
                self.last_speech_stopped_at = Some(Instant::now());
                self.clear_timer(TimerKind::StuckSpeech);
                let post_stop = self.config.turn_gate.post_stop_commit_ms;
                self.arm_timer(TimerKind::PostStopCommit, Duration::from_millis(post_stop));
            }
            ServerEvent::Committed { item_id } => {
                self.clear_timer(TimerKind::PostStopCommit);
                self.clear_timer(TimerKind::StuckSpeech);
                self.on_committed(item_id.as_deref());
            }
            ServerEvent::TranscriptionDelta { item_id, delta } => {
                self.note_transcript_delta(&item_id, &delta);
                self.refresh_pending_transcript();
            }
            ServerEvent::TranscriptionCompleted { item_id, transcript } => {
                self.note_transcript_completed(&item_id, &transcript);
                self.refresh_pending_transcript();
            }
            ServerEvent::TranscriptionFailed { item_id } => {
                debug!(call_sid = %self.call_sid, ?item_id, "transcription failed");
            }
            ServerEvent::AudioDelta { delta, .. } => self.on_audio_delta(&delta),
            ServerEvent::AudioDone { .. } => self.on_response_finished("audio done"),
            ServerEvent::ResponseDone { response } => {
                let cancelled =
                    response.get("status").and_then(serde_json::Value::as_str) == Some("cancelled");
                if cancelled {
                    self.reopen_listening();
                    self.last_ai_done_at = Some(Instant::now());
                } else {
                    self.on_response_finished("response done");
                }
            }
            ServerEvent::ResponseCancelled | ServerEvent::ResponseInterrupted => {
                self.reopen_listening();
                self.last_ai_done_at = Some(Instant::now());
            }
            ServerEvent::Error { error } => {
                warn!(call_sid = %self.call_sid, %error, "model protocol error");
                if self.response_in_flight {
                    self.reopen_listening();
                }
            }
            ServerEvent::Unknown => {
                debug!(call_sid = %self.call_sid, "unknown model event ignored");
            }
        }
    }

    async fn on_session_ready(&mut self) {
        if self.phase != Phase::Init {
            return;
        }
        self.set_phase(Phase::AwaitingGreetingReply);
        let _ = self.model.send(ClientEvent::InputAudioBufferClear);

        if let Some(answered_by) = self.context.answered_by.clone() {
            if control::is_machine(&answered_by) {
                self.on_voicemail().await;
                return;
            }
        }
        if self.context.answered_by.is_none() {
            self.arm_timer(TimerKind::AnsweredByRefresh, Duration::from_millis(150));
        }

        let greeting = crate::script::greeting_line(&self.vars);
        self.speak_line(greeting, None);
    }

    fn on_audio_delta(&mut self, delta: &str) {
        if self.voicemail_skip_armed {
            return;
        }
        let bytes = match BASE64.decode(delta) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(call_sid = %self.call_sid, error = %e, "undecodable audio delta dropped");
                return;
            }
        };
        let first_delta = self.ai_audio_started_at.is_none();
        self.outbound.append(&bytes);
        if first_delta {
            self.ai_audio_started_at = Some(Instant::now());
            self.greeting_audio_seen = true;
            if let Some(next_index) = self.greeting_advance_pending.take() {
                self.step_index = next_index.min(self.script.max_index());
                self.set_phase(Phase::InCall);
            }
        }
    }

    fn on_response_finished(&mut self, reason: &str) {
        debug!(call_sid = %self.call_sid, reason, "model response finished");
        self.outbound.mark_done();
        self.last_ai_done_at = Some(Instant::now());
        self.set_response_in_flight(false);
        self.set_waiting_for_response(false);
        // `ai_speaking` stays set until the pacer drains the tail.
        if self.outbound.is_empty() && !self.outbound.is_active() {
            // No audio ever arrived for this response; reopen right away.
            self.reopen_listening();
        }
    }

    pub(crate) fn on_pacer_tick(&mut self) {
        match self.outbound.plan_tick() {
            TickAction::Idle => {}
            TickAction::Frame(frame) => self.send_media(frame),
            TickAction::FinalFrame(frame) => {
                self.send_media(frame);
                self.on_drained();
            }
            TickAction::Drained => self.on_drained(),
        }
    }

    fn on_drained(&mut self) {
        let _ = self
            .carrier_tx
            .send(TelephonyOut::Mark("response-end".to_owned()));
        self.set_ai_speaking(false);
        self.last_listen_enabled_at = Some(Instant::now());
        self.try_replay_pending();
    }

    async fn on_timer(&mut self, fire: TimerFire) {
        if !self.timer_is_current(fire) || self.phase == Phase::Ended {
            return;
        }
        match fire.kind {
            TimerKind::HumanPause => self.create_pending_response(),
            TimerKind::FillerGrace => self.on_filler_grace(),
            TimerKind::PostStopCommit | TimerKind::StuckSpeech => {
                debug!(call_sid = %self.call_sid, kind = ?fire.kind, "force commit");
                let _ = self.model.send(ClientEvent::InputAudioBufferCommit);
            }
            TimerKind::PendingTurnTtl => {
                if let Some(pending) = &self.pending_turn {
                    if pending.best_transcript.trim().is_empty() {
                        debug!(call_sid = %self.call_sid, "pending turn expired without transcript");
                        self.pending_turn = None;
                    }
                }
            }
            TimerKind::AnsweredByRefresh => self.refresh_answered_by().await,
        }
    }

    async fn refresh_answered_by(&mut self) {
        if self.answered_by_checks >= 2 || self.greeting_audio_seen {
            return;
        }
        self.answered_by_checks += 1;
        let answered_by = self
            .crm
            .refresh_answered_by(&self.session_id, &self.lead_id, &self.call_sid)
            .await;
        if let Some(value) = answered_by {
            if control::is_machine(&value) {
                self.on_voicemail().await;
                return;
            }
            self.context.answered_by = Some(value);
        } else if self.answered_by_checks < 2 {
            self.arm_timer(TimerKind::AnsweredByRefresh, Duration::from_millis(150));
        }
    }

    async fn on_voicemail(&mut self) {
        info!(call_sid = %self.call_sid, "answering machine detected, suppressing output");
        self.voicemail_skip_armed = true;
        self.outbound.cancel();
        self.finish("voicemail").await;
    }

    // ── Control dispatch ────────────────────────────────────────────

    async fn dispatch_control(&mut self, block: ControlBlock) {
        match block {
            ControlBlock::BookAppointment {
                start_time,
                duration_minutes,
                lead_time_zone,
                agent_time_zone,
                notes,
            } => {
                let last_answer = self.last_accepted_answer.clone().unwrap_or_default();
                let exact_age = self.last_exact_time_at.map(|at| at.elapsed());
                if !booking::booking_eligible(&last_answer, exact_age) {
                    warn!(call_sid = %self.call_sid, "booking control without a concrete time, ignored");
                    return;
                }
                let Some(start) = booking::normalize_start_time(&start_time) else {
                    warn!(call_sid = %self.call_sid, "booking control with unusable start time, ignored");
                    return;
                };
                let lead_tz = booking::resolve_lead_tz(
                    self.context.lead_time_zone.as_deref(),
                    lead_time_zone.as_deref(),
                    self.context.agent_time_zone.as_deref(),
                );
                let agent_tz = booking::resolve_agent_tz(
                    self.context.agent_time_zone.as_deref(),
                    agent_time_zone.as_deref(),
                );
                let request = BookAppointmentRequest {
                    ai_call_session_id: self.session_id.clone(),
                    lead_id: self.lead_id.clone(),
                    start_time_utc: start.to_rfc3339(),
                    duration_minutes: duration_minutes.unwrap_or(30),
                    lead_time_zone: lead_tz.name().to_owned(),
                    agent_time_zone: agent_tz.name().to_owned(),
                    notes: notes.unwrap_or_default(),
                    source: "ai-dialer".to_owned(),
                };
                if let Err(e) = self.crm.book_appointment(&request).await {
                    warn!(call_sid = %self.call_sid, error = %e, "booking POST failed");
                }
            }
            ControlBlock::FinalOutcome { outcome } => {
                if self.final_outcome_sent {
                    return;
                }
                self.final_outcome_sent = true;
                let request = OutcomeRequest {
                    ai_call_session_id: self.session_id.clone(),
                    lead_id: self.lead_id.clone(),
                    call_sid: self.call_sid.clone(),
                    outcome,
                };
                self.crm.post_outcome(&request).await;
            }
        }
    }

    // ── Termination ─────────────────────────────────────────────────

    pub(crate) async fn finish(&mut self, reason: &str) {
        if self.phase == Phase::Ended {
            return;
        }
        info!(
            call_sid = %self.call_sid,
            stream_sid = %self.stream_sid,
            reason,
            "call ending"
        );
        debug!(
            call_sid = %self.call_sid,
            step_index = self.step_index,
            discovery = self.discovery_count,
            low_signal = self.low_signal_count,
            last_cancel = ?self.last_cancel_at.map(|t| t.elapsed()),
            last_prompt = ?self.last_prompt_sent_at.map(|t| t.elapsed()),
            last_create = ?self.last_response_create_at.map(|t| t.elapsed()),
            last_listen = ?self.last_listen_enabled_at.map(|t| t.elapsed()),
            "call summary"
        );
        self.set_phase(Phase::Ended);
        self.outbound.cancel();
        self.clear_all_timers();
        self.pending_turn = None;
        self.filler_turn = None;
        self.pending_instructions = None;
        self.model.close();
        self.report_usage();
    }

    fn report_usage(&mut self) {
        if self.usage_reported {
            return;
        }
        self.usage_reported = true;
        let minutes = billable_minutes(self.call_started_at.elapsed());
        let request = UsageRequest {
            ai_call_session_id: self.session_id.clone(),
            call_sid: self.call_sid.clone(),
            minutes,
            vendor_cost_usd: minutes as f64 * self.config.usage.vendor_cost_per_min_usd,
        };
        let crm = self.crm.clone();
        tokio::spawn(async move {
            crm.post_usage(&request).await;
        });
    }
}

/// Drive one call to completion.
pub async fn run_call(
    mut state: CallState,
    mut events_rx: mpsc::UnboundedReceiver<CallEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(state.config.pacing.frame_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                state.finish("server shutdown").await;
                break;
            }
            _ = ticker.tick() => {
                if state.phase != Phase::Ended {
                    state.on_pacer_tick();
                }
            }
            event = events_rx.recv() => {
                let Some(event) = event else { break };
                if state.handle_event(event).await.is_break() {
                    break;
                }
            }
        }
    }
    info!(call_sid = %state.call_sid, "call loop exited");
}

/// Forward model events into the call's event channel.
pub fn spawn_model_forwarder(
    mut incoming: mpsc::UnboundedReceiver<ModelIncoming>,
    events_tx: mpsc::UnboundedSender<CallEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = incoming.recv().await {
            if events_tx.send(CallEvent::Model(Box::new(event))).is_err() {
                break;
            }
        }
        let _ = events_tx.send(CallEvent::ModelClosed);
    });
}

/// Build the system prompt and open the model link for a call context.
pub async fn connect_model_for(
    config: &Config,
    context: &CallContext,
) -> crate::error::Result<(ModelLink, mpsc::UnboundedReceiver<ModelIncoming>)> {
    let vars = ScriptVars {
        first_name: context.lead_first_name_or_default().to_owned(),
        agent_first_name: context.agent_first_name().to_owned(),
        assistant_name: context.voice.assistant_name.clone(),
    };
    let instructions = openai::system_instructions(&vars);
    openai::connect(&config.model, &context.voice.voice_id, instructions).await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::openai::Outbound;

    pub(crate) struct TestCall {
        pub state: CallState,
        pub model_rx: mpsc::UnboundedReceiver<Outbound>,
        pub carrier_rx: mpsc::UnboundedReceiver<TelephonyOut>,
        // Keeps timer sends alive.
        pub _events_rx: mpsc::UnboundedReceiver<CallEvent>,
    }

    pub(crate) fn test_call() -> TestCall {
        test_call_with_script("mortgage_protection")
    }

    pub(crate) fn test_call_with_script(script_key: &str) -> TestCall {
        let (model, model_rx) = crate::openai::test_link();
        let (carrier_tx, carrier_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let context = CallContext {
            agent_name: "Mike Rivera".to_owned(),
            lead_first_name: Some("Sam".to_owned()),
            lead_id: Some("lead-1".to_owned()),
            script_key: Some(script_key.to_owned()),
            ..CallContext::default()
        };
        let state = CallState::new(CallParams {
            stream_sid: "MZ1".to_owned(),
            call_sid: "CA1".to_owned(),
            session_id: "sess-1".to_owned(),
            lead_id: "lead-1".to_owned(),
            context,
            config: Arc::new(Config::default()),
            crm: CrmClient::new(&crate::config::CrmConfig::default()),
            model,
            carrier_tx,
            events_tx,
        });
        TestCall {
            state,
            model_rx,
            carrier_rx,
            _events_rx: events_rx,
        }
    }

    /// Put a call into the steady in-call listening state.
    pub(crate) fn in_call(test: &mut TestCall, step_index: usize) {
        test.state.phase = Phase::InCall;
        test.state.greeting_audio_seen = true;
        test.state.step_index = step_index;
        idle(test);
    }

    /// Clear the busy flags as a drained pacer would.
    pub(crate) fn idle(test: &mut TestCall) {
        test.state.waiting_for_response = false;
        test.state.ai_speaking = false;
        test.state.response_in_flight = false;
        test.state.outbound.cancel();
    }

    fn frame_b64(byte: u8) -> String {
        BASE64.encode(vec![byte; crate::audio::FRAME_BYTES])
    }

    #[tokio::test]
    async fn session_ready_queues_greeting() {
        let mut test = test_call();
        test.state.on_session_ready().await;
        assert_eq!(test.state.phase, Phase::AwaitingGreetingReply);
        assert!(test.state.busy());
        let instructions = test.state.pending_instructions.as_deref().unwrap();
        assert!(instructions.contains("Sam"));
    }

    #[tokio::test]
    async fn pre_greeting_commit_is_ignored() {
        let mut test = test_call();
        test.state.phase = Phase::AwaitingGreetingReply;
        test.state.on_committed(None);
        assert!(test.state.pending_turn.is_none());
        assert!(!test.state.busy());
    }

    #[tokio::test]
    async fn commit_while_busy_parks_single_pending_turn() {
        let mut test = test_call();
        in_call(&mut test, 1);
        test.state.response_in_flight = true;
        test.state.note_transcript_completed("item-1", "yes");
        test.state.committed_audio_ms = 500;
        test.state.on_committed(Some("item-1"));
        let pending = test.state.pending_turn.as_ref().unwrap();
        assert_eq!(pending.best_transcript, "yes");
        assert_eq!(pending.audio_ms, 500);

        // A second commit replaces, never duplicates.
        test.state.note_transcript_completed("item-2", "yes please");
        test.state.committed_audio_ms = 700;
        test.state.on_committed(Some("item-2"));
        assert_eq!(
            test.state.pending_turn.as_ref().unwrap().best_transcript,
            "yes please"
        );
    }

    #[tokio::test]
    async fn first_audio_delta_commits_deferred_greeting_advance() {
        let mut test = test_call();
        test.state.phase = Phase::AwaitingGreetingReply;
        test.state.outbound.begin_response();
        test.state.greeting_advance_pending = Some(1);
        test.state.on_audio_delta(&frame_b64(0x42));
        assert_eq!(test.state.step_index, 1);
        assert_eq!(test.state.phase, Phase::InCall);
        assert!(test.state.greeting_audio_seen);
        assert!(test.state.ai_audio_started_at.is_some());
        assert_eq!(test.state.outbound.len(), crate::audio::FRAME_BYTES);
    }

    #[tokio::test]
    async fn greeting_cursor_holds_without_audio() {
        let mut test = test_call();
        test.state.phase = Phase::AwaitingGreetingReply;
        test.state.greeting_advance_pending = Some(1);
        // No delta ever arrives; the cursor must not move.
        assert_eq!(test.state.step_index, 0);
        assert_eq!(test.state.phase, Phase::AwaitingGreetingReply);
    }

    #[tokio::test]
    async fn voicemail_suppresses_all_output() {
        let mut test = test_call();
        test.state.voicemail_skip_armed = true;
        test.state.outbound.begin_response();
        test.state.on_audio_delta(&frame_b64(0x42));
        assert!(test.state.outbound.is_empty());
        test.state.on_media(&frame_b64(0x80), None);
        assert_eq!(test.state.committed_audio_ms, 0);
        assert!(test.carrier_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn only_one_response_in_flight() {
        let mut test = test_call();
        in_call(&mut test, 1);
        test.state.queue_response("first".to_owned(), None);
        assert!(test.state.response_in_flight);
        test.state.queue_response("second".to_owned(), None);
        assert_eq!(test.state.pending_instructions.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn cancel_sends_cancel_then_clear_and_reopens() {
        let mut test = test_call();
        in_call(&mut test, 1);
        test.state.queue_response("line".to_owned(), None);
        test.state.do_cancel();
        assert!(matches!(
            test.model_rx.try_recv(),
            Ok(Outbound::Event(ClientEvent::ResponseCancel))
        ));
        assert!(matches!(
            test.model_rx.try_recv(),
            Ok(Outbound::Event(ClientEvent::InputAudioBufferClear))
        ));
        assert!(!test.state.busy());
        assert!(!test.state.outbound.is_active());
    }

    #[tokio::test]
    async fn outbound_track_frames_are_ignored() {
        let mut test = test_call();
        in_call(&mut test, 1);
        test.state.on_media(&frame_b64(0x80), Some("outbound"));
        assert_eq!(test.state.committed_audio_ms, 0);
        assert!(test.model_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn inbound_voice_accrues_audio_ms_and_forwards() {
        let mut test = test_call();
        in_call(&mut test, 1);
        test.state.on_media(&frame_b64(0x80), Some("inbound"));
        assert_eq!(test.state.committed_audio_ms, FRAME_MS);
        assert!(matches!(
            test.model_rx.try_recv(),
            Ok(Outbound::Event(ClientEvent::InputAudioBufferAppend { .. }))
        ));
    }

    #[tokio::test]
    async fn pre_ready_frames_are_not_forwarded() {
        let mut test = test_call();
        test.state.on_media(&frame_b64(0x80), None);
        assert!(test.model_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn pacer_tick_emits_exact_frames_in_order() {
        let mut test = test_call();
        in_call(&mut test, 1);
        test.state.outbound.begin_response();
        test.state.outbound.append(&[1u8; 200]);
        test.state.outbound.mark_done();
        test.state.on_pacer_tick();
        let first = match test.carrier_rx.try_recv().unwrap() {
            TelephonyOut::Media(frame) => frame,
            other => panic!("unexpected outbound: {other:?}"),
        };
        assert_eq!(first.len(), crate::audio::FRAME_BYTES);
        // Second tick pads the 40-byte tail and drains.
        test.state.on_pacer_tick();
        let second = match test.carrier_rx.try_recv().unwrap() {
            TelephonyOut::Media(frame) => frame,
            other => panic!("unexpected outbound: {other:?}"),
        };
        assert_eq!(second.len(), crate::audio::FRAME_BYTES);
        assert_eq!(second[40], crate::audio::ULAW_SILENCE);
        assert!(matches!(
            test.carrier_rx.try_recv(),
            Ok(TelephonyOut::Mark(_))
        ));
        assert!(!test.state.ai_speaking);
    }

    #[tokio::test]
    async fn finish_is_idempotent_and_reports_usage_once() {
        let mut test = test_call();
        in_call(&mut test, 1);
        test.state.finish("test").await;
        assert_eq!(test.state.phase, Phase::Ended);
        assert!(test.state.usage_reported);
        test.state.finish("again").await;
        assert_eq!(test.state.phase, Phase::Ended);
    }

    #[tokio::test]
    async fn best_transcript_prefers_completed_for_item() {
        let mut test = test_call();
        test.state.note_transcript_delta("a", "tom");
        test.state.note_transcript_delta("a", "orrow");
        assert_eq!(test.state.best_transcript_for(Some("a")), "tomorrow");
        test.state.note_transcript_completed("a", "tomorrow afternoon");
        assert_eq!(
            test.state.best_transcript_for(Some("a")),
            "tomorrow afternoon"
        );
        // Unknown item falls back to the most recent completed.
        assert_eq!(
            test.state.best_transcript_for(Some("zzz")),
            "tomorrow afternoon"
        );
        // Scalar fallback when nothing is mapped.
        test.state.transcripts.clear();
        test.state.recent_items.clear();
        test.state.last_transcript = "last resort".to_owned();
        assert_eq!(test.state.best_transcript_for(None), "last resort");
    }
}
