//! Turn gate: what to do with each committed user turn.
//!
//! The decision tree runs in a fixed order; the first matching branch
//! wins. A turn that cannot be processed is parked as the single pending
//! turn and replayed when the pacer drains or its transcript arrives.
//! A committed turn is never silently discarded while the assistant is
//! busy.

use super::{CallState, PendingCommittedTurn, Phase, TimerKind};
use crate::script::time_offer::{get_time_offer, DayHint, OfferRequest, PairBias, TimeWindow};
use crate::script::{
    ack_prefix, booking_fallback_line, build_turn_instruction, detect_day, detect_objection,
    detect_question_kind, detect_window, find_clock_time, hearing_check_line, is_discovery_line,
    is_filler_only, is_indecision, is_negative_hearing, objection_rebuttal, question_rebuttal,
    reprompt_line, should_treat_commit_as_real_answer, wants_earlier, wants_later, wants_soon,
    ClockTime, Step, StepType,
};
use chrono::Timelike;
use std::time::{Duration, Instant};
use tracing::{debug, info};

impl CallState {
    /// Entry point for `input_audio_buffer.committed`.
    pub(crate) fn on_committed(&mut self, item_id: Option<&str>) {
        let audio_ms = std::mem::take(&mut self.committed_audio_ms);

        if self.phase == Phase::Ended || self.voicemail_skip_armed {
            return;
        }

        // 1. Nothing the caller says counts before the greeting is audible.
        if self.phase == Phase::AwaitingGreetingReply && !self.greeting_audio_seen {
            debug!(call_sid = %self.call_sid, "commit before audible greeting ignored");
            return;
        }
        if self.phase == Phase::Init {
            return;
        }

        let best = self.best_transcript_for(item_id);

        // 2. Busy: park as the single pending turn.
        if self.busy() {
            self.park_pending(best, audio_ms, item_id);
            return;
        }

        // 3. Low signal: almost no audio and no words.
        let low_signal_ms = self.config.turn_gate.low_signal_audio_ms;
        let filler_max_ms = self.config.turn_gate.filler_max_audio_ms;
        let filler_grace_ms = self.config.turn_gate.filler_grace_ms;
        if audio_ms < low_signal_ms && best.trim().is_empty() {
            if self.user_spoke_recently() {
                // Real speech happened; wait for its transcript.
                self.park_pending(String::new(), audio_ms, item_id);
            } else {
                self.low_signal_count += 1;
                debug!(
                    call_sid = %self.call_sid,
                    count = self.low_signal_count,
                    "low-signal commit dropped"
                );
            }
            return;
        }

        // 4. Filler: give the caller a moment to finish the thought.
        if !best.trim().is_empty() && is_filler_only(&best) && audio_ms < filler_max_ms {
            self.filler_turn = Some(PendingCommittedTurn {
                best_transcript: best,
                audio_ms,
                at: Instant::now(),
                item_id: item_id.map(str::to_owned),
            });
            self.arm_timer(TimerKind::FillerGrace, Duration::from_millis(filler_grace_ms));
            return;
        }

        self.process_turn(best, audio_ms, item_id.map(str::to_owned));
    }

    fn park_pending(&mut self, best: String, audio_ms: u64, item_id: Option<&str>) {
        debug!(call_sid = %self.call_sid, audio_ms, "turn parked for replay");
        self.pending_turn = Some(PendingCommittedTurn {
            best_transcript: best,
            audio_ms,
            at: Instant::now(),
            item_id: item_id.map(str::to_owned),
        });
        let ttl = self.config.turn_gate.pending_turn_ttl_ms;
        self.arm_timer(TimerKind::PendingTurnTtl, Duration::from_millis(ttl));
    }

    fn user_spoke_recently(&self) -> bool {
        let gate = &self.config.turn_gate;
        let window = Duration::from_millis(gate.recent_speech_window_ms);
        let recent = |at: Option<Instant>| at.is_some_and(|at| at.elapsed() <= window);
        if !recent(self.last_speech_started_at) && !recent(self.last_speech_stopped_at) {
            return false;
        }
        match (self.last_speech_started_at, self.last_speech_stopped_at) {
            (Some(start), Some(stop)) if stop > start => {
                stop.duration_since(start) >= Duration::from_millis(gate.recent_speech_min_ms)
            }
            // Speech started and never stopped: still talking.
            (Some(_), _) => true,
            _ => false,
        }
    }

    /// A transcript arrived for a parked turn: replay as soon as the
    /// assistant is free.
    pub(crate) fn refresh_pending_transcript(&mut self) {
        let awaiting_item = match &self.pending_turn {
            Some(pending) if pending.best_transcript.trim().is_empty() => {
                Some(pending.item_id.clone())
            }
            _ => None,
        };
        let Some(item_id) = awaiting_item else { return };
        let updated = self.best_transcript_for(item_id.as_deref());
        if updated.trim().is_empty() {
            return;
        }
        if let Some(pending) = &mut self.pending_turn {
            pending.best_transcript = updated;
        }
        self.try_replay_pending();
    }

    /// Replay the pending turn if the assistant is free.
    pub(crate) fn try_replay_pending(&mut self) {
        if self.busy() || self.phase == Phase::Ended {
            return;
        }
        let Some(pending) = self.pending_turn.take() else {
            return;
        };
        if pending.best_transcript.trim().is_empty() {
            let ttl = Duration::from_millis(self.config.turn_gate.pending_turn_ttl_ms);
            if pending.at.elapsed() < ttl {
                // Still waiting for the transcript; put it back.
                self.pending_turn = Some(pending);
                return;
            }
            debug!(call_sid = %self.call_sid, "pending turn dropped, no transcript arrived");
            return;
        }
        self.clear_timer(TimerKind::PendingTurnTtl);
        info!(call_sid = %self.call_sid, "replaying parked turn");
        self.process_turn(pending.best_transcript, pending.audio_ms, pending.item_id);
    }

    /// Filler grace expired: drop if still filler, otherwise process.
    pub(crate) fn on_filler_grace(&mut self) {
        let Some(turn) = self.filler_turn.take() else {
            return;
        };
        let refreshed = {
            let latest = self.best_transcript_for(turn.item_id.as_deref());
            if latest.trim().is_empty() {
                turn.best_transcript.clone()
            } else {
                latest
            }
        };
        if is_filler_only(&refreshed) {
            debug!(call_sid = %self.call_sid, "filler-only turn dropped");
            return;
        }
        self.process_turn(refreshed, turn.audio_ms, turn.item_id);
    }

    // ── Main branch logic ───────────────────────────────────────────

    fn process_turn(&mut self, best: String, audio_ms: u64, item_id: Option<String>) {
        if self.busy() {
            // A replay raced with a fresh response; park again.
            self.park_pending(best, audio_ms, item_id.as_deref());
            return;
        }

        // 5. Greeting reply.
        if self.phase == Phase::AwaitingGreetingReply {
            self.handle_greeting_reply(&best);
            return;
        }

        // 6. Objection or caller question → rebuttal ending in the
        // booking question.
        if let Some(objection) = detect_objection(&best) {
            info!(call_sid = %self.call_sid, ?objection, "objection rebuttal");
            let line = objection_rebuttal(objection, &self.vars, &self.booking_question());
            self.speak_rebuttal(line);
            return;
        }
        if let Some(kind) = detect_question_kind(&best) {
            info!(call_sid = %self.call_sid, ?kind, "question rebuttal");
            let line = question_rebuttal(kind, &self.vars, &self.booking_question());
            self.speak_rebuttal(line);
            return;
        }

        // 7. Time answers get their own ladder handling.
        let step = self.script.step(self.step_index).clone();
        if step.step_type == StepType::TimeQuestion {
            self.handle_time_answer(&step, &best);
            return;
        }

        // 8. Advance or reprompt.
        let yesno_ms = self.config.turn_gate.yesno_audio_only_ms;
        if should_treat_commit_as_real_answer(step.step_type, audio_ms, &best, yesno_ms) {
            self.accept_answer(&step, &best);
        } else {
            let line = reprompt_line(step.step_type, self.reprompt_rung).to_owned();
            self.reprompt_rung += 1;
            self.speak_line(line, None);
        }
    }

    fn handle_greeting_reply(&mut self, best: &str) {
        if is_negative_hearing(best) {
            info!(call_sid = %self.call_sid, "hearing-check retry");
            let line = hearing_check_line(&self.vars);
            self.speak_line(line, None);
            return;
        }

        // "Who is this?" as a greeting reply deserves the rebuttal, not
        // the scripted intro.
        if let Some(objection) = detect_objection(best) {
            info!(call_sid = %self.call_sid, ?objection, "objection in greeting reply");
            let line = objection_rebuttal(objection, &self.vars, &self.booking_question());
            self.speak_rebuttal(line);
            return;
        }
        if let Some(kind) = detect_question_kind(best) {
            info!(call_sid = %self.call_sid, ?kind, "question in greeting reply");
            let line = question_rebuttal(kind, &self.vars, &self.booking_question());
            self.speak_rebuttal(line);
            return;
        }

        let ack = ack_prefix(StepType::Statement, best);
        let line = format!("{ack} {}", self.script.step(0).text);
        // The cursor moves to step 1 only once the intro is audible.
        self.speak_line(line, Some(1));
    }

    /// The booking question rebuttals steer back to: the step-2 line when
    /// the script has one, else the safe fallback.
    fn booking_question(&self) -> String {
        if self.script.len() > 2 {
            let step = self.script.step(2);
            if step.step_type == StepType::TimeQuestion {
                return step.text.clone();
            }
        }
        booking_fallback_line(&self.vars)
    }

    fn speak_rebuttal(&mut self, line: String) {
        // Keep the cursor aligned with what the caller will answer next:
        // a rebuttal that asks the step-2 booking question moves the
        // cursor to 2.
        let target = if self.script.len() > 2 && line.ends_with(&self.script.step(2).text) {
            2
        } else {
            self.step_index
        };
        self.step_index = target;
        let advance = if self.phase == Phase::AwaitingGreetingReply {
            Some(target)
        } else {
            None
        };
        self.speak_line(line, advance);
    }

    fn handle_time_answer(&mut self, step: &Step, best: &str) {
        if best.trim().is_empty() {
            let line = reprompt_line(StepType::TimeQuestion, self.reprompt_rung).to_owned();
            self.reprompt_rung += 1;
            self.speak_line(line, None);
            return;
        }

        let clock = find_clock_time(best).or_else(|| self.chosen_from_offer(best));
        if let Some(clock) = clock {
            debug!(call_sid = %self.call_sid, time = %clock.render(), "exact time accepted");
            self.last_exact_time_at = Some(Instant::now());
            self.accept_answer(step, best);
            return;
        }

        // No exact time. Both subtypes hold the cursor; how hard the
        // ladder pushes depends on what the step actually asked for.
        let day = detect_day(best);
        let window = detect_window(best);
        let soon = wants_soon(best);
        let indecision = is_indecision(best);

        if day.is_none() && window.is_none() && !soon && !indecision {
            // Unrecognized answer to a time question: plain reprompt.
            let line = reprompt_line(StepType::TimeQuestion, self.reprompt_rung).to_owned();
            self.reprompt_rung += 1;
            self.speak_line(line, None);
            return;
        }

        let rung = if step.is_exact_time_question {
            // The step already asked for a clock time; a bare day or
            // window skips the question, so escalate.
            self.ladder_rung.max(1)
        } else if step.is_day_choice_question
            && day.is_some()
            && window.is_none()
            && !indecision
        {
            // A bare day is the expected answer to "today or tomorrow";
            // offer gently from the current rung.
            self.ladder_rung
        } else if (day.is_some() && window.is_some()) || indecision {
            self.ladder_rung.max(1)
        } else {
            self.ladder_rung
        };

        let bias = if wants_earlier(best) {
            PairBias::Earlier
        } else if wants_later(best) {
            PairBias::Later
        } else {
            PairBias::None
        };

        self.offer_ladder(day, window, bias, rung);
    }

    fn offer_ladder(
        &mut self,
        day: Option<DayHint>,
        window: Option<TimeWindow>,
        bias: PairBias,
        rung: usize,
    ) {
        let now_minutes = Some(self.local_now_minutes());
        let lead_phone = self.context.lead_phone.clone().unwrap_or_default();
        let lead_email = self.context.lead_email.clone().unwrap_or_default();
        let seed: Vec<&str> = vec![
            &self.lead_id,
            &self.session_id,
            &self.call_sid,
            &lead_phone,
            &lead_email,
            &self.vars.first_name,
            &self.vars.agent_first_name,
        ];
        let request = OfferRequest {
            seed: &seed,
            agent_first_name: &self.vars.agent_first_name,
            day,
            window,
            bias,
            rung,
            now_minutes,
        };
        let offer = get_time_offer(&request);
        debug!(
            call_sid = %self.call_sid,
            rung,
            first = %offer.first.render(),
            second = %offer.second.render(),
            "time offer"
        );
        self.offered_pair = Some((offer.first, offer.second));
        self.ladder_rung = rung + 1;
        self.speak_line(offer.line, None);
    }

    /// Current minutes past midnight in the call's resolved zone.
    fn local_now_minutes(&self) -> u32 {
        let tz = crate::booking::resolve_lead_tz(
            self.context.lead_time_zone.as_deref(),
            None,
            self.context.agent_time_zone.as_deref(),
        );
        let local = chrono::Utc::now().with_timezone(&tz);
        local.hour() * 60 + local.minute()
    }

    /// Match the caller's wording against a previously offered pair.
    fn chosen_from_offer(&self, best: &str) -> Option<ClockTime> {
        let (first, second) = self.offered_pair?;
        let lower = best.to_ascii_lowercase();

        const FIRST_CUES: &[&str] = &["first one", "the first", "former", "earlier one"];
        const SECOND_CUES: &[&str] = &["second one", "the second", "latter", "later one", "the later"];
        if FIRST_CUES.iter().any(|c| lower.contains(c)) {
            return Some(first);
        }
        if SECOND_CUES.iter().any(|c| lower.contains(c)) {
            return Some(second);
        }

        // A bare hour matching one of the offered slots counts as a pick.
        for token in lower.split(|c: char| !c.is_ascii_digit()) {
            let Ok(hour) = token.parse::<u32>() else {
                continue;
            };
            for slot in [first, second] {
                let hour12 = match slot.hour % 12 {
                    0 => 12,
                    h => h,
                };
                if hour == hour12 || hour == slot.hour {
                    return Some(slot);
                }
            }
        }
        None
    }

    fn accept_answer(&mut self, step: &Step, best: &str) {
        self.last_accepted_answer = Some(best.to_owned());
        self.low_signal_count = 0;
        self.reprompt_rung = 0;
        self.ladder_rung = 0;

        let next_index = (self.step_index + 1).min(self.script.max_index());
        self.step_index = next_index;
        let ack = ack_prefix(step.step_type, best);
        let line = format!("{ack} {}", self.script.step(next_index).text);
        self.speak_line(line, None);
    }

    /// Final composition guards, then hand the line to the model.
    pub(crate) fn speak_line(&mut self, line: String, advance_after_audio: Option<usize>) {
        let mut line = line;

        // 9. Anti-loop: repeating ourselves within a few seconds reads as
        // a stall; swap in the booking fallback.
        if let Some((last, at)) = &self.last_spoken_line {
            let window = Duration::from_millis(self.config.turn_gate.anti_loop_window_ms);
            if *last == line && at.elapsed() <= window {
                debug!(call_sid = %self.call_sid, "anti-loop fallback substituted");
                line = booking_fallback_line(&self.vars);
            }
        }

        // 10. Discovery cap.
        if is_discovery_line(&line) {
            if self.discovery_count >= self.config.turn_gate.discovery_cap {
                debug!(call_sid = %self.call_sid, "discovery cap reached, fallback substituted");
                line = booking_fallback_line(&self.vars);
            } else {
                self.discovery_count += 1;
            }
        }

        self.last_spoken_line = Some((line.clone(), Instant::now()));
        let instructions = build_turn_instruction(&line, &self.vars);
        self.queue_response(instructions, advance_after_audio);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::tests::{idle, in_call, test_call, test_call_with_script};

    fn commit(test: &mut crate::call::tests::TestCall, item: &str, text: &str, audio_ms: u64) {
        test.state.note_transcript_completed(item, text);
        test.state.committed_audio_ms = audio_ms;
        test.state.on_committed(Some(item));
    }

    fn spoken(test: &crate::call::tests::TestCall) -> String {
        test.state
            .last_spoken_line
            .as_ref()
            .map(|(line, _)| line.clone())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn happy_path_books_through_the_ladder() {
        let mut test = test_call();
        in_call(&mut test, 2);

        // Day + window answer holds the step and offers two times.
        commit(&mut test, "i1", "tomorrow afternoon", 900);
        assert_eq!(test.state.step_index, 2);
        let (first, second) = test.state.offered_pair.expect("pair offered");
        let line = spoken(&test);
        assert!(line.contains(&first.render()));
        assert!(line.contains(&second.render()));

        // An exact time advances to the confirm line with the agent name.
        idle(&mut test);
        commit(&mut test, "i2", "let's do 2pm", 700);
        assert_eq!(test.state.step_index, 3);
        assert!(test.state.last_exact_time_at.is_some());
        assert!(spoken(&test).contains("Mike"));

        // Confirmation keeps booking eligibility alive.
        idle(&mut test);
        commit(&mut test, "i3", "yes", 600);
        assert_eq!(test.state.step_index, 4);
        let age = test.state.last_exact_time_at.unwrap().elapsed();
        assert!(crate::booking::booking_eligible("yes", Some(age)));
    }

    #[tokio::test]
    async fn greeting_reply_defers_advance_to_first_audio() {
        let mut test = test_call();
        test.state.phase = Phase::AwaitingGreetingReply;
        test.state.greeting_audio_seen = true;
        commit(&mut test, "g1", "yeah speaking", 800);
        assert_eq!(test.state.greeting_advance_pending, Some(1));
        assert_eq!(test.state.step_index, 0);
        assert_eq!(test.state.phase, Phase::AwaitingGreetingReply);
        assert!(spoken(&test).contains("mortgage protection"));
    }

    #[tokio::test]
    async fn negative_hearing_gets_a_retry_not_the_script() {
        let mut test = test_call();
        test.state.phase = Phase::AwaitingGreetingReply;
        test.state.greeting_audio_seen = true;
        commit(&mut test, "g1", "I can't hear you", 800);
        assert_eq!(test.state.greeting_advance_pending, None);
        assert!(spoken(&test).contains("hear me okay"));
        assert_eq!(test.state.step_index, 0);
    }

    #[tokio::test]
    async fn confused_identity_rebuttal_fast_forwards_to_booking() {
        let mut test = test_call();
        in_call(&mut test, 1);
        commit(&mut test, "i1", "wait, who is this?", 900);
        let line = spoken(&test);
        assert!(line.contains("Ava"));
        assert!(line.contains("today or tomorrow"));
        assert_eq!(test.state.step_index, 2);
    }

    #[tokio::test]
    async fn objection_rebuttal_ends_with_booking_question() {
        let mut test = test_call();
        in_call(&mut test, 1);
        commit(&mut test, "i1", "I'm not interested", 900);
        let line = spoken(&test);
        assert!(line.contains("today or tomorrow"));
        assert_eq!(test.state.step_index, 2);
    }

    #[tokio::test]
    async fn filler_gets_grace_then_promotes_to_time_answer() {
        let mut test = test_call();
        in_call(&mut test, 2);
        commit(&mut test, "i1", "um", 400);
        assert!(test.state.filler_turn.is_some());
        assert!(!test.state.busy());

        // The caller finished the thought before the grace expired.
        test.state.note_transcript_completed("i1", "um tomorrow works");
        test.state.on_filler_grace();
        assert!(test.state.offered_pair.is_some());
        assert_eq!(test.state.step_index, 2);
    }

    #[tokio::test]
    async fn filler_still_filler_at_grace_is_dropped() {
        let mut test = test_call();
        in_call(&mut test, 2);
        commit(&mut test, "i1", "uh", 300);
        test.state.on_filler_grace();
        assert!(test.state.filler_turn.is_none());
        assert!(!test.state.busy());
        assert_eq!(spoken(&test), "");
    }

    #[tokio::test]
    async fn low_signal_commit_is_counted_not_answered() {
        let mut test = test_call();
        in_call(&mut test, 1);
        test.state.committed_audio_ms = 100;
        test.state.on_committed(None);
        assert_eq!(test.state.low_signal_count, 1);
        assert!(!test.state.busy());
        assert!(test.state.pending_turn.is_none());
    }

    #[tokio::test]
    async fn parked_turn_replays_after_drain() {
        let mut test = test_call();
        in_call(&mut test, 1);
        test.state.response_in_flight = true;
        commit(&mut test, "i1", "yes", 800);
        assert!(test.state.pending_turn.is_some());

        idle(&mut test);
        test.state.try_replay_pending();
        assert!(test.state.pending_turn.is_none());
        assert_eq!(test.state.step_index, 2);
        assert!(test.state.busy());
    }

    #[tokio::test]
    async fn pending_without_transcript_waits_for_text() {
        let mut test = test_call();
        in_call(&mut test, 1);
        test.state.response_in_flight = true;
        test.state.last_speech_started_at = Some(Instant::now());
        test.state.committed_audio_ms = 100;
        test.state.on_committed(Some("i9"));
        assert!(test.state.pending_turn.is_some());

        idle(&mut test);
        // Drain with no transcript: stays parked within the TTL.
        test.state.try_replay_pending();
        assert!(test.state.pending_turn.is_some());

        // Transcript lands: replay happens immediately.
        test.state.note_transcript_completed("i9", "sure");
        test.state.refresh_pending_transcript();
        assert!(test.state.pending_turn.is_none());
        assert_eq!(test.state.step_index, 2);
    }

    #[tokio::test]
    async fn unrecognized_time_answer_reprompts() {
        let mut test = test_call();
        in_call(&mut test, 2);
        commit(&mut test, "i1", "maybe I guess", 900);
        assert_eq!(test.state.step_index, 2);
        assert!(test.state.offered_pair.is_none());
        assert_eq!(test.state.reprompt_rung, 1);
        assert_eq!(spoken(&test), reprompt_line(StepType::TimeQuestion, 0));
    }

    #[tokio::test]
    async fn indecision_escalates_the_ladder() {
        let mut test = test_call();
        in_call(&mut test, 2);
        commit(&mut test, "i1", "whenever, you pick", 900);
        assert!(test.state.offered_pair.is_some());
        assert_eq!(test.state.ladder_rung, 2);
    }

    #[tokio::test]
    async fn offered_pair_pick_counts_as_exact_time() {
        let mut test = test_call();
        in_call(&mut test, 2);
        commit(&mut test, "i1", "tomorrow", 900);
        assert!(test.state.offered_pair.is_some());
        // A bare day answers a day-choice step; the first offer stays on
        // the gentle rung.
        assert_eq!(test.state.ladder_rung, 1);

        idle(&mut test);
        commit(&mut test, "i2", "the first one", 700);
        assert_eq!(test.state.step_index, 3);
        assert!(test.state.last_exact_time_at.is_some());
    }

    #[tokio::test]
    async fn exact_time_step_escalates_on_day_only_answer() {
        // The veteran script asks "what time works best" at step 2; a
        // bare day skips the question, so the offer starts a rung up.
        let mut test = test_call_with_script("veteran_leads");
        in_call(&mut test, 2);
        assert!(test.state.script.step(2).is_exact_time_question);
        commit(&mut test, "i1", "tomorrow", 900);
        assert!(test.state.offered_pair.is_some());
        assert_eq!(test.state.ladder_rung, 2);
    }

    #[tokio::test]
    async fn exact_time_step_escalates_on_window_only_answer() {
        let mut test = test_call_with_script("trucker_leads");
        in_call(&mut test, 2);
        assert!(test.state.script.step(2).is_exact_time_question);
        commit(&mut test, "i1", "afternoon I guess", 900);
        assert!(test.state.offered_pair.is_some());
        assert_eq!(test.state.ladder_rung, 2);
    }

    #[tokio::test]
    async fn discovery_cap_substitutes_booking_fallback() {
        let mut test = test_call();
        in_call(&mut test, 1);
        let discovery = "Roughly how much is left on the mortgage?".to_owned();
        test.state.speak_line(discovery.clone(), None);
        idle(&mut test);
        test.state
            .speak_line("And any major health issues he should know about?".to_owned(), None);
        assert_eq!(test.state.discovery_count, 2);

        idle(&mut test);
        test.state.speak_line(discovery, None);
        assert_eq!(test.state.discovery_count, 2);
        assert!(spoken(&test).contains("today or tomorrow work better"));
    }

    #[tokio::test]
    async fn repeating_a_line_swaps_in_the_fallback() {
        let mut test = test_call();
        in_call(&mut test, 1);
        test.state.speak_line("Does that work for you?".to_owned(), None);
        idle(&mut test);
        test.state.speak_line("Does that work for you?".to_owned(), None);
        assert!(spoken(&test).contains("today or tomorrow work better"));
    }

    #[tokio::test]
    async fn yesno_accepts_audio_only_past_threshold() {
        let mut test = test_call();
        in_call(&mut test, 1);
        test.state.committed_audio_ms = 1300;
        test.state.on_committed(None);
        assert_eq!(test.state.step_index, 2);

        let mut test = test_call();
        in_call(&mut test, 1);
        test.state.committed_audio_ms = 600;
        test.state.on_committed(None);
        // Not enough audio for an answer and no text: reprompt.
        assert_eq!(test.state.step_index, 1);
        assert_eq!(test.state.reprompt_rung, 1);
    }
}
