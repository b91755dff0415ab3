//! Time-offer ladder: concrete slot pairs for vague time answers.
//!
//! When a caller answers a time question with only a day ("tomorrow"), a
//! window ("afternoon"), or indecision ("you pick"), the gate holds the
//! step and offers two adjacent concrete times. Pair selection is seeded
//! by a stable hash of the call identity so different callers hear
//! different pairs, but a single call always hears the same ones.

use super::ClockTime;

/// Which day the offer lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayHint {
    Today,
    Tomorrow,
    /// "right now / in an hour" urgency: offer relative hours instead of
    /// wall-clock slots.
    SoonHours,
}

impl DayHint {
    pub fn phrase(self) -> &'static str {
        match self {
            Self::Today => "today",
            Self::Tomorrow => "tomorrow",
            Self::SoonHours => "shortly",
        }
    }
}

/// Named time-of-day windows with their slot ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeWindow {
    Morning,
    LateMorning,
    Afternoon,
    MidAfternoon,
    LateAfternoon,
    Evening,
    LateEvening,
}

/// Minutes between adjacent slots.
pub const SLOT_STEP_MINUTES: u32 = 30;

impl TimeWindow {
    /// Inclusive slot range in minutes past midnight.
    pub fn minute_range(self) -> (u32, u32) {
        match self {
            Self::Morning => (8 * 60, 11 * 60 + 30),
            Self::LateMorning => (10 * 60, 12 * 60),
            Self::Afternoon => (12 * 60, 16 * 60 + 30),
            Self::MidAfternoon => (13 * 60 + 30, 16 * 60),
            Self::LateAfternoon => (15 * 60 + 30, 18 * 60),
            Self::Evening => (17 * 60, 20 * 60 + 30),
            Self::LateEvening => (19 * 60, 21 * 60 + 30),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Morning => "morning",
            Self::LateMorning => "late morning",
            Self::Afternoon => "afternoon",
            Self::MidAfternoon => "mid afternoon",
            Self::LateAfternoon => "late afternoon",
            Self::Evening => "evening",
            Self::LateEvening => "late evening",
        }
    }

    /// All slots in the window, 30 minutes apart.
    pub fn slots(self) -> Vec<ClockTime> {
        let (start, end) = self.minute_range();
        let mut out = Vec::new();
        let mut m = start;
        while m <= end {
            out.push(ClockTime::from_minutes(m));
            m += SLOT_STEP_MINUTES;
        }
        out
    }
}

/// Stable 32-bit FNV-1a over the identity fields, `|`-joined.
pub fn fnv1a_32(parts: &[&str]) -> u32 {
    const OFFSET: u32 = 2_166_136_261;
    const PRIME: u32 = 16_777_619;

    let mut hash = OFFSET;
    let mut first = true;
    for part in parts {
        if !first {
            hash ^= u32::from(b'|');
            hash = hash.wrapping_mul(PRIME);
        }
        first = false;
        for &b in part.as_bytes() {
            hash ^= u32::from(b);
            hash = hash.wrapping_mul(PRIME);
        }
    }
    hash
}

/// Preference extracted from the caller's wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairBias {
    None,
    Later,
    Earlier,
}

/// A concrete two-slot offer, ready to speak.
#[derive(Debug, Clone)]
pub struct TimeOffer {
    /// The full line to speak.
    pub line: String,
    /// First offered slot.
    pub first: ClockTime,
    /// Second offered slot.
    pub second: ClockTime,
    /// Day the offer lands on (after any today-fallback).
    pub day: DayHint,
    /// Window the pair was drawn from.
    pub window: TimeWindow,
}

/// Inputs to [`get_time_offer`].
#[derive(Debug, Clone)]
pub struct OfferRequest<'a> {
    /// Identity fields seeding pair selection: lead id, session id, call
    /// id, phone, email, first name, agent name. Order matters.
    pub seed: &'a [&'a str],
    pub agent_first_name: &'a str,
    /// Day the caller indicated, if any.
    pub day: Option<DayHint>,
    /// Window the caller indicated, if any.
    pub window: Option<TimeWindow>,
    pub bias: PairBias,
    /// Ladder rung, 0-based. Clamps to the final rung.
    pub rung: usize,
    /// Current minutes past midnight in the resolved call time zone.
    /// Required for today offers and soon-hours offers.
    pub now_minutes: Option<u32>,
}

/// Number of ladder rungs.
pub const LADDER_RUNGS: usize = 5;

/// Generate the concrete two-slot offer line for a ladder rung.
///
/// Today offers only include slots at least 30 minutes out, rounded up to
/// the next 30-minute boundary; when fewer than two such slots remain the
/// offer falls back to tomorrow afternoon.
pub fn get_time_offer(req: &OfferRequest<'_>) -> TimeOffer {
    let day = req.day.unwrap_or(DayHint::Tomorrow);

    if day == DayHint::SoonHours {
        if let Some(now) = req.now_minutes {
            return soon_hours_offer(req, now);
        }
    }

    let mut day = if day == DayHint::SoonHours {
        DayHint::Today
    } else {
        day
    };
    let mut window = req.window.unwrap_or(match day {
        DayHint::Today => TimeWindow::Evening,
        _ => TimeWindow::Afternoon,
    });

    let mut slots = window.slots();
    if day == DayHint::Today {
        let cutoff = req.now_minutes.map(|now| round_up_to_slot(now + 30));
        if let Some(cutoff) = cutoff {
            slots.retain(|s| s.minutes() >= cutoff);
        }
        if slots.len() < 2 {
            day = DayHint::Tomorrow;
            window = req.window.unwrap_or(TimeWindow::Afternoon);
            slots = window.slots();
        }
    }

    let (first, second) = pick_adjacent_pair(&slots, req);
    let rung = req.rung.min(LADDER_RUNGS - 1);
    let line = ladder_line(rung, req.agent_first_name, first, second, day);

    TimeOffer {
        line,
        first,
        second,
        day,
        window,
    }
}

fn soon_hours_offer(req: &OfferRequest<'_>, now_minutes: u32) -> TimeOffer {
    let first = ClockTime::from_minutes((now_minutes + 60) % (24 * 60));
    let second = ClockTime::from_minutes((now_minutes + 120) % (24 * 60));
    let line = format!(
        "I can have {} call you about an hour from now, or two hours out — which is better?",
        req.agent_first_name
    );
    TimeOffer {
        line,
        first,
        second,
        day: DayHint::SoonHours,
        window: req.window.unwrap_or(TimeWindow::Afternoon),
    }
}

fn round_up_to_slot(minutes: u32) -> u32 {
    minutes.div_ceil(SLOT_STEP_MINUTES) * SLOT_STEP_MINUTES
}

fn pick_adjacent_pair(slots: &[ClockTime], req: &OfferRequest<'_>) -> (ClockTime, ClockTime) {
    debug_assert!(slots.len() >= 2);
    let pair_count = slots.len() - 1;

    let index = match req.bias {
        PairBias::Earlier => 0,
        PairBias::Later => pair_count - 1,
        PairBias::None => {
            let mut parts: Vec<&str> = req.seed.to_vec();
            let day = match req.day {
                Some(DayHint::Today) => "today",
                Some(DayHint::SoonHours) => "soon",
                _ => "tomorrow",
            };
            let window = req.window.map(TimeWindow::label).unwrap_or("default");
            let rung = rung_token(req.rung);
            parts.push(day);
            parts.push(window);
            parts.push(rung);
            (fnv1a_32(&parts) as usize) % pair_count
        }
    };
    (slots[index], slots[index + 1])
}

fn rung_token(rung: usize) -> &'static str {
    match rung.min(LADDER_RUNGS - 1) {
        0 => "rung0",
        1 => "rung1",
        2 => "rung2",
        3 => "rung3",
        _ => "rung4",
    }
}

fn ladder_line(
    rung: usize,
    agent_first_name: &str,
    first: ClockTime,
    second: ClockTime,
    day: DayHint,
) -> String {
    let t1 = first.render();
    let t2 = second.render();
    let day = day.phrase();
    match rung {
        0 => format!(
            "{agent_first_name} has {t1} or {t2} open {day} — which works better for you?"
        ),
        1 => format!(
            "Easy — I'm seeing {t1} and {t2} {day}. Want me to grab one of those for you?"
        ),
        2 => format!("Let's keep it simple: {t1} or {t2} {day}?"),
        3 => format!(
            "Either {t1} or {t2} {day} and you're done — which should I put down?"
        ),
        _ => format!(
            "Tell you what — I can just lock in {t1} {day} and you can always move it. Sound good?"
        ),
    }
}
