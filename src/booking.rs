//! Booking eligibility gate and start-time / time-zone normalization.
//!
//! A `book_appointment` control from the model is only forwarded to the
//! CRM when the conversation actually produced a concrete time: either
//! the last accepted utterance names an exact clock time, or it is an
//! affirmative confirmation given shortly after one was accepted.

use crate::script::{find_clock_time, is_affirmative};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;

/// Last-resort zone when every provided value is invalid.
pub const DEFAULT_TZ: &str = "America/Phoenix";

/// How long an accepted exact time keeps a later "yes" bookable.
pub const CONFIRMATION_RECENCY: Duration = Duration::from_secs(5 * 60);

/// Whether `name` is a known IANA zone.
pub fn is_valid_tz(name: &str) -> bool {
    Tz::from_str(name.trim()).is_ok()
}

fn first_valid_tz<'a>(candidates: impl IntoIterator<Item = Option<&'a str>>) -> Tz {
    for candidate in candidates.into_iter().flatten() {
        if let Ok(tz) = Tz::from_str(candidate.trim()) {
            return tz;
        }
    }
    // DEFAULT_TZ is a known-good catalog entry.
    Tz::from_str(DEFAULT_TZ).unwrap_or(chrono_tz::America::Phoenix)
}

/// Lead zone precedence: CRM-provided lead tz, then model-provided, then
/// agent tz, then [`DEFAULT_TZ`]. Invalid values fall through.
pub fn resolve_lead_tz(
    crm_lead_tz: Option<&str>,
    model_tz: Option<&str>,
    agent_tz: Option<&str>,
) -> Tz {
    first_valid_tz([crm_lead_tz, model_tz, agent_tz])
}

/// Agent zone precedence: the CRM-provided value always wins over
/// anything the model claims. Invalid values fall through.
pub fn resolve_agent_tz(crm_agent_tz: Option<&str>, model_agent_tz: Option<&str>) -> Tz {
    first_valid_tz([crm_agent_tz, model_agent_tz])
}

/// Normalize a model-provided start time.
///
/// Accepts ISO-8601 strings, epoch seconds, and epoch milliseconds.
/// Numeric values below 10^12 are seconds.
pub fn normalize_start_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            // Some models emit epoch values as strings.
            s.parse::<i64>().ok().and_then(from_epoch)
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                from_epoch(i)
            } else {
                n.as_f64().and_then(|f| from_epoch(f as i64))
            }
        }
        _ => None,
    }
}

fn from_epoch(raw: i64) -> Option<DateTime<Utc>> {
    if raw <= 0 {
        return None;
    }
    if raw < 1_000_000_000_000 {
        DateTime::from_timestamp(raw, 0)
    } else {
        DateTime::from_timestamp_millis(raw)
    }
}

/// Decide whether a `book_appointment` control may proceed.
///
/// `last_accepted` is the last user utterance the turn gate accepted;
/// `exact_time_age` is how long ago an exact clock time was last
/// accepted, if ever.
pub fn booking_eligible(last_accepted: &str, exact_time_age: Option<Duration>) -> bool {
    if find_clock_time(last_accepted).is_some() {
        return true;
    }
    match exact_time_age {
        Some(age) if age <= CONFIRMATION_RECENCY => is_affirmative(last_accepted),
        _ => false,
    }
}
