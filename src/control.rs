//! Structured control blocks embedded in model events, plus the
//! answering-machine test.
//!
//! Models emit side-channel controls under `control`, `metadata.control`
//! or `item.metadata.control`. Only `book_appointment` and
//! `final_outcome` are meaningful; anything else is ignored.

use serde_json::Value;

/// Terminal outcomes the CRM understands.
pub const FINAL_OUTCOMES: &[&str] = &[
    "booked",
    "not_interested",
    "no_answer",
    "callback",
    "do_not_call",
    "disconnected",
    "unknown",
];

/// A recognized control block.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlBlock {
    BookAppointment {
        start_time: Value,
        duration_minutes: Option<u32>,
        lead_time_zone: Option<String>,
        agent_time_zone: Option<String>,
        notes: Option<String>,
    },
    FinalOutcome {
        outcome: String,
    },
}

/// Find and parse a control block anywhere a model event may carry one.
pub fn extract_control(raw: &Value) -> Option<ControlBlock> {
    let candidates = [
        raw.get("control"),
        raw.get("metadata").and_then(|m| m.get("control")),
        raw.get("item")
            .and_then(|i| i.get("metadata"))
            .and_then(|m| m.get("control")),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(parse_control_block)
}

fn parse_control_block(control: &Value) -> Option<ControlBlock> {
    let kind = control.get("kind").and_then(Value::as_str)?;
    match kind {
        "book_appointment" => {
            let start_time = first_of(control, &["startTimeUtc", "start_time_utc", "startTime", "start_time"])
                .cloned()
                .unwrap_or(Value::Null);
            Some(ControlBlock::BookAppointment {
                start_time,
                duration_minutes: first_of(control, &["durationMinutes", "duration_minutes"])
                    .and_then(Value::as_u64)
                    .map(|v| v as u32),
                lead_time_zone: string_of(control, &["leadTimeZone", "lead_time_zone"]),
                agent_time_zone: string_of(control, &["agentTimeZone", "agent_time_zone"]),
                notes: string_of(control, &["notes"]),
            })
        }
        "final_outcome" => {
            let outcome = string_of(control, &["outcome"]).unwrap_or_default();
            Some(ControlBlock::FinalOutcome {
                outcome: canonical_outcome(&outcome),
            })
        }
        _ => None,
    }
}

fn first_of<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| value.get(k))
}

fn string_of(value: &Value, keys: &[&str]) -> Option<String> {
    first_of(value, keys)
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// Canonicalize a model-provided outcome; anything unrecognized becomes
/// `unknown`.
pub fn canonical_outcome(outcome: &str) -> String {
    let lower = outcome.trim().to_ascii_lowercase();
    if FINAL_OUTCOMES.contains(&lower.as_str()) {
        lower
    } else {
        "unknown".to_owned()
    }
}

/// Carrier-side answering-machine detection verdicts that suppress the
/// assistant.
pub fn is_machine(answered_by: &str) -> bool {
    let lower = answered_by.to_ascii_lowercase();
    ["machine", "fax", "voicemail"]
        .iter()
        .any(|cue| lower.contains(cue))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_top_level_control() {
        let raw = json!({
            "type": "response.done",
            "control": {"kind": "final_outcome", "outcome": "booked"}
        });
        assert_eq!(
            extract_control(&raw),
            Some(ControlBlock::FinalOutcome {
                outcome: "booked".to_owned()
            })
        );
    }

    #[test]
    fn extracts_nested_metadata_control() {
        let raw = json!({
            "metadata": {"control": {"kind": "final_outcome", "outcome": "callback"}}
        });
        assert!(extract_control(&raw).is_some());
        let raw = json!({
            "item": {"metadata": {"control": {"kind": "final_outcome", "outcome": "callback"}}}
        });
        assert!(extract_control(&raw).is_some());
    }

    #[test]
    fn book_appointment_fields() {
        let raw = json!({
            "control": {
                "kind": "book_appointment",
                "startTimeUtc": "2025-08-03T21:30:00Z",
                "durationMinutes": 30,
                "leadTimeZone": "America/Chicago",
                "notes": "prefers afternoon"
            }
        });
        match extract_control(&raw) {
            Some(ControlBlock::BookAppointment {
                start_time,
                duration_minutes,
                lead_time_zone,
                agent_time_zone,
                notes,
            }) => {
                assert_eq!(start_time, json!("2025-08-03T21:30:00Z"));
                assert_eq!(duration_minutes, Some(30));
                assert_eq!(lead_time_zone.as_deref(), Some("America/Chicago"));
                assert_eq!(agent_time_zone, None);
                assert_eq!(notes.as_deref(), Some("prefers afternoon"));
            }
            other => panic!("unexpected control: {other:?}"),
        }
    }

    #[test]
    fn snake_case_keys_are_accepted() {
        let raw = json!({
            "control": {"kind": "book_appointment", "start_time_utc": 1754256600}
        });
        match extract_control(&raw) {
            Some(ControlBlock::BookAppointment { start_time, .. }) => {
                assert_eq!(start_time, json!(1754256600));
            }
            other => panic!("unexpected control: {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_ignored() {
        let raw = json!({"control": {"kind": "transfer_call"}});
        assert_eq!(extract_control(&raw), None);
        assert_eq!(extract_control(&json!({"type": "response.done"})), None);
    }

    #[test]
    fn outcomes_canonicalize() {
        assert_eq!(canonical_outcome("Booked"), "booked");
        assert_eq!(canonical_outcome("do_not_call"), "do_not_call");
        assert_eq!(canonical_outcome("meh"), "unknown");
        assert_eq!(canonical_outcome(""), "unknown");
    }

    #[test]
    fn machine_detection() {
        assert!(is_machine("machine"));
        assert!(is_machine("machine_end_beep"));
        assert!(is_machine("Voicemail"));
        assert!(is_machine("fax"));
        assert!(!is_machine("human"));
        assert!(!is_machine(""));
    }
}
