//! Realtime wire events, client and server side.
//!
//! Tagged unions with the provider's literal event names. Unknown server
//! events deserialize to [`ServerEvent::Unknown`] and are logged and
//! ignored upstream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Client → model ──────────────────────────────────────────────────────

/// Session configuration sent once after connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub temperature: f32,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_audio_transcription: TranscriptionConfig,
    pub turn_detection: TurnDetection,
}

/// Input transcription settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub model: String,
}

/// Server-side VAD settings. `create_response` stays false: the bridge
/// alone decides when the model speaks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub create_response: bool,
    pub silence_duration_ms: u32,
    pub prefix_padding_ms: u32,
}

/// Per-response creation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseParams {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub temperature: f32,
}

/// Events the bridge sends to the model.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,
    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,
    #[serde(rename = "response.create")]
    ResponseCreate { response: ResponseParams },
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

impl From<&ClientEvent> for String {
    fn from(value: &ClientEvent) -> Self {
        // These wire events contain only strings and numbers; the
        // serializer has no failure path for them.
        serde_json::to_string(value).unwrap_or_default()
    }
}

impl From<ClientEvent> for tokio_tungstenite::tungstenite::Message {
    fn from(value: ClientEvent) -> Self {
        tokio_tungstenite::tungstenite::Message::Text(String::from(&value))
    }
}

// ── Model → client ──────────────────────────────────────────────────────

/// Events the bridge consumes from the model.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        audio_start_ms: Option<u64>,
        #[serde(default)]
        item_id: Option<String>,
    },
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        #[serde(default)]
        audio_end_ms: Option<u64>,
        #[serde(default)]
        item_id: Option<String>,
    },
    #[serde(rename = "input_audio_buffer.committed")]
    Committed {
        #[serde(default)]
        item_id: Option<String>,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    TranscriptionDelta {
        item_id: String,
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        item_id: String,
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.failed")]
    TranscriptionFailed {
        #[serde(default)]
        item_id: Option<String>,
    },
    #[serde(rename = "response.audio.delta", alias = "response.output_audio.delta")]
    AudioDelta {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.audio.done", alias = "response.output_audio.done")]
    AudioDone {
        #[serde(default)]
        response_id: Option<String>,
    },
    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: Value,
    },
    #[serde(rename = "response.cancelled")]
    ResponseCancelled,
    #[serde(rename = "response.interrupted")]
    ResponseInterrupted,
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: Value,
    },
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    /// Parse an event from its raw JSON value. Unparseable input maps to
    /// [`ServerEvent::Unknown`].
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or(Self::Unknown)
    }

    /// Status string carried by a `response.done`, when present.
    pub fn response_status(&self) -> Option<&str> {
        match self {
            Self::ResponseDone { response } => response.get("status").and_then(Value::as_str),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_update_serializes_with_wire_tag() {
        let event = ClientEvent::SessionUpdate {
            session: SessionConfig {
                modalities: vec!["audio".into(), "text".into()],
                instructions: "hello".into(),
                voice: "alloy".into(),
                temperature: 0.6,
                input_audio_format: "g711_ulaw".into(),
                output_audio_format: "g711_ulaw".into(),
                input_audio_transcription: TranscriptionConfig {
                    model: "whisper-1".into(),
                },
                turn_detection: TurnDetection {
                    kind: "server_vad".into(),
                    create_response: false,
                    silence_duration_ms: 550,
                    prefix_padding_ms: 300,
                },
            },
        };
        let value: Value = serde_json::from_str(&String::from(&event)).unwrap();
        assert_eq!(value["type"], "session.update");
        assert_eq!(value["session"]["input_audio_format"], "g711_ulaw");
        assert_eq!(value["session"]["turn_detection"]["type"], "server_vad");
        assert_eq!(value["session"]["turn_detection"]["create_response"], false);
    }

    #[test]
    fn fieldless_events_serialize_as_bare_tags() {
        let value: Value =
            serde_json::from_str(&String::from(&ClientEvent::ResponseCancel)).unwrap();
        assert_eq!(value, json!({"type": "response.cancel"}));
    }

    #[test]
    fn parses_committed_event() {
        let event = ServerEvent::from_value(&json!({
            "type": "input_audio_buffer.committed",
            "item_id": "item_7",
            "previous_item_id": "item_6"
        }));
        match event {
            ServerEvent::Committed { item_id } => assert_eq!(item_id.as_deref(), Some("item_7")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parses_audio_delta_and_equivalent_name() {
        for name in ["response.audio.delta", "response.output_audio.delta"] {
            let event = ServerEvent::from_value(&json!({"type": name, "delta": "AAAA"}));
            assert!(matches!(event, ServerEvent::AudioDelta { .. }), "{name}");
        }
    }

    #[test]
    fn unknown_event_kind_is_tolerated() {
        let event = ServerEvent::from_value(&json!({"type": "rate_limits.updated"}));
        assert!(matches!(event, ServerEvent::Unknown));
        let event = ServerEvent::from_value(&json!(42));
        assert!(matches!(event, ServerEvent::Unknown));
    }

    #[test]
    fn response_done_status_extraction() {
        let event = ServerEvent::from_value(&json!({
            "type": "response.done",
            "response": {"status": "cancelled"}
        }));
        assert_eq!(event.response_status(), Some("cancelled"));
    }
}
