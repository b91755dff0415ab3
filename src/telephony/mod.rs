//! Carrier media-stream websocket: framed JSON events in, paced μ-law out.
//!
//! One websocket per live call. The handler waits for the `start` frame,
//! assembles the call (context fetch, model link, event loop), then
//! forwards every subsequent carrier frame into the call's event channel.
//! The registry is mutated here and nowhere else.

use crate::audio::FRAME_BYTES;
use crate::call::{
    self, CallEvent, CallHandle, CallParams, CallState,
};
use crate::server::AppState;
use axum::extract::ws::{Message, WebSocket};
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Carrier stream events, tagged by `event`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event")]
#[serde(rename_all = "lowercase")]
pub enum StreamEvent {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
    },
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        start: StartMetadata,
    },
    Media {
        #[serde(default, rename = "streamSid")]
        stream_sid: Option<String>,
        media: MediaPayload,
    },
    Mark {
        #[serde(default, rename = "streamSid")]
        stream_sid: Option<String>,
    },
    Stop {
        #[serde(default, rename = "streamSid")]
        stream_sid: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartMetadata {
    pub call_sid: String,
    pub custom_parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaPayload {
    /// Base64-encoded μ-law audio.
    pub payload: String,
    /// `outbound` frames are our own echo and are ignored.
    #[serde(default)]
    pub track: Option<String>,
}

/// Outbound traffic toward the carrier.
#[derive(Debug)]
pub enum TelephonyOut {
    /// One 160-byte μ-law frame.
    Media(Vec<u8>),
    /// Playback marker.
    Mark(String),
    Close,
}

/// Drive one carrier websocket for its whole life.
pub async fn handle_stream(socket: WebSocket, app: AppState) {
    info!("carrier stream connected");
    let (sink, mut source) = socket.split();

    // Everything before `start` carries no call identity.
    let (stream_sid, start) = loop {
        match next_event(&mut source).await {
            Some(StreamEvent::Start { stream_sid, start }) => break (stream_sid, start),
            Some(StreamEvent::Connected { protocol }) => {
                debug!(?protocol, "carrier handshake");
            }
            Some(_) => {}
            None => {
                info!("carrier stream closed before start");
                return;
            }
        }
    };

    let call_sid = start.call_sid.clone();
    let session_id = start
        .custom_parameters
        .get("sessionId")
        .cloned()
        .unwrap_or_default();
    let lead_id = start
        .custom_parameters
        .get("leadId")
        .cloned()
        .unwrap_or_default();
    info!(
        stream_sid = %stream_sid,
        call_sid = %call_sid,
        session_id = %session_id,
        lead_id = %lead_id,
        "call starting"
    );

    // Calls are only accepted for sessions announced via /start-session.
    // A missing or stopped session id means a stray or cancelled dial.
    if !app.session_known(&session_id) {
        warn!(
            stream_sid = %stream_sid,
            call_sid = %call_sid,
            session_id = %session_id,
            "call outside any announced session, dropping"
        );
        return;
    }

    let context = match app.crm.fetch_context(&session_id, &lead_id, &call_sid).await {
        Ok(context) => context,
        Err(e) => {
            warn!(call_sid = %call_sid, error = %e, "context fetch failed, using defaults");
            crate::crm::CallContext::default()
        }
    };

    let (model, model_rx) = match call::connect_model_for(&app.config, &context).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(call_sid = %call_sid, error = %e, "model link failed, dropping call");
            return;
        }
    };

    let (carrier_tx, carrier_rx) = mpsc::unbounded_channel::<TelephonyOut>();
    let (events_tx, events_rx) = mpsc::unbounded_channel::<CallEvent>();
    let cancel = CancellationToken::new();

    spawn_writer(sink, stream_sid.clone(), carrier_rx);
    call::spawn_model_forwarder(model_rx, events_tx.clone());

    let state = CallState::new(CallParams {
        stream_sid: stream_sid.clone(),
        call_sid: call_sid.clone(),
        session_id,
        lead_id,
        context,
        config: app.config.clone(),
        crm: app.crm.clone(),
        model,
        carrier_tx: carrier_tx.clone(),
        events_tx: events_tx.clone(),
    });

    if let Ok(mut registry) = app.registry.lock() {
        registry.insert(
            stream_sid.clone(),
            CallHandle {
                cancel: cancel.clone(),
                started_at: Instant::now(),
            },
        );
    }

    let loop_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            call::run_call(state, events_rx, cancel).await;
        })
    };

    // Forward the rest of the stream into the call.
    while let Some(event) = next_event(&mut source).await {
        let stop = matches!(event, StreamEvent::Stop { .. });
        if events_tx.send(CallEvent::Carrier(event)).is_err() {
            break;
        }
        if stop {
            break;
        }
    }
    let _ = events_tx.send(CallEvent::CarrierClosed);

    let _ = loop_handle.await;
    let _ = carrier_tx.send(TelephonyOut::Close);
    let removed = app
        .registry
        .lock()
        .ok()
        .and_then(|mut registry| registry.remove(&stream_sid));
    if let Some(handle) = removed {
        info!(
            stream_sid = %stream_sid,
            connected_s = handle.started_at.elapsed().as_secs(),
            "call removed from registry"
        );
    }
}

async fn next_event(source: &mut SplitStream<WebSocket>) -> Option<StreamEvent> {
    loop {
        let message = source.next().await?;
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        };
        match serde_json::from_str::<StreamEvent>(&text) {
            Ok(event) => return Some(event),
            Err(e) => {
                // Malformed carrier JSON is dropped, never fatal.
                warn!(error = %e, "malformed carrier frame dropped");
            }
        }
    }
}

fn spawn_writer(
    mut sink: SplitSink<WebSocket, Message>,
    stream_sid: String,
    mut rx: mpsc::UnboundedReceiver<TelephonyOut>,
) {
    tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let payload = match outbound {
                TelephonyOut::Media(frame) => {
                    debug_assert_eq!(frame.len(), FRAME_BYTES);
                    serde_json::json!({
                        "event": "media",
                        "streamSid": stream_sid,
                        "media": {"payload": BASE64.encode(&frame)}
                    })
                }
                TelephonyOut::Mark(name) => serde_json::json!({
                    "event": "mark",
                    "streamSid": stream_sid,
                    "mark": {"name": name}
                }),
                TelephonyOut::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if let Err(e) = sink.send(Message::Text(payload.to_string().into())).await {
                debug!(error = %e, "carrier write failed, stopping writer");
                break;
            }
        }
    });
}
