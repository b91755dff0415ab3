//! covevoice: real-time voice-agent bridge.
//!
//! Mediates between a telephony carrier's audio-streaming websocket
//! (μ-law 8 kHz frames from a live phone call) and a cloud speech
//! model's realtime websocket. For each call it negotiates the model
//! session, streams caller audio upstream, paces model audio downstream
//! at the carrier's 20 ms cadence, drives a deterministic booking dialog
//! stepper, and reports terminal outcomes to the CRM.
//!
//! # Architecture
//!
//! Each call is a single task fed by one event channel:
//! - **telephony**: carrier stream events and outbound frame writer
//! - **openai**: realtime model link (session config, audio, responses)
//! - **audio**: μ-law classification and 20 ms outbound pacing
//! - **call**: per-call state machine, turn gate, barge-in, watchdogs
//! - **script**: the booking dialog stepper and its classifiers
//! - **booking / control / crm**: terminal controls and the CRM plane

pub mod audio;
pub mod booking;
pub mod call;
pub mod config;
pub mod control;
pub mod crm;
pub mod error;
pub mod openai;
pub mod script;
pub mod server;
pub mod telephony;

pub use config::Config;
pub use error::{BridgeError, Result};
pub use server::AppState;
