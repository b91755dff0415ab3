//! Configuration types for the voice bridge.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the bridge process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen port and server settings.
    pub server: ServerConfig,
    /// CRM control-plane endpoints and shared secrets.
    pub crm: CrmConfig,
    /// Realtime model connection settings.
    pub model: ModelConfig,
    /// Outbound pacing settings.
    pub pacing: PacingConfig,
    /// Turn-gate thresholds.
    pub turn_gate: TurnGateConfig,
    /// Barge-in thresholds.
    pub barge_in: BargeInConfig,
    /// Usage reporting coefficients.
    pub usage: UsageConfig,
}

/// HTTP/websocket server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP port to listen on.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 4000 }
    }
}

/// CRM control-plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrmConfig {
    /// Base URL for the CRM endpoints (context, booking, outcome, usage).
    pub base_url: String,
    /// Shared secret for the booking endpoint (`x-ai-dialer-key`).
    pub cron_key: String,
    /// Shared secret for outcome/usage endpoints (`x-agent-key`).
    pub agent_key: String,
}

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_owned(),
            cron_key: String::new(),
            agent_key: String::new(),
        }
    }
}

/// Realtime model connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// API key for the realtime endpoint.
    pub api_key: String,
    /// Model name for the realtime session.
    pub model: String,
    /// Websocket base URL (overridable for tests).
    pub realtime_url: String,
    /// Sampling temperature for response creation.
    pub temperature: f32,
    /// Server-VAD silence duration before a turn is committed.
    pub vad_silence_ms: u32,
    /// Server-VAD prefix padding retained before detected speech.
    pub vad_prefix_padding_ms: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gpt-4o-realtime-preview-2024-12-17".to_owned(),
            realtime_url: "wss://api.openai.com/v1/realtime".to_owned(),
            temperature: 0.6,
            vad_silence_ms: 550,
            vad_prefix_padding_ms: 300,
        }
    }
}

/// Outbound audio pacing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Tick interval in milliseconds. The carrier expects 20 ms frames.
    pub frame_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self { frame_ms: 20 }
    }
}

/// Turn-gate thresholds.
///
/// Durations are tuned against carrier-side VAD behavior; tests tighten
/// them where wall-clock waits would slow the suite.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnGateConfig {
    /// Minimum accumulated non-silence audio for a commit to carry signal.
    pub low_signal_audio_ms: u64,
    /// Window after a speech start/stop in which an empty transcript still
    /// arms a pending turn instead of being dropped.
    pub recent_speech_window_ms: u64,
    /// Minimum spoken duration for the recent-speech pending arm.
    pub recent_speech_min_ms: u64,
    /// Grace timer for filler-only transcripts.
    pub filler_grace_ms: u64,
    /// Filler handling only applies below this audio length.
    pub filler_max_audio_ms: u64,
    /// Audio-only yes/no answers require at least this much speech.
    pub yesno_audio_only_ms: u64,
    /// A pending turn with no transcript is dropped after this long.
    pub pending_turn_ttl_ms: u64,
    /// Window in which a repeated line is swapped for the booking fallback.
    pub anti_loop_window_ms: u64,
    /// Maximum discovery questions per call.
    pub discovery_cap: u32,
    /// Human-pause delay range before creating a response.
    pub human_pause_min_ms: u64,
    pub human_pause_max_ms: u64,
    /// Post-`speech_stopped` watchdog that force-commits.
    pub post_stop_commit_ms: u64,
    /// Stuck-speech watchdog after `speech_started` with no stop.
    pub stuck_speech_ms: u64,
}

impl Default for TurnGateConfig {
    fn default() -> Self {
        Self {
            low_signal_audio_ms: 280,
            recent_speech_window_ms: 1500,
            recent_speech_min_ms: 250,
            filler_grace_ms: 750,
            filler_max_audio_ms: 1700,
            yesno_audio_only_ms: 1200,
            pending_turn_ttl_ms: 2000,
            anti_loop_window_ms: 10_000,
            discovery_cap: 2,
            human_pause_min_ms: 120,
            human_pause_max_ms: 220,
            post_stop_commit_ms: 220,
            stuck_speech_ms: 3400,
        }
    }
}

/// Barge-in thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BargeInConfig {
    /// Minimum time from first outbound audio before a cancel may fire.
    pub cooldown_from_audio_start_ms: u64,
    /// Sustained caller speech required to fire a cancel.
    pub sustained_speech_ms: u64,
    /// Accumulator cap for sustained speech.
    pub sustained_speech_cap_ms: u64,
    /// Minimum spacing between two cancels.
    pub cancel_throttle_ms: u64,
    /// Inbound frames retained for replay after a cancel (20 ms each).
    pub ring_slots: usize,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            cooldown_from_audio_start_ms: 650,
            sustained_speech_ms: 700,
            sustained_speech_cap_ms: 800,
            cancel_throttle_ms: 500,
            ring_slots: 10,
        }
    }
}

/// Usage reporting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    /// Vendor cost coefficient in USD per connected minute.
    pub vendor_cost_per_min_usd: f64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            vendor_cost_per_min_usd: 0.06,
        }
    }
}

impl Config {
    /// Assemble configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error when a required variable is missing or malformed.
    /// Configuration problems are fatal at startup only.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(port) = first_env(&["AI_VOICE_SERVER_PORT", "PORT"]) {
            config.server.port = port
                .parse()
                .map_err(|_| BridgeError::Config(format!("invalid listen port: {port}")))?;
        }

        if let Ok(base) = std::env::var("COVECRM_BASE_URL") {
            config.crm.base_url = base.trim_end_matches('/').to_owned();
        }
        config.crm.cron_key = require_env("AI_DIALER_CRON_KEY")?;
        config.crm.agent_key = require_env("AI_DIALER_AGENT_KEY")?;

        config.model.api_key = require_env("OPENAI_API_KEY")?;
        if let Ok(model) = std::env::var("OPENAI_REALTIME_MODEL") {
            if !model.trim().is_empty() {
                config.model.model = model;
            }
        }

        if let Ok(cost) = std::env::var("AI_DIALER_VENDOR_COST_PER_MIN_USD") {
            config.usage.vendor_cost_per_min_usd = cost.parse().map_err(|_| {
                BridgeError::Config(format!("invalid vendor cost coefficient: {cost}"))
            })?;
        }

        Ok(config)
    }
}

fn require_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(BridgeError::Config(format!("{name} must be set"))),
    }
}

fn first_env(names: &[&str]) -> Option<String> {
    names.iter().find_map(|n| std::env::var(n).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_carrier_cadence() {
        let config = Config::default();
        assert_eq!(config.pacing.frame_ms, 20);
        assert_eq!(config.model.vad_silence_ms, 550);
    }

    #[test]
    fn barge_in_defaults() {
        let b = BargeInConfig::default();
        assert_eq!(b.cooldown_from_audio_start_ms, 650);
        assert_eq!(b.sustained_speech_ms, 700);
        assert_eq!(b.ring_slots, 10);
    }

    #[test]
    fn turn_gate_defaults() {
        let t = TurnGateConfig::default();
        assert_eq!(t.low_signal_audio_ms, 280);
        assert_eq!(t.discovery_cap, 2);
        assert!(t.human_pause_min_ms <= t.human_pause_max_ms);
    }
}
