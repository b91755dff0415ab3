//! CRM control-plane client: context fetch, booking, outcome, usage.
//!
//! Every endpoint is idempotent JSON over HTTPS with a shared-secret
//! header. Failures are logged and never fatal to a call; the model may
//! retry control emission on its own.

use crate::config::CrmConfig;
use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Shared-secret header for the booking endpoint.
const DIALER_KEY_HEADER: &str = "x-ai-dialer-key";
/// Shared-secret header for outcome/usage endpoints.
const AGENT_KEY_HEADER: &str = "x-agent-key";

/// Voice profile for the call: assistant display name plus the model
/// voice id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VoiceProfile {
    pub assistant_name: String,
    pub voice_id: String,
}

impl Default for VoiceProfile {
    fn default() -> Self {
        Self {
            assistant_name: "Ava".to_owned(),
            voice_id: "alloy".to_owned(),
        }
    }
}

/// Immutable per-call snapshot fetched from the CRM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallContext {
    pub user_email: Option<String>,
    pub agent_name: String,
    pub agent_time_zone: Option<String>,
    pub lead_id: Option<String>,
    pub lead_first_name: Option<String>,
    pub lead_phone: Option<String>,
    pub lead_email: Option<String>,
    pub lead_time_zone: Option<String>,
    pub script_key: Option<String>,
    pub voice: VoiceProfile,
    pub notes: Option<String>,
    pub answered_by: Option<String>,
}

impl CallContext {
    /// Agent first name as spoken on the call.
    pub fn agent_first_name(&self) -> &str {
        self.agent_name
            .split_whitespace()
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("the agent")
    }

    /// Lead first name as spoken on the call.
    pub fn lead_first_name_or_default(&self) -> &str {
        self.lead_first_name
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("there")
    }
}

#[derive(Debug, Deserialize)]
struct ContextResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    context: Option<CallContext>,
}

/// Booking payload posted to the CRM.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookAppointmentRequest {
    pub ai_call_session_id: String,
    pub lead_id: String,
    /// ISO-8601 UTC start time.
    pub start_time_utc: String,
    pub duration_minutes: u32,
    pub lead_time_zone: String,
    pub agent_time_zone: String,
    pub notes: String,
    pub source: String,
}

#[derive(Debug, Deserialize)]
struct BookResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    event_id: Option<String>,
}

/// Terminal call outcome posted to the CRM.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeRequest {
    pub ai_call_session_id: String,
    pub lead_id: String,
    pub call_sid: String,
    pub outcome: String,
}

/// Per-call usage posted on termination.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRequest {
    pub ai_call_session_id: String,
    pub call_sid: String,
    pub minutes: u64,
    pub vendor_cost_usd: f64,
}

/// HTTP client for the CRM control plane.
#[derive(Clone)]
pub struct CrmClient {
    http: reqwest::Client,
    base_url: String,
    cron_key: String,
    agent_key: String,
}

impl CrmClient {
    pub fn new(config: &CrmConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            cron_key: config.cron_key.clone(),
            agent_key: config.agent_key.clone(),
        }
    }

    /// Fetch the immutable call context.
    ///
    /// # Errors
    ///
    /// Returns an error when the endpoint is unreachable or replies
    /// without a context. Callers fall back to a default context.
    pub async fn fetch_context(
        &self,
        session_id: &str,
        lead_id: &str,
        call_sid: &str,
    ) -> Result<CallContext> {
        let url = format!("{}/context", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("sessionId", session_id),
                ("leadId", lead_id),
                ("callSid", call_sid),
                ("key", &self.cron_key),
            ])
            .send()
            .await
            .map_err(|e| BridgeError::Crm(format!("context fetch failed: {e}")))?;

        let body: ContextResponse = response
            .json()
            .await
            .map_err(|e| BridgeError::Crm(format!("context decode failed: {e}")))?;
        if !body.ok {
            return Err(BridgeError::Crm("context endpoint replied not-ok".to_owned()));
        }
        body.context
            .ok_or_else(|| BridgeError::Crm("context endpoint returned no context".to_owned()))
    }

    /// Re-fetch only the `answeredBy` hint.
    pub async fn refresh_answered_by(
        &self,
        session_id: &str,
        lead_id: &str,
        call_sid: &str,
    ) -> Option<String> {
        match self.fetch_context(session_id, lead_id, call_sid).await {
            Ok(context) => context.answered_by,
            Err(e) => {
                warn!(error = %e, "answeredBy refresh failed");
                None
            }
        }
    }

    /// Forward a validated booking to the CRM.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a not-ok reply. Callers
    /// log and continue; the model may retry.
    pub async fn book_appointment(&self, request: &BookAppointmentRequest) -> Result<String> {
        let url = format!("{}/book-appointment", self.base_url);
        let response = self
            .http
            .post(&url)
            .query(&[("key", &self.cron_key)])
            .header(DIALER_KEY_HEADER, &self.cron_key)
            .json(request)
            .send()
            .await
            .map_err(|e| BridgeError::Crm(format!("booking POST failed: {e}")))?;

        let body: BookResponse = response
            .json()
            .await
            .map_err(|e| BridgeError::Crm(format!("booking decode failed: {e}")))?;
        if !body.ok {
            return Err(BridgeError::Crm("booking endpoint replied not-ok".to_owned()));
        }
        let event_id = body.event_id.unwrap_or_default();
        info!(event_id = %event_id, "appointment booked");
        Ok(event_id)
    }

    /// Post a terminal outcome. Logged-only on failure.
    pub async fn post_outcome(&self, request: &OutcomeRequest) {
        let url = format!("{}/outcome", self.base_url);
        let result = self
            .http
            .post(&url)
            .header(AGENT_KEY_HEADER, &self.agent_key)
            .json(request)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                info!(outcome = %request.outcome, "outcome posted");
            }
            Ok(response) => {
                warn!(status = %response.status(), "outcome endpoint replied with error");
            }
            Err(e) => warn!(error = %e, "outcome POST failed"),
        }
    }

    /// Post billed minutes. Logged-only on failure.
    pub async fn post_usage(&self, request: &UsageRequest) {
        let url = format!("{}/usage", self.base_url);
        let result = self
            .http
            .post(&url)
            .header(AGENT_KEY_HEADER, &self.agent_key)
            .json(request)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                info!(minutes = request.minutes, "usage posted");
            }
            Ok(response) => {
                warn!(status = %response.status(), "usage endpoint replied with error");
            }
            Err(e) => warn!(error = %e, "usage POST failed"),
        }
    }
}

/// Billable whole minutes for a connected call. A connected call always
/// bills at least one minute.
pub fn billable_minutes(connected: Duration) -> u64 {
    let secs = connected.as_secs();
    secs.div_ceil(60).max(1)
}
