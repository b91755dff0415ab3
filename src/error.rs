//! Error types for the voice bridge.

/// Top-level error type for the carrier/model bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Carrier stream error (malformed frame, closed socket).
    #[error("telephony error: {0}")]
    Telephony(String),

    /// Realtime model websocket error.
    #[error("model error: {0}")]
    Model(String),

    /// Audio decode or pacing error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Script extraction or stepper error.
    #[error("script error: {0}")]
    Script(String),

    /// Booking validation error.
    #[error("booking error: {0}")]
    Booking(String),

    /// CRM control-plane HTTP error.
    #[error("CRM error: {0}")]
    Crm(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Time-zone resolution error.
    #[error("timezone error: {0}")]
    Timezone(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, BridgeError>;
