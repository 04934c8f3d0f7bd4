//! Message types exchanged over the broker: the inbound trigger request and
//! the outbound status report.

use serde::{Deserialize, Serialize};

/// Filename prefix used when a trigger does not name one.
pub const DEFAULT_PREFIX: &str = "snapshot";

/// What a trigger asks for.  Parsed leniently: anything that is not a JSON
/// object with a string `prefix` falls back to the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub prefix: String,
}

impl Default for CaptureRequest {
    fn default() -> Self {
        CaptureRequest {
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

impl CaptureRequest {
    pub fn from_payload(text: &str) -> Self {
        if text.is_empty() {
            return Self::default();
        }
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(serde_json::Value::Object(obj)) => match obj.get("prefix") {
                Some(serde_json::Value::String(p)) => CaptureRequest { prefix: p.clone() },
                _ => Self::default(),
            },
            _ => Self::default(),
        }
    }
}

/// Result of one capture job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOutcome {
    pub success: bool,
    /// Output path on success, error description on failure.
    pub detail: String,
}

impl CaptureOutcome {
    pub fn saved(path: &std::path::Path) -> Self {
        CaptureOutcome {
            success: true,
            detail: path.display().to_string(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        CaptureOutcome {
            success: false,
            detail: reason.into(),
        }
    }
}

/// Status message body.  Field order is part of the wire format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusPayload {
    /// ISO-8601 local time the job finished.
    pub timestamp: String,
    pub success: bool,
    pub info: String,
    /// The trigger payload, verbatim, for correlation.
    pub request_payload: Option<String>,
}

impl StatusPayload {
    pub fn new(outcome: &CaptureOutcome, request_payload: Option<String>) -> Self {
        StatusPayload {
            timestamp: chrono::Local::now().to_rfc3339(),
            success: outcome.success,
            info: outcome.detail.clone(),
            request_payload,
        }
    }
}
