use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the previous session ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionOutcome {
    Stopped,
    Cancelled,
    /// Torn down through the external failure hook.
    CancelledByFailure,
    /// Capture loop exhausted its restart budget.
    Failed,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::Stopped => "Stopped",
            SessionOutcome::Cancelled => "Cancelled",
            SessionOutcome::CancelledByFailure => "CancelledByFailure",
            SessionOutcome::Failed => "Failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdentity {
    pub session_id: String,
    pub patient_id: String,
    pub test_type: Option<String>,
    pub started_at: DateTime<Utc>,
}
