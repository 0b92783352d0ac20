//! Error taxonomy for the dashboard engine.
//!
//! No category is fatal to the running dashboard: every failure path ends in
//! a re-enabled, retryable state. Permission failures do not exist
//! client-side; actions the current role cannot perform are simply not
//! offered, and the server stays the authority of record.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DashboardError {
    /// Fetch failure or non-2xx response; surfaced as transient feedback.
    #[error("{0}")]
    Network(String),

    /// The action target was already transitioned by another actor. Handled
    /// by refreshing and reporting the current assignee, never as a bare
    /// error string.
    #[error("order already taken")]
    Conflict { assignee: Option<String> },

    /// Rejected locally before any network call.
    #[error("{0}")]
    Validation(String),

    /// A request exceeded its fixed deadline; no partial write is assumed.
    #[error("{0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, DashboardError>;

impl DashboardError {
    pub fn validation(msg: impl Into<String>) -> Self {
        DashboardError::Validation(msg.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, DashboardError::Conflict { .. })
    }
}

// ---------------------------------------------------------------------------
// Conflict detection
// ---------------------------------------------------------------------------

/// Structured conflict detection: the server marks take-over conflicts with
/// HTTP 409 and/or an error `code` field. The human-readable text match
/// below is a compatibility shim for servers that predate the code field,
/// not a design target.
pub fn is_conflict_response(status: u16, body: Option<&Value>) -> bool {
    if status == 409 {
        return true;
    }
    let Some(body) = body else { return false };
    if let Some(code) = body.get("code").and_then(Value::as_str) {
        if code == "already_assigned" || code == "conflict" {
            return true;
        }
    }
    body.get("error")
        .or_else(|| body.get("message"))
        .and_then(Value::as_str)
        .map(is_conflict_message)
        .unwrap_or(false)
}

/// Legacy shim: match the human-readable error text older servers send.
pub fn is_conflict_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    (lower.contains("already") && (lower.contains("assigned") || lower.contains("accepted")))
        || lower.contains("taken by")
}

/// Pull the current assignee name out of a conflict body when the server
/// includes it.
pub fn conflict_assignee(body: Option<&Value>) -> Option<String> {
    let body = body?;
    body.get("assigneeName")
        .or_else(|| body.get("assignee_name"))
        .or_else(|| body.get("assignee"))
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_code_detected() {
        let body = serde_json::json!({ "code": "already_assigned" });
        assert!(is_conflict_response(400, Some(&body)));
    }

    #[test]
    fn test_http_409_detected_without_body() {
        assert!(is_conflict_response(409, None));
    }

    #[test]
    fn test_legacy_message_shim() {
        let body = serde_json::json!({ "error": "Order was already accepted by another waiter" });
        assert!(is_conflict_response(400, Some(&body)));
        assert!(!is_conflict_message("kitchen is on fire"));
    }

    #[test]
    fn test_conflict_assignee_extraction() {
        let body = serde_json::json!({ "code": "already_assigned", "assigneeName": "Marco" });
        assert_eq!(conflict_assignee(Some(&body)).as_deref(), Some("Marco"));
        assert_eq!(conflict_assignee(None), None);
    }
}
