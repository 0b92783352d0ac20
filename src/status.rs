//! Canonical workflow/session status vocabulary and normalization.
//!
//! Order and session statuses arrive from several server generations with
//! alternate spellings. Everything entering the order store goes through
//! `normalize` first so downstream filtering, sorting, and view partitioning
//! only ever see the canonical vocabulary.

use serde::{Deserialize, Serialize};
use tracing::warn;

// ---------------------------------------------------------------------------
// Workflow status
// ---------------------------------------------------------------------------

/// Canonical order workflow states, in lifecycle order. `Other` carries an
/// unrecognized token through unchanged (permissive fallback; logged once at
/// normalization time so leaks stay observable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WorkflowStatus {
    New,
    Queued,
    Preparing,
    Ready,
    Delivered,
    AwaitingPayment,
    Paid,
    Cancelled,
    Other(String),
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &str {
        match self {
            WorkflowStatus::New => "new",
            WorkflowStatus::Queued => "queued",
            WorkflowStatus::Preparing => "preparing",
            WorkflowStatus::Ready => "ready",
            WorkflowStatus::Delivered => "delivered",
            WorkflowStatus::AwaitingPayment => "awaiting_payment",
            WorkflowStatus::Paid => "paid",
            WorkflowStatus::Cancelled => "cancelled",
            WorkflowStatus::Other(s) => s,
        }
    }

    /// True for states before payment has started; cancellation is only
    /// reachable from these.
    pub fn is_pre_payment(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::New
                | WorkflowStatus::Queued
                | WorkflowStatus::Preparing
                | WorkflowStatus::Ready
                | WorkflowStatus::Delivered
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Paid | WorkflowStatus::Cancelled)
    }

    /// The next transition in the canonical chain, if any.
    pub fn next(&self) -> Option<WorkflowStatus> {
        match self {
            WorkflowStatus::New => Some(WorkflowStatus::Queued),
            WorkflowStatus::Queued => Some(WorkflowStatus::Preparing),
            WorkflowStatus::Preparing => Some(WorkflowStatus::Ready),
            WorkflowStatus::Ready => Some(WorkflowStatus::Delivered),
            WorkflowStatus::Delivered => Some(WorkflowStatus::AwaitingPayment),
            WorkflowStatus::AwaitingPayment => Some(WorkflowStatus::Paid),
            _ => None,
        }
    }
}

impl Default for WorkflowStatus {
    fn default() -> Self {
        WorkflowStatus::New
    }
}

impl From<String> for WorkflowStatus {
    fn from(s: String) -> Self {
        match canonical_workflow_token(&s) {
            Some(c) => c,
            None => WorkflowStatus::Other(s),
        }
    }
}

impl From<WorkflowStatus> for String {
    fn from(s: WorkflowStatus) -> Self {
        match s {
            WorkflowStatus::Other(raw) => raw,
            other => other.as_str().to_string(),
        }
    }
}

/// Map a canonical spelling to its enum variant. Does NOT consult the legacy
/// alias table; that is `normalize`'s job.
fn canonical_workflow_token(token: &str) -> Option<WorkflowStatus> {
    match token.trim().to_ascii_lowercase().as_str() {
        "new" => Some(WorkflowStatus::New),
        "queued" => Some(WorkflowStatus::Queued),
        "preparing" => Some(WorkflowStatus::Preparing),
        "ready" => Some(WorkflowStatus::Ready),
        "delivered" => Some(WorkflowStatus::Delivered),
        "awaiting_payment" => Some(WorkflowStatus::AwaitingPayment),
        "paid" => Some(WorkflowStatus::Paid),
        "cancelled" => Some(WorkflowStatus::Cancelled),
        _ => None,
    }
}

/// Legacy/alternate spellings accepted from older server generations.
fn legacy_workflow_token(token: &str) -> Option<WorkflowStatus> {
    match token.trim().to_ascii_lowercase().as_str() {
        "requested" | "pending" | "placed" => Some(WorkflowStatus::New),
        "accepted" | "confirmed" => Some(WorkflowStatus::Queued),
        "in_kitchen" | "in-kitchen" | "cooking" | "kitchen" => Some(WorkflowStatus::Preparing),
        "prepared" | "ready_for_delivery" => Some(WorkflowStatus::Ready),
        "completed" | "served" => Some(WorkflowStatus::Delivered),
        "awaiting-payment" | "payment_pending" | "awaitingpayment" => {
            Some(WorkflowStatus::AwaitingPayment)
        }
        "closed" | "settled" => Some(WorkflowStatus::Paid),
        "rejected" | "voided" | "canceled" => Some(WorkflowStatus::Cancelled),
        _ => None,
    }
}

/// Normalize a raw status plus an optional legacy token to exactly one
/// canonical status.
///
/// Lookup order: a known legacy token wins over the primary token; a known
/// primary token (canonical or legacy spelling) is mapped; anything else is
/// passed through unchanged as `Other`. Pure and idempotent.
pub fn normalize(raw: &str, legacy: Option<&str>) -> WorkflowStatus {
    if let Some(l) = legacy {
        if let Some(c) = canonical_workflow_token(l).or_else(|| legacy_workflow_token(l)) {
            return c;
        }
    }
    if let Some(c) = canonical_workflow_token(raw).or_else(|| legacy_workflow_token(raw)) {
        return c;
    }
    warn!(token = raw, "unrecognized workflow status passed through");
    WorkflowStatus::Other(raw.to_string())
}

/// Re-normalize an already-typed status (used when re-validating a record
/// that still carries its legacy token).
pub fn renormalize(status: &WorkflowStatus, legacy: Option<&str>) -> WorkflowStatus {
    normalize(status.as_str(), legacy)
}

// ---------------------------------------------------------------------------
// Session status
// ---------------------------------------------------------------------------

/// Lifecycle status of the table session an order belongs to. Gates order
/// visibility independently of the order-level workflow status.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SessionStatus {
    Open,
    CheckoutRequested,
    CheckoutConfirmed,
    Paid,
    Closed,
    Finished,
    Other(String),
}

impl SessionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SessionStatus::Open => "open",
            SessionStatus::CheckoutRequested => "checkout_requested",
            SessionStatus::CheckoutConfirmed => "checkout_confirmed",
            SessionStatus::Paid => "paid",
            SessionStatus::Closed => "closed",
            SessionStatus::Finished => "finished",
            SessionStatus::Other(s) => s,
        }
    }

    /// Open for ordering, including the checkout sub-states.
    pub fn is_open_or_checkout(&self) -> bool {
        matches!(
            self,
            SessionStatus::Open
                | SessionStatus::CheckoutRequested
                | SessionStatus::CheckoutConfirmed
        )
    }

    /// Terminal paid/closed states; orders of such sessions are
    /// unconditionally excluded from the active view.
    pub fn is_terminal_paid(&self) -> bool {
        matches!(self, SessionStatus::Paid | SessionStatus::Closed)
    }

    /// Finished in any way; starred orders of finished sessions are evicted
    /// from the tracking view.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            SessionStatus::Paid | SessionStatus::Closed | SessionStatus::Finished
        )
    }
}

impl From<String> for SessionStatus {
    fn from(s: String) -> Self {
        normalize_session(&s)
    }
}

impl From<SessionStatus> for String {
    fn from(s: SessionStatus) -> Self {
        match s {
            SessionStatus::Other(raw) => raw,
            other => other.as_str().to_string(),
        }
    }
}

/// Session statuses use the same permissive normalization policy as workflow
/// statuses: known tokens (including older spellings) map to canonical
/// variants, anything else passes through.
pub fn normalize_session(raw: &str) -> SessionStatus {
    match raw.trim().to_ascii_lowercase().as_str() {
        "open" | "active" | "seated" => SessionStatus::Open,
        "checkout_requested" | "checkout-requested" | "checkout" => {
            SessionStatus::CheckoutRequested
        }
        "checkout_confirmed" | "checkout-confirmed" => SessionStatus::CheckoutConfirmed,
        "paid" => SessionStatus::Paid,
        "closed" => SessionStatus::Closed,
        "finished" | "done" => SessionStatus::Finished,
        _ => SessionStatus::Other(raw.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Payment status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Refunded,
    Other(String),
}

impl PaymentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Other(s) => s,
        }
    }
}

impl Default for PaymentStatus {
    fn default() -> Self {
        PaymentStatus::Pending
    }
}

impl From<String> for PaymentStatus {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" | "unpaid" => PaymentStatus::Pending,
            "paid" => PaymentStatus::Paid,
            "refunded" => PaymentStatus::Refunded,
            _ => PaymentStatus::Other(s),
        }
    }
}

impl From<PaymentStatus> for String {
    fn from(s: PaymentStatus) -> Self {
        match s {
            PaymentStatus::Other(raw) => raw,
            other => other.as_str().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_normalizes_to_new() {
        assert_eq!(normalize("requested", None), WorkflowStatus::New);
    }

    #[test]
    fn test_legacy_token_takes_precedence() {
        // Primary says preparing, legacy says served: legacy wins.
        assert_eq!(
            normalize("preparing", Some("served")),
            WorkflowStatus::Delivered
        );
    }

    #[test]
    fn test_unknown_legacy_falls_back_to_primary() {
        assert_eq!(
            normalize("ready", Some("not-a-status")),
            WorkflowStatus::Ready
        );
    }

    #[test]
    fn test_unknown_token_passes_through() {
        assert_eq!(
            normalize("weird_state", None),
            WorkflowStatus::Other("weird_state".to_string())
        );
    }

    #[test]
    fn test_normalization_is_idempotent_and_total() {
        let legacy_tokens = [
            "requested",
            "pending",
            "placed",
            "accepted",
            "confirmed",
            "in_kitchen",
            "cooking",
            "prepared",
            "completed",
            "served",
            "awaiting-payment",
            "payment_pending",
            "closed",
            "rejected",
            "voided",
            "weird_state",
        ];
        for token in legacy_tokens {
            let once = normalize(token, None);
            let twice = normalize(once.as_str(), None);
            assert_eq!(once, twice, "normalize not idempotent for {token}");
        }
    }

    #[test]
    fn test_every_known_legacy_token_maps_to_one_canonical_value() {
        for token in [
            "requested",
            "accepted",
            "in_kitchen",
            "prepared",
            "completed",
            "payment_pending",
            "closed",
            "rejected",
        ] {
            let status = normalize(token, None);
            assert!(
                !matches!(status, WorkflowStatus::Other(_)),
                "legacy token {token} did not map to a canonical value"
            );
        }
    }

    #[test]
    fn test_serde_round_trip_preserves_unknown_tokens() {
        let status: WorkflowStatus = serde_json::from_str("\"mystery\"").unwrap();
        assert_eq!(status, WorkflowStatus::Other("mystery".to_string()));
        assert_eq!(serde_json::to_string(&status).unwrap(), "\"mystery\"");
    }

    #[test]
    fn test_session_checkout_substates_count_as_open() {
        assert!(normalize_session("checkout_requested").is_open_or_checkout());
        assert!(normalize_session("open").is_open_or_checkout());
        assert!(!normalize_session("paid").is_open_or_checkout());
    }

    #[test]
    fn test_session_terminal_paid() {
        assert!(normalize_session("paid").is_terminal_paid());
        assert!(normalize_session("closed").is_terminal_paid());
        assert!(!normalize_session("finished").is_terminal_paid());
        assert!(normalize_session("finished").is_finished());
    }
}
