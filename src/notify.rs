//! Notification and render-feedback boundary.
//!
//! The engine never touches the DOM. Everything the rendering/audio/toast
//! side needs to react to is pushed through `EventSink`, implemented by the
//! embedding adapter. Each emission carries a client-generated id so the
//! adapter can de-duplicate toasts.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum Notification {
    /// A genuinely new order was detected (poll differ or push event).
    NewOrder { order_id: u64, table_label: String },
    /// A transition this client issued succeeded; `notice` carries the
    /// per-transition human copy ("accepted", "sent to kitchen", ...).
    StatusChanged { order_id: u64, notice: String },
    /// An action target was already transitioned by someone else.
    OrderTaken {
        order_id: u64,
        assignee: Option<String>,
    },
    WaiterCall {
        call_id: u64,
        table_label: String,
        note: Option<String>,
    },
    /// Non-fatal failure feedback; the triggering control is re-enabled.
    Feedback { message: String, is_error: bool },
}

/// A notification plus the envelope fields the adapter needs for display
/// and de-duplication.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Notification,
}

impl Envelope {
    pub fn new(event: Notification) -> Self {
        Self {
            id: Uuid::new_v4(),
            at: Utc::now(),
            event,
        }
    }
}

/// Implemented by the rendering adapter. All methods are fire-and-forget
/// from the engine's point of view and must not block.
pub trait EventSink: Send + Sync {
    fn notify(&self, envelope: Envelope);
    /// One row changed; re-render it immediately for low-latency feedback.
    fn invalidate_row(&self, order_id: u64);
    /// Membership or ordering may have changed; re-run projection + render.
    fn refresh_view(&self);
}

/// Sink that drops everything; for embedders that poll projections instead.
pub struct NullSink;

impl EventSink for NullSink {
    fn notify(&self, _envelope: Envelope) {}
    fn invalidate_row(&self, _order_id: u64) {}
    fn refresh_view(&self) {}
}
