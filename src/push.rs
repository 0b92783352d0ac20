//! Push-sync ingestion: typed events and synchronous field patches.
//!
//! The push channel delivers named events with loosely-shaped JSON payloads.
//! Each event is parsed into a typed `PushEvent`, the relevant fields of the
//! in-memory record are patched synchronously for low-latency feedback, and
//! the caller schedules a debounced authoritative refresh. Patches are
//! optimistic overlays; the next full refresh supersedes them wholesale.

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::model::{Order, WaiterCall};
use crate::status::{self, SessionStatus};
use crate::store::OrderStore;

// ---------------------------------------------------------------------------
// Payload field helpers
// ---------------------------------------------------------------------------

fn value_str(v: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

fn value_u64(v: &Value, keys: &[&str]) -> Option<u64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(|x| x.as_u64()) {
            return Some(n);
        }
        // Older payloads ship numeric ids as strings.
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            if let Ok(n) = s.trim().parse::<u64>() {
                return Some(n);
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Typed events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum PushEvent {
    /// A new order record; carries the full snapshot when the server has it.
    OrderNew(Box<Order>),
    OrderStatusChanged {
        order_id: u64,
        status: String,
        legacy_status: Option<String>,
        assignee_id: Option<u64>,
        assignee_name: Option<String>,
    },
    OrderAutoAccepted {
        order_id: u64,
        assignee_id: Option<u64>,
        assignee_name: Option<String>,
    },
    SessionStatusChanged {
        session_id: u64,
        status: String,
    },
    SessionPaid {
        session_id: u64,
    },
    WaiterCall(Box<WaiterCall>),
}

impl PushEvent {
    /// Parse a named event off the push channel. Both the dotted bus names
    /// and the flat channel names are accepted; unknown events return
    /// `None` and are ignored (polling remains the correctness net).
    pub fn parse(name: &str, payload: &Value) -> Option<PushEvent> {
        match name {
            "orders.new" | "new_order" => {
                let raw = payload.get("order").unwrap_or(payload);
                let order: Order = serde_json::from_value(raw.clone()).ok()?;
                Some(PushEvent::OrderNew(Box::new(order.normalized())))
            }
            "orders.status_changed" | "order_status_changed" => Some(PushEvent::OrderStatusChanged {
                order_id: value_u64(payload, &["orderId", "order_id", "id"])?,
                status: value_str(payload, &["status", "workflowStatus", "workflow_status"])?,
                legacy_status: value_str(payload, &["legacyStatus", "legacy_status"]),
                assignee_id: value_u64(payload, &["assigneeId", "assignee_id", "waiterId"]),
                assignee_name: value_str(payload, &["assigneeName", "assignee_name", "waiterName"]),
            }),
            "orders.auto_accepted" => Some(PushEvent::OrderAutoAccepted {
                order_id: value_u64(payload, &["orderId", "order_id", "id"])?,
                assignee_id: value_u64(payload, &["assigneeId", "assignee_id"]),
                assignee_name: value_str(payload, &["assigneeName", "assignee_name"]),
            }),
            "sessions.status_changed" => Some(PushEvent::SessionStatusChanged {
                session_id: value_u64(payload, &["sessionId", "session_id", "id"])?,
                status: value_str(payload, &["status"])?,
            }),
            "sessions.paid" => Some(PushEvent::SessionPaid {
                session_id: value_u64(payload, &["sessionId", "session_id", "id"])?,
            }),
            "waiter_call" => {
                let raw = payload.get("call").unwrap_or(payload);
                let call: WaiterCall = serde_json::from_value(raw.clone()).ok()?;
                Some(PushEvent::WaiterCall(Box::new(call)))
            }
            other => {
                debug!(event = other, "ignoring unknown push event");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Patch application
// ---------------------------------------------------------------------------

/// Apply an event as a targeted field overlay. Runs synchronously under the
/// store lock; no await points, so a single patch is atomic with respect to
/// any concurrent filter/sort re-run. Returns the affected order ids so the
/// caller can invalidate exactly those rows.
pub fn apply_patch(store: &mut OrderStore, event: &PushEvent) -> Vec<u64> {
    match event {
        PushEvent::OrderNew(order) => {
            let id = order.id;
            store.upsert((**order).clone());
            vec![id]
        }
        PushEvent::OrderStatusChanged {
            order_id,
            status,
            legacy_status,
            assignee_id,
            assignee_name,
        } => {
            let Some(order) = store.get_mut(*order_id) else {
                return Vec::new();
            };
            order.workflow_status = status::normalize(status, legacy_status.as_deref());
            order.legacy_status = legacy_status.clone();
            if assignee_id.is_some() {
                order.assignee_id = *assignee_id;
                order.assignee_name = assignee_name.clone();
            }
            order.updated_at = Some(Utc::now());
            vec![*order_id]
        }
        PushEvent::OrderAutoAccepted {
            order_id,
            assignee_id,
            assignee_name,
        } => {
            let Some(order) = store.get_mut(*order_id) else {
                return Vec::new();
            };
            order.workflow_status = status::normalize("queued", None);
            order.assignee_id = *assignee_id;
            order.assignee_name = assignee_name.clone();
            order.updated_at = Some(Utc::now());
            vec![*order_id]
        }
        PushEvent::SessionStatusChanged { session_id, status } => {
            patch_session_status(store, *session_id, status::normalize_session(status))
        }
        PushEvent::SessionPaid { session_id } => {
            patch_session_status(store, *session_id, SessionStatus::Paid)
        }
        // Waiter calls do not live in the order store.
        PushEvent::WaiterCall(_) => Vec::new(),
    }
}

fn patch_session_status(
    store: &mut OrderStore,
    session_id: u64,
    status: SessionStatus,
) -> Vec<u64> {
    let ids: Vec<u64> = store.session_orders(session_id).map(|o| o.id).collect();
    for id in &ids {
        if let Some(order) = store.get_mut(*id) {
            order.session.status = Some(status.clone());
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::WorkflowStatus;

    fn seeded_store() -> OrderStore {
        let mut store = OrderStore::new();
        for (id, session) in [(1u64, 9u64), (2, 9), (3, 4)] {
            store.upsert(Order {
                id,
                session_id: session,
                workflow_status: WorkflowStatus::Queued,
                ..Order::default()
            });
        }
        store
    }

    #[test]
    fn test_parse_accepts_both_event_name_spellings() {
        let payload = serde_json::json!({ "orderId": 1, "status": "ready" });
        assert!(PushEvent::parse("orders.status_changed", &payload).is_some());
        assert!(PushEvent::parse("order_status_changed", &payload).is_some());
        assert!(PushEvent::parse("orders.unknown", &payload).is_none());
    }

    #[test]
    fn test_status_patch_normalizes_and_targets_one_record() {
        let mut store = seeded_store();
        let event = PushEvent::parse(
            "orders.status_changed",
            &serde_json::json!({ "order_id": "2", "status": "prepared" }),
        )
        .unwrap();
        let affected = apply_patch(&mut store, &event);
        assert_eq!(affected, vec![2]);
        assert_eq!(store.get(2).unwrap().workflow_status, WorkflowStatus::Ready);
        assert_eq!(store.get(1).unwrap().workflow_status, WorkflowStatus::Queued);
    }

    #[test]
    fn test_patch_for_unknown_order_is_a_noop() {
        let mut store = seeded_store();
        let event = PushEvent::OrderStatusChanged {
            order_id: 77,
            status: "ready".into(),
            legacy_status: None,
            assignee_id: None,
            assignee_name: None,
        };
        assert!(apply_patch(&mut store, &event).is_empty());
    }

    #[test]
    fn test_session_paid_patches_every_session_order() {
        let mut store = seeded_store();
        let event = PushEvent::parse("sessions.paid", &serde_json::json!({ "sessionId": 9 })).unwrap();
        let mut affected = apply_patch(&mut store, &event);
        affected.sort_unstable();
        assert_eq!(affected, vec![1, 2]);
        assert!(store.get(1).unwrap().session_status().is_terminal_paid());
        assert!(!store.get(3).unwrap().session_status().is_terminal_paid());
    }

    #[test]
    fn test_auto_accept_sets_assignee_and_queued() {
        let mut store = seeded_store();
        store.get_mut(1).unwrap().workflow_status = WorkflowStatus::New;
        let event = PushEvent::parse(
            "orders.auto_accepted",
            &serde_json::json!({ "orderId": 1, "assigneeId": 5, "assigneeName": "Mira" }),
        )
        .unwrap();
        apply_patch(&mut store, &event);
        let order = store.get(1).unwrap();
        assert_eq!(order.workflow_status, WorkflowStatus::Queued);
        assert_eq!(order.assignee_name.as_deref(), Some("Mira"));
    }

    #[test]
    fn test_new_order_event_inserts_normalized_record() {
        let mut store = seeded_store();
        let event = PushEvent::parse(
            "new_order",
            &serde_json::json!({ "order": { "id": 50, "sessionId": 2, "status": "requested" } }),
        )
        .unwrap();
        apply_patch(&mut store, &event);
        assert_eq!(store.get(50).unwrap().workflow_status, WorkflowStatus::New);
    }
}
