//! Workflow state machine and action dispatcher.
//!
//! Executes status transitions against the server, one request/response
//! round trip per transition. Handles the re-entrancy guard (a second click
//! while a request is in flight is a no-op), conflict recovery (the target
//! was already transitioned by someone else), the partial-delivery
//! sub-machine, the cancellation sub-flow, and debounced waiter-note saves.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::api::ApiClient;
use crate::config::CancelReasonFlag;
use crate::error::{DashboardError, Result};
use crate::lock;
use crate::notify::{Envelope, EventSink, Notification};
use crate::status::WorkflowStatus;
use crate::store::OrderStore;
use crate::sync::{ResetTimer, SyncEngine};

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// Staff-initiated workflow transitions. The canonical chain is
/// `new -> queued -> preparing -> ready -> delivered -> awaiting_payment ->
/// paid`; `cancelled` is reachable from any pre-payment state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Accept,
    StartPreparing,
    MarkReady,
    Deliver,
    Cancel,
}

impl Transition {
    /// URL tail under `/api/orders/{id}/`.
    pub fn segment(&self) -> &'static str {
        match self {
            Transition::Accept => "accept",
            Transition::StartPreparing => "kitchen/start",
            Transition::MarkReady => "kitchen/ready",
            Transition::Deliver => "deliver",
            Transition::Cancel => "cancel",
        }
    }

    /// Human copy for the success notice, distinct per transition.
    pub fn notice(&self) -> &'static str {
        match self {
            Transition::Accept => "Order accepted",
            Transition::StartPreparing => "Order sent to kitchen",
            Transition::MarkReady => "Order ready for delivery",
            Transition::Deliver => "Order delivered",
            Transition::Cancel => "Order cancelled",
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct ActionDispatcher {
    api: Arc<ApiClient>,
    store: Arc<Mutex<OrderStore>>,
    sink: Arc<dyn EventSink>,
    engine: Arc<SyncEngine>,
    cancel_flag: CancelReasonFlag,
    /// (order id, action segment) pairs currently in flight.
    in_flight: Mutex<HashSet<(u64, &'static str)>>,
    note_timers: Mutex<HashMap<u64, Arc<ResetTimer>>>,
    note_debounce: Duration,
}

impl ActionDispatcher {
    pub fn new(
        api: Arc<ApiClient>,
        store: Arc<Mutex<OrderStore>>,
        sink: Arc<dyn EventSink>,
        engine: Arc<SyncEngine>,
        note_debounce: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            store,
            sink,
            engine,
            cancel_flag: CancelReasonFlag::new(),
            in_flight: Mutex::new(HashSet::new()),
            note_timers: Mutex::new(HashMap::new()),
            note_debounce,
        })
    }

    /// Execute a workflow transition for an order.
    ///
    /// Returns `Ok(true)` when the transition was performed, `Ok(false)`
    /// when it was a guarded no-op or was resolved as a conflict (the
    /// conflict path refreshes and reports the current assignee instead of
    /// surfacing a bare error). The triggering control stays disabled for
    /// exactly the duration of the request.
    pub async fn execute(
        &self,
        order_id: u64,
        transition: Transition,
        acting_employee: Option<u64>,
        reason: Option<&str>,
    ) -> Result<bool> {
        let Some(employee_id) = acting_employee else {
            let err = DashboardError::validation("No acting employee; sign in again");
            self.feedback(err.to_string());
            return Err(err);
        };

        let guard_key = (order_id, transition.segment());
        {
            let mut in_flight = lock(&self.in_flight);
            if !in_flight.insert(guard_key) {
                debug!(order_id, action = transition.segment(), "re-entrant action ignored");
                return Ok(false);
            }
        }

        let result = self
            .run_transition(order_id, transition, employee_id, reason)
            .await;
        lock(&self.in_flight).remove(&guard_key);
        result
    }

    async fn run_transition(
        &self,
        order_id: u64,
        transition: Transition,
        employee_id: u64,
        reason: Option<&str>,
    ) -> Result<bool> {
        let mut body = serde_json::json!({ "employeeId": employee_id });

        if transition == Transition::Cancel {
            let reason = reason.map(str::trim).unwrap_or_default();
            if reason.is_empty() {
                let err = DashboardError::validation("A cancellation reason is required");
                self.feedback(err.to_string());
                return Err(err);
            }
            if self.cancel_flag.get_or_fetch(&self.api).await {
                body["reason"] = Value::from(reason);
            }
        }

        match self
            .api
            .transition_order(order_id, transition.segment(), body)
            .await
        {
            Ok(order) => {
                {
                    let mut store = lock(&self.store);
                    store.upsert(order);
                }
                self.sink.invalidate_row(order_id);
                self.sink.refresh_view();
                self.sink.notify(Envelope::new(Notification::StatusChanged {
                    order_id,
                    notice: transition.notice().to_string(),
                }));
                Ok(true)
            }
            Err(DashboardError::Conflict { assignee }) => {
                self.resolve_conflict(order_id, assignee).await;
                Ok(false)
            }
            Err(e) => {
                self.feedback(e.to_string());
                Err(e)
            }
        }
    }

    /// The target was already transitioned by someone else: refresh the
    /// store so the row shows the actual state, then report the current
    /// assignee (or a generic notice when it cannot be resolved).
    async fn resolve_conflict(&self, order_id: u64, assignee: Option<String>) {
        if let Err(e) = self.engine.refresh_now().await {
            warn!(error = %e, "conflict refresh failed");
        }
        let assignee = assignee.or_else(|| {
            lock(&self.store)
                .get(order_id)
                .and_then(|o| o.assignee_name.clone())
        });
        self.sink.notify(Envelope::new(Notification::OrderTaken {
            order_id,
            assignee,
        }));
    }

    // -----------------------------------------------------------------------
    // Partial delivery
    // -----------------------------------------------------------------------

    /// Deliver individual items of a multi-item order. When this delivery
    /// makes every item fully delivered, the order-level `deliver`
    /// transition is issued automatically as a follow-up; if the follow-up
    /// fails the partial result is kept and the row stays partial.
    pub async fn deliver_items(
        &self,
        order_id: u64,
        deliveries: &[(u64, u32)],
        acting_employee: Option<u64>,
    ) -> Result<bool> {
        let Some(employee_id) = acting_employee else {
            let err = DashboardError::validation("No acting employee; sign in again");
            self.feedback(err.to_string());
            return Err(err);
        };
        if deliveries.is_empty() || deliveries.iter().any(|(_, qty)| *qty == 0) {
            let err = DashboardError::validation("Nothing selected for delivery");
            self.feedback(err.to_string());
            return Err(err);
        }

        let guard_key = (order_id, "deliver-items");
        {
            let mut in_flight = lock(&self.in_flight);
            if !in_flight.insert(guard_key) {
                debug!(order_id, "re-entrant item delivery ignored");
                return Ok(false);
            }
        }
        let result = self.run_deliver_items(order_id, deliveries, employee_id).await;
        lock(&self.in_flight).remove(&guard_key);
        result
    }

    async fn run_deliver_items(
        &self,
        order_id: u64,
        deliveries: &[(u64, u32)],
        employee_id: u64,
    ) -> Result<bool> {
        match self.api.deliver_items(order_id, deliveries).await {
            Ok(order) => {
                let fully_delivered = order.all_items_delivered();
                let already_delivered = order.workflow_status == WorkflowStatus::Delivered;
                {
                    let mut store = lock(&self.store);
                    store.upsert(order);
                }
                self.sink.invalidate_row(order_id);

                if fully_delivered && !already_delivered {
                    // Item state is committed; a failed follow-up leaves the
                    // row partial instead of rolling anything back.
                    if let Err(e) = self
                        .execute(order_id, Transition::Deliver, Some(employee_id), None)
                        .await
                    {
                        warn!(order_id, error = %e, "auto deliver follow-up failed");
                    }
                }
                Ok(true)
            }
            Err(DashboardError::Conflict { assignee }) => {
                self.resolve_conflict(order_id, assignee).await;
                Ok(false)
            }
            Err(e) => {
                self.feedback(e.to_string());
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Waiter notes
    // -----------------------------------------------------------------------

    /// Debounced per-order note save. Rapid edits collapse into one request;
    /// a deadline overrun surfaces the distinct timeout message and assumes
    /// no partial write.
    pub fn save_note(self: &Arc<Self>, order_id: u64, note: String) {
        let timer = {
            let mut timers = lock(&self.note_timers);
            Arc::clone(
                timers
                    .entry(order_id)
                    .or_insert_with(|| Arc::new(ResetTimer::new())),
            )
        };
        let dispatcher = Arc::clone(self);
        timer.schedule(self.note_debounce, move || {
            tokio::spawn(async move {
                match dispatcher.api.save_note(order_id, &note).await {
                    Ok(()) => {
                        {
                            let mut store = lock(&dispatcher.store);
                            if let Some(order) = store.get_mut(order_id) {
                                order.waiter_note =
                                    (!note.trim().is_empty()).then(|| note.clone());
                            }
                        }
                        dispatcher.sink.invalidate_row(order_id);
                    }
                    Err(e @ DashboardError::Timeout(_)) => {
                        dispatcher.feedback(e.to_string());
                    }
                    Err(e) => {
                        warn!(order_id, error = %e, "note save failed");
                        dispatcher.feedback(e.to_string());
                    }
                }
            });
        });
    }

    /// True while a transition request for this order/action is in flight;
    /// the rendering adapter keeps the control disabled exactly that long.
    pub fn is_in_flight(&self, order_id: u64, transition: Transition) -> bool {
        lock(&self.in_flight).contains(&(order_id, transition.segment()))
    }

    /// Abort pending note-save timers. In-flight requests are left to
    /// resolve.
    pub fn shutdown(&self) {
        for timer in lock(&self.note_timers).values() {
            timer.cancel();
        }
    }

    fn feedback(&self, message: String) {
        self.sink.notify(Envelope::new(Notification::Feedback {
            message,
            is_error: true,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Order;

    struct RecordingSink {
        notifications: Mutex<Vec<Notification>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                notifications: Mutex::new(Vec::new()),
            })
        }
    }

    impl EventSink for RecordingSink {
        fn notify(&self, envelope: Envelope) {
            self.notifications.lock().unwrap().push(envelope.event);
        }
        fn invalidate_row(&self, _order_id: u64) {}
        fn refresh_view(&self) {}
    }

    fn dispatcher() -> Arc<ActionDispatcher> {
        dispatcher_with_sink(RecordingSink::new())
    }

    fn dispatcher_with_sink(sink: Arc<RecordingSink>) -> Arc<ActionDispatcher> {
        let api = Arc::new(ApiClient::new("localhost:1", "k", 1).unwrap());
        let store = Arc::new(Mutex::new(OrderStore::new()));
        let sink: Arc<dyn EventSink> = sink;
        let engine = SyncEngine::new(
            Arc::clone(&api),
            Arc::clone(&store),
            Arc::clone(&sink),
            Duration::from_millis(20),
        );
        ActionDispatcher::new(api, store, sink, engine, Duration::from_millis(10))
    }

    #[test]
    fn test_transition_segments_and_notices_are_distinct() {
        let all = [
            Transition::Accept,
            Transition::StartPreparing,
            Transition::MarkReady,
            Transition::Deliver,
            Transition::Cancel,
        ];
        let segments: HashSet<&str> = all.iter().map(|t| t.segment()).collect();
        let notices: HashSet<&str> = all.iter().map(|t| t.notice()).collect();
        assert_eq!(segments.len(), all.len());
        assert_eq!(notices.len(), all.len());
    }

    #[tokio::test]
    async fn test_missing_acting_employee_is_local_validation_error() {
        let d = dispatcher();
        let err = d
            .execute(7, Transition::Accept, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DashboardError::Validation(_)));
    }

    #[tokio::test]
    async fn test_cancel_requires_nonempty_reason() {
        let d = dispatcher();
        let err = d
            .execute(7, Transition::Cancel, Some(1), Some("   "))
            .await
            .unwrap_err();
        assert!(matches!(err, DashboardError::Validation(_)));
    }

    #[tokio::test]
    async fn test_deliver_items_validates_input_before_network() {
        let d = dispatcher();
        assert!(matches!(
            d.deliver_items(7, &[], Some(1)).await.unwrap_err(),
            DashboardError::Validation(_)
        ));
        assert!(matches!(
            d.deliver_items(7, &[(1, 0)], Some(1)).await.unwrap_err(),
            DashboardError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_reentrancy_guard_makes_second_call_a_noop() {
        let d = dispatcher();
        // Hold the guard manually to simulate an in-flight request.
        d.in_flight.lock().unwrap().insert((7, "accept"));
        let result = d.execute(7, Transition::Accept, Some(1), None).await;
        assert_eq!(result.unwrap(), false);
        assert!(d.is_in_flight(7, Transition::Accept));
    }

    #[tokio::test]
    async fn test_guard_released_after_network_failure() {
        let d = dispatcher();
        // localhost:1 refuses connections, so the request fails fast.
        let result = d.execute(9, Transition::Accept, Some(1), None).await;
        assert!(result.is_err());
        assert!(!d.is_in_flight(9, Transition::Accept));
    }

    #[tokio::test]
    async fn test_conflict_reports_current_assignee_not_an_error() {
        let sink = RecordingSink::new();
        let d = dispatcher_with_sink(sink.clone());
        d.store.lock().unwrap().upsert(Order {
            id: 7,
            session_id: 1,
            assignee_name: Some("Ana".to_string()),
            ..Order::default()
        });

        // The conflict body carried no assignee; the store resolves it.
        d.resolve_conflict(7, None).await;

        let notes = sink.notifications.lock().unwrap();
        assert_eq!(notes.len(), 1);
        match &notes[0] {
            Notification::OrderTaken { order_id, assignee } => {
                assert_eq!(*order_id, 7);
                assert_eq!(assignee.as_deref(), Some("Ana"));
            }
            other => panic!("expected OrderTaken, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_conflict_without_resolvable_assignee_is_generic() {
        let sink = RecordingSink::new();
        let d = dispatcher_with_sink(sink.clone());

        d.resolve_conflict(3, None).await;

        let notes = sink.notifications.lock().unwrap();
        assert!(matches!(
            notes[0],
            Notification::OrderTaken {
                order_id: 3,
                assignee: None
            }
        ));
    }
}
