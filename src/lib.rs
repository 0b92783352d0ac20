//! Floor-service dashboard core.
//!
//! Client-side order-lifecycle reconciliation engine: an in-memory mirror of
//! in-flight orders kept consistent across scheduled polling, server push
//! events, and locally-issued optimistic actions, exposed as filtered,
//! sorted, capability-gated view projections. There is no ambient global
//! state: `DashboardController::new` returns the controller object and
//! collaborators get exactly the narrow surface they need.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod calls;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod filters;
pub mod model;
pub mod notify;
pub mod push;
pub mod status;
pub mod storage;
pub mod store;
pub mod sync;
pub mod views;

pub use api::{ApiClient, ConnectivityResult};
pub use config::DashboardConfig;
pub use dispatch::{ActionDispatcher, Transition};
pub use error::{DashboardError, Result};
pub use filters::{DateRange, FilterBundle};
pub use model::{Order, OrderItem, PaidSession, WaiterCall};
pub use notify::{Envelope, EventSink, Notification, NullSink};
pub use push::PushEvent;
pub use status::{normalize, SessionStatus, WorkflowStatus};
pub use storage::{KvStore, MemoryStore, SqliteStore};
pub use views::{Capabilities, OrderRow, PaidRow, RowAction, Tab};

/// Lock a mutex, recovering the data from a poisoned lock; every mutator
/// leaves the shared state consistent at lock release, so a panicked holder
/// never leaves a half-applied patch behind.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(e) => e.into_inner(),
    }
}

/// Initialize tracing with the standard env-filter fallback. Safe to call
/// more than once; later calls are no-ops.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,floor_dashboard=debug"));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .try_init();
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// The dashboard controller: owns the order store, the filter bundle, and
/// every background worker. Created by the embedder at dashboard start and
/// torn down with `shutdown` on tab switch or close.
pub struct DashboardController {
    api: Arc<ApiClient>,
    store: Arc<Mutex<store::OrderStore>>,
    bundle: Mutex<FilterBundle>,
    kv: Arc<dyn KvStore>,
    sink: Arc<dyn EventSink>,
    engine: Arc<sync::SyncEngine>,
    dispatcher: Arc<ActionDispatcher>,
    calls: Arc<calls::CallBoard>,
    paid: Arc<views::PaidView>,
    caps: Capabilities,
    table_assignments: Mutex<HashMap<String, u64>>,
    config: DashboardConfig,
}

impl DashboardController {
    pub fn new(
        base_url: &str,
        api_key: &str,
        employee_id: u64,
        caps: Capabilities,
        kv: Arc<dyn KvStore>,
        sink: Arc<dyn EventSink>,
        config: DashboardConfig,
    ) -> Result<Arc<Self>> {
        let api = Arc::new(ApiClient::new(base_url, api_key, employee_id)?);
        let store = Arc::new(Mutex::new(store::OrderStore::new()));
        let bundle = FilterBundle::load(kv.as_ref());
        let engine = sync::SyncEngine::new(
            Arc::clone(&api),
            Arc::clone(&store),
            Arc::clone(&sink),
            config.refresh_debounce,
        );
        let dispatcher = ActionDispatcher::new(
            Arc::clone(&api),
            Arc::clone(&store),
            Arc::clone(&sink),
            Arc::clone(&engine),
            config.note_debounce,
        );
        let calls = calls::CallBoard::new(Arc::clone(&api), Arc::clone(&sink));
        let paid = views::PaidView::new(Arc::clone(&api), Arc::clone(&sink));

        Ok(Arc::new(Self {
            api,
            store,
            bundle: Mutex::new(bundle),
            kv,
            sink,
            engine,
            dispatcher,
            calls,
            paid,
            caps,
            table_assignments: Mutex::new(HashMap::new()),
            config,
        }))
    }

    /// Start the background workers: an immediate first poll (adopted as
    /// the baseline when the store starts empty), then the fixed-interval
    /// order and waiter-call loops.
    pub fn start(self: &Arc<Self>) {
        info!("dashboard controller starting");
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            if let Err(e) = engine.poll_once().await {
                tracing::warn!(error = %e, "initial order poll failed");
            }
        });
        self.engine.start_order_poll(self.config.order_poll_interval);
        self.calls.start_poll(self.config.call_poll_interval);
    }

    /// Clear every periodic timer. In-flight requests are not cancelled; a
    /// response for a now-irrelevant request is still applied if it
    /// resolves.
    pub fn shutdown(&self) {
        info!("dashboard controller shutting down");
        self.engine.shutdown();
        self.calls.shutdown();
        self.paid.shutdown();
        self.dispatcher.shutdown();
    }

    // -----------------------------------------------------------------------
    // Push ingestion
    // -----------------------------------------------------------------------

    /// Entry point for the named-event push channel. Unknown events are
    /// dropped; polling remains the correctness net.
    pub fn handle_push(self: &Arc<Self>, event_name: &str, payload: &serde_json::Value) {
        if let Some(event) = PushEvent::parse(event_name, payload) {
            self.handle_push_event(event);
        }
    }

    /// Apply a typed push event: synchronous field patch, immediate row
    /// invalidation, then a debounced authoritative refresh.
    pub fn handle_push_event(self: &Arc<Self>, event: PushEvent) {
        if let PushEvent::WaiterCall(ref call) = event {
            self.calls.ingest_push((**call).clone());
            return;
        }
        if let PushEvent::OrderNew(ref order) = event {
            self.sink.notify(Envelope::new(Notification::NewOrder {
                order_id: order.id,
                table_label: order.session.table_label.clone(),
            }));
        }
        let affected = {
            let mut store = lock(&self.store);
            push::apply_patch(&mut store, &event)
        };
        for id in &affected {
            self.sink.invalidate_row(*id);
        }
        self.engine.schedule_refresh();
    }

    // -----------------------------------------------------------------------
    // View projections
    // -----------------------------------------------------------------------

    pub fn active_rows(&self) -> Vec<OrderRow> {
        let store = lock(&self.store);
        let bundle = lock(&self.bundle);
        let tables = lock(&self.table_assignments);
        views::project_active(
            &store,
            &bundle,
            self.api.employee_id(),
            &tables,
            &self.caps,
            Utc::now(),
        )
    }

    /// Tracking rows; starred ids observed on finished sessions are evicted
    /// from the starred set and the eviction is persisted.
    pub fn tracking_rows(&self) -> Vec<OrderRow> {
        let (rows, evicted) = {
            let store = lock(&self.store);
            let bundle = lock(&self.bundle);
            views::project_tracking(&store, &bundle, self.api.employee_id(), &self.caps)
        };
        if !evicted.is_empty() {
            let mut bundle = lock(&self.bundle);
            for id in &evicted {
                bundle.starred.remove(id);
            }
            bundle.persist_starred(self.kv.as_ref());
        }
        rows
    }

    pub fn cancelled_rows(&self) -> Vec<OrderRow> {
        let store = lock(&self.store);
        let bundle = lock(&self.bundle);
        views::project_cancelled(
            &store,
            &bundle,
            self.api.employee_id(),
            &self.caps,
            Utc::now(),
        )
    }

    pub fn paid_rows(&self) -> Vec<PaidRow> {
        let range = lock(&self.bundle).date_range.clone();
        self.paid.rows(&range, Utc::now())
    }

    /// Tab switch: the paid tab runs its own poller only while active.
    pub fn activate_tab(self: &Arc<Self>, tab: Tab) {
        if tab == Tab::Paid {
            self.paid.activate(self.config.paid_poll_interval);
        } else {
            self.paid.deactivate();
        }
        self.sink.refresh_view();
    }

    // -----------------------------------------------------------------------
    // Filter input handlers
    // -----------------------------------------------------------------------

    fn mutate_bundle(&self, f: impl FnOnce(&mut FilterBundle)) {
        {
            let mut bundle = lock(&self.bundle);
            f(&mut bundle);
            bundle.persist(self.kv.as_ref());
        }
        self.sink.refresh_view();
    }

    pub fn set_search(&self, term: &str) {
        self.mutate_bundle(|b| b.search = term.to_string());
    }

    pub fn set_date_range(&self, range: DateRange) {
        self.mutate_bundle(|b| b.date_range = range);
    }

    pub fn set_my_orders(&self, on: bool) {
        self.mutate_bundle(|b| b.my_orders = on);
    }

    pub fn set_unassigned_only(&self, on: bool) {
        self.mutate_bundle(|b| b.unassigned_only = on);
    }

    pub fn set_session_status_filter(&self, statuses: impl IntoIterator<Item = SessionStatus>) {
        self.mutate_bundle(|b| b.session_statuses = statuses.into_iter().collect());
    }

    pub fn set_workflow_status_filter(&self, statuses: impl IntoIterator<Item = WorkflowStatus>) {
        self.mutate_bundle(|b| b.workflow_statuses = statuses.into_iter().collect());
    }

    pub fn toggle_star(&self, order_id: u64) -> bool {
        let mut starred_now = false;
        self.mutate_bundle(|b| {
            if !b.starred.remove(&order_id) {
                b.starred.insert(order_id);
                starred_now = true;
            }
        });
        starred_now
    }

    pub fn set_archived(&self, order_id: u64, archived: bool) {
        self.mutate_bundle(|b| {
            if archived {
                b.archived.insert(order_id);
            } else {
                b.archived.remove(&order_id);
            }
        });
    }

    pub fn set_compact_view(&self, on: bool) {
        self.mutate_bundle(|b| b.compact_view = on);
    }

    pub fn filter_bundle(&self) -> FilterBundle {
        lock(&self.bundle).clone()
    }

    /// Table label -> employee lookup used by the assignment-visibility
    /// predicate; maintained by the floor-layout collaborator.
    pub fn set_table_assignments(&self, assignments: HashMap<String, u64>) {
        *lock(&self.table_assignments) = assignments;
        self.sink.refresh_view();
    }

    // -----------------------------------------------------------------------
    // Actions
    // -----------------------------------------------------------------------

    pub async fn execute(
        &self,
        order_id: u64,
        transition: Transition,
        acting_employee: Option<u64>,
        reason: Option<&str>,
    ) -> Result<bool> {
        self.dispatcher
            .execute(order_id, transition, acting_employee, reason)
            .await
    }

    pub async fn deliver_items(
        &self,
        order_id: u64,
        deliveries: &[(u64, u32)],
        acting_employee: Option<u64>,
    ) -> Result<bool> {
        self.dispatcher
            .deliver_items(order_id, deliveries, acting_employee)
            .await
    }

    pub fn save_note(&self, order_id: u64, note: String) {
        self.dispatcher.save_note(order_id, note);
    }

    /// Delta-row fetch: pull only orders the store does not hold yet and
    /// upsert them. Used to append rows without forcing a full redraw.
    pub async fn fetch_missing_rows(&self) -> Result<usize> {
        let known: Vec<u64> = lock(&self.store).iter().map(|o| o.id).collect();
        let fetched = self.api.fetch_table_rows(&known).await?;
        let count = fetched.len();
        if count > 0 {
            {
                let mut store = lock(&self.store);
                for order in fetched {
                    store.upsert(order);
                }
            }
            self.sink.refresh_view();
        }
        Ok(count)
    }

    /// Per-order delivery state for the partial-delivery panel.
    pub async fn delivery_status(&self, order_id: u64) -> Result<serde_json::Value> {
        self.api.delivery_status(order_id).await
    }

    // -----------------------------------------------------------------------
    // Waiter calls
    // -----------------------------------------------------------------------

    pub fn pending_calls(&self) -> Vec<WaiterCall> {
        self.calls.pending()
    }

    pub async fn confirm_call(&self, call_id: u64) -> Result<()> {
        self.calls.confirm(call_id).await
    }

    pub async fn call_supervisor(&self, session_id: u64, note: Option<&str>) -> Result<()> {
        self.calls.call_supervisor(session_id, note).await
    }

    // -----------------------------------------------------------------------
    // Session operations
    // -----------------------------------------------------------------------

    pub async fn request_checkout(&self, session_id: u64) -> Result<()> {
        self.api.request_checkout(session_id).await
    }

    pub async fn set_tip(&self, session_id: u64, amount: f64) -> Result<()> {
        self.api.set_tip(session_id, amount).await
    }

    pub async fn confirm_payment(&self, session_id: u64) -> Result<()> {
        self.api.confirm_payment(session_id).await
    }

    pub async fn resend_receipt(&self, session_id: u64) -> Result<()> {
        self.api.resend_receipt(session_id).await
    }

    pub fn ticket_url(&self, session_id: u64, pdf: bool) -> String {
        self.api.ticket_url(session_id, pdf)
    }

    pub async fn connectivity(&self) -> ConnectivityResult {
        self.api.test_connectivity().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SessionSnapshot;

    fn controller_with_kv(kv: Arc<dyn KvStore>) -> Arc<DashboardController> {
        DashboardController::new(
            "localhost:1",
            "test-key",
            1,
            Capabilities::all(),
            kv,
            Arc::new(NullSink),
            DashboardConfig::default(),
        )
        .unwrap()
    }

    fn seed_order(c: &DashboardController, id: u64, session_id: u64, status: WorkflowStatus) {
        let mut store = lock(&c.store);
        store.upsert(Order {
            id,
            session_id,
            workflow_status: status,
            session: SessionSnapshot {
                id: session_id,
                status: Some(SessionStatus::Open),
                table_label: format!("T{session_id:02}"),
                notes: None,
            },
            created_at: Some(Utc::now()),
            updated_at: Some(Utc::now()),
            ..Order::default()
        });
    }

    #[tokio::test]
    async fn test_star_survives_reload() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let first = controller_with_kv(Arc::clone(&kv));
        first.toggle_star(12);

        // A fresh controller over the same storage sees the star.
        let reloaded = controller_with_kv(kv);
        assert!(reloaded.filter_bundle().starred.contains(&12));
    }

    #[tokio::test]
    async fn test_session_paid_push_empties_active_view() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let c = controller_with_kv(kv);
        seed_order(&c, 1, 9, WorkflowStatus::Ready);
        seed_order(&c, 2, 9, WorkflowStatus::Delivered);
        seed_order(&c, 3, 4, WorkflowStatus::Ready);
        assert_eq!(c.active_rows().len(), 3);

        c.handle_push_event(PushEvent::SessionPaid { session_id: 9 });
        let ids: Vec<u64> = c.active_rows().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3]);
        // An authoritative refresh was scheduled behind the patch.
        assert!(c.engine.refresh_pending());

        // The paid view's next refresh picks the session up from its own
        // read model.
        c.paid.set_sessions(vec![PaidSession {
            id: 9,
            table_label: "T09".into(),
            paid_at: Some(Utc::now()),
            total_amount: 31.5,
            order_count: 2,
            customer_name: None,
        }]);
        let paid = c.paid_rows();
        assert_eq!(paid.len(), 1);
        assert_eq!(paid[0].session_id, 9);
        c.shutdown();
    }

    #[tokio::test]
    async fn test_status_push_patches_one_row_synchronously() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let c = controller_with_kv(kv);
        seed_order(&c, 7, 2, WorkflowStatus::Queued);

        c.handle_push(
            "orders.status_changed",
            &serde_json::json!({ "orderId": 7, "status": "prepared" }),
        );
        let rows = c.active_rows();
        assert_eq!(rows[0].status, WorkflowStatus::Ready);
        c.shutdown();
    }

    #[tokio::test]
    async fn test_tracking_eviction_is_persisted() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let c = controller_with_kv(Arc::clone(&kv));
        seed_order(&c, 5, 3, WorkflowStatus::Delivered);
        c.toggle_star(5);

        c.handle_push_event(PushEvent::SessionPaid { session_id: 3 });
        assert!(c.tracking_rows().is_empty());

        // The eviction reached durable storage, not just the in-memory set.
        let reloaded = controller_with_kv(kv);
        assert!(!reloaded.filter_bundle().starred.contains(&5));
        c.shutdown();
    }

    #[tokio::test]
    async fn test_cancelled_order_leaves_active_but_stays_in_cancelled_view() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let c = controller_with_kv(kv);
        seed_order(&c, 8, 2, WorkflowStatus::Preparing);

        c.handle_push(
            "orders.status_changed",
            &serde_json::json!({ "orderId": 8, "status": "cancelled" }),
        );
        assert!(c.active_rows().is_empty());
        let cancelled = c.cancelled_rows();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].id, 8);
        c.shutdown();
    }
}
