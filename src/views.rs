//! Tab/view partition and the pure view-model projection.
//!
//! Four disjoint views are derived from the one order store (the paid tab
//! from its own read model). Projections return render-ready row
//! descriptors; rendering itself lives entirely in the embedding adapter,
//! which keeps every view independently testable without a DOM.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::error::Result;
use crate::filters::{self, DateRange, FilterBundle};
use crate::lock;
use crate::model::{format_amount, Order, PaidSession};
use crate::notify::EventSink;
use crate::status::WorkflowStatus;
use crate::store::OrderStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tab {
    Active,
    Tracking,
    Paid,
    Cancelled,
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Opaque capability bundle derived elsewhere from the employee role.
/// Actions the role cannot perform are simply not offered on the row;
/// permission failures do not exist client-side.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub can_accept: bool,
    pub can_kitchen: bool,
    pub can_deliver: bool,
    pub can_cancel: bool,
    pub can_manage_payments: bool,
    pub can_handle_calls: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Self {
            can_accept: true,
            can_kitchen: true,
            can_deliver: true,
            can_cancel: true,
            can_manage_payments: true,
            can_handle_calls: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Row descriptors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowAction {
    Accept,
    StartPreparing,
    MarkReady,
    Deliver,
    DeliverItems,
    Cancel,
    RequestCheckout,
    ConfirmPayment,
    SaveNote,
}

/// Render-ready description of one order row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRow {
    pub id: u64,
    pub session_id: u64,
    pub table_label: String,
    pub customer_name: Option<String>,
    pub status: WorkflowStatus,
    pub status_label: &'static str,
    pub starred: bool,
    pub assigned_to_me: bool,
    pub assignee_name: Option<String>,
    pub waiter_note: Option<String>,
    pub item_count: usize,
    pub delivered_item_count: usize,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub actions: Vec<RowAction>,
}

fn status_label(status: &WorkflowStatus) -> &'static str {
    match status {
        WorkflowStatus::New => "New",
        WorkflowStatus::Queued => "In queue",
        WorkflowStatus::Preparing => "Preparing",
        WorkflowStatus::Ready => "Ready",
        WorkflowStatus::Delivered => "Delivered",
        WorkflowStatus::AwaitingPayment => "Awaiting payment",
        WorkflowStatus::Paid => "Paid",
        WorkflowStatus::Cancelled => "Cancelled",
        WorkflowStatus::Other(_) => "Unknown",
    }
}

/// Capability-gated actions for an order in its current state.
pub fn available_actions(order: &Order, caps: &Capabilities) -> Vec<RowAction> {
    let mut actions = Vec::new();
    match order.workflow_status {
        WorkflowStatus::New => {
            if caps.can_accept {
                actions.push(RowAction::Accept);
            }
        }
        WorkflowStatus::Queued => {
            if caps.can_kitchen {
                actions.push(RowAction::StartPreparing);
            }
        }
        WorkflowStatus::Preparing => {
            if caps.can_kitchen {
                actions.push(RowAction::MarkReady);
            }
        }
        WorkflowStatus::Ready => {
            if caps.can_deliver {
                actions.push(RowAction::Deliver);
                if order.items.len() > 1 && !order.all_items_delivered() {
                    actions.push(RowAction::DeliverItems);
                }
            }
        }
        WorkflowStatus::Delivered => {
            if caps.can_manage_payments {
                actions.push(RowAction::RequestCheckout);
            }
        }
        WorkflowStatus::AwaitingPayment => {
            if caps.can_manage_payments {
                actions.push(RowAction::ConfirmPayment);
            }
        }
        _ => {}
    }
    if caps.can_cancel && order.workflow_status.is_pre_payment() {
        actions.push(RowAction::Cancel);
    }
    if !order.workflow_status.is_terminal() {
        actions.push(RowAction::SaveNote);
    }
    actions
}

fn to_row(order: &Order, bundle: &FilterBundle, employee_id: u64, caps: &Capabilities) -> OrderRow {
    OrderRow {
        id: order.id,
        session_id: order.session_id,
        table_label: order.session.table_label.clone(),
        customer_name: order.customer.name.clone(),
        status: order.workflow_status.clone(),
        status_label: status_label(&order.workflow_status),
        starred: bundle.starred.contains(&order.id),
        assigned_to_me: order.assignee_id == Some(employee_id),
        assignee_name: order.assignee_name.clone(),
        waiter_note: order.waiter_note.clone(),
        item_count: order.items.len(),
        delivered_item_count: order.items.iter().filter(|i| i.is_fully_delivered).count(),
        created_at: order.created_at,
        updated_at: order.updated_at,
        actions: available_actions(order, caps),
    }
}

// ---------------------------------------------------------------------------
// Projections
// ---------------------------------------------------------------------------

/// Active tab: the full filter pipeline plus the stable sort.
pub fn project_active(
    store: &OrderStore,
    bundle: &FilterBundle,
    employee_id: u64,
    table_assignments: &HashMap<String, u64>,
    caps: &Capabilities,
    now: DateTime<Utc>,
) -> Vec<OrderRow> {
    filters::visible_orders(store, bundle, employee_id, table_assignments, now)
        .into_iter()
        .map(|o| to_row(o, bundle, employee_id, caps))
        .collect()
}

/// Tracking tab: starred orders whose session has not finished. Returns the
/// rows plus the starred ids observed finished, which the caller evicts
/// from the starred set and persists.
pub fn project_tracking(
    store: &OrderStore,
    bundle: &FilterBundle,
    employee_id: u64,
    caps: &Capabilities,
) -> (Vec<OrderRow>, Vec<u64>) {
    let mut rows = Vec::new();
    let mut evicted = Vec::new();
    for id in &bundle.starred {
        let Some(order) = store.get(*id) else { continue };
        if order.session_status().is_finished() {
            evicted.push(*id);
            continue;
        }
        if order.is_cancelled() {
            continue;
        }
        rows.push(to_row(order, bundle, employee_id, caps));
    }
    rows.sort_by_key(|r| std::cmp::Reverse(r.id));
    evicted.sort_unstable();
    (rows, evicted)
}

/// Cancelled tab: date-filtered, most recently updated first.
pub fn project_cancelled(
    store: &OrderStore,
    bundle: &FilterBundle,
    employee_id: u64,
    caps: &Capabilities,
    now: DateTime<Utc>,
) -> Vec<OrderRow> {
    let mut rows: Vec<&Order> = store
        .iter()
        .filter(|o| o.is_cancelled())
        .filter(|o| filters::in_date_range(o.created_at, &bundle.date_range, now))
        .collect();
    rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
    rows.into_iter()
        .map(|o| to_row(o, bundle, employee_id, caps))
        .collect()
}

// ---------------------------------------------------------------------------
// Paid tab (separate read model)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaidRow {
    pub session_id: u64,
    pub table_label: String,
    pub paid_at: Option<DateTime<Utc>>,
    pub total_display: String,
    pub order_count: u32,
    pub customer_name: Option<String>,
}

pub fn project_paid(sessions: &[PaidSession], range: &DateRange, now: DateTime<Utc>) -> Vec<PaidRow> {
    let mut rows: Vec<&PaidSession> = sessions
        .iter()
        .filter(|s| filters::in_date_range(s.paid_at, range, now))
        .collect();
    rows.sort_by(|a, b| b.paid_at.cmp(&a.paid_at).then(b.id.cmp(&a.id)));
    rows.into_iter()
        .map(|s| PaidRow {
            session_id: s.id,
            table_label: s.table_label.clone(),
            paid_at: s.paid_at,
            total_display: format_amount(s.total_amount),
            order_count: s.order_count,
            customer_name: s.customer_name.clone(),
        })
        .collect()
}

/// Holds the recently-paid read model and its activation-scoped poller.
/// The poll runs only while the paid tab is active; deactivation clears the
/// timer without touching an in-flight fetch.
pub struct PaidView {
    api: Arc<ApiClient>,
    sink: Arc<dyn EventSink>,
    sessions: Mutex<Vec<PaidSession>>,
    is_active: Arc<AtomicBool>,
    /// Bumped on every activation; a sleeping loop from a previous
    /// activation sees the mismatch and exits instead of doubling up.
    generation: Arc<AtomicU64>,
    tracker: TaskTracker,
}

impl PaidView {
    pub fn new(api: Arc<ApiClient>, sink: Arc<dyn EventSink>) -> Arc<Self> {
        Arc::new(Self {
            api,
            sink,
            sessions: Mutex::new(Vec::new()),
            is_active: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            tracker: TaskTracker::new(),
        })
    }

    /// Tab activation: refresh immediately, then on the interval until
    /// deactivated.
    pub fn activate(self: &Arc<Self>, interval: Duration) {
        if self.is_active.swap(true, Ordering::SeqCst) {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let view = Arc::clone(self);
        self.tracker.spawn(async move {
            info!("paid-session poll started");
            if let Err(e) = view.refresh_now().await {
                warn!(error = %e, "paid-session fetch failed");
            }
            loop {
                tokio::time::sleep(interval).await;
                if !view.is_active.load(Ordering::SeqCst)
                    || view.generation.load(Ordering::SeqCst) != generation
                {
                    info!("paid-session poll stopped");
                    break;
                }
                if let Err(e) = view.refresh_now().await {
                    warn!(error = %e, "paid-session fetch failed");
                }
            }
        });
    }

    pub fn deactivate(&self) {
        self.is_active.store(false, Ordering::SeqCst);
    }

    pub async fn refresh_now(&self) -> Result<()> {
        let sessions = self.api.paid_recent().await?;
        *lock(&self.sessions) = sessions;
        self.sink.refresh_view();
        Ok(())
    }

    pub fn rows(&self, range: &DateRange, now: DateTime<Utc>) -> Vec<PaidRow> {
        project_paid(&lock(&self.sessions), range, now)
    }

    pub fn shutdown(&self) {
        self.deactivate();
        self.tracker.close();
    }

    #[cfg(test)]
    pub fn set_sessions(&self, sessions: Vec<PaidSession>) {
        *lock(&self.sessions) = sessions;
    }
}
