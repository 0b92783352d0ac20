//! Reconciliation engine: scheduled polling and the authoritative refresh.
//!
//! Three sources mutate the order store — this poll loop, push-event
//! patches, and action results. The merge policy that keeps them from
//! corrupting each other lives here: a full refresh replaces the store
//! wholesale (authoritative), event patches are targeted overlays
//! (optimistic), and a burst of push events collapses into one debounced
//! refresh. Two in-flight refreshes may resolve out of program order; the
//! last response received wins because each one replaces the whole store.
//! That eventual-consistency tradeoff is the contract, not a bug to fix.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::error::Result;
use crate::model::Order;
use crate::notify::{Envelope, EventSink, Notification};
use crate::status::WorkflowStatus;
use crate::store::OrderStore;

// ---------------------------------------------------------------------------
// Reschedulable timer
// ---------------------------------------------------------------------------

/// A single reschedulable timer handle, one per refresh class.
///
/// `schedule` aborts a pending (unfired) sleep and arms a new one: the last
/// schedule wins. Work started at fire time must be spawned detached by the
/// callback, which is what makes an already-in-flight fetch impossible to
/// cancel from here — rescheduling only ever kills the sleep.
#[derive(Default)]
pub struct ResetTimer {
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl ResetTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule<F>(&self, delay: Duration, fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire();
        });
        if let Ok(mut guard) = self.pending.lock() {
            if let Some(prev) = guard.replace(handle) {
                prev.abort();
            }
        }
    }

    /// Abort a pending unfired timer, if any.
    pub fn cancel(&self) {
        if let Ok(mut guard) = self.pending.lock() {
            if let Some(prev) = guard.take() {
                prev.abort();
            }
        }
    }

    /// True while a sleep is armed and has not fired or been cancelled.
    pub fn is_armed(&self) -> bool {
        self.pending
            .lock()
            .map(|g| g.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Poll diffing
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// Store was empty at startup; first result adopted silently.
    Baseline,
    /// Genuinely new orders detected; notify and refresh.
    NewOrders(Vec<u64>),
    /// Some status changed or an id disappeared; refresh without noise.
    Drift,
    Unchanged,
}

/// Diff the fetched order list against the previous poll's id -> status
/// snapshot.
///
/// An id is a qualifying new order only when it is absent from the previous
/// snapshot, its canonical status is `new`, and its session is open or in a
/// checkout sub-state — anything else that differs is drift. With no
/// previous snapshot the result is adopted as the baseline, which is what
/// keeps an initially empty store from misreporting historical orders as
/// new.
pub fn diff_snapshots(
    previous: Option<&HashMap<u64, WorkflowStatus>>,
    next: &[Order],
) -> PollOutcome {
    let Some(previous) = previous else {
        return PollOutcome::Baseline;
    };

    let mut new_ids = Vec::new();
    let mut drifted = false;

    for order in next {
        match previous.get(&order.id) {
            None => {
                if order.workflow_status == WorkflowStatus::New
                    && order.session_status().is_open_or_checkout()
                {
                    new_ids.push(order.id);
                } else {
                    drifted = true;
                }
            }
            Some(prev_status) => {
                if *prev_status != order.workflow_status {
                    drifted = true;
                }
            }
        }
    }

    // Disappearance: an id from the previous snapshot no longer present.
    let next_ids: std::collections::HashSet<u64> = next.iter().map(|o| o.id).collect();
    if previous.keys().any(|id| !next_ids.contains(id)) {
        drifted = true;
    }

    if !new_ids.is_empty() {
        new_ids.sort_unstable();
        PollOutcome::NewOrders(new_ids)
    } else if drifted {
        PollOutcome::Drift
    } else {
        PollOutcome::Unchanged
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    api: Arc<ApiClient>,
    store: Arc<Mutex<OrderStore>>,
    sink: Arc<dyn EventSink>,
    refresh_timer: ResetTimer,
    refresh_debounce: Duration,
    last_snapshot: Mutex<Option<HashMap<u64, WorkflowStatus>>>,
    is_running: Arc<AtomicBool>,
    tracker: TaskTracker,
}

impl SyncEngine {
    pub fn new(
        api: Arc<ApiClient>,
        store: Arc<Mutex<OrderStore>>,
        sink: Arc<dyn EventSink>,
        refresh_debounce: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            store,
            sink,
            refresh_timer: ResetTimer::new(),
            refresh_debounce,
            last_snapshot: Mutex::new(None),
            is_running: Arc::new(AtomicBool::new(false)),
            tracker: TaskTracker::new(),
        })
    }

    /// Start the fixed-interval order poll loop.
    pub fn start_order_poll(self: &Arc<Self>, interval: Duration) {
        self.is_running.store(true, Ordering::SeqCst);
        let engine = Arc::clone(self);
        self.tracker.spawn(async move {
            info!(interval_secs = interval.as_secs(), "order poll loop started");
            loop {
                if !engine.is_running.load(Ordering::SeqCst) {
                    info!("order poll loop stopped");
                    break;
                }
                tokio::time::sleep(interval).await;
                if !engine.is_running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = engine.poll_once().await {
                    warn!(error = %e, "order poll failed");
                }
            }
        });
    }

    /// One poll cycle: fetch, diff against the previous snapshot, adopt.
    pub async fn poll_once(&self) -> Result<PollOutcome> {
        let orders = self.api.fetch_orders(false, true).await?;
        Ok(self.adopt_poll_result(orders))
    }

    /// Diff a fetched order list and apply the reconciliation policy. Split
    /// from `poll_once` so the policy is testable without a network.
    pub fn adopt_poll_result(&self, orders: Vec<Order>) -> PollOutcome {
        let outcome = {
            let mut snapshot = crate::lock(&self.last_snapshot);
            let outcome = diff_snapshots(snapshot.as_ref(), &orders);
            *snapshot = Some(
                orders
                    .iter()
                    .map(|o| (o.id, o.workflow_status.clone()))
                    .collect(),
            );
            outcome
        };

        match &outcome {
            PollOutcome::Baseline => {
                debug!(orders = orders.len(), "first poll adopted as baseline");
                self.install(orders);
            }
            PollOutcome::NewOrders(ids) => {
                for id in ids {
                    let table_label = orders
                        .iter()
                        .find(|o| o.id == *id)
                        .map(|o| o.session.table_label.clone())
                        .unwrap_or_default();
                    self.sink.notify(Envelope::new(Notification::NewOrder {
                        order_id: *id,
                        table_label,
                    }));
                }
                info!(count = ids.len(), "new orders detected by poll");
                self.install(orders);
            }
            PollOutcome::Drift => {
                debug!("poll drift detected, refreshing silently");
                self.install(orders);
            }
            PollOutcome::Unchanged => {}
        }
        outcome
    }

    /// Wholesale store replacement plus a view refresh.
    fn install(&self, orders: Vec<Order>) {
        {
            let mut store = crate::lock(&self.store);
            store.replace_all(orders);
        }
        self.sink.refresh_view();
    }

    /// Schedule the debounced authoritative refresh. A burst of push events
    /// collapses into a single fetch: each call aborts the pending unfired
    /// timer. The fetch itself is spawned detached at fire time, so once a
    /// request is in flight nothing cancels it and the last response
    /// received replaces the store wholesale.
    pub fn schedule_refresh(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        self.refresh_timer.schedule(self.refresh_debounce, move || {
            tokio::spawn(async move {
                if let Err(e) = engine.refresh_now().await {
                    warn!(error = %e, "debounced refresh failed");
                }
            });
        });
    }

    /// Immediate authoritative refresh: fetch and replace the store. The
    /// snapshot the poll differ diffs against is updated too, so a refresh
    /// never re-reports orders it already installed as new.
    pub async fn refresh_now(&self) -> Result<()> {
        let orders = self.api.fetch_orders(false, true).await?;
        {
            let mut snapshot = crate::lock(&self.last_snapshot);
            *snapshot = Some(
                orders
                    .iter()
                    .map(|o| (o.id, o.workflow_status.clone()))
                    .collect(),
            );
        }
        self.install(orders);
        Ok(())
    }

    pub fn refresh_pending(&self) -> bool {
        self.refresh_timer.is_armed()
    }

    /// Stop the poll loop and abort any pending (unfired) refresh timer.
    /// In-flight network requests are left to resolve; their responses are
    /// still applied.
    pub fn shutdown(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.refresh_timer.cancel();
        self.tracker.close();
    }
}
