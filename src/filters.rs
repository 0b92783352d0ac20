//! Filter bundle and the order visibility pipeline.
//!
//! A pure predicate pipeline from (store, bundle, employee, table
//! assignments) to per-order visibility, applied in a fixed order: the
//! first failing predicate hides the row. Sorting is stable so rows do not
//! jump when a refresh lands. Nothing here performs I/O; persistence goes
//! through the `KvStore` the controller hands in.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::model::Order;
use crate::status::{SessionStatus, WorkflowStatus};
use crate::storage::{KvStore, KEY_COMPACT_VIEW, KEY_FILTER_BUNDLE, KEY_STARRED_ORDERS};
use crate::store::OrderStore;

// ---------------------------------------------------------------------------
// Date range
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateRange {
    Today,
    Last7,
    Custom(u32),
    All,
}

impl Default for DateRange {
    fn default() -> Self {
        DateRange::Today
    }
}

/// Whether a creation time falls inside the range. An absent (unparseable)
/// timestamp is treated as within range rather than hiding the row.
pub fn in_date_range(created_at: Option<DateTime<Utc>>, range: &DateRange, now: DateTime<Utc>) -> bool {
    let Some(created) = created_at else { return true };
    match range {
        DateRange::Today => created.date_naive() == now.date_naive(),
        DateRange::Last7 => created >= now - Duration::days(7),
        DateRange::Custom(days) => created >= now - Duration::days(i64::from(*days)),
        DateRange::All => true,
    }
}

// ---------------------------------------------------------------------------
// Filter bundle
// ---------------------------------------------------------------------------

/// Durable client filter state. Mutated only through the controller's input
/// handlers and persisted across reloads. Starred ids and the compact-view
/// flag live under their own storage keys but travel with the bundle in
/// memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterBundle {
    #[serde(skip)]
    pub starred: HashSet<u64>,
    /// Locally archived order ids; always hidden.
    pub archived: HashSet<u64>,
    /// Allow-list; empty means no restriction.
    pub session_statuses: HashSet<SessionStatus>,
    /// Allow-list; empty means no restriction.
    pub workflow_statuses: HashSet<WorkflowStatus>,
    pub my_orders: bool,
    pub unassigned_only: bool,
    pub date_range: DateRange,
    pub search: String,
    #[serde(skip)]
    pub compact_view: bool,
}

impl FilterBundle {
    /// Load the persisted bundle; any missing or unparseable piece falls
    /// back to defaults rather than failing the dashboard startup.
    pub fn load(kv: &dyn KvStore) -> Self {
        let mut bundle: FilterBundle = kv
            .get(KEY_FILTER_BUNDLE)
            .and_then(|raw| {
                serde_json::from_str(&raw)
                    .map_err(|e| warn!(error = %e, "stored filter bundle unreadable, using defaults"))
                    .ok()
            })
            .unwrap_or_default();
        bundle.starred = kv
            .get(KEY_STARRED_ORDERS)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        bundle.compact_view = kv
            .get(KEY_COMPACT_VIEW)
            .map(|v| v == "true")
            .unwrap_or(false);
        bundle
    }

    pub fn persist(&self, kv: &dyn KvStore) {
        match serde_json::to_string(self) {
            Ok(raw) => {
                if let Err(e) = kv.set(KEY_FILTER_BUNDLE, &raw) {
                    warn!(error = %e, "failed to persist filter bundle");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize filter bundle"),
        }
        self.persist_starred(kv);
        let _ = kv.set(KEY_COMPACT_VIEW, if self.compact_view { "true" } else { "false" });
    }

    /// Starred ids change more often than the rest of the bundle (star
    /// toggles, tracking-view eviction), so they get their own write path.
    pub fn persist_starred(&self, kv: &dyn KvStore) {
        let mut ids: Vec<u64> = self.starred.iter().copied().collect();
        ids.sort_unstable();
        match serde_json::to_string(&ids) {
            Ok(raw) => {
                if let Err(e) = kv.set(KEY_STARRED_ORDERS, &raw) {
                    warn!(error = %e, "failed to persist starred orders");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize starred orders"),
        }
    }

    pub fn search_active(&self) -> bool {
        !self.search.trim().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Visibility pipeline
// ---------------------------------------------------------------------------

/// Inputs the per-order predicate needs beyond the order itself.
pub struct VisibilityContext<'a> {
    pub employee_id: u64,
    /// Table label -> employee currently assigned to that table.
    pub table_assignments: &'a HashMap<String, u64>,
    /// Sessions that already have at least one order assigned to the
    /// current employee (multi-order-per-table support).
    pub sessions_with_mine: &'a HashSet<u64>,
    pub now: DateTime<Utc>,
}

/// The fixed-order predicate pipeline. First failure hides the row.
pub fn is_visible(order: &Order, bundle: &FilterBundle, ctx: &VisibilityContext<'_>) -> bool {
    // 1. Locally archived orders are always hidden.
    if bundle.archived.contains(&order.id) {
        return false;
    }

    // 2. Assignment visibility. Skipped for new orders and during an active
    //    search so unclaimed orders and search results are never hidden by
    //    assignment filters.
    let skip_assignment = order.workflow_status == WorkflowStatus::New || bundle.search_active();
    if !skip_assignment {
        if !assignment_visible(order, bundle, ctx) {
            return false;
        }
        if bundle.unassigned_only && order.assignee_id.is_some() {
            return false;
        }
    }

    // 3. Hard exclusion: terminal paid/closed session, regardless of any
    //    other filter setting.
    if order.session_status().is_terminal_paid() {
        return false;
    }

    // 4. Session-status allow-list.
    if !bundle.session_statuses.is_empty()
        && !bundle.session_statuses.contains(&order.session_status())
    {
        return false;
    }

    // 5. Workflow-status allow-list.
    if !bundle.workflow_statuses.is_empty()
        && !bundle.workflow_statuses.contains(&order.workflow_status)
    {
        return false;
    }

    // 6. Date range against creation time.
    if !in_date_range(order.created_at, &bundle.date_range, ctx.now) {
        return false;
    }

    // 7. Free-text search.
    if bundle.search_active() && !matches_search(order, &bundle.search) {
        return false;
    }

    true
}

fn assignment_visible(order: &Order, bundle: &FilterBundle, ctx: &VisibilityContext<'_>) -> bool {
    if order.assignee_id == Some(ctx.employee_id) {
        return true;
    }
    if order.assignee_id.is_none() {
        let my_table = ctx
            .table_assignments
            .get(&order.session.table_label)
            .is_some_and(|owner| *owner == ctx.employee_id);
        if my_table || !bundle.my_orders {
            return true;
        }
    }
    if bundle.starred.contains(&order.id) {
        return true;
    }
    ctx.sessions_with_mine.contains(&order.session_id)
}

/// Case-insensitive substring match over order id, table label, customer
/// name, and waiter note.
pub fn matches_search(order: &Order, term: &str) -> bool {
    let needle = term.trim().to_lowercase();
    if needle.is_empty() {
        return true;
    }
    if order.id.to_string().contains(&needle) {
        return true;
    }
    if order.session.table_label.to_lowercase().contains(&needle) {
        return true;
    }
    if order
        .customer
        .name
        .as_deref()
        .is_some_and(|n| n.to_lowercase().contains(&needle))
    {
        return true;
    }
    order
        .waiter_note
        .as_deref()
        .is_some_and(|n| n.to_lowercase().contains(&needle))
}

// ---------------------------------------------------------------------------
// Sorting
// ---------------------------------------------------------------------------

/// Stable sort: starred first, then orders assigned to the current
/// employee, then descending id (most recent first).
pub fn sort_orders(orders: &mut [&Order], bundle: &FilterBundle, employee_id: u64) {
    orders.sort_by_key(|o| {
        (
            !bundle.starred.contains(&o.id),
            o.assignee_id != Some(employee_id),
            std::cmp::Reverse(o.id),
        )
    });
}

/// Filter and sort the store into the active-view order list.
pub fn visible_orders<'a>(
    store: &'a OrderStore,
    bundle: &FilterBundle,
    employee_id: u64,
    table_assignments: &HashMap<String, u64>,
    now: DateTime<Utc>,
) -> Vec<&'a Order> {
    let sessions_with_mine: HashSet<u64> = store
        .iter()
        .filter(|o| o.assignee_id == Some(employee_id))
        .map(|o| o.session_id)
        .collect();
    let ctx = VisibilityContext {
        employee_id,
        table_assignments,
        sessions_with_mine: &sessions_with_mine,
        now,
    };
    let mut rows: Vec<&Order> = store
        .iter()
        .filter(|o| !o.is_cancelled())
        .filter(|o| is_visible(o, bundle, &ctx))
        .collect();
    sort_orders(&mut rows, bundle, employee_id);
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CustomerSnapshot, SessionSnapshot};
    use crate::status::normalize_session;
    use crate::storage::MemoryStore;

    fn order(id: u64, session_id: u64, status: WorkflowStatus) -> Order {
        Order {
            id,
            session_id,
            workflow_status: status,
            session: SessionSnapshot {
                id: session_id,
                status: Some(SessionStatus::Open),
                table_label: format!("T{session_id:02}"),
                notes: None,
            },
            customer: CustomerSnapshot::default(),
            created_at: Some(Utc::now()),
            updated_at: Some(Utc::now()),
            ..Order::default()
        }
    }

    fn ctx_with<'a>(
        employee_id: u64,
        tables: &'a HashMap<String, u64>,
        mine: &'a HashSet<u64>,
    ) -> VisibilityContext<'a> {
        VisibilityContext {
            employee_id,
            table_assignments: tables,
            sessions_with_mine: mine,
            now: Utc::now(),
        }
    }

    #[test]
    fn test_paid_session_hidden_regardless_of_filters() {
        let tables = HashMap::new();
        let mine = HashSet::new();
        let mut o = order(1, 9, WorkflowStatus::Ready);
        o.session.status = Some(SessionStatus::Paid);
        o.assignee_id = Some(7);

        // Even with every allow-list satisfied and the order assigned to us.
        let mut bundle = FilterBundle::default();
        bundle.workflow_statuses.insert(WorkflowStatus::Ready);
        bundle.session_statuses.insert(SessionStatus::Paid);
        assert!(!is_visible(&o, &bundle, &ctx_with(7, &tables, &mine)));
    }

    #[test]
    fn test_archived_always_hidden() {
        let tables = HashMap::new();
        let mine = HashSet::new();
        let o = order(3, 1, WorkflowStatus::New);
        let mut bundle = FilterBundle::default();
        bundle.archived.insert(3);
        assert!(!is_visible(&o, &bundle, &ctx_with(1, &tables, &mine)));
    }

    #[test]
    fn test_new_orders_skip_assignment_filter() {
        let tables = HashMap::new();
        let mine = HashSet::new();
        let mut bundle = FilterBundle::default();
        bundle.my_orders = true;

        let unclaimed_new = order(4, 2, WorkflowStatus::New);
        assert!(is_visible(&unclaimed_new, &bundle, &ctx_with(1, &tables, &mine)));

        // Same order once queued and claimed by someone else: hidden.
        let mut claimed = order(4, 2, WorkflowStatus::Queued);
        claimed.assignee_id = Some(99);
        assert!(!is_visible(&claimed, &bundle, &ctx_with(1, &tables, &mine)));
    }

    #[test]
    fn test_search_overrides_assignment_filter() {
        let tables = HashMap::new();
        let mine = HashSet::new();
        let mut bundle = FilterBundle::default();
        bundle.my_orders = true;
        bundle.search = "T02".into();

        let mut claimed = order(4, 2, WorkflowStatus::Queued);
        claimed.assignee_id = Some(99);
        assert!(is_visible(&claimed, &bundle, &ctx_with(1, &tables, &mine)));
    }

    #[test]
    fn test_unassigned_from_my_table_visible_under_my_filter() {
        let mut tables = HashMap::new();
        tables.insert("T02".to_string(), 1u64);
        let mine = HashSet::new();
        let mut bundle = FilterBundle::default();
        bundle.my_orders = true;

        let o = order(5, 2, WorkflowStatus::Queued);
        assert!(is_visible(&o, &bundle, &ctx_with(1, &tables, &mine)));
        // Another employee's context: same order hidden.
        assert!(!is_visible(&o, &bundle, &ctx_with(8, &tables, &mine)));
    }

    #[test]
    fn test_sibling_session_order_visible() {
        let tables = HashMap::new();
        let mut mine = HashSet::new();
        mine.insert(2u64);
        let mut bundle = FilterBundle::default();
        bundle.my_orders = true;

        let mut o = order(6, 2, WorkflowStatus::Preparing);
        o.assignee_id = Some(50);
        assert!(is_visible(&o, &bundle, &ctx_with(1, &tables, &mine)));
    }

    #[test]
    fn test_search_matches_id_and_table_label() {
        let mut o = order(5, 1, WorkflowStatus::Queued);
        o.session.table_label = "M05".to_string();
        assert!(matches_search(&o, "5"));

        let mut other = order(123, 2, WorkflowStatus::Queued);
        other.session.table_label = "A01".to_string();
        other.customer.name = Some("Joe".to_string());
        assert!(!matches_search(&other, "5"));
    }

    #[test]
    fn test_unparseable_date_is_within_range() {
        assert!(in_date_range(None, &DateRange::Today, Utc::now()));
    }

    #[test]
    fn test_date_range_today_and_custom() {
        let now = Utc::now();
        let old = now - Duration::days(3);
        assert!(!in_date_range(Some(old), &DateRange::Today, now));
        assert!(in_date_range(Some(old), &DateRange::Last7, now));
        assert!(!in_date_range(Some(old), &DateRange::Custom(2), now));
        assert!(in_date_range(Some(old), &DateRange::Custom(4), now));
        assert!(in_date_range(Some(old), &DateRange::All, now));
    }

    #[test]
    fn test_sort_starred_then_mine_then_id_desc() {
        let mut bundle = FilterBundle::default();
        bundle.starred.insert(2);

        let plain_hi = order(10, 1, WorkflowStatus::Queued);
        let plain_lo = order(4, 1, WorkflowStatus::Queued);
        let starred = order(2, 1, WorkflowStatus::Queued);
        let mut mine = order(7, 1, WorkflowStatus::Queued);
        mine.assignee_id = Some(1);

        let mut rows: Vec<&Order> = vec![&plain_lo, &mine, &plain_hi, &starred];
        sort_orders(&mut rows, &bundle, 1);
        let ids: Vec<u64> = rows.iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![2, 7, 10, 4]);
    }

    #[test]
    fn test_cancelled_excluded_from_active_rows() {
        let mut store = OrderStore::new();
        store.upsert(order(1, 1, WorkflowStatus::Cancelled));
        store.upsert(order(2, 1, WorkflowStatus::Queued));
        let bundle = FilterBundle::default();
        let tables = HashMap::new();
        let rows = visible_orders(&store, &bundle, 1, &tables, Utc::now());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 2);
    }

    #[test]
    fn test_bundle_round_trip_through_kv() {
        let kv = MemoryStore::new();
        let mut bundle = FilterBundle::default();
        bundle.starred.insert(12);
        bundle.my_orders = true;
        bundle.date_range = DateRange::Custom(3);
        bundle.search = "ada".into();
        bundle.compact_view = true;
        bundle.session_statuses.insert(normalize_session("open"));
        bundle.persist(&kv);

        let restored = FilterBundle::load(&kv);
        assert!(restored.starred.contains(&12));
        assert!(restored.my_orders);
        assert_eq!(restored.date_range, DateRange::Custom(3));
        assert_eq!(restored.search, "ada");
        assert!(restored.compact_view);
        assert!(restored.session_statuses.contains(&SessionStatus::Open));
    }
}
