//! In-memory order store.
//!
//! The single source of truth for rendering: a map from order id to order
//! record, fully owned by the dashboard controller. The store itself knows
//! nothing about merge policy; who wins when two sync sources touch the same
//! record is decided by the reconciliation layer (`sync`), which either
//! replaces the whole map (authoritative full refresh) or overlays a single
//! record (optimistic patch).

use std::collections::HashMap;

use crate::model::Order;
use crate::status::WorkflowStatus;

#[derive(Debug, Default)]
pub struct OrderStore {
    orders: HashMap<u64, Order>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wholesale replacement, used by authoritative full refreshes. Records
    /// are expected to be normalized already.
    pub fn replace_all(&mut self, orders: Vec<Order>) {
        self.orders = orders.into_iter().map(|o| (o.id, o)).collect();
    }

    /// Insert or overwrite a single record (push patch / action result).
    /// Returns true when the id was not present before.
    pub fn upsert(&mut self, order: Order) -> bool {
        self.orders.insert(order.id, order).is_none()
    }

    pub fn get(&self, id: u64) -> Option<&Order> {
        self.orders.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Order> {
        self.orders.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Order> {
        self.orders.values()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Id -> canonical status snapshot, the shape the poll differ keeps
    /// between cycles.
    pub fn status_snapshot(&self) -> HashMap<u64, WorkflowStatus> {
        self.orders
            .values()
            .map(|o| (o.id, o.workflow_status.clone()))
            .collect()
    }

    /// All orders belonging to one session (multi-order tables).
    pub fn session_orders(&self, session_id: u64) -> impl Iterator<Item = &Order> {
        self.orders
            .values()
            .filter(move |o| o.session_id == session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(id: u64, session_id: u64) -> Order {
        Order {
            id,
            session_id,
            ..Order::default()
        }
    }

    #[test]
    fn test_replace_all_is_wholesale() {
        let mut store = OrderStore::new();
        store.upsert(order(1, 10));
        store.upsert(order(2, 10));
        store.replace_all(vec![order(3, 11)]);
        assert_eq!(store.len(), 1);
        assert!(store.get(1).is_none());
        assert!(store.get(3).is_some());
    }

    #[test]
    fn test_upsert_reports_new_ids() {
        let mut store = OrderStore::new();
        assert!(store.upsert(order(7, 1)));
        assert!(!store.upsert(order(7, 1)));
    }

    #[test]
    fn test_session_orders() {
        let mut store = OrderStore::new();
        store.upsert(order(1, 9));
        store.upsert(order(2, 9));
        store.upsert(order(3, 4));
        assert_eq!(store.session_orders(9).count(), 2);
    }
}
