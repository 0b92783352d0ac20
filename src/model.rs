//! Data model for the order mirror.
//!
//! Wire shapes are deliberately tolerant: the admin dashboard has shipped
//! several payload generations, so deserialization accepts both camelCase and
//! snake_case spellings and treats unparseable timestamps as absent instead
//! of failing the whole record. `Order::normalized` is the single choke point
//! that turns a raw wire record into something the store may hold.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::{self, PaymentStatus, SessionStatus, WorkflowStatus};

// ---------------------------------------------------------------------------
// Tolerant timestamp (de)serialization
// ---------------------------------------------------------------------------

/// ISO-8601 timestamps that may be absent, null, or malformed. A malformed
/// value deserializes to `None`; date-range filtering later treats `None` as
/// "within range" rather than hiding the row.
pub(crate) mod tolerant_ts {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, ser: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => ser.serialize_str(&ts.to_rfc3339()),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(de: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(de)?;
        Ok(raw.as_deref().and_then(parse))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    }
}

// ---------------------------------------------------------------------------
// Embedded snapshots
// ---------------------------------------------------------------------------

/// Snapshot of the table session the order belongs to, embedded in each
/// order record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSnapshot {
    #[serde(alias = "session_id")]
    pub id: u64,
    pub status: Option<SessionStatus>,
    #[serde(alias = "table_label", alias = "table")]
    pub table_label: String,
    #[serde(alias = "session_notes")]
    pub notes: Option<String>,
}

impl SessionSnapshot {
    pub fn status(&self) -> SessionStatus {
        self.status
            .clone()
            .unwrap_or(SessionStatus::Other(String::new()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CustomerSnapshot {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

// ---------------------------------------------------------------------------
// Order items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrderItem {
    #[serde(alias = "item_id")]
    pub id: u64,
    pub quantity: u32,
    #[serde(alias = "delivered_quantity")]
    pub delivered_quantity: u32,
    #[serde(alias = "is_fully_delivered")]
    pub is_fully_delivered: bool,
    #[serde(alias = "delivered_at", with = "tolerant_ts")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(alias = "delivered_by")]
    pub delivered_by: Option<u64>,
}

impl OrderItem {
    /// Clamp delivered quantity to the ordered quantity and derive the
    /// fully-delivered flag from the quantities, whatever the wire said.
    fn reconcile(&mut self) {
        if self.delivered_quantity > self.quantity {
            self.delivered_quantity = self.quantity;
        }
        self.is_fully_delivered = self.quantity > 0 && self.delivered_quantity == self.quantity;
    }
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Order {
    #[serde(alias = "order_id")]
    pub id: u64,
    #[serde(alias = "session_id")]
    pub session_id: u64,
    #[serde(alias = "status", alias = "workflow_status")]
    pub workflow_status: WorkflowStatus,
    /// Raw legacy status token, retained only so the record can be
    /// re-normalized; never used directly by filtering or views.
    #[serde(alias = "legacy_status", skip_serializing_if = "Option::is_none")]
    pub legacy_status: Option<String>,
    pub session: SessionSnapshot,
    pub customer: CustomerSnapshot,
    #[serde(alias = "assignee_id", alias = "waiter_id")]
    pub assignee_id: Option<u64>,
    #[serde(alias = "assignee_name", alias = "waiter_name")]
    pub assignee_name: Option<String>,
    #[serde(alias = "waiter_note")]
    pub waiter_note: Option<String>,
    pub items: Vec<OrderItem>,
    #[serde(alias = "payment_status")]
    pub payment_status: PaymentStatus,
    #[serde(alias = "created_at", with = "tolerant_ts")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(alias = "updated_at", with = "tolerant_ts")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(alias = "accepted_at", with = "tolerant_ts")]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(alias = "ready_at", with = "tolerant_ts")]
    pub ready_at: Option<DateTime<Utc>>,
    #[serde(alias = "cancelled_at", with = "tolerant_ts")]
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Canonicalize a freshly deserialized record. Every ingestion path
    /// (full fetch, push patch, action result) must pass through here before
    /// the record reaches the store.
    pub fn normalized(mut self) -> Self {
        self.workflow_status =
            status::renormalize(&self.workflow_status, self.legacy_status.as_deref());
        if let Some(email) = self.customer.email.take() {
            let email = email.trim().to_lowercase();
            self.customer.email = (!email.is_empty()).then_some(email);
        }
        for item in &mut self.items {
            item.reconcile();
        }
        self
    }

    pub fn session_status(&self) -> SessionStatus {
        self.session.status()
    }

    pub fn is_cancelled(&self) -> bool {
        self.workflow_status == WorkflowStatus::Cancelled
    }

    /// True once every item of a non-empty item list is fully delivered.
    pub fn all_items_delivered(&self) -> bool {
        !self.items.is_empty() && self.items.iter().all(|i| i.is_fully_delivered)
    }
}

// ---------------------------------------------------------------------------
// Waiter calls
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WaiterCall {
    #[serde(alias = "call_id")]
    pub id: u64,
    #[serde(alias = "session_id")]
    pub session_id: u64,
    #[serde(alias = "table_label", alias = "table")]
    pub table_label: String,
    pub status: String,
    #[serde(alias = "created_at", with = "tolerant_ts")]
    pub created_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
    #[serde(alias = "order_ids")]
    pub order_ids: Vec<u64>,
}

impl WaiterCall {
    pub fn is_pending(&self) -> bool {
        self.status.eq_ignore_ascii_case("pending")
    }
}

// ---------------------------------------------------------------------------
// Paid sessions (separate read model for the paid tab)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PaidSession {
    #[serde(alias = "session_id")]
    pub id: u64,
    #[serde(alias = "table_label", alias = "table")]
    pub table_label: String,
    #[serde(alias = "paid_at", with = "tolerant_ts")]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(alias = "total_amount")]
    pub total_amount: f64,
    #[serde(alias = "order_count")]
    pub order_count: u32,
    #[serde(alias = "customer_name")]
    pub customer_name: Option<String>,
}

/// Format a monetary amount for display. Amounts are decimal on the wire and
/// only ever rounded at the presentation edge.
pub fn format_amount(amount: f64) -> String {
    format!("{amount:.2}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_order_json() -> serde_json::Value {
        serde_json::json!({
            "order_id": 41,
            "session_id": 9,
            "status": "requested",
            "session": { "id": 9, "status": "open", "tableLabel": "M05" },
            "customer": { "name": "Ada", "email": "  Ada@Example.COM " },
            "items": [
                { "id": 1, "quantity": 2, "delivered_quantity": 3 }
            ],
            "created_at": "2026-08-06T10:00:00Z",
            "updated_at": "not-a-date"
        })
    }

    #[test]
    fn test_normalized_maps_legacy_status_and_email() {
        let order: Order = serde_json::from_value(raw_order_json()).unwrap();
        let order = order.normalized();
        assert_eq!(order.id, 41);
        assert_eq!(order.workflow_status, WorkflowStatus::New);
        assert_eq!(order.customer.email.as_deref(), Some("ada@example.com"));
    }

    #[test]
    fn test_item_delivery_invariants_enforced() {
        let order: Order = serde_json::from_value(raw_order_json()).unwrap();
        let order = order.normalized();
        let item = &order.items[0];
        assert!(item.delivered_quantity <= item.quantity);
        assert_eq!(item.delivered_quantity, 2);
        assert!(item.is_fully_delivered);
    }

    #[test]
    fn test_unparseable_timestamp_becomes_none() {
        let order: Order = serde_json::from_value(raw_order_json()).unwrap();
        assert!(order.created_at.is_some());
        assert!(order.updated_at.is_none());
    }

    #[test]
    fn test_all_items_delivered() {
        let mut order: Order = serde_json::from_value(raw_order_json()).unwrap();
        order = order.normalized();
        assert!(order.all_items_delivered());
        order.items.push(OrderItem {
            id: 2,
            quantity: 1,
            ..OrderItem::default()
        });
        assert!(!order.all_items_delivered());
    }

    #[test]
    fn test_amount_formatting_two_places() {
        assert_eq!(format_amount(12.5), "12.50");
        assert_eq!(format_amount(0.0), "0.00");
    }
}
