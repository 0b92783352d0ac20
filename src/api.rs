//! Admin dashboard API client.
//!
//! Provides authenticated HTTP communication with the admin dashboard for
//! order fetches, workflow transitions, waiter calls, and session
//! operations. Responses that carry order records are normalized here, at
//! the boundary, so nothing downstream ever sees a raw legacy status.

use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{self, DashboardError, Result};
use crate::model::{Order, PaidSession, WaiterCall};

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight connectivity test.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed deadline for waiter-note saves; exceeding it surfaces a distinct
/// timeout message and assumes no partial write.
const NOTE_SAVE_TIMEOUT: Duration = Duration::from_secs(8);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the admin dashboard URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    // Ensure scheme
    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    // Strip trailing slashes
    while url.ends_with('/') {
        url.pop();
    }

    // Strip trailing /api
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach admin dashboard at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid admin dashboard URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Dashboard key is invalid or expired".to_string(),
        403 => "Dashboard not authorized".to_string(),
        404 => "Admin dashboard endpoint not found".to_string(),
        s if s >= 500 => format!("Admin dashboard server error (HTTP {s})"),
        s => format!("Unexpected response from admin dashboard (HTTP {s})"),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct ApiClient {
    base_url: String,
    api_key: String,
    employee_id: u64,
    http: Client,
}

impl ApiClient {
    pub fn new(base_url: &str, api_key: &str, employee_id: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| DashboardError::Network(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: normalize_base_url(base_url),
            api_key: api_key.trim().to_string(),
            employee_id,
            http,
        })
    }

    pub fn employee_id(&self) -> u64 {
        self.employee_id
    }

    /// Perform an authenticated request. `path` includes the leading slash,
    /// e.g. `/api/orders`. Non-2xx responses are mined for a structured
    /// conflict code first, then mapped to a friendly network error.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let full_url = format!("{}{path}", self.base_url);

        let mut req = self
            .http
            .request(method, &full_url)
            .header("X-Dashboard-Key", &self.api_key)
            .header("x-employee-id", self.employee_id.to_string())
            .header("Content-Type", "application/json");
        if let Some(t) = timeout {
            req = req.timeout(t);
        }
        if let Some(b) = body {
            req = req.json(&b);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                DashboardError::Timeout(friendly_error(&self.base_url, &e))
            } else {
                DashboardError::Network(friendly_error(&self.base_url, &e))
            }
        })?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            let json = serde_json::from_str::<Value>(&body_text).ok();
            if error::is_conflict_response(status.as_u16(), json.as_ref()) {
                debug!(path, status = status.as_u16(), "conflict response");
                return Err(DashboardError::Conflict {
                    assignee: error::conflict_assignee(json.as_ref()),
                });
            }
            // Preserve server detail for feedback and logs.
            let detail = json
                .as_ref()
                .and_then(|j| {
                    j.get("error")
                        .or_else(|| j.get("message"))
                        .and_then(Value::as_str)
                })
                .map(|m| format!("{m} (HTTP {})", status.as_u16()))
                .unwrap_or_else(|| format!("{} (HTTP {})", status_error(status), status.as_u16()));
            warn!(path, status = status.as_u16(), "request failed");
            return Err(DashboardError::Network(detail));
        }

        if body_text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| {
            DashboardError::Network(format!("Invalid JSON from admin dashboard: {e}"))
        })
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.request(Method::GET, path, None, None).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.request(Method::POST, path, Some(body), None).await
    }

    // -----------------------------------------------------------------------
    // Orders
    // -----------------------------------------------------------------------

    /// Full order list fetch, the authoritative source each refresh replaces
    /// the store from.
    pub async fn fetch_orders(
        &self,
        include_closed: bool,
        include_delivered: bool,
    ) -> Result<Vec<Order>> {
        let mut path = "/api/orders".to_string();
        let mut params = Vec::new();
        if include_closed {
            params.push("include_closed=1");
        }
        if include_delivered {
            params.push("include_delivered=1");
        }
        if !params.is_empty() {
            path = format!("{path}?{}", params.join("&"));
        }
        let value = self.get(&path).await?;
        Ok(parse_order_list(value))
    }

    /// Delta-row fetch: everything except the ids the client already holds.
    pub async fn fetch_table_rows(&self, exclude_ids: &[u64]) -> Result<Vec<Order>> {
        let value = self
            .post(
                "/api/orders/table-rows",
                serde_json::json!({ "excludeIds": exclude_ids }),
            )
            .await?;
        Ok(parse_order_list(value))
    }

    /// Execute a workflow transition. `segment` is the URL tail, e.g.
    /// `accept` or `kitchen/start`. Returns the server's canonical record.
    pub async fn transition_order(
        &self,
        order_id: u64,
        segment: &str,
        mut body: Value,
    ) -> Result<Order> {
        if let Value::Object(ref mut map) = body {
            // The dispatcher may act for a specific employee; only fill in
            // the session default when it did not.
            if !map.contains_key("employeeId") {
                map.insert("employeeId".into(), Value::from(self.employee_id));
            }
        }
        let value = self
            .post(&format!("/api/orders/{order_id}/{segment}"), body)
            .await?;
        parse_order(value)
            .ok_or_else(|| DashboardError::Network("Transition response carried no order".into()))
    }

    /// Save the waiter note with the fixed note-save deadline.
    pub async fn save_note(&self, order_id: u64, note: &str) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/api/orders/{order_id}/notes"),
            Some(serde_json::json!({ "note": note, "employeeId": self.employee_id })),
            Some(NOTE_SAVE_TIMEOUT),
        )
        .await
        .map(|_| ())
        .map_err(|e| match e {
            DashboardError::Timeout(_) => {
                DashboardError::Timeout(format!("Saving note for order {order_id} timed out"))
            }
            other => other,
        })
    }

    /// Item-level delivery. `deliveries` pairs item id with the quantity
    /// delivered now.
    pub async fn deliver_items(&self, order_id: u64, deliveries: &[(u64, u32)]) -> Result<Order> {
        let items: Vec<Value> = deliveries
            .iter()
            .map(|(id, qty)| serde_json::json!({ "itemId": id, "quantity": qty }))
            .collect();
        let value = self
            .post(
                &format!("/api/orders/{order_id}/deliver-items"),
                serde_json::json!({ "items": items, "employeeId": self.employee_id }),
            )
            .await?;
        parse_order(value)
            .ok_or_else(|| DashboardError::Network("Delivery response carried no order".into()))
    }

    pub async fn delivery_status(&self, order_id: u64) -> Result<Value> {
        self.get(&format!("/api/orders/{order_id}/delivery-status"))
            .await
    }

    // -----------------------------------------------------------------------
    // Waiter calls
    // -----------------------------------------------------------------------

    pub async fn pending_calls(&self) -> Result<Vec<WaiterCall>> {
        let value = self.get("/api/waiter-calls/pending").await?;
        let list = unwrap_list(value, &["calls", "data"]);
        Ok(list
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    pub async fn confirm_call(&self, call_id: u64) -> Result<()> {
        self.post(
            &format!("/api/waiter-calls/{call_id}/confirm"),
            serde_json::json!({ "employeeId": self.employee_id }),
        )
        .await
        .map(|_| ())
    }

    pub async fn call_supervisor(&self, session_id: u64, note: Option<&str>) -> Result<()> {
        self.post(
            "/api/waiter-calls/supervisor/call",
            serde_json::json!({ "sessionId": session_id, "note": note }),
        )
        .await
        .map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// The separate read model backing the paid tab.
    pub async fn paid_recent(&self) -> Result<Vec<PaidSession>> {
        let value = self.get("/api/sessions/paid-recent").await?;
        let list = unwrap_list(value, &["sessions", "data"]);
        Ok(list
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    pub async fn request_checkout(&self, session_id: u64) -> Result<()> {
        self.post(&format!("/api/sessions/{session_id}/checkout"), Value::Null)
            .await
            .map(|_| ())
    }

    /// Record a tip. Validated locally; a non-finite or negative amount
    /// never reaches the network.
    pub async fn set_tip(&self, session_id: u64, amount: f64) -> Result<()> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(DashboardError::validation(
                "Tip amount must be zero or positive",
            ));
        }
        self.post(
            &format!("/api/sessions/{session_id}/tip"),
            serde_json::json!({ "amount": amount }),
        )
        .await
        .map(|_| ())
    }

    pub async fn confirm_payment(&self, session_id: u64) -> Result<()> {
        self.post(
            &format!("/api/sessions/{session_id}/confirm-payment"),
            serde_json::json!({ "employeeId": self.employee_id }),
        )
        .await
        .map(|_| ())
    }

    pub async fn resend_receipt(&self, session_id: u64) -> Result<()> {
        self.post(&format!("/api/sessions/{session_id}/resend"), Value::Null)
            .await
            .map(|_| ())
    }

    /// Ticket URL for the rendering adapter to open or print; no fetch here.
    pub fn ticket_url(&self, session_id: u64, pdf: bool) -> String {
        if pdf {
            format!("{}/api/sessions/{session_id}/ticket.pdf", self.base_url)
        } else {
            format!("{}/api/sessions/{session_id}/ticket", self.base_url)
        }
    }

    // -----------------------------------------------------------------------
    // Config
    // -----------------------------------------------------------------------

    /// Whether the server stores cancellation reasons. Fetched once by the
    /// config cache, never on the hot path.
    pub async fn store_cancel_reason(&self) -> Result<bool> {
        let value = self.get("/api/config/store_cancel_reason").await?;
        Ok(match value {
            Value::Bool(b) => b,
            Value::Object(ref map) => map
                .get("enabled")
                .or_else(|| map.get("value"))
                .and_then(Value::as_bool)
                .unwrap_or(false),
            _ => false,
        })
    }

    // -----------------------------------------------------------------------
    // Connectivity test
    // -----------------------------------------------------------------------

    /// Test connectivity to the admin dashboard with a lightweight
    /// health-check.
    pub async fn test_connectivity(&self) -> ConnectivityResult {
        let start = Instant::now();
        let result = self
            .request(Method::GET, "/api/health", None, Some(CONNECTIVITY_TIMEOUT))
            .await;
        let latency = start.elapsed().as_millis() as u64;

        match result {
            Ok(_) => {
                info!(latency_ms = latency, "connectivity test passed");
                ConnectivityResult {
                    success: true,
                    latency_ms: Some(latency),
                    error: None,
                }
            }
            Err(e) => ConnectivityResult {
                success: false,
                latency_ms: Some(latency),
                error: Some(e.to_string()),
            },
        }
    }
}

/// Result of a connectivity test.
#[derive(serde::Serialize)]
pub struct ConnectivityResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Response shaping
// ---------------------------------------------------------------------------

/// Accept both a bare array and `{ "orders": [...] }` / `{ "data": [...] }`
/// envelopes; older server builds differ.
fn unwrap_list(value: Value, keys: &[&str]) -> Vec<Value> {
    match value {
        Value::Array(list) => list,
        Value::Object(mut map) => {
            for key in keys {
                if let Some(Value::Array(list)) = map.remove(*key) {
                    return list;
                }
            }
            Vec::new()
        }
        _ => Vec::new(),
    }
}

fn parse_order_list(value: Value) -> Vec<Order> {
    unwrap_list(value, &["orders", "data"])
        .into_iter()
        .filter_map(|v| serde_json::from_value::<Order>(v).ok())
        .map(Order::normalized)
        .collect()
}

/// Accept a bare order object or an `{ "order": {...} }` envelope.
fn parse_order(value: Value) -> Option<Order> {
    let inner = match value {
        Value::Object(mut map) => match map.remove("order") {
            Some(o) => o,
            None => Value::Object(map),
        },
        other => other,
    };
    serde_json::from_value::<Order>(inner)
        .ok()
        .map(Order::normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::WorkflowStatus;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("dashboard.example.com/api/"),
            "https://dashboard.example.com"
        );
        assert_eq!(normalize_base_url("localhost:3000"), "http://localhost:3000");
        assert_eq!(
            normalize_base_url("https://x.example.com///"),
            "https://x.example.com"
        );
    }

    #[test]
    fn test_parse_order_list_accepts_envelope_and_bare_array() {
        let bare = serde_json::json!([{ "id": 1, "sessionId": 2, "status": "requested" }]);
        let envelope =
            serde_json::json!({ "orders": [{ "id": 1, "sessionId": 2, "status": "new" }] });
        assert_eq!(parse_order_list(bare).len(), 1);
        let parsed = parse_order_list(envelope);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].workflow_status, WorkflowStatus::New);
    }

    #[test]
    fn test_parse_order_normalizes_legacy_status() {
        let value =
            serde_json::json!({ "order": { "id": 3, "sessionId": 1, "status": "requested" } });
        let order = parse_order(value).unwrap();
        assert_eq!(order.workflow_status, WorkflowStatus::New);
    }

    #[test]
    fn test_ticket_url_variants() {
        let client = ApiClient::new("dashboard.example.com", "k", 1).unwrap();
        assert_eq!(
            client.ticket_url(9, false),
            "https://dashboard.example.com/api/sessions/9/ticket"
        );
        assert!(client.ticket_url(9, true).ends_with("/ticket.pdf"));
    }
}
