//! Dashboard tuning knobs and the fetch-once server config cache.

use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

use crate::api::ApiClient;

/// Timer intervals and debounce windows for the background work the
/// dashboard runs. One reschedulable handle exists per class; see `sync`.
#[derive(Debug, Clone)]
pub struct DashboardConfig {
    /// Fixed interval for the order poll loop.
    pub order_poll_interval: Duration,
    /// Fixed interval for the pending waiter-call poll loop.
    pub call_poll_interval: Duration,
    /// Refresh interval for the paid tab while it is active.
    pub paid_poll_interval: Duration,
    /// Debounce window collapsing a burst of push events into one
    /// authoritative refresh.
    pub refresh_debounce: Duration,
    /// Debounce window for per-order waiter-note saves.
    pub note_debounce: Duration,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            order_poll_interval: Duration::from_secs(30),
            call_poll_interval: Duration::from_secs(15),
            paid_poll_interval: Duration::from_secs(60),
            refresh_debounce: Duration::from_millis(400),
            note_debounce: Duration::from_millis(600),
        }
    }
}

// ---------------------------------------------------------------------------
// Server config flag
// ---------------------------------------------------------------------------

/// Cached `store_cancel_reason` server flag: whether cancellation reasons
/// are stored server-side. Fetched once per dashboard lifetime; a fetch
/// failure falls back to sending the reason (the server ignores it when
/// unsupported).
#[derive(Default)]
pub struct CancelReasonFlag {
    cached: Mutex<Option<bool>>,
}

impl CancelReasonFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_fetch(&self, api: &ApiClient) -> bool {
        if let Ok(guard) = self.cached.lock() {
            if let Some(v) = *guard {
                return v;
            }
        }
        let fetched = match api.store_cancel_reason().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "store_cancel_reason fetch failed, defaulting to true");
                true
            }
        };
        if let Ok(mut guard) = self.cached.lock() {
            *guard = Some(fetched);
        }
        fetched
    }
}
