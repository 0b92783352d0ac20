//! Waiter-call tracking.
//!
//! Calls are created server-side, arrive here via the pending-call poll or a
//! push event, and disappear on confirmation. Each call alerts exactly once
//! per dashboard lifetime however many polls re-deliver it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::error::Result;
use crate::lock;
use crate::model::WaiterCall;
use crate::notify::{Envelope, EventSink, Notification};

pub struct CallBoard {
    api: Arc<ApiClient>,
    sink: Arc<dyn EventSink>,
    pending: Mutex<Vec<WaiterCall>>,
    /// Call ids already alerted; pruned to the live pending set each poll.
    notified: Mutex<HashSet<u64>>,
    is_running: Arc<AtomicBool>,
    tracker: TaskTracker,
}

impl CallBoard {
    pub fn new(api: Arc<ApiClient>, sink: Arc<dyn EventSink>) -> Arc<Self> {
        Arc::new(Self {
            api,
            sink,
            pending: Mutex::new(Vec::new()),
            notified: Mutex::new(HashSet::new()),
            is_running: Arc::new(AtomicBool::new(false)),
            tracker: TaskTracker::new(),
        })
    }

    /// Start the fixed-interval pending-call poll loop.
    pub fn start_poll(self: &Arc<Self>, interval: Duration) {
        self.is_running.store(true, Ordering::SeqCst);
        let board = Arc::clone(self);
        self.tracker.spawn(async move {
            info!(interval_secs = interval.as_secs(), "waiter-call poll loop started");
            loop {
                if !board.is_running.load(Ordering::SeqCst) {
                    info!("waiter-call poll loop stopped");
                    break;
                }
                tokio::time::sleep(interval).await;
                if !board.is_running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = board.poll_once().await {
                    warn!(error = %e, "waiter-call poll failed");
                }
            }
        });
    }

    pub async fn poll_once(&self) -> Result<()> {
        let calls = self.api.pending_calls().await?;
        self.ingest(calls);
        Ok(())
    }

    /// Replace the pending list and alert for calls not seen before.
    pub fn ingest(&self, calls: Vec<WaiterCall>) {
        let pending: Vec<WaiterCall> = calls.into_iter().filter(WaiterCall::is_pending).collect();
        let live_ids: HashSet<u64> = pending.iter().map(|c| c.id).collect();

        let fresh: Vec<&WaiterCall> = {
            let mut notified = lock(&self.notified);
            notified.retain(|id| live_ids.contains(id));
            pending
                .iter()
                .filter(|c| notified.insert(c.id))
                .collect()
        };
        for call in fresh {
            self.sink.notify(Envelope::new(Notification::WaiterCall {
                call_id: call.id,
                table_label: call.table_label.clone(),
                note: call.note.clone(),
            }));
        }
        *lock(&self.pending) = pending;
    }

    /// A `waiter_call` push event; same once-only alert discipline.
    pub fn ingest_push(&self, call: WaiterCall) {
        if !call.is_pending() {
            return;
        }
        let fresh = lock(&self.notified).insert(call.id);
        if fresh {
            self.sink.notify(Envelope::new(Notification::WaiterCall {
                call_id: call.id,
                table_label: call.table_label.clone(),
                note: call.note.clone(),
            }));
        }
        let mut pending = lock(&self.pending);
        if !pending.iter().any(|c| c.id == call.id) {
            pending.push(call);
        }
    }

    pub fn pending(&self) -> Vec<WaiterCall> {
        lock(&self.pending).clone()
    }

    /// Confirm a call with the server and drop it locally.
    pub async fn confirm(&self, call_id: u64) -> Result<()> {
        self.api.confirm_call(call_id).await?;
        lock(&self.pending).retain(|c| c.id != call_id);
        Ok(())
    }

    pub async fn call_supervisor(&self, session_id: u64, note: Option<&str>) -> Result<()> {
        self.api.call_supervisor(session_id, note).await
    }

    pub fn shutdown(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.tracker.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSink {
        calls: Mutex<Vec<u64>>,
    }

    impl EventSink for RecordingSink {
        fn notify(&self, envelope: Envelope) {
            if let Notification::WaiterCall { call_id, .. } = envelope.event {
                self.calls.lock().unwrap().push(call_id);
            }
        }
        fn invalidate_row(&self, _order_id: u64) {}
        fn refresh_view(&self) {}
    }

    fn board() -> (Arc<CallBoard>, Arc<RecordingSink>) {
        let api = Arc::new(ApiClient::new("localhost:1", "k", 1).unwrap());
        let sink = Arc::new(RecordingSink {
            calls: Mutex::new(Vec::new()),
        });
        (CallBoard::new(api, sink.clone()), sink)
    }

    fn call(id: u64, status: &str) -> WaiterCall {
        WaiterCall {
            id,
            session_id: 1,
            table_label: "T01".into(),
            status: status.into(),
            ..WaiterCall::default()
        }
    }

    #[test]
    fn test_each_call_alerts_exactly_once() {
        let (board, sink) = board();
        board.ingest(vec![call(1, "pending"), call(2, "pending")]);
        board.ingest(vec![call(1, "pending"), call(2, "pending")]);
        let mut seen = sink.calls.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(board.pending().len(), 2);
    }

    #[test]
    fn test_non_pending_calls_are_ignored() {
        let (board, sink) = board();
        board.ingest(vec![call(1, "confirmed")]);
        assert!(sink.calls.lock().unwrap().is_empty());
        assert!(board.pending().is_empty());
    }

    #[test]
    fn test_push_then_poll_does_not_double_alert() {
        let (board, sink) = board();
        board.ingest_push(call(5, "pending"));
        board.ingest(vec![call(5, "pending")]);
        assert_eq!(*sink.calls.lock().unwrap(), vec![5]);
        assert_eq!(board.pending().len(), 1);
    }
}
