//! Ordered, fire-and-forget delivery to the history and notification sinks
//!
//! Each sink gets its own queue and worker task. Enqueueing never blocks, so
//! the synchronizer can enqueue while holding its state lock, and each worker
//! awaits one delivery at a time, so a sink sees deliveries in exactly the
//! order they were enqueued. A slow history sink does not hold up
//! notifications and vice versa.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::events::{AppEvent, HistoryRecord, HistorySink, NotificationSink};

enum Delivery<T> {
    Item(T),
    Flush(oneshot::Sender<()>),
}

/// Background delivery queues for both sinks
#[derive(Debug)]
pub struct SinkDispatcher {
    history: mpsc::UnboundedSender<Delivery<HistoryRecord>>,
    notifications: mpsc::UnboundedSender<Delivery<AppEvent>>,
    workers: Vec<JoinHandle<()>>,
}

impl SinkDispatcher {
    /// Spawn the delivery workers on the current tokio runtime
    pub fn spawn(history: Arc<dyn HistorySink>, notifications: Arc<dyn NotificationSink>) -> Self {
        let (history_tx, mut history_rx) = mpsc::unbounded_channel::<Delivery<HistoryRecord>>();
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<Delivery<AppEvent>>();

        let history_worker = tokio::spawn(async move {
            while let Some(delivery) = history_rx.recv().await {
                match delivery {
                    Delivery::Item(record) => {
                        let call_id = record.call.id.clone();
                        if let Err(e) = history.record(record).await {
                            error!("History sink rejected record for call {}: {}", call_id, e);
                        }
                    }
                    Delivery::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("History delivery worker stopped");
        });

        let notify_worker = tokio::spawn(async move {
            while let Some(delivery) = notify_rx.recv().await {
                match delivery {
                    Delivery::Item(event) => {
                        let kind = event.kind();
                        if let Err(e) = notifications.publish(event).await {
                            error!("Notification sink rejected {} event: {}", kind, e);
                        }
                    }
                    Delivery::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Notification delivery worker stopped");
        });

        Self {
            history: history_tx,
            notifications: notify_tx,
            workers: vec![history_worker, notify_worker],
        }
    }

    /// Queue a history record
    pub fn record(&self, record: HistoryRecord) {
        if self.history.send(Delivery::Item(record)).is_err() {
            error!("History delivery worker is gone; record dropped");
        }
    }

    /// Queue an application event
    pub fn publish(&self, event: AppEvent) {
        if self.notifications.send(Delivery::Item(event)).is_err() {
            error!("Notification delivery worker is gone; event dropped");
        }
    }

    /// Wait until everything queued so far has been delivered to both sinks
    pub async fn flush(&self) {
        let (history_done, history_wait) = oneshot::channel();
        let (notify_done, notify_wait) = oneshot::channel();
        let history_queued = self.history.send(Delivery::Flush(history_done)).is_ok();
        let notify_queued = self.notifications.send(Delivery::Flush(notify_done)).is_ok();
        if history_queued {
            let _ = history_wait.await;
        }
        if notify_queued {
            let _ = notify_wait.await;
        }
    }

    /// Deliver what is queued, then stop the workers
    pub async fn shutdown(self) {
        let Self {
            history,
            notifications,
            workers,
        } = self;
        drop(history);
        drop(notifications);
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Delivery worker panicked: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{Call, CallId, CallState};
    use crate::error::{SyncError, SyncResult};
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct SlowHistory {
        records: Mutex<Vec<CallId>>,
    }

    #[async_trait]
    impl HistorySink for SlowHistory {
        async fn record(&self, record: HistoryRecord) -> SyncResult<()> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.records.lock().push(record.call.id);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FlakyNotifications {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NotificationSink for FlakyNotifications {
        async fn publish(&self, event: AppEvent) -> SyncResult<()> {
            if let AppEvent::TransferStateChanged { result } = &event {
                if result == "boom" {
                    return Err(SyncError::sink("refused"));
                }
                self.events.lock().push(result.clone());
            }
            Ok(())
        }
    }

    fn record(id: &str) -> HistoryRecord {
        let mut call = Call::incoming("acc", CallId::from(id), "sip:x@y", Utc::now());
        call.apply_state(CallState::HungUp, Utc::now()).unwrap();
        HistoryRecord::from_call(call, None, vec![])
    }

    fn transfer(result: &str) -> AppEvent {
        AppEvent::TransferStateChanged { result: result.into() }
    }

    #[tokio::test]
    async fn test_delivery_preserves_order() {
        let history = Arc::new(SlowHistory::default());
        let notifications = Arc::new(FlakyNotifications::default());
        let dispatcher = SinkDispatcher::spawn(history.clone(), notifications.clone());

        for i in 0..5 {
            dispatcher.record(record(&format!("c{}", i)));
            dispatcher.publish(transfer(&i.to_string()));
        }
        dispatcher.flush().await;

        let ids: Vec<String> = history.records.lock().iter().map(|c| c.to_string()).collect();
        assert_eq!(ids, vec!["c0", "c1", "c2", "c3", "c4"]);
        assert_eq!(*notifications.events.lock(), vec!["0", "1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_sink_errors_do_not_stop_delivery() {
        let history = Arc::new(SlowHistory::default());
        let notifications = Arc::new(FlakyNotifications::default());
        let dispatcher = SinkDispatcher::spawn(history, notifications.clone());

        dispatcher.publish(transfer("a"));
        dispatcher.publish(transfer("boom"));
        dispatcher.publish(transfer("b"));
        dispatcher.shutdown().await;

        assert_eq!(*notifications.events.lock(), vec!["a", "b"]);
    }
}
