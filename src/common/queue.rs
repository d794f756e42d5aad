//! Buffered last-record queue
//!
//! A single-producer FIFO with one element of look-ahead: every
//! [`enqueue`](BufferedLastRecordQueue::enqueue) forwards the previously
//! held record to the underlying channel and retains the new one. When
//! the snapshot finishes, [`flush`](BufferedLastRecordQueue::flush)
//! applies a transform to the held record before forwarding it.
//!
//! This is how the final snapshot event gets its offset rewritten to
//! carry the `last` marker without re-emitting or reordering anything:
//! until flush runs, the most recent record has not yet reached the
//! consumer.
//!
//! Contract: enqueue is FIFO; at most one element is held; flush is
//! called exactly once at the end of a successful snapshot, never on an
//! aborted run.

use crate::common::{CdcError, ChangeEvent, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Blocking FIFO that retains the most recently enqueued event.
pub struct BufferedLastRecordQueue {
    tx: mpsc::Sender<ChangeEvent>,
    held: Option<ChangeEvent>,
}

impl BufferedLastRecordQueue {
    /// Wrap a channel sender.
    pub fn new(tx: mpsc::Sender<ChangeEvent>) -> Self {
        Self { tx, held: None }
    }

    /// Push any previously held event to the channel, then hold `event`.
    ///
    /// Blocks when the channel is full; a cancellation observed while
    /// blocked surfaces as [`CdcError::Cancelled`].
    pub async fn enqueue(&mut self, event: ChangeEvent, cancel: &CancellationToken) -> Result<()> {
        if let Some(prev) = self.held.take() {
            self.forward(prev, cancel).await?;
        }
        self.held = Some(event);
        Ok(())
    }

    /// Apply `transform` to the held event and push it.
    ///
    /// A flush without a held event is a no-op; this happens when a
    /// snapshot legitimately produced zero data events.
    pub async fn flush<F>(&mut self, transform: F, cancel: &CancellationToken) -> Result<()>
    where
        F: FnOnce(ChangeEvent) -> ChangeEvent,
    {
        if let Some(last) = self.held.take() {
            self.forward(transform(last), cancel).await?;
        }
        Ok(())
    }

    /// Whether an event is currently held back.
    pub fn has_held(&self) -> bool {
        self.held.is_some()
    }

    async fn forward(&self, event: ChangeEvent, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(CdcError::Cancelled),
            sent = self.tx.send(event) => sent.map_err(|_| CdcError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::event::{OFFSET_SNAPSHOT_KEY, OFFSET_SNAPSHOT_LAST};

    fn event(n: u64) -> ChangeEvent {
        ChangeEvent {
            source_partition: serde_json::json!({"server": "test"}),
            offset: serde_json::json!({"file": "binlog.000001", "pos": n, "snapshot": true}),
            topic: "test.db.t".to_string(),
            key: Some(serde_json::json!({"id": n})),
            key_schema: None,
            value: serde_json::json!({"id": n}),
            value_schema: None,
        }
    }

    #[tokio::test]
    async fn test_enqueue_holds_last() {
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let mut queue = BufferedLastRecordQueue::new(tx);

        queue.enqueue(event(1), &cancel).await.unwrap();
        assert!(queue.has_held());
        assert!(rx.try_recv().is_err());

        queue.enqueue(event(2), &cancel).await.unwrap();
        let first = rx.try_recv().unwrap();
        assert_eq!(first.key.unwrap()["id"], 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_flush_transforms_tail() {
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let mut queue = BufferedLastRecordQueue::new(tx);

        for n in 1..=3 {
            queue.enqueue(event(n), &cancel).await.unwrap();
        }
        queue
            .flush(
                |mut ev| {
                    ev.offset[OFFSET_SNAPSHOT_KEY] = serde_json::json!(OFFSET_SNAPSHOT_LAST);
                    ev
                },
                &cancel,
            )
            .await
            .unwrap();

        let mut received = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            received.push(ev);
        }
        assert_eq!(received.len(), 3);
        // FIFO order preserved, only the tail rewritten.
        assert_eq!(received[0].key.as_ref().unwrap()["id"], 1);
        assert_eq!(received[2].key.as_ref().unwrap()["id"], 3);
        assert!(!received[0].is_snapshot_last());
        assert!(!received[1].is_snapshot_last());
        assert!(received[2].is_snapshot_last());
    }

    #[tokio::test]
    async fn test_flush_without_events_is_noop() {
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let mut queue = BufferedLastRecordQueue::new(tx);

        queue.flush(|ev| ev, &cancel).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_unblocks_full_channel() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let mut queue = BufferedLastRecordQueue::new(tx);

        // Fill the channel plus the held slot.
        queue.enqueue(event(1), &cancel).await.unwrap();
        queue.enqueue(event(2), &cancel).await.unwrap();

        // The channel is now full, so forwarding the held record blocks
        // until cancellation fires.
        let waiter = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            waiter.cancel();
        });

        let err = queue.enqueue(event(3), &cancel).await.unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn test_closed_receiver_reports_cancellation() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let cancel = CancellationToken::new();
        let mut queue = BufferedLastRecordQueue::new(tx);

        queue.enqueue(event(1), &cancel).await.unwrap();
        let err = queue.enqueue(event(2), &cancel).await.unwrap_err();
        assert!(err.is_cancellation());
    }
}
