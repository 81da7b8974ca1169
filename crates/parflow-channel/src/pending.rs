//! Bookkeeping for at-least-once delivery.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use parflow_frame::Frame;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::channel::lock;
use crate::identity::Identity;

/// Final state of a tracked message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The receiver replied with the matching correlation id.
    Acknowledged,
    /// Retries were exhausted.
    Dropped,
}

struct PendingAck {
    frame: Frame,
    target: Option<Identity>,
    done: oneshot::Sender<AckOutcome>,
    cancel: CancellationToken,
}

/// Messages sent with a correlation id and not yet acknowledged.
#[derive(Default)]
pub(crate) struct PendingAcks {
    entries: Mutex<HashMap<String, PendingAck>>,
    drained: Notify,
}

impl PendingAcks {
    /// Track `frame` under `correlation_id`. The token is cancelled when the
    /// entry settles.
    pub fn insert(
        &self,
        correlation_id: String,
        frame: Frame,
        target: Option<Identity>,
    ) -> (oneshot::Receiver<AckOutcome>, CancellationToken) {
        let (done, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        lock(&self.entries).insert(
            correlation_id,
            PendingAck {
                frame,
                target,
                done,
                cancel: cancel.clone(),
            },
        );
        (rx, cancel)
    }

    /// The frame and target to resend, if the message is still outstanding.
    pub fn resend(&self, correlation_id: &str) -> Option<(Frame, Option<Identity>)> {
        lock(&self.entries)
            .get(correlation_id)
            .map(|entry| (entry.frame.clone(), entry.target.clone()))
    }

    /// Settle as acknowledged. Returns false if the id was not outstanding.
    pub fn resolve(&self, correlation_id: &str) -> bool {
        self.settle(correlation_id, AckOutcome::Acknowledged)
    }

    /// Settle as dropped.
    pub fn give_up(&self, correlation_id: &str) -> bool {
        self.settle(correlation_id, AckOutcome::Dropped)
    }

    fn settle(&self, correlation_id: &str, outcome: AckOutcome) -> bool {
        let (entry, empty) = {
            let mut entries = lock(&self.entries);
            let entry = entries.remove(correlation_id);
            (entry, entries.is_empty())
        };
        let Some(entry) = entry else {
            return false;
        };
        entry.cancel.cancel();
        let _ = entry.done.send(outcome);
        if empty {
            self.drained.notify_waiters();
        }
        true
    }

    /// Forget every outstanding message. Their receipts observe a closed channel.
    pub fn abandon_all(&self) -> usize {
        let entries: Vec<PendingAck> = lock(&self.entries).drain().map(|(_, e)| e).collect();
        for entry in &entries {
            entry.cancel.cancel();
        }
        self.drained.notify_waiters();
        entries.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Resolve once nothing is outstanding.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if lock(&self.entries).is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// Recently delivered correlation ids, bounded to the newest `capacity`.
pub(crate) struct SeenIds {
    inner: Mutex<SeenInner>,
    capacity: usize,
}

#[derive(Default)]
struct SeenInner {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(SeenInner::default()),
            capacity: capacity.max(1),
        }
    }

    /// Record `id`. Returns false if it was already present.
    pub fn insert(&self, id: &str) -> bool {
        let mut inner = lock(&self.inner);
        if inner.ids.contains(id) {
            return false;
        }
        inner.ids.insert(id.to_string());
        inner.order.push_back(id.to_string());
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.ids.remove(&oldest);
            }
        }
        true
    }

    /// Undo an [`insert`](Self::insert) whose delivery failed.
    pub fn forget(&self, id: &str) {
        let mut inner = lock(&self.inner);
        if inner.ids.remove(id) {
            inner.order.retain(|seen| seen != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn resolve_settles_once() {
        let pending = PendingAcks::default();
        let (rx, cancel) = pending.insert("c1".into(), Frame::data(&b"x"[..]), None);

        assert!(pending.resend("c1").is_some());
        assert!(pending.resolve("c1"));
        assert!(!pending.resolve("c1"));
        assert!(!pending.give_up("c1"));
        assert!(cancel.is_cancelled());
        assert!(pending.resend("c1").is_none());
        assert_eq!(rx.await.unwrap(), AckOutcome::Acknowledged);
    }

    #[tokio::test]
    async fn give_up_reports_dropped() {
        let pending = PendingAcks::default();
        let (rx, _) = pending.insert("c1".into(), Frame::data(&b"x"[..]), None);
        assert!(pending.give_up("c1"));
        assert_eq!(rx.await.unwrap(), AckOutcome::Dropped);
    }

    #[tokio::test]
    async fn abandon_closes_receipts() {
        let pending = PendingAcks::default();
        let (rx, cancel) = pending.insert("c1".into(), Frame::data(&b"x"[..]), None);
        assert_eq!(pending.abandon_all(), 1);
        assert!(cancel.is_cancelled());
        assert!(rx.await.is_err());
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn wait_drained_wakes_on_last_settle() {
        let pending = std::sync::Arc::new(PendingAcks::default());
        let _a = pending.insert("a".into(), Frame::data(&b"x"[..]), None);
        let _b = pending.insert("b".into(), Frame::data(&b"y"[..]), None);

        let waiter = {
            let pending = pending.clone();
            tokio::spawn(async move { pending.wait_drained().await })
        };
        pending.resolve("a");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        pending.resolve("b");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn seen_ids_window_evicts_oldest() {
        let seen = SeenIds::new(2);
        assert!(seen.insert("a"));
        assert!(!seen.insert("a"));
        assert!(seen.insert("b"));
        assert!(seen.insert("c"));
        assert!(seen.insert("a"));
        assert!(!seen.insert("c"));
    }

    #[test]
    fn forget_allows_redelivery() {
        let seen = SeenIds::new(4);
        assert!(seen.insert("a"));
        seen.forget("a");
        assert!(seen.insert("a"));
    }
}
