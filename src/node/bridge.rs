//! Command bridge: the inbox other tasks and processes use to hand work to
//! the event loop.
//!
//! Producers call [`BridgeHandle::submit`], which never waits. A single
//! poller drains the inbox and forwards each item to the event loop, keeping
//! at least `spacing` between consecutive items across all producers.

use super::NodeEvent;
use crate::protocol::BridgeItem;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_CAPACITY: usize = 256;
pub const DEFAULT_SPACING: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge inbox full, dropped {0} item")]
    Overflow(&'static str),

    #[error("bridge is closed")]
    Closed,
}

/// Producer side. Cheap to clone.
#[derive(Clone, Debug)]
pub struct BridgeHandle {
    tx: mpsc::Sender<BridgeItem>,
}

impl BridgeHandle {
    /// Queue an item. A full inbox drops it and returns `Overflow`.
    pub fn submit(&self, item: BridgeItem) -> Result<(), BridgeError> {
        let kind = item.kind();
        self.tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                warn!(kind, "Bridge inbox full, dropping item");
                BridgeError::Overflow(kind)
            }
            mpsc::error::TrySendError::Closed(_) => BridgeError::Closed,
        })
    }
}

/// Consumer side, drained by [`BridgeInbox::run`].
pub struct BridgeInbox {
    rx: mpsc::Receiver<BridgeItem>,
    spacing: Duration,
}

/// Create a bridge with room for `capacity` pending items.
#[must_use]
pub fn channel(capacity: usize, spacing: Duration) -> (BridgeHandle, BridgeInbox) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (BridgeHandle { tx }, BridgeInbox { rx, spacing })
}

impl BridgeInbox {
    /// Forward items to the event loop until every producer is gone or the
    /// loop stops listening.
    pub(crate) async fn run(mut self, events: mpsc::Sender<NodeEvent>) {
        let mut last: Option<Instant> = None;
        while let Some(item) = self.rx.recv().await {
            if let Some(at) = last {
                tokio::time::sleep_until(at + self.spacing).await;
            }
            last = Some(Instant::now());
            debug!(kind = item.kind(), "Dispatching bridge item");
            if events.send(NodeEvent::Bridge(item)).await.is_err() {
                break;
            }
        }
        debug!("Bridge poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(handle: &str) -> BridgeItem {
        BridgeItem::Link {
            handle: handle.to_string(),
        }
    }

    #[tokio::test]
    async fn test_full_inbox_drops_without_blocking() {
        let (handle, _inbox) = channel(2, DEFAULT_SPACING);

        handle.submit(link("a")).expect("first");
        handle.submit(link("b")).expect("second");
        let err = handle.submit(link("c")).expect_err("third should overflow");
        assert!(matches!(err, BridgeError::Overflow("link")));
    }

    #[tokio::test]
    async fn test_submit_after_inbox_dropped() {
        let (handle, inbox) = channel(2, DEFAULT_SPACING);
        drop(inbox);
        assert!(matches!(handle.submit(link("a")), Err(BridgeError::Closed)));
    }

    #[tokio::test]
    async fn test_poller_spaces_items_globally() {
        let spacing = Duration::from_millis(50);
        let (handle, inbox) = channel(8, spacing);
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(inbox.run(tx));

        let other = handle.clone();
        handle.submit(link("a")).expect("submit");
        other.submit(link("b")).expect("submit");
        handle
            .submit(BridgeItem::Chat {
                user: "alice".into(),
                text: "hi".into(),
                channel: 0,
            })
            .expect("submit");

        let mut arrivals = Vec::new();
        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out")
                .expect("channel open");
            assert!(matches!(event, NodeEvent::Bridge(_)));
            arrivals.push(Instant::now());
        }

        for pair in arrivals.windows(2) {
            // Allow for timer granularity
            assert!(pair[1] - pair[0] >= spacing - Duration::from_millis(5));
        }
    }

    #[tokio::test]
    async fn test_items_keep_submission_order() {
        let (handle, inbox) = channel(8, Duration::from_millis(1));
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(inbox.run(tx));

        for h in ["a", "b", "c"] {
            handle.submit(link(h)).expect("submit");
        }
        for expected in ["a", "b", "c"] {
            match rx.recv().await {
                Some(NodeEvent::Bridge(BridgeItem::Link { handle })) => assert_eq!(handle, expected),
                _ => panic!("unexpected event"),
            }
        }
    }
}
