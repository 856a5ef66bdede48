//! Per-document fan-out of encoded frames.
//!
//! One tokio broadcast channel per live document. Every attached connection
//! holds a receiver and skips envelopes it originated itself, so a sender
//! never sees its own delta echoed back.
//!
//! A receiver that falls more than `capacity` frames behind observes
//! `RecvError::Lagged`; the connection loop recovers by re-running Step 1
//! for every sub-document instead of disconnecting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::connection::ConnectionId;
use crate::protocol::{Frame, ProtocolError};

/// An encoded frame tagged with the connection that produced it.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// `None` for frames produced by the server itself (hydration, eviction)
    pub origin: Option<ConnectionId>,
    pub bytes: Arc<Vec<u8>>,
}

impl Envelope {
    /// Whether `connection` should receive this envelope.
    pub fn is_for(&self, connection: ConnectionId) -> bool {
        self.origin != Some(connection)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub receivers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Broadcast channel for a single document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is the number of frames buffered per receiver before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    /// Encode and fan out a frame to every receiver except `origin`'s.
    ///
    /// Returns the number of live receivers (including the origin's, which
    /// filters the envelope out itself).
    pub fn broadcast(
        &self,
        origin: Option<ConnectionId>,
        frame: &Frame,
    ) -> Result<usize, ProtocolError> {
        let encoded = frame.encode()?;
        Ok(self.broadcast_raw(origin, Arc::new(encoded)))
    }

    /// Fan out pre-encoded bytes.
    pub fn broadcast_raw(&self, origin: Option<ConnectionId>, bytes: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(Envelope { origin, bytes }).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging receiver skipped.
    pub fn record_dropped(&self, skipped: u64) {
        self.stats.messages_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SyncMessage;
    use tokio::sync::broadcast::error::RecvError;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_fan_out_reaches_every_receiver() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.subscribe();
        let mut rx2 = group.subscribe();
        let mut rx3 = group.subscribe();

        let frame = Frame::Sync(SyncMessage::update("main.tex", vec![1, 2, 3]));
        let count = group.broadcast(None, &frame).unwrap();
        assert_eq!(count, 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let env = rx.recv().await.unwrap();
            assert_eq!(Frame::decode(&env.bytes).unwrap(), frame);
        }
    }

    #[tokio::test]
    async fn test_origin_filtered() {
        let group = BroadcastGroup::new(16);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut rx = group.subscribe();

        group.broadcast_raw(Some(alice), Arc::new(vec![9]));
        let env = rx.recv().await.unwrap();
        assert!(!env.is_for(alice));
        assert!(env.is_for(bob));
    }

    #[tokio::test]
    async fn test_server_origin_goes_to_everyone() {
        let env = Envelope { origin: None, bytes: Arc::new(vec![]) };
        assert!(env.is_for(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.subscribe();
        for i in 0..5u8 {
            group.broadcast_raw(None, Arc::new(vec![i]));
        }
        match rx.recv().await {
            Err(RecvError::Lagged(n)) => {
                group.record_dropped(n);
                assert_eq!(n, 3);
            }
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(group.stats().messages_dropped, 3);
    }

    #[tokio::test]
    async fn test_stats() {
        let group = BroadcastGroup::new(16);
        let _rx = group.subscribe();
        group.broadcast_raw(None, Arc::new(vec![1]));
        group.broadcast_raw(None, Arc::new(vec![2]));

        let stats = group.stats();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.receivers, 1);
        assert_eq!(group.capacity(), 16);
    }

    #[tokio::test]
    async fn test_no_receivers_is_not_error() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.broadcast_raw(None, Arc::new(vec![1])), 0);
        assert_eq!(group.receiver_count(), 0);
    }
}
