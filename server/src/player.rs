//! Player session state and per-client queue plumbing.
//!
//! Each connected client is wrapped in a [`Player`]: a server-assigned UUID,
//! a lossy outbound queue, a channel for server-injected events, and a
//! liveness register. The queue receivers live in [`PlayerIo`] and are wired
//! to the socket by the transport (or driven directly by tests); the
//! `Arc<Player>` handle is what crosses task boundaries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::debug;
use shared::Object;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::queue::{sliding_channel, SlidingReceiver, SlidingSender};

/// Inbound frame queue depth. Overflow evicts the oldest frame, so client
/// input is lossy under backpressure rather than blocking the reader.
pub const INBOUND_CAPACITY: usize = 64;

/// Outbound queue depth. Overflow drops the newest message, so a slow
/// client cannot stall the session fan-out.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// A connected client as the rest of the server sees it.
pub struct Player {
    /// Server-assigned UUID, sent in the welcome message. Distinct from the
    /// session slot, which is assigned at admission.
    pub id: String,
    outbound: mpsc::Sender<Object>,
    local_inbound: mpsc::UnboundedSender<Object>,
    pub(crate) last_seen: AtomicU64,
}

/// The receiving ends of a player's queues, handed to whoever drives them:
/// the transport wires them to the socket, tests drive them directly.
pub struct PlayerIo {
    /// Producer half of the inbound queue (the network reader pushes here).
    pub inbound_tx: SlidingSender<Object>,
    /// Consumer half of the inbound queue (handshake, then session fan-in).
    pub inbound_rx: SlidingReceiver<Object>,
    /// Consumer half of the server-injected event channel.
    pub local_rx: mpsc::UnboundedReceiver<Object>,
    /// Consumer half of the outbound queue (the network writer drains it).
    pub outbound_rx: mpsc::Receiver<Object>,
}

impl Player {
    /// Creates a player with a fresh UUID and its four queues.
    pub fn create() -> (Arc<Player>, PlayerIo) {
        let (inbound_tx, inbound_rx) = sliding_channel(INBOUND_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let player = Arc::new(Player {
            id: Uuid::new_v4().to_string(),
            outbound: outbound_tx,
            local_inbound: local_tx,
            last_seen: AtomicU64::new(now_millis()),
        });
        (
            player,
            PlayerIo {
                inbound_tx,
                inbound_rx,
                local_rx,
                outbound_rx,
            },
        )
    }

    /// Queues a message for delivery to the client. Drops the message when
    /// the outbound queue is full or the connection is gone.
    pub fn send(&self, msg: Object) {
        match self.outbound.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("outbound queue full for player {}, dropping message", self.id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// A clone of the outbound sender, for topic subscriptions.
    pub fn outbound_sender(&self) -> mpsc::Sender<Object> {
        self.outbound.clone()
    }

    /// Injects a server-originated event into this player's inbound stream,
    /// where the session fan-in will pick it up like any client message.
    pub fn inject(&self, msg: Object) {
        let _ = self.local_inbound.send(msg);
    }

    /// Refreshes the liveness register. Called on every successful decode.
    pub fn touch(&self) {
        self.last_seen.store(now_millis(), Ordering::Relaxed);
    }

    /// Milliseconds since the last successfully decoded message.
    pub fn idle_millis(&self) -> u64 {
        now_millis().saturating_sub(self.last_seen.load(Ordering::Relaxed))
    }

    /// True if the player produced a message within the given window. Donor
    /// selection uses this to skip silent participants.
    pub fn is_active(&self, window_ms: u64) -> bool {
        self.idle_millis() <= window_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_assigns_distinct_uuids() {
        let (a, _) = Player::create();
        let (b, _) = Player::create();
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.len(), 36);
    }

    #[tokio::test]
    async fn test_send_drops_newest_when_full() {
        let (player, mut io) = Player::create();
        for i in 0..=OUTBOUND_CAPACITY {
            player.send(shared::lock_msg(i as u64));
        }
        // The queue holds the first OUTBOUND_CAPACITY messages; the last
        // send was dropped.
        let mut count = 0;
        while let Ok(msg) = io.outbound_rx.try_recv() {
            assert_eq!(msg, shared::lock_msg(count));
            count += 1;
        }
        assert_eq!(count as usize, OUTBOUND_CAPACITY);
    }

    #[tokio::test]
    async fn test_inject_reaches_local_inbound() {
        let (player, mut io) = Player::create();
        player.inject(shared::disconnected(3));
        assert_eq!(io.local_rx.recv().await, Some(shared::disconnected(3)));
    }

    #[test]
    fn test_activity_window() {
        let (player, _io) = Player::create();
        player.touch();
        assert!(player.is_active(2_000));
        player
            .last_seen
            .store(now_millis().saturating_sub(5_000), Ordering::Relaxed);
        assert!(!player.is_active(2_000));
        assert!(player.idle_millis() >= 5_000);
    }
}
