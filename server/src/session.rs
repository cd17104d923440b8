//! Game session pipeline: ordered fan-in, lock ticker, topic fan-out.
//!
//! A session owns one ingress channel that every member's inbound stream is
//! piped into (stamped with the member's slot), and one egress channel of
//! message batches that a single publisher task flattens into the topic hub.
//! Because one task does all the publishing, every subscriber observes the
//! same emission order.
//!
//! Stepped sessions (`step_time > 0`) run a ticker aligned to wall-clock
//! boundaries. Ticks travel through the egress queue like everything else,
//! and the publisher advances the step counter as it processes each one, so
//! the lock barrier, any pending join announcement, and the step stamps on
//! surrounding events are all ordered by a single task. Stepless sessions
//! relay unannotated and never emit locks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;
use shared::{
    admission, disconnected, is_alive, lock_msg, with_player_id, with_step, GameInfo, Object,
    Topic,
};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

use crate::player::{now_millis, Player};
use crate::queue::SlidingReceiver;
use crate::sync;
use crate::topic::TopicHub;

/// How recently a synced player must have spoken to qualify as a donor.
pub const DONOR_ACTIVE_WINDOW_MS: u64 = 2_000;

/// Pending join announcements awaiting the next tick.
const JOIN_MAILBOX_CAPACITY: usize = 16;

struct Membership {
    player: Arc<Player>,
    slot: u64,
}

/// Items on the egress queue. The publisher is the only consumer, so queue
/// order is emission order; ticks travel through the same queue as message
/// batches, which is what keeps the step counter, the lock barrier, and the
/// step stamps on surrounding events mutually ordered.
enum Egress {
    /// Messages from the fan-in (or a stepless join announcement).
    Batch(Vec<Object>),
    /// A ticker wakeup, carrying at most one pending join announcement.
    Tick(Option<Object>),
}

/// One lockstep game session.
pub struct GameSession {
    game_type: String,
    max_players: u32,
    step_time: u64,
    seed: i64,
    step: AtomicU64,
    next_slot: AtomicU64,
    players: Mutex<HashMap<String, Membership>>,
    synced: Mutex<Vec<Arc<Player>>>,
    hub: Arc<TopicHub>,
    in_tx: mpsc::UnboundedSender<Object>,
    join_tx: mpsc::Sender<Object>,
    done_tx: watch::Sender<bool>,
}

impl GameSession {
    /// Creates a session and spawns its pipeline tasks. The session starts
    /// empty; the dispatcher admits the first player right after.
    pub fn spawn(info: &GameInfo) -> Arc<Self> {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Egress>();
        let (join_tx, join_rx) = mpsc::channel(JOIN_MAILBOX_CAPACITY);
        let (done_tx, _) = watch::channel(false);
        let seed = rand::thread_rng().gen::<i64>();

        let session = Arc::new(Self {
            game_type: info.game_type.clone(),
            max_players: info.max_players,
            step_time: info.step_time,
            seed,
            step: AtomicU64::new(0),
            next_slot: AtomicU64::new(0),
            players: Mutex::new(HashMap::new()),
            synced: Mutex::new(Vec::new()),
            hub: Arc::new(TopicHub::new()),
            in_tx,
            join_tx,
            done_tx,
        });

        info!(
            "created {} session (capacity {}, step time {} ms, seed {})",
            session.game_type, session.max_players, session.step_time, session.seed
        );

        tokio::spawn(publisher(session.clone(), out_rx));
        tokio::spawn(pipeline(session.clone(), in_rx, out_tx.clone()));
        if info.step_time > 0 {
            tokio::spawn(ticker(session.clone(), out_tx, join_rx));
        } else {
            tokio::spawn(join_flusher(session.done_rx(), out_tx, join_rx));
        }

        session
    }

    /// Whether this session can take the arriving player: same game type,
    /// spare capacity against the *arrival's* limit, and a donor on hand
    /// (an empty session needs none).
    pub fn accepts(&self, info: &GameInfo) -> bool {
        self.game_type == info.game_type
            && (self.lock_players().len() as u32) < info.max_players
            && self.has_donor()
    }

    fn has_donor(&self) -> bool {
        self.lock_players().is_empty() || self.pick_syncer().is_some()
    }

    /// Admits a player: assigns the next slot, subscribes the outbound to
    /// the lock and event topics, sends the admission message, and starts
    /// the fan-in pipe. The first player of a session skips sync; everyone
    /// after goes through the sync mediator.
    pub fn admit(
        self: &Arc<Self>,
        player: Arc<Player>,
        inbound: SlidingReceiver<Object>,
        local: mpsc::UnboundedReceiver<Object>,
    ) {
        let slot = self.next_slot.fetch_add(1, Ordering::SeqCst);
        let new_game = {
            let mut players = self.lock_players();
            let new_game = players.is_empty();
            players.insert(
                player.id.clone(),
                Membership {
                    player: player.clone(),
                    slot,
                },
            );
            new_game
        };
        info!(
            "player {} joined {} session as slot {}",
            player.id, self.game_type, slot
        );

        // Admission goes out before the topic subscriptions so no lock can
        // slip ahead of it in the client's stream.
        player.send(admission(new_game, slot, self.seed));
        self.hub
            .subscribe(&[Topic::Lock, Topic::Other], player.outbound_sender());

        tokio::spawn(pipe(inbound, local, slot, self.in_tx.clone()));

        if new_game {
            self.hub.subscribe(&[Topic::Join], player.outbound_sender());
            self.mark_synced(player);
        } else {
            sync::spawn(self.clone(), player);
        }
    }

    /// Removes a player, broadcasting the departure notice to the remaining
    /// members through the normal pipeline. Returns false when the player
    /// was not a member (duplicate departures are no-ops).
    pub fn remove_player(&self, id: &str) -> bool {
        let membership = self.lock_players().remove(id);
        match membership {
            Some(m) => {
                self.hub.unsubscribe(&m.player.outbound_sender());
                self.lock_synced().retain(|p| p.id != id);
                m.player.inject(disconnected(m.slot));
                info!(
                    "player {} left {} session (slot {})",
                    id, self.game_type, m.slot
                );
                true
            }
            None => false,
        }
    }

    /// Picks a donor for a late join: a uniformly random synced player that
    /// has spoken within the activity window. `None` when nobody qualifies.
    pub fn pick_syncer(&self) -> Option<Arc<Player>> {
        let synced = self.lock_synced();
        let active: Vec<&Arc<Player>> = synced
            .iter()
            .filter(|p| p.is_active(DONOR_ACTIVE_WINDOW_MS))
            .collect();
        if active.is_empty() {
            return None;
        }
        let pick = rand::thread_rng().gen_range(0..active.len());
        Some(active[pick].clone())
    }

    /// Appends a player to the donor pool once its sync completed (or was
    /// skipped for the session's first member).
    pub fn mark_synced(&self, player: Arc<Player>) {
        let mut synced = self.lock_synced();
        if !synced.iter().any(|p| p.id == player.id) {
            synced.push(player);
        }
    }

    /// Mails a join announcement to the ticker (or the stepless flusher).
    pub fn push_join(&self, announce: Object) {
        match self.join_tx.try_send(announce) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("join mailbox full in {} session, dropping announce", self.game_type);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Signals termination: the ticker, pipeline, and publisher stop and
    /// all subscriptions drain.
    pub fn terminate(&self) {
        info!("terminating {} session", self.game_type);
        let _ = self.done_tx.send(true);
    }

    pub fn is_empty(&self) -> bool {
        self.lock_players().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock_players().contains_key(id)
    }

    /// The session slot of a current member.
    pub fn slot_of(&self, id: &str) -> Option<u64> {
        self.lock_players().get(id).map(|m| m.slot)
    }

    pub fn step_time(&self) -> u64 {
        self.step_time
    }

    pub fn seed(&self) -> i64 {
        self.seed
    }

    pub fn hub(&self) -> &TopicHub {
        &self.hub
    }

    pub fn done_rx(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    fn lock_players(&self) -> MutexGuard<'_, HashMap<String, Membership>> {
        match self.players.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_synced(&self) -> MutexGuard<'_, Vec<Arc<Player>>> {
        match self.synced.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Per-member fan-in: merges the inbound and local-inbound streams into the
/// session ingress, stamping the member's slot onto every message. Keeps
/// draining injected events after the transport closes so the departure
/// notice still makes it through.
async fn pipe(
    mut inbound: SlidingReceiver<Object>,
    mut local: mpsc::UnboundedReceiver<Object>,
    slot: u64,
    in_tx: mpsc::UnboundedSender<Object>,
) {
    loop {
        tokio::select! {
            m = inbound.recv() => match m {
                Some(m) => {
                    let _ = in_tx.send(with_player_id(m, slot));
                }
                None => break,
            },
            m = local.recv() => match m {
                Some(m) => {
                    let _ = in_tx.send(with_player_id(m, slot));
                }
                None => return,
            },
        }
    }
    while let Some(m) = local.recv().await {
        let _ = in_tx.send(with_player_id(m, slot));
    }
}

/// Main event pipeline: drops heartbeats and forwards everything else to
/// egress as singleton batches. Sync replies travel through here too; the
/// publisher's topic classification is what keeps them off player queues.
async fn pipeline(
    session: Arc<GameSession>,
    mut in_rx: mpsc::UnboundedReceiver<Object>,
    out_tx: mpsc::UnboundedSender<Egress>,
) {
    let mut done = session.done_rx();
    loop {
        tokio::select! {
            _ = done.changed() => break,
            msg = in_rx.recv() => match msg {
                None => break,
                Some(m) => {
                    if is_alive(&m) {
                        continue;
                    }
                    if out_tx.send(Egress::Batch(vec![m])).is_err() {
                        break;
                    }
                }
            },
        }
    }
    debug!("pipeline stopped for {} session", session.game_type);
}

/// Flattens the egress queue into the topic hub and owns the step counter.
/// Being the only publisher gives all subscribers an identical view of the
/// emission order; advancing the counter here, in queue order, keeps the
/// lock for step k ahead of every event stamped k+1 even though the ticker
/// and the pipeline run on different tasks.
async fn publisher(session: Arc<GameSession>, mut out_rx: mpsc::UnboundedReceiver<Egress>) {
    let stepped = session.step_time > 0;
    while let Some(item) = out_rx.recv().await {
        match item {
            Egress::Batch(batch) => {
                for msg in batch {
                    let msg = if stepped && Topic::of(&msg) == Topic::Other {
                        with_step(msg, session.step.load(Ordering::SeqCst))
                    } else {
                        msg
                    };
                    session.hub.publish(msg);
                }
            }
            Egress::Tick(announce) => {
                let closing = session.step.fetch_add(1, Ordering::SeqCst);
                session.hub.publish(lock_msg(closing));
                if let Some(a) = announce {
                    session.hub.publish(with_step(a, closing));
                }
            }
        }
    }
}

/// Lock ticker for stepped sessions. Wakeups align to wall-clock multiples
/// of the step time; each wakeup mails a tick (with at most one pending
/// join announcement) to the publisher, which advances the step counter and
/// emits the barrier.
async fn ticker(
    session: Arc<GameSession>,
    out_tx: mpsc::UnboundedSender<Egress>,
    mut join_rx: mpsc::Receiver<Object>,
) {
    let mut done = session.done_rx();
    let step_time = session.step_time;
    loop {
        let wait = step_time - (now_millis() % step_time);
        tokio::select! {
            _ = done.changed() => break,
            _ = sleep(Duration::from_millis(wait)) => {
                if out_tx.send(Egress::Tick(join_rx.try_recv().ok())).is_err() {
                    break;
                }
            }
        }
    }
    debug!("ticker stopped for {} session", session.game_type);
}

/// Stepless counterpart of the ticker's join handling: announcements flush
/// straight to egress as singleton batches, without step metadata.
async fn join_flusher(
    mut done: watch::Receiver<bool>,
    out_tx: mpsc::UnboundedSender<Egress>,
    mut join_rx: mpsc::Receiver<Object>,
) {
    loop {
        tokio::select! {
            _ = done.changed() => break,
            announce = join_rx.recv() => match announce {
                Some(a) => {
                    if out_tx.send(Egress::Batch(vec![a])).is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SlidingSender;
    use serde_json::json;
    use shared::{LOCK, PLAYER_ID, STEP};
    use tokio::time::timeout;

    fn stepless_info() -> GameInfo {
        GameInfo {
            game_type: "test".into(),
            max_players: 4,
            step_time: 0,
        }
    }

    fn stepped_info(step_time: u64) -> GameInfo {
        GameInfo {
            game_type: "test".into(),
            max_players: 4,
            step_time,
        }
    }

    fn event(key: &str, value: i64) -> Object {
        match json!({ key: value }) {
            serde_json::Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    /// A member's wire ends as a test drives them: push frames in, drain
    /// the outbound queue.
    struct TestIo {
        inbound_tx: SlidingSender<Object>,
        outbound_rx: mpsc::Receiver<Object>,
    }

    async fn recv(io: &mut TestIo) -> Object {
        timeout(Duration::from_secs(2), io.outbound_rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("outbound closed")
    }

    fn admit(session: &Arc<GameSession>) -> (Arc<Player>, TestIo) {
        let (player, io) = Player::create();
        session.admit(player.clone(), io.inbound_rx, io.local_rx);
        (
            player,
            TestIo {
                inbound_tx: io.inbound_tx,
                outbound_rx: io.outbound_rx,
            },
        )
    }

    #[tokio::test]
    async fn test_first_admission_is_new_game() {
        let session = GameSession::spawn(&stepless_info());
        let (_player, mut io) = admit(&session);
        let msg = recv(&mut io).await;
        assert_eq!(msg.get("join"), Some(&json!(true)));
        assert_eq!(msg.get("newGame"), Some(&json!(true)));
        assert_eq!(msg.get(PLAYER_ID), Some(&json!(0)));
        assert_eq!(msg.get("seed"), Some(&json!(session.seed())));
        session.terminate();
    }

    #[tokio::test]
    async fn test_stepless_relay_stamps_player_and_omits_step() {
        let session = GameSession::spawn(&stepless_info());
        let (_a, mut a_io) = admit(&session);
        let (_b, mut b_io) = admit(&session);
        let _ = recv(&mut a_io).await; // admission
        let _ = recv(&mut b_io).await; // admission

        a_io.inbound_tx.push(event("chat", 1));

        // A's join announce for B may interleave; skip to the chat event.
        for io in [&mut a_io, &mut b_io] {
            let msg = loop {
                let m = recv(io).await;
                if m.contains_key("chat") {
                    break m;
                }
            };
            assert_eq!(msg.get(PLAYER_ID), Some(&json!(0)));
            assert!(!msg.contains_key(STEP));
            assert!(!msg.contains_key(LOCK));
        }
        session.terminate();
    }

    #[tokio::test]
    async fn test_stepped_emits_incrementing_locks() {
        let session = GameSession::spawn(&stepped_info(50));
        let (_player, mut io) = admit(&session);
        let _ = recv(&mut io).await; // admission
        let first = recv(&mut io).await;
        let second = recv(&mut io).await;
        assert_eq!(first.get(LOCK), Some(&json!(0)));
        assert_eq!(second.get(LOCK), Some(&json!(1)));
        session.terminate();
    }

    #[tokio::test]
    async fn test_stepped_annotates_events_with_step() {
        let session = GameSession::spawn(&stepped_info(50));
        let (_player, mut io) = admit(&session);
        let _ = recv(&mut io).await; // admission
        io.inbound_tx.push(event("move", 3));
        let msg = loop {
            let m = recv(&mut io).await;
            if m.contains_key("move") {
                break m;
            }
        };
        assert_eq!(msg.get(PLAYER_ID), Some(&json!(0)));
        assert!(msg.get(STEP).and_then(serde_json::Value::as_u64).is_some());
        session.terminate();
    }

    #[tokio::test]
    async fn test_alive_heartbeat_never_broadcast() {
        let session = GameSession::spawn(&stepless_info());
        let (_player, mut io) = admit(&session);
        let _ = recv(&mut io).await; // admission
        let mut alive = Object::new();
        alive.insert("msg".into(), json!("alive"));
        io.inbound_tx.push(alive);
        io.inbound_tx.push(event("chat", 1));
        let msg = recv(&mut io).await;
        assert!(msg.contains_key("chat"), "heartbeat leaked: {msg:?}");
        session.terminate();
    }

    #[tokio::test]
    async fn test_sync_routed_to_tap_not_players() {
        let session = GameSession::spawn(&stepless_info());
        let (_player, mut io) = admit(&session);
        let _ = recv(&mut io).await; // admission
        let (_token, mut tap) = session.hub().watch(Topic::Sync);

        let mut sync_reply = Object::new();
        sync_reply.insert("msg".into(), json!("sync"));
        sync_reply.insert("snapshot".into(), json!("state"));
        io.inbound_tx.push(sync_reply);
        io.inbound_tx.push(event("chat", 1));

        tap.changed().await.unwrap();
        let tapped = tap.borrow_and_update().clone().unwrap();
        assert_eq!(tapped.get("snapshot"), Some(&json!("state")));

        // The player sees the chat event but never the sync reply.
        let msg = recv(&mut io).await;
        assert!(msg.contains_key("chat"), "sync leaked to player: {msg:?}");
        session.terminate();
    }

    #[tokio::test]
    async fn test_remove_broadcasts_disconnect_notice() {
        let session = GameSession::spawn(&stepless_info());
        let (a, mut a_io) = admit(&session);
        let (_b, mut b_io) = admit(&session);
        let _ = recv(&mut a_io).await;
        let _ = recv(&mut b_io).await;

        assert!(session.remove_player(&a.id));
        let msg = loop {
            let m = recv(&mut b_io).await;
            if m.contains_key("disconnected") {
                break m;
            }
        };
        assert_eq!(msg.get("disconnected"), Some(&json!(0)));
        assert_eq!(msg.get(PLAYER_ID), Some(&json!(0)));
        session.terminate();
    }

    #[tokio::test]
    async fn test_duplicate_remove_is_noop() {
        let session = GameSession::spawn(&stepless_info());
        let (a, _a_io) = admit(&session);
        assert!(session.remove_player(&a.id));
        assert!(!session.remove_player(&a.id));
        assert!(session.is_empty());
        session.terminate();
    }

    #[tokio::test]
    async fn test_slots_never_reused() {
        let session = GameSession::spawn(&stepless_info());
        let (a, mut a_io) = admit(&session);
        assert_eq!(recv(&mut a_io).await.get(PLAYER_ID), Some(&json!(0)));
        session.remove_player(&a.id);
        let (_b, mut b_io) = admit(&session);
        assert_eq!(recv(&mut b_io).await.get(PLAYER_ID), Some(&json!(1)));
        session.terminate();
    }

    #[tokio::test]
    async fn test_terminate_stops_ticker() {
        let session = GameSession::spawn(&stepped_info(50));
        let (_player, mut io) = admit(&session);
        let _ = recv(&mut io).await; // admission
        let _ = recv(&mut io).await; // first lock
        session.terminate();
        tokio::time::sleep(Duration::from_millis(150)).await;
        while let Ok(msg) = io.outbound_rx.try_recv() {
            // Locks emitted before termination landed may drain here; the
            // counter proves no tick fired after the drain window.
            assert!(msg.contains_key(LOCK));
        }
        let settled = session.step.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(session.step.load(Ordering::SeqCst), settled);
    }

    #[tokio::test]
    async fn test_accepts_checks_type_and_capacity() {
        let session = GameSession::spawn(&stepless_info());
        let (_a, _a_io) = admit(&session);

        assert!(session.accepts(&stepless_info()));
        let other_type = GameInfo {
            game_type: "other".into(),
            max_players: 4,
            step_time: 0,
        };
        assert!(!session.accepts(&other_type));
        let tiny = GameInfo {
            game_type: "test".into(),
            max_players: 1,
            step_time: 0,
        };
        assert!(!session.accepts(&tiny));
        session.terminate();
    }

    #[tokio::test]
    async fn test_accepts_requires_active_donor() {
        let session = GameSession::spawn(&stepless_info());
        let (a, _a_io) = admit(&session);
        assert!(session.accepts(&stepless_info()));

        // Age the only donor past the activity window.
        let stale = now_millis().saturating_sub(DONOR_ACTIVE_WINDOW_MS + 1_000);
        a.last_seen.store(stale, Ordering::Relaxed);
        assert!(session.pick_syncer().is_none());
        assert!(!session.accepts(&stepless_info()));
        session.terminate();
    }
}
