//! Late-join synchronization.
//!
//! When a player is admitted to a non-empty session it has no game state, so
//! a mediator task runs the transfer choreography: announce the join with a
//! designated donor, wait for that donor's `sync` reply on the one-slot sync
//! tap, and forward the reply to the newcomer alone. The server never looks
//! inside the transferred state.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use shared::{join_announce, Topic, PLAYER_ID};
use tokio::time::sleep;

use crate::player::Player;
use crate::session::GameSession;

/// How long to wait for a donor's reply before announcing the join again
/// (with a freshly picked donor, in case the previous one went quiet).
const RETRY_INTERVAL: Duration = Duration::from_millis(2_000);

/// Starts the mediator for a freshly admitted newcomer.
pub fn spawn(session: Arc<GameSession>, player: Arc<Player>) {
    tokio::spawn(mediate(session, player));
}

async fn mediate(session: Arc<GameSession>, player: Arc<Player>) {
    let mut done = session.done_rx();
    let (tap_token, mut tap) = session.hub().watch(Topic::Sync);

    // Let one lock pass first, so the newcomer holds every message up to
    // step k before the sync for step k+1 lands.
    if session.step_time() > 0 {
        let (lock_token, mut lock_tap) = session.hub().watch(Topic::Lock);
        let lock_passed = tokio::select! {
            _ = done.changed() => false,
            r = lock_tap.changed() => r.is_ok(),
        };
        session.hub().unwatch(lock_token);
        if !lock_passed {
            session.hub().unwatch(tap_token);
            return;
        }
    }

    // Subscribe the newcomer to join announcements before its own announce
    // is mailed, so the tick that broadcasts it reaches the newcomer too.
    session
        .hub()
        .subscribe(&[Topic::Join], player.outbound_sender());

    let reply = 'retry: loop {
        if !session.contains(&player.id) {
            break None;
        }
        // Remember which donor was asked, by slot: replies arrive stamped
        // with the sender's slot, and a session can have several syncs in
        // flight at once, so only the named donor's reply counts.
        let requested = match session.pick_syncer() {
            Some(donor) => {
                debug!("requesting sync for {} from donor {}", player.id, donor.id);
                session.push_join(join_announce(&donor.id));
                session.slot_of(&donor.id)
            }
            None => {
                debug!("no active donor for {} right now, will retry", player.id);
                None
            }
        };
        let window = sleep(RETRY_INTERVAL);
        tokio::pin!(window);
        loop {
            tokio::select! {
                _ = done.changed() => break 'retry None,
                _ = &mut window => break,
                r = tap.changed() => match r {
                    Ok(()) => {
                        let candidate = tap.borrow_and_update().clone();
                        if let (Some(slot), Some(msg)) = (requested, candidate) {
                            if msg.get(PLAYER_ID).and_then(|v| v.as_u64()) == Some(slot) {
                                break 'retry Some(msg);
                            }
                            debug!("ignoring sync from a donor {} did not request", player.id);
                        }
                    }
                    Err(_) => break 'retry None,
                },
            }
        }
    };

    session.hub().unwatch(tap_token);

    match reply {
        Some(msg) if session.contains(&player.id) => {
            player.send(msg);
            session.mark_synced(player.clone());
            info!("sync complete for player {}", player.id);
        }
        Some(_) => debug!("player {} left before its sync arrived", player.id),
        None => debug!("sync abandoned for player {}", player.id),
    }
}
