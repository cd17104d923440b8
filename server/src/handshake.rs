//! Connection handshake: greet the client, wait for its game selection.

use std::sync::Arc;

use log::debug;
use shared::{welcome, GameInfo, Object};

use crate::player::Player;
use crate::queue::SlidingReceiver;

/// Sends the welcome message and reads from the inbound queue until the
/// client names a game. Messages without the full game-selection triple are
/// dropped silently — the player is not in any session yet, so there is
/// nowhere to forward them. Returns `None` when the connection closes first.
pub async fn run(player: &Arc<Player>, inbound: &mut SlidingReceiver<Object>) -> Option<GameInfo> {
    player.send(welcome(&player.id));
    while let Some(obj) = inbound.recv().await {
        if let Some(info) = GameInfo::from_object(&obj) {
            debug!(
                "player {} selected {} (capacity {}, step time {} ms)",
                player.id, info.game_type, info.max_players, info.step_time
            );
            return Some(info);
        }
        debug!("dropping pre-handshake message from player {}", player.id);
    }
    None
}
