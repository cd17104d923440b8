//! Player lifecycle dispatch and the global session list.
//!
//! One task consumes the lifecycle stream merged from every transport, so
//! the session list is mutated from a single place and needs no lock.
//! Arrivals are matched against existing sessions in creation order;
//! departures fall through to whichever session holds the player.

use std::sync::Arc;

use log::{debug, info};
use shared::{GameInfo, Object};
use tokio::sync::mpsc;

use crate::player::Player;
use crate::queue::SlidingReceiver;
use crate::session::GameSession;

/// Player lifecycle events merged from all transports.
pub enum Lifecycle {
    /// A handshaken player looking for a session. Carries the consuming
    /// ends of the player's inbound streams for the session fan-in.
    Arrival {
        player: Arc<Player>,
        info: GameInfo,
        inbound: SlidingReceiver<Object>,
        local: mpsc::UnboundedReceiver<Object>,
    },
    /// A closed connection. Duplicates are harmless.
    Departure { player_id: String },
}

/// Runs the dispatcher until every transport has hung up.
pub async fn run(mut events: mpsc::UnboundedReceiver<Lifecycle>) {
    let mut sessions: Vec<Arc<GameSession>> = Vec::new();

    while let Some(event) = events.recv().await {
        match event {
            Lifecycle::Arrival {
                player,
                info,
                inbound,
                local,
            } => {
                // First matching session wins: same game type, room left,
                // and a donor available for the late-join sync. No match
                // means a fresh session, even when only the donor check
                // failed.
                let session = match sessions.iter().find(|s| s.accepts(&info)).cloned() {
                    Some(existing) => existing,
                    None => {
                        let created = GameSession::spawn(&info);
                        sessions.push(created.clone());
                        created
                    }
                };
                session.admit(player, inbound, local);
            }
            Lifecycle::Departure { player_id } => {
                for session in &sessions {
                    if session.remove_player(&player_id) {
                        break;
                    }
                }
                sessions.retain(|session| {
                    if session.is_empty() {
                        session.terminate();
                        false
                    } else {
                        true
                    }
                });
            }
        }
    }

    info!("lifecycle stream closed, dispatcher stopping");
    for session in &sessions {
        session.terminate();
    }
    debug!("dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::PLAYER_ID;
    use std::time::Duration;
    use tokio::time::timeout;

    struct TestClient {
        player_id: String,
        outbound_rx: mpsc::Receiver<Object>,
    }

    async fn recv(client: &mut TestClient) -> Object {
        timeout(Duration::from_secs(2), client.outbound_rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("outbound closed")
    }

    fn join(events: &mpsc::UnboundedSender<Lifecycle>, info: GameInfo) -> TestClient {
        let (player, io) = Player::create();
        let player_id = player.id.clone();
        events
            .send(Lifecycle::Arrival {
                player,
                info,
                inbound: io.inbound_rx,
                local: io.local_rx,
            })
            .unwrap();
        TestClient {
            player_id,
            outbound_rx: io.outbound_rx,
        }
    }

    fn info(game_type: &str, max_players: u32) -> GameInfo {
        GameInfo {
            game_type: game_type.into(),
            max_players,
            step_time: 0,
        }
    }

    #[tokio::test]
    async fn test_matching_arrivals_share_a_session() {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));

        let mut a = join(&tx, info("chess", 4));
        let a_admission = recv(&mut a).await;
        assert_eq!(a_admission.get("newGame"), Some(&json!(true)));

        let mut b = join(&tx, info("chess", 4));
        let b_admission = recv(&mut b).await;
        assert_eq!(b_admission.get("newGame"), Some(&json!(false)));
        assert_eq!(b_admission.get(PLAYER_ID), Some(&json!(1)));
        // Same session, same seed.
        assert_eq!(a_admission.get("seed"), b_admission.get("seed"));
    }

    #[tokio::test]
    async fn test_game_types_partition_sessions() {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));

        let mut a = join(&tx, info("chess", 4));
        let _ = recv(&mut a).await;
        let mut b = join(&tx, info("go", 4));
        let b_admission = recv(&mut b).await;
        // A different game type never matches: B founded its own session.
        assert_eq!(b_admission.get("newGame"), Some(&json!(true)));
        assert_eq!(b_admission.get(PLAYER_ID), Some(&json!(0)));
    }

    #[tokio::test]
    async fn test_capacity_spills_into_new_session() {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));

        let mut a = join(&tx, info("x", 2));
        let _ = recv(&mut a).await;
        let mut b = join(&tx, info("x", 2));
        let b_admission = recv(&mut b).await;
        assert_eq!(b_admission.get("newGame"), Some(&json!(false)));

        let mut c = join(&tx, info("x", 2));
        let c_admission = recv(&mut c).await;
        assert_eq!(c_admission.get("newGame"), Some(&json!(true)));
        assert_eq!(c_admission.get(PLAYER_ID), Some(&json!(0)));
    }

    #[tokio::test]
    async fn test_capacity_one_admits_exactly_one() {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));

        let mut a = join(&tx, info("solo", 1));
        let _ = recv(&mut a).await;
        let mut b = join(&tx, info("solo", 1));
        let b_admission = recv(&mut b).await;
        assert_eq!(b_admission.get("newGame"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_departure_notifies_peers_and_is_idempotent() {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));

        let mut a = join(&tx, info("chess", 4));
        let _ = recv(&mut a).await;
        let mut b = join(&tx, info("chess", 4));
        let _ = recv(&mut b).await;

        tx.send(Lifecycle::Departure {
            player_id: b.player_id.clone(),
        })
        .unwrap();
        // A second departure for the same player must change nothing.
        tx.send(Lifecycle::Departure {
            player_id: b.player_id.clone(),
        })
        .unwrap();

        let notice = loop {
            let m = recv(&mut a).await;
            if m.contains_key("disconnected") {
                break m;
            }
        };
        assert_eq!(notice.get("disconnected"), Some(&json!(1)));

        // The dispatcher still works afterwards.
        let mut c = join(&tx, info("chess", 4));
        let c_admission = recv(&mut c).await;
        assert_eq!(c_admission.get("newGame"), Some(&json!(false)));
    }

    #[tokio::test]
    async fn test_last_departure_terminates_session() {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));

        let mut a = join(&tx, info("chess", 4));
        let _ = recv(&mut a).await;
        tx.send(Lifecycle::Departure {
            player_id: a.player_id.clone(),
        })
        .unwrap();

        // The next arrival of the same type founds a brand-new session with
        // slot numbering starting over.
        let mut b = join(&tx, info("chess", 4));
        let b_admission = recv(&mut b).await;
        assert_eq!(b_admission.get("newGame"), Some(&json!(true)));
        assert_eq!(b_admission.get(PLAYER_ID), Some(&json!(0)));
    }
}
