//! Connection handling for both transports.
//!
//! Each accepted socket gets a reader task, a writer task, and a watchdog,
//! all tied together by a shutdown flag: whichever of them hits an error (or
//! the idle limit) flips the flag and the rest wind down. The connection
//! task itself runs the handshake and then parks until the reader exits, at
//! which point it dispatches the departure.
//!
//! TCP frames are LF-delimited UTF-8 JSON lines. WebSocket connections must
//! negotiate the `binary` subprotocol (anything else is rejected with HTTP
//! 400); each text or binary frame is one message.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use shared::Object;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

use crate::dispatcher::Lifecycle;
use crate::handshake;
use crate::player::Player;
use crate::queue::{SlidingReceiver, SlidingSender};

/// How often the watchdog samples the liveness register.
const WATCHDOG_PERIOD: Duration = Duration::from_secs(1);

/// The subprotocol a WebSocket upgrade must offer.
const WS_SUBPROTOCOL: &str = "binary";

/// Drives one newline-framed TCP connection to completion.
pub async fn handle_tcp_client(
    stream: TcpStream,
    addr: SocketAddr,
    events: mpsc::UnboundedSender<Lifecycle>,
    idle_timeout: Duration,
) {
    let (read_half, write_half) = stream.into_split();
    let (player, io) = Player::create();
    info!("TCP connection from {} is player {}", addr, player.id);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    tokio::spawn(tcp_writer(
        write_half,
        io.outbound_rx,
        shutdown_tx.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(watchdog(
        player.clone(),
        idle_timeout,
        shutdown_tx.clone(),
        shutdown_rx.clone(),
    ));
    let reader = tokio::spawn(tcp_reader(
        read_half,
        io.inbound_tx,
        player.clone(),
        shutdown_rx,
    ));

    finish_connection(player, io.inbound_rx, io.local_rx, events, reader, shutdown_tx).await;
}

/// Drives one WebSocket connection to completion, upgrade included.
pub async fn handle_ws_client(
    stream: TcpStream,
    addr: SocketAddr,
    events: mpsc::UnboundedSender<Lifecycle>,
    idle_timeout: Duration,
) {
    let ws_stream = match accept_hdr_async(stream, negotiate_subprotocol).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };
    let (ws_sink, ws_source) = ws_stream.split();
    let (player, io) = Player::create();
    info!("WebSocket connection from {} is player {}", addr, player.id);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    tokio::spawn(ws_writer(
        ws_sink,
        io.outbound_rx,
        shutdown_tx.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(watchdog(
        player.clone(),
        idle_timeout,
        shutdown_tx.clone(),
        shutdown_rx.clone(),
    ));
    let reader = tokio::spawn(ws_reader(
        ws_source,
        io.inbound_tx,
        player.clone(),
        shutdown_rx,
    ));

    finish_connection(player, io.inbound_rx, io.local_rx, events, reader, shutdown_tx).await;
}

/// Upgrade callback: accept only clients offering the `binary` subprotocol
/// and echo the selection back; everything else gets a 400.
fn negotiate_subprotocol(req: &Request, mut resp: Response) -> Result<Response, ErrorResponse> {
    let offered = req
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    match offered {
        Some(protocols) if protocols.split(',').any(|p| p.trim() == WS_SUBPROTOCOL) => {
            resp.headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(WS_SUBPROTOCOL));
            Ok(resp)
        }
        _ => {
            let mut reject = ErrorResponse::new(None);
            *reject.status_mut() = StatusCode::BAD_REQUEST;
            Err(reject)
        }
    }
}

/// Shared tail of both handlers: handshake, arrival, wait for the reader,
/// departure. A player whose connection closes before the handshake
/// completes is discarded without ever reaching the dispatcher.
async fn finish_connection(
    player: Arc<Player>,
    mut inbound_rx: SlidingReceiver<Object>,
    local_rx: mpsc::UnboundedReceiver<Object>,
    events: mpsc::UnboundedSender<Lifecycle>,
    reader: JoinHandle<()>,
    shutdown_tx: Arc<watch::Sender<bool>>,
) {
    match handshake::run(&player, &mut inbound_rx).await {
        Some(info) => {
            let player_id = player.id.clone();
            let _ = events.send(Lifecycle::Arrival {
                player,
                info,
                inbound: inbound_rx,
                local: local_rx,
            });
            let _ = reader.await;
            info!("player {} disconnected", player_id);
            let _ = events.send(Lifecycle::Departure { player_id });
        }
        None => {
            debug!("player {} disconnected before completing handshake", player.id);
            let _ = reader.await;
        }
    }
    let _ = shutdown_tx.send(true);
}

/// Decodes one raw frame and feeds the inbound queue. Malformed frames are
/// dropped with a warning; the connection stays up.
fn ingest_frame(frame: &str, player: &Player, inbound_tx: &SlidingSender<Object>) {
    match shared::decode(frame) {
        Ok(obj) => {
            player.touch();
            if inbound_tx.push(obj).is_some() {
                debug!("inbound queue full for player {}, dropped oldest frame", player.id);
            }
        }
        Err(e) => {
            warn!("dropping malformed frame from player {}: {}", player.id, e);
        }
    }
}

async fn tcp_reader(
    read_half: OwnedReadHalf,
    inbound_tx: SlidingSender<Object>,
    player: Arc<Player>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    ingest_frame(&line, &player, &inbound_tx);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("read error from player {}: {}", player.id, e);
                    break;
                }
            },
        }
    }
}

async fn tcp_writer(
    write_half: OwnedWriteHalf,
    mut outbound_rx: mpsc::Receiver<Object>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut writer = BufWriter::new(write_half);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            msg = outbound_rx.recv() => match msg {
                Some(msg) => {
                    let mut line = shared::encode(&msg);
                    line.push('\n');
                    if writer.write_all(line.as_bytes()).await.is_err()
                        || writer.flush().await.is_err()
                    {
                        // A failed write closes the whole connection.
                        let _ = shutdown_tx.send(true);
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

async fn ws_reader(
    mut source: SplitStream<WebSocketStream<TcpStream>>,
    inbound_tx: SlidingSender<Object>,
    player: Arc<Player>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => ingest_frame(&text, &player, &inbound_tx),
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => ingest_frame(text, &player, &inbound_tx),
                    Err(_) => {
                        warn!("dropping non-UTF-8 binary frame from player {}", player.id);
                    }
                },
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {} // ping/pong handled by tungstenite
                Some(Err(e)) => {
                    debug!("WebSocket error from player {}: {}", player.id, e);
                    break;
                }
                None => break,
            },
        }
    }
}

async fn ws_writer(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut outbound_rx: mpsc::Receiver<Object>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            msg = outbound_rx.recv() => match msg {
                Some(msg) => {
                    if sink.send(Message::Text(shared::encode(&msg))).await.is_err() {
                        let _ = shutdown_tx.send(true);
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = sink.close().await;
}

/// Forces a disconnect for clients that have gone silent for longer than
/// the idle limit, so the departure path runs even without a FIN.
async fn watchdog(
    player: Arc<Player>,
    idle_timeout: Duration,
    shutdown_tx: Arc<watch::Sender<bool>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticks = interval(WATCHDOG_PERIOD);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticks.tick() => {
                if player.idle_millis() > idle_timeout.as_millis() as u64 {
                    info!(
                        "player {} idle past {} ms, closing connection",
                        player.id,
                        idle_timeout.as_millis()
                    );
                    let _ = shutdown_tx.send(true);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ingest_accepts_json_objects() {
        let (player, mut io) = Player::create();
        ingest_frame(r#"{"chat":"hi"}"#, &player, &io.inbound_tx);
        let got = io.inbound_rx.try_recv().expect("frame should be queued");
        assert_eq!(got.get("chat"), Some(&json!("hi")));
    }

    #[test]
    fn test_ingest_drops_malformed_frames() {
        let (player, mut io) = Player::create();
        ingest_frame("{not json", &player, &io.inbound_tx);
        ingest_frame("[1,2]", &player, &io.inbound_tx);
        assert!(io.inbound_rx.try_recv().is_none());
    }

    #[test]
    fn test_subprotocol_negotiation() {
        let ok = Request::builder()
            .uri("ws://localhost/")
            .header(SEC_WEBSOCKET_PROTOCOL, "binary")
            .body(())
            .unwrap();
        let resp = negotiate_subprotocol(&ok, Response::builder().body(()).unwrap());
        assert!(resp.is_ok());
        assert_eq!(
            resp.unwrap().headers().get(SEC_WEBSOCKET_PROTOCOL),
            Some(&HeaderValue::from_static("binary"))
        );

        let listed = Request::builder()
            .uri("ws://localhost/")
            .header(SEC_WEBSOCKET_PROTOCOL, "chat, binary")
            .body(())
            .unwrap();
        assert!(negotiate_subprotocol(&listed, Response::builder().body(()).unwrap()).is_ok());

        let missing = Request::builder().uri("ws://localhost/").body(()).unwrap();
        let rejected = negotiate_subprotocol(&missing, Response::builder().body(()).unwrap());
        assert_eq!(rejected.unwrap_err().status(), StatusCode::BAD_REQUEST);

        let wrong = Request::builder()
            .uri("ws://localhost/")
            .header(SEC_WEBSOCKET_PROTOCOL, "chat")
            .body(())
            .unwrap();
        assert!(negotiate_subprotocol(&wrong, Response::builder().body(()).unwrap()).is_err());
    }
}
