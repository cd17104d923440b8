//! # Lockstep Relay Server
//!
//! This library implements a relay server for lockstep multiplayer games.
//! Clients connect over newline-framed TCP or WebSocket, name a game type
//! and a capacity, and are grouped into sessions of matching parameters.
//! Within a session the relay forwards every client message to every
//! participant in one globally agreed order, emits a periodic lock tick
//! that partitions time into discrete steps, and mediates the late-join
//! handover of authoritative state from an existing participant to a
//! newcomer. The server itself never interprets or stores game state.
//!
//! ## Architecture
//!
//! Everything is a tokio task talking over bounded channels:
//!
//! - **Transport** ([`transport`], [`network`]): listeners and the
//!   per-connection reader/writer/watchdog trio.
//! - **Player session** ([`player`], [`queue`]): the four per-client
//!   queues — lossy inbound (drop-oldest), lossy outbound (drop-newest),
//!   the server-injected event channel, and the liveness register.
//! - **Handshake** ([`handshake`]): welcome plus game selection.
//! - **Dispatcher** ([`dispatcher`]): the single consumer of the merged
//!   lifecycle stream; owns the session list.
//! - **Game session** ([`session`], [`topic`]): the per-session pipeline —
//!   stamped fan-in, lock ticker, topic-routed fan-out.
//! - **Sync mediator** ([`sync`]): the late-join state transfer.
//!
//! Under sustained overload the relay drops messages at the per-client
//! queues rather than ever blocking the tick stream.

pub mod dispatcher;
pub mod handshake;
pub mod network;
pub mod player;
pub mod queue;
pub mod session;
pub mod sync;
pub mod topic;
pub mod transport;
