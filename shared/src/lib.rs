//! # Shared Wire Model
//!
//! This crate contains the wire vocabulary and message helpers used by the
//! relay server (and by any Rust client talking to it). Messages on the wire
//! are schemaless JSON objects; the server only ever inspects a small
//! reserved set of keys and treats everything else as opaque payload.
//!
//! ## Core Components
//!
//! ### Reserved Vocabulary
//! The key and marker constants (`msg`, `lock`, `sync`, `join`, `alive`,
//! `playerId`, `step`, `disconnected`) that the relay recognizes. All other
//! fields pass through untouched.
//!
//! ### Message Helpers
//! Builders for the server-originated control messages (welcome, admission,
//! lock, join announce, disconnect notice) and the stamping functions that
//! inject `playerId` and `step` into relayed events.
//!
//! ### Handshake Extraction
//! [`GameInfo`] pulls the game-selection triple out of the first client
//! message, accepting both camelCase and kebab-case spellings.
//!
//! ### Topic Classification
//! [`Topic`] partitions outbound messages into the four publication topics
//! the session fan-out routes on.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A wire message: one decoded JSON object.
pub type Object = Map<String, Value>;

/// Key carrying the control-message marker (`"sync"`, `"join"`, `"alive"`, …).
pub const MSG: &str = "msg";
/// Key carrying the step number on a tick barrier message.
pub const LOCK: &str = "lock";
/// Key carrying the server-injected session slot on relayed events.
pub const PLAYER_ID: &str = "playerId";
/// Key carrying the step annotation on relayed events in stepped sessions.
pub const STEP: &str = "step";
/// Key carrying the departed player's slot on a disconnect notice.
pub const DISCONNECTED: &str = "disconnected";
/// Key naming the designated donor on a join announcement.
pub const SYNCER: &str = "syncer";

/// Marker value of a donor's state-transfer reply.
pub const SYNC: &str = "sync";
/// Marker value of a join announcement.
pub const JOIN: &str = "join";
/// Marker value of a heartbeat; refreshes liveness, never broadcast.
pub const ALIVE: &str = "alive";
/// Marker value of the handshake acknowledgement.
pub const WELCOME: &str = "Welcome!";

/// Game-selection parameters named by a client during the handshake.
///
/// `step_time` is in milliseconds; zero means a stepless session (no ticker,
/// no lock messages, no step stamps).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameInfo {
    pub game_type: String,
    pub max_players: u32,
    pub step_time: u64,
}

impl GameInfo {
    /// Extracts the game-selection triple from a handshake message.
    ///
    /// Both the canonical camelCase keys (`gameType`, `maxPlayers`,
    /// `stepTime`) and the kebab-case alternates (`game-type`,
    /// `max-players`, `step-time`) are accepted. Returns `None` when any of
    /// the three is missing or malformed, or when `maxPlayers` is not a
    /// positive integer — the caller keeps waiting in that case.
    pub fn from_object(obj: &Object) -> Option<Self> {
        let game_type = string_field(obj, "gameType", "game-type")?;
        let max_players = uint_field(obj, "maxPlayers", "max-players")?;
        if max_players == 0 {
            return None;
        }
        let step_time = uint_field(obj, "stepTime", "step-time")?;
        Some(Self {
            game_type,
            max_players: max_players.min(u32::MAX as u64) as u32,
            step_time,
        })
    }
}

fn string_field(obj: &Object, key: &str, alt: &str) -> Option<String> {
    obj.get(key)
        .or_else(|| obj.get(alt))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn uint_field(obj: &Object, key: &str, alt: &str) -> Option<u64> {
    obj.get(key).or_else(|| obj.get(alt)).and_then(Value::as_u64)
}

/// Normalizes the kebab-case handshake alternates to their canonical
/// camelCase names. All other keys are left untouched.
pub fn normalize_keys(mut obj: Object) -> Object {
    for (alt, canonical) in [
        ("game-type", "gameType"),
        ("max-players", "maxPlayers"),
        ("step-time", "stepTime"),
    ] {
        if let Some(v) = obj.remove(alt) {
            obj.entry(canonical.to_owned()).or_insert(v);
        }
    }
    obj
}

/// Publication topics the session fan-out routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Lock,
    Sync,
    Join,
    Other,
}

impl Topic {
    /// Classifies a message: presence of `lock` wins, then the `msg` marker
    /// for `sync` and `join`; everything else is an ordinary event.
    pub fn of(obj: &Object) -> Topic {
        if obj.contains_key(LOCK) {
            return Topic::Lock;
        }
        match obj.get(MSG).and_then(Value::as_str) {
            Some(SYNC) => Topic::Sync,
            Some(JOIN) => Topic::Join,
            _ => Topic::Other,
        }
    }
}

/// True for a heartbeat message (`{msg:"alive"}`).
pub fn is_alive(obj: &Object) -> bool {
    obj.get(MSG).and_then(Value::as_str) == Some(ALIVE)
}

/// True for a donor's sync reply (`msg = "sync"`).
pub fn is_sync(obj: &Object) -> bool {
    obj.get(MSG).and_then(Value::as_str) == Some(SYNC)
}

/// Builds the handshake acknowledgement `{msg:"Welcome!", id:<uuid>}`.
pub fn welcome(id: &str) -> Object {
    let mut obj = Object::new();
    obj.insert(MSG.into(), WELCOME.into());
    obj.insert("id".into(), id.into());
    obj
}

/// Builds the session admission message
/// `{join:true, newGame, playerId, seed}`.
pub fn admission(new_game: bool, slot: u64, seed: i64) -> Object {
    let mut obj = Object::new();
    obj.insert(JOIN.into(), true.into());
    obj.insert("newGame".into(), new_game.into());
    obj.insert(PLAYER_ID.into(), slot.into());
    obj.insert("seed".into(), seed.into());
    obj
}

/// Builds the tick barrier `{lock:<step>}`.
pub fn lock_msg(step: u64) -> Object {
    let mut obj = Object::new();
    obj.insert(LOCK.into(), step.into());
    obj
}

/// Builds a join announcement `{msg:"join", syncer:<donor-uuid>}`.
pub fn join_announce(syncer: &str) -> Object {
    let mut obj = Object::new();
    obj.insert(MSG.into(), JOIN.into());
    obj.insert(SYNCER.into(), syncer.into());
    obj
}

/// Builds the departure notice `{disconnected:<slot>}` injected into the
/// departing player's local inbound stream.
pub fn disconnected(slot: u64) -> Object {
    let mut obj = Object::new();
    obj.insert(DISCONNECTED.into(), slot.into());
    obj
}

/// Stamps the session slot onto a relayed event, overriding any
/// client-supplied value.
pub fn with_player_id(mut obj: Object, slot: u64) -> Object {
    obj.insert(PLAYER_ID.into(), slot.into());
    obj
}

/// Stamps the step annotation onto a relayed event.
pub fn with_step(mut obj: Object, step: u64) -> Object {
    obj.insert(STEP.into(), step.into());
    obj
}

/// Decodes one frame into a message object with normalized keys.
///
/// Non-object JSON (arrays, bare scalars) is rejected alongside malformed
/// input; the relay only speaks objects.
pub fn decode(frame: &str) -> Result<Object, serde_json::Error> {
    let value: Value = serde_json::from_str(frame)?;
    match value {
        Value::Object(obj) => Ok(normalize_keys(obj)),
        other => Err(serde::de::Error::custom(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

/// Encodes a message object for the wire. Framing (the trailing newline on
/// TCP) is the transport's concern.
pub fn encode(obj: &Object) -> String {
    Value::Object(obj.clone()).to_string()
}
