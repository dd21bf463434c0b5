//! Domain and wire types.
//!
//! Everything that crosses a process boundary — client frames, peer frames,
//! durable records — lives here as serde types. All framing is
//! newline-delimited JSON with a `"type"` tag.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::clock::VectorClock;

pub type ServerId = String;
pub type GroupId = String;
pub type UserId = String;
pub type MessageId = String;

/// Microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// What a message means to the group stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// An ordinary chat message.
    New,
    /// A user joined the group (synthetic, emitted by join/reconnect paths).
    Join,
    /// A user left the group (synthetic, also emitted on disconnect).
    Left,
    /// A like request targeting an earlier message (client surface only;
    /// replication carries the updated target message instead).
    Like,
}

/// One chat event. Immutable once stored except for `likes`, which only
/// grows via idempotent merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub group_id: GroupId,
    pub user_id: UserId,
    /// Server the message was born on.
    pub origin: ServerId,
    /// Wall-clock creation time in microseconds (informational; ordering
    /// uses `vector`).
    pub creation_time: u64,
    #[serde(default)]
    pub vector: VectorClock,
    pub kind: MessageKind,
    #[serde(default)]
    pub text: Vec<String>,
    #[serde(default)]
    pub likes: BTreeMap<UserId, bool>,
}

/// Group metadata as persisted and as sent to peers/clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMeta {
    pub group_id: GroupId,
    /// Memberships keyed by the server that attributed them.
    #[serde(default)]
    pub users: BTreeMap<ServerId, Vec<UserId>>,
    pub creation_time: u64,
}

// ── Change log ──────────────────────────────────────────────────────────────

/// Position a spliced message landed at, relative to the existing order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "at", rename_all = "snake_case")]
pub enum Anchor {
    /// Before everything: the new head of the order.
    Head,
    /// Immediately after the named message.
    After { id: MessageId },
}

/// One record of the per-group append-only change log. Replaying these from
/// an empty list reproduces the group's message order exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeEntry {
    /// Message appended at the tail (the common case).
    Append { id: MessageId },
    /// Message spliced into the interior.
    Insert { id: MessageId, after: Anchor },
    /// An existing message changed in place (likes merged).
    Update { id: MessageId },
}

// ── Delta reads ─────────────────────────────────────────────────────────────

/// Where a delta read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cursor {
    /// Materialize the last `count` messages of the current order, then
    /// follow the live change log.
    Tail { count: usize },
    /// Replay the change log from this index.
    Resume { index: u64 },
}

/// One ordered group-stream change, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Delta {
    Append { message: Message },
    /// Carries the splice anchor so a consumer can mirror the order.
    Insert { message: Message, after: Anchor },
    Update { message: Message },
}

// ── Peer replication ────────────────────────────────────────────────────────

/// Payload of one replicated event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncPayload {
    /// A chat event (new message, join/left, or a like-updated message).
    Message { message: Message },
    /// Group metadata (creation broadcast or reconnect reconciliation).
    Group { meta: GroupMeta },
}

/// One replicated event as queued, persisted in the WAL shard, and sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Server the event was born on — never the relay that forwarded it.
    pub origin: ServerId,
    /// Send timestamp assigned at the origin; unique and increasing per
    /// origin, so it doubles as the replication checkpoint currency.
    pub send_ts: u64,
    /// Send timestamp of the origin's previous event, zero for its first.
    /// Chains each origin's events so a receiver can tell an unseen older
    /// event apart from a duplicate.
    #[serde(default)]
    pub prev_ts: u64,
    pub payload: SyncPayload,
}

// ── Liveness / handshakes ───────────────────────────────────────────────────

/// One row of a liveness table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessEntry {
    pub alive: bool,
    /// When the observation was made (micros).
    pub as_of: u64,
}

/// Request that the receiver replay `source`-origin events newer than
/// `after_ts` to `target` from its own WAL shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayHint {
    pub target: ServerId,
    pub source: ServerId,
    pub after_ts: u64,
}

/// Gossip exchanged by handshakes, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeFrame {
    pub from: ServerId,
    /// The sender's direct-link view: peer id → alive/as_of.
    pub liveness: BTreeMap<ServerId, LivenessEntry>,
    /// Received-timestamp matrix: replica id → (origin id → highest applied
    /// send_ts). Includes the sender's own row.
    pub received: BTreeMap<ServerId, BTreeMap<ServerId, u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_hint: Option<ReplayHint>,
}

// ── RPC framing ─────────────────────────────────────────────────────────────

/// Frames a connection may send us. Client frames assume the connection's
/// session state; peer frames are stateless.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Bind this connection to a user.
    Login { user_id: UserId },
    /// Join a group (creating it if needed) and make it current.
    Join { group_id: GroupId },
    /// Leave the current group.
    Leave,
    /// Post to the current group.
    Post { text: Vec<String> },
    /// Like (or unlike) a message in the current group.
    Like {
        message_id: MessageId,
        #[serde(default = "default_true")]
        value: bool,
    },
    /// Fetch a group snapshot without joining.
    GetGroup { group_id: GroupId },
    /// Start streaming deltas of the current group from `cursor`.
    Subscribe { cursor: Cursor },
    /// Peer → peer: one replicated event.
    Sync { from: ServerId, event: SyncEvent },
    /// Peer → peer: liveness/anti-entropy handshake.
    Handshake { frame: HandshakeFrame },
}

fn default_true() -> bool {
    true
}

/// Frames we send back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Error { detail: String },
    Group { meta: GroupMeta },
    Posted { message: Message },
    /// One batch of ordered changes; `cursor` resumes after the batch.
    Deltas { cursor: u64, deltas: Vec<Delta> },
    HandshakeAck { frame: HandshakeFrame },
    SyncAck { origin: ServerId, send_ts: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_entry_wire_shape() {
        let entry = ChangeEntry::Insert {
            id: "m1".into(),
            after: Anchor::Head,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"op":"insert","id":"m1","after":{"at":"head"}}"#);
        let back: ChangeEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn sync_event_roundtrip() {
        let event = SyncEvent {
            origin: "s1".into(),
            send_ts: 99,
            prev_ts: 42,
            payload: SyncPayload::Group {
                meta: GroupMeta {
                    group_id: "lobby".into(),
                    users: BTreeMap::from([("s1".into(), vec!["ana".into()])]),
                    creation_time: 7,
                },
            },
        };
        let json = serde_json::to_vec(&event).unwrap();
        let back: SyncEvent = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn like_request_defaults_to_true() {
        let req: Request = serde_json::from_str(r#"{"type":"like","message_id":"m1"}"#).unwrap();
        match req {
            Request::Like { message_id, value } => {
                assert_eq!(message_id, "m1");
                assert!(value);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn message_tolerates_missing_optional_fields() {
        let json = r#"{
            "message_id": "s1-abc",
            "group_id": "lobby",
            "user_id": "ana",
            "origin": "s1",
            "creation_time": 1,
            "kind": "new"
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert!(msg.vector.is_empty());
        assert!(msg.text.is_empty());
        assert!(msg.likes.is_empty());
    }
}
