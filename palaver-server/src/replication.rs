//! Peer replication: one durable WAL shard per origin server, one FIFO
//! delivery queue and worker per peer, per-peer checkpoints, and the
//! receive-side dedup that makes redelivery harmless.
//!
//! Events are persisted under `peers/<origin>/evt-<send_ts>` before they
//! become visible to any queue, so a crash can leave an event undelivered
//! but never delivered-yet-forgotten. `last_sent` per peer tracks the
//! newest own-origin event that peer has acknowledged; `last_received`
//! per origin tracks the newest event of that origin we have applied
//! with nothing missing below it. Events that arrive ahead of a gap are
//! parked until their chain predecessor lands, so the watermark never
//! claims an event we have not seen.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::clock::VectorClock;
use crate::net::PeerTransport;
use crate::proto::{LivenessEntry, ServerId, SyncEvent, SyncPayload, now_micros};
use crate::storage::DurableLog;

/// Zero-padded so lexical order equals numeric order in shard listings.
fn event_key(origin: &str, send_ts: u64) -> String {
    format!("peers/{origin}/evt-{send_ts:020}")
}

fn parse_event_ts(name: &str) -> Option<u64> {
    name.strip_prefix("evt-")?.parse().ok()
}

// ── Per-peer state ──────────────────────────────────────────────────────────

/// Everything the node tracks about one configured peer.
pub struct PeerState {
    pub id: ServerId,
    queue: Mutex<VecDeque<SyncEvent>>,
    wake: Notify,
    last_sent: Mutex<u64>,
    alive: AtomicBool,
    failures: AtomicU32,
    last_seen: AtomicU64,
    clock: Mutex<VectorClock>,
}

impl PeerState {
    fn new(id: ServerId) -> Self {
        Self {
            id,
            queue: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            last_sent: Mutex::new(0),
            // Down until the first successful handshake proves otherwise.
            alive: AtomicBool::new(false),
            failures: AtomicU32::new(0),
            last_seen: AtomicU64::new(0),
            clock: Mutex::new(VectorClock::new()),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Returns true when this flipped the peer from down to up.
    pub fn mark_alive(&self) -> bool {
        self.failures.store(0, Ordering::Release);
        self.last_seen.store(now_micros(), Ordering::Release);
        !self.alive.swap(true, Ordering::AcqRel)
    }

    /// Returns true when this flipped the peer from up to down.
    pub fn mark_down(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    /// Count one failed probe; returns the consecutive-failure total.
    pub fn note_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn liveness_entry(&self) -> LivenessEntry {
        LivenessEntry {
            alive: self.is_alive(),
            as_of: self.last_seen.load(Ordering::Acquire),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Nudge the delivery worker out of its idle or backoff wait.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn last_sent(&self) -> u64 {
        *self.last_sent.lock()
    }

    /// Last vector clock observed from this peer's events.
    pub fn clock_snapshot(&self) -> VectorClock {
        self.clock.lock().clone()
    }

    /// Send timestamps currently queued, in delivery order.
    pub fn queued_send_ts(&self) -> Vec<u64> {
        self.queue.lock().iter().map(|e| e.send_ts).collect()
    }

    fn enqueue(&self, event: SyncEvent) {
        self.queue.lock().push_back(event);
        self.wake.notify_one();
    }
}

/// Applied-event progress for one origin: the contiguous watermark plus
/// the events applied above a gap, keyed by send_ts with their chain
/// predecessor. The pending map drains into the watermark as gaps fill.
#[derive(Default)]
struct OriginProgress {
    watermark: u64,
    pending: BTreeMap<u64, u64>,
}

// ── Registry ────────────────────────────────────────────────────────────────

/// Shared replication state: the peer table, the WAL, the send-timestamp
/// allocator, and the applied-event checkpoints.
pub struct PeerRegistry {
    self_id: ServerId,
    log: Arc<dyn DurableLog>,
    peers: BTreeMap<ServerId, Arc<PeerState>>,
    /// Our own received row: origin → applied-event progress.
    received: Mutex<BTreeMap<ServerId, OriginProgress>>,
    /// Strictly increasing per process; seeded past anything on disk.
    send_ts: AtomicU64,
    /// Newest own-origin send_ts ever persisted; survives compaction.
    own_tip: AtomicU64,
    /// Serializes allocate-persist-enqueue for locally-born events, so
    /// every peer queue receives them in send_ts order.
    publish: Mutex<()>,
}

impl PeerRegistry {
    /// Build the registry for a fixed peer set, restoring checkpoints and
    /// clocks from the log.
    pub fn open(
        self_id: &str,
        peer_ids: &[ServerId],
        log: Arc<dyn DurableLog>,
    ) -> Result<Self, ReplicationError> {
        let mut peers = BTreeMap::new();
        let mut max_seen = 0u64;
        for id in peer_ids {
            if id == self_id {
                continue;
            }
            let state = PeerState::new(id.clone());
            if let Some(bytes) = log.read(&format!("peers/{id}/last_sent"))? {
                let ts = parse_checkpoint(&bytes, id)?;
                *state.last_sent.lock() = ts;
                max_seen = max_seen.max(ts);
            }
            if let Some(bytes) = log.read(&format!("peers/{id}/clock"))? {
                *state.clock.lock() = serde_json::from_slice(&bytes)?;
            }
            peers.insert(id.clone(), Arc::new(state));
        }

        let mut received = BTreeMap::new();
        for id in peers.keys() {
            if let Some(bytes) = log.read(&format!("peers/{id}/last_received"))? {
                received.insert(
                    id.clone(),
                    OriginProgress {
                        watermark: parse_checkpoint(&bytes, id)?,
                        pending: BTreeMap::new(),
                    },
                );
            }
        }

        // Never reissue a send_ts that is already in our own shard.
        for name in log.list(&format!("peers/{self_id}"))? {
            if let Some(ts) = parse_event_ts(&name) {
                max_seen = max_seen.max(ts);
            }
        }

        Ok(Self {
            self_id: self_id.to_string(),
            log,
            peers,
            received: Mutex::new(received),
            send_ts: AtomicU64::new(now_micros().max(max_seen + 1)),
            own_tip: AtomicU64::new(max_seen),
            publish: Mutex::new(()),
        })
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn peer(&self, id: &str) -> Option<Arc<PeerState>> {
        self.peers.get(id).cloned()
    }

    pub fn peers(&self) -> impl Iterator<Item = &Arc<PeerState>> {
        self.peers.values()
    }

    pub fn peer_ids(&self) -> Vec<ServerId> {
        self.peers.keys().cloned().collect()
    }

    /// Allocate the next send timestamp: wall-clock micros, bumped when
    /// the clock stands still or runs backwards.
    fn next_send_ts(&self) -> u64 {
        let now = now_micros();
        self.send_ts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                Some(now.max(prev + 1))
            })
            .unwrap_or(now)
    }

    // ── WAL ─────────────────────────────────────────────────────────────

    /// Persist an event into its origin's shard. Idempotent: rewriting the
    /// same event produces the same record.
    pub fn persist_event(&self, event: &SyncEvent) -> Result<(), ReplicationError> {
        let bytes = serde_json::to_vec(event)?;
        self.log.put(&event_key(&event.origin, event.send_ts), &bytes)?;
        if event.origin == self.self_id {
            self.own_tip.fetch_max(event.send_ts, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Newest send_ts this server has ever assigned to a persisted event.
    pub fn own_tip(&self) -> u64 {
        self.own_tip.load(Ordering::Acquire)
    }

    /// Events of `origin` with send_ts strictly greater than `after_ts`,
    /// in send order.
    pub fn wal_events_after(
        &self,
        origin: &str,
        after_ts: u64,
    ) -> Result<Vec<SyncEvent>, ReplicationError> {
        let mut events = Vec::new();
        for name in self.log.list(&format!("peers/{origin}"))? {
            let Some(ts) = parse_event_ts(&name) else {
                continue;
            };
            if ts <= after_ts {
                continue;
            }
            if let Some(bytes) = self.log.read(&format!("peers/{origin}/{name}"))? {
                events.push(serde_json::from_slice::<SyncEvent>(&bytes)?);
            }
        }
        events.sort_by_key(|e| e.send_ts);
        Ok(events)
    }

    /// Delete `origin` shard entries up to and including `floor`. Returns
    /// how many were removed.
    pub fn gc_origin(&self, origin: &str, floor: u64) -> Result<usize, ReplicationError> {
        let mut removed = 0;
        for name in self.log.list(&format!("peers/{origin}"))? {
            let Some(ts) = parse_event_ts(&name) else {
                continue;
            };
            if ts <= floor {
                self.log.delete(&format!("peers/{origin}/{name}"))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ── Queues ──────────────────────────────────────────────────────────

    /// Stamp a locally-born event, persist it, then queue it to every
    /// peer. The whole path runs under one lock: send_ts allocation, the
    /// chain link to the previous own event, and the enqueues, so two
    /// racing callers can never interleave a newer event ahead of an
    /// older one on any queue.
    pub fn broadcast_local(&self, payload: SyncPayload) -> Result<SyncEvent, ReplicationError> {
        let _publish = self.publish.lock();
        let event = SyncEvent {
            origin: self.self_id.clone(),
            prev_ts: self.own_tip.load(Ordering::Acquire),
            send_ts: self.next_send_ts(),
            payload,
        };
        self.persist_event(&event)?;
        for peer in self.peers.values() {
            peer.enqueue(event.clone());
        }
        Ok(event)
    }

    /// Fan an applied event out to everyone who did not already see it by
    /// construction: not the origin, not the sender, not us. The caller
    /// has already persisted it. Forwarding happens exactly once per
    /// applied event, so every queue carries each origin's events in the
    /// order we applied them.
    pub fn forward_applied(&self, sender: &str, event: &SyncEvent) {
        for (id, peer) in &self.peers {
            if id == &event.origin || id == sender {
                continue;
            }
            peer.enqueue(event.clone());
        }
    }

    /// Queue events directly to one peer (relay/replay paths).
    pub fn enqueue_for(&self, peer_id: &str, events: Vec<SyncEvent>) -> usize {
        let Some(peer) = self.peers.get(peer_id) else {
            return 0;
        };
        let n = events.len();
        for event in events {
            peer.enqueue(event);
        }
        n
    }

    /// Re-queue own-origin events each peer has not acknowledged. Called
    /// once at startup, after checkpoints are restored.
    pub fn rehydrate_queues(&self) -> Result<usize, ReplicationError> {
        let mut queued = 0;
        for peer in self.peers.values() {
            let pending = self.wal_events_after(&self.self_id, peer.last_sent())?;
            if !pending.is_empty() {
                tracing::info!(peer = %peer.id, count = pending.len(), "requeueing unacknowledged events");
            }
            for event in pending {
                peer.enqueue(event);
                queued += 1;
            }
        }
        Ok(queued)
    }

    // ── Checkpoints ─────────────────────────────────────────────────────

    /// True when we have already applied this event: at or below the
    /// contiguous watermark, or parked above a gap.
    pub fn is_duplicate(&self, origin: &str, send_ts: u64) -> bool {
        let received = self.received.lock();
        let Some(progress) = received.get(origin) else {
            return false;
        };
        send_ts <= progress.watermark || progress.pending.contains_key(&send_ts)
    }

    /// Record that an event of `origin` has been applied. The watermark
    /// only advances along the origin's chain: an event whose predecessor
    /// we have not applied is parked, and filling a gap rolls the
    /// watermark forward through everything parked behind it. The lock is
    /// held across the write so the persisted value never runs behind a
    /// newer in-memory one.
    pub fn record_received(
        &self,
        origin: &str,
        send_ts: u64,
        prev_ts: u64,
    ) -> Result<(), ReplicationError> {
        let mut received = self.received.lock();
        let progress = received.entry(origin.to_string()).or_default();
        if send_ts <= progress.watermark || progress.pending.contains_key(&send_ts) {
            return Ok(());
        }
        if prev_ts > progress.watermark {
            progress.pending.insert(send_ts, prev_ts);
            return Ok(());
        }
        progress.watermark = send_ts;
        while let Some((&ts, &prev)) = progress.pending.first_key_value() {
            if prev > progress.watermark {
                break;
            }
            progress.pending.pop_first();
            progress.watermark = ts;
        }
        self.log.put(
            &format!("peers/{origin}/last_received"),
            progress.watermark.to_string().as_bytes(),
        )?;
        Ok(())
    }

    pub fn received_row(&self) -> BTreeMap<ServerId, u64> {
        self.received
            .lock()
            .iter()
            .map(|(origin, progress)| (origin.clone(), progress.watermark))
            .collect()
    }

    pub fn received_for(&self, origin: &str) -> u64 {
        self.received
            .lock()
            .get(origin)
            .map(|p| p.watermark)
            .unwrap_or(0)
    }

    /// Record that `peer` acknowledged our event at `send_ts`.
    pub fn record_sent(&self, peer_id: &str, send_ts: u64) -> Result<(), ReplicationError> {
        let Some(peer) = self.peers.get(peer_id) else {
            return Ok(());
        };
        let mut last = peer.last_sent.lock();
        if *last >= send_ts {
            return Ok(());
        }
        *last = send_ts;
        self.log.put(
            &format!("peers/{peer_id}/last_sent"),
            send_ts.to_string().as_bytes(),
        )?;
        Ok(())
    }

    /// Remember the newest vector clock seen from an origin.
    pub fn record_peer_clock(&self, origin: &str, clock: &VectorClock) -> Result<(), ReplicationError> {
        let Some(peer) = self.peers.get(origin) else {
            return Ok(());
        };
        *peer.clock.lock() = clock.clone();
        self.log
            .put(&format!("peers/{origin}/clock"), &serde_json::to_vec(clock)?)?;
        Ok(())
    }
}

fn parse_checkpoint(bytes: &[u8], peer: &str) -> Result<u64, ReplicationError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| ReplicationError::CorruptCheckpoint(peer.to_string()))
}

// ── Delivery ────────────────────────────────────────────────────────────────

/// Drain one peer's queue in order, forever. Peek, send, and only then
/// pop, so a crash or failure never skips an event. Failures back off and
/// retry the same head; FIFO order is the ordering guarantee peers rely
/// on for own-origin events.
pub async fn delivery_worker(
    registry: Arc<PeerRegistry>,
    peer: Arc<PeerState>,
    transport: Arc<dyn PeerTransport>,
    retry: Duration,
) {
    loop {
        let event = loop {
            let head = peer.queue.lock().front().cloned();
            match head {
                Some(event) => break event,
                None => peer.wake.notified().await,
            }
        };
        match transport.sync(&peer.id, registry.self_id(), &event).await {
            Ok(()) => {
                if event.origin == registry.self_id() {
                    if let Err(e) = registry.record_sent(&peer.id, event.send_ts) {
                        tracing::warn!(peer = %peer.id, error = %e, "failed to persist send checkpoint");
                    }
                }
                peer.queue.lock().pop_front();
            }
            Err(e) => {
                tracing::debug!(peer = %peer.id, send_ts = event.send_ts, error = %e, "delivery failed; will retry");
                // Back off, but let a reconnect signal cut the wait short.
                tokio::select! {
                    _ = tokio::time::sleep(retry) => {}
                    _ = peer.wake.notified() => {}
                }
            }
        }
    }
}

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("corrupt checkpoint for peer {0}")]
    CorruptCheckpoint(String),
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::BoxFuture;
    use crate::net::TransportError;
    use crate::proto::{Message, MessageKind, SyncPayload};
    use crate::storage::MemoryLog;

    fn payload(origin: &str, tag: u64) -> SyncPayload {
        SyncPayload::Message {
            message: Message {
                message_id: format!("{origin}-{tag}"),
                group_id: "g".into(),
                user_id: "u".into(),
                origin: origin.to_string(),
                creation_time: tag,
                vector: VectorClock::new(),
                kind: MessageKind::New,
                text: vec!["hi".into()],
                likes: BTreeMap::new(),
            },
        }
    }

    fn event(origin: &str, send_ts: u64) -> SyncEvent {
        SyncEvent {
            origin: origin.to_string(),
            send_ts,
            prev_ts: 0,
            payload: payload(origin, send_ts),
        }
    }

    fn registry(self_id: &str) -> PeerRegistry {
        let ids = vec!["s1".to_string(), "s2".to_string(), "s3".to_string()];
        PeerRegistry::open(self_id, &ids, MemoryLog::new()).unwrap()
    }

    #[test]
    fn self_is_never_a_peer() {
        let r = registry("s1");
        assert_eq!(r.peer_ids(), vec!["s2".to_string(), "s3".to_string()]);
        assert!(r.peer("s1").is_none());
    }

    #[test]
    fn send_ts_is_strictly_increasing() {
        let r = registry("s1");
        let mut prev = 0;
        for _ in 0..100 {
            let ts = r.next_send_ts();
            assert!(ts > prev);
            prev = ts;
        }
    }

    #[test]
    fn send_ts_reseeds_past_existing_shard() {
        let log = MemoryLog::new();
        let ids = vec!["s1".to_string(), "s2".to_string()];
        let far_future = now_micros() + 60_000_000;
        {
            let r = PeerRegistry::open("s1", &ids, log.clone()).unwrap();
            r.persist_event(&event("s1", far_future)).unwrap();
        }
        let r = PeerRegistry::open("s1", &ids, log).unwrap();
        assert!(r.next_send_ts() > far_future);
    }

    #[test]
    fn broadcast_persists_chains_and_queues_to_all_peers() {
        let r = registry("s1");
        let a = r.broadcast_local(payload("s1", 1)).unwrap();
        let b = r.broadcast_local(payload("s1", 2)).unwrap();
        assert!(b.send_ts > a.send_ts);
        assert_eq!(b.prev_ts, a.send_ts, "each event links to its predecessor");
        assert_eq!(r.wal_events_after("s1", 0).unwrap(), vec![a.clone(), b.clone()]);
        for peer in ["s2", "s3"] {
            assert_eq!(
                r.peer(peer).unwrap().queued_send_ts(),
                vec![a.send_ts, b.send_ts]
            );
        }
    }

    #[test]
    fn forward_skips_origin_and_sender() {
        let r = registry("s1");
        // s3-origin event arriving via s2: only... nobody is left in a
        // three-server mesh, so no queue may grow.
        r.forward_applied("s2", &event("s3", 7));
        assert_eq!(r.peer("s2").unwrap().queue_len(), 0);
        assert_eq!(r.peer("s3").unwrap().queue_len(), 0);
    }

    #[test]
    fn forward_reaches_uninvolved_peers() {
        let log = MemoryLog::new();
        let ids: Vec<_> = ["s1", "s2", "s3", "s4"].iter().map(|s| s.to_string()).collect();
        let r = PeerRegistry::open("s1", &ids, log).unwrap();
        r.forward_applied("s2", &event("s3", 7));
        assert_eq!(r.peer("s4").unwrap().queue_len(), 1);
        assert_eq!(r.peer("s2").unwrap().queue_len(), 0);
        assert_eq!(r.peer("s3").unwrap().queue_len(), 0);
    }

    #[test]
    fn received_checkpoint_dedups() {
        let r = registry("s1");
        assert!(!r.is_duplicate("s2", 10));
        r.record_received("s2", 10, 0).unwrap();
        assert!(r.is_duplicate("s2", 10));
        assert!(r.is_duplicate("s2", 9));
        assert!(!r.is_duplicate("s2", 11));
        // Stale updates never regress the checkpoint.
        r.record_received("s2", 5, 0).unwrap();
        assert_eq!(r.received_for("s2"), 10);
    }

    #[test]
    fn watermark_waits_for_chain_gaps() {
        let r = registry("s1");
        // The newer of two s2 events arrives first, through a relay.
        r.record_received("s2", 20, 10).unwrap();
        assert_eq!(r.received_for("s2"), 0, "nothing contiguous applied yet");
        assert!(r.is_duplicate("s2", 20), "the parked event is remembered");
        assert!(!r.is_duplicate("s2", 10), "its predecessor is still wanted");
        // The missing predecessor lands; the watermark rolls through both.
        r.record_received("s2", 10, 0).unwrap();
        assert_eq!(r.received_for("s2"), 20);
        assert!(r.is_duplicate("s2", 10));
        assert!(r.is_duplicate("s2", 20));
    }

    #[test]
    fn checkpoints_survive_reopen() {
        let log = MemoryLog::new();
        let ids = vec!["s1".to_string(), "s2".to_string()];
        {
            let r = PeerRegistry::open("s1", &ids, log.clone()).unwrap();
            r.record_received("s2", 33, 0).unwrap();
            r.record_sent("s2", 44).unwrap();
        }
        let r = PeerRegistry::open("s1", &ids, log).unwrap();
        assert_eq!(r.received_for("s2"), 33);
        assert_eq!(r.peer("s2").unwrap().last_sent(), 44);
    }

    #[test]
    fn rehydrate_requeues_unacknowledged_events() {
        let log = MemoryLog::new();
        let ids = vec!["s1".to_string(), "s2".to_string()];
        {
            let r = PeerRegistry::open("s1", &ids, log.clone()).unwrap();
            for ts in [10, 20, 30] {
                r.persist_event(&event("s1", ts)).unwrap();
            }
            r.record_sent("s2", 10).unwrap();
        }
        let r = PeerRegistry::open("s1", &ids, log).unwrap();
        assert_eq!(r.rehydrate_queues().unwrap(), 2);
        assert_eq!(r.peer("s2").unwrap().queue_len(), 2);
    }

    #[test]
    fn gc_deletes_only_up_to_floor() {
        let r = registry("s1");
        for ts in [10, 20, 30] {
            r.persist_event(&event("s2", ts)).unwrap();
        }
        assert_eq!(r.gc_origin("s2", 20).unwrap(), 2);
        let rest = r.wal_events_after("s2", 0).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].send_ts, 30);
        // Floor zero removes nothing.
        assert_eq!(r.gc_origin("s2", 0).unwrap(), 0);
    }

    /// Succeeds or fails per a scripted plan, recording every attempt.
    struct ScriptedTransport {
        fail_first: AtomicU32,
        sent: Mutex<Vec<u64>>,
    }

    impl PeerTransport for ScriptedTransport {
        fn sync<'a>(
            &'a self,
            _peer: &'a str,
            _from: &'a str,
            event: &'a SyncEvent,
        ) -> BoxFuture<'a, Result<(), TransportError>> {
            Box::pin(async move {
                if self
                    .fail_first
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err(TransportError::Unreachable("scripted".into()));
                }
                self.sent.lock().push(event.send_ts);
                Ok(())
            })
        }

        fn handshake<'a>(
            &'a self,
            _peer: &'a str,
            frame: &'a crate::proto::HandshakeFrame,
        ) -> BoxFuture<'a, Result<crate::proto::HandshakeFrame, TransportError>> {
            let frame = frame.clone();
            Box::pin(async move { Ok(frame) })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn worker_delivers_in_order_and_checkpoints() {
        let r = Arc::new(registry("s1"));
        let transport = Arc::new(ScriptedTransport {
            fail_first: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
        });
        let sent_ts: Vec<u64> = (0..3)
            .map(|i| r.broadcast_local(payload("s1", i)).unwrap().send_ts)
            .collect();
        let peer = r.peer("s2").unwrap();
        let worker = tokio::spawn(delivery_worker(
            r.clone(),
            peer.clone(),
            transport.clone(),
            Duration::from_millis(100),
        ));
        while peer.queue_len() > 0 {
            tokio::task::yield_now().await;
        }
        worker.abort();
        assert_eq!(*transport.sent.lock(), sent_ts);
        assert_eq!(peer.last_sent(), *sent_ts.last().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn worker_retries_head_after_failure() {
        let r = Arc::new(registry("s1"));
        let transport = Arc::new(ScriptedTransport {
            fail_first: AtomicU32::new(2),
            sent: Mutex::new(Vec::new()),
        });
        let e = r.broadcast_local(payload("s1", 9)).unwrap();
        let peer = r.peer("s2").unwrap();
        let worker = tokio::spawn(delivery_worker(
            r.clone(),
            peer.clone(),
            transport.clone(),
            Duration::from_millis(50),
        ));
        while peer.queue_len() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        worker.abort();
        // Two scripted failures, then the same event lands exactly once.
        assert_eq!(*transport.sent.lock(), vec![e.send_ts]);
        assert_eq!(peer.last_sent(), e.send_ts);
    }

    #[tokio::test]
    async fn worker_wakes_on_enqueue() {
        let r = Arc::new(registry("s1"));
        let transport = Arc::new(ScriptedTransport {
            fail_first: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
        });
        let peer = r.peer("s2").unwrap();
        let worker = tokio::spawn(delivery_worker(
            r.clone(),
            peer.clone(),
            transport.clone(),
            Duration::from_millis(50),
        ));
        // Queue only after the worker is parked on an empty queue.
        tokio::task::yield_now().await;
        let e = r.broadcast_local(payload("s1", 3)).unwrap();
        while transport.sent.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        worker.abort();
        assert_eq!(*transport.sent.lock(), vec![e.send_ts]);
    }
}
