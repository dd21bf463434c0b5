//! Liveness and anti-entropy: periodic handshake sweeps over every
//! configured peer, a gossiped view of who-reaches-whom and who-has-what,
//! and the repair machinery that rides on it.
//!
//! Three repairs come out of a sweep. A peer we can reach but that cannot
//! hear some origin directly gets that origin's missed events relayed out
//! of our WAL. A peer we cannot reach gets a replay hint staged for a
//! courier that can. And the per-origin WAL shards are compacted up to
//! the floor every configured peer has acknowledged, so a frozen row
//! (a peer that never reports) halts compaction rather than losing data.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::net::PeerTransport;
use crate::proto::{HandshakeFrame, LivenessEntry, ReplayHint, ServerId, SyncPayload};
use crate::replication::{PeerRegistry, ReplicationError};
use crate::store::MessageStore;

// ── Gossip ──────────────────────────────────────────────────────────────────

/// What handshakes have taught us about the rest of the mesh.
///
/// `links` is kept per observer, not merged into one global view: "s3 is
/// alive" is useless for routing when s3 is alive for us but partitioned
/// from the peer we are trying to repair.
#[derive(Default)]
pub struct GossipView {
    links: Mutex<BTreeMap<ServerId, BTreeMap<ServerId, LivenessEntry>>>,
    /// replica → (origin → highest applied send_ts).
    received: Mutex<BTreeMap<ServerId, BTreeMap<ServerId, u64>>>,
}

impl GossipView {
    /// Fold one frame in. Link entries merge by observation time; received
    /// entries are monotonic counters and merge by max, so stale frames
    /// can never regress the view.
    pub fn absorb_frame(&self, frame: &HandshakeFrame) {
        {
            let mut links = self.links.lock();
            let row = links.entry(frame.from.clone()).or_default();
            for (peer, entry) in &frame.liveness {
                match row.get(peer) {
                    Some(existing) if existing.as_of >= entry.as_of => {}
                    _ => {
                        row.insert(peer.clone(), *entry);
                    }
                }
            }
        }
        let mut received = self.received.lock();
        for (replica, theirs) in &frame.received {
            let row = received.entry(replica.clone()).or_default();
            for (origin, &ts) in theirs {
                let slot = row.entry(origin.clone()).or_insert(0);
                if ts > *slot {
                    *slot = ts;
                }
            }
        }
    }

    /// Keep our own received row current before building a frame.
    pub fn record_self(&self, self_id: &str, row: BTreeMap<ServerId, u64>) {
        let mut received = self.received.lock();
        let mine = received.entry(self_id.to_string()).or_default();
        for (origin, ts) in row {
            let slot = mine.entry(origin).or_insert(0);
            if ts > *slot {
                *slot = ts;
            }
        }
    }

    /// `observer`'s direct view of its link to `target`, if it ever told us.
    pub fn link(&self, observer: &str, target: &str) -> Option<LivenessEntry> {
        self.links.lock().get(observer)?.get(target).copied()
    }

    /// Highest `origin` send_ts `replica` claims to have applied. `None`
    /// means the replica has never reported — callers must treat that as
    /// zero, never as caught-up.
    pub fn received_of(&self, replica: &str, origin: &str) -> Option<u64> {
        self.received.lock().get(replica)?.get(origin).copied()
    }

    pub fn snapshot_received(&self) -> BTreeMap<ServerId, BTreeMap<ServerId, u64>> {
        self.received.lock().clone()
    }
}

// ── Monitor ─────────────────────────────────────────────────────────────────

/// Drives the handshake sweeps and owns the gossip view.
pub struct Liveness {
    registry: Arc<PeerRegistry>,
    store: Arc<MessageStore>,
    transport: Arc<dyn PeerTransport>,
    gossip: GossipView,
    /// Consecutive handshake failures before a peer counts as down.
    threshold: u32,
    /// Replay hints staged per courier, attached to the next frame we
    /// send that courier. Latest hint wins; sweeps regenerate until the
    /// lag is repaired.
    hints: Mutex<BTreeMap<ServerId, ReplayHint>>,
}

impl Liveness {
    pub fn new(
        registry: Arc<PeerRegistry>,
        store: Arc<MessageStore>,
        transport: Arc<dyn PeerTransport>,
        threshold: u32,
    ) -> Self {
        Self {
            registry,
            store,
            transport,
            gossip: GossipView::default(),
            threshold: threshold.max(1),
            hints: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn gossip(&self) -> &GossipView {
        &self.gossip
    }

    /// Sweep forever at a fixed cadence. The first sweep fires immediately
    /// so a restarted server reconnects without waiting a full period.
    pub async fn run(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }

    /// Compact shards forever on an independent, slower cadence.
    pub async fn run_gc(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.collect_garbage();
        }
    }

    /// One full pass: probe every peer, then stage third-party repairs
    /// with whatever the probes taught us.
    pub async fn sweep(&self) {
        self.gossip
            .record_self(self.registry.self_id(), self.registry.received_row());
        let peers: Vec<_> = self.registry.peers().cloned().collect();
        for peer in peers {
            let frame = self.build_frame(self.hints.lock().remove(&peer.id));
            match self.transport.handshake(&peer.id, &frame).await {
                Ok(reply) if reply.from == peer.id => {
                    self.gossip.absorb_frame(&reply);
                    if peer.mark_alive() {
                        tracing::info!(peer = %peer.id, "peer connected");
                        peer.wake();
                        self.reconcile(&peer.id);
                    }
                    if let Some(hint) = &reply.replay_hint {
                        self.honor_hint(hint);
                    }
                    self.relay_missed(&peer.id);
                }
                other => {
                    let detail = match other {
                        Ok(reply) => format!("reply claimed identity {}", reply.from),
                        Err(e) => e.to_string(),
                    };
                    let failures = peer.note_failure();
                    tracing::debug!(peer = %peer.id, failures, detail, "handshake failed");
                    if failures >= self.threshold && peer.mark_down() {
                        tracing::warn!(peer = %peer.id, "peer disconnected");
                        self.handle_peer_down(&peer.id);
                    }
                }
            }
        }
        self.stage_hints();
    }

    /// Handle one inbound handshake and produce the reply frame. An
    /// inbound frame proves the link, so it can flip the peer back up.
    pub fn on_frame(&self, frame: &HandshakeFrame) -> Result<HandshakeFrame, ReplicationError> {
        self.gossip.absorb_frame(frame);
        if let Some(peer) = self.registry.peer(&frame.from) {
            if peer.mark_alive() {
                tracing::info!(peer = %frame.from, "peer connected");
                peer.wake();
                self.reconcile(&frame.from);
            }
        }
        if let Some(hint) = &frame.replay_hint {
            self.honor_hint(hint);
        }
        Ok(self.build_frame(self.hints.lock().remove(&frame.from)))
    }

    /// Our frame: direct link row, the full received matrix with our own
    /// row refreshed, and at most one staged hint.
    pub fn build_frame(&self, hint: Option<ReplayHint>) -> HandshakeFrame {
        let mut liveness = BTreeMap::new();
        for peer in self.registry.peers() {
            liveness.insert(peer.id.clone(), peer.liveness_entry());
        }
        let mut received = self.gossip.snapshot_received();
        received.insert(self.registry.self_id().to_string(), self.registry.received_row());
        HandshakeFrame {
            from: self.registry.self_id().to_string(),
            liveness,
            received,
            replay_hint: hint,
        }
    }

    /// A reconnected peer gets every group's metadata rebroadcast so
    /// member lists dropped while it was away come back. The rebroadcast
    /// rides the normal publish path: everyone else absorbs it as a
    /// no-op, and our event chain stays unbroken for every queue.
    fn reconcile(&self, peer_id: &str) {
        let metas = self.store.group_metas();
        if metas.is_empty() {
            return;
        }
        let n = metas.len();
        for meta in metas {
            if let Err(e) = self.registry.broadcast_local(SyncPayload::Group { meta }) {
                tracing::warn!(peer = %peer_id, error = %e, "failed to publish reconciliation event");
                return;
            }
        }
        tracing::info!(peer = %peer_id, groups = n, "rebroadcasting group state for reconnected peer");
    }

    /// A peer that went down takes its users' presence with it; they will
    /// be re-announced by reconciliation when it returns.
    fn handle_peer_down(&self, peer_id: &str) {
        match self.store.remove_origin_members(peer_id) {
            Ok(0) => {}
            Ok(n) => tracing::info!(peer = %peer_id, users = n, "dropped memberships of disconnected server"),
            Err(e) => tracing::warn!(peer = %peer_id, error = %e, "failed to drop memberships"),
        }
    }

    /// Queue `source`-origin events newer than `after_ts` from our WAL
    /// into `target`'s delivery queue. Returns how many were queued.
    fn send_replay(&self, target: &str, source: &str, after_ts: u64) -> usize {
        match self.registry.wal_events_after(source, after_ts) {
            Ok(events) if !events.is_empty() => self.registry.enqueue_for(target, events),
            Ok(_) => 0,
            Err(e) => {
                tracing::warn!(source = %source, error = %e, "event replay scan failed");
                0
            }
        }
    }

    /// Replay `source`-origin events newer than the hint's watermark to
    /// `target` out of our own WAL.
    fn honor_hint(&self, hint: &ReplayHint) {
        if hint.target == self.registry.self_id() {
            return;
        }
        let n = self.send_replay(&hint.target, &hint.source, hint.after_ts);
        if n > 0 {
            tracing::info!(
                target = %hint.target,
                source = %hint.source,
                count = n,
                "honoring replay hint"
            );
        }
    }

    /// Direct repair after a successful handshake: for every origin the
    /// callee lags and cannot hear itself, push the missed events from our
    /// WAL into its queue. A missing link report counts as unreachable;
    /// duplicates are cheap, silence is not.
    fn relay_missed(&self, callee: &str) {
        for origin in self.registry.peer_ids() {
            if origin == callee {
                continue;
            }
            let callee_has = self.gossip.received_of(callee, &origin).unwrap_or(0);
            if callee_has >= self.registry.received_for(&origin) {
                continue;
            }
            let hears_origin = self
                .gossip
                .link(callee, &origin)
                .map(|l| l.alive)
                .unwrap_or(false);
            if hears_origin {
                continue;
            }
            let n = self.send_replay(callee, &origin, callee_has);
            if n > 0 {
                tracing::info!(
                    peer = %callee,
                    origin = %origin,
                    count = n,
                    "relaying events the peer cannot hear directly"
                );
            }
        }
    }

    /// For each unreachable peer that lags an origin, pick a live courier
    /// that reports a working link to it and stage a replay hint.
    fn stage_hints(&self) {
        let self_id = self.registry.self_id().to_string();
        let mut origins = self.registry.peer_ids();
        origins.push(self_id.clone());
        for target in self.registry.peers() {
            if target.is_alive() {
                continue;
            }
            for origin in &origins {
                if *origin == target.id {
                    continue;
                }
                let claim = self.gossip.received_of(&target.id, origin).unwrap_or(0);
                let (target_has, i_have) = if *origin == self_id {
                    (claim.max(target.last_sent()), self.registry.own_tip())
                } else {
                    (claim, self.registry.received_for(origin))
                };
                if target_has >= i_have {
                    continue;
                }
                // The origin itself already queues for the target, so it
                // is never the courier.
                let courier = self.registry.peers().find(|c| {
                    c.id != target.id
                        && c.id != *origin
                        && c.is_alive()
                        && self
                            .gossip
                            .link(&c.id, &target.id)
                            .map(|l| l.alive)
                            .unwrap_or(false)
                });
                if let Some(courier) = courier {
                    tracing::info!(
                        courier = %courier.id,
                        target = %target.id,
                        origin = %origin,
                        after = target_has,
                        "staging replay hint"
                    );
                    self.hints.lock().insert(
                        courier.id.clone(),
                        ReplayHint {
                            target: target.id.clone(),
                            source: origin.clone(),
                            after_ts: target_has,
                        },
                    );
                }
            }
        }
    }

    /// Compact each origin's WAL shard up to what every other configured
    /// peer has acknowledged. A peer that has never reported pins the
    /// floor at zero and halts compaction for that origin.
    pub fn collect_garbage(&self) {
        let self_id = self.registry.self_id().to_string();
        let mut origins = self.registry.peer_ids();
        origins.push(self_id.clone());
        for origin in origins {
            let own = origin == self_id;
            let mut floor = if own {
                u64::MAX
            } else {
                self.registry.received_for(&origin)
            };
            for peer in self.registry.peers() {
                if peer.id == origin {
                    continue;
                }
                let claim = self.gossip.received_of(&peer.id, &origin).unwrap_or(0);
                let effective = if own { claim.max(peer.last_sent()) } else { claim };
                floor = floor.min(effective);
            }
            if floor == 0 || floor == u64::MAX {
                continue;
            }
            match self.registry.gc_origin(&origin, floor) {
                Ok(0) => {}
                Ok(n) => {
                    tracing::debug!(origin = %origin, floor, removed = n, "compacted event shard")
                }
                Err(e) => tracing::warn!(origin = %origin, error = %e, "shard compaction failed"),
            }
        }
    }
}
