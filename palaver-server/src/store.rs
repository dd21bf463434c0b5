//! Message store: per-group causal order, append-only change log, likes,
//! membership, delta reads, and crash recovery.
//!
//! # Ordering
//!
//! Messages within a group are kept in one ordered list. Position is decided
//! by [`cmp_messages`]: vector-clock dominance first, and for concurrent
//! pairs the origin server id ascending — a replica-independent rule, so
//! every replica that has seen the same messages agrees on the order.
//!
//! # Change log
//!
//! Every mutation appends a [`ChangeEntry`] to the group's durable change
//! log: `Append` for tail growth, `Insert` (with an explicit [`Anchor`])
//! for interior splices, `Update` for like merges. Replaying the change log
//! from empty reproduces the order exactly — recovery does precisely that
//! and nothing else.
//!
//! # Locking
//!
//! One mutex per group serializes all mutation and consistent reads; the
//! global message table sits behind an RwLock acquired after the group
//! lock. The group map itself is only locked long enough to clone a handle.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::clock::Causality;
use crate::proto::{
    Anchor, ChangeEntry, Cursor, Delta, GroupId, GroupMeta, Message, MessageId, MessageKind,
    ServerId, UserId,
};
use crate::storage::DurableLog;

/// Replica-independent total order used for splicing.
pub fn cmp_messages(a: &Message, b: &Message) -> Ordering {
    match a.vector.causality(&b.vector) {
        Causality::Before => Ordering::Less,
        Causality::After => Ordering::Greater,
        Causality::Concurrent => a.origin.cmp(&b.origin),
    }
}

/// Reject malformed messages before anything touches storage.
pub fn validate_message(message: &Message) -> Result<(), StoreError> {
    let required = [
        ("message_id", &message.message_id),
        ("group_id", &message.group_id),
        ("user_id", &message.user_id),
        ("origin", &message.origin),
    ];
    for (field, value) in required {
        if value.is_empty() {
            return Err(StoreError::InvalidMessage(format!("missing {field}")));
        }
    }
    if message.kind == MessageKind::Like {
        return Err(StoreError::InvalidMessage(
            "like is a request, not a storable message".into(),
        ));
    }
    Ok(())
}

/// What applying a message/liking actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// New message spliced into the order.
    Inserted,
    /// Known message, likes merged (state changed).
    Merged,
    /// Nothing to do (duplicate delivery, author self-like, no-op merge).
    Unchanged,
}

/// Summary returned by [`MessageStore::recover`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryReport {
    pub groups: usize,
    pub messages: usize,
}

struct GroupState {
    group_id: GroupId,
    creation_time: u64,
    users: BTreeMap<ServerId, Vec<UserId>>,
    order: Vec<MessageId>,
    change_log: Vec<ChangeEntry>,
}

impl GroupState {
    fn meta(&self) -> GroupMeta {
        GroupMeta {
            group_id: self.group_id.clone(),
            users: self.users.clone(),
            creation_time: self.creation_time,
        }
    }
}

struct GroupHandle {
    state: Mutex<GroupState>,
    /// Publishes the change-log length; one receiver per subscription.
    changes_tx: watch::Sender<u64>,
}

impl GroupHandle {
    fn new(state: GroupState) -> Self {
        let tip = state.change_log.len() as u64;
        Self {
            state: Mutex::new(state),
            changes_tx: watch::Sender::new(tip),
        }
    }
}

pub struct MessageStore {
    log: Arc<dyn DurableLog>,
    groups: Mutex<HashMap<GroupId, Arc<GroupHandle>>>,
    messages: RwLock<HashMap<MessageId, Message>>,
}

impl MessageStore {
    pub fn new(log: Arc<dyn DurableLog>) -> Self {
        Self {
            log,
            groups: Mutex::new(HashMap::new()),
            messages: RwLock::new(HashMap::new()),
        }
    }

    // ── Groups & membership ─────────────────────────────────────────────

    /// Create the group if it does not exist yet. The snapshot is durable
    /// before the group becomes visible. Returns (meta, created).
    pub fn create_group(
        &self,
        group_id: &str,
        creation_time: u64,
    ) -> Result<(GroupMeta, bool), StoreError> {
        let (handle, created) = self.handle_or_create(group_id, creation_time)?;
        let meta = handle.state.lock().meta();
        Ok((meta, created))
    }

    /// Apply group metadata received from a peer. The sender's own
    /// membership row is authoritative; rows for servers we have never
    /// heard about are filled in; rows we already track are kept.
    pub fn apply_group_meta(&self, meta: &GroupMeta, origin: &str) -> Result<bool, StoreError> {
        let (handle, created) = self.handle_or_create(&meta.group_id, meta.creation_time)?;
        let mut state = handle.state.lock();
        let mut changed = false;
        if created {
            state.users = meta.users.clone();
            changed = true;
        } else {
            if let Some(row) = meta.users.get(origin) {
                if state.users.get(origin) != Some(row) {
                    state.users.insert(origin.to_string(), row.clone());
                    changed = true;
                }
            }
            for (server, row) in &meta.users {
                if !state.users.contains_key(server) {
                    state.users.insert(server.clone(), row.clone());
                    changed = true;
                }
            }
        }
        if changed {
            self.write_snapshot(&state)?;
        }
        Ok(created)
    }

    pub fn group_meta(&self, group_id: &str) -> Option<GroupMeta> {
        let handle = self.groups.lock().get(group_id).cloned()?;
        let meta = handle.state.lock().meta();
        Some(meta)
    }

    pub fn group_metas(&self) -> Vec<GroupMeta> {
        let handles: Vec<_> = self.groups.lock().values().cloned().collect();
        let mut metas: Vec<_> = handles.iter().map(|h| h.state.lock().meta()).collect();
        metas.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        metas
    }

    pub fn group_ids(&self) -> Vec<GroupId> {
        let mut ids: Vec<_> = self.groups.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Record `user_id` as a member attributed to `origin`. Creates the
    /// group lazily; idempotent.
    pub fn add_user(&self, group_id: &str, origin: &str, user_id: &str) -> Result<(), StoreError> {
        let (handle, _) = self.handle_or_create(group_id, crate::proto::now_micros())?;
        let mut state = handle.state.lock();
        let row = state.users.entry(origin.to_string()).or_default();
        if !row.iter().any(|u| u == user_id) {
            row.push(user_id.to_string());
            self.write_snapshot(&state)?;
        }
        Ok(())
    }

    /// Remove a membership. Removing an absent user is a no-op, not an
    /// error — departure events can race or replay.
    pub fn remove_user(
        &self,
        group_id: &str,
        origin: &str,
        user_id: &str,
    ) -> Result<(), StoreError> {
        let Some(handle) = self.groups.lock().get(group_id).cloned() else {
            return Ok(());
        };
        let mut state = handle.state.lock();
        let Some(row) = state.users.get_mut(origin) else {
            return Ok(());
        };
        let before = row.len();
        row.retain(|u| u != user_id);
        let changed = row.len() != before;
        if row.is_empty() {
            state.users.remove(origin);
        }
        if changed {
            self.write_snapshot(&state)?;
        }
        Ok(())
    }

    /// Drop every membership attributed to a dead origin server. Returns
    /// how many users were dropped.
    pub fn remove_origin_members(&self, origin: &str) -> Result<usize, StoreError> {
        let handles: Vec<_> = self.groups.lock().values().cloned().collect();
        let mut dropped = 0;
        for handle in handles {
            let mut state = handle.state.lock();
            if let Some(row) = state.users.remove(origin) {
                dropped += row.len();
                self.write_snapshot(&state)?;
            }
        }
        Ok(dropped)
    }

    // ── Message application ─────────────────────────────────────────────

    /// Apply a message to its group: splice a new id into the causal order,
    /// or merge likes if the id is already known (duplicate delivery).
    pub fn insert(&self, message: &Message) -> Result<Applied, StoreError> {
        validate_message(message)?;
        let (handle, _) = self.handle_or_create(&message.group_id, message.creation_time)?;
        let mut state = handle.state.lock();

        if self.messages.read().contains_key(&message.message_id) {
            return self.merge_likes_locked(&handle, &mut state, &message.message_id, |likes| {
                merge_like_map(likes, &message.likes, &message.user_id)
            });
        }

        // Position first (read-only), then persist, then commit to memory.
        let (position, entry) = {
            let messages = self.messages.read();
            let precedes = |id: &MessageId| {
                messages
                    .get(id)
                    .map(|m| cmp_messages(m, message) == Ordering::Less)
                    .unwrap_or(false)
            };
            match state.order.last() {
                // Fast path: the new message follows the current tail.
                None => (None, ChangeEntry::Append { id: message.message_id.clone() }),
                Some(tail) if precedes(tail) => {
                    (None, ChangeEntry::Append { id: message.message_id.clone() })
                }
                Some(_) => {
                    let idx = state.order.partition_point(|id| precedes(id));
                    let after = if idx == 0 {
                        Anchor::Head
                    } else {
                        Anchor::After { id: state.order[idx - 1].clone() }
                    };
                    (Some(idx), ChangeEntry::Insert { id: message.message_id.clone(), after })
                }
            }
        };

        // Message blob goes first so the change log never names an id the
        // blob log does not have.
        self.append_message_blob(&state.group_id, message)?;
        self.append_change_record(&state.group_id, &entry)?;

        match position {
            None => state.order.push(message.message_id.clone()),
            Some(idx) => state.order.insert(idx, message.message_id.clone()),
        }
        state.change_log.push(entry);
        handle.changes_tx.send_replace(state.change_log.len() as u64);
        self.messages
            .write()
            .insert(message.message_id.clone(), message.clone());
        Ok(Applied::Inserted)
    }

    /// Merge a like by `actor` into the target message.
    ///
    /// A like from the message's own author is silently absorbed: no
    /// mutation, no change-log entry, no error.
    pub fn apply_like(
        &self,
        message_id: &str,
        actor: &str,
        value: bool,
    ) -> Result<Applied, StoreError> {
        let (group_id, author) = {
            let messages = self.messages.read();
            let msg = messages
                .get(message_id)
                .ok_or_else(|| StoreError::UnknownMessage(message_id.to_string()))?;
            (msg.group_id.clone(), msg.user_id.clone())
        };
        if actor == author {
            return Ok(Applied::Unchanged);
        }
        let handle = self.handle(&group_id)?;
        let mut state = handle.state.lock();
        self.merge_likes_locked(&handle, &mut state, message_id, |likes| {
            if likes.get(actor) == Some(&value) {
                false
            } else {
                likes.insert(actor.to_string(), value);
                true
            }
        })
    }

    /// Shared tail of both like paths: compute the merged map, persist the
    /// updated blob plus an Update entry, then commit. A merge that changes
    /// nothing writes nothing — redelivery must not grow the logs.
    fn merge_likes_locked(
        &self,
        handle: &GroupHandle,
        state: &mut GroupState,
        message_id: &str,
        merge: impl FnOnce(&mut BTreeMap<UserId, bool>) -> bool,
    ) -> Result<Applied, StoreError> {
        let updated = {
            let messages = self.messages.read();
            let Some(existing) = messages.get(message_id) else {
                return Err(StoreError::UnknownMessage(message_id.to_string()));
            };
            let mut updated = existing.clone();
            if !merge(&mut updated.likes) {
                return Ok(Applied::Unchanged);
            }
            updated
        };

        self.append_message_blob(&state.group_id, &updated)?;
        let entry = ChangeEntry::Update { id: message_id.to_string() };
        self.append_change_record(&state.group_id, &entry)?;

        state.change_log.push(entry);
        handle.changes_tx.send_replace(state.change_log.len() as u64);
        self.messages
            .write()
            .insert(message_id.to_string(), updated);
        Ok(Applied::Merged)
    }

    pub fn message(&self, message_id: &str) -> Option<Message> {
        self.messages.read().get(message_id).cloned()
    }

    /// Current order of a group (test/diagnostic view).
    pub fn order_snapshot(&self, group_id: &str) -> Result<Vec<MessageId>, StoreError> {
        let handle = self.handle(group_id)?;
        let state = handle.state.lock();
        Ok(state.order.clone())
    }

    pub fn change_log_len(&self, group_id: &str) -> Result<u64, StoreError> {
        let handle = self.handle(group_id)?;
        let state = handle.state.lock();
        Ok(state.change_log.len() as u64)
    }

    // ── Delta reads & subscriptions ─────────────────────────────────────

    /// Read ordered changes from `cursor`. `Tail { count }` materializes
    /// the last `count` messages as appends; `Resume { index }` replays the
    /// change log from that index. Returns the cursor to resume after this
    /// batch.
    pub fn read_delta(
        &self,
        group_id: &str,
        cursor: Cursor,
    ) -> Result<(u64, Vec<Delta>), StoreError> {
        let handle = self.handle(group_id)?;
        let state = handle.state.lock();
        let messages = self.messages.read();
        let fetch = |id: &MessageId| -> Result<Message, StoreError> {
            messages
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::UnknownMessage(id.clone()))
        };
        let tip = state.change_log.len() as u64;
        let deltas = match cursor {
            Cursor::Tail { count } => {
                let start = state.order.len().saturating_sub(count);
                state.order[start..]
                    .iter()
                    .map(|id| Ok(Delta::Append { message: fetch(id)? }))
                    .collect::<Result<Vec<_>, StoreError>>()?
            }
            Cursor::Resume { index } => {
                let from = (index as usize).min(state.change_log.len());
                state.change_log[from..]
                    .iter()
                    .map(|entry| {
                        Ok(match entry {
                            ChangeEntry::Append { id } => Delta::Append { message: fetch(id)? },
                            ChangeEntry::Insert { id, after } => Delta::Insert {
                                message: fetch(id)?,
                                after: after.clone(),
                            },
                            ChangeEntry::Update { id } => Delta::Update { message: fetch(id)? },
                        })
                    })
                    .collect::<Result<Vec<_>, StoreError>>()?
            }
        };
        Ok((tip, deltas))
    }

    /// Open a blocking-pull subscription on a group. The returned
    /// [`Subscription`] yields delta batches as the change log grows; the
    /// [`SubscriptionHandle`] cancels it from anywhere.
    pub fn subscribe(
        self: &Arc<Self>,
        group_id: &str,
        cursor: Cursor,
    ) -> Result<(Subscription, SubscriptionHandle), StoreError> {
        let handle = self.handle(group_id)?;
        // Register for change notifications before the initial read so a
        // write racing the snapshot is never missed.
        let changes = handle.changes_tx.subscribe();
        let (cursor_now, primed) = self.read_delta(group_id, cursor)?;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let subscription = Subscription {
            store: Arc::clone(self),
            group_id: group_id.to_string(),
            cursor: cursor_now,
            pending: (!primed.is_empty()).then_some((cursor_now, primed)),
            changes,
            cancel: cancel_rx,
        };
        Ok((subscription, SubscriptionHandle { cancel: cancel_tx }))
    }

    // ── Recovery ────────────────────────────────────────────────────────

    /// Rebuild all in-memory state from durable storage. Order comes from
    /// replaying each group's change log from empty; a corrupt or dangling
    /// entry fails that group's recovery loudly.
    pub fn recover(&self) -> Result<RecoveryReport, StoreError> {
        let mut report = RecoveryReport::default();
        for group_id in self.log.list("groups")? {
            let corrupt = |detail: String| StoreError::CorruptLog {
                group: group_id.clone(),
                detail,
            };
            let snapshot = self
                .log
                .read(&format!("groups/{group_id}/snapshot"))?
                .ok_or_else(|| corrupt("missing snapshot".into()))?;
            let meta: GroupMeta = serde_json::from_slice(&snapshot)
                .map_err(|e| corrupt(format!("unreadable snapshot: {e}")))?;

            let mut loaded: HashMap<MessageId, Message> = HashMap::new();
            for record in self
                .log
                .read_records(&format!("groups/{group_id}/messages.log"))?
            {
                let msg: Message = serde_json::from_slice(&record)
                    .map_err(|e| corrupt(format!("unreadable message record: {e}")))?;
                // Later records are like-merged rewrites of earlier ones.
                loaded.insert(msg.message_id.clone(), msg);
            }

            let mut order: Vec<MessageId> = Vec::new();
            let mut change_log: Vec<ChangeEntry> = Vec::new();
            for record in self
                .log
                .read_records(&format!("groups/{group_id}/changes.log"))?
            {
                let entry: ChangeEntry = serde_json::from_slice(&record).map_err(|e| {
                    corrupt(format!(
                        "unreadable change entry {}: {e}",
                        change_log.len()
                    ))
                })?;
                match &entry {
                    ChangeEntry::Append { id } => {
                        if !loaded.contains_key(id) {
                            return Err(corrupt(format!("append of unknown message {id}")));
                        }
                        order.push(id.clone());
                    }
                    ChangeEntry::Insert { id, after } => {
                        if !loaded.contains_key(id) {
                            return Err(corrupt(format!("insert of unknown message {id}")));
                        }
                        let idx = match after {
                            Anchor::Head => 0,
                            Anchor::After { id: prev } => {
                                order
                                    .iter()
                                    .position(|x| x == prev)
                                    .ok_or_else(|| {
                                        corrupt(format!("insert anchor {prev} not in order"))
                                    })?
                                    + 1
                            }
                        };
                        order.insert(idx, id.clone());
                    }
                    ChangeEntry::Update { id } => {
                        if !loaded.contains_key(id) {
                            return Err(corrupt(format!("update of unknown message {id}")));
                        }
                    }
                }
                change_log.push(entry);
            }

            report.groups += 1;
            report.messages += loaded.len();
            self.messages.write().extend(loaded);
            let state = GroupState {
                group_id: group_id.clone(),
                creation_time: meta.creation_time,
                users: meta.users,
                order,
                change_log,
            };
            self.groups
                .lock()
                .insert(group_id.clone(), Arc::new(GroupHandle::new(state)));
            tracing::debug!(group = %group_id, "recovered group");
        }
        Ok(report)
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn handle(&self, group_id: &str) -> Result<Arc<GroupHandle>, StoreError> {
        self.groups
            .lock()
            .get(group_id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownGroup(group_id.to_string()))
    }

    /// First writer creates the group; everyone else gets the same handle.
    fn handle_or_create(
        &self,
        group_id: &str,
        creation_time: u64,
    ) -> Result<(Arc<GroupHandle>, bool), StoreError> {
        let mut groups = self.groups.lock();
        if let Some(handle) = groups.get(group_id) {
            return Ok((handle.clone(), false));
        }
        let state = GroupState {
            group_id: group_id.to_string(),
            creation_time,
            users: BTreeMap::new(),
            order: Vec::new(),
            change_log: Vec::new(),
        };
        self.write_snapshot(&state)?;
        let handle = Arc::new(GroupHandle::new(state));
        groups.insert(group_id.to_string(), handle.clone());
        tracing::debug!(group = %group_id, "group created");
        Ok((handle, true))
    }

    fn write_snapshot(&self, state: &GroupState) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&state.meta())?;
        self.log
            .put(&format!("groups/{}/snapshot", state.group_id), &bytes)?;
        Ok(())
    }

    fn append_message_blob(&self, group_id: &str, message: &Message) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(message)?;
        self.log
            .append(&format!("groups/{group_id}/messages.log"), &bytes)?;
        Ok(())
    }

    fn append_change_record(&self, group_id: &str, entry: &ChangeEntry) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(entry)?;
        self.log
            .append(&format!("groups/{group_id}/changes.log"), &bytes)?;
        Ok(())
    }
}

/// Fold a remote likes map into a local one. The target's author never
/// gains an entry, whoever sent it.
fn merge_like_map(
    likes: &mut BTreeMap<UserId, bool>,
    remote: &BTreeMap<UserId, bool>,
    author: &str,
) -> bool {
    let mut changed = false;
    for (user, &liked) in remote {
        if user == author {
            continue;
        }
        if likes.get(user) != Some(&liked) {
            likes.insert(user.clone(), liked);
            changed = true;
        }
    }
    changed
}

// ── Subscriptions ───────────────────────────────────────────────────────────

/// A blocking-pull delta stream over one group. Each subscription owns its
/// receiver; nothing is shared between subscribers.
pub struct Subscription {
    store: Arc<MessageStore>,
    group_id: GroupId,
    cursor: u64,
    pending: Option<(u64, Vec<Delta>)>,
    changes: watch::Receiver<u64>,
    cancel: watch::Receiver<bool>,
}

impl Subscription {
    /// Wait for the next batch of deltas. Returns `None` once cancelled.
    pub async fn next(&mut self) -> Option<(u64, Vec<Delta>)> {
        if let Some(batch) = self.pending.take() {
            return Some(batch);
        }
        loop {
            if *self.cancel.borrow() {
                return None;
            }
            let tip = *self.changes.borrow_and_update();
            if tip > self.cursor {
                match self
                    .store
                    .read_delta(&self.group_id, Cursor::Resume { index: self.cursor })
                {
                    Ok((cursor, deltas)) if !deltas.is_empty() => {
                        self.cursor = cursor;
                        return Some((cursor, deltas));
                    }
                    Ok((cursor, _)) => self.cursor = cursor,
                    Err(e) => {
                        tracing::warn!(group = %self.group_id, error = %e, "delta read failed; ending subscription");
                        return None;
                    }
                }
            }
            tokio::select! {
                changed = self.changes.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                cancelled = self.cancel.changed() => {
                    if cancelled.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }
}

/// Cancels its subscription when invoked — or when dropped.
#[derive(Debug)]
pub struct SubscriptionHandle {
    cancel: watch::Sender<bool>,
}

impl SubscriptionHandle {
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("unknown group: {0}")]
    UnknownGroup(String),
    #[error("unknown message: {0}")]
    UnknownMessage(String),
    #[error("corrupt change log for group {group}: {detail}")]
    CorruptLog { group: String, detail: String },
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}
