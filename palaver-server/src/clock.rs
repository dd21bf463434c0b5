//! Vector clocks for causal ordering of chat events.
//!
//! Every replica keeps one vector clock: a map of server id → counter.
//! Local events advance our own component; events received from peers merge
//! their vector in (componentwise max) and then advance our component as
//! well. Advancing on passive receives inflates counters faster than the
//! textbook rule, but comparison only depends on the componentwise order,
//! so causal precedence and concurrency detection are unaffected. This is
//! the system's observed behavior and is kept as-is.
//!
//! The clock is checkpointed to durable storage on every advance so a
//! restarted replica never re-issues an old timestamp.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::proto::ServerId;
use crate::storage::DurableLog;

/// Blob path for the persisted clock.
const CLOCK_BLOB: &str = "clock";

/// Causal relation between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    /// Left happened strictly before right.
    Before,
    /// Left happened strictly after right.
    After,
    /// Neither dominates (includes identical clocks).
    Concurrent,
}

/// A vector clock: server id → event counter. Missing components are zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<ServerId, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> u64 {
        self.0.get(id).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Increment this clock's component for `id`, returning the new value.
    pub fn advance(&mut self, id: &str) -> u64 {
        let counter = self.0.entry(id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Componentwise max with `other`.
    pub fn merge_from(&mut self, other: &VectorClock) {
        for (id, &counter) in &other.0 {
            let own = self.0.entry(id.clone()).or_insert(0);
            if counter > *own {
                *own = counter;
            }
        }
    }

    /// Causal relation with `other`, computed over the union of components.
    pub fn causality(&self, other: &VectorClock) -> Causality {
        let mut any_less = false;
        let mut any_greater = false;
        for id in self.0.keys().chain(other.0.keys()) {
            let a = self.get(id);
            let b = other.get(id);
            if a < b {
                any_less = true;
            } else if a > b {
                any_greater = true;
            }
        }
        match (any_less, any_greater) {
            (true, false) => Causality::Before,
            (false, true) => Causality::After,
            _ => Causality::Concurrent,
        }
    }

    /// True if every component of `other` is ≤ ours and at least one is
    /// strictly less.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        self.causality(other) == Causality::After
    }
}

/// The replica's own clock, serialized behind one mutex so local advances
/// form a total order, with a durable checkpoint per advance.
pub struct ClockTracker {
    id: ServerId,
    clock: Mutex<VectorClock>,
    log: Arc<dyn DurableLog>,
}

impl ClockTracker {
    /// Open the tracker, restoring any persisted clock.
    pub fn open(id: impl Into<ServerId>, log: Arc<dyn DurableLog>) -> io::Result<Self> {
        let clock = match log.read(CLOCK_BLOB)? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(io::Error::other)?,
            None => VectorClock::new(),
        };
        Ok(Self {
            id: id.into(),
            clock: Mutex::new(clock),
            log,
        })
    }

    pub fn server_id(&self) -> &str {
        &self.id
    }

    /// Stamp a locally-originated event: advance our component and return
    /// the resulting clock.
    pub fn tag(&self) -> io::Result<VectorClock> {
        let mut clock = self.clock.lock();
        clock.advance(&self.id);
        self.persist(&clock)?;
        Ok(clock.clone())
    }

    /// Fold a remote vector in (componentwise max), then advance our own
    /// component. Called for every applied remote event.
    pub fn merge(&self, remote: &VectorClock) -> io::Result<VectorClock> {
        let mut clock = self.clock.lock();
        clock.merge_from(remote);
        clock.advance(&self.id);
        self.persist(&clock)?;
        Ok(clock.clone())
    }

    pub fn snapshot(&self) -> VectorClock {
        self.clock.lock().clone()
    }

    fn persist(&self, clock: &VectorClock) -> io::Result<()> {
        let bytes = serde_json::to_vec(clock).map_err(io::Error::other)?;
        self.log.put(CLOCK_BLOB, &bytes)
    }
}
