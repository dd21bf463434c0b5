//! Client sessions as an explicit state machine.
//!
//! A connection moves `Connected → LoggedIn → InGroup` and only ever
//! backs out in reverse order. The table validates transitions and hands
//! the caller everything a step tears down (the group being left, the
//! subscription to cancel) so the side effects happen exactly once, in
//! order, outside any lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::proto::{GroupId, UserId};
use crate::store::SubscriptionHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    Connected,
    LoggedIn { user_id: UserId },
    InGroup { user_id: UserId, group_id: GroupId },
}

struct Session {
    remote: String,
    phase: SessionPhase,
    subscription: Option<SubscriptionHandle>,
}

/// What leaving a group tears down. Dropping the handle cancels the
/// subscription, but callers cancel explicitly so the order is theirs.
#[derive(Debug)]
pub struct LeaveTransition {
    pub user_id: UserId,
    pub group_id: GroupId,
    pub subscription: Option<SubscriptionHandle>,
}

/// Result of a join: who joined, plus the group that was implicitly left
/// when the session was already in one.
#[derive(Debug)]
pub struct JoinTransition {
    pub user_id: UserId,
    pub left: Option<LeaveTransition>,
}

/// Result of closing a session: whatever teardown is still owed.
#[derive(Debug)]
pub struct CloseTransition {
    pub remote: String,
    pub left: Option<LeaveTransition>,
}

#[derive(Default)]
pub struct SessionTable {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<u64, Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, remote: &str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.sessions.lock().insert(
            id,
            Session {
                remote: remote.to_string(),
                phase: SessionPhase::Connected,
                subscription: None,
            },
        );
        id
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn phase(&self, id: u64) -> Result<SessionPhase, SessionError> {
        self.sessions
            .lock()
            .get(&id)
            .map(|s| s.phase.clone())
            .ok_or(SessionError::UnknownSession)
    }

    pub fn login(&self, id: u64, user_id: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(&id).ok_or(SessionError::UnknownSession)?;
        match &session.phase {
            SessionPhase::Connected => {
                session.phase = SessionPhase::LoggedIn { user_id: user_id.to_string() };
                Ok(())
            }
            _ => Err(SessionError::AlreadyLoggedIn),
        }
    }

    /// Move to `InGroup`. A session already in a group leaves it first;
    /// the implicit leave comes back in the transition for the caller to
    /// act on before announcing the join.
    pub fn join(&self, id: u64, group_id: &str) -> Result<JoinTransition, SessionError> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(&id).ok_or(SessionError::UnknownSession)?;
        let (user_id, left) = match &session.phase {
            SessionPhase::Connected => return Err(SessionError::NotLoggedIn),
            SessionPhase::LoggedIn { user_id } => (user_id.clone(), None),
            SessionPhase::InGroup { user_id, group_id: current } => {
                let left = LeaveTransition {
                    user_id: user_id.clone(),
                    group_id: current.clone(),
                    subscription: session.subscription.take(),
                };
                (user_id.clone(), Some(left))
            }
        };
        session.phase = SessionPhase::InGroup {
            user_id: user_id.clone(),
            group_id: group_id.to_string(),
        };
        Ok(JoinTransition { user_id, left })
    }

    pub fn leave(&self, id: u64) -> Result<LeaveTransition, SessionError> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(&id).ok_or(SessionError::UnknownSession)?;
        match &session.phase {
            SessionPhase::Connected => Err(SessionError::NotLoggedIn),
            SessionPhase::LoggedIn { .. } => Err(SessionError::NotInGroup),
            SessionPhase::InGroup { user_id, group_id } => {
                let transition = LeaveTransition {
                    user_id: user_id.clone(),
                    group_id: group_id.clone(),
                    subscription: session.subscription.take(),
                };
                session.phase = SessionPhase::LoggedIn { user_id: transition.user_id.clone() };
                Ok(transition)
            }
        }
    }

    /// The user and group a message-level request acts on.
    pub fn current(&self, id: u64) -> Result<(UserId, GroupId), SessionError> {
        match self.phase(id)? {
            SessionPhase::Connected => Err(SessionError::NotLoggedIn),
            SessionPhase::LoggedIn { .. } => Err(SessionError::NotInGroup),
            SessionPhase::InGroup { user_id, group_id } => Ok((user_id, group_id)),
        }
    }

    /// Attach a subscription to an in-group session, returning the
    /// previous one so the caller can cancel it.
    pub fn set_subscription(
        &self,
        id: u64,
        handle: SubscriptionHandle,
    ) -> Result<Option<SubscriptionHandle>, SessionError> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(&id).ok_or(SessionError::UnknownSession)?;
        if !matches!(session.phase, SessionPhase::InGroup { .. }) {
            return Err(SessionError::NotInGroup);
        }
        Ok(session.subscription.replace(handle))
    }

    /// Remove the session, reporting any leave still owed. Closing an
    /// unknown (already closed) session is a no-op.
    pub fn close(&self, id: u64) -> Option<CloseTransition> {
        let mut session = self.sessions.lock().remove(&id)?;
        let left = match session.phase {
            SessionPhase::InGroup { user_id, group_id } => Some(LeaveTransition {
                user_id,
                group_id,
                subscription: session.subscription.take(),
            }),
            _ => None,
        };
        Some(CloseTransition {
            remote: session.remote,
            left,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("unknown session")]
    UnknownSession,
    #[error("already logged in")]
    AlreadyLoggedIn,
    #[error("not logged in")]
    NotLoggedIn,
    #[error("not in a group")]
    NotInGroup,
}
