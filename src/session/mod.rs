//! Client sessions.
//!
//! A [`Session`] is pre-allocated by the pool and reused across
//! connections. Its pool-assigned id never changes; everything else is
//! per-connection state that is zeroed when the session goes back to the
//! free list.
//!
//! While a session is bound to a connection, its fields are written by the
//! session loop only (see [`actor`]). The pool touches them when binding a
//! fresh connection and after reclaiming, both under the pool lock and
//! never while a loop is running.

mod actor;
mod handle;
mod telemetry;

pub use handle::{SessionHandle, SessionLease, Transport};
pub use telemetry::Telemetry;

use crate::backend::Uplink;
use crate::crypto::{CipherPair, SessionFlags, SessionKey};
use chrono::{DateTime, Utc};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Pool-assigned session identifier.
pub type SessionId = u64;

/// Error returned when a session can no longer take messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// The session's loop or binding is gone.
    Closed,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Closed => write!(f, "Session closed"),
        }
    }
}

impl std::error::Error for SessionError {}

/// Settings shared by every session loop of one pool.
pub(crate) struct SessionContext {
    pub gate_id: u32,
    pub key: SessionKey,
    pub uplink: Uplink,
    /// Per-minute packet limit, 0 for none.
    pub max_packets_per_minute: u32,
}

/// Per-connection state of a session.
#[derive(Debug, Default)]
pub struct SessionState {
    /// Incremented on every acquisition. Guards against stale handles.
    generation: u64,
    pub ip: Option<IpAddr>,
    /// Backend-assigned user id, 0 until bound.
    pub user_id: i64,
    /// Game server serving this user, 0 until bound.
    pub game_id: u32,
    pub flags: SessionFlags,
    /// Present only while the session loop runs.
    pub ciphers: Option<CipherPair>,
    pub telemetry: Telemetry,
}

impl SessionState {
    /// Zero every per-connection field, keeping the generation.
    fn clear(&mut self) {
        *self = SessionState {
            generation: self.generation,
            ..SessionState::default()
        };
    }
}

/// A pooled session.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    active: AtomicBool,
    state: Mutex<SessionState>,
}

impl Session {
    pub(crate) fn new(id: SessionId) -> Self {
        Self {
            id,
            active: AtomicBool::new(false),
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Whether the session is bound to a live connection.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind the session to a new connection. Returns the new generation.
    pub(crate) fn activate(&self, ip: IpAddr, now: DateTime<Utc>) -> u64 {
        let mut state = self.lock();
        state.clear();
        state.generation += 1;
        state.ip = Some(ip);
        state.telemetry = Telemetry::connected(now);
        self.active.store(true, Ordering::Release);
        state.generation
    }

    /// Clear the activity flag if `generation` is still current.
    ///
    /// Returns `true` if this call changed the flag.
    pub(crate) fn deactivate(&self, generation: u64) -> bool {
        let state = self.lock();
        if state.generation != generation {
            return false;
        }
        self.active.swap(false, Ordering::AcqRel)
    }

    /// Drop connection state on behalf of the session loop.
    ///
    /// Only acts if `generation` is still current. Returns the user id that
    /// was bound, if any.
    pub(crate) fn release(&self, generation: u64) -> Option<i64> {
        let mut state = self.lock();
        if state.generation != generation {
            return None;
        }
        let user_id = state.user_id;
        state.clear();
        self.active.store(false, Ordering::Release);
        Some(user_id)
    }

    /// Zero every per-connection field. The id is kept.
    pub(crate) fn reset(&self) {
        let mut state = self.lock();
        state.clear();
        self.active.store(false, Ordering::Release);
    }

    /// Point-in-time view of the session.
    #[cfg(test)]
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.lock();
        SessionSnapshot {
            id: self.id,
            active: self.is_active(),
            ip: state.ip,
            user_id: state.user_id,
            game_id: state.game_id,
            flags: state.flags,
            encrypted: state.ciphers.is_some(),
            telemetry: state.telemetry.clone(),
        }
    }
}

/// Copy of a session's observable state.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub active: bool,
    pub ip: Option<IpAddr>,
    pub user_id: i64,
    pub game_id: u32,
    pub flags: SessionFlags,
    pub encrypted: bool,
    pub telemetry: Telemetry,
}

#[cfg(test)]
impl SessionSnapshot {
    /// Snapshot of a session holding no connection.
    pub fn idle(id: SessionId) -> Self {
        Self {
            id,
            active: false,
            ip: None,
            user_id: 0,
            game_id: 0,
            flags: SessionFlags::default(),
            encrypted: false,
            telemetry: Telemetry::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))
    }

    #[test]
    fn test_new_session_is_idle() {
        let session = Session::new(12);
        assert_eq!(session.snapshot(), SessionSnapshot::idle(12));
    }

    #[test]
    fn test_activate_and_reset() {
        let session = Session::new(3);
        let generation = session.activate(ip(), Utc::now());
        assert_eq!(generation, 1);
        assert!(session.is_active());

        {
            let mut state = session.lock();
            state.user_id = 99;
            state.game_id = 2;
            state.flags.set(SessionFlags::AUTHORIZED);
            state.telemetry.record_packet(Utc::now());
        }

        session.reset();
        assert_eq!(session.snapshot(), SessionSnapshot::idle(3));
    }

    #[test]
    fn test_stale_generation_is_ignored() {
        let session = Session::new(0);
        let first = session.activate(ip(), Utc::now());
        session.reset();
        let second = session.activate(ip(), Utc::now());
        assert_ne!(first, second);

        assert!(!session.deactivate(first));
        assert_eq!(session.release(first), None);
        assert!(session.is_active());

        assert!(session.deactivate(second));
        assert!(!session.is_active());
        // Already cleared
        assert!(!session.deactivate(second));
    }

    #[test]
    fn test_release_returns_user() {
        let session = Session::new(0);
        let generation = session.activate(ip(), Utc::now());
        session.lock().user_id = 42;

        assert_eq!(session.release(generation), Some(42));
        assert!(!session.is_active());
        assert_eq!(session.snapshot(), SessionSnapshot::idle(0));
    }
}
