//! Fixed-capacity session pool.
//!
//! All sessions are allocated up front and live for the whole process.
//! Each one sits in either the free list or the working list:
//!
//! - `acquire` moves the front free session to the back of the working
//!   list and binds it to a connection.
//! - `sweep` walks the working list and moves every session that is no
//!   longer bound to a live connection back to the free list, zeroing it.
//!
//! One mutex guards both lists and every slot. Acquisition and the sweep
//! hold it for their whole critical section, reset included.

mod slots;

pub use slots::Partition;

use crate::backend::{Downlink, Uplink};
use crate::crypto::SessionKey;
use crate::session::{
    Session, SessionContext, SessionError, SessionHandle, SessionId, SessionLease, Transport,
};
use chrono::Utc;
use slab::Slab;
use slots::Partitions;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Pool settings.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Gateway id, used to derive globally unique session ids.
    pub gate_id: u32,
    /// Number of sessions, the hard limit on concurrent connections.
    pub capacity: usize,
    /// Per-minute packet limit per session, 0 for none.
    pub max_packets_per_minute: u32,
}

/// Pool errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Every session is bound to a connection.
    Exhausted { capacity: usize },
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Exhausted { capacity } => {
                write!(f, "Session pool exhausted ({} sessions in use)", capacity)
            }
        }
    }
}

impl std::error::Error for PoolError {}

/// Pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub free: usize,
    pub working: usize,
}

struct Slot {
    session: Arc<Session>,
    /// Binding of the current acquisition, only while working.
    handle: Option<SessionHandle>,
}

struct PoolInner {
    slots: Slab<Slot>,
    lists: Partitions,
}

/// The session pool.
pub struct SessionPool {
    gate_id: u32,
    capacity: usize,
    /// Id of slot 0; ids are contiguous from here.
    base_id: SessionId,
    ctx: Arc<SessionContext>,
    inner: Mutex<PoolInner>,
}

impl SessionPool {
    /// Allocate every session of the pool.
    pub fn new(config: PoolConfig, key: SessionKey, uplink: Uplink) -> Arc<Self> {
        let base_id = config.gate_id as SessionId * config.capacity as SessionId;

        let mut slots = Slab::with_capacity(config.capacity);
        for i in 0..config.capacity {
            let key = slots.insert(Slot {
                session: Arc::new(Session::new(base_id + i as SessionId)),
                handle: None,
            });
            debug_assert_eq!(key, i);
        }

        info!(
            gate_id = config.gate_id,
            capacity = config.capacity,
            first_id = base_id,
            "Session pool allocated"
        );

        Arc::new(Self {
            gate_id: config.gate_id,
            capacity: config.capacity,
            base_id,
            ctx: Arc::new(SessionContext {
                gate_id: config.gate_id,
                key,
                uplink,
                max_packets_per_minute: config.max_packets_per_minute,
            }),
            inner: Mutex::new(PoolInner {
                slots,
                lists: Partitions::new(config.capacity),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn gate_id(&self) -> u32 {
        self.gate_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take a free session and bind it to a connection.
    ///
    /// Returns [`PoolError::Exhausted`] immediately when no session is
    /// free; the caller should drop the connection.
    pub fn acquire(&self, ip: IpAddr, transport: Transport) -> Result<SessionLease, PoolError> {
        let mut inner = self.lock();
        let PoolInner { slots, lists } = &mut *inner;

        let Some(idx) = lists.take_front(Partition::Free, Partition::Working) else {
            warn!(gate_id = self.gate_id, capacity = self.capacity, "Gateway is full");
            return Err(PoolError::Exhausted {
                capacity: self.capacity,
            });
        };

        let slot = &mut slots[idx];
        let generation = slot.session.activate(ip, Utc::now());
        let handle = SessionHandle::bind(
            Arc::clone(&slot.session),
            generation,
            Arc::clone(&self.ctx),
            transport,
        );
        slot.handle = Some(handle.clone());

        debug!(session_id = handle.id(), ip = %ip, "Session acquired");
        Ok(SessionLease::new(handle))
    }

    /// Return every session that is no longer bound to a live connection to
    /// the free list.
    ///
    /// A working session is reclaimed once its activity flag is clear and
    /// no loop runs for it. Returns the number of sessions reclaimed.
    pub fn sweep(&self) -> usize {
        let mut inner = self.lock();
        let PoolInner { slots, lists } = &mut *inner;

        let mut reclaimed = 0;
        let mut cursor = lists.front(Partition::Working);
        while let Some(idx) = cursor {
            cursor = lists.next(idx);

            let slot = &mut slots[idx];
            let idle = !slot.session.is_active()
                && slot.handle.as_ref().map_or(true, |h| h.is_finished());
            if !idle {
                continue;
            }

            lists.move_to_back(idx, Partition::Free);
            slot.handle = None;
            slot.session.reset();
            reclaimed += 1;
        }

        if reclaimed > 0 {
            debug!(
                reclaimed,
                free = lists.len(Partition::Free),
                working = lists.len(Partition::Working),
                "Reclaimed sessions"
            );
        }
        reclaimed
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.lock();
        PoolStats {
            capacity: self.capacity,
            free: inner.lists.len(Partition::Free),
            working: inner.lists.len(Partition::Working),
        }
    }

    fn slot_index(&self, id: SessionId) -> Option<usize> {
        let idx = id.checked_sub(self.base_id)? as usize;
        (idx < self.capacity).then_some(idx)
    }

    /// Look up any session of the pool by id.
    #[allow(dead_code)] // Will be used when the backend downlink is wired in
    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        let idx = self.slot_index(id)?;
        self.lock().slots.get(idx).map(|slot| Arc::clone(&slot.session))
    }

    fn working_handle(&self, id: SessionId) -> Option<SessionHandle> {
        let idx = self.slot_index(id)?;
        self.lock().slots.get(idx)?.handle.clone()
    }

    /// Deliver a backend command to a working session.
    #[allow(dead_code)] // Will be used when the backend downlink is wired in
    pub async fn route(&self, id: SessionId, command: Downlink) -> Result<(), SessionError> {
        let handle = self.working_handle(id).ok_or(SessionError::Closed)?;
        handle.send_backend(command).await
    }
}

/// Run reclamation sweeps every `interval` until `shutdown` turns true.
pub async fn run_reclaimer(
    pool: Arc<SessionPool>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately; sweeps start one interval in.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reclaimed = pool.sweep();
                let stats = pool.stats();
                debug!(
                    reclaimed,
                    capacity = stats.capacity,
                    free = stats.free,
                    working = stats.working,
                    "Reclamation sweep"
                );
            }
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
    }

    debug!("Reclaimer stopped");
}
