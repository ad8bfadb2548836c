//! Handles to a session bound to one connection.
//!
//! Every acquisition creates a fresh binding: three inbound channels, a die
//! signal and at most one loop task. Handles of an old binding keep working
//! as far as Rust is concerned but can no longer reach the session once it
//! has been reclaimed.

use super::actor::{self, Inbox};
use super::{Session, SessionContext, SessionError, SessionId};
use crate::backend::Downlink;
use crate::constants::{BACKEND_QUEUE_DEPTH, CLIENT_QUEUE_DEPTH, REPLY_QUEUE_DEPTH};
use crate::task::spawn_contained;
use bytes::Bytes;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

/// Write side of a client connection.
pub type Transport = Box<dyn AsyncWrite + Send + Unpin>;

/// Channels and loop task of one acquisition.
struct Binding {
    client: mpsc::Sender<Bytes>,
    replies: mpsc::Sender<Bytes>,
    backend: mpsc::Sender<Downlink>,
    die: watch::Sender<bool>,
    /// Receiving ends, handed to the loop on start.
    inbox: Mutex<Option<Inbox>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable handle to a bound session.
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<Session>,
    generation: u64,
    binding: Arc<Binding>,
    ctx: Arc<SessionContext>,
}

impl SessionHandle {
    pub(crate) fn bind(
        session: Arc<Session>,
        generation: u64,
        ctx: Arc<SessionContext>,
        transport: Transport,
    ) -> Self {
        let (client_tx, client_rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_QUEUE_DEPTH);
        let (backend_tx, backend_rx) = mpsc::channel(BACKEND_QUEUE_DEPTH);
        let (die_tx, die_rx) = watch::channel(false);

        let inbox = Inbox {
            client: client_rx,
            replies: reply_rx,
            backend: backend_rx,
            die: DieSignal { rx: die_rx },
            transport,
        };

        Self {
            session,
            generation,
            binding: Arc::new(Binding {
                client: client_tx,
                replies: reply_tx,
                backend: backend_tx,
                die: die_tx,
                inbox: Mutex::new(Some(inbox)),
                task: Mutex::new(None),
            }),
            ctx,
        }
    }

    pub fn id(&self) -> SessionId {
        self.session.id()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Launch the session loop for this binding.
    ///
    /// Only the first call spawns a loop; later calls return `false` and do
    /// nothing. Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let Some(inbox) = lock(&self.binding.inbox).take() else {
            debug!(session_id = self.id(), "Session loop already started");
            return false;
        };

        let handle = self.clone();
        let task = spawn_contained("session", actor::run(self.clone(), inbox), move || {
            handle.signal_die();
            handle.session.release(handle.generation);
        });
        *lock(&self.binding.task) = Some(task);
        true
    }

    /// Whether no loop is running for this binding.
    ///
    /// True once the loop has exited, and for a binding whose loop was
    /// never started.
    pub(crate) fn is_finished(&self) -> bool {
        let task = lock(&self.binding.task);
        match task.as_ref() {
            Some(task) => task.is_finished(),
            None => lock(&self.binding.inbox).is_some(),
        }
    }

    /// Ask the session to shut down.
    ///
    /// Clears the activity flag immediately and wakes the loop and the
    /// connection handler. Never blocks; repeated calls are harmless.
    pub fn signal_die(&self) {
        self.session.deactivate(self.generation);
        self.binding.die.send_replace(true);
    }

    /// Whether die has been signalled for this binding.
    pub fn is_dying(&self) -> bool {
        *self.binding.die.borrow()
    }

    /// Subscribe to the die signal.
    pub fn die_signal(&self) -> DieSignal {
        DieSignal {
            rx: self.binding.die.subscribe(),
        }
    }

    /// Queue a payload read from the client.
    pub async fn deliver(&self, payload: Bytes) -> Result<(), SessionError> {
        self.binding
            .client
            .send(payload)
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Queue a reply for the client.
    #[allow(dead_code)] // Will be used when the backend downlink is wired in
    pub async fn reply(&self, payload: Bytes) -> Result<(), SessionError> {
        self.binding
            .replies
            .send(payload)
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Queue a command from the backend.
    pub async fn send_backend(&self, command: Downlink) -> Result<(), SessionError> {
        self.binding
            .backend
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }
}

/// Receiver side of a session's die signal.
pub struct DieSignal {
    rx: watch::Receiver<bool>,
}

impl DieSignal {
    /// Wait until die is signalled or the binding is dropped.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|dead| *dead).await;
    }
}

/// A session held by a connection handler.
///
/// Dropping the lease signals die, so the session learns about the end of
/// its connection right away. Moving it back to the free list is still left
/// to the reclamation sweep.
pub struct SessionLease {
    handle: SessionHandle,
}

impl SessionLease {
    pub(crate) fn new(handle: SessionHandle) -> Self {
        Self { handle }
    }
}

impl Deref for SessionLease {
    type Target = SessionHandle;

    fn deref(&self) -> &SessionHandle {
        &self.handle
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if !self.handle.is_dying() {
            self.handle.signal_die();
        }
    }
}
