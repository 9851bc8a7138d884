use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::gate::PauseGate;
use crate::transport;

pub type SessionId = u64;

/// Whether new sessions may register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Open,
    /// A mass cancellation is in progress; `reopen` with the matching
    /// generation turns admission back on.
    Resetting,
    /// The server is shutting down. Never reopens.
    Closed,
}

struct SessionHandle {
    cancel: CancellationToken,
    stream: TcpStream,
}

struct RegistryState {
    sessions: HashMap<SessionId, SessionHandle>,
    admission: Admission,
    generation: u64,
}

/// Tracks every live session so they can be cancelled together and so
/// shutdown can wait for all of them to finish.
///
/// One mutex guards the session map, the admission state and the generation
/// counter; every critical section is a constant-time map or flag edit. The
/// live count is the map's size, and `drained` is signalled whenever it
/// drops to zero.
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
    drained: Condvar,
    gate: Arc<PauseGate>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new(gate: Arc<PauseGate>) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                sessions: HashMap::new(),
                admission: Admission::Open,
                generation: 0,
            }),
            drained: Condvar::new(),
            gate,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Adds a session and returns the token it must poll at its checkpoint.
    ///
    /// `stream` is a second handle to the session's connection; cancelling
    /// shuts it down to unblock a pending read. Returns `None` without
    /// registering while admission is not open.
    pub fn register(&self, id: SessionId, stream: TcpStream) -> Option<CancellationToken> {
        let mut state = self.state.lock();
        if state.admission != Admission::Open {
            return None;
        }
        let cancel = CancellationToken::new();
        state.sessions.insert(
            id,
            SessionHandle {
                cancel: cancel.clone(),
                stream,
            },
        );
        Some(cancel)
    }

    /// Removes a session, waking drain waiters when it was the last one.
    pub fn unregister(&self, id: SessionId) {
        let mut state = self.state.lock();
        if state.sessions.remove(&id).is_some() && state.sessions.is_empty() {
            self.drained.notify_all();
        }
    }

    /// Stops admission and cancels every registered session.
    ///
    /// Returns the generation of this reset; pass it to [`reopen`] to accept
    /// sessions again.
    ///
    /// [`reopen`]: SessionRegistry::reopen
    pub fn cancel_all(&self) -> u64 {
        self.cancel_with(Admission::Resetting)
    }

    /// Reopens admission after the reset identified by `generation`.
    ///
    /// Ignored when another reset or a shutdown has happened since; returns
    /// whether admission is open afterwards.
    pub fn reopen(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.admission == Admission::Resetting && state.generation == generation {
            state.admission = Admission::Open;
        }
        state.admission == Admission::Open
    }

    /// Permanently stops admission and cancels every registered session.
    pub fn close(&self) {
        self.cancel_with(Admission::Closed);
    }

    fn cancel_with(&self, admission: Admission) -> u64 {
        let generation = {
            let mut state = self.state.lock();
            if state.admission != Admission::Closed {
                state.admission = admission;
            }
            state.generation += 1;
            for handle in state.sessions.values() {
                handle.cancel.cancel();
                transport::close_stream(&handle.stream);
            }
            info!(
                sessions = state.sessions.len(),
                generation = state.generation,
                "cancelling all sessions"
            );
            state.generation
        };
        // Sessions parked at the pause checkpoint need a nudge to see their token.
        self.gate.wake_all();
        generation
    }

    /// Blocks until no session is registered.
    pub fn wait_for_drain(&self) {
        let mut state = self.state.lock();
        while !state.sessions.is_empty() {
            self.drained.wait(&mut state);
        }
    }

    /// Like [`wait_for_drain`], giving up after `timeout`. Returns whether
    /// the registry drained.
    ///
    /// [`wait_for_drain`]: SessionRegistry::wait_for_drain
    pub fn wait_for_drain_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.sessions.is_empty() {
            if self.drained.wait_until(&mut state, deadline).timed_out() {
                return state.sessions.is_empty();
            }
        }
        true
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn is_accepting(&self) -> bool {
        self.state.lock().admission == Admission::Open
    }
}
