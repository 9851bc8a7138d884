//! Per-connection worker.
//!
//! A session moves through `Starting -> Registered -> Running -> Draining ->
//! Terminated`. Registration is refused while the registry is resetting or
//! closed, in which case the connection is closed straight away. Once
//! registered, a [`Registration`] guard owns the cleanup: whichever way the
//! run loop ends, dropping the guard closes the stream and unregisters the
//! session.

use std::io::{self, BufReader};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::CommandInterpreter;
use crate::gate::{Checkpoint, PauseGate};
use crate::registry::{SessionId, SessionRegistry};
use crate::transport;

/// Why a session's run loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Registration was refused.
    Rejected,
    /// The client closed its side of the connection.
    Disconnected,
    /// The session was cancelled at its checkpoint.
    Cancelled,
}

/// Shared pieces every session needs.
#[derive(Clone)]
pub struct SessionContext {
    pub interpreter: Arc<CommandInterpreter>,
    pub gate: Arc<PauseGate>,
    pub registry: Arc<SessionRegistry>,
}

pub struct ClientSession {
    id: SessionId,
    peer: SocketAddr,
    stream: TcpStream,
    context: SessionContext,
}

/// Scoped cleanup for a registered session.
struct Registration<'a> {
    id: SessionId,
    stream: &'a TcpStream,
    registry: &'a SessionRegistry,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        transport::close_stream(self.stream);
        self.registry.unregister(self.id);
    }
}

impl ClientSession {
    pub fn new(stream: TcpStream, peer: SocketAddr, context: SessionContext) -> Self {
        let id = context.registry.next_id();
        Self {
            id,
            peer,
            stream,
            context,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Runs the session on its own named thread.
    pub fn spawn(self) -> io::Result<thread::JoinHandle<SessionEnd>> {
        thread::Builder::new()
            .name(format!("session-{}", self.id))
            .spawn(move || self.run())
    }

    /// Runs the session to completion on the calling thread.
    pub fn run(self) -> SessionEnd {
        let Some((cancel, _registration)) = self.register() else {
            debug!(session = self.id, peer = %self.peer, "server not admitting sessions");
            transport::close_stream(&self.stream);
            return SessionEnd::Rejected;
        };
        info!(session = self.id, peer = %self.peer, "session registered");

        let end = match self.serve(&cancel) {
            Ok(end) => end,
            Err(_) if cancel.is_cancelled() => SessionEnd::Cancelled,
            Err(err) => {
                warn!(session = self.id, peer = %self.peer, error = ?err, "session transport failed");
                SessionEnd::Disconnected
            }
        };
        info!(session = self.id, peer = %self.peer, ?end, "session finished");
        end
    }

    fn register(&self) -> Option<(CancellationToken, Registration<'_>)> {
        let handle = match self.stream.try_clone() {
            Ok(handle) => handle,
            Err(err) => {
                warn!(session = self.id, error = ?err, "failed to clone session stream");
                return None;
            }
        };
        let cancel = self.context.registry.register(self.id, handle)?;
        let registration = Registration {
            id: self.id,
            stream: &self.stream,
            registry: &self.context.registry,
        };
        Some((cancel, registration))
    }

    /// Read, wait at the checkpoint, interpret, respond; until the client
    /// leaves or the session is cancelled.
    fn serve(&self, cancel: &CancellationToken) -> io::Result<SessionEnd> {
        let mut reader = BufReader::new(&self.stream);
        let mut writer = &self.stream;
        loop {
            if cancel.is_cancelled() {
                return Ok(SessionEnd::Cancelled);
            }
            let Some(frame) = transport::read_next_command(&mut reader)? else {
                return Ok(if cancel.is_cancelled() {
                    SessionEnd::Cancelled
                } else {
                    SessionEnd::Disconnected
                });
            };
            if self.context.gate.wait_if_paused(cancel) == Checkpoint::Cancelled {
                return Ok(SessionEnd::Cancelled);
            }

            let response = self.context.interpreter.interpret_frame(&frame, cancel);
            debug!(session = self.id, command = ?frame, %response, "command served");
            transport::write_response(&mut writer, &response)?;
        }
    }
}
