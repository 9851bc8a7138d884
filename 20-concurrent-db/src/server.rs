//! Server wiring, operator console and shutdown sequencing.
//!
//! ```text
//! listener thread --accept--> session thread (one per connection)
//!                                  |  read line
//!                                  |  PauseGate checkpoint
//!                                  |  CommandInterpreter -> OrderedStore
//!                                  v  write response
//! interrupt monitor --cancel_all/reopen--> SessionRegistry
//! operator console  --pause/resume/print, shutdown--> PauseGate, SessionRegistry, OrderedStore
//! ```

use std::fs::File;
use std::io::{self, BufRead, BufWriter, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::raw::c_int;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use signal_hook::consts::SIGINT;
use tracing::{info, warn};

use crate::command::CommandInterpreter;
use crate::console::OperatorCommand;
use crate::gate::PauseGate;
use crate::interrupt::InterruptMonitor;
use crate::registry::SessionRegistry;
use crate::session::{ClientSession, SessionContext};
use crate::store::OrderedStore;
use crate::transport::{self, ListenerHandle};

/// What the shutdown sequence tore down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub entries_destroyed: usize,
}

pub struct Server {
    store: Arc<OrderedStore>,
    gate: Arc<PauseGate>,
    registry: Arc<SessionRegistry>,
    listener: ListenerHandle,
    monitor: Option<InterruptMonitor>,
}

impl Server {
    /// Creates the store and session machinery and starts listening on
    /// `addr`. No interrupt monitor is installed; see
    /// [`Server::with_interrupt_monitor`].
    pub fn start(addr: SocketAddr) -> Result<Self> {
        let store = Arc::new(OrderedStore::new());
        let gate = Arc::new(PauseGate::new());
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&gate)));
        let context = SessionContext {
            interpreter: Arc::new(CommandInterpreter::new(Arc::clone(&store))),
            gate: Arc::clone(&gate),
            registry: Arc::clone(&registry),
        };

        let listener = transport::start_listener(addr, move |stream, peer| {
            spawn_session(stream, peer, &context);
        })
        .with_context(|| format!("failed to listen on {addr}"))?;

        Ok(Self {
            store,
            gate,
            registry,
            listener,
            monitor: None,
        })
    }

    /// Resets all sessions whenever the process receives `SIGINT`.
    pub fn with_interrupt_monitor(self) -> Result<Self> {
        self.with_interrupt_signals(&[SIGINT])
    }

    /// Like [`Server::with_interrupt_monitor`], for an arbitrary signal set.
    pub fn with_interrupt_signals(mut self, signals: &[c_int]) -> Result<Self> {
        let monitor = InterruptMonitor::spawn(Arc::clone(&self.registry), signals)
            .context("failed to install interrupt handler")?;
        self.monitor = Some(monitor);
        Ok(self)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn store(&self) -> &OrderedStore {
        &self.store
    }

    pub fn gate(&self) -> &PauseGate {
        &self.gate
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn apply(&self, command: OperatorCommand) -> Result<()> {
        match command {
            OperatorCommand::Pause => {
                self.gate.stop();
                info!("sessions paused");
            }
            OperatorCommand::Resume => {
                self.gate.resume();
                info!("sessions resumed");
            }
            OperatorCommand::Print { path } => self.print_store(path.as_deref())?,
        }
        Ok(())
    }

    fn print_store(&self, path: Option<&Path>) -> Result<()> {
        match path {
            None => {
                let mut out = io::stdout().lock();
                self.store.dump(&mut out)?;
                out.flush()?;
            }
            Some(path) => {
                let file = File::create(path)
                    .with_context(|| format!("failed to open {}", path.display()))?;
                let mut out = BufWriter::new(file);
                self.store.dump(&mut out)?;
                out.flush()?;
                info!(path = %path.display(), "store printed");
            }
        }
        Ok(())
    }

    /// Runs operator commands from `input` until it ends, then shuts down.
    pub fn run_console<R: BufRead>(self, input: R) -> ShutdownReport {
        for line in input.lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    warn!(error = ?err, "failed to read operator input");
                    break;
                }
            };
            match OperatorCommand::parse(&line) {
                Ok(Some(command)) => {
                    if let Err(err) = self.apply(command) {
                        warn!(error = ?err, "operator command failed");
                    }
                }
                Ok(None) => {}
                Err(err) => warn!("{err}"),
            }
        }
        info!("operator input closed");
        self.shutdown()
    }

    /// Cancels every session, waits for them to drain, destroys the store
    /// and stops the listener, in that order.
    ///
    /// The store is only torn down once the registry is empty, so no session
    /// can still be inside a store operation.
    pub fn shutdown(self) -> ShutdownReport {
        let Server {
            store,
            registry,
            listener,
            monitor,
            ..
        } = self;

        if let Some(monitor) = monitor {
            monitor.stop();
        }
        registry.close();
        registry.wait_for_drain();
        info!("all sessions drained");

        let entries_destroyed = store.clear();
        info!(entries = entries_destroyed, "store destroyed");

        listener.cancel();
        info!("listener stopped");

        ShutdownReport { entries_destroyed }
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, context: &SessionContext) {
    let session = ClientSession::new(stream, peer, context.clone());
    let id = session.id();
    if let Err(err) = session.spawn() {
        warn!(session = id, peer = %peer, error = ?err, "failed to spawn session thread");
    }
}
