//! Dedicated thread that turns an interrupt into a mass session reset.
//!
//! On every delivery the monitor cancels all active sessions and immediately
//! reopens admission. The listener keeps running, so clients may reconnect
//! right away. The process itself never terminates on the interrupt.

use std::io;
use std::os::raw::c_int;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use signal_hook::iterator::{Handle, Signals};
use tracing::{info, warn};

use crate::registry::SessionRegistry;

pub struct InterruptMonitor {
    handle: Handle,
    thread: JoinHandle<()>,
}

impl InterruptMonitor {
    /// Watches for `signals`; the server passes `SIGINT`.
    pub fn spawn(registry: Arc<SessionRegistry>, signals: &[c_int]) -> io::Result<Self> {
        let mut signals = Signals::new(signals)?;
        let handle = signals.handle();
        let thread = thread::Builder::new()
            .name("interrupt-monitor".into())
            .spawn(move || {
                for signal in signals.forever() {
                    info!(signal, "interrupt received, resetting sessions");
                    let generation = registry.cancel_all();
                    if !registry.reopen(generation) {
                        info!(generation, "admission stays closed");
                    }
                }
            })?;
        Ok(Self { handle, thread })
    }

    /// Stops watching and joins the monitor thread.
    pub fn stop(self) {
        self.handle.close();
        if self.thread.join().is_err() {
            warn!("interrupt monitor panicked");
        }
    }
}
