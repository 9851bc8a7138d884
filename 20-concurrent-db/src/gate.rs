//! Server-wide stop/resume switch consulted by every session before it runs a
//! command.

use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;

/// What a session should do after passing the pause checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Proceed,
    Cancelled,
}

#[derive(Default)]
pub struct PauseGate {
    paused: Mutex<bool>,
    resumed: Condvar,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds every session at its next checkpoint. Idempotent.
    pub fn stop(&self) {
        *self.paused.lock() = true;
    }

    /// Releases all sessions blocked at the checkpoint.
    pub fn resume(&self) {
        *self.paused.lock() = false;
        self.resumed.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock()
    }

    /// Blocks while the gate is stopped.
    ///
    /// This is the session's cancellation point: a cancelled token wins over
    /// a paused gate, and a session waiting here is woken by [`wake_all`]
    /// once its token is cancelled.
    ///
    /// [`wake_all`]: PauseGate::wake_all
    pub fn wait_if_paused(&self, cancel: &CancellationToken) -> Checkpoint {
        let mut paused = self.paused.lock();
        loop {
            if cancel.is_cancelled() {
                return Checkpoint::Cancelled;
            }
            if !*paused {
                return Checkpoint::Proceed;
            }
            self.resumed.wait(&mut paused);
        }
    }

    /// Wakes every waiter so it re-checks its cancellation token. The gate
    /// stays paused.
    pub fn wake_all(&self) {
        let _paused = self.paused.lock();
        self.resumed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn spawn_waiter(
        gate: &Arc<PauseGate>,
        token: &CancellationToken,
    ) -> mpsc::Receiver<Checkpoint> {
        let (tx, rx) = mpsc::channel();
        let gate = Arc::clone(gate);
        let token = token.clone();
        thread::spawn(move || {
            let _ = tx.send(gate.wait_if_paused(&token));
        });
        rx
    }

    #[test]
    fn open_gate_lets_sessions_through() {
        let gate = PauseGate::new();
        assert_eq!(
            gate.wait_if_paused(&CancellationToken::new()),
            Checkpoint::Proceed
        );
    }

    #[test]
    fn stopped_gate_blocks_until_resume() {
        let gate = Arc::new(PauseGate::new());
        gate.stop();
        gate.stop();
        assert!(gate.is_paused());

        let rx = spawn_waiter(&gate, &CancellationToken::new());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        gate.resume();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)),
            Ok(Checkpoint::Proceed)
        );
        assert!(!gate.is_paused());
    }

    #[test]
    fn cancellation_releases_a_paused_waiter() {
        let gate = Arc::new(PauseGate::new());
        gate.stop();
        let token = CancellationToken::new();

        let rx = spawn_waiter(&gate, &token);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        token.cancel();
        gate.wake_all();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)),
            Ok(Checkpoint::Cancelled)
        );
        assert!(gate.is_paused());
    }

    #[test]
    fn cancelled_token_wins_over_open_gate() {
        let gate = PauseGate::new();
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(gate.wait_if_paused(&token), Checkpoint::Cancelled);
    }
}
