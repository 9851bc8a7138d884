//! Concurrent key-value server backed by a lock-coupled binary search tree.
//!
//! Clients connect over TCP and send one command per line; every command gets
//! exactly one response line. See `README.md` for the command set and the
//! operator console. Each module focuses on one responsibility:
//!
//! - [`store`] holds the ordered tree. Every node carries its own lock and
//!   traversals couple hand over hand, so operations on disjoint subtrees run
//!   in parallel.
//! - [`command`] parses client lines and runs them against the store,
//!   including batch replay of command files.
//! - [`gate`] is the pause/resume checkpoint every session passes before it
//!   runs a command.
//! - [`registry`] tracks live sessions, cancels them and lets shutdown wait
//!   for them to drain.
//! - [`session`] is the per-connection worker thread.
//! - [`transport`] accepts connections and frames lines on the wire.
//! - [`interrupt`] resets all sessions when the process is interrupted.
//! - [`console`] parses operator commands read from the server's stdin.
//! - [`server`] wires the pieces together and sequences shutdown.
//! - [`cli`] and [`client`] make up the command-line front end.

pub mod cli;
pub mod client;
pub mod command;
pub mod console;
pub mod gate;
pub mod interrupt;
pub mod registry;
pub mod server;
pub mod session;
pub mod store;
pub mod transport;
