//! Operator console command parsing.
//!
//! The console reads one command per line from the server's stdin:
//! - `s` pauses every session at its next checkpoint
//! - `g` resumes them
//! - `p` prints the store to stdout, `p <file>` prints it into `<file>`
//!
//! End of input starts the shutdown sequence; that is handled by the server,
//! not parsed here.

use std::path::PathBuf;

use anyhow::{Result, anyhow};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Pause,
    Resume,
    /// Print to stdout when `path` is `None`.
    Print { path: Option<PathBuf> },
}

impl OperatorCommand {
    /// Parses one console line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let command = match parts.as_slice() {
            [] => return Ok(None),
            ["s"] => OperatorCommand::Pause,
            ["g"] => OperatorCommand::Resume,
            ["p"] => OperatorCommand::Print { path: None },
            ["p", path] => OperatorCommand::Print {
                path: Some(PathBuf::from(*path)),
            },
            ["s" | "g", ..] => {
                return Err(anyhow!("'{}' takes no arguments", parts[0]));
            }
            ["p", ..] => return Err(anyhow!("usage: p [file]")),
            [other, ..] => {
                return Err(anyhow!(
                    "unknown command '{other}'. Try: s (pause), g (resume), p [file] (print)"
                ));
            }
        };
        Ok(Some(command))
    }
}
