//! Wire command parsing and interpretation.
//!
//! Every request is one line. Its first character is the verb and the rest
//! of the line holds whitespace-separated arguments, so `qalice` and
//! `q alice` are the same query. A line starting with whitespace has no verb.
//!
//! | Verb | Arguments | Responses |
//! |------|-----------|-----------|
//! | `q` | key | the value, or `not found` |
//! | `a` | key value | `added`, `already in database` or `entry too long` |
//! | `d` | key | `removed`, or `not in database` |
//! | `f` | file name | `file processed`, or `bad file name` |
//!
//! Anything else answers `ill-formed command` and touches nothing. That
//! includes a wrong argument count, lines that are not UTF-8 and lines
//! longer than [`MAX_LINE_LEN`](crate::transport::MAX_LINE_LEN).

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::store::{DeleteOutcome, InsertOutcome, OrderedStore};
use crate::transport::{self, Frame};

/// How deep `f` commands inside replayed files may nest.
pub const MAX_REPLAY_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Query { key: String },
    Add { key: String, value: String },
    Delete { key: String },
    RunFile { path: PathBuf },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown verb {0:?}")]
    UnknownVerb(char),
    #[error("'{verb}' takes {expected} argument(s), got {found}")]
    WrongArity {
        verb: char,
        expected: usize,
        found: usize,
    },
}

impl Request {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut chars = line.chars();
        let verb = chars.next().ok_or(ParseError::Empty)?;
        let args: Vec<&str> = chars.as_str().split_whitespace().collect();

        let expected = match verb {
            'q' | 'd' | 'f' => 1,
            'a' => 2,
            _ => return Err(ParseError::UnknownVerb(verb)),
        };
        if args.len() != expected {
            return Err(ParseError::WrongArity {
                verb,
                expected,
                found: args.len(),
            });
        }

        let request = match (verb, args.as_slice()) {
            ('q', [key]) => Request::Query {
                key: (*key).to_owned(),
            },
            ('a', [key, value]) => Request::Add {
                key: (*key).to_owned(),
                value: (*value).to_owned(),
            },
            ('d', [key]) => Request::Delete {
                key: (*key).to_owned(),
            },
            ('f', [path]) => Request::RunFile {
                path: PathBuf::from(*path),
            },
            _ => return Err(ParseError::UnknownVerb(verb)),
        };
        Ok(request)
    }
}

/// The single line written back for every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Value(String),
    NotFound,
    Added,
    AlreadyPresent,
    TooLong,
    Removed,
    NotInDatabase,
    FileProcessed,
    BadFileName,
    IllFormed,
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Value(value) => f.write_str(value),
            Response::NotFound => f.write_str("not found"),
            Response::Added => f.write_str("added"),
            Response::AlreadyPresent => f.write_str("already in database"),
            Response::TooLong => f.write_str("entry too long"),
            Response::Removed => f.write_str("removed"),
            Response::NotInDatabase => f.write_str("not in database"),
            Response::FileProcessed => f.write_str("file processed"),
            Response::BadFileName => f.write_str("bad file name"),
            Response::IllFormed => f.write_str("ill-formed command"),
        }
    }
}

/// Turns command lines into store operations. Holds no per-session state.
pub struct CommandInterpreter {
    store: Arc<OrderedStore>,
}

impl CommandInterpreter {
    pub fn new(store: Arc<OrderedStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &OrderedStore {
        &self.store
    }

    /// Interprets one line with no way to interrupt file replay.
    pub fn interpret(&self, line: &str) -> Response {
        self.interpret_with(line, &CancellationToken::new())
    }

    /// Interprets one line. File replay stops early once `cancel` fires.
    pub fn interpret_with(&self, line: &str, cancel: &CancellationToken) -> Response {
        self.interpret_at(line, cancel, 0)
    }

    /// Interprets one framed line. Frames that are not readable text are
    /// ill-formed.
    pub fn interpret_frame(&self, frame: &Frame, cancel: &CancellationToken) -> Response {
        self.interpret_frame_at(frame, cancel, 0)
    }

    fn interpret_frame_at(
        &self,
        frame: &Frame,
        cancel: &CancellationToken,
        depth: usize,
    ) -> Response {
        match frame {
            Frame::Line(line) => self.interpret_at(line, cancel, depth),
            Frame::Garbled | Frame::Oversized => {
                debug!(?frame, "unreadable command line");
                Response::IllFormed
            }
        }
    }

    fn interpret_at(&self, line: &str, cancel: &CancellationToken, depth: usize) -> Response {
        let request = match Request::parse(line) {
            Ok(request) => request,
            Err(err) => {
                debug!(line, error = %err, "ill-formed command");
                return Response::IllFormed;
            }
        };

        match request {
            Request::Query { key } => match self.store.query(&key) {
                Some(value) => Response::Value(value),
                None => Response::NotFound,
            },
            Request::Add { key, value } => match self.store.insert(&key, &value) {
                Ok(InsertOutcome::Inserted) => Response::Added,
                Ok(InsertOutcome::AlreadyPresent) => Response::AlreadyPresent,
                Err(err) => {
                    debug!(error = %err, "entry rejected");
                    Response::TooLong
                }
            },
            Request::Delete { key } => match self.store.delete(&key) {
                DeleteOutcome::Removed => Response::Removed,
                DeleteOutcome::NotFound => Response::NotInDatabase,
            },
            Request::RunFile { path } => self.replay_file(&path, cancel, depth),
        }
    }

    /// Interprets every line of `path`, discarding the individual responses.
    fn replay_file(&self, path: &Path, cancel: &CancellationToken, depth: usize) -> Response {
        if depth >= MAX_REPLAY_DEPTH {
            warn!(path = %path.display(), depth, "file replay nested too deeply");
            return Response::BadFileName;
        }
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) => {
                debug!(path = %path.display(), error = ?err, "cannot open command file");
                return Response::BadFileName;
            }
        };

        let mut reader = BufReader::new(file);
        loop {
            if cancel.is_cancelled() {
                debug!(path = %path.display(), "file replay cancelled");
                break;
            }
            match transport::read_next_command(&mut reader) {
                Ok(Some(frame)) => {
                    self.interpret_frame_at(&frame, cancel, depth + 1);
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(path = %path.display(), error = ?err, "file replay stopped on read error");
                    break;
                }
            }
        }
        Response::FileProcessed
    }
}
