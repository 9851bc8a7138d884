//! Line client: forwards stdin to the server and prints one response per
//! command.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream};

use anyhow::{Context, Result};
use tracing::info;

use crate::cli::ClientArgs;
use crate::transport;

pub fn run(args: ClientArgs) -> Result<()> {
    let stream = TcpStream::connect(args.server)
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    let stdin = io::stdin();
    let stdout = io::stdout();
    converse(&stream, stdin.lock(), stdout.lock())
}

/// Sends each input line and echoes the server's reply. Returns once input
/// ends or the server closes the connection.
pub fn converse<R: BufRead, W: Write>(stream: &TcpStream, input: R, mut output: W) -> Result<()> {
    let mut replies = BufReader::new(stream);
    let mut requests = stream;

    for line in input.lines() {
        let line = line.context("failed to read stdin")?;
        if writeln!(requests, "{line}").and_then(|()| requests.flush()).is_err() {
            writeln!(output, "*** connection closed")?;
            return Ok(());
        }
        match transport::read_reply(&mut replies) {
            Ok(Some(reply)) => writeln!(output, "{reply}")?,
            Ok(None) | Err(_) => {
                writeln!(output, "*** connection closed")?;
                return Ok(());
            }
        }
        output.flush()?;
    }

    let _ = stream.shutdown(Shutdown::Write);
    Ok(())
}
