//! Line-oriented TCP transport.
//!
//! One listener thread accepts connections and hands each stream to a
//! callback; sessions then read one command per line and answer with one
//! response per line.
//!
//! Lines are framed from raw bytes. A line longer than [`MAX_LINE_LEN`] or
//! one that is not UTF-8 still yields a [`Frame`], so the session can answer
//! it and keep reading.

use std::fmt::Display;
use std::io::{self, BufRead, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

/// Longest command line accepted, line ending excluded.
pub const MAX_LINE_LEN: usize = 1024;

/// One line read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Line(String),
    /// The line was not valid UTF-8.
    Garbled,
    /// The line exceeded [`MAX_LINE_LEN`]; everything up to its newline was
    /// discarded.
    Oversized,
}

/// Running accept loop. Dropping the handle leaves the listener running;
/// call [`ListenerHandle::cancel`] to stop it.
pub struct ListenerHandle {
    local_addr: SocketAddr,
    stopping: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and joins the listener thread.
    pub fn cancel(self) {
        self.stop_with(|addr| TcpStream::connect(wake_addr(addr)).map(drop));
    }

    /// Sets the stop flag and wakes the accept loop through `wake`. Returns
    /// whether the thread was joined; when the wake-up fails the thread is
    /// left detached, since `accept` would never return.
    fn stop_with<F>(self, wake: F) -> bool
    where
        F: FnOnce(SocketAddr) -> io::Result<()>,
    {
        self.stopping.store(true, Ordering::SeqCst);
        // The accept loop only notices the flag once `accept` returns.
        if let Err(err) = wake(self.local_addr) {
            warn!(error = ?err, "failed to wake listener, leaving it detached");
            return false;
        }
        if self.thread.join().is_err() {
            warn!("listener thread panicked");
        }
        true
    }
}

/// Binds `addr` and spawns the accept loop, calling `on_accept` for every
/// connection on the listener thread.
pub fn start_listener<F>(addr: SocketAddr, on_accept: F) -> io::Result<ListenerHandle>
where
    F: Fn(TcpStream, SocketAddr) + Send + 'static,
{
    let listener = TcpListener::bind(addr)?;
    let local_addr = listener.local_addr()?;
    let stopping = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&stopping);
    let thread = thread::Builder::new()
        .name(format!("listener-{local_addr}"))
        .spawn(move || accept_loop(listener, &flag, on_accept))?;

    Ok(ListenerHandle {
        local_addr,
        stopping,
        thread,
    })
}

fn accept_loop<F>(listener: TcpListener, stopping: &AtomicBool, on_accept: F)
where
    F: Fn(TcpStream, SocketAddr),
{
    for stream in listener.incoming() {
        if stopping.load(Ordering::SeqCst) {
            break;
        }
        match stream.and_then(|stream| stream.peer_addr().map(|peer| (stream, peer))) {
            Ok((stream, peer)) => on_accept(stream, peer),
            Err(err) => warn!(error = ?err, "failed to accept connection"),
        }
    }
    debug!("listener stopped");
}

fn wake_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

/// Reads the next command line without its line ending. `None` means the
/// peer closed the stream.
///
/// At most `MAX_LINE_LEN` plus a `\r\n` is buffered per line.
pub fn read_next_command<R: BufRead>(reader: &mut R) -> io::Result<Option<Frame>> {
    let mut buf = Vec::new();
    let limit = (MAX_LINE_LEN + 2) as u64;
    if reader.by_ref().take(limit).read_until(b'\n', &mut buf)? == 0 {
        return Ok(None);
    }

    let overflowed = !buf.ends_with(b"\n") && buf.len() as u64 == limit;
    let content_len = buf
        .iter()
        .rposition(|&byte| byte != b'\n' && byte != b'\r')
        .map_or(0, |last| last + 1);
    if overflowed || content_len > MAX_LINE_LEN {
        if overflowed {
            discard_line(reader)?;
        }
        return Ok(Some(Frame::Oversized));
    }

    buf.truncate(content_len);
    Ok(Some(match String::from_utf8(buf) {
        Ok(line) => Frame::Line(line),
        Err(_) => Frame::Garbled,
    }))
}

/// Reads one reply line on the client side. Unreadable replies are errors.
pub fn read_reply<R: BufRead>(reader: &mut R) -> io::Result<Option<String>> {
    match read_next_command(reader)? {
        None => Ok(None),
        Some(Frame::Line(line)) => Ok(Some(line)),
        Some(frame) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unreadable reply: {frame:?}"),
        )),
    }
}

/// Skips input up to and including the next newline without buffering it.
fn discard_line<R: BufRead>(reader: &mut R) -> io::Result<()> {
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Ok(());
        }
        match available.iter().position(|&byte| byte == b'\n') {
            Some(at) => {
                reader.consume(at + 1);
                return Ok(());
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}

/// Writes one response line and flushes it so the client sees it promptly.
pub fn write_response<W, T>(writer: &mut W, response: &T) -> io::Result<()>
where
    W: Write,
    T: Display + ?Sized,
{
    writeln!(writer, "{response}")?;
    writer.flush()
}

/// Shuts both directions of the stream down, unblocking any thread reading
/// from another handle to the same socket.
pub fn close_stream(stream: &TcpStream) {
    match stream.shutdown(Shutdown::Both) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotConnected => {}
        Err(err) => debug!(error = ?err, "failed to shut stream down"),
    }
}
