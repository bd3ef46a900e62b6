//! A single long-lived TCP session.
//!
//! Each accepted connection gets a [`Session`]: a read half driven by a
//! background task that frames incoming bytes and resolves them into
//! [`ProtocolRecord`]s pushed onto a shared channel, and a write half
//! behind a mutex so any number of callers can send lines without
//! interleaving partial writes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::protocol::{resolve, Framer, FramingError, ProtocolRecord, ResolveError};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle identifying one connection for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which of the five listening endpoints accepted this session
///. Devices register their concrete role over the wire
/// after connecting; the endpoint only narrows the protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Client,
    Mount,
    Camera,
    TelescopeGeneric,
    Annex,
}

/// An event delivered from a session's read loop to whoever owns the
/// registry (the `Coordinator`).
#[derive(Debug)]
pub enum SessionEvent {
    Record(SessionId, Endpoint, ProtocolRecord),
    Closed(SessionId),
}

/// A connected peer. Cheap to clone: writes go through a shared mutex
/// around the owned write half.
#[derive(Clone)]
pub struct Session {
    pub id: SessionId,
    pub endpoint: Endpoint,
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

impl Session {
    /// Accepts ownership of a freshly-connected stream, spawns its read
    /// loop, and returns the write handle. `events` is the shared
    /// channel every session on every endpoint reports to; the registry
    /// tells records apart by `SessionId` and `Endpoint`.
    pub fn spawn(stream: TcpStream, endpoint: Endpoint, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        let id = SessionId::next();
        let (read_half, write_half) = stream.into_split();
        let writer = Arc::new(Mutex::new(write_half));

        tokio::spawn(read_loop(id, endpoint, read_half, events));

        Session { id, endpoint, writer }
    }

    /// Sends one line, appending the `\n` terminator. Concurrent
    /// callers are serialized by the writer mutex so two in-flight
    /// sends can never interleave their bytes on the wire.
    pub async fn send_line(&self, line: &str) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }
}

async fn read_loop(
    id: SessionId,
    endpoint: Endpoint,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let mut framer = Framer::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = match read_half.read(&mut chunk).await {
            Ok(0) => {
                debug!("session {} ({:?}) closed by peer", id, endpoint);
                break;
            }
            Ok(n) => n,
            Err(err) => {
                warn!("session {} ({:?}) read error: {}", id, endpoint, err);
                break;
            }
        };

        if let Err(FramingError::Overflow(cap)) = framer.feed(&chunk[..n]) {
            warn!(
                "session {} ({:?}) exceeded the {}-byte frame cap, closing",
                id, endpoint, cap
            );
            break;
        }

        while let Some(line) = framer.next_frame() {
            let line = match std::str::from_utf8(&line) {
                Ok(line) => line,
                Err(_) => {
                    warn!("session {} ({:?}) sent non-UTF-8 line, closing", id, endpoint);
                    let _ = events.send(SessionEvent::Closed(id));
                    return;
                }
            };
            trace!("session {} ({:?}) <- {}", id, endpoint, line);
            match resolve(line) {
                Ok(record) => {
                    if events.send(SessionEvent::Record(id, endpoint, record)).is_err() {
                        return;
                    }
                }
                Err(ResolveError::Ascii(e)) => {
                    warn!("session {} ({:?}) malformed ascii message, closing: {}", id, endpoint, e);
                    let _ = events.send(SessionEvent::Closed(id));
                    return;
                }
                Err(ResolveError::Annex(e)) => {
                    warn!("session {} ({:?}) malformed annex message, closing: {}", id, endpoint, e);
                    let _ = events.send(SessionEvent::Closed(id));
                    return;
                }
            }
        }
    }

    let _ = events.send(SessionEvent::Closed(id));
}
