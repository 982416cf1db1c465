//! Connection state machine for echo connections.
//!
//! An `EchoConnection` owns one established transport and drives the line
//! echo protocol over it, in either role:
//!
//! ```text
//! Connecting ──establish──▶ Active ──peer closed / quit──▶ Closed(Ok)
//!      │                      │
//!      └──────────────────────┴──────── error ───────────▶ Closed(Err)
//! ```
//!
//! Whatever the path, closing updates the shared counters and settles the
//! completion signal exactly once.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::EchoError;
use crate::protocol::{self, Action, ClientSession, LineBuffer};
use crate::stats::Counters;

/// Result a connection settles with.
pub type Outcome = Result<(), EchoError>;

/// Receiving end of a connection's completion signal.
pub type Completion = oneshot::Receiver<Outcome>;

/// Byte stream an echo connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {
    /// Apply the send/receive timeout to the underlying socket.
    fn set_io_timeout(&self, timeout: Duration) -> io::Result<()>;

    /// Make the next drop reset the connection instead of closing it gracefully.
    fn abort(&self);
}

impl Transport for TcpStream {
    fn set_io_timeout(&self, timeout: Duration) -> io::Result<()> {
        let socket = SockRef::from(self);
        socket.set_read_timeout(Some(timeout))?;
        socket.set_write_timeout(Some(timeout))
    }

    fn abort(&self) {
        // SO_LINGER with a zero timeout turns close() into a RST.
        let _ = SockRef::from(self).set_linger(Some(Duration::ZERO));
    }
}

/// Per-role settings shared by every connection of that role.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Send/receive timeout; `None` leaves the socket defaults alone.
    pub io_timeout: Option<Duration>,
    pub counters: Arc<Counters>,
}

/// Which side of the protocol a connection plays.
#[derive(Debug)]
pub enum Role {
    Client(ClientSession),
    Server,
}

impl Role {
    fn name(&self) -> &'static str {
        match self {
            Role::Client(_) => "client",
            Role::Server => "server",
        }
    }
}

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Transport handed over, timeouts not applied yet.
    Connecting,
    /// Exchanging lines.
    Active,
    /// Transport released, completion settled.
    Closed,
}

/// Whether the connection should keep reading after an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Done,
}

/// A single echo connection.
pub struct EchoConnection<T: Transport> {
    id: u64,
    role: Role,
    state: ConnState,
    stream: Option<T>,
    lines: LineBuffer,
    write_closed: bool,
    io_timeout: Option<Duration>,
    counters: Arc<Counters>,
    done: Option<oneshot::Sender<Outcome>>,
}

impl<T: Transport> EchoConnection<T> {
    /// Wrap a freshly established transport.
    pub fn new(stream: T, role: Role, settings: &ConnectionSettings) -> (Self, Completion) {
        let (done, completion) = oneshot::channel();
        let connection = Self {
            id: settings.counters.next_id(),
            role,
            state: ConnState::Connecting,
            stream: Some(stream),
            lines: LineBuffer::new(),
            write_closed: false,
            io_timeout: settings.io_timeout,
            counters: Arc::clone(&settings.counters),
            done: Some(done),
        };
        (connection, completion)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Drive the protocol until the connection closes, then settle.
    pub async fn run(mut self) {
        let outcome = self.drive().await;
        self.close(outcome);
    }

    async fn drive(&mut self) -> Outcome {
        self.establish()?;

        let first = match &mut self.role {
            Role::Client(session) => Some(session.start()),
            Role::Server => None,
        };
        if let Some(action) = first {
            if self.apply(action).await? == Flow::Done {
                return self.release().await;
            }
        }

        loop {
            if self.read().await? == 0 {
                trace!(id = self.id, "Peer closed its side");
                if let Some(line) = self.lines.finish() {
                    self.on_line(line).await?;
                }
                return self.release().await;
            }

            while let Some(line) = self.lines.next_line() {
                if self.on_line(line).await? == Flow::Done {
                    return self.release().await;
                }
            }
        }
    }

    fn establish(&mut self) -> Outcome {
        if let (Some(timeout), Some(stream)) = (self.io_timeout, self.stream.as_ref()) {
            stream
                .set_io_timeout(timeout)
                .map_err(EchoError::TimeoutConfiguration)?;
        }

        self.state = ConnState::Active;
        self.counters.connection_opened();
        debug!(id = self.id, role = self.role.name(), "Connection established");
        Ok(())
    }

    async fn on_line(&mut self, line: bytes::Bytes) -> Result<Flow, EchoError> {
        trace!(id = self.id, line = %String::from_utf8_lossy(&line).trim_end(), "Recv");
        let action = match &mut self.role {
            Role::Client(session) => session.on_line(&line)?,
            Role::Server => protocol::server_reply(line),
        };
        self.apply(action).await
    }

    async fn apply(&mut self, action: Action) -> Result<Flow, EchoError> {
        let limit = self.io_timeout;
        let stream = self.stream.as_mut().ok_or(EchoError::Cancelled)?;

        match action {
            Action::Send(line) => {
                with_timeout(limit, stream.write_all(&line))
                    .await
                    .map_err(EchoError::AbnormalDisconnect)?;
                trace!(id = self.id, line = %String::from_utf8_lossy(&line).trim_end(), "Sent");
                Ok(Flow::Continue)
            }
            Action::HalfClose => {
                with_timeout(limit, stream.shutdown())
                    .await
                    .map_err(EchoError::AbnormalDisconnect)?;
                self.write_closed = true;
                trace!(id = self.id, "Sent end of output");
                Ok(Flow::Continue)
            }
            Action::Close => Ok(Flow::Done),
        }
    }

    async fn read(&mut self) -> Result<usize, EchoError> {
        let limit = self.io_timeout;
        let stream = self.stream.as_mut().ok_or(EchoError::Cancelled)?;
        with_timeout(limit, stream.read_buf(self.lines.buffer_mut()))
            .await
            .map_err(EchoError::AbnormalDisconnect)
    }

    /// Graceful end of a connection that finished without error.
    ///
    /// An error here is the only way a clean run can still fail.
    async fn release(&mut self) -> Outcome {
        if self.write_closed {
            return Ok(());
        }
        let limit = self.io_timeout;
        let stream = self.stream.as_mut().ok_or(EchoError::Cancelled)?;
        match with_timeout(limit, stream.shutdown()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(EchoError::AbnormalDisconnect(e)),
        }
    }

    /// Release the transport, update counters and settle the completion.
    ///
    /// Idempotent: only the first call has any effect.
    fn close(&mut self, outcome: Outcome) {
        if self.state == ConnState::Closed {
            return;
        }
        let was_active = self.state == ConnState::Active;
        self.state = ConnState::Closed;

        if let Some(stream) = self.stream.take() {
            if outcome.is_err() {
                stream.abort();
            }
        }

        if outcome.is_err() {
            self.counters.error();
        }
        if was_active && matches!(self.role, Role::Server) {
            self.counters.connection_closed();
        }

        match &outcome {
            Ok(()) => debug!(id = self.id, role = self.role.name(), "Connection closed"),
            Err(e) => debug!(id = self.id, role = self.role.name(), error = %e, "Connection failed"),
        }

        if let Some(done) = self.done.take() {
            let _ = done.send(outcome);
        }
    }
}

impl<T: Transport> Drop for EchoConnection<T> {
    fn drop(&mut self) {
        self.close(Err(EchoError::Cancelled));
    }
}

/// Bound an I/O future by the connection's timeout, if any.
async fn with_timeout<F, R>(limit: Option<Duration>, io: F) -> io::Result<R>
where
    F: Future<Output = io::Result<R>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, io)
            .await
            .unwrap_or_else(|_| Err(io::ErrorKind::TimedOut.into())),
        None => io.await,
    }
}
