//! Client side of the echo protocol: one connection attempt with retries.
//!
//! Under heavy concurrent load the server may briefly refuse or reset
//! connections. An attempt absorbs that with a small fixed retry budget and
//! jittered, non-exponential backoff. Once a connection is up, failures are
//! final: only dialing is ever retried.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::connection::{ConnectionSettings, EchoConnection, Role, Transport};
use crate::error::EchoError;
use crate::protocol::ClientSession;

/// Capability to open a transport to the echo server.
pub trait Connector: Send + Sync + 'static {
    type Stream: Transport + 'static;

    fn connect(&self, addr: SocketAddr) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Dials plain TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Retry budget and backoff for establishing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Dials allowed after the first one fails.
    pub retries: u32,
    /// Nominal spacing between dials.
    pub interval: Duration,
    /// Up to this much is subtracted from each spacing at random.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 10,
            interval: Duration::from_secs(1),
            jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next dial: `interval - U[0, jitter)`, never negative.
    pub fn backoff(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.interval;
        }
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..self.jitter);
        self.interval.saturating_sub(jitter)
    }
}

/// Everything an attempt needs besides its own jitter.
#[derive(Debug)]
pub struct AttemptContext<C> {
    pub connector: C,
    pub target: SocketAddr,
    pub policy: RetryPolicy,
    pub payload: Arc<[String]>,
    pub settings: ConnectionSettings,
}

/// Connect to the target and run the echo workload to completion.
///
/// Waits `jitter` before the first dial. Returns the retry budget left over
/// once the workload finished, as a measure of how hard it was to get in.
pub async fn attempt<C: Connector>(
    ctx: &AttemptContext<C>,
    jitter: Duration,
) -> Result<u32, EchoError> {
    tokio::time::sleep(jitter).await;

    let mut remaining = ctx.policy.retries;
    let stream = loop {
        match ctx.connector.connect(ctx.target).await {
            Ok(stream) => break stream,
            Err(e) if remaining == 0 => {
                debug!(target_addr = %ctx.target, error = %e, "Retries exhausted");
                return Err(EchoError::Establishment(e));
            }
            Err(e) => {
                let delay = ctx.policy.backoff();
                trace!(error = %e, remaining, ?delay, "Connect failed, retrying");
                tokio::time::sleep(delay).await;
                remaining -= 1;
            }
        }
    };

    let session = ClientSession::new(ctx.payload.iter());
    let (connection, done) = EchoConnection::new(stream, Role::Client(session), &ctx.settings);
    trace!(id = connection.id(), remaining, "Connected to server");
    connection.run().await;

    match done.await {
        Ok(outcome) => outcome.map(|()| remaining),
        Err(_) => Err(EchoError::Cancelled),
    }
}
