//! Load orchestration: many concurrent connection attempts.
//!
//! Attempts are staggered so the load ramps up instead of hitting the server
//! with every connect at once. The ramp rate follows a simple heuristic:
//!
//! ```text
//! rate = min(fd_limit, connections) / rate_divisor   (connections per second)
//! ```
//!
//! A bigger divisor means fewer retries but lower achievable concurrency.
//! Attempt `i` starts after `i / rate` seconds.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use crate::client::{attempt, AttemptContext, Connector};
use crate::error::EchoError;

/// Aggregate result of a load test run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    /// Attempts scheduled
    pub attempted: usize,
    /// Attempts that reached a terminal outcome
    pub completed: usize,
    /// Completed attempts that ended in an error
    pub failed: usize,
    /// Retries consumed by successful attempts
    pub retries: u64,
}

impl Summary {
    fn record(&mut self, joined: Result<Result<u32, EchoError>, JoinError>, budget: u32) {
        match joined {
            Ok(Ok(remaining)) => {
                self.completed += 1;
                self.retries += u64::from(budget.saturating_sub(remaining));
            }
            Ok(Err(e)) => {
                self.completed += 1;
                self.failed += 1;
                debug!(error = %e, "Connection attempt failed");
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                self.completed += 1;
                self.failed += 1;
                warn!(error = %e, "Connection attempt panicked");
            }
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tasks, {} exceptions, {} retries",
            self.attempted, self.failed, self.retries
        )?;
        if self.completed < self.attempted {
            write!(f, " (interrupted after {} completed)", self.completed)?;
        }
        Ok(())
    }
}

/// Schedules and tracks a batch of connection attempts.
pub struct LoadOrchestrator<C: Connector> {
    ctx: Arc<AttemptContext<C>>,
    rate_divisor: u64,
    fd_limit: u64,
}

impl<C: Connector> LoadOrchestrator<C> {
    pub fn new(ctx: AttemptContext<C>, rate_divisor: u64, fd_limit: u64) -> Self {
        Self {
            ctx: Arc::new(ctx),
            rate_divisor,
            fd_limit,
        }
    }

    /// Run `total` attempts to completion, or until `interrupt` resolves.
    ///
    /// On interrupt every in-flight attempt is aborted, which drops (and
    /// resets) its connection, and the partial summary is returned.
    pub async fn run<F>(&self, total: usize, interrupt: F) -> Summary
    where
        F: Future<Output = ()>,
    {
        let rate = connections_per_second(self.fd_limit, total, self.rate_divisor);
        let budget = self.ctx.policy.retries;
        info!(total, rate, target_addr = %self.ctx.target, "Starting load test");

        let mut attempts = JoinSet::new();
        for index in 0..total {
            let ctx = Arc::clone(&self.ctx);
            let jitter = start_delay(index, rate);
            attempts.spawn(async move { attempt(&ctx, jitter).await });
        }

        let mut summary = Summary {
            attempted: total,
            ..Summary::default()
        };

        tokio::pin!(interrupt);
        loop {
            tokio::select! {
                joined = attempts.join_next() => match joined {
                    Some(joined) => summary.record(joined, budget),
                    None => break,
                },
                () = &mut interrupt => {
                    warn!(pending = attempts.len(), "Interrupted, aborting in-flight connections");
                    attempts.abort_all();
                    while let Some(joined) = attempts.join_next().await {
                        summary.record(joined, budget);
                    }
                    break;
                }
            }
        }

        info!(
            completed = summary.completed,
            failed = summary.failed,
            retries = summary.retries,
            "Load test finished"
        );
        summary
    }
}

/// Ramp-up rate, never below one connection per second.
pub fn connections_per_second(fd_limit: u64, total: usize, divisor: u64) -> u64 {
    let total = u64::try_from(total).unwrap_or(u64::MAX);
    (fd_limit.min(total) / divisor.max(1)).max(1)
}

/// Delay before attempt `index` dials for the first time.
pub fn start_delay(index: usize, rate: u64) -> Duration {
    Duration::from_secs_f64(index as f64 / rate.max(1) as f64)
}

/// Soft limit on open file descriptors (`ulimit -n`).
pub fn fd_limit() -> io::Result<u64> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit only writes into the struct we pass it.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(limit.rlim_cur as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{RetryPolicy, TcpConnector};
    use crate::connection::ConnectionSettings;
    use crate::server::EchoServer;
    use crate::stats::Counters;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::{TcpListener, TcpStream};

    /// Refuses the first `refusals` dials overall.
    struct Refusing {
        refusals: usize,
        dials: AtomicUsize,
    }

    impl Connector for Refusing {
        type Stream = TcpStream;

        async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
            if self.dials.fetch_add(1, Ordering::SeqCst) < self.refusals {
                return Err(io::ErrorKind::ConnectionRefused.into());
            }
            TcpConnector.connect(addr).await
        }
    }

    /// Refuses every other dial, starting with the first.
    ///
    /// With attempts spaced further apart than the retry interval, every
    /// attempt is refused once and connects on its retry.
    struct Alternating {
        dials: AtomicUsize,
    }

    impl Connector for Alternating {
        type Stream = TcpStream;

        async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
            if self.dials.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                return Err(io::ErrorKind::ConnectionRefused.into());
            }
            TcpConnector.connect(addr).await
        }
    }

    fn context<C>(connector: C, target: SocketAddr, retries: u32) -> AttemptContext<C> {
        AttemptContext {
            connector,
            target,
            policy: RetryPolicy {
                retries,
                interval: Duration::from_millis(10),
                jitter: Duration::from_millis(5),
            },
            payload: vec!["a".to_string(), "b".to_string(), "quit".to_string()].into(),
            settings: ConnectionSettings {
                io_timeout: Some(Duration::from_secs(5)),
                counters: Counters::new(),
            },
        }
    }

    fn echo_server() -> crate::server::ServerHandle {
        let settings = ConnectionSettings {
            io_timeout: Some(Duration::from_secs(5)),
            counters: Counters::new(),
        };
        let addr = "127.0.0.1:0".parse().unwrap();
        EchoServer::bind(addr, 128, 1024, settings)
            .unwrap()
            .serve()
            .unwrap()
    }

    #[test]
    fn test_connections_per_second() {
        assert_eq!(connections_per_second(1024, 10000, 5), 204);
        assert_eq!(connections_per_second(u64::MAX, 10000, 5), 2000);
        assert_eq!(connections_per_second(u64::MAX, 10, 5), 2);
        assert_eq!(connections_per_second(u64::MAX, 3, 5), 1);
        assert_eq!(connections_per_second(256, 0, 5), 1);
    }

    #[test]
    fn test_start_delay_ramps() {
        assert_eq!(start_delay(0, 2), Duration::ZERO);
        assert_eq!(start_delay(3, 2), Duration::from_millis(1500));
        assert_eq!(start_delay(2000, 2000), Duration::from_secs(1));
    }

    #[test]
    fn test_fd_limit_is_positive() {
        assert!(fd_limit().unwrap() > 0);
    }

    #[test]
    fn test_summary_display() {
        let done = Summary {
            attempted: 10,
            completed: 10,
            failed: 2,
            retries: 7,
        };
        assert_eq!(done.to_string(), "10 tasks, 2 exceptions, 7 retries");

        let partial = Summary {
            completed: 4,
            ..done
        };
        assert_eq!(
            partial.to_string(),
            "10 tasks, 2 exceptions, 7 retries (interrupted after 4 completed)"
        );
    }

    #[tokio::test]
    async fn test_always_refusing_target() {
        let connector = Refusing {
            refusals: usize::MAX,
            dials: AtomicUsize::new(0),
        };
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let orchestrator = LoadOrchestrator::new(context(connector, addr, 2), 1, 100);

        let summary = orchestrator.run(5, std::future::pending()).await;
        assert_eq!(
            summary,
            Summary {
                attempted: 5,
                completed: 5,
                failed: 5,
                retries: 0,
            }
        );
        // Each attempt dials once plus its full budget
        assert_eq!(orchestrator.ctx.connector.dials.load(Ordering::SeqCst), 15);
    }

    #[tokio::test]
    async fn test_transient_refusal_costs_one_retry() {
        let server = echo_server();
        let connector = Refusing {
            refusals: 1,
            dials: AtomicUsize::new(0),
        };
        let orchestrator =
            LoadOrchestrator::new(context(connector, server.local_addr(), 10), 1, 100);

        let summary = orchestrator.run(4, std::future::pending()).await;
        assert_eq!(summary.completed, 4);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.retries, 1);

        server.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_retries_sum_over_refused_dials() {
        let server = echo_server();
        let connector = Refusing {
            refusals: 3,
            dials: AtomicUsize::new(0),
        };
        let orchestrator =
            LoadOrchestrator::new(context(connector, server.local_addr(), 10), 1, 100);

        let summary = orchestrator.run(4, std::future::pending()).await;
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.retries, 3);
        assert_eq!(orchestrator.ctx.settings.counters.snapshot().connections, 4);

        server.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_first_dial_refused_per_attempt() {
        let server = echo_server();
        let connector = Alternating {
            dials: AtomicUsize::new(0),
        };
        // 4 attempts at 4 per second: 250ms apart, retry after at most 10ms
        let orchestrator =
            LoadOrchestrator::new(context(connector, server.local_addr(), 10), 1, 100);

        let summary = orchestrator.run(4, std::future::pending()).await;
        assert_eq!(
            summary,
            Summary {
                attempted: 4,
                completed: 4,
                failed: 0,
                retries: 4,
            }
        );
        assert_eq!(orchestrator.ctx.connector.dials.load(Ordering::SeqCst), 8);

        server.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_interrupt_reports_partial_summary() {
        // Accepts connections but never echoes anything back.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let orchestrator = LoadOrchestrator::new(context(TcpConnector, addr, 10), 1, 100);
        let interrupt = tokio::time::sleep(Duration::from_millis(300));

        let summary = orchestrator.run(3, interrupt).await;
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.completed, 0);
        assert_eq!(summary.failed, 0);
        assert!(summary.to_string().contains("interrupted after 0 completed"));
    }
}
