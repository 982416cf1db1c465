//! Live status line.
//!
//! Polls the shared counters and rewrites a single terminal line whenever
//! they change. It only reads the counters and never holds up the workload
//! it watches.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::stats::{Counters, Snapshot};

/// Remembers the last printed snapshot.
#[derive(Debug, Default)]
pub struct StatusMonitor {
    last: Snapshot,
}

impl StatusMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the snapshot if it differs from the last one reported.
    pub fn observe(&mut self, current: Snapshot) -> Option<Snapshot> {
        if current == self.last {
            return None;
        }
        self.last = current;
        Some(current)
    }
}

/// `connections errors`, padded and carriage-returned so it redraws in place.
pub fn status_line(snapshot: Snapshot) -> String {
    format!("{:8} {:4}    \r", snapshot.connections, snapshot.errors)
}

/// Report counter changes every `interval` until `lifecycle` says the
/// watched work is done, or its sender goes away.
pub async fn monitor<W: Write>(
    counters: Arc<Counters>,
    mut lifecycle: watch::Receiver<bool>,
    interval: Duration,
    mut out: W,
) -> io::Result<()> {
    let mut status = StatusMonitor::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *lifecycle.borrow_and_update() {
            return Ok(());
        }

        tokio::select! {
            _ = ticker.tick() => {
                if let Some(snapshot) = status.observe(counters.snapshot()) {
                    out.write_all(status_line(snapshot).as_bytes())?;
                    out.flush()?;
                }
            }
            changed = lifecycle.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
        }
    }
}
