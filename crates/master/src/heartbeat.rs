//! Liveness tracking and eviction of silent sessions.
//!
//! A periodic sweep marks sessions silent past `timeout` as eviction-pending;
//! their next request is answered RESET. Sessions that stay silent for a
//! further `grace` period are removed outright so crashed workers release
//! their environment slots.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::session::SessionState;
use crate::table::SessionTable;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Newly marked eviction-pending.
    pub marked: usize,
    /// Removed from the table.
    pub removed: usize,
}

/// Sweeps the session table for silent workers.
#[derive(Clone)]
pub struct HeartbeatMonitor {
    table: Arc<SessionTable>,
    timeout: Duration,
    grace: Duration,
}

impl HeartbeatMonitor {
    pub fn new(table: Arc<SessionTable>, timeout: Duration, grace: Duration) -> Self {
        Self {
            table,
            timeout,
            grace,
        }
    }

    /// Run one sweep as of `now`.
    ///
    /// Each session is locked individually, so a sweep never races a
    /// concurrent request on the same session.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let hard_limit = self.timeout + self.grace;

        for (client_id, handle) in self.table.snapshot() {
            let mut session = handle.lock();
            if session.state == SessionState::Closed {
                continue;
            }

            let silent = session.silent_for(now);
            if silent > hard_limit {
                info!(client_id, ?silent, "removing dead session");
                self.table.retire(&handle, &mut session);
                report.removed += 1;
            } else if silent > self.timeout && !session.evict_pending {
                info!(client_id, ?silent, "session marked for eviction");
                session.evict_pending = true;
                report.marked += 1;
            }
        }

        report
    }

    /// Spawn the periodic sweep on the current tokio runtime.
    ///
    /// # Panics
    /// If called outside a tokio runtime.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = self.sweep(Instant::now());
                if report != SweepReport::default() {
                    debug!(marked = report.marked, removed = report.removed, "heartbeat sweep");
                }
            }
        })
    }
}
