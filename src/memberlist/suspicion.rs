//! Suspicion timeout calculation and the accelerating timer described in
//! spec.md §4.4: `min(SuspicionMult × log(N+1) × ProbeInterval, max)`,
//! shortened as independent peers confirm the suspicion.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Base suspicion timeout before any independent confirmations have
/// arrived: `SuspicionMult × log(N+1) × ProbeInterval`.
pub fn base_timeout(suspicion_mult: u32, cluster_size: usize, probe_interval: Duration) -> Duration {
    let n = (cluster_size as f64 + 1.0).ln().max(0.0);
    probe_interval.mul_f64(suspicion_mult as f64 * n)
}

/// Scale the base timeout down toward `min` as `confirmations` (out of a
/// maximum of `expected_confirmations`, typically `IndirectChecks`)
/// accumulate, following the same log-interpolation memberlist uses so a
/// single confirmer barely moves the deadline but many confirmers collapse
/// it toward `min` quickly.
pub fn scaled_timeout(
    base: Duration,
    min: Duration,
    confirmations: u32,
    expected_confirmations: u32,
) -> Duration {
    if expected_confirmations == 0 || confirmations == 0 {
        return base;
    }
    let frac = (confirmations.min(expected_confirmations) as f64 + 1.0).ln()
        / (expected_confirmations as f64 + 1.0).ln();
    let span = base.as_secs_f64() - min.as_secs_f64();
    let remaining = base.as_secs_f64() - span * frac.min(1.0);
    Duration::from_secs_f64(remaining.max(min.as_secs_f64()))
}

/// An accelerating suspicion timer for one node. `fire()` is resolved by
/// the caller (typically `tokio::select!` against a `tokio::time::sleep`
/// recomputed after each `confirm()`) rather than owning its own task, so
/// the memberlist event loop stays the single place that mutates node
/// state.
pub struct SuspicionTimer {
    min: Duration,
    base: Duration,
    expected_confirmations: u32,
    started: Instant,
    confirmations: u32,
    confirmed_by: std::collections::HashSet<String>,
    deadline_tx: watch::Sender<Instant>,
}

impl SuspicionTimer {
    pub fn new(min: Duration, base: Duration, expected_confirmations: u32) -> Self {
        let started = Instant::now();
        let (deadline_tx, _rx) = watch::channel(started + base);
        Self {
            min,
            base,
            expected_confirmations,
            started,
            confirmations: 0,
            confirmed_by: std::collections::HashSet::new(),
            deadline_tx,
        }
    }

    pub fn deadline_receiver(&self) -> watch::Receiver<Instant> {
        self.deadline_tx.subscribe()
    }

    /// Record a confirmation from `from`, a node other than the original
    /// suspector. Duplicate confirmers from the same node don't count
    /// twice. Returns the new deadline.
    pub fn confirm(&mut self, from: &str) -> Instant {
        if self.confirmed_by.insert(from.to_string()) {
            self.confirmations += 1;
        }
        let timeout = scaled_timeout(self.base, self.min, self.confirmations, self.expected_confirmations);
        let deadline = self.started + timeout;
        let _ = self.deadline_tx.send(deadline);
        deadline
    }
}
