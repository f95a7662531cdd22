//! Local-node health score. A flaky node (failed probes, packet loss)
//! scales its own probe/suspicion timers up so it doesn't flood the
//! cluster with false suspicions while it's struggling.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

pub struct Awareness {
    score: AtomicI64,
    max: i64,
}

impl Awareness {
    pub fn new(max_multiplier: u32) -> Self {
        Self {
            score: AtomicI64::new(0),
            max: max_multiplier as i64,
        }
    }

    /// Call on probe failure (timeout with no direct or indirect ack).
    pub fn on_failure(&self) {
        self.score.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
            Some((s + 1).min(self.max))
        }).ok();
    }

    /// Call on probe success.
    pub fn on_success(&self) {
        self.score.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
            Some((s - 1).max(0))
        }).ok();
    }

    pub fn score(&self) -> i64 {
        self.score.load(Ordering::SeqCst)
    }

    /// Scale `base` by `1 + score`, e.g. a score of 2 triples the timeout.
    pub fn scale(&self, base: Duration) -> Duration {
        let multiplier = 1 + self.score();
        base * (multiplier.max(1) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_is_clamped_to_max() {
        let a = Awareness::new(8);
        for _ in 0..20 {
            a.on_failure();
        }
        assert_eq!(a.score(), 8);
    }

    #[test]
    fn score_never_goes_negative() {
        let a = Awareness::new(8);
        a.on_success();
        assert_eq!(a.score(), 0);
    }

    #[test]
    fn scale_multiplies_timeout_by_score_plus_one() {
        let a = Awareness::new(8);
        a.on_failure();
        a.on_failure();
        let scaled = a.scale(Duration::from_millis(500));
        assert_eq!(scaled, Duration::from_millis(1500));
    }
}
