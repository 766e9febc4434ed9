use std::time::Duration;

use rand::Rng;

pub const DEFAULT_BASE: Duration = Duration::from_millis(500);
pub const DEFAULT_CAP: Duration = Duration::from_secs(30);

/// Jittered exponential delay between retries of a transient failure
#[derive(Clone, Debug)]
pub struct ExpBackoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl ExpBackoff {
    pub fn new(base: Duration, cap: Duration) -> ExpBackoff {
        ExpBackoff { base, cap, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Upper bound of the next delay, before jitter
    pub fn ceiling(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt.min(16)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Returns a delay in `[ceiling / 2, ceiling]` and advances to the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);
        let millis = ceiling.as_millis() as u64;
        if millis < 2 {
            return ceiling;
        }
        Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ExpBackoff {
    fn default() -> Self {
        ExpBackoff::new(DEFAULT_BASE, DEFAULT_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let mut backoff = ExpBackoff::default();
        let mut ceilings = Vec::new();
        for _ in 0..10 {
            ceilings.push(backoff.ceiling());
            let delay = backoff.next_delay();
            assert!(delay <= *ceilings.last().unwrap());
            assert!(delay >= *ceilings.last().unwrap() / 2);
        }
        assert_eq!(ceilings[0], Duration::from_millis(500));
        assert_eq!(ceilings[1], Duration::from_secs(1));
        assert_eq!(ceilings[2], Duration::from_secs(2));
        assert_eq!(ceilings[9], DEFAULT_CAP);
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = ExpBackoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.ceiling(), DEFAULT_BASE);
    }
}
