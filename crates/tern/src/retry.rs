use rand::Rng;
use std::time::Duration;

/// Exponential backoff parameters shared by connection and publish loops.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// None means retry forever (connections); publishes set a bound.
    pub max_attempts: Option<u32>,
    /// Fraction of the current delay used as symmetric jitter, in [0, 1].
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 1.5,
            max_attempts: None,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn publishing() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: Some(5),
            jitter: 0.25,
        }
    }

    pub fn state(&self) -> RetryState {
        RetryState::new(*self)
    }
}

/// One live backoff sequence.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    current: Duration,
    attempts: u32,
    cancelled: bool,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            current: policy.initial_delay,
            policy,
            attempts: 0,
            cancelled: false,
        }
    }

    /// The next delay to wait, or None when the attempt budget is spent or
    /// the sequence was cancelled. Advances the internal schedule.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.cancelled {
            return None;
        }
        if let Some(max) = self.policy.max_attempts {
            if self.attempts >= max {
                return None;
            }
        }
        self.attempts += 1;

        let base = self.current.min(self.policy.max_delay);
        let delay = jittered(base, self.policy.jitter);

        let next = Duration::from_secs_f64(
            (self.current.as_secs_f64() * self.policy.multiplier)
                .min(self.policy.max_delay.as_secs_f64()),
        );
        self.current = next;

        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Restores the initial schedule, e.g. after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.policy.initial_delay;
        self.attempts = 0;
        self.cancelled = false;
    }

    /// Voids any pending retry; `next_delay` returns None until `reset`.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }
}

fn jittered(base: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return base;
    }
    let spread = base.as_secs_f64() * jitter.clamp(0.0, 1.0);
    let offset = rand::rng().random_range(-spread..=spread);
    Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(max_attempts: Option<u32>) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            max_attempts,
            jitter: 0.0,
        }
    }

    #[test]
    fn delays_double_up_to_the_cap() {
        let mut state = no_jitter(None).state();
        let delays: Vec<u64> = (0..5)
            .filter_map(|_| state.next_delay())
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8]);
    }

    #[test]
    fn attempt_budget_is_enforced() {
        let mut state = no_jitter(Some(3)).state();
        assert!(state.next_delay().is_some());
        assert!(state.next_delay().is_some());
        assert!(state.next_delay().is_some());
        assert!(state.next_delay().is_none());
        assert_eq!(state.attempts(), 3);
    }

    #[test]
    fn reset_restores_the_schedule() {
        let mut state = no_jitter(Some(2)).state();
        state.next_delay();
        state.next_delay();
        assert!(state.next_delay().is_none());

        state.reset();
        assert_eq!(state.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn cancel_voids_pending_retries() {
        let mut state = no_jitter(None).state();
        state.next_delay();
        state.cancel();
        assert!(state.next_delay().is_none());
        assert!(state.is_cancelled());
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            multiplier: 1.0,
            max_attempts: None,
            jitter: 0.5,
        };
        let mut state = policy.state();
        for _ in 0..50 {
            let d = state.next_delay().expect("delay").as_secs_f64();
            assert!((5.0..=15.0).contains(&d), "delay {d} out of jitter range");
        }
    }
}
