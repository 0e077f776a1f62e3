use tokio::time::{Duration, Instant};

/// A declarative retry schedule.
///
/// The pattern holds an ordered list of per-attempt timeouts; when more
/// attempts are allowed than there are explicit entries, the last entry
/// is extended by repeatedly applying the multiplier.  After the final
/// attempt's timeout has elapsed the post-failure delays run before the
/// timer reports that all attempts have failed.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPattern {
    max_attempts: usize,
    attempt_timeouts: Vec<Duration>,
    last_timeout_multiplier: f64,
    failure_delays: Vec<Duration>,
}

impl BackoffPattern {
    pub fn new(
        max_attempts: usize,
        attempt_timeouts: Vec<Duration>,
        last_timeout_multiplier: f64,
        failure_delays: Vec<Duration>,
    ) -> Self {
        assert!(max_attempts > 0);
        assert!(!attempt_timeouts.is_empty());

        Self {
            max_attempts,
            attempt_timeouts,
            last_timeout_multiplier,
            failure_delays,
        }
    }

    /// The schedule used for a STUN requester when none is supplied:
    /// six attempts starting at 500 ms and doubling, so retransmissions
    /// go out 500, 1000, 2000, 4000, 8000 and 16000 ms apart.
    pub fn stun_default() -> Self {
        Self::new(
            6,
            vec![Duration::from_millis(500)],
            2.0,
            vec![Duration::from_millis(1)],
        )
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Timeout for the given zero-based attempt.
    pub fn attempt_timeout(&self, attempt: usize) -> Duration {
        let last = self.attempt_timeouts.len() - 1;
        if attempt <= last {
            return self.attempt_timeouts[attempt];
        }

        self.attempt_timeouts[last].mul_f64(self.last_timeout_multiplier.powi((attempt - last) as i32))
    }

    /// Delay after the final attempt's timeout before the failure is
    /// reported.
    pub fn failure_delay(&self) -> Duration {
        self.failure_delays.iter().sum()
    }
}

impl Default for BackoffPattern {
    fn default() -> Self {
        Self::stun_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffState {
    /// An attempt is due now.
    Attempting,
    /// An attempt is outstanding; waiting for its timeout to elapse.
    WaitingAfterAttempt,
    /// The schedule is exhausted.
    AllAttemptsFailed,
}

/// Passive retry timer over a [`BackoffPattern`].
///
/// The timer holds no threads of its own: the owning task calls
/// [`BackoffTimer::poll`] with the current time, acts on the state it
/// returns, and sleeps until [`BackoffTimer::next_deadline`].
#[derive(Debug, Clone)]
pub struct BackoffTimer {
    pattern: BackoffPattern,
    state: BackoffState,
    attempt: usize,
    deadline: Option<Instant>,
}

impl BackoffTimer {
    pub fn new(pattern: BackoffPattern) -> Self {
        Self {
            pattern,
            state: BackoffState::Attempting,
            attempt: 0,
            deadline: None,
        }
    }

    pub fn state(&self) -> BackoffState {
        self.state
    }

    pub fn attempts(&self) -> usize {
        self.attempt
    }

    pub fn should_attempt_now(&self) -> bool {
        self.state == BackoffState::Attempting
    }

    pub fn have_all_attempts_failed(&self) -> bool {
        self.state == BackoffState::AllAttemptsFailed
    }

    /// The instant of the next state transition, if one is scheduled.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Record that the attempt due now has been made.
    ///
    /// The failure delay is folded into the last attempt's deadline so
    /// the timer moves straight to `AllAttemptsFailed` once it passes.
    pub fn notify_attempting(&mut self, now: Instant) {
        if self.state != BackoffState::Attempting {
            return;
        }

        let mut timeout = self.pattern.attempt_timeout(self.attempt);
        self.attempt += 1;
        if self.attempt >= self.pattern.max_attempts() {
            timeout += self.pattern.failure_delay();
        }

        self.deadline = Some(now + timeout);
        self.state = BackoffState::WaitingAfterAttempt;
    }

    /// Advance past any deadline that has elapsed and return the state.
    pub fn poll(&mut self, now: Instant) -> BackoffState {
        if self.state == BackoffState::WaitingAfterAttempt
            && self.deadline.is_some_and(|deadline| now >= deadline)
        {
            self.deadline = None;
            self.state = if self.attempt >= self.pattern.max_attempts() {
                BackoffState::AllAttemptsFailed
            } else {
                BackoffState::Attempting
            };
        }

        self.state
    }

    /// Forget all progress and make an attempt due immediately.
    pub fn reset(&mut self) {
        self.state = BackoffState::Attempting;
        self.attempt = 0;
        self.deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_doubles_from_500ms() {
        let pattern = BackoffPattern::stun_default();

        assert_eq!(pattern.max_attempts(), 6);
        for (attempt, expected) in [500u64, 1000, 2000, 4000, 8000, 16000].iter().enumerate() {
            assert_eq!(
                pattern.attempt_timeout(attempt),
                Duration::from_millis(*expected)
            );
        }
    }

    #[test]
    fn explicit_entries_take_precedence_over_the_multiplier() {
        let pattern = BackoffPattern::new(
            4,
            vec![Duration::from_millis(100), Duration::from_millis(300)],
            3.0,
            vec![],
        );

        assert_eq!(pattern.attempt_timeout(0), Duration::from_millis(100));
        assert_eq!(pattern.attempt_timeout(1), Duration::from_millis(300));
        assert_eq!(pattern.attempt_timeout(2), Duration::from_millis(900));
        assert_eq!(pattern.attempt_timeout(3), Duration::from_millis(2700));
    }

    #[test]
    fn timer_walks_the_schedule_and_fails_once() {
        let mut timer = BackoffTimer::new(BackoffPattern::new(
            2,
            vec![Duration::from_millis(500)],
            2.0,
            vec![Duration::from_millis(1)],
        ));

        let start = Instant::now();
        assert!(timer.should_attempt_now());

        timer.notify_attempting(start);
        assert_eq!(timer.state(), BackoffState::WaitingAfterAttempt);
        assert_eq!(timer.next_deadline(), Some(start + Duration::from_millis(500)));

        // the deadline has not elapsed yet.
        assert_eq!(
            timer.poll(start + Duration::from_millis(499)),
            BackoffState::WaitingAfterAttempt
        );
        assert_eq!(
            timer.poll(start + Duration::from_millis(500)),
            BackoffState::Attempting
        );

        // the failure delay rides on the last attempt's timeout.
        timer.notify_attempting(start + Duration::from_millis(500));
        assert_eq!(
            timer.next_deadline(),
            Some(start + Duration::from_millis(500 + 1000 + 1))
        );
        assert_eq!(
            timer.poll(start + Duration::from_millis(1501)),
            BackoffState::AllAttemptsFailed
        );
        assert!(timer.have_all_attempts_failed());

        // exhausted timers stay exhausted.
        timer.notify_attempting(start + Duration::from_millis(2000));
        assert_eq!(timer.state(), BackoffState::AllAttemptsFailed);

        timer.reset();
        assert!(timer.should_attempt_now());
        assert_eq!(timer.attempts(), 0);
    }
}
