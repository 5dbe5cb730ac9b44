//! Circuit breaker guarding the hub against a failing bus.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy)]
enum State {
    Closed { consecutive_errors: u32 },
    Open { until: Instant },
}

pub struct CircuitBreaker {
    threshold: u32,
    open_timeout: Duration,
    state: Mutex<State>,
    last_error_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(threshold: u32, open_timeout: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            open_timeout,
            state: Mutex::new(State::Closed {
                consecutive_errors: 0,
            }),
            last_error_at: Mutex::new(None),
        }
    }

    /// True while the circuit is open and the timeout has not elapsed.
    /// After the timeout, callers may probe again (half-open).
    #[must_use]
    pub fn is_open(&self) -> bool {
        match *self.lock() {
            State::Closed { .. } => false,
            State::Open { until } => Instant::now() < until,
        }
    }

    /// Record a connection-class failure. Returns true when this failure
    /// opened (or re-armed) the circuit.
    pub fn record_error(&self) -> bool {
        *self
            .last_error_at
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        let mut state = self.lock();
        match *state {
            State::Closed { consecutive_errors } => {
                let consecutive_errors = consecutive_errors + 1;
                if consecutive_errors >= self.threshold {
                    *state = State::Open {
                        until: Instant::now() + self.open_timeout,
                    };
                    true
                } else {
                    *state = State::Closed { consecutive_errors };
                    false
                }
            },
            State::Open { .. } => {
                // Failed probe: re-arm the window.
                *state = State::Open {
                    until: Instant::now() + self.open_timeout,
                };
                false
            },
        }
    }

    /// Record a success (a delivered publish or a health ping). Returns true
    /// when this closed a previously open circuit.
    pub fn record_success(&self) -> bool {
        let mut state = self.lock();
        let was_open = matches!(*state, State::Open { .. });
        *state = State::Closed {
            consecutive_errors: 0,
        };
        was_open
    }

    #[must_use]
    pub fn last_error_at(&self) -> Option<Instant> {
        *self
            .last_error_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
