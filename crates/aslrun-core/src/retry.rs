//! Retry and catch resolution for failed states.
//!
//! Stateless: `RetryHandler` works from the state's declared retriers and
//! catchers plus a `RetryCounters` value that the caller owns for the
//! duration of one state entry. A fresh entry (including a new Map iteration
//! or Parallel branch) starts with fresh counters.

use std::time::Duration;

use aslrun_types::definition::{Catcher, JitterStrategy, Retrier};
use aslrun_types::error::ErrorRecord;
use rand::Rng;
use serde_json::Value;

use crate::dataflow;

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

/// What to do about a failed state invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Recovery {
    /// Re-invoke the state after `delay`. `attempt` is the 1-based number of
    /// the upcoming invocation as counted by the matched retrier.
    Retry { attempt: u32, delay: Duration },
    /// Continue at `next` with the error injected into the raw input.
    Catch { next: String, output: Value },
    /// Nothing handled the error; the state fails with it.
    Propagate(ErrorRecord),
}

/// Per-retrier count of failed invocations within one state entry.
#[derive(Debug, Clone, Default)]
pub struct RetryCounters {
    failures: Vec<u32>,
    retries: u32,
}

impl RetryCounters {
    pub fn new(retriers: usize) -> Self {
        Self {
            failures: vec![0; retriers],
            retries: 0,
        }
    }

    /// Total retries scheduled so far across all retriers.
    pub fn total(&self) -> u32 {
        self.retries
    }

    fn record(&mut self, index: usize) -> u32 {
        if self.failures.len() <= index {
            self.failures.resize(index + 1, 0);
        }
        self.failures[index] += 1;
        self.failures[index]
    }
}

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

pub struct RetryHandler;

impl RetryHandler {
    /// Index of the first retrier whose `ErrorEquals` matches.
    pub fn matching_retrier(retriers: &[Retrier], error: &ErrorRecord) -> Option<usize> {
        retriers
            .iter()
            .position(|r| r.error_equals.iter().any(|name| error.matches(name)))
    }

    /// First catcher whose `ErrorEquals` matches.
    pub fn matching_catcher<'c>(catchers: &'c [Catcher], error: &ErrorRecord) -> Option<&'c Catcher> {
        catchers
            .iter()
            .find(|c| c.error_equals.iter().any(|name| error.matches(name)))
    }

    /// Delay before retry number `retry` (1-based):
    /// `IntervalSeconds * BackoffRate^(retry - 1)`, capped by `MaxDelaySeconds`.
    pub fn backoff_delay(retrier: &Retrier, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = retrier.interval_seconds as f64 * retrier.backoff_rate.powi(exponent);

        let delay = if secs.is_nan() || secs <= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
        };

        match retrier.max_delay_seconds {
            Some(max) => delay.min(Duration::from_secs(max)),
            None => delay,
        }
    }

    /// Apply the retrier's jitter strategy to a computed delay.
    pub fn apply_jitter(delay: Duration, strategy: JitterStrategy) -> Duration {
        match strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                let max_ms = saturating_millis(delay);
                Duration::from_millis(rand::rng().random_range(0..=max_ms))
            }
        }
    }

    /// Decide how to recover from `error`.
    ///
    /// Retriers are scanned first; a matching retrier that still has
    /// attempts left schedules a retry. Otherwise catchers are scanned, and a
    /// match injects `{"Error", "Cause"}` at the catcher's `ResultPath` into
    /// `raw_input`. A catcher whose `ResultPath` cannot be applied propagates
    /// the resulting `States.ResultPathMatchFailure`.
    pub fn resolve(
        retriers: &[Retrier],
        catchers: &[Catcher],
        error: ErrorRecord,
        raw_input: &Value,
        counters: &mut RetryCounters,
    ) -> Recovery {
        if let Some(index) = Self::matching_retrier(retriers, &error) {
            let retrier = &retriers[index];
            let failures = counters.record(index);
            if failures < retrier.max_attempts {
                counters.retries += 1;
                let delay = Self::apply_jitter(
                    Self::backoff_delay(retrier, failures),
                    retrier.jitter_strategy,
                );
                return Recovery::Retry {
                    attempt: failures + 1,
                    delay,
                };
            }
        }

        match Self::matching_catcher(catchers, &error) {
            Some(catcher) => {
                match dataflow::apply_result_path(&catcher.result_path, raw_input, error.to_value()) {
                    Ok(output) => Recovery::Catch {
                        next: catcher.next.clone(),
                        output,
                    },
                    Err(e) => Recovery::Propagate(e),
                }
            }
            None => Recovery::Propagate(error),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Whole milliseconds in `delay`, clamped to `u64::MAX`.
pub(crate) fn saturating_millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}
