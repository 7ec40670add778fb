//! Poll-with-backoff helper shared by every asynchronous remote job and by
//! callers waiting on another worker's pending derivation.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use tracing::debug;

const INITIAL_BACKOFF_MS: u64 = 1000;
const MAX_BACKOFF_MS: u64 = 60000;
const BACKOFF_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
    /// Overall bound on time spent polling, None for attempts only
    pub deadline: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_delay: Duration::from_millis(MAX_BACKOFF_MS),
            multiplier: BACKOFF_MULTIPLIER,
            max_attempts: 120,
            deadline: None,
        }
    }
}

impl PollPolicy {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self.max_attempts = u32::MAX;
        self
    }

    pub fn next_delay(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier.max(1.0)).min(self.max_delay)
    }
}

/// Outcome of one check
#[derive(Debug, Clone, PartialEq)]
pub enum PollState<T> {
    Ready(T),
    Pending,
}

#[derive(Debug)]
pub enum PollError<E> {
    /// The check itself failed; polling stops immediately
    Failed(E),
    /// Still pending when attempts or the deadline ran out
    Exhausted { attempts: u32, elapsed: Duration },
}

impl<E: fmt::Display> fmt::Display for PollError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollError::Failed(err) => write!(f, "{}", err),
            PollError::Exhausted { attempts, elapsed } => write!(
                f,
                "still pending after {} attempts ({:.1}s)",
                attempts,
                elapsed.as_secs_f64()
            ),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for PollError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PollError::Failed(err) => Some(err),
            PollError::Exhausted { .. } => None,
        }
    }
}

/// Call `check` until it reports `Ready`, sleeping with exponential backoff
/// between pending results. The check receives the 1-based attempt number.
pub async fn poll_with_backoff<T, E, F, Fut>(policy: &PollPolicy, mut check: F) -> Result<T, PollError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<PollState<T>, E>>,
{
    let started = Instant::now();
    let mut delay = policy.initial_delay;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        if let PollState::Ready(value) = check(attempt).await.map_err(PollError::Failed)? {
            return Ok(value);
        }

        let elapsed = started.elapsed();
        if attempt >= policy.max_attempts {
            return Err(PollError::Exhausted { attempts: attempt, elapsed });
        }

        let mut sleep_for = delay;
        if let Some(deadline) = policy.deadline {
            if elapsed >= deadline {
                return Err(PollError::Exhausted { attempts: attempt, elapsed });
            }
            sleep_for = sleep_for.min(deadline - elapsed);
        }

        debug!("Poll attempt {} pending, retrying in {:?}", attempt, sleep_for);
        tokio::time::sleep(sleep_for).await;
        delay = policy.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy(max_attempts: u32) -> PollPolicy {
        PollPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
            max_attempts,
            deadline: None,
        }
    }

    #[tokio::test]
    async fn test_ready_after_pending_attempts() {
        let result: Result<u32, PollError<String>> =
            poll_with_backoff(&fast_policy(10), |attempt| async move {
                if attempt < 3 {
                    Ok(PollState::Pending)
                } else {
                    Ok(PollState::Ready(attempt))
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_after_max_attempts() {
        let result: Result<(), PollError<String>> =
            poll_with_backoff(&fast_policy(4), |_| async { Ok(PollState::Pending) }).await;
        match result {
            Err(PollError::Exhausted { attempts, .. }) => assert_eq!(attempts, 4),
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_check_error_stops_polling() {
        let mut calls = 0;
        let result: Result<(), PollError<String>> = poll_with_backoff(&fast_policy(10), |_| {
            calls += 1;
            async { Err("job failed".to_string()) }
        })
        .await;
        assert_eq!(calls, 1);
        assert_eq!(result.unwrap_err().to_string(), "job failed");
    }

    #[tokio::test]
    async fn test_deadline_bounds_polling() {
        let policy = fast_policy(1).with_deadline(Duration::from_millis(20));
        let started = Instant::now();
        let result: Result<(), PollError<String>> =
            poll_with_backoff(&policy, |_| async { Ok(PollState::Pending) }).await;
        assert!(matches!(result, Err(PollError::Exhausted { .. })));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_next_delay_is_capped() {
        let policy = PollPolicy::default();
        assert_eq!(policy.next_delay(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(policy.next_delay(Duration::from_secs(50)), Duration::from_secs(60));
    }
}
