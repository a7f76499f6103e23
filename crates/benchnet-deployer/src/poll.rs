//! Bounded polling of externally observed conditions.

use std::time::Duration;

use tracing::{debug, warn};

/// How many times a condition is checked, and how long to wait between checks.
///
/// The budget is a hard ceiling: [`poll_until`] checks exactly `attempts` times before giving
/// up and never sleeps after the final check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl PollPolicy {
    /// Waiting for a freshly started node to produce its first block.
    pub const LIVENESS: Self = Self::new(10, Duration::from_secs(1));

    /// Waiting for a provisioned host to become active.
    pub const PROVISIONING: Self = Self::new(250, Duration::from_secs(2));

    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Upper bound on the wall-clock time spent sleeping.
    pub fn ceiling(&self) -> Duration {
        self.interval * self.attempts.saturating_sub(1)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PollError<E: std::error::Error + 'static> {
    #[error("{description}: condition not met after {attempts} attempts")]
    Exhausted {
        description: String,
        attempts: u32,
        /// The most recent error returned by the check, if any.
        #[source]
        last_error: Option<E>,
    },
}

impl<E: std::error::Error + 'static> PollError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Exhausted { last_error, .. } => last_error.as_ref(),
        }
    }
}

/// Repeatedly run `check` until it yields a value, or the policy's budget runs out.
///
/// `Ok(None)` means "not yet"; errors are logged and retried within the same budget.
/// Dropping the returned future cancels the poll.
pub async fn poll_until<T, E, F, Fut>(
    policy: &PollPolicy,
    description: &str,
    mut check: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
    E: std::error::Error + 'static,
{
    let mut last_error = None;
    for attempt in 1..=policy.attempts {
        match check().await {
            Ok(Some(value)) => {
                debug!(attempt, "{description}: condition met");
                return Ok(value);
            }
            Ok(None) => debug!(attempt, attempts = policy.attempts, "{description}: not yet"),
            Err(e) => {
                warn!(attempt, attempts = policy.attempts, "{description}: error (retrying): {e}");
                last_error = Some(e);
            }
        }
        if attempt < policy.attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }
    Err(PollError::Exhausted {
        description: description.to_string(),
        attempts: policy.attempts,
        last_error,
    })
}
