use std::{
    fmt::{self, Display},
    ops::ControlFlow,
    time::{Duration, Instant},
};

const EXPONENTIAL_BACKOFF_MAX_WAIT_DURATION: Duration = Duration::from_secs(60);

/// A function that polls a fallible future until a wall-clock deadline passes.
///
/// Given a future that returns a [`Result<ControlFlow<O, ()>, E>`], this function calls the future
/// repeatedly (with some wait period) until the future returns a [`ControlFlow::Break`] or until it
/// returns an [`Err`] in which case the function stops polling and returns the error.
///
/// The deadline is measured from the moment this function is called and covers both the time
/// spent inside the polled futures and the time spent sleeping between them. A single attempt that
/// is still pending when the deadline passes is dropped.
///
/// [`Break`]: ControlFlow::Break
/// [`Continue`]: ControlFlow::Continue
pub async fn poll<F, O, E>(
    polling_duration: Duration,
    polling_wait_behavior: PollingWaitBehavior,
    mut future: impl FnMut() -> F,
) -> Result<O, PollingError<E>>
where
    F: Future<Output = Result<ControlFlow<O, ()>, E>>,
{
    let start = Instant::now();
    let deadline = start + polling_duration;
    let mut retries = 0u32;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let attempt = match tokio::time::timeout(remaining, future()).await {
            Ok(attempt) => attempt.map_err(PollingError::Failed)?,
            Err(_) => ControlFlow::Continue(()),
        };

        match attempt {
            ControlFlow::Break(output) => break Ok(output),
            ControlFlow::Continue(()) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break Err(PollingError::TimedOut {
                        retries,
                        elapsed: start.elapsed(),
                    });
                }

                let next_wait_duration = match polling_wait_behavior {
                    PollingWaitBehavior::Constant(duration) => duration,
                    PollingWaitBehavior::ExponentialBackoff => {
                        Duration::from_secs(2u64.saturating_pow(retries))
                            .min(EXPONENTIAL_BACKOFF_MAX_WAIT_DURATION)
                    }
                };
                retries += 1;

                tokio::time::sleep(next_wait_duration.min(remaining)).await;
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PollingWaitBehavior {
    Constant(Duration),
    #[default]
    ExponentialBackoff,
}

/// The reasons for which [`poll`] can stop without an output.
#[derive(Debug)]
pub enum PollingError<E> {
    /// The deadline passed while the polled future kept asking to continue.
    TimedOut { retries: u32, elapsed: Duration },
    /// The polled future returned an error; polling stopped right away.
    Failed(E),
}

impl<E: Display> Display for PollingError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut { retries, elapsed } => write!(
                f,
                "Polling failed after {retries} retries and a total of {elapsed:?} of wait time"
            ),
            Self::Failed(error) => write!(f, "Polled future returned an error: {error}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for PollingError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::TimedOut { .. } => None,
            Self::Failed(error) => Some(error),
        }
    }
}
