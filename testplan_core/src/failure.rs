//! Failure aggregation for fan-out operations over a peer set.
//!
//! A fan-out (pushing to every remote, dialing every peer) tolerates partial
//! success: a failure against one peer must not stop the attempts against
//! the others, and none of the individual failures may be lost. Failures
//! are kept in the order they were accumulated and rendered one per line.

use futures::future::join_all;
use std::fmt;
use std::future::Future;

/// An ordered, non-empty list of failure messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedError {
    failures: Vec<String>,
}

impl AggregatedError {
    /// Creates an error holding a single failure.
    pub fn new(failure: impl fmt::Display) -> Self {
        Self {
            failures: vec![failure.to_string()],
        }
    }

    /// Individual failure messages, in accumulation order.
    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for AggregatedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.failures.join("\n"))
    }
}

impl std::error::Error for AggregatedError {}

/// Combines an accumulated error with a new one.
///
/// `combine(None, e) == e`; otherwise the result holds every message of
/// `existing` followed by every message of `new`.
pub fn combine(existing: Option<AggregatedError>, new: AggregatedError) -> AggregatedError {
    match existing {
        None => new,
        Some(mut acc) => {
            acc.failures.extend(new.failures);
            acc
        }
    }
}

/// Append-only accumulator used while a fan-out is in flight.
#[derive(Debug, Clone, Default)]
pub struct FailureAggregator {
    combined: Option<AggregatedError>,
}

impl FailureAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one failure.
    pub fn record(&mut self, failure: impl fmt::Display) {
        self.combined = Some(combine(self.combined.take(), AggregatedError::new(failure)));
    }

    /// Folds another aggregated error in, keeping its order.
    pub fn absorb(&mut self, other: AggregatedError) {
        self.combined = Some(combine(self.combined.take(), other));
    }

    pub fn is_empty(&self) -> bool {
        self.combined.is_none()
    }

    pub fn len(&self) -> usize {
        self.combined.as_ref().map_or(0, AggregatedError::len)
    }

    /// Returns the combined error, if anything was recorded.
    pub fn into_error(self) -> Option<AggregatedError> {
        self.combined
    }

    /// Success when nothing was recorded, the combined error otherwise.
    pub fn into_result(self) -> Result<(), AggregatedError> {
        match self.combined {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

/// Runs `op` against every target concurrently and aggregates the failures.
///
/// Failures are accumulated in target order, not completion order, so two
/// runs over the same targets report identically.
pub async fn fan_out<T, F, Fut, E>(targets: impl IntoIterator<Item = T>, op: F) -> FailureAggregator
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: fmt::Display,
{
    let results = join_all(targets.into_iter().map(op)).await;

    let mut failures = FailureAggregator::new();
    for result in results {
        if let Err(err) = result {
            failures.record(err);
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_combine_with_nothing_is_identity() {
        let e1 = AggregatedError::new("error pushing to a");
        assert_eq!(combine(None, e1.clone()), e1);
    }

    #[test]
    fn test_combine_preserves_order_and_text() {
        let e1 = AggregatedError::new("error pushing to a");
        let e2 = AggregatedError::new("error pushing to b");

        let combined = combine(Some(combine(None, e1)), e2);

        assert_eq!(combined.failures(), &["error pushing to a", "error pushing to b"]);
        assert_eq!(combined.to_string(), "error pushing to a\nerror pushing to b");
    }

    #[test]
    fn test_aggregator_empty_is_success() {
        let failures = FailureAggregator::new();
        assert!(failures.is_empty());
        assert!(failures.into_result().is_ok());
    }

    #[test]
    fn test_aggregator_absorb() {
        let mut failures = FailureAggregator::new();
        failures.record("one");
        failures.absorb(combine(Some(AggregatedError::new("two")), AggregatedError::new("three")));

        assert_eq!(failures.len(), 3);
        let err = failures.into_result().unwrap_err();
        assert_eq!(err.failures(), &["one", "two", "three"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_reports_in_target_order() {
        // Later targets finish first
        let failures = fan_out(0..4u64, |i| async move {
            tokio::time::sleep(Duration::from_millis(100 - i * 20)).await;
            if i % 2 == 1 {
                Err(format!("peer {i} failed"))
            } else {
                Ok(())
            }
        })
        .await;

        let err = failures.into_result().unwrap_err();
        assert_eq!(err.failures(), &["peer 1 failed", "peer 3 failed"]);
    }

    #[tokio::test]
    async fn test_fan_out_keeps_going_after_failure() {
        let attempts = std::sync::atomic::AtomicUsize::new(0);
        let failures = fan_out(0..5, |i| {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if i == 0 {
                    Err("first peer down")
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 5);
        assert_eq!(failures.len(), 1);
    }
}
