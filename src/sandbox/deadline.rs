//! Caller-supplied deadline that bounds every blocking sandbox operation.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// An optional point in time after which sandbox operations give up.
///
/// Expiry never kills an in-flight process by itself; it makes the next
/// blocking read or wait return a timeout error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline that never expires.
    pub fn none() -> Self {
        Self(None)
    }

    /// A deadline `duration` from now; unbounded if that overflows.
    pub fn after(duration: Duration) -> Self {
        Self(Instant::now().checked_add(duration))
    }

    /// A deadline at a fixed instant.
    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    /// Returns true once the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left before expiry, if bounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// The tighter of the remaining time and `limit`.
    pub fn budget(&self, limit: Option<Duration>) -> Option<Duration> {
        match (self.remaining(), limit) {
            (Some(left), Some(limit)) => Some(left.min(limit)),
            (left, limit) => left.or(limit),
        }
    }

    /// Drives `fut` to completion unless the budget runs out first.
    ///
    /// Returns `None` on expiry.
    pub async fn bound<F: Future>(&self, limit: Option<Duration>, fut: F) -> Option<F::Output> {
        match self.budget(limit) {
            Some(budget) => tokio::time::timeout(budget, fut).await.ok(),
            None => Some(fut.await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_never_expires() {
        let deadline = Deadline::none();
        assert!(!deadline.is_expired());
        assert_eq!(deadline.remaining(), None);
        assert_eq!(deadline.budget(None), None);
        assert_eq!(
            deadline.budget(Some(Duration::from_secs(3))),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn test_after_overflow_is_unbounded() {
        assert_eq!(Deadline::after(Duration::MAX), Deadline::none());
    }

    #[tokio::test]
    async fn test_budget_picks_tighter_bound() {
        let deadline = Deadline::after(Duration::from_secs(60));
        let budget = deadline.budget(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(budget, Duration::from_secs(5));

        let budget = deadline.budget(Some(Duration::from_secs(600))).unwrap();
        assert!(budget <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_bound_times_out() {
        let deadline = Deadline::after(Duration::from_millis(20));
        let result = deadline
            .bound(None, tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert!(result.is_none());
        assert!(deadline.is_expired());
    }

    #[tokio::test]
    async fn test_bound_completes() {
        let result = Deadline::none()
            .bound(Some(Duration::from_secs(5)), async { 7 })
            .await;
        assert_eq!(result, Some(7));
    }
}
