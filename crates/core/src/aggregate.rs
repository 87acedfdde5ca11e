//! Aggregate identity and optimistic concurrency primitives.

use crate::id::AggregateId;

/// Aggregate root marker + minimal interface.
///
/// Anything that owns an event stream exposes its identity and the highest
/// event version it has applied (0 for a brand-new entity).
pub trait AggregateRoot {
    /// Returns the aggregate identifier.
    fn id(&self) -> &AggregateId;

    /// Monotonically increasing version of the aggregate's state.
    ///
    /// For event-sourced aggregates this is the version of the last applied
    /// event (the stream revision).
    fn version(&self) -> u64;
}

/// Optimistic concurrency expectation for a commit.
///
/// A commit must extend the stream from exactly the version it was loaded
/// against (compare-and-swap on the stream version).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// The stream must not exist yet (brand-new entity).
    NoStream,
    /// The stream's last stored event must carry this version.
    Exact(u64),
}

impl ExpectedVersion {
    /// Expectation derived from the last committed event version, if any.
    pub fn from_last(last: Option<u64>) -> Self {
        match last {
            Some(v) => ExpectedVersion::Exact(v),
            None => ExpectedVersion::NoStream,
        }
    }

    pub fn as_option(self) -> Option<u64> {
        match self {
            ExpectedVersion::NoStream => None,
            ExpectedVersion::Exact(v) => Some(v),
        }
    }

    /// Whether the stored stream version (`None` = no events) satisfies this expectation.
    pub fn matches(self, actual: Option<u64>) -> bool {
        self.as_option() == actual
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_stream_only_matches_missing_stream() {
        assert!(ExpectedVersion::NoStream.matches(None));
        assert!(!ExpectedVersion::NoStream.matches(Some(1)));
    }

    #[test]
    fn exact_matches_same_version_only() {
        assert!(ExpectedVersion::Exact(3).matches(Some(3)));
        assert!(!ExpectedVersion::Exact(3).matches(Some(4)));
        assert!(!ExpectedVersion::Exact(3).matches(None));
    }
}
