//! Step failures and the captured form stored on a message.

use std::fmt;
use std::sync::Arc;

/// What a step function (or a consume hook) can fail with.
///
/// Not a `std::error::Error` itself; any error type converts into
/// [`StepError::Failed`] with `?`.
#[derive(Debug)]
pub enum StepError {
    /// Discard the message without retry and without the error callback.
    Drop(String),

    /// Ask for another in-process attempt.
    /// `times` overrides the policy's attempt budget for this failure.
    RetryLocal { reason: String, times: Option<u32> },

    /// Ask for redelivery through the queue.
    RetryQueue { reason: String, times: Option<u32> },

    /// Any other failure.
    Failed(anyhow::Error),
}

impl StepError {
    pub fn drop_message(reason: impl Into<String>) -> Self {
        Self::Drop(reason.into())
    }

    pub fn retry_local(reason: impl Into<String>) -> Self {
        Self::RetryLocal {
            reason: reason.into(),
            times: None,
        }
    }

    pub fn retry_queue(reason: impl Into<String>) -> Self {
        Self::RetryQueue {
            reason: reason.into(),
            times: None,
        }
    }

    /// Plain failure from a message.
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::Failed(anyhow::Error::msg(message))
    }

    pub fn from_anyhow(error: anyhow::Error) -> Self {
        Self::Failed(error)
    }

    /// Overrides the attempt budget of a retry signal. No effect on other variants.
    pub fn times(self, times: u32) -> Self {
        match self {
            Self::RetryLocal { reason, .. } => Self::RetryLocal {
                reason,
                times: Some(times),
            },
            Self::RetryQueue { reason, .. } => Self::RetryQueue {
                reason,
                times: Some(times),
            },
            other => other,
        }
    }

    pub fn is_drop(&self) -> bool {
        matches!(self, Self::Drop(_))
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drop(reason) => write!(f, "dropped: {reason}"),
            Self::RetryLocal { reason, .. } => write!(f, "retry locally: {reason}"),
            Self::RetryQueue { reason, .. } => write!(f, "retry via queue: {reason}"),
            Self::Failed(error) => write!(f, "{error}"),
        }
    }
}

impl<E> From<E> for StepError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::Failed(anyhow::Error::new(error))
    }
}

/// Classification of a captured failure, as seen by retry policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    RetryLocal { times: Option<u32> },
    RetryQueue { times: Option<u32> },
    Error,
}

impl FailureKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::RetryLocal { .. } => "RetryInLocal",
            Self::RetryQueue { .. } => "RetryInQueue",
            Self::Error => "Error",
        }
    }
}

/// The most recent failure recorded on a message.
///
/// Cheap to clone: the original error is kept behind an `Arc` so policies
/// can still downcast it.
#[derive(Debug, Clone)]
pub struct CapturedError {
    kind: FailureKind,
    message: String,
    trace: String,
    source: Option<Arc<anyhow::Error>>,
}

impl CapturedError {
    /// Captures `error`. Returns `None` for drop signals, which are never recorded.
    pub fn capture(error: StepError) -> Option<Self> {
        let captured = match error {
            StepError::Drop(_) => return None,
            StepError::RetryLocal { reason, times } => Self {
                kind: FailureKind::RetryLocal { times },
                trace: format!("RetryInLocal: {reason}"),
                message: reason,
                source: None,
            },
            StepError::RetryQueue { reason, times } => Self {
                kind: FailureKind::RetryQueue { times },
                trace: format!("RetryInQueue: {reason}"),
                message: reason,
                source: None,
            },
            StepError::Failed(error) => Self {
                kind: FailureKind::Error,
                message: error.to_string(),
                trace: format!("{error:?}"),
                source: Some(Arc::new(error)),
            },
        };
        Some(captured)
    }

    pub fn kind(&self) -> &FailureKind {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Human readable rendering, used for the wire `exception` field.
    pub fn trace(&self) -> &str {
        &self.trace
    }

    pub fn source(&self) -> Option<&anyhow::Error> {
        self.source.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_mark_lifts_std_errors() {
        fn parse(input: &str) -> Result<i64, StepError> {
            Ok(input.parse::<i64>()?)
        }

        let err = parse("nope").unwrap_err();
        let captured = CapturedError::capture(err).unwrap();
        assert_eq!(captured.kind(), &FailureKind::Error);
        assert!(
            captured
                .source()
                .unwrap()
                .is::<std::num::ParseIntError>()
        );
    }

    #[test]
    fn drop_signals_are_not_captured() {
        assert!(CapturedError::capture(StepError::drop_message("dup")).is_none());
    }

    #[test]
    fn times_only_applies_to_retry_signals() {
        let local = StepError::retry_local("busy").times(5);
        assert!(matches!(local, StepError::RetryLocal { times: Some(5), .. }));

        let failed = StepError::msg("boom").times(5);
        assert!(matches!(failed, StepError::Failed(_)));
    }

    #[test]
    fn retry_signal_trace_names_the_signal() {
        let captured = CapturedError::capture(StepError::retry_queue("later")).unwrap();
        assert_eq!(captured.trace(), "RetryInQueue: later");
        assert_eq!(captured.message(), "later");
        assert!(captured.source().is_none());
    }
}
