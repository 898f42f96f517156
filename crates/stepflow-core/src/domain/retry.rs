//! Retry policies: pure decisions over a failed message.
//!
//! A policy only looks at the message (its captured exception and
//! `failure_count`) and answers with a [`RetryStatus`]. Acting on the answer
//! is the worker's job.

use std::sync::Arc;

use super::failure::FailureKind;
use super::message::Message;

/// What to do with a message whose step just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryStatus {
    /// Run the step again, in-process, with the same message.
    Continue,
    /// Give up: run the error callback, then reject.
    EndWithCallback,
    /// Give up here and requeue through the broker, without the callback.
    EndIgnoreCallback,
}

/// Decides how a failed message proceeds.
pub trait RetryPolicy: Send + Sync {
    fn decide(&self, message: &Message) -> RetryStatus;
}

impl<F> RetryPolicy for F
where
    F: Fn(&Message) -> RetryStatus + Send + Sync,
{
    fn decide(&self, message: &Message) -> RetryStatus {
        self(message)
    }
}

type ErrorMatcher = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

fn matcher_for<T>() -> ErrorMatcher
where
    T: std::error::Error + Send + Sync + 'static,
{
    Arc::new(|error: &anyhow::Error| error.is::<T>())
}

/// Never retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetry;

impl RetryPolicy for NeverRetry {
    fn decide(&self, _message: &Message) -> RetryStatus {
        RetryStatus::EndWithCallback
    }
}

/// Retry forever, in-process.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetry;

impl RetryPolicy for AlwaysRetry {
    fn decide(&self, _message: &Message) -> RetryStatus {
        RetryStatus::Continue
    }
}

/// Retry in-process while `failure_count < times`.
#[derive(Debug, Clone, Copy)]
pub struct TimesRetry {
    pub times: u32,
}

impl TimesRetry {
    pub fn new(times: u32) -> Self {
        Self { times }
    }
}

impl Default for TimesRetry {
    fn default() -> Self {
        Self { times: 3 }
    }
}

impl RetryPolicy for TimesRetry {
    fn decide(&self, message: &Message) -> RetryStatus {
        if message.failure_count() < self.times {
            RetryStatus::Continue
        } else {
            RetryStatus::EndWithCallback
        }
    }
}

/// Retry in-process (without limit) while the captured error matches.
#[derive(Clone, Default)]
pub struct RetryIfError {
    any: bool,
    matchers: Vec<ErrorMatcher>,
}

impl RetryIfError {
    /// Matches nothing until `on` / `matching` add a matcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Matches every captured failure.
    pub fn any() -> Self {
        Self {
            any: true,
            matchers: Vec::new(),
        }
    }

    pub fn on<T>(mut self) -> Self
    where
        T: std::error::Error + Send + Sync + 'static,
    {
        self.matchers.push(matcher_for::<T>());
        self
    }

    pub fn matching<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.matchers.push(Arc::new(predicate));
        self
    }
}

impl RetryPolicy for RetryIfError {
    fn decide(&self, message: &Message) -> RetryStatus {
        let Some(exception) = message.exception() else {
            return RetryStatus::EndWithCallback;
        };
        if self.any {
            return RetryStatus::Continue;
        }
        match exception.source() {
            Some(error) if self.matchers.iter().any(|m| m(error)) => RetryStatus::Continue,
            _ => RetryStatus::EndWithCallback,
        }
    }
}

/// Honors explicit retry signals and retries selected error types.
///
/// - `RetryLocal`: in-process while `failure_count < budget`.
/// - `RetryQueue`: requeue while `failure_count < budget`.
/// - listed error types: in-process while `failure_count < times`.
/// - anything else, or an exhausted budget: error callback, then reject.
///
/// A signal's own `times` overrides the policy budget.
#[derive(Clone)]
pub struct AdvancedRetry {
    times: u32,
    matchers: Vec<ErrorMatcher>,
}

impl AdvancedRetry {
    pub fn new(times: u32) -> Self {
        Self {
            times,
            matchers: Vec::new(),
        }
    }

    /// Only the two retry signals, no extra error types.
    pub fn local_and_queue(times: u32) -> Self {
        Self::new(times)
    }

    pub fn on<T>(mut self) -> Self
    where
        T: std::error::Error + Send + Sync + 'static,
    {
        self.matchers.push(matcher_for::<T>());
        self
    }

    pub fn matching<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.matchers.push(Arc::new(predicate));
        self
    }

    pub fn times(&self) -> u32 {
        self.times
    }
}

impl Default for AdvancedRetry {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryPolicy for AdvancedRetry {
    fn decide(&self, message: &Message) -> RetryStatus {
        let Some(exception) = message.exception() else {
            return RetryStatus::EndWithCallback;
        };
        let failures = message.failure_count();

        match exception.kind() {
            FailureKind::RetryLocal { times } => {
                if failures < times.unwrap_or(self.times) {
                    RetryStatus::Continue
                } else {
                    RetryStatus::EndWithCallback
                }
            }
            FailureKind::RetryQueue { times } => {
                if failures < times.unwrap_or(self.times) {
                    RetryStatus::EndIgnoreCallback
                } else {
                    RetryStatus::EndWithCallback
                }
            }
            FailureKind::Error => {
                let listed = exception
                    .source()
                    .is_some_and(|error| self.matchers.iter().any(|m| m(error)));
                if listed && failures < self.times {
                    RetryStatus::Continue
                } else {
                    RetryStatus::EndWithCallback
                }
            }
        }
    }
}

/// AND-composition: the first non-`Continue` answer wins.
#[derive(Clone, Default)]
pub struct AllRetry {
    policies: Vec<Arc<dyn RetryPolicy>>,
}

impl AllRetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.policies.push(Arc::new(policy));
        self
    }
}

impl RetryPolicy for AllRetry {
    fn decide(&self, message: &Message) -> RetryStatus {
        for policy in &self.policies {
            let status = policy.decide(message);
            if status != RetryStatus::Continue {
                return status;
            }
        }
        RetryStatus::Continue
    }
}

/// OR-composition: the first `Continue` wins, otherwise the last answer.
#[derive(Clone, Default)]
pub struct AnyRetry {
    policies: Vec<Arc<dyn RetryPolicy>>,
}

impl AnyRetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.policies.push(Arc::new(policy));
        self
    }
}

impl RetryPolicy for AnyRetry {
    fn decide(&self, message: &Message) -> RetryStatus {
        let mut last = RetryStatus::EndWithCallback;
        for policy in &self.policies {
            last = policy.decide(message);
            if last == RetryStatus::Continue {
                break;
            }
        }
        last
    }
}
