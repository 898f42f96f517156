//! Domain model: message envelope, step failures, retry decisions.

pub mod backoff;
pub mod failure;
pub mod message;
pub mod retry;

pub use self::backoff::Backoff;
pub use self::failure::{CapturedError, FailureKind, StepError};
pub use self::message::{Extra, Message, RawDelivery, RESERVED_EXTRA_KEYS};
pub use self::retry::{
    AdvancedRetry, AllRetry, AlwaysRetry, AnyRetry, NeverRetry, RetryIfError, RetryPolicy,
    RetryStatus, TimesRetry,
};
