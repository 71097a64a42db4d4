//! Fault-tolerant execution: classification, circuit breaking, retries.

mod breaker;
mod classify;
mod executor;

pub use breaker::{Admission, BreakerState, CircuitBreaker};
pub use classify::{classify, classify_message, ErrorClass, ErrorKind, Priority};
pub use executor::{RetryAttempt, RetryExecutor, RetryMetrics, RetryOutcome, RetryPolicy};
