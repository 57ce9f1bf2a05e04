//! Utility modules for clipq-seq

pub mod retry;

pub use retry::{exponential_backoff, retry_with_backoff, RetryPolicy};
