// Retry, timeout and backoff policy applied to every remote backend call.
// Retry state lives on the stack of each call; nothing here is shared mutable.

pub mod retry;

pub use retry::{backoff_delay, execute_with_retry, AttemptTimeout, RetryPolicy};
