//! Resilient client for the MagicCV backend.
//!
//! Every auth, table and storage call made through [`RetryingClient`] is
//! bounded to a fixed number of attempts, each with its own timeout, with
//! exponential backoff in between.

pub mod config;
pub mod errors;
pub mod resilience;
pub mod retrying;
pub mod supabase;

pub use config::Config;
pub use errors::BackendError;
pub use resilience::{execute_with_retry, RetryPolicy};
pub use retrying::RetryingClient;
pub use supabase::SupabaseClient;
