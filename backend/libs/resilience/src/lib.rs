//! Resilience helpers shared by the sync engine crates
//!
//! - **Retry**: exponential backoff with jitter for transient failures
//! - **Conditional retry**: retry only the error kinds a predicate accepts
//!   (e.g. a lost per-group sequence race), surface everything else at once
//!
//! # Example
//!
//! ```rust,no_run
//! use resilience::{with_retry_if, RetryConfig};
//!
//! #[derive(Debug)]
//! enum AppendError { Conflict, Fatal }
//!
//! impl std::fmt::Display for AppendError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{:?}", self)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let result = with_retry_if(
//!         RetryConfig::default(),
//!         |e: &AppendError| matches!(e, AppendError::Conflict),
//!         || async { Ok::<_, AppendError>(1) },
//!     )
//!     .await;
//!     assert!(result.is_ok());
//! }
//! ```

pub mod retry;

pub use retry::{with_retry, with_retry_if, RetryConfig, RetryError};
