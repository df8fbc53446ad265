//! Download engine
//!
//! Moves records from PENDING to a terminal state:
//! - Bounded admission in id order
//! - Resumable single-stream transfers through `.part` files
//! - Exponential backoff on transient failures
//! - Pause and resume on connectivity changes

mod manager;
mod retry;
mod transfer;

pub use manager::*;
pub use retry::with_retry;
