//! Suspension-based synchronization primitives.
//!
//! This module provides:
//! - `Promise`, a single-assignment signal cell
//! - `Semaphore`, a fair counting semaphore built on bracket

mod promise;
mod semaphore;

pub use promise::Promise;
pub use semaphore::Semaphore;
