//! Structured cancellation primitives.
//!
//! This module provides:
//! - `CancelToken`, a named one-shot asynchronous cancel action
//! - `Connection`, the per-computation stack of revocable cancel actions
//! - `ForwardCancellable`, the rendezvous that back-pressures an early cancel
//!   until a concrete token is known

mod connection;
mod forward;
mod token;

pub use connection::Connection;
pub use forward::ForwardCancellable;
pub use token::{CancelFuture, CancelToken};
