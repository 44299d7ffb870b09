//! # pg-pool-testing
//!
//! Test infrastructure for `pg-session-pool` development.
//!
//! Provides an in-memory [`MockDriver`] implementing the pool's driver
//! traits, with scriptable per-backend activity states, failure
//! injection, and operation counters. The pool's behavior tests live in
//! this crate's `tests/` directory to avoid a circular dev-dependency on
//! the pool crate.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod mock;

pub use mock::{MockBackend, MockDriver, MockQueryHandle, MockSession};
