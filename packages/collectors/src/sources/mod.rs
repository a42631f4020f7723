//! Source adapter implementations.
//!
//! Platform adapters live with the applications that own their credentials;
//! this crate ships only the mock used by tests and local runs.

pub mod mock;

pub use mock::{MockCalls, MockSource};
