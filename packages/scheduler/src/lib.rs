// HotStream - Scheduler Core
//
// Task scheduling and execution engine for HotStream collection jobs.
// Workers claim jobs from a shared store, run them through source adapters,
// and persist cleaned results through storage adapters.

pub mod config;
pub mod kernel;

pub use config::*;
