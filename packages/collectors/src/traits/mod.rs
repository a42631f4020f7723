//! Core capability traits.

pub mod source;
pub mod storage;

pub use source::{ItemStream, SourceAdapter};
pub use storage::StorageAdapter;
