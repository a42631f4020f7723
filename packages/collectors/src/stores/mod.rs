//! Storage implementations.
//!
//! Available backends:
//! - `MemoryStorage` - In-memory storage (always available)
//! - `JsonFileStorage` - JSON files grouped by source (always available)
//! - `PostgresStorage` - PostgreSQL storage (requires `postgres` feature)

pub mod json;
pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use json::JsonFileStorage;
pub use memory::MemoryStorage;

#[cfg(feature = "postgres")]
pub use postgres::PostgresStorage;
