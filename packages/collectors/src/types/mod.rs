//! Data types shared by adapters and the job engine.

pub mod item;
pub mod options;

pub use item::{derive_item_id, CollectedItem, RawItem};
pub use options::{Credentials, ItemFilter, RateLimitInfo, SearchOptions};
