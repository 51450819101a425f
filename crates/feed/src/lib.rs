//! Lumen feed: the bundled in-memory data source and the change-feed driver
//! that keeps a registry reconciled.

#![forbid(unsafe_code)]

pub mod driver;
pub mod matcher;
pub mod memory;

pub use driver::{run_feed, FeedHandle};
pub use memory::MemoryCollection;
