//! Lumen core types
//!
//! Query parameters and their fingerprints, change-feed events, change
//! descriptors, the document identity capability and the `DataSource` seam
//! the query cache fetches through.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod event;
pub mod identity;
pub mod query;
pub mod source;

pub use config::CacheConfig;
pub use error::{LumenError, LumenResult};
pub use event::{ChangeDescriptor, ChangeEvent, ChangeKind, Document, Operation};
pub use identity::{CanonicalEq, Identity, KeyEquivalence, StructuralEq};
pub use query::{Direction, Fingerprint, QueryParams, SortKey};
pub use source::{DataSource, RawChangeStream};

pub mod prelude {
    pub use super::{
        CacheConfig, ChangeDescriptor, ChangeEvent, ChangeKind, DataSource, Document, Fingerprint,
        Identity, LumenError, LumenResult, Operation, QueryParams, SortKey,
    };
}
