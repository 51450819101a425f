//! The data-source seam: one ordered fetch and one raw change stream.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::event::Document;
use crate::query::QueryParams;

/// Raw change events as produced by the source (change-stream shaped JSON).
pub type RawChangeStream = BoxStream<'static, anyhow::Result<Value>>;

/// Remote mutable document collection.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Authoritative ordered result for `params`; must honour filter, sort, skip and limit.
    async fn fetch(&self, params: &QueryParams) -> anyhow::Result<Vec<Document>>;

    /// Open the change feed. Ending or erroring the stream means disconnected.
    async fn watch(&self) -> anyhow::Result<RawChangeStream>;
}
