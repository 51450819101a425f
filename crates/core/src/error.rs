//! Error taxonomy shared across crates.

use serde::{Deserialize, Serialize};

/// Errors are cloneable so they can be fanned out on the operator channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum LumenError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("malformed change event: {0}")]
    MalformedEvent(String),
    #[error("entry closed: {0}")]
    Closed(String),
    #[error("config: {0}")]
    Config(String),
}

impl LumenError {
    pub fn fetch(e: &anyhow::Error) -> Self { Self::Fetch(format!("{:#}", e)) }
    pub fn unavailable(e: &anyhow::Error) -> Self { Self::SourceUnavailable(format!("{:#}", e)) }
}

pub type LumenResult<T> = Result<T, LumenError>;
