//! Adapters for the scheduler's external collaborators: the document
//! store holding job and clientgroup records, and the blob store holding
//! input/output data. Both are defined by traits; the in-memory
//! implementations back the binary's default wiring and the tests.

pub mod blobstore;
pub mod datastore;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

pub use blobstore::{BlobStore, IndexInfo, MemoryBlobStore};
pub use datastore::{DataStore, MemoryStore};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("index {index} unavailable on node {node}")]
    IndexUnavailable { node: String, index: String },

    #[error("blob store unavailable: {0}")]
    Unavailable(String),
}

/// Retry a transient collaborator call with exponential backoff; the
/// last error surfaces once `attempts` is exhausted.
pub async fn with_backoff<T, E, F, Fut>(attempts: u32, base: Duration, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = base;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                tracing::warn!(%err, attempt, "collaborator call failed, backing off");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
