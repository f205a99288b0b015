//! Persistence contract for run lifecycle records
//!
//! The lifecycle logger only needs three capabilities from a datastore:
//! - create a record under a store-generated key
//! - stage several writes inside one transaction
//! - commit them together or roll them back
//!
//! Backends: `RedisRunStore` (production) and `MemoryRunStore` (local runs, tests).

use crate::types::{BuildKey, BuildRecord, LogKey, LogRecord};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unavailable(String),

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("key collision on {0}")]
    KeyCollision(String),

    #[error("transaction aborted: {0}")]
    Aborted(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[allow(async_fn_in_trait)]
pub trait RunStore {
    type Transaction: StoreTransaction;

    /// Persist a new build record and return the key the store assigned to it
    async fn create_build(&self, build: &BuildRecord) -> Result<BuildKey, StoreError>;

    /// Open a transaction; nothing staged in it is visible until `commit`
    async fn begin(&self) -> Result<Self::Transaction, StoreError>;
}

#[allow(async_fn_in_trait)]
pub trait StoreTransaction {
    async fn put_build(&mut self, key: &BuildKey, build: &BuildRecord) -> Result<(), StoreError>;

    /// Stage a log record under a key derived from its parent build
    async fn insert_log(&mut self, log: &LogRecord) -> Result<LogKey, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}
