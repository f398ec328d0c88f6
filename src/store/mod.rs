//! Key-value persistence
//!
//! Records are opaque byte values grouped into named collections. The
//! deployment repository sits on top of this contract.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::error::Result;
use async_trait::async_trait;

/// Collection-scoped key-value store
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a value; `None` if the key (or the collection) does not exist
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Overwrite a value, creating the collection if needed
    async fn put(&self, collection: &str, key: &str, value: &[u8]) -> Result<()>;

    /// Remove a value; absent keys are not an error
    async fn delete(&self, collection: &str, key: &str) -> Result<()>;

    /// All keys in a collection, sorted
    async fn keys(&self, collection: &str) -> Result<Vec<String>>;
}
