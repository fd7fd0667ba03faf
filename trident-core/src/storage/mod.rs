//! Key-value byte storage used for persistence.
//!
//! The engine never assumes a particular durable backend. Everything it
//! persists goes through [`KvStore`]: index snapshots, paged vectors and
//! record documents. Keys are `/`-separated ASCII paths such as `rec/42`.
//!
//! - [`MemoryKvStore`] - in-process map, the default for ephemeral engines
//! - [`FileKvStore`] - one checksummed file per key under a root directory

pub mod file_store;

pub use file_store::FileKvStore;

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Key prefix for record documents (metadata, facets, edges).
pub const RECORD_PREFIX: &str = "rec/";
/// Key prefix for paged vectors.
pub const VECTOR_PREFIX: &str = "vec/";
/// Key holding the latest index snapshot.
pub const SNAPSHOT_KEY: &str = "index/snapshot";

/// Keys of one named store inside a shared [`KvStore`].
///
/// Every key a store writes starts with its name, so stores with different
/// names never see each other's records: `docs/rec/42`, `docs/vec/42`,
/// `docs/index/snapshot`.
///
/// ```
/// use trident_core::storage::Keyspace;
///
/// let keys = Keyspace::new("docs").unwrap();
/// assert_eq!(keys.record_key(42), "docs/rec/42");
/// assert_eq!(keys.snapshot_key(), "docs/index/snapshot");
/// assert!(Keyspace::new("a/b").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    name: String,
    records: String,
    vectors: String,
    snapshot: String,
}

impl Keyspace {
    /// Creates the keyspace for store `name`, a single key segment.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.contains('/') || validate_key(&name).is_err() {
            return Err(Error::InvalidConfig(format!(
                "store name `{}` must be one segment of letters, digits, `_`, `-` or `.`",
                name
            )));
        }
        Ok(Self {
            records: format!("{}/{}", name, RECORD_PREFIX),
            vectors: format!("{}/{}", name, VECTOR_PREFIX),
            snapshot: format!("{}/{}", name, SNAPSHOT_KEY),
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Prefix of every record key.
    pub fn record_prefix(&self) -> &str {
        &self.records
    }

    /// Prefix of every paged vector key.
    pub fn vector_prefix(&self) -> &str {
        &self.vectors
    }

    pub fn record_key(&self, id: u64) -> String {
        format!("{}{}", self.records, id)
    }

    pub fn vector_key(&self, id: u64) -> String {
        format!("{}{}", self.vectors, id)
    }

    pub fn snapshot_key(&self) -> &str {
        &self.snapshot
    }
}

/// Parses the id back out of a record or vector key.
pub fn id_from_key(key: &str, prefix: &str) -> Option<u64> {
    key.strip_prefix(prefix)?.parse().ok()
}

/// External key-value byte store.
///
/// Implementations must be safe to call from many threads at once.
pub trait KvStore: Send + Sync {
    /// Reads the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Removes `key`. Returns true if it existed.
    fn delete(&self, key: &str) -> Result<bool>;

    /// Lists keys starting with `prefix`, in ascending order.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Makes previous writes durable.
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// True if values survive the process. Decides whether vectors are
    /// paged out of memory when residency is left on `auto`.
    fn is_persistent(&self) -> bool;
}

/// Validates a key before it reaches a backend.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.split('/').all(|segment| {
            !segment.is_empty()
                && segment != "."
                && segment != ".."
                && segment
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
        });

    if valid {
        Ok(())
    } else {
        Err(Error::IoError(format!("invalid storage key `{}`", key)))
    }
}

/// In-memory key-value store.
///
/// # Example
///
/// ```
/// use trident_core::storage::{KvStore, MemoryKvStore};
///
/// let store = MemoryKvStore::new();
/// store.put("rec/1", b"{}").unwrap();
/// assert_eq!(store.get("rec/1").unwrap().as_deref(), Some(&b"{}"[..]));
/// ```
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        validate_key(key)?;
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn is_persistent(&self) -> bool {
        false
    }
}
