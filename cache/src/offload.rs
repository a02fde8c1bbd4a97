//! The offload service contract.
//!
//! An offload backend persists a resident bundle's block graph under an
//! opaque non-zero storage id, restores it into the pool on demand, and
//! releases it once the cache no longer needs it. Backends are injected
//! into [`Cache::attach`](crate::Cache::attach).

use super::*;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The persisted record failed verification. Unrecoverable: the
    /// backend discards the record and the same storage id must never be
    /// retried.
    #[error("persisted record {storage_id} failed verification")]
    CorruptRecord { storage_id: u64 },

    #[error("no persisted record for storage id {0}")]
    NotFound(u64),

    #[error("offload service is not started")]
    NotStarted,

    #[error("unknown configuration key {0:?}")]
    UnknownKey(String),

    #[error("invalid value for configuration key {key:?}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Pool(#[from] cairn_pool::Error),
}

pub trait Offload: Send + Sync {
    /// Applies one key/value setting; must be called before [`start`](Self::start).
    fn configure(&self, key: &str, value: &str) -> Result<(), Error>;

    fn start(&self) -> Result<(), Error>;

    fn stop(&self);

    /// Persists the block graph rooted at `bundle` (a primary block) and
    /// returns its non-zero storage id. The resident blocks are not
    /// consumed.
    fn offload(&self, pool: &Pool, bundle: Handle) -> Result<u64, Error>;

    /// Rebuilds the block graph from a persisted record, returning the
    /// fresh primary block handle.
    fn restore(&self, pool: &Pool, storage_id: u64) -> Result<Handle, Error>;

    /// Drops the persisted record. Releasing an unknown id is a no-op.
    fn release(&self, storage_id: u64) -> Result<(), Error>;
}
