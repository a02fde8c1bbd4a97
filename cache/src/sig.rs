//! Well-known block-type signatures.
//!
//! Registered idempotently on every [`Cache::attach`](crate::Cache::attach),
//! so repeated attach/detach cycles over one pool are harmless.

/// Primary bundle block.
pub const PRIMARY: u32 = 0x4341_5001;

/// Canonical (extension/payload) block.
pub const CANONICAL: u32 = 0x4341_5002;

/// Raw CBOR chunk.
pub const CHUNK: u32 = 0x4341_5003;

/// The per-cache state block hosting the pending and idle lists.
pub const CACHE_STATE: u32 = 0x4341_5004;

/// A cache entry data block.
pub const CACHE_ENTRY: u32 = 0x4341_5005;

/// The cache's interface duct.
pub const CACHE_DUCT: u32 = 0x4341_5006;

/// A ref block passing a resident bundle through a duct. Its destructor
/// resynchronizes the owning entry's queue flag.
pub const QUEUE_REF: u32 = 0x4341_5007;
