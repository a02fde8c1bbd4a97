use super::*;
use thiserror::Error;

/// The primary error type for the `cairn-pool` crate.
#[derive(Error, Debug)]
pub enum Error {
    /// The configured capacity does not hold an admin block plus at least one content block.
    #[error("Pool capacity only holds {0} blocks, at least 2 are required")]
    PoolTooSmall(usize),

    /// Allocation denied by the priority-scaled admission threshold or free-list exhaustion.
    #[error("No free block available at priority {priority}")]
    OutOfMemory { priority: u8 },

    /// A blocking queue operation did not complete before its deadline.
    #[error("Deadline elapsed")]
    Timeout,

    /// The handle does not name a live block (recycled, or never allocated).
    #[error("Stale or invalid block handle")]
    StaleHandle,

    /// The block is not of the kind the operation requires.
    #[error("Block has unexpected kind {0:?}")]
    WrongBlockKind(block::BlockKind),

    /// The signature has not been registered with the block-type registry.
    #[error("Block type signature {0:#010x} is not registered")]
    UnregisteredSignature(u32),

    /// The signature is registered for a different block kind than requested.
    #[error("Signature {signature:#010x} is registered as {registered:?}, not {requested:?}")]
    SignatureKindMismatch {
        signature: u32,
        registered: block::BlockKind,
        requested: block::BlockKind,
    },

    /// The registered content size does not fit the fixed block capacity.
    #[error("Content size {0} exceeds the block capacity")]
    ContentTooLarge(usize),

    /// The registered content type does not match the requested downcast.
    #[error("Block content is not of the requested type")]
    ContentMismatch,

    /// Reference operations only apply to primary, canonical or data blocks.
    #[error("Block is not a content node")]
    NotAContentBlock,

    /// A reference was duplicated or released with a reference count of zero.
    #[error("Reference count is already zero")]
    ZeroRefcount,

    /// A registered constructor reported failure; the block has been recycled.
    #[error("Block constructor failed: {0}")]
    Construct(String),
}
