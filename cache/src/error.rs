use super::*;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The handle does not resolve to a primary bundle block.
    #[error("block is not a primary bundle block")]
    NotABundle,

    /// The pool's block-type registry already carries another cache's
    /// callbacks; one cache per pool.
    #[error("a cache engine is already attached to this pool")]
    AlreadyAttached,

    /// Operation on a detached cache.
    #[error("operation on a detached cache")]
    Detached,

    /// Detach refused: entries are still indexed or listed.
    #[error("cache still holds entries at detach")]
    IndexNotEmpty,

    #[error(transparent)]
    Pool(#[from] cairn_pool::Error),

    #[error(transparent)]
    Offload(#[from] offload::Error),
}
