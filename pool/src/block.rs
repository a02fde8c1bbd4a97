use super::*;
use core::any::Any;

/// An arena-relative block handle.
///
/// Handles are plain copyable ids: `index` names the slot, `generation`
/// is bumped every time the slot is recycled, so a handle held across a
/// recycle fails lookup with [`Error::StaleHandle`] instead of aliasing
/// the slot's next occupant.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl Handle {
    /// The slot index, stable for the lifetime of the block.
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl core::fmt::Display for Handle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "blk#{}@{}", self.index, self.generation)
    }
}

/// The block type tag carried in every block header.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BlockKind {
    #[default]
    Undefined,
    /// Slot 0 only: hosts the free queue, recycle queue and active-job list.
    Admin,
    /// Awaiting allocation.
    Free,
    /// Module-defined content behind a registered signature.
    Data,
    /// Logical primary bundle block, owning chunk and canonical-block chains.
    Primary,
    /// Logical extension/payload block, owning a chunk chain.
    Canonical,
    /// A span of CBOR-encoded bytes.
    Chunk,
    /// An index-neutral grouping head.
    ListHead,
    /// An indirection holding a counted reference to a base content block.
    Ref,
    /// A bounded ingress/egress queue pair for one interface.
    Duct,
    /// A one-shot deferred work item.
    Job,
}

impl BlockKind {
    /// Content nodes are the only valid targets of reference creation.
    pub(crate) fn is_content(&self) -> bool {
        matches!(self, BlockKind::Data | BlockKind::Primary | BlockKind::Canonical)
    }

    /// Primary/canonical/chunk allocations are charged against the
    /// bundle admission threshold, everything else against the internal one.
    pub(crate) fn is_bundle_class(&self) -> bool {
        matches!(
            self,
            BlockKind::Primary | BlockKind::Canonical | BlockKind::Chunk
        )
    }

    pub(crate) fn is_allocatable(&self) -> bool {
        !matches!(
            self,
            BlockKind::Undefined | BlockKind::Admin | BlockKind::Free
        )
    }
}

/// Module-defined content stored in a [`BlockKind::Data`] block.
///
/// Blanket-implemented for every `Any + Send` type; consumers access it
/// through [`Pool::with_data`]/[`Pool::with_data_mut`] downcasts.
pub trait BlockData: Any + Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any + Send> BlockData for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Init argument threaded through [`Pool`] allocation into the registered
/// constructor.
pub type InitArg<'a> = Option<&'a mut (dyn Any + Send)>;

/// Per-signature construct/destruct callbacks installed with
/// [`Pool::register_blocktype`].
///
/// Both hooks run with the pool lock *released*; they may re-enter the
/// pool (and commonly do, e.g. to walk the block being destroyed).
pub trait BlocktypeApi: Send + Sync {
    /// Fresh content for a data block of this signature. Must return
    /// `Some` when the signature is registered with [`BlockKind::Data`].
    fn new_content(&self) -> Option<Box<dyn BlockData>> {
        None
    }

    /// Runs once the block is pulled, reset and kind-initialized.
    /// An error recycles the block and fails the allocation.
    fn construct(&self, _pool: &Pool, _block: Handle, _arg: InitArg) -> Result<(), Error> {
        Ok(())
    }

    /// Runs when the block is collected from the recycle queue, before
    /// its owned sub-lists are merged back for collection.
    fn destruct(&self, _pool: &Pool, _block: Handle) {}
}

/// A no-op [`BlocktypeApi`] for block types without construction hooks.
pub struct NullBlocktypeApi;

impl BlocktypeApi for NullBlocktypeApi {}

/// Outcome of [`Pool::register_blocktype`]: duplicate registration is an
/// idempotent success, enabling lazy registration from multiple modules.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Registration {
    Fresh,
    Duplicate,
}

#[derive(Clone)]
pub(crate) struct Registered {
    pub kind: BlockKind,
    pub api: Arc<dyn BlocktypeApi>,
    pub content_size: usize,
}

pub(crate) struct RefTarget {
    /// Base content block this indirection holds a counted reference to.
    pub target: Option<Handle>,
}

/// A one-shot deferred work item run by [`Pool::process_jobs`].
pub trait JobHandler: Send + Sync {
    fn run(&self, pool: &Pool, job: Handle);
}

/// The typed payload union.
pub(crate) enum Payload {
    Free,
    Admin,
    Data(Box<dyn BlockData>),
    Primary(bundle::PrimaryBlock),
    Canonical(bundle::CanonicalBlock),
    Chunk(Bytes),
    ListHead,
    Ref(RefTarget),
    Duct(duct::DuctState),
    Job(Option<Arc<dyn JobHandler>>),
}

/// Block header plus payload. Invariant: a block with a reference count
/// of zero is never linked into a subqueue or index list.
pub(crate) struct Slot {
    pub generation: u32,
    pub kind: BlockKind,
    pub signature: u32,
    pub refcount: u32,
    pub links: [list::Link; list::LINKS_PER_SLOT],
    pub payload: Payload,
}

impl Slot {
    pub fn new_free(generation: u32) -> Self {
        Self {
            generation,
            kind: BlockKind::Free,
            signature: 0,
            refcount: 0,
            // Placeholder; Pool::new re-initializes every link in place.
            links: [list::Link {
                prev: list::LinkRef::new(0, 0),
                next: list::LinkRef::new(0, 0),
            }; list::LINKS_PER_SLOT],
            payload: Payload::Free,
        }
    }

    pub fn handle(&self, index: u32) -> Handle {
        Handle {
            index,
            generation: self.generation,
        }
    }
}
