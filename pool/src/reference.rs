//! Reference counting and indirection over content blocks.
//!
//! Counted references are plain [`Handle`]s managed explicitly: whoever
//! calls [`Pool::ref_create`]/[`Pool::ref_duplicate`] owes exactly one
//! matching [`Pool::ref_release`]. A Drop-based guard cannot reach the
//! pool lock safely from arbitrary drop sites, so the contract stays
//! explicit, mirroring the creation/release discipline of the engine.

use super::*;
use block::{BlockKind, Payload};

impl Pool {
    /// Follows ref-block indirection to the base block, if any.
    pub fn dereference(&self, h: Handle) -> Result<Handle, Error> {
        let s = self.lock();
        let mut h = h;
        // Indirection is one level deep in practice; the bound guards
        // against a corrupted chain.
        for _ in 0..4 {
            let slot = s.slot(h)?;
            match &slot.payload {
                Payload::Ref(r) => h = r.target.ok_or(Error::StaleHandle)?,
                _ => return Ok(h),
            }
        }
        Err(Error::StaleHandle)
    }

    /// Creates a counted reference to the base content block behind `h`,
    /// dereferencing through any indirection. Fails for non-content nodes.
    pub fn ref_create(&self, h: Handle) -> Result<Handle, Error> {
        let base = self.dereference(h)?;
        let mut s = self.lock();
        let slot = s.slot_mut(base)?;
        if !slot.kind.is_content() {
            return Err(Error::NotAContentBlock);
        }
        slot.refcount += 1;
        Ok(base)
    }

    /// Duplicates an existing counted reference. The count must already
    /// be positive; a zero count here means the caller is resurrecting a
    /// block on its way to the recycle queue.
    pub fn ref_duplicate(&self, h: Handle) -> Result<Handle, Error> {
        let mut s = self.lock();
        let slot = s.slot_mut(h)?;
        if slot.refcount == 0 {
            return Err(Error::ZeroRefcount);
        }
        slot.refcount += 1;
        Ok(h)
    }

    /// Allocates a ref block carrying a duplicated reference to `target`,
    /// for passing a bundle through a queue without moving the original.
    /// The ref block takes the caller's `signature`, so a registered
    /// destructor fires when it is recycled.
    pub fn ref_make_block(
        &self,
        target: Handle,
        signature: u32,
        arg: block::InitArg,
        priority: u8,
    ) -> Result<Handle, Error> {
        let base = self.ref_create(target)?;
        let r = (|| {
            let (h, api) = self.alloc_raw(BlockKind::Ref, signature, priority)?;
            {
                let mut s = self.lock();
                let slot = s.slot_mut(h)?;
                match &mut slot.payload {
                    Payload::Ref(r) => r.target = Some(base),
                    _ => unreachable!(),
                }
            }
            self.finish_construct(h, api, arg)
        })();
        if r.is_err() {
            // The alloc path never took ownership of the duplicated
            // reference; put it back.
            let mut s = self.lock();
            s.release_ref(base);
        }
        r
    }

    /// Releases one counted reference to a base content block. On the
    /// final release the block must be unlinked; it is pushed onto the
    /// recycle queue.
    pub fn ref_release(&self, h: Handle) -> Result<(), Error> {
        let mut s = self.lock();
        s.slot(h)?;
        s.release_ref(h);
        Ok(())
    }

    /// Extracts and duplicates the reference held by a ref block, without
    /// consuming anything from the ref block itself.
    pub fn ref_from_block(&self, refblock: Handle) -> Result<Handle, Error> {
        let target = {
            let s = self.lock();
            let slot = s.slot(refblock)?;
            match &slot.payload {
                Payload::Ref(r) => r.target.ok_or(Error::StaleHandle)?,
                _ => return Err(Error::WrongBlockKind(slot.kind)),
            }
        };
        self.ref_duplicate(target)
    }
}
