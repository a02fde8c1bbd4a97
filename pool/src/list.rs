//! Circular doubly-linked lists threaded through the slot array.
//!
//! Every slot carries [`LINKS_PER_SLOT`] link pairs: position 0 is the
//! block's own list-membership link, positions 1..=3 are embedded list
//! heads owned by the block (free/recycle/job queues on the admin block,
//! chunk and canonical-block chains on bundle blocks, the two subqueues
//! on a duct block). A link names its owner by slot index, so "get owner
//! from link" is a lookup, never pointer arithmetic.

use super::block::Slot;

pub(crate) const LINKS_PER_SLOT: usize = 4;

/// A link endpoint: `slot_index * LINKS_PER_SLOT + position`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct LinkRef(u32);

impl LinkRef {
    pub fn new(slot: u32, pos: usize) -> Self {
        debug_assert!(pos < LINKS_PER_SLOT);
        Self(slot * LINKS_PER_SLOT as u32 + pos as u32)
    }

    pub fn slot(self) -> u32 {
        self.0 / LINKS_PER_SLOT as u32
    }

    pub fn pos(self) -> usize {
        (self.0 % LINKS_PER_SLOT as u32) as usize
    }
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct Link {
    pub prev: LinkRef,
    pub next: LinkRef,
}

fn get(slots: &[Slot], r: LinkRef) -> Link {
    slots[r.slot() as usize].links[r.pos()]
}

fn set_next(slots: &mut [Slot], r: LinkRef, next: LinkRef) {
    slots[r.slot() as usize].links[r.pos()].next = next;
}

fn set_prev(slots: &mut [Slot], r: LinkRef, prev: LinkRef) {
    slots[r.slot() as usize].links[r.pos()].prev = prev;
}

/// Resets a link to the detached (self-referential) state.
pub(crate) fn init(slots: &mut [Slot], r: LinkRef) {
    slots[r.slot() as usize].links[r.pos()] = Link { prev: r, next: r };
}

/// True for a detached membership link, and for an empty list head.
pub(crate) fn is_detached(slots: &[Slot], r: LinkRef) -> bool {
    get(slots, r).next == r
}

/// Inserts a detached `node` immediately before `pos` (appends at the
/// tail when `pos` is a list head).
pub(crate) fn insert_before(slots: &mut [Slot], pos: LinkRef, node: LinkRef) {
    debug_assert!(is_detached(slots, node));
    let prev = get(slots, pos).prev;
    set_prev(slots, node, prev);
    set_next(slots, node, pos);
    set_next(slots, prev, node);
    set_prev(slots, pos, node);
}

/// Unlinks `node` from whatever list it is on. A no-op for a detached link.
pub(crate) fn extract(slots: &mut [Slot], node: LinkRef) {
    let Link { prev, next } = get(slots, node);
    set_next(slots, prev, next);
    set_prev(slots, next, prev);
    init(slots, node);
}

/// Pops the head-most node of the list, if any.
pub(crate) fn pop_head(slots: &mut [Slot], head: LinkRef) -> Option<LinkRef> {
    if is_detached(slots, head) {
        return None;
    }
    let node = get(slots, head).next;
    extract(slots, node);
    Some(node)
}

/// First node of the list, without removing it.
pub(crate) fn peek_head(slots: &[Slot], head: LinkRef) -> Option<LinkRef> {
    if is_detached(slots, head) {
        None
    } else {
        Some(get(slots, head).next)
    }
}

/// Node following `node`, or `None` once the walk returns to `head`.
pub(crate) fn next_of(slots: &[Slot], head: LinkRef, node: LinkRef) -> Option<LinkRef> {
    let next = get(slots, node).next;
    if next == head { None } else { Some(next) }
}

/// Moves every node of the `src` list to the tail of `dst`, leaving `src` empty.
pub(crate) fn merge_tail(slots: &mut [Slot], dst: LinkRef, src: LinkRef) {
    if is_detached(slots, src) {
        return;
    }
    let Link {
        prev: src_last,
        next: src_first,
    } = get(slots, src);
    let dst_last = get(slots, dst).prev;
    set_next(slots, dst_last, src_first);
    set_prev(slots, src_first, dst_last);
    set_next(slots, src_last, dst);
    set_prev(slots, dst, src_last);
    init(slots, src);
}

/// Number of nodes on the list.
pub(crate) fn len(slots: &[Slot], head: LinkRef) -> usize {
    let mut n = 0;
    let mut cur = get(slots, head).next;
    while cur != head {
        n += 1;
        cur = get(slots, cur).next;
    }
    n
}
