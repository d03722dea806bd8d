/*
 * Hashed page table
 *
 * A fixed-size array of primary slots, each the head of an optional
 * overflow chain of heap-allocated nodes (separate chaining), exactly the
 * source's representation. The source's raw `INVALID_VPN` sentinel has no
 * counterpart here: an empty slot is simply `None`, which is the safe,
 * idiomatic substitute the invariants in the specification allow for.
 */

use crate::arch::{Ctrl, Frame, FrameSource, PAGE_FRAME, PAGE_SIZE};
use crate::vm::addrspace::AsId;
use crate::vm::error::VmError;
use alloc::alloc::{alloc, Layout};
use alloc::boxed::Box;
use alloc::vec::Vec;

struct HptNode {
    vpn: u32,
    entry_lo: u32,
    owner: AsId,
    next: Option<Box<HptNode>>,
}

/// Allocate one overflow-chain node, the way `kmalloc` does: a null return
/// from the allocator is reported as `Enomem` instead of the global
/// allocator's default abort-on-OOM behaviour (`Box::new` never returns, it
/// calls `handle_alloc_error`), since the spec requires a chain-node
/// allocation failure to surface to the caller with no visible state
/// change, not take down the kernel.
fn try_alloc_node(node: HptNode) -> Result<Box<HptNode>, VmError> {
    let layout = Layout::new::<HptNode>();
    // SAFETY: `layout` is non-zero-sized; the returned pointer is checked
    // for null before any access, and is written exactly once before being
    // handed to `Box::from_raw`, matching the layout `Box` itself would
    // have allocated for `HptNode`.
    unsafe {
        let ptr = alloc(layout) as *mut HptNode;
        if ptr.is_null() {
            return Err(VmError::Enomem);
        }
        ptr.write(node);
        Ok(Box::from_raw(ptr))
    }
}

/// The hashed page table: a process-wide map from `(address space, vpn)`
/// to `(frame, control bits)`.
pub struct Hpt {
    slots: Vec<Option<HptNode>>,
}

fn frame_of(entry_lo: u32) -> Frame {
    Frame((entry_lo & PAGE_FRAME) / PAGE_SIZE)
}

/// Extract the frame an encoded `entry_lo` points at.
pub fn frame_of_pub(entry_lo: u32) -> Frame {
    frame_of(entry_lo)
}

/// Rewrite an encoded `entry_lo` to point at a different frame, keeping
/// its control bits. Used when copying a page into a new frame.
pub fn rebase_entry_lo(entry_lo: u32, frame: Frame) -> u32 {
    frame.addr() | (entry_lo & !PAGE_FRAME)
}

impl Hpt {
    /// Allocate a table with `size` primary slots, all empty.
    pub fn new(size: usize) -> Self {
        Self::try_new(size).expect("failed to allocate hashed page table")
    }

    /// Fallible form of [`Hpt::new`]: where the source silently carries on
    /// with a null table pointer when the allocation fails, this reports
    /// the failure to the caller instead.
    pub fn try_new(size: usize) -> Result<Self, VmError> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(size).map_err(|_| VmError::Enomem)?;
        slots.resize_with(size, || None);
        Ok(Self { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn index(&self, owner: AsId, vpn: u32) -> usize {
        ((owner.0 ^ (vpn >> 12)) as usize) % self.slots.len()
    }

    /// Insert `(vpn, entry_lo, owner)`. The caller must ensure no existing
    /// node already has this `(vpn, owner)` pair.
    pub fn insert(&mut self, vpn: u32, entry_lo: u32, owner: AsId) -> Result<(), VmError> {
        let idx = self.index(owner, vpn);
        match &mut self.slots[idx] {
            slot @ None => {
                *slot = Some(HptNode {
                    vpn,
                    entry_lo,
                    owner,
                    next: None,
                });
                Ok(())
            }
            Some(head) => {
                let mut cur = head;
                while cur.next.is_some() {
                    cur = cur.next.as_mut().unwrap();
                }
                let node = try_alloc_node(HptNode {
                    vpn,
                    entry_lo,
                    owner,
                    next: None,
                })?;
                cur.next = Some(node);
                Ok(())
            }
        }
    }

    /// Look up `(vpn, owner)`, returning its `entry_lo` if resident.
    pub fn lookup(&self, vpn: u32, owner: AsId) -> Option<u32> {
        let idx = self.index(owner, vpn);
        let mut cur = self.slots[idx].as_ref();
        while let Some(node) = cur {
            if node.vpn == vpn && node.owner == owner {
                return Some(node.entry_lo);
            }
            cur = node.next.as_deref();
        }
        None
    }

    /// Snapshot every `(vpn, entry_lo)` currently owned by `owner`.
    ///
    /// Used by `AddressSpace::copy`, which needs a stable list to iterate
    /// while it allocates frames and inserts into a different owner —
    /// mutating `self` concurrently with an in-progress walk of its own
    /// chains would be unsound.
    pub fn snapshot_owner(&self, owner: AsId) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        for slot in &self.slots {
            let mut cur = slot.as_ref();
            while let Some(node) = cur {
                if node.owner == owner {
                    out.push((node.vpn, node.entry_lo));
                }
                cur = node.next.as_deref();
            }
        }
        out
    }

    /// Remove every node owned by `owner`, returning each node's frame to
    /// `frames` before the node itself is dropped.
    pub fn remove_by_owner(&mut self, owner: AsId, frames: &mut dyn FrameSource) {
        for slot in &mut self.slots {
            // Strip matching nodes from the head of the chain, promoting
            // the next overflow node into the primary slot each time.
            while matches!(slot, Some(node) if node.owner == owner) {
                let node = slot.take().unwrap();
                frames.free(frame_of(node.entry_lo));
                *slot = node.next.map(|b| *b);
            }

            // Walk the remaining chain, splicing out interior matches.
            if let Some(head) = slot {
                let mut cur = head;
                loop {
                    let next_matches = cur
                        .next
                        .as_ref()
                        .is_some_and(|next| next.owner == owner);
                    if next_matches {
                        let removed = cur.next.take().unwrap();
                        frames.free(frame_of(removed.entry_lo));
                        cur.next = removed.next;
                        continue;
                    }
                    match &mut cur.next {
                        Some(next) => cur = next,
                        None => break,
                    }
                }
            }
        }
    }

    /// Total number of resident nodes, across all slots and chains. Handy
    /// for callers (and tests) asserting on demand-allocation vs. HPT-hit
    /// behaviour without being able to see into `slots` directly.
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        for slot in &self.slots {
            let mut cur = slot.as_ref();
            while let Some(node) = cur {
                count += 1;
                cur = node.next.as_deref();
            }
        }
        count
    }
}

/// Build the `entry_lo` for a freshly installed page: the frame's physical
/// address with `VALID` always set and `DIRTY` set iff the region was
/// writable at the time of the fault.
pub fn encode_entry_lo(frame: Frame, writable: bool) -> u32 {
    let mut ctrl = Ctrl::VALID;
    if writable {
        ctrl |= Ctrl::DIRTY;
    }
    frame.addr() | ctrl.bits()
}

/// `true` iff `DIRTY` is set in an encoded `entry_lo`.
pub fn is_dirty(entry_lo: u32) -> bool {
    Ctrl::from_bits_truncate(entry_lo & !PAGE_FRAME).contains(Ctrl::DIRTY)
}

/// `true` iff `VALID` is set in an encoded `entry_lo`.
pub fn is_valid(entry_lo: u32) -> bool {
    Ctrl::from_bits_truncate(entry_lo & !PAGE_FRAME).contains(Ctrl::VALID)
}
