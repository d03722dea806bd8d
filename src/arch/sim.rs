/*
 * Reference collaborator implementations
 *
 * Simple, architecture-agnostic stand-ins for the hardware/kernel
 * collaborators this subsystem depends on (frame allocator, TLB,
 * interrupt priority, current-address-space accessor). None of these are
 * meant for a real MIPS deployment — a BSP would supply its own backed by
 * actual RAM and a real TLB — but they let the VM core run and be tested
 * without one.
 */

use super::{CurrentAddressSpace, Frame, FrameSource, InterruptGuard, InterruptPriority, Tlb};
use crate::vm::addrspace::AsId;
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

/// Bitmap-based frame source over a fixed-size backing store.
///
/// Mirrors the kernel's real physical frame allocator (bit per frame, 0 =
/// free, 1 = used) but owns its backing bytes directly instead of reading
/// a bootloader memory map, so it can be constructed anywhere, including
/// in a test.
pub struct BitmapFrameSource {
    used: Vec<bool>,
    backing: Vec<[u8; super::PAGE_SIZE as usize]>,
}

impl BitmapFrameSource {
    /// Create a source able to hand out up to `frame_count` frames.
    pub fn new(frame_count: usize) -> Self {
        Self {
            used: vec![false; frame_count],
            backing: vec![[0u8; super::PAGE_SIZE as usize]; frame_count],
        }
    }

    fn bytes_mut(&mut self, frame: Frame) -> &mut [u8; super::PAGE_SIZE as usize] {
        &mut self.backing[frame.0 as usize]
    }
}

impl FrameSource for BitmapFrameSource {
    fn alloc(&mut self) -> Option<Frame> {
        let idx = self.used.iter().position(|used| !used)?;
        self.used[idx] = true;
        Some(Frame(idx as u32))
    }

    fn free(&mut self, frame: Frame) {
        self.used[frame.0 as usize] = false;
    }

    fn zero(&mut self, frame: Frame) {
        self.bytes_mut(frame).fill(0);
    }

    fn copy(&mut self, src: Frame, dst: Frame) {
        let src_bytes = self.backing[src.0 as usize];
        self.backing[dst.0 as usize] = src_bytes;
    }
}

/// A fixed-size array of TLB slots, each holding `(vpn, entry_lo)` or
/// `None` when invalid. "Random" eviction is modeled as round-robin, which
/// is sufficient to observe the invalidate-on-activate property of §8.
pub struct ArrayTlb {
    slots: Vec<Option<(u32, u32)>>,
    next: usize,
}

impl ArrayTlb {
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: vec![None; slot_count],
            next: 0,
        }
    }

    /// Look up a previously-written vpn, for test assertions only.
    pub fn probe(&self, vpn: u32) -> Option<u32> {
        self.slots
            .iter()
            .flatten()
            .find(|(v, _)| *v == vpn)
            .map(|(_, lo)| *lo)
    }
}

impl Tlb for ArrayTlb {
    fn write_random(&mut self, vpn: u32, entry_lo: u32) {
        let slot = self.next;
        self.next = (self.next + 1) % self.slots.len();
        self.slots[slot] = Some((vpn, entry_lo));
    }

    fn invalidate_all(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}

/// No-op interrupt priority controller: single-threaded tests have no
/// interrupts to race against, so raising priority is a bookkeeping flag
/// only, asserted against in tests that care about nesting discipline.
pub struct NoopInterruptPriority {
    raised: AtomicBool,
}

impl NoopInterruptPriority {
    pub const fn new() -> Self {
        Self {
            raised: AtomicBool::new(false),
        }
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}

pub struct NoopGuard<'a> {
    flag: &'a AtomicBool,
}

impl InterruptGuard for NoopGuard<'_> {}

impl Drop for NoopGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl InterruptPriority for NoopInterruptPriority {
    fn raise_high(&self) -> Box<dyn InterruptGuard + '_> {
        self.raised.store(true, Ordering::SeqCst);
        Box::new(NoopGuard { flag: &self.raised })
    }
}

/// A single-process current-address-space accessor: tests set it directly
/// instead of going through a scheduler.
pub struct FixedCurrentAddressSpace {
    current: Option<AsId>,
}

impl FixedCurrentAddressSpace {
    pub fn new(current: Option<AsId>) -> Self {
        Self { current }
    }

    pub fn set(&mut self, current: Option<AsId>) {
        self.current = current;
    }
}

impl CurrentAddressSpace for FixedCurrentAddressSpace {
    fn current(&self) -> Option<AsId> {
        self.current
    }
}
