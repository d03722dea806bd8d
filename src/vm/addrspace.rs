/*
 * Address spaces and regions
 *
 * `AddressSpace` no longer owns its HPT nodes by pointer or borrow: it
 * owns only an `AsId`, a non-owning handle the global HPT keys every node
 * on. This follows the design notes' guidance directly — the source's
 * `as_copy` temporarily exposes a half-built address space through the
 * process table, which has no well-typed equivalent here, and the
 * handle-based design sidesteps the question entirely instead of porting
 * the unsound window.
 */

use crate::arch::{self, FrameSource, Perm};
use crate::vm::error::VmError;
use crate::vm::hpt::Hpt;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

static NEXT_AS_ID: AtomicU32 = AtomicU32::new(1);

/// Non-owning handle identifying an address space to the global HPT.
///
/// Deliberately not a pointer or a borrow: the HPT outlives any single
/// address space's lifetime in memory, and keying its nodes on an integer
/// instead means `AddressSpace::drop` never has to reach back into a
/// shared structure while also being reachable, lock-free, from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AsId(pub u32);

impl AsId {
    fn next() -> Self {
        Self(NEXT_AS_ID.fetch_add(1, Ordering::SeqCst))
    }
}

/// One contiguous, page-aligned region of a process's address space (a
/// segment of the executable, or the fixed-size user stack).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    vbase: u32,
    npages: u32,
    /// Permissions in effect once loading has completed.
    acc_mode: Perm,
    /// Permissions in effect while `prepare_load`/`complete_load` is in
    /// progress (the source always upgrades to `R | W` so the loader can
    /// write to segments that are normally read-only or non-writable).
    load_mode: Perm,
}

impl Region {
    pub fn vbase(&self) -> u32 {
        self.vbase
    }

    pub fn npages(&self) -> u32 {
        self.npages
    }

    pub fn end(&self) -> u32 {
        self.vbase + self.npages * arch::PAGE_SIZE
    }

    pub fn contains(&self, vaddr: u32) -> bool {
        vaddr >= self.vbase && vaddr < self.end()
    }

    /// The permissions a fault against this region should be checked
    /// against right now: `load_mode` during loading, `acc_mode` after.
    pub fn effective_mode(&self, loading: bool) -> Perm {
        if loading {
            self.load_mode
        } else {
            self.acc_mode
        }
    }
}

/// A process's virtual address space: its defined regions, plus whether a
/// load is in progress. Its actual mapped pages live in the global HPT,
/// keyed on `id`.
pub struct AddressSpace {
    id: AsId,
    regions: Vec<Region>,
    /// `Some(index into regions)` once `define_stack` has run.
    stack_index: Option<usize>,
    /// Set by `prepare_load`, cleared by `complete_load`.
    loading: bool,
}

impl AddressSpace {
    /// Create a fresh, empty address space with a freshly minted id.
    pub fn create() -> Self {
        Self {
            id: AsId::next(),
            regions: Vec::new(),
            stack_index: None,
            loading: false,
        }
    }

    pub fn id(&self) -> AsId {
        self.id
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Define a new region `[vaddr, vaddr + size)`, rounding outward to
    /// page boundaries exactly as the source does: the low bits of
    /// `vaddr` become extra bytes tacked onto `size` before `size` itself
    /// is rounded up, so the rounded region still covers every byte of
    /// the original request.
    pub fn define_region(&mut self, vaddr: u32, size: u32, perm: Perm) -> Result<(), VmError> {
        let page_size = arch::PAGE_SIZE;
        let offset = vaddr & (page_size - 1);
        let vbase = vaddr & !(page_size - 1);
        let size = size.checked_add(offset).ok_or(VmError::Einval)?;
        let npages = size.div_ceil(page_size);

        if npages == 0 {
            return Err(VmError::Einval);
        }

        let end = vbase.checked_add(npages * page_size).ok_or(VmError::Einval)?;
        if end > arch::USERSTACK {
            return Err(VmError::Einval);
        }

        let candidate = Region {
            vbase,
            npages,
            acc_mode: perm,
            load_mode: perm,
        };
        if self.regions.iter().any(|r| ranges_overlap(r, &candidate)) {
            return Err(VmError::Einval);
        }

        self.regions.push(candidate);
        Ok(())
    }

    /// Enter the loading window: every region's effective permissions
    /// become `R | W` until `complete_load` runs.
    pub fn prepare_load(&mut self) {
        for region in &mut self.regions {
            region.load_mode = Perm::R | Perm::W;
        }
        self.loading = true;
    }

    /// Leave the loading window: restore each region's original
    /// permissions as its effective mode.
    pub fn complete_load(&mut self) {
        for region in &mut self.regions {
            region.load_mode = region.acc_mode;
        }
        self.loading = false;
    }

    /// Reserve the fixed-size user stack just below `USERSTACK`. May only
    /// be called once; returns the initial stack pointer on success.
    pub fn define_stack(&mut self) -> Result<u32, VmError> {
        if self.stack_index.is_some() {
            return Err(VmError::Einval);
        }
        let npages = arch::STACKPAGES;
        let vbase = arch::USERSTACK - npages * arch::PAGE_SIZE;
        let region = Region {
            vbase,
            npages,
            acc_mode: Perm::R | Perm::W,
            load_mode: Perm::R | Perm::W,
        };
        if self.regions.iter().any(|r| ranges_overlap(r, &region)) {
            return Err(VmError::Einval);
        }
        self.stack_index = Some(self.regions.len());
        self.regions.push(region);
        Ok(arch::USERSTACK)
    }

    /// The region (if any) covering `vaddr`, together with whether it is
    /// the dedicated stack region.
    pub fn region_for(&self, vaddr: u32) -> Option<&Region> {
        self.regions.iter().find(|r| r.contains(vaddr))
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Deep-copy this address space: a fresh id, the same region
    /// descriptors, and a frame-level copy of every page currently
    /// resident for `self` in `hpt`.
    ///
    /// On `Enomem` partway through, every frame and HPT node already
    /// installed for the new copy is unwound before returning the error,
    /// so a failed copy never leaks pages under a half-built address
    /// space's id — unlike the source, which can return with the new
    /// address space partially populated and reachable from the caller.
    pub fn copy(&self, hpt: &mut Hpt, frames: &mut dyn FrameSource) -> Result<Self, VmError> {
        let mut new = Self {
            id: AsId::next(),
            regions: self.regions.clone(),
            stack_index: self.stack_index,
            loading: self.loading,
        };

        let source_pages = hpt.snapshot_owner(self.id);

        for (vpn, entry_lo) in source_pages {
            let dst = match frames.alloc() {
                Some(dst) => dst,
                None => {
                    hpt.remove_by_owner(new.id, frames);
                    return Err(VmError::Enomem);
                }
            };
            let src = crate::vm::hpt::frame_of_pub(entry_lo);
            frames.copy(src, dst);
            let new_entry_lo = crate::vm::hpt::rebase_entry_lo(entry_lo, dst);
            if let Err(err) = hpt.insert(vpn, new_entry_lo, new.id) {
                // dst was allocated but never entered the HPT: remove_by_owner
                // below only walks nodes actually in the table, so it would
                // never see this frame and it would leak.
                frames.free(dst);
                hpt.remove_by_owner(new.id, frames);
                return Err(err);
            }
        }

        Ok(new)
    }

    /// Bring this address space into effect on context switch in: the
    /// TLB may still hold entries from whatever ran before, so invalidate
    /// all of them under raised interrupt priority. Does not touch the
    /// HPT; the next fault repopulates the TLB from it as needed.
    pub fn activate(&self, tlb: &mut dyn crate::arch::Tlb, irq: &dyn crate::arch::InterruptPriority) {
        let _guard = irq.raise_high();
        tlb.invalidate_all();
    }

    /// Context switch out. Nothing to do: the TLB is left as-is, and the
    /// next `activate()` (by whichever address space runs next) clears it.
    pub fn deactivate(&self) {}

    /// Free every page this address space owns in `hpt`. Called from
    /// `Drop`; exposed separately because destruction needs the HPT and
    /// frame source handed in explicitly rather than found through global
    /// state held by `AddressSpace` itself.
    pub fn destroy(&mut self, hpt: &mut Hpt, frames: &mut dyn FrameSource) {
        hpt.remove_by_owner(self.id, frames);
    }
}

fn ranges_overlap(a: &Region, b: &Region) -> bool {
    a.vbase < b.end() && b.vbase < a.end()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::BitmapFrameSource;
    use crate::vm::hpt::encode_entry_lo;

    #[test]
    fn define_region_rounds_outward_to_page_boundaries() {
        let mut asp = AddressSpace::create();
        asp.define_region(0x1100, 0x100, Perm::R).unwrap();
        let region = asp.regions()[0];
        assert_eq!(region.vbase(), 0x1000);
        assert_eq!(region.npages(), 1);
        assert!(region.contains(0x1100));
        assert!(region.contains(0x11ff));
    }

    #[test]
    fn define_region_rejects_overlap() {
        let mut asp = AddressSpace::create();
        asp.define_region(0x1000, 0x1000, Perm::R).unwrap();
        assert_eq!(
            asp.define_region(0x1800, 0x1000, Perm::R),
            Err(VmError::Einval)
        );
    }

    #[test]
    fn define_region_rejects_beyond_userstack() {
        let mut asp = AddressSpace::create();
        assert_eq!(
            asp.define_region(arch::USERSTACK - 0x1000, 0x2000, Perm::R),
            Err(VmError::Einval)
        );
    }

    #[test]
    fn prepare_load_upgrades_and_complete_load_restores() {
        let mut asp = AddressSpace::create();
        asp.define_region(0x1000, 0x1000, Perm::R).unwrap();
        asp.prepare_load();
        assert_eq!(asp.regions()[0].effective_mode(true), Perm::R | Perm::W);
        asp.complete_load();
        assert_eq!(asp.regions()[0].effective_mode(false), Perm::R);
    }

    #[test]
    fn define_stack_is_one_shot_and_sits_below_userstack() {
        let mut asp = AddressSpace::create();
        let sp = asp.define_stack().unwrap();
        assert_eq!(sp, arch::USERSTACK);
        assert_eq!(asp.define_stack(), Err(VmError::Einval));
        let region = asp.regions().last().unwrap();
        assert_eq!(region.end(), arch::USERSTACK);
        assert_eq!(region.npages(), arch::STACKPAGES);
    }

    #[test]
    fn copy_duplicates_pages_into_fresh_frames() {
        let mut hpt = Hpt::new(16);
        let mut frames = BitmapFrameSource::new(8);
        let asp = AddressSpace::create();
        let f = frames.alloc().unwrap();
        frames.zero(f);
        hpt.insert(0x2000, encode_entry_lo(f, true), asp.id())
            .unwrap();

        let copy = asp.copy(&mut hpt, &mut frames).unwrap();
        assert_ne!(copy.id(), asp.id());

        let original_entry = hpt.lookup(0x2000, asp.id()).unwrap();
        let copied_entry = hpt.lookup(0x2000, copy.id()).unwrap();
        assert_ne!(original_entry & arch::PAGE_FRAME, copied_entry & arch::PAGE_FRAME);
    }

    #[test]
    fn destroy_frees_every_owned_frame() {
        let mut hpt = Hpt::new(16);
        let mut frames = BitmapFrameSource::new(2);
        let mut asp = AddressSpace::create();
        let f = frames.alloc().unwrap();
        hpt.insert(0x3000, encode_entry_lo(f, false), asp.id())
            .unwrap();

        asp.destroy(&mut hpt, &mut frames);
        assert_eq!(hpt.lookup(0x3000, asp.id()), None);
        assert!(frames.alloc().is_some());
    }
}
