//! The virtual memory core: regions and address spaces, the hashed page
//! table, and the fault handler, plus the global wiring that ties them to
//! a single boot-time-sized HPT.
//!
//! The source keeps one process-wide HPT behind a spinlock-equivalent and
//! walks it on every TLB miss; [`bootstrap`] and [`fault`] here reproduce
//! that shape, with the address-space registry added so that `fault` can
//! go from "the current address space's id" to the [`AddressSpace`]
//! itself without every caller threading a reference through by hand.

pub mod addrspace;
pub mod error;
pub mod fault;
pub mod hpt;

pub use addrspace::{AddressSpace, AsId, Region};
pub use error::VmError;
pub use hpt::Hpt;

use crate::arch::{CurrentAddressSpace, FaultType, FrameSource, InterruptPriority, Tlb};
use alloc::collections::BTreeMap;
use spin::Mutex;

static HPT: Mutex<Option<Hpt>> = Mutex::new(None);
static ADDRESS_SPACES: Mutex<Option<BTreeMap<AsId, AddressSpace>>> = Mutex::new(None);

/// Allocate the global hashed page table and address-space registry.
///
/// `ram_size` is the amount of physical RAM in bytes the frame source was
/// built over; the HPT is sized to one primary slot per frame of RAM
/// (`H = ram_size / PAGE_SIZE`), same as the source.
///
/// Must run once, before the first call to [`fault`] or any
/// [`AddressSpace`] operation. Returns `Enomem` if the table cannot be
/// allocated, rather than the source's `vm_bootstrap`, which prints a
/// warning and lets the kernel continue to run with a null table that
/// every subsequent `vm_fault` would dereference.
pub fn bootstrap(ram_size: u32) -> Result<(), VmError> {
    let slots = (ram_size / crate::arch::PAGE_SIZE).max(1) as usize;
    let table = Hpt::try_new(slots)?;
    log::info!("vm: hashed page table bootstrapped with {} slots", slots);
    *HPT.lock() = Some(table);
    *ADDRESS_SPACES.lock() = Some(BTreeMap::new());
    Ok(())
}

/// Register a newly created address space so [`fault`] can find it by id.
pub fn register(asp: AddressSpace) -> AsId {
    let id = asp.id();
    let mut spaces = ADDRESS_SPACES.lock();
    spaces
        .as_mut()
        .expect("vm::bootstrap must run before vm::register")
        .insert(id, asp);
    id
}

/// Remove and destroy the address space registered under `id`, freeing
/// every frame it owns.
pub fn unregister(id: AsId, frames: &mut dyn FrameSource) {
    let mut spaces = ADDRESS_SPACES.lock();
    let spaces = spaces
        .as_mut()
        .expect("vm::bootstrap must run before vm::unregister");
    if let Some(mut asp) = spaces.remove(&id) {
        let mut hpt = HPT.lock();
        let hpt = hpt.as_mut().expect("vm::bootstrap must run before vm::unregister");
        asp.destroy(hpt, frames);
        log::debug!("vm: destroyed address space {}", id.0);
    } else {
        log::warn!("vm: unregister called for unknown address space {}", id.0);
    }
}

/// Deep-copy the address space registered under `id`, registering and
/// returning the new copy's id.
pub fn copy(id: AsId, frames: &mut dyn FrameSource) -> Result<AsId, VmError> {
    let mut hpt_guard = HPT.lock();
    let hpt = hpt_guard
        .as_mut()
        .expect("vm::bootstrap must run before vm::copy");

    let mut spaces = ADDRESS_SPACES.lock();
    let spaces = spaces
        .as_mut()
        .expect("vm::bootstrap must run before vm::copy");
    let source = spaces.get(&id).ok_or(VmError::Einval)?;
    let new = match source.copy(hpt, frames) {
        Ok(new) => new,
        Err(err) => {
            log::warn!("vm: copy of address space {} failed: {}", id.0, err);
            return Err(err);
        }
    };
    let new_id = new.id();
    log::debug!("vm: copied address space {} into {}", id.0, new_id.0);
    spaces.insert(new_id, new);
    Ok(new_id)
}

/// Service one TLB miss for `fault_address`, resolving the current
/// address space through `current` and this module's registry.
///
/// This is the safe entry point a MIPS exception handler calls directly;
/// it holds both the HPT lock and the address-space registry lock for the
/// duration of the fault, matching the source's `splhigh`-protected
/// critical section.
pub fn fault(
    fault_type: FaultType,
    fault_address: u32,
    current: &dyn CurrentAddressSpace,
    frames: &mut dyn FrameSource,
    tlb: &mut dyn Tlb,
    irq: &dyn InterruptPriority,
) -> Result<(), VmError> {
    let as_id = current.current().ok_or(VmError::Efault)?;

    let mut hpt_guard = HPT.lock();
    let hpt = hpt_guard.as_mut().expect("vm::bootstrap must run before vm::fault");

    let spaces = ADDRESS_SPACES.lock();
    let spaces = spaces.as_ref().expect("vm::bootstrap must run before vm::fault");
    let asp = spaces.get(&as_id).ok_or(VmError::Efault)?;

    fault::fault(fault_type, fault_address, asp, hpt, frames, tlb, irq)
}

/// MIPS's full TLB shootdown exception. Single-CPU model: this crate
/// never drives multiple CPUs against one HPT, so there is no shootdown
/// protocol to implement, only the source's own reaction to seeing the
/// trap fire at all. Matches `vm_tlbshootdown`'s `panic("vm tried to do
/// tlb shootdown?!\n")` exactly: an SMP-capable port would replace this
/// with a real cross-CPU invalidation request.
pub fn tlbshootdown(_tlb: &mut dyn Tlb) -> ! {
    panic!("vm tried to do tlb shootdown?!");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::{ArrayTlb, BitmapFrameSource, FixedCurrentAddressSpace, NoopInterruptPriority};
    use crate::arch::Perm;

    // The global HPT and address-space registry are shared process-wide
    // singletons, same as the source's. Tests run on multiple threads, so
    // serialize them or one test's `bootstrap` would wipe another's
    // in-progress registry.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn reset() -> spin::MutexGuard<'static, ()> {
        let guard = TEST_LOCK.lock();
        bootstrap(1024 * crate::arch::PAGE_SIZE).unwrap();
        guard
    }

    #[test]
    fn bootstrap_then_register_then_fault_round_trip() {
        let _guard = reset();
        let mut asp = AddressSpace::create();
        asp.define_region(0x1000, 0x1000, Perm::R | Perm::W).unwrap();
        let id = register(asp);

        let current = FixedCurrentAddressSpace::new(Some(id));
        let mut frames = BitmapFrameSource::new(4);
        let mut tlb = ArrayTlb::new(4);
        let irq = NoopInterruptPriority::new();

        fault(
            crate::arch::FaultType::Read,
            0x1000,
            &current,
            &mut frames,
            &mut tlb,
            &irq,
        )
        .unwrap();
        assert!(tlb.probe(0x1000).is_some());

        unregister(id, &mut frames);
    }

    #[test]
    fn fault_with_unregistered_current_id_is_efault() {
        let _guard = reset();
        let current = FixedCurrentAddressSpace::new(Some(AsId(999_999)));
        let mut frames = BitmapFrameSource::new(4);
        let mut tlb = ArrayTlb::new(4);
        let irq = NoopInterruptPriority::new();

        let err = fault(
            crate::arch::FaultType::Read,
            0x1000,
            &current,
            &mut frames,
            &mut tlb,
            &irq,
        )
        .unwrap_err();
        assert_eq!(err, VmError::Efault);
    }

    #[test]
    fn copy_registers_an_independent_address_space() {
        let _guard = reset();
        let mut asp = AddressSpace::create();
        asp.define_region(0x2000, 0x1000, Perm::R | Perm::W).unwrap();
        let id = register(asp);

        let current = FixedCurrentAddressSpace::new(Some(id));
        let mut frames = BitmapFrameSource::new(8);
        let mut tlb = ArrayTlb::new(4);
        let irq = NoopInterruptPriority::new();
        fault(
            crate::arch::FaultType::Write,
            0x2000,
            &current,
            &mut frames,
            &mut tlb,
            &irq,
        )
        .unwrap();

        let new_id = copy(id, &mut frames).unwrap();
        assert_ne!(new_id, id);

        unregister(id, &mut frames);
        unregister(new_id, &mut frames);
    }

    #[test]
    fn bootstrap_sizes_hpt_to_ram_size() {
        let _guard = TEST_LOCK.lock();
        bootstrap(4096 * crate::arch::PAGE_SIZE).unwrap();
        assert_eq!(HPT.lock().as_ref().unwrap().len(), 4096);
    }

    #[test]
    fn bootstrap_rounds_sub_page_ram_up_to_one_slot() {
        let _guard = TEST_LOCK.lock();
        bootstrap(1).unwrap();
        assert_eq!(HPT.lock().as_ref().unwrap().len(), 1);
    }
}
