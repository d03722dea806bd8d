/*
 * Fault handler
 *
 * Mirrors the source's `vm_fault` dispatch: classify the fault, reject
 * anything outside a defined region or above `USERSTACK`, satisfy a miss
 * by installing a zero-filled page into the HPT, and load the TLB. Unlike
 * the source, a lookup/allocation failure here never leaves the TLB or
 * HPT touched: the entry is built up fully in a local before either
 * structure is mutated.
 *
 * Resolving "which address space is current" is the caller's job (see
 * `vm::fault` in `mod.rs`), not this function's: this one only needs the
 * address space already in hand, so it never has to reach into global
 * state to do its work, and stays trivially unit-testable against a
 * plain `&AddressSpace`.
 */

use crate::arch::{FaultType, FrameSource, InterruptPriority, Perm, Tlb, PAGE_FRAME, USERSTACK};
use crate::vm::addrspace::AddressSpace;
use crate::vm::error::VmError;
use crate::vm::hpt::{encode_entry_lo, Hpt};

/// Handle one TLB miss for `fault_address` against `asp`, the address
/// space already determined to be current.
///
/// `irq` guards the critical section around the TLB write the way the
/// source's `splhigh`/`splx` pair does.
pub fn fault(
    fault_type: FaultType,
    fault_address: u32,
    asp: &AddressSpace,
    hpt: &mut Hpt,
    frames: &mut dyn FrameSource,
    tlb: &mut dyn Tlb,
    irq: &dyn InterruptPriority,
) -> Result<(), VmError> {
    if fault_address == 0 {
        log::warn!("vm_fault: null-page access by address space {}", asp.id().0);
        return Err(VmError::Efault);
    }
    if matches!(fault_type, FaultType::ReadOnly) {
        log::warn!(
            "vm_fault: hardware-impossible READONLY fault class for address space {}",
            asp.id().0
        );
        return Err(VmError::Efault);
    }
    if fault_address >= USERSTACK {
        log::warn!(
            "vm_fault: fault at 0x{:x} in address space {} is at or above USERSTACK",
            fault_address,
            asp.id().0
        );
        return Err(VmError::Einval);
    }

    let region = asp.region_for(fault_address).ok_or_else(|| {
        log::warn!(
            "vm_fault: 0x{:x} in address space {} is outside any defined region",
            fault_address,
            asp.id().0
        );
        VmError::Efault
    })?;
    let mode = region.effective_mode(asp.is_loading());

    let vpn = fault_address & PAGE_FRAME;
    let as_id = asp.id();

    let entry_lo = match hpt.lookup(vpn, as_id) {
        Some(existing) => existing,
        None => {
            let frame = frames.alloc().ok_or(VmError::Enomem)?;
            frames.zero(frame);
            let writable = mode.contains(Perm::W);
            let entry_lo = encode_entry_lo(frame, writable);
            if let Err(err) = hpt.insert(vpn, entry_lo, as_id) {
                frames.free(frame);
                log::error!(
                    "vm_fault: HPT insert failed for vpn 0x{:x} in address space {}: {}",
                    vpn,
                    as_id.0,
                    err
                );
                return Err(err);
            }
            log::debug!(
                "vm_fault: demand-allocated vpn 0x{:x} for address space {}",
                vpn,
                as_id.0
            );
            entry_lo
        }
    };

    let _guard = irq.raise_high();
    tlb.write_random(vpn, entry_lo);
    Ok(())
}
