/*
 * Architecture parameters and collaborator traits
 *
 * This module holds the constants that describe the target machine's
 * memory layout, plus the trait boundaries to the pieces of the kernel
 * this subsystem depends on but does not own: the physical frame
 * allocator, the TLB hardware interface, interrupt-priority control, and
 * the "which address space is the current process running" query.
 *
 * Why this is important:
 * - Keeps the VM core portable: a real MIPS BSP implements these traits
 *   once, and the core never needs to change.
 * - Lets the VM core be unit-tested against the `sim` reference
 *   implementations without any hardware or bootloader involved.
 */

pub mod sim;

use crate::vm::addrspace::AsId;

/// Size of a page / frame in bytes.
pub const PAGE_SIZE: u32 = 4096;

/// Mask selecting the page-frame bits of an address (clears the low 12 bits).
pub const PAGE_FRAME: u32 = !0xFFF;

/// Top of the user address range; the fixed-size user stack sits just below it.
pub const USERSTACK: u32 = 0x8000_0000;

/// Top of the user address space as a whole (kernel addresses start above this
/// in a real deployment; this core only ever compares against `USERSTACK`).
pub const USERSPACETOP: u32 = USERSTACK;

/// Number of pages reserved for the user stack.
pub const STACKPAGES: u32 = 18;

bitflags::bitflags! {
    /// ELF-convention region permission bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Perm: u32 {
        const R = 0b100;
        const W = 0b010;
        const X = 0b001;
    }
}

bitflags::bitflags! {
    /// HPT / TLB control bits. `VALID` marks a resolvable entry; `DIRTY`
    /// doubles as the MIPS TLB's write-enable bit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Ctrl: u32 {
        const VALID = 0b10;
        const DIRTY = 0b01;
    }
}

/// A physical frame number, in frame (not byte) units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame(pub u32);

impl Frame {
    pub fn addr(self) -> u32 {
        self.0 * PAGE_SIZE
    }
}

/// The kind of TLB miss the hardware reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultType {
    Read,
    Write,
    /// Hardware-impossible: every page this subsystem installs is
    /// read/write at the TLB level. Kept so callers can pass the raw
    /// hardware fault code straight through without translating it first.
    ReadOnly,
}

/// Obtains and releases single physical frames, and zero-fills/copies them
/// through their kernel-virtual windows.
///
/// Out of scope for this crate to implement for real hardware: a real
/// deployment backs this with the kernel's physical frame allocator. See
/// [`sim::BitmapFrameSource`] for a reference implementation used in tests.
pub trait FrameSource {
    /// Allocate one physical frame. Returns `None` on exhaustion.
    fn alloc(&mut self) -> Option<Frame>;

    /// Return a previously allocated frame to the pool.
    fn free(&mut self, frame: Frame);

    /// Zero-fill an entire frame.
    fn zero(&mut self, frame: Frame);

    /// Copy the contents of `src` into `dst`. Frames do not overlap.
    fn copy(&mut self, src: Frame, dst: Frame);
}

/// The CPU-local, software-managed TLB.
pub trait Tlb {
    /// Write `(vpn | ctrl)` into an implementation-chosen TLB slot.
    fn write_random(&mut self, vpn: u32, entry_lo: u32);

    /// Invalidate every TLB entry.
    fn invalidate_all(&mut self);
}

/// RAII guard restoring the previous interrupt priority level on drop.
pub trait InterruptGuard {}

/// Raises the CPU's interrupt priority for the duration of a held guard,
/// standing in for the kernel's `splhigh`/`splx` pair.
pub trait InterruptPriority {
    /// Raise to high priority; interrupts are restored when the returned
    /// guard drops. Boxed so the trait stays object-safe for callers that
    /// hold a `&dyn InterruptPriority`.
    fn raise_high(&self) -> alloc::boxed::Box<dyn InterruptGuard + '_>;
}

/// Stands in for the process subsystem's "which address space is the
/// currently running process using" accessor.
pub trait CurrentAddressSpace {
    /// Returns the id of the address space in use by the current process,
    /// or `None` if there is no current process (early boot).
    fn current(&self) -> Option<AsId>;
}
