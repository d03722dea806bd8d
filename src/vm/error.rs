/*
 * VM error type
 *
 * Typed replacement for the source's negative-errno-as-int convention,
 * matching the pattern this kernel already uses for its other subsystem
 * error types (see `ShmemError` in the kernel's shared-memory module).
 */

/// Errors returned by the virtual memory subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Frame, HPT node, or region descriptor allocation failed.
    Enomem,
    /// Access outside any region, a null-page access, a hardware-impossible
    /// fault class, or no current address space.
    Efault,
    /// A fault at or above `USERSTACK`, an unrecognized fault type, or a
    /// region definition that overlaps an existing region or exceeds
    /// `USERSTACK`.
    Einval,
}

impl core::fmt::Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::Enomem => write!(f, "out of memory"),
            VmError::Efault => write!(f, "bad address"),
            VmError::Einval => write!(f, "invalid argument"),
        }
    }
}
