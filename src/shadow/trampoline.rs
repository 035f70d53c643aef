//! # Trampoline
//!
//! The only place where the real code region is destroyed or has its protection changed.
//!
//! The kernel refuses to change the protection of, or unmap, the region the calling thread is
//! executing from. So the two routines here, [`recreate`] and [`overwrite`], are never called at
//! their real address. Instead their address is translated into the shadow image and control is
//! transferred to the copy there. The copy is byte-identical and sits at the same distance from
//! the copies of the data regions, so every PC-relative call, jump and data reference it makes
//! lands on a shadow copy as well, and calls into other images go through the shadow copy of the
//! import table, which holds the same resolved addresses.
//!
//! While running from the shadow image these routines, and everything they call, must:
//!
//! - not write to any static of the main image. The statics they would reach are the shadow
//!   copies, which are mapped read+execute only. This rules out logging, lazily initialized
//!   statics (including [`region::page::size`]), and anything else with hidden global state.
//! - not panic or unwind. The panic machinery writes to statics and, during [`recreate`], the real
//!   code region it might return into does not exist.
//! - not dispatch through vtables. Vtables hold absolute addresses into the real code region.
//! - only touch memory owned by the caller's stack frame, by another image, or by the kernel.
//!
//! Hence all results come back as plain data ([`Fault`], [`Reports`]) and are logged by the
//! caller after the routine has returned to the real code region.
//!
//! When the kernel is not [self-hosted](Kernel::SELF_HOSTED), the routines are called directly.

use std::mem;

use region::Protection;

use super::Shadow;
use crate::error::{Error, Fault, Step};
use crate::kernel::{Kernel, Placement, Segment};
use crate::page;
use crate::threads::{self, Reports};

/// Signature of [`recreate`]
type RecreateRoutine<K> = unsafe fn(
    &K,
    usize,
    usize,
    usize,
    bool,
    &mut Reports<<K as Kernel>::Thread>,
) -> Result<(), Fault>;

/// Signature of [`overwrite`]
type OverwriteRoutine<K> = unsafe fn(
    &K,
    usize,
    &[u8],
    usize,
    usize,
    bool,
    &mut Reports<<K as Kernel>::Thread>,
) -> Result<(), Fault>;

/// Addresses of the routines that will be relocated for `K`
fn routines<K: Kernel>() -> [usize; 2] {
    [
        recreate::<K> as RecreateRoutine<K> as usize,
        overwrite::<K> as OverwriteRoutine<K> as usize,
    ]
}

/// Checks that the routines to relocate live in `code`.
///
/// They do not when this crate is linked into a library instead of the main executable, and the
/// shadow image would not contain them.
pub(crate) fn check_routines<K: Kernel>(code: &Segment) -> Result<(), Error> {
    if !K::SELF_HOSTED {
        return Ok(());
    }
    match routines::<K>()
        .into_iter()
        .find(|&address| !code.contains(address))
    {
        Some(address) => Err(Error::RoutineOutsideImage { address }),
        None => Ok(()),
    }
}

/// Finds the copy of `routine` inside the shadow image
///
/// # Safety
///
/// `F` must be a function pointer type. The returned pointer is only valid while the shadow image
/// is mapped, which is forever.
unsafe fn relocate<K: Kernel, F: Copy>(shadow: &Shadow, routine: F) -> Result<F, Error> {
    if !K::SELF_HOSTED {
        return Ok(routine);
    }
    debug_assert_eq!(mem::size_of::<F>(), mem::size_of::<usize>());
    let address: usize = mem::transmute_copy(&routine);
    let relocated = shadow
        .translate(address)
        .ok_or(Error::RoutineOutsideImage { address })?;
    Ok(mem::transmute_copy(&relocated))
}

/// Replaces the real code region with a fresh, privately owned mapping holding the same bytes.
///
/// The original mapping of an executable may be shared and refuse to become writable; the fresh
/// one can have its protection toggled at will afterwards.
///
/// # Safety
///
/// `shadow` must mirror the current code region. Any fault past the suspension leaves the code
/// region in an unknown state.
pub(crate) unsafe fn recreate_code<K: Kernel>(
    kernel: &K,
    shadow: &Shadow,
    strict: bool,
    reports: &mut Reports<K::Thread>,
) -> Result<(), Error> {
    let routine = relocate::<K, RecreateRoutine<K>>(shadow, recreate::<K>)?;
    let code = shadow.code();
    routine(kernel, code.base, code.size, shadow.base(), strict, reports).map_err(Error::from)
}

/// Writes `bytes` at `target` inside the real code region
///
/// # Safety
///
/// `target..target + bytes.len()` must lie in the recreated code region, and no thread may be
/// about to execute a half-replaced instruction sequence when resumed.
pub(crate) unsafe fn overwrite_code<K: Kernel>(
    kernel: &K,
    shadow: &Shadow,
    target: usize,
    bytes: &[u8],
    page_size: usize,
    strict: bool,
    reports: &mut Reports<K::Thread>,
) -> Result<(), Error> {
    // computed here: nothing inside the routine may consult the page size lazily
    let (start, size) = page::span(target, bytes.len(), page_size);
    let routine = relocate::<K, OverwriteRoutine<K>>(shadow, overwrite::<K>)?;
    routine(kernel, target, bytes, start, size, strict, reports).map_err(Error::from)
}

/// Runs from the shadow image. Unmaps the code region, maps a fresh one at the same address and
/// copies the original bytes back from the shadow.
#[inline(never)]
unsafe fn recreate<K: Kernel>(
    kernel: &K,
    code_base: usize,
    code_size: usize,
    shadow_base: usize,
    strict: bool,
    reports: &mut Reports<K::Thread>,
) -> Result<(), Fault> {
    threads::paused(kernel, strict, reports, || {
        kernel
            .deallocate(code_base, code_size)
            .map_err(Fault::at(Step::DeallocateCode))?;

        // from here on there is no code at `code_base` until the copy below completes
        let actual = kernel
            .allocate(Placement::Fixed(code_base), code_size)
            .map_err(Fault::at(Step::AllocateCode))?;
        if actual != code_base {
            return Err(Fault::Relocated {
                requested: code_base,
                actual,
            });
        }

        kernel
            .protect(code_base, code_size, Protection::READ_WRITE)
            .map_err(Fault::at(Step::ProtectCodeWritable))?;
        // the code lives at offset 0 of the shadow
        kernel
            .copy(shadow_base, code_size, code_base)
            .map_err(Fault::at(Step::RestoreCode))?;
        kernel
            .protect(code_base, code_size, Protection::READ_EXECUTE)
            .map_err(Fault::at(Step::ProtectCodeExecutable))
    })
}

/// Runs from the shadow image. Makes the pages around the target writable, writes the bytes and
/// makes them executable again.
#[inline(never)]
unsafe fn overwrite<K: Kernel>(
    kernel: &K,
    target: usize,
    bytes: &[u8],
    span_start: usize,
    span_size: usize,
    strict: bool,
    reports: &mut Reports<K::Thread>,
) -> Result<(), Fault> {
    threads::paused(kernel, strict, reports, || {
        kernel
            .protect(span_start, span_size, Protection::READ_WRITE)
            .map_err(Fault::at(Step::ProtectTargetWritable))?;
        let written = kernel
            .write(target, bytes)
            .map_err(Fault::at(Step::WriteTarget));
        // never leave the pages non-executable, even if the write failed
        let restored = kernel
            .protect(span_start, span_size, Protection::READ_EXECUTE)
            .map_err(Fault::at(Step::ProtectTargetExecutable));
        written?;
        restored
    })
}
