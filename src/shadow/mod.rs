//! # Shadow
//!
//! The shadow image is a relocated copy of the code, read-only data and data regions, laid out
//! exactly like the original so every address-relative reference in the copied code still resolves.
//! Code that must not run from the real code region while it is being changed runs from here.

use region::Protection;

use crate::error::{Error, Step};
use crate::kernel::{Kernel, Placement, Segment};
use crate::layout::Layout;

pub(crate) mod trampoline;

/// A built shadow image. It is never released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shadow {
    /// Base address of the shadow image
    base: usize,
    /// Total size: the three regions combined
    size: usize,
    /// The code region the shadow mirrors
    code: Segment,
}

impl Shadow {
    /// Base address of the shadow image
    pub fn base(&self) -> usize {
        self.base
    }

    /// Size of the shadow image
    pub fn size(&self) -> usize {
        self.size
    }

    /// The code region the shadow image mirrors
    pub fn code(&self) -> Segment {
        self.code
    }

    /// Address of the copy of `address` inside the shadow image, for addresses in the code region
    pub fn translate(&self, address: usize) -> Option<usize> {
        self.code
            .contains(address)
            .then(|| address - self.code.base + self.base)
    }

    /// Inverse of [`Shadow::translate`]
    pub fn untranslate(&self, address: usize) -> Option<usize> {
        let offset = address.checked_sub(self.base)?;
        (offset < self.code.size).then(|| self.code.base + offset)
    }
}

/// Builds the shadow image for `layout`.
///
/// The copy is made while the shadow is writable and only then turned executable, so a failure
/// never leaves a partial image around to run. On failure the allocation is released again.
pub fn build<K: Kernel>(kernel: &K, layout: &Layout) -> Result<Shadow, Error> {
    let size = layout.size();
    // SAFETY: fresh allocation anywhere does not disturb existing mappings
    let base = unsafe { kernel.allocate(Placement::Anywhere, size) }
        .map_err(|code| Error::kernel(Step::AllocateShadow, code))?;

    // SAFETY: `base..base + size` is ours and nothing executes from it yet
    if let Err(err) = unsafe { fill(kernel, layout, base) } {
        if let Err(code) = unsafe { kernel.deallocate(base, size) } {
            log::warn!("could not release partial shadow image at {base:#x}: {code}");
        }
        return Err(err);
    }

    log::debug!("shadow image at {:#x}..{:#x}", base, base + size);
    Ok(Shadow {
        base,
        size,
        code: layout.code,
    })
}

/// Copies every region of `layout` into the shadow at `base` and makes it executable
///
/// # Safety
///
/// `base` must be a fresh allocation of `layout.size()` bytes.
unsafe fn fill<K: Kernel>(kernel: &K, layout: &Layout, base: usize) -> Result<(), Error> {
    let size = layout.size();
    kernel
        .protect(base, size, Protection::READ_WRITE)
        .map_err(|code| Error::kernel(Step::ProtectShadowWritable, code))?;

    let steps = [Step::CopyCode, Step::CopyReadOnlyData, Step::CopyData];
    for ((_, segment, offset), step) in layout.segments().into_iter().zip(steps) {
        kernel
            .copy(segment.base, segment.size, base + offset)
            .map_err(|code| Error::kernel(step, code))?;
    }

    kernel
        .protect(base, size, Protection::READ_EXECUTE)
        .map_err(|code| Error::kernel(Step::ProtectShadowExecutable, code))
}
