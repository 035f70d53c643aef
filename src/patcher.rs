//! # Patcher
//!
//! This module covers patchers, which are used to overwrite and restore locations in the code of
//! the running process

use crate::error::{Error, Step};
use crate::image::Image;
use crate::kernel::Kernel;

/// All patchers save the bytes they replace and are able to put them back on command
///
/// # Safety
///
/// Patchers are inherently unsafe. The implementor must ensure that the implementation of `patch`
/// works correctly and is properly documented for avoiding undefined behavior
pub unsafe trait Patcher {
    /// Error type that can occur when patching
    type Error;
    /// Guard type for the patcher. When this guard is dropped, the location should be restored.
    type Guard<'a>: PatchGuard + 'a
    where
        Self: 'a;

    /// Overwrites `bytes.len()` bytes of code at `target`.
    ///
    /// # Safety
    ///
    /// `target` must point into code the patcher manages, and `bytes` must be valid machine code
    /// at that location
    unsafe fn patch<'a>(
        &'a self,
        target: *const u8,
        bytes: &[u8],
    ) -> Result<Self::Guard<'a>, Self::Error>;
}

/// Guard for a patch
///
/// # Safety
///
/// Guard must fully unpatch the location when dropped, even if `restore` is not called
pub unsafe trait PatchGuard: Sized {
    /// Restores the original bytes of a patch
    fn restore(self) {
        // implementations restore in their [`Drop::drop`] implementation
    }
}

unsafe impl<K: Kernel> Patcher for Image<K> {
    type Error = Error;
    type Guard<'a> = CodePatchGuard<'a, K> where Self: 'a;

    unsafe fn patch<'a>(
        &'a self,
        target: *const u8,
        bytes: &[u8],
    ) -> Result<Self::Guard<'a>, Self::Error> {
        let target = target as usize;
        let original = save(self, target, bytes.len())?;
        Image::patch(self, target, bytes)?;
        Ok(CodePatchGuard {
            image: self,
            target,
            original,
        })
    }
}

/// Reads the `len` bytes at `target` that a patch is about to replace
///
/// # Safety
///
/// The code region of `image` must be mapped readable, which it is after initialization.
unsafe fn save<K: Kernel>(image: &Image<K>, target: usize, len: usize) -> Result<Vec<u8>, Error> {
    let mut original = vec![0; len];
    if len == 0 {
        return Ok(original);
    }
    let code = image.code();
    if !code.contains_range(target, len) {
        return Err(Error::OutOfRange {
            target,
            len,
            start: code.base,
            end: code.end(),
        });
    }
    image
        .kernel()
        .read(target, &mut original)
        .map_err(|code| Error::kernel(Step::SaveTarget, code))?;
    Ok(original)
}

/// Guard for code patches made through an [`Image`]
///
/// See [`Patcher`].
#[derive(Debug)]
pub struct CodePatchGuard<'a, K: Kernel> {
    /// Image the patch was made in
    image: &'a Image<K>,
    /// Location of the patch
    target: usize,
    /// Bytes that were there before
    original: Vec<u8>,
}

impl<K: Kernel> CodePatchGuard<'_, K> {
    /// Location of the patch
    pub fn target(&self) -> usize {
        self.target
    }

    /// Bytes the patch replaced
    pub fn original(&self) -> &[u8] {
        &self.original
    }
}

unsafe impl<K: Kernel> PatchGuard for CodePatchGuard<'_, K> {}

impl<K: Kernel> Drop for CodePatchGuard<'_, K> {
    fn drop(&mut self) {
        // SAFETY: the original bytes were valid code at this location before the patch
        if let Err(err) = unsafe { self.image.patch(self.target, &self.original) } {
            log::warn!("could not restore code at {:#x}: {err}", self.target);
        }
    }
}
