//! # Kernel
//!
//! This module covers the kernel facilities the engine drives: region queries, allocation,
//! protection changes, copies and thread control

use std::fmt::Debug;

use region::Protection;

use crate::error::KernReturn;

#[cfg(target_os = "macos")]
pub mod mach;
#[cfg(test)]
pub(crate) mod sim;

/// A mapped region of the address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Base address of the region
    pub base: usize,
    /// Size of the region in bytes
    pub size: usize,
    /// Current protection of the region
    pub protection: Protection,
}

impl Segment {
    /// First address past the end of the region
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    /// Whether `address` lies in the region
    pub fn contains(&self, address: usize) -> bool {
        (self.base..self.end()).contains(&address)
    }

    /// Whether `[address, address + len)` lies entirely in the region
    pub fn contains_range(&self, address: usize, len: usize) -> bool {
        match address.checked_add(len) {
            Some(end) => self.contains(address) && end <= self.end(),
            None => false,
        }
    }
}

/// Where an allocation should be placed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Wherever the kernel likes
    Anywhere,
    /// Exactly at the given address
    Fixed(usize),
}

/// Kernel facilities for the current process
///
/// # Safety
///
/// Implementations are called from routines running inside the shadow image, possibly while the
/// real code region is unmapped. Every method other than [`Kernel::image_base`] and
/// [`Kernel::page_size`] must therefore:
///
/// - never write to a static of the main image (the shadow copy of the data segments is read-only)
/// - never log, panic or dispatch through a vtable
/// - only call code that is either position independent in the main image or lives in another image
pub unsafe trait Kernel {
    /// Handle to a thread of the process
    type Thread: Copy + Eq + Debug;
    /// Snapshot of the threads of the process, released when dropped
    type Threads: AsRef<[Self::Thread]>;

    /// Whether this kernel manages the very image this code runs from.
    ///
    /// When `true`, mutating routines are invoked through their copy in the shadow image.
    const SELF_HOSTED: bool;

    /// Address the code region is expected to start at
    fn image_base(&self) -> usize;

    /// Size of a memory page. Not callable from relocated routines.
    fn page_size(&self) -> usize;

    /// Describes the region containing `address`, or the closest region above it
    fn region(&self, address: usize) -> Result<Segment, KernReturn>;

    /// Allocates `size` zeroed, readable and writable bytes, returning the base address
    ///
    /// # Safety
    ///
    /// A fixed placement may be refused but never silently replaces existing mappings.
    unsafe fn allocate(&self, placement: Placement, size: usize) -> Result<usize, KernReturn>;

    /// Unmaps `[address, address + size)`
    ///
    /// # Safety
    ///
    /// Nothing may execute from or reference the range afterwards.
    unsafe fn deallocate(&self, address: usize, size: usize) -> Result<(), KernReturn>;

    /// Sets the protection of every page overlapping `[address, address + size)`
    ///
    /// # Safety
    ///
    /// The caller must not be executing from the affected pages.
    unsafe fn protect(
        &self,
        address: usize,
        size: usize,
        protection: Protection,
    ) -> Result<(), KernReturn>;

    /// Copies `size` bytes from `source` to `destination`, both in this address space
    ///
    /// # Safety
    ///
    /// `destination` must be writable and not overlap `source`.
    unsafe fn copy(&self, source: usize, size: usize, destination: usize) -> Result<(), KernReturn>;

    /// Writes `bytes` at `destination`
    ///
    /// # Safety
    ///
    /// `destination` must be writable for `bytes.len()` bytes.
    unsafe fn write(&self, destination: usize, bytes: &[u8]) -> Result<(), KernReturn>;

    /// Reads `buf.len()` bytes at `source`
    ///
    /// # Safety
    ///
    /// `source` must be readable for `buf.len()` bytes.
    unsafe fn read(&self, source: usize, buf: &mut [u8]) -> Result<(), KernReturn>;

    /// Enumerates the threads of the process, including the calling one
    fn threads(&self) -> Result<Self::Threads, KernReturn>;

    /// Handle of the calling thread
    fn current_thread(&self) -> Self::Thread;

    /// Suspends `thread`
    ///
    /// # Safety
    ///
    /// The thread may hold locks the caller needs; suspended threads must be resumed.
    unsafe fn suspend(&self, thread: Self::Thread) -> Result<(), KernReturn>;

    /// Resumes `thread`
    ///
    /// # Safety
    ///
    /// Must pair with an earlier [`Kernel::suspend`].
    unsafe fn resume(&self, thread: Self::Thread) -> Result<(), KernReturn>;

    /// Discards stale instructions cached for `[address, address + size)`
    ///
    /// # Safety
    ///
    /// The range must be mapped.
    unsafe fn flush_icache(&self, address: usize, size: usize);
}
