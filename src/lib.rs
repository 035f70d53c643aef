#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod error;
pub mod image;
pub mod kernel;
pub mod layout;
pub mod page;
pub mod patcher;
pub mod shadow;
pub mod threads;

pub use error::{Error, KernReturn, SegmentKind, Step};
pub use image::{Config, Image};
pub use kernel::{Kernel, Placement, Segment};
pub use patcher::{CodePatchGuard, PatchGuard, Patcher};
pub use shadow::Shadow;

#[cfg(target_os = "macos")]
pub use kernel::mach::MachKernel;

/// Prepares the current process for patching with the default [`Config`]
#[cfg(target_os = "macos")]
pub fn initialize() -> Result<Image<MachKernel>, Error> {
    Image::initialize(MachKernel::new()?, Config::default())
}
