//! # Image
//!
//! The process image after initialization: its code region has been replaced by a private,
//! patchable mapping and a shadow image is in place to run the patching routines from.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Step};
use crate::kernel::{Kernel, Segment};
use crate::layout::locate;
use crate::shadow::trampoline::{check_routines, overwrite_code, recreate_code};
use crate::shadow::{self, Shadow};
use crate::threads::Reports;

/// Set once the code region of this process has been touched by a self-hosted kernel
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Settings for [`Image::initialize`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Expected base of the code region. `None` asks the kernel.
    pub image_base: Option<usize>,
    /// Abort a mutation when any thread could not be suspended
    pub strict_threads: bool,
    /// Read patched bytes back and compare them
    pub verify_writes: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image_base: None,
            strict_threads: false,
            verify_writes: true,
        }
    }
}

impl Config {
    /// Expects the code region at `base` instead of where the kernel says the image is
    pub fn image_base(mut self, base: usize) -> Self {
        self.image_base = Some(base);
        self
    }

    /// Sets whether a partial suspension aborts the mutation
    pub fn strict_threads(mut self, strict: bool) -> Self {
        self.strict_threads = strict;
        self
    }

    /// Sets whether patches are read back after writing
    pub fn verify_writes(mut self, verify: bool) -> Self {
        self.verify_writes = verify;
        self
    }
}

/// An initialized process image whose code can be patched
#[derive(Debug)]
pub struct Image<K: Kernel> {
    /// Kernel the image was set up with
    kernel: K,
    /// Settings in effect
    config: Config,
    /// The recreated code region
    code: Segment,
    /// The shadow image the patching routines run from
    shadow: Shadow,
    /// Page size, queried once up front
    page_size: usize,
}

/// Logs a failed operation and hands the error back
fn report(operation: &str) -> impl Fn(Error) -> Error + '_ {
    move |err| {
        log::error!("{operation} failed (error {}): {err}", err.code());
        if err.is_fatal() {
            log::error!("the code region of this process can no longer be trusted");
        }
        err
    }
}

impl<K: Kernel> Image<K> {
    /// Prepares the process for patching.
    ///
    /// Locates the code region and the data regions behind it, builds the shadow image and, with
    /// every other thread suspended, recreates the code region as a private mapping. Layout
    /// problems are detected before anything is mutated.
    ///
    /// With a self-hosted kernel this can only be attempted once per process; later calls return
    /// [`Error::AlreadyInitialized`] without touching memory.
    pub fn initialize(kernel: K, config: Config) -> Result<Self, Error> {
        if K::SELF_HOSTED && INITIALIZED.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyInitialized);
        }
        Self::setup(kernel, config).map_err(report("initialization"))
    }

    /// Does the work of [`Image::initialize`]
    fn setup(kernel: K, config: Config) -> Result<Self, Error> {
        // asked here: nothing running from the shadow image may query it
        let page_size = kernel.page_size();
        let image_base = config.image_base.unwrap_or_else(|| kernel.image_base());

        let layout = locate(&kernel, image_base)?;
        check_routines::<K>(&layout.code)?;
        let shadow = shadow::build(&kernel, &layout)?;

        let mut reports = Reports::default();
        // SAFETY: the shadow was just built from the current code region
        let result =
            unsafe { recreate_code(&kernel, &shadow, config.strict_threads, &mut reports) };
        reports.log();
        result?;

        // SAFETY: the range is the freshly written code region
        unsafe { kernel.flush_icache(layout.code.base, layout.code.size) };
        log::info!(
            "code region {:#x}..{:#x} recreated, shadow image at {:#x}",
            layout.code.base,
            layout.code.end(),
            shadow.base()
        );

        Ok(Self {
            kernel,
            config,
            code: layout.code,
            shadow,
            page_size,
        })
    }

    /// Overwrites the code at `target` with `bytes`.
    ///
    /// Other threads are suspended for the duration of the write. An empty patch does nothing.
    ///
    /// # Safety
    ///
    /// The bytes must form valid machine code where they land, and no suspended thread may be
    /// stopped in the middle of the instructions being replaced.
    pub unsafe fn patch(&self, target: usize, bytes: &[u8]) -> Result<(), Error> {
        if bytes.is_empty() {
            return Ok(());
        }
        if !self.code.contains_range(target, bytes.len()) {
            return Err(report("patch")(Error::OutOfRange {
                target,
                len: bytes.len(),
                start: self.code.base,
                end: self.code.end(),
            }));
        }
        self.overwrite(target, bytes).map_err(report("patch"))
    }

    /// Does the work of [`Image::patch`] on a checked range
    unsafe fn overwrite(&self, target: usize, bytes: &[u8]) -> Result<(), Error> {
        let mut reports = Reports::default();
        let result = overwrite_code(
            &self.kernel,
            &self.shadow,
            target,
            bytes,
            self.page_size,
            self.config.strict_threads,
            &mut reports,
        );
        reports.log();
        result?;

        self.kernel.flush_icache(target, bytes.len());
        if self.config.verify_writes {
            self.verify(target, bytes)?;
        }
        log::trace!("patched {} bytes at {target:#x}", bytes.len());
        Ok(())
    }

    /// Reads the patched range back and compares it against `bytes`
    unsafe fn verify(&self, target: usize, bytes: &[u8]) -> Result<(), Error> {
        let mut actual = vec![0; bytes.len()];
        self.kernel
            .read(target, &mut actual)
            .map_err(|code| Error::kernel(Step::VerifyTarget, code))?;
        if actual != bytes {
            return Err(Error::VerificationFailed { target });
        }
        Ok(())
    }

    /// The recreated code region
    pub fn code(&self) -> Segment {
        self.code
    }

    /// The shadow image
    pub fn shadow(&self) -> Shadow {
        self.shadow
    }

    /// The kernel the image was set up with
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Settings in effect
    pub fn config(&self) -> Config {
        self.config
    }
}
