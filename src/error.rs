//! # Error
//!
//! Errors reported by the engine, and the plain-data faults that relocated routines hand back

use std::fmt::{self, Display};

use thiserror::Error;

/// Raw return code of a kernel call (`kern_return_t` on Mach)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernReturn(pub i32);

impl KernReturn {
    /// `KERN_SUCCESS`
    pub const SUCCESS: Self = Self(0);
    /// `KERN_INVALID_ADDRESS`
    pub const INVALID_ADDRESS: Self = Self(1);
    /// `KERN_PROTECTION_FAILURE`
    pub const PROTECTION_FAILURE: Self = Self(2);
    /// `KERN_NO_SPACE`
    pub const NO_SPACE: Self = Self(3);
    /// `KERN_INVALID_ARGUMENT`
    pub const INVALID_ARGUMENT: Self = Self(4);
    /// `KERN_FAILURE`
    pub const FAILURE: Self = Self(5);
    /// `KERN_NO_ACCESS`
    pub const NO_ACCESS: Self = Self(8);

    /// Symbolic name for the codes this engine is likely to see
    pub fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            0 => "KERN_SUCCESS",
            1 => "KERN_INVALID_ADDRESS",
            2 => "KERN_PROTECTION_FAILURE",
            3 => "KERN_NO_SPACE",
            4 => "KERN_INVALID_ARGUMENT",
            5 => "KERN_FAILURE",
            8 => "KERN_NO_ACCESS",
            14 => "KERN_ABORTED",
            15 => "KERN_INVALID_NAME",
            16 => "KERN_INVALID_TASK",
            _ => return None,
        })
    }
}

impl Display for KernReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({name})", self.0),
            None => write!(f, "{}", self.0),
        }
    }
}

/// Every sub-step that can fail, so diagnostics can name exactly where things went wrong
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Obtaining the task port of the current process
    TaskForPid,
    /// Querying the code region
    QueryCode,
    /// Querying the read-only data region
    QueryReadOnlyData,
    /// Querying the writable data region
    QueryData,
    /// Allocating the shadow image
    AllocateShadow,
    /// Making the shadow image writable
    ProtectShadowWritable,
    /// Copying the code region into the shadow image
    CopyCode,
    /// Copying the read-only data region into the shadow image
    CopyReadOnlyData,
    /// Copying the writable data region into the shadow image
    CopyData,
    /// Making the shadow image executable
    ProtectShadowExecutable,
    /// Suspending the other threads of the process
    SuspendThreads,
    /// Destroying the original code region
    DeallocateCode,
    /// Allocating the fresh code region at the original address
    AllocateCode,
    /// Making the fresh code region writable
    ProtectCodeWritable,
    /// Copying the original code back from the shadow image
    RestoreCode,
    /// Making the fresh code region executable
    ProtectCodeExecutable,
    /// Resuming the other threads of the process
    ResumeThreads,
    /// Saving the bytes a patch replaces
    SaveTarget,
    /// Making the patch target writable
    ProtectTargetWritable,
    /// Writing the patch bytes
    WriteTarget,
    /// Making the patch target executable again
    ProtectTargetExecutable,
    /// Reading the patch target back
    VerifyTarget,
}

/// Which family of kernel facility a step belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Facility {
    /// Region and task queries
    Query,
    /// Allocation and deallocation
    Allocation,
    /// Protection changes
    Protection,
    /// Byte copies
    Copy,
    /// Thread suspension/resumption
    Threads,
}

impl Step {
    /// Human readable name of the step
    pub fn name(self) -> &'static str {
        match self {
            Self::TaskForPid => "task_for_pid",
            Self::QueryCode => "query code region",
            Self::QueryReadOnlyData => "query read-only data region",
            Self::QueryData => "query data region",
            Self::AllocateShadow => "allocate shadow image",
            Self::ProtectShadowWritable => "make shadow image writable",
            Self::CopyCode => "copy code region to shadow",
            Self::CopyReadOnlyData => "copy read-only data region to shadow",
            Self::CopyData => "copy data region to shadow",
            Self::ProtectShadowExecutable => "make shadow image executable",
            Self::SuspendThreads => "suspend threads",
            Self::DeallocateCode => "deallocate code region",
            Self::AllocateCode => "reallocate code region",
            Self::ProtectCodeWritable => "make code region writable",
            Self::RestoreCode => "restore code region from shadow",
            Self::ProtectCodeExecutable => "make code region executable",
            Self::ResumeThreads => "resume threads",
            Self::SaveTarget => "save original bytes",
            Self::ProtectTargetWritable => "make patch target writable",
            Self::WriteTarget => "write patch bytes",
            Self::ProtectTargetExecutable => "make patch target executable",
            Self::VerifyTarget => "read patch target back",
        }
    }

    /// Whether a failure in this step leaves the process without intact code.
    ///
    /// These are the steps between unmapping the original code region and making its replacement
    /// executable again.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::AllocateCode
                | Self::ProtectCodeWritable
                | Self::RestoreCode
                | Self::ProtectCodeExecutable
        )
    }

    /// Facility the step exercises
    pub(crate) fn facility(self) -> Facility {
        match self {
            Self::TaskForPid
            | Self::QueryCode
            | Self::QueryReadOnlyData
            | Self::QueryData
            | Self::SaveTarget
            | Self::VerifyTarget => Facility::Query,
            Self::AllocateShadow | Self::DeallocateCode | Self::AllocateCode => Facility::Allocation,
            Self::ProtectShadowWritable
            | Self::ProtectShadowExecutable
            | Self::ProtectCodeWritable
            | Self::ProtectCodeExecutable
            | Self::ProtectTargetWritable
            | Self::ProtectTargetExecutable => Facility::Protection,
            Self::CopyCode
            | Self::CopyReadOnlyData
            | Self::CopyData
            | Self::RestoreCode
            | Self::WriteTarget => Facility::Copy,
            Self::SuspendThreads | Self::ResumeThreads => Facility::Threads,
        }
    }
}

impl Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The three segments of the image, named for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Executable code
    Code,
    /// Read-only data following the code
    ReadOnlyData,
    /// Writable data following the read-only data
    Data,
}

impl Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Code => "code",
            Self::ReadOnlyData => "read-only data",
            Self::Data => "data",
        })
    }
}

/// Errors from initializing the engine or patching code
#[derive(Debug, Error)]
pub enum Error {
    /// The regions following the code region are not where the engine expects them; nothing was mutated
    #[error("{segment} region expected at {expected:#x} but the kernel reported {found:#x}")]
    LayoutAssumptionViolated {
        /// Segment whose placement is wrong
        segment: SegmentKind,
        /// Address the segment was expected at
        expected: usize,
        /// Base address the kernel reported
        found: usize,
    },
    /// A region or task query failed
    #[error("{step}: kernel query failed with {code}")]
    KernelQueryFailed {
        /// Failing step
        step: Step,
        /// Raw kernel code
        code: KernReturn,
    },
    /// Allocating or deallocating memory failed
    #[error("{step}: allocation failed with {code}")]
    AllocationFailed {
        /// Failing step
        step: Step,
        /// Raw kernel code
        code: KernReturn,
    },
    /// Changing memory protection failed
    #[error("{step}: protection change failed with {code}")]
    ProtectionChangeFailed {
        /// Failing step
        step: Step,
        /// Raw kernel code
        code: KernReturn,
    },
    /// Copying bytes failed
    #[error("{step}: copy failed with {code}")]
    CopyFailed {
        /// Failing step
        step: Step,
        /// Raw kernel code
        code: KernReturn,
    },
    /// The threads of the process could not be enumerated
    #[error("{step}: thread control failed with {code}")]
    ThreadControlFailed {
        /// Failing step
        step: Step,
        /// Raw kernel code
        code: KernReturn,
    },
    /// Some threads could not be suspended and strict thread handling is enabled
    #[error("{failed} of {requested} threads could not be suspended")]
    PartialSuspension {
        /// Number of threads that refused to suspend
        failed: usize,
        /// Number of suspend requests issued
        requested: usize,
    },
    /// A fixed allocation landed somewhere other than requested; the code region is gone
    #[error("code region reallocated at {actual:#x} instead of {requested:#x}")]
    UnexpectedRelocatedAddress {
        /// Address that was requested
        requested: usize,
        /// Address the kernel returned
        actual: usize,
    },
    /// The patch does not lie entirely within the code region
    #[error("patch of {len} bytes at {target:#x} is outside the code region {start:#x}..{end:#x}")]
    OutOfRange {
        /// Patch target
        target: usize,
        /// Patch length
        len: usize,
        /// Start of the code region
        start: usize,
        /// End of the code region
        end: usize,
    },
    /// One of the relocated routines is not located in the main image's code region
    #[error("routine at {address:#x} is outside the code region, cannot relocate it")]
    RoutineOutsideImage {
        /// Address of the routine
        address: usize,
    },
    /// Initialization was already attempted in this process
    #[error("the process image was already initialized")]
    AlreadyInitialized,
    /// The patched range does not read back as the bytes that were written
    #[error("patch at {target:#x} did not read back as written")]
    VerificationFailed {
        /// Patch target
        target: usize,
    },
}

impl Error {
    /// Small integer code for the error, `0` being reserved for success
    pub fn code(&self) -> i32 {
        match self {
            Self::LayoutAssumptionViolated { .. } => 1,
            Self::KernelQueryFailed { .. } => 2,
            Self::AllocationFailed { .. } => 3,
            Self::ProtectionChangeFailed { .. } => 4,
            Self::CopyFailed { .. } => 5,
            Self::ThreadControlFailed { .. } | Self::PartialSuspension { .. } => 6,
            Self::UnexpectedRelocatedAddress { .. } => 7,
            Self::OutOfRange { .. } => 8,
            Self::RoutineOutsideImage { .. } => 9,
            Self::AlreadyInitialized => 10,
            Self::VerificationFailed { .. } => 11,
        }
    }

    /// Whether the process can no longer rely on the integrity of its code region
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::LayoutAssumptionViolated { .. } | Self::UnexpectedRelocatedAddress { .. } => true,
            _ => self.kernel_failure().map_or(false, |(step, _)| step.is_fatal()),
        }
    }

    /// Kernel step and code behind the error, if any
    pub fn kernel_failure(&self) -> Option<(Step, KernReturn)> {
        match *self {
            Self::KernelQueryFailed { step, code }
            | Self::AllocationFailed { step, code }
            | Self::ProtectionChangeFailed { step, code }
            | Self::CopyFailed { step, code }
            | Self::ThreadControlFailed { step, code } => Some((step, code)),
            _ => None,
        }
    }

    /// Wraps a failed kernel call made during `step`
    pub(crate) fn kernel(step: Step, code: KernReturn) -> Self {
        match step.facility() {
            Facility::Query => Self::KernelQueryFailed { step, code },
            Facility::Allocation => Self::AllocationFailed { step, code },
            Facility::Protection => Self::ProtectionChangeFailed { step, code },
            Facility::Copy => Self::CopyFailed { step, code },
            Facility::Threads => Self::ThreadControlFailed { step, code },
        }
    }
}

/// Failure reported by a routine running from the shadow image.
///
/// Plain data only: it is built while the real code region may be unmapped, and converted to an
/// [`Error`] once control is back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    /// A kernel call failed
    Kernel {
        /// Failing step
        step: Step,
        /// Raw kernel code
        code: KernReturn,
    },
    /// The fixed reallocation of the code region landed elsewhere
    Relocated {
        /// Address that was requested
        requested: usize,
        /// Address the kernel returned
        actual: usize,
    },
    /// Strict mode refused to continue after a partial suspension
    PartialSuspension {
        /// Threads that refused to suspend
        failed: usize,
        /// Suspend requests issued
        requested: usize,
    },
}

impl Fault {
    /// Shorthand for `map_err` on kernel results
    pub(crate) fn at(step: Step) -> impl Fn(KernReturn) -> Self {
        move |code| Self::Kernel { step, code }
    }
}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::Kernel { step, code } => Self::kernel(step, code),
            Fault::Relocated { requested, actual } => {
                Self::UnexpectedRelocatedAddress { requested, actual }
            }
            Fault::PartialSuspension { failed, requested } => {
                Self::PartialSuspension { failed, requested }
            }
        }
    }
}
