//! # Layout
//!
//! Locates the code region of the main image and the two data regions that must follow it
//! back to back

use crate::error::{Error, SegmentKind, Step};
use crate::kernel::{Kernel, Segment};

/// The three adjacent regions of the main image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Executable code
    pub code: Segment,
    /// Read-only data, starting where the code ends
    pub rodata: Segment,
    /// Writable data, starting where the read-only data ends
    pub data: Segment,
}

impl Layout {
    /// Combined size of the three regions
    pub fn size(&self) -> usize {
        self.code.size + self.rodata.size + self.data.size
    }

    /// The regions in address order, with their offset from the start of the code region
    pub fn segments(&self) -> [(SegmentKind, Segment, usize); 3] {
        [
            (SegmentKind::Code, self.code, 0),
            (SegmentKind::ReadOnlyData, self.rodata, self.code.size),
            (
                SegmentKind::Data,
                self.data,
                self.code.size + self.rodata.size,
            ),
        ]
    }
}

/// Queries the region at `expected`, failing if it does not start exactly there
fn query<K: Kernel>(
    kernel: &K,
    expected: usize,
    kind: SegmentKind,
    step: Step,
) -> Result<Segment, Error> {
    let segment = kernel
        .region(expected)
        .map_err(|code| Error::kernel(step, code))?;
    if segment.base != expected {
        return Err(Error::LayoutAssumptionViolated {
            segment: kind,
            expected,
            found: segment.base,
        });
    }
    Ok(segment)
}

/// Finds the code region at or above `image_base`, and the read-only and writable data regions
/// directly behind it.
///
/// The code region is taken wherever the kernel reports it, so a slid image is found from its
/// unslid base. Only queries are issued; nothing is allocated or modified, so any error here
/// leaves the process untouched.
pub fn locate<K: Kernel>(kernel: &K, image_base: usize) -> Result<Layout, Error> {
    let code = kernel
        .region(image_base)
        .map_err(|code| Error::kernel(Step::QueryCode, code))?;
    if code.base != image_base {
        log::debug!("code region found at {:#x}, slid from {image_base:#x}", code.base);
    }
    let rodata = query(
        kernel,
        code.end(),
        SegmentKind::ReadOnlyData,
        Step::QueryReadOnlyData,
    )?;
    let data = query(kernel, rodata.end(), SegmentKind::Data, Step::QueryData)?;

    let layout = Layout { code, rodata, data };
    for (kind, segment, _) in layout.segments() {
        log::debug!(
            "{kind} region at {:#x}..{:#x} ({:?})",
            segment.base,
            segment.end(),
            segment.protection
        );
    }
    Ok(layout)
}
