//! Simulated address space and thread table, for exercising the engine without touching the
//! real process

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};

use region::Protection;

use super::{Kernel, Placement, Segment};
use crate::error::KernReturn;

/// Page size of the simulated address space
pub const PAGE: usize = 0x1000;

/// Base the simulated image is loaded at
pub const IMAGE_BASE: usize = 0x1_0000_0000;

/// Kernel operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// [`Kernel::region`]
    Region,
    /// [`Kernel::allocate`]
    Allocate,
    /// [`Kernel::deallocate`]
    Deallocate,
    /// [`Kernel::protect`]
    Protect,
    /// [`Kernel::copy`]
    Copy,
    /// [`Kernel::write`]
    Write,
    /// [`Kernel::read`]
    Read,
    /// [`Kernel::threads`]
    Threads,
}

/// Every call the engine made, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// Region query at an address
    Region(usize),
    /// Allocation of a size
    Allocate(Placement, usize),
    /// Deallocation of a base and size
    Deallocate(usize, usize),
    /// Protection change of a range
    Protect(usize, usize, Protection),
    /// Copy between two ranges
    Copy {
        /// Source address
        source: usize,
        /// Bytes copied
        size: usize,
        /// Destination address
        destination: usize,
    },
    /// Write of a length at an address
    Write(usize, usize),
    /// Read of a length at an address
    Read(usize, usize),
    /// Thread enumeration
    Threads,
    /// Suspension of a thread
    Suspend(u32),
    /// Resumption of a thread
    Resume(u32),
    /// Instruction cache flush of a range
    Flush(usize, usize),
}

impl Call {
    /// Whether the call changes the address space
    pub fn mutates(&self) -> bool {
        matches!(
            self,
            Call::Allocate(..)
                | Call::Deallocate(..)
                | Call::Protect(..)
                | Call::Copy { .. }
                | Call::Write(..)
        )
    }
}

/// A simulated mapping
#[derive(Debug)]
struct Mapping {
    /// Contents
    bytes: Vec<u8>,
    /// Protection of each page
    pages: Vec<Protection>,
}

/// Mutable state behind the kernel
#[derive(Debug, Default)]
struct State {
    /// Mappings by base address
    mappings: BTreeMap<usize, Mapping>,
    /// Threads of the simulated process
    threads: Vec<u32>,
    /// Thread issuing the calls
    current: u32,
    /// Call log
    calls: Vec<Call>,
    /// Number of calls made per operation
    counts: HashMap<Op, usize>,
    /// Injected failures: the n-th call (0-based) of an operation fails with the code
    faults: HashMap<(Op, usize), KernReturn>,
    /// Threads refusing to suspend
    stubborn_suspend: HashSet<u32>,
    /// Threads refusing to resume
    stubborn_resume: HashSet<u32>,
    /// Address a fixed allocation is diverted to
    divert_fixed: Option<usize>,
}

impl State {
    /// Counts a call of `op` and returns the injected failure, if any
    fn tick(&mut self, op: Op) -> Result<(), KernReturn> {
        let count = self.counts.entry(op).or_insert(0);
        let n = *count;
        *count += 1;
        match self.faults.get(&(op, n)) {
            Some(&code) => Err(code),
            None => Ok(()),
        }
    }

    /// Finds the mapping holding `[address, address + len)` entirely
    fn mapping(&self, address: usize, len: usize) -> Result<(usize, &Mapping), KernReturn> {
        let (&base, mapping) = self
            .mappings
            .range(..=address)
            .next_back()
            .ok_or(KernReturn::INVALID_ADDRESS)?;
        if address + len > base + mapping.bytes.len() {
            return Err(KernReturn::INVALID_ADDRESS);
        }
        Ok((base, mapping))
    }

    /// Mutable variant of [`State::mapping`]
    fn mapping_mut(
        &mut self,
        address: usize,
        len: usize,
    ) -> Result<(usize, &mut Mapping), KernReturn> {
        let (&base, mapping) = self
            .mappings
            .range_mut(..=address)
            .next_back()
            .ok_or(KernReturn::INVALID_ADDRESS)?;
        if address + len > base + mapping.bytes.len() {
            return Err(KernReturn::INVALID_ADDRESS);
        }
        Ok((base, mapping))
    }

    /// Checks that every page in the range carries `needed`
    fn check(&self, address: usize, len: usize, needed: Protection) -> Result<(), KernReturn> {
        let (base, mapping) = self.mapping(address, len)?;
        let first = (address - base) / PAGE;
        let last = (address + len.max(1) - 1 - base) / PAGE;
        if mapping.pages[first..=last]
            .iter()
            .all(|page| page.contains(needed))
        {
            Ok(())
        } else {
            Err(KernReturn::PROTECTION_FAILURE)
        }
    }

    /// Copies bytes out of the address space
    fn load(&self, address: usize, len: usize) -> Result<Vec<u8>, KernReturn> {
        self.check(address, len, Protection::READ)?;
        let (base, mapping) = self.mapping(address, len)?;
        let offset = address - base;
        Ok(mapping.bytes[offset..offset + len].to_vec())
    }

    /// Copies bytes into the address space
    fn store(&mut self, address: usize, bytes: &[u8]) -> Result<(), KernReturn> {
        self.check(address, bytes.len(), Protection::WRITE)?;
        let (base, mapping) = self.mapping_mut(address, bytes.len())?;
        let offset = address - base;
        mapping.bytes[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Whether `[address, address + size)` overlaps an existing mapping
    fn overlaps(&self, address: usize, size: usize) -> bool {
        self.mappings
            .iter()
            .any(|(&base, mapping)| base < address + size && address < base + mapping.bytes.len())
    }
}

/// Kernel over a simulated address space
#[derive(Debug)]
pub struct SimKernel {
    /// Everything the kernel tracks
    state: RefCell<State>,
}

impl SimKernel {
    /// Empty address space with a single thread
    pub fn new() -> Self {
        let state = State {
            threads: vec![1],
            current: 1,
            ..Default::default()
        };
        Self {
            state: RefCell::new(state),
        }
    }

    /// A process image at [`IMAGE_BASE`] with code, read-only data and data regions of the given
    /// sizes, and `threads` threads of which the first is the caller
    pub fn process(sizes: [usize; 3], threads: u32) -> Self {
        let kernel = Self::new();
        let protections = [
            Protection::READ_EXECUTE,
            Protection::READ,
            Protection::READ_WRITE,
        ];
        let mut base = IMAGE_BASE;
        for (size, protection) in sizes.into_iter().zip(protections) {
            kernel.map(base, size, protection, |offset| (offset % 251) as u8);
            base += size;
        }
        kernel.set_threads((1..=threads).collect(), 1);
        kernel
    }

    /// Maps `size` bytes at `base`, filled by `fill(offset)`
    pub fn map(&self, base: usize, size: usize, protection: Protection, fill: impl Fn(usize) -> u8) {
        assert_eq!(base % PAGE, 0);
        assert_eq!(size % PAGE, 0);
        let mapping = Mapping {
            bytes: (0..size).map(fill).collect(),
            pages: vec![protection; size / PAGE],
        };
        self.state.borrow_mut().mappings.insert(base, mapping);
    }

    /// Replaces the thread table
    pub fn set_threads(&self, threads: Vec<u32>, current: u32) {
        let mut state = self.state.borrow_mut();
        state.threads = threads;
        state.current = current;
    }

    /// Makes the `n`-th call (0-based) of `op` fail with `code`
    pub fn fail(&self, op: Op, n: usize, code: KernReturn) {
        self.state.borrow_mut().faults.insert((op, n), code);
    }

    /// Makes `thread` refuse suspension
    pub fn refuse_suspend(&self, thread: u32) {
        self.state.borrow_mut().stubborn_suspend.insert(thread);
    }

    /// Makes `thread` refuse resumption
    pub fn refuse_resume(&self, thread: u32) {
        self.state.borrow_mut().stubborn_resume.insert(thread);
    }

    /// Diverts the next fixed allocation to `address`
    pub fn divert_fixed(&self, address: usize) {
        self.state.borrow_mut().divert_fixed = Some(address);
    }

    /// Reads memory regardless of protection
    pub fn peek(&self, address: usize, len: usize) -> Vec<u8> {
        let state = self.state.borrow();
        let (base, mapping) = state.mapping(address, len).expect("peek at unmapped memory");
        let offset = address - base;
        mapping.bytes[offset..offset + len].to_vec()
    }

    /// Protection of the page holding `address`
    pub fn protection(&self, address: usize) -> Protection {
        let state = self.state.borrow();
        let (base, mapping) = state.mapping(address, 1).expect("unmapped address");
        mapping.pages[(address - base) / PAGE]
    }

    /// Whether anything is mapped at `address`
    pub fn is_mapped(&self, address: usize) -> bool {
        self.state.borrow().mapping(address, 1).is_ok()
    }

    /// Calls made so far
    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    /// Forgets the calls made so far
    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    /// Records a call
    fn log(&self, call: Call) {
        self.state.borrow_mut().calls.push(call);
    }
}

unsafe impl Kernel for SimKernel {
    type Thread = u32;
    type Threads = Vec<u32>;

    const SELF_HOSTED: bool = false;

    fn image_base(&self) -> usize {
        IMAGE_BASE
    }

    fn page_size(&self) -> usize {
        PAGE
    }

    fn region(&self, address: usize) -> Result<Segment, KernReturn> {
        self.log(Call::Region(address));
        let mut state = self.state.borrow_mut();
        state.tick(Op::Region)?;
        // the mapping containing the address, or failing that the next one above it
        let (&base, mapping) = state
            .mappings
            .range(..=address)
            .next_back()
            .filter(|entry| address < *entry.0 + entry.1.bytes.len())
            .or_else(|| state.mappings.range(address..).next())
            .ok_or(KernReturn::INVALID_ADDRESS)?;
        Ok(Segment {
            base,
            size: mapping.bytes.len(),
            protection: mapping.pages[(address.max(base) - base) / PAGE],
        })
    }

    unsafe fn allocate(&self, placement: Placement, size: usize) -> Result<usize, KernReturn> {
        self.log(Call::Allocate(placement, size));
        let mut state = self.state.borrow_mut();
        state.tick(Op::Allocate)?;
        let size = (size + PAGE - 1) & !(PAGE - 1);
        let base = match placement {
            Placement::Fixed(address) => state.divert_fixed.take().unwrap_or(address),
            Placement::Anywhere => state
                .mappings
                .iter()
                .map(|(&base, mapping)| base + mapping.bytes.len())
                .max()
                .map_or(IMAGE_BASE, |end| end + 0x10 * PAGE),
        };
        if state.overlaps(base, size) {
            return Err(KernReturn::NO_SPACE);
        }
        state.mappings.insert(
            base,
            Mapping {
                bytes: vec![0; size],
                pages: vec![Protection::READ_WRITE; size / PAGE],
            },
        );
        Ok(base)
    }

    unsafe fn deallocate(&self, address: usize, size: usize) -> Result<(), KernReturn> {
        self.log(Call::Deallocate(address, size));
        let mut state = self.state.borrow_mut();
        state.tick(Op::Deallocate)?;
        let exact = state
            .mappings
            .get(&address)
            .map_or(false, |mapping| mapping.bytes.len() == size);
        if !exact {
            return Err(KernReturn::INVALID_ARGUMENT);
        }
        state.mappings.remove(&address);
        Ok(())
    }

    unsafe fn protect(
        &self,
        address: usize,
        size: usize,
        protection: Protection,
    ) -> Result<(), KernReturn> {
        self.log(Call::Protect(address, size, protection));
        let mut state = self.state.borrow_mut();
        state.tick(Op::Protect)?;
        let start = address & !(PAGE - 1);
        let end = (address + size + PAGE - 1) & !(PAGE - 1);
        let (base, mapping) = state.mapping_mut(start, end - start)?;
        for page in &mut mapping.pages[(start - base) / PAGE..(end - base) / PAGE] {
            *page = protection;
        }
        Ok(())
    }

    unsafe fn copy(&self, source: usize, size: usize, destination: usize) -> Result<(), KernReturn> {
        self.log(Call::Copy {
            source,
            size,
            destination,
        });
        let mut state = self.state.borrow_mut();
        state.tick(Op::Copy)?;
        let bytes = state.load(source, size)?;
        state.store(destination, &bytes)
    }

    unsafe fn write(&self, destination: usize, bytes: &[u8]) -> Result<(), KernReturn> {
        self.log(Call::Write(destination, bytes.len()));
        let mut state = self.state.borrow_mut();
        state.tick(Op::Write)?;
        state.store(destination, bytes)
    }

    unsafe fn read(&self, source: usize, buf: &mut [u8]) -> Result<(), KernReturn> {
        self.log(Call::Read(source, buf.len()));
        let mut state = self.state.borrow_mut();
        state.tick(Op::Read)?;
        buf.copy_from_slice(&state.load(source, buf.len())?);
        Ok(())
    }

    fn threads(&self) -> Result<Vec<u32>, KernReturn> {
        self.log(Call::Threads);
        let mut state = self.state.borrow_mut();
        state.tick(Op::Threads)?;
        Ok(state.threads.clone())
    }

    fn current_thread(&self) -> u32 {
        self.state.borrow().current
    }

    unsafe fn suspend(&self, thread: u32) -> Result<(), KernReturn> {
        self.log(Call::Suspend(thread));
        if self.state.borrow().stubborn_suspend.contains(&thread) {
            return Err(KernReturn::FAILURE);
        }
        Ok(())
    }

    unsafe fn resume(&self, thread: u32) -> Result<(), KernReturn> {
        self.log(Call::Resume(thread));
        if self.state.borrow().stubborn_resume.contains(&thread) {
            return Err(KernReturn::FAILURE);
        }
        Ok(())
    }

    unsafe fn flush_icache(&self, address: usize, size: usize) {
        self.log(Call::Flush(address, size));
    }
}

#[cfg(test)]
mod tests {
    use region::Protection;

    use super::{Call, Op, SimKernel, IMAGE_BASE, PAGE};
    use crate::error::KernReturn;
    use crate::kernel::{Kernel, Placement};

    #[test]
    /// Querying a gap reports the next region up, like `mach_vm_region`
    fn test_region_skips_gaps() {
        let kernel = SimKernel::new();
        kernel.map(IMAGE_BASE + PAGE, PAGE, Protection::READ, |_| 0);
        let segment = kernel.region(IMAGE_BASE).unwrap();
        assert_eq!(segment.base, IMAGE_BASE + PAGE);
        assert_eq!(segment.size, PAGE);
        assert_eq!(
            kernel.region(IMAGE_BASE + 2 * PAGE),
            Err(KernReturn::INVALID_ADDRESS)
        );
    }

    #[test]
    /// Writes honour page protections
    fn test_protections_enforced() {
        let kernel = SimKernel::process([PAGE, PAGE, PAGE], 1);
        unsafe {
            assert_eq!(
                kernel.write(IMAGE_BASE, &[1, 2]),
                Err(KernReturn::PROTECTION_FAILURE)
            );
            kernel.protect(IMAGE_BASE + 4, 2, Protection::READ_WRITE).unwrap();
            kernel.write(IMAGE_BASE, &[1, 2]).unwrap();
        }
        assert_eq!(kernel.peek(IMAGE_BASE, 2), [1, 2]);
        assert_eq!(kernel.protection(IMAGE_BASE + PAGE), Protection::READ);
    }

    #[test]
    /// Fixed allocations refuse to overlap and injected faults fire once
    fn test_allocate() {
        let kernel = SimKernel::process([PAGE, PAGE, PAGE], 1);
        kernel.fail(Op::Allocate, 0, KernReturn::FAILURE);
        unsafe {
            assert_eq!(
                kernel.allocate(Placement::Anywhere, PAGE),
                Err(KernReturn::FAILURE)
            );
            assert_eq!(
                kernel.allocate(Placement::Fixed(IMAGE_BASE), PAGE),
                Err(KernReturn::NO_SPACE)
            );
            let base = kernel.allocate(Placement::Anywhere, PAGE).unwrap();
            assert!(base >= IMAGE_BASE + 3 * PAGE);
            assert_eq!(kernel.peek(base, 4), [0; 4]);
        }
        assert_eq!(kernel.calls().len(), 3);
        assert!(kernel.calls().iter().all(Call::mutates));
    }
}
