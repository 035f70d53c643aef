//! Mach implementation of [`Kernel`] for the current macOS process

use std::{mem, ptr, slice};

use mach2::boolean::boolean_t;
use mach2::kern_return::{kern_return_t, KERN_SUCCESS};
use mach2::mach_init::mach_thread_self;
use mach2::mach_port::mach_port_deallocate;
use mach2::mach_types::{thread_act_array_t, thread_act_t};
use mach2::message::mach_msg_type_number_t;
use mach2::port::mach_port_t;
use mach2::task::task_threads;
use mach2::thread_act::{thread_resume, thread_suspend};
use mach2::traps::{mach_task_self, task_for_pid};
use mach2::vm::{
    mach_vm_allocate, mach_vm_copy, mach_vm_deallocate, mach_vm_protect, mach_vm_region,
};
use mach2::vm_prot::{vm_prot_t, VM_PROT_EXECUTE, VM_PROT_NONE, VM_PROT_READ, VM_PROT_WRITE};
use mach2::vm_region::{vm_region_basic_info_64, vm_region_info_t, VM_REGION_BASIC_INFO_64};
use mach2::vm_statistics::{VM_FLAGS_ANYWHERE, VM_FLAGS_FIXED};
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};
use region::Protection;

use super::{Kernel, Placement, Segment};
use crate::error::{Error, KernReturn, Step};

/// Documented load address of the main executable when dyld cannot tell us
pub const DEFAULT_IMAGE_BASE: usize = 0x1_0000_0000;

/// `boolean_t` false, for `set_maximum`
const FALSE: boolean_t = 0;

extern "C" {
    fn sys_icache_invalidate(addr: *mut libc::c_void, size: usize);
    fn sys_dcache_flush(addr: *mut libc::c_void, size: usize);
}

/// Converts a raw Mach return code
fn check(kr: kern_return_t) -> Result<(), KernReturn> {
    if kr == KERN_SUCCESS {
        Ok(())
    } else {
        Err(KernReturn(kr))
    }
}

/// Converts a protection to its Mach representation
fn to_vm_prot(protection: Protection) -> vm_prot_t {
    let mut prot = VM_PROT_NONE;
    if protection.contains(Protection::READ) {
        prot |= VM_PROT_READ;
    }
    if protection.contains(Protection::WRITE) {
        prot |= VM_PROT_WRITE;
    }
    if protection.contains(Protection::EXECUTE) {
        prot |= VM_PROT_EXECUTE;
    }
    prot
}

/// Converts a Mach protection
fn from_vm_prot(prot: vm_prot_t) -> Protection {
    let mut protection = Protection::NONE;
    if prot & VM_PROT_READ != 0 {
        protection |= Protection::READ;
    }
    if prot & VM_PROT_WRITE != 0 {
        protection |= Protection::WRITE;
    }
    if prot & VM_PROT_EXECUTE != 0 {
        protection |= Protection::EXECUTE;
    }
    protection
}

/// Kernel handle for the current task
#[derive(Debug)]
pub struct MachKernel {
    /// Task port with control over our own address space
    task: mach_port_t,
}

impl MachKernel {
    /// Obtains the privileged task port of the current process.
    ///
    /// Depending on the system this needs the `com.apple.security.get-task-allow` entitlement
    /// or elevated privileges.
    pub fn new() -> Result<Self, Error> {
        let mut task: mach_port_t = 0;
        // SAFETY: plain Mach trap on our own pid with a valid out pointer
        let kr = unsafe { task_for_pid(mach_task_self(), libc::getpid(), &mut task) };
        check(kr).map_err(|code| Error::kernel(Step::TaskForPid, code))?;
        Ok(Self { task })
    }
}

/// Thread ports returned by `task_threads`, released on drop
pub struct ThreadList {
    /// Kernel-allocated array of thread ports
    list: thread_act_array_t,
    /// Number of ports in `list`
    count: mach_msg_type_number_t,
}

impl AsRef<[thread_act_t]> for ThreadList {
    fn as_ref(&self) -> &[thread_act_t] {
        if self.list.is_null() {
            return &[];
        }
        // SAFETY: the kernel handed us `count` ports at `list`
        unsafe { slice::from_raw_parts(self.list, self.count as usize) }
    }
}

impl Drop for ThreadList {
    fn drop(&mut self) {
        if self.list.is_null() {
            return;
        }
        // SAFETY: we own one send right per port and the array itself
        unsafe {
            let task = mach_task_self();
            for &thread in self.as_ref() {
                mach_port_deallocate(task, thread);
            }
            mach_vm_deallocate(
                task,
                self.list as mach_vm_address_t,
                (self.count as usize * mem::size_of::<thread_act_t>()) as mach_vm_size_t,
            );
        }
    }
}

unsafe impl Kernel for MachKernel {
    type Thread = thread_act_t;
    type Threads = ThreadList;

    const SELF_HOSTED: bool = true;

    fn image_base(&self) -> usize {
        // SAFETY: image 0 is always the main executable
        let header = unsafe { libc::_dyld_get_image_header(0) };
        if header.is_null() {
            DEFAULT_IMAGE_BASE
        } else {
            header as usize
        }
    }

    fn page_size(&self) -> usize {
        region::page::size()
    }

    fn region(&self, address: usize) -> Result<Segment, KernReturn> {
        let mut base = address as mach_vm_address_t;
        let mut size: mach_vm_size_t = 0;
        let mut object: mach_port_t = 0;
        // SAFETY: all-zero is a valid `vm_region_basic_info_64`
        let mut info: vm_region_basic_info_64 = unsafe { mem::zeroed() };
        let mut count = vm_region_basic_info_64::count();

        // SAFETY: every out pointer is valid for the duration of the call
        let kr = unsafe {
            mach_vm_region(
                self.task,
                &mut base,
                &mut size,
                VM_REGION_BASIC_INFO_64,
                (&mut info as *mut vm_region_basic_info_64) as vm_region_info_t,
                &mut count,
                &mut object,
            )
        };
        check(kr)?;

        Ok(Segment {
            base: base as usize,
            size: size as usize,
            protection: from_vm_prot(info.protection),
        })
    }

    unsafe fn allocate(&self, placement: Placement, size: usize) -> Result<usize, KernReturn> {
        let (mut address, flags) = match placement {
            Placement::Anywhere => (0, VM_FLAGS_ANYWHERE),
            Placement::Fixed(address) => (address as mach_vm_address_t, VM_FLAGS_FIXED),
        };
        check(mach_vm_allocate(
            self.task,
            &mut address,
            size as mach_vm_size_t,
            flags,
        ))?;
        Ok(address as usize)
    }

    unsafe fn deallocate(&self, address: usize, size: usize) -> Result<(), KernReturn> {
        check(mach_vm_deallocate(
            self.task,
            address as mach_vm_address_t,
            size as mach_vm_size_t,
        ))
    }

    unsafe fn protect(
        &self,
        address: usize,
        size: usize,
        protection: Protection,
    ) -> Result<(), KernReturn> {
        check(mach_vm_protect(
            self.task,
            address as mach_vm_address_t,
            size as mach_vm_size_t,
            FALSE,
            to_vm_prot(protection),
        ))
    }

    unsafe fn copy(&self, source: usize, size: usize, destination: usize) -> Result<(), KernReturn> {
        check(mach_vm_copy(
            self.task,
            source as mach_vm_address_t,
            size as mach_vm_size_t,
            destination as mach_vm_address_t,
        ))
    }

    unsafe fn write(&self, destination: usize, bytes: &[u8]) -> Result<(), KernReturn> {
        ptr::copy_nonoverlapping(bytes.as_ptr(), destination as *mut u8, bytes.len());
        Ok(())
    }

    unsafe fn read(&self, source: usize, buf: &mut [u8]) -> Result<(), KernReturn> {
        ptr::copy_nonoverlapping(source as *const u8, buf.as_mut_ptr(), buf.len());
        Ok(())
    }

    fn threads(&self) -> Result<ThreadList, KernReturn> {
        let mut list: thread_act_array_t = ptr::null_mut();
        let mut count: mach_msg_type_number_t = 0;
        // SAFETY: out pointers are valid; ownership of the array moves into `ThreadList`
        check(unsafe { task_threads(self.task, &mut list, &mut count) })?;
        Ok(ThreadList { list, count })
    }

    fn current_thread(&self) -> thread_act_t {
        // SAFETY: `mach_thread_self` hands out an extra send right which we drop right away;
        // the name stays valid while the thread is alive
        unsafe {
            let thread = mach_thread_self();
            mach_port_deallocate(mach_task_self(), thread);
            thread
        }
    }

    unsafe fn suspend(&self, thread: thread_act_t) -> Result<(), KernReturn> {
        check(thread_suspend(thread))
    }

    unsafe fn resume(&self, thread: thread_act_t) -> Result<(), KernReturn> {
        check(thread_resume(thread))
    }

    unsafe fn flush_icache(&self, address: usize, size: usize) {
        // data and instruction caches are not coherent on arm64
        sys_dcache_flush(address as *mut libc::c_void, size);
        sys_icache_invalidate(address as *mut libc::c_void, size);
    }
}
