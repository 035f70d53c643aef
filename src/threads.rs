//! # Threads
//!
//! Pause-the-world coordination: every thread but the caller is suspended around a mutation of the
//! code region and resumed afterwards.
//!
//! The functions here run from the shadow image, so they never log. Per-thread outcomes are
//! written into a [`BracketReport`] owned by the caller's stack frame and logged once control is
//! back in the real code region.

use std::fmt::Debug;

use crate::error::{Fault, KernReturn, Step};
use crate::kernel::Kernel;

/// Number of individual failures a report keeps track of
pub const RECORDED_FAILURES: usize = 8;

/// Outcome of one suspend or resume sweep over the other threads
#[derive(Debug, Clone, Copy)]
pub struct BracketReport<T> {
    /// Requests issued
    requested: usize,
    /// Requests that failed
    failed: usize,
    /// The first few failures
    failures: [Option<(T, KernReturn)>; RECORDED_FAILURES],
}

impl<T: Copy> Default for BracketReport<T> {
    fn default() -> Self {
        Self {
            requested: 0,
            failed: 0,
            failures: [None; RECORDED_FAILURES],
        }
    }
}

impl<T: Copy + Debug> BracketReport<T> {
    /// Number of requests issued
    pub fn requested(&self) -> usize {
        self.requested
    }

    /// Number of requests that failed
    pub fn failed(&self) -> usize {
        self.failed
    }

    /// Whether every request succeeded
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }

    /// The recorded failures, at most [`RECORDED_FAILURES`] of them
    pub fn failures(&self) -> impl Iterator<Item = (T, KernReturn)> + '_ {
        self.failures.iter().flatten().copied()
    }

    /// Counts the outcome of a request for `thread`
    fn record(&mut self, thread: T, result: Result<(), KernReturn>) {
        self.requested += 1;
        if let Err(code) = result {
            if let Some(slot) = self.failures.get_mut(self.failed) {
                *slot = Some((thread, code));
            }
            self.failed += 1;
        }
    }

    /// Logs the failures of the sweep made during `step`
    pub(crate) fn log(&self, step: Step) {
        for (thread, code) in self.failures() {
            log::warn!("{step}: request for thread {thread:?} failed with {code}");
        }
        if self.failed > RECORDED_FAILURES {
            log::warn!(
                "{step}: {} more thread requests failed",
                self.failed - RECORDED_FAILURES
            );
        }
        log::trace!(
            "{step}: {} of {} thread requests succeeded",
            self.requested - self.failed,
            self.requested
        );
    }
}

/// Reports for both halves of a suspend/resume bracket
#[derive(Debug, Clone, Copy)]
pub struct Reports<T> {
    /// Suspend sweep
    pub suspend: BracketReport<T>,
    /// Resume sweep
    pub resume: BracketReport<T>,
}

impl<T: Copy> Default for Reports<T> {
    fn default() -> Self {
        Self {
            suspend: BracketReport::default(),
            resume: BracketReport::default(),
        }
    }
}

impl<T: Copy + Debug> Reports<T> {
    /// Logs both sweeps
    pub(crate) fn log(&self) {
        self.suspend.log(Step::SuspendThreads);
        self.resume.log(Step::ResumeThreads);
    }
}

/// Issues `request` for every thread but the caller, recording each outcome.
///
/// The thread list is taken fresh on every call since threads come and go between operations.
fn for_each_other<K: Kernel>(
    kernel: &K,
    report: &mut BracketReport<K::Thread>,
    mut request: impl FnMut(K::Thread) -> Result<(), KernReturn>,
) -> Result<(), KernReturn> {
    let threads = kernel.threads()?;
    let current = kernel.current_thread();
    for &thread in threads.as_ref() {
        if thread != current {
            report.record(thread, request(thread));
        }
    }
    Ok(())
}

/// Suspends every thread of the process but the caller.
///
/// Individual failures do not stop the sweep; they end up in `report`. Only failing to enumerate
/// the threads is an error.
///
/// # Safety
///
/// Every successful call must be followed by [`resume_others`].
pub unsafe fn suspend_others<K: Kernel>(
    kernel: &K,
    report: &mut BracketReport<K::Thread>,
) -> Result<(), KernReturn> {
    for_each_other(kernel, report, |thread| kernel.suspend(thread))
}

/// Resumes every thread of the process but the caller, including threads whose suspension failed
///
/// # Safety
///
/// Must pair with an earlier [`suspend_others`].
pub unsafe fn resume_others<K: Kernel>(
    kernel: &K,
    report: &mut BracketReport<K::Thread>,
) -> Result<(), KernReturn> {
    for_each_other(kernel, report, |thread| kernel.resume(thread))
}

/// Runs `mutate` with every other thread suspended.
///
/// Once the suspend sweep went out, the resume sweep always follows, whether `mutate` succeeded or
/// not. With `strict` set, a partial suspension resumes everything and fails before `mutate`
/// runs, unless the threads can not even be enumerated for resuming. A failure of `mutate` takes
/// precedence over a failure to enumerate threads for resuming.
///
/// # Safety
///
/// See [`suspend_others`]; `mutate` must not wait on any other thread.
pub(crate) unsafe fn paused<K: Kernel, R>(
    kernel: &K,
    strict: bool,
    reports: &mut Reports<K::Thread>,
    mutate: impl FnOnce() -> Result<R, Fault>,
) -> Result<R, Fault> {
    suspend_others(kernel, &mut reports.suspend).map_err(Fault::at(Step::SuspendThreads))?;

    if strict && !reports.suspend.is_complete() {
        // threads left suspended outweigh the partial suspension
        resume_others(kernel, &mut reports.resume).map_err(Fault::at(Step::ResumeThreads))?;
        return Err(Fault::PartialSuspension {
            failed: reports.suspend.failed(),
            requested: reports.suspend.requested(),
        });
    }

    let result = mutate();
    let resumed = resume_others(kernel, &mut reports.resume).map_err(Fault::at(Step::ResumeThreads));
    let value = result?;
    resumed?;
    Ok(value)
}
