// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Barriers, cache maintenance and other single instructions which `arm-sysregs` doesn't cover.

use arm_sysregs::ExceptionLevel;
#[cfg(all(target_arch = "aarch64", not(test)))]
use core::arch::asm;

/// Issues a data synchronization barrier (`dsb`) instruction for the full system (`sy`).
pub fn dsb_sy() {
    // SAFETY: `dsb` does not violate safe Rust guarantees.
    #[cfg(all(target_arch = "aarch64", not(test)))]
    unsafe {
        asm!("dsb sy", options(nostack));
    }
}

/// Issues an instruction synchronization barrier (`isb`) instruction.
pub fn isb() {
    // SAFETY: `isb` does not violate safe Rust guarantees.
    #[cfg(all(target_arch = "aarch64", not(test)))]
    unsafe {
        asm!("isb", options(nostack));
    }
}

/// Waits for an interrupt.
pub fn wfi() {
    // SAFETY: `wfi` does not violate safe Rust guarantees.
    #[cfg(all(target_arch = "aarch64", not(test)))]
    unsafe {
        asm!("wfi", options(nomem, nostack));
    }
}

/// Cache maintenance operations by virtual address.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CacheOp {
    /// Clean and invalidate to the point of coherency (`dc civac`).
    CleanInvalidate,
    /// Invalidate to the point of coherency (`dc ivac`).
    Invalidate,
}

/// Applies `op` to every data cache line overlapping `size` bytes starting at `start`, then waits
/// for the maintenance to complete.
///
/// `line_size` must be a power of two.
pub fn dcache_range(op: CacheOp, start: usize, size: usize, line_size: usize) {
    if size == 0 {
        return;
    }
    let first = start & !(line_size - 1);
    let end = start + size;

    #[cfg(test)]
    fake::record(op, first, end.next_multiple_of(line_size) - first);

    let mut line = first;
    while line < end {
        #[cfg(all(target_arch = "aarch64", not(test)))]
        match op {
            // SAFETY: Cleaning a line writes back data which is already ours and doesn't change its
            // value.
            CacheOp::CleanInvalidate => unsafe {
                asm!("dc civac, {line}", line = in(reg) line, options(nostack));
            },
            // SAFETY: Callers only invalidate lines which another observer has written back, so no
            // dirty data of ours is discarded.
            CacheOp::Invalidate => unsafe {
                asm!("dc ivac, {line}", line = in(reg) line, options(nostack));
            },
        }
        line += line_size;
    }
    dsb_sy();
}

/// Writes `value` to the software thread ID register of the given exception level.
///
/// This is how a core finds its own per-CPU record without any shared lookup.
pub fn write_thread_pointer(level: ExceptionLevel, value: u64) {
    match level {
        ExceptionLevel::El3 => {
            // SAFETY: TPIDR_EL3 is reserved for software use and only this module writes it.
            #[cfg(all(target_arch = "aarch64", not(test)))]
            unsafe {
                asm!("msr tpidr_el3, {value}", value = in(reg) value, options(nostack));
            }
            #[cfg(test)]
            fake::set_tpidr_el3(value);
        }
        ExceptionLevel::El2 => arm_sysregs::write_tpidr_el2(value),
        ExceptionLevel::El1 | ExceptionLevel::El0 => arm_sysregs::write_tpidr_el1(value),
    }
}

/// Reads the software thread ID register of the given exception level.
pub fn read_thread_pointer(level: ExceptionLevel) -> u64 {
    match level {
        ExceptionLevel::El3 => read_tpidr_el3(),
        ExceptionLevel::El2 => arm_sysregs::read_tpidr_el2(),
        ExceptionLevel::El1 | ExceptionLevel::El0 => arm_sysregs::read_tpidr_el1(),
    }
}

#[cfg(all(target_arch = "aarch64", not(test)))]
fn read_tpidr_el3() -> u64 {
    let value;
    // SAFETY: Reading TPIDR_EL3 has no side effects.
    unsafe {
        asm!("mrs {value}, tpidr_el3", value = out(reg) value, options(nomem, nostack));
    }
    value
}

#[cfg(test)]
fn read_tpidr_el3() -> u64 {
    fake::tpidr_el3()
}

#[cfg(not(any(test, target_arch = "aarch64")))]
fn read_tpidr_el3() -> u64 {
    0
}

#[cfg(test)]
pub mod fake {
    //! Records of the cache maintenance requested by unit tests.

    use super::CacheOp;
    use arm_sysregs::fake::SYSREGS;
    use std::{
        cell::RefCell,
        sync::{Mutex, MutexGuard, PoisonError},
        vec::Vec,
    };

    static SYSREGS_USERS: Mutex<()> = Mutex::new(());

    std::thread_local! {
        static CACHE_OPS: RefCell<Vec<(CacheOp, usize, usize)>> = const { RefCell::new(Vec::new()) };
        static TPIDR_EL3: RefCell<u64> = const { RefCell::new(0) };
    }

    pub(super) fn record(op: CacheOp, start: usize, size: usize) {
        CACHE_OPS.with_borrow_mut(|ops| ops.push((op, start, size)));
    }

    pub(super) fn set_tpidr_el3(value: u64) {
        TPIDR_EL3.set(value);
    }

    /// Returns and clears the cache operations requested so far on this thread.
    pub fn take_cache_ops() -> Vec<(CacheOp, usize, usize)> {
        CACHE_OPS.take()
    }

    /// Serialises tests which use the fake system registers, and resets them.
    ///
    /// The registers stay reserved for the calling test until the returned guard is dropped.
    pub fn reserve_sysregs() -> MutexGuard<'static, ()> {
        let guard = SYSREGS_USERS
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        SYSREGS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
        guard
    }

    /// Returns the value last written to the fake TPIDR_EL3 on this thread.
    pub fn tpidr_el3() -> u64 {
        TPIDR_EL3.with_borrow(|value| *value)
    }
}
