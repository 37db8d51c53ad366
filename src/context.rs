// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The saved register state of one security world on one core.

use crate::{
    error::FatalError,
    save_restore::{El1Sysregs, El2Sysregs},
};
use arm_sysregs::{CptrEl3, MdcrEl3, Pmcr, ScrEl3, Spsr};
use core::{
    cell::UnsafeCell,
    ops::{Index, IndexMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// The number of contexts to store for each CPU core, one per security state.
pub const CPU_DATA_CONTEXT_NUM: usize = 2;

/// A security state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum World {
    // The values are the indices used by the exception return code.
    Secure = 0,
    NonSecure = 1,
}

impl World {
    /// Both worlds, in index order.
    pub const ALL: [Self; CPU_DATA_CONTEXT_NUM] = [Self::Secure, Self::NonSecure];

    fn index(self) -> usize {
        self as usize
    }

    /// Converts a raw security state value, as passed by lower level code, into a `World`.
    pub fn from_raw(value: u64) -> Result<Self, FatalError> {
        match value {
            0 => Ok(Self::Secure),
            1 => Ok(Self::NonSecure),
            _ => Err(FatalError::InvalidSecurityState(value)),
        }
    }
}

/// The state of a core in the levels below the firmware for one security state.
///
/// The layout is shared with the exception entry and return code, so fields must not be
/// reordered.
#[derive(Clone, Debug)]
#[repr(C)]
pub struct WorldContext {
    pub gpregs: GpRegs,
    pub el3_state: El3State,
    pub el2_sysregs: El2Sysregs,
    pub el1_sysregs: El1Sysregs,
}

impl WorldContext {
    /// A zeroed context.
    pub const EMPTY: Self = Self {
        gpregs: GpRegs::EMPTY,
        el3_state: El3State::EMPTY,
        el2_sysregs: El2Sysregs::EMPTY,
        el1_sysregs: El1Sysregs::EMPTY,
    };

    /// Clears all saved register values.
    pub fn clear(&mut self) {
        *self = Self::EMPTY;
    }

    /// Sets the state the world observes on its first exception return.
    pub fn seed_entry(&mut self, entry_point: &EntryPointInfo, spsr: Spsr) {
        self.el3_state.elr_el3 = entry_point.pc;
        self.el3_state.spsr_el3 = spsr;
        self.gpregs.registers[..entry_point.args.len()].copy_from_slice(&entry_point.args);
    }
}

/// AArch64 general purpose registers x0-x30 followed by SP_EL0.
#[derive(Clone, Debug)]
#[repr(C, align(16))]
pub struct GpRegs {
    pub registers: [u64; Self::COUNT],
}

impl GpRegs {
    /// The number of (64-bit) registers included in `GpRegs`.
    const COUNT: usize = 32;

    const EMPTY: Self = Self {
        registers: [0; Self::COUNT],
    };
}

/// Registers used by EL3 firmware to maintain its state across exception entries and exits.
#[derive(Clone, Debug)]
#[repr(C, align(16))]
pub struct El3State {
    pub scr_el3: ScrEl3,
    pub spsr_el3: Spsr,
    pub elr_el3: usize,
    pub pmcr_el0: Pmcr,
    pub mdcr_el3: MdcrEl3,
    pub cptr_el3: CptrEl3,
}

impl El3State {
    const EMPTY: Self = Self {
        scr_el3: ScrEl3::empty(),
        spsr_el3: Spsr::empty(),
        elr_el3: 0,
        pmcr_el0: Pmcr::empty(),
        mdcr_el3: MdcrEl3::empty(),
        cptr_el3: CptrEl3::empty(),
    };
}

/// An array with one `T` for each world.
#[derive(Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct PerWorld<T>([T; CPU_DATA_CONTEXT_NUM]);

impl<T> PerWorld<T> {
    /// Creates a value from one entry per world, in [`World::ALL`] order.
    pub const fn new(values: [T; CPU_DATA_CONTEXT_NUM]) -> Self {
        Self(values)
    }
}

impl<T> Index<World> for PerWorld<T> {
    type Output = T;

    fn index(&self, world: World) -> &Self::Output {
        &self.0[world.index()]
    }
}

impl<T> IndexMut<World> for PerWorld<T> {
    fn index_mut(&mut self, world: World) -> &mut Self::Output {
        &mut self.0[world.index()]
    }
}

struct ContextSlot {
    taken: AtomicBool,
    context: UnsafeCell<WorldContext>,
}

impl ContextSlot {
    const EMPTY: Self = Self {
        taken: AtomicBool::new(false),
        context: UnsafeCell::new(WorldContext::EMPTY),
    };
}

// SAFETY: The context is only reachable through the unique `&mut` handed out by `ContextPool::take`,
// which the `taken` flag guarantees happens at most once.
unsafe impl Sync for ContextSlot {}

/// Statically allocated world contexts, one per world for each of `CORE_COUNT` cores.
pub struct ContextPool<const CORE_COUNT: usize> {
    slots: [PerWorld<ContextSlot>; CORE_COUNT],
}

impl<const CORE_COUNT: usize> ContextPool<CORE_COUNT> {
    /// Creates a pool of zeroed contexts.
    pub const fn new() -> Self {
        Self {
            slots: [const { PerWorld([ContextSlot::EMPTY, ContextSlot::EMPTY]) }; CORE_COUNT],
        }
    }

    /// Returns the context for the given core and world, zeroed. Each context can only be taken
    /// once.
    pub fn take(
        &'static self,
        core_index: usize,
        world: World,
    ) -> Result<&'static mut WorldContext, FatalError> {
        let slot = &self
            .slots
            .get(core_index)
            .ok_or(FatalError::CoreIndexOutOfRange(core_index))?[world];
        if slot.taken.swap(true, Ordering::AcqRel) {
            return Err(FatalError::ContextStorageTaken(world));
        }
        // SAFETY: `taken` was false, so no other reference to this context exists and none will be
        // created after this one.
        let context = unsafe { &mut *slot.context.get() };
        context.clear();
        Ok(context)
    }
}

/// Information about the entry point for a next stage image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EntryPointInfo {
    /// The entry point address.
    pub pc: usize,
    /// Boot arguments to pass in `x0`-`x7`.
    pub args: [u64; 8],
}

#[cfg(test)]
mod tests {
    use super::*;

    static POOL: ContextPool<2> = ContextPool::new();

    #[test]
    fn raw_security_state() {
        assert_eq!(World::from_raw(0), Ok(World::Secure));
        assert_eq!(World::from_raw(1), Ok(World::NonSecure));
        assert_eq!(World::from_raw(2), Err(FatalError::InvalidSecurityState(2)));
    }

    #[test]
    fn pool_hands_out_each_context_once() {
        let context = POOL.take(1, World::Secure).unwrap();
        assert_eq!(context.el3_state.elr_el3, 0);
        assert_eq!(
            POOL.take(1, World::Secure).unwrap_err(),
            FatalError::ContextStorageTaken(World::Secure)
        );
        assert!(POOL.take(1, World::NonSecure).is_ok());
        assert_eq!(
            POOL.take(2, World::NonSecure).unwrap_err(),
            FatalError::CoreIndexOutOfRange(2)
        );
    }

    #[test]
    fn seed_entry_sets_return_state() {
        let mut context = WorldContext::EMPTY;
        let spsr = Spsr::D | Spsr::A | Spsr::I | Spsr::F | Spsr::M_AARCH64_EL1H;
        context.seed_entry(
            &EntryPointInfo {
                pc: 0x6000_0000,
                args: [1, 2, 3, 4, 5, 6, 7, 8],
            },
            spsr,
        );
        assert_eq!(context.el3_state.elr_el3, 0x6000_0000);
        assert_eq!(context.el3_state.spsr_el3, spsr);
        assert_eq!(context.gpregs.registers[..8], [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(context.gpregs.registers[8], 0);
    }
}
