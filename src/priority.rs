// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Priority based arbitration of the exceptions handled by the firmware.
//!
//! Each core keeps a bitmap with one bit per priority level that has a handler running. Levels are
//! activated and deactivated strictly in nesting order. The interrupt dispatcher programs the
//! priority mask values these functions return; nothing here touches the interrupt controller.

use crate::{
    context::World,
    error::{FatalError, RegisterSet},
    percpu::ThisCpu,
    platform::{Platform, PlatformImpl},
};
use core::fmt::{self, Debug, Formatter};
use log::{debug, info};
use spin::{Once, mutex::SpinMutex};

/// The number of priority levels the active bitmap can track.
pub const MAX_PRIORITY_LEVELS: usize = u32::BITS as usize;

/// The widest supported priority width. Wider priorities wouldn't fit the active bitmap.
const MAX_PRIORITY_BITS: u8 = MAX_PRIORITY_LEVELS.trailing_zeros() as u8;

/// A priority value with the top bit set is in the Non-Secure half of the priority range.
const NS_PRIORITY_BIT: u8 = 0x80;

/// Handles an exception taken at a particular priority level.
pub type PriorityHandler = fn(interrupt_id: u32, flags: u32) -> i32;

/// The priority levels a platform declares, with the handler registered for each.
#[derive(Clone)]
pub struct PriorityTable {
    priority_bits: u8,
    declared: u32,
    handlers: [Option<PriorityHandler>; MAX_PRIORITY_LEVELS],
}

impl PriorityTable {
    /// Creates a table of the given priority levels without any handlers.
    ///
    /// Panics at compile time when used in a constant if a level isn't a valid Secure priority
    /// for the given priority width.
    pub const fn new(priority_bits: u8, levels: &[u8]) -> Self {
        assert!(priority_bits >= 1 && priority_bits <= MAX_PRIORITY_BITS);
        let mut declared = 0;
        let mut i = 0;
        while i < levels.len() {
            let Some(index) = index_for(priority_bits, levels[i]) else {
                panic!("Invalid priority level");
            };
            declared |= 1 << index;
            i += 1;
        }
        Self {
            priority_bits,
            declared,
            handlers: [None; MAX_PRIORITY_LEVELS],
        }
    }

    /// Returns the index of `priority` in the active bitmap, if the platform declared it.
    pub fn index_of(&self, priority: u8) -> Result<usize, FatalError> {
        match index_for(self.priority_bits, priority) {
            Some(index) if self.declared & (1 << index) != 0 => Ok(index),
            _ => Err(FatalError::InvalidPriority(priority)),
        }
    }

    fn priority_at(&self, index: usize) -> u8 {
        (index as u8) << (7 - self.priority_bits)
    }

    /// Installs the handler for a priority level. Each level can have only one handler.
    pub fn register_handler(
        &mut self,
        priority: u8,
        handler: PriorityHandler,
    ) -> Result<(), FatalError> {
        let index = self.index_of(priority)?;
        let slot = &mut self.handlers[index];
        if slot.is_some() {
            return Err(FatalError::HandlerAlreadyRegistered(priority));
        }
        *slot = Some(handler);
        debug!("Registered handler for priority {priority:#04x}");
        Ok(())
    }

    /// Returns the handler registered for a priority level.
    pub fn handler(&self, priority: u8) -> Option<PriorityHandler> {
        self.handlers[self.index_of(priority).ok()?]
    }
}

impl Debug for PriorityTable {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("PriorityTable")
            .field("priority_bits", &self.priority_bits)
            .field("declared", &format_args!("{:#010x}", self.declared))
            .finish_non_exhaustive()
    }
}

/// Maps a priority to its bitmap index: the top `priority_bits` bits below the Non-Secure bit.
///
/// Returns `None` for Non-Secure priorities and for priorities with bits set below the width.
const fn index_for(priority_bits: u8, priority: u8) -> Option<usize> {
    let shift = 7 - priority_bits;
    if priority & NS_PRIORITY_BIT != 0 || priority & ((1 << shift) - 1) != 0 {
        None
    } else {
        Some(((priority & !NS_PRIORITY_BIT) >> shift) as usize)
    }
}

/// A priority table which takes handlers during firmware initialisation and is then frozen.
///
/// Once frozen the table is read by every core without taking a lock, so activation and
/// deactivation can nest on one core.
pub struct PriorityRegistry {
    pending: SpinMutex<PriorityTable>,
    frozen: Once<PriorityTable>,
}

impl PriorityRegistry {
    /// Creates a registry of the given priority levels without any handlers.
    pub const fn new(priority_bits: u8, levels: &[u8]) -> Self {
        Self {
            pending: SpinMutex::new(PriorityTable::new(priority_bits, levels)),
            frozen: Once::new(),
        }
    }

    /// Installs the handler for a priority level, unless the table is already frozen.
    pub fn register(&self, priority: u8, handler: PriorityHandler) -> Result<(), FatalError> {
        let mut pending = self.pending.lock();
        if self.frozen.get().is_some() {
            return Err(FatalError::PriorityTableFrozen);
        }
        pending.register_handler(priority, handler)
    }

    /// Stops registration and returns the final table. Later calls return the same table.
    pub fn freeze(&self) -> &PriorityTable {
        // Held until the frozen table is published, so no registration can be lost.
        let pending = self.pending.lock();
        self.frozen.call_once(|| pending.clone())
    }

    /// Returns the frozen table.
    pub fn table(&self) -> Result<&PriorityTable, FatalError> {
        self.frozen.get().ok_or(FatalError::PriorityTableNotFrozen)
    }
}

/// The priority levels declared by this platform and their handlers.
pub static PRIORITIES: PriorityRegistry =
    PriorityRegistry::new(PlatformImpl::PRIORITY_BITS, PlatformImpl::PRIORITY_LEVELS);

/// Registers the handler for one of the platform's priority levels.
pub fn register_priority_handler(
    priority: u8,
    handler: PriorityHandler,
) -> Result<(), FatalError> {
    PRIORITIES.register(priority, handler)
}

/// Ends handler registration. Must be called by the primary core before any priority is
/// activated.
pub fn freeze_priority_table() {
    let table = PRIORITIES.freeze();
    info!("Priority table frozen: {table:?}");
}

/// Per-core record of active priority levels.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PriorityState {
    active: u32,
    initial_mask: u8,
    stashed_ns_mask: Option<u8>,
    ns_preemption_allowed: bool,
}

impl PriorityState {
    /// Nothing active.
    pub const EMPTY: Self = Self {
        active: 0,
        initial_mask: 0,
        stashed_ns_mask: None,
        ns_preemption_allowed: false,
    };

    /// Returns the bitmap of active levels. Bit 0 is the highest priority.
    pub fn active_bitmap(&self) -> u32 {
        self.active
    }

    /// Returns the priority mask recorded when the first level was activated.
    pub fn initial_mask(&self) -> u8 {
        self.initial_mask
    }

    /// Returns the highest active priority.
    pub fn highest_active(&self, table: &PriorityTable) -> Option<u8> {
        (self.active != 0).then(|| table.priority_at(self.active.trailing_zeros() as usize))
    }

    /// Marks `priority` as active. It must be higher than every level already active.
    ///
    /// `current_mask` is the priority mask currently programmed. Returns the mask to program next.
    pub fn activate(
        &mut self,
        table: &PriorityTable,
        priority: u8,
        current_mask: u8,
    ) -> Result<u8, FatalError> {
        let index = table.index_of(priority)?;
        let bit = 1 << index;
        if self.active & bit != 0 {
            return Err(FatalError::DoubleActivation(priority));
        }
        if self.active != 0 && index > self.active.trailing_zeros() as usize {
            return Err(FatalError::PriorityNotHigher {
                priority,
                active: self.active,
            });
        }
        if self.active == 0 {
            self.initial_mask = current_mask;
        }
        self.active |= bit;
        Ok(priority.min(current_mask))
    }

    /// Clears `priority`, which must be the most recently activated level.
    ///
    /// Returns the mask to program next: that of the next active level, or the initial mask.
    pub fn deactivate(&mut self, table: &PriorityTable, priority: u8) -> Result<u8, FatalError> {
        let index = table.index_of(priority)?;
        if self.active == 0 {
            return Err(FatalError::NothingActive(priority));
        }
        if self.active.trailing_zeros() as usize != index {
            return Err(FatalError::OutOfOrderDeactivation {
                priority,
                active: self.active,
            });
        }
        self.active &= !(1 << index);
        Ok(self
            .highest_active(table)
            .map_or(self.initial_mask, |next| next.min(self.initial_mask)))
    }

    /// Saves the Non-Secure priority mask on entry to Secure execution and revokes preemption.
    pub fn stash_ns_mask(&mut self, current_mask: u8) -> Result<(), FatalError> {
        if self.stashed_ns_mask.is_some() {
            return Err(FatalError::NsMaskAlreadyStashed);
        }
        self.stashed_ns_mask = Some(current_mask);
        self.ns_preemption_allowed = false;
        Ok(())
    }

    /// Returns the stashed Non-Secure mask on exit from Secure execution.
    pub fn unstash_ns_mask(&mut self) -> Result<u8, FatalError> {
        self.ns_preemption_allowed = false;
        self.stashed_ns_mask.take().ok_or(FatalError::NsMaskNotStashed)
    }

    /// Lets Non-Secure interrupts preempt the current Secure execution. Returns the Non-Secure mask
    /// to program so they can be taken.
    pub fn allow_ns_preemption(&mut self) -> Result<u8, FatalError> {
        let mask = self.stashed_ns_mask.ok_or(FatalError::NsMaskNotStashed)?;
        self.ns_preemption_allowed = true;
        Ok(mask)
    }

    /// Returns whether Non-Secure interrupts may preempt the current Secure execution.
    pub fn is_ns_preemption_allowed(&self) -> bool {
        self.ns_preemption_allowed
    }
}

impl ThisCpu {
    /// Activates `priority` on this core. Returns the priority mask to program.
    pub fn activate_priority(&mut self, priority: u8, current_mask: u8) -> Result<u8, FatalError> {
        let table = PRIORITIES.table()?;
        self.priority_state_mut().activate(table, priority, current_mask)
    }

    /// Deactivates `priority` on this core. Returns the priority mask to program.
    pub fn deactivate_priority(&mut self, priority: u8) -> Result<u8, FatalError> {
        let table = PRIORITIES.table()?;
        self.priority_state_mut().deactivate(table, priority)
    }

    /// Saves the Non-Secure priority mask on entry to Secure execution.
    pub fn stash_ns_mask(&mut self, current_mask: u8) -> Result<(), FatalError> {
        self.priority_state_mut().stash_ns_mask(current_mask)
    }

    /// Returns the Non-Secure priority mask to program on exit from Secure execution.
    pub fn unstash_ns_mask(&mut self) -> Result<u8, FatalError> {
        self.priority_state_mut().unstash_ns_mask()
    }

    /// Allows Non-Secure preemption of the current Secure execution. The interrupted Non-Secure
    /// caller observes `code` in x0 when it is resumed.
    pub fn allow_ns_preemption(&mut self, code: u64) -> Result<u8, FatalError> {
        let no_context = FatalError::NoContextBound(World::NonSecure, RegisterSet::None);
        if self.current_world_context(World::NonSecure).is_none() {
            return Err(no_context);
        }
        let mask = self.priority_state_mut().allow_ns_preemption()?;
        self.current_world_context_mut(World::NonSecure)
            .ok_or(no_context)?
            .gpregs
            .registers[0] = code;
        Ok(mask)
    }

    /// Queried by the interrupt dispatcher before letting a Non-Secure interrupt in.
    pub fn is_ns_preemption_allowed(&self) -> bool {
        self.priority_state().is_ns_preemption_allowed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{context::WorldContext, percpu::CpuDirectory};
    use std::boxed::Box;

    const LEVELS: [u8; 4] = [0x00, 0x10, 0x20, 0x40];

    fn table() -> PriorityTable {
        PriorityTable::new(3, &LEVELS)
    }

    fn handler(_interrupt_id: u32, _flags: u32) -> i32 {
        0
    }

    fn other_handler(_interrupt_id: u32, _flags: u32) -> i32 {
        1
    }

    #[test]
    fn index_uses_top_bits() {
        let table = table();
        assert_eq!(table.index_of(0x00), Ok(0));
        assert_eq!(table.index_of(0x10), Ok(1));
        assert_eq!(table.index_of(0x40), Ok(4));
        // Not declared.
        assert_eq!(table.index_of(0x30), Err(FatalError::InvalidPriority(0x30)));
        // Below the priority width.
        assert_eq!(table.index_of(0x18), Err(FatalError::InvalidPriority(0x18)));
        // Non-Secure half.
        assert_eq!(table.index_of(0x80), Err(FatalError::InvalidPriority(0x80)));
    }

    #[test]
    fn activate_then_deactivate_restores_bitmap() {
        let table = table();
        let mut state = PriorityState::EMPTY;
        state.activate(&table, 0x40, 0xff).unwrap();
        let before = state.active_bitmap();
        for priority in [0x00, 0x10, 0x20] {
            let mut nested = state.clone();
            nested.activate(&table, priority, 0x40).unwrap();
            nested.deactivate(&table, priority).unwrap();
            assert_eq!(nested.active_bitmap(), before);
        }
    }

    #[test]
    fn masks_follow_nesting() {
        let table = table();
        let mut state = PriorityState::EMPTY;
        assert_eq!(state.activate(&table, 0x40, 0xff), Ok(0x40));
        assert_eq!(state.activate(&table, 0x10, 0x40), Ok(0x10));
        assert_eq!(state.highest_active(&table), Some(0x10));
        assert_eq!(state.deactivate(&table, 0x10), Ok(0x40));
        assert_eq!(state.deactivate(&table, 0x40), Ok(0xff));
        assert_eq!(state.active_bitmap(), 0);
        assert_eq!(state.initial_mask(), 0xff);
    }

    #[test]
    fn double_activation_is_rejected() {
        let table = table();
        let mut state = PriorityState::EMPTY;
        state.activate(&table, 0x20, 0xff).unwrap();
        assert_eq!(
            state.activate(&table, 0x20, 0x20),
            Err(FatalError::DoubleActivation(0x20))
        );
    }

    #[test]
    fn lower_priority_cannot_nest() {
        let table = table();
        let mut state = PriorityState::EMPTY;
        state.activate(&table, 0x10, 0xff).unwrap();
        assert_eq!(
            state.activate(&table, 0x20, 0x10),
            Err(FatalError::PriorityNotHigher {
                priority: 0x20,
                active: 0b10
            })
        );
    }

    #[test]
    fn deactivation_must_mirror_activation() {
        let table = table();
        let mut state = PriorityState::EMPTY;
        state.activate(&table, 0x20, 0xff).unwrap();
        state.activate(&table, 0x10, 0x20).unwrap();
        assert_eq!(
            state.deactivate(&table, 0x20),
            Err(FatalError::OutOfOrderDeactivation {
                priority: 0x20,
                active: 0b110
            })
        );
        assert_eq!(state.active_bitmap(), 0b110);
    }

    #[test]
    fn deactivate_with_nothing_active() {
        let table = table();
        let mut state = PriorityState::EMPTY;
        assert_eq!(
            state.deactivate(&table, 0x00),
            Err(FatalError::NothingActive(0x00))
        );
    }

    #[test]
    fn one_handler_per_level() {
        let mut table = table();
        assert!(table.handler(0x10).is_none());
        table.register_handler(0x10, handler).unwrap();
        assert_eq!(
            table.register_handler(0x10, other_handler),
            Err(FatalError::HandlerAlreadyRegistered(0x10))
        );
        assert_eq!(table.handler(0x10).map(|handler| handler(0, 0)), Some(0));
        assert_eq!(
            table.register_handler(0x30, handler),
            Err(FatalError::InvalidPriority(0x30))
        );
    }

    #[test]
    fn platform_levels_take_handlers_until_frozen() {
        let registry =
            PriorityRegistry::new(PlatformImpl::PRIORITY_BITS, PlatformImpl::PRIORITY_LEVELS);
        assert_eq!(registry.table().unwrap_err(), FatalError::PriorityTableNotFrozen);
        assert_eq!(registry.register(0x20, handler), Ok(()));
        assert_eq!(
            registry.register(0x20, other_handler),
            Err(FatalError::HandlerAlreadyRegistered(0x20))
        );
        assert_eq!(
            registry.register(0x30, handler),
            Err(FatalError::InvalidPriority(0x30))
        );

        let frozen = registry.freeze();
        assert_eq!(frozen.handler(0x20).map(|handler| handler(0, 0)), Some(0));
        assert!(core::ptr::eq(registry.freeze(), frozen));
        assert!(core::ptr::eq(registry.table().unwrap(), frozen));
        assert_eq!(
            registry.register(0x10, handler),
            Err(FatalError::PriorityTableFrozen)
        );
    }

    #[test]
    fn nested_activation_on_one_core() {
        freeze_priority_table();
        let directory = Box::leak(Box::new(CpuDirectory::<1>::new()));
        let mut cpu = directory.install_core_identity(0, 0x1000).unwrap();

        assert_eq!(cpu.activate_priority(0x40, 0xff), Ok(0x40));
        // A higher priority exception taken while the first is being handled.
        assert_eq!(cpu.activate_priority(0x10, 0x40), Ok(0x10));
        assert_eq!(cpu.activate_priority(0x00, 0x10), Ok(0x00));
        assert_eq!(cpu.priority_state().active_bitmap(), 0b1_0011);
        assert_eq!(cpu.deactivate_priority(0x00), Ok(0x10));
        assert_eq!(cpu.deactivate_priority(0x10), Ok(0x40));
        assert_eq!(cpu.deactivate_priority(0x40), Ok(0xff));
        assert_eq!(cpu.priority_state().active_bitmap(), 0);
    }

    #[test]
    fn ns_preemption_needs_stash() {
        let mut state = PriorityState::EMPTY;
        assert_eq!(state.allow_ns_preemption(), Err(FatalError::NsMaskNotStashed));
        state.stash_ns_mask(0x80).unwrap();
        assert!(!state.is_ns_preemption_allowed());
        assert_eq!(
            state.stash_ns_mask(0x80),
            Err(FatalError::NsMaskAlreadyStashed)
        );
        assert_eq!(state.allow_ns_preemption(), Ok(0x80));
        assert!(state.is_ns_preemption_allowed());
        assert_eq!(state.unstash_ns_mask(), Ok(0x80));
        assert!(!state.is_ns_preemption_allowed());
        assert_eq!(state.unstash_ns_mask(), Err(FatalError::NsMaskNotStashed));
    }

    #[test]
    fn preemption_code_reaches_non_secure_x0() {
        let directory = Box::leak(Box::new(CpuDirectory::<1>::new()));
        let mut cpu = directory.install_core_identity(0, 0x1000).unwrap();
        let context = Box::leak(Box::new(WorldContext::EMPTY));
        cpu.bind_world_context(World::NonSecure, context);

        assert_eq!(
            cpu.allow_ns_preemption(0xdead),
            Err(FatalError::NsMaskNotStashed)
        );
        cpu.stash_ns_mask(0xf0).unwrap();
        assert_eq!(cpu.allow_ns_preemption(0xdead), Ok(0xf0));
        assert!(cpu.is_ns_preemption_allowed());
        assert_eq!(
            cpu.current_world_context(World::NonSecure)
                .unwrap()
                .gpregs
                .registers[0],
            0xdead
        );

        assert_eq!(cpu.unstash_ns_mask(), Ok(0xf0));
        assert!(!cpu.is_ns_preemption_allowed());
    }

    #[test]
    fn preemption_without_non_secure_context() {
        let directory = Box::leak(Box::new(CpuDirectory::<1>::new()));
        let mut cpu = directory.install_core_identity(0, 0x1000).unwrap();
        cpu.stash_ns_mask(0xf0).unwrap();
        assert_eq!(
            cpu.allow_ns_preemption(1),
            Err(FatalError::NoContextBound(
                World::NonSecure,
                RegisterSet::None
            ))
        );
        assert!(!cpu.is_ns_preemption_allowed());
    }
}
