// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Saving and restoring the lower exception level system registers of a world.
//!
//! Callers must have masked any exception which could re-enter these functions for the same world.

use crate::{
    context::World,
    error::{FatalError, RegisterSet},
    percpu::ThisCpu,
};
use arm_sysregs::{
    Esr, HcrEl2, IccSre, ScrEl3, SctlrEl1, SctlrEl2, Spsr, read_id_aa64mmfr1_el1,
};
use log::trace;

/// Returns whether the core implements the Virtualization Host Extensions.
fn is_feat_vhe_present() -> bool {
    read_id_aa64mmfr1_el1().is_feat_vhe_present()
}

/// The group of lower level system registers to save or restore.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SysregLevel {
    /// The EL1 (and EL0) system registers.
    El1,
    /// The EL2 system registers.
    El2,
}

impl SysregLevel {
    fn register_set(self) -> RegisterSet {
        match self {
            Self::El1 => RegisterSet::El1,
            Self::El2 => RegisterSet::El2,
        }
    }
}

/// Defines a group of system registers which are saved and restored together, with its `EMPTY`
/// value and `save` and `restore` built from the `arm_sysregs` accessors named after each field.
///
/// Registers in the `vhe` group are only accessed when the core implements VHE. Registers in the
/// `save_only` group are saved but never written back.
macro_rules! context_sysregs {
    (
        $(#[$attr:meta])*
        $name:ident {
            $($reg:ident: $type:ty = $empty:expr,)*
        }
        $(vhe { $($vhe_reg:ident: $vhe_type:ty = $vhe_empty:expr,)* })?
        $(save_only { $($saved_reg:ident: $saved_type:ty = $saved_empty:expr,)* })?
    ) => {
        paste::paste! {
            $(#[$attr])*
            #[derive(Clone, Debug, Eq, PartialEq)]
            #[repr(C)]
            pub struct $name {
                $(pub(crate) $reg: $type,)*
                $($(pub(crate) $vhe_reg: $vhe_type,)*)?
                $($(pub(crate) $saved_reg: $saved_type,)*)?
            }

            impl $name {
                /// All registers zero.
                pub const EMPTY: Self = Self {
                    $($reg: $empty,)*
                    $($($vhe_reg: $vhe_empty,)*)?
                    $($($saved_reg: $saved_empty,)*)?
                };

                /// Reads the current values from the system registers to save them.
                pub(crate) fn save(&mut self) {
                    $(self.$reg = arm_sysregs::[<read_ $reg>]();)*
                    $($(self.$saved_reg = arm_sysregs::[<read_ $saved_reg>]();)*)?
                    $(
                        if is_feat_vhe_present() {
                            $(self.$vhe_reg = arm_sysregs::[<read_ $vhe_reg>]();)*
                        }
                    )?
                }

                /// Writes the saved register values to the system registers.
                pub(crate) fn restore(&self) {
                    $(arm_sysregs::[<write_ $reg>](self.$reg);)*
                    $(
                        if is_feat_vhe_present() {
                            $(arm_sysregs::[<write_ $vhe_reg>](self.$vhe_reg);)*
                        }
                    )?
                }
            }
        }
    };
}

context_sysregs! {
    /// The EL1 and EL0 system registers a world keeps across world switches.
    El1Sysregs {
        spsr_el1: Spsr = Spsr::empty(),
        elr_el1: usize = 0,
        sctlr_el1: SctlrEl1 = SctlrEl1::empty(),
        tcr_el1: u64 = 0,
        cpacr_el1: u64 = 0,
        csselr_el1: u64 = 0,
        sp_el1: u64 = 0,
        esr_el1: Esr = Esr::empty(),
        ttbr0_el1: u64 = 0,
        ttbr1_el1: u64 = 0,
        mair_el1: u64 = 0,
        amair_el1: u64 = 0,
        actlr_el1: u64 = 0,
        tpidr_el1: u64 = 0,
        tpidr_el0: u64 = 0,
        tpidrro_el0: u64 = 0,
        par_el1: u64 = 0,
        far_el1: u64 = 0,
        afsr0_el1: u64 = 0,
        afsr1_el1: u64 = 0,
        contextidr_el1: u64 = 0,
        vbar_el1: usize = 0,
        mdccint_el1: u64 = 0,
        mdscr_el1: u64 = 0,
    }
}

context_sysregs! {
    /// The EL2 system registers a world keeps across world switches.
    El2Sysregs {
        actlr_el2: u64 = 0,
        afsr0_el2: u64 = 0,
        afsr1_el2: u64 = 0,
        amair_el2: u64 = 0,
        cnthctl_el2: u64 = 0,
        cntvoff_el2: u64 = 0,
        cptr_el2: u64 = 0,
        elr_el2: usize = 0,
        esr_el2: Esr = Esr::empty(),
        far_el2: u64 = 0,
        hacr_el2: u64 = 0,
        hcr_el2: HcrEl2 = HcrEl2::empty(),
        hpfar_el2: u64 = 0,
        hstr_el2: u64 = 0,
        icc_sre_el2: IccSre = IccSre::empty(),
        ich_hcr_el2: u64 = 0,
        mair_el2: u64 = 0,
        mdcr_el2: u64 = 0,
        sctlr_el2: SctlrEl2 = SctlrEl2::empty(),
        spsr_el2: Spsr = Spsr::empty(),
        sp_el2: u64 = 0,
        tcr_el2: u64 = 0,
        tpidr_el2: u64 = 0,
        ttbr0_el2: u64 = 0,
        vbar_el2: usize = 0,
        vmpidr_el2: u64 = 0,
        vpidr_el2: u64 = 0,
        vtcr_el2: u64 = 0,
        vttbr_el2: u64 = 0,
    }
    vhe {
        contextidr_el2: u64 = 0,
        ttbr1_el2: u64 = 0,
    }
    // ICH_VMCR_EL2 is owned by the GIC driver, which restores it itself.
    save_only {
        ich_vmcr_el2: u64 = 0,
    }
}

impl ThisCpu {
    /// Saves the current values of the given level's system registers into the context bound for
    /// `world`.
    pub fn save_system_registers(
        &mut self,
        level: SysregLevel,
        world: World,
    ) -> Result<(), FatalError> {
        if !self.el2_switched(level, world)? {
            return Ok(());
        }
        let context = self
            .current_world_context_mut(world)
            .ok_or(FatalError::NoContextBound(world, level.register_set()))?;
        trace!("Saving {world:?} {level:?} system registers");
        match level {
            SysregLevel::El1 => context.el1_sysregs.save(),
            SysregLevel::El2 => context.el2_sysregs.save(),
        }
        Ok(())
    }

    /// Writes the given level's system registers from the context bound for `world`.
    pub fn restore_system_registers(
        &mut self,
        level: SysregLevel,
        world: World,
    ) -> Result<(), FatalError> {
        if !self.el2_switched(level, world)? {
            return Ok(());
        }
        let context = self
            .current_world_context(world)
            .ok_or(FatalError::NoContextBound(world, level.register_set()))?;
        trace!("Restoring {world:?} {level:?} system registers");
        match level {
            SysregLevel::El1 => context.el1_sysregs.restore(),
            SysregLevel::El2 => context.el2_sysregs.restore(),
        }
        Ok(())
    }

    /// Returns whether a save or restore of `level` for `world` should touch the registers at all.
    ///
    /// EL1 registers are always switched. EL2 registers must be part of the context, and the
    /// Secure ones are only switched while Secure-EL2 is enabled in the Secure SCR_EL3.
    fn el2_switched(&self, level: SysregLevel, world: World) -> Result<bool, FatalError> {
        if level == SysregLevel::El1 {
            return Ok(true);
        }
        if !self.el2_regs_switched() {
            return Err(FatalError::El2RegistersNotIncluded);
        }
        match world {
            World::NonSecure => Ok(true),
            World::Secure => {
                if self.current_world_context(World::Secure).is_none() {
                    return Err(FatalError::NoContextBound(World::Secure, RegisterSet::El2));
                }
                Ok(self.secure_el2_enabled())
            }
        }
    }

    /// Returns whether the Secure world runs with Secure-EL2 enabled.
    fn secure_el2_enabled(&self) -> bool {
        self.current_world_context(World::Secure)
            .is_some_and(|context| context.el3_state.scr_el3.contains(ScrEl3::EEL2))
    }

    /// Saves the EL1 system registers of `world`.
    pub fn save_el1_state(&mut self, world: World) -> Result<(), FatalError> {
        self.save_system_registers(SysregLevel::El1, world)
    }

    /// Restores the EL1 system registers of `world`.
    pub fn restore_el1_state(&mut self, world: World) -> Result<(), FatalError> {
        self.restore_system_registers(SysregLevel::El1, world)
    }

    /// Saves the EL2 system registers of `world`, if they are switched for it.
    pub fn save_el2_state(&mut self, world: World) -> Result<(), FatalError> {
        self.save_system_registers(SysregLevel::El2, world)
    }

    /// Restores the EL2 system registers of `world`, if they are switched for it.
    pub fn restore_el2_state(&mut self, world: World) -> Result<(), FatalError> {
        self.restore_system_registers(SysregLevel::El2, world)
    }

    /// Saves the lower level system registers of `from` and restores those of `to`.
    ///
    /// The EL2 registers are switched when they are part of the context. The EL1 registers are
    /// switched unless Secure-EL2 is enabled, in which case the Secure-EL2 software owns them.
    pub fn switch_world(&mut self, from: World, to: World) -> Result<(), FatalError> {
        let el2 = self.el2_regs_switched();
        let el1 = !(el2 && self.secure_el2_enabled());
        let levels = [(SysregLevel::El1, el1), (SysregLevel::El2, el2)];
        let levels = levels.iter().filter(|(_, switched)| *switched).map(|(level, _)| *level);

        if self.current_world_context(to).is_none() {
            let registers = if el1 {
                RegisterSet::El1
            } else {
                RegisterSet::El2
            };
            return Err(FatalError::NoContextBound(to, registers));
        }
        for level in levels.clone() {
            self.save_system_registers(level, from)?;
        }
        for level in levels {
            self.restore_system_registers(level, to)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{aarch64::fake::reserve_sysregs, context::WorldContext, percpu::CpuDirectory};
    use arm_sysregs::fake::SYSREGS;
    use std::boxed::Box;

    fn cpu_with(worlds: &[World]) -> ThisCpu {
        let directory = Box::leak(Box::new(CpuDirectory::<1>::new()));
        let mut cpu = directory.install_core_identity(0, 0).unwrap();
        for &world in worlds {
            cpu.bind_world_context(world, Box::leak(Box::new(WorldContext::EMPTY)));
        }
        cpu
    }

    #[test]
    fn save_then_restore_is_a_fixed_point() {
        let _sysregs = reserve_sysregs();
        let mut cpu = cpu_with(&World::ALL);
        {
            let mut sysregs = SYSREGS.lock().unwrap();
            sysregs.mair_el1 = 0x44ff;
            sysregs.tpidr_el1 = 0x1234;
            sysregs.vbar_el1 = 0x8000;
        }

        cpu.save_system_registers(SysregLevel::El1, World::NonSecure)
            .unwrap();
        cpu.restore_system_registers(SysregLevel::El1, World::NonSecure)
            .unwrap();

        let sysregs = SYSREGS.lock().unwrap();
        assert_eq!(sysregs.mair_el1, 0x44ff);
        assert_eq!(sysregs.tpidr_el1, 0x1234);
        assert_eq!(sysregs.vbar_el1, 0x8000);
    }

    #[test]
    fn worlds_keep_separate_registers() {
        let _sysregs = reserve_sysregs();
        let mut cpu = cpu_with(&World::ALL);

        SYSREGS.lock().unwrap().mair_el1 = 0x11;
        cpu.save_el1_state(World::Secure).unwrap();
        SYSREGS.lock().unwrap().mair_el1 = 0x22;
        cpu.save_el1_state(World::NonSecure).unwrap();

        cpu.restore_el1_state(World::Secure).unwrap();
        assert_eq!(SYSREGS.lock().unwrap().mair_el1, 0x11);
        cpu.restore_el1_state(World::NonSecure).unwrap();
        assert_eq!(SYSREGS.lock().unwrap().mair_el1, 0x22);
    }

    #[test]
    fn missing_context_is_fatal() {
        let _sysregs = reserve_sysregs();
        let mut cpu = cpu_with(&[World::Secure]);
        assert_eq!(
            cpu.save_el1_state(World::NonSecure),
            Err(FatalError::NoContextBound(World::NonSecure, RegisterSet::El1))
        );
        assert_eq!(
            cpu.restore_el2_state(World::NonSecure),
            Err(FatalError::NoContextBound(World::NonSecure, RegisterSet::El2))
        );
    }

    #[test]
    fn secure_el2_skipped_unless_enabled() {
        let _sysregs = reserve_sysregs();
        let mut cpu = cpu_with(&World::ALL);

        SYSREGS.lock().unwrap().ttbr0_el2 = 0xabc0;
        cpu.save_el2_state(World::Secure).unwrap();
        let secure = cpu.current_world_context(World::Secure).unwrap();
        assert_eq!(secure.el2_sysregs.ttbr0_el2, 0);

        cpu.current_world_context_mut(World::Secure)
            .unwrap()
            .el3_state
            .scr_el3 |= ScrEl3::EEL2;
        cpu.save_el2_state(World::Secure).unwrap();
        let secure = cpu.current_world_context(World::Secure).unwrap();
        assert_eq!(secure.el2_sysregs.ttbr0_el2, 0xabc0);
    }

    #[test]
    fn nonsecure_el2_always_switched() {
        let _sysregs = reserve_sysregs();
        let mut cpu = cpu_with(&World::ALL);
        SYSREGS.lock().unwrap().vttbr_el2 = 0x5000;
        cpu.save_el2_state(World::NonSecure).unwrap();
        SYSREGS.lock().unwrap().vttbr_el2 = 0;
        cpu.restore_el2_state(World::NonSecure).unwrap();
        assert_eq!(SYSREGS.lock().unwrap().vttbr_el2, 0x5000);
    }

    #[test]
    fn switch_world_swaps_el2_registers() {
        let _sysregs = reserve_sysregs();
        let mut cpu = cpu_with(&World::ALL);
        cpu.current_world_context_mut(World::NonSecure)
            .unwrap()
            .el2_sysregs
            .vbar_el2 = 0x9000;
        SYSREGS.lock().unwrap().vbar_el2 = 0x7000;
        cpu.current_world_context_mut(World::Secure)
            .unwrap()
            .el3_state
            .scr_el3 |= ScrEl3::EEL2;

        SYSREGS.lock().unwrap().mair_el1 = 0x11;

        cpu.switch_world(World::Secure, World::NonSecure).unwrap();

        let sysregs = SYSREGS.lock().unwrap();
        assert_eq!(sysregs.vbar_el2, 0x9000);
        // Secure-EL2 owns the EL1 registers.
        assert_eq!(sysregs.mair_el1, 0x11);
        let secure = cpu.current_world_context(World::Secure).unwrap();
        assert_eq!(secure.el2_sysregs.vbar_el2, 0x7000);
        assert_eq!(secure.el1_sysregs.mair_el1, 0);
    }

    #[test]
    fn switch_world_swaps_el1_without_secure_el2() {
        let _sysregs = reserve_sysregs();
        let mut cpu = cpu_with(&World::ALL);
        assert!(cpu.el2_regs_switched());
        let nonsecure = cpu.current_world_context_mut(World::NonSecure).unwrap();
        nonsecure.el1_sysregs.mair_el1 = 0x22;
        nonsecure.el2_sysregs.vbar_el2 = 0x9000;
        {
            let mut sysregs = SYSREGS.lock().unwrap();
            sysregs.mair_el1 = 0x11;
            sysregs.vbar_el2 = 0x7000;
        }

        cpu.switch_world(World::Secure, World::NonSecure).unwrap();
        {
            let sysregs = SYSREGS.lock().unwrap();
            assert_eq!(sysregs.mair_el1, 0x22);
            assert_eq!(sysregs.vbar_el2, 0x9000);
        }
        let secure = cpu.current_world_context(World::Secure).unwrap();
        assert_eq!(secure.el1_sysregs.mair_el1, 0x11);
        // Without Secure-EL2 the Secure world has no EL2 registers of its own.
        assert_eq!(secure.el2_sysregs.vbar_el2, 0);

        SYSREGS.lock().unwrap().mair_el1 = 0x33;
        cpu.switch_world(World::NonSecure, World::Secure).unwrap();
        assert_eq!(SYSREGS.lock().unwrap().mair_el1, 0x11);
        let nonsecure = cpu.current_world_context(World::NonSecure).unwrap();
        assert_eq!(nonsecure.el1_sysregs.mair_el1, 0x33);
    }

    #[test]
    fn switch_world_el1_only_without_el2_regs() {
        let _sysregs = reserve_sysregs();
        let mut cpu = cpu_with(&World::ALL);
        cpu.set_el2_regs_switched(false);
        cpu.current_world_context_mut(World::NonSecure)
            .unwrap()
            .el1_sysregs
            .vbar_el1 = 0x8800;
        {
            let mut sysregs = SYSREGS.lock().unwrap();
            sysregs.vbar_el1 = 0x4400;
            sysregs.vbar_el2 = 0x7000;
        }

        cpu.switch_world(World::Secure, World::NonSecure).unwrap();

        let sysregs = SYSREGS.lock().unwrap();
        assert_eq!(sysregs.vbar_el1, 0x8800);
        assert_eq!(sysregs.vbar_el2, 0x7000);
        let secure = cpu.current_world_context(World::Secure).unwrap();
        assert_eq!(secure.el1_sysregs.vbar_el1, 0x4400);
    }

    #[test]
    fn el2_state_needs_el2_regs() {
        let _sysregs = reserve_sysregs();
        let mut cpu = cpu_with(&World::ALL);
        cpu.set_el2_regs_switched(false);
        SYSREGS.lock().unwrap().vttbr_el2 = 0x5000;
        assert_eq!(
            cpu.save_el2_state(World::NonSecure),
            Err(FatalError::El2RegistersNotIncluded)
        );
        assert_eq!(
            cpu.restore_system_registers(SysregLevel::El2, World::Secure),
            Err(FatalError::El2RegistersNotIncluded)
        );
        let nonsecure = cpu.current_world_context(World::NonSecure).unwrap();
        assert_eq!(nonsecure.el2_sysregs.vttbr_el2, 0);
        assert_eq!(cpu.save_el1_state(World::NonSecure), Ok(()));
    }

    #[test]
    fn switch_world_needs_target_context() {
        let _sysregs = reserve_sysregs();
        let mut cpu = cpu_with(&[World::Secure]);
        {
            let mut sysregs = SYSREGS.lock().unwrap();
            sysregs.mair_el1 = 0x11;
            sysregs.vbar_el2 = 0x7000;
        }
        assert_eq!(
            cpu.switch_world(World::Secure, World::NonSecure),
            Err(FatalError::NoContextBound(World::NonSecure, RegisterSet::El1))
        );
        // Nothing was saved.
        let secure = cpu.current_world_context(World::Secure).unwrap();
        assert_eq!(secure.el1_sysregs.mair_el1, 0);
        assert_eq!(secure.el2_sysregs.vbar_el2, 0);
    }
}
