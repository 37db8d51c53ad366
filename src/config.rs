// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Build-time platform configuration consumed by the exception level initialisation protocol.

use crate::{context::World, error::FatalError};
use arm_sysregs::{ExceptionLevel, ScrEl3};

/// The most privileged exception level under the control of this firmware.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FirmwareLevel {
    /// The firmware is the secure monitor.
    El3,
    /// There is no EL3; the firmware is the highest level hypervisor.
    El2,
    /// Neither EL3 nor EL2 are under firmware control.
    El1,
}

impl FirmwareLevel {
    /// Returns the architectural exception level.
    pub const fn exception_level(self) -> ExceptionLevel {
        match self {
            Self::El3 => ExceptionLevel::El3,
            Self::El2 => ExceptionLevel::El2,
            Self::El1 => ExceptionLevel::El1,
        }
    }
}

/// The execution state the next image starts in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecutionWidth {
    /// 64-bit.
    AArch64,
    /// 32-bit only.
    AArch32,
}

/// How physical interrupts are routed while each world is running.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RoutingModel {
    /// GICv3 model with Secure interrupts handled at EL3.
    ///
    /// While in NS-ELx:
    /// - G0 are signalled as FIQs and routed to EL3.
    /// - G1s are signalled as FIQs and routed to EL3.
    /// - G1ns are signalled as IRQs and handled without a world switch.
    ///
    /// While in S-ELx:
    /// - G1s are signalled as IRQs and handled without a world switch.
    /// - G0 and G1ns are signalled as FIQs and not routed until execution is back in NS.
    Gicv3El3Fiq,
    /// Every physical interrupt is taken at the current level in both worlds.
    AllLocal,
    /// Every physical interrupt is routed to EL3 in both worlds.
    AllToEl3,
}

impl RoutingModel {
    /// Sets the interrupt routing bits of `scr_el3` for the given world.
    pub fn apply(self, scr_el3: &mut ScrEl3, world: World) {
        match (self, world) {
            (Self::Gicv3El3Fiq, World::NonSecure) => {
                *scr_el3 |= ScrEl3::FIQ;
                *scr_el3 -= ScrEl3::IRQ;
            }
            (Self::Gicv3El3Fiq, World::Secure) | (Self::AllLocal, _) => {
                *scr_el3 -= ScrEl3::IRQ | ScrEl3::FIQ;
            }
            (Self::AllToEl3, _) => {
                *scr_el3 |= ScrEl3::IRQ | ScrEl3::FIQ;
            }
        }
    }
}

/// The static choices a platform makes about which exception levels and features the firmware
/// manages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PlatformConfig {
    /// The highest level the firmware runs at.
    pub highest_level: FirmwareLevel,
    /// Whether virtualization is configured on, so the Non-Secure descent passes through EL2.
    pub el2_present: bool,
    /// Whether the next process stays at the firmware's own level instead of descending.
    pub stay_resident: bool,
    /// Whether Secure-EL2 should be enabled when the core implements it.
    pub secure_el2: bool,
    /// Whether the pointer authentication keys are part of the world context. If not, their use in
    /// lower levels is left untrapped.
    pub pauth_regs: bool,
    /// Whether memory tagging state is part of the world context.
    pub mte_regs: bool,
    /// Whether the EL2 system registers are part of the world context.
    pub el2_regs: bool,
    /// The interrupt routing model.
    pub routing: RoutingModel,
    /// The execution state of the next image.
    pub entry_width: ExecutionWidth,
}

impl PlatformConfig {
    /// The configuration selected by the cargo features of this build.
    pub const FROM_FEATURES: Self = Self {
        highest_level: FirmwareLevel::El3,
        el2_present: true,
        stay_resident: cfg!(feature = "stay_resident"),
        secure_el2: cfg!(feature = "sel2"),
        pauth_regs: cfg!(feature = "pauth"),
        mte_regs: cfg!(feature = "mte"),
        el2_regs: cfg!(feature = "el2_regs"),
        routing: RoutingModel::Gicv3El3Fiq,
        entry_width: ExecutionWidth::AArch64,
    };

    /// Checks that the combination of options is architecturally valid.
    pub fn validate(&self) -> Result<(), FatalError> {
        if self.secure_el2 && self.entry_width == ExecutionWidth::AArch32 {
            return Err(FatalError::SecureEl2On32Bit);
        }
        if self.secure_el2 && self.highest_level != FirmwareLevel::El3 {
            return Err(FatalError::SecureEl2WithoutEl3);
        }
        if self.el2_regs && !self.el2_present && self.highest_level == FirmwareLevel::El3 {
            return Err(FatalError::El2RegistersWithoutEl2);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: PlatformConfig = PlatformConfig {
        highest_level: FirmwareLevel::El3,
        el2_present: true,
        stay_resident: false,
        secure_el2: false,
        pauth_regs: false,
        mte_regs: false,
        el2_regs: true,
        routing: RoutingModel::Gicv3El3Fiq,
        entry_width: ExecutionWidth::AArch64,
    };

    #[test]
    fn secure_el2_needs_aarch64() {
        let config = PlatformConfig {
            secure_el2: true,
            entry_width: ExecutionWidth::AArch32,
            ..BASE
        };
        assert_eq!(config.validate(), Err(FatalError::SecureEl2On32Bit));
        assert_eq!(
            PlatformConfig {
                secure_el2: true,
                ..BASE
            }
            .validate(),
            Ok(())
        );
    }

    #[test]
    fn el2_registers_need_el2() {
        let config = PlatformConfig {
            el2_present: false,
            ..BASE
        };
        assert_eq!(config.validate(), Err(FatalError::El2RegistersWithoutEl2));
    }

    #[test]
    fn secure_el2_needs_monitor() {
        let config = PlatformConfig {
            highest_level: FirmwareLevel::El2,
            secure_el2: true,
            ..BASE
        };
        assert_eq!(config.validate(), Err(FatalError::SecureEl2WithoutEl3));
    }

    #[test]
    fn gicv3_routing() {
        let mut scr = ScrEl3::IRQ;
        RoutingModel::Gicv3El3Fiq.apply(&mut scr, World::NonSecure);
        assert_eq!(scr, ScrEl3::FIQ);
        RoutingModel::Gicv3El3Fiq.apply(&mut scr, World::Secure);
        assert_eq!(scr, ScrEl3::empty());
        RoutingModel::AllToEl3.apply(&mut scr, World::Secure);
        assert_eq!(scr, ScrEl3::IRQ | ScrEl3::FIQ);
    }
}
