// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Unrecoverable errors detected by the context management code.
//!
//! Nothing here is retried. Every operation returns a `Result` and the caller converts an `Err` into
//! a core halt through [`crate::percpu::ThisCpu::or_halt`].

use crate::context::World;
use arm_sysregs::ExceptionLevel;
use core::fmt::{self, Display, Formatter};

/// Which group of registers an error concerns, for the crash diagnostic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u64)]
pub enum RegisterSet {
    /// No particular registers.
    None = 0,
    /// The EL1 system registers.
    El1 = 1,
    /// The EL2 system registers.
    El2 = 2,
    /// The EL3 control registers.
    El3 = 3,
}

/// A violated invariant. Reaching one of these means the core must not continue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FatalError {
    /// A raw security state value is neither Secure nor Non-Secure.
    InvalidSecurityState(u64),
    /// A priority is outside the configured priority width or wasn't declared by the platform.
    InvalidPriority(u8),
    /// Secure-EL2 was requested for a 32-bit only entry.
    SecureEl2On32Bit,
    /// Secure-EL2 was requested without the firmware running at EL3.
    SecureEl2WithoutEl3,
    /// EL2 registers are part of the context but EL2 isn't configured.
    El2RegistersWithoutEl2,
    /// A save or restore of the EL2 registers was requested but they aren't part of the context.
    El2RegistersNotIncluded,
    /// A privilege class can't be entered in the given security state.
    InvalidModeFlags(u32),
    /// The core doesn't implement an exception level the configuration needs.
    LevelNotImplemented(ExceptionLevel),
    /// A priority was activated while already active.
    DoubleActivation(u8),
    /// A priority was activated while an equal or higher priority is active.
    PriorityNotHigher {
        /// The priority being activated.
        priority: u8,
        /// The currently active bitmap.
        active: u32,
    },
    /// A priority was deactivated which wasn't the most recently activated.
    OutOfOrderDeactivation {
        /// The priority being deactivated.
        priority: u8,
        /// The currently active bitmap.
        active: u32,
    },
    /// A priority was deactivated while none is active.
    NothingActive(u8),
    /// A second handler was registered for the same priority level.
    HandlerAlreadyRegistered(u8),
    /// Non-Secure preemption was changed outside Secure execution.
    NsMaskNotStashed,
    /// The Non-Secure mask was stashed twice.
    NsMaskAlreadyStashed,
    /// A handler was registered after the priority table was frozen.
    PriorityTableFrozen,
    /// A priority was activated before the priority table was frozen.
    PriorityTableNotFrozen,
    /// The initialisation protocol was run twice on the same core.
    ReentrantInit,
    /// No context is bound for a world that is being saved, restored or programmed.
    NoContextBound(World, RegisterSet),
    /// The storage for a world context on this core has already been handed out.
    ContextStorageTaken(World),
    /// The per-CPU record of this core has already been claimed.
    CoreAlreadyClaimed(usize),
    /// A core index is not below the platform core count.
    CoreIndexOutOfRange(usize),
}

impl FatalError {
    /// Returns the numeric code reported in the crash buffer.
    pub fn code(&self) -> u64 {
        match self {
            Self::InvalidSecurityState(_) => 0x01,
            Self::InvalidPriority(_) => 0x02,
            Self::SecureEl2On32Bit => 0x03,
            Self::SecureEl2WithoutEl3 => 0x04,
            Self::El2RegistersWithoutEl2 => 0x05,
            Self::El2RegistersNotIncluded => 0x06,
            Self::InvalidModeFlags(_) => 0x07,
            Self::LevelNotImplemented(_) => 0x08,
            Self::DoubleActivation(_) => 0x10,
            Self::PriorityNotHigher { .. } => 0x11,
            Self::OutOfOrderDeactivation { .. } => 0x12,
            Self::NothingActive(_) => 0x13,
            Self::HandlerAlreadyRegistered(_) => 0x14,
            Self::NsMaskNotStashed => 0x15,
            Self::NsMaskAlreadyStashed => 0x16,
            Self::PriorityTableFrozen => 0x17,
            Self::PriorityTableNotFrozen => 0x18,
            Self::ReentrantInit => 0x20,
            Self::NoContextBound(..) => 0x21,
            Self::ContextStorageTaken(_) => 0x22,
            Self::CoreAlreadyClaimed(_) => 0x23,
            Self::CoreIndexOutOfRange(_) => 0x24,
        }
    }

    /// Returns the world the error concerns, if any.
    pub fn world(&self) -> Option<World> {
        match self {
            Self::NoContextBound(world, _) | Self::ContextStorageTaken(world) => Some(*world),
            _ => None,
        }
    }

    /// Returns the register group the error concerns.
    pub fn register_set(&self) -> RegisterSet {
        match self {
            Self::NoContextBound(_, set) => *set,
            Self::El2RegistersNotIncluded | Self::El2RegistersWithoutEl2 => RegisterSet::El2,
            Self::SecureEl2On32Bit | Self::SecureEl2WithoutEl3 => RegisterSet::El3,
            Self::LevelNotImplemented(ExceptionLevel::El2) => RegisterSet::El2,
            Self::LevelNotImplemented(ExceptionLevel::El1) => RegisterSet::El1,
            _ => RegisterSet::None,
        }
    }

    /// Returns an error specific value for the crash diagnostic.
    pub fn detail(&self) -> u64 {
        match *self {
            Self::InvalidSecurityState(value) => value,
            Self::InvalidPriority(priority)
            | Self::DoubleActivation(priority)
            | Self::NothingActive(priority)
            | Self::HandlerAlreadyRegistered(priority) => priority.into(),
            Self::PriorityNotHigher { priority, active }
            | Self::OutOfOrderDeactivation { priority, active } => {
                u64::from(active) << 8 | u64::from(priority)
            }
            Self::InvalidModeFlags(flags) => flags.into(),
            Self::LevelNotImplemented(level) => level as u64,
            Self::CoreAlreadyClaimed(index) | Self::CoreIndexOutOfRange(index) => index as u64,
            _ => 0,
        }
    }
}

impl Display for FatalError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::InvalidSecurityState(value) => write!(f, "invalid security state {value}"),
            Self::InvalidPriority(priority) => write!(f, "invalid priority {priority:#04x}"),
            Self::SecureEl2On32Bit => f.write_str("S-EL2 can not be used in AArch32"),
            Self::SecureEl2WithoutEl3 => f.write_str("S-EL2 requires the firmware to run at EL3"),
            Self::El2RegistersWithoutEl2 => {
                f.write_str("EL2 registers are included but EL2 isn't configured")
            }
            Self::El2RegistersNotIncluded => f.write_str("EL2 registers are not context switched"),
            Self::InvalidModeFlags(flags) => write!(f, "invalid mode flags {flags:#x}"),
            Self::LevelNotImplemented(level) => write!(f, "{level:?} is not implemented"),
            Self::DoubleActivation(priority) => {
                write!(f, "priority {priority:#04x} is already active")
            }
            Self::PriorityNotHigher { priority, active } => write!(
                f,
                "priority {priority:#04x} is not higher than the active priorities {active:#010x}"
            ),
            Self::OutOfOrderDeactivation { priority, active } => write!(
                f,
                "priority {priority:#04x} is not the highest of the active priorities {active:#010x}"
            ),
            Self::NothingActive(priority) => {
                write!(f, "deactivating priority {priority:#04x} with nothing active")
            }
            Self::HandlerAlreadyRegistered(priority) => {
                write!(f, "handler already registered for priority {priority:#04x}")
            }
            Self::NsMaskNotStashed => f.write_str("Non-Secure priority mask was not stashed"),
            Self::NsMaskAlreadyStashed => f.write_str("Non-Secure priority mask already stashed"),
            Self::PriorityTableFrozen => {
                f.write_str("priority handlers can no longer be registered")
            }
            Self::PriorityTableNotFrozen => {
                f.write_str("priority handlers are still being registered")
            }
            Self::ReentrantInit => f.write_str("exception level initialisation already ran"),
            Self::NoContextBound(world, set) => {
                write!(f, "no {world:?} context bound for {set:?} registers")
            }
            Self::ContextStorageTaken(world) => {
                write!(f, "{world:?} context storage already taken")
            }
            Self::CoreAlreadyClaimed(index) => write!(f, "core {index} already claimed"),
            Self::CoreIndexOutOfRange(index) => write!(f, "core index {index} out of range"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::ToString;

    #[test]
    fn detail_packs_bitmap_and_priority() {
        let error = FatalError::OutOfOrderDeactivation {
            priority: 0x20,
            active: 0b101,
        };
        assert_eq!(error.detail(), 0x520);
        assert_eq!(error.code(), 0x12);
    }

    #[test]
    fn missing_context_names_world_and_registers() {
        let error = FatalError::NoContextBound(World::Secure, RegisterSet::El1);
        assert_eq!(error.world(), Some(World::Secure));
        assert_eq!(error.register_set(), RegisterSet::El1);
        assert_eq!(error.to_string(), "no Secure context bound for El1 registers");
    }
}
