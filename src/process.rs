// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Descriptors for the unit of execution entered after initialisation.

use crate::{
    context::{EntryPointInfo, World},
    error::FatalError,
};
use arm_sysregs::{ExceptionLevel, Spsr};
use bitflags::bitflags;

bitflags! {
    /// The packed security state and privilege class of a process, one bit of each.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ModeFlags: u32 {
        const SECURE = 1 << 0;
        const NON_SECURE = 1 << 1;
        const MONITOR_K = 1 << 2;
        const HYPERVISOR_K = 1 << 3;
        const SUPERVISOR_K = 1 << 4;
        const ADMINISTRATOR_K = 1 << 5;
        const HYPERVISOR_U = 1 << 6;
        const SUPERVISOR_U = 1 << 7;
        const ADMINISTRATOR_U = 1 << 8;
    }
}

impl ModeFlags {
    const WORLD_MASK: Self = Self::SECURE.union(Self::NON_SECURE);
}

/// Whether a process owns the level it runs at or is a client of a kernel at a higher level.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PrivilegeClass {
    /// Runs as the kernel of the given level.
    Kernel(ExceptionLevel),
    /// Runs as a user process at the given level.
    User(ExceptionLevel),
}

impl PrivilegeClass {
    /// Returns the exception level the process executes at.
    pub fn level(self) -> ExceptionLevel {
        match self {
            Self::Kernel(level) | Self::User(level) => level,
        }
    }

    fn flag(self) -> ModeFlags {
        CLASS_FLAGS
            .iter()
            .find(|(_, class)| *class == self)
            .map_or(ModeFlags::empty(), |(flag, _)| *flag)
    }

    fn from_flag(flag: ModeFlags) -> Option<Self> {
        CLASS_FLAGS
            .iter()
            .find(|(class_flag, _)| *class_flag == flag)
            .map(|(_, class)| *class)
    }
}

/// The class bit of each privilege class. A user process at EL3 has no encoding.
const CLASS_FLAGS: [(ModeFlags, PrivilegeClass); 7] = [
    (ModeFlags::MONITOR_K, PrivilegeClass::Kernel(ExceptionLevel::El3)),
    (ModeFlags::HYPERVISOR_K, PrivilegeClass::Kernel(ExceptionLevel::El2)),
    (ModeFlags::SUPERVISOR_K, PrivilegeClass::Kernel(ExceptionLevel::El1)),
    (ModeFlags::ADMINISTRATOR_K, PrivilegeClass::Kernel(ExceptionLevel::El0)),
    (ModeFlags::HYPERVISOR_U, PrivilegeClass::User(ExceptionLevel::El2)),
    (ModeFlags::SUPERVISOR_U, PrivilegeClass::User(ExceptionLevel::El1)),
    (ModeFlags::ADMINISTRATOR_U, PrivilegeClass::User(ExceptionLevel::El0)),
];

/// A validated pair of security state and privilege class.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProcessMode {
    world: World,
    class: PrivilegeClass,
}

impl ProcessMode {
    /// Checks that a process of the given class can run in the given world.
    ///
    /// `secure_el2` says whether Secure-EL2 is enabled on this platform.
    pub fn new(world: World, class: PrivilegeClass, secure_el2: bool) -> Result<Self, FatalError> {
        let valid = match (world, class) {
            (_, PrivilegeClass::User(ExceptionLevel::El3)) => false,
            (_, PrivilegeClass::Kernel(ExceptionLevel::El0)) => false,
            (World::NonSecure, PrivilegeClass::Kernel(ExceptionLevel::El3)) => false,
            (World::Secure, class) if class.level() == ExceptionLevel::El2 => secure_el2,
            _ => true,
        };
        let mode = Self { world, class };
        if valid {
            Ok(mode)
        } else {
            Err(FatalError::InvalidModeFlags(mode.packed().bits()))
        }
    }

    /// Decodes and validates a packed mode value.
    pub fn from_flags(flags: ModeFlags, secure_el2: bool) -> Result<Self, FatalError> {
        let invalid = FatalError::InvalidModeFlags(flags.bits());
        let world_bits = flags & ModeFlags::WORLD_MASK;
        let world = if world_bits == ModeFlags::SECURE {
            World::Secure
        } else if world_bits == ModeFlags::NON_SECURE {
            World::NonSecure
        } else {
            return Err(invalid);
        };
        let class = PrivilegeClass::from_flag(flags - ModeFlags::WORLD_MASK).ok_or(invalid)?;
        Self::new(world, class, secure_el2)
    }

    /// Returns the security state.
    pub fn world(&self) -> World {
        self.world
    }

    /// Returns the privilege class.
    pub fn class(&self) -> PrivilegeClass {
        self.class
    }

    /// Returns the packed encoding, with exactly one security state bit and one class bit.
    pub fn mode_flags(&self) -> ModeFlags {
        self.packed()
    }

    fn packed(&self) -> ModeFlags {
        let world = match self.world {
            World::Secure => ModeFlags::SECURE,
            World::NonSecure => ModeFlags::NON_SECURE,
        };
        world | self.class.flag()
    }
}

/// What sort of process a descriptor describes, with the fields only that sort has.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProcessKind {
    /// A kernel owning its exception level.
    Kernel,
    /// A user process running under a kernel.
    User {
        /// The initial stack pointer.
        stack_top: usize,
        /// A handle to the address space the process runs in.
        address_space: usize,
    },
}

/// The return address and status a process observes on its first entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EntrySnapshot {
    /// The address execution resumes at.
    pub elr: usize,
    /// The saved program status.
    pub spsr: Spsr,
}

/// A unit of execution bound to a world.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessDescriptor {
    kind: ProcessKind,
    mode: Option<ProcessMode>,
    entry_point: EntryPointInfo,
    snapshot: EntrySnapshot,
}

impl ProcessDescriptor {
    /// Creates a descriptor which has not yet been assigned a mode.
    pub fn new(kind: ProcessKind, entry_point: EntryPointInfo) -> Self {
        Self {
            kind,
            mode: None,
            snapshot: EntrySnapshot {
                elr: 0,
                spsr: Spsr::empty(),
            },
            entry_point,
        }
    }

    /// Returns the packed mode, empty until a mode is assigned.
    pub fn mode_flags(&self) -> ModeFlags {
        self.mode.map_or(ModeFlags::empty(), |mode| mode.mode_flags())
    }

    /// Returns the assigned mode, if any.
    pub fn mode(&self) -> Option<ProcessMode> {
        self.mode
    }

    /// Returns the entry point.
    pub fn entry_point(&self) -> &EntryPointInfo {
        &self.entry_point
    }

    /// Returns the first entry state.
    pub fn snapshot(&self) -> EntrySnapshot {
        self.snapshot
    }

    /// Returns the kind of the process.
    pub fn kind(&self) -> &ProcessKind {
        &self.kind
    }

    /// Returns the initial stack pointer of a user process.
    pub fn user_stack_top(&self) -> Option<usize> {
        match self.kind {
            ProcessKind::User { stack_top, .. } => Some(stack_top),
            ProcessKind::Kernel => None,
        }
    }

    /// Returns the address space handle of a user process.
    pub fn address_space(&self) -> Option<usize> {
        match self.kind {
            ProcessKind::User { address_space, .. } => Some(address_space),
            ProcessKind::Kernel => None,
        }
    }

    /// Assigns the mode and seeds the entry state, from the entry point and the given status.
    ///
    /// The class of `mode` must agree with the kind of the process.
    pub fn assign(&mut self, mode: ProcessMode, spsr: Spsr) -> Result<(), FatalError> {
        let kind_matches = matches!(
            (&self.kind, mode.class()),
            (ProcessKind::Kernel, PrivilegeClass::Kernel(_))
                | (ProcessKind::User { .. }, PrivilegeClass::User(_))
        );
        if !kind_matches {
            return Err(FatalError::InvalidModeFlags(mode.mode_flags().bits()));
        }
        self.mode = Some(mode);
        self.snapshot = EntrySnapshot {
            elr: self.entry_point.pc,
            spsr,
        };
        Ok(())
    }
}
