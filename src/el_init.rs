// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! One time set-up of the exception levels below the firmware.
//!
//! Each core runs [`run_el_initialization_protocol`] once during cold boot. It binds a zeroed
//! context for each world it prepares, programs the baseline control register values, then
//! descends from EL3 through EL2 into EL1 for the Non-Secure world as far as the platform
//! configuration asks. The Secure world is entered straight from EL3, so its EL2 and EL1 registers
//! are never touched here.

use crate::{
    config::{ExecutionWidth, FirmwareLevel, PlatformConfig},
    context::{ContextPool, World, WorldContext},
    error::{FatalError, RegisterSet},
    percpu::{RecordField, ThisCpu},
    process::{PrivilegeClass, ProcessDescriptor, ProcessMode},
};
use arm_sysregs::{
    CptrEl3, ExceptionLevel, HcrEl2, IccSre, MdcrEl3, Pmcr, ScrEl3, SctlrEl1, SctlrEl2, Spsr,
    read_id_aa64pfr0_el1, read_midr_el1, read_mpidr_el1, read_pmcr_el0, write_cnthctl_el2,
    write_cntvoff_el2, write_cptr_el2, write_cptr_el3, write_hcr_el2, write_hstr_el2,
    write_icc_sre_el2, write_mdcr_el2, write_pmcr_el0, write_scr_el3, write_sctlr_el2,
    write_vmpidr_el2, write_vpidr_el2, write_vttbr_el2,
};
use arrayvec::ArrayVec;
use log::{debug, info};

const SCR_EL3_TWI: u64 = 1 << 12;
const SCR_EL3_TWE: u64 = 1 << 13;
const SCR_EL3_SMD: u64 = 1 << 7;
const SCR_EL3_APK: u64 = 1 << 16;
const SCR_EL3_API: u64 = 1 << 17;

const MDCR_EL3_SDD: u64 = 1 << 16;
const MDCR_EL3_SPD32_DISABLED: u64 = 0b10 << 14;

const PMCR_EL0_D: u64 = 1 << 3;
const PMCR_EL0_LC: u64 = 1 << 6;
const PMCR_EL0_LP: u64 = 1 << 7;
const PMCR_EL0_N_SHIFT: u64 = 11;
const PMCR_EL0_N_MASK: u64 = 0x1f;

const HCR_EL2_RW: u64 = 1 << 31;
const HCR_EL2_TEA: u64 = 1 << 37;
const HCR_EL2_APK: u64 = 1 << 40;
const HCR_EL2_API: u64 = 1 << 41;

const MDCR_EL2_HPMD: u64 = 1 << 17;
const MDCR_EL2_HLP: u64 = 1 << 26;

/// CPTR_EL2 with TCPAC, TTA and TFP clear.
const CPTR_EL2_RES1: u64 = 0x33ff;

const CNTHCTL_EL2_EL1PCTEN: u64 = 1 << 0;
const CNTHCTL_EL2_EL1PCEN: u64 = 1 << 1;

/// Little-endian, MMU and caches off.
const SCTLR_EL2_RES1: u64 = 0x30c5_0830;

const SPSR_AARCH32_USR: u64 = 0x10;
const SPSR_AARCH32_SVC: u64 = 0x13;
const SPSR_AARCH32_MON: u64 = 0x16;
const SPSR_AARCH32_HYP: u64 = 0x1a;

/// Where a core is in the initialisation protocol.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InitState {
    /// Programming the EL3 state of each world.
    El3Init,
    /// Programming the Non-Secure EL2 registers.
    El2Init,
    /// Preparing the Non-Secure EL1 registers.
    El1Init,
    /// Finished. The protocol can't run again on this core.
    Done,
}

/// Something the protocol did, in the order it was done.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InitStep {
    /// A zeroed context was bound for the world while setting up the level.
    Bound { world: World, level: ExceptionLevel },
    /// The baseline control registers of the level were programmed for the world.
    Programmed { world: World, level: ExceptionLevel },
    /// The registers of the level were saved into the world's context.
    Saved { world: World, level: ExceptionLevel },
}

/// The outcome of the initialisation protocol on one core.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InitReport {
    /// The steps taken.
    pub steps: ArrayVec<InitStep, 12>,
    /// The mode assigned to the process.
    pub mode: ProcessMode,
    /// The status the process observes on its first entry.
    pub spsr: Spsr,
}

/// What the core implements, as read from its ID registers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CpuFeatures {
    /// EL2 is implemented.
    pub el2_implemented: bool,
    /// EL1 is implemented.
    pub el1_implemented: bool,
    /// Secure-EL2 is implemented.
    pub secure_el2_implemented: bool,
}

impl CpuFeatures {
    /// Reads the features of the calling core.
    pub fn read() -> Self {
        let pfr0 = read_id_aa64pfr0_el1().bits();
        Self {
            el1_implemented: (pfr0 >> 4) & 0xf != 0,
            el2_implemented: (pfr0 >> 8) & 0xf != 0,
            secure_el2_implemented: (pfr0 >> 36) & 0xf != 0,
        }
    }
}

/// Collects the steps of the protocol as it goes.
struct Steps(ArrayVec<InitStep, 12>);

impl Steps {
    fn push(&mut self, step: InitStep) {
        debug!("EL init: {step:?}");
        self.0.push(step);
    }
}

/// Prepares the worlds of the calling core, and assigns `process` the mode it is entered in.
///
/// Contexts are taken from `pool` for any world which doesn't have one bound yet. Nothing is
/// written to any register if the configuration is invalid.
pub fn run_el_initialization_protocol<const CORE_COUNT: usize>(
    cpu: &mut ThisCpu,
    config: &PlatformConfig,
    features: &CpuFeatures,
    pool: &'static ContextPool<CORE_COUNT>,
    process: &mut ProcessDescriptor,
) -> Result<InitReport, FatalError> {
    config.validate()?;
    if cpu.init_state().is_some() {
        return Err(FatalError::ReentrantInit);
    }
    cpu.set_el2_regs_switched(config.el2_regs);

    let mut steps = Steps(ArrayVec::new());
    let descend_el2 = config.el2_present && features.el2_implemented;

    let mode = match config.highest_level {
        FirmwareLevel::El3 => {
            set_state(cpu, InitState::El3Init);
            bind(cpu, pool, World::Secure, ExceptionLevel::El3, &mut steps)?;
            let secure = program_el3(cpu, config, features, World::Secure)?;
            steps.push(InitStep::Programmed {
                world: World::Secure,
                level: ExceptionLevel::El3,
            });

            if config.stay_resident {
                write_scr_el3(secure);
                ProcessMode::new(
                    World::Secure,
                    PrivilegeClass::Kernel(ExceptionLevel::El3),
                    config.secure_el2,
                )?
            } else {
                bind(cpu, pool, World::NonSecure, ExceptionLevel::El3, &mut steps)?;
                let nonsecure = program_el3(cpu, config, features, World::NonSecure)?;
                steps.push(InitStep::Programmed {
                    world: World::NonSecure,
                    level: ExceptionLevel::El3,
                });
                // The EL2 and EL1 registers written from here on belong to the Non-Secure world.
                write_scr_el3(nonsecure);

                if descend_el2 {
                    init_el2(cpu, config, &mut steps)?;
                }
                init_el1(cpu, config, features, &mut steps)?;
                let level = if descend_el2 {
                    ExceptionLevel::El2
                } else {
                    ExceptionLevel::El1
                };
                ProcessMode::new(
                    World::NonSecure,
                    PrivilegeClass::User(level),
                    config.secure_el2,
                )?
            }
        }
        FirmwareLevel::El2 => {
            if !features.el2_implemented {
                return Err(FatalError::LevelNotImplemented(ExceptionLevel::El2));
            }
            set_state(cpu, InitState::El2Init);
            bind(cpu, pool, World::NonSecure, ExceptionLevel::El2, &mut steps)?;
            if config.stay_resident {
                ProcessMode::new(
                    World::NonSecure,
                    PrivilegeClass::Kernel(ExceptionLevel::El2),
                    config.secure_el2,
                )?
            } else {
                init_el2(cpu, config, &mut steps)?;
                init_el1(cpu, config, features, &mut steps)?;
                ProcessMode::new(
                    World::NonSecure,
                    PrivilegeClass::User(ExceptionLevel::El1),
                    config.secure_el2,
                )?
            }
        }
        FirmwareLevel::El1 => {
            set_state(cpu, InitState::El1Init);
            bind(cpu, pool, World::NonSecure, ExceptionLevel::El1, &mut steps)?;
            let class = if config.stay_resident {
                PrivilegeClass::Kernel(ExceptionLevel::El1)
            } else {
                init_el1(cpu, config, features, &mut steps)?;
                PrivilegeClass::User(ExceptionLevel::El0)
            };
            ProcessMode::new(World::NonSecure, class, config.secure_el2)?
        }
    };

    let spsr = entry_spsr(mode.class(), config.entry_width);
    process.assign(mode, spsr)?;
    bound_context(cpu, mode.world(), RegisterSet::El3)?.seed_entry(process.entry_point(), spsr);
    cpu.set_current_process(core::ptr::from_ref(process) as usize);

    for world in World::ALL {
        cpu.flush_field(RecordField::WorldContext(world));
    }
    cpu.flush_field(RecordField::CurrentProcess);
    set_state(cpu, InitState::Done);
    info!(
        "Core {} will enter {:?} {:?} at {:#x}",
        cpu.core_index(),
        mode.world(),
        mode.class(),
        process.entry_point().pc
    );

    Ok(InitReport {
        steps: steps.0,
        mode,
        spsr,
    })
}

fn set_state(cpu: &mut ThisCpu, state: InitState) {
    cpu.set_init_state(state);
}

/// Binds a zeroed context for `world` unless it already has one.
fn bind<const CORE_COUNT: usize>(
    cpu: &mut ThisCpu,
    pool: &'static ContextPool<CORE_COUNT>,
    world: World,
    level: ExceptionLevel,
    steps: &mut Steps,
) -> Result<(), FatalError> {
    if cpu.current_world_context(world).is_some() {
        return Ok(());
    }
    let context = pool.take(cpu.core_index(), world)?;
    cpu.bind_world_context(world, context);
    steps.push(InitStep::Bound { world, level });
    Ok(())
}

fn bound_context(
    cpu: &mut ThisCpu,
    world: World,
    registers: RegisterSet,
) -> Result<&mut WorldContext, FatalError> {
    cpu.current_world_context_mut(world)
        .ok_or(FatalError::NoContextBound(world, registers))
}

/// Returns the value of SCR_EL3 while `world` is running.
fn scr_el3_for(config: &PlatformConfig, features: &CpuFeatures, world: World) -> ScrEl3 {
    // TWE, TWI and SMD stay clear so WFE, WFI and SMC aren't trapped.
    let mut scr_el3 = (ScrEl3::RES1 | ScrEl3::EA | ScrEl3::SIF)
        - ScrEl3::from_bits_retain(SCR_EL3_TWE | SCR_EL3_TWI | SCR_EL3_SMD);
    if config.entry_width == ExecutionWidth::AArch64 {
        scr_el3 |= ScrEl3::RW;
    }
    let next_level_is_el2 = match world {
        World::Secure => {
            scr_el3 |= ScrEl3::ST;
            if config.secure_el2 && features.secure_el2_implemented {
                scr_el3 |= ScrEl3::EEL2;
                true
            } else {
                false
            }
        }
        World::NonSecure => {
            scr_el3 |= ScrEl3::NS;
            if !config.pauth_regs {
                // Without switched keys only the Non-Secure world may use pointer authentication,
                // or the Secure keys would be left in the registers for it.
                scr_el3 |= ScrEl3::from_bits_retain(SCR_EL3_API | SCR_EL3_APK);
            }
            config.el2_present && features.el2_implemented
        }
    };
    if next_level_is_el2 {
        scr_el3 |= ScrEl3::HCE;
    }
    config.routing.apply(&mut scr_el3, world);
    if config.mte_regs {
        scr_el3 |= ScrEl3::ATA;
    }
    scr_el3
}

/// Programs the EL3 baselines for `world` and records them in its context.
///
/// Returns the value SCR_EL3 must have while the world runs.
fn program_el3(
    cpu: &mut ThisCpu,
    config: &PlatformConfig,
    features: &CpuFeatures,
    world: World,
) -> Result<ScrEl3, FatalError> {
    let scr_el3 = scr_el3_for(config, features, world);
    // SPME, TDOSA, TDA, TPM, NSTB, NSTBE and TTRF stay clear.
    let mdcr_el3 = MdcrEl3::from_bits_retain(MDCR_EL3_SDD | MDCR_EL3_SPD32_DISABLED)
        | MdcrEl3::SCCD
        | MdcrEl3::MCCD;
    // The counters are 64 bits wide and don't count while counting is prohibited. X and D are
    // cleared, and the read-only fields are kept.
    let mut pmcr_el0 = read_pmcr_el0();
    pmcr_el0 |= Pmcr::from_bits_retain(PMCR_EL0_LP | PMCR_EL0_LC) | Pmcr::DP;
    pmcr_el0 -= Pmcr::X | Pmcr::from_bits_retain(PMCR_EL0_D);
    // TCPAC, TTA and TFP stay clear.
    let cptr_el3 = CptrEl3::empty();

    write_cptr_el3(cptr_el3);
    write_pmcr_el0(pmcr_el0);

    let context = bound_context(cpu, world, RegisterSet::El3)?;
    context.el3_state.scr_el3 = scr_el3;
    context.el3_state.mdcr_el3 = mdcr_el3;
    context.el3_state.pmcr_el0 = pmcr_el0;
    context.el3_state.cptr_el3 = cptr_el3;
    Ok(scr_el3)
}

/// Programs the Non-Secure EL2 baselines and saves them into the Non-Secure context.
fn init_el2(
    cpu: &mut ThisCpu,
    config: &PlatformConfig,
    steps: &mut Steps,
) -> Result<(), FatalError> {
    set_state(cpu, InitState::El2Init);

    // TWE, TWI and HCD stay clear.
    let mut hcr_el2 = HCR_EL2_API | HCR_EL2_APK | HCR_EL2_TEA;
    if config.entry_width == ExecutionWidth::AArch64 {
        hcr_el2 |= HCR_EL2_RW;
    }
    write_hcr_el2(HcrEl2::from_bits_retain(hcr_el2));
    let counters = (read_pmcr_el0().bits() >> PMCR_EL0_N_SHIFT) & PMCR_EL0_N_MASK;
    write_mdcr_el2(MDCR_EL2_HLP | MDCR_EL2_HPMD | counters);
    write_cptr_el2(CPTR_EL2_RES1);
    write_cnthctl_el2(CNTHCTL_EL2_EL1PCEN | CNTHCTL_EL2_EL1PCTEN);
    write_cntvoff_el2(0);
    write_vpidr_el2(read_midr_el1().bits());
    write_vmpidr_el2(read_mpidr_el1().bits());
    write_vttbr_el2(0);
    write_hstr_el2(0);
    write_icc_sre_el2(IccSre::DIB | IccSre::DFB | IccSre::EN | IccSre::SRE);
    steps.push(InitStep::Programmed {
        world: World::NonSecure,
        level: ExceptionLevel::El2,
    });

    if config.el2_regs {
        bound_context(cpu, World::NonSecure, RegisterSet::El2)?
            .el2_sysregs
            .save();
        steps.push(InitStep::Saved {
            world: World::NonSecure,
            level: ExceptionLevel::El2,
        });
    }
    Ok(())
}

/// Prepares the Non-Secure EL1 registers and saves them into the Non-Secure context.
fn init_el1(
    cpu: &mut ThisCpu,
    config: &PlatformConfig,
    features: &CpuFeatures,
    steps: &mut Steps,
) -> Result<(), FatalError> {
    if !features.el1_implemented {
        return Err(FatalError::LevelNotImplemented(ExceptionLevel::El1));
    }
    set_state(cpu, InitState::El1Init);

    let program_sctlr_el2 =
        features.el2_implemented && config.highest_level == FirmwareLevel::El3;
    if program_sctlr_el2 {
        write_sctlr_el2(SctlrEl2::from_bits_retain(SCTLR_EL2_RES1));
        steps.push(InitStep::Programmed {
            world: World::NonSecure,
            level: ExceptionLevel::El1,
        });
    }

    let context = bound_context(cpu, World::NonSecure, RegisterSet::El1)?;
    if program_sctlr_el2 {
        context.el2_sysregs.sctlr_el2 = SctlrEl2::from_bits_retain(SCTLR_EL2_RES1);
    }
    context.el1_sysregs.save();
    // The next image starts little-endian with its MMU off.
    context.el1_sysregs.sctlr_el1 = SctlrEl1::RES1;
    steps.push(InitStep::Saved {
        world: World::NonSecure,
        level: ExceptionLevel::El1,
    });
    Ok(())
}

/// Returns the status a process of the given class observes on its first entry, with all
/// exceptions masked.
fn entry_spsr(class: PrivilegeClass, width: ExecutionWidth) -> Spsr {
    let level = class.level();
    match width {
        ExecutionWidth::AArch64 => {
            let mode = match level {
                ExceptionLevel::El0 => Spsr::empty(),
                level => Spsr::from_bits_retain(((level as u64) << 2) | 1),
            };
            mode | Spsr::D | Spsr::A | Spsr::I | Spsr::F
        }
        ExecutionWidth::AArch32 => {
            let mode = match level {
                ExceptionLevel::El0 => SPSR_AARCH32_USR,
                ExceptionLevel::El1 => SPSR_AARCH32_SVC,
                ExceptionLevel::El2 => SPSR_AARCH32_HYP,
                ExceptionLevel::El3 => SPSR_AARCH32_MON,
            };
            Spsr::from_bits_retain(mode) | Spsr::A | Spsr::I | Spsr::F
        }
    }
}
