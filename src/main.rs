// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! RF-A world context: per-CPU context management for TrustZone firmware on AArch64.

#![cfg_attr(not(test), no_main)]
#![cfg_attr(not(test), no_std)]

mod aarch64;
mod config;
mod context;
mod debug;
mod el_init;
mod error;
mod logger;
mod percpu;
mod platform;
mod priority;
mod process;
mod save_restore;
mod stacks;

use crate::{
    config::FirmwareLevel,
    context::{ContextPool, WorldContext},
    el_init::{CpuFeatures, run_el_initialization_protocol},
    error::{FatalError, RegisterSet},
    percpu::{CoresImpl, CpuDirectory, RecordField},
    platform::{Platform, PlatformImpl},
    priority::freeze_priority_table,
    process::{ProcessDescriptor, ProcessKind},
};
use arm_sysregs::ExceptionLevel;
use log::{error, info};
use percore::Cores;
use spin::Once;

/// The core which does the firmware wide set-up.
const PRIMARY_CORE: usize = 0;

/// Completed by the primary core once the firmware wide set-up is done.
#[cfg_attr(test, allow(unused))]
static FIRMWARE_INIT: Once = Once::new();

#[cfg_attr(test, allow(unused))]
static CPU_DIRECTORY: CpuDirectory<{ PlatformImpl::CORE_COUNT }> = CpuDirectory::new();
#[cfg_attr(test, allow(unused))]
static CONTEXT_POOL: ContextPool<{ PlatformImpl::CORE_COUNT }> = ContextPool::new();

/// Brings up the calling core and leaves the firmware for the next image. Called from the image
/// entrypoint once the core has a stack.
#[cfg_attr(test, allow(unused))]
extern "C" fn cold_boot_main() -> ! {
    let core_index = CoresImpl::core_index();
    init_firmware(&FIRMWARE_INIT, core_index, || {
        PlatformImpl::init_before_logging();
        info!("World context firmware starting");
        freeze_priority_table();
    });

    let mut cpu = match CPU_DIRECTORY.install_core_identity(core_index, stacks::stack_top(core_index))
    {
        Ok(cpu) => cpu,
        Err(e) => {
            error!("{e}");
            PlatformImpl::halt();
        }
    };

    let config = PlatformImpl::CONFIG;
    let features = CpuFeatures::read();
    info!("Core {core_index}: {features:?}");

    let (kind, entry_point) = if config.stay_resident {
        let entry_point = if config.highest_level == FirmwareLevel::El3 {
            PlatformImpl::secure_entry_point()
        } else {
            PlatformImpl::non_secure_entry_point()
        };
        (ProcessKind::Kernel, entry_point)
    } else {
        (
            ProcessKind::User {
                stack_top: 0,
                address_space: 0,
            },
            PlatformImpl::non_secure_entry_point(),
        )
    };
    // This function never returns, so the descriptor outlives the record's reference to it.
    let mut process = ProcessDescriptor::new(kind, entry_point);

    let result =
        run_el_initialization_protocol(&mut cpu, &config, &features, &CONTEXT_POOL, &mut process);
    let report = cpu.or_halt(result);
    let world = report.mode.world();

    if cpu.level() == ExceptionLevel::El3 && report.mode.class().level() != ExceptionLevel::El3 {
        let result = cpu.restore_el1_state(world);
        cpu.or_halt(result);
        if config.el2_regs && features.el2_implemented {
            let result = cpu.restore_el2_state(world);
            cpu.or_halt(result);
        }
    }
    cpu.flush_field(RecordField::StackPointer);

    info!(
        "Entering {:?} {:?} at {:#x}",
        world,
        report.mode.class(),
        process.entry_point().pc
    );
    let context = cpu.current_world_context(world).map(core::ptr::from_ref);
    let Some(context) = context else {
        cpu.halt_with(FatalError::NoContextBound(world, RegisterSet::None));
    };
    // SAFETY: The context was filled in by the initialization protocol for this world and is only
    // ever used by this core.
    unsafe { exit_to(cpu.level(), &*context) }
}

/// Runs `init` on the primary core, unless it has already run. Every other core waits until the
/// primary core has finished it.
fn init_firmware(done: &Once, core_index: usize, init: impl FnOnce()) {
    if core_index == PRIMARY_CORE {
        done.call_once(init);
    } else {
        done.wait();
    }
}

/// Restores the general purpose registers from `context` and returns from the firmware's own
/// exception level into it.
///
/// # Safety
///
/// The system registers of the level being entered must already be restored.
#[cfg(all(target_arch = "aarch64", not(test)))]
unsafe fn exit_to(level: ExceptionLevel, context: &WorldContext) -> ! {
    // SAFETY: Our caller guarantees that the lower levels are ready to be entered.
    unsafe {
        match level {
            ExceptionLevel::El3 => {
                asm::restore_el3_controls(context);
                asm::el3_exit(context)
            }
            ExceptionLevel::El2 => asm::el2_exit(context),
            ExceptionLevel::El1 | ExceptionLevel::El0 => asm::el1_exit(context),
        }
    }
}

#[cfg(not(all(target_arch = "aarch64", not(test))))]
#[cfg_attr(test, allow(unused))]
unsafe fn exit_to(_level: ExceptionLevel, _context: &WorldContext) -> ! {
    PlatformImpl::halt()
}

#[cfg(all(target_arch = "aarch64", not(test)))]
mod asm {
    use super::*;
    use crate::context::El3State;
    use core::{arch::asm, mem::offset_of};

    /// The cold boot entrypoint of every core.
    ///
    /// Zeroes the BSS on core 0, sets up the core's stack and jumps to Rust.
    #[unsafe(naked)]
    #[unsafe(no_mangle)]
    #[unsafe(link_section = ".text.entrypoint")]
    unsafe extern "C" fn image_entrypoint() -> ! {
        naked_asm!(
            "mrs	x0, mpidr_el1",
            "bl	{core_position}",
            "cbnz	x0, 2f",
            "adrp	x0, __BSS_START__",
            "add	x0, x0, :lo12:__BSS_START__",
            "adrp	x1, __BSS_END__",
            "add	x1, x1, :lo12:__BSS_END__",
            "1:",
            "cmp	x0, x1",
            "b.hs	2f",
            "str	xzr, [x0], #8",
            "b	1b",
            "2:",
            "dsb	sy",
            "bl	plat_set_my_stack",
            "b	{cold_boot_main}",
            core_position = sym PlatformImpl::core_position,
            cold_boot_main = sym cold_boot_main,
        );
    }

    /// Writes the SCR_EL3 and MDCR_EL3 values the world runs with.
    pub(super) fn restore_el3_controls(context: &WorldContext) {
        let el3_state = &context.el3_state;
        // SAFETY: The values were computed for the world about to be entered, and only affect
        // execution below EL3.
        unsafe {
            asm!(
                "msr	scr_el3, {scr}",
                "msr	mdcr_el3, {mdcr}",
                "isb",
                scr = in(reg) el3_state.scr_el3.bits(),
                mdcr = in(reg) el3_state.mdcr_el3.bits(),
                options(nostack),
            );
        }
    }

    /// Generates a function which loads every general purpose register from a [`WorldContext`] and
    /// returns through the given ELR and SPSR registers.
    macro_rules! world_exit {
        ($name:ident, $elr:literal, $spsr:literal) => {
            #[unsafe(naked)]
            pub(super) unsafe extern "C" fn $name(context: &WorldContext) -> ! {
                naked_asm!(
                    "mov	x30, x0",
                    "ldr	x1, [x30, #{ELR}]",
                    concat!("msr	", $elr, ", x1"),
                    "ldr	x1, [x30, #{SPSR}]",
                    concat!("msr	", $spsr, ", x1"),
                    "ldr	x1, [x30, #{SP_EL0}]",
                    "msr	sp_el0, x1",
                    "ldp	x0, x1, [x30, #0]",
                    "ldp	x2, x3, [x30, #16]",
                    "ldp	x4, x5, [x30, #32]",
                    "ldp	x6, x7, [x30, #48]",
                    "ldp	x8, x9, [x30, #64]",
                    "ldp	x10, x11, [x30, #80]",
                    "ldp	x12, x13, [x30, #96]",
                    "ldp	x14, x15, [x30, #112]",
                    "ldp	x16, x17, [x30, #128]",
                    "ldp	x18, x19, [x30, #144]",
                    "ldp	x20, x21, [x30, #160]",
                    "ldp	x22, x23, [x30, #176]",
                    "ldp	x24, x25, [x30, #192]",
                    "ldp	x26, x27, [x30, #208]",
                    "ldp	x28, x29, [x30, #224]",
                    "ldr	x30, [x30, #240]",
                    "eret",
                    ELR = const offset_of!(WorldContext, el3_state) + offset_of!(El3State, elr_el3),
                    SPSR = const offset_of!(WorldContext, el3_state) + offset_of!(El3State, spsr_el3),
                    SP_EL0 = const offset_of!(WorldContext, gpregs) + 31 * 8,
                );
            }
        };
    }

    world_exit!(el3_exit, "elr_el3", "spsr_el3");
    world_exit!(el2_exit, "elr_el2", "spsr_el2");
    world_exit!(el1_exit, "elr_el1", "spsr_el1");

    /// This macro wraps a naked_asm block with `bti`, or any other universal
    /// prologue we'd still like added.
    ///
    /// Use this over `core::arch::naked_asm` by default, otherwise you may
    /// need to ensure that e.g. `bti` landing pads are in place yourself.
    macro_rules! naked_asm {
        ($($inner:tt)*) => {
           ::core::arch::naked_asm!("bti c", $($inner)*)
        }
    }
    pub(crate) use naked_asm;
}

#[cfg(all(target_arch = "aarch64", not(test)))]
pub(crate) use asm::naked_asm;
