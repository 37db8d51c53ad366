// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

use crate::platform::{Platform, PlatformImpl};

/// The number of bytes of stack space to reserve for each core.
const STACK_SIZE: usize = 0x2000;

const _: () = assert!(
    STACK_SIZE.is_multiple_of(PlatformImpl::CACHE_WRITEBACK_GRANULE),
    "Stack size not correctly aligned"
);

/// Returns the initial stack pointer of the given core.
pub fn stack_top(core_index: usize) -> usize {
    stacks_base() + (core_index + 1) * STACK_SIZE
}

#[cfg(all(target_arch = "aarch64", not(test)))]
fn stacks_base() -> usize {
    unsafe extern "C" {
        static platform_normal_stacks: u8;
    }

    // SAFETY: Only the address of the symbol is taken, the memory behind it isn't accessed.
    unsafe { &raw const platform_normal_stacks as usize }
}

#[cfg(not(all(target_arch = "aarch64", not(test))))]
fn stacks_base() -> usize {
    0
}

#[cfg(all(target_arch = "aarch64", not(test)))]
mod asm {
    use super::*;
    use core::arch::global_asm;

    global_asm!(
        // Initialises the stack pointer for the current CPU. Clobbers x0, x1, x2 and x9.
        ".global	plat_set_my_stack",
        ".type	plat_set_my_stack, %function",
        "plat_set_my_stack:",
            "mov	x9, x30",
            "mrs	x0, mpidr_el1",
            "bl	{core_position}",
            "adrp	x2, (platform_normal_stacks + {STACK_SIZE})",
            "add	x2, x2, :lo12:(platform_normal_stacks + {STACK_SIZE})",
            "mov	x1, #{STACK_SIZE}",
            "madd	x0, x0, x1, x2",
            "mov	sp, x0",
            "ret	x9",

        ".section    .tzfw_normal_stacks, \"aw\", %nobits",
        ".balign {CACHE_WRITEBACK_GRANULE}",
        ".global platform_normal_stacks",
        "platform_normal_stacks:",
        ".space (({PLATFORM_CORE_COUNT}) * ({STACK_SIZE})), 0",

        STACK_SIZE = const STACK_SIZE,
        PLATFORM_CORE_COUNT = const PlatformImpl::CORE_COUNT,
        CACHE_WRITEBACK_GRANULE = const PlatformImpl::CACHE_WRITEBACK_GRANULE,
        core_position = sym PlatformImpl::core_position,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stacks_grow_down_from_the_end_of_each_slot() {
        assert_eq!(stack_top(0) - stacks_base(), STACK_SIZE);
        assert_eq!(stack_top(3) - stack_top(2), STACK_SIZE);
    }
}
