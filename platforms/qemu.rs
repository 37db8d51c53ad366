// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

use super::Builder;

pub struct QemuBuilder;

impl QemuBuilder {
    pub const PLAT_NAME: &str = "qemu";

    const IMAGE_BASE: u64 = 0x0e09_0000;
    const IMAGE_SIZE: u64 = 0x6_0000;
}

impl Builder for QemuBuilder {
    fn image_base(&self) -> u64 {
        Self::IMAGE_BASE
    }

    fn image_size(&self) -> u64 {
        Self::IMAGE_SIZE
    }
}
