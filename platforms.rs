// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

mod qemu;

use qemu::QemuBuilder;
use std::{error::Error, path::Path};

pub const PLATFORMS: [&str; 1] = [QemuBuilder::PLAT_NAME];

pub trait Builder {
    /// Base address of the firmware image.
    ///
    /// This is passed to the linker script through the `IMAGE_BASE` symbol.
    fn image_base(&self) -> u64;

    /// Size of the firmware image.
    ///
    /// This is passed to the linker script through the `IMAGE_SIZE` symbol.
    fn image_size(&self) -> u64;
}

pub fn get_builder(platform: &str) -> Result<Box<dyn Builder>, Box<dyn Error>> {
    match platform {
        QemuBuilder::PLAT_NAME => Ok(Box::new(QemuBuilder)),
        _ => Err(format!(
            "Unexpected platform name {platform:?}. Supported platforms: {PLATFORMS:?}"
        )
        .into()),
    }
}

pub fn add_linker_script(path: &Path) {
    println!("cargo:rustc-link-arg=-T{}", path.display());
    println!("cargo:rerun-if-changed={}", path.display());
}

pub fn define_linker_symbol(name: &str, value: u64) {
    println!("cargo:rustc-link-arg=--defsym=\"{name}\"={value}");
}
