// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Build script for the world context firmware image.

mod platforms;

use platforms::{Builder, PLATFORMS, add_linker_script, define_linker_symbol, get_builder};
use std::{env, path::Path};

fn setup_linker(builder: &dyn Builder) {
    define_linker_symbol("IMAGE_BASE", builder.image_base());
    define_linker_symbol("IMAGE_SIZE", builder.image_size());
    add_linker_script(Path::new("image.ld"));
}

fn main() {
    println!(
        "cargo::rustc-check-cfg=cfg(platform, values(\"{}\"))",
        PLATFORMS.join("\", \""),
    );

    if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("none") {
        let platform = env::var("CARGO_CFG_PLATFORM").expect("Missing platform name");

        let platform_builder = get_builder(&platform).unwrap();
        setup_linker(&*platform_builder);
    }
}
