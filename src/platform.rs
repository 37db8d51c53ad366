// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

macro_rules! select_platform {
    (platform = $condition:literal, $mod:ident::$plat_impl:ident) => {
        #[cfg(all(platform = $condition, not(test)))]
        mod $mod;

        #[cfg(all(platform = $condition, not(test)))]
        pub use $mod::$plat_impl as PlatformImpl;
    };
    (test, $mod:ident::$plat_impl:ident) => {
        #[cfg(test)]
        mod $mod;

        #[cfg(test)]
        pub use $mod::$plat_impl as PlatformImpl;
    };
}

select_platform!(platform = "qemu", qemu::Qemu);
select_platform!(test, test::TestPlatform);

use crate::{config::PlatformConfig, context::EntryPointInfo, logger::LogSink};

/// Type alias for convenience, to avoid having to use the complicated type name everywhere.
pub type LogSinkImpl = <PlatformImpl as Platform>::LogSinkImpl;

/// The hooks implemented by all platforms.
///
/// # Safety
///
/// `core_position` must never return the same index for two different valid MPIDR values, and
/// must never return a value greater than or equal to `CORE_COUNT`.
pub unsafe trait Platform {
    /// The number of CPU cores.
    const CORE_COUNT: usize;

    /// The size in bytes of the largest cache line across all the cache levels in the platform.
    const CACHE_WRITEBACK_GRANULE: usize;

    /// Which exception levels and features the firmware manages.
    const CONFIG: PlatformConfig;

    /// The number of interrupt priority bits used for arbitrating exceptions, between 1 and 5.
    const PRIORITY_BITS: u8;

    /// The interrupt priority levels which exception handlers may be registered for.
    const PRIORITY_LEVELS: &'static [u8];

    /// Platform dependent LogSink implementation type for Logger.
    type LogSinkImpl: LogSink;

    /// Initialises the logger and anything else the platform needs before the world contexts are
    /// set up.
    ///
    /// Any logs sent before this is called will be ignored.
    fn init_before_logging();

    /// Returns the entry point for the secure world, i.e. BL32.
    fn secure_entry_point() -> EntryPointInfo;

    /// Returns the entry point for the non-secure world, i.e. BL33.
    fn non_secure_entry_point() -> EntryPointInfo;

    /// Given a valid MPIDR value, returns the corresponding linear core index.
    ///
    /// For an invalid MPIDR value no guarantees are made about the return value.
    extern "C" fn core_position(mpidr: u64) -> usize;

    /// Stops the calling core for good.
    fn halt() -> !;
}
