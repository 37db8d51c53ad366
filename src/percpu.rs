// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The per-CPU data directory.
//!
//! There is one [`PerCpuRecord`] for each core, in a fixed array. A core claims its own record once
//! at power on, getting back a [`ThisCpu`] handle. The handle can't be copied or sent to another
//! core, so only the owning core can ever write to its record.

use crate::{
    aarch64::{CacheOp, dcache_range, read_thread_pointer, write_thread_pointer},
    context::{PerWorld, World, WorldContext},
    el_init::InitState,
    error::FatalError,
    platform::{Platform, PlatformImpl},
    priority::PriorityState,
};
use arm_sysregs::{ExceptionLevel, read_mpidr_el1};
use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    mem::{offset_of, size_of_val},
    sync::atomic::{AtomicBool, Ordering},
};
use log::{debug, error};
use percore::Cores;

/// The number of registers which can be saved in the crash buffer.
const CPU_DATA_CRASH_BUF_COUNT: usize = 8;

/// Marks a crash buffer as holding a diagnostic.
const CRASH_MAGIC: u64 = 0x4352_4153_485f_4631;

/// The diagnostic a core leaves behind when it halts.
pub type CrashBuf = [u64; CPU_DATA_CRASH_BUF_COUNT];

/// Implementation of the `Cores` trait to get the index of the current CPU core.
pub struct CoresImpl;

// SAFETY: This implementation never returns the same index for different cores because
// `core_position` is guaranteed not to.
unsafe impl Cores for CoresImpl {
    fn core_index() -> usize {
        PlatformImpl::core_position(read_mpidr_el1().bits())
    }
}

/// Everything the firmware keeps about one core.
#[derive(Debug)]
#[repr(C, align(64))]
pub struct PerCpuRecord {
    world_context: PerWorld<Option<&'static mut WorldContext>>,
    stack_pointer: usize,
    current_process: usize,
    cpu_ops_handle: usize,
    crash_buf: CrashBuf,
    crash_recorded: bool,
    priority_state: PriorityState,
    init_state: Option<InitState>,
    /// Whether the EL2 registers are part of the world contexts.
    el2_regs: bool,
    core_index: usize,
}

const _: () = assert!(size_of::<PerCpuRecord>() % align_of::<PerCpuRecord>() == 0);
const _: () = assert!(align_of::<PerCpuRecord>() % PlatformImpl::CACHE_WRITEBACK_GRANULE == 0);

impl PerCpuRecord {
    const EMPTY: Self = Self {
        world_context: PerWorld::new([None, None]),
        stack_pointer: 0,
        current_process: 0,
        cpu_ops_handle: 0,
        crash_buf: [0; CPU_DATA_CRASH_BUF_COUNT],
        crash_recorded: false,
        priority_state: PriorityState::EMPTY,
        init_state: None,
        el2_regs: false,
        core_index: 0,
    };

    /// Returns the address and size of one field.
    fn field_range(&self, field: RecordField) -> (usize, usize) {
        fn range<T>(value: &T) -> (usize, usize) {
            (value as *const T as usize, size_of_val(value))
        }

        match field {
            RecordField::WorldContext(world) => range(&self.world_context[world]),
            RecordField::StackPointer => range(&self.stack_pointer),
            RecordField::CurrentProcess => range(&self.current_process),
            RecordField::CpuOpsHandle => range(&self.cpu_ops_handle),
            RecordField::CrashBuffer => range(&self.crash_buf),
            RecordField::PriorityState => range(&self.priority_state),
        }
    }

    /// Returns the world context pointer of the given world, without dereferencing it.
    pub fn world_context_address(&self, world: World) -> Option<usize> {
        self.world_context[world]
            .as_deref()
            .map(|context| context as *const WorldContext as usize)
    }

    /// Returns the top of this core's stack.
    pub fn stack_pointer(&self) -> usize {
        self.stack_pointer
    }

    /// Returns the handle of the process bound to this core.
    pub fn current_process(&self) -> usize {
        self.current_process
    }

    /// Returns the handle of this core's CPU operations.
    pub fn cpu_ops_handle(&self) -> usize {
        self.cpu_ops_handle
    }

    /// Returns the crash buffer.
    pub fn crash_buffer(&self) -> &CrashBuf {
        &self.crash_buf
    }

    /// Returns the priority state.
    pub fn priority_state(&self) -> &PriorityState {
        &self.priority_state
    }
}

/// The fields of a [`PerCpuRecord`] which can be cleaned or invalidated individually.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordField {
    /// The world context pointer of one world.
    WorldContext(World),
    /// The stack pointer.
    StackPointer,
    /// The current process handle.
    CurrentProcess,
    /// The CPU operations handle.
    CpuOpsHandle,
    /// The crash buffer.
    CrashBuffer,
    /// The priority state.
    PriorityState,
}

struct CpuSlot {
    claimed: AtomicBool,
    record: UnsafeCell<PerCpuRecord>,
}

impl CpuSlot {
    const EMPTY: Self = Self {
        claimed: AtomicBool::new(false),
        record: UnsafeCell::new(PerCpuRecord::EMPTY),
    };
}

// SAFETY: The record is only written through the single `ThisCpu` created when `claimed` is set.
// Other cores only read it through the unsafe `record_for`, whose caller must ensure the owner is
// halted.
unsafe impl Sync for CpuSlot {}

/// One record per core.
pub struct CpuDirectory<const CORE_COUNT: usize> {
    slots: [CpuSlot; CORE_COUNT],
}

impl<const CORE_COUNT: usize> CpuDirectory<CORE_COUNT> {
    /// Creates a directory of empty records.
    pub const fn new() -> Self {
        Self {
            slots: [const { CpuSlot::EMPTY }; CORE_COUNT],
        }
    }

    /// Claims the record of the calling core.
    ///
    /// This stores the record's address in the core-private thread pointer register of the level
    /// the firmware runs at, and the top of the core's stack in the record. It must be called once
    /// by each core during power on, before any other per-core state is used.
    pub fn install_core_identity(
        &'static self,
        core_index: usize,
        stack_top: usize,
    ) -> Result<ThisCpu, FatalError> {
        let slot = self
            .slots
            .get(core_index)
            .ok_or(FatalError::CoreIndexOutOfRange(core_index))?;
        if slot.claimed.swap(true, Ordering::AcqRel) {
            return Err(FatalError::CoreAlreadyClaimed(core_index));
        }
        // SAFETY: `claimed` was false, so this is the only reference to the record there will ever
        // be.
        let record = unsafe { &mut *slot.record.get() };
        record.core_index = core_index;
        record.stack_pointer = stack_top;
        record.el2_regs = PlatformImpl::CONFIG.el2_regs;

        let level = PlatformImpl::CONFIG.highest_level.exception_level();
        write_thread_pointer(level, record as *mut PerCpuRecord as u64);
        debug!("Core {core_index} claimed its per-CPU record");

        Ok(ThisCpu {
            record,
            level,
            _not_send: PhantomData,
        })
    }

    /// Finds the calling core's record again from the thread pointer written when it was claimed.
    ///
    /// This is for code which is entered afresh on an exception and so can't be passed the handle.
    /// Returns `None` if the calling core hasn't claimed a record in this directory.
    ///
    /// # Safety
    ///
    /// No other [`ThisCpu`] for the calling core may be in use until the returned one is dropped.
    pub unsafe fn current_record(&'static self) -> Option<ThisCpu> {
        let level = PlatformImpl::CONFIG.highest_level.exception_level();
        let address = usize::try_from(read_thread_pointer(level)).ok()?;
        let first = self.slots.as_ptr() as usize + offset_of!(CpuSlot, record);
        let offset = address.checked_sub(first)?;
        if offset % size_of::<CpuSlot>() != 0 {
            return None;
        }
        let slot = self.slots.get(offset / size_of::<CpuSlot>())?;
        if !slot.claimed.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: The slot was claimed by this core, and our caller guarantees that its handle
        // isn't in use.
        let record = unsafe { &mut *slot.record.get() };
        Some(ThisCpu {
            record,
            level,
            _not_send: PhantomData,
        })
    }

    /// Returns the record of any core, for crash diagnostics.
    ///
    /// # Safety
    ///
    /// The core owning the record must be halted, or must not have claimed its record yet.
    pub unsafe fn record_for(&self, core_index: usize) -> Option<&PerCpuRecord> {
        let slot = self.slots.get(core_index)?;
        // SAFETY: Our caller guarantees that the owner isn't writing to the record.
        Some(unsafe { &*slot.record.get() })
    }

    /// Invalidates one field of another core's record from the data cache, so that what that core
    /// cleaned is observed.
    ///
    /// # Safety
    ///
    /// Same as [`Self::record_for`].
    pub unsafe fn invalidate_field(
        &self,
        core_index: usize,
        field: RecordField,
    ) -> Result<(), FatalError> {
        // SAFETY: Our caller upholds the requirements of `record_for`.
        let record = unsafe { self.record_for(core_index) }
            .ok_or(FatalError::CoreIndexOutOfRange(core_index))?;
        let (start, size) = record.field_range(field);
        dcache_range(
            CacheOp::Invalidate,
            start,
            size,
            PlatformImpl::CACHE_WRITEBACK_GRANULE,
        );
        Ok(())
    }
}

/// Exclusive access to the calling core's record.
#[derive(Debug)]
pub struct ThisCpu {
    record: &'static mut PerCpuRecord,
    level: ExceptionLevel,
    _not_send: PhantomData<*mut ()>,
}

impl ThisCpu {
    /// Returns the linear index of this core.
    pub fn core_index(&self) -> usize {
        self.record.core_index
    }

    /// Returns the exception level the firmware runs at.
    pub fn level(&self) -> ExceptionLevel {
        self.level
    }

    /// Returns the context bound for the given world, if any has been.
    pub fn current_world_context(&self, world: World) -> Option<&WorldContext> {
        self.record.world_context[world].as_deref()
    }

    /// Returns the context bound for the given world mutably, if any has been.
    pub fn current_world_context_mut(&mut self, world: World) -> Option<&mut WorldContext> {
        self.record.world_context[world].as_deref_mut()
    }

    /// Binds a context for the given world, unless one is already bound.
    ///
    /// Returns whether `context` was bound.
    pub fn bind_world_context(&mut self, world: World, context: &'static mut WorldContext) -> bool {
        let slot = &mut self.record.world_context[world];
        if slot.is_some() {
            return false;
        }
        debug!(
            "Binding {world:?} context at {:#x}",
            core::ptr::from_ref(context) as usize
        );
        *slot = Some(context);
        true
    }

    /// Unbinds the context of the given world and returns it.
    pub fn reset_world_context(&mut self, world: World) -> Option<&'static mut WorldContext> {
        self.record.world_context[world].take()
    }

    /// Returns the top of this core's stack.
    pub fn stack_pointer(&self) -> usize {
        self.record.stack_pointer
    }

    /// Returns the handle of the process bound to this core.
    pub fn current_process(&self) -> usize {
        self.record.current_process
    }

    /// Sets the handle of the process bound to this core.
    pub fn set_current_process(&mut self, process: usize) {
        self.record.current_process = process;
    }

    /// Returns the handle of this core's CPU operations.
    pub fn cpu_ops_handle(&self) -> usize {
        self.record.cpu_ops_handle
    }

    /// Sets the handle of this core's CPU operations.
    pub fn set_cpu_ops_handle(&mut self, handle: usize) {
        self.record.cpu_ops_handle = handle;
    }

    /// Returns the crash buffer.
    pub fn crash_buffer(&self) -> &CrashBuf {
        &self.record.crash_buf
    }

    /// Returns the priority state of this core.
    pub fn priority_state(&self) -> &PriorityState {
        &self.record.priority_state
    }

    pub(crate) fn priority_state_mut(&mut self) -> &mut PriorityState {
        &mut self.record.priority_state
    }

    /// Returns how far this core has got through the initialisation protocol.
    pub fn init_state(&self) -> Option<InitState> {
        self.record.init_state
    }

    pub(crate) fn set_init_state(&mut self, state: InitState) {
        self.record.init_state = Some(state);
    }

    /// Returns whether the EL2 registers are saved and restored with the world contexts.
    pub fn el2_regs_switched(&self) -> bool {
        self.record.el2_regs
    }

    /// Sets whether the EL2 registers are saved and restored with the world contexts. The claim
    /// takes this from the platform configuration.
    pub(crate) fn set_el2_regs_switched(&mut self, included: bool) {
        self.record.el2_regs = included;
    }

    /// Cleans one field of the record to memory, so another observer can read it.
    pub fn flush_field(&self, field: RecordField) {
        let (start, size) = self.record.field_range(field);
        dcache_range(
            CacheOp::CleanInvalidate,
            start,
            size,
            PlatformImpl::CACHE_WRITEBACK_GRANULE,
        );
    }

    /// Writes the diagnostic for `error` into the crash buffer, unless one is already there.
    ///
    /// Returns whether the diagnostic was written.
    pub fn record_crash(&mut self, error: &FatalError) -> bool {
        let record = &mut *self.record;
        if record.crash_recorded {
            return false;
        }
        record.crash_recorded = true;
        record.crash_buf = [
            CRASH_MAGIC,
            error.code(),
            self.level as u64,
            error.world().map_or(u64::MAX, |world| world as u64),
            error.register_set() as u64,
            error.detail(),
            record.core_index as u64,
            0,
        ];
        true
    }

    /// Records `error` and halts this core.
    pub fn halt_with(&mut self, error: FatalError) -> ! {
        self.record_crash(&error);
        self.flush_field(RecordField::CrashBuffer);
        error!("Fatal error on core {}: {error}", self.core_index());
        panic!("{error}");
    }

    /// Returns the value of `result`, or halts this core if it is an error.
    pub fn or_halt<T>(&mut self, result: Result<T, FatalError>) -> T {
        match result {
            Ok(value) => value,
            Err(error) => self.halt_with(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{aarch64::fake, error::RegisterSet};
    use std::boxed::Box;

    fn directory() -> &'static CpuDirectory<4> {
        Box::leak(Box::new(CpuDirectory::new()))
    }

    fn context() -> &'static mut WorldContext {
        Box::leak(Box::new(WorldContext::EMPTY))
    }

    #[test]
    fn each_core_claims_once() {
        let directory = directory();
        let cpu = directory.install_core_identity(2, 0x8000).unwrap();
        assert_eq!(cpu.core_index(), 2);
        assert_eq!(cpu.stack_pointer(), 0x8000);
        assert_eq!(
            directory.install_core_identity(2, 0x8000).unwrap_err(),
            FatalError::CoreAlreadyClaimed(2)
        );
        assert_eq!(
            directory.install_core_identity(4, 0).unwrap_err(),
            FatalError::CoreIndexOutOfRange(4)
        );
    }

    #[test]
    fn thread_pointer_holds_record_address() {
        let directory = directory();
        let cpu = directory.install_core_identity(0, 0).unwrap();
        assert_eq!(fake::tpidr_el3(), &raw const *cpu.record as u64);
    }

    #[test]
    fn current_record_follows_thread_pointer() {
        let directory = directory();
        let mut cpu = directory.install_core_identity(1, 0x3000).unwrap();
        cpu.set_current_process(0xabc);
        drop(cpu);

        // SAFETY: The handle returned by the claim has been dropped.
        let cpu = unsafe { directory.current_record() }.unwrap();
        assert_eq!(cpu.core_index(), 1);
        assert_eq!(cpu.stack_pointer(), 0x3000);
        assert_eq!(cpu.current_process(), 0xabc);
    }

    #[test]
    fn current_record_needs_a_claim() {
        let directory = directory();
        // SAFETY: No handle exists.
        assert!(unsafe { directory.current_record() }.is_none());

        // Another directory's record doesn't count.
        let _cpu = self::directory().install_core_identity(0, 0).unwrap();
        // SAFETY: No handle for this directory exists.
        assert!(unsafe { directory.current_record() }.is_none());
    }

    #[test]
    fn bind_then_lookup() {
        let directory = directory();
        let mut cpu = directory.install_core_identity(1, 0).unwrap();
        for world in World::ALL {
            assert!(cpu.current_world_context(world).is_none());
            let context = context();
            let address = &raw const *context;
            assert!(cpu.bind_world_context(world, context));
            assert!(core::ptr::eq(
                cpu.current_world_context(world).unwrap(),
                address
            ));

            // A second bind doesn't replace the first.
            assert!(!cpu.bind_world_context(world, self::context()));
            assert!(core::ptr::eq(
                cpu.current_world_context(world).unwrap(),
                address
            ));
        }
    }

    #[test]
    fn reset_allows_rebinding() {
        let directory = directory();
        let mut cpu = directory.install_core_identity(3, 0).unwrap();
        cpu.bind_world_context(World::Secure, context());
        assert!(cpu.reset_world_context(World::Secure).is_some());
        assert!(cpu.current_world_context(World::Secure).is_none());
        assert!(cpu.bind_world_context(World::Secure, context()));
    }

    #[test]
    fn other_cores_visible_for_diagnostics() {
        let directory = directory();
        let mut cpu = directory.install_core_identity(1, 0x4000).unwrap();
        cpu.set_current_process(0x1234);
        cpu.set_cpu_ops_handle(0x5678);
        // SAFETY: `cpu` isn't used while `record` is alive.
        let record = unsafe { directory.record_for(1) }.unwrap();
        assert_eq!(record.stack_pointer(), 0x4000);
        assert_eq!(record.current_process(), 0x1234);
        assert_eq!(record.cpu_ops_handle(), 0x5678);
        assert_eq!(record.world_context_address(World::NonSecure), None);
        // SAFETY: Nothing uses the record.
        assert!(unsafe { directory.record_for(4) }.is_none());
    }

    #[test]
    fn flush_covers_only_the_field() {
        let directory = directory();
        let cpu = directory.install_core_identity(0, 0).unwrap();
        fake::take_cache_ops();
        cpu.flush_field(RecordField::StackPointer);
        let start = &raw const cpu.record.stack_pointer as usize;
        let line = start & !(PlatformImpl::CACHE_WRITEBACK_GRANULE - 1);
        assert_eq!(
            fake::take_cache_ops(),
            [(
                CacheOp::CleanInvalidate,
                line,
                PlatformImpl::CACHE_WRITEBACK_GRANULE
            )]
        );

        // SAFETY: Nothing writes to the record.
        unsafe {
            directory
                .invalidate_field(0, RecordField::CrashBuffer)
                .unwrap();
        }
        let ops = fake::take_cache_ops();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].0, CacheOp::Invalidate);
        assert!(ops[0].2 >= size_of::<CrashBuf>());
    }

    #[test]
    fn crash_buffer_written_once() {
        let directory = directory();
        let mut cpu = directory.install_core_identity(2, 0).unwrap();
        let error = FatalError::NoContextBound(World::NonSecure, RegisterSet::El2);
        assert!(cpu.record_crash(&error));
        assert_eq!(
            cpu.crash_buffer(),
            &[CRASH_MAGIC, 0x21, 3, 1, 2, 0, 2, 0]
        );
        assert!(!cpu.record_crash(&FatalError::ReentrantInit));
        assert_eq!(cpu.crash_buffer()[1], 0x21);
    }

    #[test]
    #[should_panic(expected = "core 3 already claimed")]
    fn halting_boundary_panics() {
        let directory = directory();
        let mut cpu = directory.install_core_identity(0, 0).unwrap();
        let result = directory.install_core_identity(0, 0).map(|_| ());
        cpu.or_halt(result.map_err(|_| FatalError::CoreAlreadyClaimed(3)));
    }
}
