//! Hook registry.
//!
//! One process-global table of hook entries, serialized by a test-and-set
//! spin lock held across every public operation. Creating a hook builds its
//! trampoline but patches nothing; enabling rewrites the target prologue
//! into a jump while the thread freezer keeps every other thread's
//! instruction pointer out of the bytes being changed.

use core::cell::UnsafeCell;
use core::ffi::c_void;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use log::debug;

use crate::arch::decoder::{self, InsnKind};
use crate::arch::relocator::{self, OffsetPairs};
use crate::arch::writer;
use crate::code::allocator::SlabAllocator;
use crate::code::patcher;
use crate::module;
use crate::types::HookStatus;

mod freeze;
use freeze::FreezeAction;

/// Sentinel accepted by `enable`/`disable`/`queue_enable`/`queue_disable` to
/// address every created hook at once.
pub const ALL_HOOKS: *mut c_void = core::ptr::null_mut();

/// Backup capacity per entry; the widest patch today is the 7-byte
/// patch-above form.
pub(crate) const BACKUP_MAX: usize = 13;

pub(crate) struct HookEntry {
    pub(crate) target: *mut u8,
    /// The address `create` was handed, before any leading jump thunk was
    /// followed; lookups accept either form.
    pub(crate) alias: *mut u8,
    /// What the on-target jump lands on: the in-slot relay on x86-64, the
    /// user detour on x86.
    pub(crate) detour_entry: *mut u8,
    pub(crate) trampoline: *mut u8,
    pub(crate) backup: [u8; BACKUP_MAX],
    pub(crate) backup_len: u8,
    pub(crate) patch_above: bool,
    pub(crate) enabled: bool,
    pub(crate) queue_enable: bool,
    pub(crate) pairs: OffsetPairs,
}

// Raw pointers into process-owned code; access is serialized by the spin lock.
unsafe impl Send for HookEntry {}

struct Registry {
    initialized: bool,
    hooks: Vec<HookEntry>,
    allocator: SlabAllocator,
}

// ── Spin lock ────────────────────────────────────────────────────────

/// Test-and-set lock with exponential back-off from `yield` to `sleep(1ms)`.
struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> SpinLock<T> {
    fn new(value: T) -> Self {
        SpinLock { locked: AtomicBool::new(false), value: UnsafeCell::new(value) }
    }

    fn lock(&self) -> SpinGuard<'_, T> {
        let mut spins = 0u32;
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if spins < 32 {
                std::thread::yield_now();
            } else {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            spins += 1;
        }
        SpinGuard { lock: self }
    }
}

impl<T> core::ops::Deref for SpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> core::ops::DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

// ── Interceptor ──────────────────────────────────────────────────────

pub struct Interceptor {
    state: SpinLock<Registry>,
}

static INSTANCE: OnceLock<Interceptor> = OnceLock::new();

impl Interceptor {
    /// The process-wide interceptor.
    pub fn obtain() -> &'static Interceptor {
        INSTANCE.get_or_init(|| Interceptor {
            state: SpinLock::new(Registry {
                initialized: false,
                hooks: Vec::new(),
                allocator: SlabAllocator::new(),
            }),
        })
    }

    /// Prepare the registry. Required before any other operation.
    pub fn initialize(&self) -> HookStatus {
        let mut reg = self.state.lock();
        if reg.initialized {
            return HookStatus::AlreadyInitialized;
        }
        reg.initialized = true;
        HookStatus::Ok
    }

    /// Final teardown: disable every hook, release every entry and block.
    ///
    /// # Safety
    ///
    /// No thread may still be calling trampolines created by this registry.
    pub unsafe fn uninitialize(&self) -> HookStatus {
        let mut reg = self.state.lock();
        if !reg.initialized {
            return HookStatus::NotInitialized;
        }

        let status = enable_all_entries(&mut reg, false);
        if !status.is_ok() {
            return status;
        }

        for entry in core::mem::take(&mut reg.hooks) {
            reg.allocator.free(entry.trampoline);
        }
        reg.allocator.release_all();
        reg.initialized = false;
        HookStatus::Ok
    }

    /// Build a trampoline for `target` and register a disabled hook routing
    /// calls into `detour`. Returns the trampoline, callable as the
    /// unpatched original.
    ///
    /// A target whose first instruction is a 5-byte `E9` thunk is followed
    /// once, so debug-build stubs hook the real function body.
    ///
    /// # Safety
    ///
    /// `target` must be a function with a decodable prologue; `detour` must
    /// be a function with a signature compatible with `target`'s callers.
    pub unsafe fn create(&self, target: *mut c_void, detour: *mut c_void) -> Result<*mut c_void, HookStatus> {
        let mut reg = self.state.lock();
        if !reg.initialized {
            return Err(HookStatus::NotInitialized);
        }

        if !patcher::is_executable(target as *const c_void) || !patcher::is_executable(detour as *const c_void) {
            return Err(HookStatus::NotExecutable);
        }

        let alias = target as *mut u8;
        let target = follow_jmp_thunk(alias);
        if !patcher::is_executable(target as *const c_void) {
            return Err(HookStatus::NotExecutable);
        }

        if find_entry(&reg.hooks, target).is_some() {
            return Err(HookStatus::AlreadyCreated);
        }

        let slot = reg.allocator.allocate(target).ok_or(HookStatus::MemoryAlloc)?;
        let built = match relocator::build(target, detour as *const u8, slot) {
            Ok(built) => built,
            Err(status) => {
                reg.allocator.free(slot);
                return Err(status);
            }
        };

        let mut backup = [0u8; BACKUP_MAX];
        let backup_len;
        if built.patch_above {
            backup_len = writer::JMP_REL_LEN + writer::JMP_REL_SHORT_LEN;
            core::ptr::copy_nonoverlapping(target.sub(writer::JMP_REL_LEN), backup.as_mut_ptr(), backup_len);
        } else {
            backup_len = writer::JMP_REL_LEN;
            core::ptr::copy_nonoverlapping(target, backup.as_mut_ptr(), backup_len);
        }

        #[cfg(target_pointer_width = "64")]
        let detour_entry = built.relay;
        #[cfg(target_pointer_width = "32")]
        let detour_entry = detour as *mut u8;

        debug!(
            "created hook: target {:#x}, trampoline {:#x}, patch_above {}",
            target as usize, slot as usize, built.patch_above
        );

        reg.hooks.push(HookEntry {
            target,
            alias,
            detour_entry,
            trampoline: slot,
            backup,
            backup_len: backup_len as u8,
            patch_above: built.patch_above,
            enabled: false,
            queue_enable: false,
            pairs: built.pairs,
        });

        Ok(slot as *mut c_void)
    }

    /// Resolve `(module, symbol)` through the dynamic linker and create a
    /// hook on the result. Returns the resolved target and the trampoline.
    ///
    /// # Safety
    ///
    /// See [`Interceptor::create`].
    pub unsafe fn create_api(
        &self,
        module: Option<&str>,
        symbol: &str,
        detour: *mut c_void,
    ) -> Result<(*mut c_void, *mut c_void), HookStatus> {
        let target = module::find_symbol(module, symbol)?;
        let trampoline = self.create(target, detour)?;
        Ok((target, trampoline))
    }

    /// Disable (if needed) and delete the hook on `target`, releasing its
    /// trampoline slot.
    ///
    /// # Safety
    ///
    /// The trampoline pointer returned from `create` must no longer be used.
    pub unsafe fn remove(&self, target: *mut c_void) -> HookStatus {
        let mut reg = self.state.lock();
        if !reg.initialized {
            return HookStatus::NotInitialized;
        }
        let Some(pos) = find_entry(&reg.hooks, target as *mut u8) else {
            return HookStatus::NotCreated;
        };

        if reg.hooks[pos].enabled {
            let frozen = freeze::freeze(&reg.hooks, Some(pos), FreezeAction::Disable);
            let status = enable_entry(&mut reg.hooks[pos], false);
            freeze::unfreeze(frozen);
            if !status.is_ok() {
                // The prologue still carries the patch; keep the entry so the
                // caller can retry.
                return status;
            }
        }

        let entry = reg.hooks.swap_remove(pos);
        reg.allocator.free(entry.trampoline);
        debug!("removed hook on {:#x}", entry.target as usize);
        HookStatus::Ok
    }

    /// Apply the prologue patch. Accepts [`ALL_HOOKS`].
    ///
    /// # Safety
    ///
    /// From this point every caller of `target` runs the detour.
    pub unsafe fn enable(&self, target: *mut c_void) -> HookStatus {
        self.set_enabled(target, true)
    }

    /// Restore the original prologue. Accepts [`ALL_HOOKS`].
    ///
    /// # Safety
    ///
    /// The detour must tolerate in-flight calls finishing after disable.
    pub unsafe fn disable(&self, target: *mut c_void) -> HookStatus {
        self.set_enabled(target, false)
    }

    unsafe fn set_enabled(&self, target: *mut c_void, enable: bool) -> HookStatus {
        let mut reg = self.state.lock();
        if !reg.initialized {
            return HookStatus::NotInitialized;
        }

        if target == ALL_HOOKS {
            return enable_all_entries(&mut reg, enable);
        }

        let Some(pos) = find_entry(&reg.hooks, target as *mut u8) else {
            return HookStatus::NotCreated;
        };
        if reg.hooks[pos].enabled == enable {
            return if enable { HookStatus::AlreadyEnabled } else { HookStatus::AlreadyDisabled };
        }

        let action = if enable { FreezeAction::Enable } else { FreezeAction::Disable };
        let frozen = freeze::freeze(&reg.hooks, Some(pos), action);
        let status = enable_entry(&mut reg.hooks[pos], enable);
        freeze::unfreeze(frozen);
        status
    }

    /// Record the intent to enable without touching the target. Accepts
    /// [`ALL_HOOKS`].
    pub fn queue_enable(&self, target: *mut c_void) -> HookStatus {
        self.queue(target, true)
    }

    /// Record the intent to disable without touching the target. Accepts
    /// [`ALL_HOOKS`].
    pub fn queue_disable(&self, target: *mut c_void) -> HookStatus {
        self.queue(target, false)
    }

    fn queue(&self, target: *mut c_void, queue_enable: bool) -> HookStatus {
        let mut reg = self.state.lock();
        if !reg.initialized {
            return HookStatus::NotInitialized;
        }

        if target == ALL_HOOKS {
            for entry in &mut reg.hooks {
                entry.queue_enable = queue_enable;
            }
            return HookStatus::Ok;
        }

        match find_entry(&reg.hooks, target as *mut u8) {
            Some(pos) => {
                reg.hooks[pos].queue_enable = queue_enable;
                HookStatus::Ok
            }
            None => HookStatus::NotCreated,
        }
    }

    /// Apply every queued enable/disable in one freeze window.
    ///
    /// # Safety
    ///
    /// See [`Interceptor::enable`].
    pub unsafe fn apply_queued(&self) -> HookStatus {
        let mut reg = self.state.lock();
        if !reg.initialized {
            return HookStatus::NotInitialized;
        }

        if !reg.hooks.iter().any(|h| h.enabled != h.queue_enable) {
            return HookStatus::Ok;
        }

        let frozen = freeze::freeze(&reg.hooks, None, FreezeAction::ApplyQueued);
        let mut status = HookStatus::Ok;
        for pos in 0..reg.hooks.len() {
            if reg.hooks[pos].enabled != reg.hooks[pos].queue_enable {
                let desired = reg.hooks[pos].queue_enable;
                status = enable_entry(&mut reg.hooks[pos], desired);
                if !status.is_ok() {
                    break;
                }
            }
        }
        freeze::unfreeze(frozen);
        status
    }

    /// Enable every created hook in one freeze window.
    ///
    /// # Safety
    ///
    /// See [`Interceptor::enable`].
    pub unsafe fn enable_all(&self) -> HookStatus {
        let mut reg = self.state.lock();
        if !reg.initialized {
            return HookStatus::NotInitialized;
        }
        enable_all_entries(&mut reg, true)
    }

    /// Disable every created hook in one freeze window.
    ///
    /// # Safety
    ///
    /// See [`Interceptor::disable`].
    pub unsafe fn disable_all(&self) -> HookStatus {
        let mut reg = self.state.lock();
        if !reg.initialized {
            return HookStatus::NotInitialized;
        }
        enable_all_entries(&mut reg, false)
    }

    /// The trampoline for a created hook, callable as the original.
    pub fn trampoline(&self, target: *mut c_void) -> Option<*const c_void> {
        let reg = self.state.lock();
        if !reg.initialized {
            return None;
        }
        find_entry(&reg.hooks, target as *mut u8).map(|pos| reg.hooks[pos].trampoline as *const c_void)
    }
}

fn find_entry(hooks: &[HookEntry], target: *mut u8) -> Option<usize> {
    hooks.iter().position(|h| h.target == target || h.alias == target)
}

/// Follow one leading `E9 rel32` (debug/incremental-link thunk) to the real
/// function body.
unsafe fn follow_jmp_thunk(target: *mut u8) -> *mut u8 {
    let insn = decoder::decode_at(target);
    if insn.kind == InsnKind::JmpRel && insn.len == writer::JMP_REL_LEN && target.read() == 0xE9 {
        return insn.branch_target as usize as *mut u8;
    }
    target
}

unsafe fn enable_all_entries(reg: &mut Registry, enable: bool) -> HookStatus {
    if !reg.hooks.iter().any(|h| h.enabled != enable) {
        return HookStatus::Ok;
    }

    let action = if enable { FreezeAction::Enable } else { FreezeAction::Disable };
    let frozen = freeze::freeze(&reg.hooks, None, action);
    let mut status = HookStatus::Ok;
    for pos in 0..reg.hooks.len() {
        if reg.hooks[pos].enabled != enable {
            status = enable_entry(&mut reg.hooks[pos], enable);
            if !status.is_ok() {
                break;
            }
        }
    }
    freeze::unfreeze(frozen);
    status
}

/// Write or revert one prologue patch. The freezer has already parked every
/// other thread outside the affected bytes.
unsafe fn enable_entry(entry: &mut HookEntry, enable: bool) -> HookStatus {
    let (patch_addr, patch_len) = if entry.patch_above {
        (
            entry.target.sub(writer::JMP_REL_LEN),
            writer::JMP_REL_LEN + writer::JMP_REL_SHORT_LEN,
        )
    } else {
        (entry.target, writer::JMP_REL_LEN)
    };

    let mut bytes = [0u8; BACKUP_MAX];
    if enable {
        let jmp = writer::jmp_rel32_bytes(patch_addr as u64, entry.detour_entry as u64);
        bytes[..writer::JMP_REL_LEN].copy_from_slice(&jmp);
        if entry.patch_above {
            bytes[writer::JMP_REL_LEN..patch_len].copy_from_slice(&writer::patch_above_short_jmp());
        }
    } else {
        bytes[..patch_len].copy_from_slice(&entry.backup[..usize::from(entry.backup_len)]);
    }

    let result = patcher::patch_code(patch_addr, patch_len, |p| {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), p, patch_len);
    });

    match result {
        Ok(()) => {
            entry.enabled = enable;
            entry.queue_enable = enable;
            debug!(
                "{} hook on {:#x}",
                if enable { "enabled" } else { "disabled" },
                entry.target as usize
            );
            HookStatus::Ok
        }
        Err(status) => status,
    }
}

#[cfg(all(test, unix, target_pointer_width = "64"))]
mod tests {
    use super::*;
    use crate::lock_hook_tests;
    use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    /// mov rax, 7; ret
    const MOV_RAX_7_RET: [u8; 8] = [0x48, 0xC7, 0xC0, 0x07, 0x00, 0x00, 0x00, 0xC3];

    static TRAMPOLINE: AtomicUsize = AtomicUsize::new(0);
    static SIDE: AtomicU64 = AtomicU64::new(0);

    extern "C" fn recording_detour() -> u64 {
        SIDE.store(42, Ordering::SeqCst);
        let trampoline = TRAMPOLINE.load(Ordering::SeqCst);
        let original: extern "C" fn() -> u64 = unsafe { core::mem::transmute(trampoline) };
        original()
    }

    extern "C" fn constant_detour() -> u64 {
        99
    }

    /// One RWX page per target so page relocking stays contained.
    fn exec_page(bytes: &[u8]) -> *mut u8 {
        unsafe {
            let page = libc::mmap(
                core::ptr::null_mut(),
                4096,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            assert_ne!(page, libc::MAP_FAILED);
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), page as *mut u8, bytes.len());
            page as *mut u8
        }
    }

    fn init(i: &Interceptor) {
        let status = i.initialize();
        assert!(matches!(status, HookStatus::Ok | HookStatus::AlreadyInitialized));
    }

    unsafe fn call(target: *mut u8) -> u64 {
        let f: extern "C" fn() -> u64 = core::mem::transmute(target);
        f()
    }

    #[test]
    fn hook_detours_and_trampoline_calls_original() {
        let _g = lock_hook_tests();
        let i = Interceptor::obtain();
        init(i);

        let target = exec_page(&MOV_RAX_7_RET);
        unsafe {
            assert_eq!(call(target), 7);

            let trampoline = i.create(target as *mut c_void, recording_detour as *mut c_void).unwrap();
            TRAMPOLINE.store(trampoline as usize, Ordering::SeqCst);
            SIDE.store(0, Ordering::SeqCst);

            // Created but not enabled: nothing observable changed.
            assert_eq!(call(target), 7);
            assert_eq!(SIDE.load(Ordering::SeqCst), 0);

            assert_eq!(i.enable(target as *mut c_void), HookStatus::Ok);
            assert_eq!(call(target), 7, "detour forwards to the original through the trampoline");
            assert_eq!(SIDE.load(Ordering::SeqCst), 42, "detour ran");

            assert_eq!(i.enable(target as *mut c_void), HookStatus::AlreadyEnabled);

            SIDE.store(0, Ordering::SeqCst);
            assert_eq!(i.disable(target as *mut c_void), HookStatus::Ok);
            assert_eq!(call(target), 7);
            assert_eq!(SIDE.load(Ordering::SeqCst), 0, "detour no longer runs");
            assert_eq!(i.disable(target as *mut c_void), HookStatus::AlreadyDisabled);

            assert_eq!(i.remove(target as *mut c_void), HookStatus::Ok);
        }
    }

    #[test]
    fn create_then_remove_leaves_bytes_untouched() {
        let _g = lock_hook_tests();
        let i = Interceptor::obtain();
        init(i);

        let target = exec_page(&MOV_RAX_7_RET);
        unsafe {
            let before = core::ptr::read(target as *const [u8; 16]);
            i.create(target as *mut c_void, constant_detour as *mut c_void).unwrap();
            assert_eq!(core::ptr::read(target as *const [u8; 16]), before);
            assert_eq!(i.remove(target as *mut c_void), HookStatus::Ok);
            assert_eq!(core::ptr::read(target as *const [u8; 16]), before);
        }
    }

    #[test]
    fn enable_then_disable_restores_bytes_exactly() {
        let _g = lock_hook_tests();
        let i = Interceptor::obtain();
        init(i);

        let target = exec_page(&MOV_RAX_7_RET);
        unsafe {
            let before = core::ptr::read(target as *const [u8; 16]);
            i.create(target as *mut c_void, constant_detour as *mut c_void).unwrap();

            assert_eq!(i.enable(target as *mut c_void), HookStatus::Ok);
            assert_eq!(target.read(), 0xE9, "prologue now opens with a rel32 jump");
            assert_ne!(core::ptr::read(target as *const [u8; 16]), before);

            assert_eq!(i.disable(target as *mut c_void), HookStatus::Ok);
            assert_eq!(core::ptr::read(target as *const [u8; 16]), before);

            assert_eq!(i.remove(target as *mut c_void), HookStatus::Ok);
        }
    }

    #[test]
    fn queueing_twice_then_applying_equals_one_enable() {
        let _g = lock_hook_tests();
        let i = Interceptor::obtain();
        init(i);

        let target = exec_page(&MOV_RAX_7_RET);
        unsafe {
            i.create(target as *mut c_void, constant_detour as *mut c_void).unwrap();

            assert_eq!(i.queue_enable(target as *mut c_void), HookStatus::Ok);
            assert_eq!(i.queue_enable(target as *mut c_void), HookStatus::Ok);
            // Intent only: the prologue is untouched until apply.
            assert_eq!(call(target), 7);

            assert_eq!(i.apply_queued(), HookStatus::Ok);
            assert_eq!(call(target), 99);
            assert_eq!(i.enable(target as *mut c_void), HookStatus::AlreadyEnabled);

            assert_eq!(i.queue_disable(target as *mut c_void), HookStatus::Ok);
            assert_eq!(i.apply_queued(), HookStatus::Ok);
            assert_eq!(call(target), 7);

            assert_eq!(i.remove(target as *mut c_void), HookStatus::Ok);
        }
    }

    #[test]
    fn leading_jmp_thunk_is_followed_once() {
        let _g = lock_hook_tests();
        let i = Interceptor::obtain();
        init(i);

        // Thunk at +0 jumps to the body at +16.
        let mut bytes = [0xCCu8; 24];
        bytes[0] = 0xE9;
        bytes[1..5].copy_from_slice(&11i32.to_le_bytes()); // 0 + 5 + 11 = 16
        bytes[16..24].copy_from_slice(&MOV_RAX_7_RET);
        let thunk = exec_page(&bytes);
        let body = unsafe { thunk.add(16) };

        unsafe {
            let thunk_bytes_before = core::ptr::read(thunk as *const [u8; 5]);
            i.create(thunk as *mut c_void, constant_detour as *mut c_void).unwrap();
            assert_eq!(i.enable(thunk as *mut c_void), HookStatus::Ok);

            // The thunk is untouched; the body carries the patch.
            assert_eq!(core::ptr::read(thunk as *const [u8; 5]), thunk_bytes_before);
            assert_eq!(body.read(), 0xE9);

            // Calls through the thunk land in the detour.
            assert_eq!(call(thunk), 99);

            assert_eq!(i.disable(thunk as *mut c_void), HookStatus::Ok);
            assert_eq!(call(thunk), 7);
            assert_eq!(i.remove(thunk as *mut c_void), HookStatus::Ok);
        }
    }

    #[test]
    fn not_executable_and_not_created_are_reported() {
        let _g = lock_hook_tests();
        let i = Interceptor::obtain();
        init(i);

        let heap = Box::into_raw(Box::new([0u8; 64])) as *mut c_void;
        unsafe {
            assert_eq!(
                i.create(heap, constant_detour as *mut c_void).unwrap_err(),
                HookStatus::NotExecutable
            );

            let target = exec_page(&MOV_RAX_7_RET);
            assert_eq!(i.enable(target as *mut c_void), HookStatus::NotCreated);
            assert_eq!(i.remove(target as *mut c_void), HookStatus::NotCreated);
            drop(Box::from_raw(heap as *mut [u8; 64]));
        }
    }

    #[test]
    fn double_create_is_rejected() {
        let _g = lock_hook_tests();
        let i = Interceptor::obtain();
        init(i);

        let target = exec_page(&MOV_RAX_7_RET);
        unsafe {
            i.create(target as *mut c_void, constant_detour as *mut c_void).unwrap();
            assert_eq!(
                i.create(target as *mut c_void, constant_detour as *mut c_void).unwrap_err(),
                HookStatus::AlreadyCreated
            );
            assert_eq!(i.remove(target as *mut c_void), HookStatus::Ok);
        }
    }

    #[test]
    fn unsupported_prologue_frees_the_slot() {
        let _g = lock_hook_tests();
        let i = Interceptor::obtain();
        init(i);

        // Opening conditional branch out of the window.
        let mut bytes = [0xCCu8; 16];
        bytes[0] = 0x70;
        bytes[1] = 0x10;
        let target = exec_page(&bytes);
        unsafe {
            assert_eq!(
                i.create(target as *mut c_void, constant_detour as *mut c_void).unwrap_err(),
                HookStatus::UnsupportedFunction
            );
            // Nothing was registered.
            assert_eq!(i.remove(target as *mut c_void), HookStatus::NotCreated);
        }
    }

    #[test]
    fn short_prologue_patches_above_into_padding() {
        let _g = lock_hook_tests();
        let i = Interceptor::obtain();
        init(i);

        // 16 bytes of filler, five NOPs of padding, then `ret 4` followed by
        // live bytes so the inline window cannot be completed.
        let mut bytes = [0xCCu8; 32];
        bytes[16..21].fill(0x90);
        bytes[21..24].copy_from_slice(&[0xC2, 0x04, 0x00]);
        bytes[24..26].copy_from_slice(&[0x8B, 0xFF]);
        let page = exec_page(&bytes);
        let target = unsafe { page.add(21) };

        unsafe {
            let before_pad = core::ptr::read(page.add(16) as *const [u8; 5]);
            let before_body = core::ptr::read(target as *const [u8; 3]);

            i.create(target as *mut c_void, constant_detour as *mut c_void).unwrap();
            assert_eq!(i.enable(target as *mut c_void), HookStatus::Ok);

            // Full jump in the padding, short backward jump at the target.
            assert_eq!(page.add(16).read(), 0xE9);
            assert_eq!(core::ptr::read(target as *const [u8; 2]), [0xEB, 0xF9]);

            assert_eq!(i.disable(target as *mut c_void), HookStatus::Ok);
            assert_eq!(core::ptr::read(page.add(16) as *const [u8; 5]), before_pad);
            assert_eq!(core::ptr::read(target as *const [u8; 3]), before_body);

            assert_eq!(i.remove(target as *mut c_void), HookStatus::Ok);
        }
    }

    #[test]
    fn bulk_operations_cover_every_hook() {
        let _g = lock_hook_tests();
        let i = Interceptor::obtain();
        init(i);

        let first = exec_page(&MOV_RAX_7_RET);
        let second = exec_page(&MOV_RAX_7_RET);
        unsafe {
            i.create(first as *mut c_void, constant_detour as *mut c_void).unwrap();
            i.create(second as *mut c_void, constant_detour as *mut c_void).unwrap();

            assert_eq!(i.enable(ALL_HOOKS), HookStatus::Ok);
            assert_eq!(call(first), 99);
            assert_eq!(call(second), 99);

            assert_eq!(i.disable(ALL_HOOKS), HookStatus::Ok);
            assert_eq!(call(first), 7);
            assert_eq!(call(second), 7);

            // enable_all/disable_all are the explicit spellings.
            assert_eq!(i.enable_all(), HookStatus::Ok);
            assert_eq!(call(first), 99);
            assert_eq!(i.disable_all(), HookStatus::Ok);
            assert_eq!(call(first), 7);

            assert_eq!(i.remove(first as *mut c_void), HookStatus::Ok);
            assert_eq!(i.remove(second as *mut c_void), HookStatus::Ok);
        }
    }

    #[test]
    fn create_api_resolves_real_symbols() {
        let _g = lock_hook_tests();
        let i = Interceptor::obtain();
        init(i);

        unsafe {
            let (target, trampoline) =
                i.create_api(None, "malloc", constant_detour as *mut c_void).unwrap();
            assert!(!target.is_null());
            assert!(!trampoline.is_null());
            // Never enabled; removing restores nothing because nothing changed.
            assert_eq!(i.remove(target), HookStatus::Ok);

            assert_eq!(
                i.create_api(None, "interpose_no_such_symbol_77", constant_detour as *mut c_void)
                    .unwrap_err(),
                HookStatus::FunctionNotFound
            );
        }
    }

    #[test]
    fn uninitialize_tears_down_and_gates_operations() {
        let _g = lock_hook_tests();
        let i = Interceptor::obtain();
        init(i);

        let target = exec_page(&MOV_RAX_7_RET);
        unsafe {
            let before = core::ptr::read(target as *const [u8; 16]);
            i.create(target as *mut c_void, constant_detour as *mut c_void).unwrap();

            assert_eq!(i.uninitialize(), HookStatus::Ok);
            assert_eq!(core::ptr::read(target as *const [u8; 16]), before);
            assert_eq!(i.enable(target as *mut c_void), HookStatus::NotInitialized);
            assert_eq!(i.uninitialize(), HookStatus::NotInitialized);

            // Back up for the rest of the suite.
            assert_eq!(i.initialize(), HookStatus::Ok);
        }
    }
}
