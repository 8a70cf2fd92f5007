//! Dispatch-table proxy.
//!
//! Pairs a live target object with a substitute object of a matching layout
//! and redirects individual table slots into the substitute's
//! implementations. Non-virtual methods fall back to inline hooks through
//! the registry. The snapshot taken at initialization drives both
//! `invoke-original` and the restore-on-drop guarantee.

use core::ffi::c_void;
use std::collections::HashMap;

use log::debug;

use crate::code::patcher;
use crate::interceptor::Interceptor;
use crate::types::{HookStatus, Member, MethodPointer};
use crate::vtable;

const WORD: usize = core::mem::size_of::<usize>();

pub struct VtableProxy {
    target_table: *mut *const c_void,
    target_len: usize,
    snapshot: Vec<*const c_void>,
    substitute_table: *const *const c_void,
    substitute_len: usize,
    target_cache: HashMap<usize, Member>,
    substitute_cache: HashMap<usize, Member>,
    /// Non-virtual fallbacks: target code address → trampoline.
    inline_hooks: HashMap<usize, *const c_void>,
}

// Table pointers refer to process-lifetime dispatch tables; the proxy is
// used from whatever thread owns it.
unsafe impl Send for VtableProxy {}

impl VtableProxy {
    pub fn new() -> Self {
        VtableProxy {
            target_table: core::ptr::null_mut(),
            target_len: 0,
            snapshot: Vec::new(),
            substitute_table: core::ptr::null(),
            substitute_len: 0,
            target_cache: HashMap::new(),
            substitute_cache: HashMap::new(),
            inline_hooks: HashMap::new(),
        }
    }

    /// Record both dispatch tables and snapshot the target's. The probe runs
    /// to the first null or non-executable entry.
    ///
    /// # Safety
    ///
    /// Both pointers must address live objects of polymorphic types whose
    /// tables outlive this proxy.
    pub unsafe fn initialize(&mut self, target: *mut c_void, substitute: *const c_void) -> HookStatus {
        self.initialize_inner(target, substitute, None)
    }

    /// Like [`VtableProxy::initialize`], with the target's slot count
    /// declared by the caller instead of probed.
    ///
    /// # Safety
    ///
    /// See [`VtableProxy::initialize`]; `len` must not overstate the table.
    pub unsafe fn initialize_with_len(
        &mut self,
        target: *mut c_void,
        substitute: *const c_void,
        len: usize,
    ) -> HookStatus {
        self.initialize_inner(target, substitute, Some(len))
    }

    unsafe fn initialize_inner(
        &mut self,
        target: *mut c_void,
        substitute: *const c_void,
        declared_len: Option<usize>,
    ) -> HookStatus {
        if !self.target_table.is_null() {
            return HookStatus::AlreadyInitialized;
        }

        let table = vtable::table_pointer(target);
        if table.is_null() || !patcher::is_executable(table.read()) {
            return HookStatus::NotExecutable;
        }

        let len = declared_len.unwrap_or_else(|| vtable::table_length(table));
        if len == 0 {
            return HookStatus::NotExecutable;
        }

        self.target_table = table;
        self.target_len = len;
        self.snapshot = (0..len).map(|i| table.add(i).read()).collect();

        self.substitute_table = vtable::table_pointer(substitute);
        self.substitute_len = vtable::table_length(self.substitute_table);

        // Inline fallbacks go through the process registry.
        let _ = Interceptor::obtain().initialize();

        debug!(
            "proxy initialized: table {:#x}, {} slots",
            self.target_table as usize, self.target_len
        );
        HookStatus::Ok
    }

    fn initialized(&self) -> bool {
        !self.target_table.is_null()
    }

    unsafe fn resolve_target(&mut self, method: MethodPointer) -> Option<Member> {
        let (table, len) = (self.target_table as *const *const c_void, self.target_len);
        resolve_cached(&mut self.target_cache, table, len, method)
    }

    unsafe fn resolve_substitute(&mut self, method: MethodPointer) -> Option<Member> {
        let (table, len) = (self.substitute_table, self.substitute_len);
        resolve_cached(&mut self.substitute_cache, table, len, method)
    }

    /// Route `target_method` into `substitute_method`.
    ///
    /// A virtual target gets its table slot rewritten; a non-virtual target
    /// gets an inline hook on its code address, leaving the table untouched.
    ///
    /// # Safety
    ///
    /// Both handles must belong to the initialized pair, with compatible
    /// signatures.
    pub unsafe fn hook(&mut self, target_method: MethodPointer, substitute_method: MethodPointer) -> HookStatus {
        if !self.initialized() {
            return HookStatus::NotInitialized;
        }

        if let Some(member) = self.resolve_target(target_method) {
            let slot = self.target_table.add(member.index);
            if slot.read() != self.snapshot[member.index] {
                return HookStatus::AlreadyCreated;
            }
            let Some(substitute) = self.resolve_substitute(substitute_method) else {
                return HookStatus::UnsupportedFunction;
            };

            let status = write_slot(slot, substitute.address);
            if status.is_ok() {
                debug!("hooked slot {} -> {:#x}", member.index, substitute.address as usize);
            }
            return status;
        }

        // Non-virtual method: detour its code address directly. Small values
        // are unresolved table offsets, not code.
        let address = target_method.code_address();
        if (address as usize) <= 0xFFFF {
            return HookStatus::UnsupportedFunction;
        }
        if self.inline_hooks.contains_key(&(address as usize)) {
            return HookStatus::AlreadyCreated;
        }

        let detour = self
            .resolve_substitute(substitute_method)
            .map(|m| m.address)
            .unwrap_or_else(|| substitute_method.code_address());
        if detour.is_null() {
            return HookStatus::UnsupportedFunction;
        }

        let interceptor = Interceptor::obtain();
        let trampoline = match interceptor.create(address as *mut c_void, detour as *mut c_void) {
            Ok(trampoline) => trampoline,
            Err(status) => return status,
        };
        let status = interceptor.enable(address as *mut c_void);
        if !status.is_ok() {
            let _ = interceptor.remove(address as *mut c_void);
            return status;
        }

        self.inline_hooks.insert(address as usize, trampoline as *const c_void);
        debug!("inline-hooked non-virtual method {:#x}", address as usize);
        HookStatus::Ok
    }

    /// Undo [`VtableProxy::hook`] for one method.
    ///
    /// # Safety
    ///
    /// See [`VtableProxy::hook`].
    pub unsafe fn unhook(&mut self, target_method: MethodPointer) -> HookStatus {
        if !self.initialized() {
            return HookStatus::NotInitialized;
        }

        let address = target_method.code_address() as usize;
        if self.inline_hooks.remove(&address).is_some() {
            return Interceptor::obtain().remove(address as *mut c_void);
        }

        let Some(member) = self.resolve_target(target_method) else {
            return HookStatus::UnsupportedFunction;
        };
        let slot = self.target_table.add(member.index);
        let original = self.snapshot[member.index];
        if slot.read() == original {
            return HookStatus::AlreadyDisabled;
        }
        write_slot(slot, original)
    }

    /// Whether `target_method` currently routes into the substitute.
    ///
    /// # Safety
    ///
    /// See [`VtableProxy::hook`].
    pub unsafe fn is_hooked(&mut self, target_method: MethodPointer) -> bool {
        if !self.initialized() {
            return false;
        }

        let address = target_method.code_address() as usize;
        if self.inline_hooks.contains_key(&address) {
            return true;
        }

        match self.resolve_target(target_method) {
            Some(member) => self.target_table.add(member.index).read() != self.snapshot[member.index],
            None => false,
        }
    }

    /// The callable reaching the unhooked behaviour of `target_method`: the
    /// snapshot entry for a virtual slot, the trampoline for an inline-hooked
    /// method, the method itself otherwise.
    ///
    /// # Safety
    ///
    /// See [`VtableProxy::hook`].
    pub unsafe fn original_address(&mut self, target_method: MethodPointer) -> Option<*const c_void> {
        if !self.initialized() {
            return None;
        }

        let address = target_method.code_address();
        if let Some(&trampoline) = self.inline_hooks.get(&(address as usize)) {
            return Some(trampoline);
        }
        if let Some(member) = self.resolve_target(target_method) {
            return Some(self.snapshot[member.index]);
        }
        if !address.is_null() {
            return Some(address);
        }
        None
    }

    /// Typed form of [`VtableProxy::original_address`]: transmutes the
    /// address into the caller's function-pointer type.
    ///
    /// # Safety
    ///
    /// `F` must be a function-pointer type matching the method's actual
    /// signature (including the instance parameter).
    pub unsafe fn original<F: Copy>(&mut self, target_method: MethodPointer) -> Option<F> {
        assert_eq!(core::mem::size_of::<F>(), WORD, "original::<F> requires a function-pointer type");
        self.original_address(target_method)
            .map(|address| core::mem::transmute_copy(&address))
    }
}

impl Default for VtableProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for VtableProxy {
    /// Restore every slot that still differs from the snapshot and remove
    /// every owned inline hook.
    fn drop(&mut self) {
        if !self.initialized() {
            return;
        }
        unsafe {
            let bytes = self.target_len * WORD;
            if patcher::protect(self.target_table as *const c_void, bytes, false).is_ok() {
                for (index, &original) in self.snapshot.iter().enumerate() {
                    let slot = self.target_table.add(index);
                    if slot.read() != original {
                        slot.write(original);
                    }
                }
                let _ = patcher::protect(self.target_table as *const c_void, bytes, true);
            }

            let interceptor = Interceptor::obtain();
            for (address, _) in self.inline_hooks.drain() {
                let _ = interceptor.remove(address as *mut c_void);
            }
        }
    }
}

unsafe fn resolve_cached(
    cache: &mut HashMap<usize, Member>,
    table: *const *const c_void,
    len: usize,
    method: MethodPointer,
) -> Option<Member> {
    if let Some(&member) = cache.get(&method.ptr) {
        return Some(member);
    }
    let member = vtable::resolve(table, len, method)?;
    cache.insert(method.ptr, member);
    Some(member)
}

unsafe fn write_slot(slot: *mut *const c_void, value: *const c_void) -> HookStatus {
    if !patcher::protect(slot as *const c_void, WORD, false).is_ok() {
        return HookStatus::MemoryProtect;
    }
    slot.write(value);
    let _ = patcher::protect(slot as *const c_void, WORD, true);
    HookStatus::Ok
}

#[cfg(all(test, unix, target_pointer_width = "64"))]
mod tests {
    use super::*;
    use crate::lock_hook_tests;

    extern "C" fn method_a(_this: *mut c_void) -> u64 {
        1
    }
    extern "C" fn method_b(_this: *mut c_void) -> u64 {
        2
    }
    extern "C" fn method_c(_this: *mut c_void) -> u64 {
        3
    }
    extern "C" fn method_d(_this: *mut c_void) -> u64 {
        4
    }
    extern "C" fn substitute_b(_this: *mut c_void) -> u64 {
        20
    }

    type Method = extern "C" fn(*mut c_void) -> u64;

    /// A dispatch table on its own page, so slot protection toggles do not
    /// disturb unrelated allocations. Null-terminated.
    fn table_page(entries: &[*const c_void]) -> *mut *const c_void {
        unsafe {
            let page = libc::mmap(
                core::ptr::null_mut(),
                4096,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            assert_ne!(page, libc::MAP_FAILED);
            let table = page as *mut *const c_void;
            for (i, &entry) in entries.iter().enumerate() {
                table.add(i).write(entry);
            }
            table.add(entries.len()).write(core::ptr::null());
            table
        }
    }

    struct Fixture {
        target_object: Box<[*const c_void; 1]>,
        substitute_object: Box<[*const c_void; 1]>,
        table: *mut *const c_void,
    }

    fn fixture() -> Fixture {
        let table = table_page(&[
            method_a as *const c_void,
            method_b as *const c_void,
            method_c as *const c_void,
            method_d as *const c_void,
        ]);
        let substitute_table = table_page(&[
            method_a as *const c_void,
            substitute_b as *const c_void,
            method_c as *const c_void,
            method_d as *const c_void,
        ]);
        Fixture {
            target_object: Box::new([table as *const c_void]),
            substitute_object: Box::new([substitute_table as *const c_void]),
            table,
        }
    }

    unsafe fn dispatch(table: *mut *const c_void, index: usize) -> u64 {
        let f: Method = core::mem::transmute(table.add(index).read());
        f(core::ptr::null_mut())
    }

    #[test]
    fn virtual_slot_hook_restore_cycle() {
        let _g = lock_hook_tests();
        let mut fx = fixture();
        let mut proxy = VtableProxy::new();

        unsafe {
            assert_eq!(
                proxy.initialize(
                    fx.target_object.as_mut_ptr() as *mut c_void,
                    fx.substitute_object.as_ptr() as *const c_void,
                ),
                HookStatus::Ok
            );

            let b = MethodPointer::from_address(method_b as *const c_void);
            let b_sub = MethodPointer::from_address(substitute_b as *const c_void);

            assert!(!proxy.is_hooked(b));
            assert_eq!(proxy.hook(b, b_sub), HookStatus::Ok);
            assert!(proxy.is_hooked(b));

            // Polymorphic calls on the target now land in the substitute.
            assert_eq!(dispatch(fx.table, 1), 20);
            // Neighbouring slots are untouched.
            assert_eq!(dispatch(fx.table, 0), 1);
            assert_eq!(dispatch(fx.table, 2), 3);

            // invoke-original goes through the snapshot.
            let original: Method = proxy.original(b).unwrap();
            assert_eq!(original(core::ptr::null_mut()), 2);

            assert_eq!(proxy.unhook(b), HookStatus::Ok);
            assert!(!proxy.is_hooked(b));
            assert_eq!(dispatch(fx.table, 1), 2);
            assert_eq!(proxy.unhook(b), HookStatus::AlreadyDisabled);
        }
    }

    #[test]
    fn itanium_encoded_methods_resolve_to_slots() {
        let _g = lock_hook_tests();
        let mut fx = fixture();
        let mut proxy = VtableProxy::new();

        unsafe {
            proxy.initialize(
                fx.target_object.as_mut_ptr() as *mut c_void,
                fx.substitute_object.as_ptr() as *const c_void,
            );

            // Slot 1 in both tables, encoded as offset-plus-one pairs.
            let b = MethodPointer::from_parts(WORD + 1, 0);
            let b_sub = MethodPointer::from_parts(WORD + 1, 0);

            assert_eq!(proxy.hook(b, b_sub), HookStatus::Ok);
            assert_eq!(dispatch(fx.table, 1), 20);
            assert_eq!(proxy.original_address(b), Some(method_b as *const c_void));
            assert_eq!(proxy.unhook(b), HookStatus::Ok);
            assert_eq!(dispatch(fx.table, 1), 2);
        }
    }

    #[test]
    fn double_initialize_and_uninitialized_use_are_reported() {
        let _g = lock_hook_tests();
        let mut fx = fixture();
        let mut proxy = VtableProxy::new();

        unsafe {
            let b = MethodPointer::from_address(method_b as *const c_void);
            assert_eq!(proxy.hook(b, b), HookStatus::NotInitialized);

            assert_eq!(
                proxy.initialize(
                    fx.target_object.as_mut_ptr() as *mut c_void,
                    fx.substitute_object.as_ptr() as *const c_void,
                ),
                HookStatus::Ok
            );
            assert_eq!(
                proxy.initialize(
                    fx.target_object.as_mut_ptr() as *mut c_void,
                    fx.substitute_object.as_ptr() as *const c_void,
                ),
                HookStatus::AlreadyInitialized
            );
        }
    }

    #[test]
    fn declared_length_skips_the_probe() {
        let _g = lock_hook_tests();
        let mut fx = fixture();
        let mut proxy = VtableProxy::new();

        unsafe {
            assert_eq!(
                proxy.initialize_with_len(
                    fx.target_object.as_mut_ptr() as *mut c_void,
                    fx.substitute_object.as_ptr() as *const c_void,
                    2,
                ),
                HookStatus::Ok
            );

            // Slot 1 is inside the declared window.
            let b = MethodPointer::from_parts(WORD + 1, 0);
            assert_eq!(proxy.hook(b, b), HookStatus::Ok);
            assert_eq!(dispatch(fx.table, 1), 20);

            // Slot 3 is beyond it: treated as non-virtual, and the offset is
            // no valid code address either.
            let d = MethodPointer::from_parts(3 * WORD + 1, 0);
            assert_eq!(proxy.hook(d, d), HookStatus::UnsupportedFunction);
        }
    }

    #[test]
    fn objects_without_a_table_are_rejected() {
        let _g = lock_hook_tests();
        let mut proxy = VtableProxy::new();

        // First "slot" points into non-executable memory.
        let data = Box::new([0u8; 16]);
        let bogus_table = [data.as_ptr() as *const c_void];
        let mut object = [bogus_table.as_ptr() as *const c_void];

        unsafe {
            assert_eq!(
                proxy.initialize(object.as_mut_ptr() as *mut c_void, object.as_ptr() as *const c_void),
                HookStatus::NotExecutable
            );
        }
    }

    #[test]
    fn drop_restores_hooked_slots() {
        let _g = lock_hook_tests();
        let mut fx = fixture();

        unsafe {
            let mut proxy = VtableProxy::new();
            proxy.initialize(
                fx.target_object.as_mut_ptr() as *mut c_void,
                fx.substitute_object.as_ptr() as *const c_void,
            );

            let b = MethodPointer::from_address(method_b as *const c_void);
            let b_sub = MethodPointer::from_address(substitute_b as *const c_void);
            proxy.hook(b, b_sub);
            assert_eq!(dispatch(fx.table, 1), 20);

            drop(proxy);
            assert_eq!(dispatch(fx.table, 1), 2);
        }
    }

    #[test]
    fn non_virtual_method_falls_back_to_inline_hook() {
        let _g = lock_hook_tests();
        let mut fx = fixture();
        let mut proxy = VtableProxy::new();

        // A standalone routine, absent from the dispatch table: mov rax, 7; ret.
        let standalone = unsafe {
            let page = libc::mmap(
                core::ptr::null_mut(),
                4096,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            assert_ne!(page, libc::MAP_FAILED);
            let code = [0x48u8, 0xC7, 0xC0, 0x07, 0x00, 0x00, 0x00, 0xC3];
            core::ptr::copy_nonoverlapping(code.as_ptr(), page as *mut u8, code.len());
            page as *mut u8
        };

        unsafe {
            proxy.initialize(
                fx.target_object.as_mut_ptr() as *mut c_void,
                fx.substitute_object.as_ptr() as *const c_void,
            );

            let table_before: Vec<_> = (0..4).map(|i| fx.table.add(i).read()).collect();

            let method = MethodPointer::from_address(standalone as *const c_void);
            let b_sub = MethodPointer::from_address(substitute_b as *const c_void);
            assert_eq!(proxy.hook(method, b_sub), HookStatus::Ok);
            assert!(proxy.is_hooked(method));

            // The dispatch table is untouched; the code itself is detoured.
            let table_after: Vec<_> = (0..4).map(|i| fx.table.add(i).read()).collect();
            assert_eq!(table_before, table_after);

            let f: extern "C" fn() -> u64 = core::mem::transmute(standalone);
            assert_eq!(f(), 20);

            // invoke-original runs the displaced prologue via the trampoline.
            let original: extern "C" fn() -> u64 = proxy.original(method).unwrap();
            assert_eq!(original(), 7);

            assert_eq!(proxy.unhook(method), HookStatus::Ok);
            assert!(!proxy.is_hooked(method));
            assert_eq!(f(), 7);
        }
    }
}
