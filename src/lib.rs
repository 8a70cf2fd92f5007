//! interpose: in-process function interception for x86 and x86-64.
//!
//! Two facilities share one engine. The inline layer rewrites a target
//! function's prologue into a jump to a caller-supplied detour, after
//! relocating the displaced instructions into a trampoline that stays
//! callable as the unmodified original. The dispatch-table layer redirects
//! individual virtual-table slots of a live object into a substitute
//! object's implementations, with snapshot-based restore and an inline
//! fallback for non-virtual methods.
//!
//! ```no_run
//! use core::ffi::c_void;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! use interpose::Interceptor;
//!
//! static ORIGINAL: AtomicUsize = AtomicUsize::new(0);
//!
//! extern "C" fn detour(x: i32) -> i32 {
//!     let original: extern "C" fn(i32) -> i32 =
//!         unsafe { core::mem::transmute(ORIGINAL.load(Ordering::SeqCst)) };
//!     original(x) + 1
//! }
//!
//! unsafe {
//!     let interceptor = Interceptor::obtain();
//!     interceptor.initialize();
//!     let (target, trampoline) = interceptor
//!         .create_api(None, "abs", detour as *mut c_void)
//!         .unwrap();
//!     ORIGINAL.store(trampoline as usize, Ordering::SeqCst);
//!     interceptor.enable(target);
//! }
//! ```

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
compile_error!("interpose supports x86 and x86-64 only");

pub mod arch;
pub mod code;
pub mod interceptor;
pub mod module;
pub mod types;
pub mod vtable;

pub use interceptor::{Interceptor, ALL_HOOKS};
pub use module::find_symbol;
pub use types::{HookStatus, Member, MethodPointer, Protection};
pub use vtable::proxy::VtableProxy;

/// Process-global lock for tests that modify executable code.
///
/// Every test that patches functions or dispatch tables must hold this lock;
/// the registry is process-wide and concurrent patching of test fixtures
/// would race.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}
