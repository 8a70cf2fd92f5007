//! Dynamic-linker symbol resolution: `(module, symbol) → address`.
//!
//! A `None` module uses the default lookup order of the platform linker.
//! Named modules are resolved without loading anything new; a module that is
//! not already mapped into the process reports [`HookStatus::ModuleNotFound`].

use core::ffi::c_void;

use crate::types::HookStatus;

/// Resolve `symbol`, optionally within `module`.
pub fn find_symbol(module: Option<&str>, symbol: &str) -> Result<*mut c_void, HookStatus> {
    platform_find_symbol(module, symbol)
}

#[cfg(unix)]
fn platform_find_symbol(module: Option<&str>, symbol: &str) -> Result<*mut c_void, HookStatus> {
    use std::ffi::CString;

    let c_symbol = CString::new(symbol).map_err(|_| HookStatus::FunctionNotFound)?;

    unsafe {
        match module {
            Some(name) => {
                let c_name = CString::new(name).map_err(|_| HookStatus::ModuleNotFound)?;
                let handle = libc::dlopen(c_name.as_ptr(), libc::RTLD_LAZY | libc::RTLD_NOLOAD);
                if handle.is_null() {
                    return Err(HookStatus::ModuleNotFound);
                }
                let address = libc::dlsym(handle, c_symbol.as_ptr());
                libc::dlclose(handle);
                if address.is_null() {
                    Err(HookStatus::FunctionNotFound)
                } else {
                    Ok(address as *mut c_void)
                }
            }
            None => {
                let address = libc::dlsym(libc::RTLD_DEFAULT, c_symbol.as_ptr());
                if address.is_null() {
                    Err(HookStatus::FunctionNotFound)
                } else {
                    Ok(address as *mut c_void)
                }
            }
        }
    }
}

#[cfg(windows)]
fn platform_find_symbol(module: Option<&str>, symbol: &str) -> Result<*mut c_void, HookStatus> {
    use std::ffi::CString;
    use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};

    let c_symbol = CString::new(symbol).map_err(|_| HookStatus::FunctionNotFound)?;

    unsafe {
        let handle = match module {
            Some(name) => {
                let wide: Vec<u16> = name.encode_utf16().chain(core::iter::once(0)).collect();
                GetModuleHandleW(wide.as_ptr())
            }
            None => GetModuleHandleW(core::ptr::null()),
        };
        if handle.is_null() {
            return Err(HookStatus::ModuleNotFound);
        }

        match GetProcAddress(handle, c_symbol.as_ptr() as *const u8) {
            Some(address) => Ok(address as *mut c_void),
            None => Err(HookStatus::FunctionNotFound),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn default_lookup_finds_libc_symbols() {
        let address = find_symbol(None, "malloc").unwrap();
        assert!(!address.is_null());
    }

    #[test]
    fn missing_symbol_is_reported() {
        let err = find_symbol(None, "interpose_no_such_symbol_9c4e").unwrap_err();
        assert_eq!(err, HookStatus::FunctionNotFound);
    }

    #[test]
    fn missing_module_is_reported() {
        let err = find_symbol(Some("libinterpose_missing.so.0"), "malloc").unwrap_err();
        assert_eq!(err, HookStatus::ModuleNotFound);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn named_module_lookup() {
        // libc is always resident, so RTLD_NOLOAD resolution succeeds.
        let address = find_symbol(Some("libc.so.6"), "free").unwrap();
        assert!(!address.is_null());
    }
}
