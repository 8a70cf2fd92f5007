//! Page-protection queries and code patching.
//!
//! Protection is read from the platform's region inventory (`/proc/self/maps`,
//! `mach_vm_region`, `VirtualQuery`) and changed page-granularly; on POSIX the
//! requested range is rounded down to a page boundary and widened to cover the
//! whole span.

use core::ffi::c_void;

use log::warn;

use crate::code::cache;
use crate::types::{HookStatus, Protection};

/// Query the protection of the page holding `addr`.
pub fn get_protection(addr: *const c_void) -> Result<Protection, HookStatus> {
    if addr.is_null() {
        return Err(HookStatus::Unknown);
    }
    platform_get_protection(addr)
}

/// True when `addr` lies in an executable mapping.
pub fn is_executable(addr: *const c_void) -> bool {
    matches!(get_protection(addr), Ok(p) if p.exec)
}

/// Change the protection of the pages covering `[addr, addr + len)`.
///
/// # Safety
///
/// Affects whole pages; the caller must own the consequences for everything
/// else on them.
pub unsafe fn set_protection(addr: *const c_void, len: usize, prot: Protection) -> HookStatus {
    if addr.is_null() || len == 0 {
        return HookStatus::MemoryProtect;
    }
    platform_set_protection(addr, len, prot)
}

/// Convenience form: `locked == false` opens the range up as RWX for
/// patching, `locked == true` restores R+X.
///
/// # Safety
///
/// See [`set_protection`].
pub unsafe fn protect(addr: *const c_void, len: usize, locked: bool) -> HookStatus {
    let prot = if locked { Protection::RX } else { Protection::RWX };
    set_protection(addr, len, prot)
}

/// Unprotect `[addr, addr + len)`, run `apply` to rewrite the bytes, restore
/// R+X, and flush the instruction cache for the range.
///
/// # Safety
///
/// `addr` must point at `len` bytes of code owned by this process and
/// `apply` must write only within that range.
pub unsafe fn patch_code(addr: *mut u8, len: usize, apply: impl FnOnce(*mut u8)) -> Result<(), HookStatus> {
    if len == 0 {
        return Ok(());
    }
    if !protect(addr as *const c_void, len, false).is_ok() {
        return Err(HookStatus::MemoryProtect);
    }

    apply(addr);

    if !protect(addr as *const c_void, len, true).is_ok() {
        // The bytes are in place; a failed re-lock leaves the page writable
        // but the patch itself is complete.
        warn!("failed to restore R+X on {:#x}+{:#x}", addr as usize, len);
    }
    cache::flush(addr as *const u8, len);
    Ok(())
}

// ── Linux ────────────────────────────────────────────────────────────

#[cfg(target_os = "linux")]
fn platform_get_protection(addr: *const c_void) -> Result<Protection, HookStatus> {
    let address = addr as usize;
    let maps = std::fs::read_to_string("/proc/self/maps").map_err(|_| HookStatus::Unknown)?;
    for line in maps.lines() {
        let mut fields = line.split_whitespace();
        let Some(range) = fields.next() else { continue };
        let Some(perms) = fields.next() else { continue };
        let Some((start_s, end_s)) = range.split_once('-') else { continue };
        let Ok(start) = usize::from_str_radix(start_s, 16) else { continue };
        let Ok(end) = usize::from_str_radix(end_s, 16) else { continue };
        if start <= address && address < end {
            let perms = perms.as_bytes();
            return Ok(Protection {
                read: perms.first() == Some(&b'r'),
                write: perms.get(1) == Some(&b'w'),
                exec: perms.get(2) == Some(&b'x'),
            });
        }
    }
    Err(HookStatus::Unknown)
}

// ── macOS ────────────────────────────────────────────────────────────

#[cfg(target_os = "macos")]
fn platform_get_protection(addr: *const c_void) -> Result<Protection, HookStatus> {
    use mach2::kern_return::KERN_SUCCESS;
    use mach2::traps::mach_task_self;
    use mach2::vm_prot::{VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};
    use mach2::vm_region::{vm_region_basic_info_64, VM_REGION_BASIC_INFO_64};
    use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};

    unsafe {
        let mut region_addr = addr as mach_vm_address_t;
        let mut region_size: mach_vm_size_t = 0;
        let mut info: vm_region_basic_info_64 = core::mem::zeroed();
        let mut info_count = vm_region_basic_info_64::count();
        let mut object_name: u32 = 0;

        let kr = mach2::vm::mach_vm_region(
            mach_task_self(),
            &mut region_addr,
            &mut region_size,
            VM_REGION_BASIC_INFO_64,
            (&mut info as *mut _) as mach2::vm_region::vm_region_info_t,
            &mut info_count,
            &mut object_name,
        );
        // mach_vm_region rounds forward to the next region; an address below
        // the returned region is unmapped.
        if kr != KERN_SUCCESS || (addr as u64) < region_addr {
            return Err(HookStatus::Unknown);
        }
        Ok(Protection {
            read: info.protection & VM_PROT_READ != 0,
            write: info.protection & VM_PROT_WRITE != 0,
            exec: info.protection & VM_PROT_EXECUTE != 0,
        })
    }
}

// ── POSIX protection change ──────────────────────────────────────────

#[cfg(unix)]
unsafe fn platform_set_protection(addr: *const c_void, len: usize, prot: Protection) -> HookStatus {
    let mut flags = libc::PROT_NONE;
    if prot.read {
        flags |= libc::PROT_READ;
    }
    if prot.write {
        flags |= libc::PROT_WRITE;
    }
    if prot.exec {
        flags |= libc::PROT_EXEC;
    }

    let page = libc::sysconf(libc::_SC_PAGESIZE) as usize;
    let address = addr as usize;
    let diff = address % page;

    if libc::mprotect((address - diff) as *mut libc::c_void, diff + len, flags) == 0 {
        HookStatus::Ok
    } else {
        HookStatus::MemoryProtect
    }
}

// ── Windows ──────────────────────────────────────────────────────────

#[cfg(windows)]
fn platform_get_protection(addr: *const c_void) -> Result<Protection, HookStatus> {
    use windows_sys::Win32::System::Memory::{
        VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT, PAGE_EXECUTE, PAGE_EXECUTE_READ,
        PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_NOACCESS, PAGE_READONLY,
        PAGE_READWRITE, PAGE_WRITECOPY,
    };

    unsafe {
        let mut mbi: MEMORY_BASIC_INFORMATION = core::mem::zeroed();
        if VirtualQuery(addr, &mut mbi, core::mem::size_of_val(&mbi)) == 0 || mbi.State != MEM_COMMIT {
            return Err(HookStatus::Unknown);
        }

        let p = mbi.Protect;
        let prot = if p & PAGE_NOACCESS != 0 {
            Protection::default()
        } else if p & PAGE_READONLY != 0 {
            Protection { read: true, ..Default::default() }
        } else if p & (PAGE_READWRITE | PAGE_WRITECOPY) != 0 {
            Protection::RW
        } else if p & PAGE_EXECUTE != 0 {
            Protection { exec: true, ..Default::default() }
        } else if p & PAGE_EXECUTE_READ != 0 {
            Protection::RX
        } else if p & (PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY) != 0 {
            Protection::RWX
        } else {
            return Err(HookStatus::Unknown);
        };
        Ok(prot)
    }
}

#[cfg(windows)]
unsafe fn platform_set_protection(addr: *const c_void, len: usize, prot: Protection) -> HookStatus {
    use windows_sys::Win32::System::Memory::{
        VirtualProtect, PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_NOACCESS,
        PAGE_READONLY, PAGE_READWRITE,
    };

    let flags = match (prot.read, prot.write, prot.exec) {
        (false, false, false) => PAGE_NOACCESS,
        (true, false, false) => PAGE_READONLY,
        (false, false, true) => PAGE_EXECUTE,
        (_, true, false) => PAGE_READWRITE,
        (true, false, true) => PAGE_EXECUTE_READ,
        (_, true, true) => PAGE_EXECUTE_READWRITE,
    };

    let mut old = 0u32;
    if VirtualProtect(addr, len, flags, &mut old) != 0 {
        HookStatus::Ok
    } else {
        HookStatus::MemoryProtect
    }
}
