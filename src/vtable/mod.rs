//! Dispatch-table probing: locating an object's table, sizing it, and
//! mapping method handles onto slot indices.
//!
//! Two virtual-method encodings are understood. The Itanium ABI stores the
//! slot byte-offset plus one in the member pointer itself; the Microsoft ABI
//! emits a small thunk whose body loads the table pointer and jumps through
//! `[reg+disp]`. Anything else is resolved by scanning the table for the
//! method's code address.

pub mod proxy;

use core::ffi::c_void;

use crate::code::patcher;
use crate::types::{Member, MethodPointer};

/// Safety ceiling for the table-length probe.
pub const MAX_TABLE_SLOTS: usize = 1024;

const WORD: usize = core::mem::size_of::<usize>();

/// Read the dispatch-table pointer: the first machine word of the instance.
///
/// # Safety
///
/// `instance` must point at a live object of a polymorphic type.
pub unsafe fn table_pointer(instance: *const c_void) -> *mut *const c_void {
    (instance as *const *mut *const c_void).read()
}

/// Count table slots up to the first null or non-executable entry, bounded
/// by [`MAX_TABLE_SLOTS`].
///
/// # Safety
///
/// `table` must be readable for the scanned span.
pub unsafe fn table_length(table: *const *const c_void) -> usize {
    let mut len = 0;
    while len < MAX_TABLE_SLOTS {
        let entry = table.add(len).read();
        if entry.is_null() || !patcher::is_executable(entry) {
            break;
        }
        len += 1;
    }
    len
}

enum ThunkDecode {
    /// The bytes are not a dispatch thunk.
    NotThunk,
    /// A dispatch thunk for a slot beyond the table.
    OutOfRange,
    Slot(usize),
}

/// Decode a Microsoft-ABI virtual dispatch thunk at `addr`:
/// an optional `mov rax, [rcx]` / `mov reg, [reg]` table load, then
/// `jmp [reg]`, `jmp [reg+disp8]` or `jmp [reg+disp32]` (`FF /4`).
unsafe fn decode_dispatch_thunk(addr: *const u8, len: usize) -> ThunkDecode {
    let mut p = addr;

    #[cfg(target_pointer_width = "64")]
    {
        if p.read() == 0x48 && p.add(1).read() == 0x8B && p.add(2).read() == 0x01 {
            p = p.add(3);
        }
    }
    #[cfg(target_pointer_width = "32")]
    {
        if p.read() == 0x8B {
            p = p.add(2);
        }
    }

    if p.read() != 0xFF {
        return ThunkDecode::NotThunk;
    }
    let modrm = p.add(1).read();
    if (modrm >> 3) & 7 != 4 {
        return ThunkDecode::NotThunk;
    }
    let mode = modrm >> 6;
    let rm = modrm & 7;
    // mod=00 rm=101 is IP-relative (or absolute disp32) addressing, which is
    // how PLT stubs open; that is not a table dispatch.
    if mode == 0 && rm == 5 {
        return ThunkDecode::NotThunk;
    }

    let disp = match mode {
        0 => 0usize,
        1 => usize::from(p.add(2).read()),
        2 => (p.add(2) as *const u32).read_unaligned() as usize,
        _ => return ThunkDecode::NotThunk, // mod=3 jumps through a register value
    };

    let index = disp / WORD;
    if index < len {
        ThunkDecode::Slot(index)
    } else {
        ThunkDecode::OutOfRange
    }
}

unsafe fn scan(table: *const *const c_void, len: usize, address: *const c_void) -> Option<Member> {
    (0..len).find(|&i| table.add(i).read() == address).map(|index| Member {
        index,
        address,
    })
}

/// Map a method handle onto a slot of `table`.
///
/// # Safety
///
/// `table` must be readable for `len` slots; a handle carrying a code
/// address must point at readable code.
pub unsafe fn resolve(table: *const *const c_void, len: usize, method: MethodPointer) -> Option<Member> {
    if table.is_null() || len == 0 || method.ptr == 0 {
        return None;
    }

    if method.is_itanium_virtual() {
        let index = (method.ptr - 1) / WORD;
        if index < len {
            return Some(Member { index, address: table.add(index).read() });
        }
        // Not a plausible slot offset after all; fall back to matching the
        // encoded value against the table.
        return scan(table, len, method.ptr as *const c_void);
    }

    let address = method.code_address();
    if (address as usize) > 0xFFFF {
        match decode_dispatch_thunk(address as *const u8, len) {
            ThunkDecode::Slot(index) => {
                return Some(Member { index, address: table.add(index).read() })
            }
            ThunkDecode::OutOfRange => return None,
            ThunkDecode::NotThunk => {}
        }
    }

    scan(table, len, address)
}
