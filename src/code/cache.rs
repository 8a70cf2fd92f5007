/// Flush the instruction cache for a patched range.
///
/// x86 and x86-64 keep instruction fetch coherent with data writes, so the
/// POSIX builds have nothing to do. Windows gets the documented call anyway,
/// matching what the platform asks of code patchers.
///
/// # Safety
///
/// `addr` must point at `len` bytes of this process's memory.
#[inline]
pub unsafe fn flush(addr: *const u8, len: usize) {
    #[cfg(windows)]
    {
        use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
        use windows_sys::Win32::System::Threading::GetCurrentProcess;
        FlushInstructionCache(GetCurrentProcess(), addr as *const core::ffi::c_void, len);
    }
    #[cfg(not(windows))]
    {
        let _ = (addr, len);
    }
}
