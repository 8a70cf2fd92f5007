//! Thread freezer.
//!
//! Any patch wider than one byte must not be applied while another thread's
//! instruction pointer sits inside the bytes being rewritten. The freezer
//! suspends every other thread, moves stranded instruction pointers across
//! the patch using the per-hook offset tables, and resumes the threads after
//! the bytes are in place.
//!
//! Linux has no portable thread-suspension primitive, so the freezer is a
//! no-op there: prologue patches on live multithreaded Linux processes are
//! the caller's responsibility.

use crate::arch::writer::JMP_REL_LEN;
use crate::interceptor::HookEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum FreezeAction {
    Enable,
    Disable,
    ApplyQueued,
}

/// Map a suspended thread's instruction pointer across every hook the
/// current operation is about to change. `scope` selects one hook or all.
pub(super) fn remap_ip(
    hooks: &[HookEntry],
    scope: Option<usize>,
    action: FreezeAction,
    ip: usize,
) -> Option<usize> {
    let range = match scope {
        Some(index) => index..index + 1,
        None => 0..hooks.len(),
    };

    for entry in &hooks[range] {
        let enable = match action {
            FreezeAction::Enable => true,
            FreezeAction::Disable => false,
            FreezeAction::ApplyQueued => entry.queue_enable,
        };
        if entry.enabled == enable {
            continue;
        }

        let mapped = if enable { find_new_ip(entry, ip) } else { find_old_ip(entry, ip) };
        if mapped.is_some() {
            return mapped;
        }
    }

    None
}

/// Target-prologue boundary → trampoline boundary (used while enabling).
fn find_new_ip(entry: &HookEntry, ip: usize) -> Option<usize> {
    entry
        .pairs
        .iter()
        .find(|&(old, _)| ip == entry.target as usize + old)
        .map(|(_, new)| entry.trampoline as usize + new)
}

/// Trampoline boundary → target boundary (used while disabling).
fn find_old_ip(entry: &HookEntry, ip: usize) -> Option<usize> {
    if entry.patch_above && ip == entry.target as usize - JMP_REL_LEN {
        return Some(entry.target as usize);
    }

    if let Some((old, _)) = entry.pairs.iter().find(|&(_, new)| ip == entry.trampoline as usize + new) {
        return Some(entry.target as usize + old);
    }

    // A thread sitting on the relay has not entered the detour yet.
    #[cfg(target_pointer_width = "64")]
    if ip == entry.detour_entry as usize {
        return Some(entry.target as usize);
    }

    None
}

// ── Windows ──────────────────────────────────────────────────────────

#[cfg(windows)]
mod platform {
    use super::{remap_ip, FreezeAction};
    use crate::interceptor::HookEntry;

    use log::trace;
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
    use windows_sys::Win32::System::Diagnostics::Debug::{GetThreadContext, SetThreadContext, CONTEXT};
    use windows_sys::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
    };
    use windows_sys::Win32::System::Threading::{
        GetCurrentProcessId, GetCurrentThreadId, OpenThread, ResumeThread, SuspendThread,
        THREAD_GET_CONTEXT, THREAD_QUERY_INFORMATION, THREAD_SET_CONTEXT, THREAD_SUSPEND_RESUME,
    };

    #[cfg(target_arch = "x86_64")]
    use windows_sys::Win32::System::Diagnostics::Debug::CONTEXT_CONTROL_AMD64 as CONTEXT_CONTROL;
    #[cfg(target_arch = "x86")]
    use windows_sys::Win32::System::Diagnostics::Debug::CONTEXT_CONTROL_X86 as CONTEXT_CONTROL;

    pub(crate) struct FrozenThreads {
        handles: Vec<HANDLE>,
    }

    pub(crate) unsafe fn freeze(
        hooks: &[HookEntry],
        scope: Option<usize>,
        action: FreezeAction,
    ) -> FrozenThreads {
        let mut handles = Vec::new();

        let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0);
        if snapshot != INVALID_HANDLE_VALUE {
            let mut entry: THREADENTRY32 = core::mem::zeroed();
            entry.dwSize = core::mem::size_of::<THREADENTRY32>() as u32;
            if Thread32First(snapshot, &mut entry) != 0 {
                loop {
                    if entry.th32OwnerProcessID == GetCurrentProcessId()
                        && entry.th32ThreadID != GetCurrentThreadId()
                    {
                        let handle = OpenThread(
                            THREAD_SUSPEND_RESUME
                                | THREAD_GET_CONTEXT
                                | THREAD_SET_CONTEXT
                                | THREAD_QUERY_INFORMATION,
                            0,
                            entry.th32ThreadID,
                        );
                        if !handle.is_null() {
                            SuspendThread(handle);
                            relocate_thread(handle, hooks, scope, action);
                            handles.push(handle);
                        }
                    }
                    entry.dwSize = core::mem::size_of::<THREADENTRY32>() as u32;
                    if Thread32Next(snapshot, &mut entry) == 0 {
                        break;
                    }
                }
            }
            CloseHandle(snapshot);
        }

        trace!("froze {} threads", handles.len());
        FrozenThreads { handles }
    }

    unsafe fn relocate_thread(
        handle: HANDLE,
        hooks: &[HookEntry],
        scope: Option<usize>,
        action: FreezeAction,
    ) {
        let mut context: CONTEXT = core::mem::zeroed();
        context.ContextFlags = CONTEXT_CONTROL;
        if GetThreadContext(handle, &mut context) == 0 {
            return;
        }

        #[cfg(target_arch = "x86_64")]
        let ip = context.Rip as usize;
        #[cfg(target_arch = "x86")]
        let ip = context.Eip as usize;

        if let Some(new_ip) = remap_ip(hooks, scope, action, ip) {
            #[cfg(target_arch = "x86_64")]
            {
                context.Rip = new_ip as u64;
            }
            #[cfg(target_arch = "x86")]
            {
                context.Eip = new_ip as u32;
            }
            SetThreadContext(handle, &context);
        }
    }

    pub(crate) unsafe fn unfreeze(threads: FrozenThreads) {
        for handle in threads.handles {
            ResumeThread(handle);
            CloseHandle(handle);
        }
    }
}

// ── macOS ────────────────────────────────────────────────────────────

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
mod platform {
    use super::{remap_ip, FreezeAction};
    use crate::interceptor::HookEntry;

    use log::trace;
    use mach2::kern_return::KERN_SUCCESS;
    use mach2::mach_init::mach_thread_self;
    use mach2::mach_port::mach_port_deallocate;
    use mach2::mach_types::{thread_act_array_t, thread_act_t};
    use mach2::message::mach_msg_type_number_t;
    use mach2::structs::x86_thread_state64_t;
    use mach2::task::task_threads;
    use mach2::thread_act::{thread_get_state, thread_resume, thread_set_state, thread_suspend};
    use mach2::thread_status::x86_THREAD_STATE64;
    use mach2::traps::mach_task_self;
    use mach2::vm_types::mach_vm_address_t;

    pub(crate) struct FrozenThreads {
        ports: Vec<thread_act_t>,
    }

    pub(crate) unsafe fn freeze(
        hooks: &[HookEntry],
        scope: Option<usize>,
        action: FreezeAction,
    ) -> FrozenThreads {
        let task = mach_task_self();
        let mut ports = Vec::new();

        let mut list: thread_act_array_t = core::ptr::null_mut();
        let mut count: mach_msg_type_number_t = 0;
        if task_threads(task, &mut list, &mut count) == KERN_SUCCESS {
            let current = mach_thread_self();
            for i in 0..count as usize {
                let thread = *list.add(i);
                if thread == current {
                    continue;
                }
                thread_suspend(thread);
                relocate_thread(thread, hooks, scope, action);
                ports.push(thread);
            }
            mach_port_deallocate(task, current);
            let _ = mach2::vm::mach_vm_deallocate(
                task,
                list as mach_vm_address_t,
                (count as usize * core::mem::size_of::<thread_act_t>()) as u64,
            );
        }

        trace!("froze {} threads", ports.len());
        FrozenThreads { ports }
    }

    unsafe fn relocate_thread(
        thread: thread_act_t,
        hooks: &[HookEntry],
        scope: Option<usize>,
        action: FreezeAction,
    ) {
        let mut state = x86_thread_state64_t::new();
        let mut count = x86_thread_state64_t::count();
        let kr = thread_get_state(
            thread,
            x86_THREAD_STATE64,
            (&mut state as *mut x86_thread_state64_t).cast(),
            &mut count,
        );
        if kr != KERN_SUCCESS {
            return;
        }

        if let Some(new_ip) = remap_ip(hooks, scope, action, state.__rip as usize) {
            state.__rip = new_ip as u64;
            thread_set_state(
                thread,
                x86_THREAD_STATE64,
                (&mut state as *mut x86_thread_state64_t).cast(),
                x86_thread_state64_t::count(),
            );
        }
    }

    pub(crate) unsafe fn unfreeze(threads: FrozenThreads) {
        let task = mach_task_self();
        for thread in threads.ports {
            thread_resume(thread);
            mach_port_deallocate(task, thread);
        }
    }
}

// ── Platforms without thread suspension ──────────────────────────────

#[cfg(not(any(windows, all(target_os = "macos", target_arch = "x86_64"))))]
mod platform {
    use super::FreezeAction;
    use crate::interceptor::HookEntry;

    pub(crate) struct FrozenThreads;

    pub(crate) unsafe fn freeze(
        _hooks: &[HookEntry],
        _scope: Option<usize>,
        _action: FreezeAction,
    ) -> FrozenThreads {
        FrozenThreads
    }

    pub(crate) unsafe fn unfreeze(_threads: FrozenThreads) {}
}

pub(super) use platform::{freeze, unfreeze};
