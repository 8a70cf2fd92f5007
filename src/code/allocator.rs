//! Executable-buffer allocator.
//!
//! Trampolines are carved out of page-sized executable blocks, each split
//! into fixed 64-byte slots threaded on an intrusive free list. On 64-bit
//! targets a block is only usable if it lies within ±512 MiB of the hooked
//! function, so the on-target `E9 rel32` patch always reaches its slot;
//! blocks are therefore mapped by probing the address space near the origin,
//! above it first, then below.

use core::ptr;

use log::debug;

/// Size of one trampoline slot.
pub const SLOT_SIZE: usize = 64;
/// Size of one executable block (one page).
pub const BLOCK_SIZE: usize = 0x1000;
/// Furthest a block may sit from the origin address (64-bit targets).
pub const MAX_REACH: usize = 0x2000_0000;

pub const SLOTS_PER_BLOCK: usize = BLOCK_SIZE / SLOT_SIZE;

/// Free slots carry the next-pointer inside the slot memory itself.
#[repr(C)]
struct FreeSlot {
    next: *mut FreeSlot,
}

struct Block {
    base: *mut u8,
    free: *mut FreeSlot,
    used: u32,
}

impl Block {
    /// # Safety
    ///
    /// `base` must be a fresh writable block of `BLOCK_SIZE` bytes.
    unsafe fn init(base: *mut u8) -> Block {
        let mut free: *mut FreeSlot = ptr::null_mut();
        for i in 0..SLOTS_PER_BLOCK {
            let slot = base.add(i * SLOT_SIZE) as *mut FreeSlot;
            (*slot).next = free;
            free = slot;
        }
        Block { base, free, used: 0 }
    }

    fn contains(&self, p: *const u8) -> bool {
        let addr = p as usize;
        let base = self.base as usize;
        addr >= base && addr < base + BLOCK_SIZE
    }

    fn free_list_len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.free;
        while !cur.is_null() {
            n += 1;
            cur = unsafe { (*cur).next };
        }
        n
    }
}

pub struct SlabAllocator {
    blocks: Vec<Block>,
}

// Raw pointers to process-owned mappings; all access is serialized by the
// registry lock.
unsafe impl Send for SlabAllocator {}

impl SlabAllocator {
    pub fn new() -> Self {
        SlabAllocator { blocks: Vec::new() }
    }

    /// Hand out one slot reachable from `origin`. Returns null-free memory of
    /// `SLOT_SIZE` bytes inside an RWX block, or `None` when no block can be
    /// placed within reach.
    ///
    /// # Safety
    ///
    /// Mapping executable memory; the caller owns the returned slot until
    /// [`SlabAllocator::free`].
    pub unsafe fn allocate(&mut self, origin: *const u8) -> Option<*mut u8> {
        let (min, max) = reach_bounds(origin as usize);

        if let Some(block) = self.blocks.iter_mut().find(|b| {
            let base = b.base as usize;
            base >= min && base + BLOCK_SIZE <= max && !b.free.is_null()
        }) {
            return Some(Self::pop_slot(block));
        }

        let base = map_block_near(origin as usize, min, max)?;
        debug!("mapped trampoline block at {:#x} for origin {:#x}", base as usize, origin as usize);
        self.blocks.push(Block::init(base));
        let block = self.blocks.last_mut().unwrap();
        Some(Self::pop_slot(block))
    }

    unsafe fn pop_slot(block: &mut Block) -> *mut u8 {
        let slot = block.free;
        block.free = (*slot).next;
        block.used += 1;
        slot as *mut u8
    }

    /// Return `slot` to its block; unmap the block once its last slot frees,
    /// unless it is the only block left.
    ///
    /// # Safety
    ///
    /// `slot` must have come from [`SlabAllocator::allocate`] and not been
    /// freed since.
    pub unsafe fn free(&mut self, slot: *mut u8) {
        let index = self
            .blocks
            .iter()
            .position(|b| b.contains(slot))
            .expect("freeing a slot that belongs to no block");

        let block = &mut self.blocks[index];
        let free_slot = slot as *mut FreeSlot;
        (*free_slot).next = block.free;
        block.free = free_slot;
        block.used = block.used.checked_sub(1).expect("block used-count underflow");
        let block_used = block.used;

        if block_used == 0 && self.blocks.len() > 1 {
            let base = self.blocks[index].base;
            unmap_block(base);
            debug!("released trampoline block at {:#x}", base as usize);
            self.blocks.swap_remove(index);
        }
    }

    /// Unmap every block. Final teardown only.
    ///
    /// # Safety
    ///
    /// No live slot may be referenced afterwards.
    pub unsafe fn release_all(&mut self) {
        for block in self.blocks.drain(..) {
            unmap_block(block.base);
        }
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Per-block slot accounting: `used + |free list| == slots_per_block`.
    pub fn accounting_holds(&self) -> bool {
        self.blocks
            .iter()
            .all(|b| b.used as usize + b.free_list_len() == SLOTS_PER_BLOCK)
    }
}

impl Default for SlabAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_pointer_width = "64")]
fn reach_bounds(origin: usize) -> (usize, usize) {
    let gran = allocation_granularity();
    let min = origin.saturating_sub(MAX_REACH).max(gran);
    let max = origin.saturating_add(MAX_REACH).min(highest_map_address());
    (min, max)
}

#[cfg(target_pointer_width = "32")]
fn reach_bounds(_origin: usize) -> (usize, usize) {
    // 32-bit: every address is within rel32 reach.
    (allocation_granularity(), usize::MAX)
}

/// Map one RWX block as close to `origin` as possible, probing free address
/// ranges above the origin first and below it second. Returns `None` when
/// the window is exhausted.
unsafe fn map_block_near(origin: usize, min: usize, max: usize) -> Option<*mut u8> {
    #[cfg(target_pointer_width = "32")]
    {
        // Placement is unconstrained; let the kernel pick.
        let _ = (origin, min, max);
        return map_block_anywhere();
    }

    #[cfg(target_pointer_width = "64")]
    {
        let gran = allocation_granularity();
        let regions = mapped_regions(min, max);

        // Invert the region list into free gaps covering [min, max].
        let mut gaps: Vec<(usize, usize)> = Vec::new();
        let mut prev_end = min;
        for &(start, end) in &regions {
            if start > prev_end {
                gaps.push((prev_end, start.min(max)));
            }
            prev_end = prev_end.max(end);
            if prev_end >= max {
                break;
            }
        }
        if prev_end < max {
            gaps.push((prev_end, max));
        }

        let candidate_in = |gap: (usize, usize)| -> Option<usize> {
            let (lo, hi) = gap;
            if hi <= lo || hi - lo < BLOCK_SIZE {
                return None;
            }
            let mut cand = origin.clamp(lo, hi - BLOCK_SIZE) & !(gran - 1);
            if cand < lo {
                cand = (lo + gran - 1) & !(gran - 1);
            }
            if cand >= lo && cand + BLOCK_SIZE <= hi {
                Some(cand)
            } else {
                None
            }
        };

        // Above the origin first, nearest gap first.
        for &gap in gaps.iter().filter(|g| g.1 > origin) {
            if let Some(cand) = candidate_in(gap) {
                if let Some(base) = map_block_fixed(cand) {
                    return check_reach(base, origin);
                }
            }
        }
        // Then below, nearest gap first.
        for &gap in gaps.iter().rev().filter(|g| g.0 < origin) {
            if let Some(cand) = candidate_in(gap) {
                if let Some(base) = map_block_fixed(cand) {
                    return check_reach(base, origin);
                }
            }
        }

        None
    }
}

/// A fixed-address request the OS "honored" somewhere else is useless: the
/// rel32 patch could not reach it. Release and fail.
#[cfg(target_pointer_width = "64")]
unsafe fn check_reach(base: *mut u8, origin: usize) -> Option<*mut u8> {
    let diff = (base as usize as i64).wrapping_sub(origin as i64);
    if !(i32::MIN as i64..=i32::MAX as i64).contains(&diff) {
        unmap_block(base);
        return None;
    }
    Some(base)
}

// ── POSIX page-granularity helpers ───────────────────────────────────

#[cfg(unix)]
fn allocation_granularity() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(all(unix, target_pointer_width = "64"))]
fn highest_map_address() -> usize {
    // Canonical user-space ceiling.
    1usize << 47
}

#[cfg(target_os = "linux")]
unsafe fn mapped_regions(min: usize, max: usize) -> Vec<(usize, usize)> {
    let mut regions: Vec<(usize, usize)> = Vec::new();
    if let Ok(maps) = std::fs::read_to_string("/proc/self/maps") {
        for line in maps.lines() {
            let Some(range) = line.split_whitespace().next() else { continue };
            let Some((start_s, end_s)) = range.split_once('-') else { continue };
            let Ok(start) = usize::from_str_radix(start_s, 16) else { continue };
            let Ok(end) = usize::from_str_radix(end_s, 16) else { continue };
            if end > min && start < max {
                regions.push((start, end));
            }
        }
    }
    regions.sort_by_key(|&(s, _)| s);
    regions
}

#[cfg(target_os = "linux")]
unsafe fn map_block_fixed(addr: usize) -> Option<*mut u8> {
    let ptr = libc::mmap(
        addr as *mut libc::c_void,
        BLOCK_SIZE,
        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
        -1,
        0,
    );
    if ptr == libc::MAP_FAILED {
        None
    } else {
        Some(ptr as *mut u8)
    }
}

#[cfg(all(unix, target_pointer_width = "32"))]
unsafe fn map_block_anywhere() -> Option<*mut u8> {
    let ptr = libc::mmap(
        ptr::null_mut(),
        BLOCK_SIZE,
        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if ptr == libc::MAP_FAILED {
        None
    } else {
        Some(ptr as *mut u8)
    }
}

#[cfg(unix)]
unsafe fn unmap_block(base: *mut u8) {
    libc::munmap(base as *mut libc::c_void, BLOCK_SIZE);
}

#[cfg(target_os = "macos")]
unsafe fn mapped_regions(min: usize, max: usize) -> Vec<(usize, usize)> {
    use mach2::kern_return::KERN_SUCCESS;
    use mach2::traps::mach_task_self;
    use mach2::vm_region::{vm_region_basic_info_64, VM_REGION_BASIC_INFO_64};
    use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};

    let task = mach_task_self();
    let mut regions: Vec<(usize, usize)> = Vec::new();
    let mut addr: mach_vm_address_t = min as mach_vm_address_t;

    loop {
        let mut region_addr = addr;
        let mut region_size: mach_vm_size_t = 0;
        let mut info: vm_region_basic_info_64 = core::mem::zeroed();
        let mut info_count = vm_region_basic_info_64::count();
        let mut object_name: u32 = 0;

        let kr = mach2::vm::mach_vm_region(
            task,
            &mut region_addr,
            &mut region_size,
            VM_REGION_BASIC_INFO_64,
            (&mut info as *mut _) as mach2::vm_region::vm_region_info_t,
            &mut info_count,
            &mut object_name,
        );
        if kr != KERN_SUCCESS || region_addr as usize >= max {
            break;
        }
        regions.push((region_addr as usize, (region_addr + region_size) as usize));
        addr = region_addr + region_size;
    }

    regions
}

#[cfg(target_os = "macos")]
unsafe fn map_block_fixed(addr: usize) -> Option<*mut u8> {
    use mach2::kern_return::KERN_SUCCESS;
    use mach2::traps::mach_task_self;
    use mach2::vm::{mach_vm_allocate, mach_vm_deallocate, mach_vm_protect};
    use mach2::vm_prot::{VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};
    use mach2::vm_statistics::VM_FLAGS_FIXED;
    use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};

    let task = mach_task_self();
    let mut out: mach_vm_address_t = addr as mach_vm_address_t;
    let kr = mach_vm_allocate(task, &mut out, BLOCK_SIZE as mach_vm_size_t, VM_FLAGS_FIXED);
    if kr != KERN_SUCCESS {
        return None;
    }
    let kr = mach_vm_protect(
        task,
        out,
        BLOCK_SIZE as mach_vm_size_t,
        0,
        VM_PROT_READ | VM_PROT_WRITE | VM_PROT_EXECUTE,
    );
    if kr != KERN_SUCCESS {
        let _ = mach_vm_deallocate(task, out, BLOCK_SIZE as mach_vm_size_t);
        return None;
    }
    Some(out as *mut u8)
}

// ── Windows allocation-granularity helpers ───────────────────────────

#[cfg(windows)]
fn allocation_granularity() -> usize {
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
    unsafe {
        let mut si: SYSTEM_INFO = core::mem::zeroed();
        GetSystemInfo(&mut si);
        si.dwAllocationGranularity as usize
    }
}

#[cfg(all(windows, target_pointer_width = "64"))]
fn highest_map_address() -> usize {
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
    unsafe {
        let mut si: SYSTEM_INFO = core::mem::zeroed();
        GetSystemInfo(&mut si);
        si.lpMaximumApplicationAddress as usize
    }
}

#[cfg(windows)]
unsafe fn mapped_regions(min: usize, max: usize) -> Vec<(usize, usize)> {
    use windows_sys::Win32::System::Memory::{VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_FREE};

    let mut regions: Vec<(usize, usize)> = Vec::new();
    let mut addr = min;
    while addr < max {
        let mut mbi: MEMORY_BASIC_INFORMATION = core::mem::zeroed();
        if VirtualQuery(addr as *const core::ffi::c_void, &mut mbi, core::mem::size_of_val(&mbi)) == 0 {
            break;
        }
        let start = mbi.BaseAddress as usize;
        let end = start + mbi.RegionSize;
        if mbi.State != MEM_FREE {
            regions.push((start, end));
        }
        addr = end;
    }
    regions
}

#[cfg(windows)]
unsafe fn map_block_fixed(addr: usize) -> Option<*mut u8> {
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
    };
    let ptr = VirtualAlloc(addr as *const core::ffi::c_void, BLOCK_SIZE, MEM_COMMIT | MEM_RESERVE, PAGE_EXECUTE_READWRITE);
    if ptr.is_null() {
        None
    } else {
        Some(ptr as *mut u8)
    }
}

#[cfg(all(windows, target_pointer_width = "32"))]
unsafe fn map_block_anywhere() -> Option<*mut u8> {
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
    };
    let ptr = VirtualAlloc(ptr::null(), BLOCK_SIZE, MEM_COMMIT | MEM_RESERVE, PAGE_EXECUTE_READWRITE);
    if ptr.is_null() {
        None
    } else {
        Some(ptr as *mut u8)
    }
}

#[cfg(windows)]
unsafe fn unmap_block(base: *mut u8) {
    use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};
    VirtualFree(base as *mut core::ffi::c_void, 0, MEM_RELEASE);
}
