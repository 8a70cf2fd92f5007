//! Executable memory: slot allocation near hook targets, page-protection
//! bookkeeping, and instruction-cache maintenance.

pub mod allocator;
pub mod cache;
pub mod patcher;
