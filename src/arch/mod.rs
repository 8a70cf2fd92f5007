//! x86/x86-64 instruction handling: decode facade, stub emitter, and the
//! prologue relocator that builds trampolines.

pub mod decoder;
pub mod relocator;
pub mod writer;
