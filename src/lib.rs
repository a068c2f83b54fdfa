//! memprobe: a live process-introspection engine for memory editors and
//! reverse-engineering tools.
//!
//! The engine drives a target through capability traits supplied by a
//! debugger backend (see [`backend`]); it never attaches to processes
//! itself.
//!
//! # Module overview
//!
//! ## Core
//!
//! - [`error`]: Error types used throughout the crate.
//! - [`types`]: Core types: `VirtAddr`, `StopEvent`, `TrapHandle`, `CancelToken`.
//! - [`procfs`]: Memory regions, `/proc/pid/maps` parsing and region selection.
//! - [`backend`]: Capability traits: `AddressSpace`, `DebugControl`, `Disassembler`.
//! - [`memory`]: In-memory address space for captured or synthetic images.
//! - [`registers`]: x86_64 register table, register groups and snapshots.
//!
//! ## Value scanning
//!
//! - [`value`]: Value types and their byte encoding.
//! - [`scan_type`]: Scan predicates (exact, increased, between, ...).
//! - [`memscan`]: Progressive scan sessions with single-level undo.
//!
//! ## Code analysis
//!
//! - [`disasm`]: x86_64 disassembly using iced-x86.
//! - [`dissect`]: String, jump and call cross-references from executable regions.
//!
//! ## Execution control
//!
//! - [`breakpoint`]: Breakpoint and watchpoint registry with hit dispositions.
//! - [`tracer`]: Step-by-step instruction tracing with register capture.

pub mod error;
pub mod types;
pub mod procfs;
pub mod backend;
pub mod memory;
pub mod registers;
pub mod value;
pub mod scan_type;
pub mod memscan;
pub mod disasm;
pub mod dissect;
pub mod breakpoint;
pub mod tracer;

#[cfg(test)]
mod testing;
