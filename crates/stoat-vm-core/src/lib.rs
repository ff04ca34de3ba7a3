//! # Stoat VM Core
//!
//! Core runtime for a transpiled-bytecode virtual machine. Code compiled
//! from a stack-based bytecode runs as ordinary native functions; this crate
//! supplies everything those functions lean on at run time:
//!
//! - **Object model**: a fixed header (class, mark, vtable, monitor) in
//!   front of every managed allocation
//! - **Class registry**: name-indexed descriptors with precomputed
//!   assignability and interface-dispatch caches
//! - **Tracing collector**: non-moving tri-partition mark-and-sweep with a
//!   rotating mark band, deep-mark deferral, and a background finalizer
//! - **Safepoints**: flag-driven cooperative stop-the-world
//! - **Monitors**: re-entrant per-object locks that cooperate with the
//!   collector instead of deadlocking it
//! - **Exception propagation**: an unwind sentinel carried in `Result` plus
//!   tagged-frame handler lookup
//!
//! The code generator, the class library, and platform I/O live above this
//! crate; the contracts they rely on are documented per module.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod alloc;
pub mod arrays;
pub mod bridge;
pub mod builtin;
pub mod class;
pub mod collector;
pub mod config;
pub mod context;
pub mod error;
pub mod finalizer;
pub mod heap;
pub mod intern;
pub mod monitor;
pub mod object;
pub mod safepoint;
pub mod throw;
pub mod vm;
pub mod weak;

pub use class::{Class, ClassDef, is_assignable_from, is_instance, register_class};
pub use context::{FrameGuard, FrameInfo, VmContext};
pub use error::VmError;
pub use object::{ObjRef, ObjectHeader, Slot};
pub use throw::{Unwind, VmResult};
pub use vm::{init_vm, run_vm, shutdown_vm, spawn_thread};
