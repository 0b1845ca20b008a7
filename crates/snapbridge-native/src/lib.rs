//! Snapbridge Native - Safe access to optional librbd entry points
//!
//! This crate provides:
//! - A handle table that carries per-call state across the C boundary
//! - Runtime symbol resolution for entry points missing from older librbd builds
//! - Snapshot diff enumeration through a single `extern "C"` trampoline
//! - CephFS snapshot directory diffs over a caller-owned mount
//! - An in-memory mock library for testing without librbd

// Allow unused assignments for diagnostic fields - they're used by the thiserror/miette macros
#![allow(unused_assignments)]

pub mod diff;
pub mod error;
pub mod handles;
pub mod image;
pub mod mock;
pub mod mount;
pub mod snapdiff;
pub mod symbols;
pub mod sys;

// Re-export primary types
pub use diff::{
    DiffData, DiffIterateByIdConfig, DiffIterateCallback, DiffIterateConfig, DiffIterateFlags,
    DiffIterator, Extent, ExtentExists, IncludeParent, UserData, WholeObject,
};
pub use error::{BridgeError, Result};
pub use handles::{Handle, HandleTable};
pub use image::Image;
pub use mock::{DiffCall, MockImage, MockLibrary, MockMount, SnapDiffOpen};
pub use mount::Mount;
pub use snapdiff::{EntryType, SnapDiff, SnapDiffConfig, SnapDiffEntry};
pub use symbols::{NativeLibrary, SymbolAddr, SymbolLookup, SymbolResolver};
