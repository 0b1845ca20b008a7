//! Snapbridge Admin - RBD administration through the cluster manager
//!
//! This crate provides:
//! - Pool, namespace and image spec strings
//! - A manager command transport backed by the `ceph` CLI, plus a mock
//! - Background task management (`rbd task ...`)

// Allow unused assignments for diagnostic fields - they're used by the thiserror/miette macros
#![allow(unused_assignments)]

pub mod admin;
pub mod commander;
pub mod error;
pub mod spec;
pub mod task;

// Re-export primary types
pub use admin::RbdAdmin;
pub use commander::{
    CephCli, CephCliConfig, CommandResponse, MgrCommand, MgrCommander, MockCommander,
};
pub use error::{AdminError, Result};
pub use spec::{ImageIdSpec, ImageSpec, LevelSpec};
pub use task::{TaskAdmin, TaskRefs, TaskResponse};
