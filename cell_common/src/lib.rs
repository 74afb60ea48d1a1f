//! Cell Common Library
//!
//! This crate provides shared constants, configuration loading, the Shared
//! Store key catalogue and the violation bit flags for all cell workspace
//! crates.
//!
//! # Module Structure
//!
//! - [`config`] - Configuration loading traits and the `CellConfig` tree
//! - [`consts`] - Workspace-wide numeric limits and protocol offsets
//! - [`io`] - Named digital I/O roles
//! - [`keys`] - Well-known Shared Store paths
//! - [`violation`] - Violation bit flags shared by every FSM
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use cell_common::prelude::*;
//!
//! let cfg = CellConfig::default();
//! assert!(cfg.validate().is_ok());
//! ```

pub mod config;
pub mod consts;
pub mod io;
pub mod keys;
pub mod prelude;
pub mod violation;
