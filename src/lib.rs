//! # Testflow
//!
//! Compiles a tree of workflow stages into the containers that run it and the
//! action tape each container's init process replays.
//!
//! ## Usage
//!
//! ```bash
//! testflow compile workflow.yaml [--isolated] [--format yaml]
//! testflow plan workflow.yaml [--grouped]
//! ```
//!
//! ## Modules
//!
//! - `action` - Action tape and the pipeline steps that build it
//! - `compiler` - End-to-end compilation facade
//! - `config` - Built-in images, paths and compiler switches
//! - `error` - Error types
//! - `expression` - Condition and template expressions with partial evaluation
//! - `stage` - Stage tree and container configuration
pub mod action;
pub mod compiler;
pub mod config;
pub mod error;
pub mod expression;
pub mod stage;

pub use action::{Action, ActionGroups, ActionList};
pub use compiler::{CompiledContainer, CompiledWorkflow, Compiler};
pub use config::CompilerConfig;
pub use error::{Error, Result};
pub use stage::{ContainerConfig, Stage};
