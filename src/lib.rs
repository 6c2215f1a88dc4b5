//! Profile compiler and staged image builder for Fry IoT Debian images.
//!
//! A base document and a per-device profile are merged into an immutable
//! [`BuildPlan`](plan::BuildPlan). The plan drives a resumable chain of stages
//! that bootstrap a Debian rootfs, install packages, inject network and Fry
//! services, and assemble, compress and validate a bootable disk image.
//!
//! # Architecture
//!
//! ```text
//! base-config.toml ─┐
//!                   ├─► config::load ─► plan::merge ─► BuildPlan
//! profile-config ───┘                                    │
//!                     packages::resolve, network, fry ◄──┤
//!                                                        ▼
//!                                  stages::StageExecutor (markers in work/<p>/state)
//!                                                        │
//!                          artifact::disk ─► compress ─► validate
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use fry_builder::plan::Overrides;
//! use fry_builder::project::Project;
//! use fry_builder::stages::{StageContext, StageExecutor, StageOptions};
//! use fry_builder::tools::SystemToolRunner;
//!
//! let project = Project::new(".");
//! let plan = project.load_plan(&Overrides::new("x86-64"))?;
//! let workspace = project.workspace(&plan);
//! let ctx = StageContext::prepare(&plan, &workspace, &SystemToolRunner, None, StageOptions::default())?;
//! StageExecutor::new(ctx).run_all()?;
//! ```

pub mod artifact;
pub mod batch;
pub mod config;
pub mod emulator;
pub mod error;
pub mod fry;
pub mod network;
pub mod packages;
pub mod plan;
pub mod preflight;
pub mod project;
pub mod stages;
pub mod tools;
pub mod validate;
pub mod workspace;

pub use error::{BuildError, Severity, ValidationFinding};
pub use plan::{BuildPlan, Overrides};
pub use project::Project;
pub use stages::{StageExecutor, StageId};
