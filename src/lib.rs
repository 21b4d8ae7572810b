//! patchbench library crate
//!
//! Drives a patch generator against known vulnerabilities, classifies every
//! candidate diff in a sandbox, and benchmarks generator configurations
//! across many tasks. The two binaries are thin wrappers over these modules.

pub mod budget;
pub mod config;
pub mod detection;
pub mod environment;
pub mod generator;
pub mod git_ops;
pub mod lock;
pub mod logging;
pub mod orchestrator;
pub mod outcome;
pub mod process;
pub mod repair;
pub mod report;
pub mod sandbox;
pub mod usage;
pub mod util;
