//! execbox - raw machine code execution and resource-limited shell commands
//!
//! This crate provides:
//! - Hex text codec for machine code listings
//! - W^X executable memory: code is written to read+write pages, then sealed
//!   read+execute before it can be called
//! - A sandbox controller that runs shell commands under coarse resource
//!   limits (rlimits on Unix, Job Objects on Windows)
//! - A per-thread last-error slot mirroring the most recent failure

pub mod cli;
pub mod code;
pub mod config;
pub mod error;
pub mod hex;
pub mod paths;
pub mod platform;
pub mod sandbox;

pub use config::Config;
pub use error::{Error, Result, clear_last_error, last_error};
