//! resync CLI - command-line interface and scheduler daemon
//!
//! This crate ties the pipeline, the upstream client and the destination
//! adapters together behind the `resync` binary.

pub mod config;

pub use config::{Command, Config};
