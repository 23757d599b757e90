#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod commands;
pub mod config;
pub mod control_plane;
pub mod error;
pub mod executor;
pub mod identity;
pub mod observer;
pub mod paths;
pub mod plan;
pub mod report;
pub mod state;
pub mod verify;

/// Tool version stamped into every ownership marker.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
