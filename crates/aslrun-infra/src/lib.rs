//! Infrastructure collaborators for aslrun.
//!
//! Filesystem and process access stays out of `aslrun-core`; this crate
//! provides the config loader, definition/input loaders, and the
//! script-backed task handler used by the CLI.

pub mod config;
pub mod definition;
pub mod script;
