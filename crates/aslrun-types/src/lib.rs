//! Shared domain types for aslrun.
//!
//! This crate contains the serde model of the state language (definitions,
//! states, choice rules, retriers and catchers), the `ErrorRecord` used for
//! retry/catch matching, execution status and event types, and the CLI
//! configuration shape.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod choice;
pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod execution;
