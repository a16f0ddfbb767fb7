//! The aslrun interpreter.
//!
//! Walks a state-language graph locally: reference paths and intrinsic
//! functions, the per-state data-flow pipeline, Choice evaluation, retry and
//! catch recovery, Parallel/Map fan-out, and the execution controller with
//! abort and run-wide timeout. No filesystem or network access; task
//! resources are supplied by the caller as [`task::TaskHandler`]s.

pub mod choice;
pub mod context;
pub mod dataflow;
pub mod engine;
pub mod event;
pub mod execution;
pub mod intrinsic;
pub mod path;
pub mod retry;
mod runner;
pub mod task;
pub mod validator;

pub use engine::{EngineError, StateMachine};
pub use execution::{ExecutionError, ExecutionHandle, Overrides, RunOptions};
pub use task::{TaskError, TaskHandler, TaskHandlerDyn, TaskHandlerRegistry, task_fn};
pub use validator::{ValidationError, ValidationOptions, ValidationReport, validate};
