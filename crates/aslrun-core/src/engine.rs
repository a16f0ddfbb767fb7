//! Interpreter engine facade.
//!
//! A `StateMachine` is a validated, immutable definition. Each call to
//! [`StateMachine::run`] spawns an independent execution; many runs may share
//! one machine concurrently.

use std::sync::Arc;

use aslrun_types::definition::StateMachineDefinition;
use serde_json::Value;
use thiserror::Error;

use crate::execution::{self, ExecutionHandle, RunOptions};
use crate::validator::{self, ValidationError, ValidationOptions};

/// Name used for the context object when none is given.
pub const DEFAULT_STATE_MACHINE_NAME: &str = "StateMachine";

/// Errors constructing a `StateMachine`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to parse definition: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// A validated state machine ready to run.
#[derive(Debug, Clone)]
pub struct StateMachine {
    definition: Arc<StateMachineDefinition>,
    name: String,
}

impl StateMachine {
    /// Validate `definition` with default options.
    pub fn new(definition: StateMachineDefinition) -> Result<Self, ValidationError> {
        Self::with_options(definition, ValidationOptions::default())
    }

    pub fn with_options(
        definition: StateMachineDefinition,
        options: ValidationOptions,
    ) -> Result<Self, ValidationError> {
        validator::validate(&definition, options).into_result()?;
        Ok(Self {
            definition: Arc::new(definition),
            name: DEFAULT_STATE_MACHINE_NAME.to_string(),
        })
    }

    /// Parse and validate a JSON definition.
    pub fn from_json(json: &str, options: ValidationOptions) -> Result<Self, EngineError> {
        let definition = StateMachineDefinition::from_json(json)?;
        Ok(Self::with_options(definition, options)?)
    }

    /// Set the name reported in `$$.StateMachine.Name`.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn definition(&self) -> &StateMachineDefinition {
        &self.definition
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start one execution. Must be called within a tokio runtime.
    pub fn run(&self, input: Value, options: RunOptions) -> ExecutionHandle {
        execution::start(Arc::clone(&self.definition), &self.name, input, options)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
