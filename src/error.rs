//! Pre-flight configuration errors.
//!
//! These abort a run before any request is sent. Failures that happen
//! while a step executes are recorded in its result instead.

use crate::model::RecordId;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("step {step}: endpoint {endpoint_id} not found")]
    MissingEndpoint { step: usize, endpoint_id: RecordId },

    #[error("step {step}: no environment configured")]
    NoEnvironment { step: usize },

    #[error("step {step}: environment {environment_id} not found")]
    MissingEnvironment {
        step: usize,
        environment_id: RecordId,
    },

    #[error("flow {0} not found")]
    MissingFlow(RecordId),

    #[error("task {0} not found")]
    MissingTask(RecordId),

    #[error("endpoint {0} not found")]
    UnknownEndpoint(RecordId),

    #[error("environment {0} not found")]
    UnknownEnvironment(RecordId),
}
