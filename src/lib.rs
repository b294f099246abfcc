//! apiflow - chained API flow execution engine.
//!
//! A flow is an ordered list of HTTP steps. Each step's inputs are
//! templates over a shared variable context; responses are recorded as
//! `API[n]` and can be extracted into named variables for later steps.
//! Assertions decide whether a step passed, and the flow's fail action
//! decides whether a failed step ends the run.

pub mod assertion;
pub mod catalog;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod export;
pub mod model;
pub mod path;
pub mod runner;
pub mod task;
pub mod template;

pub use catalog::{Catalog, Workspace};
pub use config::WorkspaceLoader;
pub use context::Context;
pub use endpoint::execute_endpoint;
pub use error::ConfigError;
pub use executor::StepExecutor;
pub use export::FlowExport;
pub use model::*;
pub use runner::{DefaultFlowRunner, FlowRunner};
pub use task::TaskRunner;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
