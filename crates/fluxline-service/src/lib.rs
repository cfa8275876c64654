//! Fluxline Service - application services around the pipeline engine
//!
//! Host-agnostic glue between the engine and whatever API layer fronts
//! it: versioned schema storage with file persistence, a run
//! orchestrator that keeps completed traces pollable by `testId`, and
//! an HTTP-backed provider caller for real-mode runs.

pub mod error;
pub mod provider;
pub mod runner;
pub mod store;

// Re-export key types
pub use error::{Result, ServiceError};
pub use provider::HttpProviderCaller;
pub use runner::{PipelineRunner, RunRequest, RunResponse};
pub use store::{SchemaMetadata, SchemaStore};
