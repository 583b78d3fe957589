//! bioetl-pipeline — Runs one source pipeline end to end.
//!
//! An [`Orchestrator`] composes an [`Extractor`], a [`Transformer`], a
//! [`Validator`] and a [`Writer`], and moves a [`RunContext`] through the
//! stage machine. Limit/sample selection sits between Extract and Transform;
//! the QC gate closes the Validate stage, so a critical breach never reaches
//! the writer.

pub mod context;
pub mod error;
pub mod orchestrator;
pub mod select;
pub mod stage;
pub mod traits;

pub use context::RunContext;
pub use error::{PipelineError, Result, EXIT_FAILURE, EXIT_SUCCESS, EXIT_VALIDATION};
pub use orchestrator::{Orchestrator, RunReport, Selection};
pub use select::{apply_limit, apply_sample};
pub use stage::{Stage, StageMachine};
pub use traits::{
    ArtifactSink, Extractor, IdentityTransformer, SchemaValidator, Transformer, Validator, WriteRequest, Writer,
};
