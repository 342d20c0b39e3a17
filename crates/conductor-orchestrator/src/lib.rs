//! Pipeline orchestration: the concurrency harness, pipeline engine,
//! director, review engine, completion router, and failure tracker that sit
//! between a materialized task and its approved output.

pub mod completion_router;
pub mod concurrency;
pub mod director;
pub mod event_router;
pub mod failure_tracker;
pub mod pipeline_engine;
pub mod pipeline_templates;
pub mod review_engine;

pub use completion_router::{CompletionRouter, RouteOutcome, RouterError};
pub use concurrency::{run_bounded, HarnessItem, HarnessOutcome, HarnessTask};
pub use director::{AdvanceOutcome, Director, DirectorAction, DirectorError, ReviewDecision};
pub use event_router::{Condition, EventMapping, EventRouter, EventRouterError, TriggerOutcome};
pub use failure_tracker::FailureTracker;
pub use pipeline_engine::{PipelineEngine, PipelineError, StepOutcome, NO_STEPS};
pub use pipeline_templates::{PipelineTemplateError, PipelineTemplateRegistry};
pub use review_engine::{Dimension, DimensionScore, ReviewEngine, ReviewInput, ReviewScoring};
