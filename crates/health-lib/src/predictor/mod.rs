//! Prediction engine: preprocessing, orchestration, assembly and scheduling

mod features;
mod inference;
mod output;
mod scheduler;

pub use features::{FeatureTransformer, ModelInput};
pub use inference::{
    reconstruction_error, FailurePolicy, InferenceError, InferenceOrchestrator, InferenceOutputs, RawOutput,
    TaskKind, TaskOutcome, TickError, DEFAULT_RUL,
};
pub use output::{part_for_class, ResultAssembler, PART_RISK_TABLE};
pub use scheduler::{
    PredictionPipeline, PredictionScheduler, TickReport, TickStatus, TickTrigger, DEFAULT_PREDICTION_INTERVAL,
};
