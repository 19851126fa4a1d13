pub mod context;
pub mod pipeline;
pub mod tracker;

pub use context::AppContext;
pub use pipeline::{
    MAX_HISTORY_QUESTIONS, PipelineError, PredictOutcome, ResponseStatus, handle_question,
};
pub use tracker::{ActivityTracker, now_epoch_secs};
