//! Client-side prediction: run ahead on local input, then replace and replay
//! whenever the server confirms a tick.

mod input_log;
mod rollback;
mod smoothing;

pub use input_log::InputLog;
pub use rollback::{
    PredictOutcome, PredictionEngine, PredictionState, PredictionStats, ReconcileReport,
    RollbackObserver,
};
pub use smoothing::VisualSmoother;
