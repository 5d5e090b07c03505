//! Design-space exploration: the bounded worker-pool engine and the
//! adaptive Fmax bracket-search optimizer it drives.

pub mod engine;
pub mod optimizer;

pub use engine::{BestRecord, DseConfig, DseEngine, DseSummary};
pub use optimizer::{FlowOutcome, FmaxOptimizer, FmaxOptimizerConfig, Optimizer};
