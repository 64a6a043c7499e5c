//! Signal-driven beat analysis: rolling windows, onset classification and
//! tempo estimation from inter-beat intervals.

pub mod history;
pub mod onset;
pub mod tempo;

pub use history::BoundedHistory;
pub use onset::{Onset, OnsetDetector, ENERGY_HISTORY_CAPACITY, REFRACTORY_PERIOD_MS};
pub use tempo::{TempoEstimate, TempoEstimator, BEAT_HISTORY_CAPACITY};
