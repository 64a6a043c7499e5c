//! Core library for the Beat Emitter.
//!
//! A [`BeatEmitter`] publishes beat events at a controllable tempo. It either
//! generates them from a target tempo with a drift-corrected polling
//! scheduler, or infers them from a stream of energy readings with an
//! adaptive-threshold onset detector and estimates the tempo from the
//! intervals between detected beats. Listeners subscribe through a typed
//! [`EventBus`].

pub mod analysis;
pub mod audio;
pub mod beat;
pub mod config;
pub mod emitter;
pub mod error;
pub mod events;
pub mod timeline;

pub use analysis::{BoundedHistory, Onset, OnsetDetector, TempoEstimate, TempoEstimator};
pub use audio::{band_energy, mean_square_energy, EnergySource, ReplaySource};
pub use beat::{BeatEvent, MeasureCounter};
pub use config::{ConfigOverrides, EmitterConfig, EmitterMode};
pub use emitter::{BeatEmitter, EmitterEvent, EventKind};
pub use error::{BeatEmitterError, Result};
pub use events::{BusEvent, EventBus, ListenerId, ListenerResult};
pub use timeline::{
    next_poll_delay, Clock, ManualClock, MonotonicClock, PrecisionScheduler, SchedulerState,
    SchedulerTick,
};
