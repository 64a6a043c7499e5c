use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{config::validate_tempo, BeatEmitterError, Result};

/// Source of monotonic, high resolution time in milliseconds.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_ms(&self) -> f64;
}

/// Wall clock backed by [`Instant`], measured from its construction.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1_000.0
    }
}

/// Externally advanced clock. Clones share the same time value, so a test or
/// an offline replay can hold one handle while the emitter reads another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    bits: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(time_ms: f64) -> Self {
        let clock = Self::new();
        clock.set(time_ms);
        clock
    }

    pub fn set(&self, time_ms: f64) {
        self.bits.store(time_ms.max(0.0).to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: f64) {
        self.set(self.now_ms() + delta_ms);
    }

    pub fn reset(&self) {
        self.set(0.0);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

/// Live timing state of a started [`PrecisionScheduler`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerState {
    pub start_time: f64,
    pub next_deadline: f64,
    pub period_ms: f64,
}

/// Outcome of one polling iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerTick {
    /// A beat is due at the polled time.
    pub fire: bool,
    /// How long the driver should wait before polling again.
    pub next_poll: Duration,
}

/// Drift-free periodic trigger driven by cooperative polling.
///
/// The scheduler never reads a clock itself; every call receives `now` so the
/// same state machine serves the real-time driver and deterministic replays.
/// Deadlines advance additively from the previous deadline, so the latency of
/// individual polls does not accumulate.
#[derive(Debug, Default)]
pub struct PrecisionScheduler {
    state: Option<SchedulerState>,
}

impl PrecisionScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Converts a tempo in BPM into a beat period in milliseconds.
    pub fn period_for_tempo(tempo: f64) -> Result<f64> {
        validate_tempo(tempo)?;
        Ok(60_000.0 / tempo)
    }

    pub fn is_running(&self) -> bool {
        self.state.is_some()
    }

    pub fn state(&self) -> Option<&SchedulerState> {
        self.state.as_ref()
    }

    /// Anchors the first deadline one period after `now`. The beat at `now`
    /// itself is fired by the caller. A second start is ignored.
    pub fn start(&mut self, period_ms: f64, now: f64) -> Result<()> {
        validate_period(period_ms)?;
        if self.state.is_some() {
            return Ok(());
        }

        self.state = Some(SchedulerState {
            start_time: now,
            next_deadline: now + period_ms,
            period_ms,
        });
        Ok(())
    }

    /// Switches to a new period, re-anchoring the next deadline relative to
    /// `now`. Phase is not preserved, which keeps a large tempo jump from
    /// triggering a burst of catch-up beats.
    pub fn set_period(&mut self, period_ms: f64, now: f64) -> Result<()> {
        validate_period(period_ms)?;
        if let Some(state) = self.state.as_mut() {
            state.period_ms = period_ms;
            state.next_deadline = now + period_ms;
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        self.state = None;
    }

    /// Runs one polling iteration. Returns `None` once stopped, which ends
    /// the polling chain.
    pub fn poll(&mut self, now: f64) -> Option<SchedulerTick> {
        let state = self.state.as_mut()?;

        let mut fire = false;
        if now >= state.next_deadline {
            fire = true;
            state.next_deadline += state.period_ms;

            // Starved loop: skip the backlog instead of rapid-firing it.
            if now - state.next_deadline > state.period_ms {
                tracing::trace!(
                    lag_ms = now - state.next_deadline,
                    period_ms = state.period_ms,
                    "resynchronising beat deadline"
                );
                state.next_deadline = now + state.period_ms;
            }
        }

        Some(SchedulerTick {
            fire,
            next_poll: next_poll_delay(state.next_deadline - now),
        })
    }
}

/// Polling delay for a given distance to the next deadline: poll densely near
/// the deadline and sparsely far from it.
pub fn next_poll_delay(time_to_next_ms: f64) -> Duration {
    let delay_ms = if time_to_next_ms <= 10.0 {
        1.0
    } else if time_to_next_ms <= 50.0 {
        5.0
    } else {
        (time_to_next_ms / 4.0).min(20.0)
    };
    Duration::from_secs_f64(delay_ms / 1_000.0)
}

fn validate_period(period_ms: f64) -> Result<()> {
    if period_ms.is_finite() && period_ms > 0.0 {
        Ok(())
    } else {
        Err(BeatEmitterError::invalid("beat period must be greater than 0"))
    }
}
