//! The [`BeatEmitter`] controller.
//!
//! One emitter runs in exactly one [`EmitterMode`]. In generation mode the
//! [`PrecisionScheduler`] decides when beats fire and [`BeatEmitter::poll`]
//! is the polling loop body. In detection mode every energy reading goes
//! through the [`OnsetDetector`] and accepted onsets feed the
//! [`TempoEstimator`].
//!
//! State sits behind a single mutex which is never held while listeners run,
//! so listeners are free to call back into the emitter, `stop()` included.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

use crate::{
    analysis::{OnsetDetector, TempoEstimate, TempoEstimator},
    audio::EnergySource,
    beat::{BeatEvent, MeasureCounter},
    config::{validate_beats_per_measure, validate_tempo, ConfigOverrides, EmitterConfig, EmitterMode},
    events::{BusEvent, EventBus, ListenerId, ListenerResult},
    timeline::{Clock, MonotonicClock, PrecisionScheduler},
    BeatEmitterError, Result,
};

/// Names of the events published by a [`BeatEmitter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Beat,
    Tempo,
    Started,
    Stopped,
    Error,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Beat => "beat",
            Self::Tempo => "tempo",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub enum EmitterEvent {
    Beat(BeatEvent),
    Tempo(TempoEstimate),
    Started,
    Stopped,
    Error(Arc<BeatEmitterError>),
}

impl BusEvent for EmitterEvent {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        match self {
            Self::Beat(_) => EventKind::Beat,
            Self::Tempo(_) => EventKind::Tempo,
            Self::Started => EventKind::Started,
            Self::Stopped => EventKind::Stopped,
            Self::Error(_) => EventKind::Error,
        }
    }
}

/// Components of the active mode. Only one set exists at a time.
#[derive(Debug)]
enum Engine {
    Generation(PrecisionScheduler),
    Detection {
        detector: OnsetDetector,
        estimator: TempoEstimator,
    },
}

impl Engine {
    fn for_config(config: &EmitterConfig) -> Self {
        match config.mode {
            EmitterMode::Generation => Self::Generation(PrecisionScheduler::new()),
            EmitterMode::Detection => Self::Detection {
                detector: OnsetDetector::new(config.detection_threshold),
                estimator: TempoEstimator::new(),
            },
        }
    }

    fn reset(&mut self) {
        match self {
            Self::Generation(scheduler) => scheduler.stop(),
            Self::Detection {
                detector,
                estimator,
            } => {
                detector.reset();
                estimator.reset();
            }
        }
    }
}

#[derive(Debug)]
struct EmitterState {
    config: EmitterConfig,
    running: bool,
    /// Bumped on every start and stop so work queued by an older run can
    /// tell it has been superseded.
    session: u64,
    beat_count: u64,
    measure: MeasureCounter,
    engine: Engine,
}

impl EmitterState {
    fn is_current(&self, session: u64) -> bool {
        self.running && self.session == session
    }

    fn reset_run(&mut self) {
        self.session += 1;
        self.beat_count = 0;
        self.measure.reset();
        self.engine.reset();
    }

    fn generated_beat(&mut self, now: f64) -> BeatEvent {
        self.beat_count += 1;
        self.measure
            .beat(now, self.config.fixed_intensity, Some(self.config.tempo))
    }
}

/// A beat waiting to be dispatched outside the state lock, with the tempo
/// update that should follow it.
struct PendingBeat {
    beat: BeatEvent,
    session: u64,
    tempo: Option<TempoEstimate>,
}

/// Cloneable handle to a beat emitter. Clones share state and listeners.
#[derive(Clone)]
pub struct BeatEmitter {
    state: Arc<Mutex<EmitterState>>,
    source: Arc<Mutex<Option<Box<dyn EnergySource>>>>,
    events: Arc<EventBus<EmitterEvent>>,
    clock: Arc<dyn Clock>,
}

impl BeatEmitter {
    /// Creates an emitter timed by the process' monotonic clock.
    pub fn new(config: EmitterConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(config: EmitterConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let state = EmitterState {
            measure: MeasureCounter::new(config.beats_per_measure)?,
            engine: Engine::for_config(&config),
            config,
            running: false,
            session: 0,
            beat_count: 0,
        };

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            source: Arc::new(Mutex::new(None)),
            events: Arc::new(EventBus::new()),
            clock,
        })
    }

    /// Installs the signal source read by [`BeatEmitter::tick`]. When the
    /// emitter is already detecting, the new source is acquired right away
    /// and the previous one released.
    pub fn attach_source<S>(&self, source: S) -> Result<()>
    where
        S: EnergySource + 'static,
    {
        let mut source: Box<dyn EnergySource> = Box::new(source);
        if self.is_detecting()? {
            source.acquire().map_err(into_acquisition_failure)?;
        }

        let mut slot = self.lock_source()?;
        if let Some(mut previous) = slot.replace(source) {
            previous.release();
        }
        Ok(())
    }

    pub fn events(&self) -> &EventBus<EmitterEvent> {
        &self.events
    }

    /// Starts generating or detecting beats. Calling it on a running emitter
    /// does nothing.
    ///
    /// In generation mode the first beat fires synchronously, followed by a
    /// `tempo` event. In detection mode the attached source is acquired; if
    /// that fails the emitter stays stopped, an `error` event is published
    /// and the failure is returned.
    pub fn start(&self) -> Result<()> {
        let (mode, session) = {
            let mut guard = self.lock_state()?;
            let state = &mut *guard;
            if state.running {
                return Ok(());
            }
            if state.config.mode == EmitterMode::Generation {
                validate_tempo(state.config.tempo)?;
            }

            state.reset_run();
            state.running = true;
            (state.config.mode, state.session)
        };

        tracing::debug!(%mode, "starting beat emitter");
        match mode {
            EmitterMode::Generation => {
                if let Err(err) = self.start_generation(session) {
                    self.roll_back_start(session);
                    return Err(err);
                }
            }
            EmitterMode::Detection => {
                if let Err(err) = self.acquire_source() {
                    return Err(self.abort_start(session, err));
                }
            }
        }

        if self.is_current(session)? {
            self.events.emit(&EmitterEvent::Started);
        }
        Ok(())
    }

    /// Stops the emitter and discards all rolling state: histories, beat
    /// counter, measure position and deadlines. Safe to call from a listener.
    pub fn stop(&self) -> Result<()> {
        {
            let mut state = self.lock_state()?;
            if !state.running {
                return Ok(());
            }
            state.running = false;
            state.reset_run();
        }

        if let Some(source) = self.lock_source()?.as_mut() {
            source.release();
        }

        tracing::debug!("beat emitter stopped");
        self.events.emit(&EmitterEvent::Stopped);
        Ok(())
    }

    /// Runs one iteration of the generation polling loop and returns how long
    /// to wait before the next one. `None` means the loop should end.
    pub fn poll(&self) -> Result<Option<Duration>> {
        let (next_poll, pending) = {
            let mut guard = self.lock_state()?;
            let state = &mut *guard;
            if !state.running {
                return Ok(None);
            }

            let now = self.clock.now_ms();
            let Engine::Generation(scheduler) = &mut state.engine else {
                return Ok(None);
            };
            let Some(tick) = scheduler.poll(now) else {
                return Ok(None);
            };

            let pending = tick.fire.then(|| PendingBeat {
                beat: state.generated_beat(now),
                session: state.session,
                tempo: None,
            });
            (tick.next_poll, pending)
        };

        if let Some(pending) = pending {
            self.dispatch_beat(pending)?;
        }

        Ok(self.is_active()?.then_some(next_poll))
    }

    /// Drives the generation loop on the calling thread until the emitter is
    /// stopped.
    pub fn run(&self) -> Result<()> {
        while let Some(delay) = self.poll()? {
            thread::sleep(delay);
        }
        Ok(())
    }

    /// Runs [`BeatEmitter::run`] on a dedicated thread.
    pub fn spawn(&self) -> thread::JoinHandle<Result<()>> {
        let emitter = self.clone();
        thread::spawn(move || emitter.run())
    }

    /// Reads one value from the attached source and classifies it. Read
    /// failures are published as `error` events and do not stop detection.
    pub fn tick(&self) -> Result<bool> {
        if !self.is_detecting()? {
            return Ok(false);
        }

        let reading = match self.lock_source()?.as_mut() {
            Some(source) => source.read_energy(),
            None => Ok(None),
        };

        match reading {
            Ok(Some(energy)) => self.process_energy(energy),
            Ok(None) => Ok(false),
            Err(err) => {
                tracing::warn!(error = %err, "energy source read failed");
                self.events.emit(&EmitterEvent::Error(Arc::new(err)));
                Ok(false)
            }
        }
    }

    /// Classifies a reading taken now. Returns `true` when it produced a beat.
    pub fn process_energy(&self, energy: f64) -> Result<bool> {
        self.process_energy_at(energy, self.clock.now_ms())
    }

    /// Classifies a reading taken at `timestamp` (ms on the emitter's clock).
    pub fn process_energy_at(&self, energy: f64, timestamp: f64) -> Result<bool> {
        let pending = {
            let mut guard = self.lock_state()?;
            let state = &mut *guard;
            if !state.running {
                return Ok(false);
            }

            let Engine::Detection {
                detector,
                estimator,
            } = &mut state.engine
            else {
                return Ok(false);
            };
            let Some(onset) = detector.classify(energy, timestamp) else {
                return Ok(false);
            };

            estimator.record(onset.timestamp);
            let estimate = estimator.estimate();
            let reportable = estimate.is_reportable(estimator.recorded_count());

            state.beat_count += 1;
            let tempo = estimate.is_known().then_some(estimate.tempo);
            PendingBeat {
                beat: state.measure.beat(onset.timestamp, onset.intensity, tempo),
                session: state.session,
                tempo: reportable.then_some(estimate),
            }
        };

        self.dispatch_beat(pending)?;
        Ok(true)
    }

    /// Changes the tempo. A running generator re-anchors its next beat one
    /// new period from now and announces the new tempo.
    pub fn set_bpm(&self, bpm: f64) -> Result<()> {
        validate_tempo(bpm)?;
        let announce = {
            let mut guard = self.lock_state()?;
            let state = &mut *guard;
            state.config = EmitterConfig {
                tempo: bpm,
                ..state.config.clone()
            };
            self.retime(state)?
        };

        if let Some(tempo) = announce {
            self.events.emit(&EmitterEvent::Tempo(tempo));
        }
        Ok(())
    }

    pub fn set_beats_per_measure(&self, beats_per_measure: u32) -> Result<()> {
        validate_beats_per_measure(beats_per_measure)?;
        let mut guard = self.lock_state()?;
        let state = &mut *guard;
        state.measure.set_beats_per_measure(beats_per_measure)?;
        state.config = EmitterConfig {
            beats_per_measure,
            ..state.config.clone()
        };
        Ok(())
    }

    /// Merges `overrides` over the current configuration. The merged
    /// snapshot is validated as a whole before anything changes; the mode can
    /// only change while stopped.
    pub fn update_options(&self, overrides: &ConfigOverrides) -> Result<()> {
        if overrides.is_empty() {
            return Ok(());
        }

        let announce = {
            let mut guard = self.lock_state()?;
            let state = &mut *guard;
            let next = state.config.merged(overrides);
            next.validate()?;
            if state.running && next.mode != state.config.mode {
                return Err(BeatEmitterError::invalid(
                    "mode cannot change while the emitter is running",
                ));
            }

            let previous = std::mem::replace(&mut state.config, next);
            state
                .measure
                .set_beats_per_measure(state.config.beats_per_measure)?;

            if state.config.mode != previous.mode {
                state.engine = Engine::for_config(&state.config);
            } else if let Engine::Detection { detector, .. } = &mut state.engine {
                detector.set_threshold(state.config.detection_threshold);
            }

            tracing::debug!(config = ?state.config, "options updated");
            if state.config.tempo != previous.tempo {
                self.retime(state)?
            } else {
                None
            }
        };

        if let Some(tempo) = announce {
            self.events.emit(&EmitterEvent::Tempo(tempo));
        }
        Ok(())
    }

    pub fn options(&self) -> Result<EmitterConfig> {
        Ok(self.lock_state()?.config.clone())
    }

    pub fn current_bpm(&self) -> Result<f64> {
        Ok(self.lock_state()?.config.tempo)
    }

    pub fn mode(&self) -> Result<EmitterMode> {
        Ok(self.lock_state()?.config.mode)
    }

    pub fn is_active(&self) -> Result<bool> {
        Ok(self.lock_state()?.running)
    }

    /// Number of beats emitted since the last start or counter reset.
    pub fn beat_count(&self) -> Result<u64> {
        Ok(self.lock_state()?.beat_count)
    }

    /// Zeroes the beat counter, returns to the first beat of the measure and
    /// forgets detected beat history.
    pub fn reset_beat_count(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        state.beat_count = 0;
        state.measure.reset();
        if let Engine::Detection { estimator, .. } = &mut state.engine {
            estimator.reset();
        }
        Ok(())
    }

    /// Position the next beat will carry, `1..=beats_per_measure`.
    pub fn current_beat(&self) -> Result<u32> {
        Ok(self.lock_state()?.measure.current())
    }

    pub fn beats_per_measure(&self) -> Result<u32> {
        Ok(self.lock_state()?.measure.beats_per_measure())
    }

    pub fn reset_to_first_beat(&self) -> Result<()> {
        self.lock_state()?.measure.reset();
        Ok(())
    }

    /// Current tempo: estimated from detected beats, or the configured tempo
    /// at full confidence when generating.
    pub fn tempo_estimate(&self) -> Result<TempoEstimate> {
        let state = self.lock_state()?;
        Ok(match &state.engine {
            Engine::Detection { estimator, .. } => estimator.estimate(),
            Engine::Generation(_) => TempoEstimate::exact(state.config.tempo, self.clock.now_ms()),
        })
    }

    pub fn on_beat<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&BeatEvent) -> ListenerResult + Send + Sync + 'static,
    {
        self.events.on(EventKind::Beat, move |event| match event {
            EmitterEvent::Beat(beat) => listener(beat),
            _ => Ok(()),
        })
    }

    pub fn once_beat<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&BeatEvent) -> ListenerResult + Send + Sync + 'static,
    {
        self.events.once(EventKind::Beat, move |event| match event {
            EmitterEvent::Beat(beat) => listener(beat),
            _ => Ok(()),
        })
    }

    pub fn on_tempo<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&TempoEstimate) -> ListenerResult + Send + Sync + 'static,
    {
        self.events.on(EventKind::Tempo, move |event| match event {
            EmitterEvent::Tempo(tempo) => listener(tempo),
            _ => Ok(()),
        })
    }

    pub fn on_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&BeatEmitterError) -> ListenerResult + Send + Sync + 'static,
    {
        self.events.on(EventKind::Error, move |event| match event {
            EmitterEvent::Error(err) => listener(err),
            _ => Ok(()),
        })
    }

    pub fn on_started<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() -> ListenerResult + Send + Sync + 'static,
    {
        self.events.on(EventKind::Started, move |_| listener())
    }

    pub fn on_stopped<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() -> ListenerResult + Send + Sync + 'static,
    {
        self.events.on(EventKind::Stopped, move |_| listener())
    }

    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        self.events.off(kind, id)
    }

    fn start_generation(&self, session: u64) -> Result<()> {
        let pending = {
            let mut guard = self.lock_state()?;
            let state = &mut *guard;
            let now = self.clock.now_ms();
            let tempo = state.config.tempo;
            let period = state.config.period_ms()?;
            let Engine::Generation(scheduler) = &mut state.engine else {
                return Err(BeatEmitterError::msg("generation engine is not active"));
            };
            scheduler.start(period, now)?;

            PendingBeat {
                beat: state.generated_beat(now),
                session,
                tempo: Some(TempoEstimate::exact(tempo, now)),
            }
        };

        self.dispatch_beat(pending)
    }

    fn acquire_source(&self) -> Result<()> {
        match self.lock_source()?.as_mut() {
            Some(source) => source.acquire().map_err(into_acquisition_failure),
            None => {
                tracing::warn!(
                    "detection started without an energy source; only direct readings are classified"
                );
                Ok(())
            }
        }
    }

    fn roll_back_start(&self, session: u64) {
        if let Ok(mut state) = self.lock_state() {
            if state.session == session {
                state.running = false;
            }
        }
    }

    /// Rolls a failed acquisition back and reports it on both channels.
    fn abort_start(&self, session: u64, err: BeatEmitterError) -> BeatEmitterError {
        self.roll_back_start(session);

        let reason = match err {
            BeatEmitterError::AcquisitionFailure(reason) => reason,
            other => other.to_string(),
        };
        tracing::error!(error = %reason, "failed to start beat detection");
        self.events
            .emit(&EmitterEvent::Error(Arc::new(BeatEmitterError::acquisition(reason.clone()))));
        BeatEmitterError::acquisition(reason)
    }

    /// Publishes a beat, then advances the measure unless the run it belongs
    /// to has ended meanwhile, then publishes the tempo update if any.
    fn dispatch_beat(&self, pending: PendingBeat) -> Result<()> {
        self.events.emit(&EmitterEvent::Beat(pending.beat));

        {
            let mut state = self.lock_state()?;
            if !state.is_current(pending.session) {
                return Ok(());
            }
            state.measure.advance();
        }

        if let Some(tempo) = pending.tempo {
            self.events.emit(&EmitterEvent::Tempo(tempo));
        }
        Ok(())
    }

    fn retime(&self, state: &mut EmitterState) -> Result<Option<TempoEstimate>> {
        if !state.running {
            return Ok(None);
        }
        let tempo = state.config.tempo;
        let period = state.config.period_ms()?;
        let Engine::Generation(scheduler) = &mut state.engine else {
            return Ok(None);
        };

        let now = self.clock.now_ms();
        scheduler.set_period(period, now)?;
        tracing::debug!(tempo, "tempo changed, next beat re-anchored");
        Ok(Some(TempoEstimate::exact(tempo, now)))
    }

    fn is_current(&self, session: u64) -> Result<bool> {
        Ok(self.lock_state()?.is_current(session))
    }

    fn is_detecting(&self) -> Result<bool> {
        let state = self.lock_state()?;
        Ok(state.running && state.config.mode == EmitterMode::Detection)
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, EmitterState>> {
        self.state
            .lock()
            .map_err(|_| BeatEmitterError::msg("emitter state has been poisoned"))
    }

    fn lock_source(&self) -> Result<MutexGuard<'_, Option<Box<dyn EnergySource>>>> {
        self.source
            .lock()
            .map_err(|_| BeatEmitterError::msg("energy source has been poisoned"))
    }
}

impl fmt::Debug for BeatEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("BeatEmitter");
        match self.state.lock() {
            Ok(state) => debug
                .field("mode", &state.config.mode)
                .field("running", &state.running)
                .field("beat_count", &state.beat_count)
                .field("beat_index", &state.measure.current()),
            Err(_) => debug.field("state", &"<poisoned>"),
        };
        debug.field("events", &self.events).finish()
    }
}

fn into_acquisition_failure(err: BeatEmitterError) -> BeatEmitterError {
    match err {
        err @ BeatEmitterError::AcquisitionFailure(_) => err,
        other => BeatEmitterError::acquisition(other.to_string()),
    }
}
