use chrono::{DateTime, Local, TimeDelta};
use serde_derive::Serialize;
use std::mem;
use tracing::{debug, error, info, warn};

use super::split::{Split, SplitTracker};
use super::store::{WorkoutId, WorkoutStore, WorkoutSummary};
use super::training::{AlertTiming, TrainingAlert, TrainingPlan, TrainingRuntime, TrainingRuntimeState};
use super::SessionEvent;
use crate::discovery::classifier::BoundDevices;
use crate::errors::AppError;
use crate::metrics::{MetricPoint, MetricsSnapshot, RunningTotals};
use crate::settings::SessionSettings;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum SessionState {
    #[default]
    Idle,
    /// Seconds left before the workout starts
    Countdown(u32),
    Rowing,
    Paused,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Countdown(_) => "counting down",
            Self::Rowing => "rowing",
            Self::Paused => "paused",
        }
    }
}

struct ActiveWorkout {
    id: WorkoutId,
    started_at: DateTime<Local>,
    splits: SplitTracker,
    totals: RunningTotals,
    last_sample_at: Option<DateTime<Local>>,
}

impl ActiveWorkout {
    /// Where a split closing at `now` ends. Ranges exclude their end, so a sample
    /// stamped `now` has to land before it.
    fn split_end(&self, now: DateTime<Local>) -> DateTime<Local> {
        match self.last_sample_at {
            Some(sampled) if sampled >= now => sampled + TimeDelta::nanoseconds(1),
            _ => now,
        }
    }
}

/// Workout lifecycle, without any I/O of its own besides the store.
///
/// Time comes in through `now` arguments and metrics through snapshot arguments, so
/// every transition can be driven step by step. Events pile up until
/// [`SessionMachine::drain_events`] is called.
pub struct SessionMachine {
    settings: SessionSettings,
    store: Box<dyn WorkoutStore>,
    state: SessionState,
    elapsed: u64,
    workout: Option<ActiveWorkout>,
    training: Option<TrainingRuntime>,
    events: Vec<SessionEvent>,
}

impl SessionMachine {
    pub fn new(settings: SessionSettings, store: Box<dyn WorkoutStore>) -> Self {
        Self {
            settings,
            store,
            state: SessionState::Idle,
            elapsed: 0,
            workout: None,
            training: None,
            events: Vec::new(),
        }
    }
    pub fn state(&self) -> SessionState {
        self.state
    }
    pub fn elapsed(&self) -> u64 {
        self.elapsed
    }
    pub fn countdown(&self) -> u32 {
        match self.state {
            SessionState::Countdown(remaining) => remaining,
            _ => 0,
        }
    }
    pub fn workout_id(&self) -> Option<WorkoutId> {
        self.workout.as_ref().map(|w| w.id)
    }
    pub fn training_state(&self) -> TrainingRuntimeState {
        self.training
            .as_ref()
            .map(|t| t.state().clone())
            .unwrap_or_default()
    }
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        mem::take(&mut self.events)
    }
    fn emit(&mut self, event: impl Into<SessionEvent>) {
        self.events.push(event.into());
    }
    fn refuse(&self, operation: &'static str) -> AppError {
        AppError::InvalidTransition {
            state: self.state.name(),
            operation,
        }
    }
    fn store_failed(&mut self, context: &str, e: AppError) {
        error!("{context}: {e}");
        self.emit(SessionEvent::StoreError(format!("{context}: {e}")));
    }

    /// From Idle: opens a workout and starts the countdown. From Paused: resumes right away.
    pub fn start(&mut self, now: DateTime<Local>, bound: &BoundDevices) -> Result<(), AppError> {
        match self.state {
            SessionState::Idle => {
                if bound.rower.is_none() {
                    warn!("Refusing to start without a rower");
                    return Err(AppError::NoRowerBound);
                }
                let id = self.store.create_workout(now)?;
                info!("Workout {id} created, counting down");
                self.workout = Some(ActiveWorkout {
                    id,
                    started_at: now,
                    splits: SplitTracker::new(now),
                    totals: RunningTotals::default(),
                    last_sample_at: None,
                });
                self.elapsed = 0;
                if let Some(training) = self.training.as_mut() {
                    training.restart_segment(0, 0);
                }
                if self.settings.countdown_secs == 0 {
                    self.go(now);
                } else {
                    self.state = SessionState::Countdown(self.settings.countdown_secs);
                    self.emit(SessionEvent::Countdown(self.settings.countdown_secs));
                }
                Ok(())
            }
            SessionState::Paused => {
                info!("Resuming workout");
                self.state = SessionState::Rowing;
                Ok(())
            }
            _ => Err(self.refuse("start")),
        }
    }

    fn go(&mut self, now: DateTime<Local>) {
        info!("Go!");
        self.state = SessionState::Rowing;
        // The first split starts at GO, not when the countdown began
        if let Some(workout) = self.workout.as_mut() {
            workout.splits.reopen(now);
        }
        self.emit(SessionEvent::Go);
        let started = self.training.as_ref().and_then(|t| {
            let index = t.state().segment_index;
            t.current().map(|segment| TrainingAlert::SegmentStarted {
                index,
                segment: segment.clone(),
            })
        });
        if let Some(alert) = started {
            self.emit(alert);
        }
    }

    /// One step of the session clock.
    pub fn tick(&mut self, now: DateTime<Local>, snapshot: &MetricsSnapshot) {
        match self.state {
            SessionState::Countdown(remaining) if remaining > 1 => {
                self.state = SessionState::Countdown(remaining - 1);
                self.emit(SessionEvent::Countdown(remaining - 1));
            }
            SessionState::Countdown(_) => self.go(now),
            SessionState::Rowing => self.rowing_tick(now, snapshot),
            SessionState::Idle | SessionState::Paused => {}
        }
    }

    fn rowing_tick(&mut self, now: DateTime<Local>, snapshot: &MetricsSnapshot) {
        self.elapsed += 1;
        let Some(workout) = self.workout.as_mut() else {
            return;
        };
        let point = MetricPoint::new(workout.id, now, snapshot);
        workout.totals.add(&point);
        workout.last_sample_at = Some(now);
        if let Err(e) = self.store.append_point(&point) {
            self.store_failed("Failed to save metric point", e);
        }

        let timing = AlertTiming {
            countdown_secs: self.settings.alert_countdown_secs,
            preview_secs: self.settings.preview_secs,
        };
        let Some(training) = self.training.as_mut() else {
            return;
        };
        let outcome = training.tick(self.elapsed, snapshot.distance_m, timing);
        for alert in outcome.alerts {
            self.emit(alert);
        }
        if outcome.segment_done {
            self.advance_segment(now, snapshot);
        }
    }

    pub fn pause(&mut self) -> Result<(), AppError> {
        if self.state != SessionState::Rowing {
            return Err(self.refuse("pause"));
        }
        info!("Pausing workout at {} seconds", self.elapsed);
        self.state = SessionState::Paused;
        Ok(())
    }

    /// Closes the open split at `now`. `Ok(None)` if it was rejected for a negative distance.
    pub fn mark_split(
        &mut self,
        now: DateTime<Local>,
        snapshot: &MetricsSnapshot,
    ) -> Result<Option<Split>, AppError> {
        match self.state {
            SessionState::Rowing | SessionState::Paused => {
                Ok(self.record_split(now, snapshot.distance_m, true))
            }
            _ => Err(self.refuse("mark a split")),
        }
    }

    fn record_split(&mut self, now: DateTime<Local>, distance: u32, announce: bool) -> Option<Split> {
        let workout = self.workout.as_ref()?;
        let id = workout.id;
        let bounds = workout
            .splits
            .bounds(self.elapsed, distance, workout.split_end(now))?;

        let points = match self.store.points_in_range(id, bounds.start_ts, bounds.end_ts) {
            Ok(points) => points,
            Err(e) => {
                self.store_failed("Failed to read split points", e);
                Vec::new()
            }
        };
        let split = bounds.into_split(&points);
        if let Err(e) = self.store.insert_split(id, &split) {
            self.store_failed("Failed to save split", e);
        }
        if let Some(workout) = self.workout.as_mut() {
            workout.splits.commit(&bounds);
        }
        debug!("Recorded {split:?}");
        let announcement = announce.then(|| split.announcement());
        self.emit(SessionEvent::SplitRecorded {
            split: split.clone(),
            announcement,
        });
        Some(split)
    }

    /// Stops the workout. Saving closes a trailing partial split and writes the summary,
    /// otherwise the workout is deleted. Either way we end up Idle.
    pub fn finish(
        &mut self,
        save: bool,
        now: DateTime<Local>,
        snapshot: &MetricsSnapshot,
    ) -> Result<Option<WorkoutSummary>, AppError> {
        if self.state == SessionState::Idle {
            return Err(self.refuse("finish"));
        }
        let mut summary = None;
        if let Some(workout) = self.workout.as_ref() {
            let id = workout.id;
            if save {
                if workout.splits.has_progress(self.elapsed, snapshot.distance_m) {
                    self.record_split(now, snapshot.distance_m, false);
                }
                summary = self.workout.as_ref().map(|w| self.summarize(w, now, snapshot));
                if let Some(summary) = summary.as_ref() {
                    if let Err(e) = self.store.complete_workout(summary) {
                        self.store_failed("Failed to save workout", e);
                    }
                    info!("Workout saved: ID {id}, Dist {}m", summary.distance_m);
                }
                self.emit(SessionEvent::WorkoutFinished(Some(id)));
            } else {
                if let Err(e) = self.store.discard_workout(id) {
                    self.store_failed("Failed to delete workout", e);
                }
                info!("Workout deleted: ID {id}");
                self.emit(SessionEvent::WorkoutFinished(None));
            }
        } else {
            self.emit(SessionEvent::WorkoutFinished(None));
        }

        self.workout = None;
        self.state = SessionState::Idle;
        self.elapsed = 0;
        self.training = None;
        Ok(summary)
    }

    fn summarize(
        &self,
        workout: &ActiveWorkout,
        now: DateTime<Local>,
        snapshot: &MetricsSnapshot,
    ) -> WorkoutSummary {
        let (avg_power, avg_heart_rate) = if workout.totals.is_empty() {
            (snapshot.power, snapshot.heart_rate)
        } else {
            let averages = workout.totals.averages();
            (averages.power, averages.heart_rate)
        };
        WorkoutSummary {
            id: workout.id,
            started_at: workout.started_at,
            ended_at: now,
            distance_m: snapshot.distance_m,
            duration_s: self.elapsed,
            avg_power,
            avg_heart_rate,
        }
    }

    /// Ends the current segment early, same as if it had run out.
    pub fn skip(&mut self, now: DateTime<Local>, snapshot: &MetricsSnapshot) {
        if self.training.as_ref().is_some_and(|t| t.state().active) {
            self.advance_segment(now, snapshot);
        }
    }

    fn advance_segment(&mut self, now: DateTime<Local>, snapshot: &MetricsSnapshot) {
        if matches!(self.state, SessionState::Rowing | SessionState::Paused) {
            self.record_split(now, snapshot.distance_m, true);
        }
        let Some(training) = self.training.as_mut() else {
            return;
        };
        match training.advance(self.elapsed, snapshot.distance_m) {
            Some(started) => self.emit(started),
            None => {
                info!("Training plan complete!");
                self.emit(TrainingAlert::PlanComplete);
                if self.state == SessionState::Idle {
                    self.training = None;
                } else if let Err(e) = self.finish(true, now, snapshot) {
                    error!("Couldn't finish completed plan: {e}");
                }
            }
        }
    }

    /// Loads a plan for the next workout.
    pub fn prepare_training(&mut self, plan: &TrainingPlan) -> Result<(), AppError> {
        if self.state != SessionState::Idle {
            return Err(self.refuse("load a training plan"));
        }
        let runtime = TrainingRuntime::new(plan)?;
        info!(
            "Prepared plan \"{}\" with {} segments",
            plan.name,
            runtime.segments().len()
        );
        self.training = Some(runtime);
        Ok(())
    }
    pub fn clear_training(&mut self) {
        self.training = None;
    }
}
