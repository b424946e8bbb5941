//! The workout session actor.
//!
//! One task owns the [`SessionMachine`]. Commands come in over an `mpsc` channel, the
//! rower and heart rate sources write into their own `watch` channels, and the actor
//! is the only writer of everything the host observes.

pub mod machine;
pub mod split;
pub mod store;
pub mod training;

use chrono::{DateTime, Local, TimeDelta};
use std::future;
use std::sync::Arc;
use tokio::sync::broadcast::{self, Sender as BSender};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::discovery::classifier::{BoundDevices, DeviceRole, DiscoveredDevice};
use crate::errors::AppError;
use crate::heart_rate::ble::BleHeartRateMonitor;
use crate::heart_rate::dummy::SimulatedHeartRate;
use crate::metrics::MetricsSnapshot;
use crate::rower::ble::FtmsRower;
use crate::rower::dummy::SimulatedRower;
use crate::settings::Settings;
use crate::smoothing::MetricSmoothers;
use crate::source::{DeviceError, SharedSource, SourceLink};

use machine::{SessionMachine, SessionState};
use split::Split;
use store::{WorkoutId, WorkoutStore, WorkoutSummary};
use training::{TrainingAlert, TrainingPlan, TrainingRuntimeState};

const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Device(DeviceError),
    DeviceConnected(DeviceRole),
    DeviceDisconnected(DeviceRole),
    Countdown(u32),
    Go,
    /// `announcement` is `None` for the silent split recorded when saving
    SplitRecorded {
        split: Split,
        announcement: Option<String>,
    },
    Training(TrainingAlert),
    /// `Some` with the saved workout, `None` if it was discarded
    WorkoutFinished(Option<WorkoutId>),
    StoreError(String),
}

impl From<DeviceError> for SessionEvent {
    fn from(error: DeviceError) -> Self {
        SessionEvent::Device(error)
    }
}

impl From<TrainingAlert> for SessionEvent {
    fn from(alert: TrainingAlert) -> Self {
        SessionEvent::Training(alert)
    }
}

/// The rower and heart rate producers a session collects from.
#[derive(Clone)]
pub struct SessionSources {
    pub rower: SharedSource,
    pub heart_rate: SharedSource,
}

impl SessionSources {
    pub fn live(settings: &Settings) -> Self {
        Self {
            rower: Arc::new(FtmsRower::new(settings.connection.clone())),
            heart_rate: Arc::new(BleHeartRateMonitor::new(settings.connection.clone())),
        }
    }
    pub fn simulated(settings: &Settings) -> Self {
        Self {
            rower: Arc::new(SimulatedRower::new(settings.dummy.clone())),
            heart_rate: Arc::new(SimulatedHeartRate::new(settings.dummy.clone())),
        }
    }
    /// Simulated when `dummy.enabled` is set, live BLE otherwise.
    pub fn from_settings(settings: &Settings) -> Self {
        if settings.dummy.enabled {
            Self::simulated(settings)
        } else {
            Self::live(settings)
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, AppError>>;

enum SessionCommand {
    Start(Reply<()>),
    Pause(Reply<()>),
    Finish(bool, Reply<Option<WorkoutSummary>>),
    MarkSplit(Reply<Option<Split>>),
    Skip(Reply<()>),
    PrepareTraining(TrainingPlan, Reply<()>),
    ClearTraining(Reply<()>),
    SelectDevice(DiscoveredDevice, Reply<BoundDevices>),
}

/// Cheap to clone, every clone talks to the same session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    metrics: watch::Receiver<MetricsSnapshot>,
    state: watch::Receiver<SessionState>,
    elapsed: watch::Receiver<u64>,
    countdown: watch::Receiver<u32>,
    training: watch::Receiver<TrainingRuntimeState>,
    bound: watch::Receiver<BoundDevices>,
    events: BSender<SessionEvent>,
}

impl SessionHandle {
    /// Spawns the session actor. It runs until `parent_token` is cancelled or every
    /// handle is dropped.
    pub fn spawn(
        settings: &Settings,
        sources: SessionSources,
        store: Box<dyn WorkoutStore>,
        parent_token: &CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let bound = settings.bound_devices();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (metrics_tx, metrics) = watch::channel(MetricsSnapshot::default());
        let (state_tx, state) = watch::channel(SessionState::Idle);
        let (elapsed_tx, elapsed) = watch::channel(0);
        let (countdown_tx, countdown) = watch::channel(0);
        let (training_tx, training) = watch::channel(TrainingRuntimeState::default());
        let (bound_tx, bound_rx) = watch::channel(bound.clone());
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let actor = SessionActor {
            machine: SessionMachine::new(settings.session.clone(), store),
            sources,
            smoothers: MetricSmoothers::new(&settings.smoothing),
            bound,
            clock: Clock::new(),
            tick_period: settings.session.tick(),
            last_rower: MetricsSnapshot::default(),
            collection: None,
            metrics_tx,
            state_tx,
            elapsed_tx,
            countdown_tx,
            training_tx,
            bound_tx,
            events: events.clone(),
            cancel_token: parent_token.child_token(),
        };
        let task = tokio::spawn(actor.run(commands_rx));

        let handle = Self {
            commands: commands_tx,
            metrics,
            state,
            elapsed,
            countdown,
            training,
            bound: bound_rx,
            events,
        };
        (handle, task)
    }
    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, AppError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| AppError::SessionClosed)?;
        reply_rx.await.map_err(|_| AppError::SessionClosed)?
    }
    pub async fn start(&self) -> Result<(), AppError> {
        self.request(SessionCommand::Start).await
    }
    pub async fn pause(&self) -> Result<(), AppError> {
        self.request(SessionCommand::Pause).await
    }
    pub async fn finish(&self, save: bool) -> Result<Option<WorkoutSummary>, AppError> {
        self.request(|reply| SessionCommand::Finish(save, reply))
            .await
    }
    pub async fn mark_split(&self) -> Result<Option<Split>, AppError> {
        self.request(SessionCommand::MarkSplit).await
    }
    pub async fn skip(&self) -> Result<(), AppError> {
        self.request(SessionCommand::Skip).await
    }
    pub async fn prepare_training(&self, plan: TrainingPlan) -> Result<(), AppError> {
        self.request(|reply| SessionCommand::PrepareTraining(plan, reply))
            .await
    }
    pub async fn clear_training(&self) -> Result<(), AppError> {
        self.request(SessionCommand::ClearTraining).await
    }
    /// Binds a discovered device to its role. Takes effect the next time collection starts.
    pub async fn select_device(&self, device: DiscoveredDevice) -> Result<BoundDevices, AppError> {
        self.request(|reply| SessionCommand::SelectDevice(device, reply))
            .await
    }
    pub fn metrics(&self) -> watch::Receiver<MetricsSnapshot> {
        self.metrics.clone()
    }
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }
    pub fn elapsed(&self) -> watch::Receiver<u64> {
        self.elapsed.clone()
    }
    pub fn countdown(&self) -> watch::Receiver<u32> {
        self.countdown.clone()
    }
    pub fn training(&self) -> watch::Receiver<TrainingRuntimeState> {
        self.training.clone()
    }
    pub fn bound_devices(&self) -> watch::Receiver<BoundDevices> {
        self.bound.clone()
    }
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

/// Wall clock time that follows tokio's clock, so paused-time tests stay consistent.
struct Clock {
    wall: DateTime<Local>,
    instant: Instant,
}

impl Clock {
    fn new() -> Self {
        Self {
            wall: Local::now(),
            instant: Instant::now(),
        }
    }
    fn now(&self) -> DateTime<Local> {
        self.wall + TimeDelta::from_std(self.instant.elapsed()).unwrap_or(TimeDelta::zero())
    }
}

/// Source tasks for one stretch of rowing, between start/resume and pause/finish.
struct Collection {
    cancel_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    rower_rx: watch::Receiver<MetricsSnapshot>,
    heart_rate_rx: watch::Receiver<MetricsSnapshot>,
}

struct SessionActor {
    machine: SessionMachine,
    sources: SessionSources,
    smoothers: MetricSmoothers,
    bound: BoundDevices,
    clock: Clock,
    tick_period: std::time::Duration,
    // Raw rower reading, carried into the next collection run
    last_rower: MetricsSnapshot,
    collection: Option<Collection>,

    metrics_tx: watch::Sender<MetricsSnapshot>,
    state_tx: watch::Sender<SessionState>,
    elapsed_tx: watch::Sender<u64>,
    countdown_tx: watch::Sender<u32>,
    training_tx: watch::Sender<TrainingRuntimeState>,
    bound_tx: watch::Sender<BoundDevices>,
    events: BSender<SessionEvent>,
    cancel_token: CancellationToken,
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => future::pending().await,
    }
}

async fn next_reading(rx: Option<&mut watch::Receiver<MetricsSnapshot>>) -> MetricsSnapshot {
    match rx {
        Some(rx) => {
            if rx.changed().await.is_err() {
                // Source task is gone, nothing more will arrive
                future::pending::<()>().await;
            }
            *rx.borrow_and_update()
        }
        None => future::pending().await,
    }
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        info!("Session actor started!");
        let mut ticker: Option<Interval> = None;
        loop {
            self.arm_ticker(&mut ticker);
            let (rower_rx, heart_rate_rx) = match self.collection.as_mut() {
                Some(collection) => (
                    Some(&mut collection.rower_rx),
                    Some(&mut collection.heart_rate_rx),
                ),
                None => (None, None),
            };
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("All session handles dropped");
                        break;
                    };
                    self.handle(command).await;
                }
                _ = next_tick(&mut ticker) => {
                    let now = self.clock.now();
                    let snapshot = *self.metrics_tx.borrow();
                    self.machine.tick(now, &snapshot);
                    self.sync().await;
                }
                raw = next_reading(rower_rx) => self.on_rower(raw),
                raw = next_reading(heart_rate_rx) => self.on_heart_rate(raw),
                _ = self.cancel_token.cancelled() => break,
            }
        }
        self.stop_collection().await;
        info!("Shutting down session actor!");
    }

    fn arm_ticker(&self, ticker: &mut Option<Interval>) {
        let wants_ticks = matches!(
            self.machine.state(),
            SessionState::Countdown(_) | SessionState::Rowing
        );
        match (wants_ticks, ticker.is_some()) {
            (true, false) => {
                let mut interval =
                    time::interval_at(Instant::now() + self.tick_period, self.tick_period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                *ticker = Some(interval);
            }
            (false, true) => *ticker = None,
            _ => {}
        }
    }

    async fn handle(&mut self, command: SessionCommand) {
        let now = self.clock.now();
        let snapshot = *self.metrics_tx.borrow();
        match command {
            SessionCommand::Start(reply) => {
                let result = self.machine.start(now, &self.bound);
                self.sync().await;
                let _ = reply.send(result);
            }
            SessionCommand::Pause(reply) => {
                let result = self.machine.pause();
                self.sync().await;
                let _ = reply.send(result);
            }
            SessionCommand::Finish(save, reply) => {
                let result = self.machine.finish(save, now, &snapshot);
                self.sync().await;
                let _ = reply.send(result);
            }
            SessionCommand::MarkSplit(reply) => {
                let result = self.machine.mark_split(now, &snapshot);
                self.sync().await;
                let _ = reply.send(result);
            }
            SessionCommand::Skip(reply) => {
                self.machine.skip(now, &snapshot);
                self.sync().await;
                let _ = reply.send(Ok(()));
            }
            SessionCommand::PrepareTraining(plan, reply) => {
                let result = self.machine.prepare_training(&plan);
                self.sync().await;
                let _ = reply.send(result);
            }
            SessionCommand::ClearTraining(reply) => {
                self.machine.clear_training();
                self.sync().await;
                let _ = reply.send(Ok(()));
            }
            SessionCommand::SelectDevice(device, reply) => {
                let result = if self.bound.bind(&device) {
                    info!("Bound {:?} {} ({})", device.role, device.name, device.address);
                    self.bound_tx.send_replace(self.bound.clone());
                    Ok(self.bound.clone())
                } else {
                    Err(AppError::UnknownRole(device.name))
                };
                let _ = reply.send(result);
            }
        }
    }

    fn on_rower(&mut self, raw: MetricsSnapshot) {
        self.last_rower = raw;
        let smoothed = self.smoothers.smooth_rower(&raw);
        // Rowers with a built in receiver report heart rate too
        let rower_heart_rate = (self.bound.heart_rate.is_none() && raw.heart_rate > 0)
            .then(|| self.smoothers.smooth_heart_rate(raw.heart_rate));
        self.metrics_tx.send_modify(|metrics| {
            metrics.apply_rower(&smoothed);
            if let Some(heart_rate) = rower_heart_rate {
                metrics.heart_rate = heart_rate;
            }
        });
    }

    fn on_heart_rate(&mut self, raw: MetricsSnapshot) {
        let heart_rate = self.smoothers.smooth_heart_rate(raw.heart_rate);
        self.metrics_tx
            .send_if_modified(|metrics| {
                let changed = metrics.heart_rate != heart_rate;
                metrics.heart_rate = heart_rate;
                changed
            });
    }

    /// Publishes the machine's state and starts or stops collection to match it.
    async fn sync(&mut self) {
        let events = self.machine.drain_events();
        let finished = events
            .iter()
            .any(|e| matches!(e, SessionEvent::WorkoutFinished(_)));

        let collecting = self.machine.state() == SessionState::Rowing;
        match (collecting, self.collection.is_some()) {
            (true, false) => self.start_collection(),
            (false, true) => self.stop_collection().await,
            _ => {}
        }
        if finished {
            self.smoothers.clear();
            self.last_rower = MetricsSnapshot::default();
            self.metrics_tx
                .send_modify(MetricsSnapshot::reset_keeping_heart_rate);
        }

        let state = self.machine.state();
        self.state_tx.send_if_modified(|s| replace_if_changed(s, state));
        let elapsed = self.machine.elapsed();
        self.elapsed_tx.send_if_modified(|e| replace_if_changed(e, elapsed));
        let countdown = self.machine.countdown();
        self.countdown_tx
            .send_if_modified(|c| replace_if_changed(c, countdown));
        let training = self.machine.training_state();
        self.training_tx
            .send_if_modified(|t| replace_if_changed(t, training));

        for event in events {
            if let SessionEvent::StoreError(message) = &event {
                error!("Store error: {message}");
            }
            crate::broadcast!(self.events, event);
        }
    }

    fn start_collection(&mut self) {
        info!("Starting metrics collection");
        let cancel_token = self.cancel_token.child_token();
        let (rower_tx, rower_rx) = watch::channel(self.last_rower);
        let (heart_rate_tx, heart_rate_rx) = watch::channel(MetricsSnapshot::default());

        let rower = self.sources.rower.spawn(SourceLink {
            target: self.bound.rower.clone(),
            readings: rower_tx,
            events: self.events.clone(),
            cancel_token: cancel_token.clone(),
        });
        let heart_rate = self.sources.heart_rate.spawn(SourceLink {
            target: self.bound.heart_rate.clone(),
            readings: heart_rate_tx,
            events: self.events.clone(),
            cancel_token: cancel_token.clone(),
        });
        self.collection = Some(Collection {
            cancel_token,
            tasks: vec![rower, heart_rate],
            rower_rx,
            heart_rate_rx,
        });
    }

    async fn stop_collection(&mut self) {
        let Some(collection) = self.collection.take() else {
            return;
        };
        info!("Stopping metrics collection");
        collection.cancel_token.cancel();
        for task in collection.tasks {
            if let Err(e) = task.await {
                error!("Source task failed: {e}");
            }
        }
    }
}

fn replace_if_changed<T: PartialEq>(current: &mut T, new: T) -> bool {
    if *current == new {
        false
    } else {
        *current = new;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MetricsSource;

    #[test]
    fn sources_report_their_roles() {
        let mut settings = Settings::load(None, false).unwrap();
        for sources in [SessionSources::live(&settings), SessionSources::simulated(&settings)] {
            assert_eq!(sources.rower.role(), DeviceRole::Rower);
            assert_eq!(sources.heart_rate.role(), DeviceRole::HeartRateMonitor);
        }
        settings.dummy.enabled = true;
        let sources = SessionSources::from_settings(&settings);
        assert_eq!(sources.rower.role(), DeviceRole::Rower);
    }
}
