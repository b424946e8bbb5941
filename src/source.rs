//! Where metrics come from.
//!
//! A session only talks to [`MetricsSource`]s. Live BLE devices and the generated
//! dummies implement the same trait, and each one writes raw snapshots into a
//! `watch` channel so a slow consumer only ever sees the newest reading.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::Sender as BSender;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::broadcast;
use crate::discovery::classifier::DeviceRole;
use crate::errors::AppError;
use crate::metrics::MetricsSnapshot;
use crate::session::SessionEvent;

/// Connection problems, reported up to whoever is watching the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Something went wrong, but we're still trying
    Transient(String),
    /// Gave up, the user needs to do something
    Permanent(String),
}

impl DeviceError {
    pub fn detailed(message: &str, error: impl Display) -> Self {
        Self::Transient(format!("{message} {error}"))
    }
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(message) | Self::Permanent(message) => message,
        }
    }
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Everything a running source needs to report back.
#[derive(Clone)]
pub struct SourceLink {
    /// Bound address to connect to, if any
    pub target: Option<String>,
    pub readings: watch::Sender<MetricsSnapshot>,
    pub events: BSender<SessionEvent>,
    pub cancel_token: CancellationToken,
}

/// A producer of metrics for one device role.
///
/// Rower sources own power, pace, stroke rate and distance in the snapshots they write.
/// Heart rate sources only fill in `heart_rate`.
pub trait MetricsSource: Send + Sync {
    fn role(&self) -> DeviceRole;
    /// Spawns the producer task. It must return once `link.cancel_token` is cancelled.
    fn spawn(&self, link: SourceLink) -> JoinHandle<()>;
}

pub type SharedSource = Arc<dyn MetricsSource>;

/// Fixed delay between attempts, with an optional cap on the attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// `None` retries until cancelled
    pub max_retries: Option<u32>,
}

impl RetryPolicy {
    pub fn new(delay: Duration, max_retries: u32) -> Self {
        Self {
            delay,
            max_retries: (max_retries > 0).then_some(max_retries),
        }
    }
    /// Whether another attempt is allowed after `failures` failed ones.
    pub fn should_retry(&self, failures: u32) -> bool {
        match self.max_retries {
            Some(max) => failures <= max,
            None => true,
        }
    }
}

/// How a connection that got as far as streaming came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEnd {
    Cancelled,
    Dropped,
}

/// Counts failed attempts for one device and reports them upward.
pub struct Reconnector {
    label: &'static str,
    policy: RetryPolicy,
    failures: u32,
}

impl Reconnector {
    pub fn new(label: &'static str, policy: RetryPolicy) -> Self {
        Self {
            label,
            policy,
            failures: 0,
        }
    }
    /// Reports how an attempt ended and waits out the retry delay.
    /// Returns `false` once the source should stop for good.
    pub async fn settle(&mut self, outcome: Result<LinkEnd, AppError>, link: &SourceLink) -> bool {
        match outcome {
            Ok(LinkEnd::Cancelled) => return false,
            Ok(LinkEnd::Dropped) => {
                // It worked once, so the budget starts over
                self.failures = 0;
                warn!("{} connection lost", self.label);
                broadcast!(
                    link.events,
                    DeviceError::Transient(format!("{} connection lost", self.label))
                );
            }
            Err(e) => {
                self.failures += 1;
                if !self.policy.should_retry(self.failures) {
                    error!("{} failed {} times, giving up: {e}", self.label, self.failures);
                    broadcast!(
                        link.events,
                        DeviceError::Permanent(format!(
                            "{} unavailable after {} attempts: {e}",
                            self.label, self.failures
                        ))
                    );
                    return false;
                }
                warn!("{} connection attempt {} failed: {e}", self.label, self.failures);
                let message = format!("{} connection failed:", self.label);
                broadcast!(link.events, DeviceError::detailed(&message, e));
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(self.policy.delay) => !link.cancel_token.is_cancelled(),
            _ = link.cancel_token.cancelled() => false,
        }
    }
    pub fn failures(&self) -> u32 {
        self.failures
    }
}
