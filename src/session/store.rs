use chrono::{DateTime, Local};
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::split::Split;
use crate::errors::AppError;
use crate::metrics::MetricPoint;

pub type WorkoutId = u64;

/// Aggregates written to the workout record when it's saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutSummary {
    pub id: WorkoutId,
    pub started_at: DateTime<Local>,
    pub ended_at: DateTime<Local>,
    pub distance_m: u32,
    pub duration_s: u64,
    pub avg_power: u32,
    pub avg_heart_rate: u32,
}

/// Where workouts end up. The session only ever appends, plus the range query
/// needed for split averages.
pub trait WorkoutStore: Send {
    fn create_workout(&mut self, started_at: DateTime<Local>) -> Result<WorkoutId, AppError>;
    fn append_point(&mut self, point: &MetricPoint) -> Result<(), AppError>;
    /// Points of `workout` with `start <= timestamp < end`, oldest first.
    fn points_in_range(
        &self,
        workout: WorkoutId,
        start: DateTime<Local>,
        end: DateTime<Local>,
    ) -> Result<Vec<MetricPoint>, AppError>;
    fn insert_split(&mut self, workout: WorkoutId, split: &Split) -> Result<(), AppError>;
    fn complete_workout(&mut self, summary: &WorkoutSummary) -> Result<(), AppError>;
    fn discard_workout(&mut self, workout: WorkoutId) -> Result<(), AppError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredWorkout {
    pub id: WorkoutId,
    pub started_at: DateTime<Local>,
    pub points: Vec<MetricPoint>,
    pub splits: Vec<Split>,
    pub summary: Option<WorkoutSummary>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    next_id: WorkoutId,
    workouts: BTreeMap<WorkoutId, StoredWorkout>,
    failing: bool,
}

/// In-memory store. Clones share the same data, so a host can keep one to read
/// workouts back while the session owns the other.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
    fn inner(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
    /// Makes every write fail, for exercising error paths.
    pub fn set_failing(&self, failing: bool) {
        self.inner().failing = failing;
    }
    pub fn workout(&self, id: WorkoutId) -> Option<StoredWorkout> {
        self.inner().workouts.get(&id).cloned()
    }
    pub fn workouts(&self) -> Vec<StoredWorkout> {
        self.inner().workouts.values().cloned().collect()
    }
    fn writable(&self) -> Result<MutexGuard<'_, MemoryInner>, AppError> {
        let inner = self.inner();
        if inner.failing {
            return Err(AppError::Store("store is read-only".into()));
        }
        Ok(inner)
    }
}

fn missing(id: WorkoutId) -> AppError {
    AppError::Store(format!("no workout with id {id}"))
}

impl WorkoutStore for MemoryStore {
    fn create_workout(&mut self, started_at: DateTime<Local>) -> Result<WorkoutId, AppError> {
        let mut inner = self.writable()?;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.workouts.insert(
            id,
            StoredWorkout {
                id,
                started_at,
                points: Vec::new(),
                splits: Vec::new(),
                summary: None,
            },
        );
        Ok(id)
    }
    fn append_point(&mut self, point: &MetricPoint) -> Result<(), AppError> {
        let mut inner = self.writable()?;
        let workout = inner
            .workouts
            .get_mut(&point.workout_id)
            .ok_or_else(|| missing(point.workout_id))?;
        workout.points.push(*point);
        Ok(())
    }
    fn points_in_range(
        &self,
        workout: WorkoutId,
        start: DateTime<Local>,
        end: DateTime<Local>,
    ) -> Result<Vec<MetricPoint>, AppError> {
        let inner = self.inner();
        let workout = inner.workouts.get(&workout).ok_or_else(|| missing(workout))?;
        Ok(workout
            .points
            .iter()
            .filter(|p| p.timestamp >= start && p.timestamp < end)
            .copied()
            .collect())
    }
    fn insert_split(&mut self, workout: WorkoutId, split: &Split) -> Result<(), AppError> {
        let mut inner = self.writable()?;
        let workout = inner.workouts.get_mut(&workout).ok_or_else(|| missing(workout))?;
        workout.splits.push(split.clone());
        Ok(())
    }
    fn complete_workout(&mut self, summary: &WorkoutSummary) -> Result<(), AppError> {
        let mut inner = self.writable()?;
        let workout = inner
            .workouts
            .get_mut(&summary.id)
            .ok_or_else(|| missing(summary.id))?;
        workout.summary = Some(summary.clone());
        Ok(())
    }
    fn discard_workout(&mut self, workout: WorkoutId) -> Result<(), AppError> {
        let mut inner = self.writable()?;
        inner
            .workouts
            .remove(&workout)
            .map(|_| ())
            .ok_or_else(|| missing(workout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsSnapshot;
    use chrono::TimeDelta;

    #[test]
    fn range_is_half_open() {
        let mut store = MemoryStore::new();
        let start = Local::now();
        let id = store.create_workout(start).unwrap();
        for secs in 0..4 {
            let point = MetricPoint::new(id, start + TimeDelta::seconds(secs), &MetricsSnapshot::default());
            store.append_point(&point).unwrap();
        }
        let points = store
            .points_in_range(id, start + TimeDelta::seconds(1), start + TimeDelta::seconds(3))
            .unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].timestamp, start + TimeDelta::seconds(1));
    }

    #[test]
    fn clones_share_data() {
        let mut store = MemoryStore::new();
        let reader = store.clone();
        let id = store.create_workout(Local::now()).unwrap();
        assert!(reader.workout(id).is_some());
        store.discard_workout(id).unwrap();
        assert!(reader.workouts().is_empty());
    }

    #[test]
    fn failing_store_rejects_writes() {
        let mut store = MemoryStore::new();
        store.set_failing(true);
        assert!(matches!(
            store.create_workout(Local::now()),
            Err(AppError::Store(_))
        ));
    }
}
