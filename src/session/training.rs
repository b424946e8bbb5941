//! Structured training plans.
//!
//! A plan is a list of blocks, each repeated `repeat_count` times. At the start of a
//! workout the plan is flattened into one list of [`PlanSegment`]s, which the
//! [`TrainingRuntime`] walks through as the session ticks.

use serde_derive::{Deserialize, Serialize};
use std::fmt;

use crate::errors::AppError;
use crate::metrics::format_minutes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SegmentRole {
    Active,
    Recovery,
    #[serde(rename = "WARMUP")]
    WarmUp,
    #[serde(rename = "COOLDOWN")]
    CoolDown,
}

impl fmt::Display for SegmentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "Active",
            Self::Recovery => "Recovery",
            Self::WarmUp => "Warm Up",
            Self::CoolDown => "Cool Down",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DurationKind {
    /// Seconds
    Time,
    /// Meters
    Distance,
}

/// Optional targets shown to the rower. None of them affect progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Targets {
    pub spm: Option<u32>,
    pub watts: Option<u32>,
    /// Seconds per 500m
    pub pace: Option<u32>,
    pub hr: Option<u32>,
}

impl fmt::Display for Targets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(spm) = self.spm {
            parts.push(format!("{spm} SPM"));
        }
        if let Some(watts) = self.watts {
            parts.push(format!("{watts}W"));
        }
        if let Some(pace) = self.pace {
            parts.push(format_minutes(pace));
        }
        if let Some(hr) = self.hr {
            parts.push(format!("HR {hr}"));
        }
        if parts.is_empty() {
            f.write_str("Just Row")
        } else {
            f.write_str(&parts.join(", "))
        }
    }
}

/// Plan interchange format, as shared between devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingPlan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub difficulty: String,
    #[serde(default)]
    pub intensity: String,
    #[serde(default = "default_activity_type")]
    pub activity_type: String,
    pub blocks: Vec<TrainingBlock>,
}

fn default_activity_type() -> String {
    "ROWING".into()
}

fn default_repeat_count() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingBlock {
    pub name: String,
    #[serde(default = "default_repeat_count")]
    pub repeat_count: u32,
    pub segments: Vec<SegmentSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentSpec {
    pub segment_type: SegmentRole,
    pub duration_type: DurationKind,
    pub duration_value: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_spm: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_watts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_pace: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_hr: Option<u32>,
}

impl SegmentSpec {
    pub fn targets(&self) -> Targets {
        Targets {
            spm: self.target_spm,
            watts: self.target_watts,
            pace: self.target_pace,
            hr: self.target_hr,
        }
    }
}

/// One occurrence of a segment in the flattened timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSegment {
    pub role: SegmentRole,
    pub duration_kind: DurationKind,
    pub duration_value: u32,
    pub targets: Targets,
    /// Block name, with the round when the block repeats: `Intervals (2/4)`
    pub label: String,
}

impl TrainingPlan {
    pub fn from_json(json: &str) -> Result<Self, AppError> {
        Ok(serde_json::from_str(json)?)
    }
    pub fn to_json(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
    pub fn flatten(&self) -> Vec<PlanSegment> {
        let mut segments = Vec::new();
        for block in &self.blocks {
            for round in 1..=block.repeat_count {
                let label = if block.repeat_count > 1 {
                    format!("{} ({}/{})", block.name, round, block.repeat_count)
                } else {
                    block.name.clone()
                };
                segments.extend(block.segments.iter().map(|spec| PlanSegment {
                    role: spec.segment_type,
                    duration_kind: spec.duration_type,
                    duration_value: spec.duration_value,
                    targets: spec.targets(),
                    label: label.clone(),
                }));
            }
        }
        segments
    }
}

/// What the host sees of the runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrainingRuntimeState {
    pub active: bool,
    pub plan_name: String,
    pub segment_index: usize,
    pub total_segments: usize,
    pub current: Option<PlanSegment>,
    pub next: Option<PlanSegment>,
    /// Session elapsed seconds when the current segment started
    pub segment_start_time: u64,
    /// Session distance when the current segment started
    pub segment_start_distance: u32,
    /// Seconds or meters, depending on the segment. Never below zero.
    pub time_or_distance_remaining: u32,
    pub progress_fraction: f32,
}

/// Advisory notifications, they don't change any numbers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TrainingAlert {
    /// Seconds left in a timed segment
    Countdown(u32),
    /// Announces what comes next
    Preview(String),
    SegmentStarted { index: usize, segment: PlanSegment },
    PlanComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertTiming {
    pub countdown_secs: u32,
    pub preview_secs: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickOutcome {
    pub alerts: Vec<TrainingAlert>,
    /// The current segment is used up and should be advanced
    pub segment_done: bool,
}

pub struct TrainingRuntime {
    segments: Vec<PlanSegment>,
    state: TrainingRuntimeState,
}

impl TrainingRuntime {
    pub fn new(plan: &TrainingPlan) -> Result<Self, AppError> {
        let segments = plan.flatten();
        if segments.is_empty() {
            return Err(AppError::EmptyPlan);
        }
        let mut runtime = Self {
            segments,
            state: TrainingRuntimeState {
                active: true,
                plan_name: plan.name.clone(),
                ..Default::default()
            },
        };
        runtime.enter(0, 0, 0);
        Ok(runtime)
    }
    pub fn state(&self) -> &TrainingRuntimeState {
        &self.state
    }
    pub fn segments(&self) -> &[PlanSegment] {
        &self.segments
    }
    pub fn current(&self) -> Option<&PlanSegment> {
        self.segments.get(self.state.segment_index)
    }
    /// Restarts the current segment's markers, used when the workout actually starts.
    pub fn restart_segment(&mut self, elapsed: u64, distance: u32) {
        self.enter(self.state.segment_index, elapsed, distance);
    }
    fn enter(&mut self, index: usize, elapsed: u64, distance: u32) {
        let current = self.segments.get(index).cloned();
        self.state.segment_index = index;
        self.state.total_segments = self.segments.len();
        self.state.time_or_distance_remaining =
            current.as_ref().map_or(0, |segment| segment.duration_value);
        self.state.current = current;
        self.state.next = self.segments.get(index + 1).cloned();
        self.state.segment_start_time = elapsed;
        self.state.segment_start_distance = distance;
        self.state.progress_fraction = 0.0;
    }
    /// Updates remaining/progress from the session's elapsed time and distance.
    pub fn tick(&mut self, elapsed: u64, distance: u32, timing: AlertTiming) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        let Some(segment) = self.current().cloned() else {
            return outcome;
        };
        if !self.state.active {
            return outcome;
        }

        let consumed = match segment.duration_kind {
            DurationKind::Time => elapsed.saturating_sub(self.state.segment_start_time),
            DurationKind::Distance => {
                distance.saturating_sub(self.state.segment_start_distance) as u64
            }
        };
        let total = segment.duration_value as u64;
        let remaining = total.saturating_sub(consumed) as u32;

        if segment.duration_kind == DurationKind::Time {
            if (1..=timing.countdown_secs).contains(&remaining) {
                outcome.alerts.push(TrainingAlert::Countdown(remaining));
            } else if remaining == timing.preview_secs && remaining > 0 {
                let preview = match &self.state.next {
                    Some(next) => format!("Next segment: {}, {}", next.role, next.targets),
                    None => "Almost done!".to_owned(),
                };
                outcome.alerts.push(TrainingAlert::Preview(preview));
            }
        }

        self.state.time_or_distance_remaining = remaining;
        self.state.progress_fraction = if total == 0 {
            1.0
        } else {
            (consumed as f32 / total as f32).min(1.0)
        };
        outcome.segment_done = consumed >= total;
        outcome
    }
    /// Moves on to the next segment, starting it at the current elapsed time and distance.
    ///
    /// Returns `None` once the plan is used up, the runtime is inactive after that.
    pub fn advance(&mut self, elapsed: u64, distance: u32) -> Option<TrainingAlert> {
        let next_index = self.state.segment_index + 1;
        if next_index < self.segments.len() {
            self.enter(next_index, elapsed, distance);
            let segment = self.segments[next_index].clone();
            Some(TrainingAlert::SegmentStarted {
                index: next_index,
                segment,
            })
        } else {
            self.state.active = false;
            self.state.time_or_distance_remaining = 0;
            self.state.progress_fraction = 1.0;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMING: AlertTiming = AlertTiming {
        countdown_secs: 5,
        preview_secs: 10,
    };

    fn segment(kind: DurationKind, value: u32) -> SegmentSpec {
        SegmentSpec {
            segment_type: SegmentRole::Active,
            duration_type: kind,
            duration_value: value,
            target_spm: None,
            target_watts: None,
            target_pace: None,
            target_hr: None,
        }
    }

    fn plan(blocks: Vec<TrainingBlock>) -> TrainingPlan {
        TrainingPlan {
            global_id: None,
            name: "Test".into(),
            description: String::new(),
            difficulty: String::new(),
            intensity: String::new(),
            activity_type: default_activity_type(),
            blocks,
        }
    }

    #[test]
    fn repeated_block_flattens_in_order() {
        let mut recovery = segment(DurationKind::Time, 60);
        recovery.segment_type = SegmentRole::Recovery;
        let plan = plan(vec![TrainingBlock {
            name: "Interval Set".into(),
            repeat_count: 3,
            segments: vec![segment(DurationKind::Time, 30), recovery],
        }]);

        let flat = plan.flatten();
        assert_eq!(flat.len(), 6);
        let labels: Vec<&str> = flat.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(
            labels,
            [
                "Interval Set (1/3)",
                "Interval Set (1/3)",
                "Interval Set (2/3)",
                "Interval Set (2/3)",
                "Interval Set (3/3)",
                "Interval Set (3/3)",
            ]
        );
        let roles: Vec<SegmentRole> = flat.iter().map(|s| s.role).collect();
        assert_eq!(roles[0], SegmentRole::Active);
        assert_eq!(roles[1], SegmentRole::Recovery);
        assert_eq!(roles[4], SegmentRole::Active);
    }

    #[test]
    fn single_round_keeps_block_name() {
        let plan = plan(vec![TrainingBlock {
            name: "Warm up".into(),
            repeat_count: 1,
            segments: vec![segment(DurationKind::Distance, 500)],
        }]);
        assert_eq!(plan.flatten()[0].label, "Warm up");
    }

    #[test]
    fn empty_plan_is_refused() {
        let plan = plan(vec![TrainingBlock {
            name: "Nothing".into(),
            repeat_count: 0,
            segments: vec![segment(DurationKind::Time, 60)],
        }]);
        assert!(matches!(TrainingRuntime::new(&plan), Err(AppError::EmptyPlan)));
    }

    #[test]
    fn ten_minutes_ticked_once_a_second() {
        let plan = plan(vec![TrainingBlock {
            name: "Steady".into(),
            repeat_count: 1,
            segments: vec![segment(DurationKind::Time, 600), segment(DurationKind::Time, 60)],
        }]);
        let mut runtime = TrainingRuntime::new(&plan).unwrap();

        let mut transitions = Vec::new();
        for elapsed in 1..=600u64 {
            let outcome = runtime.tick(elapsed, 0, TIMING);
            if outcome.segment_done {
                assert_eq!(runtime.state().time_or_distance_remaining, 0);
                transitions.push(elapsed);
                runtime.advance(elapsed, 0);
            }
        }
        assert_eq!(transitions, vec![600]);
        assert_eq!(runtime.state().segment_index, 1);
        assert_eq!(runtime.state().segment_start_time, 600);
        assert_eq!(runtime.state().time_or_distance_remaining, 60);
    }

    #[test]
    fn distance_segment_progress() {
        let plan = plan(vec![TrainingBlock {
            name: "2k".into(),
            repeat_count: 1,
            segments: vec![segment(DurationKind::Distance, 2000)],
        }]);
        let mut runtime = TrainingRuntime::new(&plan).unwrap();
        runtime.restart_segment(0, 100);

        let outcome = runtime.tick(300, 600, TIMING);
        assert!(!outcome.segment_done);
        assert!(outcome.alerts.is_empty());
        assert_eq!(runtime.state().time_or_distance_remaining, 1500);
        assert_eq!(runtime.state().progress_fraction, 0.25);

        // Overshooting still reports zero remaining
        let outcome = runtime.tick(900, 2200, TIMING);
        assert!(outcome.segment_done);
        assert_eq!(runtime.state().time_or_distance_remaining, 0);
        assert_eq!(runtime.state().progress_fraction, 1.0);

        assert_eq!(runtime.advance(900, 2200), None);
        assert!(!runtime.state().active);
    }

    #[test]
    fn alerts_before_segment_end() {
        let mut easy = segment(DurationKind::Time, 120);
        easy.segment_type = SegmentRole::Recovery;
        easy.target_spm = Some(20);
        let plan = plan(vec![TrainingBlock {
            name: "Pyramid".into(),
            repeat_count: 1,
            segments: vec![segment(DurationKind::Time, 30), easy],
        }]);
        let mut runtime = TrainingRuntime::new(&plan).unwrap();

        let alerts: Vec<Vec<TrainingAlert>> =
            (1..=30).map(|t| runtime.tick(t, 0, TIMING).alerts).collect();
        assert_eq!(
            alerts[19],
            vec![TrainingAlert::Preview("Next segment: Recovery, 20 SPM".into())]
        );
        assert_eq!(alerts[24], vec![TrainingAlert::Countdown(5)]);
        assert_eq!(alerts[28], vec![TrainingAlert::Countdown(1)]);
        assert_eq!(alerts[29], Vec::new());
        assert_eq!(
            alerts.iter().filter(|a| !a.is_empty()).count(),
            6,
            "one preview and five countdown ticks"
        );

        let started = runtime.advance(30, 0).unwrap();
        assert!(matches!(started, TrainingAlert::SegmentStarted { index: 1, .. }));
        for t in 31..140 {
            runtime.tick(t, 0, TIMING);
        }
        assert_eq!(
            runtime.tick(140, 0, TIMING).alerts,
            vec![TrainingAlert::Preview("Almost done!".into())]
        );
    }

    #[test]
    fn target_text() {
        let targets = Targets {
            spm: Some(20),
            watts: Some(150),
            pace: Some(125),
            hr: Some(140),
        };
        assert_eq!(targets.to_string(), "20 SPM, 150W, 2:05, HR 140");
        assert_eq!(Targets::default().to_string(), "Just Row");
    }

    #[test]
    fn reads_exchange_json() {
        let json = r#"{
            "name": "Pyramid",
            "description": "Up and down",
            "difficulty": "MEDIUM",
            "intensity": "HIGH",
            "blocks": [{
                "name": "Main",
                "repeatCount": 2,
                "segments": [
                    {"segmentType": "WARMUP", "durationType": "DISTANCE", "durationValue": 500},
                    {"segmentType": "ACTIVE", "durationType": "TIME", "durationValue": 60, "targetSpm": 28}
                ]
            }]
        }"#;
        let plan = TrainingPlan::from_json(json).unwrap();
        assert_eq!(plan.activity_type, "ROWING");
        let flat = plan.flatten();
        assert_eq!(flat.len(), 4);
        assert_eq!(flat[0].role, SegmentRole::WarmUp);
        assert_eq!(flat[1].targets.spm, Some(28));

        let reparsed = TrainingPlan::from_json(&plan.to_json().unwrap()).unwrap();
        assert_eq!(reparsed, plan);
    }
}
