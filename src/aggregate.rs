use crate::{classify::PostureState, error::Error, metrics::GaitSample};
use itertools::{Itertools, MinMaxResult};
use ndarray::{s, Array1, ArrayView1, Axis};
use num_traits::ToPrimitive;
use ordered_float::NotNan;
use serde::Serialize;
use std::{fmt, time::Duration};
use tracing::{debug, info};

const DEFAULT_TIME_LIMIT_MS: &str = "5000";

const DEFAULT_FPS: &str = "30";
const DEFAULT_OSCILLATION_WINDOW: &str = "30";
const DEFAULT_MIN_CADENCE: &str = "120";
const DEFAULT_MAX_CADENCE: &str = "240";
const DEFAULT_FALLBACK_CADENCE: &str = "172";
const DEFAULT_ASPECT_RATIO: &str = "1.0";

/// Hip heights are normalized to the frame, and a runner is assumed to fill
/// about half of it.
const ESTIMATED_BODY_HEIGHT: f32 = 0.5;

/// Frame-to-frame hip movement below this carries no direction.
const VELOCITY_EPSILON: f32 = 1e-6;

#[derive(Debug, Clone, Copy, structopt::StructOpt)]
pub(crate) struct MonitorSettings {
    /// How long a bad posture may persist before feedback fires.
    #[structopt(long, default_value = DEFAULT_TIME_LIMIT_MS)]
    pub(crate) time_limit_ms: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            time_limit_ms: DEFAULT_TIME_LIMIT_MS.parse().unwrap(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum MonitorPhase {
    NotStarted,
    Monitoring,
    Penalized,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum MonitorVerdict {
    /// The monitor has not been started.
    Inactive,
    /// No bad streak in progress.
    Clear,
    /// A bad streak is in progress but still within the time limit.
    Streak { elapsed: Duration },
    /// The bad streak has outlasted the time limit.
    Penalize { elapsed: Duration },
}

/// Tracks how long a bad posture has been held.
#[derive(Debug, Clone)]
pub(crate) struct PostureMonitor {
    time_limit: Duration,
    phase: MonitorPhase,
    streak_start_ms: Option<u64>,
}

impl PostureMonitor {
    pub(crate) fn new(settings: MonitorSettings) -> Self {
        Self {
            time_limit: Duration::from_millis(settings.time_limit_ms),
            phase: MonitorPhase::NotStarted,
            streak_start_ms: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> MonitorPhase {
        self.phase
    }

    pub(crate) fn start(&mut self) {
        self.phase = MonitorPhase::Monitoring;
        self.streak_start_ms = None;
    }

    pub(crate) fn stop(&mut self) {
        self.phase = MonitorPhase::NotStarted;
        self.streak_start_ms = None;
    }

    pub(crate) fn observe(&mut self, state: PostureState, now_ms: u64) -> MonitorVerdict {
        if self.phase == MonitorPhase::NotStarted {
            return MonitorVerdict::Inactive;
        }

        if !state.is_bad() {
            if self.streak_start_ms.take().is_some() {
                debug!(message = "bad posture streak cleared", %state);
            }
            self.phase = MonitorPhase::Monitoring;
            return MonitorVerdict::Clear;
        }

        let start = *self.streak_start_ms.get_or_insert(now_ms);
        let elapsed = Duration::from_millis(now_ms.saturating_sub(start));
        if elapsed > self.time_limit {
            self.phase = MonitorPhase::Penalized;
            MonitorVerdict::Penalize { elapsed }
        } else {
            MonitorVerdict::Streak { elapsed }
        }
    }
}

#[derive(Debug, Clone, Copy, structopt::StructOpt)]
pub(crate) struct GaitSettings {
    /// Frame rate of the recording.
    #[structopt(long, default_value = DEFAULT_FPS)]
    pub(crate) fps: f32,
    /// Number of frames per vertical oscillation window.
    #[structopt(long, default_value = DEFAULT_OSCILLATION_WINDOW)]
    pub(crate) oscillation_window: usize,
    /// Lowest plausible cadence in steps per minute.
    #[structopt(long, default_value = DEFAULT_MIN_CADENCE)]
    pub(crate) min_cadence: f32,
    /// Highest plausible cadence in steps per minute.
    #[structopt(long, default_value = DEFAULT_MAX_CADENCE)]
    pub(crate) max_cadence: f32,
    /// Cadence reported when the measured one is implausible.
    #[structopt(long, default_value = DEFAULT_FALLBACK_CADENCE)]
    pub(crate) fallback_cadence: f32,
    /// Width over height of the source video.
    #[structopt(long, default_value = DEFAULT_ASPECT_RATIO)]
    pub(crate) aspect_ratio: f32,
}

impl Default for GaitSettings {
    fn default() -> Self {
        Self {
            fps: DEFAULT_FPS.parse().unwrap(),
            oscillation_window: DEFAULT_OSCILLATION_WINDOW.parse().unwrap(),
            min_cadence: DEFAULT_MIN_CADENCE.parse().unwrap(),
            max_cadence: DEFAULT_MAX_CADENCE.parse().unwrap(),
            fallback_cadence: DEFAULT_FALLBACK_CADENCE.parse().unwrap(),
            aspect_ratio: DEFAULT_ASPECT_RATIO.parse().unwrap(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize)]
pub(crate) struct Cadence {
    /// Steps per minute, after the plausibility check.
    pub(crate) steps_per_minute: f32,
    /// What the zero-crossing count actually produced.
    pub(crate) measured: f32,
    pub(crate) is_fallback: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub(crate) enum DataQuality {
    High,
    Medium,
    Low,
    Unknown,
}

impl DataQuality {
    fn from_confidence(confidence: Option<f32>) -> Self {
        match confidence {
            Some(c) if c > 0.8 => Self::High,
            Some(c) if c > 0.5 => Self::Medium,
            Some(_) => Self::Low,
            None => Self::Unknown,
        }
    }
}

impl fmt::Display for DataQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Totals for a finished gait recording.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct SessionAggregate {
    pub(crate) frames: usize,
    pub(crate) detected_frames: usize,
    pub(crate) duration_secs: f32,
    pub(crate) step_count: usize,
    pub(crate) cadence: Cadence,
    pub(crate) avg_lean_degrees: f32,
    pub(crate) avg_hip_drop_degrees: f32,
    pub(crate) avg_knee_degrees: f32,
    pub(crate) vertical_oscillation: f32,
    pub(crate) vertical_oscillation_percent: f32,
    pub(crate) avg_confidence: Option<f32>,
    pub(crate) data_quality: DataQuality,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum RecorderPhase {
    Idle,
    Recording,
    Finalized,
}

/// Buffers a running session and computes its totals once, at stop.
#[derive(Debug, Clone)]
pub(crate) struct GaitRecorder {
    settings: GaitSettings,
    phase: RecorderPhase,
    frames: usize,
    samples: Vec<GaitSample>,
    aggregate: Option<SessionAggregate>,
}

impl GaitRecorder {
    pub(crate) fn new(settings: GaitSettings) -> Result<Self, Error> {
        if !(settings.fps > 0.0 && settings.fps.is_finite()) {
            return Err(Error::InvalidFps(settings.fps));
        }
        Ok(Self {
            settings,
            phase: RecorderPhase::Idle,
            frames: 0,
            samples: Vec::new(),
            aggregate: None,
        })
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> RecorderPhase {
        self.phase
    }

    #[cfg(test)]
    pub(crate) fn aggregate(&self) -> Option<&SessionAggregate> {
        self.aggregate.as_ref()
    }

    pub(crate) fn start(&mut self) {
        self.phase = RecorderPhase::Recording;
        self.frames = 0;
        self.samples.clear();
        self.aggregate = None;
        info!(message = "gait recording started");
    }

    /// Record one delivered frame; `None` when no runner was detected.
    pub(crate) fn record(&mut self, sample: Option<GaitSample>) -> Result<(), Error> {
        if self.phase != RecorderPhase::Recording {
            return Err(Error::NotRecording);
        }
        self.frames += 1;
        self.samples.extend(sample);
        Ok(())
    }

    pub(crate) fn stop(&mut self) -> Result<&SessionAggregate, Error> {
        if self.phase != RecorderPhase::Recording {
            return Err(Error::NotRecording);
        }
        let aggregate = finalize(&self.samples, self.frames, &self.settings)?;
        info!(
            message = "gait recording finalized",
            frames = aggregate.frames,
            steps = aggregate.step_count,
            cadence = aggregate.cadence.steps_per_minute,
            cadence_fallback = aggregate.cadence.is_fallback,
        );
        self.phase = RecorderPhase::Finalized;
        Ok(self.aggregate.get_or_insert(aggregate))
    }
}

fn finalize(
    samples: &[GaitSample],
    frames: usize,
    settings: &GaitSettings,
) -> Result<SessionAggregate, Error> {
    let hip_y: Array1<f32> = samples.iter().map(|s| s.hip_midpoint_y).collect();

    let duration_secs = frames.to_f32().ok_or(Error::ConvertToF32)? / settings.fps;
    let step_count = count_zero_crossings(hip_y.view());
    let cadence = cadence(step_count, duration_secs, settings)?;

    let vertical_oscillation = mean_window_range(hip_y.view(), settings.oscillation_window);
    let avg_confidence = mean(samples.iter().map(|s| s.lower_body_confidence));

    Ok(SessionAggregate {
        frames,
        detected_frames: samples.len(),
        duration_secs,
        step_count,
        cadence,
        avg_lean_degrees: mean(samples.iter().map(|s| s.trunk_lean_degrees)).unwrap_or(0.0),
        avg_hip_drop_degrees: mean(samples.iter().map(|s| s.hip_line_degrees)).unwrap_or(0.0),
        avg_knee_degrees: mean(
            samples
                .iter()
                .flat_map(|s| vec![s.left_knee_degrees, s.right_knee_degrees]),
        )
        .unwrap_or(0.0),
        vertical_oscillation,
        vertical_oscillation_percent: vertical_oscillation / ESTIMATED_BODY_HEIGHT * 100.0,
        avg_confidence,
        data_quality: DataQuality::from_confidence(avg_confidence),
    })
}

fn cadence(step_count: usize, duration_secs: f32, settings: &GaitSettings) -> Result<Cadence, Error> {
    let measured = if duration_secs > 0.0 {
        step_count.to_f32().ok_or(Error::ConvertToF32)? / duration_secs * 60.0
    } else {
        0.0
    };
    let is_fallback = !(settings.min_cadence..=settings.max_cadence).contains(&measured);
    if is_fallback {
        debug!(
            message = "implausible cadence, using fallback",
            measured,
            fallback = settings.fallback_cadence
        );
    }
    Ok(Cadence {
        steps_per_minute: if is_fallback {
            settings.fallback_cadence
        } else {
            measured
        },
        measured,
        is_fallback,
    })
}

/// Count direction changes of `signal`, i.e. sign changes of its first difference.
pub(crate) fn count_zero_crossings(signal: ArrayView1<f32>) -> usize {
    if signal.len() < 2 {
        return 0;
    }
    let velocity = &signal.slice(s![1..]) - &signal.slice(s![..-1]);
    velocity
        .iter()
        .filter(|v| v.abs() > VELOCITY_EPSILON)
        .map(|v| v.is_sign_positive())
        .tuple_windows::<(bool, bool)>()
        .filter(|(previous, current)| previous != current)
        .count()
}

/// Mean of max - min over consecutive windows of `window` samples. A trailing
/// window with a single sample has no range and is skipped.
pub(crate) fn mean_window_range(signal: ArrayView1<f32>, window: usize) -> f32 {
    if signal.is_empty() {
        return 0.0;
    }
    let ranges = signal
        .axis_chunks_iter(Axis(0), window.max(1))
        .filter_map(|chunk| {
            match chunk
                .iter()
                .filter_map(|&v| NotNan::new(v).ok())
                .minmax()
            {
                MinMaxResult::MinMax(low, high) => Some((high - low).into_inner()),
                MinMaxResult::OneElement(_) | MinMaxResult::NoElements => None,
            }
        });
    mean(ranges).unwrap_or(0.0)
}

fn mean<I>(values: I) -> Option<f32>
where
    I: IntoIterator<Item = f32>,
{
    let (sum, count) = values
        .into_iter()
        .fold((0.0_f32, 0_usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        None
    } else {
        count.to_f32().map(|count| sum / count)
    }
}
