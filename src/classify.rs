use crate::{calibration::CalibrationProfile, metrics::PostureSample};
use serde::Serialize;
use std::fmt;

const DEFAULT_TILT_TOLERANCE: &str = "0.35";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub(crate) enum PostureState {
    Good,
    Idle,
    Slouch,
    Tilt,
    Shrug,
}

impl PostureState {
    /// Whether this state should start or extend a bad-posture streak.
    pub(crate) fn is_bad(self) -> bool {
        matches!(self, Self::Slouch | Self::Tilt | Self::Shrug)
    }
}

impl fmt::Display for PostureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Good => "GOOD",
            Self::Idle => "IDLE",
            Self::Slouch => "SLOUCH",
            Self::Tilt => "TILT",
            Self::Shrug => "SHRUG",
        })
    }
}

#[derive(Debug, Clone, Copy, structopt::StructOpt)]
pub(crate) struct ClassifierSettings {
    /// Uncalibrated tilt tolerance, as a fraction of the inter-ear distance.
    #[structopt(long, default_value = DEFAULT_TILT_TOLERANCE)]
    pub(crate) tilt_tolerance: f32,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            tilt_tolerance: DEFAULT_TILT_TOLERANCE.parse().unwrap(),
        }
    }
}

/// Classify one sample. Checks run in priority order and the first match wins:
/// shrug before slouch, because raised shoulders shorten the mouth to shoulder
/// distance less than the head width and can pass for good posture; tilt last.
pub(crate) fn classify(
    sample: Option<&PostureSample>,
    profile: &CalibrationProfile,
    settings: &ClassifierSettings,
) -> PostureState {
    let sample = match sample {
        Some(sample) => sample,
        None => return PostureState::Idle,
    };

    let tilt_tolerance = profile
        .tilt_threshold
        .unwrap_or(settings.tilt_tolerance * sample.inter_ear_distance);

    if profile
        .shrug_threshold
        .map_or(false, |threshold| sample.ear_to_shoulder_distance < threshold)
    {
        PostureState::Shrug
    } else if sample.forward_flexion_ratio < profile.bad_posture_threshold() {
        PostureState::Slouch
    } else if sample.ear_y_diff > tilt_tolerance {
        PostureState::Tilt
    } else {
        PostureState::Good
    }
}

/// What the metric extractor made of one delivered frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum FrameOutcome {
    NoSubject,
    Rejected,
    Sample(PostureSample),
}

/// Per-session classifier that holds its last answer across rejected frames.
#[derive(Debug, Clone)]
pub(crate) struct StateClassifier {
    settings: ClassifierSettings,
    current: PostureState,
}

impl StateClassifier {
    pub(crate) fn new(settings: ClassifierSettings) -> Self {
        Self {
            settings,
            current: PostureState::Idle,
        }
    }

    pub(crate) fn observe(
        &mut self,
        outcome: &FrameOutcome,
        profile: &CalibrationProfile,
    ) -> PostureState {
        self.current = match outcome {
            FrameOutcome::NoSubject => PostureState::Idle,
            FrameOutcome::Rejected => self.current,
            FrameOutcome::Sample(sample) => classify(Some(sample), profile, &self.settings),
        };
        self.current
    }

    #[cfg(test)]
    pub(crate) fn current(&self) -> PostureState {
        self.current
    }

    pub(crate) fn reset(&mut self) {
        self.current = PostureState::Idle;
    }
}
