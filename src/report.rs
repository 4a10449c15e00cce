use crate::aggregate::{DataQuality, SessionAggregate};
use serde::Serialize;
use std::fmt;

const RULE_WIDTH: usize = 60;

/// Inclusive range of values considered good form.
#[derive(Debug, Copy, Clone, PartialEq)]
struct Band {
    low: f32,
    high: f32,
}

impl Band {
    const fn new(low: f32, high: f32) -> Self {
        Self { low, high }
    }

    fn status(self, value: f32) -> Status {
        if value < self.low {
            Status::Low
        } else if value > self.high {
            Status::High
        } else {
            Status::Good
        }
    }
}

const CADENCE_BAND: Band = Band::new(170.0, 185.0);
const LEAN_BAND: Band = Band::new(2.0, 12.0);
const HIP_DROP_BAND: Band = Band::new(0.0, 5.0);
const OSCILLATION_BAND: Band = Band::new(0.0, 8.0);
const KNEE_BAND: Band = Band::new(150.0, 175.0);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Metric {
    Cadence,
    TrunkLean,
    HipDrop,
    VerticalOscillation,
    KneeAngle,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cadence => "cadence",
            Self::TrunkLean => "trunk lean",
            Self::HipDrop => "hip drop",
            Self::VerticalOscillation => "vertical oscillation",
            Self::KneeAngle => "knee angle",
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Status {
    Good,
    Low,
    High,
    /// The value shown is a substitute, not a measurement.
    Unmeasured,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Good => "GOOD",
            Self::Low => "LOW",
            Self::High => "HIGH",
            Self::Unmeasured => "UNMEASURED",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct Recommendation {
    pub(crate) metric: Metric,
    pub(crate) status: Status,
    pub(crate) message: &'static str,
}

impl Recommendation {
    fn new(metric: Metric, status: Status) -> Self {
        Self {
            metric,
            status,
            message: message(metric, status),
        }
    }
}

fn message(metric: Metric, status: Status) -> &'static str {
    match (metric, status) {
        (Metric::Cadence, Status::Unmeasured) => {
            "Step detection did not produce a plausible cadence, a default is shown instead. \
             Record a longer side-view clip at a steady pace."
        }
        (Metric::Cadence, Status::Low) => {
            "Below the 170-185 steps/min target. Low cadence often means overstriding; \
             try running to a metronome at 175 bpm."
        }
        (Metric::Cadence, Status::High) => "High cadence. Make sure you are not shuffling.",
        (Metric::Cadence, Status::Good) => "Cadence is in the efficient range.",
        (Metric::TrunkLean, Status::Low) => {
            "Nearly upright. Imagine a slight forward fall from the ankles to reduce braking."
        }
        (Metric::TrunkLean, Status::High) => {
            "Excessive forward lean strains the lower back and hamstrings. \
             Run tall and lead with your chest."
        }
        (Metric::HipDrop, Status::High) => {
            "Pelvic drop often points to weak glutes and hip abductors. Helpful exercises: \
             single-leg glute bridges 3x15 each side, banded clamshells 3x20 each side, \
             side-lying leg raises 3x15 each side."
        }
        (Metric::VerticalOscillation, Status::High) => {
            "Energy is going into bouncing up and down. Think glide, not bounce, \
             and raise your cadence to shorten flight time."
        }
        (Metric::KneeAngle, Status::Low) => {
            "Knee appears quite bent. This may be strong knee drive, \
             or the camera is not square to the runner."
        }
        (Metric::KneeAngle, Status::High) => {
            "Very straight knee, which may mean overstriding. \
             Focus on landing with your foot under your hips."
        }
        (Metric::TrunkLean, _) => "Good forward lean for running.",
        (Metric::HipDrop, _) => "Good hip stability.",
        (Metric::VerticalOscillation, _) => "Vertical oscillation looks efficient.",
        (Metric::KneeAngle, _) => "Knee angle looks reasonable.",
    }
}

/// Running-form summary of a finished gait recording.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct SessionReport {
    pub(crate) duration_secs: f32,
    pub(crate) frames: usize,
    pub(crate) detected_frames: usize,
    pub(crate) step_count: usize,
    pub(crate) cadence: f32,
    pub(crate) measured_cadence: f32,
    pub(crate) cadence_is_fallback: bool,
    pub(crate) lean_degrees: f32,
    pub(crate) hip_drop_degrees: f32,
    pub(crate) vertical_oscillation_percent: f32,
    pub(crate) avg_knee_degrees: f32,
    pub(crate) avg_confidence: Option<f32>,
    pub(crate) data_quality: DataQuality,
    pub(crate) recommendations: Vec<Recommendation>,
}

impl SessionReport {
    pub(crate) fn new(aggregate: &SessionAggregate) -> Self {
        let cadence = aggregate.cadence;
        let cadence_status = if cadence.is_fallback {
            Status::Unmeasured
        } else {
            CADENCE_BAND.status(cadence.steps_per_minute)
        };

        let recommendations = vec![
            Recommendation::new(Metric::Cadence, cadence_status),
            Recommendation::new(
                Metric::TrunkLean,
                LEAN_BAND.status(aggregate.avg_lean_degrees),
            ),
            Recommendation::new(
                Metric::HipDrop,
                HIP_DROP_BAND.status(aggregate.avg_hip_drop_degrees),
            ),
            Recommendation::new(
                Metric::VerticalOscillation,
                OSCILLATION_BAND.status(aggregate.vertical_oscillation_percent),
            ),
            Recommendation::new(
                Metric::KneeAngle,
                KNEE_BAND.status(aggregate.avg_knee_degrees),
            ),
        ];

        Self {
            duration_secs: aggregate.duration_secs,
            frames: aggregate.frames,
            detected_frames: aggregate.detected_frames,
            step_count: aggregate.step_count,
            cadence: cadence.steps_per_minute,
            measured_cadence: cadence.measured,
            cadence_is_fallback: cadence.is_fallback,
            lean_degrees: aggregate.avg_lean_degrees,
            hip_drop_degrees: aggregate.avg_hip_drop_degrees,
            vertical_oscillation_percent: aggregate.vertical_oscillation_percent,
            avg_knee_degrees: aggregate.avg_knee_degrees,
            avg_confidence: aggregate.avg_confidence,
            data_quality: aggregate.data_quality,
            recommendations,
        }
    }

    /// Metrics that landed outside their target band.
    pub(crate) fn focus_areas(&self) -> impl Iterator<Item = Metric> + '_ {
        self.recommendations
            .iter()
            .filter(|r| matches!(r.status, Status::Low | Status::High))
            .map(|r| r.metric)
    }

    fn recommendation(&self, metric: Metric) -> Option<&Recommendation> {
        self.recommendations.iter().find(|r| r.metric == metric)
    }
}

fn heading(f: &mut fmt::Formatter<'_>, title: &str) -> fmt::Result {
    writeln!(f, "{}", "-".repeat(RULE_WIDTH))?;
    writeln!(f, "{}", title)?;
    writeln!(f, "{}", "-".repeat(RULE_WIDTH))
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", "=".repeat(RULE_WIDTH))?;
        writeln!(f, "RUNNING FORM ANALYSIS")?;
        writeln!(f, "{}", "=".repeat(RULE_WIDTH))?;
        writeln!(
            f,
            "Duration: {:.1} s ({} frames, runner visible in {})",
            self.duration_secs, self.frames, self.detected_frames
        )?;
        writeln!(f, "Steps detected: {}", self.step_count)?;
        match self.avg_confidence {
            Some(confidence) => writeln!(
                f,
                "Data quality: {} (mean confidence {:.2})",
                self.data_quality, confidence
            )?,
            None => writeln!(f, "Data quality: {}", self.data_quality)?,
        }

        let sections = [
            (Metric::Cadence, "CADENCE"),
            (Metric::TrunkLean, "TRUNK POSITION"),
            (Metric::HipDrop, "HIP STABILITY"),
            (Metric::VerticalOscillation, "VERTICAL OSCILLATION"),
            (Metric::KneeAngle, "KNEE ANGLE"),
        ];
        for (metric, title) in sections.iter().copied() {
            writeln!(f)?;
            heading(f, title)?;
            match metric {
                Metric::Cadence if self.cadence_is_fallback => writeln!(
                    f,
                    "Cadence: {:.0} steps/min (fallback, measured {:.0})",
                    self.cadence, self.measured_cadence
                )?,
                Metric::Cadence => writeln!(f, "Cadence: {:.0} steps/min", self.cadence)?,
                Metric::TrunkLean => writeln!(f, "Average lean: {:.1} deg", self.lean_degrees)?,
                Metric::HipDrop => {
                    writeln!(f, "Average hip drop: {:.1} deg", self.hip_drop_degrees)?
                }
                Metric::VerticalOscillation => writeln!(
                    f,
                    "Estimated bounce: {:.1}% of height",
                    self.vertical_oscillation_percent
                )?,
                Metric::KneeAngle => {
                    writeln!(f, "Average knee angle: {:.1} deg", self.avg_knee_degrees)?
                }
            }
            if let Some(recommendation) = self.recommendation(metric) {
                writeln!(
                    f,
                    "[{}] {}",
                    recommendation.status, recommendation.message
                )?;
            }
        }

        writeln!(f)?;
        writeln!(f, "{}", "=".repeat(RULE_WIDTH))?;
        let focus = self
            .focus_areas()
            .map(|metric| metric.to_string())
            .collect::<Vec<_>>();
        if focus.is_empty() {
            writeln!(f, "Great form. Focus on consistency and gradual progression.")?;
        } else {
            writeln!(f, "Areas to focus on: {}", focus.join(", "))?;
            writeln!(
                f,
                "Work on one thing at a time and re-record in 4-6 weeks to track progress."
            )?;
        }
        write!(f, "{}", "=".repeat(RULE_WIDTH))
    }
}
