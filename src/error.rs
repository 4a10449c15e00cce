use crate::{calibration::CalibrationTarget, landmark::LandmarkKind};

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("expected {0} landmarks per frame, got {1}")]
    LandmarkCount(usize, usize),

    #[error("failed to convert landmark variant to usize: {0:?}")]
    LandmarkVariantToUSize(LandmarkKind),

    #[error("failed to construct NotNan from f32: {1}")]
    ConstructNotNan(#[source] ordered_float::FloatIsNan, f32),

    #[error("degenerate frame: distance {distance} between {a:?} and {b:?} is below {epsilon}")]
    DegenerateFrame {
        a: LandmarkKind,
        b: LandmarkKind,
        distance: f32,
        epsilon: f32,
    },

    #[error("not enough {target} calibration samples: have {have}, need {need}")]
    InsufficientSamples {
        target: CalibrationTarget,
        have: usize,
        need: usize,
    },

    #[error("sensitivity must be in (0, 1], got {0}")]
    InvalidSensitivity(f32),

    #[error("baseline flexion ratio must be positive, got {0}")]
    InvalidBaseline(f32),

    #[error("slouch threshold must be positive and at most the baseline {baseline}, got {threshold}")]
    InvalidSlouchThreshold { threshold: f32, baseline: f32 },

    #[error("slouched flexion ratio {slouch} is not below the good ratio {good}")]
    SlouchNotBelowGood { good: f32, slouch: f32 },

    #[error("smoothing factor must be in (0, 1], got {0}")]
    InvalidSmoothing(f32),

    #[error("frames per second must be positive, got {0}")]
    InvalidFps(f32),

    #[error("gait recorder is not recording")]
    NotRecording,

    #[error("failed to convert value to f32")]
    ConvertToF32,

    #[error("failed to read calibration profile: {1:?}")]
    ReadProfile(#[source] std::io::Error, std::path::PathBuf),

    #[error("failed to write calibration profile: {1:?}")]
    WriteProfile(#[source] std::io::Error, std::path::PathBuf),

    #[error("failed to parse calibration profile: {1:?}")]
    ParseProfile(#[source] toml::de::Error, std::path::PathBuf),

    #[error("failed to serialize calibration profile")]
    SerializeProfile(#[source] toml::ser::Error),

    #[error("failed to read landmark frame from line {1}")]
    ReadFrame(#[source] std::io::Error, usize),

    #[error("failed to parse landmark frame on line {1}")]
    ParseFrame(#[source] serde_json::Error, usize),

    #[error("feedback actuator unavailable: {0}")]
    Actuator(String),
}
