use crate::{
    error::Error,
    landmark::{LandmarkFrame, LandmarkKind::*, Point},
};
use num_traits::ToPrimitive;
use serde::Serialize;

const DEFAULT_MIN_EAR_DISTANCE: &str = "0.01";
const DEFAULT_SMOOTHING: &str = "1.0";

#[derive(Debug, Clone, Copy, structopt::StructOpt)]
pub(crate) struct ExtractorSettings {
    /// Frames whose inter-ear distance is below this are dropped.
    #[structopt(long, default_value = DEFAULT_MIN_EAR_DISTANCE)]
    pub(crate) min_ear_distance: f32,
    /// Exponential smoothing factor for posture metrics, 1.0 disables smoothing.
    #[structopt(long, default_value = DEFAULT_SMOOTHING)]
    pub(crate) smoothing: f32,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            min_ear_distance: DEFAULT_MIN_EAR_DISTANCE.parse().unwrap(),
            smoothing: DEFAULT_SMOOTHING.parse().unwrap(),
        }
    }
}

/// Scalars derived from a single frame for posture monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub(crate) struct PostureSample {
    pub(crate) forward_flexion_ratio: f32,
    pub(crate) ear_to_shoulder_distance: f32,
    pub(crate) ear_y_diff: f32,
    pub(crate) inter_ear_distance: f32,
}

/// Scalars derived from a single frame of a running recording.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub(crate) struct GaitSample {
    pub(crate) trunk_lean_degrees: f32,
    pub(crate) hip_line_degrees: f32,
    pub(crate) hip_midpoint_y: f32,
    pub(crate) left_knee_degrees: f32,
    pub(crate) right_knee_degrees: f32,
    pub(crate) lower_body_confidence: f32,
}

/// Derive the posture metrics from `frame`.
///
/// The inter-ear distance normalizes the flexion ratio, so a frame where the
/// ears nearly coincide is rejected with [`Error::DegenerateFrame`] instead of
/// producing a blown-up ratio.
pub(crate) fn extract_posture(
    frame: &LandmarkFrame,
    settings: &ExtractorSettings,
) -> Result<PostureSample, Error> {
    let left_ear = frame.point(LeftEar)?;
    let right_ear = frame.point(RightEar)?;
    let inter_ear_distance = left_ear.distance(right_ear);
    if inter_ear_distance < settings.min_ear_distance {
        return Err(Error::DegenerateFrame {
            a: LeftEar,
            b: RightEar,
            distance: inter_ear_distance,
            epsilon: settings.min_ear_distance,
        });
    }

    let mouth = frame.point(MouthLeft)?.midpoint(frame.point(MouthRight)?);
    let shoulders = frame
        .point(LeftShoulder)?
        .midpoint(frame.point(RightShoulder)?);

    Ok(PostureSample {
        forward_flexion_ratio: mouth.distance(shoulders) / inter_ear_distance,
        ear_to_shoulder_distance: shoulders.y() - left_ear.midpoint(right_ear).y(),
        ear_y_diff: (left_ear.y() - right_ear.y()).abs(),
        inter_ear_distance,
    })
}

/// Derive the running-form metrics from `frame`.
///
/// `aspect_ratio` is the source width over height; horizontal offsets are
/// scaled by it so that angles are measured in pixel space.
pub(crate) fn extract_gait(frame: &LandmarkFrame, aspect_ratio: f32) -> Result<GaitSample, Error> {
    let scaled = |kind| -> Result<Point, Error> {
        let point = frame.point(kind)?;
        Point::new(point.x() * aspect_ratio, point.y())
    };

    let left_hip = scaled(LeftHip)?;
    let right_hip = scaled(RightHip)?;
    let hips = left_hip.midpoint(right_hip);
    let shoulders = scaled(LeftShoulder)?.midpoint(scaled(RightShoulder)?);

    let lower_body = [LeftHip, RightHip, LeftKnee, RightKnee, LeftAnkle, RightAnkle];
    let lower_body_confidence = lower_body
        .iter()
        .map(|&kind| frame.get(kind).map(|landmark| landmark.visibility))
        .sum::<Result<f32, Error>>()?
        / lower_body.len().to_f32().ok_or(Error::ConvertToF32)?;

    Ok(GaitSample {
        trunk_lean_degrees: angle_from_vertical(hips, shoulders),
        hip_line_degrees: angle_from_horizontal(left_hip, right_hip),
        hip_midpoint_y: hips.y(),
        left_knee_degrees: joint_angle(left_hip, scaled(LeftKnee)?, scaled(LeftAnkle)?),
        right_knee_degrees: joint_angle(right_hip, scaled(RightKnee)?, scaled(RightAnkle)?),
        lower_body_confidence,
    })
}

/// Unsigned angle in degrees between vertical and the line from `base` up to `tip`.
pub(crate) fn angle_from_vertical(base: Point, tip: Point) -> f32 {
    // image y grows downward
    let dx = tip.x() - base.x();
    let dy = base.y() - tip.y();
    dx.atan2(dy).to_degrees().abs()
}

/// Angle in degrees between horizontal and the line through `a` and `b`, in [0, 90].
pub(crate) fn angle_from_horizontal(a: Point, b: Point) -> f32 {
    let delta = b - a;
    delta.y().abs().atan2(delta.x().abs()).to_degrees()
}

/// Interior angle in degrees at `vertex` formed by `a` and `c`.
pub(crate) fn joint_angle(a: Point, vertex: Point, c: Point) -> f32 {
    let ba = a - vertex;
    let bc = c - vertex;
    let norms = ba.dot(ba).sqrt() * bc.dot(bc).sqrt() + 1e-12;
    (ba.dot(bc) / norms).clamp(-1.0, 1.0).acos().to_degrees()
}

/// Exponential moving average over posture samples.
#[derive(Debug, Clone)]
pub(crate) struct MetricSmoother {
    alpha: f32,
    state: Option<PostureSample>,
}

impl MetricSmoother {
    pub(crate) fn new(alpha: f32) -> Result<Self, Error> {
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(Error::InvalidSmoothing(alpha));
        }
        Ok(Self { alpha, state: None })
    }

    pub(crate) fn smooth(&mut self, sample: PostureSample) -> PostureSample {
        let alpha = self.alpha;
        let blend = |previous: f32, current: f32| previous + alpha * (current - previous);
        let smoothed = match self.state {
            None => sample,
            Some(previous) => PostureSample {
                forward_flexion_ratio: blend(
                    previous.forward_flexion_ratio,
                    sample.forward_flexion_ratio,
                ),
                ear_to_shoulder_distance: blend(
                    previous.ear_to_shoulder_distance,
                    sample.ear_to_shoulder_distance,
                ),
                ear_y_diff: blend(previous.ear_y_diff, sample.ear_y_diff),
                inter_ear_distance: blend(previous.inter_ear_distance, sample.inter_ear_distance),
            },
        };
        self.state = Some(smoothed);
        smoothed
    }

    pub(crate) fn reset(&mut self) {
        self.state = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmark::testing::FrameBuilder;
    use assert_approx_eq::assert_approx_eq;

    mod extract_posture_tests {
        use super::*;

        #[test]
        fn upright_frame() {
            let sample =
                extract_posture(&FrameBuilder::upright().build(), &Default::default()).unwrap();
            // mouth midpoint (0.5, 0.36), shoulder midpoint (0.5, 0.46), ears 0.1 apart
            assert_approx_eq!(sample.forward_flexion_ratio, 1.0);
            assert_approx_eq!(sample.ear_to_shoulder_distance, 0.16);
            assert_approx_eq!(sample.ear_y_diff, 0.0);
            assert_approx_eq!(sample.inter_ear_distance, 0.1);
        }

        #[test]
        fn head_forward_shrinks_ratio() {
            let frame = FrameBuilder::upright()
                .with(MouthLeft, 0.48, 0.40)
                .with(MouthRight, 0.52, 0.40)
                .build();
            let sample = extract_posture(&frame, &Default::default()).unwrap();
            assert_approx_eq!(sample.forward_flexion_ratio, 0.6);
        }

        #[test]
        fn tilt_is_vertical_ear_offset() {
            let frame = FrameBuilder::upright().with(RightEar, 0.55, 0.34).build();
            let sample = extract_posture(&frame, &Default::default()).unwrap();
            assert_approx_eq!(sample.ear_y_diff, 0.04);
        }

        #[test]
        fn coincident_ears_are_rejected() {
            let frame = FrameBuilder::upright()
                .with(LeftEar, 0.5, 0.30)
                .with(RightEar, 0.505, 0.30)
                .build();
            let err = extract_posture(&frame, &Default::default()).unwrap_err();
            assert!(matches!(err, Error::DegenerateFrame { .. }));
        }

        #[test]
        fn input_frame_is_untouched() {
            let frame = FrameBuilder::upright().build();
            let copy = frame;
            extract_posture(&frame, &Default::default()).unwrap();
            assert_eq!(frame, copy);
        }
    }

    mod extract_gait_tests {
        use super::*;

        #[test]
        fn upright_runner() {
            let sample = extract_gait(&FrameBuilder::upright().build(), 1.0).unwrap();
            assert_approx_eq!(sample.trunk_lean_degrees, 0.0);
            assert_approx_eq!(sample.hip_line_degrees, 0.0);
            assert_approx_eq!(sample.hip_midpoint_y, 0.8);
            assert_approx_eq!(sample.left_knee_degrees, 180.0, 1e-2);
            assert_approx_eq!(sample.lower_body_confidence, 1.0);
        }

        #[test]
        fn lean_is_direction_agnostic() {
            let forward = FrameBuilder::upright()
                .with(LeftShoulder, 0.50, 0.50)
                .with(RightShoulder, 0.70, 0.50)
                .build();
            let backward = FrameBuilder::upright()
                .with(LeftShoulder, 0.30, 0.50)
                .with(RightShoulder, 0.50, 0.50)
                .build();
            let forward = extract_gait(&forward, 1.0).unwrap().trunk_lean_degrees;
            let backward = extract_gait(&backward, 1.0).unwrap().trunk_lean_degrees;
            // shoulders 0.1 to the side and 0.3 above the hips
            assert_approx_eq!(forward, 0.1_f32.atan2(0.3).to_degrees(), 1e-3);
            assert_approx_eq!(forward, backward, 1e-3);
        }

        #[test]
        fn hip_drop_angle() {
            let frame = FrameBuilder::upright().with(RightHip, 0.55, 0.90).build();
            let sample = extract_gait(&frame, 1.0).unwrap();
            assert_approx_eq!(sample.hip_line_degrees, 45.0, 1e-3);
        }

        #[test]
        fn aspect_ratio_scales_horizontal_offsets() {
            let frame = FrameBuilder::upright().with(RightHip, 0.55, 0.90).build();
            let sample = extract_gait(&frame, 2.0).unwrap();
            assert_approx_eq!(sample.hip_line_degrees, 0.5_f32.atan().to_degrees(), 1e-3);
        }

        #[test]
        fn confidence_is_mean_lower_body_visibility() {
            let frame = FrameBuilder::upright()
                .with_visibility(LeftAnkle, 0.4)
                .with_visibility(RightAnkle, 0.4)
                .build();
            let sample = extract_gait(&frame, 1.0).unwrap();
            assert_approx_eq!(sample.lower_body_confidence, 0.8);
        }
    }

    mod joint_angle_tests {
        use super::*;

        #[test]
        fn right_angle() {
            let a = Point::new(0.0, 1.0).unwrap();
            let vertex = Point::new(0.0, 0.0).unwrap();
            let c = Point::new(1.0, 0.0).unwrap();
            assert_approx_eq!(joint_angle(a, vertex, c), 90.0, 1e-3);
        }

        #[test]
        fn zero_length_limb_does_not_panic() {
            let p = Point::new(0.5, 0.5).unwrap();
            assert!(joint_angle(p, p, p).is_finite());
        }
    }

    mod smoother_tests {
        use super::*;

        fn sample(ratio: f32) -> PostureSample {
            PostureSample {
                forward_flexion_ratio: ratio,
                ear_to_shoulder_distance: 0.1,
                ear_y_diff: 0.0,
                inter_ear_distance: 0.1,
            }
        }

        #[test]
        fn alpha_one_is_identity() {
            let mut smoother = MetricSmoother::new(1.0).unwrap();
            smoother.smooth(sample(1.0));
            assert_approx_eq!(smoother.smooth(sample(0.5)).forward_flexion_ratio, 0.5);
        }

        #[test]
        fn half_alpha_blends() {
            let mut smoother = MetricSmoother::new(0.5).unwrap();
            smoother.smooth(sample(1.0));
            assert_approx_eq!(smoother.smooth(sample(0.5)).forward_flexion_ratio, 0.75);
            smoother.reset();
            assert_approx_eq!(smoother.smooth(sample(0.5)).forward_flexion_ratio, 0.5);
        }

        #[test]
        fn invalid_alpha() {
            assert!(MetricSmoother::new(0.0).is_err());
            assert!(MetricSmoother::new(1.5).is_err());
            assert!(MetricSmoother::new(f32::NAN).is_err());
        }
    }
}
