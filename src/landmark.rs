use crate::error::Error;
use num_traits::ToPrimitive;
use ordered_float::NotNan;
use serde::{Deserialize, Serialize};
use std::{convert::TryFrom, ops::Sub};

/// BlazePose keypoints, in the order the model emits them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, num_derive::ToPrimitive)]
pub(crate) enum LandmarkKind {
    Nose,
    LeftEyeInner,
    LeftEye,
    LeftEyeOuter,
    RightEyeInner,
    RightEye,
    RightEyeOuter,
    LeftEar,
    RightEar,
    MouthLeft,
    MouthRight,
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    RightElbow,
    LeftWrist,
    RightWrist,
    LeftPinky,
    RightPinky,
    LeftIndex,
    RightIndex,
    LeftThumb,
    RightThumb,
    LeftHip,
    RightHip,
    LeftKnee,
    RightKnee,
    LeftAnkle,
    RightAnkle,
    LeftHeel,
    RightHeel,
    LeftFootIndex,
    RightFootIndex,
}

impl LandmarkKind {
    pub(crate) fn idx(self) -> Result<usize, Error> {
        self.to_usize().ok_or(Error::LandmarkVariantToUSize(self))
    }
}

pub(crate) const NUM_LANDMARKS: usize = LandmarkKind::RightFootIndex as usize + 1;

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub(crate) struct Point {
    x: f32,
    y: f32,
}

impl Point {
    pub(crate) fn new(x: f32, y: f32) -> Result<Self, Error> {
        Ok(Self {
            x: NotNan::new(x)
                .map_err(|e| Error::ConstructNotNan(e, x))?
                .into_inner(),
            y: NotNan::new(y)
                .map_err(|e| Error::ConstructNotNan(e, y))?
                .into_inner(),
        })
    }

    pub(crate) fn midpoint(self, other: Self) -> Self {
        Self {
            x: (self.x + other.x) / 2.0,
            y: (self.y + other.y) / 2.0,
        }
    }

    pub(crate) fn squared_distance(self, other: Self) -> f32 {
        let delta = other - self;
        delta.dot(delta)
    }

    pub(crate) fn distance(self, other: Self) -> f32 {
        self.squared_distance(other).sqrt()
    }

    #[inline]
    pub(crate) fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y
    }

    #[inline]
    pub(crate) fn x(self) -> f32 {
        self.x
    }

    #[inline]
    pub(crate) fn y(self) -> f32 {
        self.y
    }
}

impl Sub for Point {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self::Output {
            x: self.x - rhs.x,
            y: self.y - rhs.y,
        }
    }
}

/// A single keypoint in normalized image coordinates.
#[derive(Debug, Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
pub(crate) struct Landmark {
    pub(crate) x: f32,
    pub(crate) y: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) z: Option<f32>,
    #[serde(default = "full_visibility")]
    pub(crate) visibility: f32,
}

fn full_visibility() -> f32 {
    1.0
}

impl Landmark {
    pub(crate) fn new(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            z: None,
            visibility: 1.0,
        }
    }

    pub(crate) fn point(&self) -> Result<Point, Error> {
        Point::new(self.x, self.y)
    }
}

pub(crate) type Landmarks = [Landmark; NUM_LANDMARKS];

/// One frame worth of landmarks from the pose model.
#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) struct LandmarkFrame {
    landmarks: Landmarks,
}

impl LandmarkFrame {
    pub(crate) fn new(landmarks: Landmarks) -> Self {
        Self { landmarks }
    }

    #[inline]
    pub(crate) fn get(&self, kind: LandmarkKind) -> Result<&Landmark, Error> {
        Ok(&self.landmarks[kind.idx()?])
    }

    pub(crate) fn point(&self, kind: LandmarkKind) -> Result<Point, Error> {
        self.get(kind)?.point()
    }
}

impl TryFrom<Vec<Landmark>> for LandmarkFrame {
    type Error = Error;

    fn try_from(landmarks: Vec<Landmark>) -> Result<Self, Self::Error> {
        let count = landmarks.len();
        let landmarks =
            Landmarks::try_from(landmarks).map_err(|_| Error::LandmarkCount(NUM_LANDMARKS, count))?;
        Ok(Self::new(landmarks))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    mod point_tests {
        use super::Point;
        use assert_approx_eq::assert_approx_eq;

        #[test]
        fn xy_points() {
            let a = Point::new(0.5, 0.5).unwrap();
            let b = Point::new(1.0, 1.0).unwrap();
            assert_eq!(a.squared_distance(b), 0.5);
        }

        #[test]
        fn midpoint() {
            let m = Point::new(0.2, 0.4)
                .unwrap()
                .midpoint(Point::new(0.4, 0.8).unwrap());
            assert_approx_eq!(m.x(), 0.3);
            assert_approx_eq!(m.y(), 0.6);
        }

        #[test]
        fn nan_is_rejected() {
            assert!(Point::new(f32::NAN, 0.0).is_err());
        }
    }

    mod landmark_kind_tests {
        use super::{LandmarkKind, NUM_LANDMARKS};

        #[test]
        fn blazepose_indices() {
            assert_eq!(NUM_LANDMARKS, 33);
            assert_eq!(LandmarkKind::LeftEar.idx().unwrap(), 7);
            assert_eq!(LandmarkKind::MouthRight.idx().unwrap(), 10);
            assert_eq!(LandmarkKind::LeftShoulder.idx().unwrap(), 11);
            assert_eq!(LandmarkKind::RightHip.idx().unwrap(), 24);
            assert_eq!(LandmarkKind::RightAnkle.idx().unwrap(), 28);
        }
    }

    mod frame_tests {
        use super::{Landmark, LandmarkFrame, NUM_LANDMARKS};
        use crate::error::Error;
        use std::convert::TryFrom;

        #[test]
        fn wrong_landmark_count_is_rejected() {
            let err = LandmarkFrame::try_from(vec![Landmark::default(); 17]).unwrap_err();
            assert!(matches!(err, Error::LandmarkCount(NUM_LANDMARKS, 17)));
        }

        #[test]
        fn full_frame_is_accepted() {
            assert!(LandmarkFrame::try_from(vec![Landmark::default(); NUM_LANDMARKS]).is_ok());
        }
    }
}
