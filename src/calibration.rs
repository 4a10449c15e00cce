use crate::{error::Error, metrics::PostureSample};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, str::FromStr};
use num_traits::ToPrimitive;
use tracing::{debug, info, warn};

pub(crate) const MIN_SAMPLES_PER_TARGET: usize = 3;
pub(crate) const DEFAULT_BASELINE_RATIO: f32 = 0.95;
pub(crate) const DEFAULT_SENSITIVITY: f32 = 0.85;
const TILT_THRESHOLD_SCALE: f32 = 0.8;

/// The posture the user is asked to hold while samples are collected.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum CalibrationTarget {
    Good,
    Slouch,
    Tilt,
    Shrug,
}

impl CalibrationTarget {
    pub(crate) const ALL: [CalibrationTarget; 4] = [Self::Good, Self::Slouch, Self::Tilt, Self::Shrug];

    fn slot(self) -> usize {
        match self {
            Self::Good => 0,
            Self::Slouch => 1,
            Self::Tilt => 2,
            Self::Shrug => 3,
        }
    }
}

impl fmt::Display for CalibrationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Good => "good",
            Self::Slouch => "slouch",
            Self::Tilt => "tilt",
            Self::Shrug => "shrug",
        })
    }
}

/// How the shrug threshold is derived from the good and shrugged sample sets.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ShrugPolicy {
    /// Midpoint of the good flexion ratio and the shrugged ear-to-shoulder
    /// distance. The two quantities have different units; kept for
    /// compatibility with existing profiles.
    MixedUnits,
    /// Midpoint of the good and shrugged ear-to-shoulder distances.
    EarToShoulder,
}

impl Default for ShrugPolicy {
    fn default() -> Self {
        Self::MixedUnits
    }
}

impl FromStr for ShrugPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mixed-units" => Ok(Self::MixedUnits),
            "ear-to-shoulder" => Ok(Self::EarToShoulder),
            other => Err(format!(
                "unknown shrug policy {:?}, expected mixed-units or ear-to-shoulder",
                other
            )),
        }
    }
}

impl ShrugPolicy {
    fn threshold(self, good: &[PostureSample], shrug: &[PostureSample]) -> f32 {
        let shrug_distance = mean(shrug.iter().map(|s| s.ear_to_shoulder_distance));
        let good_reference = match self {
            Self::MixedUnits => mean(good.iter().map(|s| s.forward_flexion_ratio)),
            Self::EarToShoulder => mean(good.iter().map(|s| s.ear_to_shoulder_distance)),
        };
        midpoint(good_reference, shrug_distance)
    }
}

/// User specific baseline and derived classification thresholds.
///
/// The derived fields are only ever produced together by one of the
/// constructors; nothing mutates a single threshold in place.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct CalibrationProfile {
    pub(crate) baseline_ratio: f32,
    pub(crate) sensitivity: f32,
    pub(crate) slouch_threshold: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) tilt_threshold: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) shrug_threshold: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) calibration_date: Option<DateTime<Utc>>,
}

impl Default for CalibrationProfile {
    fn default() -> Self {
        Self {
            baseline_ratio: DEFAULT_BASELINE_RATIO,
            sensitivity: DEFAULT_SENSITIVITY,
            slouch_threshold: DEFAULT_BASELINE_RATIO * DEFAULT_SENSITIVITY,
            tilt_threshold: None,
            shrug_threshold: None,
            calibration_date: None,
        }
    }
}

impl CalibrationProfile {
    /// Flexion ratio below which the user counts as slouching.
    pub(crate) fn bad_posture_threshold(&self) -> f32 {
        self.slouch_threshold
    }

    /// Return a copy with a new sensitivity and a matching slouch threshold.
    pub(crate) fn with_sensitivity(self, sensitivity: f32) -> Result<Self, Error> {
        validate_sensitivity(sensitivity)?;
        Ok(Self {
            sensitivity,
            slouch_threshold: self.baseline_ratio * sensitivity,
            ..self
        })
    }

    /// Quick recalibration: `sample` becomes the new baseline.
    ///
    /// Tilt and shrug thresholds are carried over unchanged.
    pub(crate) fn zero(self, sample: &PostureSample) -> Result<Self, Error> {
        let baseline_ratio = sample.forward_flexion_ratio;
        validate_baseline(baseline_ratio)?;
        Ok(Self {
            baseline_ratio,
            slouch_threshold: baseline_ratio * self.sensitivity,
            calibration_date: Some(Utc::now()),
            ..self
        })
    }

    /// Load a profile from `path`, falling back to defaults when no profile
    /// has been saved yet.
    pub(crate) fn load<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(message = "no calibration profile found, using defaults", path = ?path);
                return Ok(Self::default());
            }
            Err(e) => return Err(Error::ReadProfile(e, path.to_path_buf())),
        };
        let profile: Self =
            toml::from_str(&content).map_err(|e| Error::ParseProfile(e, path.to_path_buf()))?;
        validate_baseline(profile.baseline_ratio)?;
        validate_sensitivity(profile.sensitivity)?;
        validate_slouch_threshold(profile.slouch_threshold, profile.baseline_ratio)?;
        debug!(message = "loaded calibration profile", ?profile);
        Ok(profile)
    }

    /// Like [`load`](Self::load), but an unreadable or invalid profile is
    /// logged and replaced by the defaults.
    pub(crate) fn load_or_default<P>(path: P) -> Self
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        Self::load(path).unwrap_or_else(|e| {
            warn!(message = "ignoring unusable calibration profile", path = ?path, error = %e);
            Self::default()
        })
    }

    pub(crate) fn persist<P>(&self, path: P) -> Result<(), Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).map_err(Error::SerializeProfile)?;
        std::fs::write(path, content).map_err(|e| Error::WriteProfile(e, path.to_path_buf()))?;
        info!(message = "saved calibration profile", path = ?path);
        Ok(())
    }
}

/// Accumulates guided calibration samples for each target posture.
#[derive(Debug, Clone, Default)]
pub(crate) struct CalibrationCollector {
    samples: [Vec<PostureSample>; 4],
}

impl CalibrationCollector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn collect_sample(&mut self, target: CalibrationTarget, sample: PostureSample) {
        let set = &mut self.samples[target.slot()];
        set.push(sample);
        debug!(message = "collected calibration sample", posture = %target, count = set.len());
    }

    pub(crate) fn count(&self, target: CalibrationTarget) -> usize {
        self.samples[target.slot()].len()
    }

    pub(crate) fn is_complete(&self) -> bool {
        CalibrationTarget::ALL
            .iter()
            .all(|&target| self.count(target) >= MIN_SAMPLES_PER_TARGET)
    }

    fn samples(&self, target: CalibrationTarget) -> Result<&[PostureSample], Error> {
        let set = &self.samples[target.slot()];
        if set.len() < MIN_SAMPLES_PER_TARGET {
            return Err(Error::InsufficientSamples {
                target,
                have: set.len(),
                need: MIN_SAMPLES_PER_TARGET,
            });
        }
        Ok(set)
    }

    /// Derive a complete profile from the collected samples.
    pub(crate) fn compute_thresholds(&self, policy: ShrugPolicy) -> Result<CalibrationProfile, Error> {
        let good = self.samples(CalibrationTarget::Good)?;
        let slouch = self.samples(CalibrationTarget::Slouch)?;
        let tilt = self.samples(CalibrationTarget::Tilt)?;
        let shrug = self.samples(CalibrationTarget::Shrug)?;

        let baseline_ratio = mean(good.iter().map(|s| s.forward_flexion_ratio));
        validate_baseline(baseline_ratio)?;
        let slouch_ratio = mean(slouch.iter().map(|s| s.forward_flexion_ratio));
        if slouch_ratio >= baseline_ratio {
            return Err(Error::SlouchNotBelowGood {
                good: baseline_ratio,
                slouch: slouch_ratio,
            });
        }

        let slouch_threshold = midpoint(baseline_ratio, slouch_ratio);
        // sensitivity is informational here, the classifier reads the threshold
        let sensitivity = slouch_threshold / baseline_ratio;
        validate_sensitivity(sensitivity)?;

        Ok(CalibrationProfile {
            baseline_ratio,
            sensitivity,
            slouch_threshold,
            tilt_threshold: Some(mean(tilt.iter().map(|s| s.ear_y_diff)) * TILT_THRESHOLD_SCALE),
            shrug_threshold: Some(policy.threshold(good, shrug)),
            calibration_date: Some(Utc::now()),
        })
    }
}

fn validate_sensitivity(sensitivity: f32) -> Result<(), Error> {
    if sensitivity > 0.0 && sensitivity <= 1.0 {
        Ok(())
    } else {
        Err(Error::InvalidSensitivity(sensitivity))
    }
}

fn validate_baseline(baseline_ratio: f32) -> Result<(), Error> {
    if baseline_ratio > 0.0 && baseline_ratio.is_finite() {
        Ok(())
    } else {
        Err(Error::InvalidBaseline(baseline_ratio))
    }
}

fn validate_slouch_threshold(threshold: f32, baseline_ratio: f32) -> Result<(), Error> {
    if threshold > 0.0 && threshold <= baseline_ratio {
        Ok(())
    } else {
        Err(Error::InvalidSlouchThreshold {
            threshold,
            baseline: baseline_ratio,
        })
    }
}

fn midpoint(a: f32, b: f32) -> f32 {
    (a + b) / 2.0
}

fn mean<I>(values: I) -> f32
where
    I: IntoIterator<Item = f32>,
{
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0_usize), |(sum, count), value| (sum + value, count + 1));
    match count.to_f32() {
        Some(count) if count > 0.0 => sum / count,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn sample(ratio: f32, ear_to_shoulder: f32, ear_y_diff: f32) -> PostureSample {
        PostureSample {
            forward_flexion_ratio: ratio,
            ear_to_shoulder_distance: ear_to_shoulder,
            ear_y_diff,
            inter_ear_distance: 0.1,
        }
    }

    fn full_collector() -> CalibrationCollector {
        let mut collector = CalibrationCollector::new();
        for &ratio in &[1.0, 1.1, 0.9] {
            collector.collect_sample(CalibrationTarget::Good, sample(ratio, 0.16, 0.0));
        }
        for &ratio in &[0.6, 0.7, 0.5] {
            collector.collect_sample(CalibrationTarget::Slouch, sample(ratio, 0.15, 0.0));
        }
        for &diff in &[0.04, 0.05, 0.06] {
            collector.collect_sample(CalibrationTarget::Tilt, sample(1.0, 0.16, diff));
        }
        for &distance in &[0.08, 0.10, 0.12] {
            collector.collect_sample(CalibrationTarget::Shrug, sample(1.0, distance, 0.0));
        }
        collector
    }

    mod compute_thresholds_tests {
        use super::*;

        #[test]
        fn derives_all_thresholds() {
            let collector = full_collector();
            assert!(collector.is_complete());
            let profile = collector.compute_thresholds(ShrugPolicy::MixedUnits).unwrap();
            assert_approx_eq!(profile.baseline_ratio, 1.0);
            assert_approx_eq!(profile.slouch_threshold, 0.8);
            assert_approx_eq!(profile.bad_posture_threshold(), 0.8);
            assert_approx_eq!(profile.sensitivity, 0.8);
            assert_approx_eq!(profile.tilt_threshold.unwrap(), 0.04);
            // midpoint of good ratio 1.0 and shrug distance 0.10
            assert_approx_eq!(profile.shrug_threshold.unwrap(), 0.55);
            assert!(profile.calibration_date.is_some());
        }

        #[test]
        fn ear_to_shoulder_policy() {
            let profile = full_collector()
                .compute_thresholds(ShrugPolicy::EarToShoulder)
                .unwrap();
            assert_approx_eq!(profile.shrug_threshold.unwrap(), 0.13);
        }

        #[test]
        fn deterministic() {
            let collector = full_collector();
            let a = collector.compute_thresholds(ShrugPolicy::default()).unwrap();
            let b = collector.compute_thresholds(ShrugPolicy::default()).unwrap();
            assert_eq!(
                CalibrationProfile {
                    calibration_date: None,
                    ..a
                },
                CalibrationProfile {
                    calibration_date: None,
                    ..b
                }
            );
        }

        #[test]
        fn slouch_threshold_between_means() {
            let cases = vec![
                (vec![1.0, 1.0, 1.0], vec![0.2, 0.3, 0.4]),
                (vec![0.7, 0.8, 0.9], vec![0.77, 0.78, 0.79]),
                (vec![0.5, 0.6, 0.7], vec![0.0, 0.1, 0.2]),
            ];
            for (good, slouch) in &cases {
                let mut collector = full_collector();
                collector.samples[CalibrationTarget::Good.slot()].clear();
                collector.samples[CalibrationTarget::Slouch.slot()].clear();
                for &ratio in good.iter() {
                    collector.collect_sample(CalibrationTarget::Good, sample(ratio, 0.16, 0.0));
                }
                for &ratio in slouch.iter() {
                    collector.collect_sample(CalibrationTarget::Slouch, sample(ratio, 0.15, 0.0));
                }
                let profile = collector.compute_thresholds(ShrugPolicy::default()).unwrap();
                let good_mean = mean(good.iter().copied());
                let slouch_mean = mean(slouch.iter().copied());
                assert_approx_eq!(profile.slouch_threshold, (good_mean + slouch_mean) / 2.0);
                assert!(profile.slouch_threshold > slouch_mean);
                assert!(profile.slouch_threshold < good_mean);
                assert_approx_eq!(profile.bad_posture_threshold(), profile.slouch_threshold);
            }
        }

        #[test]
        fn slouch_above_good_is_rejected() {
            let mut collector = full_collector();
            collector.samples[CalibrationTarget::Good.slot()].clear();
            collector.samples[CalibrationTarget::Slouch.slot()].clear();
            for _ in 0..MIN_SAMPLES_PER_TARGET {
                collector.collect_sample(CalibrationTarget::Good, sample(0.5, 0.16, 0.0));
                collector.collect_sample(CalibrationTarget::Slouch, sample(1.0, 0.15, 0.0));
            }
            match collector.compute_thresholds(ShrugPolicy::default()) {
                Err(Error::SlouchNotBelowGood { good, slouch }) => {
                    assert_approx_eq!(good, 0.5);
                    assert_approx_eq!(slouch, 1.0);
                }
                other => panic!("expected SlouchNotBelowGood, got {:?}", other),
            }
        }

        #[test]
        fn extra_samples_are_averaged_in() {
            let mut collector = full_collector();
            collector.collect_sample(CalibrationTarget::Good, sample(1.4, 0.16, 0.0));
            assert_eq!(collector.count(CalibrationTarget::Good), 4);
            let profile = collector.compute_thresholds(ShrugPolicy::default()).unwrap();
            assert_approx_eq!(profile.baseline_ratio, 1.1);
        }

        #[test]
        fn insufficient_samples() {
            let mut collector = CalibrationCollector::new();
            for _ in 0..MIN_SAMPLES_PER_TARGET {
                collector.collect_sample(CalibrationTarget::Good, sample(1.0, 0.16, 0.0));
                collector.collect_sample(CalibrationTarget::Slouch, sample(0.6, 0.16, 0.0));
                collector.collect_sample(CalibrationTarget::Tilt, sample(1.0, 0.16, 0.05));
            }
            collector.collect_sample(CalibrationTarget::Shrug, sample(1.0, 0.1, 0.0));
            assert!(!collector.is_complete());
            match collector.compute_thresholds(ShrugPolicy::default()) {
                Err(Error::InsufficientSamples { target, have, need }) => {
                    assert_eq!(target, CalibrationTarget::Shrug);
                    assert_eq!(have, 1);
                    assert_eq!(need, MIN_SAMPLES_PER_TARGET);
                }
                other => panic!("expected InsufficientSamples, got {:?}", other),
            }
        }
    }

    mod profile_tests {
        use super::*;

        #[test]
        fn defaults() {
            let profile = CalibrationProfile::default();
            assert_approx_eq!(profile.baseline_ratio, 0.95);
            assert_approx_eq!(profile.sensitivity, 0.85);
            assert_approx_eq!(profile.bad_posture_threshold(), 0.8075);
            assert!(profile.tilt_threshold.is_none());
            assert!(profile.shrug_threshold.is_none());
        }

        #[test]
        fn zero_keeps_tilt_and_shrug() {
            let calibrated = full_collector()
                .compute_thresholds(ShrugPolicy::default())
                .unwrap();
            let zeroed = calibrated.zero(&sample(1.2, 0.2, 0.0)).unwrap();
            assert_approx_eq!(zeroed.baseline_ratio, 1.2);
            assert_approx_eq!(zeroed.slouch_threshold, 1.2 * calibrated.sensitivity);
            assert_eq!(zeroed.tilt_threshold, calibrated.tilt_threshold);
            assert_eq!(zeroed.shrug_threshold, calibrated.shrug_threshold);
        }

        #[test]
        fn zero_rejects_empty_baseline() {
            assert!(CalibrationProfile::default()
                .zero(&sample(0.0, 0.2, 0.0))
                .is_err());
        }

        #[test]
        fn sensitivity_bounds() {
            let profile = CalibrationProfile::default();
            assert!(profile.with_sensitivity(0.0).is_err());
            assert!(profile.with_sensitivity(1.01).is_err());
            let profile = profile.with_sensitivity(0.5).unwrap();
            assert_approx_eq!(profile.slouch_threshold, 0.475);
        }
    }

    mod persistence_tests {
        use super::*;

        #[test]
        fn missing_file_loads_defaults() {
            let dir = tempfile::tempdir().unwrap();
            let profile = CalibrationProfile::load(dir.path().join("profile.toml")).unwrap();
            assert_eq!(profile, CalibrationProfile::default());
        }

        #[test]
        fn persisted_profile_loads_back() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("profile.toml");
            let profile = full_collector()
                .compute_thresholds(ShrugPolicy::default())
                .unwrap();
            profile.persist(&path).unwrap();

            let content = std::fs::read_to_string(&path).unwrap();
            assert!(content.contains("baseline_ratio"));
            assert!(content.contains("calibration_date"));

            let loaded = CalibrationProfile::load(&path).unwrap();
            assert_approx_eq!(loaded.baseline_ratio, profile.baseline_ratio);
            assert_approx_eq!(loaded.slouch_threshold, profile.slouch_threshold);
            assert_eq!(loaded.tilt_threshold, profile.tilt_threshold);
            assert_eq!(loaded.shrug_threshold, profile.shrug_threshold);
            assert_eq!(loaded.calibration_date, profile.calibration_date);
        }

        #[test]
        fn persisted_slouch_threshold_is_kept() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("profile.toml");
            std::fs::write(
                &path,
                "baseline_ratio = 1.0\nsensitivity = 0.9\nslouch_threshold = 0.7\n",
            )
            .unwrap();
            let loaded = CalibrationProfile::load(&path).unwrap();
            assert_approx_eq!(loaded.slouch_threshold, 0.7);
            assert_approx_eq!(loaded.bad_posture_threshold(), 0.7);
            assert_approx_eq!(loaded.sensitivity, 0.9);
        }

        #[test]
        fn threshold_above_baseline_is_invalid() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("profile.toml");
            std::fs::write(
                &path,
                "baseline_ratio = 1.0\nsensitivity = 0.9\nslouch_threshold = 1.5\n",
            )
            .unwrap();
            assert!(matches!(
                CalibrationProfile::load(&path),
                Err(Error::InvalidSlouchThreshold { .. })
            ));
        }

        #[test]
        fn unreadable_profile_falls_back_to_defaults() {
            let dir = tempfile::tempdir().unwrap();
            assert!(matches!(
                CalibrationProfile::load(dir.path()),
                Err(Error::ReadProfile(..))
            ));
            assert_eq!(
                CalibrationProfile::load_or_default(dir.path()),
                CalibrationProfile::default()
            );
        }

        #[test]
        fn corrupt_profile_falls_back_to_defaults() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("profile.toml");
            std::fs::write(&path, "baseline_ratio = [").unwrap();
            assert_eq!(
                CalibrationProfile::load_or_default(&path),
                CalibrationProfile::default()
            );
        }

        #[test]
        fn garbage_is_a_parse_error() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("profile.toml");
            std::fs::write(&path, "baseline_ratio = \"tall\"").unwrap();
            assert!(matches!(
                CalibrationProfile::load(&path),
                Err(Error::ParseProfile(..))
            ));
        }
    }
}
