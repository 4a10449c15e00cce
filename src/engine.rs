use crate::{
    aggregate::{MonitorSettings, MonitorVerdict, PostureMonitor},
    calibration::CalibrationProfile,
    classify::{ClassifierSettings, FrameOutcome, PostureState, StateClassifier},
    error::Error,
    feedback::{Actuation, FeedbackActuator, FeedbackPolicy, FeedbackSettings},
    landmark::LandmarkFrame,
    metrics::{extract_posture, ExtractorSettings, MetricSmoother, PostureSample},
    source::TimedFrame,
};
use crossbeam::channel::{Receiver, RecvTimeoutError};
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

/// Every knob of a monitoring session.
#[derive(Debug, Clone, Copy, Default, structopt::StructOpt)]
pub(crate) struct EngineSettings {
    #[structopt(flatten)]
    pub(crate) extractor: ExtractorSettings,
    #[structopt(flatten)]
    pub(crate) classifier: ClassifierSettings,
    #[structopt(flatten)]
    pub(crate) monitor: MonitorSettings,
    #[structopt(flatten)]
    pub(crate) feedback: FeedbackSettings,
}

#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct Timing {
    pub(crate) processing: Duration,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub(crate) struct SessionStats {
    pub(crate) frames: usize,
    pub(crate) no_subject: usize,
    pub(crate) rejected: usize,
    pub(crate) bad_frames: usize,
    pub(crate) pulses: usize,
}

/// Everything the engine decided about one frame.
#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) struct FrameVerdict {
    pub(crate) sample: Option<PostureSample>,
    pub(crate) state: PostureState,
    pub(crate) monitor: MonitorVerdict,
    pub(crate) actuation: Option<Actuation>,
}

/// One monitoring session: extractor, classifier, streak monitor and
/// feedback policy, fed one frame at a time.
pub(crate) struct PostureEngine<A> {
    profile: CalibrationProfile,
    extractor: ExtractorSettings,
    smoother: MetricSmoother,
    classifier: StateClassifier,
    monitor: PostureMonitor,
    feedback: FeedbackPolicy,
    actuator: A,
    stats: SessionStats,
    pub(crate) timing: Timing,
}

impl<A> PostureEngine<A>
where
    A: FeedbackActuator,
{
    pub(crate) fn new(
        profile: CalibrationProfile,
        settings: EngineSettings,
        actuator: A,
    ) -> Result<Self, Error> {
        Ok(Self {
            profile,
            extractor: settings.extractor,
            smoother: MetricSmoother::new(settings.extractor.smoothing)?,
            classifier: StateClassifier::new(settings.classifier),
            monitor: PostureMonitor::new(settings.monitor),
            feedback: FeedbackPolicy::new(settings.feedback),
            actuator,
            stats: Default::default(),
            timing: Default::default(),
        })
    }

    pub(crate) fn profile(&self) -> &CalibrationProfile {
        &self.profile
    }

    pub(crate) fn stats(&self) -> SessionStats {
        self.stats
    }

    #[cfg(test)]
    pub(crate) fn actuator(&self) -> &A {
        &self.actuator
    }

    pub(crate) fn start(&mut self) {
        self.monitor.start();
        info!(
            message = "posture monitoring started",
            baseline = self.profile.baseline_ratio,
            threshold = self.profile.bad_posture_threshold(),
        );
    }

    /// Stop monitoring and drop any feedback that is still asserted.
    pub(crate) fn stop(&mut self) {
        self.monitor.stop();
        self.feedback.reset(&mut self.actuator);
        self.classifier.reset();
        self.smoother.reset();
        info!(
            message = "posture monitoring stopped",
            frames = self.stats.frames,
            rejected = self.stats.rejected,
            pulses = self.stats.pulses,
        );
    }

    /// Swap in a new profile. Takes effect from the next frame.
    pub(crate) fn replace_profile(&mut self, profile: CalibrationProfile) {
        info!(
            message = "calibration profile replaced",
            baseline = profile.baseline_ratio,
            sensitivity = profile.sensitivity,
        );
        self.profile = profile;
    }

    /// Rebase the current profile on a single frame of good posture.
    pub(crate) fn zero(&mut self, frame: &LandmarkFrame) -> Result<&CalibrationProfile, Error> {
        let sample = extract_posture(frame, &self.extractor)?;
        self.replace_profile(self.profile.zero(&sample)?);
        Ok(self.profile())
    }

    /// Run one frame through the pipeline; `None` means nobody is in view.
    pub(crate) fn process(&mut self, frame: Option<&LandmarkFrame>, now_ms: u64) -> FrameVerdict {
        let start = Instant::now();
        self.stats.frames += 1;

        let outcome = match frame {
            None => {
                self.stats.no_subject += 1;
                self.smoother.reset();
                FrameOutcome::NoSubject
            }
            Some(frame) => match extract_posture(frame, &self.extractor) {
                Ok(sample) => FrameOutcome::Sample(self.smoother.smooth(sample)),
                Err(e @ Error::DegenerateFrame { .. }) => {
                    debug!(message = "frame rejected", error = %e, now_ms);
                    self.stats.rejected += 1;
                    FrameOutcome::Rejected
                }
                Err(e) => {
                    warn!(message = "frame rejected", error = %e, now_ms);
                    self.stats.rejected += 1;
                    FrameOutcome::Rejected
                }
            },
        };

        let state = self.classifier.observe(&outcome, &self.profile);
        if state.is_bad() {
            self.stats.bad_frames += 1;
        }

        let monitor = self.monitor.observe(state, now_ms);
        let actuation = match monitor {
            MonitorVerdict::Penalize { elapsed } => {
                let actuation = self.feedback.trigger_penalty(now_ms, &mut self.actuator);
                if actuation.pulsed {
                    self.stats.pulses += 1;
                    info!(
                        message = "bad posture held too long",
                        %state,
                        ?elapsed,
                        visual = actuation.visual_enabled,
                    );
                }
                Some(actuation)
            }
            MonitorVerdict::Clear => {
                self.feedback.disable_penalty(&mut self.actuator);
                None
            }
            MonitorVerdict::Streak { .. } | MonitorVerdict::Inactive => None,
        };

        self.timing.processing += start.elapsed();

        FrameVerdict {
            sample: match outcome {
                FrameOutcome::Sample(sample) => Some(sample),
                FrameOutcome::NoSubject | FrameOutcome::Rejected => None,
            },
            state,
            monitor,
            actuation,
        }
    }

    /// Process frames from `frames` until the stream closes or `running` is
    /// cleared. `running` is checked at least every `poll`, also while no
    /// frames arrive.
    pub(crate) fn run<F>(
        &mut self,
        frames: &Receiver<TimedFrame>,
        running: &AtomicBool,
        poll: Duration,
        mut on_verdict: F,
    ) where
        F: FnMut(&TimedFrame, &FrameVerdict, SessionStats),
    {
        while running.load(Ordering::SeqCst) {
            let timed = match frames.recv_timeout(poll) {
                Ok(timed) => timed,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let verdict = self.process(timed.frame.as_ref(), timed.timestamp_ms);
            on_verdict(&timed, &verdict, self.stats);
        }
    }
}
