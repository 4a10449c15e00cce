use crate::error::Error;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_COOLDOWN_MS: &str = "5000";

/// Vibration pattern: alternating on/off durations in milliseconds.
pub(crate) const PENALTY_PATTERN: [u64; 3] = [200, 100, 200];

/// Something that can nudge the user. How it does so is up to the implementor.
pub(crate) trait FeedbackActuator {
    fn vibrate(&mut self, pattern: &[u64]) -> Result<(), Error>;

    fn set_visual_penalty(&mut self, enabled: bool) -> Result<(), Error>;
}

/// Actuator that only reports what it would have done.
#[derive(Debug, Default)]
pub(crate) struct LogActuator;

impl FeedbackActuator for LogActuator {
    fn vibrate(&mut self, pattern: &[u64]) -> Result<(), Error> {
        warn!(message = "posture alert", ?pattern);
        Ok(())
    }

    fn set_visual_penalty(&mut self, enabled: bool) -> Result<(), Error> {
        info!(message = "visual penalty", enabled);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, structopt::StructOpt)]
pub(crate) struct FeedbackSettings {
    /// Minimum time between two alert pulses.
    #[structopt(long, default_value = DEFAULT_COOLDOWN_MS)]
    pub(crate) cooldown_ms: u64,
}

impl Default for FeedbackSettings {
    fn default() -> Self {
        Self {
            cooldown_ms: DEFAULT_COOLDOWN_MS.parse().unwrap(),
        }
    }
}

/// What a call to [`FeedbackPolicy::trigger_penalty`] actually did.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub(crate) struct Actuation {
    pub(crate) pulsed: bool,
    pub(crate) visual_enabled: bool,
}

/// Decides when to pulse the actuator and when to hold or drop the visual
/// penalty.
///
/// The visual penalty is a level: it stays on for as long as the bad state
/// lasts. The pulse is an edge, rate limited by the cooldown.
#[derive(Debug, Clone)]
pub(crate) struct FeedbackPolicy {
    cooldown: Duration,
    last_pulse_ms: Option<u64>,
    visual_active: bool,
}

impl FeedbackPolicy {
    pub(crate) fn new(settings: FeedbackSettings) -> Self {
        Self {
            cooldown: Duration::from_millis(settings.cooldown_ms),
            last_pulse_ms: None,
            visual_active: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn visual_active(&self) -> bool {
        self.visual_active
    }

    pub(crate) fn trigger_penalty<A>(&mut self, now_ms: u64, actuator: &mut A) -> Actuation
    where
        A: FeedbackActuator + ?Sized,
    {
        let mut actuation = Actuation::default();

        if !self.visual_active {
            match actuator.set_visual_penalty(true) {
                Ok(()) => actuation.visual_enabled = true,
                Err(e) => warn!(message = "failed to enable visual penalty", error = %e),
            }
            // stays asserted on failure; retried after the next disable
            self.visual_active = true;
        }

        let cooled_down = self.last_pulse_ms.map_or(true, |last| {
            Duration::from_millis(now_ms.saturating_sub(last)) >= self.cooldown
        });
        if cooled_down {
            if let Err(e) = actuator.vibrate(&PENALTY_PATTERN) {
                warn!(message = "failed to pulse feedback actuator", error = %e);
            }
            self.last_pulse_ms = Some(now_ms);
            actuation.pulsed = true;
        } else {
            debug!(message = "alert suppressed by cooldown", now_ms);
        }

        actuation
    }

    /// Clear the visual penalty. The pulse cooldown is left alone.
    pub(crate) fn disable_penalty<A>(&mut self, actuator: &mut A)
    where
        A: FeedbackActuator + ?Sized,
    {
        if self.visual_active {
            if let Err(e) = actuator.set_visual_penalty(false) {
                warn!(message = "failed to clear visual penalty", error = %e);
            }
            self.visual_active = false;
        }
    }

    pub(crate) fn reset<A>(&mut self, actuator: &mut A)
    where
        A: FeedbackActuator + ?Sized,
    {
        self.disable_penalty(actuator);
        self.last_pulse_ms = None;
    }
}
