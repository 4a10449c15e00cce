use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use num_traits::ToPrimitive;
use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use structopt::StructOpt;
use tracing::{debug, info, trace, warn};
use tracing_subscriber::layer::SubscriberExt;

mod aggregate;
mod calibration;
mod classify;
mod engine;
mod error;
mod feedback;
mod landmark;
mod metrics;
mod report;
mod source;

use crate::{
    aggregate::{GaitRecorder, GaitSettings},
    calibration::{CalibrationCollector, CalibrationProfile, CalibrationTarget, ShrugPolicy},
    engine::{EngineSettings, PostureEngine},
    error::Error,
    feedback::LogActuator,
    metrics::{extract_gait, extract_posture, ExtractorSettings},
    report::SessionReport,
    source::{forward_frames, JsonLinesSource},
};

const DEFAULT_PROFILE: &str = "posture-profile.toml";
const STDIN: &str = "-";
const INTERRUPT_POLL: Duration = Duration::from_millis(100);

#[derive(structopt::StructOpt)]
struct Opt {
    #[structopt(short, long, default_value = "info", env = "RUST_LOG")]
    log_level: tracing_subscriber::filter::EnvFilter,

    #[structopt(short, long)]
    show_progress: bool,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(structopt::StructOpt)]
enum Command {
    /// Watch a landmark stream and alert on posture held badly for too long.
    Monitor(MonitorOpt),
    /// Build a calibration profile from recordings of each posture.
    Calibrate(CalibrateOpt),
    /// Rebase the calibration profile on the first usable frame of a recording.
    Zero(ZeroOpt),
    /// Analyse the running form of a recorded session.
    Gait(GaitOpt),
}

#[derive(structopt::StructOpt)]
struct MonitorOpt {
    /// Landmark stream in JSON Lines format, `-` for stdin.
    #[structopt(short, long, default_value = STDIN)]
    input: PathBuf,

    /// Calibration profile; defaults are used when it does not exist.
    #[structopt(short, long, default_value = DEFAULT_PROFILE)]
    profile: PathBuf,

    /// Override the sensitivity stored in the profile.
    #[structopt(long)]
    sensitivity: Option<f32>,

    #[structopt(short = "q", long, default_value = "1000")]
    input_queue_size: usize,

    #[structopt(flatten)]
    engine: EngineSettings,
}

#[derive(structopt::StructOpt)]
struct CalibrateOpt {
    /// Frames recorded while sitting upright.
    #[structopt(long)]
    good: PathBuf,

    /// Frames recorded while slouching.
    #[structopt(long)]
    slouch: PathBuf,

    /// Frames recorded with the head tilted to one side.
    #[structopt(long)]
    tilt: PathBuf,

    /// Frames recorded with raised shoulders.
    #[structopt(long)]
    shrug: PathBuf,

    /// mixed-units or ear-to-shoulder.
    #[structopt(long, default_value = "mixed-units")]
    shrug_policy: ShrugPolicy,

    /// Where to write the profile.
    #[structopt(short, long, default_value = DEFAULT_PROFILE)]
    profile: PathBuf,

    #[structopt(flatten)]
    extractor: ExtractorSettings,
}

#[derive(structopt::StructOpt)]
struct ZeroOpt {
    /// Landmark stream in JSON Lines format, `-` for stdin.
    #[structopt(short, long, default_value = STDIN)]
    input: PathBuf,

    #[structopt(short, long, default_value = DEFAULT_PROFILE)]
    profile: PathBuf,

    #[structopt(flatten)]
    extractor: ExtractorSettings,
}

#[derive(structopt::StructOpt)]
struct GaitOpt {
    /// Landmarks of a side-view running recording, `-` for stdin.
    #[structopt(short, long, default_value = STDIN)]
    input: PathBuf,

    /// Print the report as JSON.
    #[structopt(long)]
    json: bool,

    /// Write the report to a file instead of stdout.
    #[structopt(short, long)]
    report: Option<PathBuf>,

    #[structopt(flatten)]
    settings: GaitSettings,
}

fn open_input(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    if path == Path::new(STDIN) {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let file = File::open(path).with_context(|| format!("failed opening {}", path.display()))?;
    Ok(Box::new(BufReader::new(file)))
}

fn spinner(show_progress: bool) -> Option<ProgressBar> {
    if show_progress {
        Some(
            ProgressBar::new_spinner().with_style(
                ProgressStyle::default_spinner()
                    .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ")
                    .template("{prefix:.bold.dim} {spinner} {wide_msg}"),
            ),
        )
    } else {
        None
    }
}

fn monitor(opt: MonitorOpt, show_progress: bool) -> Result<()> {
    let mut profile = CalibrationProfile::load_or_default(&opt.profile);
    if let Some(sensitivity) = opt.sensitivity {
        profile = profile
            .with_sensitivity(sensitivity)
            .context("invalid sensitivity override")?;
    }

    let running = Arc::new(AtomicBool::new(true));
    let running_ctrl_c = running.clone();

    ctrlc::set_handler(move || {
        running_ctrl_c.store(false, Ordering::SeqCst);
    })
    .context("failed setting Ctrl-C handler")?;

    let mut engine =
        PostureEngine::new(profile, opt.engine, LogActuator).context("failed constructing engine")?;
    let input = open_input(&opt.input)?;
    let pb = spinner(show_progress);

    let (frames_tx, frames_rx) = crossbeam::channel::bounded(opt.input_queue_size);
    let running_read = running.clone();
    let session_start = Instant::now();

    // not scoped: a reader blocked on stdin must not hold up shutdown
    let reader = thread::Builder::new()
        .name("landmark-reader".to_string())
        .spawn(move || {
            let mut source = JsonLinesSource::new(input);
            forward_frames(&mut source, &frames_tx, &running_read)
        })
        .context("failed spawning landmark reader")?;

    engine.start();
    engine.run(&frames_rx, &running, INTERRUPT_POLL, |timed, verdict, stats| {
        trace!(
            timestamp_ms = timed.timestamp_ms,
            state = %verdict.state,
            ratio = ?verdict.sample.map(|sample| sample.forward_flexion_ratio),
            monitor = ?verdict.monitor,
            visual = ?verdict.actuation.map(|actuation| actuation.visual_enabled),
        );

        if let Some(pb) = pb.as_ref() {
            let ratio = verdict
                .sample
                .map(|sample| format!("{:.2}", sample.forward_flexion_ratio))
                .unwrap_or_else(|| "-".to_string());
            let fps = stats.frames.to_f64().unwrap_or_default()
                / session_start.elapsed().as_secs_f64();
            pb.set_message(format!(
                "{} | ratio: {} | frames: {} | fps: {:.1}",
                verdict.state, ratio, stats.frames, fps
            ));
            pb.inc(1);
        }
    });
    // unblock a reader waiting on a full queue
    drop(frames_rx);

    let read = if running.load(Ordering::SeqCst) {
        match reader.join() {
            Ok(read) => read
                .map(|sent| debug!(message = "landmark stream ended", frames = sent))
                .context("failed reading landmark stream"),
            Err(_) => Err(anyhow!("landmark reader panicked")),
        }
    } else {
        debug!(message = "interrupted, not waiting for the landmark reader");
        Ok(())
    };

    engine.stop();
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }

    let stats = engine.stats();
    info!(
        message = "session summary",
        frames = stats.frames,
        no_subject = stats.no_subject,
        rejected = stats.rejected,
        bad_frames = stats.bad_frames,
        pulses = stats.pulses,
        processing = ?engine.timing.processing,
    );
    read
}

fn calibrate(opt: CalibrateOpt) -> Result<()> {
    let mut collector = CalibrationCollector::new();

    for &target in CalibrationTarget::ALL.iter() {
        let path = match target {
            CalibrationTarget::Good => &opt.good,
            CalibrationTarget::Slouch => &opt.slouch,
            CalibrationTarget::Tilt => &opt.tilt,
            CalibrationTarget::Shrug => &opt.shrug,
        };

        for timed in JsonLinesSource::new(open_input(path)?) {
            let timed = timed.with_context(|| format!("failed reading {}", path.display()))?;
            let frame = match timed.frame {
                Some(frame) => frame,
                None => continue,
            };
            match extract_posture(&frame, &opt.extractor) {
                Ok(sample) => collector.collect_sample(target, sample),
                Err(e @ Error::DegenerateFrame { .. }) => {
                    debug!(message = "skipping calibration frame", posture = %target, error = %e)
                }
                Err(e) => return Err(e).context("failed extracting calibration sample"),
            }
        }
        info!(
            message = "collected calibration samples",
            posture = %target,
            count = collector.count(target),
        );
    }

    if !collector.is_complete() {
        warn!(message = "calibration recordings are too short");
    }
    let profile = collector
        .compute_thresholds(opt.shrug_policy)
        .context("failed computing calibration thresholds")?;
    profile
        .persist(&opt.profile)
        .context("failed saving calibration profile")?;

    info!(
        message = "calibration complete",
        baseline = profile.baseline_ratio,
        sensitivity = profile.sensitivity,
        slouch_threshold = profile.slouch_threshold,
        tilt_threshold = ?profile.tilt_threshold,
        shrug_threshold = ?profile.shrug_threshold,
    );
    Ok(())
}

fn zero(opt: ZeroOpt) -> Result<()> {
    let profile = CalibrationProfile::load_or_default(&opt.profile);
    let settings = EngineSettings {
        extractor: opt.extractor,
        ..Default::default()
    };
    let mut engine =
        PostureEngine::new(profile, settings, LogActuator).context("failed constructing engine")?;

    for timed in JsonLinesSource::new(open_input(&opt.input)?) {
        let timed = timed.context("failed reading landmark stream")?;
        let frame = match timed.frame {
            Some(frame) => frame,
            None => continue,
        };
        match engine.zero(&frame) {
            Ok(profile) => {
                profile
                    .persist(&opt.profile)
                    .context("failed saving calibration profile")?;
                info!(
                    message = "zeroed calibration profile",
                    timestamp_ms = timed.timestamp_ms,
                    baseline = profile.baseline_ratio,
                    threshold = profile.bad_posture_threshold(),
                );
                return Ok(());
            }
            Err(e @ Error::DegenerateFrame { .. }) => {
                debug!(message = "skipping frame", error = %e)
            }
            Err(e) => return Err(e).context("failed zeroing calibration profile"),
        }
    }

    Err(anyhow!("no usable frame in {}", opt.input.display()))
}

fn gait(opt: GaitOpt, show_progress: bool) -> Result<()> {
    let mut recorder = GaitRecorder::new(opt.settings).context("failed constructing recorder")?;
    let pb = spinner(show_progress);

    recorder.start();
    for timed in JsonLinesSource::new(open_input(&opt.input)?) {
        let timed = timed.context("failed reading landmark stream")?;
        let sample = match timed.frame {
            Some(frame) => match extract_gait(&frame, opt.settings.aspect_ratio) {
                Ok(sample) => Some(sample),
                Err(e) => {
                    warn!(
                        message = "dropping gait frame",
                        timestamp_ms = timed.timestamp_ms,
                        error = %e,
                    );
                    None
                }
            },
            None => None,
        };
        recorder.record(sample)?;

        if let Some(pb) = pb.as_ref() {
            pb.inc(1);
        }
    }
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }

    let report = SessionReport::new(recorder.stop()?);
    let rendered = if opt.json {
        serde_json::to_string_pretty(&report).context("failed serializing report")?
    } else {
        report.to_string()
    };

    match opt.report {
        Some(path) => std::fs::write(&path, rendered)
            .with_context(|| format!("failed writing report to {}", path.display()))?,
        None => println!("{}", rendered),
    }
    Ok(())
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    tracing::subscriber::set_global_default(
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .with(opt.log_level),
    )?;

    match opt.command {
        Command::Monitor(monitor_opt) => monitor(monitor_opt, opt.show_progress),
        Command::Calibrate(calibrate_opt) => calibrate(calibrate_opt),
        Command::Zero(zero_opt) => zero(zero_opt),
        Command::Gait(gait_opt) => gait(gait_opt, opt.show_progress),
    }
}
