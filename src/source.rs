use crate::{
    error::Error,
    landmark::{Landmark, LandmarkFrame},
};
use crossbeam::channel::Sender;
use serde::Deserialize;
use std::{
    convert::TryFrom,
    io::BufRead,
    sync::atomic::{AtomicBool, Ordering},
};
use tracing::warn;

/// One line of a landmark stream as written by the pose model process.
#[derive(Debug, Deserialize)]
struct RawFrame {
    timestamp_ms: u64,
    #[serde(default)]
    landmarks: Option<Vec<Landmark>>,
}

/// A frame paired with the time it was captured.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct TimedFrame {
    pub(crate) timestamp_ms: u64,
    /// `None` when the model found nobody in the picture.
    pub(crate) frame: Option<LandmarkFrame>,
}

pub(crate) trait LandmarkSource {
    /// Return the next frame, or `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<TimedFrame>, Error>;
}

/// Reads newline delimited JSON frames. Blank lines are skipped.
pub(crate) struct JsonLinesSource<R> {
    reader: R,
    line: String,
    line_number: usize,
}

impl<R> JsonLinesSource<R>
where
    R: BufRead,
{
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            line_number: 0,
        }
    }
}

impl<R> LandmarkSource for JsonLinesSource<R>
where
    R: BufRead,
{
    fn next_frame(&mut self) -> Result<Option<TimedFrame>, Error> {
        loop {
            self.line.clear();
            self.line_number += 1;
            let read = self
                .reader
                .read_line(&mut self.line)
                .map_err(|e| Error::ReadFrame(e, self.line_number))?;
            if read == 0 {
                return Ok(None);
            }
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let raw: RawFrame = serde_json::from_str(trimmed)
                .map_err(|e| Error::ParseFrame(e, self.line_number))?;
            let frame = raw.landmarks.map(LandmarkFrame::try_from).transpose()?;
            return Ok(Some(TimedFrame {
                timestamp_ms: raw.timestamp_ms,
                frame,
            }));
        }
    }
}

impl<R> Iterator for JsonLinesSource<R>
where
    R: BufRead,
{
    type Item = Result<TimedFrame, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}

/// Send frames from `source` down `frames` until the source is exhausted,
/// the receiver goes away or `running` is cleared.
///
/// Malformed lines are logged and skipped; only a failing reader ends the
/// stream early. Returns the number of frames sent.
pub(crate) fn forward_frames<S>(
    source: &mut S,
    frames: &Sender<TimedFrame>,
    running: &AtomicBool,
) -> Result<usize, Error>
where
    S: LandmarkSource,
{
    let mut sent = 0;
    while running.load(Ordering::SeqCst) {
        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e @ Error::ParseFrame(..)) | Err(e @ Error::LandmarkCount(..)) => {
                warn!(message = "skipping landmark frame", error = %e);
                continue;
            }
            Err(e) => return Err(e),
        };
        if frames.send(frame).is_err() {
            break;
        }
        sent += 1;
    }
    Ok(sent)
}
