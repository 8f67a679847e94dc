//! JSON-lines recording replay.
//!
//! A recording holds one record per line, tagged by `type`:
//!
//! ```text
//! {"type":"imu","w":1.0,"x":0.0,"y":0.0,"z":0.0}
//! {"type":"frame","frame_id":"velodyne","points":[{"x":5.0,"y":0.0,"z":2.0,"intensity":12.0}]}
//! ```
//!
//! `intensity` is optional.  Blank lines are ignored; lines that fail to
//! parse are logged, counted and skipped so that one corrupt record does not
//! end the replay.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use lidarfx_types::{PerceptionError, Point, PointCloud, Quaternion};
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tracing::{debug, warn};

use crate::adapter::{FrameSource, SensorMessage};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Record {
    Frame { frame_id: String, points: Vec<Point> },
    Imu { w: f64, x: f64, y: f64, z: f64 },
}

impl From<Record> for SensorMessage {
    fn from(record: Record) -> Self {
        match record {
            Record::Frame { frame_id, points } => {
                SensorMessage::Frame(PointCloud::new(frame_id, points))
            }
            Record::Imu { w, x, y, z } => SensorMessage::Orientation(Quaternion::new(w, x, y, z)),
        }
    }
}

/// Parse one recording line.
pub fn parse_line(line: &str) -> Result<SensorMessage, PerceptionError> {
    serde_json::from_str::<Record>(line)
        .map(SensorMessage::from)
        .map_err(|e| PerceptionError::Parsing(format!("invalid recording line: {e}")))
}

type LineReader = Lines<BufReader<File>>;

/// Streams the messages of a recording file.  Single-use, like
/// [`ChannelSource`][crate::adapter::ChannelSource].
pub struct ReplaySource {
    path: PathBuf,
    lines: Mutex<Option<LineReader>>,
    skipped: Arc<AtomicUsize>,
}

impl ReplaySource {
    /// Open `path` for replay.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PerceptionError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .await
            .map_err(|e| PerceptionError::Io(format!("cannot open {}: {e}", path.display())))?;
        Ok(Self {
            path,
            lines: Mutex::new(Some(BufReader::new(file).lines())),
            skipped: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines skipped so far because they could not be read or parsed.
    pub fn skipped_lines(&self) -> usize {
        self.skipped.load(Ordering::Relaxed)
    }
}

struct ReplayState {
    lines: LineReader,
    line_no: usize,
    skipped: Arc<AtomicUsize>,
}

impl ReplayState {
    async fn next_message(mut self) -> Option<(SensorMessage, Self)> {
        loop {
            self.line_no += 1;
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    warn!(line = self.line_no, error = %e, "recording read failed, stopping replay");
                    self.skipped.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(&line) {
                Ok(msg) => return Some((msg, self)),
                Err(e) => {
                    warn!(line = self.line_no, error = %e, "skipping malformed recording line");
                    self.skipped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

#[async_trait]
impl FrameSource for ReplaySource {
    async fn sensor_stream(&self) -> BoxStream<'static, SensorMessage> {
        let taken = self
            .lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(lines) = taken else {
            debug!(path = %self.path.display(), "replay stream already taken");
            return Box::pin(stream::empty());
        };
        let state = ReplayState {
            lines,
            line_no: 0,
            skipped: Arc::clone(&self.skipped),
        };
        Box::pin(stream::unfold(state, ReplayState::next_message))
    }
}
