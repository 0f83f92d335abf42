use std::{
    fs::{self, File},
    io::{self, BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use serde::{Deserialize, Serialize};

use crate::{Frame, MotionAlarmError, Result};

/// Configuration options for clip recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingSettings {
    pub clips_dir: PathBuf,
    pub fps: u32,
    /// File extension of generated clips, without the dot.
    pub extension: String,
    /// FourCC handed to the sink.
    pub codec: String,
    pub jpeg_quality: u8,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            clips_dir: PathBuf::from("clips"),
            fps: 15,
            extension: "mjpeg".to_string(),
            codec: "MJPG".to_string(),
            jpeg_quality: 85,
        }
    }
}

/// Stream parameters a sink is opened with.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipFormat {
    pub codec: String,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

/// Append-only video sink.
pub trait ClipSink {
    fn open(&mut self, path: &Path, format: &ClipFormat) -> Result<()>;
    fn write(&mut self, frame: &Frame) -> Result<()>;
    fn release(&mut self) -> Result<()>;
}

/// Sink producing a raw motion-JPEG file: one baseline JPEG per frame,
/// back to back. Plays with ffplay/VLC and can be read back by
/// [`MjpegSource`](crate::MjpegSource).
#[derive(Debug)]
pub struct MjpegClipSink {
    quality: u8,
    writer: Option<BufWriter<File>>,
    format: Option<ClipFormat>,
}

impl MjpegClipSink {
    pub fn new(quality: u8) -> Self {
        Self {
            quality,
            writer: None,
            format: None,
        }
    }
}

impl ClipSink for MjpegClipSink {
    fn open(&mut self, path: &Path, format: &ClipFormat) -> Result<()> {
        self.release()?;
        let file = File::create(path)?;
        self.writer = Some(BufWriter::new(file));
        self.format = Some(format.clone());
        Ok(())
    }

    fn write(&mut self, frame: &Frame) -> Result<()> {
        let (Some(writer), Some(format)) = (self.writer.as_mut(), self.format.as_ref()) else {
            return Err(MotionAlarmError::msg("clip sink is not open"));
        };
        if frame.dimensions() != (format.width, format.height) {
            return Err(MotionAlarmError::DimensionMismatch {
                expected: (format.width, format.height),
                actual: frame.dimensions(),
            });
        }

        JpegEncoder::new_with_quality(writer, self.quality).encode_image(frame.image())?;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.format = None;
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// One motion episode being written to disk.
#[derive(Debug, Clone)]
pub struct RecordingSession {
    pub name: String,
    pub path: PathBuf,
    pub started_at: DateTime<Local>,
    pub frames_written: u64,
}

/// Opens and closes clip files in step with motion episodes.
pub struct ClipRecorder {
    settings: RecordingSettings,
    sink: Box<dyn ClipSink + Send>,
    session: Option<RecordingSession>,
    clips_started: u64,
}

impl ClipRecorder {
    pub fn new(settings: RecordingSettings, sink: Box<dyn ClipSink + Send>) -> Self {
        Self {
            settings,
            sink,
            session: None,
            clips_started: 0,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    pub fn current_clip(&self) -> Option<&RecordingSession> {
        self.session.as_ref()
    }

    pub fn clips_started(&self) -> u64 {
        self.clips_started
    }

    /// Opens a new clip and writes `frame` as its first frame. Does nothing
    /// when a clip is already open. Returns whether a session became active.
    pub fn start(&mut self, frame: &Frame) -> bool {
        if self.session.is_some() {
            return false;
        }

        let started_at = Local::now();
        let name = self.unused_name(&started_at);
        let path = self.settings.clips_dir.join(&name);
        let format = ClipFormat {
            codec: self.settings.codec.clone(),
            fps: f64::from(self.settings.fps),
            width: frame.width(),
            height: frame.height(),
        };

        if let Err(err) = self.sink.open(&path, &format) {
            tracing::error!(path = %path.display(), error = %err, "[REC] failed to open clip writer");
            // Drop whatever the sink managed to set up.
            let _ = self.sink.release();
            return false;
        }

        tracing::info!(clip = %name, "[REC] started clip");
        self.clips_started += 1;
        self.session = Some(RecordingSession {
            name,
            path,
            started_at,
            frames_written: 0,
        });
        self.write_frame(frame);
        true
    }

    /// Appends `frame` to the open clip, if any. Write failures only cost
    /// this frame.
    pub fn write_frame(&mut self, frame: &Frame) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match self.sink.write(frame) {
            Ok(()) => session.frames_written += 1,
            Err(err) => {
                tracing::warn!(clip = %session.name, error = %err, "[REC] dropped frame");
            }
        }
    }

    /// Closes the open clip and returns its session. No-op without one.
    pub fn stop(&mut self) -> Option<RecordingSession> {
        let session = self.session.take()?;
        if let Err(err) = self.sink.release() {
            tracing::warn!(clip = %session.name, error = %err, "[REC] error while closing clip");
        }
        tracing::info!(
            clip = %session.name,
            frames = session.frames_written,
            "[REC] stopped clip"
        );
        Some(session)
    }

    /// Two episodes starting in the same second must not share a file.
    fn unused_name(&self, at: &DateTime<Local>) -> String {
        let base = clip_name(at, &self.settings.extension);
        if !self.settings.clips_dir.join(&base).exists() {
            return base;
        }

        let stem = at.format("clip_%Y%m%d_%H%M%S");
        (1..)
            .map(|n| format!("{stem}_{n}.{}", self.settings.extension))
            .find(|candidate| !self.settings.clips_dir.join(candidate).exists())
            .unwrap_or(base)
    }
}

impl std::fmt::Debug for ClipRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipRecorder")
            .field("settings", &self.settings)
            .field("session", &self.session)
            .field("clips_started", &self.clips_started)
            .finish()
    }
}

/// `clip_<YYYYMMDD>_<HHMMSS>.<ext>`
pub fn clip_name(at: &DateTime<Local>, extension: &str) -> String {
    format!("{}.{extension}", at.format("clip_%Y%m%d_%H%M%S"))
}

/// Makes sure `path` is a directory, creating it (mode 0755) when missing.
pub fn ensure_clips_dir(path: &Path) -> Result<()> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(MotionAlarmError::ClipsDirectory {
            path: path.to_path_buf(),
            reason: "exists but is not a directory".to_string(),
        }),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            create_dir(path).map_err(|err| MotionAlarmError::ClipsDirectory {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
            tracing::info!(path = %path.display(), "[REC] created clips directory");
            Ok(())
        }
        Err(err) => Err(MotionAlarmError::ClipsDirectory {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }),
    }
}

fn create_dir(path: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder.create(path)
}
