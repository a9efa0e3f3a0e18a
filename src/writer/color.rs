use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use image::RgbImage;
use log::debug;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Instant,
};

use super::mp4::MjpegMp4Writer;
use crate::camera::{CameraId, Dimensions};

enum WriterState {
    Uninitialized,
    Writing(MjpegMp4Writer),
    Finalized,
}

/// Output of a finalized color stream.
#[derive(Debug, Clone)]
pub struct ColorOutput {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub frames_written: u64,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: f64,
}

/// Owns one open color video stream for one camera for one chunk.
pub struct ColorChunkWriter {
    camera_id: CameraId,
    path: PathBuf,
    fps: u32,
    quality: u8,
    state: WriterState,
    frames_written: u64,
    started: Option<(Instant, DateTime<Utc>)>,
}

impl ColorChunkWriter {
    pub fn new(camera_id: CameraId, path: PathBuf, fps: u32, quality: u8) -> Self {
        Self {
            camera_id,
            path,
            fps,
            quality,
            state: WriterState::Uninitialized,
            frames_written: 0,
            started: None,
        }
    }

    /// Open the output stream. The chunk's clock starts here.
    pub fn initialize(&mut self, dimensions: Dimensions) -> Result<()> {
        if !matches!(self.state, WriterState::Uninitialized) {
            bail!("writer for camera {} was already initialized", self.camera_id);
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let stream = MjpegMp4Writer::create(&self.path, dimensions, self.fps, self.quality)?;
        self.state = WriterState::Writing(stream);
        self.started = Some((Instant::now(), Utc::now()));
        debug!(
            "camera {} writer opened {} ({}x{} @ {} fps)",
            self.camera_id,
            self.path.display(),
            dimensions.width,
            dimensions.height,
            self.fps
        );
        Ok(())
    }

    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    pub fn is_writing(&self) -> bool {
        matches!(self.state, WriterState::Writing(_))
    }

    pub fn dimensions(&self) -> Option<Dimensions> {
        match &self.state {
            WriterState::Writing(stream) => Some(stream.dimensions()),
            _ => None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn write(&mut self, image: &RgbImage) -> Result<()> {
        let WriterState::Writing(stream) = &mut self.state else {
            bail!("camera {} writer is not accepting frames", self.camera_id);
        };
        stream.write_frame(image)?;
        self.frames_written += 1;
        Ok(())
    }

    /// Close the stream. A missing or unreadable file afterwards is an error
    /// and the chunk must be dropped.
    pub fn finalize(&mut self) -> Result<ColorOutput> {
        let state = std::mem::replace(&mut self.state, WriterState::Finalized);
        let WriterState::Writing(stream) = state else {
            bail!("camera {} writer has no open stream to finalize", self.camera_id);
        };
        let (started, started_at) = self
            .started
            .ok_or_else(|| anyhow!("camera {} writer has no start time", self.camera_id))?;

        stream.finish()?;
        let duration_seconds = started.elapsed().as_secs_f64();

        let size_bytes = fs::metadata(&self.path)
            .with_context(|| format!("video file {} missing after close", self.path.display()))?
            .len();

        Ok(ColorOutput {
            path: self.path.clone(),
            size_bytes,
            frames_written: self.frames_written,
            started_at,
            duration_seconds,
        })
    }

    /// Close without producing output and delete whatever was written.
    pub fn discard(&mut self) {
        self.state = WriterState::Finalized;
        remove_if_present(&self.path);
    }
}

pub(super) fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("removed {}", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => log::warn!("failed to remove {}: {err}", path.display()),
    }
}
