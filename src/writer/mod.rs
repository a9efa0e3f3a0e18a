//! Per-camera, per-chunk output writers.

mod color;
mod depth;
mod mp4;
mod npy;

pub use color::{ColorChunkWriter, ColorOutput};
pub use depth::{DepthChunkWriter, DepthOutput};
pub use mp4::MjpegMp4Writer;
pub use npy::write_depth_stack;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::path::PathBuf;

use crate::camera::{CameraId, CameraSlot, CapturedFrame, Dimensions};
use crate::sequencer::ChunkPaths;

/// What a writer hands back when it finalizes successfully.
#[derive(Debug, Clone)]
pub struct WriterOutput {
    pub camera_id: CameraId,
    pub color_path: PathBuf,
    pub color_size_bytes: u64,
    pub depth_path: Option<PathBuf>,
    pub depth_size_bytes: Option<u64>,
    pub frames_written: u64,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: f64,
}

/// The writer variant is fixed at creation by the camera's depth capability.
pub enum ChunkWriter {
    Color(ColorChunkWriter),
    ColorDepth(DepthChunkWriter),
}

impl ChunkWriter {
    /// Create and initialize the writer for `slot`'s next chunk.
    pub fn open(
        slot: &CameraSlot,
        paths: &ChunkPaths,
        dimensions: Dimensions,
        quality: u8,
    ) -> Result<Self> {
        let mut writer = if slot.has_depth {
            ChunkWriter::ColorDepth(DepthChunkWriter::new(
                slot.camera_id,
                paths.color.clone(),
                paths.depth.clone(),
                slot.native_fps,
                quality,
            ))
        } else {
            ChunkWriter::Color(ColorChunkWriter::new(
                slot.camera_id,
                paths.color.clone(),
                slot.native_fps,
                quality,
            ))
        };

        match &mut writer {
            ChunkWriter::Color(w) => w.initialize(dimensions)?,
            ChunkWriter::ColorDepth(w) => w.initialize(dimensions)?,
        }
        Ok(writer)
    }

    pub fn frames_written(&self) -> u64 {
        match self {
            ChunkWriter::Color(w) => w.frames_written(),
            ChunkWriter::ColorDepth(w) => w.color().frames_written(),
        }
    }

    pub fn is_writing(&self) -> bool {
        match self {
            ChunkWriter::Color(w) => w.is_writing(),
            ChunkWriter::ColorDepth(w) => w.color().is_writing(),
        }
    }

    /// Route one captured frame. Depth writers need the depth half too.
    pub fn write(&mut self, frame: &CapturedFrame) -> Result<()> {
        let image = frame
            .color
            .as_ref()
            .ok_or_else(|| anyhow!("frame carries no color image"))?;

        match self {
            ChunkWriter::Color(w) => w.write(image),
            ChunkWriter::ColorDepth(w) => {
                let depth = frame
                    .depth
                    .as_ref()
                    .ok_or_else(|| anyhow!("frame carries no depth buffer"))?;
                w.write(image, depth)
            }
        }
    }

    pub fn camera_id(&self) -> CameraId {
        match self {
            ChunkWriter::Color(w) => w.camera_id(),
            ChunkWriter::ColorDepth(w) => w.color().camera_id(),
        }
    }

    pub fn finalize(&mut self) -> Result<WriterOutput> {
        let camera_id = self.camera_id();
        Ok(match self {
            ChunkWriter::Color(w) => {
                let color = w.finalize()?;
                WriterOutput {
                    camera_id,
                    color_path: color.path,
                    color_size_bytes: color.size_bytes,
                    depth_path: None,
                    depth_size_bytes: None,
                    frames_written: color.frames_written,
                    started_at: color.started_at,
                    duration_seconds: color.duration_seconds,
                }
            }
            ChunkWriter::ColorDepth(w) => {
                let output = w.finalize()?;
                WriterOutput {
                    camera_id,
                    color_path: output.color.path,
                    color_size_bytes: output.color.size_bytes,
                    depth_path: Some(output.depth_path),
                    depth_size_bytes: Some(output.depth_size_bytes),
                    frames_written: output.color.frames_written,
                    started_at: output.color.started_at,
                    duration_seconds: output.color.duration_seconds,
                }
            }
        })
    }

    pub fn discard(&mut self) {
        match self {
            ChunkWriter::Color(w) => w.discard(),
            ChunkWriter::ColorDepth(w) => w.discard(),
        }
    }
}
