use anyhow::{bail, ensure, Context, Result};
use image::RgbImage;
use std::{
    fs,
    path::{Path, PathBuf},
};

use super::{
    color::{remove_if_present, ColorChunkWriter, ColorOutput},
    npy::write_depth_stack,
};
use crate::camera::{CameraId, DepthBuffer, Dimensions};

/// Color stream plus an in-memory depth stack serialized at finalize.
pub struct DepthChunkWriter {
    camera_id: CameraId,
    color: ColorChunkWriter,
    depth_path: PathBuf,
    depth_dimensions: Option<Dimensions>,
    depth_frames: Vec<DepthBuffer>,
}

/// Output of a finalized color+depth pair.
#[derive(Debug, Clone)]
pub struct DepthOutput {
    pub color: ColorOutput,
    pub depth_path: PathBuf,
    pub depth_size_bytes: u64,
}

impl DepthChunkWriter {
    pub fn new(
        camera_id: CameraId,
        color_path: PathBuf,
        depth_path: PathBuf,
        fps: u32,
        quality: u8,
    ) -> Self {
        Self {
            camera_id,
            color: ColorChunkWriter::new(camera_id, color_path, fps, quality),
            depth_path,
            depth_dimensions: None,
            depth_frames: Vec::new(),
        }
    }

    pub fn initialize(&mut self, dimensions: Dimensions) -> Result<()> {
        self.color.initialize(dimensions)
    }

    pub fn color(&self) -> &ColorChunkWriter {
        &self.color
    }

    pub fn depth_path(&self) -> &Path {
        &self.depth_path
    }

    /// Write a color+depth pair. Either both halves are recorded or neither.
    pub fn write(&mut self, image: &RgbImage, depth: &DepthBuffer) -> Result<()> {
        if !self.color.is_writing() {
            bail!("camera {} writer is not accepting frames", self.camera_id);
        }
        if let Some(expected) = self.depth_dimensions {
            ensure!(
                depth.dimensions == expected,
                "camera {} depth frame is {}x{}, chunk started at {}x{}",
                self.camera_id,
                depth.dimensions.width,
                depth.dimensions.height,
                expected.width,
                expected.height
            );
        }

        self.color.write(image)?;
        self.depth_dimensions.get_or_insert(depth.dimensions);
        self.depth_frames.push(depth.clone());
        Ok(())
    }

    /// Both artifacts must exist afterwards, otherwise both are removed and
    /// the chunk is dropped.
    pub fn finalize(&mut self) -> Result<DepthOutput> {
        let color_dimensions = self.color.dimensions();
        let color = match self.color.finalize() {
            Ok(color) => color,
            Err(err) => {
                self.depth_frames.clear();
                remove_if_present(&self.depth_path);
                return Err(err);
            }
        };

        let dimensions = self
            .depth_dimensions
            .or(color_dimensions)
            .unwrap_or(Dimensions::new(0, 0));
        let frames = std::mem::take(&mut self.depth_frames);

        let depth_size_bytes = write_depth_stack(&self.depth_path, dimensions, &frames)
            .and_then(|_| {
                fs::metadata(&self.depth_path)
                    .map(|meta| meta.len())
                    .with_context(|| {
                        format!("depth file {} missing after close", self.depth_path.display())
                    })
            });

        match depth_size_bytes {
            Ok(depth_size_bytes) => Ok(DepthOutput {
                color,
                depth_path: self.depth_path.clone(),
                depth_size_bytes,
            }),
            Err(err) => {
                remove_if_present(&color.path);
                remove_if_present(&self.depth_path);
                Err(err)
            }
        }
    }

    pub fn discard(&mut self) {
        self.color.discard();
        self.depth_frames.clear();
        remove_if_present(&self.depth_path);
    }
}
