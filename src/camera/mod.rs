//! Camera collaborator seam.
//!
//! The hardware binding lives outside this crate; the engine only sees
//! [`CameraSource`] handles registered in a [`CameraRegistry`] and never
//! manages the camera connection itself.

mod synthetic;

pub use synthetic::SyntheticCamera;

use anyhow::{ensure, Result};
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, RwLock},
};

pub type CameraId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn of(image: &RgbImage) -> Self {
        Self::new(image.width(), image.height())
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// One depth map in millimetres, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthBuffer {
    pub dimensions: Dimensions,
    pub data: Vec<u16>,
}

impl DepthBuffer {
    pub fn new(dimensions: Dimensions, data: Vec<u16>) -> Result<Self> {
        ensure!(
            data.len() == dimensions.pixel_count(),
            "depth buffer holds {} values, expected {}x{}",
            data.len(),
            dimensions.width,
            dimensions.height
        );
        Ok(Self { dimensions, data })
    }
}

/// Result of one blocking capture attempt.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub color: Option<RgbImage>,
    pub depth: Option<DepthBuffer>,
    pub timestamp: DateTime<Utc>,
}

/// Per-camera capture handle provided by the hardware collaborator.
///
/// `try_get_frame` may block up to the device timeout. Errors are treated as
/// transient: the camera simply contributes nothing to that tick.
pub trait CameraSource: Send + Sync {
    fn try_get_frame(&self) -> Result<CapturedFrame>;

    /// Depth-only fetch used when a color frame arrived without its depth pair.
    fn try_get_depth_frame(&self) -> Option<DepthBuffer> {
        None
    }

    fn native_fps(&self) -> u32;

    fn is_initialized(&self) -> bool;

    fn start_recording(&self) {}

    fn stop_recording(&self) {}
}

/// A camera as seen by the engine. Read-only from the engine's perspective.
#[derive(Clone)]
pub struct CameraSlot {
    pub camera_id: CameraId,
    pub native_fps: u32,
    /// Declared output size; when absent the engine probes the first frame.
    pub frame_dimensions: Option<Dimensions>,
    pub has_depth: bool,
    pub source: Arc<dyn CameraSource>,
}

impl std::fmt::Debug for CameraSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraSlot")
            .field("camera_id", &self.camera_id)
            .field("native_fps", &self.native_fps)
            .field("frame_dimensions", &self.frame_dimensions)
            .field("has_depth", &self.has_depth)
            .finish()
    }
}

/// Cameras currently initialized by the camera collaborator.
#[derive(Clone)]
pub struct CameraRegistry {
    slots: Arc<RwLock<BTreeMap<CameraId, CameraSlot>>>,
    depth_capable: Arc<BTreeSet<CameraId>>,
}

impl CameraRegistry {
    pub fn new(depth_capable: BTreeSet<CameraId>) -> Self {
        Self {
            slots: Arc::new(RwLock::new(BTreeMap::new())),
            depth_capable: Arc::new(depth_capable),
        }
    }

    /// Register an initialized camera. Depth capability comes from the fixed
    /// depth-capable id set, not from the source itself.
    pub fn initialize_camera(
        &self,
        camera_id: CameraId,
        source: Arc<dyn CameraSource>,
        frame_dimensions: Option<Dimensions>,
    ) -> CameraSlot {
        let slot = CameraSlot {
            camera_id,
            native_fps: source.native_fps().max(1),
            frame_dimensions,
            has_depth: self.depth_capable.contains(&camera_id),
            source,
        };

        let mut guard = match self.slots.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.insert(camera_id, slot.clone());
        slot
    }

    pub fn remove_camera(&self, camera_id: CameraId) -> Option<CameraSlot> {
        let mut guard = match self.slots.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.remove(&camera_id)
    }

    /// Slots whose source reports itself initialized, ordered by camera id.
    pub fn active_slots(&self) -> Vec<CameraSlot> {
        let guard = match self.slots.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .values()
            .filter(|slot| slot.source.is_initialized())
            .cloned()
            .collect()
    }

    pub fn camera_ids(&self) -> Vec<CameraId> {
        let guard = match self.slots.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.camera_ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
