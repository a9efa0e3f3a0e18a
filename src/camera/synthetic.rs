use anyhow::{bail, Result};
use chrono::Utc;
use image::{Rgb, RgbImage};
use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};

use super::{CameraId, CameraSource, CapturedFrame, DepthBuffer, Dimensions};

const PALETTE: [[u8; 3]; 5] = [
    [255, 0, 0],
    [0, 255, 0],
    [0, 0, 255],
    [255, 255, 0],
    [255, 0, 255],
];

/// Software camera producing solid-color frames, for running the engine
/// without hardware. Frames are only delivered while in recording mode.
pub struct SyntheticCamera {
    camera_id: CameraId,
    dimensions: Dimensions,
    fps: u32,
    with_depth: bool,
    latency: Duration,
    /// Every n-th fetch fails; 0 disables.
    drop_every: u64,
    initialized: AtomicBool,
    recording: AtomicBool,
    blackout: AtomicBool,
    /// Fetch number that panics once; 0 disables.
    panic_at: AtomicU64,
    fetches: AtomicU64,
}

impl SyntheticCamera {
    pub fn new(camera_id: CameraId, width: u32, height: u32, fps: u32) -> Self {
        Self {
            camera_id,
            dimensions: Dimensions::new(width, height),
            fps,
            with_depth: false,
            latency: Duration::ZERO,
            drop_every: 0,
            initialized: AtomicBool::new(true),
            recording: AtomicBool::new(false),
            blackout: AtomicBool::new(false),
            panic_at: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
        }
    }

    pub fn with_depth(mut self) -> Self {
        self.with_depth = true;
        self
    }

    /// Simulated blocking time of each fetch.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_drop_every(mut self, n: u64) -> Self {
        self.drop_every = n;
        self
    }

    /// While blacked out every fetch fails, as with an unplugged sensor.
    pub fn set_blackout(&self, blackout: bool) {
        self.blackout.store(blackout, Ordering::SeqCst);
    }

    pub fn set_initialized(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::SeqCst);
    }

    /// Make the n-th fetch from now panic, once.
    pub fn panic_on_fetch(&self, after: u64) {
        let target = self.fetches.load(Ordering::SeqCst) + after.max(1);
        self.panic_at.store(target, Ordering::SeqCst);
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    fn color_frame(&self, index: u64) -> RgbImage {
        let base = PALETTE[self.camera_id as usize % PALETTE.len()];
        let shade = (index % 64) as u8;
        let pixel = Rgb([
            base[0].saturating_sub(shade),
            base[1].saturating_sub(shade),
            base[2].saturating_sub(shade),
        ]);
        RgbImage::from_pixel(self.dimensions.width, self.dimensions.height, pixel)
    }

    fn depth_frame(&self, index: u64) -> DepthBuffer {
        let Dimensions { width, height } = self.dimensions;
        let data = (0..height)
            .flat_map(|y| (0..width).map(move |x| (x + y) as u64))
            .map(|ramp| (500 + (ramp + index) % 4000) as u16)
            .collect();
        DepthBuffer {
            dimensions: self.dimensions,
            data,
        }
    }
}

impl CameraSource for SyntheticCamera {
    fn try_get_frame(&self) -> Result<CapturedFrame> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        let index = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;

        let panic_at = self.panic_at.load(Ordering::SeqCst);
        if panic_at != 0 && index >= panic_at {
            self.panic_at.store(0, Ordering::SeqCst);
            panic!("synthetic camera {} crashed on fetch {index}", self.camera_id);
        }

        if !self.is_recording() {
            bail!("camera {} is not in recording mode", self.camera_id);
        }
        if self.blackout.load(Ordering::SeqCst) {
            bail!("camera {} returned no frame", self.camera_id);
        }
        if self.drop_every != 0 && index % self.drop_every == 0 {
            bail!("camera {} dropped frame {index}", self.camera_id);
        }

        Ok(CapturedFrame {
            color: Some(self.color_frame(index)),
            depth: self.with_depth.then(|| self.depth_frame(index)),
            timestamp: Utc::now(),
        })
    }

    fn try_get_depth_frame(&self) -> Option<DepthBuffer> {
        if self.with_depth && self.is_recording() && !self.blackout.load(Ordering::SeqCst) {
            Some(self.depth_frame(self.fetches.load(Ordering::SeqCst)))
        } else {
            None
        }
    }

    fn native_fps(&self) -> u32 {
        self.fps
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn start_recording(&self) {
        self.recording.store(true, Ordering::SeqCst);
    }

    fn stop_recording(&self) {
        self.recording.store(false, Ordering::SeqCst);
    }
}
