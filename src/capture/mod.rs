mod controller;
mod drain;
mod loop_worker;
mod rotation;

pub use controller::CaptureLoop;
pub(crate) use drain::drain_and_finalize;
pub(crate) use rotation::discard_writers;

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::camera::CameraRegistry;
use crate::recording::RecorderState;
use crate::settings::RecorderSettings;
use crate::upload::UploadDispatcher;

/// Handles the capture loop and the controller both work through.
pub struct CaptureContext {
    pub state: Arc<Mutex<RecorderState>>,
    pub registry: CameraRegistry,
    pub dispatcher: UploadDispatcher,
    pub settings: RecorderSettings,
}
