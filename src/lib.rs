//! Chunked multi-camera recording engine.
//!
//! A [`SessionController`] polls every registered [`CameraSource`] on one
//! background capture loop, cuts each camera's stream into fixed-duration
//! chunks on disk and hands every finalized [`Chunk`] to a [`ChunkUploader`].

pub mod camera;
pub mod capture;
pub mod error;
pub mod models;
pub mod recording;
pub mod sequencer;
pub mod settings;
pub mod upload;
pub mod utils;
pub mod writer;

pub use camera::{
    CameraId, CameraRegistry, CameraSlot, CameraSource, CapturedFrame, DepthBuffer, Dimensions,
    SyntheticCamera,
};
pub use error::{RecorderError, RecorderResult};
pub use models::{Chunk, SessionIdentity, SessionOutcome};
pub use recording::{RecorderSnapshot, SessionController, SessionFailureHook, SessionPhase};
pub use settings::RecorderSettings;
pub use upload::ChunkUploader;
pub use utils::logging::init as init_logging;
