use thiserror::Error;

use crate::camera::CameraId;

/// Errors surfaced by the session controller.
///
/// Camera-level failures (frame fetch, writer init, finalize) are logged and
/// absorbed inside the capture loop; only lifecycle precondition violations
/// reach the caller during normal operation.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("session {active_session_id} is already active")]
    SessionConflict { active_session_id: String },

    #[error("no active session, call start_session first")]
    NoActiveSession,

    #[error("no initialized cameras available")]
    NoCamerasAvailable,

    #[error("could not open writer for camera {camera_id}: {reason}")]
    WriterInit { camera_id: CameraId, reason: String },

    #[error("chunk output for camera {camera_id} is missing or corrupt: {reason}")]
    FinalizeIo { camera_id: CameraId, reason: String },

    #[error("capture loop did not shut down cleanly: {0}")]
    LoopJoin(String),

    #[error("recorder must be created inside a tokio runtime: {0}")]
    Runtime(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type RecorderResult<T> = std::result::Result<T, RecorderError>;
