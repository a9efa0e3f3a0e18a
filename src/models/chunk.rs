use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::camera::CameraId;

/// One finalized, bounded-duration segment of output for one camera.
///
/// Immutable once built; handed to the uploader exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub chunk_id: String,
    pub camera_id: CameraId,
    pub session_id: String,
    pub patient_id: String,
    pub test_type: Option<String>,
    pub sequence_number: u64,
    pub color_file_path: PathBuf,
    pub depth_file_path: Option<PathBuf>,
    /// Wall-clock time between writer creation and finalize, not frames / fps.
    pub duration_seconds: f64,
    /// When the writer was created.
    pub timestamp: DateTime<Utc>,
    pub color_file_size_bytes: u64,
    pub depth_file_size_bytes: Option<u64>,
    pub frames_written: u64,
}

impl Chunk {
    pub fn has_depth(&self) -> bool {
        self.depth_file_path.is_some()
    }
}
