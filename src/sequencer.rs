//! Per-camera sequence counters and chunk path allocation.
//!
//! Sequence numbers are only consumed when a chunk is committed, so a
//! dropped chunk leaves no gap and its path is reused by the next writer.

use log::{info, warn};
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};
use uuid::Uuid;

use crate::camera::CameraId;
use crate::models::{Chunk, SessionIdentity};
use crate::writer::WriterOutput;

const CAMERA_DIR_PREFIX: &str = "camera_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPaths {
    pub color: PathBuf,
    pub depth: PathBuf,
}

#[derive(Debug)]
pub struct ChunkSequencer {
    root: PathBuf,
    next: BTreeMap<CameraId, u64>,
}

impl ChunkSequencer {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            next: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every counter back to 0.
    pub fn reset(&mut self) {
        self.next.clear();
    }

    pub fn next_sequence(&self, camera_id: CameraId) -> u64 {
        self.next.get(&camera_id).copied().unwrap_or(0)
    }

    pub fn camera_dir(&self, camera_id: CameraId) -> PathBuf {
        self.root.join(format!("{CAMERA_DIR_PREFIX}{camera_id}"))
    }

    /// Paths for the camera's next, not yet committed, chunk.
    pub fn paths_for(&self, camera_id: CameraId) -> ChunkPaths {
        let sequence = self.next_sequence(camera_id);
        let dir = self.camera_dir(camera_id);
        ChunkPaths {
            color: dir.join(format!("{sequence}.mp4")),
            depth: dir.join(format!("{sequence}_depth.npy")),
        }
    }

    /// Stamp a finalized writer's output with session identity and the next
    /// sequence number, then advance that camera's counter.
    pub fn commit(&mut self, output: WriterOutput, identity: &SessionIdentity) -> Chunk {
        let counter = self.next.entry(output.camera_id).or_insert(0);
        let sequence_number = *counter;
        *counter += 1;

        Chunk {
            chunk_id: Uuid::new_v4().to_string(),
            camera_id: output.camera_id,
            session_id: identity.session_id.clone(),
            patient_id: identity.patient_id.clone(),
            test_type: identity.test_type.clone(),
            sequence_number,
            color_file_path: output.color_path,
            depth_file_path: output.depth_path,
            duration_seconds: output.duration_seconds,
            timestamp: output.started_at,
            color_file_size_bytes: output.color_size_bytes,
            depth_file_size_bytes: output.depth_size_bytes,
            frames_written: output.frames_written,
        }
    }

    pub fn snapshot(&self) -> BTreeMap<CameraId, u64> {
        self.next.clone()
    }

    pub fn remove_camera_dir(&self, camera_id: CameraId) -> io::Result<bool> {
        let dir = self.camera_dir(camera_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Remove every camera directory under the root, whatever camera it
    /// belonged to. Returns how many were removed.
    pub fn purge_camera_dirs(&self) -> io::Result<usize> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let is_camera_dir = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(CAMERA_DIR_PREFIX));
            if !is_camera_dir || !entry.path().is_dir() {
                continue;
            }

            match fs::remove_dir_all(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) => warn!("failed to purge {}: {err}", entry.path().display()),
            }
        }

        if removed > 0 {
            info!("purged {removed} camera directories under {}", self.root.display());
        }
        Ok(removed)
    }
}
