use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf};

use crate::camera::{CameraId, Dimensions};
use crate::capture::CaptureLoop;
use crate::models::{SessionIdentity, SessionOutcome};
use crate::sequencer::ChunkSequencer;
use crate::writer::ChunkWriter;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
    Idle,
    SessionStarted,
    Recording,
    /// The capture loop gave up after repeated crashes. The session is kept
    /// until the caller stops or cancels it.
    Failed,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "Idle",
            SessionPhase::SessionStarted => "SessionStarted",
            SessionPhase::Recording => "Recording",
            SessionPhase::Failed => "Failed",
        }
    }
}

/// Everything the controller and the capture loop share. Only ever touched
/// with the session mutex held.
pub struct RecorderState {
    pub phase: SessionPhase,
    pub identity: Option<SessionIdentity>,
    pub writers: BTreeMap<CameraId, ChunkWriter>,
    pub sequencer: ChunkSequencer,
    /// Frame size per camera once known, so later windows can open writers
    /// even when the camera stops delivering.
    pub resolved_dimensions: BTreeMap<CameraId, Dimensions>,
    pub last_outcome: Option<SessionOutcome>,
    pub(crate) run: Option<CaptureLoop>,
}

impl RecorderState {
    pub fn new(temp_root: PathBuf) -> Self {
        Self {
            phase: SessionPhase::Idle,
            identity: None,
            writers: BTreeMap::new(),
            sequencer: ChunkSequencer::new(temp_root),
            resolved_dimensions: BTreeMap::new(),
            last_outcome: None,
            run: None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|identity| identity.session_id.as_str())
    }

    pub fn begin_session(&mut self, identity: SessionIdentity) {
        self.sequencer.reset();
        self.resolved_dimensions.clear();
        self.writers.clear();
        self.identity = Some(identity);
        self.phase = SessionPhase::SessionStarted;
    }

    /// Back to `Idle`. Any writer still open is discarded along with its files.
    pub fn end_session(&mut self, outcome: SessionOutcome) {
        for writer in self.writers.values_mut() {
            writer.discard();
        }
        self.writers.clear();
        self.sequencer.reset();
        self.resolved_dimensions.clear();
        self.identity = None;
        self.run = None;
        self.phase = SessionPhase::Idle;
        self.last_outcome = Some(outcome);
    }
}

/// Point-in-time view of the recorder for status queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecorderSnapshot {
    pub phase: SessionPhase,
    pub session_id: Option<String>,
    pub patient_id: Option<String>,
    pub test_type: Option<String>,
    pub recording: bool,
    pub camera_count: usize,
    pub open_writers: usize,
    pub next_sequence: BTreeMap<CameraId, u64>,
    pub chunks_dispatched: u64,
    pub last_outcome: Option<SessionOutcome>,
}

impl RecorderSnapshot {
    pub(crate) fn capture(state: &RecorderState, camera_count: usize, chunks_dispatched: u64) -> Self {
        let identity = state.identity.as_ref();
        Self {
            phase: state.phase,
            session_id: identity.map(|i| i.session_id.clone()),
            patient_id: identity.map(|i| i.patient_id.clone()),
            test_type: identity.and_then(|i| i.test_type.clone()),
            recording: state.phase == SessionPhase::Recording,
            camera_count,
            open_writers: state.writers.len(),
            next_sequence: state.sequencer.snapshot(),
            chunks_dispatched,
            last_outcome: state.last_outcome,
        }
    }

    pub fn has_session(&self) -> bool {
        self.session_id.is_some()
    }
}
