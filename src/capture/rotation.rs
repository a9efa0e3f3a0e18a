//! Per-camera writer helpers shared by the loop and the teardown paths.
//! Everything taking `&mut RecorderState` expects the session mutex held.

use anyhow::{anyhow, Result};
use log::{debug, info, warn};

use crate::camera::{CameraId, CameraSlot, CapturedFrame, Dimensions};
use crate::error::RecorderError;
use crate::models::Chunk;
use crate::recording::RecorderState;
use crate::writer::ChunkWriter;

/// Frame size for `slot`: declared, cached from earlier in the session, or
/// probed now. A probed frame is handed back so it can open the chunk.
/// Blocks on the camera, so call it without the session mutex.
pub(crate) fn resolve_dimensions(
    slot: &CameraSlot,
    cached: Option<Dimensions>,
) -> Result<(Dimensions, Option<CapturedFrame>)> {
    if let Some(dimensions) = slot.frame_dimensions.or(cached) {
        return Ok((dimensions, None));
    }

    let probe = slot.source.try_get_frame()?;
    let image = probe
        .color
        .as_ref()
        .ok_or_else(|| anyhow!("probe frame carried no color image"))?;
    Ok((Dimensions::of(image), Some(probe)))
}

/// Open the writer for `slot`'s next chunk at the next sequence path.
pub(crate) fn open_writer(
    state: &mut RecorderState,
    slot: &CameraSlot,
    dimensions: Dimensions,
    quality: u8,
) -> Result<(), RecorderError> {
    let paths = state.sequencer.paths_for(slot.camera_id);
    let writer = ChunkWriter::open(slot, &paths, dimensions, quality).map_err(|err| {
        RecorderError::WriterInit {
            camera_id: slot.camera_id,
            reason: format!("{err:#}"),
        }
    })?;

    state.resolved_dimensions.insert(slot.camera_id, dimensions);
    state.writers.insert(slot.camera_id, writer);
    Ok(())
}

/// Make a fetched frame writable for `slot`. Depth cameras get a second
/// chance through the depth-only fetch; frames still missing a half are
/// dropped. Blocks on the camera.
pub(crate) fn complete_frame(slot: &CameraSlot, mut frame: CapturedFrame) -> Option<CapturedFrame> {
    frame.color.as_ref()?;
    if slot.has_depth && frame.depth.is_none() {
        frame.depth = slot.source.try_get_depth_frame();
        frame.depth.as_ref()?;
    }
    Some(frame)
}

/// Route a frame to the camera's open writer. False when nothing was written.
pub(crate) fn write_frame(state: &mut RecorderState, camera_id: CameraId, frame: &CapturedFrame) -> bool {
    let Some(writer) = state.writers.get_mut(&camera_id) else {
        return false;
    };
    match writer.write(frame) {
        Ok(()) => true,
        Err(err) => {
            debug!("camera {camera_id} frame rejected: {err:#}");
            false
        }
    }
}

/// Finalize every open writer and stamp the survivors as chunks, consuming
/// one sequence number each. Writers that fail to finalize are dropped.
pub(crate) fn finalize_writers(state: &mut RecorderState) -> Vec<Chunk> {
    let writers = std::mem::take(&mut state.writers);
    let Some(identity) = state.identity.clone() else {
        warn!("finalizing {} writers without a session, discarding", writers.len());
        for (_, mut writer) in writers {
            writer.discard();
        }
        return Vec::new();
    };

    let mut chunks = Vec::with_capacity(writers.len());
    for (camera_id, mut writer) in writers {
        match writer.finalize() {
            Ok(output) => {
                let chunk = state.sequencer.commit(output, &identity);
                info!(
                    "camera {camera_id} chunk {} finalized: {} frames in {:.2}s",
                    chunk.sequence_number, chunk.frames_written, chunk.duration_seconds
                );
                chunks.push(chunk);
            }
            Err(err) => {
                let err = RecorderError::FinalizeIo {
                    camera_id,
                    reason: format!("{err:#}"),
                };
                warn!("dropping chunk: {err}");
            }
        }
    }
    chunks
}

/// Close every open writer and delete its files. No sequence numbers are used.
pub(crate) fn discard_writers(state: &mut RecorderState) -> usize {
    let writers = std::mem::take(&mut state.writers);
    let count = writers.len();
    for (_, mut writer) in writers {
        writer.discard();
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraRegistry, CameraSource, SyntheticCamera};
    use crate::models::SessionIdentity;
    use chrono::Utc;
    use std::{collections::BTreeSet, sync::Arc};
    use tempfile::tempdir;

    fn session_state(root: &std::path::Path) -> RecorderState {
        let mut state = RecorderState::new(root.to_path_buf());
        state.begin_session(SessionIdentity {
            session_id: "s".into(),
            patient_id: "p".into(),
            test_type: None,
            started_at: Utc::now(),
        });
        state
    }

    #[test]
    fn probe_frame_resolves_dimensions_once() {
        let registry = CameraRegistry::new(BTreeSet::new());
        let camera = Arc::new(SyntheticCamera::new(0, 12, 8, 30));
        camera.start_recording();
        let slot = registry.initialize_camera(0, camera.clone(), None);

        let (dims, probe) = resolve_dimensions(&slot, None).unwrap();
        assert_eq!(dims, Dimensions::new(12, 8));
        assert!(probe.is_some());

        let (cached, probe) = resolve_dimensions(&slot, Some(dims)).unwrap();
        assert_eq!(cached, dims);
        assert!(probe.is_none());
        assert_eq!(camera.fetch_count(), 1);
    }

    #[test]
    fn failed_probe_is_an_error() {
        let registry = CameraRegistry::new(BTreeSet::new());
        let slot = registry.initialize_camera(0, Arc::new(SyntheticCamera::new(0, 4, 4, 30)), None);
        // Not in recording mode, so the probe fetch fails.
        assert!(resolve_dimensions(&slot, None).is_err());
    }

    #[test]
    fn depth_camera_drops_frames_without_depth() {
        let registry = CameraRegistry::new(BTreeSet::from([1]));
        let camera = Arc::new(SyntheticCamera::new(1, 4, 4, 30));
        camera.start_recording();
        let slot = registry.initialize_camera(1, camera.clone(), None);

        let color_only = camera.try_get_frame().unwrap();
        assert!(complete_frame(&slot, color_only).is_none());

        let depth_camera = Arc::new(SyntheticCamera::new(2, 4, 4, 30).with_depth());
        depth_camera.start_recording();
        let slot = CameraRegistry::new(BTreeSet::from([2])).initialize_camera(2, depth_camera.clone(), None);
        let mut frame = depth_camera.try_get_frame().unwrap();
        frame.depth = None;
        let completed = complete_frame(&slot, frame).unwrap();
        assert!(completed.depth.is_some());
    }

    #[test]
    fn failed_finalize_consumes_no_sequence_number() {
        let dir = tempdir().unwrap();
        let mut state = session_state(dir.path());
        let registry = CameraRegistry::new(BTreeSet::new());
        let slot = registry.initialize_camera(3, Arc::new(SyntheticCamera::new(3, 4, 4, 30)), None);

        open_writer(&mut state, &slot, Dimensions::new(4, 4), 90).unwrap();
        std::fs::remove_file(dir.path().join("camera_3").join("0.mp4")).unwrap();
        assert!(finalize_writers(&mut state).is_empty());
        assert_eq!(state.sequencer.next_sequence(3), 0);

        open_writer(&mut state, &slot, Dimensions::new(4, 4), 90).unwrap();
        let chunks = finalize_writers(&mut state);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].sequence_number, 0);
        assert_eq!(chunks[0].session_id, "s");
    }

    #[test]
    fn discard_leaves_no_files() {
        let dir = tempdir().unwrap();
        let mut state = session_state(dir.path());
        let registry = CameraRegistry::new(BTreeSet::from([0]));
        let slot = registry.initialize_camera(0, Arc::new(SyntheticCamera::new(0, 4, 4, 30)), None);

        open_writer(&mut state, &slot, Dimensions::new(4, 4), 90).unwrap();
        assert_eq!(discard_writers(&mut state), 1);
        assert!(!dir.path().join("camera_0").join("0.mp4").exists());
        assert!(!dir.path().join("camera_0").join("0_depth.npy").exists());
        assert_eq!(state.sequencer.next_sequence(0), 0);
    }
}
