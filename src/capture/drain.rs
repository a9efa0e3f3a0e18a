use std::collections::BTreeMap;

use crate::camera::{CameraId, CameraRegistry, CameraSlot};
use crate::models::Chunk;
use crate::recording::RecorderState;

use super::rotation::{complete_frame, finalize_writers, write_frame};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::log_info;

/// Pull up to `max_ticks` extra frames into every open writer, then finalize
/// them all. Each tick makes one fetch per camera; the drain ends early on the
/// first tick that yields nothing from any camera.
///
/// Runs with the session mutex held, on a blocking thread.
pub(crate) fn drain_and_finalize(
    state: &mut RecorderState,
    registry: &CameraRegistry,
    max_ticks: u32,
) -> Vec<Chunk> {
    let slots: BTreeMap<CameraId, CameraSlot> = registry
        .active_slots()
        .into_iter()
        .filter(|slot| state.writers.contains_key(&slot.camera_id))
        .map(|slot| (slot.camera_id, slot))
        .collect();

    let mut drained: BTreeMap<CameraId, u64> = BTreeMap::new();
    let mut ticks = 0;
    while ticks < max_ticks && !slots.is_empty() {
        ticks += 1;
        let mut yielded = 0;

        for (camera_id, slot) in &slots {
            let Ok(frame) = slot.source.try_get_frame() else {
                continue;
            };
            let Some(frame) = complete_frame(slot, frame) else {
                continue;
            };
            if write_frame(state, *camera_id, &frame) {
                *drained.entry(*camera_id).or_insert(0) += 1;
                yielded += 1;
            }
        }

        if yielded == 0 {
            break;
        }
    }

    log_info!(
        "drain finished after {ticks} ticks, extra frames per camera: {:?}",
        drained
    );
    finalize_writers(state)
}
