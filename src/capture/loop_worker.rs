use std::{
    any::Any,
    collections::BTreeMap,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::camera::{CameraId, CameraSlot};
use crate::recording::SessionPhase;

use super::{
    rotation::{complete_frame, discard_writers, finalize_writers, open_writer, resolve_dimensions, write_frame},
    CaptureContext,
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

// Import the logging macros (exported at crate root)
use crate::{log_error, log_info, log_warn};

const IDLE_POLL: Duration = Duration::from_millis(20);

/// Body of the capture task. Runs windows until the token is cancelled,
/// restarting after a crash until the restart budget is spent.
pub(super) fn capture_loop(ctx: Arc<CaptureContext>, cancel_token: CancellationToken) {
    let max_restarts = ctx.settings.max_loop_restarts;
    let mut restarts = 0;

    loop {
        let payload = match panic::catch_unwind(AssertUnwindSafe(|| run_windows(&ctx, &cancel_token))) {
            Ok(()) => {
                log_info!("capture loop shutting down");
                return;
            }
            Err(payload) => payload,
        };

        let mut state = ctx.state.blocking_lock();
        if cancel_token.is_cancelled() {
            // Teardown owns whatever is left.
            log_warn!("capture loop crashed during shutdown: {}", panic_message(&*payload));
            return;
        }

        let discarded = discard_writers(&mut state);
        log_error!(
            "capture loop crashed ({}), discarded {discarded} open writers",
            panic_message(&*payload)
        );

        if restarts >= max_restarts {
            state.phase = SessionPhase::Failed;
            drop(state);
            for slot in ctx.registry.active_slots() {
                slot.source.stop_recording();
            }
            log_error!("capture loop failed after {restarts} restarts, session marked failed");
            return;
        }

        restarts += 1;
        log_warn!("restarting capture loop ({restarts}/{max_restarts})");
    }
}

/// Returns once the token is cancelled.
fn run_windows(ctx: &CaptureContext, cancel_token: &CancellationToken) {
    let chunk_duration = ctx.settings.chunk_duration();
    let idle_poll = ctx.settings.min_tick_interval().max(IDLE_POLL);
    let mut idle = false;

    while !cancel_token.is_cancelled() {
        let window_start = Instant::now();
        let slots = ctx.registry.active_slots();
        if slots.is_empty() {
            if !idle {
                log_warn!("no active cameras, waiting for one to come back");
                idle = true;
            }
            std::thread::sleep(idle_poll);
            continue;
        }
        idle = false;

        let Some(mut written) = open_missing_writers(ctx, &slots, cancel_token) else {
            return;
        };
        let writing: Vec<&CameraSlot> = slots
            .iter()
            .filter(|slot| written.contains_key(&slot.camera_id))
            .collect();
        let tick = tick_interval(&writing, ctx.settings.min_tick_interval());
        let mut dropped: BTreeMap<CameraId, u64> = BTreeMap::new();

        while window_start.elapsed() < chunk_duration {
            if cancel_token.is_cancelled() {
                return;
            }
            let tick_start = Instant::now();

            for slot in &writing {
                let frame = slot
                    .source
                    .try_get_frame()
                    .ok()
                    .and_then(|frame| complete_frame(slot, frame));

                let mut state = ctx.state.blocking_lock();
                if cancel_token.is_cancelled() {
                    return;
                }
                let stored = frame.is_some_and(|frame| write_frame(&mut state, slot.camera_id, &frame));
                drop(state);

                if stored {
                    *written.entry(slot.camera_id).or_insert(0) += 1;
                } else {
                    *dropped.entry(slot.camera_id).or_insert(0) += 1;
                }
            }

            let remaining = chunk_duration.saturating_sub(window_start.elapsed());
            let pause = tick.saturating_sub(tick_start.elapsed()).min(remaining);
            if !pause.is_zero() {
                std::thread::sleep(pause);
            }
        }

        let mut state = ctx.state.blocking_lock();
        if cancel_token.is_cancelled() {
            return;
        }
        let chunks = finalize_writers(&mut state);
        drop(state);

        log_info!(
            "window closed after {:.2}s: written {:?}, dropped {:?}",
            window_start.elapsed().as_secs_f64(),
            written,
            dropped
        );
        for chunk in chunks {
            ctx.dispatcher.dispatch(chunk);
        }
    }
}

/// Open a writer for every camera that lacks one. Returns the per-camera
/// frame count so far (a probe frame counts), or `None` once cancelled.
/// Cameras whose writer could not be opened sit this window out.
fn open_missing_writers(
    ctx: &CaptureContext,
    slots: &[CameraSlot],
    cancel_token: &CancellationToken,
) -> Option<BTreeMap<CameraId, u64>> {
    let quality = ctx.settings.jpeg_quality;
    let mut written = BTreeMap::new();

    for slot in slots {
        let cached = {
            let state = ctx.state.blocking_lock();
            if cancel_token.is_cancelled() {
                return None;
            }
            if state.writers.contains_key(&slot.camera_id) {
                written.insert(slot.camera_id, 0);
                continue;
            }
            state.resolved_dimensions.get(&slot.camera_id).copied()
        };

        let resolved = resolve_dimensions(slot, cached)
            .map(|(dimensions, probe)| (dimensions, probe.and_then(|frame| complete_frame(slot, frame))));

        let mut state = ctx.state.blocking_lock();
        if cancel_token.is_cancelled() {
            return None;
        }

        let (dimensions, probe) = match resolved {
            Ok(resolved) => resolved,
            Err(err) => {
                log_warn!(
                    "camera {} skipped this window, frame size unknown: {err:#}",
                    slot.camera_id
                );
                continue;
            }
        };

        if let Err(err) = open_writer(&mut state, slot, dimensions, quality) {
            log_warn!("camera {} skipped this window: {err}", slot.camera_id);
            continue;
        }

        let probe_written = probe.is_some_and(|frame| write_frame(&mut state, slot.camera_id, &frame));
        written.insert(slot.camera_id, u64::from(probe_written));
    }

    Some(written)
}

/// Poll no faster than the fastest camera delivers.
fn tick_interval(slots: &[&CameraSlot], floor: Duration) -> Duration {
    let fastest = slots.iter().map(|slot| slot.native_fps).max().unwrap_or(1).max(1);
    Duration::from_secs_f64(1.0 / f64::from(fastest)).max(floor)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraRegistry, SyntheticCamera};
    use std::collections::BTreeSet;

    #[test]
    fn tick_follows_fastest_camera() {
        let registry = CameraRegistry::new(BTreeSet::new());
        let slow = registry.initialize_camera(0, Arc::new(SyntheticCamera::new(0, 4, 4, 10)), None);
        let fast = registry.initialize_camera(1, Arc::new(SyntheticCamera::new(1, 4, 4, 50)), None);

        let tick = tick_interval(&[&slow, &fast], Duration::from_millis(5));
        assert!((tick.as_secs_f64() - 0.02).abs() < 1e-6);

        let floored = tick_interval(&[&fast], Duration::from_millis(40));
        assert_eq!(floored, Duration::from_millis(40));
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload = panic::catch_unwind(|| panic!("camera {} crashed", 3)).unwrap_err();
        assert_eq!(panic_message(&*payload), "camera 3 crashed");

        let payload = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(&*payload), "static");
    }
}
