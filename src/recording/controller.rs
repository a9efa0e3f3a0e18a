use std::sync::{Arc, Weak};

use chrono::Utc;
use log::{error, info, warn};
use tokio::{runtime::Handle, sync::Mutex};
use uuid::Uuid;

use crate::{
    camera::CameraRegistry,
    capture::{discard_writers, drain_and_finalize, CaptureContext, CaptureLoop},
    error::{RecorderError, RecorderResult},
    models::{Chunk, SessionIdentity, SessionOutcome},
    settings::RecorderSettings,
    upload::{ChunkUploader, UploadDispatcher},
};

use super::{RecorderSnapshot, RecorderState, SessionPhase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Stop,
    Cancel,
    FailureCancel,
}

impl Teardown {
    fn outcome(self) -> SessionOutcome {
        match self {
            Teardown::Stop => SessionOutcome::Stopped,
            Teardown::Cancel => SessionOutcome::Cancelled,
            Teardown::FailureCancel => SessionOutcome::CancelledByFailure,
        }
    }
}

/// Owns the session lifecycle. Cheap to clone; every clone drives the same
/// recorder.
#[derive(Clone)]
pub struct SessionController {
    ctx: Arc<CaptureContext>,
}

impl SessionController {
    /// Must be called from within a tokio runtime; upload tasks are spawned
    /// onto it.
    pub fn new(settings: RecorderSettings, registry: CameraRegistry) -> RecorderResult<Self> {
        settings.validate()?;
        let runtime = Handle::try_current().map_err(|err| RecorderError::Runtime(err.to_string()))?;

        let state = RecorderState::new(settings.temp_root.clone());
        Ok(Self {
            ctx: Arc::new(CaptureContext {
                state: Arc::new(Mutex::new(state)),
                registry,
                dispatcher: UploadDispatcher::new(runtime),
                settings,
            }),
        })
    }

    pub fn registry(&self) -> &CameraRegistry {
        &self.ctx.registry
    }

    pub fn settings(&self) -> &RecorderSettings {
        &self.ctx.settings
    }

    pub fn set_uploader(&self, uploader: Arc<dyn ChunkUploader>) {
        self.ctx.dispatcher.set_uploader(uploader);
    }

    /// Handle for the upload side to tear the session down when the remote
    /// end reports a camera fault. Does not keep the controller alive.
    pub fn failure_hook(&self) -> SessionFailureHook {
        SessionFailureHook {
            ctx: Arc::downgrade(&self.ctx),
            runtime: self.ctx.dispatcher.runtime().clone(),
        }
    }

    pub async fn snapshot(&self) -> RecorderSnapshot {
        let state = self.ctx.state.lock().await;
        RecorderSnapshot::capture(
            &state,
            self.ctx.registry.active_slots().len(),
            self.ctx.dispatcher.dispatched(),
        )
    }

    pub async fn start_session(
        &self,
        patient_id: impl Into<String>,
        session_id: Option<String>,
        test_type: Option<String>,
    ) -> RecorderResult<String> {
        let mut state = self.ctx.state.lock().await;
        if let Some(active_session_id) = state.session_id() {
            return Err(RecorderError::SessionConflict {
                active_session_id: active_session_id.to_string(),
            });
        }

        // Leftovers from a run that never tore down cleanly.
        state.sequencer.purge_camera_dirs()?;

        let session_id = session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let identity = SessionIdentity {
            session_id: session_id.clone(),
            patient_id: patient_id.into(),
            test_type,
            started_at: Utc::now(),
        };

        info!(
            "session {} started for patient {} ({})",
            identity.session_id,
            identity.patient_id,
            identity.test_type.as_deref().unwrap_or("no test type")
        );
        state.begin_session(identity);
        Ok(session_id)
    }

    /// Put every camera into recording mode and schedule the capture loop.
    /// `Ok(false)` when a loop is already running.
    pub async fn start_recording(&self) -> RecorderResult<bool> {
        let mut state = self.ctx.state.lock().await;
        let Some(session_id) = state.session_id().map(str::to_string) else {
            return Err(RecorderError::NoActiveSession);
        };

        if state.phase == SessionPhase::Recording {
            info!("session {session_id} is already recording");
            return Ok(false);
        }

        let slots = self.ctx.registry.active_slots();
        if slots.is_empty() {
            return Err(RecorderError::NoCamerasAvailable);
        }

        // A loop left behind by a failed run has already exited.
        if let Some(stale) = state.run.take() {
            stale.cancel();
        }

        for slot in &slots {
            slot.source.start_recording();
        }
        state.run = Some(CaptureLoop::spawn(self.ctx.clone()));
        state.phase = SessionPhase::Recording;

        info!(
            "session {session_id} recording on cameras {:?}",
            slots.iter().map(|slot| slot.camera_id).collect::<Vec<_>>()
        );
        Ok(true)
    }

    /// Stop the loop, drain the tail of the current window and finalize it.
    /// Returns the final chunks, which are also dispatched for upload.
    pub async fn stop_recording(&self) -> RecorderResult<Vec<Chunk>> {
        Ok(self.teardown(Teardown::Stop).await?.unwrap_or_default())
    }

    /// Stop the loop and throw away everything in flight, files included.
    /// `Ok(false)` when there was no session to cancel.
    pub async fn cancel_recording(&self) -> RecorderResult<bool> {
        Ok(self.teardown(Teardown::Cancel).await?.is_some())
    }

    /// Out-of-band teardown for camera faults reported by the upload side.
    /// Safe to call at any time, including while another teardown runs.
    pub async fn cancel_current_session(&self) -> RecorderResult<()> {
        self.teardown(Teardown::FailureCancel).await.map(|_| ())
    }

    /// The single teardown path. Returns `None` when some other caller
    /// already ended the session.
    async fn teardown(&self, mode: Teardown) -> RecorderResult<Option<Vec<Chunk>>> {
        let (session_id, run) = {
            let mut state = self.ctx.state.lock().await;
            let Some(session_id) = state.session_id().map(str::to_string) else {
                if mode == Teardown::FailureCancel {
                    state.sequencer.reset();
                }
                info!("{mode:?} requested with no active session");
                return Ok(None);
            };

            let run = state.run.take();
            if let Some(run) = &run {
                run.cancel();
            }
            (session_id, run)
        };

        if let Some(run) = run {
            if let Err(err) = run.join(self.ctx.settings.join_timeout()).await {
                warn!("{err}; tearing down session {session_id} anyway");
            }
        }

        let ctx = self.ctx.clone();
        let chunks = tokio::task::spawn_blocking(move || {
            let mut state = ctx.state.blocking_lock();
            if state.session_id() != Some(session_id.as_str()) {
                info!("session {session_id} was already torn down");
                return None;
            }

            let capturing = matches!(state.phase, SessionPhase::Recording);
            let failed = state.phase == SessionPhase::Failed;

            let chunks = match mode {
                Teardown::Stop => {
                    drain_and_finalize(&mut state, &ctx.registry, ctx.settings.drain_max_ticks)
                }
                Teardown::Cancel | Teardown::FailureCancel => {
                    let discarded = discard_writers(&mut state);
                    match state.sequencer.purge_camera_dirs() {
                        Ok(removed) => info!(
                            "session {session_id}: discarded {discarded} writers, removed {removed} camera directories"
                        ),
                        Err(err) => error!("session {session_id}: failed to purge camera directories: {err}"),
                    }
                    Vec::new()
                }
            };

            if capturing {
                for slot in ctx.registry.active_slots() {
                    slot.source.stop_recording();
                }
            }

            let outcome = if failed && mode == Teardown::Stop {
                SessionOutcome::Failed
            } else {
                mode.outcome()
            };
            state.end_session(outcome);
            info!(
                "session {session_id} ended ({}), {} final chunks",
                outcome.as_str(),
                chunks.len()
            );
            Some(chunks)
        })
        .await
        .map_err(|err| RecorderError::LoopJoin(err.to_string()))?;

        if let Some(chunks) = &chunks {
            for chunk in chunks {
                self.ctx.dispatcher.dispatch(chunk.clone());
            }
        }
        Ok(chunks)
    }
}

/// Weak handle onto a [`SessionController`] for the upload collaborator.
#[derive(Clone)]
pub struct SessionFailureHook {
    ctx: Weak<CaptureContext>,
    runtime: Handle,
}

impl SessionFailureHook {
    /// Tear the current session down. `Ok(false)` once the controller is gone.
    pub async fn cancel_current_session(&self) -> RecorderResult<bool> {
        let Some(ctx) = self.ctx.upgrade() else {
            return Ok(false);
        };
        SessionController { ctx }.cancel_current_session().await?;
        Ok(true)
    }

    /// Fire-and-forget variant for synchronous callers such as an uploader
    /// running on a blocking thread.
    pub fn trigger(&self, reason: impl Into<String>) {
        let hook = self.clone();
        let reason = reason.into();
        self.runtime.spawn(async move {
            warn!("camera failure reported: {reason}");
            if let Err(err) = hook.cancel_current_session().await {
                error!("failed to cancel session after camera failure: {err}");
            }
        });
    }
}
