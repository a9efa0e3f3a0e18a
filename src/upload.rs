//! Fire-and-forget hand-off of finalized chunks to the upload collaborator.
//!
//! Each chunk goes to the registered [`ChunkUploader`] exactly once, on its
//! own short-lived blocking task. Failures are logged and never retried; the
//! uploader owns the chunk's files afterwards.

use anyhow::Result;
use log::{error, info, warn};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock,
};
use tokio::runtime::Handle;

use crate::models::Chunk;

/// Receives every finalized chunk. Called from a blocking worker thread.
pub trait ChunkUploader: Send + Sync + 'static {
    fn on_chunk_ready(&self, chunk: Chunk) -> Result<()>;
}

impl<F> ChunkUploader for F
where
    F: Fn(Chunk) -> Result<()> + Send + Sync + 'static,
{
    fn on_chunk_ready(&self, chunk: Chunk) -> Result<()> {
        self(chunk)
    }
}

#[derive(Clone)]
pub struct UploadDispatcher {
    runtime: Handle,
    uploader: Arc<RwLock<Option<Arc<dyn ChunkUploader>>>>,
    dispatched: Arc<AtomicU64>,
}

impl UploadDispatcher {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            uploader: Arc::new(RwLock::new(None)),
            dispatched: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn set_uploader(&self, uploader: Arc<dyn ChunkUploader>) {
        let mut guard = match self.uploader.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(uploader);
    }

    pub fn clear_uploader(&self) {
        let mut guard = match self.uploader.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = None;
    }

    /// Chunks handed to an uploader so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::SeqCst)
    }

    /// Spawn one upload task for `chunk` and return immediately. Safe to call
    /// from the blocking capture thread.
    pub fn dispatch(&self, chunk: Chunk) {
        let uploader = {
            let guard = match self.uploader.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.clone()
        };

        let Some(uploader) = uploader else {
            warn!(
                "no uploader registered, chunk {} of camera {} stays at {}",
                chunk.sequence_number,
                chunk.camera_id,
                chunk.color_file_path.display()
            );
            return;
        };

        self.dispatched.fetch_add(1, Ordering::SeqCst);
        let camera_id = chunk.camera_id;
        let sequence_number = chunk.sequence_number;
        let chunk_id = chunk.chunk_id.clone();

        self.runtime.spawn_blocking(move || match uploader.on_chunk_ready(chunk) {
            Ok(()) => info!("camera {camera_id} chunk {sequence_number} ({chunk_id}) handed off"),
            Err(err) => error!(
                "upload of camera {camera_id} chunk {sequence_number} ({chunk_id}) failed: {err:?}"
            ),
        });
    }
}
