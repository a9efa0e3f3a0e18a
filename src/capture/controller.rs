use log::{info, warn};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{RecorderError, RecorderResult};

use super::{loop_worker::capture_loop, CaptureContext};

/// One running capture loop: its blocking task and the token that stops it.
pub struct CaptureLoop {
    handle: Option<JoinHandle<()>>,
    cancel_token: CancellationToken,
}

impl CaptureLoop {
    /// Schedule the loop on the blocking pool. Returns as soon as it is
    /// scheduled.
    pub(crate) fn spawn(ctx: Arc<CaptureContext>) -> Self {
        let cancel_token = CancellationToken::new();
        let token_clone = cancel_token.clone();
        let handle = tokio::task::spawn_blocking(move || capture_loop(ctx, token_clone));

        Self {
            handle: Some(handle),
            cancel_token,
        }
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Wait up to `timeout` for the loop to exit. A loop that overruns is left
    /// to notice its cancelled token on its own; it never touches session
    /// state after cancellation.
    pub async fn join(mut self, timeout: Duration) -> RecorderResult<()> {
        self.cancel_token.cancel();

        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => {
                info!("capture loop exited");
                Ok(())
            }
            Ok(Err(err)) => Err(RecorderError::LoopJoin(err.to_string())),
            Err(_) => {
                warn!("capture loop still running after {:?}, detaching", timeout);
                Err(RecorderError::LoopJoin(format!(
                    "loop did not exit within {:?}",
                    timeout
                )))
            }
        }
    }
}
