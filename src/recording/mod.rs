mod controller;
mod state;

pub use controller::{SessionController, SessionFailureHook};
pub use state::{RecorderSnapshot, RecorderState, SessionPhase};
