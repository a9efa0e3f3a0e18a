mod chunk;
mod session;

pub use chunk::Chunk;
pub use session::{SessionIdentity, SessionOutcome};
