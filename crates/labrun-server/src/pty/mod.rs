//! Pseudo-terminal processes and the sessions that own them.

pub mod session;
pub mod state;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use session::{NativePtySpawner, PtyProcess, PtySpawner, SpawnedPty};
pub use state::{Session, SessionManager};
pub use types::{ChannelId, OutputSink, PtyEvent, SpawnRequest, TermSize};
