//! PTY types shared by the bridge and the session manager

use std::fmt;

use portable_pty::PtySize;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

impl TermSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    pub fn to_pty_size(self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Identity of one connected WebSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Text frames queued for one channel, in the order they must be sent.
pub type OutputSink = mpsc::UnboundedSender<String>;

/// Events emitted by a running PTY process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// Terminal output, split only on UTF-8 boundaries
    Output(String),
    /// The process exited and its output is drained
    Exit { exit_code: Option<u32> },
}

/// What to spawn for a run.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub run_id: String,
    pub size: TermSize,
}
