//! In-memory terminal used by unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::session::{PtyProcess, PtySpawner, SpawnedPty};
use super::types::{PtyEvent, SpawnRequest, TermSize};

/// Records every spawned process instead of starting a shell.
#[derive(Default)]
pub struct RecordingSpawner {
    spawned: Mutex<Vec<Arc<FakeProcess>>>,
    fail_next: AtomicBool,
}

impl RecordingSpawner {
    pub fn spawned(&self) -> Vec<Arc<FakeProcess>> {
        self.spawned.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<FakeProcess>> {
        self.spawned.lock().last().cloned()
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl PtySpawner for RecordingSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedPty> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(anyhow!("no pty available"));
        }
        let (events_tx, events) = mpsc::unbounded_channel();
        let process = Arc::new(FakeProcess {
            run_id: request.run_id.clone(),
            size: request.size,
            events: events_tx,
            writes: Mutex::new(Vec::new()),
            resizes: Mutex::new(Vec::new()),
            killed: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        });
        self.spawned.lock().push(process.clone());
        Ok(SpawnedPty { process, events })
    }
}

pub struct FakeProcess {
    pub run_id: String,
    pub size: TermSize,
    events: mpsc::UnboundedSender<PtyEvent>,
    writes: Mutex<Vec<Vec<u8>>>,
    resizes: Mutex<Vec<TermSize>>,
    killed: AtomicBool,
    fail_writes: AtomicBool,
}

impl FakeProcess {
    pub fn emit(&self, output: &str) {
        let _ = self.events.send(PtyEvent::Output(output.to_string()));
    }

    pub fn exit(&self, code: u32) {
        let _ = self.events.send(PtyEvent::Exit {
            exit_code: Some(code),
        });
    }

    /// Everything written so far, concatenated.
    pub fn input(&self) -> String {
        let writes = self.writes.lock();
        String::from_utf8_lossy(&writes.concat()).into_owned()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }

    pub fn resizes(&self) -> Vec<TermSize> {
        self.resizes.lock().clone()
    }

    /// Make every later write fail while the process stays registered.
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

impl PtyProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn write_input(&self, data: &[u8]) -> Result<()> {
        if self.killed() || self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("PTY input channel closed"));
        }
        self.writes.lock().push(data.to_vec());
        Ok(())
    }

    fn resize(&self, size: TermSize) -> Result<()> {
        self.resizes.lock().push(size);
        Ok(())
    }

    fn kill(&self) {
        if !self.killed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(PtyEvent::Exit { exit_code: None });
        }
    }
}

/// Poll `check` until it holds, failing the test after a second.
pub async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
