//! Session management
//!
//! Owns every live terminal, keyed by run id. At most one session exists per
//! run; each is bound to the channel that created it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use super::session::{PtyProcess, PtySpawner};
use super::types::{ChannelId, OutputSink, PtyEvent, SpawnRequest, TermSize};
use crate::errors::{BridgeError, BridgeResult};

/// A terminal registered under a run id.
pub struct Session {
    pub run_id: String,
    pub channel_id: ChannelId,
    /// Distinguishes a replaced session from its successor.
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    process: Arc<dyn PtyProcess>,
    size: RwLock<TermSize>,
}

impl Session {
    pub fn size(&self) -> TermSize {
        *self.size.read()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn write(&self, data: &[u8]) -> BridgeResult<()> {
        self.process
            .write_input(data)
            .map_err(|e| BridgeError::Write(format!("{:#}", e)))
    }

    fn kill(&self) {
        self.process.kill();
    }
}

pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    run_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    spawner: Arc<dyn PtySpawner>,
    next_generation: AtomicU64,
}

impl SessionManager {
    pub fn new(spawner: Arc<dyn PtySpawner>) -> Self {
        Self {
            sessions: DashMap::new(),
            run_locks: DashMap::new(),
            spawner,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Spawn a terminal for `run_id` and stream its output into `sink`.
    ///
    /// An existing session for the run is replaced and its process killed.
    pub fn create(
        self: &Arc<Self>,
        run_id: &str,
        channel_id: ChannelId,
        size: TermSize,
        sink: OutputSink,
    ) -> BridgeResult<Arc<Session>> {
        let spawned = self
            .spawner
            .spawn(&SpawnRequest {
                run_id: run_id.to_string(),
                size,
            })
            .map_err(|e| BridgeError::Spawn(format!("{:#}", e)))?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session {
            run_id: run_id.to_string(),
            channel_id,
            generation,
            created_at: Utc::now(),
            process: spawned.process,
            size: RwLock::new(size),
        });

        let replaced = self.sessions.insert(run_id.to_string(), session.clone());
        if let Some(old) = replaced {
            info!(
                run_id = %run_id,
                old_generation = old.generation,
                "replacing existing session"
            );
            old.kill();
        }

        info!(
            run_id = %run_id,
            channel = %channel_id,
            generation,
            pid = ?session.pid(),
            cols = size.cols,
            rows = size.rows,
            "session created"
        );

        tokio::spawn(forward_output(
            Arc::downgrade(self),
            run_id.to_string(),
            generation,
            spawned.events,
            sink,
        ));

        Ok(session)
    }

    pub fn lookup(&self, run_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(run_id).map(|entry| entry.value().clone())
    }

    /// Resize the terminal of `run_id`. Returns `Ok(false)` when no session exists.
    pub fn resize(&self, run_id: &str, size: TermSize) -> BridgeResult<bool> {
        let Some(session) = self.lookup(run_id) else {
            warn!(run_id = %run_id, "resize for unknown session ignored");
            return Ok(false);
        };
        session
            .process
            .resize(size)
            .map_err(|e| BridgeError::Resize(format!("{:#}", e)))?;
        *session.size.write() = size;
        debug!(run_id = %run_id, cols = size.cols, rows = size.rows, "session resized");
        Ok(true)
    }

    /// Deregister and kill the session of `run_id`.
    pub fn remove_by_run_id(&self, run_id: &str) -> Option<Arc<Session>> {
        let Some((_, session)) = self.sessions.remove(run_id) else {
            debug!(run_id = %run_id, "no session to remove");
            return None;
        };
        session.kill();
        info!(run_id = %run_id, generation = session.generation, "session removed");
        Some(session)
    }

    /// Deregister and kill every session owned by `channel_id`.
    pub fn remove_by_channel(&self, channel_id: ChannelId) -> usize {
        let mut removed = Vec::new();
        self.sessions.retain(|_, session| {
            if session.channel_id == channel_id {
                removed.push(session.clone());
                false
            } else {
                true
            }
        });

        for session in &removed {
            session.kill();
            info!(
                run_id = %session.run_id,
                channel = %channel_id,
                "session removed on disconnect"
            );
        }
        self.prune_run_locks();
        removed.len()
    }

    /// Remove the session only if it is still the given generation.
    fn remove_exited(&self, run_id: &str, generation: u64) {
        let removed = self
            .sessions
            .remove_if(run_id, |_, session| session.generation == generation);
        if removed.is_some() {
            info!(run_id = %run_id, generation, "session exited");
        } else {
            debug!(run_id = %run_id, generation, "replaced session exited");
        }
    }

    /// Lock serializing command execution for one run.
    pub fn run_lock(&self, run_id: &str) -> Arc<AsyncMutex<()>> {
        self.run_locks
            .entry(run_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Drop locks nobody holds or waits on.
    fn prune_run_locks(&self) {
        self.run_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Relay process output to the owning channel until the process exits.
async fn forward_output(
    manager: Weak<SessionManager>,
    run_id: String,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<PtyEvent>,
    sink: OutputSink,
) {
    while let Some(event) = events.recv().await {
        match event {
            PtyEvent::Output(data) => {
                // The channel may already be gone; keep draining until exit.
                let _ = sink.send(data);
            }
            PtyEvent::Exit { exit_code } => {
                debug!(run_id = %run_id, generation, ?exit_code, "process exit observed");
                break;
            }
        }
    }

    if let Some(manager) = manager.upgrade() {
        manager.remove_exited(&run_id, generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::testing::{eventually, RecordingSpawner};

    fn manager() -> (Arc<SessionManager>, Arc<RecordingSpawner>) {
        let spawner = Arc::new(RecordingSpawner::default());
        (Arc::new(SessionManager::new(spawner.clone())), spawner)
    }

    #[tokio::test]
    async fn forwards_output_in_order() {
        let (manager, spawner) = manager();
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager
            .create("r1", ChannelId::new(), TermSize::default(), tx)
            .unwrap();

        let process = spawner.last().unwrap();
        assert_eq!(process.run_id, "r1");
        process.emit("one");
        process.emit("two");
        assert_eq!(rx.recv().await.unwrap(), "one");
        assert_eq!(rx.recv().await.unwrap(), "two");
    }

    #[tokio::test]
    async fn exit_deregisters_session() {
        let (manager, spawner) = manager();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager
            .create("r1", ChannelId::new(), TermSize::default(), tx)
            .unwrap();
        assert_eq!(manager.len(), 1);

        spawner.last().unwrap().exit(0);
        eventually(|| manager.lookup("r1").is_none()).await;
    }

    #[tokio::test]
    async fn duplicate_create_keeps_one_session() {
        let (manager, spawner) = manager();
        let channel = ChannelId::new();
        for _ in 0..3 {
            let (tx, _rx) = mpsc::unbounded_channel();
            manager
                .create("r1", channel, TermSize::default(), tx)
                .unwrap();
        }

        let processes = spawner.spawned();
        assert_eq!(processes.len(), 3);
        assert!(processes[0].killed());
        assert!(processes[1].killed());
        assert!(!processes[2].killed());

        // Exits of the replaced processes must not remove the newest session.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let current = manager.lookup("r1").unwrap();
        assert_eq!(manager.len(), 1);
        assert_eq!(current.generation, 3);
    }

    #[tokio::test]
    async fn resize_records_size() {
        let (manager, spawner) = manager();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager
            .create("r1", ChannelId::new(), TermSize::default(), tx)
            .unwrap();

        assert!(manager.resize("r1", TermSize::new(120, 40)).unwrap());
        assert_eq!(manager.lookup("r1").unwrap().size(), TermSize::new(120, 40));
        assert_eq!(spawner.last().unwrap().resizes(), vec![TermSize::new(120, 40)]);
    }

    #[tokio::test]
    async fn resize_unknown_run_is_noop() {
        let (manager, spawner) = manager();
        assert!(!manager.resize("ghost", TermSize::new(100, 30)).unwrap());
        assert!(spawner.spawned().is_empty());
    }

    #[tokio::test]
    async fn remove_by_channel_only_touches_that_channel() {
        let (manager, spawner) = manager();
        let (a, b) = (ChannelId::new(), ChannelId::new());
        for (run, channel) in [("r1", a), ("r2", a), ("r3", b)] {
            let (tx, _rx) = mpsc::unbounded_channel();
            manager.create(run, channel, TermSize::default(), tx).unwrap();
        }

        assert_eq!(manager.remove_by_channel(a), 2);
        assert!(manager.lookup("r1").is_none());
        assert!(manager.lookup("r2").is_none());
        assert!(manager.lookup("r3").is_some());

        let processes = spawner.spawned();
        assert!(processes[0].killed());
        assert!(processes[1].killed());
        assert!(!processes[2].killed());
    }

    #[tokio::test]
    async fn remove_by_run_id_kills_process() {
        let (manager, spawner) = manager();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager
            .create("r1", ChannelId::new(), TermSize::default(), tx)
            .unwrap();

        let removed = manager.remove_by_run_id("r1").unwrap();
        assert_eq!(removed.run_id, "r1");
        assert!(spawner.last().unwrap().killed());
        assert!(manager.remove_by_run_id("r1").is_none());
    }

    #[tokio::test]
    async fn spawn_failure_registers_nothing() {
        let (manager, spawner) = manager();
        spawner.fail_next();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = manager
            .create("r1", ChannelId::new(), TermSize::default(), tx)
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::Spawn(_)));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn run_lock_is_shared_per_run() {
        let (manager, _) = manager();
        let first = manager.run_lock("r1");
        let second = manager.run_lock("r1");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &manager.run_lock("r2")));

        let _guard = first.lock().await;
        assert!(second.try_lock().is_err());
    }
}
