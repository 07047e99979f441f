//! Dispatches decoded socket messages to sessions and the materializer.

use std::fmt::Display;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::errors::BridgeResult;
use crate::materialize::Materializer;
use crate::protocol::{ClientMessage, RUN_PLAYBOOK};
use crate::pty::{ChannelId, OutputSink, SessionManager, TermSize};

/// One connected socket as the router sees it.
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: ChannelId,
    pub sink: OutputSink,
}

impl Channel {
    pub fn new(sink: OutputSink) -> Self {
        Self {
            id: ChannelId::new(),
            sink,
        }
    }

    /// Report a failure to the terminal.
    pub fn error(&self, err: impl Display) {
        let _ = self.sink.send(format!("Error: {}", err));
    }
}

pub struct CommandRouter {
    sessions: Arc<SessionManager>,
    materializer: Materializer,
    runner: String,
}

impl CommandRouter {
    pub fn new(sessions: Arc<SessionManager>, materializer: Materializer, runner: String) -> Self {
        Self {
            sessions,
            materializer,
            runner,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Handle one text frame. Failures are sent back as `Error: ...`.
    pub async fn handle(&self, channel: &Channel, raw: &str) {
        let message = match ClientMessage::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(channel = %channel.id, error = %e, "rejected message");
                channel.error(&e);
                return;
            }
        };

        debug!(
            channel = %channel.id,
            kind = message.kind(),
            run_id = %message.run_id(),
            "message received"
        );

        if let Err(e) = self.dispatch(channel, message).await {
            warn!(channel = %channel.id, error = %e, "message failed");
            channel.error(&e);
        }
    }

    async fn dispatch(&self, channel: &Channel, message: ClientMessage) -> BridgeResult<()> {
        match message {
            ClientMessage::Init { run_id, size } => {
                self.sessions
                    .create(&run_id, channel.id, size, channel.sink.clone())?;
                Ok(())
            }
            ClientMessage::Resize { run_id, size } => {
                match size {
                    Some(size) if !run_id.is_empty() => {
                        self.sessions.resize(&run_id, size)?;
                    }
                    _ => warn!(run_id = %run_id, "resize without run id or size ignored"),
                }
                Ok(())
            }
            ClientMessage::Command {
                lab,
                run_id,
                command,
                raw,
            } => self.execute(channel, &lab, &run_id, &command, raw).await,
        }
    }

    async fn execute(
        &self,
        channel: &Channel,
        lab: &str,
        run_id: &str,
        command: &str,
        raw: bool,
    ) -> BridgeResult<()> {
        let lock = self.sessions.run_lock(run_id);
        let _guard = lock.lock().await;

        let run = self.materializer.materialize(lab, run_id).await?;

        let session = match self.sessions.lookup(run_id) {
            Some(session) => session,
            None => self.sessions.create(
                run_id,
                channel.id,
                TermSize::default(),
                channel.sink.clone(),
            )?,
        };

        let input = if raw {
            command.to_string()
        } else if command == RUN_PLAYBOOK {
            info!(run_id = %run_id, lab = %lab, hosts = run.hosts, "starting playbook");
            format!("{}\r", run.invocation(&self.runner))
        } else {
            format!("{}\r", command)
        };
        session.write(input.as_bytes())
    }

    /// Tear down everything the channel owned.
    pub fn disconnect(&self, channel: &Channel) {
        let removed = self.sessions.remove_by_channel(channel.id);
        info!(channel = %channel.id, sessions = removed, "channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PlaybookRecord, SystemRecord};
    use crate::pty::testing::RecordingSpawner;
    use crate::store::Store;
    use chrono::Utc;
    use labrun_vault::Vault;
    use tokio::sync::mpsc;

    struct Harness {
        router: CommandRouter,
        spawner: Arc<RecordingSpawner>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        store
            .create_system(&SystemRecord {
                id: "s1".into(),
                lab: "A".into(),
                address: "10.0.0.1".into(),
            })
            .unwrap();
        store
            .create_playbook(&PlaybookRecord {
                id: "p1".into(),
                name: "ping".into(),
                content: "- hosts: all\n".into(),
                created_at: Utc::now(),
            })
            .unwrap();
        let vault = Arc::new(Vault::from_secret("router-tests").unwrap());
        let materializer = Materializer::new(dir.path().to_path_buf(), Arc::new(store), vault);

        let spawner = Arc::new(RecordingSpawner::default());
        let sessions = Arc::new(SessionManager::new(spawner.clone()));
        Harness {
            router: CommandRouter::new(sessions, materializer, "ansible-playbook".into()),
            spawner,
            _dir: dir,
        }
    }

    fn channel() -> (Channel, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Channel::new(tx), rx)
    }

    fn command(run_id: &str, lab: &str, command: &str, raw: bool) -> String {
        serde_json::json!({
            "type": "command",
            "lab": lab,
            "playbookID": run_id,
            "command": command,
            "isRawInput": raw,
        })
        .to_string()
    }

    #[tokio::test]
    async fn line_and_raw_input() {
        let h = harness();
        let (ch, mut rx) = channel();

        h.router.handle(&ch, &command("p1", "A", "ls", false)).await;
        h.router.handle(&ch, &command("p1", "A", "l", true)).await;

        let spawned = h.spawner.spawned();
        assert_eq!(spawned.len(), 1, "command reuses the session it created");
        assert_eq!(spawned[0].writes(), vec![b"ls\r".to_vec(), b"l".to_vec()]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_playbook_writes_runner_invocation() {
        let h = harness();
        let (ch, _rx) = channel();

        h.router.handle(&ch, &command("p1", "A", RUN_PLAYBOOK, false)).await;

        let input = h.spawner.last().unwrap().input();
        assert!(input.starts_with("ansible-playbook -i "));
        assert!(input.contains("runs/p1/inventory.yaml"));
        assert!(input.contains("runs/p1/playbook.yaml"));
        assert!(input.ends_with("StrictHostKeyChecking=no\"'\r"));
    }

    #[tokio::test]
    async fn materialization_failure_leaves_shell_untouched() {
        let h = harness();
        let (ch, mut rx) = channel();

        h.router
            .handle(&ch, r#"{"type":"init","playbookID":"p1"}"#)
            .await;
        h.router.handle(&ch, &command("p1", "nope", "ls", false)).await;
        assert_eq!(rx.recv().await.unwrap(), "Error: no systems found for lab nope");

        h.router.handle(&ch, &command("p2", "A", "ls", false)).await;
        assert_eq!(rx.recv().await.unwrap(), "Error: Playbook not found: p2");

        h.router.handle(&ch, &command("", "A", "ls", false)).await;
        assert_eq!(rx.recv().await.unwrap(), "Error: Playbook ID is required");

        let spawned = h.spawner.spawned();
        assert_eq!(spawned.len(), 1);
        assert!(spawned[0].writes().is_empty());
    }

    #[tokio::test]
    async fn commands_for_one_run_wait_for_the_run_lock() {
        let Harness {
            router,
            spawner,
            _dir,
        } = harness();
        let router = Arc::new(router);
        let (ch, _rx) = channel();

        let lock = router.sessions().run_lock("p1");
        let guard = lock.lock().await;

        let task = {
            let router = router.clone();
            let ch = ch.clone();
            tokio::spawn(async move {
                router.handle(&ch, &command("p1", "A", "ls", false)).await;
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(spawner.spawned().is_empty());
        assert!(!task.is_finished());

        drop(guard);
        task.await.unwrap();
        assert_eq!(spawner.last().unwrap().writes(), vec![b"ls\r".to_vec()]);
    }

    #[tokio::test]
    async fn write_failure_is_reported_once() {
        let h = harness();
        let (ch, mut rx) = channel();

        h.router
            .handle(&ch, r#"{"type":"init","playbookID":"p1"}"#)
            .await;
        h.spawner.last().unwrap().fail_writes();

        h.router.handle(&ch, &command("p1", "A", "ls", false)).await;
        assert_eq!(
            rx.recv().await.unwrap(),
            "Error: failed to write to terminal: PTY input channel closed"
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(h.spawner.spawned().len(), 1);
        assert!(h.router.sessions().lookup("p1").is_some());
    }

    #[tokio::test]
    async fn repeated_init_keeps_one_session() {
        let h = harness();
        let (ch, _rx) = channel();
        for _ in 0..3 {
            h.router
                .handle(&ch, r#"{"type":"init","playbookID":"p1","size":{"cols":100,"rows":30}}"#)
                .await;
        }

        assert_eq!(h.router.sessions().len(), 1);
        let spawned = h.spawner.spawned();
        assert!(spawned[..2].iter().all(|p| p.killed()));
        assert!(!spawned[2].killed());
        assert_eq!(spawned[2].size, TermSize::new(100, 30));
    }

    #[tokio::test]
    async fn resize_of_unknown_run_is_silent() {
        let h = harness();
        let (ch, mut rx) = channel();
        h.router
            .handle(&ch, r#"{"type":"resize","playbookID":"ghost","size":{"cols":90,"rows":20}}"#)
            .await;
        h.router
            .handle(&ch, r#"{"type":"resize","playbookID":"ghost"}"#)
            .await;
        assert!(rx.try_recv().is_err());
        assert!(h.spawner.spawned().is_empty());
    }

    #[tokio::test]
    async fn bad_frames_are_reported_and_channel_survives() {
        let h = harness();
        let (ch, mut rx) = channel();

        h.router.handle(&ch, "{").await;
        assert!(rx.recv().await.unwrap().starts_with("Error: Invalid message"));

        h.router.handle(&ch, r#"{"type":"reboot"}"#).await;
        assert_eq!(rx.recv().await.unwrap(), "Error: Unknown message type: reboot");

        h.router.handle(&ch, &command("p1", "A", "ls", false)).await;
        assert_eq!(h.spawner.last().unwrap().input(), "ls\r");
    }

    #[tokio::test]
    async fn disconnect_kills_owned_sessions() {
        let h = harness();
        let (mine, _rx1) = channel();
        let (theirs, _rx2) = channel();

        h.router
            .handle(&mine, r#"{"type":"init","playbookID":"p1"}"#)
            .await;
        h.router
            .handle(&theirs, r#"{"type":"init","playbookID":"p2"}"#)
            .await;

        h.router.disconnect(&mine);

        assert!(h.router.sessions().lookup("p1").is_none());
        assert!(h.router.sessions().lookup("p2").is_some());
        let spawned = h.spawner.spawned();
        assert!(spawned[0].killed());
        assert!(!spawned[1].killed());
    }
}
