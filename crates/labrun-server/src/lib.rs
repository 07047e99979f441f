//! Lab automation bridge.
//!
//! Browser terminals connect over a WebSocket, pick a lab and a playbook, and
//! watch the playbook run inside a server-side pseudo-terminal. Systems,
//! credentials and playbooks are managed through a small REST API.

pub mod api;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod inventory;
pub mod materialize;
pub mod models;
pub mod protocol;
pub mod pty;
pub mod router;
pub mod store;

use std::sync::Arc;

use labrun_vault::Vault;

pub use api::build_router;
pub use config::ServerConfig;

use materialize::Materializer;
use pty::{PtySpawner, SessionManager};
use router::CommandRouter;
use store::Store;

/// Shared handles every route works with.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub vault: Arc<Vault>,
    pub router: Arc<CommandRouter>,
}

impl AppState {
    pub fn new(
        config: &ServerConfig,
        store: Arc<Store>,
        vault: Arc<Vault>,
        spawner: Arc<dyn PtySpawner>,
    ) -> Self {
        let materializer = Materializer::new(
            config.artifact_dir.clone(),
            Arc::clone(&store),
            Arc::clone(&vault),
        );
        let sessions = Arc::new(SessionManager::new(spawner));
        let router = Arc::new(CommandRouter::new(
            sessions,
            materializer,
            config.runner.clone(),
        ));
        Self {
            store,
            vault,
            router,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        self.router.sessions()
    }
}
