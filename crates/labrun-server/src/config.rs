use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use axum::http::{HeaderValue, Method};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

pub const DEFAULT_BIND: &str = "127.0.0.1:3000";
pub const DEFAULT_DATABASE: &str = "labrun.db";
pub const DEFAULT_RUNNER: &str = "ansible-playbook";

/// Settings the server needs once command-line parsing is done.
#[derive(Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub database: PathBuf,
    /// Root under which `runs/<run_id>/` directories are written.
    pub artifact_dir: PathBuf,
    pub encryption_key: String,
    /// Shell for new terminals; resolved from the environment when unset.
    pub shell: Option<String>,
    pub runner: String,
    /// Browser origins allowed by CORS. `*` allows any.
    pub allow_origins: Vec<String>,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind", &self.bind)
            .field("database", &self.database)
            .field("artifact_dir", &self.artifact_dir)
            .field("encryption_key", &"<redacted>")
            .field("shell", &self.shell)
            .field("runner", &self.runner)
            .field("allow_origins", &self.allow_origins)
            .finish()
    }
}

impl ServerConfig {
    pub fn cors_layer(&self) -> anyhow::Result<CorsLayer> {
        let methods = [
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ];

        if self.allow_origins.is_empty() || self.allow_origins.iter().any(|o| o == "*") {
            return Ok(CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(methods)
                .allow_headers(Any));
        }

        let origins = self
            .allow_origins
            .iter()
            .map(|origin| {
                HeaderValue::from_str(origin)
                    .map_err(|_| anyhow::anyhow!("invalid allowed origin: {origin}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(methods)
            .allow_headers(Any))
    }
}
