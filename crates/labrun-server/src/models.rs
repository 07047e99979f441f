//! Record types persisted by the store and exchanged over the REST API.

use chrono::{DateTime, Utc};
use labrun_vault::SealedSecret;
use serde::{Deserialize, Serialize};

/// Lab name meaning "every system regardless of lab".
pub const ALL_LABS: &str = "all";

/// A target host belonging to a lab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemRecord {
    pub id: String,
    pub lab: String,
    pub address: String,
}

/// Login for every host of one lab. The password is always sealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: String,
    pub lab: String,
    pub username: String,
    pub password: SealedSecret,
}

/// An automation script, keyed by the run identifier the terminal uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybookRecord {
    pub id: String,
    pub name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A credential after its password has been opened with the vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabLogin {
    pub lab: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSystemRequest {
    pub lab: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpsertSystemRequest {
    pub id: String,
    pub lab: String,
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialRequest {
    pub id: Option<String>,
    pub lab: String,
    pub username: String,
    /// Plaintext on the wire; sealed before it reaches the store.
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaybookRequest {
    pub id: String,
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteByIdRequest {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteByLabRequest {
    pub lab: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub sessions: usize,
}
