//! Writes the per-run inventory and playbook files the runner consumes.
//!
//! Every run gets its own directory under `<artifact_dir>/runs/<run_id>/`, so
//! concurrent runs never overwrite each other's configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use labrun_vault::Vault;
use tracing::{debug, info};

use crate::errors::{BridgeError, BridgeResult, StoreError};
use crate::inventory::Inventory;
use crate::models::{LabLogin, ALL_LABS};
use crate::store::Store;

pub const INVENTORY_FILE: &str = "inventory.yaml";
pub const PLAYBOOK_FILE: &str = "playbook.yaml";

const MAX_RUN_ID_LEN: usize = 200;

/// Paths of the files written for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedRun {
    pub inventory_path: PathBuf,
    pub playbook_path: PathBuf,
    pub hosts: usize,
}

impl MaterializedRun {
    /// Shell command line that runs the playbook against the inventory.
    pub fn invocation(&self, runner: &str) -> String {
        format!(
            "{} -i {} {} -e 'ansible_ssh_common_args=\"-o StrictHostKeyChecking=no\"'",
            runner,
            shell_quote(&self.inventory_path),
            shell_quote(&self.playbook_path)
        )
    }
}

pub struct Materializer {
    artifact_dir: PathBuf,
    store: Arc<Store>,
    vault: Arc<Vault>,
}

impl Materializer {
    pub fn new(artifact_dir: PathBuf, store: Arc<Store>, vault: Arc<Vault>) -> Self {
        Self {
            artifact_dir,
            store,
            vault,
        }
    }

    /// Directory holding the artifacts of `run_id`.
    pub fn run_dir(&self, run_id: &str) -> BridgeResult<PathBuf> {
        validate_run_id(run_id)?;
        Ok(self.artifact_dir.join("runs").join(run_id))
    }

    /// Refresh the inventory and playbook files for a run.
    ///
    /// Nothing is written unless every lookup succeeds first.
    pub async fn materialize(&self, lab: &str, run_id: &str) -> BridgeResult<MaterializedRun> {
        let dir = self.run_dir(run_id)?;

        let systems = {
            let lab = lab.to_string();
            self.store
                .blocking(move |store| {
                    if lab == ALL_LABS {
                        store.list_systems()
                    } else {
                        store.systems_by_lab(&lab)
                    }
                })
                .await?
        };
        if systems.is_empty() && lab != ALL_LABS {
            return Err(BridgeError::UnknownLab(lab.to_string()));
        }

        let credentials = self.store.blocking(|store| store.list_credentials()).await?;
        let logins = credentials
            .into_iter()
            .filter(|credential| systems.iter().any(|s| s.lab == credential.lab))
            .map(|credential| -> BridgeResult<LabLogin> {
                let password =
                    self.vault
                        .open(&credential.password)
                        .map_err(|source| BridgeError::Credential {
                            lab: credential.lab.clone(),
                            source,
                        })?;
                Ok(LabLogin {
                    lab: credential.lab,
                    username: credential.username,
                    password,
                })
            })
            .collect::<BridgeResult<Vec<_>>>()?;

        let inventory = Inventory::build(&systems, &logins);
        let inventory_yaml = inventory.to_yaml()?;

        let playbook = {
            let id = run_id.to_string();
            self.store
                .blocking(move |store| store.get_playbook(&id))
                .await
                .map_err(|e| match e {
                    StoreError::NotFound(_) => BridgeError::PlaybookNotFound(run_id.to_string()),
                    other => BridgeError::Store(other),
                })?
        };

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| BridgeError::WriteArtifact {
                what: "run",
                path: dir.clone(),
                source,
            })?;

        let inventory_path = dir.join(INVENTORY_FILE);
        write_artifact("inventory", &inventory_path, inventory_yaml.as_bytes()).await?;

        let playbook_path = dir.join(PLAYBOOK_FILE);
        write_artifact("playbook", &playbook_path, playbook.content.as_bytes()).await?;

        info!(
            run_id = %run_id,
            lab = %lab,
            hosts = inventory.len(),
            dir = %dir.display(),
            "materialized run configuration"
        );

        Ok(MaterializedRun {
            inventory_path,
            playbook_path,
            hosts: inventory.len(),
        })
    }
}

async fn write_artifact(what: &'static str, path: &Path, contents: &[u8]) -> BridgeResult<()> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|source| BridgeError::WriteArtifact {
            what,
            path: path.to_path_buf(),
            source,
        })?;
    debug!(path = %path.display(), bytes = contents.len(), "wrote {} file", what);
    Ok(())
}

/// Run ids name a directory, so anything that could escape it is refused.
pub fn validate_run_id(run_id: &str) -> BridgeResult<()> {
    if run_id.is_empty() {
        return Err(BridgeError::MissingRunId);
    }
    let invalid = run_id.len() > MAX_RUN_ID_LEN
        || run_id == "."
        || run_id == ".."
        || run_id
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control());
    if invalid {
        return Err(BridgeError::InvalidRunId(run_id.to_string()));
    }
    Ok(())
}

fn shell_quote(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let safe = !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:@%+=,".contains(c));
    if safe {
        raw.into_owned()
    } else {
        format!("'{}'", raw.replace('\'', r"'\''"))
    }
}
