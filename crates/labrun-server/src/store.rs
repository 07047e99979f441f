//! SQLite-backed record store for systems, credentials and playbooks.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use labrun_vault::SealedSecret;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::errors::{StoreError, StoreResult};
use crate::models::{CredentialRecord, PlaybookRecord, SystemRecord};

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "opened record store");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Run a store operation on the blocking pool.
    pub async fn blocking<T, F>(self: &Arc<Self>, op: F) -> StoreResult<T>
    where
        F: FnOnce(&Store) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    fn migrate(&self) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            create table if not exists systems (
              id text primary key,
              lab text not null,
              address text not null
            );
            create index if not exists systems_lab on systems(lab);

            create table if not exists credentials (
              id text primary key,
              lab text not null unique,
              username text not null,
              password_iv text not null,
              password_ciphertext text not null
            );

            create table if not exists playbooks (
              id text primary key,
              name text not null,
              content text not null,
              created_at text not null
            );
            "#,
        )?;
        Ok(())
    }

    // ---------------- systems ----------------

    pub fn list_systems(&self) -> StoreResult<Vec<SystemRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("select id, lab, address from systems order by rowid")?;
        let rows = stmt.query_map([], system_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn systems_by_lab(&self, lab: &str) -> StoreResult<Vec<SystemRecord>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("select id, lab, address from systems where lab = ?1 order by rowid")?;
        let rows = stmt.query_map(params![lab], system_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_system(&self, id: &str) -> StoreResult<SystemRecord> {
        let conn = self.conn.lock();
        conn.query_row(
            "select id, lab, address from systems where id = ?1",
            params![id],
            system_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("system {}", id)))
    }

    pub fn create_system(&self, system: &SystemRecord) -> StoreResult<SystemRecord> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "insert or ignore into systems (id, lab, address) values (?1, ?2, ?3)",
            params![system.id, system.lab, system.address],
        )?;
        if inserted == 0 {
            return Err(StoreError::Conflict(format!("system {}", system.id)));
        }
        debug!(id = %system.id, lab = %system.lab, "system created");
        Ok(system.clone())
    }

    /// Update a system in place, creating it when the id is unknown.
    pub fn upsert_system(&self, system: &SystemRecord) -> StoreResult<SystemRecord> {
        let conn = self.conn.lock();
        conn.execute(
            "insert into systems (id, lab, address) values (?1, ?2, ?3)
             on conflict(id) do update set lab = excluded.lab, address = excluded.address",
            params![system.id, system.lab, system.address],
        )?;
        Ok(system.clone())
    }

    pub fn delete_system(&self, id: &str) -> StoreResult<SystemRecord> {
        let existing = self.get_system(id)?;
        self.conn
            .lock()
            .execute("delete from systems where id = ?1", params![id])?;
        Ok(existing)
    }

    // ---------------- credentials ----------------

    pub fn list_credentials(&self) -> StoreResult<Vec<CredentialRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "select id, lab, username, password_iv, password_ciphertext
             from credentials order by rowid",
        )?;
        let rows = stmt.query_map([], credential_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_credential_by_lab(&self, lab: &str) -> StoreResult<CredentialRecord> {
        let conn = self.conn.lock();
        conn.query_row(
            "select id, lab, username, password_iv, password_ciphertext
             from credentials where lab = ?1",
            params![lab],
            credential_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("credential for lab {}", lab)))
    }

    pub fn create_credential(&self, credential: &CredentialRecord) -> StoreResult<CredentialRecord> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "insert or ignore into credentials (id, lab, username, password_iv, password_ciphertext)
             values (?1, ?2, ?3, ?4, ?5)",
            params![
                credential.id,
                credential.lab,
                credential.username,
                credential.password.iv,
                credential.password.ciphertext
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Conflict(format!(
                "credential for lab {}",
                credential.lab
            )));
        }
        debug!(lab = %credential.lab, "credential created");
        Ok(credential.clone())
    }

    /// Replace the login of the credential whose lab matches.
    pub fn update_credential(&self, credential: &CredentialRecord) -> StoreResult<CredentialRecord> {
        let updated = self.conn.lock().execute(
            "update credentials set username = ?2, password_iv = ?3, password_ciphertext = ?4
             where lab = ?1",
            params![
                credential.lab,
                credential.username,
                credential.password.iv,
                credential.password.ciphertext
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!(
                "credential for lab {}",
                credential.lab
            )));
        }
        self.get_credential_by_lab(&credential.lab)
    }

    pub fn delete_credential(&self, lab: &str) -> StoreResult<CredentialRecord> {
        let existing = self.get_credential_by_lab(lab)?;
        self.conn
            .lock()
            .execute("delete from credentials where lab = ?1", params![lab])?;
        Ok(existing)
    }

    // ---------------- playbooks ----------------

    pub fn list_playbooks(&self) -> StoreResult<Vec<PlaybookRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("select id, name, content, created_at from playbooks order by created_at")?;
        let parts = stmt
            .query_map([], playbook_row)?
            .collect::<Result<Vec<_>, _>>()?;
        parts.into_iter().map(playbook_from_parts).collect()
    }

    pub fn get_playbook(&self, id: &str) -> StoreResult<PlaybookRecord> {
        let conn = self.conn.lock();
        let parts = conn
            .query_row(
                "select id, name, content, created_at from playbooks where id = ?1",
                params![id],
                playbook_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("playbook {}", id)))?;
        playbook_from_parts(parts)
    }

    pub fn create_playbook(&self, playbook: &PlaybookRecord) -> StoreResult<PlaybookRecord> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "insert or ignore into playbooks (id, name, content, created_at)
             values (?1, ?2, ?3, ?4)",
            params![
                playbook.id,
                playbook.name,
                playbook.content,
                playbook.created_at.to_rfc3339()
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Conflict(format!("playbook {}", playbook.id)));
        }
        debug!(id = %playbook.id, "playbook created");
        Ok(playbook.clone())
    }

    pub fn update_playbook(&self, id: &str, name: &str, content: &str) -> StoreResult<PlaybookRecord> {
        let updated = self.conn.lock().execute(
            "update playbooks set name = ?2, content = ?3 where id = ?1",
            params![id, name, content],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("playbook {}", id)));
        }
        self.get_playbook(id)
    }

    pub fn delete_playbook(&self, id: &str) -> StoreResult<PlaybookRecord> {
        let existing = self.get_playbook(id)?;
        self.conn
            .lock()
            .execute("delete from playbooks where id = ?1", params![id])?;
        Ok(existing)
    }
}

fn system_from_row(row: &Row<'_>) -> rusqlite::Result<SystemRecord> {
    Ok(SystemRecord {
        id: row.get(0)?,
        lab: row.get(1)?,
        address: row.get(2)?,
    })
}

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<CredentialRecord> {
    Ok(CredentialRecord {
        id: row.get(0)?,
        lab: row.get(1)?,
        username: row.get(2)?,
        password: SealedSecret {
            iv: row.get(3)?,
            ciphertext: row.get(4)?,
        },
    })
}

type PlaybookParts = (String, String, String, String);

fn playbook_row(row: &Row<'_>) -> rusqlite::Result<PlaybookParts> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn playbook_from_parts((id, name, content, created_at): PlaybookParts) -> StoreResult<PlaybookRecord> {
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| StoreError::Corrupt(format!("playbook {} created_at: {}", id, e)))?
        .with_timezone(&Utc);
    Ok(PlaybookRecord {
        id,
        name,
        content,
        created_at,
    })
}
