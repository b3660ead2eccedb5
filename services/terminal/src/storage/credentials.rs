//! Network credential store.
//!
//! A tiny key/value table in SQLite. Same durability settings as every other
//! on-device database: WAL, synchronous=FULL, integrity check at open.

use std::path::Path;

use at_protocol::WifiCredentials;
use rusqlite::{Connection, OptionalExtension, params};

const KEY_WIFI_SSID: &str = "wifi_ssid";
const KEY_WIFI_PASSWORD: &str = "wifi_password";

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),
}

pub trait CredentialStore: Send {
    fn load_wifi(&self) -> Result<Option<WifiCredentials>, CredentialError>;

    fn save_wifi(&mut self, creds: &WifiCredentials) -> Result<(), CredentialError>;

    /// Forget everything. Used by factory reset.
    fn clear(&mut self) -> Result<(), CredentialError>;
}

pub struct SqliteCredentialStore {
    conn: Connection,
}

impl SqliteCredentialStore {
    pub fn open(path: &Path) -> Result<Self, CredentialError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            // Connection::open reports the real error if this fails.
            let _ = std::fs::create_dir_all(parent);
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, CredentialError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CredentialError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;",
        )?;
        let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if result != "ok" {
            return Err(CredentialError::IntegrityCheckFailed(result));
        }
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(Self { conn })
    }

    fn get(&self, key: &str) -> Result<Option<String>, CredentialError> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn load_wifi(&self) -> Result<Option<WifiCredentials>, CredentialError> {
        let Some(ssid) = self.get(KEY_WIFI_SSID)? else {
            return Ok(None);
        };
        let password = self.get(KEY_WIFI_PASSWORD)?.unwrap_or_default();
        Ok(Some(WifiCredentials { ssid, password }))
    }

    fn save_wifi(&mut self, creds: &WifiCredentials) -> Result<(), CredentialError> {
        let now = at_protocol::timestamp_now();
        let tx = self.conn.transaction()?;
        for (key, value) in [
            (KEY_WIFI_SSID, creds.ssid.as_str()),
            (KEY_WIFI_PASSWORD, creds.password.as_str()),
        ] {
            tx.execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                updated_at = excluded.updated_at",
                params![key, value, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), CredentialError> {
        self.conn.execute("DELETE FROM settings", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(ssid: &str, password: &str) -> WifiCredentials {
        WifiCredentials {
            ssid: ssid.to_owned(),
            password: password.to_owned(),
        }
    }

    #[test]
    fn empty_store_has_no_wifi() {
        let store = SqliteCredentialStore::open_in_memory().unwrap();
        assert_eq!(store.load_wifi().unwrap(), None);
    }

    #[test]
    fn save_overwrites_previous_credentials() {
        let mut store = SqliteCredentialStore::open_in_memory().unwrap();
        store.save_wifi(&creds("office", "one")).unwrap();
        store.save_wifi(&creds("office-5g", "two")).unwrap();
        assert_eq!(store.load_wifi().unwrap(), Some(creds("office-5g", "two")));
    }

    #[test]
    fn credentials_persist_across_reopen_and_clear_forgets_them() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("credentials.sqlite3");
        {
            let mut store = SqliteCredentialStore::open(&path).unwrap();
            store.save_wifi(&creds("gym", "secret")).unwrap();
        }
        let mut store = SqliteCredentialStore::open(&path).unwrap();
        assert_eq!(store.load_wifi().unwrap(), Some(creds("gym", "secret")));
        store.clear().unwrap();
        assert_eq!(store.load_wifi().unwrap(), None);
    }
}
