use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use vivy_core::config::SETTING_PREFIX;
use vivy_core::{
    LifecycleConfig, ServerId, ServerStore, ServiceError, Snapshot, SnapshotStore, SNAPSHOT_KEY,
};

use crate::{servers, settings};

/// Shared SQLite connection backing the lifecycle's storage collaborators.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>, ServiceError> {
        self.conn
            .lock()
            .map_err(|_| ServiceError::Storage("database lock poisoned".into()))
    }
}

fn storage(e: impl std::fmt::Display) -> ServiceError {
    ServiceError::Storage(e.to_string())
}

impl SnapshotStore for SqliteStore {
    fn load(&self) -> Result<Option<Snapshot>, ServiceError> {
        let conn = self.lock()?;
        let Some(json) = settings::get(&conn, SNAPSHOT_KEY).map_err(storage)? else {
            return Ok(None);
        };
        match Snapshot::from_json(&json) {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                log::warn!("discarding unreadable terminal snapshot: {e}");
                Ok(None)
            }
        }
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), ServiceError> {
        let json = snapshot.to_json().map_err(storage)?;
        let conn = self.lock()?;
        settings::set(&conn, SNAPSHOT_KEY, &json).map_err(storage)
    }
}

impl ServerStore for SqliteStore {
    fn remember_session(&self, server: ServerId, name: Option<&str>) -> Result<(), ServiceError> {
        let conn = self.lock()?;
        if !servers::set_remembered_session(&conn, server, name).map_err(storage)? {
            return Err(ServiceError::UnknownServer(server));
        }
        Ok(())
    }
}

/// Defaults overlaid with any `lifecycle.*` rows from the settings table.
pub fn load_lifecycle_config(conn: &Connection) -> rusqlite::Result<LifecycleConfig> {
    let mut config = LifecycleConfig::default();
    for (key, value) in settings::list_prefixed(conn, SETTING_PREFIX)? {
        if !config.apply_setting(&key, &value) {
            log::warn!("ignoring setting {key}={value}");
        }
    }
    Ok(config)
}
