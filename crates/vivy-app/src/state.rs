//! Composition root: data directory, database, and the session service wiring.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::task::JoinHandle;
use vivy_core::{
    Collaborators, LifecycleConfig, ServerConfig, SessionHandle, SessionService, SnapshotStore,
};
use vivy_db::SqliteStore;
use vivy_remote::{SshClientFactory, TmuxHelper};

pub struct AppState {
    pub home: PathBuf,
    pub store: SqliteStore,
    pub config: LifecycleConfig,
    pub device_id: String,
}

impl AppState {
    /// Set up `home` (default `~/.vivy`) and open `vivy.db` inside it.
    pub fn open(home: Option<PathBuf>) -> Result<Self> {
        let home = match home {
            Some(dir) => dir,
            None => dirs::home_dir()
                .ok_or_else(|| anyhow!("could not determine home directory"))?
                .join(".vivy"),
        };
        std::fs::create_dir_all(home.join("ctl"))
            .with_context(|| format!("failed to create {}", home.display()))?;

        let conn = vivy_db::open(&home.join("vivy.db")).context("failed to open database")?;
        let config = vivy_db::load_lifecycle_config(&conn)?;
        let device_id = vivy_db::device::device_id(&conn)?;
        log::debug!("data directory {}, device {device_id}", home.display());

        Ok(Self {
            home,
            store: SqliteStore::new(conn),
            config,
            device_id,
        })
    }

    pub fn control_dir(&self) -> PathBuf {
        self.home.join("ctl")
    }

    pub fn servers(&self) -> Result<Vec<ServerConfig>> {
        Ok(vivy_db::servers::list_servers(&*self.store.lock()?)?)
    }

    pub fn find_server(&self, name_or_id: &str) -> Result<ServerConfig> {
        vivy_db::servers::find_server(&*self.store.lock()?, name_or_id)?
            .ok_or_else(|| anyhow!("no server named '{name_or_id}'"))
    }

    /// Start the session service over the saved servers and terminals.
    ///
    /// `servers` replaces the stored configuration for matching ids, which
    /// lets a command override settings for one run without saving them.
    pub fn spawn_service(
        &self,
        overrides: Vec<ServerConfig>,
    ) -> Result<(SessionHandle, JoinHandle<()>)> {
        let mut servers = self.servers()?;
        for server in overrides {
            match servers.iter_mut().find(|s| s.id == server.id) {
                Some(slot) => *slot = server,
                None => servers.push(server),
            }
        }
        let snapshot = self.store.load()?;
        let store = Arc::new(self.store.clone());
        let collaborators = Collaborators {
            factory: Arc::new(SshClientFactory::new(self.control_dir())),
            multiplexer: Arc::new(TmuxHelper::new(self.config.session_prefix.clone())),
            snapshot_store: store.clone(),
            server_store: store,
            device_id: self.device_id.clone(),
            servers,
        };
        Ok(SessionService::spawn(collaborators, self.config.clone(), snapshot))
    }
}

pub fn display_path(path: &Path) -> String {
    match dirs::home_dir().and_then(|home| path.strip_prefix(home).ok().map(Path::to_path_buf)) {
        Some(rest) => format!("~/{}", rest.display()),
        None => path.display().to_string(),
    }
}
