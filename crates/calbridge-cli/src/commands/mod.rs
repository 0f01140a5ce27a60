pub mod auth;
pub mod config;
pub mod sync;
pub mod task;

use std::sync::Arc;

use calbridge_core::integrations::ClientCredentials;
use calbridge_core::{Config, GoogleCalendarClient, SqliteStore, SyncEngine};

pub type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Everything a command needs to talk to the store and the provider.
pub struct Context {
    pub config: Config,
    pub store: Arc<SqliteStore>,
    pub engine: SyncEngine,
}

impl Context {
    /// Load config, open the database and build an engine over the Google
    /// client. Fails when no OAuth client credentials are configured.
    pub fn open() -> Result<Self, Box<dyn std::error::Error>> {
        let config = Config::load()?;
        let store = Arc::new(SqliteStore::open()?);
        let credentials = ClientCredentials::load()
            .map_err(|e| format!("{e} (run `calbridge auth credentials` first)"))?;
        let provider = Arc::new(GoogleCalendarClient::new(
            &config.google,
            credentials,
            config.sync.page_size,
        ));
        let engine = SyncEngine::new(&config.sync, store.clone(), provider);
        Ok(Self {
            config,
            store,
            engine,
        })
    }
}

/// Runtime for commands that drive the async engine.
pub fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread().enable_all().build()
}
