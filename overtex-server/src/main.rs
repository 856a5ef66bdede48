//! Overtex collaboration server.
//!
//! Serves live editing sessions for the projects under
//! `OVERTEX_PROJECTS_ROOT`; see [`config::Config`] for the environment it
//! reads.

mod config;

use std::sync::Arc;

use log::info;
use overtex_collab::hydration::DiskFileStore;
use overtex_collab::server::{Collaborators, SyncServer};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = Config::from_env()?;
    info!(
        "Starting Overtex sync server on {} (projects: {}, persistence: {})",
        config.server.bind_addr,
        config.projects_root.display(),
        config
            .server
            .storage_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "off".to_string())
    );

    let auth = Arc::new(config.auth());
    let collaborators = Collaborators {
        verifier: auth.clone(),
        resolver: auth,
        files: Arc::new(DiskFileStore),
    };

    let server = Arc::new(SyncServer::new(config.server, collaborators)?);
    server.run().await
}
