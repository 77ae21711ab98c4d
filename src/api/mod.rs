pub mod error;
mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::config::Settings;
use crate::download::Downloader;
use crate::ssh::SshRegistry;

use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub ssh: SshRegistry,
    /// Pull downloaders keyed by SSH client id; created when the SSH
    /// session attaches and kept for the client entry's lifetime.
    pub downloaders: Arc<RwLock<HashMap<String, Arc<dyn Downloader>>>>,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Arc::new(settings),
            ssh: SshRegistry::new(),
            downloaders: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/shell/local", get(local_shell))
        .route("/shell/local/download", get(local_download))
        .route("/shell/ssh", post(ssh_login))
        .route("/shell/ssh/:id", get(ssh_shell))
        .route("/shell/ssh/:id/download", get(ssh_download))
        // The session protocol carries no browser credentials; origins are
        // left open just like the upgrade check in the original deployment.
        .layer(CorsLayer::permissive())
        .with_state(state)
}
