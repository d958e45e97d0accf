pub mod config;
pub mod error;
pub mod hub;
pub mod routes;

use std::sync::Arc;

use config::Config;
use hub::coordinator::HubHandle;
use hub::registry::ConnectionRegistry;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ConnectionRegistry>,
    pub hub: HubHandle,
}
