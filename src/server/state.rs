use axum::extract::FromRef;

use crate::ingestion::IngestionCoordinator;
use std::sync::Arc;
use std::time::Instant;

use super::ServerConfig;

pub type GuardedCoordinator = Arc<IngestionCoordinator>;

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub coordinator: GuardedCoordinator,
    pub hash: String,
}

impl ServerState {
    pub fn new(config: ServerConfig, coordinator: GuardedCoordinator) -> Self {
        Self {
            config,
            start_time: Instant::now(),
            coordinator,
            hash: env!("GIT_HASH").to_string(),
        }
    }
}

impl FromRef<ServerState> for GuardedCoordinator {
    fn from_ref(input: &ServerState) -> Self {
        input.coordinator.clone()
    }
}

impl FromRef<ServerState> for ServerConfig {
    fn from_ref(input: &ServerState) -> Self {
        input.config.clone()
    }
}
