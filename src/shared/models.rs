use std::sync::Arc;
use std::time::Instant;

use crate::config::AgentConfig;
use crate::docker::{RuntimeClient, VolumeManager};
use crate::logbuf::LogBuffers;
use crate::state::StateStore;

/// Process-wide shared state. One instance is built at startup and handed
/// to every handler and session as `Arc<AppState>`.
pub struct AppState {
    pub config: AgentConfig,
    pub docker: RuntimeClient,
    pub states: StateStore,
    pub volumes: VolumeManager,
    pub log_buffers: LogBuffers,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: AgentConfig,
        docker: RuntimeClient,
        states: StateStore,
        volumes: VolumeManager,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            docker,
            states,
            volumes,
            log_buffers: LogBuffers::new(),
            started_at: Instant::now(),
        })
    }
}
