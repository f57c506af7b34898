//! The root object: every process-wide singleton, explicitly constructed and
//! threaded through to the two endpoints instead of living as global state.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::available_sessions::AvailableWorkerSessions;
use crate::broker::BrokerRegistry;
use crate::config::Config;
use crate::id::IdGenerator;
use crate::pool::WorkerPool;
use crate::supervisor::SupervisorLink;

/// Everything a request handler needs, bundled for cheap `Arc` cloning into
/// `axum` handler closures.
pub struct AppContext {
    pub config: Config,
    pub registry: BrokerRegistry,
    pub pool: WorkerPool,
    pub available_sessions: AvailableWorkerSessions,
    pub ids: IdGenerator,
    pub supervisor: Arc<SupervisorLink>,
    pub cancel: CancellationToken,
}

impl AppContext {
    pub fn new(config: Config, supervisor: Arc<SupervisorLink>, cancel: CancellationToken) -> Self {
        let numprespawns = config.numprespawns;
        Self {
            config,
            registry: BrokerRegistry::new(),
            pool: WorkerPool::new(
                numprespawns,
                Duration::from_secs(crate::config::DEFAULT_ACQUIRE_TIMEOUT_SECS),
                supervisor.clone(),
            ),
            available_sessions: AvailableWorkerSessions::new(),
            ids: IdGenerator::new(),
            supervisor,
            cancel,
        }
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext").field("config", &self.config).finish_non_exhaustive()
    }
}
