use std::sync::Arc;
use std::time::Duration;

use mw_core::{Announcer, Config, LivenessReader};
use mw_events::LocalBus;
use mw_kernel::Kernel;
use tokio_util::sync::CancellationToken;

/// Shared handles every request sees. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    kernel: Arc<Kernel>,
    bus: Arc<LocalBus>,
    announcer: Arc<Announcer>,
    liveness: LivenessReader,
    config: Arc<Config>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(kernel: Kernel, bus: LocalBus, config: Config) -> Self {
        let kernel = Arc::new(kernel);
        let bus = Arc::new(bus);
        let announcer = Arc::new(Announcer::new(
            bus.clone(),
            Duration::from_secs(config.notify.cooldown_secs),
        ));
        let liveness = LivenessReader::new(kernel.clone(), config.liveness.stale_after());
        Self {
            kernel,
            bus,
            announcer,
            liveness,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn bus(&self) -> &Arc<LocalBus> {
        &self.bus
    }

    pub fn announcer(&self) -> &Announcer {
        &self.announcer
    }

    pub fn liveness(&self) -> &LivenessReader {
        &self.liveness
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Parent token for every streaming session; cancelled on shutdown.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}
