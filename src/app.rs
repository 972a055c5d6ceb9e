use std::sync::Arc;

use crate::blockchain::Blockchain;
use crate::config::Config;
use crate::miner::Miners;
use crate::realtime::{ConnectionRegistry, PresenceService, StateBroadcaster};
use crate::store::{Store, StoreError};

/// Shared handles for the HTTP API and the realtime gateway.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub registry: Arc<ConnectionRegistry>,
    pub states: Arc<StateBroadcaster>,
    pub chain: Arc<Blockchain>,
    pub miners: Arc<Miners>,
    pub presence: Arc<PresenceService>,
}

impl AppState {
    /// Wire every service together and hydrate the chain from `store`.
    pub async fn build(config: Config, store: Arc<dyn Store>) -> Result<Self, StoreError> {
        let registry = Arc::new(ConnectionRegistry::new());
        let states = Arc::new(StateBroadcaster::new(registry.clone()));
        let chain = Arc::new(
            Blockchain::load(
                store.clone(),
                registry.clone(),
                config.difficulty,
                config.reward,
            )
            .await?,
        );
        let miners = Arc::new(Miners::new(
            store.clone(),
            chain.clone(),
            registry.clone(),
            states.clone(),
            config.fail_notice_interval,
        ));
        let presence = Arc::new(PresenceService::new(
            store.clone(),
            registry.clone(),
            states.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            store,
            registry,
            states,
            chain,
            miners,
            presence,
        })
    }
}
