//! Engine wiring for the HTTP process.
//!
//! Every configured channel gets an in-memory connector, so the API runs
//! standalone; real connectors attach through the same builder.

use std::collections::BTreeMap;
use std::sync::Arc;

use stocksync_channels::InMemoryConnector;
use stocksync_core::{ChannelId, EngineResult};
use stocksync_engine::{EngineConfig, SyncEvent, SyncService};
use stocksync_events::{EventEnvelope, InMemoryEventBus};

pub type SyncEventBus = InMemoryEventBus<EventEnvelope<SyncEvent>>;

pub struct AppServices {
    pub sync: Arc<SyncService>,
    pub event_bus: Arc<SyncEventBus>,
    pub connectors: BTreeMap<ChannelId, Arc<InMemoryConnector>>,
}

impl AppServices {
    pub fn connector(&self, channel_id: &str) -> Option<&Arc<InMemoryConnector>> {
        self.connectors.get(&ChannelId::new(channel_id))
    }
}

/// Build the sync service for `config` and announce its channels.
pub fn build_services(config: EngineConfig) -> EngineResult<AppServices> {
    let event_bus: Arc<SyncEventBus> = Arc::new(InMemoryEventBus::new());

    let mut connectors = BTreeMap::new();
    let mut builder = SyncService::builder(config.clone()).events(event_bus.clone());
    for channel in &config.channels {
        let connector = Arc::new(InMemoryConnector::new(channel.id.as_str()));
        builder = builder.connector(channel.id.as_str(), connector.clone());
        connectors.insert(channel.id.clone(), connector);
    }

    let sync = Arc::new(builder.build()?);
    sync.initialize()?;
    tracing::info!(channels = connectors.len(), "sync services ready");

    Ok(AppServices {
        sync,
        event_bus,
        connectors,
    })
}
