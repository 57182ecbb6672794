use std::sync::Arc;
use tracing::info;

use crate::config::Settings;
use crate::core::driver::Connector;
use crate::core::pool::{PoolConfig, PoolManager};
use crate::core::tasks::TaskService;
use crate::errors::Result;
use crate::events::{AdapterRegistry, EventBus, SubscriptionStore, WebhookConfig, WebhookDispatcher};
use crate::migration::{MigrationFlags, MigrationService};
use crate::orchestrator::NodeOrchestrator;
use crate::scheduler::HostRegistry;
use crate::store::RecordStore;

/// The wired-up orchestration core. Constructed once at process start; the
/// REST layer (out of scope here) talks to the fleet through these handles.
pub struct ControlPlane {
    pub store: Arc<RecordStore>,
    pub pools: Arc<PoolManager>,
    pub tasks: Arc<TaskService>,
    pub events: Arc<EventBus>,
    pub subscriptions: Arc<SubscriptionStore>,
    pub webhooks: Arc<WebhookDispatcher>,
    pub registry: Arc<HostRegistry>,
    pub migrations: Arc<MigrationService>,
    pub orchestrator: Arc<NodeOrchestrator>,
}

impl ControlPlane {
    /// Build every component against the given settings and connector.
    pub fn build(settings: &Settings, connector: Arc<dyn Connector>) -> Result<Self> {
        let store = Arc::new(RecordStore::open(&settings.state_dir.join("aviary.redb"))?);
        let pools = Arc::new(PoolManager::new(connector, PoolConfig::from(&settings.pool)));

        let subscriptions = Arc::new(SubscriptionStore::new(Arc::clone(&store))?);
        let adapters = Arc::new(AdapterRegistry::new());
        let webhooks = Arc::new(WebhookDispatcher::new(
            Arc::clone(&subscriptions),
            adapters,
            Arc::clone(&store),
            WebhookConfig::from(&settings.webhooks),
        )?);
        let events = Arc::new(EventBus::with_webhooks(Arc::clone(&webhooks)));

        let tasks = Arc::new(TaskService::new(Arc::clone(&store))?);
        let registry = Arc::new(HostRegistry::new(
            Arc::clone(&store),
            Arc::clone(&pools),
            Arc::clone(&events),
        )?);
        let migrations = Arc::new(MigrationService::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&pools),
            Arc::clone(&tasks),
            Arc::clone(&events),
            MigrationFlags::from_settings(&settings.migration),
        )?);
        let orchestrator = Arc::new(NodeOrchestrator::new(
            Arc::clone(&tasks),
            Arc::clone(&events),
            Arc::clone(&registry),
            Arc::clone(&pools),
            settings.state_dir.clone(),
            settings.orchestrator.clone(),
        ));

        Ok(Self {
            store,
            pools,
            tasks,
            events,
            subscriptions,
            webhooks,
            registry,
            migrations,
            orchestrator,
        })
    }

    /// Drain background work and release every hypervisor handle.
    pub async fn shutdown(&self) {
        info!("Shutting down: draining background work");
        self.tasks.drain().await;
        self.webhooks.drain().await;
        self.pools.close_all().await;
        info!("Shutdown complete");
    }
}
