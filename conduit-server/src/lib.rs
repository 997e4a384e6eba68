//! OpenAI-compatible HTTP surface. The construction graph is explicit:
//! cache, capability, virtual keys, ledger, billing, router, and pipeline
//! are wired once at startup and passed by reference.

pub mod error_mapper;
pub mod http;
pub mod pipeline;
pub mod realtime_ws;

use conduit_auth::{GroupLedger, RateLimiter, VirtualKeyService};
use conduit_billing::BillingService;
use conduit_cache::{CacheManager, MonitorConfig, RegionConfig, StatsCollector, StatsHealthMonitor};
use conduit_capability::CapabilityService;
use conduit_core::store::GatewayStore;
use conduit_realtime::SessionRegistry;
use conduit_router::{CircuitBreaker, Router as ModelRouter};
use conduit_telemetry::{AlertManager, RequestMetrics, TraceStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn GatewayStore>,
    pub cache: Arc<CacheManager>,
    pub capability: Arc<CapabilityService>,
    pub keys: Arc<VirtualKeyService>,
    pub ledger: Arc<GroupLedger>,
    pub limiter: Arc<RateLimiter>,
    pub billing: Arc<BillingService>,
    pub router: Arc<ModelRouter>,
    pub metrics: RequestMetrics,
    pub traces: Arc<TraceStore>,
    pub alerts: Arc<AlertManager>,
    pub sessions: Arc<SessionRegistry>,
    pub admin_key: Option<String>,
}

impl AppState {
    /// Wire the full graph over a store and an optional distributed cache
    /// tier.
    pub fn build(
        store: Arc<dyn GatewayStore>,
        distributed: Option<Arc<dyn conduit_cache::DistributedCache>>,
    ) -> Self {
        let instance_id = format!("conduit-{}", uuid::Uuid::new_v4().simple());
        let stats = StatsCollector::new(instance_id);
        let cache = CacheManager::new(
            vec![
                RegionConfig::model_capabilities(),
                RegionConfig::new(conduit_cache::regions::PROVIDER_RESPONSES),
                RegionConfig::new(conduit_cache::regions::PROVIDER_HEALTH),
            ],
            distributed,
            stats,
        );
        let capability = CapabilityService::new(Arc::clone(&store), Arc::clone(&cache));
        let keys = VirtualKeyService::new(Arc::clone(&store));
        let ledger = GroupLedger::new(Arc::clone(&store));
        let billing = BillingService::new(Arc::clone(&ledger));
        let router = ModelRouter::new(Arc::clone(&store), Arc::new(CircuitBreaker::default()));

        Self {
            store,
            cache,
            capability,
            keys,
            ledger,
            limiter: Arc::new(RateLimiter::new()),
            billing,
            router,
            metrics: RequestMetrics,
            traces: Arc::new(TraceStore::default()),
            alerts: AlertManager::from_env(),
            sessions: SessionRegistry::new(),
            admin_key: std::env::var("CONDUIT_API_TO_API_BACKEND_AUTH_KEY").ok(),
        }
    }

    /// Spawn the long-running background tasks: cache invalidation and
    /// stats loops, the reservation sweeper, and the statistics health
    /// monitor. All share one shutdown signal.
    pub fn spawn_background(&self, shutdown: CancellationToken) {
        self.cache.spawn_background(shutdown.clone());
        self.ledger.spawn_sweeper(shutdown.clone());
        StatsHealthMonitor::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.alerts),
            MonitorConfig::default(),
        )
        .spawn(shutdown);
    }
}

/// Build the axum application over a wired state.
pub fn build_app(state: AppState) -> axum::Router {
    http::router(state)
}
