// Talon Gateway - scraping account orchestrator.
//
// Dispatches upstream read operations through a pool of accounts, each
// pinned to a proxy, under per-account and per-proxy rate limits, with
// health tracking, a global circuit breaker and automatic recovery. The
// HTTP surface, user store and the concrete upstream client live outside
// this crate; the driver seam is the `driver::DriverFactory` trait.

pub mod driver;
pub mod models;
pub mod modules;
pub mod orchestrator;

use std::sync::Arc;

use thiserror::Error;

use crate::driver::DriverFactory;
use crate::models::OrchestratorConfig;
use crate::modules::{AccountRegistry, PoolError, ProxyPool, RegistryError};
use crate::orchestrator::breaker::CircuitBreaker;
use crate::orchestrator::catalog::Catalog;
use crate::orchestrator::dispatcher::Dispatcher;
use crate::orchestrator::gate::ConcurrencyGate;
use crate::orchestrator::health::{HealthConfig, HealthTracker};
use crate::orchestrator::session::DriverSession;

pub use crate::orchestrator::dispatcher::{OpContext, OpSpec, Payload, TimeoutClass};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Composition root: constructor-injected components wired around the
/// dispatcher, plus the operation catalog the collaborator layer calls.
pub struct Gateway {
    pub registry: Arc<AccountRegistry>,
    pub pool: Arc<ProxyPool>,
    pub health: Arc<HealthTracker>,
    pub breaker: Arc<CircuitBreaker>,
    pub dispatcher: Arc<Dispatcher>,
    pub catalog: Catalog,
}

impl Gateway {
    /// Load durable state and wire the orchestrator together. Background
    /// loops are not started until `start()`.
    pub async fn new(
        cfg: OrchestratorConfig,
        factory: Arc<dyn DriverFactory>,
    ) -> Result<Self, GatewayError> {
        let registry = Arc::new(AccountRegistry::new(cfg.accounts_file.clone()));
        registry.load().await?;

        let pool = Arc::new(ProxyPool::new(cfg.proxies_file.clone(), cfg.proxy_spacing()));
        pool.load()?;

        let health = Arc::new(HealthTracker::new(HealthConfig::from(&cfg)));
        let breaker = Arc::new(CircuitBreaker::new(
            cfg.breaker_failure_threshold,
            std::time::Duration::from_secs(cfg.breaker_open_secs),
        ));
        let gate = Arc::new(ConcurrencyGate::new(
            cfg.gate_capacity
                .unwrap_or_else(ConcurrencyGate::default_capacity),
            cfg.gate_acquire_timeout(),
        ));
        let session = Arc::new(DriverSession::new(
            factory,
            registry.clone(),
            pool.clone(),
            &cfg,
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            pool.clone(),
            health.clone(),
            breaker.clone(),
            gate,
            session,
            cfg,
        ));
        let catalog = Catalog::new(dispatcher.clone());

        Ok(Self {
            registry,
            pool,
            health,
            breaker,
            dispatcher,
            catalog,
        })
    }

    /// Spawn the background maintenance loops.
    pub fn start(&self) {
        self.dispatcher.start();
    }

    /// Stop the loops, flush the registry, let in-flight calls drain.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }
}

/// Install the tracing subscriber with an env-driven filter. Safe to call
/// more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::MockFactory;
    use crate::driver::Tweet;
    use crate::models::{Account, Cookie};
    use crate::orchestrator::dispatcher::TimeoutClass;

    #[tokio::test]
    async fn test_gateway_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = OrchestratorConfig::default();
        cfg.accounts_file = dir.path().join("data.json");
        cfg.proxies_file = dir.path().join("proxies.txt");
        cfg.login_pause_ms = 0;
        cfg.initial_global_rate = 10_000.0;

        let factory = Arc::new(MockFactory::default());
        let gateway = Gateway::new(cfg, factory.clone()).await.unwrap();

        let mut account = Account::new("alice", "pw", "alice@example.com", "");
        account.cookies.push(Cookie::new("auth_token", "tok"));
        gateway.registry.add_account(account).await.unwrap();

        gateway.start();

        let op = OpSpec::new("getTweets", TimeoutClass::Tweet);
        let result = gateway
            .dispatcher
            .execute(op, |_ctx| async {
                Ok(vec![Tweet {
                    id: "1".to_string(),
                    ..Tweet::default()
                }])
            })
            .await;
        assert_eq!(result.unwrap().len(), 1);

        let report = gateway.dispatcher.stats_report();
        assert_eq!(report.dispatches, 1);
        assert_eq!(report.breaker_state, "CLOSED");

        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_gateway_tolerates_missing_state_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = OrchestratorConfig::default();
        cfg.accounts_file = dir.path().join("missing.json");
        cfg.proxies_file = dir.path().join("missing.txt");

        let gateway = Gateway::new(cfg, Arc::new(MockFactory::default()))
            .await
            .unwrap();
        assert_eq!(gateway.registry.len().await, 0);
        assert!(gateway.pool.is_empty());
    }
}
