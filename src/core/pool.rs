use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::config::settings::PoolSettings;
use crate::core::driver::{Connector, HypervisorHandle};
use crate::errors::{Error, Result};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    pub ttl: Duration,
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            ttl: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(60),
        }
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            min_connections: settings.min_connections,
            max_connections: settings.max_connections,
            ttl: settings.ttl(),
            health_check_interval: settings.health_check_interval(),
        }
    }
}

/// A pooled hypervisor handle with checkout metadata. Owned exclusively by
/// one pool; handles are never shared across pools.
struct PooledConnection {
    handle: Arc<dyn HypervisorHandle>,
    created_at: Instant,
    last_used: Instant,
    checkout_count: u64,
    outstanding: usize,
    is_healthy: bool,
}

#[derive(Default)]
struct PoolState {
    connections: Vec<PooledConnection>,
    last_health_check: Option<Instant>,
    total_checkouts: u64,
    total_failures: u64,
    total_reconnects: u64,
}

/// Point-in-time counters for one pool.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolMetrics {
    pub pool_size: usize,
    pub healthy_connections: usize,
    pub checkout_count: u64,
    pub failure_count: u64,
    pub reconnect_count: u64,
}

/// Connection pool for one hypervisor endpoint.
///
/// Handles are not assumed safe for unsynchronized concurrent access, so all
/// pool state lives behind a single mutex. Checkout prefers an idle handle,
/// then creates up to `max_connections`, and only then shares the
/// least-loaded healthy handle rather than failing a caller that could still
/// be served.
pub struct ConnectionPool {
    uri: String,
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub fn new(uri: impl Into<String>, config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            uri: uri.into(),
            config,
            connector,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn create_connection(&self, state: &mut PoolState) -> Option<Arc<dyn HypervisorHandle>> {
        match self.connector.connect(&self.uri) {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!(uri = %self.uri, error = %err, "Failed to create hypervisor connection");
                state.total_failures += 1;
                None
            }
        }
    }

    fn push_connection(
        state: &mut PoolState,
        handle: Arc<dyn HypervisorHandle>,
        now: Instant,
        outstanding: usize,
    ) {
        state.connections.push(PooledConnection {
            handle,
            created_at: now,
            last_used: now,
            checkout_count: outstanding as u64,
            outstanding,
            is_healthy: true,
        });
    }

    /// Ping idle handles, dropping and replacing the ones that fail. Gated on
    /// the configured interval; callers hit this through `get_connection`.
    fn health_check(&self, state: &mut PoolState, now: Instant) {
        if let Some(last) = state.last_health_check {
            if now.duration_since(last) < self.config.health_check_interval {
                return;
            }
        }
        state.last_health_check = Some(now);

        let before = state.connections.len();
        state.connections.retain(|conn| {
            if conn.outstanding > 0 || conn.handle.ping().is_ok() {
                true
            } else {
                warn!(uri = %self.uri, "Dropping unhealthy pooled connection");
                conn.handle.close();
                false
            }
        });
        let removed = before - state.connections.len();

        // Replace what the check removed, up to the minimum.
        for _ in 0..removed {
            if state.connections.len() >= self.config.min_connections {
                break;
            }
            match self.create_connection(state) {
                Some(handle) => {
                    Self::push_connection(state, handle, now, 0);
                    state.total_reconnects += 1;
                }
                None => break,
            }
        }
    }

    fn evict_expired(&self, state: &mut PoolState, now: Instant) {
        let ttl = self.config.ttl;
        state.connections.retain(|conn| {
            if conn.outstanding == 0 && now.duration_since(conn.last_used) > ttl {
                debug!(
                    uri = %self.uri,
                    age_secs = now.duration_since(conn.created_at).as_secs(),
                    "Evicting expired pooled connection"
                );
                conn.handle.close();
                false
            } else {
                true
            }
        });
    }

    fn ensure_minimum(&self, state: &mut PoolState, now: Instant) {
        while state.connections.len() < self.config.min_connections
            && state.connections.len() < self.config.max_connections
        {
            match self.create_connection(state) {
                Some(handle) => Self::push_connection(state, handle, now, 0),
                None => break,
            }
        }
    }

    /// Check out a healthy handle, creating one if the pool has room.
    ///
    /// Returns `Error::ConnectionUnavailable` when no handle is healthy and
    /// the pool cannot grow; callers must treat that as retryable, not a hard
    /// failure.
    pub async fn get_connection(&self) -> Result<Arc<dyn HypervisorHandle>> {
        let mut guard = self.state.lock().await;
        let now = Instant::now();

        self.health_check(&mut guard, now);
        self.evict_expired(&mut guard, now);
        self.ensure_minimum(&mut guard, now);

        let state = &mut *guard;
        if let Some(conn) = state
            .connections
            .iter_mut()
            .find(|c| c.is_healthy && c.outstanding == 0)
        {
            conn.last_used = now;
            conn.checkout_count += 1;
            conn.outstanding += 1;
            let handle = Arc::clone(&conn.handle);
            state.total_checkouts += 1;
            return Ok(handle);
        }

        if state.connections.len() < self.config.max_connections {
            if let Some(handle) = self.create_connection(state) {
                Self::push_connection(state, Arc::clone(&handle), now, 1);
                state.total_checkouts += 1;
                return Ok(handle);
            }
        }

        if let Some(conn) = state
            .connections
            .iter_mut()
            .filter(|c| c.is_healthy)
            .min_by_key(|c| c.outstanding)
        {
            conn.last_used = now;
            conn.checkout_count += 1;
            conn.outstanding += 1;
            let handle = Arc::clone(&conn.handle);
            state.total_checkouts += 1;
            return Ok(handle);
        }

        Err(Error::ConnectionUnavailable {
            uri: self.uri.clone(),
        })
    }

    /// Hand a checked-out handle back to the pool.
    pub async fn return_connection(&self, handle: &Arc<dyn HypervisorHandle>) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if let Some(conn) = state
            .connections
            .iter_mut()
            .find(|c| Arc::ptr_eq(&c.handle, handle))
        {
            conn.outstanding = conn.outstanding.saturating_sub(1);
            conn.last_used = now;
        }
    }

    pub async fn metrics(&self) -> PoolMetrics {
        let state = self.state.lock().await;
        PoolMetrics {
            pool_size: state.connections.len(),
            healthy_connections: state.connections.iter().filter(|c| c.is_healthy).count(),
            checkout_count: state.total_checkouts,
            failure_count: state.total_failures,
            reconnect_count: state.total_reconnects,
        }
    }

    pub async fn size(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    /// Release every handle. Used at shutdown.
    pub async fn close_all(&self) {
        let mut state = self.state.lock().await;
        for conn in state.connections.drain(..) {
            conn.handle.close();
        }
    }
}

/// Holds one pool per hypervisor URI. Constructed once at startup and passed
/// by handle into every component that talks to the fleet.
pub struct PoolManager {
    connector: Arc<dyn Connector>,
    defaults: PoolConfig,
    pools: RwLock<HashMap<String, Arc<ConnectionPool>>>,
}

impl PoolManager {
    pub fn new(connector: Arc<dyn Connector>, defaults: PoolConfig) -> Self {
        Self {
            connector,
            defaults,
            pools: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_pool(&self, uri: &str) -> Arc<ConnectionPool> {
        if let Some(pool) = self.pools.read().await.get(uri) {
            return Arc::clone(pool);
        }
        let mut pools = self.pools.write().await;
        Arc::clone(pools.entry(uri.to_string()).or_insert_with(|| {
            Arc::new(ConnectionPool::new(
                uri,
                self.defaults.clone(),
                Arc::clone(&self.connector),
            ))
        }))
    }

    pub async fn get_connection(&self, uri: &str) -> Result<Arc<dyn HypervisorHandle>> {
        self.get_pool(uri).await.get_connection().await
    }

    pub async fn return_connection(&self, uri: &str, handle: &Arc<dyn HypervisorHandle>) {
        if let Some(pool) = self.pools.read().await.get(uri) {
            pool.return_connection(handle).await;
        }
    }

    /// Run a blocking driver call against a pooled connection on a dedicated
    /// worker thread, keeping it off the async scheduler's critical path.
    pub async fn with_connection<R, F>(&self, uri: &str, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&dyn HypervisorHandle) -> Result<R> + Send + 'static,
    {
        let pool = self.get_pool(uri).await;
        let handle = pool.get_connection().await?;
        let call_handle = Arc::clone(&handle);
        let result = tokio::task::spawn_blocking(move || f(call_handle.as_ref()))
            .await
            .map_err(|err| Error::Driver(format!("driver call aborted: {err}")))?;
        pool.return_connection(&handle).await;
        result
    }

    pub async fn metrics(&self) -> HashMap<String, PoolMetrics> {
        let pools = self.pools.read().await;
        let mut out = HashMap::new();
        for (uri, pool) in pools.iter() {
            // Strip credentials before using the URI as a metrics key.
            let safe_uri = uri.rsplit('@').next().unwrap_or(uri).to_string();
            out.insert(safe_uri, pool.metrics().await);
        }
        out
    }

    pub async fn close_all(&self) {
        let mut pools = self.pools.write().await;
        for pool in pools.values() {
            pool.close_all().await;
        }
        pools.clear();
    }
}
