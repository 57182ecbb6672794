use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::driver::HostCapacity;
use crate::core::pool::PoolManager;
use crate::errors::{Error, Result};
use crate::events::EventBus;
use crate::migration::MigrationService;
use crate::store::{RecordStore, HOSTS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostState {
    Active,
    Maintenance,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostResources {
    pub vcpus: u32,
    pub mem_mib: u64,
}

/// A hypervisor endpoint capable of running nodes.
///
/// Invariant: `allocated` never exceeds `capacity` in either dimension after
/// a successful reservation; allocation deltas clamp at zero on the low end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub uri: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub capacity: HostResources,
    pub allocated: HostResources,
    pub state: HostState,
    pub created_at: DateTime<Utc>,
}

impl Host {
    fn fits(&self, request: &PlacementRequest) -> bool {
        let free_vcpus = self.capacity.vcpus.saturating_sub(self.allocated.vcpus);
        let free_mem = self.capacity.mem_mib.saturating_sub(self.allocated.mem_mib);
        if free_vcpus < request.vcpus || free_mem < request.memory_mib {
            return false;
        }
        if let Some(required) = &request.required_labels {
            for (key, value) in required {
                if self.labels.get(key) != Some(value) {
                    return false;
                }
            }
        }
        true
    }
}

/// Ephemeral description of a workload looking for a host.
#[derive(Debug, Clone, Default)]
pub struct PlacementRequest {
    pub vcpus: u32,
    pub memory_mib: u64,
    pub required_labels: Option<BTreeMap<String, String>>,
}

/// Tracks hosts, their capacity and health state, and chooses placements with
/// a least-loaded spread heuristic.
pub struct HostRegistry {
    store: Arc<RecordStore>,
    pools: Arc<PoolManager>,
    events: Arc<EventBus>,
    hosts: RwLock<HashMap<String, Host>>,
}

// Capacity assumed for a host whose endpoint cannot be probed at add time.
const FALLBACK_CAPACITY: HostCapacity = HostCapacity {
    vcpus: 4,
    mem_mib: 8192,
};

/// Candidate ordering: least allocated vCPUs first, ties broken by earliest
/// `created_at` then id so scheduling stays reproducible.
fn spread_order(a: &Host, b: &Host) -> std::cmp::Ordering {
    a.allocated
        .vcpus
        .cmp(&b.allocated.vcpus)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

impl HostRegistry {
    pub fn new(
        store: Arc<RecordStore>,
        pools: Arc<PoolManager>,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        let existing: Vec<Host> = store.list(HOSTS)?;
        let hosts = existing.into_iter().map(|h| (h.id.clone(), h)).collect();
        Ok(Self {
            store,
            pools,
            events,
            hosts: RwLock::new(hosts),
        })
    }

    /// Register a host, probing its endpoint for a capacity estimate and
    /// falling back to a conservative default when unreachable.
    pub async fn add_host(
        &self,
        uri: impl Into<String>,
        name: impl Into<String>,
        labels: BTreeMap<String, String>,
    ) -> Result<Host> {
        let uri = uri.into();
        let capacity = match self
            .pools
            .with_connection(&uri, |handle| handle.capacity())
            .await
        {
            Ok(capacity) => capacity,
            Err(err) => {
                warn!(uri = %uri, error = %err, "Capacity probe failed, using fallback estimate");
                FALLBACK_CAPACITY
            }
        };

        let host = Host {
            id: Uuid::new_v4().simple().to_string(),
            uri,
            name: name.into(),
            labels,
            capacity: HostResources {
                vcpus: capacity.vcpus,
                mem_mib: capacity.mem_mib,
            },
            allocated: HostResources::default(),
            state: HostState::Active,
            created_at: Utc::now(),
        };

        self.store.put(HOSTS, &host.id, &host)?;
        self.hosts
            .write()
            .await
            .insert(host.id.clone(), host.clone());
        info!(host_id = %host.id, name = %host.name, "Host added to fleet");
        Ok(host)
    }

    pub async fn list(&self) -> Vec<Host> {
        let hosts = self.hosts.read().await;
        let mut out: Vec<_> = hosts.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub async fn get(&self, host_id: &str) -> Result<Host> {
        self.hosts
            .read()
            .await
            .get(host_id)
            .cloned()
            .ok_or_else(|| Error::not_found("host", host_id))
    }

    pub async fn delete(&self, host_id: &str) -> Result<()> {
        let removed = self.hosts.write().await.remove(host_id);
        if removed.is_none() {
            return Err(Error::not_found("host", host_id));
        }
        self.store.delete(HOSTS, host_id)
    }

    /// Preview the host a request would land on, without reserving anything.
    /// Returns `None` when no active host satisfies capacity and labels.
    pub async fn schedule_placement(&self, request: &PlacementRequest) -> Option<Host> {
        let hosts = self.hosts.read().await;
        hosts
            .values()
            .filter(|h| h.state == HostState::Active && h.fits(request))
            .min_by(|a, b| spread_order(a, b))
            .cloned()
    }

    /// Choose a host and reserve its capacity as one atomic step under the
    /// registry lock, so concurrent placements cannot race past each other's
    /// capacity check.
    pub async fn reserve_placement(&self, request: &PlacementRequest) -> Result<Host> {
        let mut hosts = self.hosts.write().await;
        let host = hosts
            .values_mut()
            .filter(|h| h.state == HostState::Active && h.fits(request))
            .min_by(|a, b| spread_order(a, b))
            .ok_or(Error::NoCandidate)?;

        host.allocated.vcpus += request.vcpus;
        host.allocated.mem_mib += request.memory_mib;
        let snapshot = host.clone();
        drop(hosts);

        self.store.put(HOSTS, &snapshot.id, &snapshot)?;
        info!(
            host_id = %snapshot.id,
            vcpus = request.vcpus,
            mem_mib = request.memory_mib,
            "Reserved placement"
        );
        Ok(snapshot)
    }

    /// Apply signed allocation deltas, clamping each dimension at zero.
    pub async fn update_host_allocation(
        &self,
        host_id: &str,
        vcpus_delta: i64,
        mem_delta: i64,
    ) -> Result<Host> {
        let snapshot = {
            let mut hosts = self.hosts.write().await;
            let host = hosts
                .get_mut(host_id)
                .ok_or_else(|| Error::not_found("host", host_id))?;
            host.allocated.vcpus = (host.allocated.vcpus as i64 + vcpus_delta).max(0) as u32;
            host.allocated.mem_mib = (host.allocated.mem_mib as i64 + mem_delta).max(0) as u64;
            host.clone()
        };
        self.store.put(HOSTS, host_id, &snapshot)?;
        Ok(snapshot)
    }

    pub async fn release_allocation(&self, host_id: &str, vcpus: u32, mem_mib: u64) -> Result<Host> {
        self.update_host_allocation(host_id, -(vcpus as i64), -(mem_mib as i64))
            .await
    }

    /// Toggle a host between `Active` and `Maintenance` without touching its
    /// running workloads.
    pub async fn set_maintenance(&self, host_id: &str, maintenance: bool) -> Result<Host> {
        let snapshot = {
            let mut hosts = self.hosts.write().await;
            let host = hosts
                .get_mut(host_id)
                .ok_or_else(|| Error::not_found("host", host_id))?;
            host.state = if maintenance {
                HostState::Maintenance
            } else {
                HostState::Active
            };
            host.clone()
        };
        self.store.put(HOSTS, host_id, &snapshot)?;

        let event_type = if maintenance {
            "HostMaintenanceEntered"
        } else {
            "HostMaintenanceExited"
        };
        self.events
            .publish(event_type, json!({ "hostId": host_id }))
            .await;
        Ok(snapshot)
    }

    /// Move every system off a host, one migration per system, targets
    /// assigned round-robin across the remaining active hosts. Fails fast
    /// when no other active host exists.
    pub async fn evacuate_host(
        &self,
        host_id: &str,
        migrations: &Arc<MigrationService>,
    ) -> Result<Vec<String>> {
        let host = self.get(host_id).await?;

        let mut targets: Vec<Host> = self
            .list()
            .await
            .into_iter()
            .filter(|h| h.id != host_id && h.state == HostState::Active)
            .collect();
        targets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if targets.is_empty() {
            return Err(Error::validation(
                "no other active host available for evacuation",
            ));
        }

        let systems = self
            .pools
            .with_connection(&host.uri, |handle| handle.list_systems())
            .await?;

        let mut migration_ids = Vec::with_capacity(systems.len());
        for (idx, system) in systems.into_iter().enumerate() {
            let target = &targets[idx % targets.len()];
            let migration_id = migrations
                .start_live_migration(&system.id, host_id, &target.id, None, "evacuation")
                .await?;
            migration_ids.push(migration_id);
        }
        info!(
            host_id = %host_id,
            migrations = migration_ids.len(),
            "Evacuation started"
        );
        Ok(migration_ids)
    }
}
