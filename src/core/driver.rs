use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::errors::{Error, Result};

/// Power action applied to a system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetType {
    On,
    ForceOff,
    GracefulShutdown,
    ForceRestart,
    GracefulRestart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootTarget {
    Pxe,
    Hdd,
    Cd,
}

/// A system as the hypervisor reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemRecord {
    pub id: String,
    pub name: String,
    pub power_state: PowerState,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub boot_override: Option<BootTarget>,
    pub attached_iso: Option<String>,
}

/// Everything the hypervisor needs to define a system. The driver's internal
/// representation (XML, RPC) stays opaque to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemDefinition {
    pub name: String,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub disk_path: PathBuf,
    pub seed_iso: Option<PathBuf>,
    pub network: String,
    pub boot_primary: Option<BootTarget>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HostCapacity {
    pub vcpus: u32,
    pub mem_mib: u64,
}

/// Tuning passed down for a live migration, derived from the merged
/// migration flags.
#[derive(Debug, Clone)]
pub struct MigrateOptions {
    pub flags: Vec<&'static str>,
    pub bandwidth_mbps: u32,
    pub max_downtime_ms: u64,
}

/// A live connection to one hypervisor endpoint.
///
/// Calls are blocking I/O; the pool hands them to callers who must run them
/// off the async scheduler's critical path (see `PoolManager::with_connection`).
pub trait HypervisorHandle: Send + Sync + std::fmt::Debug {
    fn ping(&self) -> Result<()>;
    fn hostname(&self) -> Result<String>;
    fn capacity(&self) -> Result<HostCapacity>;

    fn list_systems(&self) -> Result<Vec<SystemRecord>>;
    fn get_system(&self, system_id: &str) -> Result<Option<SystemRecord>>;
    fn reset_system(&self, system_id: &str, reset: ResetType) -> Result<()>;
    fn set_boot_override(&self, system_id: &str, target: BootTarget, persist: bool) -> Result<()>;
    fn attach_iso(&self, system_id: &str, path: &str) -> Result<()>;
    fn detach_iso(&self, system_id: &str) -> Result<()>;
    fn create_snapshot(&self, system_id: &str, name: &str) -> Result<()>;
    fn revert_snapshot(&self, system_id: &str, name: &str) -> Result<()>;
    fn delete_snapshot(&self, system_id: &str, name: &str) -> Result<()>;

    fn define_system(&self, definition: &SystemDefinition) -> Result<()>;
    fn undefine_system(&self, system_id: &str) -> Result<()>;
    fn export_system(&self, system_id: &str) -> Result<SystemDefinition>;
    fn migrate_system(&self, system_id: &str, target_uri: &str, opts: &MigrateOptions)
        -> Result<()>;

    fn close(&self);
}

/// Opens connections to hypervisor endpoints. The pool owns one connector and
/// calls it whenever it needs a fresh handle.
pub trait Connector: Send + Sync {
    fn connect(&self, uri: &str) -> Result<Arc<dyn HypervisorHandle>>;
}

// ---------------------------------------------------------------------------
// Fake backend
// ---------------------------------------------------------------------------

/// Failure knobs for one fake endpoint. Tests flip these to exercise error
/// paths without a hypervisor.
#[derive(Debug, Default)]
pub struct FailureInjection {
    pub fail_connect: bool,
    pub fail_ping: bool,
    pub fail_migrate: Option<String>,
    pub fail_define: Option<String>,
}

#[derive(Default)]
struct EndpointState {
    systems: HashMap<String, SystemRecord>,
    snapshots: Vec<(String, String)>,
    capacity: Option<HostCapacity>,
    failures: FailureInjection,
    operations: Vec<String>,
    closed_handles: usize,
}

/// Handle to one endpoint of the fake cluster. All handles for a URI share
/// state, so systems migrated between endpoints show up on the target.
pub struct FakeHandle {
    uri: String,
    cluster: Arc<FakeCluster>,
    state: Arc<Mutex<EndpointState>>,
}

impl std::fmt::Debug for FakeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeHandle").field("uri", &self.uri).finish()
    }
}

struct FakeCluster {
    endpoints: Mutex<HashMap<String, Arc<Mutex<EndpointState>>>>,
}

impl FakeCluster {
    fn endpoint(&self, uri: &str) -> Arc<Mutex<EndpointState>> {
        let mut endpoints = self.endpoints.lock().unwrap();
        endpoints
            .entry(uri.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(EndpointState::default())))
            .clone()
    }
}

/// In-process connector used by tests and the default daemon wiring. Mirrors
/// the real driver surface over a map of endpoints.
pub struct FakeConnector {
    cluster: Arc<FakeCluster>,
}

impl Default for FakeConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeConnector {
    pub fn new() -> Self {
        Self {
            cluster: Arc::new(FakeCluster {
                endpoints: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Seed a system on an endpoint (test helper).
    pub fn add_system(&self, uri: &str, system: SystemRecord) {
        let endpoint = self.cluster.endpoint(uri);
        let mut state = endpoint.lock().unwrap();
        state.systems.insert(system.id.clone(), system);
    }

    pub fn set_capacity(&self, uri: &str, capacity: HostCapacity) {
        let endpoint = self.cluster.endpoint(uri);
        endpoint.lock().unwrap().capacity = Some(capacity);
    }

    pub fn inject_failures(&self, uri: &str, failures: FailureInjection) {
        let endpoint = self.cluster.endpoint(uri);
        endpoint.lock().unwrap().failures = failures;
    }

    pub fn system(&self, uri: &str, system_id: &str) -> Option<SystemRecord> {
        let endpoint = self.cluster.endpoint(uri);
        let state = endpoint.lock().unwrap();
        state.systems.get(system_id).cloned()
    }

    /// Operation log for an endpoint, oldest first (test helper).
    pub fn operations(&self, uri: &str) -> Vec<String> {
        let endpoint = self.cluster.endpoint(uri);
        let ops = endpoint.lock().unwrap().operations.clone();
        ops
    }

    pub fn closed_handles(&self, uri: &str) -> usize {
        let endpoint = self.cluster.endpoint(uri);
        let n = endpoint.lock().unwrap().closed_handles;
        n
    }
}

impl Connector for FakeConnector {
    fn connect(&self, uri: &str) -> Result<Arc<dyn HypervisorHandle>> {
        let endpoint = self.cluster.endpoint(uri);
        if endpoint.lock().unwrap().failures.fail_connect {
            return Err(Error::Driver(format!("connection refused: {uri}")));
        }
        Ok(Arc::new(FakeHandle {
            uri: uri.to_string(),
            cluster: Arc::clone(&self.cluster),
            state: endpoint,
        }))
    }
}

impl FakeHandle {
    fn with_system<R>(
        &self,
        system_id: &str,
        f: impl FnOnce(&mut SystemRecord) -> R,
    ) -> Result<R> {
        let mut state = self.state.lock().unwrap();
        match state.systems.get_mut(system_id) {
            Some(system) => Ok(f(system)),
            None => Err(Error::not_found("system", system_id)),
        }
    }

    fn record_op(&self, op: String) {
        self.state.lock().unwrap().operations.push(op);
    }
}

impl HypervisorHandle for FakeHandle {
    fn ping(&self) -> Result<()> {
        if self.state.lock().unwrap().failures.fail_ping {
            return Err(Error::Driver(format!("endpoint unreachable: {}", self.uri)));
        }
        Ok(())
    }

    fn hostname(&self) -> Result<String> {
        Ok(format!("fake-{}", self.uri.replace(['/', ':'], "-")))
    }

    fn capacity(&self) -> Result<HostCapacity> {
        self.ping()?;
        Ok(self.state.lock().unwrap().capacity.unwrap_or(HostCapacity {
            vcpus: 8,
            mem_mib: 16384,
        }))
    }

    fn list_systems(&self) -> Result<Vec<SystemRecord>> {
        let state = self.state.lock().unwrap();
        let mut systems: Vec<_> = state.systems.values().cloned().collect();
        systems.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(systems)
    }

    fn get_system(&self, system_id: &str) -> Result<Option<SystemRecord>> {
        Ok(self.state.lock().unwrap().systems.get(system_id).cloned())
    }

    fn reset_system(&self, system_id: &str, reset: ResetType) -> Result<()> {
        self.record_op(format!("reset:{system_id}:{reset:?}"));
        self.with_system(system_id, |system| {
            system.power_state = match reset {
                ResetType::ForceOff | ResetType::GracefulShutdown => PowerState::Off,
                _ => PowerState::On,
            };
        })
    }

    fn set_boot_override(&self, system_id: &str, target: BootTarget, _persist: bool) -> Result<()> {
        self.with_system(system_id, |system| {
            system.boot_override = Some(target);
        })
    }

    fn attach_iso(&self, system_id: &str, path: &str) -> Result<()> {
        let path = path.to_string();
        self.record_op(format!("attach_iso:{system_id}:{path}"));
        self.with_system(system_id, |system| {
            system.attached_iso = Some(path);
        })
    }

    fn detach_iso(&self, system_id: &str) -> Result<()> {
        self.record_op(format!("detach_iso:{system_id}"));
        self.with_system(system_id, |system| {
            system.attached_iso = None;
        })
    }

    fn create_snapshot(&self, system_id: &str, name: &str) -> Result<()> {
        self.with_system(system_id, |_| ())?;
        let mut state = self.state.lock().unwrap();
        state.snapshots.push((system_id.to_string(), name.to_string()));
        Ok(())
    }

    fn revert_snapshot(&self, system_id: &str, name: &str) -> Result<()> {
        let state = self.state.lock().unwrap();
        if !state
            .snapshots
            .iter()
            .any(|(sys, snap)| sys == system_id && snap == name)
        {
            return Err(Error::not_found("snapshot", name));
        }
        Ok(())
    }

    fn delete_snapshot(&self, system_id: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .snapshots
            .retain(|(sys, snap)| !(sys == system_id && snap == name));
        Ok(())
    }

    fn define_system(&self, definition: &SystemDefinition) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = &state.failures.fail_define {
            return Err(Error::Driver(reason.clone()));
        }
        state.operations.push(format!("define:{}", definition.name));
        state.systems.insert(
            definition.name.clone(),
            SystemRecord {
                id: definition.name.clone(),
                name: definition.name.clone(),
                power_state: PowerState::Off,
                vcpus: definition.vcpus,
                memory_mib: definition.memory_mib,
                boot_override: definition.boot_primary,
                attached_iso: definition.seed_iso.as_ref().map(|p| p.display().to_string()),
            },
        );
        Ok(())
    }

    fn undefine_system(&self, system_id: &str) -> Result<()> {
        self.record_op(format!("undefine:{system_id}"));
        let mut state = self.state.lock().unwrap();
        state
            .systems
            .remove(system_id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("system", system_id))
    }

    fn export_system(&self, system_id: &str) -> Result<SystemDefinition> {
        self.with_system(system_id, |system| SystemDefinition {
            name: system.name.clone(),
            vcpus: system.vcpus,
            memory_mib: system.memory_mib,
            disk_path: PathBuf::from(format!("/var/lib/aviary/volumes/{}.qcow2", system.name)),
            seed_iso: None,
            network: "default".to_string(),
            boot_primary: system.boot_override,
        })
    }

    fn migrate_system(
        &self,
        system_id: &str,
        target_uri: &str,
        opts: &MigrateOptions,
    ) -> Result<()> {
        let system = {
            let state = self.state.lock().unwrap();
            if let Some(reason) = &state.failures.fail_migrate {
                return Err(Error::Driver(reason.clone()));
            }
            state
                .systems
                .get(system_id)
                .cloned()
                .ok_or_else(|| Error::not_found("system", system_id))?
        };
        self.record_op(format!(
            "migrate:{system_id}:{target_uri}:{}",
            opts.flags.join("|")
        ));

        if target_uri == self.uri {
            return Ok(());
        }
        let target = self.cluster.endpoint(target_uri);
        self.state.lock().unwrap().systems.remove(system_id);
        let mut moved = system;
        moved.power_state = PowerState::On;
        target.lock().unwrap().systems.insert(moved.id.clone(), moved);
        Ok(())
    }

    fn close(&self) {
        self.state.lock().unwrap().closed_handles += 1;
    }
}
