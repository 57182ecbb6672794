use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::settings::MigrationSettings;
use crate::core::driver::{MigrateOptions, ResetType};
use crate::core::pool::PoolManager;
use crate::core::tasks::TaskService;
use crate::errors::{Error, Result};
use crate::events::EventBus;
use crate::scheduler::{Host, HostRegistry};
use crate::store::{RecordStore, MIGRATIONS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationKind {
    Live,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStatus {
    Starting,
    Migrating,
    Completed,
    Failed,
}

impl MigrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationStatus::Completed | MigrationStatus::Failed)
    }
}

/// Effective migration tuning. Callers override individual fields through
/// `MigrationFlagOverrides`; everything else keeps these defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationFlags {
    pub live: bool,
    pub tunneled: bool,
    pub compressed: bool,
    pub auto_converge: bool,
    pub copy_storage: bool,
    pub bandwidth_mbps: u32,
    pub max_downtime_ms: u64,
}

impl Default for MigrationFlags {
    fn default() -> Self {
        Self {
            live: true,
            tunneled: true,
            compressed: false,
            auto_converge: true,
            copy_storage: false,
            bandwidth_mbps: 100,
            max_downtime_ms: 300,
        }
    }
}

impl MigrationFlags {
    pub fn from_settings(settings: &MigrationSettings) -> Self {
        Self {
            bandwidth_mbps: settings.bandwidth_mbps,
            max_downtime_ms: settings.max_downtime_ms,
            ..Default::default()
        }
    }

    pub fn apply(&self, overrides: &MigrationFlagOverrides) -> Self {
        Self {
            live: overrides.live.unwrap_or(self.live),
            tunneled: overrides.tunneled.unwrap_or(self.tunneled),
            compressed: overrides.compressed.unwrap_or(self.compressed),
            auto_converge: overrides.auto_converge.unwrap_or(self.auto_converge),
            copy_storage: overrides.copy_storage.unwrap_or(self.copy_storage),
            bandwidth_mbps: overrides.bandwidth_mbps.unwrap_or(self.bandwidth_mbps),
            max_downtime_ms: overrides.max_downtime_ms.unwrap_or(self.max_downtime_ms),
        }
    }

    fn driver_flags(&self) -> Vec<&'static str> {
        let mut flags = Vec::new();
        if self.live {
            flags.push("VIR_MIGRATE_LIVE");
        }
        if self.tunneled {
            flags.push("VIR_MIGRATE_PEER2PEER");
            flags.push("VIR_MIGRATE_TUNNELLED");
        }
        if self.compressed {
            flags.push("VIR_MIGRATE_COMPRESSED");
        }
        if self.auto_converge {
            flags.push("VIR_MIGRATE_AUTO_CONVERGE");
        }
        if self.copy_storage {
            flags.push("VIR_MIGRATE_NON_SHARED_DISK");
        }
        flags
    }
}

/// Per-call overrides merged over the service defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationFlagOverrides {
    pub live: Option<bool>,
    pub tunneled: Option<bool>,
    pub compressed: Option<bool>,
    pub auto_converge: Option<bool>,
    pub copy_storage: Option<bool>,
    pub bandwidth_mbps: Option<u32>,
    pub max_downtime_ms: Option<u64>,
}

/// Ledger entry for one relocation. Status moves forward only; once terminal
/// the record never changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Migration {
    pub id: String,
    pub system_id: String,
    pub source_host_id: String,
    pub target_host_id: String,
    pub kind: MigrationKind,
    pub flags: MigrationFlags,
    pub status: MigrationStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub downtime_ms: Option<u64>,
    pub error_message: Option<String>,
    pub created_by: String,
}

/// Best-effort compatibility probe run before a migration starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreMigrationChecks {
    pub cpu_compatible: bool,
    pub shared_storage: bool,
    pub memory_available: bool,
    pub network_reachable: bool,
    pub copy_storage_required: bool,
    pub warnings: Vec<String>,
}

/// Decide whether source and target can see the same storage. Hosts sharing
/// a connection URI are assumed to share storage; anything else forces a
/// copy-storage migration.
pub fn pre_migration_checks(source: &Host, target: &Host) -> PreMigrationChecks {
    let mut checks = PreMigrationChecks {
        // CPU compatibility would come from hypervisor capability data;
        // default to compatible until the driver exposes it.
        cpu_compatible: true,
        shared_storage: false,
        memory_available: true,
        network_reachable: true,
        copy_storage_required: false,
        warnings: Vec::new(),
    };

    let both_local = source.uri.contains("localhost") && target.uri.contains("localhost");
    if source.uri == target.uri || both_local {
        checks.shared_storage = true;
    } else {
        checks.copy_storage_required = true;
        checks
            .warnings
            .push("Copy-storage migration required - may take longer".to_string());
    }

    checks
}

/// Moves nodes between hosts, live or offline, recording every attempt in
/// the migration ledger.
pub struct MigrationService {
    store: Arc<RecordStore>,
    registry: Arc<HostRegistry>,
    pools: Arc<PoolManager>,
    tasks: Arc<TaskService>,
    events: Arc<EventBus>,
    defaults: MigrationFlags,
    records: RwLock<HashMap<String, Migration>>,
}

impl MigrationService {
    pub fn new(
        store: Arc<RecordStore>,
        registry: Arc<HostRegistry>,
        pools: Arc<PoolManager>,
        tasks: Arc<TaskService>,
        events: Arc<EventBus>,
        defaults: MigrationFlags,
    ) -> Result<Self> {
        let existing: Vec<Migration> = store.list(MIGRATIONS)?;
        let records = existing.into_iter().map(|m| (m.id.clone(), m)).collect();
        Ok(Self {
            store,
            registry,
            pools,
            tasks,
            events,
            defaults,
            records: RwLock::new(records),
        })
    }

    /// Record a migration in `Starting` and kick off the heavy work as a
    /// tracked background task. Returns the migration id immediately.
    pub async fn start_live_migration(
        self: &Arc<Self>,
        system_id: &str,
        source_host_id: &str,
        target_host_id: &str,
        overrides: Option<MigrationFlagOverrides>,
        created_by: &str,
    ) -> Result<String> {
        if source_host_id == target_host_id {
            return Err(Error::validation(
                "source and target host must differ for a migration",
            ));
        }
        self.registry.get(source_host_id).await?;
        self.registry.get(target_host_id).await?;

        let flags = self.defaults.apply(&overrides.unwrap_or_default());
        let kind = if flags.live {
            MigrationKind::Live
        } else {
            MigrationKind::Offline
        };
        let migration = Migration {
            id: format!("migration-{}-{}", system_id, Uuid::new_v4().simple()),
            system_id: system_id.to_string(),
            source_host_id: source_host_id.to_string(),
            target_host_id: target_host_id.to_string(),
            kind,
            flags,
            status: MigrationStatus::Starting,
            started_at: Utc::now(),
            completed_at: None,
            downtime_ms: None,
            error_message: None,
            created_by: created_by.to_string(),
        };

        self.store.put(MIGRATIONS, &migration.id, &migration)?;
        self.records
            .write()
            .await
            .insert(migration.id.clone(), migration.clone());

        let service = Arc::clone(self);
        let migration_id = migration.id.clone();
        let task_name = format!("Migrate {} to host {}", system_id, target_host_id);
        self.tasks.run_background(task_name, move |_task_id| {
            let id = migration_id.clone();
            async move { service.perform_migration(&id).await }
        })?;

        Ok(migration.id)
    }

    /// Run the pre-checks and the actual relocation for a recorded migration.
    pub async fn perform_migration(&self, migration_id: &str) -> Result<()> {
        let migration = self
            .get_migration_status(migration_id)
            .await
            .ok_or_else(|| Error::not_found("migration", migration_id))?;
        if migration.status.is_terminal() {
            return Ok(());
        }
        let source = self.registry.get(&migration.source_host_id).await?;
        let target = self.registry.get(&migration.target_host_id).await?;

        let mut flags = migration.flags.clone();
        let checks = pre_migration_checks(&source, &target);
        if checks.copy_storage_required && !flags.copy_storage {
            flags.copy_storage = true;
            for warning in &checks.warnings {
                warn!(migration_id = %migration_id, "{warning}");
            }
            self.patch_flags(migration_id, flags.clone()).await?;
        }

        self.update_status(migration_id, MigrationStatus::Migrating, None, None)
            .await?;

        let outcome = self
            .relocate(&migration.system_id, &source, &target, &flags)
            .await;

        match outcome {
            Ok(downtime_ms) => {
                self.update_status(
                    migration_id,
                    MigrationStatus::Completed,
                    Some(downtime_ms),
                    None,
                )
                .await?;
                self.hand_over_allocation(&migration.system_id, &source, &target)
                    .await;
                self.events
                    .publish(
                        "SystemMigrated",
                        json!({
                            "systemId": migration.system_id,
                            "migrationId": migration_id,
                            "sourceHostId": source.id,
                            "targetHostId": target.id,
                            "downtimeMs": downtime_ms,
                        }),
                    )
                    .await;
                info!(
                    migration_id = %migration_id,
                    downtime_ms,
                    "Migration completed"
                );
                Ok(())
            }
            Err(err) => {
                // No rollback of partially-moved state; the record carries
                // the failure for operators to act on.
                self.update_status(
                    migration_id,
                    MigrationStatus::Failed,
                    None,
                    Some(err.to_string()),
                )
                .await?;
                Err(err)
            }
        }
    }

    async fn relocate(
        &self,
        system_id: &str,
        source: &Host,
        target: &Host,
        flags: &MigrationFlags,
    ) -> Result<u64> {
        let started = Instant::now();
        if flags.live {
            let opts = MigrateOptions {
                flags: flags.driver_flags(),
                bandwidth_mbps: flags.bandwidth_mbps,
                max_downtime_ms: flags.max_downtime_ms,
            };
            let system = system_id.to_string();
            let target_uri = target.uri.clone();
            self.pools
                .with_connection(&source.uri, move |handle| {
                    handle.migrate_system(&system, &target_uri, &opts)
                })
                .await?;
        } else {
            // Offline path: power off at the source, relocate the
            // definition, power on at the target.
            let system = system_id.to_string();
            let definition = self
                .pools
                .with_connection(&source.uri, move |handle| {
                    handle.reset_system(&system, ResetType::ForceOff)?;
                    let definition = handle.export_system(&system)?;
                    handle.undefine_system(&system)?;
                    Ok(definition)
                })
                .await?;
            let system = system_id.to_string();
            self.pools
                .with_connection(&target.uri, move |handle| {
                    handle.define_system(&definition)?;
                    handle.reset_system(&system, ResetType::On)
                })
                .await?;
        }
        Ok(started.elapsed().as_millis() as u64)
    }

    /// Shift the system's reservation from the source host to the target
    /// once it has moved. Best effort: a host deleted mid-flight only loses
    /// its accounting, not the migration.
    async fn hand_over_allocation(&self, system_id: &str, source: &Host, target: &Host) {
        let system = {
            let id = system_id.to_string();
            self.pools
                .with_connection(&target.uri, move |handle| handle.get_system(&id))
                .await
        };
        if let Ok(Some(system)) = system {
            let _ = self
                .registry
                .release_allocation(&source.id, system.vcpus, system.memory_mib)
                .await;
            let _ = self
                .registry
                .update_host_allocation(
                    &target.id,
                    system.vcpus as i64,
                    system.memory_mib as i64,
                )
                .await;
        }
    }

    async fn patch_flags(&self, migration_id: &str, flags: MigrationFlags) -> Result<()> {
        let snapshot = {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(migration_id)
                .ok_or_else(|| Error::not_found("migration", migration_id))?;
            if record.status.is_terminal() {
                return Ok(());
            }
            record.flags = flags;
            record.clone()
        };
        self.store.put(MIGRATIONS, migration_id, &snapshot)
    }

    async fn update_status(
        &self,
        migration_id: &str,
        status: MigrationStatus,
        downtime_ms: Option<u64>,
        error_message: Option<String>,
    ) -> Result<()> {
        let snapshot = {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(migration_id)
                .ok_or_else(|| Error::not_found("migration", migration_id))?;
            // Terminal records are immutable.
            if record.status.is_terminal() {
                return Ok(());
            }
            record.status = status;
            if status.is_terminal() {
                record.completed_at = Some(Utc::now());
                record.downtime_ms = downtime_ms;
                record.error_message = error_message;
            }
            record.clone()
        };
        self.store.put(MIGRATIONS, migration_id, &snapshot)
    }

    pub async fn get_migration_status(&self, migration_id: &str) -> Option<Migration> {
        self.records.read().await.get(migration_id).cloned()
    }

    pub async fn list_migrations(&self, system_id: Option<&str>, limit: usize) -> Vec<Migration> {
        let records = self.records.read().await;
        let mut out: Vec<_> = records
            .values()
            .filter(|m| system_id.map_or(true, |id| m.system_id == id))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out.truncate(limit);
        out
    }
}
