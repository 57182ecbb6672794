use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use aviary::core::driver::{
    FailureInjection, FakeConnector, HostCapacity, PowerState, SystemRecord,
};
use aviary::core::pool::{PoolConfig, PoolManager};
use aviary::core::tasks::TaskService;
use aviary::errors::Error;
use aviary::events::{EventBus, EventStream};
use aviary::migration::{MigrationFlagOverrides, MigrationFlags, MigrationService, MigrationStatus};
use aviary::scheduler::HostRegistry;
use aviary::store::RecordStore;

struct Fixture {
    _dir: tempfile::TempDir,
    connector: Arc<FakeConnector>,
    registry: Arc<HostRegistry>,
    migrations: Arc<MigrationService>,
    tasks: Arc<TaskService>,
    events: Arc<EventBus>,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RecordStore::open(&dir.path().join("state.redb")).unwrap());
    let connector = Arc::new(FakeConnector::new());
    let pools = Arc::new(PoolManager::new(connector.clone(), PoolConfig::default()));
    let events = Arc::new(EventBus::new());
    let tasks = Arc::new(TaskService::new(store.clone()).unwrap());
    let registry = Arc::new(HostRegistry::new(store.clone(), pools.clone(), events.clone()).unwrap());
    let migrations = Arc::new(
        MigrationService::new(
            store,
            registry.clone(),
            pools,
            tasks.clone(),
            events.clone(),
            MigrationFlags::default(),
        )
        .unwrap(),
    );
    Fixture {
        _dir: dir,
        connector,
        registry,
        migrations,
        tasks,
        events,
    }
}

fn system(id: &str) -> SystemRecord {
    SystemRecord {
        id: id.to_string(),
        name: id.to_string(),
        power_state: PowerState::On,
        vcpus: 2,
        memory_mib: 2048,
        boot_override: None,
        attached_iso: None,
    }
}

async fn await_terminal(migrations: &Arc<MigrationService>, id: &str) -> MigrationStatus {
    for _ in 0..500 {
        if let Some(record) = migrations.get_migration_status(id).await {
            if record.status.is_terminal() {
                return record.status;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("migration {id} never reached a terminal state");
}

async fn next_event_of(stream: &mut EventStream, event_type: &str) -> serde_json::Value {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event bus closed");
        if event.event_type == event_type {
            return event.payload;
        }
    }
}

#[tokio::test]
async fn live_migration_between_hosts_sharing_storage_completes() {
    let f = fixture();
    // Same connection URI: the shared-storage heuristic applies and no
    // copy-storage fallback is needed.
    let source = f.registry.add_host("qemu:///shared", "h1", BTreeMap::new()).await.unwrap();
    let target = f.registry.add_host("qemu:///shared", "h2", BTreeMap::new()).await.unwrap();
    f.connector.add_system("qemu:///shared", system("vm-1"));
    let mut stream = f.events.subscribe();

    let id = f
        .migrations
        .start_live_migration("vm-1", &source.id, &target.id, None, "operator")
        .await
        .unwrap();

    let record = f.migrations.get_migration_status(&id).await.unwrap();
    assert_eq!(record.status, MigrationStatus::Starting);
    assert_eq!(record.created_by, "operator");
    assert!(record.flags.live);

    assert_eq!(await_terminal(&f.migrations, &id).await, MigrationStatus::Completed);
    let record = f.migrations.get_migration_status(&id).await.unwrap();
    assert!(record.downtime_ms.is_some());
    assert!(record.completed_at.is_some());
    assert!(record.error_message.is_none());
    // Shared URI means no forced copy-storage.
    assert!(!record.flags.copy_storage);

    let payload = next_event_of(&mut stream, "SystemMigrated").await;
    assert_eq!(payload["systemId"], "vm-1");
    assert_eq!(payload["targetHostId"], target.id.as_str());
}

#[tokio::test]
async fn cross_uri_migration_forces_copy_storage_and_moves_the_system() {
    let f = fixture();
    let source = f.registry.add_host("qemu+ssh://a/system", "h1", BTreeMap::new()).await.unwrap();
    let target = f.registry.add_host("qemu+ssh://b/system", "h2", BTreeMap::new()).await.unwrap();
    f.connector.add_system("qemu+ssh://a/system", system("vm-1"));

    let id = f
        .migrations
        .start_live_migration("vm-1", &source.id, &target.id, None, "operator")
        .await
        .unwrap();
    assert_eq!(await_terminal(&f.migrations, &id).await, MigrationStatus::Completed);

    let record = f.migrations.get_migration_status(&id).await.unwrap();
    assert!(record.flags.copy_storage);

    // The system now lives on the target endpoint only.
    assert!(f.connector.system("qemu+ssh://a/system", "vm-1").is_none());
    assert!(f.connector.system("qemu+ssh://b/system", "vm-1").is_some());

    // Allocation followed the system to the target host.
    let target = f.registry.get(&target.id).await.unwrap();
    assert_eq!(target.allocated.vcpus, 2);
}

#[tokio::test]
async fn driver_failure_marks_migration_failed_with_message() {
    let f = fixture();
    let source = f.registry.add_host("qemu+ssh://a/system", "h1", BTreeMap::new()).await.unwrap();
    let target = f.registry.add_host("qemu+ssh://b/system", "h2", BTreeMap::new()).await.unwrap();
    f.connector.add_system("qemu+ssh://a/system", system("vm-1"));
    f.connector.inject_failures(
        "qemu+ssh://a/system",
        FailureInjection {
            fail_migrate: Some("migration stream reset by peer".to_string()),
            ..Default::default()
        },
    );

    let id = f
        .migrations
        .start_live_migration("vm-1", &source.id, &target.id, None, "operator")
        .await
        .unwrap();
    assert_eq!(await_terminal(&f.migrations, &id).await, MigrationStatus::Failed);

    let record = f.migrations.get_migration_status(&id).await.unwrap();
    let message = record.error_message.unwrap();
    assert!(message.contains("migration stream reset by peer"));

    // Terminal records are immutable: a second perform cannot resurrect it.
    f.migrations.perform_migration(&id).await.unwrap();
    let record = f.migrations.get_migration_status(&id).await.unwrap();
    assert_eq!(record.status, MigrationStatus::Failed);
}

#[tokio::test]
async fn offline_migration_powers_off_relocates_and_powers_on() {
    let f = fixture();
    let source = f.registry.add_host("qemu+ssh://a/system", "h1", BTreeMap::new()).await.unwrap();
    let target = f.registry.add_host("qemu+ssh://b/system", "h2", BTreeMap::new()).await.unwrap();
    f.connector.add_system("qemu+ssh://a/system", system("vm-1"));

    let overrides = MigrationFlagOverrides {
        live: Some(false),
        ..Default::default()
    };
    let id = f
        .migrations
        .start_live_migration("vm-1", &source.id, &target.id, Some(overrides), "operator")
        .await
        .unwrap();
    assert_eq!(await_terminal(&f.migrations, &id).await, MigrationStatus::Completed);

    assert!(f.connector.system("qemu+ssh://a/system", "vm-1").is_none());
    let moved = f.connector.system("qemu+ssh://b/system", "vm-1").unwrap();
    assert_eq!(moved.power_state, PowerState::On);

    let source_ops = f.connector.operations("qemu+ssh://a/system");
    assert!(source_ops.iter().any(|op| op == "reset:vm-1:ForceOff"));
    assert!(source_ops.iter().any(|op| op == "undefine:vm-1"));
}

#[tokio::test]
async fn start_rejects_same_source_and_target() {
    let f = fixture();
    let host = f.registry.add_host("qemu:///shared", "h1", BTreeMap::new()).await.unwrap();

    let err = f
        .migrations
        .start_live_migration("vm-1", &host.id, &host.id, None, "operator")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = f
        .migrations
        .start_live_migration("vm-1", &host.id, "no-such-host", None, "operator")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn list_migrations_filters_by_system_newest_first() {
    let f = fixture();
    let h1 = f.registry.add_host("qemu+ssh://a/system", "h1", BTreeMap::new()).await.unwrap();
    let h2 = f.registry.add_host("qemu+ssh://b/system", "h2", BTreeMap::new()).await.unwrap();
    f.connector.add_system("qemu+ssh://a/system", system("vm-1"));
    f.connector.add_system("qemu+ssh://a/system", system("vm-2"));

    let first = f
        .migrations
        .start_live_migration("vm-1", &h1.id, &h2.id, None, "operator")
        .await
        .unwrap();
    let second = f
        .migrations
        .start_live_migration("vm-2", &h1.id, &h2.id, None, "operator")
        .await
        .unwrap();
    await_terminal(&f.migrations, &first).await;
    await_terminal(&f.migrations, &second).await;

    let all = f.migrations.list_migrations(None, 100).await;
    assert_eq!(all.len(), 2);
    let only_vm2 = f.migrations.list_migrations(Some("vm-2"), 100).await;
    assert_eq!(only_vm2.len(), 1);
    assert_eq!(only_vm2[0].id, second);
    assert_eq!(f.migrations.list_migrations(None, 1).await.len(), 1);
}

#[tokio::test]
async fn evacuation_spreads_systems_round_robin_over_active_hosts() {
    let f = fixture();
    f.connector.set_capacity("qemu+ssh://a/system", HostCapacity { vcpus: 16, mem_mib: 32768 });
    let drained = f.registry.add_host("qemu+ssh://a/system", "h1", BTreeMap::new()).await.unwrap();
    let t1 = f.registry.add_host("qemu+ssh://b/system", "h2", BTreeMap::new()).await.unwrap();
    let t2 = f.registry.add_host("qemu+ssh://c/system", "h3", BTreeMap::new()).await.unwrap();
    for name in ["vm-1", "vm-2", "vm-3"] {
        f.connector.add_system("qemu+ssh://a/system", system(name));
    }

    let ids = f.registry.evacuate_host(&drained.id, &f.migrations).await.unwrap();
    assert_eq!(ids.len(), 3);

    for id in &ids {
        await_terminal(&f.migrations, id).await;
        let record = f.migrations.get_migration_status(id).await.unwrap();
        assert_ne!(record.target_host_id, drained.id);
        assert!([t1.id.as_str(), t2.id.as_str()].contains(&record.target_host_id.as_str()));
    }

    // Round-robin across the two remaining hosts: 2 on one, 1 on the other.
    let mut records = Vec::new();
    for id in &ids {
        records.push(f.migrations.get_migration_status(id).await.unwrap());
    }
    let to_t1 = records.iter().filter(|m| m.target_host_id == t1.id).count();
    let to_t2 = records.iter().filter(|m| m.target_host_id == t2.id).count();
    assert_eq!(to_t1 + to_t2, 3);
    assert!(to_t1 == 2 || to_t2 == 2);

    f.tasks.drain().await;
    assert!(f.connector.system("qemu+ssh://a/system", "vm-1").is_none());
}

#[tokio::test]
async fn evacuation_fails_fast_without_another_active_host() {
    let f = fixture();
    let lonely = f.registry.add_host("qemu+ssh://a/system", "h1", BTreeMap::new()).await.unwrap();
    let parked = f.registry.add_host("qemu+ssh://b/system", "h2", BTreeMap::new()).await.unwrap();
    f.registry.set_maintenance(&parked.id, true).await.unwrap();
    f.connector.add_system("qemu+ssh://a/system", system("vm-1"));

    let err = f.registry.evacuate_host(&lonely.id, &f.migrations).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}
