use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use aviary::config::Settings;
use aviary::controlplane::ControlPlane;
use aviary::core::driver::{BootTarget, FakeConnector, HostCapacity, PowerState};
use aviary::core::tasks::TaskState;
use aviary::errors::Error;
use aviary::orchestrator::{BatchRequest, NodeSpec};

struct Fixture {
    _dir: tempfile::TempDir,
    connector: Arc<FakeConnector>,
    plane: ControlPlane,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        state_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let connector = Arc::new(FakeConnector::new());
    let plane = ControlPlane::build(&settings, connector.clone()).unwrap();
    Fixture {
        _dir: dir,
        connector,
        plane,
    }
}

fn spec(name: &str) -> NodeSpec {
    NodeSpec {
        name: name.to_string(),
        vcpus: 2,
        memory_mib: 2048,
        disk_gib: 1,
        network: "default".to_string(),
        boot_primary: Some(BootTarget::Hdd),
        image_url: None,
        user_data: None,
    }
}

#[tokio::test]
async fn create_node_provisions_and_publishes() {
    let f = fixture().await;
    f.connector.set_capacity("test:///h1", HostCapacity { vcpus: 8, mem_mib: 16384 });
    let host = f
        .plane
        .registry
        .add_host("test:///h1", "h1", BTreeMap::new())
        .await
        .unwrap();

    // Subscribe before the call so the SystemCreated event is observable.
    let mut stream = f.plane.events.subscribe();

    let task_id = f.plane.orchestrator.create_node(spec("vm-1")).unwrap();
    let task = f.plane.tasks.join(&task_id).await.unwrap();
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.percent, 100);
    assert!(task.messages.iter().any(|m| m.contains("Volume")));
    assert!(task.messages.iter().any(|m| m.contains("Seed created")));

    // Storage artifacts exist under the state dir.
    assert!(f._dir.path().join("volumes/vm-1.qcow2").exists());
    assert!(f._dir.path().join("seeds/vm-1.iso").exists());

    // The node is defined on the placed host with the requested shape.
    let system = f.connector.system("test:///h1", "vm-1").unwrap();
    assert_eq!(system.vcpus, 2);
    assert_eq!(system.memory_mib, 2048);
    assert_eq!(system.power_state, PowerState::Off);
    assert_eq!(system.boot_override, Some(BootTarget::Hdd));

    // Capacity was reserved atomically with the placement.
    let host = f.plane.registry.get(&host.id).await.unwrap();
    assert_eq!(host.allocated.vcpus, 2);
    assert_eq!(host.allocated.mem_mib, 2048);

    let event = tokio::time::timeout(Duration::from_secs(5), stream.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.event_type, "SystemCreated");
    assert_eq!(event.payload["systemId"], "vm-1");
}

#[tokio::test]
async fn create_node_without_any_host_fails_the_task() {
    let f = fixture().await;

    let task_id = f.plane.orchestrator.create_node(spec("vm-nowhere")).unwrap();
    let task = f.plane.tasks.join(&task_id).await.unwrap();
    assert_eq!(task.state, TaskState::Exception);
    assert!(task
        .messages
        .iter()
        .any(|m| m.contains("no active host")));
}

#[tokio::test]
async fn create_node_rejects_invalid_specs_synchronously() {
    let f = fixture().await;

    let mut bad = spec("");
    assert!(matches!(
        f.plane.orchestrator.create_node(bad.clone()).unwrap_err(),
        Error::Validation(_)
    ));
    bad = spec("vm-1");
    bad.vcpus = 0;
    assert!(matches!(
        f.plane.orchestrator.create_node(bad).unwrap_err(),
        Error::Validation(_)
    ));
}

#[tokio::test]
async fn failed_define_releases_the_reservation() {
    let f = fixture().await;
    f.connector.inject_failures(
        "test:///h1",
        aviary::core::driver::FailureInjection {
            fail_define: Some("no space left on device".to_string()),
            ..Default::default()
        },
    );
    let host = f
        .plane
        .registry
        .add_host("test:///h1", "h1", BTreeMap::new())
        .await
        .unwrap();

    let task_id = f.plane.orchestrator.create_node(spec("vm-1")).unwrap();
    let task = f.plane.tasks.join(&task_id).await.unwrap();
    assert_eq!(task.state, TaskState::Exception);

    let host = f.plane.registry.get(&host.id).await.unwrap();
    assert_eq!(host.allocated.vcpus, 0);
    assert_eq!(host.allocated.mem_mib, 0);
}

#[tokio::test]
async fn base_images_are_fetched_once_and_cached() {
    let f = fixture().await;
    f.plane
        .registry
        .add_host("test:///h1", "h1", BTreeMap::new())
        .await
        .unwrap();

    let mut server = mockito::Server::new_async().await;
    let image = server
        .mock("GET", "/images/base.qcow2")
        .with_status(200)
        .with_body(b"qcow2-bytes")
        .expect(1)
        .create_async()
        .await;

    // Unique node names to avoid conflicts between the two creates.
    let run: u32 = rand::thread_rng().gen();
    for i in 0..2 {
        let mut node_spec = spec(&format!("cached-{run}-{i}"));
        node_spec.image_url = Some(format!("{}/images/base.qcow2", server.url()));
        let task_id = f.plane.orchestrator.create_node(node_spec).unwrap();
        let task = f.plane.tasks.join(&task_id).await.unwrap();
        assert_eq!(task.state, TaskState::Completed);
    }

    image.assert_async().await;
    assert!(f._dir.path().join("images/base.qcow2").exists());
}

#[tokio::test]
async fn delete_node_removes_artifacts_and_releases_capacity() {
    let f = fixture().await;
    let host = f
        .plane
        .registry
        .add_host("test:///h1", "h1", BTreeMap::new())
        .await
        .unwrap();

    let task_id = f.plane.orchestrator.create_node(spec("vm-1")).unwrap();
    f.plane.tasks.join(&task_id).await.unwrap();
    let mut stream = f.plane.events.subscribe();

    let task_id = f.plane.orchestrator.delete_node("vm-1", true).unwrap();
    let task = f.plane.tasks.join(&task_id).await.unwrap();
    assert_eq!(task.state, TaskState::Completed);

    assert!(f.connector.system("test:///h1", "vm-1").is_none());
    assert!(!f._dir.path().join("seeds/vm-1.iso").exists());
    assert!(!f._dir.path().join("volumes/vm-1.qcow2").exists());

    let host = f.plane.registry.get(&host.id).await.unwrap();
    assert_eq!(host.allocated.vcpus, 0);

    let event = tokio::time::timeout(Duration::from_secs(5), stream.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.event_type, "SystemDeleted");
    assert_eq!(event.payload["systemId"], "vm-1");
}

#[tokio::test]
async fn delete_node_keeps_volume_unless_asked() {
    let f = fixture().await;
    f.plane
        .registry
        .add_host("test:///h1", "h1", BTreeMap::new())
        .await
        .unwrap();

    let task_id = f.plane.orchestrator.create_node(spec("vm-1")).unwrap();
    f.plane.tasks.join(&task_id).await.unwrap();

    let task_id = f.plane.orchestrator.delete_node("vm-1", false).unwrap();
    let task = f.plane.tasks.join(&task_id).await.unwrap();
    assert_eq!(task.state, TaskState::Completed);

    assert!(!f._dir.path().join("seeds/vm-1.iso").exists());
    assert!(f._dir.path().join("volumes/vm-1.qcow2").exists());
}

#[tokio::test]
async fn batch_create_fans_out_under_one_parent_task() {
    let f = fixture().await;
    f.connector.set_capacity("test:///h1", HostCapacity { vcpus: 32, mem_mib: 65536 });
    f.plane
        .registry
        .add_host("test:///h1", "h1", BTreeMap::new())
        .await
        .unwrap();

    let parent_id = f
        .plane
        .orchestrator
        .batch_create(BatchRequest {
            name_prefix: "worker".to_string(),
            start_index: 1,
            zero_pad: 2,
            count: 3,
            max_concurrency: 2,
            spec: spec("template"),
        })
        .unwrap();

    let parent = f.plane.tasks.join(&parent_id).await.unwrap();
    assert_eq!(parent.state, TaskState::Completed);
    assert_eq!(parent.percent, 100);
    assert!(parent
        .messages
        .iter()
        .any(|m| m.contains("Batch starting: 3 nodes")));
    assert!(parent
        .messages
        .iter()
        .any(|m| m.contains("3 succeeded, 0 failed")));

    for name in ["worker01", "worker02", "worker03"] {
        assert!(f.connector.system("test:///h1", name).is_some(), "{name} missing");
    }

    // One child task per node, plus the parent.
    let tasks = f.plane.tasks.list();
    let children = tasks
        .iter()
        .filter(|t| t.name.starts_with("Create node worker"))
        .count();
    assert_eq!(children, 3);
    assert!(tasks.iter().all(|t| t.state == TaskState::Completed));
}

#[tokio::test]
async fn snapshot_lifecycle_is_task_tracked() {
    let f = fixture().await;
    f.plane
        .registry
        .add_host("test:///h1", "h1", BTreeMap::new())
        .await
        .unwrap();

    let task_id = f.plane.orchestrator.create_node(spec("vm-1")).unwrap();
    f.plane.tasks.join(&task_id).await.unwrap();

    let task_id = f
        .plane
        .orchestrator
        .create_snapshot("vm-1", "pre-upgrade")
        .unwrap();
    let task = f.plane.tasks.join(&task_id).await.unwrap();
    assert_eq!(task.state, TaskState::Completed);

    let task_id = f
        .plane
        .orchestrator
        .revert_snapshot("vm-1", "pre-upgrade")
        .unwrap();
    let task = f.plane.tasks.join(&task_id).await.unwrap();
    assert_eq!(task.state, TaskState::Completed);

    // Reverting to a snapshot that never existed fails the task.
    let task_id = f
        .plane
        .orchestrator
        .revert_snapshot("vm-1", "never-taken")
        .unwrap();
    let task = f.plane.tasks.join(&task_id).await.unwrap();
    assert_eq!(task.state, TaskState::Exception);

    let task_id = f
        .plane
        .orchestrator
        .delete_snapshot("vm-1", "pre-upgrade")
        .unwrap();
    let task = f.plane.tasks.join(&task_id).await.unwrap();
    assert_eq!(task.state, TaskState::Completed);
}

#[tokio::test]
async fn batch_create_validates_inputs() {
    let f = fixture().await;

    let request = BatchRequest {
        name_prefix: "worker".to_string(),
        start_index: 1,
        zero_pad: 2,
        count: 0,
        max_concurrency: 2,
        spec: spec("template"),
    };
    assert!(matches!(
        f.plane.orchestrator.batch_create(request).unwrap_err(),
        Error::Validation(_)
    ));
}
