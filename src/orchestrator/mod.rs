use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::settings::OrchestratorSettings;
use crate::core::driver::{BootTarget, ResetType, SystemDefinition};
use crate::core::pool::PoolManager;
use crate::core::tasks::{TaskService, TaskState, TaskUpdate};
use crate::errors::{Error, Result};
use crate::events::EventBus;
use crate::scheduler::{HostRegistry, PlacementRequest};

const GIB: u64 = 1024 * 1024 * 1024;

/// Everything needed to provision one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub disk_gib: u64,
    pub network: String,
    pub boot_primary: Option<BootTarget>,
    pub image_url: Option<String>,
    /// Cloud-init user-data passed through to the NoCloud seed.
    pub user_data: Option<String>,
}

/// Fan-out request for provisioning a batch of identically-shaped nodes.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub name_prefix: String,
    pub start_index: u32,
    pub zero_pad: usize,
    pub count: u32,
    pub max_concurrency: usize,
    pub spec: NodeSpec,
}

struct StorageDirs {
    volumes: PathBuf,
    images: PathBuf,
    seeds: PathBuf,
}

/// Turns create/delete/batch requests into task-tracked background work that
/// consults placement and publishes lifecycle events.
pub struct NodeOrchestrator {
    tasks: Arc<TaskService>,
    events: Arc<EventBus>,
    registry: Arc<HostRegistry>,
    pools: Arc<PoolManager>,
    state_dir: PathBuf,
    defaults: OrchestratorSettings,
    http: reqwest::Client,
}

impl NodeOrchestrator {
    pub fn new(
        tasks: Arc<TaskService>,
        events: Arc<EventBus>,
        registry: Arc<HostRegistry>,
        pools: Arc<PoolManager>,
        state_dir: PathBuf,
        defaults: OrchestratorSettings,
    ) -> Self {
        Self {
            tasks,
            events,
            registry,
            pools,
            state_dir,
            defaults,
            http: reqwest::Client::new(),
        }
    }

    fn validate_spec(spec: &NodeSpec) -> Result<()> {
        if spec.name.is_empty() || spec.name.contains(['/', '\0']) {
            return Err(Error::validation("node name must be a non-empty path-safe string"));
        }
        if spec.vcpus == 0 {
            return Err(Error::validation("node needs at least one vcpu"));
        }
        if spec.memory_mib == 0 || spec.disk_gib == 0 {
            return Err(Error::validation("node needs non-zero memory and disk"));
        }
        Ok(())
    }

    async fn storage_dirs(&self) -> Result<StorageDirs> {
        let dirs = StorageDirs {
            volumes: self.state_dir.join("volumes"),
            images: self.state_dir.join("images"),
            seeds: self.state_dir.join("seeds"),
        };
        for dir in [&dirs.volumes, &dirs.images, &dirs.seeds] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(dirs)
    }

    /// Provision a node in the background. Returns the tracking task id.
    pub fn create_node(self: &Arc<Self>, mut spec: NodeSpec) -> Result<String> {
        Self::validate_spec(&spec)?;
        if spec.network.is_empty() {
            spec.network = self.defaults.network_name.clone();
        }
        let orchestrator = Arc::clone(self);
        let task = self
            .tasks
            .run_background(format!("Create node {}", spec.name), move |task_id| {
                orchestrator.run_create(spec, task_id)
            })?;
        Ok(task.id)
    }

    async fn run_create(self: Arc<Self>, spec: NodeSpec, task_id: String) -> Result<()> {
        self.tasks
            .update(&task_id, TaskUpdate::message("Preparing storage"))?;
        let dirs = self.storage_dirs().await?;

        let volume_path = dirs.volumes.join(format!("{}.qcow2", spec.name));
        self.create_volume(&volume_path, spec.disk_gib).await?;
        self.tasks.update(
            &task_id,
            TaskUpdate::progress(10, format!("Volume {} created", volume_path.display())),
        )?;

        if let Some(url) = &spec.image_url {
            self.tasks.update(
                &task_id,
                TaskUpdate::message(format!("Downloading base image {url}")),
            )?;
            self.fetch_image(url, &dirs.images).await?;
            self.tasks
                .update(&task_id, TaskUpdate::progress(30, "Base image ready"))?;
        }

        let seed_path = self.build_seed(&spec, &dirs.seeds).await?;
        self.tasks.update(
            &task_id,
            TaskUpdate::progress(40, format!("Seed created at {}", seed_path.display())),
        )?;

        let host = self
            .registry
            .reserve_placement(&PlacementRequest {
                vcpus: spec.vcpus,
                memory_mib: spec.memory_mib,
                required_labels: None,
            })
            .await?;

        let definition = SystemDefinition {
            name: spec.name.clone(),
            vcpus: spec.vcpus,
            memory_mib: spec.memory_mib,
            disk_path: volume_path,
            seed_iso: Some(seed_path),
            network: spec.network.clone(),
            boot_primary: spec.boot_primary,
        };
        let defined = self
            .pools
            .with_connection(&host.uri, move |handle| handle.define_system(&definition))
            .await;
        if let Err(err) = defined {
            // Give the reservation back; the node never landed.
            let _ = self
                .registry
                .release_allocation(&host.id, spec.vcpus, spec.memory_mib)
                .await;
            return Err(err);
        }
        self.tasks.update(
            &task_id,
            TaskUpdate::progress(80, format!("Defined node on host {}", host.name)),
        )?;

        self.events
            .publish("SystemCreated", json!({ "systemId": spec.name }))
            .await;
        info!(node = %spec.name, host = %host.name, "Node created");
        Ok(())
    }

    async fn create_volume(&self, path: &Path, disk_gib: u64) -> Result<()> {
        let qemu_img = tokio::process::Command::new("qemu-img")
            .arg("create")
            .arg("-f")
            .arg("qcow2")
            .arg(path)
            .arg(format!("{disk_gib}G"))
            .output()
            .await;

        match qemu_img {
            Ok(output) if output.status.success() => Ok(()),
            _ => {
                // qemu-img missing or refused; fall back to a sparse file.
                debug!(path = %path.display(), "qemu-img unavailable, creating sparse volume");
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .open(path)
                    .await?;
                file.set_len(disk_gib * GIB).await?;
                Ok(())
            }
        }
    }

    async fn fetch_image(&self, url: &str, images_dir: &Path) -> Result<PathBuf> {
        let file_name = url
            .split('?')
            .next()
            .unwrap_or(url)
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or("base.qcow2");
        let path = images_dir.join(file_name);
        if tokio::fs::try_exists(&path).await? {
            debug!(image = %path.display(), "Base image already cached");
            return Ok(path);
        }

        let response = self.http.get(url).send().await?.error_for_status()?;
        let mut file = tokio::fs::File::create(&path).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(path)
    }

    /// Write the NoCloud seed (user-data + meta-data) for guest
    /// customization, preferring genisoimage with a flat-file fallback.
    async fn build_seed(&self, spec: &NodeSpec, seeds_dir: &Path) -> Result<PathBuf> {
        let seed_path = seeds_dir.join(format!("{}.iso", spec.name));
        let work_dir = seeds_dir.join(format!(".seed-{}", spec.name));
        tokio::fs::create_dir_all(&work_dir).await?;

        let user_data = spec
            .user_data
            .clone()
            .unwrap_or_else(|| "#cloud-config\nusers: []\n".to_string());
        let meta_data = format!("instance-id: {}\nlocal-hostname: {}\n", spec.name, spec.name);
        let user_data_path = work_dir.join("user-data");
        let meta_data_path = work_dir.join("meta-data");
        tokio::fs::write(&user_data_path, &user_data).await?;
        tokio::fs::write(&meta_data_path, &meta_data).await?;

        let geniso = tokio::process::Command::new("genisoimage")
            .arg("-output")
            .arg(&seed_path)
            .arg("-volid")
            .arg("cidata")
            .arg("-joliet")
            .arg("-rock")
            .arg(&user_data_path)
            .arg(&meta_data_path)
            .output()
            .await;

        if !matches!(&geniso, Ok(output) if output.status.success()) {
            let mut combined = user_data.into_bytes();
            combined.extend_from_slice(meta_data.as_bytes());
            tokio::fs::write(&seed_path, combined).await?;
        }
        Ok(seed_path)
    }

    /// Tear a node down in the background. Returns the tracking task id.
    pub fn delete_node(self: &Arc<Self>, name: &str, delete_storage: bool) -> Result<String> {
        if name.is_empty() {
            return Err(Error::validation("node name required"));
        }
        let orchestrator = Arc::clone(self);
        let name = name.to_string();
        let task = self
            .tasks
            .run_background(format!("Delete node {name}"), move |task_id| {
                orchestrator.run_delete(name, delete_storage, task_id)
            })?;
        Ok(task.id)
    }

    async fn run_delete(
        self: Arc<Self>,
        name: String,
        delete_storage: bool,
        task_id: String,
    ) -> Result<()> {
        self.tasks
            .update(&task_id, TaskUpdate::message("Stopping and undefining"))?;
        let dirs = self.storage_dirs().await?;

        for host in self.registry.list().await {
            let lookup = {
                let name = name.clone();
                self.pools
                    .with_connection(&host.uri, move |handle| handle.get_system(&name))
                    .await
            };
            let Ok(Some(system)) = lookup else { continue };

            let name_for_driver = name.clone();
            let stopped = self
                .pools
                .with_connection(&host.uri, move |handle| {
                    // Power off first; a system that is already off is fine.
                    if let Err(err) = handle.reset_system(&name_for_driver, ResetType::ForceOff) {
                        warn!(node = %name_for_driver, error = %err, "Power-off before undefine failed");
                    }
                    handle.undefine_system(&name_for_driver)
                })
                .await;
            stopped?;
            let _ = self
                .registry
                .release_allocation(&host.id, system.vcpus, system.memory_mib)
                .await;
            break;
        }

        self.tasks
            .update(&task_id, TaskUpdate::progress(50, "Removing artifacts"))?;
        let seed_path = dirs.seeds.join(format!("{name}.iso"));
        if let Err(err) = tokio::fs::remove_file(&seed_path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %seed_path.display(), error = %err, "Failed to remove seed");
            }
        }
        if delete_storage {
            let volume_path = dirs.volumes.join(format!("{name}.qcow2"));
            if let Err(err) = tokio::fs::remove_file(&volume_path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %volume_path.display(), error = %err, "Failed to remove volume");
                }
            }
        }

        self.events
            .publish("SystemDeleted", json!({ "systemId": name }))
            .await;
        info!(node = %name, "Node deleted");
        Ok(())
    }

    /// Snapshot a node wherever it currently runs. Task-tracked like every
    /// other long-running operation.
    pub fn create_snapshot(self: &Arc<Self>, name: &str, snapshot: &str) -> Result<String> {
        self.snapshot_op(name, snapshot, "Snapshot", |handle, system, snap| {
            handle.create_snapshot(system, snap)
        })
    }

    pub fn revert_snapshot(self: &Arc<Self>, name: &str, snapshot: &str) -> Result<String> {
        self.snapshot_op(name, snapshot, "Revert", |handle, system, snap| {
            handle.revert_snapshot(system, snap)
        })
    }

    pub fn delete_snapshot(self: &Arc<Self>, name: &str, snapshot: &str) -> Result<String> {
        self.snapshot_op(name, snapshot, "Delete snapshot of", |handle, system, snap| {
            handle.delete_snapshot(system, snap)
        })
    }

    fn snapshot_op<F>(
        self: &Arc<Self>,
        name: &str,
        snapshot: &str,
        verb: &str,
        op: F,
    ) -> Result<String>
    where
        F: Fn(&dyn crate::core::driver::HypervisorHandle, &str, &str) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        if name.is_empty() || snapshot.is_empty() {
            return Err(Error::validation("node and snapshot name required"));
        }
        let orchestrator = Arc::clone(self);
        let name = name.to_string();
        let snapshot = snapshot.to_string();
        let op = Arc::new(op);
        let task = self.tasks.run_background(
            format!("{verb} node {name} ({snapshot})"),
            move |task_id| async move {
                for host in orchestrator.registry.list().await {
                    let lookup = {
                        let name = name.clone();
                        orchestrator
                            .pools
                            .with_connection(&host.uri, move |handle| handle.get_system(&name))
                            .await
                    };
                    if !matches!(lookup, Ok(Some(_))) {
                        continue;
                    }
                    orchestrator
                        .pools
                        .with_connection(&host.uri, {
                            let op = Arc::clone(&op);
                            let name = name.clone();
                            let snapshot = snapshot.clone();
                            move |handle| op(handle, &name, &snapshot)
                        })
                        .await?;
                    orchestrator.tasks.update(
                        &task_id,
                        TaskUpdate::progress(90, format!("Applied on host {}", host.name)),
                    )?;
                    return Ok(());
                }
                Err(Error::not_found("system", name))
            },
        )?;
        Ok(task.id)
    }

    /// Provision `count` nodes under one parent task, bounded by a
    /// concurrency semaphore. The parent reports aggregate progress and
    /// completes once every child task is terminal.
    pub fn batch_create(self: &Arc<Self>, mut request: BatchRequest) -> Result<String> {
        if request.count == 0 {
            return Err(Error::validation("batch count must be at least 1"));
        }
        if request.max_concurrency == 0 {
            request.max_concurrency = self.defaults.batch_max_concurrency.max(1);
        }
        Self::validate_spec(&NodeSpec {
            name: format!("{}0", request.name_prefix),
            ..request.spec.clone()
        })?;

        let orchestrator = Arc::clone(self);
        let task = self.tasks.run_background(
            format!("Batch create {}x{}", request.name_prefix, request.count),
            move |task_id| orchestrator.run_batch(request, task_id),
        )?;
        Ok(task.id)
    }

    async fn run_batch(self: Arc<Self>, request: BatchRequest, task_id: String) -> Result<()> {
        self.tasks.update(
            &task_id,
            TaskUpdate::message(format!("Batch starting: {} nodes", request.count)),
        )?;

        let semaphore = Arc::new(Semaphore::new(request.max_concurrency));
        let mut children: JoinSet<(String, TaskState)> = JoinSet::new();

        for index in request.start_index..request.start_index + request.count {
            let name = format!(
                "{}{:0width$}",
                request.name_prefix,
                index,
                width = request.zero_pad
            );
            let spec = NodeSpec {
                name: name.clone(),
                ..request.spec.clone()
            };
            let orchestrator = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            children.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (name, TaskState::Exception);
                };
                let child_id = match orchestrator.create_node(spec) {
                    Ok(id) => id,
                    Err(_) => return (name, TaskState::Exception),
                };
                match orchestrator.tasks.join(&child_id).await {
                    Ok(task) => (name, task.state),
                    Err(_) => (name, TaskState::Exception),
                }
            });
        }

        let total = request.count as u64;
        let mut done: u64 = 0;
        let mut failed: u64 = 0;
        while let Some(joined) = children.join_next().await {
            let (name, state) = match joined {
                Ok(result) => result,
                Err(_) => ("<aborted>".to_string(), TaskState::Exception),
            };
            done += 1;
            if state != TaskState::Completed {
                failed += 1;
            }
            // The runner owns the jump to 100 when the batch finishes.
            let percent = ((done * 99) / total) as u8;
            self.tasks.update(
                &task_id,
                TaskUpdate::progress(percent, format!("Node {name}: {state:?}")),
            )?;
        }

        self.tasks.update(
            &task_id,
            TaskUpdate::message(format!(
                "Batch completed: {} succeeded, {} failed",
                done - failed,
                failed
            )),
        )?;
        Ok(())
    }
}
