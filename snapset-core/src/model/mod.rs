//! Deployment model reader.
//!
//! [`ModelReader::load`] walks the deployment manager's model once and
//! builds a [`Model`]: a read-only arena of typed items addressed by index
//! handles. Every list operation of the reader runs against that arena.
//!
//! ```text
//! /infrastructure/storage/storage_providers/*        san-emc | sfs-service
//! /deployments/*/clusters/*/nodes/*                  node (+ system/disks, storage_profile)
//! /deployments/*/clusters/*/services/*               vcs-clustered-service
//! /ms                                                management host
//! ```

mod client;
mod types;

pub use client::*;
pub use types::*;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::drivers::LvRecord;
use crate::error::{Error, Result};
use crate::retry::{retry_future, Backoff, RetryAction, RetryPolicy};
use crate::settings::{LvmSettings, ModelSettings, Settings};

const PROVIDERS_PATH: &str = "/infrastructure/storage/storage_providers";
const SERVICES_PATH: &str = "/software/services";
const MS_PATH: &str = "/ms";

/// Reads the deployment model with bounded retries.
pub struct ModelReader {
    client: Arc<dyn ModelClient>,
    settings: Settings,
}

impl ModelReader {
    pub fn new(client: Arc<dyn ModelClient>, settings: Settings) -> Self {
        Self { client, settings }
    }

    pub fn client(&self) -> &Arc<dyn ModelClient> {
        &self.client
    }

    /// Fail with [`Error::PlanRunning`] while the deployment manager runs a plan.
    pub async fn ensure_no_running_plan(&self) -> Result<()> {
        let client = &self.client;
        let running = self.with_retry(move || client.plan_running()).await?;
        if running {
            return Err(Error::PlanRunning);
        }
        info!("No running plans found");
        Ok(())
    }

    /// Walk the model and build the arena.
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<Model> {
        let settings = &self.settings;
        let client = self.client.as_ref();
        let model = self
            .with_retry(move || async move {
                let mut builder = Builder::new(settings);
                builder.walk(client).await?;
                builder.finish()
            })
            .await?;
        info!(
            providers = model.providers.len(),
            luns = model.luns.len(),
            filesystems = model.filesystems.len(),
            nodes = model.nodes.len(),
            groups = model.groups.len(),
            "Deployment model loaded"
        );
        Ok(model)
    }

    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let ModelSettings {
            attempts,
            backoff_secs,
            ..
        } = &self.settings.model;
        let policy = Backoff::fixed((*attempts).max(1), Duration::from_secs(*backoff_secs))
            .label("model read");
        retry_future(|_| op(), RetryModel(policy)).await.map_err(|e| match e {
            Error::ModelUnavailable(m) => Error::ModelUnavailable(m),
            Error::InvalidConfig(m) => Error::InvalidConfig(m),
            other => Error::ModelUnavailable(other.to_string()),
        })
    }
}

/// Model reads retry on unavailability only.
struct RetryModel(Backoff);

impl RetryPolicy<Error> for RetryModel {
    fn on_err(&mut self, attempt: u32, err: Error) -> RetryAction<Error> {
        match err {
            Error::ModelUnavailable(_) => self.0.clone().retry_all().on_err(attempt, err),
            other => RetryAction::ReturnError(other),
        }
    }
}

/// Read-only arena of model items.
#[derive(Debug, Clone, Default)]
pub struct Model {
    providers: Vec<StorageProvider>,
    pools: Vec<StoragePool>,
    luns: Vec<Lun>,
    filesystems: Vec<NasFilesystem>,
    clusters: Vec<Cluster>,
    nodes: Vec<ClusterNode>,
    groups: Vec<ServiceGroup>,
    /// Modeled snappable volumes on locally attached disks, by hostname.
    node_volumes: BTreeMap<String, Vec<LocalVolume>>,
    ms_hostname: String,
    ms_volumes: Vec<LocalVolume>,
    /// Management host filesystems that are neither Applied nor Initial.
    ms_unapplied: Vec<String>,
    /// Removal-candidate services no longer present in the model.
    absent_services: BTreeSet<String>,
    lvm: LvmSettings,
    rack: bool,
}

impl Model {
    // =========================================================================
    // Handle lookups
    // =========================================================================

    pub fn provider(&self, id: ProviderId) -> &StorageProvider {
        &self.providers[id.0]
    }

    pub fn pool(&self, id: PoolId) -> &StoragePool {
        &self.pools[id.0]
    }

    pub fn lun(&self, id: LunId) -> &Lun {
        &self.luns[id.0]
    }

    pub fn filesystem(&self, id: FsId) -> &NasFilesystem {
        &self.filesystems[id.0]
    }

    pub fn cluster(&self, id: ClusterId) -> &Cluster {
        &self.clusters[id.0]
    }

    pub fn node(&self, id: NodeId) -> &ClusterNode {
        &self.nodes[id.0]
    }

    pub fn group(&self, id: GroupId) -> &ServiceGroup {
        &self.groups[id.0]
    }

    /// Provider owning a pool.
    pub fn provider_of(&self, pool: PoolId) -> &StorageProvider {
        self.provider(self.pool(pool).provider)
    }

    pub fn ms_hostname(&self) -> &str {
        &self.ms_hostname
    }

    /// Rack deployments use a different set of graph database LUNs.
    pub fn is_rack(&self) -> bool {
        self.rack
    }

    pub fn find_cluster(&self, name: &str) -> Option<ClusterId> {
        self.clusters
            .iter()
            .position(|c| c.name == name)
            .map(ClusterId)
    }

    // =========================================================================
    // Listing
    // =========================================================================

    pub fn list_storage_providers(&self) -> Vec<ProviderId> {
        (0..self.providers.len()).map(ProviderId).collect()
    }

    pub fn list_clusters(&self) -> Vec<ClusterId> {
        (0..self.clusters.len()).map(ClusterId).collect()
    }

    /// LUNs with `snap_size > 0`; database LUNs carry their [`DatabaseKind`].
    pub fn list_snappable_luns(&self) -> Vec<LunId> {
        self.luns
            .iter()
            .enumerate()
            .filter(|(_, lun)| lun.snap_size > 0)
            .map(|(i, _)| LunId(i))
            .collect()
    }

    /// NAS filesystems with `snap_size > 0`.
    pub fn list_snappable_filesystems(&self) -> Vec<FsId> {
        self.filesystems
            .iter()
            .enumerate()
            .filter(|(_, fs)| fs.snap_size > 0)
            .map(|(i, _)| FsId(i))
            .collect()
    }

    /// Snappable local volumes per host and volume group.
    ///
    /// `ms_live` is the management host's live LVM listing; root volume
    /// group volumes found there but absent from the model are added,
    /// except swap.
    pub fn list_snappable_local_volumes(&self, ms_live: &[LvRecord]) -> Result<LocalVolumeMap> {
        if !self.ms_unapplied.is_empty() {
            return Err(Error::InvalidState(format!(
                "file system(s) '{}' are not in Applied state",
                self.ms_unapplied.join(", ")
            )));
        }

        let mut map = LocalVolumeMap::new();
        for (host, volumes) in &self.node_volumes {
            for volume in volumes {
                map.entry(host.clone())
                    .or_default()
                    .entry(volume.vg.clone())
                    .or_default()
                    .push(volume.clone());
            }
        }

        let mut ms_volumes = self.ms_volumes.clone();
        for volume in ms_volumes.iter_mut() {
            // Kickstart volumes keep their installed name; find it by mount point.
            if volume.vg != self.lvm.ms_root_vg {
                continue;
            }
            let live = ms_live.iter().find(|lv| {
                lv.vg == volume.vg
                    && lv.is_origin_or_plain()
                    && lv.mount_point.is_some()
                    && lv.mount_point == volume.mount_point
            });
            if let Some(live) = live {
                volume.lv = live.name.clone();
                volume.path = live.path.clone();
            }
        }

        for lv in ms_live {
            if lv.vg != self.lvm.ms_root_vg || !lv.is_origin_or_plain() {
                continue;
            }
            if lv.fs_type.as_deref() == Some("swap") {
                debug!(lv = %lv.name, "Skipping swap volume");
                continue;
            }
            if ms_volumes.iter().any(|v| v.vg == lv.vg && v.lv == lv.name) {
                continue;
            }
            ms_volumes.push(LocalVolume {
                vg: lv.vg.clone(),
                lv: lv.name.clone(),
                path: lv.path.clone(),
                snap_size: self.lvm.kickstart_snap_percent,
                mount_point: lv.mount_point.clone(),
                modeled: false,
            });
        }

        for volume in ms_volumes {
            map.entry(self.ms_hostname.clone())
                .or_default()
                .entry(volume.vg.clone())
                .or_default()
                .push(volume);
        }
        Ok(map)
    }

    /// Hosts of every service group whose cluster name matches `pattern`.
    pub fn list_service_group_hosts(&self, pattern: &str) -> Result<Vec<NodeId>> {
        let mut hosts = Vec::new();
        for group in self.groups_matching(pattern)? {
            for node in &self.group(group).nodes {
                if !hosts.contains(node) {
                    hosts.push(*node);
                }
            }
        }
        Ok(hosts)
    }

    /// Service groups whose cluster name matches `pattern`.
    pub fn groups_matching(&self, pattern: &str) -> Result<Vec<GroupId>> {
        let re = anchored(pattern)?;
        Ok(self
            .groups
            .iter()
            .enumerate()
            .filter(|(_, g)| re.is_match(&g.cluster_name))
            .map(|(i, _)| GroupId(i))
            .collect())
    }

    /// Pools of a provider.
    pub fn pools_of(&self, provider: ProviderId) -> &[PoolId] {
        &self.provider(provider).pools
    }

    /// Filesystems of `pool` whose owning service has left the model.
    pub fn filesystems_for_removal(&self, pool: PoolId) -> Vec<String> {
        let pool = &self.pool(pool).name;
        self.absent_services
            .iter()
            .map(|svc| format!("{}-{}", pool, svc.to_lowercase()))
            .collect()
    }

    /// Database LUNs of `kind`.
    pub fn database_luns(&self, kind: DatabaseKind) -> Vec<LunId> {
        self.list_snappable_luns()
            .into_iter()
            .filter(|id| self.lun(*id).database == Some(kind))
            .collect()
    }
}

fn anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})$", pattern))
        .map_err(|e| Error::InvalidConfig(format!("bad pattern '{}': {}", pattern, e)))
}

/// Walks the model tree into a [`Model`].
struct Builder<'a> {
    settings: &'a Settings,
    model: Model,
    pool_index: HashMap<String, PoolId>,
    lun_index: HashMap<String, LunId>,
    exclude: Vec<Regex>,
}

/// A node's view needed to decide local-disk volumes and directory LUNs.
struct NodeStorage {
    /// disk name -> lun name, for lun-disk items.
    lun_disks: HashMap<String, String>,
    /// Volume groups: (item id, vg name, physical device names, file systems).
    volume_groups: Vec<(String, String, Vec<String>, Vec<ModelItem>)>,
}

impl<'a> Builder<'a> {
    fn new(settings: &'a Settings) -> Self {
        Self {
            settings,
            model: Model {
                lvm: settings.lvm.clone(),
                ..Model::default()
            },
            pool_index: HashMap::new(),
            lun_index: HashMap::new(),
            exclude: Vec::new(),
        }
    }

    async fn walk(&mut self, client: &dyn ModelClient) -> Result<()> {
        self.exclude = self
            .settings
            .databases
            .exclude_patterns
            .iter()
            .map(|p| anchored(p))
            .collect::<Result<_>>()?;

        if let Some(item) = client.get(&self.settings.model.deployment_type_path).await? {
            let value = item.property("value").unwrap_or_default();
            self.model.rack = anchored(&self.settings.model.rack_deployment_pattern)?.is_match(value);
        }

        self.walk_providers(client).await?;
        self.walk_deployments(client).await?;
        self.walk_ms(client).await?;

        for svc in &self.settings.nas.removal_services {
            if client.get(&format!("{}/{}", SERVICES_PATH, svc)).await?.is_none() {
                self.model.absent_services.insert(svc.clone());
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<Model> {
        Ok(self.model)
    }

    async fn walk_providers(&mut self, client: &dyn ModelClient) -> Result<()> {
        for item in client.children(PROVIDERS_PATH).await? {
            let type_property = match item.item_type.as_str() {
                "san-emc" => item.property("san_type"),
                "sfs-service" => item.property("nas_type"),
                _ => continue,
            }
            .unwrap_or_default();
            let Some(family) = VendorFamily::from_model(&item.item_type, type_property) else {
                warn!(provider = %item.id, kind = %type_property, "Unsupported storage provider type, skipping");
                continue;
            };

            // NAS consoles without a management address are not managed here.
            let primary_ip = match family.kind() {
                ProviderKind::San => item.property("ip_a"),
                ProviderKind::Nas => item.property("management_ipv4"),
            };
            let Some(primary_ip) = primary_ip else {
                debug!(provider = %item.id, "No management address, skipping");
                continue;
            };

            let provider_id = ProviderId(self.model.providers.len());
            let mut provider = StorageProvider {
                name: item.property("name").unwrap_or(&item.id).to_string(),
                family,
                primary_ip: primary_ip.to_string(),
                secondary_ip: item.property("ip_b").map(String::from),
                user: item
                    .property("username")
                    .or_else(|| item.property("user_name"))
                    .unwrap_or_default()
                    .to_string(),
                password_key: item.property("password_key").unwrap_or_default().to_string(),
                login_scope: item.property("login_scope").map(String::from),
                pools: Vec::new(),
            };

            match family.kind() {
                ProviderKind::San => {
                    for container in client
                        .children(&format!("{}/storage_containers", item.path))
                        .await?
                    {
                        let name = container.property("name").unwrap_or(&container.id).to_string();
                        provider.pools.push(self.add_pool(provider_id, name));
                    }
                }
                ProviderKind::Nas => {
                    for pool in client.children(&format!("{}/pools", item.path)).await? {
                        let name = pool.property("name").unwrap_or(&pool.id).to_string();
                        let pool_id = self.add_pool(provider_id, name);
                        provider.pools.push(pool_id);
                        self.walk_filesystems(client, pool_id, &pool.path).await?;
                    }
                }
            }
            self.model.providers.push(provider);
        }
        Ok(())
    }

    fn add_pool(&mut self, provider: ProviderId, name: String) -> PoolId {
        let id = PoolId(self.model.pools.len());
        self.pool_index.insert(name.clone(), id);
        self.model.pools.push(StoragePool { provider, name });
        id
    }

    async fn walk_filesystems(
        &mut self,
        client: &dyn ModelClient,
        pool: PoolId,
        pool_path: &str,
    ) -> Result<()> {
        for fs in client.children(&format!("{}/file_systems", pool_path)).await? {
            let path = fs.property("path").unwrap_or(&fs.id);
            let name = path.rsplit('/').next().unwrap_or(path).to_string();
            let mut exports = Vec::new();
            for export in client.children(&format!("{}/exports", fs.path)).await? {
                let options = export.property("options").unwrap_or_default();
                for client_addr in export.list_property("ipv4allowed_clients") {
                    exports.push(NfsExport::new(client_addr, options));
                }
            }
            self.model.filesystems.push(NasFilesystem {
                pool,
                name,
                size_mb: fs.property("size").and_then(parse_size_mb).unwrap_or(0),
                snap_size: clamp_percent(fs.int_property("snap_size")),
                exports,
            });
        }
        Ok(())
    }

    async fn walk_deployments(&mut self, client: &dyn ModelClient) -> Result<()> {
        let mut directory_hosts: Vec<NodeId> = Vec::new();
        let mut storage: HashMap<NodeId, NodeStorage> = HashMap::new();
        let directory_re = anchored(&self.settings.databases.directory_group_pattern)?;

        for deployment in client.children("/deployments").await? {
            for cluster in client.children(&format!("{}/clusters", deployment.path)).await? {
                let cluster_id = ClusterId(self.model.clusters.len());
                self.model.clusters.push(Cluster {
                    name: cluster.id.clone(),
                    nodes: Vec::new(),
                    groups: Vec::new(),
                });

                let mut by_item_id = HashMap::new();
                for node in client.children(&format!("{}/nodes", cluster.path)).await? {
                    let node_id = NodeId(self.model.nodes.len());
                    self.model.nodes.push(ClusterNode {
                        item_id: node.id.clone(),
                        hostname: node.property("hostname").unwrap_or(&node.id).to_string(),
                        cluster: cluster_id,
                        state: node.state.clone(),
                    });
                    self.model.clusters[cluster_id.0].nodes.push(node_id);
                    by_item_id.insert(node.id.clone(), node_id);

                    let node_storage = self.walk_node_storage(client, node_id, &node.path).await?;
                    storage.insert(node_id, node_storage);
                }

                for service in client.children(&format!("{}/services", cluster.path)).await? {
                    if service.item_type != "vcs-clustered-service" {
                        continue;
                    }
                    let nodes: Vec<NodeId> = service
                        .list_property("node_list")
                        .iter()
                        .filter_map(|n| by_item_id.get(n).copied())
                        .collect();
                    let kind = if service.int_property("active") > 1 {
                        GroupKind::Parallel
                    } else {
                        GroupKind::Failover
                    };
                    let group_id = GroupId(self.model.groups.len());
                    let cluster_name = format!("Grp_CS_{}_{}", cluster.id, service.id);
                    if directory_re.is_match(&cluster_name) {
                        directory_hosts.extend(nodes.iter().copied());
                    }
                    self.model.groups.push(ServiceGroup {
                        item_id: service.id.clone(),
                        cluster_name,
                        cluster: cluster_id,
                        kind,
                        nodes,
                    });
                    self.model.clusters[cluster_id.0].groups.push(group_id);
                }
            }
        }

        // The directory server's data lives on the root LUN of its hosts.
        for host in directory_hosts {
            let Some(node_storage) = storage.get(&host) else { continue };
            for (_, _, devices, file_systems) in &node_storage.volume_groups {
                if !file_systems.iter().any(|fs| fs.property("mount_point") == Some("/")) {
                    continue;
                }
                for device in devices {
                    if let Some(lun_name) = node_storage.lun_disks.get(device) {
                        if let Some(lun) = self.lun_index.get(lun_name) {
                            self.model.luns[lun.0].database = Some(DatabaseKind::Directory);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn walk_node_storage(
        &mut self,
        client: &dyn ModelClient,
        node_id: NodeId,
        node_path: &str,
    ) -> Result<NodeStorage> {
        let mut lun_disks = HashMap::new();
        for disk in client.children(&format!("{}/system/disks", node_path)).await? {
            if disk.item_type != "lun-disk" {
                continue;
            }
            let Some(lun_name) = disk.property("lun_name") else { continue };
            if let Some(name) = disk.property("name") {
                lun_disks.insert(name.to_string(), lun_name.to_string());
            }
            self.add_lun_disk(node_id, lun_name, &disk);
        }

        let mut volume_groups = Vec::new();
        let hostname = self.model.nodes[node_id.0].hostname.clone();
        for vg in client
            .children(&format!("{}/storage_profile/volume_groups", node_path))
            .await?
        {
            let vg_name = vg.property("volume_group_name").unwrap_or(&vg.id).to_string();
            let devices: Vec<String> = client
                .children(&format!("{}/physical_devices", vg.path))
                .await?
                .iter()
                .filter_map(|d| d.property("device_name").map(String::from))
                .collect();
            let file_systems = client.children(&format!("{}/file_systems", vg.path)).await?;

            // Volume groups on SAN LUNs are covered by the LUN snapshots.
            let local = !devices.is_empty() && devices.iter().all(|d| !lun_disks.contains_key(d));
            if local {
                for fs in &file_systems {
                    let snap_size = clamp_percent(fs.int_property("snap_size"));
                    if snap_size == 0 || fs.bool_property("snap_external") {
                        continue;
                    }
                    let lv = format!("{}_{}", vg.id, fs.id);
                    self.model
                        .node_volumes
                        .entry(hostname.clone())
                        .or_default()
                        .push(LocalVolume {
                            path: format!("/dev/{}/{}", vg_name, lv),
                            vg: vg_name.clone(),
                            lv,
                            snap_size,
                            mount_point: fs.property("mount_point").map(String::from),
                            modeled: true,
                        });
                }
            }
            volume_groups.push((vg.id.clone(), vg_name, devices, file_systems));
        }
        Ok(NodeStorage {
            lun_disks,
            volume_groups,
        })
    }

    fn add_lun_disk(&mut self, node_id: NodeId, lun_name: &str, disk: &ModelItem) {
        if self.exclude.iter().any(|re| re.is_match(lun_name)) {
            debug!(lun = %lun_name, "LUN excluded by pattern");
            return;
        }
        if let Some(existing) = self.lun_index.get(lun_name) {
            let lun = &mut self.model.luns[existing.0];
            if !lun.nodes.contains(&node_id) {
                lun.nodes.push(node_id);
            }
            return;
        }
        let container = disk.property("storage_container").unwrap_or_default();
        let Some(pool) = self.pool_index.get(container).copied() else {
            warn!(lun = %lun_name, pool = %container, "LUN pool is not modeled, skipping");
            return;
        };
        let id = LunId(self.model.luns.len());
        self.lun_index.insert(lun_name.to_string(), id);
        self.model.luns.push(Lun {
            pool,
            name: lun_name.to_string(),
            size_mb: disk.property("size").and_then(parse_size_mb).unwrap_or(0),
            snap_size: clamp_percent(disk.int_property("snap_size")),
            database: self.classify(lun_name),
            nodes: vec![node_id],
        });
    }

    fn classify(&self, lun_name: &str) -> Option<DatabaseKind> {
        let db = &self.settings.databases;
        let graph = if self.model.rack {
            &db.rack_graph_luns
        } else {
            &db.graph_luns
        };
        if is_alias(graph, lun_name) {
            Some(DatabaseKind::Graph)
        } else if is_alias(&db.relational_luns, lun_name) {
            Some(DatabaseKind::Relational)
        } else if is_alias(&db.object_luns, lun_name) {
            Some(DatabaseKind::Object)
        } else if is_alias(&db.directory_luns, lun_name) {
            Some(DatabaseKind::Directory)
        } else {
            None
        }
    }

    async fn walk_ms(&mut self, client: &dyn ModelClient) -> Result<()> {
        let Some(ms) = client.get(MS_PATH).await? else {
            return Err(Error::ModelUnavailable("management host item missing".to_string()));
        };
        self.model.ms_hostname = ms.property("hostname").unwrap_or(&ms.id).to_string();

        for vg in client
            .children(&format!("{}/storage_profile/volume_groups", MS_PATH))
            .await?
        {
            let vg_name = vg.property("volume_group_name").unwrap_or(&vg.id).to_string();
            for fs in client.children(&format!("{}/file_systems", vg.path)).await? {
                if fs.state == "Initial" {
                    continue;
                }
                if fs.state != "Applied" {
                    self.model.ms_unapplied.push(fs.id.clone());
                }
                let snap_size = clamp_percent(fs.int_property("snap_size"));
                if snap_size == 0 {
                    continue;
                }
                let lv = format!("{}_{}", vg.id, fs.id);
                self.model.ms_volumes.push(LocalVolume {
                    path: format!("/dev/{}/{}", vg_name, lv),
                    vg: vg_name.clone(),
                    lv,
                    snap_size,
                    mount_point: fs.property("mount_point").map(String::from),
                    modeled: true,
                });
            }
        }
        Ok(())
    }
}

fn is_alias(aliases: &[String], name: &str) -> bool {
    aliases.iter().any(|a| a == name)
}

fn clamp_percent(value: i64) -> u8 {
    value.clamp(0, 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ModelBuilder;

    fn live_lv(vg: &str, name: &str, mount: Option<&str>, fs_type: &str) -> LvRecord {
        LvRecord {
            name: name.to_string(),
            tags: String::new(),
            attr: "-wi-ao----".to_string(),
            path: format!("/dev/{}/{}", vg, name),
            vg: vg.to_string(),
            origin: String::new(),
            snapshot_invalid: false,
            snap_percent: None,
            time: String::new(),
            fs_type: Some(fs_type.to_string()),
            mount_point: mount.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_load_classifies_luns() {
        let client = ModelBuilder::new()
            .san("san1", "vnx2", &["pool1"])
            .db_cluster(&["db-1", "db-2"])
            .lun("db-1", "pool1", "neo4jlun", 100)
            .lun("db-2", "pool1", "neo4jlun", 100)
            .lun("db-1", "pool1", "mysql", 100)
            .lun("db-1", "pool1", "data1", 0)
            .lun("db-1", "pool1", "pool1_SFS_1", 100)
            .build();
        let reader = ModelReader::new(Arc::new(client), Settings::default());
        let model = reader.load().await.unwrap();

        let luns = model.list_snappable_luns();
        assert_eq!(luns.len(), 2);
        let graph = model.database_luns(DatabaseKind::Graph);
        assert_eq!(graph.len(), 1);
        assert_eq!(model.lun(graph[0]).nodes.len(), 2);
        assert_eq!(model.database_luns(DatabaseKind::Relational).len(), 1);
    }

    #[tokio::test]
    async fn test_kickstart_volumes_exclude_swap() {
        let client = ModelBuilder::new()
            .ms_volume("vg1", "vg_root", "var", Some("/var"), 50)
            .build();
        let reader = ModelReader::new(Arc::new(client), Settings::default());
        let model = reader.load().await.unwrap();

        let live = vec![
            live_lv("vg_root", "lv_var", Some("/var"), "ext4"),
            live_lv("vg_root", "lv_home", Some("/home"), "ext4"),
            live_lv("vg_root", "lv_swap", None, "swap"),
        ];
        let map = model.list_snappable_local_volumes(&live).unwrap();
        let volumes = &map[model.ms_hostname()]["vg_root"];
        let names: Vec<&str> = volumes.iter().map(|v| v.lv.as_str()).collect();
        assert_eq!(names, vec!["lv_var", "lv_home"]);
        assert!(volumes[0].modeled);
        assert!(!volumes[1].modeled);
    }

    #[tokio::test]
    async fn test_group_hosts_by_pattern() {
        let client = ModelBuilder::new()
            .db_cluster(&["db-1", "db-2"])
            .service("db_cluster", "neo4j_clustered_service", &["db-1", "db-2"], 2)
            .service("db_cluster", "mysql_clustered_service", &["db-1", "db-2"], 1)
            .build();
        let reader = ModelReader::new(Arc::new(client), Settings::default());
        let model = reader.load().await.unwrap();

        let hosts = model
            .list_service_group_hosts(".*neo4j_clustered_service")
            .unwrap();
        assert_eq!(hosts.len(), 2);
        let groups = model.groups_matching(".*neo4j_clustered_service").unwrap();
        assert_eq!(model.group(groups[0]).kind, GroupKind::Parallel);
        assert_eq!(
            model.group(groups[0]).cluster_name,
            "Grp_CS_db_cluster_neo4j_clustered_service"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_model_is_retried_then_reported() {
        let client = ModelBuilder::new().unavailable().build();
        let reader = ModelReader::new(Arc::new(client), Settings::default());
        let err = reader.load().await.unwrap_err();
        assert!(matches!(err, Error::ModelUnavailable(_)));
    }
}
