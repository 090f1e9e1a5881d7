//! Everything one operation needs, built once per run from the loaded
//! model and passed down explicitly.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::cluster::{ClusterControl, VcsCluster};
use crate::cmd::CommandRunner;
use crate::credentials::Decrypter;
use crate::drivers::{
    ClusteredNas, NasDriver, NasLogin, NaviSan, RpcVolDriver, SanDriver, SanLogin, UemSan,
    UnifiedNas, VolDriver,
};
use crate::error::{Error, Result};
use crate::model::{
    DatabaseKind, GroupKind, Model, PoolId, ProviderId, ProviderKind, StorageProvider,
    VendorFamily,
};
use crate::quiesce::{
    DirectoryQuiescer, GraphQuiescer, GroupRef, ObjectQuiescer, Quiescer, RelationalQuiescer,
};
use crate::rpc::RpcClient;
use crate::settings::Settings;

/// Builds drivers for the providers found in the model.
pub trait DriverFactory: Send + Sync {
    fn san(&self, provider: &StorageProvider, login: SanLogin) -> Result<Arc<dyn SanDriver>>;

    fn nas(&self, provider: &StorageProvider, login: NasLogin) -> Result<Arc<dyn NasDriver>>;

    fn vol(&self) -> Arc<dyn VolDriver>;

    /// Cluster control over the given members (cluster name -> hostnames).
    fn cluster(&self, members: BTreeMap<String, Vec<String>>) -> Arc<dyn ClusterControl>;

    fn rpc(&self) -> RpcClient;
}

/// Production drivers: vendor CLIs through `runner`, agents through `rpc`.
pub struct VendorDriverFactory {
    settings: Settings,
    runner: Arc<dyn CommandRunner>,
    rpc: RpcClient,
}

impl VendorDriverFactory {
    pub fn new(settings: Settings, runner: Arc<dyn CommandRunner>, rpc: RpcClient) -> Self {
        Self {
            settings,
            runner,
            rpc,
        }
    }
}

impl DriverFactory for VendorDriverFactory {
    fn san(&self, provider: &StorageProvider, login: SanLogin) -> Result<Arc<dyn SanDriver>> {
        match provider.family {
            VendorFamily::LegacyBlock => Ok(Arc::new(NaviSan::new(
                login,
                &self.settings.san,
                self.runner.clone(),
            ))),
            VendorFamily::UnifiedBlock => Ok(Arc::new(UemSan::new(
                login,
                &self.settings.san,
                self.runner.clone(),
            ))),
            other => Err(Error::InvalidConfig(format!(
                "{} is a {} provider, not a SAN",
                provider.name, other
            ))),
        }
    }

    fn nas(&self, provider: &StorageProvider, login: NasLogin) -> Result<Arc<dyn NasDriver>> {
        match provider.family {
            VendorFamily::ClusteredNas => Ok(Arc::new(ClusteredNas::new(
                login,
                &self.settings.nas,
                self.runner.clone(),
            ))),
            VendorFamily::UnifiedNas => Ok(Arc::new(UnifiedNas::new(
                login,
                &self.settings.san.unified_cli,
                self.runner.clone(),
            ))),
            other => Err(Error::InvalidConfig(format!(
                "{} is a {} provider, not a NAS",
                provider.name, other
            ))),
        }
    }

    fn vol(&self) -> Arc<dyn VolDriver> {
        Arc::new(RpcVolDriver::new(self.rpc.clone(), self.settings.lvm.tag.clone()))
    }

    fn cluster(&self, members: BTreeMap<String, Vec<String>>) -> Arc<dyn ClusterControl> {
        Arc::new(VcsCluster::new(self.rpc.clone(), members, &self.settings.timeouts))
    }

    fn rpc(&self) -> RpcClient {
        self.rpc.clone()
    }
}

/// Drivers, cluster control and model of one run.
pub struct Context {
    pub settings: Settings,
    pub model: Model,
    pub rpc: RpcClient,
    pub cluster: Arc<dyn ClusterControl>,
    pub vol: Arc<dyn VolDriver>,
    pub decrypter: Arc<dyn Decrypter>,
    sans: BTreeMap<ProviderId, Arc<dyn SanDriver>>,
    nases: BTreeMap<ProviderId, Arc<dyn NasDriver>>,
}

impl Context {
    /// Resolve credentials and build a driver per storage provider.
    pub async fn build(
        settings: Settings,
        model: Model,
        factory: &dyn DriverFactory,
        decrypter: Arc<dyn Decrypter>,
    ) -> Result<Self> {
        let mut sans = BTreeMap::new();
        let mut nases = BTreeMap::new();
        for id in model.list_storage_providers() {
            let provider = model.provider(id);
            let password = decrypter
                .password(&provider.password_key, &provider.user)
                .await?;
            match provider.kind() {
                ProviderKind::San => {
                    let login = SanLogin {
                        array: provider.name.clone(),
                        spa: provider.primary_ip.clone(),
                        spb: provider.secondary_ip.clone(),
                        user: provider.user.clone(),
                        password,
                        scope: provider
                            .login_scope
                            .clone()
                            .unwrap_or_else(|| settings.san.scope.clone()),
                    };
                    sans.insert(id, factory.san(provider, login)?);
                }
                ProviderKind::Nas => {
                    let login = NasLogin {
                        console: provider.name.clone(),
                        address: provider.primary_ip.clone(),
                        user: provider.user.clone(),
                        password,
                    };
                    nases.insert(id, factory.nas(provider, login)?);
                }
            }
            debug!(provider = %provider.name, family = %provider.family, "Driver ready");
        }

        let members = model
            .list_clusters()
            .into_iter()
            .map(|id| {
                let cluster = model.cluster(id);
                let hosts = cluster
                    .nodes
                    .iter()
                    .map(|n| model.node(*n).hostname.clone())
                    .collect();
                (cluster.name.clone(), hosts)
            })
            .collect();

        info!(sans = sans.len(), nases = nases.len(), "Storage drivers ready");
        Ok(Self {
            rpc: factory.rpc(),
            cluster: factory.cluster(members),
            vol: factory.vol(),
            settings,
            model,
            decrypter,
            sans,
            nases,
        })
    }

    pub fn san(&self, provider: ProviderId) -> Result<Arc<dyn SanDriver>> {
        self.sans.get(&provider).cloned().ok_or_else(|| {
            Error::Internal(format!("no SAN driver for {}", self.model.provider(provider).name))
        })
    }

    pub fn nas(&self, provider: ProviderId) -> Result<Arc<dyn NasDriver>> {
        self.nases.get(&provider).cloned().ok_or_else(|| {
            Error::Internal(format!("no NAS driver for {}", self.model.provider(provider).name))
        })
    }

    pub fn san_of_pool(&self, pool: PoolId) -> Result<Arc<dyn SanDriver>> {
        self.san(self.model.pool(pool).provider)
    }

    pub fn nas_of_pool(&self, pool: PoolId) -> Result<Arc<dyn NasDriver>> {
        self.nas(self.model.pool(pool).provider)
    }

    pub fn sans(&self) -> impl Iterator<Item = (&ProviderId, &Arc<dyn SanDriver>)> {
        self.sans.iter()
    }

    pub fn nases(&self) -> impl Iterator<Item = (&ProviderId, &Arc<dyn NasDriver>)> {
        self.nases.iter()
    }

    fn group_pattern(&self, kind: DatabaseKind) -> &str {
        let db = &self.settings.databases;
        match kind {
            DatabaseKind::Graph => &db.graph_group_pattern,
            DatabaseKind::Relational => &db.relational_group_pattern,
            DatabaseKind::Object => &db.object_group_pattern,
            DatabaseKind::Directory => &db.directory_group_pattern,
        }
    }

    /// The service group of a database, `None` when it is not deployed.
    pub fn group_ref(&self, kind: DatabaseKind) -> Result<Option<GroupRef>> {
        let groups = self.model.groups_matching(self.group_pattern(kind))?;
        Ok(groups.first().map(|id| {
            let group = self.model.group(*id);
            GroupRef {
                cluster: self.model.cluster(group.cluster).name.clone(),
                group: group.cluster_name.clone(),
                hosts: group
                    .nodes
                    .iter()
                    .map(|n| self.model.node(*n).hostname.clone())
                    .collect(),
            }
        }))
    }

    /// Failover or parallel, `None` when the group is not deployed.
    pub fn group_kind(&self, kind: DatabaseKind) -> Result<Option<GroupKind>> {
        let groups = self.model.groups_matching(self.group_pattern(kind))?;
        Ok(groups.first().map(|id| self.model.group(*id).kind))
    }

    /// Quiescer of a database, `None` when its service group is not deployed.
    pub fn quiescer(&self, kind: DatabaseKind) -> Result<Option<Arc<dyn Quiescer>>> {
        let Some(group) = self.group_ref(kind)? else {
            return Ok(None);
        };
        let db = &self.settings.databases;
        let quiescer: Arc<dyn Quiescer> = match kind {
            DatabaseKind::Graph => Arc::new(GraphQuiescer::new(
                self.rpc.clone(),
                self.cluster.clone(),
                group,
                db,
                &self.settings.timeouts,
            )),
            DatabaseKind::Relational => Arc::new(RelationalQuiescer::new(
                self.rpc.clone(),
                self.cluster.clone(),
                self.decrypter.clone(),
                group,
                db,
            )),
            DatabaseKind::Object => Arc::new(ObjectQuiescer::new(
                self.rpc.clone(),
                self.cluster.clone(),
                group,
                db,
            )),
            DatabaseKind::Directory => Arc::new(DirectoryQuiescer::new(
                self.rpc.clone(),
                self.cluster.clone(),
                group,
                db,
            )),
        };
        Ok(Some(quiescer))
    }
}
