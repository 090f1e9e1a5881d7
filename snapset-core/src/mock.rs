//! In-memory arrays, consoles, agents, cluster manager and deployment model.
//!
//! Used by the unit and scenario tests, and by `--dry-run` style tooling
//! that wants to exercise a plan without touching real storage.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::agent_api::{AgentReply, AgentRequest};
use crate::cluster::{ClusterControl, FreezeState, GroupState, GroupStates};
use crate::cmd::{CmdError, CmdOutput, CommandLine, CommandRunner};
use crate::context::DriverFactory;
use crate::drivers::{
    ArrayLun, CacheInfo, DestroyOutcome, ExportMap, FsSnap, LunSnap, LvRecord, NasDriver, NasFs,
    NasLogin, SanDriver, SanLogin, SnapOutcome, VolDriver,
};
use crate::error::{Error, Result};
use crate::model::{
    DatabaseKind, LocalVolume, ModelClient, ModelItem, NfsExport, StorageProvider, VendorFamily,
};
use crate::quiesce::{snap_luns, Bracket, BracketOutcome, DbLun, Quiescer};
use crate::rpc::{RpcClient, RpcTransport};
use crate::settings::LvmSettings;

/// Poisoned locks only happen after a panicking test; keep going.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// Commands
// =============================================================================

enum Matcher {
    Pattern(Regex),
    Literal(String),
}

impl Matcher {
    fn new(pattern: &str) -> Self {
        match Regex::new(pattern) {
            Ok(re) => Self::Pattern(re),
            Err(_) => Self::Literal(pattern.to_string()),
        }
    }

    fn is_match(&self, line: &str) -> bool {
        match self {
            Self::Pattern(re) => re.is_match(line),
            Self::Literal(s) => line.contains(s.as_str()),
        }
    }
}

struct Rule {
    matcher: Matcher,
    outputs: VecDeque<CmdOutput>,
}

/// [`CommandRunner`] answering from scripted outputs.
///
/// Rules match the shell form of the command; the first registered rule
/// that matches answers. Unmatched commands exit 127.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every command matching `pattern` with `output`.
    pub fn on(&self, pattern: &str, output: CmdOutput) {
        self.on_sequence(pattern, vec![output]);
    }

    /// Answer with `outputs` in turn; the last one repeats.
    pub fn on_sequence(&self, pattern: &str, outputs: Vec<CmdOutput>) {
        lock(&self.rules).push(Rule {
            matcher: Matcher::new(pattern),
            outputs: outputs.into(),
        });
    }

    /// Every command run so far, in shell form.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn output(&self, cmd: &CommandLine) -> std::result::Result<CmdOutput, CmdError> {
        let line = cmd.to_shell();
        lock(&self.calls).push(line.clone());
        let mut rules = lock(&self.rules);
        let Some(rule) = rules.iter_mut().find(|r| r.matcher.is_match(&line)) else {
            debug!(command = %line, "No scripted output");
            return Ok(CmdOutput::failed(127, format!("no scripted output for: {}", line)));
        };
        let output = if rule.outputs.len() > 1 {
            rule.outputs.pop_front()
        } else {
            rule.outputs.front().cloned()
        };
        Ok(output.unwrap_or_default())
    }
}

// =============================================================================
// Agents
// =============================================================================

type Handler = dyn Fn(&str, &AgentRequest) -> Option<AgentReply> + Send + Sync;

/// [`RpcTransport`] answering from scripted replies, keyed by host and
/// `agent/action` label.
#[derive(Default)]
pub struct MockTransport {
    replies: Mutex<HashMap<(String, String), VecDeque<AgentReply>>>,
    all: Mutex<HashMap<String, AgentReply>>,
    hung: Mutex<HashSet<String>>,
    unreachable: Mutex<HashSet<String>>,
    handler: Mutex<Option<Arc<Handler>>>,
    requests: Mutex<Vec<(String, AgentRequest)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, host: &str, label: &str, reply: AgentReply) {
        self.reply_sequence(host, label, vec![reply]);
    }

    /// Replies in turn; the last one repeats.
    pub fn reply_sequence(&self, host: &str, label: &str, replies: Vec<AgentReply>) {
        lock(&self.replies).insert((host.to_string(), label.to_string()), replies.into());
    }

    /// Reply on every host without a host-specific reply.
    pub fn reply_all(&self, label: &str, reply: AgentReply) {
        lock(&self.all).insert(label.to_string(), reply);
    }

    /// Never answer requests to `host`.
    pub fn hang(&self, host: &str) {
        lock(&self.hung).insert(host.to_string());
    }

    pub fn unreachable(&self, host: &str) {
        lock(&self.unreachable).insert(host.to_string());
    }

    /// Consulted before any scripted reply; `None` falls through.
    pub fn handle<F>(&self, handler: F)
    where
        F: Fn(&str, &AgentRequest) -> Option<AgentReply> + Send + Sync + 'static,
    {
        *lock(&self.handler) = Some(Arc::new(handler));
    }

    /// Requests sent to `host`, oldest first.
    pub fn requests(&self, host: &str) -> Vec<AgentRequest> {
        lock(&self.requests)
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Commands run through the exec agent on `host`.
    pub fn exec_commands(&self, host: &str) -> Vec<String> {
        self.requests(host)
            .into_iter()
            .filter_map(|r| match r {
                AgentRequest::Exec { command, .. } => Some(command.to_string()),
                _ => None,
            })
            .collect()
    }

    fn scripted(&self, host: &str, label: &str) -> Option<AgentReply> {
        let mut replies = lock(&self.replies);
        if let Some(queue) = replies.get_mut(&(host.to_string(), label.to_string())) {
            return if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
        }
        drop(replies);
        lock(&self.all).get(label).cloned()
    }
}

#[async_trait]
impl RpcTransport for MockTransport {
    async fn send(&self, host: &str, request: &AgentRequest) -> Result<AgentReply> {
        lock(&self.requests).push((host.to_string(), request.clone()));
        if lock(&self.hung).contains(host) {
            std::future::pending::<()>().await;
        }
        if lock(&self.unreachable).contains(host) {
            return Err(Error::RpcUnreachable {
                host: host.to_string(),
                message: "connection refused".to_string(),
            });
        }

        let handler = lock(&self.handler).clone();
        if let Some(reply) = handler.and_then(|h| h(host, request)) {
            return Ok(reply);
        }
        let label = request.label();
        Ok(self
            .scripted(host, &label)
            .unwrap_or_else(|| AgentReply::failure(format!("no reply scripted for {}", label))))
    }
}

// =============================================================================
// Cluster manager
// =============================================================================

/// [`ClusterControl`] over in-memory group states. Transitions complete at once.
#[derive(Default)]
pub struct MockCluster {
    states: Mutex<BTreeMap<(String, String), GroupStates>>,
    frozen: Mutex<BTreeMap<(String, String), FreezeState>>,
    transitions: Mutex<Vec<String>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, cluster: &str, group: &str, system: &str, state: GroupState) {
        lock(&self.states)
            .entry((cluster.to_string(), group.to_string()))
            .or_default()
            .insert(system.to_string(), state);
    }

    pub fn set_frozen(&self, cluster: &str, group: &str, frozen: FreezeState) {
        lock(&self.frozen).insert((cluster.to_string(), group.to_string()), frozen);
    }

    /// Transitions requested so far, e.g. `offline Grp_CS_x db-1`.
    pub fn transitions(&self) -> Vec<String> {
        lock(&self.transitions).clone()
    }

    fn record(&self, event: String) {
        lock(&self.transitions).push(event);
    }
}

#[async_trait]
impl ClusterControl for MockCluster {
    async fn state_of(&self, cluster: &str, group: &str) -> Result<GroupStates> {
        Ok(lock(&self.states)
            .get(&(cluster.to_string(), group.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn frozen(&self, cluster: &str, group: &str) -> Result<FreezeState> {
        Ok(lock(&self.frozen)
            .get(&(cluster.to_string(), group.to_string()))
            .copied()
            .unwrap_or_default())
    }

    async fn freeze(&self, cluster: &str, group: &str, persistent: bool) -> Result<()> {
        let mut frozen = lock(&self.frozen);
        let state = frozen
            .entry((cluster.to_string(), group.to_string()))
            .or_default();
        if persistent {
            state.persistent = true;
        } else {
            state.temporary = true;
        }
        drop(frozen);
        self.record(format!("freeze {} persistent={}", group, persistent));
        Ok(())
    }

    async fn unfreeze(&self, cluster: &str, group: &str, persistent: bool) -> Result<()> {
        if let Some(state) = lock(&self.frozen).get_mut(&(cluster.to_string(), group.to_string())) {
            if persistent {
                state.persistent = false;
            } else {
                state.temporary = false;
            }
        }
        self.record(format!("unfreeze {} persistent={}", group, persistent));
        Ok(())
    }

    async fn offline(&self, cluster: &str, group: &str, system: &str) -> Result<()> {
        self.set_state(cluster, group, system, GroupState::Offline);
        self.record(format!("offline {} {}", group, system));
        Ok(())
    }

    async fn online(&self, cluster: &str, group: &str, system: &str) -> Result<()> {
        self.set_state(cluster, group, system, GroupState::Online);
        self.record(format!("online {} {}", group, system));
        Ok(())
    }

    async fn switch(&self, cluster: &str, group: &str, from: &str, to: &str) -> Result<()> {
        self.set_state(cluster, group, from, GroupState::Offline);
        self.set_state(cluster, group, to, GroupState::Online);
        self.record(format!("switch {} {} {}", group, from, to));
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(1)
    }
}

// =============================================================================
// Databases
// =============================================================================

/// A quiescer that records `open <db>`, `snap <db>` and `close <db>` into a
/// log that several quiescers may share.
pub struct MockQuiescer {
    kind: DatabaseKind,
    log: Arc<Mutex<Vec<String>>>,
    fail_open: bool,
}

impl MockQuiescer {
    pub fn new(kind: DatabaseKind, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            kind,
            log,
            fail_open: false,
        }
    }

    /// Opening fails after the bracket recorded a frozen host.
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    fn record(&self, event: &str) {
        lock(&self.log).push(format!("{} {}", event, self.kind));
    }
}

#[async_trait]
impl Quiescer for MockQuiescer {
    fn database(&self) -> DatabaseKind {
        self.kind
    }

    async fn open(&self, bracket: &mut Bracket) -> Result<()> {
        self.record("open");
        bracket.frozen.push(format!("{}-host", self.kind));
        if self.fail_open {
            return Err(Error::InvalidState(format!("{} did not quiesce", self.kind)));
        }
        Ok(())
    }

    async fn snap(&self, _bracket: &Bracket, luns: &[DbLun]) -> Result<BracketOutcome> {
        self.record("snap");
        snap_luns(luns).await
    }

    async fn close(&self, _bracket: &Bracket) -> Result<()> {
        self.record("close");
        Ok(())
    }
}

// =============================================================================
// SAN
// =============================================================================

/// A block array in memory.
pub struct MockSan {
    array: String,
    luns: Mutex<Vec<ArrayLun>>,
    snaps: Mutex<Vec<LunSnap>>,
    subscription: Mutex<HashMap<String, f64>>,
    failing: Mutex<HashSet<String>>,
    transient: Mutex<HashMap<String, u32>>,
    restored: Mutex<Vec<(String, String)>>,
}

impl MockSan {
    pub fn new(array: &str) -> Self {
        Self {
            array: array.to_string(),
            luns: Mutex::new(Vec::new()),
            snaps: Mutex::new(Vec::new()),
            subscription: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            transient: Mutex::new(HashMap::new()),
            restored: Mutex::new(Vec::new()),
        }
    }

    pub fn add_lun(&self, pool: &str, name: &str, id: &str, size_mb: u64) {
        lock(&self.luns).push(ArrayLun {
            id: id.to_string(),
            name: name.to_string(),
            pool: pool.to_string(),
            size_mb,
        });
    }

    pub fn set_subscription(&self, pool: &str, percent: f64) {
        lock(&self.subscription).insert(pool.to_string(), percent);
    }

    /// Every snap of `lun_id` fails with a fatal vendor error.
    pub fn fail_snap(&self, lun_id: &str) {
        lock(&self.failing).insert(lun_id.to_string());
    }

    /// The next `times` snaps of `lun_id` fail with a retryable vendor error.
    pub fn fail_snap_transient(&self, lun_id: &str, times: u32) {
        lock(&self.transient).insert(lun_id.to_string(), times);
    }

    /// Add a snapshot as if taken outside the coordinator.
    pub fn insert_snap(&self, lun_id: &str, name: &str) {
        lock(&self.snaps).push(LunSnap {
            name: name.to_string(),
            lun_id: lun_id.to_string(),
            created: None,
            state: Some("Ready".to_string()),
        });
    }

    pub fn snaps(&self) -> Vec<LunSnap> {
        lock(&self.snaps).clone()
    }

    /// `(lun_id, snap_name)` of every restore so far.
    pub fn restored(&self) -> Vec<(String, String)> {
        lock(&self.restored).clone()
    }
}

#[async_trait]
impl SanDriver for MockSan {
    fn family(&self) -> VendorFamily {
        VendorFamily::LegacyBlock
    }

    fn array(&self) -> &str {
        &self.array
    }

    async fn enumerate(&self, pool: &str) -> Result<Vec<ArrayLun>> {
        Ok(lock(&self.luns)
            .iter()
            .filter(|l| l.pool == pool)
            .cloned()
            .collect())
    }

    async fn pool_subscription(&self, pool: &str) -> Result<f64> {
        Ok(lock(&self.subscription).get(pool).copied().unwrap_or(0.0))
    }

    async fn list_snaps(&self, prefix: &str) -> Result<Vec<LunSnap>> {
        Ok(lock(&self.snaps)
            .iter()
            .filter(|s| s.name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn create_snap(&self, lun_id: &str, snap_name: &str) -> Result<()> {
        if lock(&self.failing).contains(lun_id) {
            return Err(Error::vendor_fatal(format!("lun {}", lun_id), "injected snap failure"));
        }
        if let Some(left) = lock(&self.transient).get_mut(lun_id) {
            if *left > 0 {
                *left -= 1;
                return Err(Error::vendor_transient(format!("lun {}", lun_id), "array busy"));
            }
        }
        self.insert_snap(lun_id, snap_name);
        Ok(())
    }

    async fn restore(&self, lun_id: &str, snap_name: &str, backup_name: &str) -> Result<()> {
        let exists = lock(&self.snaps)
            .iter()
            .any(|s| s.name == snap_name && s.lun_id == lun_id);
        if !exists {
            return Err(Error::vendor_fatal(
                format!("lun {}", lun_id),
                format!("snapshot {} does not exist", snap_name),
            ));
        }
        self.insert_snap(lun_id, backup_name);
        lock(&self.restored).push((lun_id.to_string(), snap_name.to_string()));
        Ok(())
    }

    async fn destroy(&self, snap_name: &str) -> Result<DestroyOutcome> {
        let mut snaps = lock(&self.snaps);
        let before = snaps.len();
        snaps.retain(|s| s.name != snap_name);
        Ok(if snaps.len() < before {
            DestroyOutcome::Destroyed
        } else {
            DestroyOutcome::AlreadyAbsent
        })
    }

    fn snap_command(&self, lun_id: &str, snap_name: &str) -> CommandLine {
        CommandLine::new("mocksnap").args([lun_id, snap_name])
    }
}

// =============================================================================
// NAS
// =============================================================================

struct MockFs {
    pool: String,
    size_mb: u64,
    online: bool,
}

struct MockFsSnap {
    fs: String,
    name: String,
}

/// A NAS console in memory.
pub struct MockNas {
    console: String,
    family: VendorFamily,
    filesystems: Mutex<BTreeMap<String, MockFs>>,
    snaps: Mutex<Vec<MockFsSnap>>,
    caches: Mutex<BTreeMap<String, CacheInfo>>,
    exports: Mutex<BTreeMap<String, Vec<NfsExport>>>,
    dropped: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    events: Mutex<Vec<String>>,
}

impl MockNas {
    pub fn new(console: &str, family: VendorFamily) -> Self {
        Self {
            console: console.to_string(),
            family,
            filesystems: Mutex::new(BTreeMap::new()),
            snaps: Mutex::new(Vec::new()),
            caches: Mutex::new(BTreeMap::new()),
            exports: Mutex::new(BTreeMap::new()),
            dropped: Mutex::new(HashSet::new()),
            failing: Mutex::new(HashSet::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn add_fs(&self, pool: &str, name: &str, size_mb: u64) {
        lock(&self.filesystems).insert(
            name.to_string(),
            MockFs {
                pool: pool.to_string(),
                size_mb,
                online: true,
            },
        );
    }

    pub fn seed_export(&self, fs: &str, export: NfsExport) {
        lock(&self.exports)
            .entry(fs.to_string())
            .or_default()
            .push(export);
    }

    /// Fill a rollback cache to `percent`.
    pub fn set_cache_usage(&self, name: &str, percent: f64) {
        if let Some(cache) = lock(&self.caches).get_mut(name) {
            cache.used_mb = (cache.total_mb as f64 * percent / 100.0).round() as u64;
        }
    }

    /// Accept exports for `client` without applying them.
    pub fn drop_exports_of(&self, client: &str) {
        lock(&self.dropped).insert(client.to_string());
    }

    /// Every restore of `fs` fails with a fatal vendor error.
    pub fn fail_restore(&self, fs: &str) {
        lock(&self.failing).insert(fs.to_string());
    }

    pub fn is_online(&self, fs: &str) -> Option<bool> {
        lock(&self.filesystems).get(fs).map(|f| f.online)
    }

    pub fn exports_of(&self, fs: &str) -> Vec<NfsExport> {
        lock(&self.exports).get(fs).cloned().unwrap_or_default()
    }

    /// Calls so far, e.g. `export pool1-fs1 10.0.0.1`.
    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    fn record(&self, event: String) {
        lock(&self.events).push(event);
    }

    fn require_fs(&self, fs: &str) -> Result<()> {
        if lock(&self.filesystems).contains_key(fs) {
            Ok(())
        } else {
            Err(Error::vendor_fatal(fs, "filesystem does not exist"))
        }
    }
}

#[async_trait]
impl NasDriver for MockNas {
    fn family(&self) -> VendorFamily {
        self.family
    }

    fn console(&self) -> &str {
        &self.console
    }

    async fn enumerate(&self, pool: &str) -> Result<Vec<NasFs>> {
        Ok(lock(&self.filesystems)
            .iter()
            .filter(|(_, f)| f.pool == pool)
            .map(|(name, f)| NasFs {
                name: name.clone(),
                online: f.online,
                size_mb: Some(f.size_mb),
            })
            .collect())
    }

    async fn snap(&self, fs: &str, snap_name: &str, cache: Option<&str>) -> Result<SnapOutcome> {
        self.require_fs(fs)?;
        if let Some(existing) = lock(&self.snaps).iter().find(|s| s.name == snap_name) {
            if existing.fs == fs {
                return Ok(SnapOutcome::AlreadyPresent);
            }
            return Err(Error::NameConflict(format!(
                "{} exists on {}, expected {}",
                snap_name, existing.fs, fs
            )));
        }
        if self.uses_rollback_cache() {
            let Some(cache) = cache else {
                return Err(Error::vendor_fatal(fs, "rollback cache required"));
            };
            match lock(&self.caches).get(cache) {
                None => return Err(Error::vendor_fatal(fs, format!("cache {} does not exist", cache))),
                Some(info) if info.used_percent() >= 100.0 => {
                    return Err(Error::vendor_fatal(fs, format!("cache {} is full", cache)))
                }
                Some(_) => {}
            }
        }
        lock(&self.snaps).push(MockFsSnap {
            fs: fs.to_string(),
            name: snap_name.to_string(),
        });
        self.record(format!("snap {} {}", fs, snap_name));
        Ok(SnapOutcome::Created)
    }

    async fn list_snaps(&self, pool: &str, prefix: &str) -> Result<Vec<FsSnap>> {
        let filesystems = lock(&self.filesystems);
        Ok(lock(&self.snaps)
            .iter()
            .filter(|s| s.name.starts_with(prefix))
            .filter(|s| filesystems.get(&s.fs).map_or(false, |f| f.pool == pool))
            .map(|s| FsSnap {
                name: s.name.clone(),
                filesystem: s.fs.clone(),
            })
            .collect())
    }

    async fn restore(&self, fs: &str, snap_name: &str) -> Result<()> {
        if !lock(&self.snaps).iter().any(|s| s.fs == fs && s.name == snap_name) {
            return Err(Error::vendor_fatal(fs, format!("snapshot {} does not exist", snap_name)));
        }
        if self.uses_rollback_cache() && self.is_online(fs) == Some(true) {
            return Err(Error::vendor_fatal(fs, format!("Filesystem {} is online", fs)));
        }
        if lock(&self.failing).contains(fs) {
            return Err(Error::vendor_fatal(fs, "rollback failed"));
        }
        self.record(format!("restore {} {}", fs, snap_name));
        Ok(())
    }

    async fn destroy(&self, fs: &str, snap_name: &str) -> Result<DestroyOutcome> {
        let mut snaps = lock(&self.snaps);
        let before = snaps.len();
        snaps.retain(|s| !(s.fs == fs && s.name == snap_name));
        let outcome = if snaps.len() < before {
            DestroyOutcome::Destroyed
        } else {
            DestroyOutcome::AlreadyAbsent
        };
        drop(snaps);
        self.record(format!("destroy {} {}", fs, snap_name));
        Ok(outcome)
    }

    async fn list_caches(&self) -> Result<Vec<CacheInfo>> {
        Ok(lock(&self.caches).values().cloned().collect())
    }

    async fn create_cache(&self, name: &str, size_mb: u64, pool: &str) -> Result<SnapOutcome> {
        let mut caches = lock(&self.caches);
        if caches.contains_key(name) {
            return Ok(SnapOutcome::AlreadyPresent);
        }
        caches.insert(
            name.to_string(),
            CacheInfo {
                name: name.to_string(),
                total_mb: size_mb,
                used_mb: 0,
            },
        );
        drop(caches);
        self.record(format!("cache create {} {} {}", name, size_mb, pool));
        Ok(SnapOutcome::Created)
    }

    async fn destroy_cache(&self, name: &str) -> Result<DestroyOutcome> {
        let removed = lock(&self.caches).remove(name).is_some();
        self.record(format!("cache destroy {}", name));
        Ok(if removed {
            DestroyOutcome::Destroyed
        } else {
            DestroyOutcome::AlreadyAbsent
        })
    }

    async fn offline(&self, fs: &str) -> Result<()> {
        self.require_fs(fs)?;
        if let Some(f) = lock(&self.filesystems).get_mut(fs) {
            f.online = false;
        }
        self.record(format!("offline {}", fs));
        Ok(())
    }

    async fn online(&self, fs: &str) -> Result<()> {
        self.require_fs(fs)?;
        if let Some(f) = lock(&self.filesystems).get_mut(fs) {
            f.online = true;
        }
        self.record(format!("online {}", fs));
        Ok(())
    }

    async fn list_exports(&self, pool: &str) -> Result<ExportMap> {
        let filesystems = lock(&self.filesystems);
        Ok(lock(&self.exports)
            .iter()
            .filter(|(fs, exports)| {
                !exports.is_empty() && filesystems.get(*fs).map_or(false, |f| f.pool == pool)
            })
            .map(|(fs, exports)| (fs.clone(), exports.clone()))
            .collect())
    }

    async fn add_export(&self, fs: &str, export: &NfsExport) -> Result<()> {
        self.require_fs(fs)?;
        self.record(format!("export {} {}", fs, export.client));
        if lock(&self.dropped).contains(&export.client) {
            return Ok(());
        }
        let mut exports = lock(&self.exports);
        let list = exports.entry(fs.to_string()).or_default();
        if !list.contains(export) {
            list.push(export.clone());
        }
        Ok(())
    }

    async fn remove_export(&self, fs: &str, client: &str) -> Result<()> {
        if let Some(list) = lock(&self.exports).get_mut(fs) {
            list.retain(|e| e.client != client);
        }
        self.record(format!("unexport {} {}", fs, client));
        Ok(())
    }

    async fn destroy_fs(&self, fs: &str) -> Result<DestroyOutcome> {
        let removed = lock(&self.filesystems).remove(fs).is_some();
        lock(&self.exports).remove(fs);
        self.record(format!("destroy-fs {}", fs));
        Ok(if removed {
            DestroyOutcome::Destroyed
        } else {
            DestroyOutcome::AlreadyAbsent
        })
    }
}

// =============================================================================
// Local volumes
// =============================================================================

/// LVM on every host, in memory.
pub struct MockVol {
    tag: String,
    lvs: Mutex<BTreeMap<String, Vec<LvRecord>>>,
    merged: Mutex<Vec<String>>,
}

impl Default for MockVol {
    fn default() -> Self {
        Self {
            tag: LvmSettings::default().tag,
            lvs: Mutex::new(BTreeMap::new()),
            merged: Mutex::new(Vec::new()),
        }
    }
}

impl MockVol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_lv(&self, host: &str, vg: &str, name: &str, mount: Option<&str>, fs_type: &str) {
        lock(&self.lvs).entry(host.to_string()).or_default().push(LvRecord {
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
        });
    }

    /// Mark a snapshot as overflowed.
    pub fn invalidate(&self, host: &str, name: &str) {
        if let Some(lvs) = lock(&self.lvs).get_mut(host) {
            for lv in lvs.iter_mut().filter(|lv| lv.name == name) {
                lv.snapshot_invalid = true;
                lv.snap_percent = Some(100.0);
                lv.attr = "Swi-I-s---".to_string();
            }
        }
    }

    /// Paths of snapshots merged back so far.
    pub fn merged(&self) -> Vec<String> {
        lock(&self.merged).clone()
    }
}

#[async_trait]
impl VolDriver for MockVol {
    async fn enumerate(&self, host: &str, tag: Option<&str>) -> Result<Vec<LvRecord>> {
        Ok(lock(&self.lvs)
            .get(host)
            .map(|lvs| {
                lvs.iter()
                    .filter(|lv| tag.map_or(true, |t| lv.has_tag(t)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn snap(&self, host: &str, volume: &LocalVolume, snap_name: &str) -> Result<SnapOutcome> {
        let mut lvs = lock(&self.lvs);
        let host_lvs = lvs.entry(host.to_string()).or_default();
        if let Some(existing) = host_lvs.iter().find(|lv| lv.vg == volume.vg && lv.name == snap_name) {
            if existing.origin == volume.lv {
                return Ok(SnapOutcome::AlreadyPresent);
            }
            return Err(Error::NameConflict(format!(
                "{} exists with origin {}, expected {}",
                snap_name, existing.origin, volume.lv
            )));
        }
        host_lvs.push(LvRecord {
            name: snap_name.to_string(),
            tags: self.tag.clone(),
            attr: "swi-a-s---".to_string(),
            path: format!("/dev/{}/{}", volume.vg, snap_name),
            vg: volume.vg.clone(),
            origin: volume.lv.clone(),
            snapshot_invalid: false,
            snap_percent: Some(0.0),
            time: String::new(),
            fs_type: None,
            mount_point: None,
        });
        Ok(SnapOutcome::Created)
    }

    async fn restore(&self, host: &str, snap_path: &str) -> Result<()> {
        let mut lvs = lock(&self.lvs);
        let host_lvs = lvs.entry(host.to_string()).or_default();
        let before = host_lvs.len();
        host_lvs.retain(|lv| !(lv.path == snap_path && lv.is_snapshot()));
        if host_lvs.len() == before {
            return Err(Error::vendor_fatal(snap_path, "snapshot does not exist"));
        }
        lock(&self.merged).push(snap_path.to_string());
        Ok(())
    }

    async fn destroy(&self, host: &str, snap_path: &str) -> Result<DestroyOutcome> {
        let mut lvs = lock(&self.lvs);
        let host_lvs = lvs.entry(host.to_string()).or_default();
        let before = host_lvs.len();
        host_lvs.retain(|lv| lv.path != snap_path);
        Ok(if host_lvs.len() < before {
            DestroyOutcome::Destroyed
        } else {
            DestroyOutcome::AlreadyAbsent
        })
    }
}

// =============================================================================
// Drivers
// =============================================================================

/// [`DriverFactory`] handing out the mocks above, one per provider name.
pub struct MockBackends {
    pub transport: Arc<MockTransport>,
    pub cluster: Arc<MockCluster>,
    pub vol: Arc<MockVol>,
    sans: Mutex<HashMap<String, Arc<MockSan>>>,
    nases: Mutex<HashMap<String, Arc<MockNas>>>,
}

impl Default for MockBackends {
    fn default() -> Self {
        Self {
            transport: Arc::new(MockTransport::new()),
            cluster: Arc::new(MockCluster::new()),
            vol: Arc::new(MockVol::new()),
            sans: Mutex::new(HashMap::new()),
            nases: Mutex::new(HashMap::new()),
        }
    }
}

impl MockBackends {
    pub fn new() -> Self {
        Self::default()
    }

    /// The array named `name`, created on first use.
    pub fn array(&self, name: &str) -> Arc<MockSan> {
        lock(&self.sans)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MockSan::new(name)))
            .clone()
    }

    /// The console named `name`, created on first use.
    pub fn console(&self, name: &str, family: VendorFamily) -> Arc<MockNas> {
        lock(&self.nases)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MockNas::new(name, family)))
            .clone()
    }
}

impl DriverFactory for MockBackends {
    fn san(&self, provider: &StorageProvider, _login: SanLogin) -> Result<Arc<dyn SanDriver>> {
        Ok(self.array(&provider.name))
    }

    fn nas(&self, provider: &StorageProvider, _login: NasLogin) -> Result<Arc<dyn NasDriver>> {
        Ok(self.console(&provider.name, provider.family))
    }

    fn vol(&self) -> Arc<dyn VolDriver> {
        self.vol.clone()
    }

    fn cluster(&self, _members: BTreeMap<String, Vec<String>>) -> Arc<dyn ClusterControl> {
        self.cluster.clone()
    }

    fn rpc(&self) -> RpcClient {
        RpcClient::new(self.transport.clone(), Duration::from_secs(60))
    }
}

// =============================================================================
// Deployment model
// =============================================================================

const PROVIDERS: &str = "/infrastructure/storage/storage_providers";
const DEPLOYMENT: &str = "/deployments/enm";

/// Builds a [`StaticModel`] shaped like the deployment manager's tree.
pub struct ModelBuilder {
    items: BTreeMap<String, ModelItem>,
    pools: HashMap<String, String>,
    filesystems: HashMap<String, String>,
    nodes: HashMap<String, String>,
    addresses: u8,
    unavailable: bool,
    plan_running: bool,
}

impl Default for ModelBuilder {
    fn default() -> Self {
        let mut builder = Self {
            items: BTreeMap::new(),
            pools: HashMap::new(),
            filesystems: HashMap::new(),
            nodes: HashMap::new(),
            addresses: 0,
            unavailable: false,
            plan_running: false,
        };
        builder.item("/ms", "ms", &[("hostname", "ms-1")]);
        builder
    }
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn item(&mut self, path: &str, item_type: &str, properties: &[(&str, &str)]) {
        let id = path.rsplit('/').next().unwrap_or(path).to_string();
        self.items.insert(
            path.to_string(),
            ModelItem {
                id,
                item_type: item_type.to_string(),
                path: path.to_string(),
                state: "Applied".to_string(),
                properties: properties
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        );
    }

    fn next_address(&mut self) -> String {
        self.addresses += 1;
        format!("10.140.0.{}", self.addresses)
    }

    /// A SAN array; `san_type` like `vnx2` or `unity`.
    pub fn san(mut self, name: &str, san_type: &str, pools: &[&str]) -> Self {
        let path = format!("{}/{}", PROVIDERS, name);
        let ip_a = self.next_address();
        let ip_b = self.next_address();
        let key = format!("{}_key", name);
        self.item(
            &path,
            "san-emc",
            &[
                ("name", name),
                ("san_type", san_type),
                ("ip_a", ip_a.as_str()),
                ("ip_b", ip_b.as_str()),
                ("username", "admin"),
                ("password_key", key.as_str()),
            ],
        );
        for pool in pools {
            let pool_path = format!("{}/storage_containers/{}", path, pool);
            self.item(&pool_path, "storage-container", &[("name", pool)]);
            self.pools.insert(pool.to_string(), pool_path);
        }
        self
    }

    /// A NAS console; an empty `nas_type` is the clustered family.
    pub fn nas(mut self, name: &str, nas_type: &str, pools: &[&str]) -> Self {
        let path = format!("{}/{}", PROVIDERS, name);
        let address = self.next_address();
        let key = format!("{}_key", name);
        self.item(
            &path,
            "sfs-service",
            &[
                ("name", name),
                ("nas_type", nas_type),
                ("management_ipv4", address.as_str()),
                ("user_name", "support"),
                ("password_key", key.as_str()),
            ],
        );
        for pool in pools {
            let pool_path = format!("{}/pools/{}", path, pool);
            self.item(&pool_path, "sfs-pool", &[("name", pool)]);
            self.pools.insert(pool.to_string(), pool_path);
        }
        self
    }

    /// A NAS filesystem; `size` like `10G`.
    pub fn filesystem(mut self, pool: &str, name: &str, size: &str, snap_size: u8) -> Self {
        let Some(pool_path) = self.pools.get(pool).cloned() else {
            return self;
        };
        let path = format!("{}/file_systems/{}", pool_path, name);
        let vx_path = format!("/vx/{}", name);
        let snap_size = snap_size.to_string();
        self.item(
            &path,
            "sfs-filesystem",
            &[("path", vx_path.as_str()), ("size", size), ("snap_size", snap_size.as_str())],
        );
        self.filesystems.insert(name.to_string(), path);
        self
    }

    pub fn export(mut self, fs: &str, clients: &[&str], options: &str) -> Self {
        let Some(fs_path) = self.filesystems.get(fs).cloned() else {
            return self;
        };
        let prefix = format!("{}/exports/", fs_path);
        let n = self.items.keys().filter(|k| k.starts_with(&prefix)).count();
        let clients = clients.join(",");
        self.item(
            &format!("{}export{}", prefix, n),
            "sfs-export",
            &[("ipv4allowed_clients", clients.as_str()), ("options", options)],
        );
        self
    }

    /// A cluster of nodes whose item ids are their hostnames.
    pub fn cluster(mut self, name: &str, nodes: &[&str]) -> Self {
        if !self.items.contains_key(DEPLOYMENT) {
            self.item(DEPLOYMENT, "deployment", &[]);
        }
        let path = format!("{}/clusters/{}", DEPLOYMENT, name);
        self.item(&path, "vcs-cluster", &[]);
        for node in nodes {
            let node_path = format!("{}/nodes/{}", path, node);
            self.item(&node_path, "node", &[("hostname", node)]);
            self.nodes.insert(node.to_string(), node_path);
        }
        self
    }

    pub fn db_cluster(self, nodes: &[&str]) -> Self {
        self.cluster("db_cluster", nodes)
    }

    /// A SAN LUN attached to `node`.
    pub fn lun(mut self, node: &str, pool: &str, name: &str, snap_size: u8) -> Self {
        let Some(node_path) = self.nodes.get(node).cloned() else {
            return self;
        };
        let snap_size = snap_size.to_string();
        let disk = format!("disk_{}", name);
        self.item(
            &format!("{}/system/disks/{}", node_path, name),
            "lun-disk",
            &[
                ("name", disk.as_str()),
                ("lun_name", name),
                ("storage_container", pool),
                ("size", "100G"),
                ("snap_size", snap_size.as_str()),
            ],
        );
        self
    }

    /// A logical volume on a node's local disk.
    pub fn node_volume(
        mut self,
        node: &str,
        vg: &str,
        fs: &str,
        mount: Option<&str>,
        snap_size: u8,
    ) -> Self {
        let Some(node_path) = self.nodes.get(node).cloned() else {
            return self;
        };
        let vg_path = format!("{}/storage_profile/volume_groups/{}", node_path, vg);
        self.item(&vg_path, "volume-group", &[("volume_group_name", vg)]);
        self.item(
            &format!("{}/physical_devices/internal", vg_path),
            "physical-device",
            &[("device_name", "sda")],
        );
        self.file_system(&vg_path, fs, mount, snap_size);
        self
    }

    /// A management host file system in volume group item `vg_id`.
    pub fn ms_volume(
        mut self,
        vg_id: &str,
        vg_name: &str,
        fs: &str,
        mount: Option<&str>,
        snap_size: u8,
    ) -> Self {
        let vg_path = format!("/ms/storage_profile/volume_groups/{}", vg_id);
        self.item(&vg_path, "volume-group", &[("volume_group_name", vg_name)]);
        self.file_system(&vg_path, fs, mount, snap_size);
        self
    }

    fn file_system(&mut self, vg_path: &str, fs: &str, mount: Option<&str>, snap_size: u8) {
        let snap_size = snap_size.to_string();
        let mut properties = vec![("snap_size", snap_size.as_str())];
        if let Some(mount) = mount {
            properties.push(("mount_point", mount));
        }
        self.item(&format!("{}/file_systems/{}", vg_path, fs), "file-system", &properties);
    }

    /// A clustered service; `active > 1` makes it parallel.
    pub fn service(mut self, cluster: &str, name: &str, nodes: &[&str], active: u32) -> Self {
        let nodes = nodes.join(",");
        let active = active.to_string();
        self.item(
            &format!("{}/clusters/{}/services/{}", DEPLOYMENT, cluster, name),
            "vcs-clustered-service",
            &[("node_list", nodes.as_str()), ("active", active.as_str())],
        );
        self
    }

    /// Mark a software service as still deployed.
    pub fn service_present(mut self, name: &str) -> Self {
        self.item(&format!("/software/services/{}", name), "service", &[]);
        self
    }

    pub fn plan_running(mut self, running: bool) -> Self {
        self.plan_running = running;
        self
    }

    /// Every read fails as unavailable.
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    pub fn build(self) -> StaticModel {
        StaticModel {
            items: self.items,
            unavailable: self.unavailable,
            plan_running: self.plan_running,
        }
    }
}

/// [`ModelClient`] over a fixed tree.
pub struct StaticModel {
    items: BTreeMap<String, ModelItem>,
    unavailable: bool,
    plan_running: bool,
}

impl StaticModel {
    fn check(&self) -> Result<()> {
        if self.unavailable {
            return Err(Error::ModelUnavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ModelClient for StaticModel {
    async fn get(&self, path: &str) -> Result<Option<ModelItem>> {
        self.check()?;
        Ok(self.items.get(path).cloned())
    }

    async fn children(&self, path: &str) -> Result<Vec<ModelItem>> {
        self.check()?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        Ok(self
            .items
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| !k[prefix.len()..].contains('/'))
            .map(|(_, item)| item.clone())
            .collect())
    }

    async fn plan_running(&self) -> Result<bool> {
        self.check()?;
        Ok(self.plan_running)
    }
}
