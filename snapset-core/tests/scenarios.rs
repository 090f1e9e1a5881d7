//! End-to-end runs of the coordinator against in-memory storage, agents and
//! cluster manager.

use std::sync::Arc;

use regex::Regex;
use tempfile::TempDir;

use snapset_core::agent_api::{AgentReply, AgentRequest, RaftRole, RaftStatus};
use snapset_core::cluster::GroupState;
use snapset_core::cmd::CmdOutput;
use snapset_core::drivers::NasDriver;
use snapset_core::inspect::Presence;
use snapset_core::mock::{MockBackends, MockNas, MockSan, ModelBuilder};
use snapset_core::model::{NfsExport, VendorFamily};
use snapset_core::plan::Tier;
use snapset_core::{
    CancelFlag, Coordinator, CreateOptions, Error, ErrorKind, MetadataStore, ModelReader,
    SetName, SetSelector, SetState, Settings, StaticDecrypter,
};

const GRAPH_GROUP: &str = "Grp_CS_db_cluster_neo4j_clustered_service";
const RELATIONAL_GROUP: &str = "Grp_CS_db_cluster_mysql_clustered_service";
const DB_HOSTS: [&str; 3] = ["db-1", "db-2", "db-3"];
const GRAPH_LUN: &str = "11";
const RELATIONAL_LUN: &str = "12";
const FILESYSTEMS: [(&str, &str, u64); 4] = [
    ("pool2-fs1", "10G", 10 * 1024),
    ("pool2-fs2", "100M", 100),
    ("pool2-fs3", "2600G", 2600 * 1024),
    ("pool2-fs4", "100G", 100 * 1024),
];
const CLIENTS: [&str; 2] = ["10.0.0.1", "10.0.0.2"];
const EXPORT_OPTIONS: &str = "rw,no_root_squash";

struct Deployment {
    backends: Arc<MockBackends>,
    san: Arc<MockSan>,
    nas: Arc<MockNas>,
    coordinator: Coordinator,
    metadata: TempDir,
}

fn set(name: &str) -> SetName {
    SetName::new(name).unwrap()
}

fn deployment(with_relational: bool) -> Deployment {
    deployment_on(VendorFamily::ClusteredNas, with_relational)
}

/// Three-node graph cluster, optionally a relational group, two LUNs, four
/// filesystems on a NAS pool of `family`, one node volume and one management
/// host volume.
fn deployment_on(family: VendorFamily, with_relational: bool) -> Deployment {
    let nas_type = match family {
        VendorFamily::UnifiedNas => "unity",
        _ => "",
    };
    let mut builder = ModelBuilder::new()
        .san("san1", "vnx2", &["pool1"])
        .nas("nas1", nas_type, &["pool2"])
        .db_cluster(&DB_HOSTS)
        .service("db_cluster", "neo4j_clustered_service", &DB_HOSTS, 3);
    for host in DB_HOSTS {
        builder = builder.lun(host, "pool1", "neo4jlun", 100);
    }
    builder = builder.lun("db-1", "pool1", "mysql", 100);
    if with_relational {
        builder = builder.service("db_cluster", "mysql_clustered_service", &["db-1", "db-2"], 1);
    }
    for (fs, size, _) in FILESYSTEMS {
        builder = builder.filesystem("pool2", fs, size, 40);
    }
    let model = builder
        .export("pool2-fs1", &CLIENTS, EXPORT_OPTIONS)
        .export("pool2-fs2", &CLIENTS, EXPORT_OPTIONS)
        .node_volume("db-1", "vg_app", "data", Some("/data"), 50)
        .ms_volume("vg1", "vg_root", "var", Some("/var"), 50)
        .build();

    let backends = Arc::new(MockBackends::new());
    let san = backends.array("san1");
    san.add_lun("pool1", "neo4jlun", GRAPH_LUN, 100 * 1024);
    san.add_lun("pool1", "mysql", RELATIONAL_LUN, 100 * 1024);
    san.set_subscription("pool1", 40.0);

    let nas = backends.console("nas1", family);
    for (fs, _, size_mb) in FILESYSTEMS {
        nas.add_fs("pool2", fs, size_mb);
    }
    for fs in ["pool2-fs1", "pool2-fs2"] {
        for client in CLIENTS {
            nas.seed_export(fs, NfsExport::new(client, EXPORT_OPTIONS));
        }
    }

    backends.vol.add_lv("db-1", "vg_app", "vg_app_data", Some("/data"), "ext4");
    backends.vol.add_lv("ms-1", "vg_root", "lv_var", Some("/var"), "ext4");
    backends.vol.add_lv("ms-1", "vg_root", "lv_swap", None, "swap");

    for host in DB_HOSTS {
        backends
            .cluster
            .set_state("db_cluster", GRAPH_GROUP, host, GroupState::Online);
    }
    if with_relational {
        backends
            .cluster
            .set_state("db_cluster", RELATIONAL_GROUP, "db-1", GroupState::Online);
        backends
            .cluster
            .set_state("db_cluster", RELATIONAL_GROUP, "db-2", GroupState::Offline);
    }

    let transport = &backends.transport;
    for label in [
        "graphdb/set_iops_limit",
        "graphdb/checkpoint",
        "fs/freeze",
        "fs/unfreeze",
    ] {
        transport.reply_all(label, AgentReply::success(()));
    }
    transport.reply(
        "db-1",
        "graphdb/raft_status",
        AgentReply::success(RaftStatus {
            role: RaftRole::Leader,
            committed_index: 1000,
        }),
    );
    for host in ["db-2", "db-3"] {
        transport.reply(
            host,
            "graphdb/raft_status",
            AgentReply::success(RaftStatus {
                role: RaftRole::Follower,
                committed_index: 990,
            }),
        );
    }

    // The relational lock session runs the array's snap command remotely.
    let array = san.clone();
    let snap_command = Regex::new(r"mocksnap (\S+) ([^\s;']+)").unwrap();
    transport.handle(move |_, request| {
        let AgentRequest::Exec { command, .. } = request else {
            return None;
        };
        let shell = command.to_shell();
        let caps = snap_command.captures(&shell)?;
        array.insert_snap(&caps[1], &caps[2]);
        Some(AgentReply::success(CmdOutput::ok("SNAP_RC=0\n")))
    });

    let settings = Settings::default();
    let decrypter = StaticDecrypter::new()
        .with("san1_key", "admin", "secret")
        .with("nas1_key", "support", "secret")
        .with(&settings.databases.relational_password_key, "root", "secret");
    let metadata = TempDir::new().unwrap();
    let coordinator = Coordinator::new(
        settings.clone(),
        ModelReader::new(Arc::new(model), settings),
        backends.clone(),
        Arc::new(decrypter),
        MetadataStore::new(metadata.path()),
        CancelFlag::new(),
    );

    Deployment {
        backends,
        san,
        nas,
        coordinator,
        metadata,
    }
}

fn take_offline(d: &Deployment) {
    for host in DB_HOSTS {
        d.backends
            .cluster
            .set_state("db_cluster", GRAPH_GROUP, host, GroupState::Offline);
    }
    for host in ["db-1", "db-2"] {
        d.backends
            .cluster
            .set_state("db_cluster", RELATIONAL_GROUP, host, GroupState::Offline);
    }
}

fn position(events: &[String], event: &str) -> usize {
    events
        .iter()
        .position(|e| e == event)
        .unwrap_or_else(|| panic!("no event '{}' in {:?}", event, events))
}

#[tokio::test]
async fn test_happy_path_cluster_graph() {
    let d = deployment(true);
    let s1 = set("s1");

    let manifest = d
        .coordinator
        .create_snapshot(&s1, CreateOptions::default())
        .await
        .unwrap();

    // Two LUNs, four filesystems, the node volume and the management host volume.
    assert_eq!(manifest.len(), 8);
    let snaps: Vec<String> = d.san.snaps().into_iter().map(|s| s.name).collect();
    assert!(snaps.contains(&format!("s1_{}", GRAPH_LUN)));
    assert!(snaps.contains(&format!("s1_{}", RELATIONAL_LUN)));

    let cache_mb = 1085 * 1024;
    assert!(d
        .nas
        .events()
        .contains(&format!("cache create pool2-cache {} pool2", cache_mb)));
    for (fs, _, _) in FILESYSTEMS {
        assert!(d.nas.events().contains(&format!("snap {} s1-{}", fs, fs)));
    }

    // The relational snap ran inside the lock session on the active host.
    let sessions = d.backends.transport.exec_commands("db-1");
    assert_eq!(sessions.len(), 1);

    let record = d.coordinator.store().load(&s1).unwrap().unwrap();
    assert_eq!(record.state, SetState::Complete);

    let verdict = d.coordinator.validate_snapshots(&s1).await.unwrap();
    assert!(verdict.passed, "{:?}", verdict.offenders);
}

#[tokio::test]
async fn test_create_twice_is_a_noop() {
    let d = deployment(true);
    let s1 = set("s1");
    d.coordinator
        .create_snapshot(&s1, CreateOptions::default())
        .await
        .unwrap();
    let events = d.nas.events().len();
    let snaps = d.san.snaps().len();

    d.coordinator
        .create_snapshot(&s1, CreateOptions::default())
        .await
        .unwrap();
    assert_eq!(d.nas.events().len(), events);
    assert_eq!(d.san.snaps().len(), snaps);
}

#[tokio::test]
async fn test_relational_not_deployed() {
    let d = deployment(false);
    let s1 = set("s1");

    d.coordinator
        .create_snapshot(&s1, CreateOptions::default())
        .await
        .unwrap();
    assert!(d.backends.transport.exec_commands("db-1").is_empty());

    let verdict = d.coordinator.validate_snapshots(&s1).await.unwrap();
    assert!(verdict.passed, "{:?}", verdict.offenders);

    let reports = d
        .coordinator
        .list_snapshots(&SetSelector::Named(s1.clone()))
        .await
        .unwrap();
    let relational = format!("s1_{}", RELATIONAL_LUN);
    assert!(reports[0].entries.iter().all(|e| e.snap_name != relational));
}

#[tokio::test]
async fn test_full_rollback_cache() {
    let d = deployment(true);
    d.coordinator
        .create_snapshot(&set("s1"), CreateOptions::default())
        .await
        .unwrap();
    d.nas.set_cache_usage("pool2-cache", 100.0);

    let verdict = d.coordinator.validate_snapshots(&set("s1")).await.unwrap();
    assert!(!verdict.passed);
    assert!(verdict
        .offenders
        .iter()
        .any(|o| o.kind == ErrorKind::SnapshotInvalid && o.resource == "pool2"));

    let err = d
        .coordinator
        .create_snapshot(&set("s2"), CreateOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreflightCapacity);
}

#[tokio::test]
async fn test_graph_lun_failure_unfreezes_and_rolls_back() {
    let d = deployment(true);
    d.san.fail_snap(GRAPH_LUN);
    let s1 = set("s1");

    let err = d
        .coordinator
        .create_snapshot(&s1, CreateOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VendorFatal);

    for host in DB_HOSTS {
        let requests = d.backends.transport.requests(host);
        assert!(requests.iter().any(|r| matches!(
            r,
            AgentRequest::FsFreeze {
                safety_net_secs: 60,
                ..
            }
        )));
        assert!(requests
            .iter()
            .any(|r| matches!(r, AgentRequest::FsUnfreeze { .. })));
    }

    assert!(d.san.snaps().iter().all(|s| !s.name.starts_with("s1_")));
    assert!(d.coordinator.store().load(&s1).unwrap().is_none());
    assert!(matches!(
        d.coordinator.validate_snapshots(&s1).await,
        Err(Error::NoNamedSet(_))
    ));
}

#[tokio::test]
async fn test_restore_reapplies_exports() {
    let d = deployment(true);
    let s1 = set("s1");
    d.coordinator
        .create_snapshot(&s1, CreateOptions::default())
        .await
        .unwrap();

    let err = d.coordinator.restore_snapshot(&s1, false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidStateForSnapshot);

    take_offline(&d);
    d.coordinator.restore_snapshot(&s1, false).await.unwrap();

    let events = d.nas.events();
    for fs in ["pool2-fs1", "pool2-fs2"] {
        let offline = position(&events, &format!("offline {}", fs));
        let restore = position(&events, &format!("restore {} s1-{}", fs, fs));
        let online = position(&events, &format!("online {}", fs));
        let export = position(&events, &format!("export {} {}", fs, CLIENTS[1]));
        assert!(offline < restore && restore < online && online < export);

        let mut exports = d.nas.exports_of(fs);
        exports.sort();
        let expected: Vec<NfsExport> = CLIENTS
            .iter()
            .map(|c| NfsExport::new(*c, EXPORT_OPTIONS))
            .collect();
        assert_eq!(exports, expected);
        assert_eq!(d.nas.is_online(fs), Some(true));
    }
    let reexports = events.iter().filter(|e| e.starts_with("export ")).count();
    assert_eq!(reexports, 4);

    let restored: Vec<String> = d.san.restored().into_iter().map(|(lun, _)| lun).collect();
    assert!(restored.contains(&GRAPH_LUN.to_string()));
    assert_eq!(d.backends.vol.merged().len(), 2);
}

#[tokio::test]
async fn test_orphan_snapshot_detected() {
    let d = deployment(true);
    let s1 = set("s1");
    d.coordinator
        .create_snapshot(&s1, CreateOptions::default())
        .await
        .unwrap();
    d.san.insert_snap("99", "s1_99");

    let reports = d
        .coordinator
        .list_snapshots(&SetSelector::Named(s1.clone()))
        .await
        .unwrap();
    let orphans = reports[0].orphans();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].snap_name, "s1_99");
    assert_eq!(orphans[0].presence, Presence::Orphan);

    let verdict = d.coordinator.validate_snapshots(&s1).await.unwrap();
    assert!(!verdict.passed);
    assert_eq!(verdict.offenders[0].kind, ErrorKind::OrphanSnapshot);
}

#[tokio::test]
async fn test_remove_twice_is_a_noop() {
    let d = deployment(true);
    let s1 = set("s1");
    d.coordinator
        .create_snapshot(&s1, CreateOptions::default())
        .await
        .unwrap();

    d.coordinator.remove_snapshots(&s1, false).await.unwrap();
    assert!(d.san.snaps().iter().all(|s| !s.name.starts_with("s1_")));
    assert!(d.nas.list_caches().await.unwrap().is_empty());
    assert!(d.coordinator.store().load(&s1).unwrap().is_none());

    let steps = d.coordinator.remove_snapshots(&s1, false).await.unwrap();
    assert!(steps.is_empty());
}

#[tokio::test]
async fn test_running_plan_blocks_create() {
    let d = deployment(true);
    let model = ModelBuilder::new().plan_running(true).build();
    let settings = Settings::default();
    let blocked = Coordinator::new(
        settings.clone(),
        ModelReader::new(Arc::new(model), settings),
        d.backends.clone(),
        Arc::new(StaticDecrypter::new()),
        MetadataStore::new(d.metadata.path()),
        CancelFlag::new(),
    );
    let err = blocked
        .create_snapshot(&set("s1"), CreateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PlanRunning));
    assert_eq!(err.exit_code().code(), 4);
}

#[tokio::test]
async fn test_list_all_and_unknown_set() {
    let d = deployment(true);
    d.coordinator
        .create_snapshot(&set("s1"), CreateOptions::default())
        .await
        .unwrap();

    let reports = d.coordinator.list_snapshots(&SetSelector::All).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].set, set("s1"));

    let err = d
        .coordinator
        .list_snapshots(&SetSelector::Named(set("nope")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoNamedSet);
}

fn filesystem_names() -> Vec<String> {
    FILESYSTEMS.iter().map(|(fs, _, _)| fs.to_string()).collect()
}

fn declared_exports() -> Vec<NfsExport> {
    CLIENTS
        .iter()
        .map(|c| NfsExport::new(*c, EXPORT_OPTIONS))
        .collect()
}

/// The relational session claims success but the array never took the
/// snapshot.
fn lose_relational_snap(d: &Deployment) {
    d.backends.transport.handle(|_, request| {
        let AgentRequest::Exec { command, .. } = request else {
            return None;
        };
        command
            .to_shell()
            .contains("mocksnap")
            .then(|| AgentReply::success(CmdOutput::ok("SNAP_RC=0\n")))
    });
}

#[tokio::test]
async fn test_relational_snap_runs_inside_graph_bracket() {
    let d = deployment(true);
    d.coordinator
        .create_snapshot(&set("s1"), CreateOptions::default())
        .await
        .unwrap();

    let requests = d.backends.transport.requests("db-1");
    let freeze = requests
        .iter()
        .position(|r| matches!(r, AgentRequest::FsFreeze { .. }))
        .unwrap();
    let session = requests
        .iter()
        .position(|r| matches!(r, AgentRequest::Exec { .. }))
        .unwrap();
    let unfreeze = requests
        .iter()
        .position(|r| matches!(r, AgentRequest::FsUnfreeze { .. }))
        .unwrap();
    assert!(freeze < session && session < unfreeze);
}

#[tokio::test]
async fn test_failed_verification_rolls_back() {
    let d = deployment(true);
    lose_relational_snap(&d);
    let s1 = set("s1");

    let err = d
        .coordinator
        .create_snapshot(&s1, CreateOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingExpected);

    assert!(d.san.snaps().iter().all(|s| !s.name.starts_with("s1_")));
    assert!(d.nas.list_snaps("pool2", "s1-").await.unwrap().is_empty());
    assert!(d.nas.list_caches().await.unwrap().is_empty());
    assert!(d.coordinator.store().load(&s1).unwrap().is_none());
}

#[tokio::test]
async fn test_failed_verification_keeps_partial_set_on_request() {
    let d = deployment(true);
    lose_relational_snap(&d);
    let s1 = set("s1");

    let err = d
        .coordinator
        .create_snapshot(
            &s1,
            CreateOptions {
                keep_on_failure: true,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingExpected);

    let graph = format!("s1_{}", GRAPH_LUN);
    assert!(d.san.snaps().iter().any(|s| s.name == graph));
    assert_eq!(d.nas.list_snaps("pool2", "s1-").await.unwrap().len(), FILESYSTEMS.len());
    let record = d.coordinator.store().load(&s1).unwrap().unwrap();
    assert_eq!(record.state, SetState::Partial);
}

#[tokio::test]
async fn test_invalid_volume_snapshot_fails_validation() {
    let d = deployment(true);
    let s1 = set("s1");
    let manifest = d
        .coordinator
        .create_snapshot(&s1, CreateOptions::default())
        .await
        .unwrap();
    let volume = manifest
        .iter()
        .find(|e| e.tier == Tier::Volume && e.location == "db-1")
        .unwrap();
    d.backends.vol.invalidate("db-1", &volume.snap_name);

    let verdict = d.coordinator.validate_snapshots(&s1).await.unwrap();
    assert!(!verdict.passed);
    assert!(verdict
        .offenders
        .iter()
        .any(|o| o.kind == ErrorKind::SnapshotInvalid && o.message.contains(&volume.snap_name)));
}

#[tokio::test]
async fn test_failed_restore_reports_offline_filesystems() {
    let d = deployment(true);
    let s1 = set("s1");
    d.coordinator
        .create_snapshot(&s1, CreateOptions::default())
        .await
        .unwrap();
    take_offline(&d);
    d.nas.fail_restore("pool2-fs1");
    let before = d.nas.events().len();

    let err = d.coordinator.restore_snapshot(&s1, false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VendorFatal);
    let Error::RestoreFailed { steps, offline, .. } = &err else {
        panic!("unexpected error {:?}", err);
    };
    assert_eq!(*offline, filesystem_names());
    assert!(steps
        .iter()
        .any(|s| s.action == "fs-restore" && s.resource == "pool2-fs1" && s.error.is_some()));

    for fs in filesystem_names() {
        assert_eq!(d.nas.is_online(&fs), Some(false));
    }
    for fs in ["pool2-fs1", "pool2-fs2"] {
        assert!(d.nas.exports_of(fs).is_empty());
    }
    let events = d.nas.events();
    assert!(events[before..]
        .iter()
        .all(|e| !e.starts_with("online ") && !e.starts_with("export ")));
    assert!(d.san.restored().is_empty());
}

#[tokio::test]
async fn test_unified_nas_create_and_restore() {
    let d = deployment_on(VendorFamily::UnifiedNas, true);
    let s1 = set("s1");

    let manifest = d
        .coordinator
        .create_snapshot(&s1, CreateOptions::default())
        .await
        .unwrap();
    assert_eq!(manifest.len(), 8);
    let events = d.nas.events();
    for fs in filesystem_names() {
        assert!(events.contains(&format!("snap {} s1-{}", fs, fs)));
    }
    assert!(events.iter().all(|e| !e.starts_with("cache ")));
    assert!(d.nas.list_caches().await.unwrap().is_empty());

    let verdict = d.coordinator.validate_snapshots(&s1).await.unwrap();
    assert!(verdict.passed, "{:?}", verdict.offenders);

    take_offline(&d);
    let before = d.nas.events().len();
    d.coordinator.restore_snapshot(&s1, false).await.unwrap();

    let events = d.nas.events();
    for fs in filesystem_names() {
        assert!(events.contains(&format!("restore {} s1-{}", fs, fs)));
        assert_eq!(d.nas.is_online(&fs), Some(true));
    }
    assert!(events[before..]
        .iter()
        .all(|e| !e.starts_with("offline ") && !e.starts_with("unexport ")));
    for fs in ["pool2-fs1", "pool2-fs2"] {
        let mut exports = d.nas.exports_of(fs);
        exports.sort();
        assert_eq!(exports, declared_exports());
    }
    let restored: Vec<String> = d.san.restored().into_iter().map(|(lun, _)| lun).collect();
    assert!(restored.contains(&GRAPH_LUN.to_string()));

    d.coordinator.remove_snapshots(&s1, false).await.unwrap();
    assert!(d.nas.list_snaps("pool2", "s1-").await.unwrap().is_empty());
}
