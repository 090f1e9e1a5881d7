//! Integration tests for the node agent.
//!
//! A real HTTP server is started on a loopback port and driven through the
//! coordinator's own RPC client, so both sides of the wire contract are
//! exercised together. Local tools are answered by a scripted runner.

use std::sync::Arc;
use std::time::Duration;

use snapset_agent::config::AgentConfig;
use snapset_agent::handlers::ActionHandler;
use snapset_agent::server::{serve_listener, AppState};
use snapset_core::agent_api::{AgentRequest, RaftRole, RaftStatus};
use snapset_core::cmd::{CmdOutput, CommandLine};
use snapset_core::drivers::{DestroyOutcome, LvRecord};
use snapset_core::mock::ScriptedRunner;
use snapset_core::{ErrorKind, HttpTransport, RpcClient};
use tokio::sync::oneshot;

struct Agent {
    rpc: RpcClient,
    runner: Arc<ScriptedRunner>,
    stop: Option<oneshot::Sender<()>>,
    server: tokio::task::JoinHandle<anyhow::Result<()>>,
    _mounts: tempfile::TempDir,
}

impl Agent {
    async fn start() -> Self {
        let mounts = tempfile::tempdir().unwrap();
        let mounts_file = mounts.path().join("mounts");
        std::fs::write(
            &mounts_file,
            "/dev/mapper/vg_app-data /data xfs rw 0 0\n/dev/sda1 /boot ext4 rw 0 0\n",
        )
        .unwrap();

        let mut config = AgentConfig::default();
        config.lvm.mounts_file = mounts_file.display().to_string();

        let runner = Arc::new(ScriptedRunner::new());
        let handler = ActionHandler::new(Arc::new(config), runner.clone());
        let state = Arc::new(AppState::new(handler));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(serve_listener(listener, state, async {
            let _ = stopped.await;
        }));

        let transport = HttpTransport::new("http", port).unwrap();
        let rpc = RpcClient::new(Arc::new(transport), Duration::from_secs(10));
        Self {
            rpc,
            runner,
            stop: Some(stop),
            server,
            _mounts: mounts,
        }
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.server.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_exec_over_http() {
    let agent = Agent::start().await;
    agent.runner.on("mysql", CmdOutput::ok("SNAP_RC=0\n"));

    let out = agent
        .rpc
        .exec("127.0.0.1", CommandLine::new("mysql").args(["-e", "FLUSH TABLES"]))
        .await
        .unwrap();
    assert_eq!(out.stdout, "SNAP_RC=0\n");
    assert_eq!(agent.runner.calls(), vec!["mysql -e 'FLUSH TABLES'"]);

    agent.shutdown().await;
}

#[tokio::test]
async fn test_non_zero_exit_fails_exec_on_the_client() {
    let agent = Agent::start().await;
    agent.runner.on("false", CmdOutput::failed(1, "nope"));

    let err = agent
        .rpc
        .exec("127.0.0.1", CommandLine::new("false"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("nope"), "{}", err);

    agent.shutdown().await;
}

#[tokio::test]
async fn test_lvm_list_and_remove() {
    let agent = Agent::start().await;
    agent.runner.on(
        "lvs --noheadings --separator",
        CmdOutput::ok(
            "  data,,owi-aos---,/dev/vg_app/data,vg_app,,,,2024-01-01 10:00:00 +0000\n  \
             s1_data,snapset,swi-a-s---,/dev/vg_app/s1_data,vg_app,data,,3.00,2024-02-01 10:00:00 +0000\n",
        ),
    );
    agent.runner.on("lvs --noheadings -o lv_name", CmdOutput::ok("  s1_data\n"));
    agent.runner.on("lvremove", CmdOutput::ok(""));

    let lvs: Vec<LvRecord> = agent
        .rpc
        .call("127.0.0.1", &AgentRequest::LvmList { tag: None })
        .await
        .unwrap();
    assert_eq!(lvs.len(), 2);
    assert_eq!(lvs[0].mount_point.as_deref(), Some("/data"));
    assert_eq!(lvs[0].fs_type.as_deref(), Some("xfs"));
    assert!(lvs[1].is_snapshot());
    assert!(lvs[1].has_tag("snapset"));

    let outcome: DestroyOutcome = agent
        .rpc
        .call(
            "127.0.0.1",
            &AgentRequest::LvmRemove {
                path: "/dev/vg_app/s1_data".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome, DestroyOutcome::Destroyed);

    agent.shutdown().await;
}

#[tokio::test]
async fn test_freeze_fan_out_and_thaw() {
    let agent = Agent::start().await;
    agent.runner.on("fsfreeze", CmdOutput::ok(""));

    let hosts = vec!["127.0.0.1".to_string()];
    let freeze = AgentRequest::FsFreeze {
        mount_point: "/data".to_string(),
        safety_net_secs: 60,
    };
    let frozen = agent.rpc.fan_out::<()>(&hosts, &freeze).await;
    assert!(frozen.is_complete());

    let thaw = AgentRequest::FsUnfreeze {
        mount_point: "/data".to_string(),
    };
    agent.rpc.call::<()>("127.0.0.1", &thaw).await.unwrap();

    assert_eq!(
        agent.runner.calls(),
        vec!["/sbin/fsfreeze --freeze /data", "/sbin/fsfreeze --unfreeze /data"]
    );

    agent.shutdown().await;
}

#[tokio::test]
async fn test_agent_failure_reaches_client() {
    let agent = Agent::start().await;
    agent.runner.on("dbms.cluster.role", CmdOutput::ok("role\nFOLLOWER\n"));
    agent.runner.on("commit_index", CmdOutput::failed(1, "connection refused"));

    let err = agent
        .rpc
        .call::<RaftStatus>("127.0.0.1", &AgentRequest::GraphRaftStatus)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("connection refused"), "{}", err);
    assert_ne!(err.kind(), ErrorKind::RpcTimeout);

    agent.shutdown().await;
}

#[tokio::test]
async fn test_raft_status() {
    let agent = Agent::start().await;
    agent.runner.on("dbms.cluster.role", CmdOutput::ok("role\n\"FOLLOWER\"\n"));
    agent.runner.on("commit_index", CmdOutput::ok("value\n990\n"));

    let status: RaftStatus = agent
        .rpc
        .call("127.0.0.1", &AgentRequest::GraphRaftStatus)
        .await
        .unwrap();
    assert_eq!(status.role, RaftRole::Follower);
    assert_eq!(status.committed_index, 990);

    agent.shutdown().await;
}
