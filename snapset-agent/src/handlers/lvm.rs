//! Logical volume listing, snapshot, remove and merge.

use std::collections::HashMap;

use snapset_core::cmd::CommandLine;
use snapset_core::drivers::{parse_lvs, DestroyOutcome, LvRecord, LVS_FIELDS};
use tracing::{debug, info, warn};

use super::ActionHandler;
use crate::error::{AgentError, AgentResult};

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Mount {
    pub device: String,
    pub mount_point: String,
    pub fs_type: String,
}

/// Parse `/proc/mounts` style text.
pub(crate) fn parse_mounts(text: &str) -> Vec<Mount> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some(Mount {
                device: fields.next()?.to_string(),
                mount_point: unescape_octal(fields.next()?),
                fs_type: fields.next()?.to_string(),
            })
        })
        .collect()
}

/// The mount table escapes blanks as `\040` and friends.
fn unescape_octal(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let digits: String = chars.clone().take(3).collect();
            if digits.len() == 3 {
                if let Ok(code) = u8::from_str_radix(&digits, 8) {
                    out.push(code as char);
                    for _ in 0..3 {
                        chars.next();
                    }
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

/// `/dev/mapper` name of `vg/lv`; dashes inside either name are doubled.
fn mapper_path(vg: &str, lv: &str) -> String {
    format!(
        "/dev/mapper/{}-{}",
        vg.replace('-', "--"),
        lv.replace('-', "--")
    )
}

pub(crate) async fn read_mounts(handler: &ActionHandler) -> Vec<Mount> {
    let path = &handler.config().lvm.mounts_file;
    match tokio::fs::read_to_string(path).await {
        Ok(text) => parse_mounts(&text),
        Err(e) => {
            warn!(path = %path, error = %e, "Cannot read mount table");
            Vec::new()
        }
    }
}

/// Fill in mount point and filesystem type for each volume.
async fn annotate(handler: &ActionHandler, records: &mut [LvRecord]) {
    let mounts = read_mounts(handler).await;
    let by_device: HashMap<&str, &Mount> =
        mounts.iter().map(|m| (m.device.as_str(), m)).collect();
    let lvm = &handler.config().lvm;

    for lv in records.iter_mut() {
        let mapper = mapper_path(&lv.vg, &lv.name);
        let mount = by_device
            .get(lv.path.as_str())
            .or_else(|| by_device.get(mapper.as_str()));
        if let Some(mount) = mount {
            lv.mount_point = Some(mount.mount_point.clone());
            lv.fs_type = Some(mount.fs_type.clone());
            continue;
        }

        let blkid = CommandLine::new(&lvm.blkid).args([
            "-o",
            "value",
            "-s",
            "TYPE",
            lv.path.as_str(),
        ]);
        match handler.run(&blkid, lvm.timeout_secs).await {
            Ok(out) if out.success() && !out.stdout.trim().is_empty() => {
                lv.fs_type = Some(out.stdout.trim().to_string());
            }
            Ok(_) => debug!(lv = %lv.path, "No filesystem signature"),
            Err(e) => debug!(lv = %lv.path, error = %e, "blkid failed"),
        }
    }
}

pub(super) async fn list(handler: &ActionHandler, tag: Option<&str>) -> AgentResult<Vec<LvRecord>> {
    let lvm = &handler.config().lvm;
    let mut cmd = CommandLine::new(&lvm.lvs).args([
        "--noheadings",
        "--separator",
        ",",
        "-o",
        LVS_FIELDS,
    ]);
    if let Some(tag) = tag {
        cmd = cmd.arg(format!("@{}", tag));
    }

    let out = handler.run_success(&cmd, lvm.timeout_secs).await?;
    let mut records = parse_lvs(&out.stdout);
    annotate(handler, &mut records).await;
    debug!(count = records.len(), "Listed logical volumes");
    Ok(records)
}

pub(super) async fn snapshot(
    handler: &ActionHandler,
    origin_path: &str,
    name: &str,
    tag: &str,
    percent: u8,
) -> AgentResult<()> {
    if percent == 0 || percent > 100 {
        return Err(AgentError::InvalidRequest(format!(
            "snapshot size {}% of origin is out of range",
            percent
        )));
    }
    let lvm = &handler.config().lvm;
    let cmd = CommandLine::new(&lvm.lvcreate).args([
        "-s".to_string(),
        "--addtag".to_string(),
        tag.to_string(),
        "-l".to_string(),
        format!("{}%ORIGIN", percent),
        "-n".to_string(),
        name.to_string(),
        origin_path.to_string(),
    ]);
    handler.run_success(&cmd, lvm.timeout_secs).await?;
    info!(origin = %origin_path, snapshot = %name, "Created snapshot volume");
    Ok(())
}

pub(super) async fn remove(handler: &ActionHandler, path: &str) -> AgentResult<DestroyOutcome> {
    let lvm = &handler.config().lvm;
    let probe = CommandLine::new(&lvm.lvs).args(["--noheadings", "-o", "lv_name", path]);
    let exists = handler.run(&probe, lvm.timeout_secs).await?.success();
    if !exists {
        info!(lv = %path, "Volume already absent");
        return Ok(DestroyOutcome::AlreadyAbsent);
    }

    let cmd = CommandLine::new(&lvm.lvremove).args(["-f", path]);
    handler.run_success(&cmd, lvm.timeout_secs).await?;
    info!(lv = %path, "Removed volume");
    Ok(DestroyOutcome::Destroyed)
}

/// Merge a snapshot into its origin. With the origin open the merge is
/// deferred by LVM until its next activation.
pub(super) async fn merge(handler: &ActionHandler, path: &str) -> AgentResult<()> {
    let lvm = &handler.config().lvm;
    let cmd = CommandLine::new(&lvm.lvconvert).args(["--merge", path]);
    let out = handler.run_success(&cmd, lvm.timeout_secs).await?;
    info!(lv = %path, output = %out.combined().trim(), "Merge scheduled");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::handler_with;
    use super::*;
    use crate::config::AgentConfig;
    use snapset_core::agent_api::AgentRequest;
    use snapset_core::cmd::CmdOutput;

    const LVS_OUT: &str = "  lv_root,,-wi-ao----,/dev/vg_root/lv_root,vg_root,,,,2024-01-01 10:00:00 +0000\n  \
                           lv_var,,owi-aos---,/dev/vg_root/lv_var,vg_root,,,,2024-01-01 10:00:00 +0000\n  \
                           s1_var,snapset,swi-a-s---,/dev/vg_root/s1_var,vg_root,lv_var,,1.50,2024-02-01 10:00:00 +0000\n";

    const MOUNTS: &str = "/dev/mapper/vg_root-lv_root / xfs rw,relatime 0 0\n\
                          /dev/mapper/vg_root-lv_var /var ext4 rw,relatime 0 0\n\
                          proc /proc proc rw 0 0\n";

    fn config_with_mounts(dir: &tempfile::TempDir) -> AgentConfig {
        let path = dir.path().join("mounts");
        std::fs::write(&path, MOUNTS).unwrap();
        let mut config = AgentConfig::default();
        config.lvm.mounts_file = path.display().to_string();
        config
    }

    #[test]
    fn test_parse_mounts_unescapes() {
        let mounts = parse_mounts("/dev/sdb1 /mnt/with\\040space ext4 rw 0 0\n");
        assert_eq!(mounts[0].mount_point, "/mnt/with space");
        assert_eq!(mounts[0].fs_type, "ext4");
    }

    #[test]
    fn test_mapper_path_doubles_dashes() {
        assert_eq!(mapper_path("vg-app", "my-data"), "/dev/mapper/vg--app-my--data");
    }

    #[tokio::test]
    async fn test_list_annotates_mounts() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, runner) = handler_with(config_with_mounts(&dir));
        runner.on("lvs --noheadings", CmdOutput::ok(LVS_OUT));
        runner.on("blkid .* /dev/vg_root/s1_var", CmdOutput::ok("ext4\n"));

        let reply = handler.handle(AgentRequest::LvmList { tag: None }).await;
        let records: Vec<LvRecord> = reply.decode().unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].mount_point.as_deref(), Some("/"));
        assert_eq!(records[1].fs_type.as_deref(), Some("ext4"));
        assert_eq!(records[1].mount_point.as_deref(), Some("/var"));
        assert!(records[2].is_snapshot());
        assert_eq!(records[2].mount_point, None);
        assert_eq!(records[2].fs_type.as_deref(), Some("ext4"));
    }

    #[tokio::test]
    async fn test_list_by_tag() {
        let (handler, runner) = handler_with(AgentConfig::default());
        runner.on("lvs", CmdOutput::ok(""));

        let reply = handler
            .handle(AgentRequest::LvmList {
                tag: Some("snapset".to_string()),
            })
            .await;
        assert!(reply.ok);
        assert!(runner.calls()[0].ends_with("@snapset"));
    }

    #[tokio::test]
    async fn test_snapshot_command() {
        let (handler, runner) = handler_with(AgentConfig::default());
        runner.on("lvcreate", CmdOutput::ok("Logical volume \"s1_var\" created.\n"));

        let reply = handler
            .handle(AgentRequest::LvmSnapshot {
                origin_path: "/dev/vg_root/lv_var".to_string(),
                name: "s1_var".to_string(),
                tag: "snapset".to_string(),
                percent: 50,
            })
            .await;
        assert!(reply.ok, "{:?}", reply.error);
        assert_eq!(
            runner.calls(),
            vec!["/sbin/lvcreate -s --addtag snapset -l 50%ORIGIN -n s1_var /dev/vg_root/lv_var"]
        );
    }

    #[tokio::test]
    async fn test_snapshot_rejects_zero_size() {
        let (handler, runner) = handler_with(AgentConfig::default());
        let reply = handler
            .handle(AgentRequest::LvmSnapshot {
                origin_path: "/dev/vg_root/lv_var".to_string(),
                name: "s1_var".to_string(),
                tag: "snapset".to_string(),
                percent: 0,
            })
            .await;
        assert!(!reply.ok);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_remove_absent_volume() {
        let (handler, runner) = handler_with(AgentConfig::default());
        runner.on("lvs", CmdOutput::failed(5, "Failed to find logical volume"));

        let reply = handler
            .handle(AgentRequest::LvmRemove {
                path: "/dev/vg_root/s1_var".to_string(),
            })
            .await;
        assert_eq!(reply.decode::<DestroyOutcome>().unwrap(), DestroyOutcome::AlreadyAbsent);
        assert!(!runner.calls().iter().any(|c| c.contains("lvremove")));
    }

    #[tokio::test]
    async fn test_remove_existing_volume() {
        let (handler, runner) = handler_with(AgentConfig::default());
        runner.on("lvs", CmdOutput::ok("  s1_var\n"));
        runner.on("lvremove", CmdOutput::ok(""));

        let reply = handler
            .handle(AgentRequest::LvmRemove {
                path: "/dev/vg_root/s1_var".to_string(),
            })
            .await;
        assert_eq!(reply.decode::<DestroyOutcome>().unwrap(), DestroyOutcome::Destroyed);
        assert!(runner.calls().contains(&"/sbin/lvremove -f /dev/vg_root/s1_var".to_string()));
    }
}
