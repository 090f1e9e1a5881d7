//! Node-local LVM snapshots through the node agent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::{DestroyOutcome, SnapOutcome, VolDriver};
use crate::agent_api::AgentRequest;
use crate::error::{Error, Result};
use crate::model::LocalVolume;
use crate::rpc::RpcClient;

/// Fields the agent asks `lvs` for, in order, with `--separator ,`.
pub const LVS_FIELDS: &str =
    "lv_name,lv_tags,lv_attr,lv_path,vg_name,origin,lv_snapshot_invalid,snap_percent,lv_time";

const LVS_COLUMNS: usize = 9;

/// One logical volume as reported by `lvs`, plus what the agent adds from
/// `blkid` and the mount table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LvRecord {
    pub name: String,
    pub tags: String,
    pub attr: String,
    pub path: String,
    pub vg: String,
    /// Origin LV for snapshots, empty otherwise.
    pub origin: String,
    pub snapshot_invalid: bool,
    pub snap_percent: Option<f64>,
    pub time: String,
    #[serde(default)]
    pub fs_type: Option<String>,
    #[serde(default)]
    pub mount_point: Option<String>,
}

impl LvRecord {
    /// Snapshot volumes carry `s` (or `S` once invalid) as first attribute.
    pub fn is_snapshot(&self) -> bool {
        matches!(self.attr.chars().next(), Some('s') | Some('S'))
    }

    pub fn is_origin_or_plain(&self) -> bool {
        !self.is_snapshot()
    }

    /// A snapshot that has not overflowed or been invalidated.
    pub fn is_valid(&self) -> bool {
        !self.snapshot_invalid && self.snap_percent.map_or(true, |p| p < 100.0)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.split(',').any(|t| t.trim() == tag)
    }
}

/// Parse `lvs --noheadings --separator , -o <LVS_FIELDS>` output.
///
/// `lv_tags` is itself comma separated, so any columns beyond the expected
/// count belong to it.
pub fn parse_lvs(text: &str) -> Vec<LvRecord> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.trim().split(',').map(str::trim).collect();
            if fields.len() < LVS_COLUMNS {
                return None;
            }
            let extra = fields.len() - LVS_COLUMNS;
            let rest = &fields[2 + extra..];
            let attr = rest[0].to_string();
            Some(LvRecord {
                name: fields[0].to_string(),
                tags: fields[1..2 + extra].join(","),
                snapshot_invalid: !rest[4].is_empty() || attr.starts_with('S'),
                attr,
                path: rest[1].to_string(),
                vg: rest[2].to_string(),
                origin: rest[3].to_string(),
                snap_percent: rest[5].parse().ok(),
                time: rest[6].to_string(),
                fs_type: None,
                mount_point: None,
            })
        })
        .collect()
}

/// Drives LVM on any host through its agent.
pub struct RpcVolDriver {
    rpc: RpcClient,
    tag: String,
}

impl RpcVolDriver {
    pub fn new(rpc: RpcClient, tag: impl Into<String>) -> Self {
        Self {
            rpc,
            tag: tag.into(),
        }
    }
}

#[async_trait]
impl VolDriver for RpcVolDriver {
    async fn enumerate(&self, host: &str, tag: Option<&str>) -> Result<Vec<LvRecord>> {
        let request = AgentRequest::LvmList {
            tag: tag.map(String::from),
        };
        self.rpc.call(host, &request).await
    }

    #[instrument(skip(self, volume), fields(lv = %volume.path))]
    async fn snap(&self, host: &str, volume: &LocalVolume, snap_name: &str) -> Result<SnapOutcome> {
        let existing = self
            .enumerate(host, None)
            .await?
            .into_iter()
            .find(|lv| lv.vg == volume.vg && lv.name == snap_name);
        if let Some(lv) = existing {
            if lv.origin == volume.lv {
                info!("Snapshot volume already present");
                return Ok(SnapOutcome::AlreadyPresent);
            }
            return Err(Error::NameConflict(format!(
                "{}/{} on {} has origin {}, expected {}",
                volume.vg, snap_name, host, lv.origin, volume.lv
            )));
        }

        let request = AgentRequest::LvmSnapshot {
            origin_path: volume.path.clone(),
            name: snap_name.to_string(),
            tag: self.tag.clone(),
            percent: volume.snap_size,
        };
        self.rpc.call::<()>(host, &request).await?;
        info!("Snapshot volume created");
        Ok(SnapOutcome::Created)
    }

    async fn restore(&self, host: &str, snap_path: &str) -> Result<()> {
        let request = AgentRequest::LvmMerge {
            path: snap_path.to_string(),
        };
        self.rpc.call(host, &request).await
    }

    async fn destroy(&self, host: &str, snap_path: &str) -> Result<DestroyOutcome> {
        let request = AgentRequest::LvmRemove {
            path: snap_path.to_string(),
        };
        self.rpc.call(host, &request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::agent_api::AgentReply;
    use crate::mock::MockTransport;

    const LVS: &str = "\
  lv_root,,owi-aos---,/dev/vg_root/lv_root,vg_root,,,,2024-01-02 10:00:00 +0000
  s1_vg_root_lv_root,snapset_snapshot,swi-a-s---,/dev/vg_root/s1_vg_root_lv_root,vg_root,lv_root,,12.50,2024-01-02 10:05:00 +0000
  s1_vg_root_lv_var,snapset_snapshot,backup,Swi-I-s---,/dev/vg_root/s1_vg_root_lv_var,vg_root,lv_var,snapshot invalid,100.00,2024-01-02 10:05:00 +0000
";

    #[test]
    fn test_parse_lvs() {
        let lvs = parse_lvs(LVS);
        assert_eq!(lvs.len(), 3);
        assert!(lvs[0].is_origin_or_plain());
        assert_eq!(lvs[0].snap_percent, None);

        assert!(lvs[1].is_snapshot());
        assert!(lvs[1].is_valid());
        assert!(lvs[1].has_tag("snapset_snapshot"));
        assert_eq!(lvs[1].origin, "lv_root");

        assert!(lvs[2].snapshot_invalid);
        assert_eq!(lvs[2].tags, "snapset_snapshot,backup");
        assert_eq!(lvs[2].vg, "vg_root");
        assert!(!lvs[2].is_valid());
    }

    #[tokio::test]
    async fn test_snap_existing_volume() {
        let transport = Arc::new(MockTransport::new());
        transport.reply("ms-1", "lvm/list", AgentReply::success(parse_lvs(LVS)));
        let driver = RpcVolDriver::new(
            RpcClient::new(transport.clone(), Duration::from_secs(5)),
            "snapset_snapshot",
        );
        let volume = LocalVolume {
            vg: "vg_root".to_string(),
            lv: "lv_root".to_string(),
            path: "/dev/vg_root/lv_root".to_string(),
            snap_size: 50,
            mount_point: Some("/".to_string()),
            modeled: true,
        };

        let outcome = driver.snap("ms-1", &volume, "s1_vg_root_lv_root").await.unwrap();
        assert_eq!(outcome, SnapOutcome::AlreadyPresent);

        let err = driver.snap("ms-1", &volume, "s1_vg_root_lv_var").await.unwrap_err();
        assert!(matches!(err, Error::NameConflict(_)));
    }
}
