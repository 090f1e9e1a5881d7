//! Snapshot set names and the canonical snapshot names derived from them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest accepted set name.
pub const MAX_SET_NAME_LEN: usize = 32;

/// Wildcard accepted by `list` only.
pub const WILDCARD: &str = "*";

/// Prefix of legacy NAS snapshot names used by the default set.
const LEGACY_NAS_PREFIX: &str = "L_";

/// A validated snapshot set name: a non-empty ASCII alphanumeric token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SetName(String);

impl SetName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidName("name must not be empty".to_string()));
        }
        if name == WILDCARD {
            return Err(Error::InvalidName(format!(
                "'{}' is only accepted when listing",
                WILDCARD
            )));
        }
        if name.len() > MAX_SET_NAME_LEN {
            return Err(Error::InvalidName(format!(
                "'{}' is longer than {} characters",
                name, MAX_SET_NAME_LEN
            )));
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::InvalidName(format!(
                "'{}' may only contain letters and digits",
                name
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SetName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for SetName {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::new(s)
    }
}

impl From<SetName> for String {
    fn from(name: SetName) -> Self {
        name.0
    }
}

/// Set argument of `list`: one set or every set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetSelector {
    All,
    Named(SetName),
}

impl FromStr for SetSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == WILDCARD {
            Ok(Self::All)
        } else {
            SetName::new(s).map(Self::Named)
        }
    }
}

impl fmt::Display for SetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str(WILDCARD),
            Self::Named(name) => name.fmt(f),
        }
    }
}

/// Canonical names of one set's snapshots.
///
/// A canonical name identifies exactly one (set, resource) pair; list,
/// validate, restore and remove key on nothing else.
#[derive(Debug, Clone)]
pub struct SnapNames {
    set: SetName,
    legacy_nas: bool,
}

impl SnapNames {
    /// `legacy_nas` selects the `L_{fs}_` form used by the default set.
    pub fn new(set: SetName, legacy_nas: bool) -> Self {
        Self { set, legacy_nas }
    }

    pub fn set(&self) -> &SetName {
        &self.set
    }

    /// `{set}_{lun_id}`
    pub fn lun(&self, lun_id: &str) -> String {
        format!("{}_{}", self.set, lun_id)
    }

    /// Prefix shared by every LUN snapshot of the set.
    pub fn lun_prefix(&self) -> String {
        format!("{}_", self.set)
    }

    /// Resource id encoded in a LUN snapshot name of this set.
    pub fn lun_id_of<'a>(&self, snap_name: &'a str) -> Option<&'a str> {
        snap_name
            .strip_prefix(self.lun_prefix().as_str())
            .filter(|id| !id.is_empty())
    }

    /// `{set}-{fs}`, or `L_{fs}_` for the default set.
    pub fn nas(&self, fs: &str) -> String {
        if self.legacy_nas {
            format!("{}{}_", LEGACY_NAS_PREFIX, fs)
        } else {
            format!("{}-{}", self.set, fs)
        }
    }

    pub fn nas_prefix(&self) -> String {
        if self.legacy_nas {
            LEGACY_NAS_PREFIX.to_string()
        } else {
            format!("{}-", self.set)
        }
    }

    /// Filesystem encoded in a NAS snapshot name of this set.
    pub fn fs_of<'a>(&self, snap_name: &'a str) -> Option<&'a str> {
        let rest = snap_name.strip_prefix(self.nas_prefix().as_str())?;
        let fs = if self.legacy_nas {
            rest.strip_suffix('_')?
        } else {
            rest
        };
        (!fs.is_empty()).then_some(fs)
    }

    /// `{set}_{vg}_{lv}`
    pub fn volume(&self, vg: &str, lv: &str) -> String {
        format!("{}_{}_{}", self.set, vg, lv)
    }

    pub fn volume_prefix(&self) -> String {
        format!("{}_", self.set)
    }
}

/// Rollback cache of a NAS pool.
pub fn cache_name(pool: &str) -> String {
    format!("{}-cache", pool)
}

/// Name of the vendor's "backup before restore" snapshot for a LUN.
pub fn restore_backup_name(prefix: &str, lun_id: &str) -> String {
    format!("{}_{}", prefix, lun_id)
}
