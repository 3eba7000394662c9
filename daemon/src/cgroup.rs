//! Per-pid control group attribution

use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;

use crate::error::CollectError;
use crate::resolve::HostFs;

/// Key used for the cgroup v2 unified hierarchy, which has no controller list.
pub const UNIFIED_HIERARCHY: &str = "unified";

/// Cgroup paths keyed by controller list (`cpu,cpuacct`, `memory`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CgroupInfo {
    pub paths: BTreeMap<String, String>,
}

pub trait CgroupReader: Send + Sync {
    /// `Ok(None)` means the process has nothing worth reporting.
    fn read(&self, pid: u32) -> Result<Option<CgroupInfo>, CollectError>;
}

/// Reads `/proc/[pid]/cgroup` under the configured root.
pub struct ProcCgroupReader {
    hostfs: HostFs,
    ignore_root_cgroups: bool,
}

impl ProcCgroupReader {
    pub fn new(hostfs: HostFs, ignore_root_cgroups: bool) -> Self {
        Self {
            hostfs,
            ignore_root_cgroups,
        }
    }
}

impl CgroupReader for ProcCgroupReader {
    fn read(&self, pid: u32) -> Result<Option<CgroupInfo>, CollectError> {
        let path = self.hostfs.proc_path(pid, "cgroup");
        let content = fs::read_to_string(&path).map_err(|e| CollectError::CgroupRead(e.into()))?;
        let info = parse_cgroup_file(&content, self.ignore_root_cgroups)?;
        Ok((!info.paths.is_empty()).then_some(info))
    }
}

/// Parse `hierarchy-ID:controller-list:path` lines.
pub fn parse_cgroup_file(content: &str, ignore_root: bool) -> Result<CgroupInfo, CollectError> {
    let mut info = CgroupInfo::default();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let mut parts = line.splitn(3, ':');
        let (Some(_id), Some(controllers), Some(path)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(CollectError::CgroupRead(format!("malformed line '{}'", line).into()));
        };
        if ignore_root && path == "/" {
            continue;
        }
        let key = if controllers.is_empty() {
            UNIFIED_HIERARCHY
        } else {
            controllers
        };
        info.paths.insert(key.to_string(), path.to_string());
    }
    Ok(info)
}
