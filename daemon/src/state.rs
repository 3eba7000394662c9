//! Per-process snapshot records

use serde::Serialize;
use std::collections::BTreeMap;

use crate::cgroup::CgroupInfo;

/// Canonical process lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PidState {
    Running,
    Sleeping,
    DiskSleep,
    Stopped,
    Zombie,
    Idle,
    Dead,
    #[default]
    Unknown,
}

impl PidState {
    /// Map the single-character state code from `/proc/[pid]/stat`.
    pub fn from_stat_code(code: u8) -> Self {
        match code {
            b'R' => PidState::Running,
            b'S' => PidState::Sleeping,
            b'D' => PidState::DiskSleep,
            b'T' | b't' => PidState::Stopped,
            b'Z' => PidState::Zombie,
            b'I' => PidState::Idle,
            b'X' | b'x' => PidState::Dead,
            _ => PidState::Unknown,
        }
    }

    /// Map a Windows exit code. Only a live/not-live distinction is available
    /// there, so anything other than STILL_ACTIVE reads as sleeping.
    pub fn from_exit_code(code: u32) -> Self {
        const STILL_ACTIVE: u32 = 259;
        if code == STILL_ACTIVE {
            PidState::Running
        } else {
            PidState::Sleeping
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PidState::Running => "running",
            PidState::Sleeping => "sleeping",
            PidState::DiskSleep => "disk_sleep",
            PidState::Stopped => "stopped",
            PidState::Zombie => "zombie",
            PidState::Idle => "idle",
            PidState::Dead => "dead",
            PidState::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for PidState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pid plus its start time, used to tell a recycled pid apart from the
/// process that held it before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessIdentity {
    pub pid: u32,
    /// Milliseconds since the Unix epoch.
    pub start_time: Option<u64>,
}

/// CPU accounting. Tick values are milliseconds of CPU time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CpuInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_ticks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_ticks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_ticks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,
}

impl CpuInfo {
    pub fn set_ticks(&mut self, user: u64, system: u64) {
        self.user_ticks = Some(user);
        self.system_ticks = Some(system);
        self.total_ticks = Some(user.saturating_add(system));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rss_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcState {
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ppid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pgid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_threads: Option<u32>,
    pub name: String,
    pub state: PidState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    pub cpu: CpuInfo,
    pub memory: MemInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroup: Option<CgroupInfo>,
}

impl ProcState {
    pub fn new(pid: u32) -> Self {
        ProcState {
            pid,
            ..Default::default()
        }
    }

    pub fn identity(&self) -> ProcessIdentity {
        ProcessIdentity {
            pid: self.pid,
            start_time: self.cpu.start_time,
        }
    }
}

/// All processes from one scan, keyed by pid.
pub type ProcsMap = BTreeMap<u32, ProcState>;
