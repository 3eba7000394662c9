//! Process information collectors, one per platform

#[cfg(target_os = "linux")]
pub mod linux;
pub mod procfs;
#[cfg(windows)]
pub mod windows;

#[cfg(target_os = "linux")]
pub use linux::LinuxProcessCollector;
#[cfg(windows)]
pub use windows::WindowsProcessCollector;

/// The collector for the platform this crate was built for.
#[cfg(target_os = "linux")]
pub type NativeCollector = LinuxProcessCollector;
#[cfg(windows)]
pub type NativeCollector = WindowsProcessCollector;

use regex::Regex;

use crate::error::{CollectError, PidErrors};
use crate::state::{PidState, ProcState};

/// Access level needed for a group of fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Name, state, parent, thread count. Available to unprivileged callers.
    Basic,
    /// Arguments, owner, memory and CPU accounting. May be denied for
    /// processes owned by other users.
    Extended,
}

/// What the extended tier should gather besides the always-on fields.
#[derive(Debug, Clone, Default)]
pub struct ExtendedOptions {
    pub cpu_ticks: bool,
    /// Environment keys to capture. Empty disables environment capture.
    pub env_patterns: Vec<Regex>,
}

impl ExtendedOptions {
    pub fn wants_env(&self) -> bool {
        !self.env_patterns.is_empty()
    }

    pub fn env_key_matches(&self, key: &str) -> bool {
        self.env_patterns.iter().any(|re| re.is_match(key))
    }
}

/// Per-platform process introspection.
///
/// Handles returned by [`open`](Self::open) release their native resources
/// when dropped, so every exit path of a pipeline closes them.
pub trait ProcessCollector: Send + Sync {
    type Handle;
    /// Raw status value understood by [`map_state`](Self::map_state).
    type RawState;

    fn enumerate(&self) -> Result<Vec<u32>, CollectError>;

    fn open(&self, pid: u32, tier: Tier) -> Result<Self::Handle, CollectError>;

    /// Fill the basic-tier fields. Failure leaves nothing worth returning.
    fn collect_basic(&self, handle: &Self::Handle) -> Result<ProcState, CollectError>;

    /// Fill extended-tier fields into `state`. Each field that could not be
    /// read is left unset and reported in the returned errors.
    fn collect_extended(
        &self,
        handle: &Self::Handle,
        state: &mut ProcState,
        opts: &ExtendedOptions,
    ) -> PidErrors;

    /// Fetch the argument vector. Kept apart from `collect_extended` so the
    /// caller can serve it from a cache.
    fn fetch_args(&self, handle: &Self::Handle) -> Result<Vec<String>, CollectError>;

    fn map_state(raw: Self::RawState) -> PidState;
}
