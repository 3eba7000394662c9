//! Command line cache shared across scans

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::error::CollectError;
use crate::state::ProcessIdentity;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub identity: ProcessIdentity,
    pub args: Vec<String>,
    pub fetched_at: Instant,
}

/// Argument vectors keyed by pid and checked against the process start time,
/// so a recycled pid never sees its predecessor's arguments.
#[derive(Debug, Default)]
pub struct CommandLineCache {
    entries: Mutex<HashMap<u32, CacheEntry>>,
}

impl CommandLineCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<u32, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the cached arguments for `identity`, or run `fetch` and cache
    /// its result. An entry only counts as a hit when both start times are
    /// known and equal. The lock is not held while fetching.
    pub fn lookup_or_fetch<F>(&self, identity: ProcessIdentity, fetch: F) -> Result<Vec<String>, CollectError>
    where
        F: FnOnce() -> Result<Vec<String>, CollectError>,
    {
        if identity.start_time.is_some() {
            if let Some(entry) = self.entries().get(&identity.pid) {
                if entry.identity.start_time == identity.start_time {
                    return Ok(entry.args.clone());
                }
            }
        }

        let args = fetch()?;
        self.entries().insert(
            identity.pid,
            CacheEntry {
                identity,
                args: args.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(args)
    }

    /// Drop entries for pids that were not seen in the latest scan.
    pub fn evict_absent(&self, live: &HashSet<u32>) {
        self.entries().retain(|pid, _| live.contains(pid));
    }

    pub fn get(&self, pid: u32) -> Option<CacheEntry> {
        self.entries().get(&pid).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
