//! Collection pipeline: enumerate, collect each pid in tiers, aggregate

use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::cache::CommandLineCache;
use crate::cgroup::{CgroupReader, ProcCgroupReader};
use crate::collector::{ExtendedOptions, ProcessCollector, Tier};
use crate::config::StatsConfig;
use crate::error::{CollectError, PidErrors};
use crate::resolve::HostFs;
use crate::state::{ProcState, ProcsMap};
use crate::top::TopProcesses;

/// One process and the non-fatal errors hit while collecting it.
#[derive(Debug)]
pub struct PidResult {
    pub state: ProcState,
    pub errors: PidErrors,
}

/// The result of one full scan.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub procs: ProcsMap,
    /// The same processes in the order they were enumerated.
    pub ordered: Vec<ProcState>,
    /// Non-fatal errors for pids that are present in `procs`.
    pub errors: BTreeMap<u32, PidErrors>,
    /// Pids that could not be collected at all.
    pub skipped: BTreeMap<u32, CollectError>,
    pub top: Option<TopProcesses>,
}

impl Snapshot {
    /// Record a collected process. A pid seen earlier in the same scan is
    /// replaced in place.
    fn insert(&mut self, state: ProcState, errors: PidErrors) {
        let pid = state.pid;
        self.skipped.remove(&pid);
        if errors.is_empty() {
            self.errors.remove(&pid);
        } else {
            self.errors.insert(pid, errors);
        }
        if self.procs.contains_key(&pid) {
            if let Some(prev) = self.ordered.iter_mut().find(|p| p.pid == pid) {
                *prev = state.clone();
            }
        } else {
            self.ordered.push(state.clone());
        }
        self.procs.insert(pid, state);
    }

    /// Record a pid that could not be collected, dropping any earlier
    /// entry for it from the same scan.
    fn skip(&mut self, pid: u32, error: CollectError) {
        self.discard(pid);
        self.skipped.insert(pid, error);
    }

    fn discard(&mut self, pid: u32) {
        if self.procs.remove(&pid).is_some() {
            self.ordered.retain(|p| p.pid != pid);
        }
        self.errors.remove(&pid);
        self.skipped.remove(&pid);
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>, regex::Error> {
    patterns.iter().map(|p| Regex::new(p)).collect()
}

pub struct ProcessStats<C: ProcessCollector> {
    collector: C,
    config: StatsConfig,
    names: Vec<Regex>,
    extended: ExtendedOptions,
    cache: Option<CommandLineCache>,
    cgroups: Option<Box<dyn CgroupReader>>,
}

impl<C: ProcessCollector> ProcessStats<C> {
    pub fn new(collector: C, config: StatsConfig) -> Result<Self, regex::Error> {
        let names = compile(&config.procs)?;
        let extended = ExtendedOptions {
            cpu_ticks: config.cpu_ticks,
            env_patterns: compile(&config.env_whitelist)?,
        };
        let cache = config.cache_cmdline.then(CommandLineCache::new);
        let cgroups: Option<Box<dyn CgroupReader>> = if config.cgroups.enabled {
            let hostfs = config.hostfs.clone().map(HostFs::new).unwrap_or_default();
            Some(Box::new(ProcCgroupReader::new(
                hostfs,
                config.cgroups.ignore_root_cgroups,
            )))
        } else {
            None
        };
        Ok(Self {
            collector,
            config,
            names,
            extended,
            cache,
            cgroups,
        })
    }

    /// Replace the cgroup reader. Has no effect unless cgroups are enabled.
    pub fn with_cgroup_reader(mut self, reader: impl CgroupReader + 'static) -> Self {
        if self.config.cgroups.enabled {
            self.cgroups = Some(Box::new(reader));
        }
        self
    }

    pub fn config(&self) -> &StatsConfig {
        &self.config
    }

    pub fn collector(&self) -> &C {
        &self.collector
    }

    pub fn cache(&self) -> Option<&CommandLineCache> {
        self.cache.as_ref()
    }

    pub fn name_matches(&self, name: &str) -> bool {
        self.names.is_empty() || self.names.iter().any(|re| re.is_match(name))
    }

    fn collect_basic(&self, pid: u32) -> Result<ProcState, CollectError> {
        let handle = self.collector.open(pid, Tier::Basic)?;
        self.collector.collect_basic(&handle)
    }

    fn fetch_args(&self, handle: &C::Handle, state: &ProcState) -> Result<Vec<String>, CollectError> {
        match &self.cache {
            Some(cache) => cache.lookup_or_fetch(state.identity(), || self.collector.fetch_args(handle)),
            None => self.collector.fetch_args(handle),
        }
    }

    /// Everything after the basic tier. Nothing here can fail the pid.
    fn enrich(&self, mut state: ProcState) -> PidResult {
        let mut errors = PidErrors::new(state.pid);

        if self.config.extended {
            match self.collector.open(state.pid, Tier::Extended) {
                Ok(handle) => {
                    errors.extend(self.collector.collect_extended(&handle, &mut state, &self.extended));
                    state.args = errors.record("args", self.fetch_args(&handle, &state));
                }
                Err(e) => errors.push("extended", CollectError::field("extended", e)),
            }
        }

        if let Some(reader) = &self.cgroups {
            match reader.read(state.pid) {
                Ok(info) => state.cgroup = info,
                Err(e) => errors.push("cgroup", e),
            }
        }

        PidResult { state, errors }
    }

    /// Collect a single pid regardless of the name patterns. Only a failure
    /// of the basic tier is returned as an error.
    pub fn get_one(&self, pid: u32) -> Result<PidResult, CollectError> {
        let state = self.collect_basic(pid)?;
        let result = self.enrich(state);
        if !result.errors.is_empty() {
            debug!("{}", result.errors);
        }
        Ok(result)
    }

    /// Scan every visible process. Only a failure to enumerate fails the
    /// scan; per-pid failures land in [`Snapshot::skipped`]. If a pid is
    /// listed more than once, the last attempt decides its outcome.
    pub fn fetch_all(&self) -> Result<Snapshot, CollectError> {
        let pids = self.collector.enumerate()?;
        let mut snap = Snapshot::default();

        for &pid in &pids {
            let state = match self.collect_basic(pid) {
                Ok(state) => state,
                Err(e) => {
                    if e.is_not_found() {
                        debug!(pid, "process exited during scan");
                    } else {
                        debug!(pid, error = %e, "skipping process");
                    }
                    snap.skip(pid, e);
                    continue;
                }
            };
            if !self.name_matches(&state.name) {
                snap.discard(pid);
                continue;
            }

            let PidResult { state, errors } = self.enrich(state);
            if !errors.is_empty() {
                debug!("{}", errors);
            }
            snap.insert(state, errors);
        }

        if let Some(cache) = &self.cache {
            let live: HashSet<u32> = pids.iter().copied().collect();
            cache.evict_absent(&live);
        }

        let top = &self.config.include_top;
        if top.enabled {
            snap.top = Some(TopProcesses::select(&snap.procs, top.by_cpu, top.by_memory));
        }

        debug!(
            processes = snap.procs.len(),
            skipped = snap.skipped.len(),
            partial = snap.errors.len(),
            "scan complete"
        );
        Ok(snap)
    }
}

#[cfg(target_os = "linux")]
impl ProcessStats<crate::collector::LinuxProcessCollector> {
    /// Pipeline over the host's `/proc`, honoring `config.hostfs`.
    pub fn native(config: StatsConfig) -> Result<Self, regex::Error> {
        let hostfs = config.hostfs.clone().map(HostFs::new).unwrap_or_default();
        let collector = crate::collector::LinuxProcessCollector::with_root(hostfs);
        Self::new(collector, config)
    }
}

#[cfg(windows)]
impl ProcessStats<crate::collector::WindowsProcessCollector> {
    pub fn native(config: StatsConfig) -> Result<Self, regex::Error> {
        if config.hostfs.is_some() {
            tracing::warn!("hostfs is not supported on Windows, ignoring");
        }
        Self::new(crate::collector::WindowsProcessCollector::new(), config)
    }
}
