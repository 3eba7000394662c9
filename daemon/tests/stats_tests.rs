//! Pipeline tests against an in-memory collector

use proctel_daemon::{
    cgroup::{CgroupInfo, CgroupReader},
    collector::{ExtendedOptions, ProcessCollector, Tier},
    config::StatsConfig,
    error::{CollectError, PidErrors, Severity},
    state::{PidState, ProcState},
    stats::ProcessStats,
};
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
struct FakeProc {
    name: String,
    code: u8,
    ppid: u32,
    threads: u32,
    start_time: u64,
    ticks: u64,
    rss: u64,
    args: Vec<String>,
}

fn fake(name: &str, ticks: u64, rss: u64) -> FakeProc {
    FakeProc {
        name: name.to_string(),
        code: b'S',
        ppid: 1,
        threads: 1,
        start_time: 1_000,
        ticks,
        rss,
        args: vec![format!("/usr/bin/{}", name)],
    }
}

#[derive(Default)]
struct Counters {
    opened: AtomicUsize,
    closed: AtomicUsize,
    arg_fetches: AtomicUsize,
}

#[derive(Default)]
struct FakeCollector {
    procs: Mutex<BTreeMap<u32, FakeProc>>,
    /// Pids listed by enumerate() but gone by open time.
    vanished: Mutex<Vec<u32>>,
    duplicates: Mutex<Vec<u32>>,
    deny_extended: Mutex<HashSet<u32>>,
    deny_username: Mutex<HashSet<u32>>,
    /// Pids whose basic tier can only be opened once.
    open_once: Mutex<HashSet<u32>>,
    basic_opened: Mutex<HashSet<u32>>,
    fail_enumerate: bool,
    counters: Arc<Counters>,
}

struct FakeHandle {
    pid: u32,
    tier: Tier,
    counters: Arc<Counters>,
}

impl Drop for FakeHandle {
    fn drop(&mut self) {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl FakeCollector {
    fn with(procs: Vec<(u32, FakeProc)>) -> Self {
        let c = FakeCollector::default();
        c.procs.lock().unwrap().extend(procs);
        c
    }

    fn proc(&self, pid: u32) -> Option<FakeProc> {
        self.procs.lock().unwrap().get(&pid).cloned()
    }
}

impl ProcessCollector for FakeCollector {
    type Handle = FakeHandle;
    type RawState = u8;

    fn enumerate(&self) -> Result<Vec<u32>, CollectError> {
        if self.fail_enumerate {
            return Err(CollectError::Enumeration(io::Error::from(io::ErrorKind::PermissionDenied)));
        }
        let mut pids: Vec<u32> = self.procs.lock().unwrap().keys().copied().collect();
        pids.extend(self.vanished.lock().unwrap().iter());
        pids.extend(self.duplicates.lock().unwrap().iter());
        Ok(pids)
    }

    fn open(&self, pid: u32, tier: Tier) -> Result<FakeHandle, CollectError> {
        if self.proc(pid).is_none() {
            return Err(CollectError::HandleOpen {
                pid,
                source: io::Error::from(io::ErrorKind::NotFound),
            });
        }
        if tier == Tier::Basic
            && self.open_once.lock().unwrap().contains(&pid)
            && !self.basic_opened.lock().unwrap().insert(pid)
        {
            return Err(CollectError::HandleOpen {
                pid,
                source: io::Error::from(io::ErrorKind::NotFound),
            });
        }
        if tier == Tier::Extended && self.deny_extended.lock().unwrap().contains(&pid) {
            return Err(CollectError::HandleOpen {
                pid,
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            });
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(FakeHandle {
            pid,
            tier,
            counters: Arc::clone(&self.counters),
        })
    }

    fn collect_basic(&self, handle: &FakeHandle) -> Result<ProcState, CollectError> {
        assert_eq!(handle.tier, Tier::Basic);
        let p = self
            .proc(handle.pid)
            .ok_or_else(|| CollectError::parse("stat", "gone"))?;
        let mut state = ProcState::new(handle.pid);
        state.name = p.name;
        state.state = Self::map_state(p.code);
        state.ppid = Some(p.ppid);
        state.pgid = Some(handle.pid);
        state.num_threads = Some(p.threads);
        state.cpu.start_time = Some(p.start_time);
        Ok(state)
    }

    fn collect_extended(&self, handle: &FakeHandle, state: &mut ProcState, opts: &ExtendedOptions) -> PidErrors {
        assert_eq!(handle.tier, Tier::Extended);
        let mut errs = PidErrors::new(handle.pid);
        let Some(p) = self.proc(handle.pid) else {
            return errs;
        };
        if self.deny_username.lock().unwrap().contains(&handle.pid) {
            errs.push(
                "username",
                CollectError::field("username", io::Error::from(io::ErrorKind::PermissionDenied)),
            );
        } else {
            state.username = Some("root".to_string());
        }
        state.memory.rss_bytes = Some(p.rss);
        state.memory.size = Some(p.rss * 4);
        if opts.cpu_ticks {
            state.cpu.set_ticks(p.ticks, 0);
        }
        errs
    }

    fn fetch_args(&self, handle: &FakeHandle) -> Result<Vec<String>, CollectError> {
        self.counters.arg_fetches.fetch_add(1, Ordering::SeqCst);
        self.proc(handle.pid)
            .map(|p| p.args)
            .ok_or_else(|| CollectError::field("args", "gone"))
    }

    fn map_state(raw: u8) -> PidState {
        PidState::from_stat_code(raw)
    }
}

fn config() -> StatsConfig {
    StatsConfig {
        procs: vec![],
        ..StatsConfig::default()
    }
}

fn five() -> FakeCollector {
    FakeCollector::with(vec![
        (10, fake("alpha", 100, 5_000)),
        (20, fake("beta", 500, 1_000)),
        (30, fake("gamma", 300, 9_000)),
        (40, fake("delta", 500, 2_000)),
        (50, fake("epsilon", 200, 3_000)),
    ])
}

#[test]
fn test_fetch_all_collects_every_process() {
    let stats = ProcessStats::new(five(), config()).unwrap();
    let snap = stats.fetch_all().unwrap();
    assert_eq!(snap.len(), 5);
    assert_eq!(snap.ordered.len(), 5);
    assert!(snap.errors.is_empty());
    assert!(snap.skipped.is_empty());

    let beta = &snap.procs[&20];
    assert_eq!(beta.name, "beta");
    assert_eq!(beta.state, PidState::Sleeping);
    assert_eq!(beta.username.as_deref(), Some("root"));
    assert_eq!(beta.cpu.total_ticks, Some(500));
    assert_eq!(beta.args.as_deref(), Some(&["/usr/bin/beta".to_string()][..]));
}

#[test]
fn test_extended_denial_is_isolated_to_one_pid() {
    let collector = five();
    collector.deny_extended.lock().unwrap().insert(30);
    let stats = ProcessStats::new(collector, config()).unwrap();
    let snap = stats.fetch_all().unwrap();

    assert_eq!(snap.len(), 5);
    let gamma = &snap.procs[&30];
    assert_eq!(gamma.name, "gamma");
    assert_eq!(gamma.state, PidState::Sleeping);
    assert_eq!(gamma.ppid, Some(1));
    assert_eq!(gamma.num_threads, Some(1));
    assert!(gamma.username.is_none());
    assert!(gamma.args.is_none());
    assert!(gamma.memory.rss_bytes.is_none());
    assert!(gamma.cpu.total_ticks.is_none());

    let errs = &snap.errors[&30];
    assert_eq!(errs.len(), 1);
    assert_eq!(errs.errors[0].severity(), Severity::NonFatal);
    assert_eq!(snap.errors.len(), 1);
    assert!(snap.procs[&20].username.is_some());
}

#[test]
fn test_get_one_other_user_username_fails_non_fatally() {
    let collector = five();
    collector.deny_username.lock().unwrap().insert(10);
    let stats = ProcessStats::new(collector, config()).unwrap();

    let result = stats.get_one(10).unwrap();
    assert_eq!(result.state.name, "alpha");
    assert_eq!(result.state.state, PidState::Sleeping);
    assert!(result.state.username.is_none());
    assert_eq!(result.state.memory.rss_bytes, Some(5_000));
    assert_eq!(result.errors.fields().collect::<Vec<_>>(), vec!["username"]);
    assert!(result.errors.to_string().contains("could not get all information for PID 10"));
}

#[test]
fn test_get_one_missing_pid_is_fatal() {
    let stats = ProcessStats::new(five(), config()).unwrap();
    let err = stats.get_one(999).unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.severity(), Severity::Fatal);
}

#[test]
fn test_vanished_pid_does_not_abort_scan() {
    let collector = five();
    collector.vanished.lock().unwrap().push(77);
    let stats = ProcessStats::new(collector, config()).unwrap();
    let snap = stats.fetch_all().unwrap();
    assert_eq!(snap.len(), 5);
    assert!(matches!(snap.skipped[&77], CollectError::HandleOpen { pid: 77, .. }));
}

#[test]
fn test_enumeration_failure_fails_scan() {
    let collector = FakeCollector {
        fail_enumerate: true,
        ..FakeCollector::default()
    };
    let stats = ProcessStats::new(collector, config()).unwrap();
    assert!(matches!(stats.fetch_all(), Err(CollectError::Enumeration(_))));
}

#[test]
fn test_handles_released_on_every_path() {
    let collector = five();
    collector.deny_extended.lock().unwrap().insert(20);
    collector.vanished.lock().unwrap().push(88);
    let counters = Arc::clone(&collector.counters);
    let stats = ProcessStats::new(collector, config()).unwrap();
    stats.fetch_all().unwrap();
    stats.get_one(40).unwrap();

    let opened = counters.opened.load(Ordering::SeqCst);
    assert!(opened > 0);
    assert_eq!(opened, counters.closed.load(Ordering::SeqCst));
}

#[test]
fn test_top_two_by_cpu() {
    let mut cfg = config();
    cfg.include_top.enabled = true;
    cfg.include_top.by_cpu = 2;
    cfg.include_top.by_memory = 0;
    let stats = ProcessStats::new(five(), cfg).unwrap();
    let snap = stats.fetch_all().unwrap();

    let top = snap.top.as_ref().unwrap();
    let by_cpu: Vec<u32> = top.by_cpu.as_ref().unwrap().iter().map(|p| p.pid).collect();
    assert_eq!(by_cpu, vec![20, 40]);
    assert!(top.by_memory.is_none());
    assert_eq!(snap.len(), 5);
}

#[test]
fn test_top_disabled_leaves_no_selection() {
    let mut cfg = config();
    cfg.include_top.enabled = false;
    let stats = ProcessStats::new(five(), cfg).unwrap();
    assert!(stats.fetch_all().unwrap().top.is_none());
}

#[test]
fn test_cache_reuses_args_across_scans() {
    let collector = five();
    let counters = Arc::clone(&collector.counters);
    let stats = ProcessStats::new(collector, config()).unwrap();

    let first = stats.fetch_all().unwrap();
    assert_eq!(counters.arg_fetches.load(Ordering::SeqCst), 5);
    let second = stats.fetch_all().unwrap();
    assert_eq!(counters.arg_fetches.load(Ordering::SeqCst), 5);
    assert_eq!(first.procs, second.procs);
}

#[test]
fn test_cache_refetches_on_pid_reuse() {
    let collector = five();
    let counters = Arc::clone(&collector.counters);
    let stats = ProcessStats::new(collector, config()).unwrap();
    stats.fetch_all().unwrap();

    {
        let mut procs = stats.collector().procs.lock().unwrap();
        let mut reused = fake("intruder", 1, 1);
        reused.start_time = 2_000;
        procs.insert(10, reused);
    }
    let snap = stats.fetch_all().unwrap();
    assert_eq!(counters.arg_fetches.load(Ordering::SeqCst), 6);
    assert_eq!(snap.procs[&10].args.as_deref(), Some(&["/usr/bin/intruder".to_string()][..]));
}

#[test]
fn test_cache_evicts_absent_pids() {
    let stats = ProcessStats::new(five(), config()).unwrap();
    stats.fetch_all().unwrap();
    assert_eq!(stats.cache().unwrap().len(), 5);

    stats.collector().procs.lock().unwrap().remove(&50);
    stats.fetch_all().unwrap();
    let cache = stats.cache().unwrap();
    assert_eq!(cache.len(), 4);
    assert!(cache.get(50).is_none());
}

#[test]
fn test_disabling_cache_only_changes_cost() {
    let cached = ProcessStats::new(five(), config()).unwrap();
    let mut cfg = config();
    cfg.cache_cmdline = false;
    let collector = five();
    let counters = Arc::clone(&collector.counters);
    let uncached = ProcessStats::new(collector, cfg).unwrap();

    cached.fetch_all().unwrap();
    uncached.fetch_all().unwrap();
    let a = cached.fetch_all().unwrap();
    let b = uncached.fetch_all().unwrap();
    assert_eq!(a.procs, b.procs);
    assert!(uncached.cache().is_none());
    assert_eq!(counters.arg_fetches.load(Ordering::SeqCst), 10);
}

#[test]
fn test_name_patterns_filter_processes() {
    let mut cfg = config();
    cfg.procs = vec!["^al".to_string(), "^del".to_string()];
    let stats = ProcessStats::new(five(), cfg).unwrap();
    let snap = stats.fetch_all().unwrap();
    let pids: Vec<u32> = snap.procs.keys().copied().collect();
    assert_eq!(pids, vec![10, 40]);

    // get_one ignores the filter
    assert_eq!(stats.get_one(20).unwrap().state.name, "beta");

    let all = ProcessStats::new(five(), config()).unwrap();
    assert_eq!(all.fetch_all().unwrap().len(), 5);
}

#[test]
fn test_invalid_pattern_is_rejected() {
    let mut cfg = config();
    cfg.procs = vec!["(unclosed".to_string()];
    assert!(ProcessStats::new(five(), cfg).is_err());
}

#[test]
fn test_cpu_ticks_disabled_leaves_cpu_unset() {
    let mut cfg = config();
    cfg.cpu_ticks = false;
    let stats = ProcessStats::new(five(), cfg).unwrap();
    let snap = stats.fetch_all().unwrap();
    let alpha = &snap.procs[&10];
    assert!(alpha.cpu.total_ticks.is_none());
    assert!(alpha.cpu.user_ticks.is_none());
    assert_eq!(alpha.cpu.start_time, Some(1_000));
    assert_eq!(alpha.memory.rss_bytes, Some(5_000));
}

#[test]
fn test_extended_disabled_collects_basic_only() {
    let mut cfg = config();
    cfg.extended = false;
    let collector = five();
    let counters = Arc::clone(&collector.counters);
    let stats = ProcessStats::new(collector, cfg).unwrap();
    let snap = stats.fetch_all().unwrap();
    let alpha = &snap.procs[&10];
    assert_eq!(alpha.name, "alpha");
    assert!(alpha.username.is_none());
    assert!(alpha.args.is_none());
    assert_eq!(counters.arg_fetches.load(Ordering::SeqCst), 0);
}

#[test]
fn test_duplicate_pid_keeps_one_entry() {
    let collector = five();
    collector.duplicates.lock().unwrap().push(20);
    let stats = ProcessStats::new(collector, config()).unwrap();
    let snap = stats.fetch_all().unwrap();
    assert_eq!(snap.len(), 5);
    assert_eq!(snap.ordered.len(), 5);
    assert_eq!(snap.ordered.iter().filter(|p| p.pid == 20).count(), 1);
}

#[test]
fn test_duplicate_pid_later_failure_wins() {
    let collector = five();
    collector.duplicates.lock().unwrap().push(20);
    collector.open_once.lock().unwrap().insert(20);
    let stats = ProcessStats::new(collector, config()).unwrap();
    let snap = stats.fetch_all().unwrap();

    assert!(!snap.procs.contains_key(&20));
    assert!(snap.ordered.iter().all(|p| p.pid != 20));
    assert!(!snap.errors.contains_key(&20));
    assert!(snap.skipped[&20].is_not_found());
    assert_eq!(snap.len(), 4);
    assert_eq!(snap.ordered.len(), 4);
}

#[test]
fn test_ordered_mirrors_map() {
    let stats = ProcessStats::new(five(), config()).unwrap();
    let snap = stats.fetch_all().unwrap();
    for p in &snap.ordered {
        assert_eq!(&snap.procs[&p.pid], p);
    }
}

struct FlakyCgroups;

impl CgroupReader for FlakyCgroups {
    fn read(&self, pid: u32) -> Result<Option<CgroupInfo>, CollectError> {
        if pid == 40 {
            return Err(CollectError::CgroupRead("no such file".into()));
        }
        let mut info = CgroupInfo::default();
        info.paths.insert("memory".to_string(), format!("/app/{}", pid));
        Ok(Some(info))
    }
}

#[test]
fn test_cgroup_failure_is_non_fatal() {
    let mut cfg = config();
    cfg.cgroups.enabled = true;
    let stats = ProcessStats::new(five(), cfg).unwrap().with_cgroup_reader(FlakyCgroups);
    let snap = stats.fetch_all().unwrap();

    assert_eq!(snap.len(), 5);
    assert_eq!(snap.procs[&10].cgroup.as_ref().unwrap().paths["memory"], "/app/10");
    assert!(snap.procs[&40].cgroup.is_none());
    assert_eq!(snap.procs[&40].username.as_deref(), Some("root"));
    let errs = &snap.errors[&40];
    assert_eq!(errs.fields().collect::<Vec<_>>(), vec!["cgroup"]);
}
