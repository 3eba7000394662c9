//! Most expensive processes by CPU and memory

use crate::state::{ProcState, ProcsMap};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopProcesses {
    /// `None` when CPU selection is disabled.
    pub by_cpu: Option<Vec<ProcState>>,
    /// `None` when memory selection is disabled.
    pub by_memory: Option<Vec<ProcState>>,
}

impl TopProcesses {
    /// Rank `procs` by total CPU ticks and by resident memory. A limit of 0
    /// disables that dimension. Processes without the metric are not ranked
    /// in it; ties go to the lower pid.
    pub fn select(procs: &ProcsMap, by_cpu: usize, by_memory: usize) -> Self {
        TopProcesses {
            by_cpu: rank(procs, by_cpu, |p| p.cpu.total_ticks),
            by_memory: rank(procs, by_memory, |p| p.memory.rss_bytes),
        }
    }
}

fn rank(procs: &ProcsMap, limit: usize, metric: impl Fn(&ProcState) -> Option<u64>) -> Option<Vec<ProcState>> {
    if limit == 0 {
        return None;
    }
    let mut ranked: Vec<(u64, &ProcState)> = procs
        .values()
        .filter_map(|p| metric(p).map(|v| (v, p)))
        .collect();
    ranked.sort_by(|(va, a), (vb, b)| vb.cmp(va).then(a.pid.cmp(&b.pid)));
    Some(ranked.into_iter().take(limit).map(|(_, p)| p.clone()).collect())
}
