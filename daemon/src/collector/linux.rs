use super::procfs::{parse_boot_time, parse_environ, parse_stat, parse_status_uid, parse_statm, split_nul, StatRecord};
use super::{ExtendedOptions, ProcessCollector, Tier};
use crate::error::{CollectError, PidErrors};
use crate::resolve::HostFs;
use crate::state::{PidState, ProcState};
use nix::errno::Errno;
use nix::fcntl::{self, openat, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{Uid, User};
use std::fs;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tracing::debug;

const DEFAULT_PAGE_SIZE: u64 = 4096;
const DEFAULT_CLOCK_TICKS: u64 = 100;

pub struct LinuxProcessCollector {
    hostfs: HostFs,
    page_size: u64,
    clock_ticks: u64,
    boot_time: Option<u64>,
}

/// An open `/proc/[pid]` directory, closed on drop.
///
/// Every file is opened relative to this descriptor, so once the process
/// exits reads fail instead of landing on a new process that reuses the pid.
pub struct ProcDir {
    pid: u32,
    dir: OwnedFd,
}

/// The kernel reports ESRCH for files of a process that has exited.
fn exited(e: io::Error) -> io::Error {
    if e.raw_os_error() == Some(Errno::ESRCH as i32) {
        io::Error::new(io::ErrorKind::NotFound, "process exited")
    } else {
        e
    }
}

impl ProcDir {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn read(&self, file: &str) -> io::Result<Vec<u8>> {
        let fd = openat(
            Some(self.dir.as_raw_fd()),
            file,
            OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| exited(e.into()))?;
        // SAFETY: fd was just returned by openat and has no other owner.
        let mut f = unsafe { fs::File::from_raw_fd(fd) };
        let mut buf = Vec::new();
        f.read_to_end(&mut buf).map_err(exited)?;
        Ok(buf)
    }

    /// Text records may carry the process name, which need not be UTF-8.
    fn read_to_string(&self, file: &str) -> io::Result<String> {
        Ok(String::from_utf8_lossy(&self.read(file)?).into_owned())
    }
}

fn sysconf(name: libc::c_int, fallback: u64) -> u64 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let value = unsafe { libc::sysconf(name) };
    if value > 0 {
        value as u64
    } else {
        fallback
    }
}

impl LinuxProcessCollector {
    pub fn new() -> Self {
        Self::with_root(HostFs::default())
    }

    pub fn with_root(hostfs: HostFs) -> Self {
        let page_size = sysconf(libc::_SC_PAGESIZE, DEFAULT_PAGE_SIZE);
        let clock_ticks = sysconf(libc::_SC_CLK_TCK, DEFAULT_CLOCK_TICKS);
        let boot_time = Self::get_boot_time(&hostfs);
        if boot_time.is_none() {
            debug!("no btime in {:?}, process start times unavailable", hostfs.join("proc/stat"));
        }
        Self {
            hostfs,
            page_size,
            clock_ticks,
            boot_time,
        }
    }

    pub fn hostfs(&self) -> &HostFs {
        &self.hostfs
    }

    fn get_boot_time(hostfs: &HostFs) -> Option<u64> {
        let stat = fs::read_to_string(hostfs.join("proc/stat")).ok()?;
        parse_boot_time(&stat)
    }

    fn ticks_to_ms(&self, ticks: u64) -> u64 {
        ticks.saturating_mul(1000) / self.clock_ticks
    }

    fn start_time_ms(&self, start_ticks: u64) -> Option<u64> {
        self.boot_time
            .map(|boot| boot.saturating_mul(1000).saturating_add(self.ticks_to_ms(start_ticks)))
    }

    fn read_stat(&self, handle: &ProcDir) -> Result<StatRecord, CollectError> {
        let data = handle.read("stat").map_err(|source| CollectError::HandleOpen {
            pid: handle.pid,
            source,
        })?;
        parse_stat(&data)
    }

    fn username(&self, handle: &ProcDir) -> Result<String, CollectError> {
        let status = handle
            .read_to_string("status")
            .map_err(|e| CollectError::field("username", e))?;
        let uid = parse_status_uid(&status).map_err(|e| CollectError::field("username", e))?;
        match User::from_uid(Uid::from_raw(uid)) {
            Ok(Some(user)) => Ok(user.name),
            Ok(None) => Err(CollectError::field("username", format!("no user with uid {}", uid))),
            Err(e) => Err(CollectError::field("username", e)),
        }
    }

    fn memory(&self, handle: &ProcDir) -> Result<(u64, u64), CollectError> {
        let statm = handle
            .read_to_string("statm")
            .map_err(|e| CollectError::field("memory", e))?;
        let (size, resident) = parse_statm(&statm).map_err(|e| CollectError::field("memory", e))?;
        Ok((
            size.saturating_mul(self.page_size),
            resident.saturating_mul(self.page_size),
        ))
    }

    fn cpu_ticks(&self, handle: &ProcDir) -> Result<(u64, u64), CollectError> {
        let data = handle.read("stat").map_err(|e| CollectError::field("cpu", e))?;
        let rec = parse_stat(&data).map_err(|e| CollectError::field("cpu", e))?;
        Ok((self.ticks_to_ms(rec.utime), self.ticks_to_ms(rec.stime)))
    }

    fn environ(
        &self,
        handle: &ProcDir,
        opts: &ExtendedOptions,
    ) -> Result<std::collections::BTreeMap<String, String>, CollectError> {
        let raw = handle
            .read("environ")
            .map_err(|e| CollectError::field("env", e))?;
        Ok(parse_environ(&raw, |key| opts.env_key_matches(key)))
    }
}

impl Default for LinuxProcessCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessCollector for LinuxProcessCollector {
    type Handle = ProcDir;
    type RawState = u8;

    fn enumerate(&self) -> Result<Vec<u32>, CollectError> {
        let entries = fs::read_dir(self.hostfs.join("proc")).map_err(CollectError::Enumeration)?;
        let pids = entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .collect();
        Ok(pids)
    }

    // Both tiers read the same directory; access checks happen per file.
    fn open(&self, pid: u32, _tier: Tier) -> Result<ProcDir, CollectError> {
        let path = self.hostfs.join(format!("proc/{}", pid));
        let fd = fcntl::open(
            &path,
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| CollectError::HandleOpen { pid, source: e.into() })?;
        // SAFETY: fd was just returned by open and has no other owner.
        let dir = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(ProcDir { pid, dir })
    }

    fn collect_basic(&self, handle: &ProcDir) -> Result<ProcState, CollectError> {
        let rec = self.read_stat(handle)?;
        let mut state = ProcState::new(handle.pid);
        state.name = rec.name;
        state.state = Self::map_state(rec.state);
        state.ppid = Some(rec.ppid);
        state.pgid = Some(rec.pgid);
        state.num_threads = Some(rec.num_threads);
        state.cpu.start_time = self.start_time_ms(rec.start_ticks);
        Ok(state)
    }

    fn collect_extended(
        &self,
        handle: &ProcDir,
        state: &mut ProcState,
        opts: &ExtendedOptions,
    ) -> PidErrors {
        let mut errs = PidErrors::new(handle.pid);

        state.username = errs.record("username", self.username(handle));

        if let Some((size, rss)) = errs.record("memory", self.memory(handle)) {
            state.memory.size = Some(size);
            state.memory.rss_bytes = Some(rss);
        }

        if opts.cpu_ticks {
            if let Some((user, system)) = errs.record("cpu", self.cpu_ticks(handle)) {
                state.cpu.set_ticks(user, system);
            }
        }

        if opts.wants_env() {
            state.env = errs.record("env", self.environ(handle, opts));
        }

        errs
    }

    fn fetch_args(&self, handle: &ProcDir) -> Result<Vec<String>, CollectError> {
        let raw = handle
            .read("cmdline")
            .map_err(|e| CollectError::field("args", e))?;
        Ok(split_nul(&raw))
    }

    fn map_state(raw: u8) -> PidState {
        PidState::from_stat_code(raw)
    }
}
