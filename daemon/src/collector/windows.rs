use super::{ExtendedOptions, ProcessCollector, Tier};
use crate::error::{CollectError, PidErrors};
use crate::state::{PidState, ProcState};
use std::ffi::c_void;
use std::io;
use std::mem::{size_of, zeroed};
use std::ptr::{null, null_mut};

use windows_sys::Wdk::System::Threading::{NtQueryInformationProcess, ProcessBasicInformation};
use windows_sys::Win32::Foundation::{CloseHandle, LocalFree, FILETIME, HANDLE, UNICODE_STRING};
use windows_sys::Win32::Security::{
    GetTokenInformation, LookupAccountSidW, TokenUser, SID_NAME_USE, TOKEN_QUERY, TOKEN_USER,
};
use windows_sys::Win32::System::Diagnostics::Debug::ReadProcessMemory;
use windows_sys::Win32::System::Diagnostics::ProcessSnapshotting::{
    PssCaptureSnapshot, PssFreeSnapshot, PssQuerySnapshot, HPSS, PSS_CAPTURE_THREADS,
    PSS_QUERY_THREAD_INFORMATION, PSS_THREAD_INFORMATION,
};
use windows_sys::Win32::System::ProcessStatus::{
    K32EnumProcesses, K32GetProcessImageFileNameW, K32GetProcessMemoryInfo, PROCESS_MEMORY_COUNTERS,
    PROCESS_MEMORY_COUNTERS_EX,
};
use windows_sys::Win32::System::Threading::{
    GetExitCodeProcess, GetProcessTimes, OpenProcess, OpenProcessToken, PEB, PROCESS_ACCESS_RIGHTS,
    PROCESS_BASIC_INFORMATION, PROCESS_QUERY_INFORMATION, PROCESS_QUERY_LIMITED_INFORMATION,
    PROCESS_VM_READ, RTL_USER_PROCESS_PARAMETERS,
};
use windows_sys::Win32::UI::Shell::CommandLineToArgvW;

/// 100ns intervals between 1601-01-01 and 1970-01-01.
const EPOCH_DIFFERENCE: u64 = 116_444_736_000_000_000;

/// An open process handle, closed on drop.
pub struct ProcessHandle {
    pid: u32,
    raw: HANDLE,
}

impl ProcessHandle {
    fn open(pid: u32, access: PROCESS_ACCESS_RIGHTS) -> io::Result<Self> {
        // SAFETY: OpenProcess has no pointer arguments.
        let raw = unsafe { OpenProcess(access, 0, pid) };
        if raw.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(ProcessHandle { pid, raw })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // SAFETY: raw came from a successful OpenProcess and is closed once.
        unsafe { CloseHandle(self.raw) };
    }
}

struct TokenHandle(HANDLE);

impl Drop for TokenHandle {
    fn drop(&mut self) {
        // SAFETY: the token came from a successful OpenProcessToken.
        unsafe { CloseHandle(self.0) };
    }
}

struct PssSnapshot<'a> {
    process: &'a ProcessHandle,
    raw: HPSS,
}

impl Drop for PssSnapshot<'_> {
    fn drop(&mut self) {
        // SAFETY: raw came from a successful PssCaptureSnapshot on process.
        unsafe { PssFreeSnapshot(self.process.raw, self.raw) };
    }
}

fn check(ok: i32) -> io::Result<()> {
    if ok == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn filetime_u64(ft: &FILETIME) -> u64 {
    ((ft.dwHighDateTime as u64) << 32) | ft.dwLowDateTime as u64
}

fn filetime_to_ms(ft: &FILETIME) -> u64 {
    filetime_u64(ft) / 10_000
}

fn filetime_to_unix_ms(ft: &FILETIME) -> Option<u64> {
    filetime_u64(ft).checked_sub(EPOCH_DIFFERENCE).map(|v| v / 10_000)
}

/// Last component of an NT device path such as `\Device\HarddiskVolume3\Windows\explorer.exe`.
fn base_name(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}

fn read_struct<T>(handle: &ProcessHandle, addr: *const c_void) -> io::Result<T> {
    // SAFETY: T is a plain-old-data Win32 struct; the buffer is sized for it
    // and only handed back if ReadProcessMemory filled it completely.
    unsafe {
        let mut value: T = zeroed();
        let mut read = 0usize;
        check(ReadProcessMemory(
            handle.raw,
            addr,
            &mut value as *mut T as *mut c_void,
            size_of::<T>(),
            &mut read,
        ))?;
        if read != size_of::<T>() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read of process memory"));
        }
        Ok(value)
    }
}

fn basic_information(handle: &ProcessHandle) -> io::Result<PROCESS_BASIC_INFORMATION> {
    // SAFETY: the output buffer is a PROCESS_BASIC_INFORMATION of the given length.
    unsafe {
        let mut info: PROCESS_BASIC_INFORMATION = zeroed();
        let mut len = 0u32;
        let status = NtQueryInformationProcess(
            handle.raw,
            ProcessBasicInformation,
            &mut info as *mut _ as *mut c_void,
            size_of::<PROCESS_BASIC_INFORMATION>() as u32,
            &mut len,
        );
        if status < 0 {
            return Err(io::Error::other(format!("NtQueryInformationProcess failed: 0x{:08x}", status)));
        }
        Ok(info)
    }
}

/// Split a command line the way the process itself would see it.
///
/// `CommandLineToArgvW` answers an empty string with the path of the calling
/// executable, so an empty command line is handled here.
fn split_command_line(cmdline: &[u16]) -> io::Result<Vec<String>> {
    if cmdline.is_empty() {
        return Ok(Vec::new());
    }
    let mut wide = cmdline.to_vec();
    wide.push(0);
    // SAFETY: wide is NUL-terminated; the returned block is freed with LocalFree.
    unsafe {
        let mut argc = 0i32;
        let argv = CommandLineToArgvW(wide.as_ptr(), &mut argc);
        if argv.is_null() {
            return Err(io::Error::last_os_error());
        }
        let mut args = Vec::with_capacity(argc.max(0) as usize);
        for i in 0..argc.max(0) as usize {
            let arg = *argv.add(i);
            let mut len = 0;
            while *arg.add(len) != 0 {
                len += 1;
            }
            args.push(String::from_utf16_lossy(std::slice::from_raw_parts(arg, len)));
        }
        LocalFree(argv as *mut c_void);
        Ok(args)
    }
}

#[derive(Default)]
pub struct WindowsProcessCollector;

impl WindowsProcessCollector {
    pub fn new() -> Self {
        WindowsProcessCollector
    }

    fn image_name(&self, handle: &ProcessHandle) -> io::Result<String> {
        let mut buf = vec![0u16; 1024];
        // SAFETY: buf is writable for buf.len() UTF-16 units.
        let len = unsafe { K32GetProcessImageFileNameW(handle.raw, buf.as_mut_ptr(), buf.len() as u32) };
        if len == 0 {
            return Err(io::Error::last_os_error());
        }
        let path = String::from_utf16_lossy(&buf[..len as usize]);
        Ok(base_name(&path).to_string())
    }

    fn exit_code(&self, handle: &ProcessHandle) -> io::Result<u32> {
        let mut code = 0u32;
        // SAFETY: code is a valid out pointer.
        check(unsafe { GetExitCodeProcess(handle.raw, &mut code) })?;
        Ok(code)
    }

    /// (creation, kernel, user) times.
    fn times(&self, handle: &ProcessHandle) -> io::Result<(FILETIME, FILETIME, FILETIME)> {
        // SAFETY: all four out pointers are valid FILETIMEs.
        unsafe {
            let mut creation: FILETIME = zeroed();
            let mut exit: FILETIME = zeroed();
            let mut kernel: FILETIME = zeroed();
            let mut user: FILETIME = zeroed();
            check(GetProcessTimes(handle.raw, &mut creation, &mut exit, &mut kernel, &mut user))?;
            Ok((creation, kernel, user))
        }
    }

    /// `DOMAIN\account` of the process token's user.
    fn username(&self, handle: &ProcessHandle) -> Result<String, CollectError> {
        let field = |e: io::Error| CollectError::field("username", e);
        // SAFETY: every buffer passed below is sized by the preceding call
        // and outlives the call using it.
        unsafe {
            let mut raw_token: HANDLE = zeroed();
            check(OpenProcessToken(handle.raw, TOKEN_QUERY, &mut raw_token)).map_err(field)?;
            let token = TokenHandle(raw_token);

            let mut needed = 0u32;
            GetTokenInformation(token.0, TokenUser, null_mut(), 0, &mut needed);
            if needed == 0 {
                return Err(field(io::Error::last_os_error()));
            }
            // u64 storage keeps the TOKEN_USER header aligned.
            let mut buf = vec![0u64; (needed as usize).div_ceil(8)];
            check(GetTokenInformation(
                token.0,
                TokenUser,
                buf.as_mut_ptr() as *mut c_void,
                needed,
                &mut needed,
            ))
            .map_err(field)?;
            let user = &*(buf.as_ptr() as *const TOKEN_USER);

            let mut name = vec![0u16; 256];
            let mut domain = vec![0u16; 256];
            let mut name_len = name.len() as u32;
            let mut domain_len = domain.len() as u32;
            let mut sid_use: SID_NAME_USE = zeroed();
            check(LookupAccountSidW(
                null(),
                user.User.Sid,
                name.as_mut_ptr(),
                &mut name_len,
                domain.as_mut_ptr(),
                &mut domain_len,
                &mut sid_use,
            ))
            .map_err(field)?;

            Ok(format!(
                "{}\\{}",
                String::from_utf16_lossy(&domain[..domain_len as usize]),
                String::from_utf16_lossy(&name[..name_len as usize])
            ))
        }
    }

    /// (working set, private bytes).
    fn memory(&self, handle: &ProcessHandle) -> Result<(u64, u64), CollectError> {
        // SAFETY: counters is sized by cb and written by the call.
        unsafe {
            let mut counters: PROCESS_MEMORY_COUNTERS_EX = zeroed();
            counters.cb = size_of::<PROCESS_MEMORY_COUNTERS_EX>() as u32;
            check(K32GetProcessMemoryInfo(
                handle.raw,
                &mut counters as *mut _ as *mut PROCESS_MEMORY_COUNTERS,
                counters.cb,
            ))
            .map_err(|e| CollectError::field("memory", e))?;
            Ok((counters.WorkingSetSize as u64, counters.PrivateUsage as u64))
        }
    }

    /// Thread count from a process snapshot. Needs PROCESS_QUERY_INFORMATION,
    /// which is why it is not part of the basic tier here.
    fn num_threads(&self, pid: u32) -> Result<u32, CollectError> {
        let field = |e: io::Error| CollectError::field("num_threads", e);
        let handle = ProcessHandle::open(pid, PROCESS_QUERY_INFORMATION).map_err(field)?;
        // SAFETY: the snapshot is freed by PssSnapshot's Drop; info is sized
        // by the length passed to PssQuerySnapshot.
        unsafe {
            let mut raw: HPSS = zeroed();
            let rc = PssCaptureSnapshot(handle.raw, PSS_CAPTURE_THREADS, 0, &mut raw);
            if rc != 0 {
                return Err(field(io::Error::from_raw_os_error(rc as i32)));
            }
            let snapshot = PssSnapshot {
                process: &handle,
                raw,
            };
            let mut info: PSS_THREAD_INFORMATION = zeroed();
            let rc = PssQuerySnapshot(
                snapshot.raw,
                PSS_QUERY_THREAD_INFORMATION,
                &mut info as *mut _ as *mut c_void,
                size_of::<PSS_THREAD_INFORMATION>() as u32,
            );
            if rc != 0 {
                return Err(field(io::Error::from_raw_os_error(rc as i32)));
            }
            Ok(info.ThreadsCaptured)
        }
    }

    /// Walk PEB -> RTL_USER_PROCESS_PARAMETERS -> CommandLine in the target's
    /// memory. Only same-bitness targets are supported.
    fn command_line(&self, pid: u32) -> io::Result<Vec<String>> {
        let handle = ProcessHandle::open(pid, PROCESS_QUERY_LIMITED_INFORMATION | PROCESS_VM_READ)?;
        let info = basic_information(&handle)?;
        if info.PebBaseAddress.is_null() {
            return Err(io::Error::other("process has no PEB"));
        }
        let peb: PEB = read_struct(&handle, info.PebBaseAddress as *const c_void)?;
        let params: RTL_USER_PROCESS_PARAMETERS =
            read_struct(&handle, peb.ProcessParameters as *const c_void)?;
        let cmdline: UNICODE_STRING = params.CommandLine;

        let units = cmdline.Length as usize / 2;
        if units == 0 || cmdline.Buffer.is_null() {
            return Ok(Vec::new());
        }
        let mut wide = vec![0u16; units];
        let mut read = 0usize;
        // SAFETY: wide is writable for Length bytes.
        check(unsafe {
            ReadProcessMemory(
                handle.raw,
                cmdline.Buffer as *const c_void,
                wide.as_mut_ptr() as *mut c_void,
                units * 2,
                &mut read,
            )
        })?;
        wide.truncate(read / 2);
        split_command_line(&wide)
    }
}

impl ProcessCollector for WindowsProcessCollector {
    type Handle = ProcessHandle;
    type RawState = u32;

    fn enumerate(&self) -> Result<Vec<u32>, CollectError> {
        let mut pids = vec![0u32; 1024];
        loop {
            let cb = (pids.len() * size_of::<u32>()) as u32;
            let mut needed = 0u32;
            // SAFETY: pids is writable for cb bytes.
            check(unsafe { K32EnumProcesses(pids.as_mut_ptr(), cb, &mut needed) })
                .map_err(CollectError::Enumeration)?;
            // A full buffer may mean the list was truncated.
            if needed < cb {
                pids.truncate(needed as usize / size_of::<u32>());
                return Ok(pids);
            }
            pids.resize(pids.len() * 2, 0);
        }
    }

    // Field-specific rights (VM_READ for arguments, QUERY_INFORMATION for the
    // thread snapshot) are requested by short-lived handles of their own, so
    // a denial there only costs that field.
    fn open(&self, pid: u32, _tier: Tier) -> Result<ProcessHandle, CollectError> {
        ProcessHandle::open(pid, PROCESS_QUERY_LIMITED_INFORMATION)
            .map_err(|source| CollectError::HandleOpen { pid, source })
    }

    fn collect_basic(&self, handle: &ProcessHandle) -> Result<ProcState, CollectError> {
        let opened = |source| CollectError::HandleOpen {
            pid: handle.pid,
            source,
        };
        let mut state = ProcState::new(handle.pid);
        state.name = self.image_name(handle).map_err(opened)?;
        state.state = Self::map_state(self.exit_code(handle).map_err(opened)?);
        state.ppid = basic_information(handle)
            .ok()
            .map(|info| info.InheritedFromUniqueProcessId as u32);
        state.cpu.start_time = self
            .times(handle)
            .ok()
            .and_then(|(creation, _, _)| filetime_to_unix_ms(&creation));
        Ok(state)
    }

    fn collect_extended(
        &self,
        handle: &ProcessHandle,
        state: &mut ProcState,
        opts: &ExtendedOptions,
    ) -> PidErrors {
        let mut errs = PidErrors::new(handle.pid);

        state.username = errs.record("username", self.username(handle));

        if let Some((rss, size)) = errs.record("memory", self.memory(handle)) {
            state.memory.rss_bytes = Some(rss);
            state.memory.size = Some(size);
        }

        if opts.cpu_ticks {
            let times = self.times(handle).map_err(|e| CollectError::field("cpu", e));
            if let Some((_, kernel, user)) = errs.record("cpu", times) {
                state.cpu.set_ticks(filetime_to_ms(&user), filetime_to_ms(&kernel));
            }
        }

        state.num_threads = errs.record("num_threads", self.num_threads(handle.pid));

        errs
    }

    fn fetch_args(&self, handle: &ProcessHandle) -> Result<Vec<String>, CollectError> {
        self.command_line(handle.pid)
            .map_err(|e| CollectError::field("args", e))
    }

    fn map_state(raw: u32) -> PidState {
        PidState::from_exit_code(raw)
    }
}
