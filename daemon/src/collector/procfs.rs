//! Decoders for /proc text records

use std::collections::BTreeMap;

use crate::error::CollectError;

/// Fields required after the closing parenthesis, up to and including starttime.
const MIN_STAT_FIELDS: usize = 20;

/// The subset of `/proc/[pid]/stat` this crate uses. Tick counts are in
/// clock ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatRecord {
    pub name: String,
    pub state: u8,
    pub ppid: u32,
    pub pgid: u32,
    pub utime: u64,
    pub stime: u64,
    pub num_threads: u32,
    pub start_ticks: u64,
}

fn field<T: std::str::FromStr>(fields: &[&str], idx: usize, what: &str) -> Result<T, CollectError>
where
    T::Err: std::fmt::Display,
{
    fields[idx]
        .parse::<T>()
        .map_err(|e| CollectError::parse("stat", format!("invalid {} '{}': {}", what, fields[idx], e)))
}

/// Parse `/proc/[pid]/stat`.
///
/// The comm field is wrapped in parentheses but may itself contain
/// parentheses, whitespace and bytes that are not UTF-8, e.g. `(a) b)`. It
/// ends at the last `)` in the record and is decoded lossily; everything
/// after that is ASCII read by fixed position.
pub fn parse_stat(data: &[u8]) -> Result<StatRecord, CollectError> {
    let open = data
        .iter()
        .position(|&b| b == b'(')
        .ok_or_else(|| CollectError::parse("stat", "missing '('"))?;
    let close = data
        .iter()
        .rposition(|&b| b == b')')
        .filter(|&close| close > open)
        .ok_or_else(|| CollectError::parse("stat", "missing ')' after name"))?;

    std::str::from_utf8(&data[..open])
        .ok()
        .and_then(|pid| pid.trim().parse::<u32>().ok())
        .ok_or_else(|| CollectError::parse("stat", "invalid pid"))?;
    let name = String::from_utf8_lossy(&data[open + 1..close]).into_owned();

    let rest = std::str::from_utf8(&data[close + 1..])
        .map_err(|e| CollectError::parse("stat", format!("fields after name: {}", e)))?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() < MIN_STAT_FIELDS {
        return Err(CollectError::parse(
            "stat",
            format!("expected at least {} fields after name, got {}", MIN_STAT_FIELDS, fields.len()),
        ));
    }

    let state = match fields[0].as_bytes() {
        [code] => *code,
        _ => return Err(CollectError::parse("stat", format!("invalid state '{}'", fields[0]))),
    };

    Ok(StatRecord {
        name,
        state,
        ppid: field(&fields, 1, "ppid")?,
        pgid: field(&fields, 2, "pgrp")?,
        utime: field(&fields, 11, "utime")?,
        stime: field(&fields, 12, "stime")?,
        num_threads: field(&fields, 17, "num_threads")?,
        start_ticks: field(&fields, 19, "starttime")?,
    })
}

/// Parse `/proc/[pid]/statm` into (size, resident), both in pages.
pub fn parse_statm(data: &str) -> Result<(u64, u64), CollectError> {
    let mut it = data.split_whitespace().map(|s| s.parse::<u64>());
    match (it.next(), it.next()) {
        (Some(Ok(size)), Some(Ok(resident))) => Ok((size, resident)),
        _ => Err(CollectError::parse("statm", format!("unexpected content '{}'", data.trim()))),
    }
}

/// Real uid from the `Uid:` line of `/proc/[pid]/status`.
pub fn parse_status_uid(status: &str) -> Result<u32, CollectError> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().next())
        .ok_or_else(|| CollectError::parse("status", "missing Uid"))?
        .parse::<u32>()
        .map_err(|e| CollectError::parse("status", format!("invalid Uid: {}", e)))
}

/// Boot time in seconds since the epoch, from the `btime` line of `/proc/stat`.
pub fn parse_boot_time(stat: &str) -> Option<u64> {
    stat.lines()
        .find_map(|line| line.strip_prefix("btime "))
        .and_then(|v| v.trim().parse().ok())
}

/// Split a NUL-separated record such as `cmdline`. A trailing empty entry
/// left by the final NUL is dropped.
pub fn split_nul(bytes: &[u8]) -> Vec<String> {
    let bytes = bytes.strip_suffix(b"\0").unwrap_or(bytes);
    if bytes.is_empty() {
        return Vec::new();
    }
    bytes
        .split(|&b| b == 0)
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect()
}

/// Parse `/proc/[pid]/environ`, keeping variables whose key satisfies `keep`.
///
/// Some processes overwrite their environment block, so entries without a
/// `KEY=` prefix are skipped rather than treated as errors.
pub fn parse_environ(bytes: &[u8], keep: impl Fn(&str) -> bool) -> BTreeMap<String, String> {
    split_nul(bytes)
        .into_iter()
        .filter_map(|entry| {
            let (key, value) = entry.split_once('=')?;
            if key.is_empty() || !keep(key) {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}
