//! Linux readers backed by procfs.
//!
//! CPU counters come from `/proc/self/stat` (utime + stime) and the
//! aggregate `cpu` line of `/proc/stat`. Committed memory comes from the
//! `VmRSS` line of `/proc/self/status`, reported in kB.

use crate::cpu::{CpuSample, CpuSampler};
use crate::memory::MemoryReader;
use std::fs;
use tracing::debug;

const PROC_SELF_STAT: &str = "/proc/self/stat";
const PROC_STAT: &str = "/proc/stat";
const PROC_SELF_STATUS: &str = "/proc/self/status";

pub(crate) struct LinuxCpuSampler;

impl CpuSampler for LinuxCpuSampler {
    fn sample(&self) -> Option<CpuSample> {
        let process_ticks = read_process_ticks();
        if process_ticks.is_none() {
            debug!("could not read process ticks from {PROC_SELF_STAT}");
        }
        let total_ticks = read_total_ticks();
        if total_ticks.is_none() {
            debug!("could not read machine ticks from {PROC_STAT}");
        }
        Some(CpuSample {
            process_ticks: process_ticks?,
            total_ticks: total_ticks?,
        })
    }
}

/// Sums utime and stime from `/proc/self/stat`.
///
/// The comm field (field 2) may itself contain spaces and parentheses, so
/// fields are counted from the last `)` in the line: utime and stime are the
/// 12th and 13th space-separated tokens after it.
fn read_process_ticks() -> Option<u64> {
    let contents = fs::read_to_string(PROC_SELF_STAT).ok()?;
    let rest = &contents[contents.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

/// Sums every column of the aggregate `cpu` line of `/proc/stat`.
fn read_total_ticks() -> Option<u64> {
    let contents = fs::read_to_string(PROC_STAT).ok()?;
    parse_total_ticks(&contents)
}

fn parse_total_ticks(contents: &str) -> Option<u64> {
    let line = contents
        .lines()
        .find(|line| line.starts_with("cpu ") || line.starts_with("cpu\t"))?;
    let mut total: u64 = 0;
    for field in line.split_whitespace().skip(1) {
        total = total.checked_add(field.parse().ok()?)?;
    }
    Some(total)
}

pub(crate) struct LinuxMemoryReader;

impl MemoryReader for LinuxMemoryReader {
    fn committed_bytes(&self) -> Option<u64> {
        let contents = fs::read_to_string(PROC_SELF_STATUS).ok()?;
        let bytes = parse_vm_rss_bytes(&contents);
        if bytes.is_none() {
            debug!("could not read VmRSS from {PROC_SELF_STATUS}");
        }
        bytes
    }
}

fn parse_vm_rss_bytes(contents: &str) -> Option<u64> {
    let line = contents.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    kb.checked_mul(1024)
}
