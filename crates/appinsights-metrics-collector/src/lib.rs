//! Process-level CPU and memory gauges for the live metrics stream.
//!
//! The live metrics post body carries two machine gauges next to the request
//! and dependency counters: process CPU usage (percent of total machine
//! capacity) and committed memory. This crate reads both from the operating
//! system behind small reader traits so the collector can run on platforms
//! where the sources are unavailable, in which case gauges report `None` and
//! the caller substitutes the `-1` sentinel on the wire.
//!
//! Linux readers are backed by procfs; every other platform gets the
//! fallback readers, which always return `None`.

pub mod cpu;
pub mod memory;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(not(target_os = "linux"))]
mod fallback;

use cpu::CpuUsageTracker;
use memory::MemoryReader;

/// Returns the CPU usage tracker appropriate for the current platform.
#[must_use]
pub fn default_cpu_tracker() -> CpuUsageTracker {
    #[cfg(target_os = "linux")]
    {
        CpuUsageTracker::new(Box::new(linux::LinuxCpuSampler))
    }
    #[cfg(not(target_os = "linux"))]
    {
        CpuUsageTracker::new(Box::new(fallback::NullCpuSampler))
    }
}

/// Returns the committed-memory reader appropriate for the current platform.
#[must_use]
pub fn default_memory_reader() -> Box<dyn MemoryReader + Send + Sync> {
    #[cfg(target_os = "linux")]
    {
        Box::new(linux::LinuxMemoryReader)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(fallback::NullMemoryReader)
    }
}
