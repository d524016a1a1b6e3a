//! No-op readers for platforms without a procfs-style source.

use crate::cpu::{CpuSample, CpuSampler};
use crate::memory::MemoryReader;

pub(crate) struct NullCpuSampler;

impl CpuSampler for NullCpuSampler {
    fn sample(&self) -> Option<CpuSample> {
        None
    }
}

pub(crate) struct NullMemoryReader;

impl MemoryReader for NullMemoryReader {
    fn committed_bytes(&self) -> Option<u64> {
        None
    }
}
