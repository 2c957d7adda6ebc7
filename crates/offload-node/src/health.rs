use std::sync::Mutex;

use sysinfo::System;

/// Per-core CPU utilization sampler.
///
/// The baseline refresh happens at construction (process start), and each
/// `sample()` reports utilization relative to the previous call, so a
/// node's first health reading covers its whole lifetime so far.
pub struct CpuSampler {
    system: Mutex<System>,
}

impl CpuSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
        }
    }

    /// Current per-core utilization, one value in `[0, 1]` per core.
    pub fn sample(&self) -> Vec<f32> {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_cpu_usage();
        system
            .cpus()
            .iter()
            .map(|cpu| (cpu.cpu_usage() / 100.0).clamp(0.0, 1.0))
            .collect()
    }
}

impl Default for CpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_reports_one_bounded_value_per_core() {
        let sampler = CpuSampler::new();
        let sample = sampler.sample();
        assert!(!sample.is_empty());
        assert!(sample.iter().all(|value| (0.0..=1.0).contains(value)));
    }
}
