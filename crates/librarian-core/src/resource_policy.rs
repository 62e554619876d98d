/**
 * Resource Policy - Worker Budgets Under Memory/CPU Pressure
 *
 * DESIGN DECISION: Sample-then-clamp worker budgeting; request-path reads are never throttled
 * WHY: Background index rebuilds are the only elastic load in the store;
 *      they must yield to the host process long before the OOM killer does
 *
 * REASONING CHAIN:
 * 1. A sample captures CPU cores, memory, and 1-minute load average
 *    (/proc on Linux, conservative defaults elsewhere)
 * 2. Pressure bands: nominal, elevated, critical, oom_imminent, derived from
 *    the available-memory ratio with a load-average override
 * 3. Worker budget = target utilization x cores, then the pressure map:
 *    nominal keeps the full budget, elevated halves it, critical and
 *    oom_imminent drop to one worker
 * 4. Modes shift the utilization target: conservative 0.5, auto 0.75,
 *    aggressive 0.9
 */

use serde::Deserialize;

/// Utilization targets per mode.
const UTILIZATION_CONSERVATIVE: f64 = 0.5;
const UTILIZATION_AUTO: f64 = 0.75;
const UTILIZATION_AGGRESSIVE: f64 = 0.9;

/// Available-memory ratio thresholds for the pressure bands.
const OOM_IMMINENT_RATIO: f64 = 0.03;
const CRITICAL_RATIO: f64 = 0.10;
const ELEVATED_RATIO: f64 = 0.25;

/// Scheduling aggressiveness for background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceMode {
    Auto,
    Conservative,
    Aggressive,
}

/// Derived memory/CPU pressure band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    Nominal,
    Elevated,
    Critical,
    OomImminent,
}

/// One point-in-time resource reading.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSample {
    pub cpu_cores: usize,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    pub load_average_1m: f64,
}

impl ResourceSample {
    /// Pressure from the available-memory ratio; a load average far above the
    /// core count escalates one band.
    pub fn pressure(&self) -> MemoryPressure {
        let ratio = if self.total_memory_bytes == 0 {
            1.0
        } else {
            self.available_memory_bytes as f64 / self.total_memory_bytes as f64
        };

        let base = if ratio < OOM_IMMINENT_RATIO {
            MemoryPressure::OomImminent
        } else if ratio < CRITICAL_RATIO {
            MemoryPressure::Critical
        } else if ratio < ELEVATED_RATIO {
            MemoryPressure::Elevated
        } else {
            MemoryPressure::Nominal
        };

        let overloaded = self.load_average_1m > (self.cpu_cores.max(1) as f64) * 2.0;
        match (base, overloaded) {
            (MemoryPressure::Nominal, true) => MemoryPressure::Elevated,
            (MemoryPressure::Elevated, true) => MemoryPressure::Critical,
            (band, _) => band,
        }
    }
}

/// Samples host resources. Linux reads /proc; other platforms report
/// conservative defaults that land in the nominal band.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceMonitor;

impl ResourceMonitor {
    pub fn new() -> Self {
        Self
    }

    pub fn sample(&self) -> ResourceSample {
        let cpu_cores = num_cpus::get();
        let (total, available) = read_meminfo().unwrap_or((0, 0));
        let load = read_loadavg().unwrap_or(0.0);
        ResourceSample {
            cpu_cores,
            total_memory_bytes: total,
            available_memory_bytes: if total == 0 { 0 } else { available },
            load_average_1m: load,
        }
    }
}

/// Worker count for background index rebuilds.
pub fn worker_budget(sample: &ResourceSample, mode: ResourceMode) -> usize {
    let target = match mode {
        ResourceMode::Conservative => UTILIZATION_CONSERVATIVE,
        ResourceMode::Auto => UTILIZATION_AUTO,
        ResourceMode::Aggressive => UTILIZATION_AGGRESSIVE,
    };
    let cores = sample.cpu_cores.max(1);
    let full = ((cores as f64) * target).floor().max(1.0) as usize;

    let budget = match sample.pressure() {
        MemoryPressure::Nominal => full,
        MemoryPressure::Elevated => (full / 2).max(1),
        MemoryPressure::Critical | MemoryPressure::OomImminent => 1,
    };
    budget.clamp(1, cores)
}

fn read_meminfo() -> Option<(u64, u64)> {
    let body = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total = None;
    let mut available = None;
    for line in body.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MemTotal:") => total = parts.next().and_then(|v| v.parse::<u64>().ok()),
            Some("MemAvailable:") => available = parts.next().and_then(|v| v.parse::<u64>().ok()),
            _ => {}
        }
        if total.is_some() && available.is_some() {
            break;
        }
    }
    // /proc/meminfo reports kibibytes.
    Some((total? * 1024, available? * 1024))
}

fn read_loadavg() -> Option<f64> {
    let body = std::fs::read_to_string("/proc/loadavg").ok()?;
    body.split_whitespace().next()?.parse().ok()
}
