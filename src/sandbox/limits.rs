//! Hard-limit enforcement shared by both strategies.

use serde::{Deserialize, Serialize};

use crate::config::StrategyConfig;

/// Which limit a run breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitKind {
    Cpu,
    Memory,
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

/// A breach that terminated a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub limit: LimitKind,
    pub observed: f64,
    pub threshold: f64,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.limit {
            LimitKind::Cpu => write!(
                f,
                "cpu {:.1}% exceeded hard limit {:.1}%",
                self.observed, self.threshold
            ),
            LimitKind::Memory => write!(
                f,
                "memory {:.1} MB exceeded limit {:.1} MB",
                self.observed, self.threshold
            ),
        }
    }
}

/// Tracks peaks and decides when a run must be killed.
///
/// Memory over the limit is a breach on the first sample. CPU must stay
/// over the limit for two consecutive samples, i.e. for at least one
/// sampling interval. CPU is normalized to the host's core count.
#[derive(Debug)]
pub(crate) struct LimitMonitor {
    cpu_limit_pct: f64,
    memory_limit_mb: Option<f64>,
    cores: f64,
    cpu_over: u32,
    peak_cpu_pct: f64,
    peak_memory_mb: f64,
}

impl LimitMonitor {
    pub fn new(config: &StrategyConfig) -> Self {
        let cores = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self::with_cores(config, cores)
    }

    fn with_cores(config: &StrategyConfig, cores: usize) -> Self {
        Self {
            cpu_limit_pct: config.hard_cpu_limit_pct,
            memory_limit_mb: config.memory_limit_mb.map(|mb| mb as f64),
            cores: cores.max(1) as f64,
            cpu_over: 0,
            peak_cpu_pct: 0.0,
            peak_memory_mb: 0.0,
        }
    }

    /// Records a sample. `core_pct` is percent of a single core.
    pub fn observe(&mut self, core_pct: f64, memory_mb: f64) -> Option<Violation> {
        let cpu_pct = core_pct / self.cores;
        self.peak_cpu_pct = self.peak_cpu_pct.max(cpu_pct);
        self.peak_memory_mb = self.peak_memory_mb.max(memory_mb);

        if let Some(limit) = self.memory_limit_mb {
            if memory_mb > limit {
                return Some(Violation {
                    limit: LimitKind::Memory,
                    observed: memory_mb,
                    threshold: limit,
                });
            }
        }

        if cpu_pct > self.cpu_limit_pct {
            self.cpu_over += 1;
            if self.cpu_over >= 2 {
                return Some(Violation {
                    limit: LimitKind::Cpu,
                    observed: cpu_pct,
                    threshold: self.cpu_limit_pct,
                });
            }
        } else {
            self.cpu_over = 0;
        }
        None
    }

    pub fn peak_cpu_pct(&self) -> f64 {
        self.peak_cpu_pct
    }

    pub fn peak_memory_mb(&self) -> f64 {
        self.peak_memory_mb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(cpu: f64, memory: Option<u64>) -> StrategyConfig {
        StrategyConfig {
            hard_cpu_limit_pct: cpu,
            memory_limit_mb: memory,
            ..StrategyConfig::default()
        }
    }

    #[test]
    fn test_memory_breach_is_immediate() {
        let mut monitor = LimitMonitor::with_cores(&config(90.0, Some(64)), 1);
        assert!(monitor.observe(0.0, 10.0).is_none());
        let violation = monitor.observe(0.0, 80.0).unwrap();
        assert_eq!(violation.limit, LimitKind::Memory);
        assert_eq!(violation.threshold, 64.0);
        assert_eq!(monitor.peak_memory_mb(), 80.0);
    }

    #[test]
    fn test_cpu_breach_must_be_sustained() {
        let mut monitor = LimitMonitor::with_cores(&config(50.0, None), 1);
        assert!(monitor.observe(95.0, 1.0).is_none());
        assert!(monitor.observe(10.0, 1.0).is_none());
        assert!(monitor.observe(95.0, 1.0).is_none());
        let violation = monitor.observe(99.0, 1.0).unwrap();
        assert_eq!(violation.limit, LimitKind::Cpu);
        assert_eq!(monitor.peak_cpu_pct(), 99.0);
    }

    #[test]
    fn test_cpu_is_normalized_by_cores() {
        let mut monitor = LimitMonitor::with_cores(&config(50.0, None), 4);
        assert!(monitor.observe(180.0, 1.0).is_none());
        assert!(monitor.observe(180.0, 1.0).is_none());
        assert_eq!(monitor.peak_cpu_pct(), 45.0);
    }

    #[test]
    fn test_violation_display() {
        let v = Violation {
            limit: LimitKind::Memory,
            observed: 100.0,
            threshold: 64.0,
        };
        assert_eq!(v.to_string(), "memory 100.0 MB exceeded limit 64.0 MB");
    }
}
