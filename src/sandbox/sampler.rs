//! Resource sampling for subprocess sessions from `/proc`.
//!
//! Every process whose process group matches the session's group is
//! summed: CPU from `utime + stime` deltas between samples, memory from RSS.

use std::collections::HashMap;
use std::fs;
use std::time::Instant;

use nix::unistd::{sysconf, Pid, SysconfVar};

/// One point-in-time reading for a process group.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct UsageSample {
    /// Percent of one core since the previous sample.
    pub cpu_pct: f64,
    pub memory_mb: f64,
    pub processes: usize,
}

/// Fields of `/proc/<pid>/stat` the sampler needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StatFields {
    pgrp: i32,
    cpu_ticks: u64,
    rss_pages: u64,
}

pub(crate) struct GroupSampler {
    pgid: Pid,
    ticks_per_sec: f64,
    page_size: u64,
    last_ticks: HashMap<i32, u64>,
    last_at: Option<Instant>,
}

impl GroupSampler {
    pub fn new(pgid: Pid) -> Self {
        let ticks_per_sec = sysconf(SysconfVar::CLK_TCK)
            .ok()
            .flatten()
            .filter(|v| *v > 0)
            .map_or(100.0, |v| v as f64);
        let page_size = sysconf(SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(4096);
        Self {
            pgid,
            ticks_per_sec,
            page_size,
            last_ticks: HashMap::new(),
            last_at: None,
        }
    }

    /// Reads the group's current usage. The first call reports zero CPU.
    pub fn sample(&mut self) -> UsageSample {
        let now = Instant::now();
        let mut ticks = HashMap::new();
        let mut rss_pages = 0u64;

        if let Ok(entries) = fs::read_dir("/proc") {
            for entry in entries.flatten() {
                let Some(pid) = entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.parse::<i32>().ok())
                else {
                    continue;
                };
                let Ok(content) = fs::read_to_string(entry.path().join("stat")) else {
                    continue;
                };
                if let Some(fields) = parse_stat(&content) {
                    if fields.pgrp == self.pgid.as_raw() {
                        ticks.insert(pid, fields.cpu_ticks);
                        rss_pages += fields.rss_pages;
                    }
                }
            }
        }

        let cpu_pct = match self.last_at {
            Some(previous) => {
                let elapsed = now.duration_since(previous).as_secs_f64();
                let delta: u64 = ticks
                    .iter()
                    .map(|(pid, t)| t.saturating_sub(self.last_ticks.get(pid).copied().unwrap_or(0)))
                    .sum();
                if elapsed > 0.0 {
                    delta as f64 / self.ticks_per_sec / elapsed * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };

        let sample = UsageSample {
            cpu_pct,
            memory_mb: (rss_pages * self.page_size) as f64 / (1024.0 * 1024.0),
            processes: ticks.len(),
        };
        self.last_ticks = ticks;
        self.last_at = Some(now);
        sample
    }
}

/// Parses `/proc/<pid>/stat`. The command name may contain spaces and
/// parentheses, so fields are counted from the last `)`.
fn parse_stat(content: &str) -> Option<StatFields> {
    let rest = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is field 3 (state) of proc(5)
    let pgrp = fields.get(2)?.parse().ok()?;
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let rss: i64 = fields.get(21)?.parse().ok()?;
    Some(StatFields {
        pgrp,
        cpu_ticks: utime + stime,
        rss_pages: u64::try_from(rss).unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "4242 (sh (evil) x) S 1 4242 4242 0 -1 4194560 120 0 0 0 \
                        7 3 0 0 20 0 1 0 123456 2314240 250 18446744073709551615 0 0";

    #[test]
    fn test_parse_stat_handles_parens_in_comm() {
        let fields = parse_stat(STAT).unwrap();
        assert_eq!(fields.pgrp, 4242);
        assert_eq!(fields.cpu_ticks, 10);
        assert_eq!(fields.rss_pages, 250);
    }

    #[test]
    fn test_parse_stat_rejects_truncated() {
        assert!(parse_stat("12 (x) S 1 12").is_none());
        assert!(parse_stat("garbage").is_none());
    }

    #[test]
    fn test_sampler_sees_own_process_group() {
        let pgid = nix::unistd::getpgrp();
        let mut sampler = GroupSampler::new(pgid);
        let first = sampler.sample();
        assert_eq!(first.cpu_pct, 0.0);
        assert!(first.processes >= 1);
        assert!(first.memory_mb > 0.0);
    }

    #[test]
    fn test_sampler_unknown_group_is_empty() {
        let mut sampler = GroupSampler::new(Pid::from_raw(i32::MAX));
        let sample = sampler.sample();
        assert_eq!(sample.processes, 0);
        assert_eq!(sample.memory_mb, 0.0);
    }
}
