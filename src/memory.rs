//! Resident-set sampling and memory limit detection.
//!
//! The monitor reads current RSS from `/proc/self/statm` (falling back to
//! `getrusage` where procfs is unavailable), tracks the peak, and grades each
//! sample against two limits:
//!
//! - the **soft limit** from configuration, which drives back-pressure
//!   (ratios in [`MemorySample`] are relative to it), and
//! - the **hard limit**, taken from the cgroup memory cap when one is set
//!   (the usual case under Kubernetes), which trips the circuit breaker at
//!   `hard_ratio` of the cap.
//!
//! A soft limit of zero disables the monitor entirely.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// cgroup v2 limits beyond this are treated as "no limit configured"
const CGROUP_NO_LIMIT_SENTINEL: u64 = u64::MAX / 2;

type Sampler = Box<dyn Fn() -> u64 + Send + Sync>;

/// One graded memory observation
#[derive(Debug, Clone, Copy)]
pub struct MemorySample {
    /// Resident set size in bytes
    pub rss: u64,
    /// `rss / soft_limit`; 0.0 when no soft limit is set
    pub ratio: f64,
    /// Sample exceeds the soft limit
    pub over_soft: bool,
    /// Sample is at or past `hard_ratio` of the hard limit; the current
    /// phase must abort
    pub critical: bool,
}

/// Samples RSS and grades it against the configured limits.
pub struct MemoryMonitor {
    soft_limit: Option<u64>,
    hard_limit: Option<u64>,
    hard_ratio: f64,
    peak: AtomicU64,
    sampler: Sampler,
}

impl MemoryMonitor {
    /// Build a monitor with the platform sampler and auto-detected hard limit.
    pub fn new(soft_limit_mb: u64, hard_ratio: f64) -> Self {
        Self::with_sampler(
            soft_limit_mb,
            detect_hard_limit(),
            hard_ratio,
            Box::new(rss_bytes),
        )
    }

    /// Build a monitor with an explicit hard limit and usage source.
    /// Tests use this to drive back-pressure and circuit-break paths.
    pub fn with_sampler(
        soft_limit_mb: u64,
        hard_limit: Option<u64>,
        hard_ratio: f64,
        sampler: Sampler,
    ) -> Self {
        let soft_limit = (soft_limit_mb > 0).then_some(soft_limit_mb * 1024 * 1024);
        Self {
            soft_limit,
            hard_limit,
            hard_ratio,
            peak: AtomicU64::new(0),
            sampler,
        }
    }

    /// Whether any memory logic is active at all.
    pub fn enabled(&self) -> bool {
        self.soft_limit.is_some()
    }

    /// Take one sample, updating the peak.
    pub fn sample(&self) -> MemorySample {
        let rss = (self.sampler)();
        self.peak.fetch_max(rss, Ordering::Relaxed);

        let ratio = match self.soft_limit {
            Some(limit) => rss as f64 / limit as f64,
            None => 0.0,
        };
        let over_soft = self.soft_limit.is_some_and(|limit| rss > limit);
        let critical = self.enabled()
            && self
                .hard_limit
                .is_some_and(|hard| rss as f64 >= hard as f64 * self.hard_ratio);

        MemorySample { rss, ratio, over_soft, critical }
    }

    /// Highest RSS observed so far, in bytes. Monotonically non-decreasing.
    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }
}

/// Current resident set size in bytes.
fn rss_bytes() -> u64 {
    if let Some(rss) = statm_rss() {
        return rss;
    }
    rusage_maxrss()
}

/// RSS from `/proc/self/statm` (second field, in pages).
fn statm_rss() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some(pages * page_size as u64)
}

/// Peak RSS from getrusage; coarser than statm but available everywhere.
/// ru_maxrss is reported in kilobytes on Linux.
fn rusage_maxrss() -> u64 {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return 0;
    }
    (usage.ru_maxrss as u64) * 1024
}

/// Detect the container memory cap from the cgroup filesystem.
fn detect_hard_limit() -> Option<u64> {
    // cgroup v2
    if let Some(limit) = read_limit_file(Path::new("/sys/fs/cgroup/memory.max")) {
        return Some(limit);
    }
    // cgroup v1
    read_limit_file(Path::new("/sys/fs/cgroup/memory/memory.limit_in_bytes"))
}

fn read_limit_file(path: &Path) -> Option<u64> {
    let raw = std::fs::read_to_string(path).ok()?;
    let raw = raw.trim();
    if raw == "max" {
        return None;
    }
    let limit: u64 = raw.parse().ok()?;
    (limit < CGROUP_NO_LIMIT_SENTINEL).then_some(limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fixed(rss: u64) -> Sampler {
        Box::new(move || rss)
    }

    #[test]
    fn test_disabled_when_soft_limit_zero() {
        let monitor = MemoryMonitor::with_sampler(0, Some(1000), 0.95, fixed(999_999));
        assert!(!monitor.enabled());
        let s = monitor.sample();
        assert!(!s.over_soft);
        assert!(!s.critical);
        assert_eq!(s.ratio, 0.0);
    }

    #[test]
    fn test_ratio_against_soft_limit() {
        let monitor = MemoryMonitor::with_sampler(100, None, 0.95, fixed(90 * 1024 * 1024));
        let s = monitor.sample();
        assert!((s.ratio - 0.9).abs() < 1e-9);
        assert!(!s.over_soft);

        let monitor = MemoryMonitor::with_sampler(100, None, 0.95, fixed(150 * 1024 * 1024));
        assert!(monitor.sample().over_soft);
    }

    #[test]
    fn test_critical_at_hard_ratio() {
        let hard = 1000 * 1024 * 1024;
        let monitor = MemoryMonitor::with_sampler(100, Some(hard), 0.95, fixed(hard * 95 / 100));
        assert!(monitor.sample().critical);

        let monitor = MemoryMonitor::with_sampler(100, Some(hard), 0.95, fixed(hard / 2));
        assert!(!monitor.sample().critical);
    }

    #[test]
    fn test_peak_is_monotonic() {
        let level = Arc::new(AtomicU64::new(500));
        let source = Arc::clone(&level);
        let monitor = MemoryMonitor::with_sampler(
            100,
            None,
            0.95,
            Box::new(move || source.load(Ordering::Relaxed)),
        );

        monitor.sample();
        assert_eq!(monitor.peak(), 500);
        level.store(900, Ordering::Relaxed);
        monitor.sample();
        assert_eq!(monitor.peak(), 900);
        level.store(100, Ordering::Relaxed);
        monitor.sample();
        assert_eq!(monitor.peak(), 900);
    }

    #[test]
    fn test_platform_sampler_reports_something() {
        let monitor = MemoryMonitor::new(100, 0.95);
        assert!(monitor.sample().rss > 0);
    }
}
