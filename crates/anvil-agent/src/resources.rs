use std::{
    sync::OnceLock,
    time::{SystemTime, UNIX_EPOCH},
};

use anvil_process::ResourceSample;

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(target_os = "linux")]
fn ticks_per_sec() -> u64 {
    static TICKS: OnceLock<u64> = OnceLock::new();
    *TICKS.get_or_init(|| {
        let v = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if v <= 0 { 100 } else { v as u64 }
    })
}

#[cfg(not(target_os = "linux"))]
fn ticks_per_sec() -> u64 {
    100
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| {
        let v = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if v <= 0 { 4096 } else { v as u64 }
    })
}

#[cfg(target_os = "linux")]
pub async fn read_proc_cpu_ticks(pid: u32) -> Option<u64> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/stat"))
        .await
        .ok()?;
    parse_stat_ticks(&s)
}

#[cfg(not(target_os = "linux"))]
pub async fn read_proc_cpu_ticks(_pid: u32) -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
pub async fn read_proc_rss_bytes(pid: u32) -> Option<u64> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/statm"))
        .await
        .ok()?;
    let mut it = s.split_whitespace();
    let _size_pages = it.next()?;
    let resident_pages: u64 = it.next()?.parse().ok()?;
    Some(resident_pages.saturating_mul(page_size()))
}

#[cfg(not(target_os = "linux"))]
pub async fn read_proc_rss_bytes(_pid: u32) -> Option<u64> {
    None
}

/// utime + stime from a `/proc/<pid>/stat` line. The comm field may contain spaces.
fn parse_stat_ticks(s: &str) -> Option<u64> {
    let end = s.rfind(')')?;
    let rest = s.get((end + 2)..)?;
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = parts.get(11)?.parse().ok()?;
    let stime: u64 = parts.get(12)?.parse().ok()?;
    Some(utime.saturating_add(stime))
}

fn cpu_percent(
    prev_ticks: u64,
    prev_at: tokio::time::Instant,
    ticks: u64,
    now: tokio::time::Instant,
) -> f64 {
    let dt = now.duration_since(prev_at).as_secs_f64();
    if dt <= 0.0 {
        return 0.0;
    }
    let delta_ticks = ticks.saturating_sub(prev_ticks) as f64;
    let cpu = (delta_ticks / ticks_per_sec() as f64) / dt * 100.0;
    if cpu.is_finite() {
        // Two decimals are plenty for a dashboard.
        (cpu.max(0.0) * 100.0).round() / 100.0
    } else {
        0.0
    }
}

/// Stateful CPU/RSS sampler for one pid.
#[derive(Debug)]
pub struct Sampler {
    pid: u32,
    last: Option<(u64, tokio::time::Instant)>,
}

impl Sampler {
    pub fn new(pid: u32) -> Self {
        Self { pid, last: None }
    }

    /// `None` once the process is gone (or on platforms without procfs).
    pub async fn sample(&mut self) -> Option<ResourceSample> {
        let now = tokio::time::Instant::now();
        let ticks = read_proc_cpu_ticks(self.pid).await?;
        let memory_bytes = read_proc_rss_bytes(self.pid).await.unwrap_or(0);

        let cpu = self
            .last
            .map(|(prev_ticks, prev_at)| cpu_percent(prev_ticks, prev_at, ticks, now))
            .unwrap_or(0.0);
        self.last = Some((ticks, now));

        Some(ResourceSample {
            cpu_percent: cpu,
            memory_bytes,
            sampled_at_unix_ms: now_unix_ms(),
        })
    }
}
