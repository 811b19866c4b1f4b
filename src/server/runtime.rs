//! Sizes the tokio worker pool from the container CPU quota instead of
//! the host CPU count. On a large host with a small container quota the
//! default would over-provision worker threads badly.

/// Worker thread count for the runtime builder. Runs before tracing is
/// initialized, so detection reports on stderr.
pub fn worker_threads() -> usize {
    let (threads, source) = detect_cpu_quota();
    eprintln!("[runtime] worker threads={} (source: {})", threads, source);
    threads
}

/// Detection order: explicit `PORTICO_CPU_LIMIT` override, cgroup v2
/// quota, cgroup v1 quota, then the host parallelism. Fractional quotas
/// round up so a capped container always gets at least one worker.
fn detect_cpu_quota() -> (usize, &'static str) {
    if let Some(cores) = std::env::var("PORTICO_CPU_LIMIT")
        .ok()
        .as_deref()
        .and_then(parse_cores)
    {
        return (cores, "PORTICO_CPU_LIMIT");
    }

    if let Some(cores) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max")
        .ok()
        .as_deref()
        .and_then(cgroup_v2_quota)
    {
        return (cores, "cgroup v2");
    }

    if let (Ok(quota), Ok(period)) = (
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us"),
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us"),
    ) {
        if let Some(cores) = cgroup_v1_quota(&quota, &period) {
            return (cores, "cgroup v1");
        }
    }

    let host = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    (host, "host")
}

/// Accepts "2", "2.5", or kubernetes-style millicores ("2500m").
fn parse_cores(value: &str) -> Option<usize> {
    let value = value.trim();
    let cores = match value.strip_suffix('m') {
        Some(milli) => milli.parse::<f64>().ok()? / 1000.0,
        None => value.parse::<f64>().ok()?,
    };
    cores_to_threads(cores)
}

/// cgroup v2 `cpu.max`: "quota period", or "max period" when unlimited.
fn cgroup_v2_quota(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    if quota == "max" {
        return None;
    }
    let quota: f64 = quota.parse().ok()?;
    let period: f64 = parts.next()?.parse().ok()?;
    quota_ratio(quota, period)
}

/// cgroup v1 `cpu.cfs_quota_us` / `cpu.cfs_period_us`; -1 means unlimited.
fn cgroup_v1_quota(quota: &str, period: &str) -> Option<usize> {
    let quota: f64 = quota.trim().parse().ok()?;
    let period: f64 = period.trim().parse().ok()?;
    quota_ratio(quota, period)
}

fn quota_ratio(quota: f64, period: f64) -> Option<usize> {
    if period <= 0.0 {
        return None;
    }
    cores_to_threads(quota / period)
}

fn cores_to_threads(cores: f64) -> Option<usize> {
    if cores <= 0.0 || !cores.is_finite() {
        return None;
    }
    Some(cores.ceil() as usize)
}
