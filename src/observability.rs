//! Host observability helpers: /proc sampling, the periodic memlog task and
//! the loopback diagnostics listener.

use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Json, Router, routing::get};
use log::{info, warn};
use serde::Serialize;
use tokio::fs;

use crate::pool::SessionPool;

#[derive(Debug, Clone)]
pub struct CpuTimes {
    total: u64,
    idle: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostMetrics {
    pub cpu_percent: f64,
    pub mem_total_bytes: u64,
    pub mem_used_bytes: u64,
    pub mem_available_bytes: u64,
}

#[derive(Debug, Clone)]
struct MemInfo {
    total_bytes: u64,
    available_bytes: u64,
}

pub async fn read_host_metrics(prev_cpu: Option<CpuTimes>) -> Result<(HostMetrics, CpuTimes)> {
    let stat_contents = fs::read_to_string("/proc/stat")
        .await
        .context("reading /proc/stat")?;
    let mem_contents = fs::read_to_string("/proc/meminfo")
        .await
        .context("reading /proc/meminfo")?;

    let current_cpu = parse_cpu_times(&stat_contents)?;
    let mem_info = parse_meminfo(&mem_contents)?;
    let cpu_percent = compute_cpu_percent(prev_cpu.as_ref(), &current_cpu);

    let used_bytes = mem_info.total_bytes.saturating_sub(mem_info.available_bytes);

    Ok((
        HostMetrics {
            cpu_percent,
            mem_total_bytes: mem_info.total_bytes,
            mem_used_bytes: used_bytes,
            mem_available_bytes: mem_info.available_bytes,
        },
        current_cpu,
    ))
}

/// Log host metrics and pool occupancy every `period`. Runs until the
/// process exits.
pub fn spawn_memlog(pool: SessionPool, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut prev_cpu = None;
        loop {
            ticker.tick().await;
            match read_host_metrics(prev_cpu.take()).await {
                Ok((metrics, cpu)) => {
                    prev_cpu = Some(cpu);
                    let (ready, size) = pool.stats();
                    info!(
                        "memlog: cpu={:.1}% mem_used={:.2}MB mem_avail={:.2}MB pool={}/{}",
                        metrics.cpu_percent,
                        metrics.mem_used_bytes as f64 / 1024.0 / 1024.0,
                        metrics.mem_available_bytes as f64 / 1024.0 / 1024.0,
                        ready,
                        size
                    );
                }
                Err(e) => warn!("memlog: sampling failed: {e:#}"),
            }
        }
    });
}

/// Serve `GET /metrics/host` on a loopback address for on-box diagnosis.
pub async fn spawn_diag_server(addr: String) -> Result<()> {
    let app = Router::new().route("/metrics/host", get(host_metrics_handler));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding diagnostics listener on {addr}"))?;
    info!("diagnostics listening on {addr}");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("diagnostics server error: {e}");
        }
    });
    Ok(())
}

async fn host_metrics_handler() -> Json<serde_json::Value> {
    match read_host_metrics(None).await {
        Ok((metrics, _)) => Json(serde_json::json!(metrics)),
        Err(e) => Json(serde_json::json!({"error": e.to_string()})),
    }
}

fn parse_cpu_times(contents: &str) -> Result<CpuTimes> {
    let line = contents
        .lines()
        .find(|line| line.starts_with("cpu "))
        .context("missing cpu line in /proc/stat")?;

    let mut parts = line.split_whitespace();
    let _ = parts.next();
    let values: Vec<u64> = parts
        .map(|value| value.parse::<u64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("parsing cpu times")?;

    if values.len() < 4 {
        return Err(anyhow::anyhow!("cpu stats line missing expected fields"));
    }

    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    let total = values.iter().sum();

    Ok(CpuTimes { total, idle })
}

fn parse_meminfo(contents: &str) -> Result<MemInfo> {
    let mut total_kb = None;
    let mut available_kb = None;

    for line in contents.lines() {
        if line.starts_with("MemTotal:") {
            total_kb = parse_meminfo_kb(line);
        } else if line.starts_with("MemAvailable:") {
            available_kb = parse_meminfo_kb(line);
        }
    }

    let total_kb = total_kb.context("missing MemTotal in /proc/meminfo")?;
    let available_kb = available_kb.context("missing MemAvailable in /proc/meminfo")?;

    Ok(MemInfo {
        total_bytes: total_kb.saturating_mul(1024),
        available_bytes: available_kb.saturating_mul(1024),
    })
}

fn parse_meminfo_kb(line: &str) -> Option<u64> {
    line.split_whitespace().nth(1)?.parse::<u64>().ok()
}

fn compute_cpu_percent(prev: Option<&CpuTimes>, current: &CpuTimes) -> f64 {
    let Some(prev) = prev else {
        return 0.0;
    };

    let total_delta = current.total.saturating_sub(prev.total);
    let idle_delta = current.idle.saturating_sub(prev.idle);
    if total_delta == 0 {
        return 0.0;
    }

    let busy_delta = total_delta.saturating_sub(idle_delta);
    (busy_delta as f64 / total_delta as f64) * 100.0
}
