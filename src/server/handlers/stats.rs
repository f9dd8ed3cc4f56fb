use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;
use sysinfo::{Disks, System};

use crate::server::error::ApiResult;
use crate::shared::models::AppState;

#[derive(Debug, Serialize)]
pub struct HostStats {
    #[serde(rename = "cpuPercent")]
    pub cpu_percent: f32,
    #[serde(rename = "memoryTotal")]
    pub memory_total: u64,
    #[serde(rename = "memoryUsed")]
    pub memory_used: u64,
    #[serde(rename = "diskTotal")]
    pub disk_total: u64,
    #[serde(rename = "diskUsed")]
    pub disk_used: u64,
}

#[derive(Debug, Serialize)]
pub struct HostStatsResponse {
    #[serde(rename = "totalHostStats")]
    pub total_host_stats: HostStats,
    #[serde(rename = "onlineContainersCount")]
    pub online_containers_count: usize,
    pub uptime: String,
}

pub async fn get_stats(State(app): State<Arc<AppState>>) -> ApiResult<Json<HostStatsResponse>> {
    let online = app.docker.list_containers(false).await?.len();

    let host = tokio::task::spawn_blocking(sample_host)
        .await
        .map_err(|e| anyhow::anyhow!("host stats sampling failed: {e}"))?;

    let uptime = format_uptime(app.started_at.elapsed().as_secs());

    Ok(Json(HostStatsResponse {
        total_host_stats: host,
        online_containers_count: online,
        uptime,
    }))
}

fn sample_host() -> HostStats {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu();
    // CPU usage needs two samples a beat apart
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu();

    let disks = Disks::new_with_refreshed_list();
    let (disk_total, disk_available) = disks
        .iter()
        .fold((0u64, 0u64), |(total, available), disk| {
            (total + disk.total_space(), available + disk.available_space())
        });

    HostStats {
        cpu_percent: sys.global_cpu_info().cpu_usage(),
        memory_total: sys.total_memory(),
        memory_used: sys.used_memory(),
        disk_total,
        disk_used: disk_total.saturating_sub(disk_available),
    }
}

/// `Nd Nh Nm` with zero leading components omitted; never empty.
pub fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;

    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}
