// Docker state models

use bollard::models::{ContainerInspectResponse, ContainerStatsResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use wincode::{SchemaRead, SchemaWrite};

/// Docker container status; serializes to lowercase JSON (e.g. "running").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Exited,
    Paused,
    Restarting,
    Dead,
    #[serde(other)]
    Unknown,
}

impl ContainerStatus {
    /// Parse from Docker API state string (e.g. "running", "exited").
    pub fn from_docker(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "exited" => ContainerStatus::Exited,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Unknown,
        }
    }
}

/// One container as captured by the daemon: raw inspect + raw stats payloads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    #[serde(default)]
    pub inspect: ContainerInspectResponse,
    #[serde(default)]
    pub stats: ContainerStatsResponse,
}

impl ContainerSnapshot {
    /// Container name without the leading slash Docker adds.
    pub fn name(&self) -> Option<&str> {
        self.inspect
            .name
            .as_deref()
            .map(|n| n.trim_start_matches('/'))
    }

    pub fn status(&self) -> ContainerStatus {
        self.inspect
            .state
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .map(|s| ContainerStatus::from_docker(&s.to_string()))
            .unwrap_or(ContainerStatus::Unknown)
    }
}

/// Complete Docker state at one instant. Replaces, never patches, the previous one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerStateSnapshot {
    #[serde(default)]
    pub containers: BTreeMap<String, ContainerSnapshot>,
}

impl DockerStateSnapshot {
    /// Container ids in sorted order.
    pub fn ids(&self) -> Vec<String> {
        self.containers.keys().cloned().collect()
    }
}

/// One entry of the daemon's `/api/docker/state` event payload.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonSnapshot {
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub containers: BTreeMap<String, ContainerSnapshot>,
}

/// Compact per-container sample kept for the memory-usage history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
#[serde(rename_all = "camelCase")]
pub struct ContainerUsage {
    pub status: ContainerStatus,
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub memory_max_usage_bytes: u64,
}

impl ContainerUsage {
    /// Derive a sample from the raw stats payload. CPU percent needs both the
    /// current and previous CPU counters; without them it is reported as 0.
    pub fn from_snapshot(c: &ContainerSnapshot) -> Self {
        let s = &c.stats;
        let cpu_percent = match (s.cpu_stats.as_ref(), s.precpu_stats.as_ref()) {
            (Some(cpu_stats), Some(precpu_stats)) => {
                let total = cpu_stats
                    .cpu_usage
                    .as_ref()
                    .and_then(|u| u.total_usage)
                    .unwrap_or(0) as i64;
                let pre_total = precpu_stats
                    .cpu_usage
                    .as_ref()
                    .and_then(|u| u.total_usage)
                    .unwrap_or(0) as i64;
                let system_delta = cpu_stats.system_cpu_usage.unwrap_or(0) as i64
                    - precpu_stats.system_cpu_usage.unwrap_or(0) as i64;
                let online = cpu_stats.online_cpus.unwrap_or(1) as f64;
                if system_delta > 0 && online > 0.0 {
                    ((total - pre_total) as f64 / system_delta as f64) * online * 100.0
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };

        let memory = s.memory_stats.as_ref();
        Self {
            status: c.status(),
            cpu_percent,
            memory_usage_bytes: memory.and_then(|m| m.usage).unwrap_or(0),
            memory_limit_bytes: memory.and_then(|m| m.limit).unwrap_or(0),
            memory_max_usage_bytes: memory.and_then(|m| m.max_usage).unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{
        ContainerCpuStats, ContainerCpuUsage, ContainerMemoryStats, ContainerState,
        ContainerStateStatusEnum,
    };

    fn minimal_cpu_stats(total_usage: u64, system_cpu_usage: u64) -> ContainerCpuStats {
        ContainerCpuStats {
            cpu_usage: Some(ContainerCpuUsage {
                total_usage: Some(total_usage),
                ..Default::default()
            }),
            system_cpu_usage: Some(system_cpu_usage),
            online_cpus: Some(2),
            throttling_data: None,
        }
    }

    #[test]
    fn usage_computes_cpu_and_memory() {
        let c = ContainerSnapshot {
            inspect: ContainerInspectResponse {
                name: Some("/web".into()),
                state: Some(ContainerState {
                    status: Some(ContainerStateStatusEnum::RUNNING),
                    ..Default::default()
                }),
                ..Default::default()
            },
            stats: ContainerStatsResponse {
                cpu_stats: Some(minimal_cpu_stats(100_000_000, 1_000_000_000)),
                precpu_stats: Some(minimal_cpu_stats(50_000_000, 500_000_000)),
                memory_stats: Some(ContainerMemoryStats {
                    usage: Some(256 * 1024 * 1024),
                    limit: Some(512 * 1024 * 1024),
                    max_usage: Some(300 * 1024 * 1024),
                    ..Default::default()
                }),
                ..Default::default()
            },
        };
        let usage = ContainerUsage::from_snapshot(&c);
        assert_eq!(c.name(), Some("web"));
        assert_eq!(usage.status, ContainerStatus::Running);
        assert!((usage.cpu_percent - 20.0).abs() < 0.01);
        assert_eq!(usage.memory_usage_bytes, 256 * 1024 * 1024);
        assert_eq!(usage.memory_limit_bytes, 512 * 1024 * 1024);
        assert_eq!(usage.memory_max_usage_bytes, 300 * 1024 * 1024);
    }

    #[test]
    fn usage_without_precpu_reports_zero_cpu() {
        let c = ContainerSnapshot {
            stats: ContainerStatsResponse {
                cpu_stats: Some(minimal_cpu_stats(100, 1000)),
                precpu_stats: None,
                ..Default::default()
            },
            ..Default::default()
        };
        let usage = ContainerUsage::from_snapshot(&c);
        assert_eq!(usage.cpu_percent, 0.0);
        assert_eq!(usage.status, ContainerStatus::Unknown);
    }

    #[test]
    fn status_from_docker_is_case_insensitive() {
        assert_eq!(ContainerStatus::from_docker("Running"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::from_docker("dead"), ContainerStatus::Dead);
        assert_eq!(ContainerStatus::from_docker("???"), ContainerStatus::Unknown);
    }
}
