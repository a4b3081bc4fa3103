//! Stats domain — periodic resource samples for a container.

use chrono::{DateTime, Utc};
use futures_util::stream::{BoxStream, StreamExt};
use serde::Serialize;

use super::client::{DockerEngine, EngineError};

/// One resource sample, condensed for streaming to API subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSample {
    pub at: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_percent: f64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub pids: Option<u64>,
}

impl DockerEngine {
    pub(super) fn follow_stats(
        &self,
        container_id: &str,
    ) -> BoxStream<'static, Result<StatsSample, EngineError>> {
        use bollard::query_parameters::StatsOptions;

        let options = Some(StatsOptions {
            stream: true,
            ..Default::default()
        });
        let client = self.client.clone();
        let container_id = container_id.to_string();
        Box::pin(async_stream::stream! {
            let mut stats = client.stats(&container_id, options);
            while let Some(result) = stats.next().await {
                match result {
                    Ok(raw) => yield Ok(convert_sample(raw)),
                    Err(e) => {
                        yield Err(EngineError::from(e));
                        break;
                    }
                }
            }
        })
    }
}

pub(crate) fn convert_sample(raw: bollard::models::ContainerStatsResponse) -> StatsSample {
    let at = raw
        .read
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.to_utc())
        .unwrap_or_else(Utc::now);

    let cpu_percent = cpu_percent(&raw);

    let (memory_usage, memory_limit) = raw
        .memory_stats
        .as_ref()
        .map(|m| (m.usage.unwrap_or(0), m.limit.unwrap_or(0)))
        .unwrap_or((0, 0));
    let memory_percent = if memory_limit > 0 {
        (memory_usage as f64 / memory_limit as f64) * 100.0
    } else {
        0.0
    };

    let (net_rx_bytes, net_tx_bytes) = raw
        .networks
        .map(|nets| {
            nets.values().fold((0u64, 0u64), |(rx, tx), n| {
                (
                    rx + n.rx_bytes.unwrap_or(0),
                    tx + n.tx_bytes.unwrap_or(0),
                )
            })
        })
        .unwrap_or((0, 0));

    StatsSample {
        at,
        cpu_percent,
        memory_usage,
        memory_limit,
        memory_percent,
        net_rx_bytes,
        net_tx_bytes,
        pids: raw.pids_stats.and_then(|p| p.current),
    }
}

/// `((cpu_delta / system_delta) * online_cpus) * 100`, guarding counter
/// resets and zero deltas.
fn cpu_percent(raw: &bollard::models::ContainerStatsResponse) -> f64 {
    let (Some(cpu), Some(precpu)) = (&raw.cpu_stats, &raw.precpu_stats) else {
        return 0.0;
    };

    let total = cpu.cpu_usage.as_ref().and_then(|u| u.total_usage).unwrap_or(0);
    let pretotal = precpu
        .cpu_usage
        .as_ref()
        .and_then(|u| u.total_usage)
        .unwrap_or(0);
    let cpu_delta = total.saturating_sub(pretotal) as f64;

    let system_delta = cpu
        .system_cpu_usage
        .unwrap_or(0)
        .saturating_sub(precpu.system_cpu_usage.unwrap_or(0)) as f64;

    if system_delta > 0.0 && cpu_delta > 0.0 {
        let cpus = cpu.online_cpus.unwrap_or(1).max(1) as f64;
        let pct = (cpu_delta / system_delta) * cpus * 100.0;
        if pct.is_finite() {
            pct
        } else {
            0.0
        }
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{
        ContainerCpuStats, ContainerCpuUsage, ContainerMemoryStats,
        ContainerStatsResponse as Raw,
    };

    fn with_cpu(total: u64, pretotal: u64, sys: u64, presys: u64, cpus: u32) -> Raw {
        Raw {
            cpu_stats: Some(ContainerCpuStats {
                cpu_usage: Some(ContainerCpuUsage {
                    total_usage: Some(total),
                    ..Default::default()
                }),
                system_cpu_usage: Some(sys),
                online_cpus: Some(cpus),
                throttling_data: None,
            }),
            precpu_stats: Some(ContainerCpuStats {
                cpu_usage: Some(ContainerCpuUsage {
                    total_usage: Some(pretotal),
                    ..Default::default()
                }),
                system_cpu_usage: Some(presys),
                online_cpus: Some(cpus),
                throttling_data: None,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn cpu_percent_single_core() {
        let raw = with_cpu(200_000_000, 100_000_000, 2_000_000_000, 1_800_000_000, 1);
        assert!((cpu_percent(&raw) - 50.0).abs() < 0.01);
    }

    #[test]
    fn cpu_percent_multi_core() {
        let raw = with_cpu(200_000_000, 100_000_000, 2_000_000_000, 1_800_000_000, 4);
        assert!((cpu_percent(&raw) - 200.0).abs() < 0.01);
    }

    #[test]
    fn cpu_percent_counter_reset_is_zero() {
        let raw = with_cpu(50, 100, 2_000, 1_800, 1);
        assert_eq!(cpu_percent(&raw), 0.0);
    }

    #[test]
    fn cpu_percent_missing_precpu_is_zero() {
        let mut raw = with_cpu(100, 0, 100, 0, 1);
        raw.precpu_stats = None;
        assert_eq!(cpu_percent(&raw), 0.0);
    }

    #[test]
    fn memory_zero_limit_does_not_nan() {
        let raw = Raw {
            memory_stats: Some(ContainerMemoryStats {
                usage: Some(1024),
                limit: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        let sample = convert_sample(raw);
        assert_eq!(sample.memory_percent, 0.0);
    }

    #[test]
    fn sample_timestamp_from_read_field() {
        let raw = Raw {
            read: Some("2026-01-15T10:30:00.000000000Z".to_string()),
            ..Default::default()
        };
        let sample = convert_sample(raw);
        assert_eq!(
            sample.at,
            DateTime::parse_from_rfc3339("2026-01-15T10:30:00Z")
                .unwrap()
                .to_utc()
        );
    }
}
