//! Resource usage sampling via `docker stats --no-stream`.

use serde::Serialize;
use std::collections::HashMap;
use tokio::process::Command;

use super::{run, DockerCli, Error, Result};

/// One container's resource usage at sampling time, memory in MiB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub mem_mib: f64,
    pub mem_max_mib: f64,
}

impl DockerCli {
    /// Sample a single container.
    pub async fn stats(&self, container_id: &str) -> Result<ContainerStats> {
        let mut command = Command::new("docker");
        command
            .arg("stats")
            .arg("--no-stream")
            .arg("--format")
            .arg("{{.CPUPerc}}|{{.MemUsage}}")
            .arg(container_id);

        let output = run(command).await?;
        let line = String::from_utf8_lossy(&output.stdout);
        let line = line.trim();
        if line.is_empty() {
            return Err(Error::StatsUnavailable(format!(
                "container {} not found or not running",
                container_id
            )));
        }

        parse_stats_fields(line)
            .ok_or_else(|| Error::StatsUnavailable(format!("unexpected stats line: {}", line)))
    }

    /// Sample every container on the host, keyed by the (possibly truncated)
    /// container id docker reports.
    pub async fn stats_all(&self) -> Result<HashMap<String, ContainerStats>> {
        let mut command = Command::new("docker");
        command
            .arg("stats")
            .arg("--no-stream")
            .arg("--format")
            .arg("{{.ID}}|{{.CPUPerc}}|{{.MemUsage}}");

        let output = run(command).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        let mut result = HashMap::new();
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((id, rest)) = line.split_once('|') else {
                continue;
            };
            if let Some(stats) = parse_stats_fields(rest) {
                result.insert(id.to_string(), stats);
            }
        }
        Ok(result)
    }
}

/// Parse `<cpu>%|<usage> / <limit>` into stats.
fn parse_stats_fields(fields: &str) -> Option<ContainerStats> {
    let (cpu, mem) = fields.split_once('|')?;
    let cpu_percent = cpu.trim().trim_end_matches('%').parse::<f64>().ok()?;

    let (usage, limit) = mem.split_once('/')?;
    Some(ContainerStats {
        cpu_percent,
        mem_mib: memory_to_mib(usage.trim()),
        mem_max_mib: memory_to_mib(limit.trim()),
    })
}

/// Convert docker's humanized memory strings (`12.5MiB`, `1.94GiB`, `512kB`,
/// `64B`) to MiB. Unknown units are treated as already-MiB.
fn memory_to_mib(memory: &str) -> f64 {
    let memory = memory.trim();
    let split = memory
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(memory.len());
    let (value, unit) = memory.split_at(split);

    let Ok(value) = value.parse::<f64>() else {
        return 0.0;
    };

    match unit.trim().to_lowercase().as_str() {
        "gib" | "gb" => value * 1024.0,
        "mib" | "mb" => value,
        "kib" | "kb" => value / 1024.0,
        "b" => value / 1024.0 / 1024.0,
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_memory_units_to_mib() {
        assert_eq!(memory_to_mib("512MiB"), 512.0);
        assert_eq!(memory_to_mib("2GiB"), 2048.0);
        assert_eq!(memory_to_mib("1024KiB"), 1.0);
        assert!((memory_to_mib("1048576B") - 1.0).abs() < 1e-9);
        assert_eq!(memory_to_mib(""), 0.0);
        assert_eq!(memory_to_mib("garbage"), 0.0);
    }

    #[test]
    fn parses_stats_line() {
        let stats = parse_stats_fields("1.25%|12.5MiB / 1.94GiB").unwrap();
        assert!((stats.cpu_percent - 1.25).abs() < 1e-9);
        assert!((stats.mem_mib - 12.5).abs() < 1e-9);
        assert!((stats.mem_max_mib - 1.94 * 1024.0).abs() < 1e-6);
    }

    #[test]
    fn rejects_malformed_stats_line() {
        assert!(parse_stats_fields("no separators").is_none());
        assert!(parse_stats_fields("x%|no-slash").is_none());
    }

    #[test]
    fn parses_zero_usage() {
        let stats = parse_stats_fields("0.00%|0B / 0B").unwrap();
        assert_eq!(stats.cpu_percent, 0.0);
        assert_eq!(stats.mem_mib, 0.0);
    }
}
