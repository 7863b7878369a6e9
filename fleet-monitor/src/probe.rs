//! Probe batch and metric parsing.
//!
//! Each probe is a parallel batch of seven shell commands; every command's
//! stdout parses into (metric, value) pairs per a fixed schema. A probe
//! command that fails or parses badly drops its metrics only.

use chrono::{DateTime, Utc};
use tracing::warn;

use fleet_core::metrics::MetricSample;
use fleet_exec::command::{BatchCommand, BatchMode, BatchResult, Command, ExecStatus};

const PROBE_TIMEOUT_SECS: u64 = 30;

/// The seven probe commands, in batch order.
const PROBES: &[(&str, &str)] = &[
    ("cpu", "top -bn1 | grep -i '%cpu' | head -1"),
    ("load", "uptime"),
    ("memory", "free -m | grep -i '^mem'"),
    ("disk", "df -P / | tail -1"),
    ("disk_detail", "df -P -m / | tail -1"),
    ("network", "cat /proc/net/dev"),
    ("uptime", "cat /proc/uptime"),
];

/// Build the monitoring batch for one server.
pub fn probe_batch(server_id: &str) -> BatchCommand {
    let try_commands = PROBES
        .iter()
        .map(|(name, line)| {
            let mut cmd = Command::shell(&format!("probe-{name}"), name, line);
            cmd.timeout_secs = PROBE_TIMEOUT_SECS;
            cmd
        })
        .collect();

    BatchCommand {
        id: format!("monitor-{server_id}"),
        name: "host-probe".to_string(),
        mode: BatchMode::Parallel,
        total_timeout_secs: 2 * PROBE_TIMEOUT_SECS,
        try_commands,
        catch_commands: Vec::new(),
        finally_commands: Vec::new(),
        stop_on_error: false,
        continue_on_failed: true,
    }
}

fn parse_float(token: &str) -> Result<f64, String> {
    token
        .trim()
        .trim_end_matches(&['%', ','][..])
        .parse::<f64>()
        .map_err(|_| format!("not a number: {token}"))
}

/// `top -bn1` CPU line: usage = 100 − idle. The idle figure is the token
/// preceding "id".
fn parse_cpu(stdout: &str) -> Result<Vec<(String, f64)>, String> {
    let line = stdout.lines().next().ok_or("empty cpu output")?;
    let fields: Vec<&str> = line.split(',').collect();
    for field in fields {
        let field = field.trim();
        if let Some(idle) = field.strip_suffix("id") {
            // Strip the leading "%Cpu(s):"-style prefix if it landed in
            // this segment.
            let idle = idle.trim().rsplit(' ').next().unwrap_or(idle);
            let idle = parse_float(idle)?;
            return Ok(vec![("cpu.usage_percent".to_string(), (100.0 - idle).max(0.0))]);
        }
    }
    Err(format!("no idle figure in {line:?}"))
}

/// `uptime` load averages: the three floats after "load average:".
fn parse_load(stdout: &str) -> Result<Vec<(String, f64)>, String> {
    let line = stdout.lines().next().ok_or("empty uptime output")?;
    let averages = line
        .split("load average:")
        .nth(1)
        .ok_or_else(|| format!("no load average in {line:?}"))?;
    let values: Vec<f64> = averages
        .split(',')
        .map(parse_float)
        .collect::<Result<_, _>>()?;
    if values.len() != 3 {
        return Err(format!("expected three load figures, got {}", values.len()));
    }
    Ok(vec![
        ("load.1m".to_string(), values[0]),
        ("load.5m".to_string(), values[1]),
        ("load.15m".to_string(), values[2]),
    ])
}

/// `free -m` Mem line: total and used in MiB.
fn parse_memory(stdout: &str) -> Result<Vec<(String, f64)>, String> {
    let line = stdout.lines().next().ok_or("empty memory output")?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 3 {
        return Err(format!("short memory line {line:?}"));
    }
    let total = parse_float(fields[1])?;
    let used = parse_float(fields[2])?;
    let usage = if total > 0.0 { used / total * 100.0 } else { 0.0 };
    Ok(vec![
        ("memory.total_mb".to_string(), total),
        ("memory.used_mb".to_string(), used),
        ("memory.usage_percent".to_string(), usage),
    ])
}

/// `df -P /` data line: the capacity column carries the percentage.
fn parse_disk(stdout: &str) -> Result<Vec<(String, f64)>, String> {
    let line = stdout.lines().last().ok_or("empty disk output")?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 5 {
        return Err(format!("short disk line {line:?}"));
    }
    Ok(vec![("disk.usage_percent".to_string(), parse_float(fields[4])?)])
}

/// `df -P -m /` data line: total and used MiB columns.
fn parse_disk_detail(stdout: &str) -> Result<Vec<(String, f64)>, String> {
    let line = stdout.lines().last().ok_or("empty disk output")?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        return Err(format!("short disk line {line:?}"));
    }
    Ok(vec![
        ("disk.total_mb".to_string(), parse_float(fields[1])?),
        ("disk.used_mb".to_string(), parse_float(fields[2])?),
    ])
}

/// `/proc/net/dev`: receive/transmit byte counters summed over every
/// interface except loopback.
fn parse_network(stdout: &str) -> Result<Vec<(String, f64)>, String> {
    let mut rx = 0.0;
    let mut tx = 0.0;
    let mut seen = false;
    for line in stdout.lines().skip(2) {
        let Some((iface, counters)) = line.split_once(':') else { continue };
        if iface.trim() == "lo" {
            continue;
        }
        let fields: Vec<&str> = counters.split_whitespace().collect();
        if fields.len() < 9 {
            continue;
        }
        rx += parse_float(fields[0])?;
        tx += parse_float(fields[8])?;
        seen = true;
    }
    if !seen {
        return Err("no interfaces in /proc/net/dev output".to_string());
    }
    Ok(vec![
        ("network.rx_bytes".to_string(), rx),
        ("network.tx_bytes".to_string(), tx),
    ])
}

/// `/proc/uptime`: seconds since boot.
fn parse_uptime(stdout: &str) -> Result<Vec<(String, f64)>, String> {
    let first = stdout
        .split_whitespace()
        .next()
        .ok_or("empty uptime output")?;
    Ok(vec![("uptime.seconds".to_string(), parse_float(first)?)])
}

/// Parse one probe command's stdout by its command name.
pub fn parse_probe_output(name: &str, stdout: &str) -> Result<Vec<(String, f64)>, String> {
    match name {
        "cpu" => parse_cpu(stdout),
        "load" => parse_load(stdout),
        "memory" => parse_memory(stdout),
        "disk" => parse_disk(stdout),
        "disk_detail" => parse_disk_detail(stdout),
        "network" => parse_network(stdout),
        "uptime" => parse_uptime(stdout),
        other => Err(format!("unknown probe {other}")),
    }
}

/// Turn a finished probe batch into metric samples. Failed commands and
/// parse errors drop their own metrics and nothing else.
pub fn samples_from_batch(
    server_id: &str,
    batch: &BatchResult,
    collected_at: DateTime<Utc>,
) -> Vec<MetricSample> {
    let mut samples = Vec::new();
    for result in &batch.try_results {
        if result.status != ExecStatus::Success {
            warn!(
                "probe {} on {server_id} failed: {}",
                result.name,
                result.error.as_deref().unwrap_or("unknown")
            );
            continue;
        }
        match parse_probe_output(&result.name, &result.stdout) {
            Ok(pairs) => {
                samples.extend(pairs.into_iter().map(|(name, value)| MetricSample {
                    server_id: server_id.to_string(),
                    name,
                    value,
                    collected_at,
                }));
            }
            Err(e) => warn!("probe {} on {server_id} unparseable: {e}", result.name),
        }
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_batch_shape() {
        let batch = probe_batch("srv-1");
        assert_eq!(batch.mode, BatchMode::Parallel);
        assert_eq!(batch.try_commands.len(), 7);
        assert!(!batch.stop_on_error);
        assert!(batch.continue_on_failed);
        assert!(batch.catch_commands.is_empty());
    }

    #[test]
    fn test_parse_cpu() {
        let out = "%Cpu(s):  3.1 us,  1.2 sy,  0.0 ni, 93.8 id,  1.7 wa,  0.0 hi,  0.2 si,  0.0 st\n";
        let pairs = parse_cpu(out).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0, "cpu.usage_percent");
        assert!((pairs[0].1 - 6.2).abs() < 0.01);
    }

    #[test]
    fn test_parse_load() {
        let out = " 17:05:01 up 12 days,  3:42,  2 users,  load average: 0.52, 0.58, 0.59\n";
        let pairs = parse_load(out).unwrap();
        assert_eq!(pairs[0], ("load.1m".to_string(), 0.52));
        assert_eq!(pairs[1], ("load.5m".to_string(), 0.58));
        assert_eq!(pairs[2], ("load.15m".to_string(), 0.59));
    }

    #[test]
    fn test_parse_memory() {
        let out = "Mem:           7961        3514         892\n";
        let pairs = parse_memory(out).unwrap();
        assert_eq!(pairs[0], ("memory.total_mb".to_string(), 7961.0));
        assert_eq!(pairs[1], ("memory.used_mb".to_string(), 3514.0));
        assert!((pairs[2].1 - 44.14).abs() < 0.01);
    }

    #[test]
    fn test_parse_disk() {
        let out = "/dev/sda1  41152832 16412928  22626816  42% /\n";
        let pairs = parse_disk(out).unwrap();
        assert_eq!(pairs[0], ("disk.usage_percent".to_string(), 42.0));
    }

    #[test]
    fn test_parse_disk_detail() {
        let out = "/dev/sda1  40189 16028  22084  42% /\n";
        let pairs = parse_disk_detail(out).unwrap();
        assert_eq!(pairs[0], ("disk.total_mb".to_string(), 40189.0));
        assert_eq!(pairs[1], ("disk.used_mb".to_string(), 16028.0));
    }

    #[test]
    fn test_parse_network_skips_loopback() {
        let out = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 9999999    1000    0    0    0     0          0         0  9999999    1000    0    0    0     0       0          0
  eth0: 1000000    8000    0    0    0     0          0         0   500000    6000    0    0    0     0       0          0
  eth1: 2000000    9000    0    0    0     0          0         0   700000    7000    0    0    0     0       0          0
";
        let pairs = parse_network(out).unwrap();
        assert_eq!(pairs[0], ("network.rx_bytes".to_string(), 3_000_000.0));
        assert_eq!(pairs[1], ("network.tx_bytes".to_string(), 1_200_000.0));
    }

    #[test]
    fn test_parse_uptime() {
        let pairs = parse_uptime("123456.78 9876.54\n").unwrap();
        assert_eq!(pairs[0], ("uptime.seconds".to_string(), 123456.78));
    }

    #[test]
    fn test_parse_errors_are_descriptive() {
        assert!(parse_cpu("garbage\n").is_err());
        assert!(parse_load("no averages here\n").is_err());
        assert!(parse_probe_output("nope", "").is_err());
    }
}
