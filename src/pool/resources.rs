//! Per-server resource samples taken during health checks.
//!
//! After a successful probe the pool runs [`SAMPLE_SCRIPT`] on the server
//! and keeps the parsed [`ResourceSample`] in a rolling history. Fields the
//! server could not report (no `/proc`, no `free`) stay `None`.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::ServerConfig;
use crate::remote::{Command, RemoteExecutor};

/// Prints `key=value` lines: 1-minute load average, CPU count, used
/// memory fraction and used fraction of the root filesystem.
pub const SAMPLE_SCRIPT: &str = r#"echo "load=$(cut -d' ' -f1 /proc/loadavg 2>/dev/null)"
echo "cpus=$(nproc 2>/dev/null)"
free 2>/dev/null | awk '/^Mem:/ { if ($2 > 0) printf "memory=%.4f\n", $3 / $2 }'
df -P / 2>/dev/null | awk 'NR == 2 { sub("%", "", $5); printf "disk=%.4f\n", $5 / 100 }'"#;

const SAMPLE_TIMEOUT: Duration = Duration::from_secs(30);

/// One resource reading of one server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSample {
    pub timestamp: DateTime<Utc>,
    pub load_average: Option<f64>,
    pub cpus: Option<u32>,
    /// Used memory, 0.0 to 1.0.
    pub memory_usage: Option<f64>,
    /// Used space on `/`, 0.0 to 1.0.
    pub disk_usage: Option<f64>,
}

impl ResourceSample {
    /// Parses the output of [`SAMPLE_SCRIPT`]. Unknown keys and values
    /// that are empty or not finite numbers are ignored.
    ///
    /// ```
    /// use labgrid::pool::ResourceSample;
    ///
    /// let sample = ResourceSample::parse("load=0.52\ncpus=8\nmemory=0.4100\ndisk=\n");
    /// assert_eq!(sample.load_average, Some(0.52));
    /// assert_eq!(sample.cpus, Some(8));
    /// assert_eq!(sample.disk_usage, None);
    /// ```
    pub fn parse(output: &str) -> Self {
        let mut sample = ResourceSample {
            timestamp: Utc::now(),
            load_average: None,
            cpus: None,
            memory_usage: None,
            disk_usage: None,
        };

        for (key, value) in output.lines().filter_map(|l| l.trim().split_once('=')) {
            let value = value.trim();
            let number = value.parse::<f64>().ok().filter(|v| v.is_finite());
            match key.trim() {
                "load" => sample.load_average = number,
                "cpus" => sample.cpus = value.parse().ok(),
                "memory" => sample.memory_usage = number.map(|v| v.clamp(0.0, 1.0)),
                "disk" => sample.disk_usage = number.map(|v| v.clamp(0.0, 1.0)),
                _ => {}
            }
        }
        sample
    }

    pub fn is_empty(&self) -> bool {
        self.load_average.is_none()
            && self.cpus.is_none()
            && self.memory_usage.is_none()
            && self.disk_usage.is_none()
    }
}

/// Runs the sampling script. Failures are logged and yield `None`; they
/// never affect server health.
pub(crate) async fn sample(
    executor: &dyn RemoteExecutor,
    server: &ServerConfig,
) -> Option<ResourceSample> {
    let cmd = Command::shell(SAMPLE_SCRIPT).timeout(SAMPLE_TIMEOUT);
    match executor.execute(server, &cmd).await {
        Ok(result) if result.success() => {
            let sample = ResourceSample::parse(&result.stdout);
            (!sample.is_empty()).then_some(sample)
        }
        Ok(result) => {
            debug!(
                "Resource sample on {} exited with code {}",
                server.name, result.exit_code
            );
            None
        }
        Err(e) => {
            debug!("Resource sample on {} failed: {}", server.name, e);
            None
        }
    }
}

/// Samples of one server, oldest first, limited to a time window.
#[derive(Debug, Clone, Default)]
pub(crate) struct ResourceHistory {
    samples: VecDeque<ResourceSample>,
}

impl ResourceHistory {
    pub fn push(&mut self, sample: ResourceSample, window: chrono::Duration) {
        let cutoff = sample.timestamp - window;
        self.samples.push_back(sample);
        while self
            .samples
            .front()
            .is_some_and(|oldest| oldest.timestamp < cutoff)
        {
            self.samples.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&ResourceSample> {
        self.samples.back()
    }

    pub fn since(&self, cutoff: DateTime<Utc>) -> Vec<ResourceSample> {
        self.samples
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(minutes_ago: i64) -> ResourceSample {
        ResourceSample {
            timestamp: Utc::now() - chrono::Duration::minutes(minutes_ago),
            load_average: Some(minutes_ago as f64),
            cpus: None,
            memory_usage: None,
            disk_usage: None,
        }
    }

    #[test]
    fn test_parse_sample() {
        let sample = ResourceSample::parse("load=1.5\ncpus=16\nmemory=0.2500\ndisk=0.6300\n");
        assert_eq!(sample.load_average, Some(1.5));
        assert_eq!(sample.cpus, Some(16));
        assert_eq!(sample.memory_usage, Some(0.25));
        assert_eq!(sample.disk_usage, Some(0.63));
        assert!(!sample.is_empty());
    }

    #[test]
    fn test_parse_ignores_garbage() {
        let sample = ResourceSample::parse("load=\ncpus=many\nmemory=nan\nswap=0.1\nnoise\n");
        assert!(sample.is_empty());
    }

    #[test]
    fn test_history_drops_samples_outside_window() {
        let mut history = ResourceHistory::default();
        let window = chrono::Duration::minutes(30);
        history.push(at(90), window);
        history.push(at(20), window);
        history.push(at(0), window);

        let all = history.since(Utc::now() - chrono::Duration::hours(2));
        assert_eq!(all.len(), 2);
        assert_eq!(history.latest().unwrap().load_average, Some(0.0));
        assert_eq!(history.since(Utc::now() - chrono::Duration::minutes(10)).len(), 1);
    }
}
