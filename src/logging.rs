//! Logging and Latency Monitoring
//!
//! The binary installs a `tracing-subscriber` formatter; library code keeps
//! logging through the `log` facade, which `tracing-log` bridges into it.
//! `LatencyMonitor` collects per-target dispatch timings for the orchestrator.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Filter from `RUST_LOG` when it parses, otherwise the configured level
pub fn build_filter(env: Option<&str>, level: LevelFilter) -> EnvFilter {
    env.and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(level.as_str().to_lowercase()))
}

/// Install the stderr subscriber. Calling twice is harmless.
pub fn init(level: LevelFilter) {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_filter(env.as_deref(), level))
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

/// A single dispatch sample
#[derive(Debug, Clone)]
pub struct DispatchSample {
    pub target: String,
    pub duration: Duration,
    pub success: bool,
}

/// Per-target latency and success metrics
#[derive(Debug, Clone)]
pub struct LatencyMonitor {
    samples: Arc<Mutex<Vec<DispatchSample>>>,
    slow_threshold: Duration,
}

impl Default for LatencyMonitor {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl LatencyMonitor {
    pub fn new(slow_threshold: Duration) -> Self {
        Self {
            samples: Arc::new(Mutex::new(Vec::new())),
            slow_threshold,
        }
    }

    /// Record one dispatch, warning when it exceeded the slow threshold
    pub fn record(&self, target: &str, duration: Duration, success: bool) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.push(DispatchSample {
                target: target.to_string(),
                duration,
                success,
            });
        }

        if duration > self.slow_threshold {
            log::warn!(
                "{} took {:?} (threshold: {:?})",
                target,
                duration,
                self.slow_threshold
            );
        }
    }

    pub fn average_duration(&self, target: &str) -> Option<Duration> {
        let samples = self.samples.lock().ok()?;
        let matching: Vec<_> = samples.iter().filter(|s| s.target == target).collect();
        if matching.is_empty() {
            return None;
        }
        let total: Duration = matching.iter().map(|s| s.duration).sum();
        Some(total / matching.len() as u32)
    }

    pub fn success_rate(&self, target: &str) -> Option<f64> {
        let samples = self.samples.lock().ok()?;
        let matching: Vec<_> = samples.iter().filter(|s| s.target == target).collect();
        if matching.is_empty() {
            return None;
        }
        let successes = matching.iter().filter(|s| s.success).count();
        Some(successes as f64 / matching.len() as f64)
    }

    pub fn samples(&self) -> Vec<DispatchSample> {
        self.samples.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Stats grouped by target, ordered by target key
    pub fn summary(&self) -> LatencySummary {
        let samples = self.samples();
        let mut by_target: BTreeMap<&str, Vec<&DispatchSample>> = BTreeMap::new();
        for sample in &samples {
            by_target.entry(sample.target.as_str()).or_default().push(sample);
        }

        let targets = by_target
            .into_iter()
            .map(|(target, group)| {
                let total: Duration = group.iter().map(|s| s.duration).sum();
                let successes = group.iter().filter(|s| s.success).count();
                TargetStats {
                    target: target.to_string(),
                    count: group.len(),
                    avg_duration: total / group.len() as u32,
                    max_duration: group.iter().map(|s| s.duration).max().unwrap_or_default(),
                    success_rate: successes as f64 / group.len() as f64,
                }
            })
            .collect();

        LatencySummary {
            total_dispatches: samples.len(),
            targets,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TargetStats {
    pub target: String,
    pub count: usize,
    pub avg_duration: Duration,
    pub max_duration: Duration,
    pub success_rate: f64,
}

#[derive(Debug, Clone)]
pub struct LatencySummary {
    pub total_dispatches: usize,
    pub targets: Vec<TargetStats>,
}

/// Measures one dispatch and records it on `stop`
pub struct Timer {
    start: Instant,
    target: String,
    monitor: Option<LatencyMonitor>,
}

impl Timer {
    pub fn start(target: &str) -> Self {
        Self {
            start: Instant::now(),
            target: target.to_string(),
            monitor: None,
        }
    }

    pub fn start_with_monitor(target: &str, monitor: LatencyMonitor) -> Self {
        Self {
            start: Instant::now(),
            target: target.to_string(),
            monitor: Some(monitor),
        }
    }

    pub fn stop(self, success: bool) -> Duration {
        let duration = self.start.elapsed();
        if let Some(monitor) = self.monitor {
            monitor.record(&self.target, duration, success);
        }
        duration
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
