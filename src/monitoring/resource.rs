//! Resource Usage Monitoring
//!
//! Samples CPU and memory usage of the engine process so each step
//! attempt and each execution can report what it cost.

use std::time::{Duration, Instant};

use log::warn;
use serde::{Deserialize, Serialize};
use sysinfo::{get_current_pid, Pid, ProcessRefreshKind, System};

/// A single resource usage sample.
#[derive(Debug, Clone)]
pub struct ResourceSample {
    /// When this sample was taken
    pub timestamp: Instant,
    /// CPU usage percentage (0-100+)
    pub cpu_usage: f32,
    /// Memory usage in megabytes
    pub memory_mb: u64,
}

/// Resource usage attached to step records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub cpu_usage: f32,
    pub memory_mb: u64,
}

impl From<&ResourceSample> for ResourceUsage {
    fn from(sample: &ResourceSample) -> Self {
        Self {
            cpu_usage: sample.cpu_usage,
            memory_mb: sample.memory_mb,
        }
    }
}

/// Monitors resource usage of the current process.
///
/// # Example
///
/// ```rust,no_run
/// use flowrunner::monitoring::ResourceMonitor;
/// use std::time::Duration;
/// use std::thread;
///
/// let mut monitor = ResourceMonitor::new();
///
/// for _ in 0..5 {
///     monitor.sample();
///     thread::sleep(Duration::from_millis(300));
/// }
///
/// println!("{}", monitor.get_summary());
/// ```
pub struct ResourceMonitor {
    system: System,
    process_id: Option<Pid>,
    samples: Vec<ResourceSample>,
    warmup_done: bool,
    last_sample: Option<Instant>,
    min_interval: Duration,
}

impl ResourceMonitor {
    /// Creates a monitor for the current process. Sampling is a no-op on
    /// platforms where the process id cannot be determined.
    pub fn new() -> Self {
        let process_id = match get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Resource monitoring disabled: {}", e);
                None
            }
        };

        Self {
            system: System::new(),
            process_id,
            samples: Vec::new(),
            warmup_done: false,
            last_sample: None,
            min_interval: Duration::from_millis(250),
        }
    }

    /// Sets the minimum interval between samples.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Takes a resource usage sample and returns the most recent reading.
    ///
    /// The first call performs CPU warmup (required for accurate readings).
    /// Subsequent calls are rate-limited by `min_interval`; a rate-limited
    /// call returns the previous reading.
    pub fn sample(&mut self) -> Option<ResourceUsage> {
        let pid = self.process_id?;
        let now = Instant::now();

        let refresh_kind = ProcessRefreshKind::new().with_cpu().with_memory();

        if !self.warmup_done {
            self.system.refresh_processes_specifics(refresh_kind);
            self.warmup_done = true;
            self.last_sample = Some(now);
            return None;
        }

        let rate_limited = self
            .last_sample
            .is_some_and(|last| now.duration_since(last) < self.min_interval);

        if !rate_limited {
            self.system.refresh_processes_specifics(refresh_kind);
            self.last_sample = Some(now);

            if let Some(process) = self.system.process(pid) {
                self.samples.push(ResourceSample {
                    timestamp: now,
                    cpu_usage: process.cpu_usage(),
                    memory_mb: process.memory() / (1024 * 1024),
                });
            }
        }

        self.latest()
    }

    /// The most recent reading, if any.
    pub fn latest(&self) -> Option<ResourceUsage> {
        self.samples.last().map(ResourceUsage::from)
    }

    /// Returns a human-readable summary of resource usage.
    pub fn get_summary(&self) -> String {
        if self.samples.is_empty() {
            return "No resource data collected".to_string();
        }

        format!(
            "Resource Usage:\n  Average CPU: {:.1}%\n  Peak Memory: {} MB\n  Samples: {}",
            self.average_cpu(),
            self.peak_memory_mb(),
            self.samples.len()
        )
    }

    /// Returns all collected samples.
    pub fn get_samples(&self) -> &[ResourceSample] {
        &self.samples
    }

    /// Returns the peak memory usage in MB.
    pub fn peak_memory_mb(&self) -> u64 {
        self.samples.iter().map(|s| s.memory_mb).max().unwrap_or(0)
    }

    /// Returns the average CPU usage.
    pub fn average_cpu(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.cpu_usage).sum::<f32>() / self.samples.len() as f32
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}
