//! Resource monitor: CPU / memory sampling and the "settle" wait used
//! between compression tiers.

use std::future::Future;
use std::time::{Duration, Instant};

use serde::Serialize;
use sysinfo::System;
use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

use crate::protocol::timeouts;

/// Point-in-time system reading
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub available_memory_mb: u64,
}

/// Source of resource samples. Implementations must be safe to call from many
/// sessions at once.
pub trait ResourceProbe: Send + Sync + 'static {
    /// Measure CPU over `window` and read available memory at the end of it
    fn sample(&self, window: Duration) -> impl Future<Output = ResourceSample> + Send;
}

/// Probe backed by `sysinfo`. Each sample uses its own `System`, so
/// concurrent samples never shorten each other's CPU window.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemProbe;

impl ResourceProbe for SystemProbe {
    async fn sample(&self, window: Duration) -> ResourceSample {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        tokio::time::sleep(window.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL)).await;
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        ResourceSample {
            cpu_percent: sys.global_cpu_usage() as f64,
            available_memory_mb: sys.available_memory() / (1024 * 1024),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MonitorError {
    #[error("system did not settle within {0:?}")]
    SettleTimeout(Duration),
}

#[derive(Clone, Debug)]
pub struct SettlePolicy {
    pub poll_interval: Duration,
    /// CPU window for each poll
    pub sample_window: Duration,
    /// CPU window for the baseline
    pub baseline_window: Duration,
    /// Absolute CPU percentage points
    pub cpu_tolerance: f64,
    /// Percent of baseline available memory
    pub memory_tolerance_pct: f64,
    /// `None` waits forever
    pub deadline: Option<Duration>,
}

impl Default for SettlePolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(timeouts::SETTLE_POLL_MS),
            sample_window: Duration::from_millis(timeouts::SETTLE_SAMPLE_MS),
            baseline_window: Duration::from_millis(timeouts::BASELINE_SAMPLE_MS),
            cpu_tolerance: 1.0,
            memory_tolerance_pct: 1.0,
            deadline: Some(Duration::from_secs(timeouts::SETTLE_SECS)),
        }
    }
}

pub fn cpu_diff(baseline: &ResourceSample, current: &ResourceSample) -> f64 {
    (current.cpu_percent - baseline.cpu_percent).abs()
}

pub fn memory_diff_pct(baseline: &ResourceSample, current: &ResourceSample) -> f64 {
    let base = baseline.available_memory_mb as f64;
    let cur = current.available_memory_mb as f64;
    if baseline.available_memory_mb == 0 {
        return if current.available_memory_mb == 0 { 0.0 } else { 100.0 };
    }
    (cur - base).abs() / base * 100.0
}

pub fn is_settled(baseline: &ResourceSample, current: &ResourceSample, policy: &SettlePolicy) -> bool {
    cpu_diff(baseline, current) < policy.cpu_tolerance
        && memory_diff_pct(baseline, current) < policy.memory_tolerance_pct
}

pub struct ResourceMonitor<P> {
    probe: P,
    policy: SettlePolicy,
}

impl<P: ResourceProbe> ResourceMonitor<P> {
    pub fn new(probe: P, policy: SettlePolicy) -> Self {
        Self { probe, policy }
    }

    pub fn policy(&self) -> &SettlePolicy {
        &self.policy
    }

    pub async fn sample(&self) -> ResourceSample {
        self.probe.sample(self.policy.sample_window).await
    }

    /// Reference reading for one GET; never re-captured between tiers
    pub async fn capture_baseline(&self) -> ResourceSample {
        self.probe.sample(self.policy.baseline_window).await
    }

    /// Poll until CPU and memory are back within tolerance of `baseline`.
    /// Returns the time spent waiting.
    pub async fn wait_settled(&self, baseline: &ResourceSample) -> Result<Duration, MonitorError> {
        let started = Instant::now();
        let poll = async {
            loop {
                tokio::time::sleep(self.policy.poll_interval).await;
                let current = self.sample().await;
                if is_settled(baseline, &current, &self.policy) {
                    return;
                }
                debug!(
                    cpu_diff = cpu_diff(baseline, &current),
                    mem_diff_pct = memory_diff_pct(baseline, &current),
                    "settling"
                );
            }
        };
        match self.policy.deadline {
            Some(limit) => timeout(limit, poll)
                .await
                .map_err(|_| MonitorError::SettleTimeout(limit))?,
            None => poll.await,
        }
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "system settled");
        Ok(started.elapsed())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays scripted samples, repeating the last one forever
    pub(crate) struct ScriptedProbe {
        samples: Mutex<VecDeque<ResourceSample>>,
    }

    impl ScriptedProbe {
        pub(crate) fn new(samples: &[ResourceSample]) -> Self {
            Self {
                samples: Mutex::new(samples.iter().copied().collect()),
            }
        }

        pub(crate) fn steady() -> Self {
            Self::new(&[sample(10.0, 4096)])
        }
    }

    impl ResourceProbe for ScriptedProbe {
        async fn sample(&self, _window: Duration) -> ResourceSample {
            let mut q = self.samples.lock();
            if q.len() > 1 {
                q.pop_front().unwrap()
            } else {
                *q.front().unwrap()
            }
        }
    }

    pub(crate) fn sample(cpu: f64, mem: u64) -> ResourceSample {
        ResourceSample {
            cpu_percent: cpu,
            available_memory_mb: mem,
        }
    }

    pub(crate) fn fast_policy(deadline: Option<Duration>) -> SettlePolicy {
        SettlePolicy {
            poll_interval: Duration::from_millis(1),
            sample_window: Duration::from_millis(1),
            baseline_window: Duration::from_millis(1),
            deadline,
            ..SettlePolicy::default()
        }
    }

    #[test]
    fn settle_thresholds() {
        let policy = SettlePolicy::default();
        let base = sample(20.0, 1000);
        assert!(is_settled(&base, &sample(20.9, 1009), &policy));
        assert!(!is_settled(&base, &sample(21.0, 1000), &policy));
        assert!(!is_settled(&base, &sample(20.0, 990), &policy));
        assert!(is_settled(&base, &sample(19.5, 991), &policy));
    }

    #[test]
    fn zero_memory_baseline() {
        assert_eq!(memory_diff_pct(&sample(0.0, 0), &sample(0.0, 0)), 0.0);
        assert_eq!(memory_diff_pct(&sample(0.0, 0), &sample(0.0, 5)), 100.0);
    }

    #[tokio::test]
    async fn waits_until_back_to_baseline() {
        let probe = ScriptedProbe::new(&[
            sample(80.0, 4096),
            sample(40.0, 3000),
            sample(10.5, 4090),
        ]);
        let monitor = ResourceMonitor::new(probe, fast_policy(Some(Duration::from_secs(5))));
        let base = sample(10.0, 4096);
        monitor.wait_settled(&base).await.unwrap();
        // The script is exhausted at the settled reading
        assert_eq!(monitor.sample().await, sample(10.5, 4090));
    }

    #[tokio::test]
    async fn deadline_surfaces_as_error() {
        let probe = ScriptedProbe::new(&[sample(95.0, 100)]);
        let limit = Duration::from_millis(30);
        let monitor = ResourceMonitor::new(probe, fast_policy(Some(limit)));
        let err = monitor.wait_settled(&sample(5.0, 4096)).await.unwrap_err();
        assert_eq!(err, MonitorError::SettleTimeout(limit));
    }

    #[tokio::test]
    async fn system_probe_reports_memory() {
        let s = SystemProbe.sample(Duration::from_millis(1)).await;
        assert!(s.available_memory_mb > 0);
        assert!(s.cpu_percent >= 0.0);
    }
}
