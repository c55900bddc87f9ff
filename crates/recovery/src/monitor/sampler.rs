//! Periodic resource sampling and anomaly detection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::resources::{SysinfoProbe, SystemProbe};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_usage_percent: f64,
    pub memory_usage_percent: f64,
    pub disk_usage_percent: f64,
    pub network_mbps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
    pub detected_at: DateTime<Utc>,
}

pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> anyhow::Result<ResourceSample>;
}

/// Samples through a [`SystemProbe`]. Network throughput is read from the
/// snapshot's `network_mbps` metric when the probe provides one.
pub struct ProbeSampler {
    probe: Arc<dyn SystemProbe>,
}

impl ProbeSampler {
    pub fn new(probe: Arc<dyn SystemProbe>) -> Self {
        Self { probe }
    }

    pub fn sysinfo() -> Self {
        Self::new(Arc::new(SysinfoProbe::default()))
    }
}

impl ResourceSampler for ProbeSampler {
    fn sample(&self) -> anyhow::Result<ResourceSample> {
        let state = self.probe.snapshot()?;
        let network_mbps = state
            .metrics
            .get("network_mbps")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        Ok(ResourceSample {
            timestamp: state.captured_at,
            cpu_usage_percent: state.cpu_usage_percent,
            memory_usage_percent: state.memory_usage_percent,
            disk_usage_percent: state.disk_usage_percent,
            network_mbps,
        })
    }
}

pub trait AnomalyDetector: Send + Sync {
    /// `history` holds the samples taken before `sample`
    fn detect(&self, sample: &ResourceSample, history: &[ResourceSample]) -> Vec<Anomaly>;
}

/// Flags samples above fixed CPU and memory thresholds
#[derive(Debug, Clone)]
pub struct ThresholdAnomalyDetector {
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
}

impl Default for ThresholdAnomalyDetector {
    fn default() -> Self {
        Self {
            cpu_threshold: 95.0,
            memory_threshold: 95.0,
        }
    }
}

impl AnomalyDetector for ThresholdAnomalyDetector {
    fn detect(&self, sample: &ResourceSample, _history: &[ResourceSample]) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();
        for (metric, value, threshold) in [
            ("cpu_usage_percent", sample.cpu_usage_percent, self.cpu_threshold),
            ("memory_usage_percent", sample.memory_usage_percent, self.memory_threshold),
        ] {
            if value > threshold {
                anomalies.push(Anomaly {
                    metric: metric.to_string(),
                    value,
                    threshold,
                    message: format!("{} at {:.1} exceeds {:.1}", metric, value, threshold),
                    detected_at: sample.timestamp,
                });
            }
        }
        anomalies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::StaticProbe;

    #[test]
    fn test_threshold_detector() {
        let detector = ThresholdAnomalyDetector::default();
        let mut sample = ResourceSample {
            timestamp: Utc::now(),
            cpu_usage_percent: 50.0,
            memory_usage_percent: 50.0,
            disk_usage_percent: 10.0,
            network_mbps: 0.0,
        };
        assert!(detector.detect(&sample, &[]).is_empty());

        sample.cpu_usage_percent = 99.0;
        let anomalies = detector.detect(&sample, &[]);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].metric, "cpu_usage_percent");
    }

    #[test]
    fn test_probe_sampler_reads_network_metric() {
        let probe = StaticProbe::healthy();
        probe.update(|s| {
            s.metrics.insert("network_mbps".into(), serde_json::json!(12.5));
        });
        let sample = ProbeSampler::new(Arc::new(probe)).sample().expect("static sample");
        assert_eq!(sample.network_mbps, 12.5);
        assert_eq!(sample.cpu_usage_percent, 20.0);
    }
}
