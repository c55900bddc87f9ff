//! Execution monitor.
//!
//! A session lives from `start_monitoring` to `complete_monitoring`. While
//! active it collects resource samples from a background task plus the
//! action and checkpoint outcomes reported by the executor. Completion
//! freezes the session into a [`MonitoringReport`].

pub mod sampler;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::events::{EventBus, ExecutionEvent};
use crate::history::BoundedHistory;
use crate::model::{ActionExecutionResult, ExecutionResult, Strategy};

pub use sampler::{
    Anomaly, AnomalyDetector, ProbeSampler, ResourceSample, ResourceSampler, ThresholdAnomalyDetector,
};

#[derive(Debug, Clone, Default)]
pub struct MonitoringOptions {
    /// Zero disables periodic sampling
    pub sampling_interval: Duration,
}

impl MonitoringOptions {
    pub fn with_interval(sampling_interval: Duration) -> Self {
        Self { sampling_interval }
    }
}

struct MonitoringSession {
    execution_id: Uuid,
    strategy_id: String,
    action_total: usize,
    started_at: DateTime<Utc>,
    samples: Vec<ResourceSample>,
    action_durations: Vec<(String, Duration)>,
    overhead_durations: Vec<Duration>,
    actions_succeeded: u32,
    actions_failed: u32,
    fallbacks_used: u32,
    checkpoints_passed: u32,
    checkpoints_failed: u32,
    anomalies: Vec<Anomaly>,
    cancel: CancellationToken,
    sampler_task: Option<JoinHandle<()>>,
}

impl MonitoringSession {
    fn push_sample(&mut self, sample: ResourceSample, max_samples: usize) {
        if self.samples.len() >= max_samples.max(1) {
            self.samples.remove(0);
        }
        self.samples.push(sample);
    }

    fn snapshot(&self) -> MonitoringSnapshot {
        MonitoringSnapshot {
            execution_id: self.execution_id,
            strategy_id: self.strategy_id.clone(),
            started_at: self.started_at,
            action_total: self.action_total,
            sample_count: self.samples.len(),
            latest_sample: self.samples.last().cloned(),
            actions_succeeded: self.actions_succeeded,
            actions_failed: self.actions_failed,
            checkpoints_passed: self.checkpoints_passed,
            checkpoints_failed: self.checkpoints_failed,
            anomalies: self.anomalies.clone(),
        }
    }
}

/// Live view of an active session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringSnapshot {
    pub execution_id: Uuid,
    pub strategy_id: String,
    pub started_at: DateTime<Utc>,
    pub action_total: usize,
    pub sample_count: usize,
    pub latest_sample: Option<ResourceSample>,
    pub actions_succeeded: u32,
    pub actions_failed: u32,
    pub checkpoints_passed: u32,
    pub checkpoints_failed: u32,
    pub anomalies: Vec<Anomaly>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeakUsage {
    pub cpu_usage_percent: f64,
    pub memory_usage_percent: f64,
    pub disk_usage_percent: f64,
    pub network_mbps: f64,
}

/// Frozen summary of a completed session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringReport {
    pub id: String,
    pub execution_id: Uuid,
    pub strategy_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub execution_successful: bool,
    pub summary: String,
    pub sample_count: usize,
    pub peak: PeakUsage,
    pub average_cpu_usage_percent: f64,
    pub average_memory_usage_percent: f64,
    pub total_action_duration: Duration,
    pub total_overhead_duration: Duration,
    pub actions_succeeded: u32,
    pub actions_failed: u32,
    pub action_success_rate: f64,
    pub fallbacks_used: u32,
    pub checkpoints_passed: u32,
    pub checkpoints_failed: u32,
    pub anomalies: Vec<Anomaly>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum MonitoringData {
    Active(MonitoringSnapshot),
    Completed(Box<MonitoringReport>),
}

pub struct ExecutionMonitor {
    sessions: DashMap<Uuid, Arc<Mutex<MonitoringSession>>>,
    reports: BoundedHistory<MonitoringReport>,
    sampler: Arc<dyn ResourceSampler>,
    detector: Arc<dyn AnomalyDetector>,
    config: MonitorConfig,
    events: EventBus,
}

impl ExecutionMonitor {
    pub fn new(
        config: MonitorConfig,
        sampler: Arc<dyn ResourceSampler>,
        detector: Arc<dyn AnomalyDetector>,
        events: EventBus,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            reports: BoundedHistory::new(config.history_size),
            sampler,
            detector,
            config,
            events,
        }
    }

    /// Monitor with the sysinfo sampler and threshold detector from `config`
    pub fn with_defaults(config: MonitorConfig, events: EventBus) -> Self {
        let detector = ThresholdAnomalyDetector {
            cpu_threshold: config.cpu_anomaly_threshold,
            memory_threshold: config.memory_anomaly_threshold,
        };
        Self::new(config, Arc::new(ProbeSampler::sysinfo()), Arc::new(detector), events)
    }

    /// Open a session. Must be called within a tokio runtime when sampling
    /// is enabled.
    pub fn start_monitoring(&self, execution_id: Uuid, strategy: &Strategy, options: MonitoringOptions) {
        if let Some((_, stale)) = self.sessions.remove(&execution_id) {
            warn!(execution_id = %execution_id, "Replacing existing monitoring session");
            stop_sampler(&mut *stale.lock());
        }

        let cancel = CancellationToken::new();
        let session = Arc::new(Mutex::new(MonitoringSession {
            execution_id,
            strategy_id: strategy.id.clone(),
            action_total: strategy.actions.len(),
            started_at: Utc::now(),
            samples: Vec::new(),
            action_durations: Vec::new(),
            overhead_durations: Vec::new(),
            actions_succeeded: 0,
            actions_failed: 0,
            fallbacks_used: 0,
            checkpoints_passed: 0,
            checkpoints_failed: 0,
            anomalies: Vec::new(),
            cancel: cancel.clone(),
            sampler_task: None,
        }));

        if !options.sampling_interval.is_zero() {
            let handle = self.spawn_sampler(execution_id, session.clone(), cancel, options.sampling_interval);
            session.lock().sampler_task = Some(handle);
        }
        self.sessions.insert(execution_id, session);

        info!(
            execution_id = %execution_id,
            strategy_id = %strategy.id,
            interval_ms = options.sampling_interval.as_millis() as u64,
            "Monitoring started"
        );
        self.events.publish(ExecutionEvent::MonitoringStarted {
            execution_id,
            interval_ms: options.sampling_interval.as_millis() as u64,
        });
    }

    fn spawn_sampler(
        &self,
        execution_id: Uuid,
        session: Arc<Mutex<MonitoringSession>>,
        cancel: CancellationToken,
        interval: Duration,
    ) -> JoinHandle<()> {
        let sampler = self.sampler.clone();
        let detector = self.detector.clone();
        let events = self.events.clone();
        let max_samples = self.config.max_samples;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                // sysinfo refreshes block, keep them off the runtime workers
                let blocking = sampler.clone();
                let sample = match tokio::task::spawn_blocking(move || blocking.sample()).await {
                    Ok(Ok(sample)) => sample,
                    Ok(Err(e)) => {
                        debug!(execution_id = %execution_id, "Resource sampling failed: {}", e);
                        continue;
                    }
                    Err(e) => {
                        warn!(execution_id = %execution_id, "Resource sampling task failed: {}", e);
                        continue;
                    }
                };
                let anomalies = {
                    let mut guard = session.lock();
                    if cancel.is_cancelled() {
                        break;
                    }
                    let found = detector.detect(&sample, &guard.samples);
                    guard.anomalies.extend(found.iter().cloned());
                    guard.push_sample(sample.clone(), max_samples);
                    found
                };
                events.publish(ExecutionEvent::MonitoringUpdate {
                    execution_id,
                    cpu_usage_percent: sample.cpu_usage_percent,
                    memory_usage_percent: sample.memory_usage_percent,
                });
                for anomaly in anomalies {
                    warn!(
                        execution_id = %execution_id,
                        metric = %anomaly.metric,
                        value = anomaly.value,
                        "Resource anomaly detected"
                    );
                    events.publish(ExecutionEvent::MonitoringAnomaly {
                        execution_id,
                        metric: anomaly.metric,
                        value: anomaly.value,
                        threshold: anomaly.threshold,
                        message: anomaly.message,
                    });
                }
            }
            debug!(execution_id = %execution_id, "Resource sampler stopped");
        })
    }

    fn with_session<F: FnOnce(&mut MonitoringSession)>(&self, execution_id: Uuid, f: F) {
        let Some(session) = self.sessions.get(&execution_id).map(|s| s.clone()) else {
            debug!(execution_id = %execution_id, "No active monitoring session");
            return;
        };
        f(&mut *session.lock());
    }

    pub fn record_action_execution(&self, execution_id: Uuid, result: &ActionExecutionResult) {
        self.with_session(execution_id, |s| {
            s.action_durations.push((result.action_id.clone(), result.duration));
            if result.successful {
                s.actions_succeeded += 1;
            } else {
                s.actions_failed += 1;
            }
            if result.fallback_used.is_some() {
                s.fallbacks_used += 1;
            }
        });
    }

    pub fn record_checkpoint_verification(&self, execution_id: Uuid, checkpoint: &str, verified: bool) {
        self.with_session(execution_id, |s| {
            if verified {
                s.checkpoints_passed += 1;
            } else {
                debug!(execution_id = %s.execution_id, checkpoint, "Recorded failed checkpoint");
                s.checkpoints_failed += 1;
            }
        });
    }

    pub fn record_overhead_duration(&self, execution_id: Uuid, duration: Duration) {
        self.with_session(execution_id, |s| s.overhead_durations.push(duration));
    }

    /// Close a session and freeze its report. Returns `None` if the session
    /// is unknown or was already completed.
    pub fn complete_monitoring(&self, execution_id: Uuid, result: &ExecutionResult) -> Option<MonitoringReport> {
        let (_, session) = self.sessions.remove(&execution_id)?;
        let report = {
            let mut session = session.lock();
            stop_sampler(&mut session);
            self.build_report(&session, result)
        };
        self.reports.push(report.clone());

        info!(
            execution_id = %execution_id,
            report_id = %report.id,
            samples = report.sample_count,
            recommendations = report.recommendations.len(),
            "Monitoring completed"
        );
        self.events.publish(ExecutionEvent::MonitoringCompleted {
            execution_id,
            report_id: report.id.clone(),
        });
        Some(report)
    }

    fn build_report(&self, session: &MonitoringSession, result: &ExecutionResult) -> MonitoringReport {
        let mut peak = PeakUsage::default();
        for s in &session.samples {
            peak.cpu_usage_percent = peak.cpu_usage_percent.max(s.cpu_usage_percent);
            peak.memory_usage_percent = peak.memory_usage_percent.max(s.memory_usage_percent);
            peak.disk_usage_percent = peak.disk_usage_percent.max(s.disk_usage_percent);
            peak.network_mbps = peak.network_mbps.max(s.network_mbps);
        }
        let mean = |f: fn(&ResourceSample) -> f64| {
            if session.samples.is_empty() {
                0.0
            } else {
                session.samples.iter().map(f).sum::<f64>() / session.samples.len() as f64
            }
        };
        let attempted = session.actions_succeeded + session.actions_failed;
        let action_success_rate = if attempted == 0 {
            1.0
        } else {
            f64::from(session.actions_succeeded) / f64::from(attempted)
        };

        let mut recommendations = Vec::new();
        if peak.cpu_usage_percent > self.config.cpu_recommendation_threshold {
            recommendations.push(format!(
                "CPU peaked at {:.1}%; schedule resource-heavy actions separately or add capacity",
                peak.cpu_usage_percent
            ));
        }
        if peak.memory_usage_percent > self.config.memory_recommendation_threshold {
            recommendations.push(format!(
                "Memory peaked at {:.1}%; review memory-intensive actions",
                peak.memory_usage_percent
            ));
        }
        if attempted > 0 && action_success_rate < self.config.min_action_success_rate {
            recommendations.push(format!(
                "Action success rate {:.0}% is low; review failing actions and their fallbacks",
                action_success_rate * 100.0
            ));
        }
        if session.checkpoints_failed > 0 {
            recommendations.push(format!(
                "{} checkpoint verification(s) failed; review checkpoint criteria",
                session.checkpoints_failed
            ));
        }
        if !session.anomalies.is_empty() {
            recommendations.push(format!(
                "{} resource anomaly(ies) detected during execution",
                session.anomalies.len()
            ));
        }

        let completed_at = Utc::now();
        let summary = format!(
            "Execution {} {}: {}/{} actions succeeded, {} checkpoint(s) passed, {} failed",
            session.execution_id,
            if result.successful { "succeeded" } else { "failed" },
            session.actions_succeeded,
            session.action_total,
            session.checkpoints_passed,
            session.checkpoints_failed,
        );

        MonitoringReport {
            id: format!("report-{}", Uuid::new_v4()),
            execution_id: session.execution_id,
            strategy_id: session.strategy_id.clone(),
            started_at: session.started_at,
            completed_at,
            execution_successful: result.successful,
            summary,
            sample_count: session.samples.len(),
            peak,
            average_cpu_usage_percent: mean(|s| s.cpu_usage_percent),
            average_memory_usage_percent: mean(|s| s.memory_usage_percent),
            total_action_duration: session.action_durations.iter().map(|(_, d)| *d).sum(),
            total_overhead_duration: session.overhead_durations.iter().sum(),
            actions_succeeded: session.actions_succeeded,
            actions_failed: session.actions_failed,
            action_success_rate,
            fallbacks_used: session.fallbacks_used,
            checkpoints_passed: session.checkpoints_passed,
            checkpoints_failed: session.checkpoints_failed,
            anomalies: session.anomalies.clone(),
            recommendations,
        }
    }

    pub fn get_monitoring_data(&self, execution_id: Uuid) -> Option<MonitoringData> {
        if let Some(session) = self.sessions.get(&execution_id).map(|s| s.clone()) {
            return Some(MonitoringData::Active(session.lock().snapshot()));
        }
        self.reports
            .find(|r| r.execution_id == execution_id)
            .map(|r| MonitoringData::Completed(Box::new(r)))
    }

    pub fn get_report(&self, report_id: &str) -> Option<MonitoringReport> {
        self.reports.find(|r| r.id == report_id)
    }

    pub fn active_sessions(&self) -> Vec<Uuid> {
        self.sessions.iter().map(|e| *e.key()).collect()
    }
}

/// Cancel the session's sampler; the handle is taken so this happens once
fn stop_sampler(session: &mut MonitoringSession) {
    if let Some(handle) = session.sampler_task.take() {
        session.cancel.cancel();
        drop(handle);
    }
}
