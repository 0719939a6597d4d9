//! Autoscale monitor — samples autoscaler snapshots over a confirmation
//! window.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use rollwarden_core::config::{AutoscaleConfig, RetryConfig};
use rollwarden_core::{
    AutoscaleObservation, CancelToken, ControlError, PollTracker, RetryError, WorkloadControl,
    WorkloadId, retry_call,
};

use crate::assess::{Sample, classify};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum AutoscaleVerdict {
    Stable {
        utilization: u32,
        replicas: u32,
    },
    Elevated {
        utilization: u32,
        projected_replicas: u32,
    },
    /// Soft: metrics never showed up, or vanished past the grace period.
    MetricsUnavailable {
        #[serde(with = "rollwarden_core::config::duration_str")]
        waited: Duration,
    },
}

#[derive(Debug, Clone, Error)]
pub enum AutoscaleError {
    #[error("autoscale monitoring cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct AutoscaleSettings {
    pub scale_up_threshold: u32,
    pub sample_interval: Duration,
    pub window: Duration,
    pub metrics_grace: Duration,
    pub stable_samples: u32,
    pub poll_retries: u32,
    pub poll_backoff: Duration,
}

impl AutoscaleSettings {
    pub fn from_config(autoscale: &AutoscaleConfig, retry: &RetryConfig) -> Self {
        Self {
            scale_up_threshold: autoscale.scale_up_threshold,
            sample_interval: autoscale.sample_interval,
            window: autoscale.window,
            metrics_grace: autoscale.metrics_grace,
            stable_samples: autoscale.stable_samples,
            poll_retries: retry.poll_retries,
            poll_backoff: retry.poll_backoff,
        }
    }
}

pub struct AutoscaleMonitor {
    control: Arc<dyn WorkloadControl>,
    settings: AutoscaleSettings,
}

impl AutoscaleMonitor {
    pub fn new(control: Arc<dyn WorkloadControl>, settings: AutoscaleSettings) -> Self {
        Self { control, settings }
    }

    async fn observe(
        &self,
        id: &WorkloadId,
        cancel: &mut CancelToken,
    ) -> Result<Option<AutoscaleObservation>, AutoscaleError> {
        let mut tracker = PollTracker::new(self.settings.poll_retries, self.settings.poll_backoff);
        let control = &self.control;
        match retry_call(&mut tracker, cancel, ControlError::is_transient, || {
            control.get_autoscale_observation(id)
        })
        .await
        {
            Ok(obs) => Ok(Some(obs)),
            Err(RetryError::Cancelled) => Err(AutoscaleError::Cancelled),
            // An unreadable autoscaler is indistinguishable from missing
            // metrics, and just as soft.
            Err(RetryError::Exhausted(e)) => {
                warn!(workload = %id, error = %e, "autoscaler observation unavailable");
                Ok(None)
            }
        }
    }

    /// Sample until the autoscaler is confirmed stable, metrics stay
    /// missing past the grace period, or the window closes.
    pub async fn confirm(
        &self,
        id: &WorkloadId,
        cancel: &mut CancelToken,
    ) -> Result<AutoscaleVerdict, AutoscaleError> {
        let s = &self.settings;
        let started = Instant::now();
        let window_end = started + s.window;
        let mut consecutive_settled = 0u32;
        let mut last: Option<(Sample, u32)> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(AutoscaleError::Cancelled);
            }

            let obs = self.observe(id, cancel).await?;
            let sample = obs
                .as_ref()
                .map(|o| classify(o, s.scale_up_threshold))
                .unwrap_or(Sample::Unavailable);
            let replicas = obs.as_ref().map(|o| o.current_replicas).unwrap_or(0);

            match sample {
                Sample::Unavailable => {
                    consecutive_settled = 0;
                    let waited = started.elapsed();
                    if waited >= s.metrics_grace {
                        warn!(workload = %id, ?waited, "metrics still unavailable past grace period");
                        return Ok(AutoscaleVerdict::MetricsUnavailable { waited });
                    }
                    debug!(workload = %id, ?waited, "metrics not yet available");
                }
                Sample::Settled { utilization } => {
                    consecutive_settled += 1;
                    last = Some((sample, replicas));
                    debug!(workload = %id, utilization, replicas, consecutive_settled, "autoscaler settled");
                    if consecutive_settled >= s.stable_samples {
                        info!(workload = %id, utilization, replicas, "autoscaler stable");
                        return Ok(AutoscaleVerdict::Stable {
                            utilization,
                            replicas,
                        });
                    }
                }
                Sample::Unsettled {
                    utilization,
                    projected,
                } => {
                    consecutive_settled = 0;
                    last = Some((sample, replicas));
                    debug!(workload = %id, utilization, replicas, projected, "autoscaler not settled");
                }
            }

            let now = Instant::now();
            if now >= window_end {
                return Ok(self.close_window(id, last, started.elapsed()));
            }
            let wait = s.sample_interval.min(window_end - now);
            if !cancel.sleep(wait).await {
                return Err(AutoscaleError::Cancelled);
            }
        }
    }

    fn close_window(
        &self,
        id: &WorkloadId,
        last: Option<(Sample, u32)>,
        waited: Duration,
    ) -> AutoscaleVerdict {
        match last {
            Some((Sample::Settled { utilization }, replicas)) => {
                info!(workload = %id, utilization, replicas, "autoscaler settled at window end");
                AutoscaleVerdict::Stable {
                    utilization,
                    replicas,
                }
            }
            Some((
                Sample::Unsettled {
                    utilization,
                    projected,
                },
                replicas,
            )) => {
                warn!(
                    workload = %id,
                    utilization,
                    threshold = self.settings.scale_up_threshold,
                    replicas,
                    projected,
                    "utilization still elevated at window end"
                );
                AutoscaleVerdict::Elevated {
                    utilization,
                    projected_replicas: projected,
                }
            }
            Some((Sample::Unavailable, _)) | None => {
                warn!(workload = %id, ?waited, "no metrics within confirmation window");
                AutoscaleVerdict::MetricsUnavailable { waited }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollwarden_core::sim::SimulatedCluster;

    fn settings() -> AutoscaleSettings {
        AutoscaleSettings {
            scale_up_threshold: 80,
            sample_interval: Duration::from_secs(15),
            window: Duration::from_secs(120),
            metrics_grace: Duration::from_secs(60),
            stable_samples: 3,
            poll_retries: 2,
            poll_backoff: Duration::from_millis(500),
        }
    }

    fn obs(cpu: Option<u32>, available: bool) -> AutoscaleObservation {
        AutoscaleObservation {
            current_replicas: 3,
            min_replicas: 2,
            max_replicas: 6,
            cpu_utilization: cpu,
            memory_utilization: None,
            metrics_available: available,
        }
    }

    fn id() -> WorkloadId {
        WorkloadId::new("web", "app")
    }

    async fn confirm(sim: Arc<SimulatedCluster>, settings: AutoscaleSettings) -> AutoscaleVerdict {
        AutoscaleMonitor::new(sim, settings)
            .confirm(&id(), &mut CancelToken::never())
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn stable_after_consecutive_settled_samples() {
        let sim = Arc::new(SimulatedCluster::new());
        sim.push_autoscale(obs(Some(35), true));

        let started = Instant::now();
        let verdict = confirm(sim, settings()).await;
        assert_eq!(verdict, AutoscaleVerdict::Stable { utilization: 35, replicas: 3 });
        // Three samples, two intervals.
        assert!(started.elapsed() < Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn warm_up_within_grace_is_tolerated() {
        let sim = Arc::new(SimulatedCluster::new());
        sim.push_autoscale(obs(None, false));
        sim.push_autoscale(obs(None, false));
        sim.push_autoscale(obs(Some(40), true));

        let verdict = confirm(sim, settings()).await;
        assert_eq!(verdict, AutoscaleVerdict::Stable { utilization: 40, replicas: 3 });
    }

    #[tokio::test(start_paused = true)]
    async fn metrics_missing_past_grace_is_soft_verdict() {
        let sim = Arc::new(SimulatedCluster::new());
        sim.push_autoscale(obs(None, false));

        let started = Instant::now();
        let verdict = confirm(sim, settings()).await;
        assert!(matches!(verdict, AutoscaleVerdict::MetricsUnavailable { waited } if waited >= Duration::from_secs(60)));
        assert!(started.elapsed() < settings().window);
    }

    #[tokio::test(start_paused = true)]
    async fn window_closing_inside_grace_reports_unavailable() {
        let sim = Arc::new(SimulatedCluster::new());
        sim.push_autoscale(obs(None, false));
        let mut s = settings();
        s.window = Duration::from_secs(30);

        let verdict = confirm(sim, s).await;
        assert!(matches!(verdict, AutoscaleVerdict::MetricsUnavailable { waited } if waited < s.metrics_grace));
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_load_is_elevated_with_projection() {
        let sim = Arc::new(SimulatedCluster::new());
        sim.push_autoscale(obs(Some(95), true));

        let verdict = confirm(sim, settings()).await;
        // ceil(3 × 95 / 80) = 4
        assert_eq!(
            verdict,
            AutoscaleVerdict::Elevated { utilization: 95, projected_replicas: 4 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn spike_that_settles_is_stable() {
        let sim = Arc::new(SimulatedCluster::new());
        sim.push_autoscale(obs(Some(130), true));
        sim.push_autoscale(obs(Some(90), true));
        sim.push_autoscale(obs(Some(50), true));

        let verdict = confirm(sim, settings()).await;
        assert_eq!(verdict, AutoscaleVerdict::Stable { utilization: 50, replicas: 3 });
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_autoscaler_counts_as_missing_metrics() {
        let sim = Arc::new(SimulatedCluster::new());
        sim.fail_autoscale_reads(1000);

        let verdict = confirm(sim, settings()).await;
        assert!(matches!(verdict, AutoscaleVerdict::MetricsUnavailable { .. }));
    }

    #[test]
    fn verdict_serializes_tagged() {
        let json = serde_json::to_value(AutoscaleVerdict::MetricsUnavailable {
            waited: Duration::from_secs(90),
        })
        .unwrap();
        assert_eq!(json["verdict"], "metrics_unavailable");
        assert_eq!(json["waited"], "90s");
    }
}
