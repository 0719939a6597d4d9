//! Classification of single autoscaler snapshots.

use rollwarden_core::AutoscaleObservation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sample {
    /// No usable utilization figure.
    Unavailable,
    /// Below threshold, replicas within bounds.
    Settled { utilization: u32 },
    /// At or above threshold, or replicas outside bounds.
    Unsettled { utilization: u32, projected: u32 },
}

pub fn classify(obs: &AutoscaleObservation, threshold: u32) -> Sample {
    let utilization = match obs.peak_utilization() {
        Some(u) if obs.metrics_available => u,
        _ => return Sample::Unavailable,
    };
    let in_bounds = (obs.min_replicas..=obs.max_replicas).contains(&obs.current_replicas);
    if utilization < threshold && in_bounds {
        Sample::Settled { utilization }
    } else {
        Sample::Unsettled {
            utilization,
            projected: projected_replicas(obs, utilization, threshold),
        }
    }
}

/// Replica count the autoscaler is expected to move to:
/// `ceil(current × utilization / threshold)`, clamped to the bounds.
pub fn projected_replicas(obs: &AutoscaleObservation, utilization: u32, threshold: u32) -> u32 {
    let threshold = u64::from(threshold.max(1));
    let desired = (u64::from(obs.current_replicas) * u64::from(utilization)).div_ceil(threshold);
    let desired = u32::try_from(desired).unwrap_or(u32::MAX);
    if obs.min_replicas <= obs.max_replicas {
        desired.clamp(obs.min_replicas, obs.max_replicas)
    } else {
        desired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(current: u32, cpu: Option<u32>, mem: Option<u32>) -> AutoscaleObservation {
        AutoscaleObservation {
            current_replicas: current,
            min_replicas: 2,
            max_replicas: 10,
            cpu_utilization: cpu,
            memory_utilization: mem,
            metrics_available: true,
        }
    }

    #[test]
    fn low_utilization_in_bounds_is_settled() {
        assert_eq!(
            classify(&obs(3, Some(40), Some(55)), 80),
            Sample::Settled { utilization: 55 }
        );
    }

    #[test]
    fn high_utilization_projects_scale_up() {
        // ceil(4 × 120 / 80) = 6
        assert_eq!(
            classify(&obs(4, Some(120), None), 80),
            Sample::Unsettled { utilization: 120, projected: 6 }
        );
    }

    #[test]
    fn projection_is_clamped_to_max() {
        assert_eq!(projected_replicas(&obs(8, None, None), 300, 80), 10);
    }

    #[test]
    fn out_of_bounds_is_unsettled_even_when_quiet() {
        let sample = classify(&obs(1, Some(10), None), 80);
        assert!(matches!(sample, Sample::Unsettled { utilization: 10, projected: 2 }));
    }

    #[test]
    fn threshold_itself_is_elevated() {
        assert!(matches!(
            classify(&obs(3, Some(80), None), 80),
            Sample::Unsettled { .. }
        ));
    }

    #[test]
    fn missing_metrics_are_unavailable() {
        let mut o = obs(3, Some(10), None);
        o.metrics_available = false;
        assert_eq!(classify(&o, 80), Sample::Unavailable);
        assert_eq!(classify(&obs(3, None, None), 80), Sample::Unavailable);
    }
}
