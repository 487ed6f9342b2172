//! Failure predicates applied to observed execution units.

use crate::cluster::ExecutionUnit;

/// Restarts tolerated before a container counts as crash-looping.
pub const MAX_RESTARTS: u32 = 2;

const UNSCHEDULABLE: &str = "Unschedulable";
const IMAGE_PULL_FAILURES: [&str; 2] = ["ImagePullBackOff", "ErrImagePull"];

/// Describe why `unit` can no longer produce a result, if it cannot.
pub fn unit_failure(unit: &ExecutionUnit) -> Option<String> {
    if let Some(condition) = unit
        .conditions
        .iter()
        .find(|condition| condition.reason == UNSCHEDULABLE)
    {
        return Some(format!(
            "unit {} can't be scheduled: {}",
            unit.name, condition.message
        ));
    }

    for container in &unit.containers {
        if container.restart_count > MAX_RESTARTS {
            return Some(format!(
                "container {} in unit {} has restarted {} times",
                container.name, unit.name, container.restart_count
            ));
        }

        if let Some(reason) = container
            .waiting_reason
            .as_deref()
            .filter(|reason| IMAGE_PULL_FAILURES.contains(reason))
        {
            return Some(format!(
                "container {} in unit {} is in state {reason}",
                container.name, unit.name
            ));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ContainerState, UnitCondition};

    fn unit(containers: Vec<ContainerState>) -> ExecutionUnit {
        ExecutionUnit {
            name: "sonde-e2e-job-abc".into(),
            containers,
            ..Default::default()
        }
    }

    fn container(restarts: u32, waiting: Option<&str>) -> ContainerState {
        ContainerState {
            name: "e2e".into(),
            restart_count: restarts,
            waiting_reason: waiting.map(str::to_string),
        }
    }

    #[test]
    fn healthy_unit_passes() {
        assert_eq!(unit_failure(&unit(vec![container(0, None)])), None);
        assert_eq!(
            unit_failure(&unit(vec![container(MAX_RESTARTS, None)])),
            None
        );
        assert_eq!(
            unit_failure(&unit(vec![container(0, Some("ContainerCreating"))])),
            None
        );
    }

    #[test]
    fn unschedulable_condition_fails() {
        let mut unit = unit(Vec::new());
        unit.conditions.push(UnitCondition {
            reason: "Unschedulable".into(),
            message: "0/3 nodes are available".into(),
        });
        let reason = unit_failure(&unit).unwrap();
        assert!(reason.contains("0/3 nodes are available"));
    }

    #[test]
    fn restart_threshold_fails() {
        let reason =
            unit_failure(&unit(vec![container(MAX_RESTARTS + 1, None)]))
                .unwrap();
        assert!(reason.contains("restarted 3 times"));
    }

    #[test]
    fn image_pull_failures_fail() {
        for waiting in IMAGE_PULL_FAILURES {
            let reason =
                unit_failure(&unit(vec![container(0, Some(waiting))])).unwrap();
            assert!(reason.contains(waiting));
        }
    }
}
