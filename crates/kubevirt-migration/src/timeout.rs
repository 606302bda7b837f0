//! Target pod timeouts
//!
//! Two independent timers run against a Pending target pod, both measured
//! from its creation: one for pods the scheduler has rejected, and a
//! catch-all for pods that stay Pending for any reason. Whichever expires
//! first causes the pod to be deleted so that the Pending path can retry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use kubevirt_common::crd::VirtualMachineInstanceMigration;
use kubevirt_common::labels::{
    MIGRATION_PENDING_POD_TIMEOUT_ANNOTATION, MIGRATION_UNSCHEDULABLE_POD_TIMEOUT_ANNOTATION,
};

use crate::pod;

/// Default timeout for a target pod the scheduler cannot place
pub const DEFAULT_UNSCHEDULABLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default timeout for a target pod stuck Pending for any reason
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Which timer expired
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Pod reported Unschedulable
    Unschedulable,
    /// Pod stayed Pending
    Pending,
}

impl TimeoutKind {
    /// Metric label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unschedulable => "unschedulable",
            Self::Pending => "pending",
        }
    }
}

/// Result of evaluating the timers against a target pod
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutCheck {
    /// A timer expired; the pod must go
    Expired(TimeoutKind),
    /// Nothing expired yet; check again after this long
    Remaining(Duration),
    /// The pod is past Pending, timers do not apply
    NotApplicable,
}

/// Timeout from an annotation, falling back to `default`
///
/// Values that do not parse or are not positive are ignored.
fn timeout_from(
    migration: &VirtualMachineInstanceMigration,
    annotation: &str,
    default: Duration,
) -> Duration {
    migration
        .annotations()
        .get(annotation)
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|secs| *secs > 0)
        .map(|secs| Duration::from_secs(secs as u64))
        .unwrap_or(default)
}

/// Effective unschedulable timeout for a migration
pub fn unschedulable_timeout(migration: &VirtualMachineInstanceMigration) -> Duration {
    timeout_from(
        migration,
        MIGRATION_UNSCHEDULABLE_POD_TIMEOUT_ANNOTATION,
        DEFAULT_UNSCHEDULABLE_TIMEOUT,
    )
}

/// Effective catch-all pending timeout for a migration
pub fn pending_timeout(migration: &VirtualMachineInstanceMigration) -> Duration {
    timeout_from(
        migration,
        MIGRATION_PENDING_POD_TIMEOUT_ANNOTATION,
        DEFAULT_PENDING_TIMEOUT,
    )
}

/// Evaluate both timers for `target` at `now`
pub fn evaluate(
    target: &Pod,
    migration: &VirtualMachineInstanceMigration,
    now: DateTime<Utc>,
) -> TimeoutCheck {
    if !pod::is_pending(target) {
        return TimeoutCheck::NotApplicable;
    }
    let Some(created) = pod::created_at(target) else {
        return TimeoutCheck::NotApplicable;
    };
    let elapsed = (now - created).to_std().unwrap_or(Duration::ZERO);

    let mut remaining = pending_timeout(migration).saturating_sub(elapsed);
    if remaining.is_zero() {
        return TimeoutCheck::Expired(TimeoutKind::Pending);
    }
    if pod::is_unschedulable(target) {
        let left = unschedulable_timeout(migration).saturating_sub(elapsed);
        if left.is_zero() {
            return TimeoutCheck::Expired(TimeoutKind::Unschedulable);
        }
        remaining = remaining.min(left);
    }
    TimeoutCheck::Remaining(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::testing::{target_pod, with_unschedulable};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kubevirt_common::crd::VirtualMachineInstanceMigrationSpec;
    use rstest::rstest;
    use std::collections::BTreeMap;

    fn migration(annotations: &[(&str, &str)]) -> VirtualMachineInstanceMigration {
        let mut m = VirtualMachineInstanceMigration::new(
            "testmigration",
            VirtualMachineInstanceMigrationSpec {
                vmi_name: "testvmi".to_string(),
            },
        );
        m.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        );
        m
    }

    fn pod_aged(seconds: i64, unschedulable: bool, now: DateTime<Utc>) -> Pod {
        let mut pod = target_pod("target", "vmi-uid", "testmigration", "Pending");
        pod.metadata.creation_timestamp = Some(Time(now - chrono::Duration::seconds(seconds)));
        if unschedulable {
            with_unschedulable(pod)
        } else {
            pod
        }
    }

    mod unschedulable {
        use super::*;

        /// Story: an unplaceable pod is reaped at the unschedulable deadline
        ///
        /// With the default 300s, a pod aged 299s is left alone and one aged
        /// exactly 300s is deleted.
        #[rstest]
        #[case(299, None)]
        #[case(300, Some(TimeoutKind::Unschedulable))]
        #[case(600, Some(TimeoutKind::Unschedulable))]
        fn story_default_unschedulable_deadline(
            #[case] age: i64,
            #[case] expected: Option<TimeoutKind>,
        ) {
            let now = Utc::now();
            let check = evaluate(&pod_aged(age, true, now), &migration(&[]), now);
            match expected {
                Some(kind) => assert_eq!(check, TimeoutCheck::Expired(kind)),
                None => assert!(matches!(check, TimeoutCheck::Remaining(_))),
            }
        }

        #[rstest]
        #[case("30", 29, false)]
        #[case("30", 30, true)]
        #[case("0", 299, false)]
        #[case("-5", 300, true)]
        #[case("soon", 300, true)]
        fn annotation_overrides_only_when_positive(
            #[case] value: &str,
            #[case] age: i64,
            #[case] expired: bool,
        ) {
            let now = Utc::now();
            let m = migration(&[(MIGRATION_UNSCHEDULABLE_POD_TIMEOUT_ANNOTATION, value)]);
            let check = evaluate(&pod_aged(age, true, now), &m, now);
            assert_eq!(
                check == TimeoutCheck::Expired(TimeoutKind::Unschedulable),
                expired
            );
        }

        #[test]
        fn remaining_time_reports_nearest_deadline() {
            let now = Utc::now();
            let check = evaluate(&pod_aged(100, true, now), &migration(&[]), now);
            assert_eq!(check, TimeoutCheck::Remaining(Duration::from_secs(200)));
        }
    }

    mod pending {
        use super::*;

        /// Story: a schedulable pod stuck Pending is reaped by the catch-all
        #[rstest]
        #[case(899, false)]
        #[case(900, true)]
        fn story_catch_all_pending_deadline(#[case] age: i64, #[case] expired: bool) {
            let now = Utc::now();
            let check = evaluate(&pod_aged(age, false, now), &migration(&[]), now);
            assert_eq!(check == TimeoutCheck::Expired(TimeoutKind::Pending), expired);
        }

        #[test]
        fn scheduled_pod_is_not_subject_to_unschedulable_timer() {
            let now = Utc::now();
            let check = evaluate(&pod_aged(400, false, now), &migration(&[]), now);
            assert_eq!(check, TimeoutCheck::Remaining(Duration::from_secs(500)));
        }

        /// Story: the two timers race and the shorter one wins
        #[test]
        fn story_shorter_pending_timer_wins_race() {
            let now = Utc::now();
            let m = migration(&[(MIGRATION_PENDING_POD_TIMEOUT_ANNOTATION, "60")]);
            let check = evaluate(&pod_aged(60, true, now), &m, now);
            assert_eq!(check, TimeoutCheck::Expired(TimeoutKind::Pending));
        }

        #[test]
        fn running_pod_is_exempt() {
            let now = Utc::now();
            let mut pod = pod_aged(10_000, false, now);
            pod.status.as_mut().unwrap().phase = Some("Running".to_string());
            assert_eq!(evaluate(&pod, &migration(&[]), now), TimeoutCheck::NotApplicable);
        }
    }
}
