//! Migration policy matching
//!
//! A policy fits a VMI when both of its selectors are subsets of the VMI's
//! and its namespace's labels. The most specific fitting policy wins, where
//! the VMI selector size is compared before the namespace selector size.

use std::collections::BTreeMap;

use kube::ResourceExt;

use kubevirt_common::crd::{MigrationConfiguration, MigrationPolicy, MigrationPolicySpec};

/// How specific a fitting policy is
///
/// Ordered so that any VMI label count outranks any namespace label count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Specificity {
    vmi_labels: usize,
    namespace_labels: usize,
}

fn selector_fits(
    selector: Option<&BTreeMap<String, String>>,
    labels: &BTreeMap<String, String>,
) -> Option<usize> {
    let Some(selector) = selector else {
        return Some(0);
    };
    selector
        .iter()
        .all(|(k, v)| labels.get(k) == Some(v))
        .then_some(selector.len())
}

fn specificity(
    policy: &MigrationPolicySpec,
    vmi_labels: &BTreeMap<String, String>,
    namespace_labels: &BTreeMap<String, String>,
) -> Option<Specificity> {
    let selectors = &policy.selectors;
    Some(Specificity {
        vmi_labels: selector_fits(selectors.virtual_machine_instance_selector.as_ref(), vmi_labels)?,
        namespace_labels: selector_fits(selectors.namespace_selector.as_ref(), namespace_labels)?,
    })
}

/// Pick the policy that applies to a VMI
///
/// Returns None when no policy fits. Equal specificity resolves to the
/// lexicographically smallest name, independent of input order.
pub fn match_policy<'a, P>(
    policies: impl IntoIterator<Item = &'a P>,
    vmi_labels: &BTreeMap<String, String>,
    namespace_labels: &BTreeMap<String, String>,
) -> Option<&'a P>
where
    P: AsRef<MigrationPolicy> + 'a,
{
    policies
        .into_iter()
        .filter_map(|p| {
            specificity(&p.as_ref().spec, vmi_labels, namespace_labels).map(|s| (s, p))
        })
        .max_by(|(sa, pa), (sb, pb)| {
            sa.cmp(sb)
                .then_with(|| pb.as_ref().name_any().cmp(&pa.as_ref().name_any()))
        })
        .map(|(_, p)| p)
}

/// Overlay a policy's overrides onto a configuration
///
/// Only fields the policy sets are written. Returns whether the policy set
/// anything, which decides if its name is recorded on the VMI.
pub fn apply_policy(policy: &MigrationPolicySpec, config: &mut MigrationConfiguration) -> bool {
    let mut changed = false;
    if let Some(v) = policy.allow_auto_converge {
        config.allow_auto_converge = Some(v);
        changed = true;
    }
    if let Some(v) = &policy.bandwidth_per_migration {
        config.bandwidth_per_migration = Some(v.clone());
        changed = true;
    }
    if let Some(v) = policy.completion_timeout_per_gib {
        config.completion_timeout_per_gib = Some(v);
        changed = true;
    }
    if let Some(v) = policy.allow_post_copy {
        config.allow_post_copy = Some(v);
        changed = true;
    }
    changed
}

/// Resolve the effective configuration for a VMI
///
/// Returns the configuration and, when a policy changed it, the policy name.
pub fn effective_configuration<P: AsRef<MigrationPolicy>>(
    baseline: MigrationConfiguration,
    policies: &[P],
    vmi_labels: &BTreeMap<String, String>,
    namespace_labels: &BTreeMap<String, String>,
) -> (MigrationConfiguration, Option<String>) {
    let mut config = baseline;
    let Some(policy) = match_policy(policies.iter(), vmi_labels, namespace_labels) else {
        return (config, None);
    };
    let policy = policy.as_ref();
    let changed = apply_policy(&policy.spec, &mut config);
    (config, changed.then(|| policy.name_any()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kubevirt_common::crd::Selectors;
    use rstest::rstest;
    use std::sync::Arc;

    fn labels(n: usize, prefix: &str) -> BTreeMap<String, String> {
        (0..n)
            .map(|i| (format!("{prefix}-key-{i}"), format!("{prefix}-value-{i}")))
            .collect()
    }

    fn policy(name: &str, vmi_labels: usize, ns_labels: usize) -> Arc<MigrationPolicy> {
        Arc::new(MigrationPolicy::new(
            name,
            MigrationPolicySpec {
                selectors: Selectors {
                    virtual_machine_instance_selector: Some(labels(vmi_labels, "vmi")),
                    namespace_selector: Some(labels(ns_labels, "ns")),
                },
                ..Default::default()
            },
        ))
    }

    fn names(found: Option<&Arc<MigrationPolicy>>) -> Option<String> {
        found.map(|p| p.name_any())
    }

    mod matching {
        use super::*;

        /// Story: VMI labels dominate namespace labels
        ///
        /// (1 VMI label, 4 namespace labels) loses to (4 VMI labels, 2
        /// namespace labels) whichever order the policies are listed in.
        #[rstest]
        #[case(false)]
        #[case(true)]
        fn story_vmi_label_weight_dominates(#[case] reversed: bool) {
            let mut policies = vec![policy("narrow-vmi", 1, 4), policy("wide-vmi", 4, 2)];
            if reversed {
                policies.reverse();
            }
            let found = match_policy(policies.iter(), &labels(5, "vmi"), &labels(5, "ns"));
            assert_eq!(names(found).as_deref(), Some("wide-vmi"));
        }

        /// Story: ties go to the smallest name
        #[rstest]
        #[case(&["zz", "aa"])]
        #[case(&["aa", "zz"])]
        #[case(&["mm", "zz", "aa"])]
        fn story_equal_specificity_breaks_by_name(#[case] order: &[&str]) {
            let policies: Vec<_> = order.iter().map(|n| policy(n, 2, 2)).collect();
            let found = match_policy(policies.iter(), &labels(3, "vmi"), &labels(3, "ns"));
            assert_eq!(names(found).as_deref(), Some("aa"));
        }

        #[rstest]
        #[case(0, 0, 0, 0, true)]
        #[case(2, 0, 2, 0, true)]
        #[case(3, 0, 2, 0, false)]
        #[case(0, 3, 5, 2, false)]
        #[case(1, 1, 1, 1, true)]
        fn policy_fits_only_when_selectors_are_subsets(
            #[case] policy_vmi: usize,
            #[case] policy_ns: usize,
            #[case] vmi: usize,
            #[case] ns: usize,
            #[case] fits: bool,
        ) {
            let policies = vec![policy("p", policy_vmi, policy_ns)];
            let found = match_policy(policies.iter(), &labels(vmi, "vmi"), &labels(ns, "ns"));
            assert_eq!(found.is_some(), fits);
        }

        #[test]
        fn mismatched_value_does_not_fit() {
            let policies = vec![policy("p", 1, 0)];
            let mut vmi_labels = labels(1, "vmi");
            vmi_labels.insert("vmi-key-0".to_string(), "other".to_string());
            assert!(match_policy(policies.iter(), &vmi_labels, &BTreeMap::new()).is_none());
        }

        #[test]
        fn empty_policy_list_matches_nothing() {
            let policies: Vec<Arc<MigrationPolicy>> = Vec::new();
            assert!(match_policy(policies.iter(), &labels(2, "vmi"), &labels(2, "ns")).is_none());
        }

        #[test]
        fn missing_selectors_match_unconditionally() {
            let policies = vec![Arc::new(MigrationPolicy::new(
                "catch-all",
                MigrationPolicySpec::default(),
            ))];
            let found = match_policy(policies.iter(), &BTreeMap::new(), &BTreeMap::new());
            assert_eq!(names(found).as_deref(), Some("catch-all"));
        }
    }

    mod applying {
        use super::*;

        #[test]
        fn only_set_fields_are_overridden() {
            let mut config = MigrationConfiguration {
                allow_auto_converge: Some(false),
                allow_post_copy: Some(false),
                completion_timeout_per_gib: Some(800),
                ..Default::default()
            };
            let spec = MigrationPolicySpec {
                allow_post_copy: Some(true),
                bandwidth_per_migration: Some(Quantity("1Gi".to_string())),
                ..Default::default()
            };
            assert!(apply_policy(&spec, &mut config));
            assert_eq!(config.allow_post_copy, Some(true));
            assert_eq!(config.allow_auto_converge, Some(false));
            assert_eq!(config.completion_timeout_per_gib, Some(800));
            assert_eq!(
                config.bandwidth_per_migration,
                Some(Quantity("1Gi".to_string()))
            );
        }

        #[test]
        fn explicit_false_counts_as_change() {
            let mut config = MigrationConfiguration::default();
            let spec = MigrationPolicySpec {
                allow_auto_converge: Some(false),
                ..Default::default()
            };
            assert!(apply_policy(&spec, &mut config));
        }

        #[test]
        fn empty_policy_reports_no_change() {
            let mut config = MigrationConfiguration::default();
            assert!(!apply_policy(&MigrationPolicySpec::default(), &mut config));
            assert_eq!(config, MigrationConfiguration::default());
        }

        #[test]
        fn effective_configuration_names_only_changing_policy() {
            let mut changing = MigrationPolicySpec::default();
            changing.allow_post_copy = Some(true);
            let policies = vec![Arc::new(MigrationPolicy::new("post-copy", changing))];
            let (config, name) = effective_configuration(
                MigrationConfiguration::default(),
                &policies,
                &BTreeMap::new(),
                &BTreeMap::new(),
            );
            assert_eq!(config.allow_post_copy, Some(true));
            assert_eq!(name.as_deref(), Some("post-copy"));

            let idle = vec![Arc::new(MigrationPolicy::new(
                "noop",
                MigrationPolicySpec::default(),
            ))];
            let (_, name) = effective_configuration(
                MigrationConfiguration::default(),
                &idle,
                &BTreeMap::new(),
                &BTreeMap::new(),
            );
            assert_eq!(name, None);
        }
    }
}
