//! Read side of the reconciler
//!
//! All cross-object reads come from reflector caches. The caches are
//! eventually consistent; callers must treat every answer as possibly stale
//! and rely on test-and-set writes for correctness.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::runtime::reflector::store::WriterDropped;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::ResourceExt;

use kubevirt_common::crd::{MigrationPolicy, VirtualMachineInstance, VirtualMachineInstanceMigration};
use kubevirt_common::labels::{APP_LABEL, APP_VIRT_LAUNCHER, CREATED_BY_LABEL, MIGRATION_JOB_LABEL};

/// Caches of every kind the reconciler reads
#[derive(Clone)]
pub struct ObjectStore {
    /// Migrations
    pub migrations: Store<VirtualMachineInstanceMigration>,
    /// VMIs
    pub vmis: Store<VirtualMachineInstance>,
    /// Pods (launcher, target and attachment pods)
    pub pods: Store<Pod>,
    /// Nodes
    pub nodes: Store<Node>,
    /// Pod disruption budgets
    pub pdbs: Store<PodDisruptionBudget>,
    /// Migration policies
    pub policies: Store<MigrationPolicy>,
    /// Namespaces
    pub namespaces: Store<Namespace>,
}

/// Writers feeding an [`ObjectStore`]
pub struct StoreWriters {
    /// Migrations
    pub migrations: reflector::store::Writer<VirtualMachineInstanceMigration>,
    /// VMIs
    pub vmis: reflector::store::Writer<VirtualMachineInstance>,
    /// Pods
    pub pods: reflector::store::Writer<Pod>,
    /// Nodes
    pub nodes: reflector::store::Writer<Node>,
    /// Pod disruption budgets
    pub pdbs: reflector::store::Writer<PodDisruptionBudget>,
    /// Migration policies
    pub policies: reflector::store::Writer<MigrationPolicy>,
    /// Namespaces
    pub namespaces: reflector::store::Writer<Namespace>,
}

/// Create an empty store with its writers
pub fn object_store() -> (ObjectStore, StoreWriters) {
    let (migrations, migrations_w) = reflector::store();
    let (vmis, vmis_w) = reflector::store();
    let (pods, pods_w) = reflector::store();
    let (nodes, nodes_w) = reflector::store();
    let (pdbs, pdbs_w) = reflector::store();
    let (policies, policies_w) = reflector::store();
    let (namespaces, namespaces_w) = reflector::store();
    (
        ObjectStore {
            migrations,
            vmis,
            pods,
            nodes,
            pdbs,
            policies,
            namespaces,
        },
        StoreWriters {
            migrations: migrations_w,
            vmis: vmis_w,
            pods: pods_w,
            nodes: nodes_w,
            pdbs: pdbs_w,
            policies: policies_w,
            namespaces: namespaces_w,
        },
    )
}

fn label_is(labels: &BTreeMap<String, String>, key: &str, value: &str) -> bool {
    labels.get(key).map(String::as_str) == Some(value)
}

impl ObjectStore {
    /// Resolves once every cache holds its initial list
    ///
    /// Reads before this point can miss pods and migrations that exist,
    /// so reconciliation must not start earlier. Fails if a reflector
    /// stopped before its first list completed.
    pub async fn wait_until_ready(&self) -> Result<(), WriterDropped> {
        self.migrations.wait_until_ready().await?;
        self.vmis.wait_until_ready().await?;
        self.pods.wait_until_ready().await?;
        self.nodes.wait_until_ready().await?;
        self.pdbs.wait_until_ready().await?;
        self.policies.wait_until_ready().await?;
        self.namespaces.wait_until_ready().await?;
        Ok(())
    }

    /// VMI by namespace and name
    pub fn vmi(&self, namespace: &str, name: &str) -> Option<Arc<VirtualMachineInstance>> {
        self.vmis.get(&ObjectRef::new(name).within(namespace))
    }

    /// VMI a migration refers to
    pub fn vmi_for(
        &self,
        migration: &VirtualMachineInstanceMigration,
    ) -> Option<Arc<VirtualMachineInstance>> {
        let namespace = migration.namespace().unwrap_or_default();
        self.vmi(&namespace, &migration.spec.vmi_name)
    }

    /// Node by name
    pub fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.get(&ObjectRef::new(name))
    }

    /// All nodes
    pub fn all_nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.state()
    }

    /// Namespace labels, empty when the namespace is unknown
    pub fn namespace_labels(&self, name: &str) -> BTreeMap<String, String> {
        self.namespaces
            .get(&ObjectRef::new(name))
            .map(|ns| ns.labels().clone())
            .unwrap_or_default()
    }

    /// All migration policies
    pub fn all_policies(&self) -> Vec<Arc<MigrationPolicy>> {
        self.policies.state()
    }

    /// All migrations in the cluster
    pub fn all_migrations(&self) -> Vec<Arc<VirtualMachineInstanceMigration>> {
        self.migrations.state()
    }

    /// Migration by namespace and name
    pub fn migration(
        &self,
        namespace: &str,
        name: &str,
    ) -> Option<Arc<VirtualMachineInstanceMigration>> {
        self.migrations.get(&ObjectRef::new(name).within(namespace))
    }

    /// Migration by UID
    pub fn migration_by_uid(
        &self,
        namespace: &str,
        uid: &str,
    ) -> Option<Arc<VirtualMachineInstanceMigration>> {
        self.migrations.state().into_iter().find(|m| {
            m.namespace().as_deref() == Some(namespace) && m.uid().as_deref() == Some(uid)
        })
    }

    /// Migrations targeting the named VMI
    pub fn migrations_for_vmi(
        &self,
        namespace: &str,
        vmi_name: &str,
    ) -> Vec<Arc<VirtualMachineInstanceMigration>> {
        self.migrations
            .state()
            .into_iter()
            .filter(|m| m.namespace().as_deref() == Some(namespace) && m.spec.vmi_name == vmi_name)
            .collect()
    }

    /// Pods labeled with a migration's UID (target and attachment pods)
    pub fn pods_for_migration(&self, namespace: &str, migration_uid: &str) -> Vec<Arc<Pod>> {
        self.pods
            .state()
            .into_iter()
            .filter(|p| {
                p.namespace().as_deref() == Some(namespace)
                    && label_is(p.labels(), MIGRATION_JOB_LABEL, migration_uid)
            })
            .collect()
    }

    /// Launcher pods created for a VMI, from any migration or none
    pub fn launcher_pods_for_vmi(&self, namespace: &str, vmi_uid: &str) -> Vec<Arc<Pod>> {
        self.pods
            .state()
            .into_iter()
            .filter(|p| {
                p.namespace().as_deref() == Some(namespace)
                    && label_is(p.labels(), CREATED_BY_LABEL, vmi_uid)
                    && label_is(p.labels(), APP_LABEL, APP_VIRT_LAUNCHER)
            })
            .collect()
    }

    /// Pod disruption budgets owned by a VMI
    pub fn pdbs_for_vmi(&self, namespace: &str, vmi_uid: &str) -> Vec<Arc<PodDisruptionBudget>> {
        self.pdbs
            .state()
            .into_iter()
            .filter(|pdb| {
                pdb.namespace().as_deref() == Some(namespace)
                    && pdb.owner_references().iter().any(|o| o.uid == vmi_uid)
            })
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::StoreFixture;
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use kubevirt_common::crd::{VirtualMachineInstanceMigrationSpec, VirtualMachineInstanceSpec};

    fn pod(name: &str, labels: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn migration(name: &str, uid: &str, vmi: &str) -> VirtualMachineInstanceMigration {
        let mut m = VirtualMachineInstanceMigration::new(
            name,
            VirtualMachineInstanceMigrationSpec {
                vmi_name: vmi.to_string(),
            },
        );
        m.metadata.namespace = Some("default".to_string());
        m.metadata.uid = Some(uid.to_string());
        m
    }

    #[test]
    fn pods_are_selected_by_migration_and_vmi_labels() {
        let store = StoreFixture::new()
            .pod(pod(
                "target",
                &[
                    (APP_LABEL, APP_VIRT_LAUNCHER),
                    (CREATED_BY_LABEL, "vmi-uid"),
                    (MIGRATION_JOB_LABEL, "m-uid"),
                ],
            ))
            .pod(pod(
                "source",
                &[(APP_LABEL, APP_VIRT_LAUNCHER), (CREATED_BY_LABEL, "vmi-uid")],
            ))
            .pod(pod("unrelated", &[(APP_LABEL, APP_VIRT_LAUNCHER)]))
            .build();

        let for_migration = store.pods_for_migration("default", "m-uid");
        assert_eq!(for_migration.len(), 1);
        assert_eq!(for_migration[0].name_any(), "target");
        assert_eq!(store.launcher_pods_for_vmi("default", "vmi-uid").len(), 2);
        assert!(store.pods_for_migration("other", "m-uid").is_empty());
    }

    #[test]
    fn migrations_are_found_by_uid_and_vmi() {
        let store = StoreFixture::new()
            .migration(migration("m1", "uid-1", "vmi-a"))
            .migration(migration("m2", "uid-2", "vmi-a"))
            .migration(migration("m3", "uid-3", "vmi-b"))
            .build();

        assert_eq!(
            store.migration_by_uid("default", "uid-2").map(|m| m.name_any()),
            Some("m2".to_string())
        );
        assert_eq!(store.migrations_for_vmi("default", "vmi-a").len(), 2);
        assert!(store.migration("default", "m3").is_some());
        assert_eq!(store.all_migrations().len(), 3);
    }

    #[test]
    fn vmi_lookup_follows_migration_reference() {
        let mut vmi = VirtualMachineInstance::new("vmi-a", VirtualMachineInstanceSpec::default());
        vmi.metadata.namespace = Some("default".to_string());
        let store = StoreFixture::new().vmi(vmi).build();

        assert!(store.vmi_for(&migration("m1", "uid-1", "vmi-a")).is_some());
        assert!(store.vmi_for(&migration("m2", "uid-2", "vmi-missing")).is_none());
    }

    #[test]
    fn pdbs_are_matched_by_owner_uid() {
        let pdb = PodDisruptionBudget {
            metadata: ObjectMeta {
                name: Some("kubevirt-disruption-budget-abc".to_string()),
                namespace: Some("default".to_string()),
                owner_references: Some(vec![OwnerReference {
                    uid: "vmi-uid".to_string(),
                    name: "vmi-a".to_string(),
                    kind: "VirtualMachineInstance".to_string(),
                    api_version: "kubevirt.io/v1".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        };
        let store = StoreFixture::new().pdb(pdb).build();

        assert_eq!(store.pdbs_for_vmi("default", "vmi-uid").len(), 1);
        assert!(store.pdbs_for_vmi("default", "other-uid").is_empty());
    }

    mod readiness {
        use super::*;
        use kube::runtime::watcher::Event;
        use std::time::Duration;

        async fn settles(store: &ObjectStore) -> Option<Result<(), WriterDropped>> {
            tokio::time::timeout(Duration::from_millis(50), store.wait_until_ready())
                .await
                .ok()
        }

        /// Story: reconciliation waits for every cache's first list
        ///
        /// Six caches finish listing but pods are still loading, so the
        /// store is not ready. The pod list completing releases it.
        #[tokio::test]
        async fn story_store_ready_only_after_every_initial_list() {
            let (store, mut w) = object_store();
            w.migrations.apply_watcher_event(&Event::InitDone);
            w.vmis.apply_watcher_event(&Event::InitDone);
            w.nodes.apply_watcher_event(&Event::InitDone);
            w.pdbs.apply_watcher_event(&Event::InitDone);
            w.policies.apply_watcher_event(&Event::InitDone);
            w.namespaces.apply_watcher_event(&Event::InitDone);
            w.pods.apply_watcher_event(&Event::Init);
            w.pods.apply_watcher_event(&Event::InitApply(pod(
                "target",
                &[(APP_LABEL, APP_VIRT_LAUNCHER), (MIGRATION_JOB_LABEL, "m-uid")],
            )));

            assert!(settles(&store).await.is_none());
            assert!(store.pods_for_migration("default", "m-uid").is_empty());

            w.pods.apply_watcher_event(&Event::InitDone);

            assert!(matches!(settles(&store).await, Some(Ok(()))));
            assert_eq!(store.pods_for_migration("default", "m-uid").len(), 1);
        }

        #[tokio::test]
        async fn dropped_writer_fails_readiness() {
            let (store, writers) = object_store();
            drop(writers);

            assert!(matches!(settles(&store).await, Some(Err(_))));
        }
    }

    #[test]
    fn unknown_namespace_has_no_labels() {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some("prod".to_string()),
                labels: Some(BTreeMap::from([("tier".to_string(), "gold".to_string())])),
                ..Default::default()
            },
            ..Default::default()
        };
        let store = StoreFixture::new().namespace(ns).build();
        assert_eq!(store.namespace_labels("prod").get("tier").map(String::as_str), Some("gold"));
        assert!(store.namespace_labels("dev").is_empty());
    }
}
