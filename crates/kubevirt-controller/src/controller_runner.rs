//! Controller runner - wires the migration reconciler to the cluster
//!
//! The reconciler reads everything from reflector caches, so this module
//! starts one reflector per kind and holds the reconciler back until every
//! cache has listed. It also maps pod, VMI and PDB changes back to their
//! migrations and runs the periodic garbage collection sweep.

use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::runtime::reflector::{self, store::Writer, ObjectRef};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::time::MissedTickBehavior;

use kubevirt_common::config::{ClusterConfig, VirtComponent};
use kubevirt_common::crd::{KubeVirt, VirtualMachineInstance, VirtualMachineInstanceMigration};
use kubevirt_common::labels::{
    APP_LABEL, MIGRATION_JOB_LABEL, MIGRATION_JOB_NAME_ANNOTATION, MIGRATION_NAME_LABEL,
};
use kubevirt_common::telemetry::LogHandle;
use kubevirt_migration::controller::{error_policy, reconcile, Context};
use kubevirt_migration::gc;
use kubevirt_migration::renderer::DefaultResourceRenderer;
use kubevirt_migration::store::{object_store, ObjectStore};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A long-running task of the controller process
pub type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Settings for the migration controller process
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Component this process runs as; names its telemetry and picks its verbosity
    pub component: VirtComponent,
    /// Namespace holding the KubeVirt install object
    pub kubevirt_namespace: String,
    /// Requeue interval for idle migrations
    pub resync_interval: Duration,
    /// Interval of the background garbage collection sweep
    pub gc_interval: Duration,
    /// Finalized migrations kept by garbage collection
    pub finalized_buffer: usize,
    /// virt-launcher image for target pods
    pub launcher_image: String,
}

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Only KubeVirt-managed pods (launchers and attachment pods) are watched
fn pod_watcher_config() -> WatcherConfig {
    watcher_config().labels(APP_LABEL)
}

/// Build the migration controller and every task it depends on
///
/// The returned tasks run until shutdown; the controller itself stops on
/// SIGTERM or Ctrl-C.
pub fn build_migration_controller(
    client: Client,
    config: RunnerConfig,
    logs: LogHandle,
) -> Vec<Task> {
    let (store, writers) = object_store();
    let cluster_config = Arc::new(ClusterConfig::default());

    let ctx = Arc::new(
        Context::builder(client.clone(), store.clone())
            .cluster_config(cluster_config.clone())
            .renderer(Arc::new(DefaultResourceRenderer::new(
                config.launcher_image.clone(),
            )))
            .resync_interval(config.resync_interval)
            .finalized_buffer(config.finalized_buffer)
            .build(),
    );

    let mut tasks: Vec<Task> = vec![
        reflect("migrations", Api::all(client.clone()), writers.migrations, watcher_config()),
        reflect("vmis", Api::all(client.clone()), writers.vmis, watcher_config()),
        reflect("pods", Api::all(client.clone()), writers.pods, pod_watcher_config()),
        reflect("nodes", Api::all(client.clone()), writers.nodes, watcher_config()),
        reflect("pdbs", Api::all(client.clone()), writers.pdbs, watcher_config()),
        reflect("policies", Api::all(client.clone()), writers.policies, watcher_config()),
        reflect("namespaces", Api::all(client.clone()), writers.namespaces, watcher_config()),
        watch_cluster_config(
            Api::namespaced(client.clone(), &config.kubevirt_namespace),
            cluster_config,
            config.component,
            logs,
        ),
        after_sync(store.clone(), "gc", gc_loop(ctx.clone(), config.gc_interval)),
    ];

    let pod_store = store.clone();
    let vmi_store = store.clone();
    let migrations: Api<VirtualMachineInstanceMigration> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client.clone());
    let vmis: Api<VirtualMachineInstance> = Api::all(client.clone());
    let pdbs: Api<PodDisruptionBudget> = Api::all(client);

    let controller = Controller::new(migrations, watcher_config())
        .watches(pods, pod_watcher_config(), move |pod| {
            migration_for_pod(&pod_store, &pod)
        })
        .watches(vmis, watcher_config(), move |vmi| {
            migrations_for_vmi(&vmi_store, &vmi)
        })
        .watches(pdbs, watcher_config().labels(MIGRATION_NAME_LABEL), |pdb| {
            migration_for_pdb(&pdb)
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("Migration"));

    tracing::info!("- VirtualMachineInstanceMigration controller");
    tasks.push(after_sync(store, "migration controller", controller));
    tasks
}

/// Hold `work` back until every reflector cache holds its initial list
///
/// A reconcile pass against a half-filled cache would miss existing target
/// pods and create duplicates.
fn after_sync<F>(store: ObjectStore, name: &'static str, work: F) -> Task
where
    F: Future<Output = ()> + Send + 'static,
{
    Box::pin(async move {
        if let Err(e) = store.wait_until_ready().await {
            tracing::error!(task = name, error = %e, "Caches never synced, not starting");
            return;
        }
        tracing::info!(task = name, "Caches synced, starting");
        work.await;
    })
}

/// Migration a target or attachment pod belongs to
///
/// Pods carry the migration name as an annotation; older pods only have the
/// migration UID label, which is resolved through the cache.
pub fn migration_for_pod(
    store: &ObjectStore,
    pod: &Pod,
) -> Option<ObjectRef<VirtualMachineInstanceMigration>> {
    let namespace = pod.namespace()?;
    if let Some(name) = pod.annotations().get(MIGRATION_JOB_NAME_ANNOTATION) {
        return Some(ObjectRef::new(name).within(&namespace));
    }
    let uid = pod.labels().get(MIGRATION_JOB_LABEL)?;
    store
        .migration_by_uid(&namespace, uid)
        .map(|m| ObjectRef::from_obj(m.as_ref()))
}

/// Every migration of a VMI, final ones included
pub fn migrations_for_vmi(
    store: &ObjectStore,
    vmi: &VirtualMachineInstance,
) -> Vec<ObjectRef<VirtualMachineInstanceMigration>> {
    let Some(namespace) = vmi.namespace() else {
        return vec![];
    };
    store
        .migrations_for_vmi(&namespace, &vmi.name_any())
        .iter()
        .map(|m| ObjectRef::from_obj(m.as_ref()))
        .collect()
}

/// Migration a PDB was expanded for
pub fn migration_for_pdb(
    pdb: &PodDisruptionBudget,
) -> Option<ObjectRef<VirtualMachineInstanceMigration>> {
    let namespace = pdb.namespace()?;
    pdb.labels()
        .get(MIGRATION_NAME_LABEL)
        .map(|name| ObjectRef::new(name).within(&namespace))
}

/// Feed a reflector store from a watch
fn reflect<K>(kind: &'static str, api: Api<K>, writer: Writer<K>, config: WatcherConfig) -> Task
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    Box::pin(
        reflector::reflector(writer, watcher::watcher(api, config))
            .default_backoff()
            .for_each(move |event| {
                if let Err(e) = event {
                    tracing::warn!(kind, error = %e, "watch error, backing off");
                }
                std::future::ready(())
            }),
    )
}

/// Keep the cluster configuration in sync with the KubeVirt object
///
/// The component's log verbosity is re-applied on every change.
fn watch_cluster_config(
    api: Api<KubeVirt>,
    config: Arc<ClusterConfig>,
    component: VirtComponent,
    logs: LogHandle,
) -> Task {
    let node_name = std::env::var("NODE_NAME").ok();
    Box::pin(
        watcher::watcher(api, watcher_config())
            .default_backoff()
            .applied_objects()
            .for_each(move |kv| {
                match kv {
                    Ok(kv) => {
                        config.update(kv.spec.configuration.clone());
                        apply_verbosity(&config, component, node_name.as_deref(), &logs);
                        tracing::debug!(kubevirt = %kv.name_any(), "cluster configuration applied");
                    }
                    Err(e) => tracing::warn!(error = %e, "KubeVirt watch error, backing off"),
                }
                std::future::ready(())
            }),
    )
}

/// Set the log level from the component's configured verbosity
fn apply_verbosity(
    config: &ClusterConfig,
    component: VirtComponent,
    node_name: Option<&str>,
    logs: &LogHandle,
) {
    let verbosity = config.verbosity(component, node_name);
    if let Err(e) = logs.set_verbosity(verbosity) {
        tracing::warn!(error = %e, verbosity, "Failed to apply log verbosity");
    }
}

/// Periodically prune finalized migrations
///
/// Finalizing a migration also sweeps; this loop catches history left
/// behind while the controller was down.
async fn gc_loop(ctx: Arc<Context>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match gc::sweep(ctx.kube.as_ref(), &ctx.store, ctx.finalized_buffer).await {
            Ok(0) => {}
            Ok(deleted) => tracing::info!(deleted, "Garbage collected finalized migrations"),
            Err(e) => tracing::warn!(error = %e, "Garbage collection failed"),
        }
    }
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: Debug, E: Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
