//! VirtualMachineInstanceMigration controller implementation
//!
//! Each pass looks at one migration, gathers its VMI, pods, budgets and
//! nodes from the object store, and takes at most a handful of idempotent
//! steps toward the next phase. Nothing blocks: every wait is a requeue,
//! and every VMI write is a test-and-set patch that fails cleanly when the
//! cache was stale.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use opentelemetry::KeyValue;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use kubevirt_common::config::ClusterConfig;
use kubevirt_common::crd::{
    Condition, ConditionStatus, MigrationConfiguration, MigrationPhase, MigrationState,
    VirtualMachineInstance,
    VirtualMachineInstanceMigration, VirtualMachineInstanceMigrationStatus,
    CONDITION_ABORT_REQUESTED,
};
use kubevirt_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use kubevirt_common::labels::{
    MIGRATION_FINALIZER, MIGRATION_TARGET_NODE_NAME_LABEL, NON_ROOT_UID,
};
use kubevirt_common::metrics::{
    record_admission_deferred, record_phase_transition, ReconcileTimer, PODS_CREATED,
    PODS_TIMED_OUT,
};
use kubevirt_common::{Error, CONTROLLER_NAME};

use crate::gate::{self, Admission, Limits};
use crate::gc::{self, DEFAULT_FINALIZED_BUFFER};
use crate::patch::JsonPatch;
use crate::pdb::{self, PdbState};
use crate::pod::{self, MigrationPods, TargetPodParams};
use crate::policy;
use crate::renderer::{DefaultResourceRenderer, ResourceRenderer};
use crate::store::ObjectStore;
use crate::timeout::{self, TimeoutCheck};

/// Default interval between passes over an idle migration
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// How long a pod creation is trusted before the cache must show the pod
const POD_EXPECTATION_TTL: Duration = Duration::from_secs(60);

/// Requeue delay after a write whose effect the cache has yet to show
const SHORT_REQUEUE: Duration = Duration::from_secs(1);

const MIGRATION_STATE_PATH: &[&str] = &["status", "migrationState"];

// =============================================================================
// Kubernetes client seam
// =============================================================================

/// Trait abstracting the writes the migration controller performs
///
/// Reads come from the [`ObjectStore`]; only mutations go through here,
/// which keeps the mock surface small in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Merge-patch the status subresource of a migration
    async fn patch_migration_status(
        &self,
        namespace: &str,
        name: &str,
        status: &VirtualMachineInstanceMigrationStatus,
    ) -> Result<(), Error>;

    /// Delete a migration (404 is success)
    async fn delete_migration(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Add a finalizer, conditional on the observed finalizer list
    async fn add_migration_finalizer(
        &self,
        migration: &VirtualMachineInstanceMigration,
        finalizer: &str,
    ) -> Result<(), Error>;

    /// Remove a finalizer, conditional on the observed finalizer list
    async fn remove_migration_finalizer(
        &self,
        migration: &VirtualMachineInstanceMigration,
        finalizer: &str,
    ) -> Result<(), Error>;

    /// Create a pod, returning it as stored by the API server
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error>;

    /// Delete a pod (404 is success)
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Apply a JSON patch to a VMI
    async fn patch_vmi(&self, namespace: &str, name: &str, patch: &JsonPatch)
        -> Result<(), Error>;

    /// Strategic-merge patch a pod disruption budget
    async fn patch_pdb(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn migrations(&self, namespace: &str) -> Api<VirtualMachineInstanceMigration> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn set_finalizers(
        &self,
        migration: &VirtualMachineInstanceMigration,
        desired: Vec<String>,
    ) -> Result<(), Error> {
        let namespace = migration.namespace().unwrap_or_default();
        let patch = JsonPatch::new()
            .test_and_set(
                &["metadata", "finalizers"],
                migration.metadata.finalizers.as_ref(),
                &desired,
            )?
            .into_kube_patch();
        self.migrations(&namespace)
            .patch(&migration.name_any(), &PatchParams::default(), &patch)
            .await?;
        Ok(())
    }
}

fn ignore_not_found(result: Result<(), kube::Error>, what: &str, name: &str) -> Result<(), Error> {
    match result {
        Ok(()) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            debug!(%name, "{what} not found (already deleted)");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn patch_migration_status(
        &self,
        namespace: &str,
        name: &str,
        status: &VirtualMachineInstanceMigrationStatus,
    ) -> Result<(), Error> {
        let status_patch = serde_json::json!({ "status": status });
        self.migrations(namespace)
            .patch_status(
                name,
                &PatchParams::apply(CONTROLLER_NAME),
                &Patch::Merge(&status_patch),
            )
            .await?;
        Ok(())
    }

    async fn delete_migration(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let result = self
            .migrations(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ());
        ignore_not_found(result, "migration", name)
    }

    async fn add_migration_finalizer(
        &self,
        migration: &VirtualMachineInstanceMigration,
        finalizer: &str,
    ) -> Result<(), Error> {
        if migration.has_finalizer(finalizer) {
            return Ok(());
        }
        let mut finalizers = migration.metadata.finalizers.clone().unwrap_or_default();
        finalizers.push(finalizer.to_string());
        self.set_finalizers(migration, finalizers).await
    }

    async fn remove_migration_finalizer(
        &self,
        migration: &VirtualMachineInstanceMigration,
        finalizer: &str,
    ) -> Result<(), Error> {
        if !migration.has_finalizer(finalizer) {
            return Ok(());
        }
        let finalizers = migration
            .finalizers()
            .iter()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect();
        self.set_finalizers(migration, finalizers).await
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), pod).await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let result = api.delete(name, &DeleteParams::default()).await.map(|_| ());
        ignore_not_found(result, "pod", name)
    }

    async fn patch_vmi(
        &self,
        namespace: &str,
        name: &str,
        patch: &JsonPatch,
    ) -> Result<(), Error> {
        let api: Api<VirtualMachineInstance> = Api::namespaced(self.client.clone(), namespace);
        debug!(vmi = %name, %patch, "Patching VMI");
        api.patch(name, &PatchParams::default(), &patch.clone().into_kube_patch())
            .await?;
        Ok(())
    }

    async fn patch_pdb(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), Error> {
        let api: Api<PodDisruptionBudget> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Strategic(patch))
            .await?;
        Ok(())
    }
}

// =============================================================================
// Context
// =============================================================================

/// Controller context containing shared state and clients
pub struct Context {
    /// Kubernetes client for writes (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Event publisher for user-visible events
    pub events: Arc<dyn EventPublisher>,
    /// Reflector caches for every kind the reconciler reads
    pub store: ObjectStore,
    /// Cluster configuration provider
    pub config: Arc<ClusterConfig>,
    /// Container renderer for migration pods
    pub renderer: Arc<dyn ResourceRenderer>,
    /// Requeue interval for migrations waiting on external progress
    pub resync_interval: Duration,
    /// Finalized migrations kept by garbage collection
    pub finalized_buffer: usize,
    /// UIDs of migrations whose handoff patch was accepted
    handoffs: DashSet<String>,
    /// Pod creations not yet visible in the cache, keyed by migration UID and role
    pod_expectations: DashMap<String, DateTime<Utc>>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, store: ObjectStore) -> ContextBuilder {
        ContextBuilder::new(client, store)
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        events: Arc<dyn EventPublisher>,
        store: ObjectStore,
    ) -> Self {
        Self {
            kube,
            events,
            store,
            config: Arc::new(ClusterConfig::default()),
            renderer: Arc::new(DefaultResourceRenderer::default()),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            finalized_buffer: DEFAULT_FINALIZED_BUFFER,
            handoffs: DashSet::new(),
            pod_expectations: DashMap::new(),
        }
    }

    /// Whether this controller already handed the migration off
    pub fn is_handed_off(&self, migration_uid: &str) -> bool {
        self.handoffs.contains(migration_uid)
    }

    /// Drop all in-memory bookkeeping for a migration
    pub fn forget(&self, migration_uid: &str) {
        self.handoffs.remove(migration_uid);
        self.pod_expectations
            .retain(|key, _| !key.starts_with(migration_uid));
    }

    fn expect_pod(&self, key: String) {
        self.pod_expectations.insert(key, Utc::now());
    }

    fn observe_pod(&self, key: &str) {
        self.pod_expectations.remove(key);
    }

    /// Whether a recent creation for `key` has not shown up in the cache yet
    fn awaiting_pod(&self, key: &str) -> bool {
        let Some(created) = self.pod_expectations.get(key).map(|e| *e.value()) else {
            return false;
        };
        let age = (Utc::now() - created).to_std().unwrap_or(Duration::ZERO);
        if age < POD_EXPECTATION_TTL {
            return true;
        }
        warn!(key, "Created pod never appeared in cache, allowing recreation");
        self.pod_expectations.remove(key);
        false
    }
}

/// Builder for constructing a Context with custom configuration
pub struct ContextBuilder {
    client: Client,
    store: ObjectStore,
    kube: Option<Arc<dyn KubeClient>>,
    events: Option<Arc<dyn EventPublisher>>,
    config: Option<Arc<ClusterConfig>>,
    renderer: Option<Arc<dyn ResourceRenderer>>,
    resync_interval: Duration,
    finalized_buffer: usize,
}

impl ContextBuilder {
    fn new(client: Client, store: ObjectStore) -> Self {
        Self {
            client,
            store,
            kube: None,
            events: None,
            config: None,
            renderer: None,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            finalized_buffer: DEFAULT_FINALIZED_BUFFER,
        }
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Share a cluster configuration provider
    pub fn cluster_config(mut self, config: Arc<ClusterConfig>) -> Self {
        self.config = Some(config);
        self
    }

    /// Override the container renderer
    pub fn renderer(mut self, renderer: Arc<dyn ResourceRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Set the resync interval
    pub fn resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// Set how many finalized migrations garbage collection keeps
    pub fn finalized_buffer(mut self, keep: usize) -> Self {
        self.finalized_buffer = keep;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))
            }),
            store: self.store,
            config: self.config.unwrap_or_default(),
            renderer: self
                .renderer
                .unwrap_or_else(|| Arc::new(DefaultResourceRenderer::default())),
            resync_interval: self.resync_interval,
            finalized_buffer: self.finalized_buffer,
            handoffs: DashSet::new(),
            pod_expectations: DashMap::new(),
        }
    }
}

// =============================================================================
// Reconcile
// =============================================================================

/// Reconcile a VirtualMachineInstanceMigration
///
/// Rules are evaluated in precedence order: missing VMI, final phase,
/// finalizer, abort, failure races, then the phase switch. Status changes
/// accumulate in memory and are written once at the end of the pass.
#[instrument(
    skip(migration, ctx),
    fields(migration = %migration.name_any(), namespace = %migration.namespace().unwrap_or_default())
)]
pub async fn reconcile(
    migration: Arc<VirtualMachineInstanceMigration>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let timer = ReconcileTimer::start();
    let result = reconcile_migration(&migration, &ctx).await;
    match &result {
        Ok(_) => timer.success(),
        Err(e) => timer.error(e.is_retryable()),
    }
    result
}

/// Error policy for the controller
///
/// Logs the error and requeues after a fixed delay. Conflicts from stale
/// test-and-set patches land here too and are simply retried.
pub fn error_policy(
    migration: Arc<VirtualMachineInstanceMigration>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    if error.is_conflict() {
        debug!(migration = %migration.name_any(), %error, "conditional write lost a race, retrying");
        return Action::requeue(SHORT_REQUEUE);
    }
    error!(
        ?error,
        migration = %migration.name_any(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

async fn reconcile_migration(
    migration: &VirtualMachineInstanceMigration,
    ctx: &Context,
) -> Result<Action, Error> {
    let uid = migration
        .uid()
        .ok_or_else(|| Error::internal_with_context("reconciler", "migration has no uid"))?;

    let Some(vmi) = ctx.store.vmi_for(migration) else {
        return handle_missing_vmi(migration, &uid, ctx).await;
    };

    let pods = MigrationPods::classify(
        ctx.store
            .pods_for_migration(&migration.namespace().unwrap_or_default(), &uid),
    );

    if migration.is_final() {
        return handle_final(migration, &vmi, &pods, &uid, ctx).await;
    }

    if !migration.is_deleting() && !migration.has_finalizer(MIGRATION_FINALIZER) {
        info!("Adding finalizer");
        ctx.kube
            .add_migration_finalizer(migration, MIGRATION_FINALIZER)
            .await?;
        return Ok(Action::requeue(SHORT_REQUEUE));
    }

    let mut pass = Pass::new(migration, &vmi, pods, uid, ctx)?;
    let action = pass.run().await?;
    pass.commit().await?;
    Ok(action)
}

async fn handle_missing_vmi(
    migration: &VirtualMachineInstanceMigration,
    uid: &str,
    ctx: &Context,
) -> Result<Action, Error> {
    ctx.forget(uid);
    if migration.is_deleting() {
        if migration.has_finalizer(MIGRATION_FINALIZER) {
            ctx.kube
                .remove_migration_finalizer(migration, MIGRATION_FINALIZER)
                .await?;
        }
        return Ok(Action::await_change());
    }
    info!(vmi = %migration.spec.vmi_name, "VMI is gone, deleting migration");
    ctx.kube
        .delete_migration(&migration.namespace().unwrap_or_default(), &migration.name_any())
        .await?;
    Ok(Action::await_change())
}

/// Settle a migration that reached Succeeded or Failed
///
/// A Failed migration whose target is gone may still own an unfinished VMI
/// migration state; that state is closed out as failed here, without a
/// second FailedMigration event on the migration itself.
async fn handle_final(
    migration: &VirtualMachineInstanceMigration,
    vmi: &VirtualMachineInstance,
    pods: &MigrationPods,
    uid: &str,
    ctx: &Context,
) -> Result<Action, Error> {
    if migration.phase() == MigrationPhase::Failed {
        let target = pods.target()?;
        if is_target_gone(target) {
            close_out_vmi_state(vmi, uid, ctx).await?;
        }
    }

    if migration.has_finalizer(MIGRATION_FINALIZER) {
        debug!("Removing finalizer from finalized migration");
        ctx.kube
            .remove_migration_finalizer(migration, MIGRATION_FINALIZER)
            .await?;
    }
    ctx.forget(uid);

    if let Err(e) = gc::sweep(ctx.kube.as_ref(), &ctx.store, ctx.finalized_buffer).await {
        warn!(error = %e, "Garbage collection of finalized migrations failed");
    }
    Ok(Action::await_change())
}

fn is_target_gone(target: Option<&Arc<Pod>>) -> bool {
    target.map_or(true, |p| {
        pod::is_final(p) || p.metadata.deletion_timestamp.is_some()
    })
}

/// Mark the VMI migration state owned by `uid` as completed and failed
///
/// Only touches a state that belongs to this migration and is not yet
/// completed. Timestamps the node agent never wrote are filled in.
async fn close_out_vmi_state(
    vmi: &VirtualMachineInstance,
    uid: &str,
    ctx: &Context,
) -> Result<bool, Error> {
    let Some(observed) = vmi.migration_state().filter(|s| s.belongs_to(uid) && !s.completed)
    else {
        return Ok(false);
    };
    let now = Time(Utc::now());
    let mut desired = observed.clone();
    desired.start_timestamp.get_or_insert_with(|| now.clone());
    desired.end_timestamp.get_or_insert(now);
    desired.completed = true;
    desired.failed = true;

    let patch = JsonPatch::new().test_and_set(MIGRATION_STATE_PATH, Some(observed), &desired)?;
    ctx.kube
        .patch_vmi(&vmi.namespace().unwrap_or_default(), &vmi.name_any(), &patch)
        .await?;
    ctx.events
        .publish(
            &vmi.object_ref(&()),
            EventType::Warning,
            reasons::FAILED_MIGRATION,
            actions::RECONCILE,
            Some("VirtualMachineInstance migration uid mismatch or target pod is gone".to_string()),
        )
        .await;
    info!(vmi = %vmi.name_any(), "Marked unfinished VMI migration state as failed");
    Ok(true)
}

// =============================================================================
// Active migration pass
// =============================================================================

/// One reconciliation pass over a non-final migration
struct Pass<'a> {
    migration: &'a VirtualMachineInstanceMigration,
    vmi: &'a VirtualMachineInstance,
    pods: MigrationPods,
    uid: String,
    namespace: String,
    ctx: &'a Context,
    status: VirtualMachineInstanceMigrationStatus,
    requeue: Duration,
    /// Drop the finalizer once status is written
    release: bool,
}

impl<'a> Pass<'a> {
    fn new(
        migration: &'a VirtualMachineInstanceMigration,
        vmi: &'a VirtualMachineInstance,
        pods: MigrationPods,
        uid: String,
        ctx: &'a Context,
    ) -> Result<Self, Error> {
        pods.target()?;
        Ok(Self {
            migration,
            vmi,
            pods,
            uid,
            namespace: migration.namespace().unwrap_or_default(),
            ctx,
            status: migration.status.clone().unwrap_or_default(),
            requeue: ctx.resync_interval,
            release: false,
        })
    }

    fn target(&self) -> Option<Arc<Pod>> {
        self.pods.targets.first().cloned()
    }

    /// VMI migration state written for this migration, if any
    fn owned_state(&self) -> Option<&'a MigrationState> {
        self.vmi
            .migration_state()
            .filter(|s| s.belongs_to(&self.uid))
    }

    fn requeue_within(&mut self, delay: Duration) {
        self.requeue = self.requeue.min(delay.max(SHORT_REQUEUE));
    }

    fn transition(&mut self, phase: MigrationPhase) {
        let from = self.status.phase;
        if self.status.transition_to(phase, Time(Utc::now())) {
            if from != phase {
                info!(from = %from, to = %phase, "Migration phase changed");
            }
        } else {
            warn!(from = %from, to = %phase, "Refusing to regress migration phase");
        }
    }

    async fn event(&self, type_: EventType, reason: &str, action: &str, note: String) {
        self.ctx
            .events
            .publish(
                &self.migration.object_ref(&()),
                type_,
                reason,
                action,
                Some(note),
            )
            .await;
    }

    async fn run(&mut self) -> Result<Action, Error> {
        if !self.pods.targets.is_empty() {
            self.ctx.observe_pod(&self.target_key());
        }
        if !self.pods.attachments.is_empty() {
            self.ctx.observe_pod(&self.attachment_key());
        }

        if self.migration.is_deleting() {
            if let Some(action) = self.abort().await? {
                return Ok(action);
            }
        }

        if let Some(reason) = self.failure_reason() {
            self.fail(reason).await?;
            return Ok(Action::requeue(SHORT_REQUEUE));
        }

        match self.status.phase {
            MigrationPhase::Unset | MigrationPhase::Pending => self.pending().await?,
            MigrationPhase::Scheduling => self.scheduling().await?,
            MigrationPhase::Scheduled => self.scheduled().await?,
            _ => {}
        }
        self.advance();
        self.mirror_state();
        Ok(Action::requeue(self.requeue))
    }

    /// Write the accumulated status if it changed, then release the
    /// finalizer when the pass asked for it
    async fn commit(&self) -> Result<(), Error> {
        self.write_status().await?;
        if self.release && self.migration.has_finalizer(MIGRATION_FINALIZER) {
            self.ctx
                .kube
                .remove_migration_finalizer(self.migration, MIGRATION_FINALIZER)
                .await?;
            self.ctx.forget(&self.uid);
        }
        Ok(())
    }

    async fn write_status(&self) -> Result<(), Error> {
        let before = self.migration.status.clone().unwrap_or_default();
        if self.status == before {
            return Ok(());
        }
        for entry in self
            .status
            .phase_transition_timestamps
            .iter()
            .skip(before.phase_transition_timestamps.len())
        {
            record_phase_transition(entry.phase.as_str());
        }
        self.ctx
            .kube
            .patch_migration_status(&self.namespace, &self.migration.name_any(), &self.status)
            .await?;
        if self.status.phase == MigrationPhase::Succeeded && before.phase != MigrationPhase::Succeeded
        {
            self.event(
                EventType::Normal,
                reasons::SUCCESSFUL_MIGRATION,
                actions::RECONCILE,
                "Source node reported migration succeeded".to_string(),
            )
            .await;
        }
        Ok(())
    }

    fn target_key(&self) -> String {
        format!("{}/target", self.uid)
    }

    fn attachment_key(&self) -> String {
        format!("{}/attachment", self.uid)
    }

    // -------------------------------------------------------------------------
    // Abort
    // -------------------------------------------------------------------------

    /// Handle a deletion request
    ///
    /// Before handoff the migration is failed on the spot. After handoff the
    /// node agents own the outcome, so abortRequested is set on the VMI and
    /// the pass continues tracking progress.
    async fn abort(&mut self) -> Result<Option<Action>, Error> {
        if !self.status.has_condition(CONDITION_ABORT_REQUESTED) {
            self.status.set_condition(Condition::new(
                CONDITION_ABORT_REQUESTED,
                ConditionStatus::True,
                "MigrationAbortRequested",
                "Migration abort requested by deletion",
            ));
        }

        let handed_off = self.ctx.is_handed_off(&self.uid) || self.owned_state().is_some();
        if handed_off {
            self.request_abort_on_vmi().await?;
            return Ok(None);
        }

        info!("Aborting migration before handoff");
        self.delete_migration_pods().await?;
        self.transition(MigrationPhase::Failed);
        self.event(
            EventType::Warning,
            reasons::FAILED_MIGRATION,
            actions::ABORT,
            "Migration aborted before handoff".to_string(),
        )
        .await;
        self.release = true;
        Ok(Some(Action::await_change()))
    }

    async fn request_abort_on_vmi(&mut self) -> Result<(), Error> {
        let Some(observed) = self.owned_state() else {
            return Ok(());
        };
        if observed.completed || observed.abort_requested {
            return Ok(());
        }
        let mut desired = observed.clone();
        desired.abort_requested = true;
        let patch = JsonPatch::new().test_and_set(MIGRATION_STATE_PATH, Some(observed), &desired)?;
        self.ctx
            .kube
            .patch_vmi(&self.namespace, &self.vmi.name_any(), &patch)
            .await?;
        self.event(
            EventType::Normal,
            reasons::SUCCESSFUL_ABORT_MIGRATION,
            actions::ABORT,
            format!("Requested abort of migration for VMI {}", self.vmi.name_any()),
        )
        .await;
        Ok(())
    }

    async fn delete_migration_pods(&mut self) -> Result<(), Error> {
        let pods: Vec<_> = self
            .pods
            .targets
            .iter()
            .chain(self.pods.attachments.iter())
            .filter(|p| !pod::is_final(p) && p.metadata.deletion_timestamp.is_none())
            .cloned()
            .collect();
        for p in pods {
            self.delete_pod(&p, "Deleted migration pod on abort").await?;
        }
        Ok(())
    }

    async fn delete_pod(&self, p: &Pod, note: &str) -> Result<(), Error> {
        let name = p.name_any();
        self.ctx.kube.delete_pod(&self.namespace, &name).await?;
        self.event(
            EventType::Normal,
            reasons::SUCCESSFUL_DELETE_POD,
            actions::DELETE,
            format!("{note}: {name}"),
        )
        .await;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Failure races
    // -------------------------------------------------------------------------

    fn failure_reason(&self) -> Option<&'static str> {
        if self.vmi.phase().is_final() {
            return Some("VMI's phase is final");
        }
        let target = self.target();
        if target.as_deref().is_some_and(pod::is_final) {
            return Some("target pod is down");
        }
        if self.owned_state().is_some_and(|s| s.failed) {
            return Some("source node reported migration failed");
        }
        if self
            .pods
            .attachment()
            .is_some_and(|p| pod::is_final(p))
        {
            return Some("attachment pod is down");
        }
        let active = matches!(
            self.status.phase,
            MigrationPhase::Scheduling
                | MigrationPhase::Scheduled
                | MigrationPhase::PreparingTarget
                | MigrationPhase::TargetReady
                | MigrationPhase::Running
        );
        if active && target.is_none() {
            return Some("target pod disappeared");
        }
        None
    }

    async fn fail(&mut self, reason: &str) -> Result<(), Error> {
        let from = self.status.phase;
        info!(%reason, phase = %from, "Migration failed");
        self.transition(MigrationPhase::Failed);
        self.mirror_state();
        self.event(
            EventType::Warning,
            reasons::FAILED_MIGRATION,
            actions::RECONCILE,
            format!("Migration failed: {reason}"),
        )
        .await;
        if matches!(
            from,
            MigrationPhase::PreparingTarget | MigrationPhase::TargetReady
        ) && is_target_gone(self.target().as_ref())
        {
            close_out_vmi_state(self.vmi, &self.uid, self.ctx).await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Pending
    // -------------------------------------------------------------------------

    async fn pending(&mut self) -> Result<(), Error> {
        if self.status.phase == MigrationPhase::Unset {
            self.transition(MigrationPhase::Pending);
        }
        self.record_policy();

        let Some(target) = self.target() else {
            return self.create_target_pod().await;
        };
        // A timed out target is replaced, not followed into Scheduling
        if target.metadata.deletion_timestamp.is_some() {
            debug!(pod = %target.name_any(), "Waiting for terminating target pod to go away");
            self.requeue_within(Duration::from_secs(5));
            return Ok(());
        }
        if self.enforce_timeouts(&target).await? {
            return Ok(());
        }
        if self.vmi.has_hotplug_volumes() && self.pods.attachment().is_none() {
            if pod::is_running(&target) && pod::node_name(&target).is_some() {
                return self.create_attachment_pod(&target).await;
            }
            debug!(pod = %target.name_any(), "Waiting for target pod to run before creating attachment pod");
            return Ok(());
        }
        self.transition(MigrationPhase::Scheduling);
        Ok(())
    }

    /// Policy name and configuration that apply to this VMI
    fn resolve_policy(&self) -> (MigrationConfiguration, Option<String>) {
        let namespace_labels = self.ctx.store.namespace_labels(&self.namespace);
        policy::effective_configuration(
            self.ctx.config.migration_configuration(),
            &self.ctx.store.all_policies(),
            self.vmi.labels(),
            &namespace_labels,
        )
    }

    /// Note a matching policy in status before the handoff carries it
    fn record_policy(&mut self) {
        let recorded = self
            .status
            .migration_state
            .as_ref()
            .is_some_and(|s| s.migration_policy_name.is_some());
        if recorded {
            return;
        }
        if let (_, Some(name)) = self.resolve_policy() {
            debug!(policy = %name, "Migration policy matches");
            self.status
                .migration_state
                .get_or_insert_with(MigrationState::default)
                .migration_policy_name = Some(name);
        }
    }

    async fn create_target_pod(&mut self) -> Result<(), Error> {
        if self.ctx.awaiting_pod(&self.target_key()) {
            debug!("Target pod created but not yet observed");
            self.requeue_within(Duration::from_secs(5));
            return Ok(());
        }

        let vmi_uid = self.vmi.uid().unwrap_or_default();
        let live_launchers = self
            .ctx
            .store
            .launcher_pods_for_vmi(&self.namespace, &vmi_uid)
            .into_iter()
            .filter(|p| !pod::is_final(p))
            .count();
        if live_launchers > 1 {
            debug!(live_launchers, "VMI has an outstanding launcher pod, waiting");
            return Ok(());
        }

        let limits = Limits {
            per_cluster: self.ctx.config.parallel_migrations_per_cluster(),
            per_node: self.ctx.config.parallel_outbound_migrations_per_node(),
        };
        if let Admission::Deferred(limit) =
            gate::admit(&self.ctx.store, self.migration, self.vmi.node_name(), limits)
        {
            debug!(limit = limit.as_str(), "Migration deferred by parallel migration limit");
            record_admission_deferred(limit);
            return Ok(());
        }

        if self.vmi.needs_non_root_upgrade() {
            info!(vmi = %self.vmi.name_any(), "Setting non-root runtime user before migration");
            let patch = JsonPatch::new().add(&["status", "runtimeUser"], serde_json::json!(NON_ROOT_UID));
            self.ctx
                .kube
                .patch_vmi(&self.namespace, &self.vmi.name_any(), &patch)
                .await?;
            self.requeue_within(SHORT_REQUEUE);
            return Ok(());
        }

        if !self.pdbs_ready().await? {
            self.requeue_within(SHORT_REQUEUE);
            return Ok(());
        }

        let vmi_key = format!("{}/{}", self.namespace, self.vmi.name_any());
        if let Err(e) = self
            .ctx
            .config
            .validate_host_devices(&vmi_key, &self.vmi.spec.domain.devices)
        {
            warn!(error = %e, "Refusing to create target pod");
            self.event(
                EventType::Warning,
                reasons::FAILED_CREATE_POD,
                actions::CREATE,
                e.to_string(),
            )
            .await;
            return Ok(());
        }

        let host_model_selector = if self.vmi.is_host_model() {
            match self.host_model_selector() {
                Ok(selector) => Some(selector),
                Err(e) => {
                    warn!(error = %e, "Cannot pin host-model target pod");
                    self.event(
                        EventType::Warning,
                        reasons::FAILED_CREATE_POD,
                        actions::CREATE,
                        e.to_string(),
                    )
                    .await;
                    return Ok(());
                }
            }
        } else {
            None
        };

        let target = pod::render_target_pod(TargetPodParams {
            migration: self.migration,
            vmi: self.vmi,
            compute: self.ctx.renderer.launcher_container(self.vmi),
            host_model_selector,
        })?;
        let created = self.ctx.kube.create_pod(&self.namespace, &target).await?;
        self.ctx.expect_pod(self.target_key());
        PODS_CREATED.add(1, &[KeyValue::new("role", "target")]);
        info!(pod = %created.name_any(), "Created migration target pod");
        self.event(
            EventType::Normal,
            reasons::SUCCESSFUL_CREATE_POD,
            actions::CREATE,
            format!("Created migration target pod {}", created.name_any()),
        )
        .await;
        Ok(())
    }

    fn host_model_selector(&self) -> Result<std::collections::BTreeMap<String, String>, Error> {
        let node_name = self.vmi.node_name().ok_or_else(|| {
            Error::internal_with_context("host-model", "VMI is not running on any node")
        })?;
        let node = self.ctx.store.node(node_name).ok_or_else(|| {
            Error::internal_with_context("host-model", format!("node {node_name} not found"))
        })?;
        pod::host_model_node_selector(node_name, node.labels())
    }

    /// Expand the VMI's PDBs before the second launcher appears
    ///
    /// Returns true once pod creation may go ahead.
    async fn pdbs_ready(&mut self) -> Result<bool, Error> {
        if !pdb::protects(self.vmi.spec.eviction_strategy, self.ctx.config.eviction_strategy()) {
            return Ok(true);
        }
        let pdbs = self
            .ctx
            .store
            .pdbs_for_vmi(&self.namespace, &self.vmi.uid().unwrap_or_default());
        let migration_name = self.migration.name_any();
        match pdb::evaluate(pdbs.iter().map(|p| p.as_ref()), &migration_name) {
            PdbState::NotRequired | PdbState::Ready => Ok(true),
            PdbState::Waiting => {
                debug!("Waiting for disruption controller to observe PDB change");
                Ok(false)
            }
            PdbState::NeedsPatch(name) => {
                self.ctx
                    .kube
                    .patch_pdb(&self.namespace, &name, &pdb::expansion_patch(&migration_name))
                    .await?;
                info!(pdb = %name, "Expanded PodDisruptionBudget for migration");
                self.event(
                    EventType::Normal,
                    reasons::SUCCESSFUL_UPDATE_PDB,
                    actions::PROTECT,
                    format!("Expanded PodDisruptionBudget {name}"),
                )
                .await;
                Ok(false)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Scheduling
    // -------------------------------------------------------------------------

    /// Apply both target pod timers
    ///
    /// Returns true when the pod was deleted and the pass should stop.
    async fn enforce_timeouts(&mut self, target: &Pod) -> Result<bool, Error> {
        if pod::is_unschedulable(target) {
            self.event(
                EventType::Warning,
                reasons::MIGRATION_TARGET_POD_UNSCHEDULABLE,
                actions::RECONCILE,
                format!("Migration target pod {} is unschedulable", target.name_any()),
            )
            .await;
            if self.vmi.is_host_model() {
                let nodes = self.ctx.store.all_nodes();
                if !pod::host_model_schedulable(target, nodes.iter().map(|n| n.labels())) {
                    self.event(
                        EventType::Warning,
                        reasons::NO_SUITABLE_NODES_FOR_HOST_MODEL_MIGRATION,
                        actions::RECONCILE,
                        "No node supports the source node's host-model CPU".to_string(),
                    )
                    .await;
                }
            }
        }

        if target.metadata.deletion_timestamp.is_some() {
            return Ok(false);
        }
        match timeout::evaluate(target, self.migration, Utc::now()) {
            TimeoutCheck::Expired(kind) => {
                info!(pod = %target.name_any(), reason = kind.as_str(), "Target pod timed out");
                PODS_TIMED_OUT.add(1, &[KeyValue::new("reason", kind.as_str())]);
                self.delete_pod(target, "Deleted timed out migration target pod")
                    .await?;
                Ok(true)
            }
            TimeoutCheck::Remaining(left) => {
                self.requeue_within(left);
                Ok(false)
            }
            TimeoutCheck::NotApplicable => Ok(false),
        }
    }

    async fn scheduling(&mut self) -> Result<(), Error> {
        let Some(target) = self.target() else {
            return Ok(());
        };
        if self.enforce_timeouts(&target).await? {
            return Ok(());
        }
        if !pod::is_launcher_ready(&target) {
            return Ok(());
        }
        if self.vmi.has_hotplug_volumes() {
            match self.pods.attachment().cloned() {
                None => return self.create_attachment_pod(&target).await,
                Some(att) if !pod::is_attachment_ready(&att) => {
                    debug!(pod = %att.name_any(), "Waiting for attachment pod");
                    return Ok(());
                }
                Some(_) => {}
            }
        }
        self.transition(MigrationPhase::Scheduled);
        Ok(())
    }

    async fn create_attachment_pod(&mut self, target: &Pod) -> Result<(), Error> {
        if self.ctx.awaiting_pod(&self.attachment_key()) {
            self.requeue_within(Duration::from_secs(5));
            return Ok(());
        }
        let attachment = pod::render_attachment_pod(
            self.migration,
            self.vmi,
            target,
            self.ctx.renderer.attachment_container(self.vmi),
        )?;
        let created = self.ctx.kube.create_pod(&self.namespace, &attachment).await?;
        self.ctx.expect_pod(self.attachment_key());
        PODS_CREATED.add(1, &[KeyValue::new("role", "attachment")]);
        self.event(
            EventType::Normal,
            reasons::SUCCESSFUL_CREATE_POD,
            actions::CREATE,
            format!("Created attachment pod {}", created.name_any()),
        )
        .await;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Handoff and progress
    // -------------------------------------------------------------------------

    async fn scheduled(&mut self) -> Result<(), Error> {
        if self.owned_state().is_some() || self.ctx.is_handed_off(&self.uid) {
            return Ok(());
        }
        let Some(target) = self.target() else {
            return Ok(());
        };
        self.handoff(&target).await
    }

    /// Hand the migration to the node agents with one conditional VMI patch
    async fn handoff(&mut self, target: &Pod) -> Result<(), Error> {
        let target_node = pod::node_name(target)
            .ok_or_else(|| Error::internal_with_context("handoff", "target pod has no node"))?
            .to_string();

        let (configuration, policy_name) = self.resolve_policy();

        let attachment_uid = if self.vmi.has_hotplug_volumes() {
            self.pods.attachment().and_then(|p| p.uid())
        } else {
            None
        };
        let desired = MigrationState {
            target_node: Some(target_node.clone()),
            target_pod: Some(target.name_any()),
            target_attachment_pod_uid: attachment_uid,
            source_node: self.vmi.node_name().map(str::to_string),
            migration_uid: Some(self.uid.clone()),
            migration_policy_name: policy_name,
            migration_configuration: Some(configuration),
            ..Default::default()
        };

        let mut labels = self.vmi.labels().clone();
        labels.insert(MIGRATION_TARGET_NODE_NAME_LABEL.to_string(), target_node.clone());

        // Labels are always tested, an unset map as empty
        let observed_labels = self.vmi.metadata.labels.clone().unwrap_or_default();
        let patch = JsonPatch::new()
            .test_and_set(MIGRATION_STATE_PATH, self.vmi.migration_state(), &desired)?
            .test_and_set(&["metadata", "labels"], Some(&observed_labels), &labels)?;
        self.ctx
            .kube
            .patch_vmi(&self.namespace, &self.vmi.name_any(), &patch)
            .await?;
        self.ctx.handoffs.insert(self.uid.clone());

        info!(target_node = %target_node, pod = %target.name_any(), "Handed migration off to node agents");
        self.event(
            EventType::Normal,
            reasons::SUCCESSFUL_HAND_OVER_POD,
            actions::HANDOFF,
            "Migration target pod is ready for preparation by virt-handler.".to_string(),
        )
        .await;
        Ok(())
    }

    /// Follow the node agents' progress through the VMI migration state
    fn advance(&mut self) {
        let Some(state) = self.owned_state() else {
            return;
        };
        let target_node = self.target().and_then(|p| pod::node_name(&p).map(str::to_string));
        loop {
            let next = match self.status.phase {
                MigrationPhase::Scheduled
                    if state.target_node.is_some()
                        && state.target_node == target_node
                        && state.source_node.as_deref() == self.vmi.node_name() =>
                {
                    MigrationPhase::PreparingTarget
                }
                MigrationPhase::PreparingTarget if state.target_node_address.is_some() => {
                    MigrationPhase::TargetReady
                }
                MigrationPhase::TargetReady if state.start_timestamp.is_some() => {
                    MigrationPhase::Running
                }
                MigrationPhase::Running if state.completed && !state.failed => {
                    MigrationPhase::Succeeded
                }
                _ => break,
            };
            self.transition(next);
        }
    }

    fn mirror_state(&mut self) {
        if let Some(state) = self.owned_state() {
            self.status.migration_state = Some(state.clone());
        }
    }
}
