//! CRD installation utilities
//!
//! The controller owns the migration and migration policy CRDs and installs
//! them with server-side apply, so the schema always matches the binary.
//! VirtualMachineInstance and KubeVirt belong to other components and are
//! never touched here.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use kubevirt_common::crd::{MigrationPolicy, VirtualMachineInstanceMigration};
use kubevirt_common::retry::{retry_with_backoff, RetryConfig};
use kubevirt_common::CONTROLLER_NAME;

/// CRD definition with name and resource
pub struct CrdDef {
    /// Full CRD name (plural.group)
    pub name: &'static str,
    /// The CRD object
    pub crd: CustomResourceDefinition,
}

/// CRDs owned by the migration controller
pub fn owned_crds() -> Vec<CrdDef> {
    vec![
        CrdDef {
            name: "virtualmachineinstancemigrations.kubevirt.io",
            crd: VirtualMachineInstanceMigration::crd(),
        },
        CrdDef {
            name: "migrationpolicies.migrations.kubevirt.io",
            crd: MigrationPolicy::crd(),
        },
    ]
}

/// Multi-document YAML for every owned CRD
pub fn render_yaml() -> anyhow::Result<String> {
    let docs = owned_crds()
        .into_iter()
        .map(|def| {
            serde_yaml::to_string(&def.crd)
                .map_err(|e| anyhow::anyhow!("failed to serialize {} CRD: {}", def.name, e))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(docs.join("---\n"))
}

/// Install owned CRDs, retrying while the API server is unavailable
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(CONTROLLER_NAME).force();
    let retry = RetryConfig::with_max_attempts(10);

    for def in owned_crds() {
        tracing::info!("Installing {} CRD...", def.name);
        retry_with_backoff(&retry, def.name, || {
            let crds = crds.clone();
            let params = params.clone();
            let crd = def.crd.clone();
            async move { crds.patch(def.name, &params, &Patch::Apply(&crd)).await }
        })
        .await
        .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", def.name, e))?;
    }

    tracing::info!("Migration CRDs installed/updated");
    Ok(())
}
