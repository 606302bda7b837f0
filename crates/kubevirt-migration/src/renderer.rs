//! Container rendering for migration pods
//!
//! Computing launcher resources belongs to the VMI's own rendering code; the
//! reconciler only needs a container to drop into the pod it builds. The
//! [`ResourceRenderer`] seam lets tests and alternative deployments swap it.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;

use kubevirt_common::crd::VirtualMachineInstance;

use crate::pod::COMPUTE_CONTAINER;

/// Default virt-launcher image
pub const DEFAULT_LAUNCHER_IMAGE: &str = "quay.io/kubevirt/virt-launcher:latest";

const HOTPLUG_CONTAINER: &str = "hotplug-disk";

/// Renders the containers of migration pods from a VMI spec
pub trait ResourceRenderer: Send + Sync {
    /// The compute container of a target launcher pod
    fn launcher_container(&self, vmi: &VirtualMachineInstance) -> Container;

    /// The single container of an attachment pod
    fn attachment_container(&self, vmi: &VirtualMachineInstance) -> Container;
}

/// Renderer that copies the VMI's resource requests and limits
#[derive(Clone, Debug)]
pub struct DefaultResourceRenderer {
    launcher_image: String,
}

impl DefaultResourceRenderer {
    /// Renderer using the given launcher image
    pub fn new(launcher_image: impl Into<String>) -> Self {
        Self {
            launcher_image: launcher_image.into(),
        }
    }
}

impl Default for DefaultResourceRenderer {
    fn default() -> Self {
        Self::new(DEFAULT_LAUNCHER_IMAGE)
    }
}

fn copy(list: &Option<BTreeMap<String, Quantity>>) -> Option<BTreeMap<String, Quantity>> {
    list.as_ref().filter(|l| !l.is_empty()).cloned()
}

impl ResourceRenderer for DefaultResourceRenderer {
    fn launcher_container(&self, vmi: &VirtualMachineInstance) -> Container {
        let resources = &vmi.spec.domain.resources;
        Container {
            name: COMPUTE_CONTAINER.to_string(),
            image: Some(self.launcher_image.clone()),
            command: Some(vec![
                "/usr/bin/virt-launcher-monitor".to_string(),
                "--name".to_string(),
                vmi.name_any(),
                "--namespace".to_string(),
                vmi.namespace().unwrap_or_default(),
                "--uid".to_string(),
                vmi.uid().unwrap_or_default(),
            ]),
            resources: Some(ResourceRequirements {
                requests: copy(&resources.requests),
                limits: copy(&resources.limits),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn attachment_container(&self, _vmi: &VirtualMachineInstance) -> Container {
        Container {
            name: HOTPLUG_CONTAINER.to_string(),
            image: Some(self.launcher_image.clone()),
            command: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "/usr/bin/container-disk --copy-path /path/hp".to_string(),
            ]),
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([
                    ("cpu".to_string(), Quantity("10m".to_string())),
                    ("memory".to_string(), Quantity("2M".to_string())),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubevirt_common::crd::VirtualMachineInstanceSpec;

    fn vmi_with_memory(memory: &str) -> VirtualMachineInstance {
        let mut vmi = VirtualMachineInstance::new("testvmi", VirtualMachineInstanceSpec::default());
        vmi.metadata.namespace = Some("default".to_string());
        vmi.metadata.uid = Some("vmi-uid".to_string());
        vmi.spec.domain.resources.requests = Some(BTreeMap::from([(
            "memory".to_string(),
            Quantity(memory.to_string()),
        )]));
        vmi
    }

    #[test]
    fn launcher_copies_vmi_requests() {
        let container = DefaultResourceRenderer::default().launcher_container(&vmi_with_memory("2Gi"));
        assert_eq!(container.name, COMPUTE_CONTAINER);
        assert_eq!(container.image.as_deref(), Some(DEFAULT_LAUNCHER_IMAGE));
        let resources = container.resources.unwrap();
        assert_eq!(
            resources.requests.unwrap().get("memory"),
            Some(&Quantity("2Gi".to_string()))
        );
        assert_eq!(resources.limits, None);
    }

    #[test]
    fn custom_image_is_used_for_both_containers() {
        let renderer = DefaultResourceRenderer::new("registry.local/launcher:v1");
        let vmi = vmi_with_memory("1Gi");
        assert_eq!(
            renderer.launcher_container(&vmi).image.as_deref(),
            Some("registry.local/launcher:v1")
        );
        assert_eq!(
            renderer.attachment_container(&vmi).image.as_deref(),
            Some("registry.local/launcher:v1")
        );
    }
}
