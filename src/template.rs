//! Infrastructure template manager.
//!
//! Decides whether a machine template can be reused for a target release or
//! whether a fresh copy pointing at the new image must be created first.

pub mod provider;

use kube::{Resource, ResourceExt};
use rand::Rng;
use tracing::{debug, info};

use crate::capi::infra::{
    AWSMachineTemplate, AzureMachineTemplate, DockerMachineTemplate, VSphereMachineTemplate,
};
use crate::capi::{ObjectReference, Provider};
use crate::error::{CapupError, Result};
use crate::k8s::ResourceClient;
use crate::release::ImageIdentity;
use crate::release::version::sanitize_version;

pub use provider::ProviderTemplate;

const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SUFFIX_LEN: usize = 5;

/// Which object the template belongs to; drives the new template's name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TemplateScope<'a> {
    ControlPlane { cluster: &'a str },
    Worker,
}

/// Template reference to use and whether it was just created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemplateDecision {
    pub reference: ObjectReference,
    pub created: bool,
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..SUFFIX_LEN)
        .map(|_| char::from(SUFFIX_CHARSET[rng.gen_range(0..SUFFIX_CHARSET.len())]))
        .collect()
}

/// `<cluster>-control-plane-<version>-<suffix>`
pub fn control_plane_template_name(cluster: &str, version: &str) -> String {
    format!(
        "{cluster}-control-plane-{}-{}",
        sanitize_version(version),
        random_suffix()
    )
}

/// `<existing>-<version>-<suffix>`
pub fn worker_template_name(existing: &str, version: &str) -> String {
    format!("{existing}-{}-{}", sanitize_version(version), random_suffix())
}

impl TemplateScope<'_> {
    fn new_name(self, existing: &str, version: &str) -> String {
        match self {
            Self::ControlPlane { cluster } => control_plane_template_name(cluster, version),
            Self::Worker => worker_template_name(existing, version),
        }
    }
}

/// Reuse the template behind `existing` or create a copy pointing at `target`.
///
/// A new template is created when the actual version is unknown, differs
/// from `target_version`, or the existing template's image identity differs
/// from `target`. `namespace` is used when the reference carries none.
pub async fn ensure_template<C: ResourceClient>(
    client: &C,
    scope: TemplateScope<'_>,
    existing: &ObjectReference,
    namespace: &str,
    actual_version: Option<&str>,
    target_version: &str,
    target: &ImageIdentity,
) -> Result<TemplateDecision> {
    let provider = Provider::from_template_kind(&existing.kind).ok_or_else(|| {
        CapupError::InvalidInput(format!(
            "unsupported infrastructure template kind '{}'",
            existing.kind
        ))
    })?;
    let request = EnsureRequest {
        scope,
        existing,
        namespace,
        actual_version,
        target_version,
        target,
    };
    match provider {
        Provider::VSphere => ensure_typed::<C, VSphereMachineTemplate>(client, &request).await,
        Provider::Aws => ensure_typed::<C, AWSMachineTemplate>(client, &request).await,
        Provider::Azure => ensure_typed::<C, AzureMachineTemplate>(client, &request).await,
        Provider::Docker => ensure_typed::<C, DockerMachineTemplate>(client, &request).await,
    }
}

struct EnsureRequest<'a> {
    scope: TemplateScope<'a>,
    existing: &'a ObjectReference,
    namespace: &'a str,
    actual_version: Option<&'a str>,
    target_version: &'a str,
    target: &'a ImageIdentity,
}

async fn ensure_typed<C, T>(client: &C, req: &EnsureRequest<'_>) -> Result<TemplateDecision>
where
    C: ResourceClient,
    T: ProviderTemplate,
{
    let namespace = if req.existing.namespace.is_empty() {
        req.namespace
    } else {
        req.existing.namespace.as_str()
    };
    let current: T = client.get(&req.existing.name, namespace).await?;

    let version_matches = req.actual_version == Some(req.target_version);
    if version_matches && current.identity_matches(req.target) {
        debug!(
            kind = %req.existing.kind,
            name = %req.existing.name,
            "Reusing infrastructure template"
        );
        return Ok(TemplateDecision {
            reference: req.existing.clone(),
            created: false,
        });
    }

    let name = req.scope.new_name(&req.existing.name, req.target_version);
    let mut copy = current.with_identity(&name, req.target)?;
    if copy.namespace().is_none() {
        copy.meta_mut().namespace = Some(namespace.to_string());
    }
    let created = client.create(&copy).await?;
    info!(
        kind = %req.existing.kind,
        from = %req.existing.name,
        to = %created.name_any(),
        image = %req.target,
        "Created infrastructure template"
    );

    Ok(TemplateDecision {
        reference: ObjectReference {
            api_version: T::api_version(&()).to_string(),
            kind: T::kind(&()).to_string(),
            name: created.name_any(),
            namespace: req.existing.namespace.clone(),
        },
        created: true,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::k8s::fake::{FakeResourceClient, Verb};
    use crate::snapshot::fixtures::{NAMESPACE, template_ref};

    const VERSION: &str = "v1.21.2+vmware.1";

    fn aws_template(name: &str, ami: &str) -> AWSMachineTemplate {
        serde_json::from_value(json!({
            "apiVersion": "infrastructure.cluster.x-k8s.io/v1beta2",
            "kind": "AWSMachineTemplate",
            "metadata": {"name": name, "namespace": NAMESPACE},
            "spec": {"template": {"spec": {"ami": {"id": ami}, "instanceType": "m5.large"}}}
        }))
        .unwrap()
    }

    fn ami(id: &str) -> ImageIdentity {
        ImageIdentity::Aws {
            ami_id: id.to_string(),
        }
    }

    fn seeded() -> FakeResourceClient {
        let fake = FakeResourceClient::new();
        fake.insert(&aws_template("wc-1-control-plane", "ami-new"));
        fake
    }

    #[test]
    fn test_template_names() {
        let cp = control_plane_template_name("wc-1", VERSION);
        assert!(cp.starts_with("wc-1-control-plane-v1-21-2-vmware-1-"));
        let suffix = cp.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 5);
        assert!(suffix.bytes().all(|b| SUFFIX_CHARSET.contains(&b)));

        let worker = worker_template_name("wc-1-md-0", VERSION);
        assert!(worker.starts_with("wc-1-md-0-v1-21-2-vmware-1-"));
        assert_ne!(worker, worker_template_name("wc-1-md-0", VERSION));
    }

    #[tokio::test]
    async fn test_reuse_when_version_and_identity_match() {
        let fake = seeded();
        let existing = template_ref("AWSMachineTemplate", "wc-1-control-plane");
        let decision = ensure_template(
            &fake,
            TemplateScope::ControlPlane { cluster: "wc-1" },
            &existing,
            NAMESPACE,
            Some(VERSION),
            VERSION,
            &ami("ami-new"),
        )
        .await
        .unwrap();
        assert!(!decision.created);
        assert_eq!(decision.reference, existing);
        assert!(fake.calls_for(Verb::Create, "AWSMachineTemplate").is_empty());
    }

    #[tokio::test]
    async fn test_unknown_actual_version_always_creates() {
        let fake = FakeResourceClient::new();
        let mut vsphere: VSphereMachineTemplate = serde_json::from_value(json!({
            "apiVersion": "infrastructure.cluster.x-k8s.io/v1beta1",
            "kind": "VSphereMachineTemplate",
            "metadata": {"name": "wc-1-control-plane", "namespace": NAMESPACE},
            "spec": {"template": {"spec": {"template": "/dc0/vm/photon-3-kube-v1.21.2", "numCPUs": 4}}}
        }))
        .unwrap();
        vsphere.metadata.annotations = Some([("vmTemplateMoid".to_string(), "vm-7".to_string())].into());
        fake.insert(&vsphere);
        let target = ImageIdentity::VSphere {
            template: "/dc0/vm/photon-3-kube-v1.21.2".to_string(),
            moid: "vm-7".to_string(),
        };

        let decision = ensure_template(
            &fake,
            TemplateScope::ControlPlane { cluster: "wc-1" },
            &template_ref("VSphereMachineTemplate", "wc-1-control-plane"),
            NAMESPACE,
            None,
            VERSION,
            &target,
        )
        .await
        .unwrap();

        assert!(decision.created);
        assert!(decision.reference.name.starts_with("wc-1-control-plane-v1-21-2-vmware-1-"));
        assert_eq!(decision.reference.kind, "VSphereMachineTemplate");
        let created: VSphereMachineTemplate =
            fake.object(&decision.reference.name, NAMESPACE).unwrap();
        assert!(created.identity_matches(&target));
        assert_eq!(fake.calls_for(Verb::Create, "VSphereMachineTemplate").len(), 1);
    }

    #[tokio::test]
    async fn test_version_change_creates_worker_copy() {
        let fake = FakeResourceClient::new();
        fake.insert(&aws_template("wc-1-md-0", "ami-new"));
        let decision = ensure_template(
            &fake,
            TemplateScope::Worker,
            &template_ref("AWSMachineTemplate", "wc-1-md-0"),
            NAMESPACE,
            Some("v1.20.5+vmware.1"),
            VERSION,
            &ami("ami-new"),
        )
        .await
        .unwrap();
        assert!(decision.created);
        assert!(decision.reference.name.starts_with("wc-1-md-0-v1-21-2-vmware-1-"));
        assert_eq!(decision.reference.namespace, NAMESPACE);
    }

    #[tokio::test]
    async fn test_identity_change_creates_copy_with_target_image() {
        let fake = FakeResourceClient::new();
        fake.insert(&aws_template("wc-1-control-plane", "ami-old"));
        let decision = ensure_template(
            &fake,
            TemplateScope::ControlPlane { cluster: "wc-1" },
            &template_ref("AWSMachineTemplate", "wc-1-control-plane"),
            NAMESPACE,
            Some(VERSION),
            VERSION,
            &ami("ami-new"),
        )
        .await
        .unwrap();
        assert!(decision.created);
        let created: AWSMachineTemplate = fake.object(&decision.reference.name, NAMESPACE).unwrap();
        assert_eq!(created.spec.template.spec.ami.id.as_deref(), Some("ami-new"));
        let original: AWSMachineTemplate = fake.object("wc-1-control-plane", NAMESPACE).unwrap();
        assert_eq!(original.spec.template.spec.ami.id.as_deref(), Some("ami-old"));
    }

    #[tokio::test]
    async fn test_unsupported_kind_is_rejected() {
        let fake = FakeResourceClient::new();
        let err = ensure_template(
            &fake,
            TemplateScope::Worker,
            &template_ref("OpenStackMachineTemplate", "x"),
            NAMESPACE,
            None,
            VERSION,
            &ami("ami-new"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_failure_is_returned() {
        let fake = seeded();
        fake.fail_on(Verb::Create, "AWSMachineTemplate", "admission webhook denied");
        let err = ensure_template(
            &fake,
            TemplateScope::ControlPlane { cluster: "wc-1" },
            &template_ref("AWSMachineTemplate", "wc-1-control-plane"),
            NAMESPACE,
            None,
            VERSION,
            &ami("ami-new"),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("admission webhook denied"));
    }

    #[tokio::test]
    async fn test_missing_template_is_not_found() {
        let fake = FakeResourceClient::new();
        let err = ensure_template(
            &fake,
            TemplateScope::Worker,
            &template_ref("DockerMachineTemplate", "gone"),
            NAMESPACE,
            Some(VERSION),
            VERSION,
            &ImageIdentity::Docker {
                image: "kindest/node:v1.21.2".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert!(err.is_not_found());
    }
}
