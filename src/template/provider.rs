//! Per-provider image identity on machine templates.

use std::collections::BTreeMap;

use kube::ResourceExt;

use crate::capi::infra::{
    AWSMachineTemplate, AzureImage, AzureMachineTemplate, DockerMachineTemplate,
    VM_TEMPLATE_MOID_ANNOTATION, VSphereMachineTemplate,
};
use crate::capi::Provider;
use crate::error::{CapupError, Result};
use crate::k8s::ClusterObject;
use crate::release::{AzureImageIdentity, ImageIdentity};

/// A provider machine template whose image identity can be compared and replaced.
pub trait ProviderTemplate: ClusterObject {
    const PROVIDER: Provider;

    /// Whether the template already points at `target`.
    fn identity_matches(&self, target: &ImageIdentity) -> bool;

    /// Build a new template named `name` in the same namespace, with this
    /// template's spec and `target` as its image identity.
    fn with_identity(&self, name: &str, target: &ImageIdentity) -> Result<Self>;
}

fn mismatch(provider: Provider, target: &ImageIdentity) -> CapupError {
    CapupError::InvalidInput(format!(
        "{} image cannot be applied to a {provider} template",
        target.provider()
    ))
}

impl ProviderTemplate for VSphereMachineTemplate {
    const PROVIDER: Provider = Provider::VSphere;

    /// Only the MOID is compared; the template path is informational.
    fn identity_matches(&self, target: &ImageIdentity) -> bool {
        let ImageIdentity::VSphere { moid, .. } = target else {
            return false;
        };
        self.annotations()
            .get(VM_TEMPLATE_MOID_ANNOTATION)
            .is_some_and(|current| current == moid)
    }

    fn with_identity(&self, name: &str, target: &ImageIdentity) -> Result<Self> {
        let ImageIdentity::VSphere { template, moid } = target else {
            return Err(mismatch(Self::PROVIDER, target));
        };
        let mut spec = self.spec.clone();
        spec.template.spec.template.clone_from(template);
        let mut copy = Self::new(name, spec);
        copy.metadata.namespace = self.namespace();
        copy.metadata.annotations = Some(BTreeMap::from([(
            VM_TEMPLATE_MOID_ANNOTATION.to_string(),
            moid.clone(),
        )]));
        Ok(copy)
    }
}

impl ProviderTemplate for AWSMachineTemplate {
    const PROVIDER: Provider = Provider::Aws;

    fn identity_matches(&self, target: &ImageIdentity) -> bool {
        let ImageIdentity::Aws { ami_id } = target else {
            return false;
        };
        self.spec.template.spec.ami.id.as_deref() == Some(ami_id.as_str())
    }

    fn with_identity(&self, name: &str, target: &ImageIdentity) -> Result<Self> {
        let ImageIdentity::Aws { ami_id } = target else {
            return Err(mismatch(Self::PROVIDER, target));
        };
        let mut spec = self.spec.clone();
        spec.template.spec.ami.id = Some(ami_id.clone());
        let mut copy = Self::new(name, spec);
        copy.metadata.namespace = self.namespace();
        Ok(copy)
    }
}

impl ProviderTemplate for AzureMachineTemplate {
    const PROVIDER: Provider = Provider::Azure;

    /// Compares every field of the image kind the target uses.
    fn identity_matches(&self, target: &ImageIdentity) -> bool {
        let ImageIdentity::Azure(wanted) = target else {
            return false;
        };
        let Some(image) = self.spec.template.spec.image.as_ref() else {
            return false;
        };
        match wanted {
            AzureImageIdentity::Marketplace(m) => image.marketplace.as_ref() == Some(m),
            AzureImageIdentity::SharedGallery(g) => image.shared_gallery.as_ref() == Some(g),
        }
    }

    fn with_identity(&self, name: &str, target: &ImageIdentity) -> Result<Self> {
        let ImageIdentity::Azure(wanted) = target else {
            return Err(mismatch(Self::PROVIDER, target));
        };
        let image = match wanted {
            AzureImageIdentity::Marketplace(m) => AzureImage {
                marketplace: Some(m.clone()),
                shared_gallery: None,
            },
            AzureImageIdentity::SharedGallery(g) => AzureImage {
                marketplace: None,
                shared_gallery: Some(g.clone()),
            },
        };
        let mut spec = self.spec.clone();
        spec.template.spec.image = Some(image);
        let mut copy = Self::new(name, spec);
        copy.metadata.namespace = self.namespace();
        Ok(copy)
    }
}

impl ProviderTemplate for DockerMachineTemplate {
    const PROVIDER: Provider = Provider::Docker;

    fn identity_matches(&self, target: &ImageIdentity) -> bool {
        let ImageIdentity::Docker { image } = target else {
            return false;
        };
        !self.spec.template.spec.custom_image.is_empty()
            && self.spec.template.spec.custom_image == *image
    }

    fn with_identity(&self, name: &str, target: &ImageIdentity) -> Result<Self> {
        let ImageIdentity::Docker { image } = target else {
            return Err(mismatch(Self::PROVIDER, target));
        };
        let mut spec = self.spec.clone();
        spec.template.spec.custom_image.clone_from(image);
        let mut copy = Self::new(name, spec);
        copy.metadata.namespace = self.namespace();
        Ok(copy)
    }
}
