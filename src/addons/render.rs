//! Add-on manifest rendering.

use std::collections::BTreeMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use k8s_openapi::api::core::v1::ConfigMap;
use tracing::debug;

use crate::capi::Cluster;
use crate::error::{CapupError, Result};
use crate::k8s::ResourceClient;

/// ConfigMap holding the proxy settings kapp-controller runs with.
pub const KAPP_CONTROLLER_CONFIG: &str = "kapp-controller-config";
pub const KAPP_CONTROLLER_NAMESPACE: &str = "capup-system";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProxySettings {
    pub http_proxy: String,
    pub https_proxy: String,
    pub no_proxy: String,
}

impl ProxySettings {
    pub fn enabled(&self) -> bool {
        !self.http_proxy.is_empty()
    }
}

/// IP family of the cluster network. Dual stack is named primary first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpFamily {
    Ipv4,
    Ipv6,
    DualStackPrimaryIpv4,
    DualStackPrimaryIpv6,
}

impl IpFamily {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ipv4 => "ipv4",
            Self::Ipv6 => "ipv6",
            Self::DualStackPrimaryIpv4 => "ipv4,ipv6",
            Self::DualStackPrimaryIpv6 => "ipv6,ipv4",
        }
    }
}

fn cidr_is_v6(cidr: &str) -> Result<bool> {
    let addr = cidr.split('/').next().unwrap_or_default();
    addr.parse::<IpAddr>()
        .map(|ip| ip.is_ipv6())
        .map_err(|e| CapupError::InvalidInput(format!("invalid CIDR '{cidr}': {e}")))
}

/// Derive the IP family from the pod and service CIDRs, or `None` when the
/// cluster declares no network.
pub fn ip_family(cluster: &Cluster) -> Result<Option<IpFamily>> {
    let services = cluster.service_cidrs();
    let cidrs: Vec<String> = cluster.pod_cidrs().into_iter().chain(services.clone()).collect();
    if cidrs.is_empty() {
        return Ok(None);
    }
    let mut v4 = false;
    let mut v6 = false;
    for cidr in &cidrs {
        if cidr_is_v6(cidr)? {
            v6 = true;
        } else {
            v4 = true;
        }
    }
    let family = match (v4, v6) {
        (true, true) => {
            let primary = services.first().unwrap_or(&cidrs[0]);
            if cidr_is_v6(primary)? {
                IpFamily::DualStackPrimaryIpv6
            } else {
                IpFamily::DualStackPrimaryIpv4
            }
        }
        (false, true) => IpFamily::Ipv6,
        _ => IpFamily::Ipv4,
    };
    Ok(Some(family))
}

/// Everything an add-on template may refer to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderContext {
    pub cluster_name: String,
    pub cluster_namespace: String,
    /// Namespace the add-on objects land in.
    pub target_namespace: String,
    pub is_management: bool,
    pub edition: String,
    pub kubernetes_version: String,
    pub release_version: String,
    pub image_repository: String,
    pub proxy: ProxySettings,
    pub pod_cidrs: Vec<String>,
    pub service_cidrs: Vec<String>,
    pub ip_family: Option<IpFamily>,
}

impl RenderContext {
    /// Values available as `${NAME}` placeholders.
    pub fn variables(&self) -> BTreeMap<&'static str, String> {
        let role = if self.is_management { "management" } else { "workload" };
        BTreeMap::from([
            ("CLUSTER_NAME", self.cluster_name.clone()),
            ("CLUSTER_NAMESPACE", self.cluster_namespace.clone()),
            ("TARGET_NAMESPACE", self.target_namespace.clone()),
            ("CLUSTER_ROLE", role.to_string()),
            ("EDITION", self.edition.clone()),
            ("KUBERNETES_VERSION", self.kubernetes_version.clone()),
            ("RELEASE_VERSION", self.release_version.clone()),
            ("IMAGE_REPOSITORY", self.image_repository.clone()),
            ("HTTP_PROXY_ENABLED", self.proxy.enabled().to_string()),
            ("HTTP_PROXY", self.proxy.http_proxy.clone()),
            ("HTTPS_PROXY", self.proxy.https_proxy.clone()),
            ("NO_PROXY", self.proxy.no_proxy.clone()),
            ("CLUSTER_CIDR", self.pod_cidrs.join(",")),
            ("SERVICE_CIDR", self.service_cidrs.join(",")),
            (
                "IP_FAMILY",
                self.ip_family.map(IpFamily::as_str).unwrap_or_default().to_string(),
            ),
        ])
    }
}

/// Read proxy settings from the kapp-controller ConfigMap. A missing
/// ConfigMap means no proxy.
pub async fn proxy_settings<C: ResourceClient>(client: &C) -> Result<ProxySettings> {
    let Some(cm) = client
        .get_opt::<ConfigMap>(KAPP_CONTROLLER_CONFIG, KAPP_CONTROLLER_NAMESPACE)
        .await?
    else {
        debug!("No {KAPP_CONTROLLER_CONFIG} ConfigMap, rendering without proxy");
        return Ok(ProxySettings::default());
    };
    let data = cm.data.unwrap_or_default();
    let value = |key: &str| data.get(key).cloned().unwrap_or_default();
    Ok(ProxySettings {
        http_proxy: value("httpProxy"),
        https_proxy: value("httpsProxy"),
        no_proxy: value("noProxy"),
    })
}

/// Renders an add-on to multi-document YAML.
pub trait AddonRenderer: Send + Sync {
    fn render(&self, addon: &str, ctx: &RenderContext) -> Result<String>;
}

/// Reads `<dir>/<addon>.yaml` and fills in `${NAME}` placeholders.
#[derive(Clone, Debug)]
pub struct DirectoryRenderer {
    dir: PathBuf,
}

impl DirectoryRenderer {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn template_path(&self, addon: &str) -> PathBuf {
        self.dir.join(format!("{addon}.yaml"))
    }
}

impl AddonRenderer for DirectoryRenderer {
    fn render(&self, addon: &str, ctx: &RenderContext) -> Result<String> {
        let path = self.template_path(addon);
        let template = fs::read_to_string(&path).map_err(|e| {
            CapupError::InvalidInput(format!("failed to read {}: {e}", path.display()))
        })?;
        substitute(&template, &ctx.variables())
            .map_err(|e| CapupError::InvalidInput(format!("{}: {e}", path.display())))
    }
}

/// Replace every `${NAME}` in `template`. Unknown names are an error.
pub fn substitute(template: &str, variables: &BTreeMap<&'static str, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            CapupError::InvalidInput("unterminated '${' placeholder".to_string())
        })?;
        let name = &after[..end];
        let value = variables.get(name).ok_or_else(|| {
            CapupError::InvalidInput(format!("unknown placeholder '${{{name}}}'"))
        })?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use kube::api::ObjectMeta;
    use serde_json::json;

    use super::*;
    use crate::k8s::fake::FakeResourceClient;

    fn cluster_with_network(pods: &[&str], services: &[&str]) -> Cluster {
        serde_json::from_value(json!({
            "apiVersion": "cluster.x-k8s.io/v1beta1",
            "kind": "Cluster",
            "metadata": {"name": "wc-1", "namespace": "default"},
            "spec": {"clusterNetwork": {
                "pods": {"cidrBlocks": pods},
                "services": {"cidrBlocks": services}
            }}
        }))
        .unwrap()
    }

    #[test]
    fn test_ip_family() {
        let v4 = cluster_with_network(&["100.96.0.0/11"], &["100.64.0.0/13"]);
        assert_eq!(ip_family(&v4).unwrap(), Some(IpFamily::Ipv4));

        let v6 = cluster_with_network(&["fd00:100:96::/48"], &["fd00:100:64::/108"]);
        assert_eq!(ip_family(&v6).unwrap(), Some(IpFamily::Ipv6));

        let dual = cluster_with_network(
            &["100.96.0.0/11", "fd00:100:96::/48"],
            &["fd00:100:64::/108", "100.64.0.0/13"],
        );
        assert_eq!(ip_family(&dual).unwrap(), Some(IpFamily::DualStackPrimaryIpv6));

        let bad = cluster_with_network(&["not-a-cidr"], &[]);
        assert!(ip_family(&bad).is_err());

        let none = cluster_with_network(&[], &[]);
        assert_eq!(ip_family(&none).unwrap(), None);
    }

    #[test]
    fn test_substitute() {
        let vars = BTreeMap::from([("CLUSTER_NAME", "wc-1".to_string())]);
        assert_eq!(
            substitute("name: ${CLUSTER_NAME}-addon\n", &vars).unwrap(),
            "name: wc-1-addon\n"
        );
        assert_eq!(substitute("no placeholders", &vars).unwrap(), "no placeholders");

        let err = substitute("image: ${IMAGE_REPO}/x", &vars).unwrap_err();
        assert!(err.to_string().contains("unknown placeholder '${IMAGE_REPO}'"));
        assert!(substitute("broken ${CLUSTER_NAME", &vars).is_err());
    }

    #[test]
    fn test_directory_renderer() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("addons-management");
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(
            sub.join("kapp-controller.yaml"),
            "namespace: ${TARGET_NAMESPACE}\nimage: ${IMAGE_REPOSITORY}/kapp\nproxy: ${HTTP_PROXY_ENABLED}\n",
        )
        .unwrap();

        let ctx = RenderContext {
            target_namespace: "capup-system".to_string(),
            image_repository: "registry.example.com/capup".to_string(),
            ..Default::default()
        };
        let renderer = DirectoryRenderer::new(dir.path());
        let rendered = renderer
            .render("addons-management/kapp-controller", &ctx)
            .unwrap();
        assert_eq!(
            rendered,
            "namespace: capup-system\nimage: registry.example.com/capup/kapp\nproxy: false\n"
        );
        assert!(renderer.render("metadata/capup", &ctx).is_err());
    }

    #[tokio::test]
    async fn test_proxy_settings_from_configmap() {
        let fake = FakeResourceClient::new();
        assert_eq!(proxy_settings(&fake).await.unwrap(), ProxySettings::default());

        fake.insert(&ConfigMap {
            metadata: ObjectMeta {
                name: Some(KAPP_CONTROLLER_CONFIG.to_string()),
                namespace: Some(KAPP_CONTROLLER_NAMESPACE.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                ("httpProxy".to_string(), "http://proxy:3128".to_string()),
                ("noProxy".to_string(), "10.0.0.0/8".to_string()),
            ])),
            ..Default::default()
        });
        let proxy = proxy_settings(&fake).await.unwrap();
        assert!(proxy.enabled());
        assert_eq!(proxy.no_proxy, "10.0.0.0/8");
        assert_eq!(proxy.https_proxy, "");
    }
}
