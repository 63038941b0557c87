//! Kubernetes client builder with kubeconfig context support, and the
//! `kube`-backed [`ResourceClient`].

use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch,
    PatchParams, PostParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Resource, ResourceExt};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{ClusterObject, ListScope, PatchBody, ResourceClient};
use crate::error::{CapupError, Result};

const FIELD_MANAGER: &str = "capup";

/// [`ResourceClient`] backed by a live API server.
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
}

impl KubeResourceClient {
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from kubeconfig.
    ///
    /// Uses the given file and context if provided, otherwise the default
    /// kubeconfig resolution (including in-cluster config).
    pub async fn connect(kubeconfig: Option<&Path>, context: Option<&str>) -> Result<Self> {
        let client = match (kubeconfig, context) {
            (None, None) => {
                debug!("Using default kubeconfig context");
                Client::try_default()
                    .await
                    .map_err(|e| CapupError::KubernetesApi(format!("kubeconfig: {e}")))?
            }
            (path, ctx) => {
                debug!(kubeconfig = ?path, context = ?ctx, "Using explicit kubeconfig");
                let kubeconfig = match path {
                    Some(path) => Kubeconfig::read_from(path),
                    None => Kubeconfig::read(),
                }
                .map_err(|e| CapupError::KubernetesApi(format!("kubeconfig: {e}")))?;
                let options = KubeConfigOptions {
                    context: ctx.map(ToString::to_string),
                    ..Default::default()
                };
                let config = Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| {
                        CapupError::KubernetesApi(format!("context '{}': {e}", ctx.unwrap_or("")))
                    })?;
                Client::try_from(config)
                    .map_err(|e| CapupError::KubernetesApi(format!("client: {e}")))?
            }
        };
        Ok(Self { client })
    }

    fn api<K: ClusterObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn apply_document(&self, obj: Value) -> Result<()> {
        let field = |pointer: &str| {
            obj.pointer(pointer)
                .and_then(Value::as_str)
                .map(ToString::to_string)
                .ok_or_else(|| CapupError::InvalidInput(format!("manifest missing {pointer}")))
        };
        let kind = field("/kind")?;
        let api_version = field("/apiVersion")?;
        let name = field("/metadata/name")?;
        let namespace = obj
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .map(ToString::to_string);

        let (group, version) = api_version
            .split_once('/')
            .map_or((String::new(), api_version.clone()), |(g, v)| {
                (g.to_string(), v.to_string())
            });
        let gvk = GroupVersionKind {
            group,
            version,
            kind: kind.clone(),
        };
        let resource = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> = match namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        };

        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&name, &params, &Patch::Apply(&obj))
            .await
            .map_err(|e| {
                CapupError::from_kube(&kind, namespace.as_deref().unwrap_or(""), &name, e)
            })?;

        debug!(kind = %kind, name = %name, "Applied manifest");
        Ok(())
    }
}

fn kind_of<K: ClusterObject>() -> String {
    K::kind(&()).to_string()
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn get<K: ClusterObject>(&self, name: &str, namespace: &str) -> Result<K> {
        self.api::<K>(namespace)
            .get(name)
            .await
            .map_err(|e| CapupError::from_kube(&kind_of::<K>(), namespace, name, e))
    }

    async fn list<K: ClusterObject>(&self, scope: &ListScope) -> Result<Vec<K>> {
        let api: Api<K> = match &scope.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let mut params = ListParams::default();
        if let Some(selector) = scope.label_selector() {
            params = params.labels(&selector);
        }
        let list = api.list(&params).await.map_err(|e| {
            CapupError::from_kube(
                &kind_of::<K>(),
                scope.namespace.as_deref().unwrap_or(""),
                "",
                e,
            )
        })?;
        Ok(list.items)
    }

    async fn create<K: ClusterObject>(&self, obj: &K) -> Result<K> {
        let namespace = obj.namespace().unwrap_or_default();
        self.api::<K>(&namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| CapupError::from_kube(&kind_of::<K>(), &namespace, &obj.name_any(), e))
    }

    async fn update<K: ClusterObject>(&self, obj: &K) -> Result<K> {
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        self.api::<K>(&namespace)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| CapupError::from_kube(&kind_of::<K>(), &namespace, &name, e))
    }

    async fn patch<K: ClusterObject>(
        &self,
        name: &str,
        namespace: &str,
        patch: &PatchBody,
    ) -> Result<K> {
        match patch {
            PatchBody::Merge(body) => self
                .api::<K>(namespace)
                .patch(name, &PatchParams::default(), &Patch::Merge(body))
                .await
                .map_err(|e| CapupError::from_kube(&kind_of::<K>(), namespace, name, e)),
            PatchBody::Json(ops) => self
                .api::<K>(namespace)
                .patch(name, &PatchParams::default(), &Patch::Json::<()>(ops.clone()))
                .await
                .map_err(|e| CapupError::from_kube(&kind_of::<K>(), namespace, name, e)),
        }
    }

    async fn delete<K: ClusterObject>(&self, name: &str, namespace: &str) -> Result<()> {
        self.api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| CapupError::from_kube(&kind_of::<K>(), namespace, name, e))?;
        Ok(())
    }

    async fn apply_manifest(&self, manifest: &str) -> Result<()> {
        // Parse up front: the YAML deserializer is not `Send`, so it cannot be
        // held across the `.await` below. Parsing stops at the first error,
        // which is surfaced in document order after earlier documents apply.
        let mut parsed = Vec::new();
        for document in serde_yaml::Deserializer::from_str(manifest) {
            let result = Value::deserialize(document);
            let failed = result.is_err();
            parsed.push(result);
            if failed {
                break;
            }
        }
        for result in parsed {
            let obj =
                result.map_err(|e| CapupError::InvalidInput(format!("invalid YAML: {e}")))?;
            if obj.is_null() {
                continue;
            }
            self.apply_document(obj).await?;
        }
        Ok(())
    }
}

/// Name of the Secret holding a workload cluster's admin kubeconfig.
pub fn kubeconfig_secret_name(cluster: &str) -> String {
    format!("{cluster}-kubeconfig")
}

/// Read the kubeconfig bytes CAPI stores for a workload cluster.
pub async fn workload_kubeconfig<C: ResourceClient>(
    management: &C,
    cluster: &str,
    namespace: &str,
) -> Result<String> {
    let secret_name = kubeconfig_secret_name(cluster);
    let secret: Secret = management.get(&secret_name, namespace).await?;
    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get("value"))
        .ok_or_else(|| {
            CapupError::InvalidInput(format!(
                "secret {namespace}/{secret_name} has no 'value' key"
            ))
        })?;
    String::from_utf8(bytes.0.clone()).map_err(|e| {
        CapupError::InvalidInput(format!("secret {namespace}/{secret_name}: {e}"))
    })
}

/// Build a client for a workload cluster from its kubeconfig Secret on the
/// management cluster.
pub async fn workload_client<C: ResourceClient>(
    management: &C,
    cluster: &str,
    namespace: &str,
) -> Result<KubeResourceClient> {
    let raw = workload_kubeconfig(management, cluster, namespace).await?;
    let kubeconfig = Kubeconfig::from_yaml(&raw)
        .map_err(|e| CapupError::InvalidInput(format!("workload kubeconfig: {e}")))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| CapupError::KubernetesApi(format!("workload kubeconfig: {e}")))?;
    let client = Client::try_from(config)
        .map_err(|e| CapupError::KubernetesApi(format!("workload client: {e}")))?;
    debug!(cluster = %cluster, namespace = %namespace, "Built workload cluster client");
    Ok(KubeResourceClient::new(client))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;

    use super::*;
    use crate::k8s::fake::FakeResourceClient;

    #[test]
    fn test_kubeconfig_secret_name() {
        assert_eq!(kubeconfig_secret_name("wc-1"), "wc-1-kubeconfig");
    }

    fn secret(name: &str, data: Option<(&str, &str)>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            data: data.map(|(k, v)| {
                BTreeMap::from([(k.to_string(), ByteString(v.as_bytes().to_vec()))])
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_workload_kubeconfig_reads_value_key() {
        let fake = FakeResourceClient::new();
        fake.insert(&secret("wc-1-kubeconfig", Some(("value", "apiVersion: v1"))));
        let raw = workload_kubeconfig(&fake, "wc-1", "default").await.unwrap();
        assert_eq!(raw, "apiVersion: v1");
    }

    #[tokio::test]
    async fn test_workload_kubeconfig_missing_key() {
        let fake = FakeResourceClient::new();
        fake.insert(&secret("wc-1-kubeconfig", Some(("other", "x"))));
        let err = workload_kubeconfig(&fake, "wc-1", "default")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no 'value' key"));
    }

    #[tokio::test]
    async fn test_workload_kubeconfig_missing_secret() {
        let fake = FakeResourceClient::new();
        let err = workload_kubeconfig(&fake, "wc-1", "default")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
