//! Resource access against Kubernetes-compatible API servers.
//!
//! Everything above this module talks to the API through [`ResourceClient`],
//! so the classifier, the template manager and the orchestrator run the same
//! way against a live cluster and against the in-memory fake used in tests.

pub mod client;
#[cfg(test)]
pub mod fake;

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use kube::Resource;
use kube::core::NamespaceResourceScope;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::Result;

pub use client::{KubeResourceClient, workload_client};

/// Body of a patch request: JSON merge patch (RFC 7396) or JSON patch (RFC 6902).
#[derive(Clone, Debug, PartialEq)]
pub enum PatchBody {
    Merge(Value),
    Json(json_patch::Patch),
}

/// Any namespaced, statically typed Kubernetes object.
pub trait ClusterObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> ClusterObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Namespace and label-equality filter for list calls.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListScope {
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl ListScope {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_namespace(namespace: Option<&str>) -> Self {
        Self {
            namespace: namespace.map(ToString::to_string),
            labels: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Selector string in `k=v,k2=v2` form, or `None` when unfiltered.
    pub fn label_selector(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        Some(
            self.labels
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    pub fn matches(&self, namespace: Option<&str>, labels: &BTreeMap<String, String>) -> bool {
        if let Some(ns) = &self.namespace
            && namespace != Some(ns.as_str())
        {
            return false;
        }
        self.labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}

/// Typed get/list/create/update/patch/delete plus manifest apply.
///
/// Not-found surfaces as an error of kind `NotFound`; use [`ResourceClient::get_opt`]
/// for optional objects.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get<K: ClusterObject>(&self, name: &str, namespace: &str) -> Result<K>;

    async fn get_opt<K: ClusterObject>(&self, name: &str, namespace: &str) -> Result<Option<K>> {
        match self.get::<K>(name, namespace).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list<K: ClusterObject>(&self, scope: &ListScope) -> Result<Vec<K>>;

    async fn create<K: ClusterObject>(&self, obj: &K) -> Result<K>;

    async fn update<K: ClusterObject>(&self, obj: &K) -> Result<K>;

    async fn patch<K: ClusterObject>(
        &self,
        name: &str,
        namespace: &str,
        patch: &PatchBody,
    ) -> Result<K>;

    async fn delete<K: ClusterObject>(&self, name: &str, namespace: &str) -> Result<()>;

    /// Server-side apply every document of a multi-document YAML manifest.
    async fn apply_manifest(&self, manifest: &str) -> Result<()>;
}
