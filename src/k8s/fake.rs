//! In-memory [`ResourceClient`] for tests.
//!
//! Objects are stored as JSON keyed by (kind, namespace, name). Every call is
//! recorded, failures can be injected per verb and kind, and reactors can
//! mutate the store after a write to simulate controllers converging.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use serde::Deserialize;
use serde_json::Value;

use super::{ClusterObject, ListScope, PatchBody, ResourceClient};
use crate::error::{CapupError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    Patch,
    Delete,
    Apply,
}

impl Verb {
    pub const fn is_mutation(self) -> bool {
        !matches!(self, Self::Get | Self::List)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub verb: Verb,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub patch: Option<Value>,
}

pub type ObjectKey = (String, String, String);
pub type Objects = BTreeMap<ObjectKey, Value>;
type Reactor = Arc<dyn Fn(&ObjectKey, &mut Objects) + Send + Sync>;

struct Failure {
    verb: Verb,
    kind: String,
    message: String,
    remaining: Option<usize>,
}

#[derive(Default)]
struct State {
    objects: Objects,
    calls: Vec<Call>,
    failures: Vec<Failure>,
    reactors: Vec<(Verb, String, Reactor)>,
    applied: Vec<String>,
    resource_version: u64,
}

#[derive(Default)]
pub struct FakeResourceClient {
    state: Mutex<State>,
}

fn key(kind: &str, namespace: &str, name: &str) -> ObjectKey {
    (kind.to_string(), namespace.to_string(), name.to_string())
}

fn labels_of(obj: &Value) -> BTreeMap<String, String> {
    obj.pointer("/metadata/labels")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

fn decode<K: ClusterObject>(value: Value) -> Result<K> {
    serde_json::from_value(value).map_err(|e| CapupError::InvalidInput(e.to_string()))
}

fn encode<K: ClusterObject>(obj: &K) -> Value {
    let mut value = serde_json::to_value(obj).unwrap_or(Value::Null);
    // Typed objects built in tests often leave these out.
    if let Value::Object(map) = &mut value {
        map.entry("apiVersion")
            .or_insert_with(|| Value::String(K::api_version(&()).to_string()));
        map.entry("kind")
            .or_insert_with(|| Value::String(K::kind(&()).to_string()));
    }
    value
}

impl FakeResourceClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Seed an object without recording a call.
    pub fn insert<K: ClusterObject>(&self, obj: &K) {
        let mut state = self.lock();
        let namespace = obj.namespace().unwrap_or_default();
        let value = encode(obj);
        state
            .objects
            .insert(key(&K::kind(&()), &namespace, &obj.name_any()), value);
    }

    pub fn object<K: ClusterObject>(&self, name: &str, namespace: &str) -> Option<K> {
        let state = self.lock();
        state
            .objects
            .get(&key(&K::kind(&()), namespace, name))
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn objects_of_kind(&self, kind: &str) -> Vec<Value> {
        self.lock()
            .objects
            .iter()
            .filter(|((k, _, _), _)| k == kind)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Mutate a stored object in place.
    pub fn modify(&self, kind: &str, namespace: &str, name: &str, f: impl FnOnce(&mut Value)) {
        if let Some(obj) = self.lock().objects.get_mut(&key(kind, namespace, name)) {
            f(obj);
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, verb: Verb, kind: &str) -> Vec<Call> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.verb == verb && c.kind == kind)
            .cloned()
            .collect()
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.verb.is_mutation())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn applied_manifests(&self) -> Vec<String> {
        self.lock().applied.clone()
    }

    /// Fail every matching call with a resource-access error.
    pub fn fail_on(&self, verb: Verb, kind: &str, message: &str) {
        self.push_failure(verb, kind, message, None);
    }

    /// Fail the next `times` matching calls, then succeed.
    pub fn fail_times(&self, verb: Verb, kind: &str, times: usize, message: &str) {
        self.push_failure(verb, kind, message, Some(times));
    }

    fn push_failure(&self, verb: Verb, kind: &str, message: &str, remaining: Option<usize>) {
        self.lock().failures.push(Failure {
            verb,
            kind: kind.to_string(),
            message: message.to_string(),
            remaining,
        });
    }

    /// Run `f` against the store after every successful matching write.
    pub fn react(
        &self,
        verb: Verb,
        kind: &str,
        f: impl Fn(&ObjectKey, &mut Objects) + Send + Sync + 'static,
    ) {
        self.lock().reactors.push((verb, kind.to_string(), Arc::new(f)));
    }

    fn record(
        state: &mut State,
        verb: Verb,
        kind: &str,
        namespace: &str,
        name: &str,
        patch: Option<Value>,
    ) -> Result<()> {
        state.calls.push(Call {
            verb,
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            patch,
        });
        let failure = state
            .failures
            .iter_mut()
            .find(|f| f.verb == verb && f.kind == kind && f.remaining != Some(0));
        if let Some(failure) = failure {
            if let Some(remaining) = failure.remaining.as_mut() {
                *remaining -= 1;
            }
            return Err(CapupError::KubernetesApi(format!(
                "{kind} {namespace}/{name}: {}",
                failure.message
            )));
        }
        Ok(())
    }

    fn bump_version(state: &mut State, value: &mut Value) {
        state.resource_version += 1;
        if let Value::Object(map) = value {
            let metadata = map
                .entry("metadata")
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if let Value::Object(meta) = metadata {
                meta.insert(
                    "resourceVersion".to_string(),
                    Value::String(state.resource_version.to_string()),
                );
            }
        }
    }

    fn run_reactors(state: &mut State, verb: Verb, key: &ObjectKey) {
        let reactors: Vec<Reactor> = state
            .reactors
            .iter()
            .filter(|(v, k, _)| *v == verb && *k == key.0)
            .map(|(_, _, f)| Arc::clone(f))
            .collect();
        for reactor in reactors {
            reactor(key, &mut state.objects);
        }
    }
}

#[async_trait]
impl ResourceClient for FakeResourceClient {
    async fn get<K: ClusterObject>(&self, name: &str, namespace: &str) -> Result<K> {
        let kind = K::kind(&()).to_string();
        let mut state = self.lock();
        Self::record(&mut state, Verb::Get, &kind, namespace, name, None)?;
        let value = state
            .objects
            .get(&key(&kind, namespace, name))
            .cloned()
            .ok_or_else(|| CapupError::not_found(&kind, namespace, name))?;
        decode(value)
    }

    async fn list<K: ClusterObject>(&self, scope: &ListScope) -> Result<Vec<K>> {
        let kind = K::kind(&()).to_string();
        let mut state = self.lock();
        let namespace = scope.namespace.clone().unwrap_or_default();
        Self::record(&mut state, Verb::List, &kind, &namespace, "", None)?;
        state
            .objects
            .iter()
            .filter(|((k, ns, _), v)| *k == kind && scope.matches(Some(ns), &labels_of(v)))
            .map(|(_, v)| decode(v.clone()))
            .collect()
    }

    async fn create<K: ClusterObject>(&self, obj: &K) -> Result<K> {
        let kind = K::kind(&()).to_string();
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let mut state = self.lock();
        Self::record(&mut state, Verb::Create, &kind, &namespace, &name, None)?;
        let object_key = key(&kind, &namespace, &name);
        if state.objects.contains_key(&object_key) {
            return Err(CapupError::Conflict {
                kind,
                namespace,
                name,
                message: "already exists".to_string(),
            });
        }
        let mut value = encode(obj);
        Self::bump_version(&mut state, &mut value);
        state.objects.insert(object_key.clone(), value.clone());
        Self::run_reactors(&mut state, Verb::Create, &object_key);
        decode(value)
    }

    async fn update<K: ClusterObject>(&self, obj: &K) -> Result<K> {
        let kind = K::kind(&()).to_string();
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let mut state = self.lock();
        Self::record(&mut state, Verb::Update, &kind, &namespace, &name, None)?;
        let object_key = key(&kind, &namespace, &name);
        let Some(existing) = state.objects.get(&object_key) else {
            return Err(CapupError::not_found(&kind, &namespace, &name));
        };
        let stored_version = existing.pointer("/metadata/resourceVersion").cloned();
        if let Some(sent) = obj.resource_version()
            && stored_version.as_ref().and_then(Value::as_str) != Some(sent.as_str())
        {
            return Err(CapupError::Conflict {
                kind,
                namespace,
                name,
                message: "the object has been modified".to_string(),
            });
        }
        let mut value = encode(obj);
        Self::bump_version(&mut state, &mut value);
        state.objects.insert(object_key.clone(), value.clone());
        Self::run_reactors(&mut state, Verb::Update, &object_key);
        decode(value)
    }

    async fn patch<K: ClusterObject>(
        &self,
        name: &str,
        namespace: &str,
        patch: &PatchBody,
    ) -> Result<K> {
        let kind = K::kind(&()).to_string();
        let recorded = match patch {
            PatchBody::Merge(body) => body.clone(),
            PatchBody::Json(ops) => serde_json::to_value(ops).unwrap_or(Value::Null),
        };
        let mut state = self.lock();
        Self::record(&mut state, Verb::Patch, &kind, namespace, name, Some(recorded))?;
        let object_key = key(&kind, namespace, name);
        let Some(mut value) = state.objects.get(&object_key).cloned() else {
            return Err(CapupError::not_found(&kind, namespace, name));
        };
        match patch {
            PatchBody::Merge(body) => json_patch::merge(&mut value, body),
            PatchBody::Json(ops) => json_patch::patch(&mut value, &ops.0).map_err(|e| {
                CapupError::InvalidInput(format!("json patch on {kind} {namespace}/{name}: {e}"))
            })?,
        }
        Self::bump_version(&mut state, &mut value);
        state.objects.insert(object_key.clone(), value);
        Self::run_reactors(&mut state, Verb::Patch, &object_key);
        let stored = state.objects.get(&object_key).cloned().unwrap_or(Value::Null);
        decode(stored)
    }

    async fn delete<K: ClusterObject>(&self, name: &str, namespace: &str) -> Result<()> {
        let kind = K::kind(&()).to_string();
        let mut state = self.lock();
        Self::record(&mut state, Verb::Delete, &kind, namespace, name, None)?;
        state
            .objects
            .remove(&key(&kind, namespace, name))
            .map(|_| ())
            .ok_or_else(|| CapupError::not_found(&kind, namespace, name))
    }

    async fn apply_manifest(&self, manifest: &str) -> Result<()> {
        let mut documents = Vec::new();
        for document in serde_yaml::Deserializer::from_str(manifest) {
            let value = Value::deserialize(document)
                .map_err(|e| CapupError::InvalidInput(format!("invalid YAML: {e}")))?;
            if !value.is_null() {
                documents.push(value);
            }
        }
        let mut state = self.lock();
        let first_kind = documents
            .first()
            .and_then(|d| d.get("kind"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let first_name = documents
            .first()
            .and_then(|d| d.pointer("/metadata/name"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        Self::record(&mut state, Verb::Apply, &first_kind, "", &first_name, None)?;
        state.applied.push(manifest.to_string());
        for document in documents {
            let str_at = |p: &str| {
                document
                    .pointer(p)
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string()
            };
            let object_key = key(
                &str_at("/kind"),
                &str_at("/metadata/namespace"),
                &str_at("/metadata/name"),
            );
            state.objects.insert(object_key, document);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use json_patch::{
        AddOperation, PatchOperation, RemoveOperation, ReplaceOperation, TestOperation,
    };
    use jsonptr::PointerBuf;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use serde_json::json;

    use super::*;

    fn config_map(name: &str, labels: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let fake = FakeResourceClient::new();
        let err = fake.get::<ConfigMap>("x", "default").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(fake.get_opt::<ConfigMap>("x", "default").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_filters_by_label() {
        let fake = FakeResourceClient::new();
        fake.insert(&config_map("a", &[("app", "one")]));
        fake.insert(&config_map("b", &[("app", "two")]));
        let scope = ListScope::in_namespace(Some("default")).with_label("app", "one");
        let items: Vec<ConfigMap> = fake.list(&scope).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name_any(), "a");
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let fake = FakeResourceClient::new();
        let created = fake.create(&config_map("a", &[])).await.unwrap();
        fake.patch::<ConfigMap>("a", "default", &PatchBody::Merge(json!({"data": {"k": "v"}})))
            .await
            .unwrap();
        let err = fake.update(&created).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_json_patch_escapes_slash_keys() {
        let fake = FakeResourceClient::new();
        let mut cm = config_map("a", &[]);
        cm.data = Some([("beta.kubernetes.io/os".to_string(), "linux".to_string())].into());
        fake.insert(&cm);
        let ops = json_patch::Patch(vec![
            PatchOperation::Remove(RemoveOperation {
                path: PointerBuf::from_tokens(["data", "beta.kubernetes.io/os"]),
            }),
            PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["data", "kubernetes.io/os"]),
                value: json!("linux"),
            }),
        ]);
        let patched: ConfigMap = fake.patch("a", "default", &PatchBody::Json(ops)).await.unwrap();
        let data = patched.data.unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data.get("kubernetes.io/os").map(String::as_str), Some("linux"));
        let recorded = fake.mutations()[0].patch.clone().unwrap();
        assert_eq!(recorded[0]["path"], "/data/beta.kubernetes.io~1os");
    }

    #[tokio::test]
    async fn test_json_patch_failed_test_leaves_object() {
        let fake = FakeResourceClient::new();
        let mut cm = config_map("a", &[]);
        cm.data = Some([("image".to_string(), "old".to_string())].into());
        fake.insert(&cm);
        let ops = json_patch::Patch(vec![
            PatchOperation::Test(TestOperation {
                path: PointerBuf::from_tokens(["data", "image"]),
                value: json!("other"),
            }),
            PatchOperation::Replace(ReplaceOperation {
                path: PointerBuf::from_tokens(["data", "image"]),
                value: json!("new"),
            }),
        ]);
        let err = fake
            .patch::<ConfigMap>("a", "default", &PatchBody::Json(ops))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        let stored = fake.object::<ConfigMap>("a", "default").unwrap();
        assert_eq!(stored.data.unwrap().get("image").map(String::as_str), Some("old"));
    }

    #[tokio::test]
    async fn test_delete_removes_object_once() {
        let fake = FakeResourceClient::new();
        fake.insert(&config_map("a", &[]));
        fake.delete::<ConfigMap>("a", "default").await.unwrap();
        assert!(fake.object::<ConfigMap>("a", "default").is_none());
        let err = fake.delete::<ConfigMap>("a", "default").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(fake.mutations().len(), 2);
    }

    #[tokio::test]
    async fn test_fail_times_then_succeeds() {
        let fake = FakeResourceClient::new();
        fake.insert(&config_map("a", &[]));
        fake.fail_times(Verb::Get, "ConfigMap", 1, "connection refused");
        assert!(fake.get::<ConfigMap>("a", "default").await.is_err());
        assert!(fake.get::<ConfigMap>("a", "default").await.is_ok());
        assert_eq!(fake.calls_for(Verb::Get, "ConfigMap").len(), 2);
    }

    #[tokio::test]
    async fn test_reactor_runs_after_patch() {
        let fake = FakeResourceClient::new();
        fake.insert(&config_map("a", &[]));
        fake.react(Verb::Patch, "ConfigMap", |key, objects| {
            if let Some(obj) = objects.get_mut(key) {
                obj["data"]["reacted"] = json!("yes");
            }
        });
        let patched: ConfigMap = fake
            .patch("a", "default", &PatchBody::Merge(json!({"data": {"k": "v"}})))
            .await
            .unwrap();
        let data = patched.data.unwrap();
        assert_eq!(data.get("reacted").map(String::as_str), Some("yes"));
    }

    #[tokio::test]
    async fn test_apply_manifest_records_documents() {
        let fake = FakeResourceClient::new();
        let manifest = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n  namespace: default\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: b\n  namespace: default\n";
        fake.apply_manifest(manifest).await.unwrap();
        assert_eq!(fake.applied_manifests().len(), 1);
        assert!(fake.object::<ConfigMap>("b", "default").is_some());
        assert_eq!(fake.mutations().len(), 1);
    }
}
