//! In-memory cluster used by tests.
//!
//! Stores objects as JSON keyed by (kind, namespace, name), assigns uids and
//! resourceVersions like the API server, enforces optimistic concurrency on replace,
//! and counts writes so tests can assert idempotence.

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use super::{ClusterClient, Managed};
use crate::operator::crd::{Frontend, FrontendEnvironment, FrontendStatus};
use crate::operator::error::{Error, Result};

type Key = (String, String, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, Value>,
    environments: BTreeMap<String, FrontendEnvironment>,
    frontends: BTreeMap<(String, String), Frontend>,
    writes: usize,
    status_writes: usize,
    next_uid: u64,
    failing_creates: BTreeSet<String>,
    unreachable: BTreeSet<String>,
    frontend_list_fails: bool,
    interleaved: BTreeMap<Key, Value>,
}

impl Inner {
    fn uid(&mut self, prefix: &str) -> String {
        self.next_uid += 1;
        format!("{}-{}", prefix, self.next_uid)
    }

    /// Store a pending concurrent write for `key`, as another writer would have
    fn run_interleaved(&mut self, key: &Key) {
        let Some(mut value) = self.interleaved.remove(key) else {
            return;
        };
        let version = self
            .objects
            .get(key)
            .and_then(|v| v.pointer("/metadata/resourceVersion"))
            .and_then(Value::as_str)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        let existing_uid = self
            .objects
            .get(key)
            .and_then(|v| v.pointer("/metadata/uid"))
            .cloned();
        let uid = match existing_uid {
            Some(uid) => uid,
            None => Value::String(self.uid("obj")),
        };
        value["metadata"]["uid"] = uid;
        value["metadata"]["resourceVersion"] = Value::String(version.to_string());
        self.objects.insert(key.clone(), value);
    }
}

#[derive(Default)]
pub struct MemoryCluster {
    inner: Mutex<Inner>,
}

fn key<K: Managed>(namespace: &str, name: &str) -> Key {
    (
        K::kind(&()).to_string(),
        namespace.to_string(),
        name.to_string(),
    )
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(term),
        })
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Number of child-resource writes (creates, replaces, deletes)
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    pub fn status_writes(&self) -> usize {
        self.lock().status_writes
    }

    pub fn insert_environment(&self, mut env: FrontendEnvironment) -> FrontendEnvironment {
        let mut inner = self.lock();
        env.meta_mut().uid = Some(inner.uid("env"));
        inner.environments.insert(env.name_any(), env.clone());
        env
    }

    /// Store a changed environment, keeping its uid
    pub fn update_environment(&self, env: FrontendEnvironment) {
        self.lock().environments.insert(env.name_any(), env);
    }

    pub fn insert_frontend(&self, mut frontend: Frontend) -> Frontend {
        let mut inner = self.lock();
        frontend.meta_mut().uid = Some(inner.uid("fe"));
        frontend.meta_mut().generation = Some(1);
        let key = (frontend.namespace().unwrap_or_default(), frontend.name_any());
        inner.frontends.insert(key, frontend.clone());
        frontend
    }

    /// Current stored version of a Frontend, including its status
    pub fn frontend(&self, namespace: &str, name: &str) -> Option<Frontend> {
        self.lock()
            .frontends
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Delete a Frontend and garbage-collect everything it solely owned
    pub fn delete_frontend(&self, frontend: &Frontend) {
        let key = (frontend.namespace().unwrap_or_default(), frontend.name_any());
        self.lock().frontends.remove(&key);
        if let Some(uid) = frontend.uid() {
            self.collect_garbage(&uid);
        }
    }

    /// Drop owner references to `owner_uid`; delete objects left without owners
    pub fn collect_garbage(&self, owner_uid: &str) {
        let mut inner = self.lock();
        let mut orphaned = Vec::new();
        for (key, value) in inner.objects.iter_mut() {
            let Some(refs) = value
                .pointer_mut("/metadata/ownerReferences")
                .and_then(Value::as_array_mut)
            else {
                continue;
            };
            let before = refs.len();
            refs.retain(|r| r.get("uid").and_then(Value::as_str) != Some(owner_uid));
            if before != refs.len() && refs.is_empty() {
                orphaned.push(key.clone());
            }
        }
        for key in orphaned {
            inner.objects.remove(&key);
        }
    }

    pub fn object<K: Managed>(&self, namespace: &str, name: &str) -> Option<K> {
        self.lock()
            .objects
            .get(&key::<K>(namespace, name))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    pub fn objects<K: Managed>(&self) -> Vec<K> {
        let kind = K::kind(&()).to_string();
        self.lock()
            .objects
            .iter()
            .filter(|((k, _, _), _)| *k == kind)
            .map(|(_, v)| serde_json::from_value(v.clone()).unwrap())
            .collect()
    }

    /// Store an object directly, bypassing write accounting (simulates other actors)
    pub fn seed<K: Managed>(&self, namespace: &str, mut object: K) -> K {
        let mut inner = self.lock();
        let name = object.name_any();
        object.meta_mut().namespace = Some(namespace.to_string());
        object.meta_mut().uid = Some(inner.uid("obj"));
        object.meta_mut().resource_version = Some("1".to_string());
        inner
            .objects
            .insert(key::<K>(namespace, &name), serde_json::to_value(&object).unwrap());
        object
    }

    /// Set the Available condition of a stored Deployment (status written by the cluster)
    pub fn set_available(&self, namespace: &str, name: &str, available: bool) {
        let mut inner = self.lock();
        let key = (
            "Deployment".to_string(),
            namespace.to_string(),
            name.to_string(),
        );
        let value = inner.objects.get_mut(&key).expect("deployment exists");
        value["status"] = serde_json::json!({
            "conditions": [{
                "type": "Available",
                "status": if available { "True" } else { "False" },
            }]
        });
    }

    /// Make the next create of kind `K` fail with a transient error
    pub fn fail_next_create<K: Managed>(&self) {
        self.lock()
            .failing_creates
            .insert(K::kind(&()).to_string());
    }

    /// Make every call touching `namespace` fail
    pub fn make_unreachable(&self, namespace: &str) {
        self.lock().unreachable.insert(namespace.to_string());
    }

    /// Make every frontend list fail until `restore_frontend_list`
    pub fn fail_frontend_list(&self) {
        self.lock().frontend_list_fails = true;
    }

    pub fn restore_frontend_list(&self) {
        self.lock().frontend_list_fails = false;
    }

    /// Let another writer store `object` just before the next create or replace of it,
    /// so that write loses with `AlreadyExists` or `Conflict`
    pub fn interleave_write<K: Managed>(&self, namespace: &str, mut object: K) {
        object.meta_mut().namespace = Some(namespace.to_string());
        let key = key::<K>(namespace, &object.name_any());
        let value = serde_json::to_value(&object).unwrap();
        self.lock().interleaved.insert(key, value);
    }

    fn check_reachable(inner: &Inner, namespace: &str) -> Result<()> {
        if inner.unreachable.contains(namespace) {
            return Err(Error::ClusterUnavailable(format!(
                "namespace {} unreachable",
                namespace
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let inner = self.lock();
        Self::check_reachable(&inner, namespace)?;
        match inner.objects.get(&key::<K>(namespace, name)) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    async fn create<K: Managed>(&self, namespace: &str, object: &K) -> Result<K> {
        let mut inner = self.lock();
        Self::check_reachable(&inner, namespace)?;
        let kind = K::kind(&()).to_string();
        let name = object.name_any();
        if inner.failing_creates.remove(&kind) {
            return Err(Error::ClusterUnavailable(format!(
                "injected failure creating {} {}",
                kind, name
            )));
        }
        let key = key::<K>(namespace, &name);
        inner.run_interleaved(&key);
        if inner.objects.contains_key(&key) {
            return Err(Error::AlreadyExists { kind, name });
        }

        let mut created = object.clone();
        created.meta_mut().namespace = Some(namespace.to_string());
        created.meta_mut().uid = Some(inner.uid("obj"));
        created.meta_mut().resource_version = Some("1".to_string());
        inner.objects.insert(key, serde_json::to_value(&created)?);
        inner.writes += 1;
        Ok(created)
    }

    async fn replace<K: Managed>(&self, namespace: &str, object: &K) -> Result<K> {
        let mut inner = self.lock();
        Self::check_reachable(&inner, namespace)?;
        let kind = K::kind(&()).to_string();
        let name = object.name_any();
        let key = key::<K>(namespace, &name);
        inner.run_interleaved(&key);
        let stored = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: kind.clone(),
                name: name.clone(),
            })?;

        let stored_version = stored
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if object.resource_version().as_deref() != Some(stored_version.as_str()) {
            return Err(Error::Conflict { kind, name });
        }

        let next_version = stored_version.parse::<u64>().unwrap_or(0) + 1;
        let mut replaced = serde_json::to_value(object)?;
        replaced["metadata"]["resourceVersion"] = Value::String(next_version.to_string());
        // Status is owned by the cluster and not changed by a replace of the main resource
        match stored.get("status") {
            Some(status) => replaced["status"] = status.clone(),
            None => {
                if let Some(map) = replaced.as_object_mut() {
                    map.remove("status");
                }
            }
        }
        inner.objects.insert(key, replaced.clone());
        inner.writes += 1;
        Ok(serde_json::from_value(replaced)?)
    }

    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<()> {
        let mut inner = self.lock();
        Self::check_reachable(&inner, namespace)?;
        if inner.objects.remove(&key::<K>(namespace, name)).is_some() {
            inner.writes += 1;
        }
        Ok(())
    }

    async fn list<K: Managed>(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>> {
        let inner = self.lock();
        Self::check_reachable(&inner, namespace)?;
        let kind = K::kind(&()).to_string();
        let mut items = Vec::new();
        for ((k, ns, _), value) in inner.objects.iter() {
            if *k != kind || ns != namespace {
                continue;
            }
            let object: K = serde_json::from_value(value.clone())?;
            if matches_selector(object.labels(), label_selector) {
                items.push(object);
            }
        }
        Ok(items)
    }

    async fn get_environment(&self, name: &str) -> Result<Option<FrontendEnvironment>> {
        Ok(self.lock().environments.get(name).cloned())
    }

    async fn list_frontends(&self) -> Result<Vec<Frontend>> {
        let inner = self.lock();
        if inner.frontend_list_fails {
            return Err(Error::ClusterUnavailable(
                "frontend list unavailable".to_string(),
            ));
        }
        Ok(inner.frontends.values().cloned().collect())
    }

    async fn write_frontend_status(
        &self,
        frontend: &Frontend,
        status: &FrontendStatus,
    ) -> Result<()> {
        let mut inner = self.lock();
        let key = (frontend.namespace().unwrap_or_default(), frontend.name_any());
        let stored = inner.frontends.get_mut(&key).ok_or_else(|| Error::NotFound {
            kind: "Frontend".to_string(),
            name: frontend.name_any(),
        })?;
        stored.status = Some(status.clone());
        inner.status_writes += 1;
        Ok(())
    }
}
