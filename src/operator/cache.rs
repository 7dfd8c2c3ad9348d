//! Write-deferring staging layer between the builders and the cluster.
//!
//! Objects are fetched (or initialized when missing), mutated in memory by a builder, and
//! persisted only on an explicit commit. Commits diff against the revision observed at fetch
//! time, so re-applying an unchanged desired state performs no write.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::operator::cluster::{ClusterClient, Managed};
use crate::operator::error::{Error, Result};
use crate::operator::labels;

/// An object staged for commit
#[derive(Debug, Clone)]
pub struct Staged<K> {
    pub object: K,
    /// Whether the object existed in the cluster when it was fetched
    pub existed: bool,
    namespace: String,
    name: String,
}

impl<K> Staged<K> {
    /// Apply a builder to the staged object
    pub fn map(self, build: impl FnOnce(K) -> K) -> Self {
        Self {
            object: build(self.object),
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Created,
    Updated,
    Unchanged,
}

type CacheKey = (String, String, String);

/// Per-pass object cache; create a fresh one for every reconciliation pass
pub struct ObjectCache<'a, C: ClusterClient> {
    client: &'a C,
    observed: HashMap<CacheKey, Value>,
}

impl<'a, C: ClusterClient> ObjectCache<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self {
            client,
            observed: HashMap::new(),
        }
    }

    pub fn client(&self) -> &'a C {
        self.client
    }

    fn key<K: Managed>(namespace: &str, name: &str) -> CacheKey {
        (
            K::kind(&()).to_string(),
            namespace.to_string(),
            name.to_string(),
        )
    }

    /// Fetch an object, or initialize an empty one carrying only its name and namespace
    pub async fn fetch_or_init<K: Managed>(
        &mut self,
        namespace: &str,
        name: &str,
    ) -> Result<Staged<K>> {
        let fetched = match self.client.get::<K>(namespace, name).await {
            Ok(found) => found,
            Err(Error::NotFound { .. }) => None,
            Err(e @ Error::ClusterUnavailable(_)) => return Err(e),
            Err(e) => return Err(Error::ClusterUnavailable(e.to_string())),
        };

        let (object, existed) = match fetched {
            Some(object) => {
                self.observed.insert(
                    Self::key::<K>(namespace, name),
                    serde_json::to_value(&object)?,
                );
                (object, true)
            }
            None => {
                let mut object = K::default();
                object.meta_mut().name = Some(name.to_string());
                object.meta_mut().namespace = Some(namespace.to_string());
                (object, false)
            }
        };

        Ok(Staged {
            object,
            existed,
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    /// Persist a staged object.
    ///
    /// Creates the object when it did not exist, otherwise replaces it unless it is
    /// identical to the fetched revision. The engine label set for `component`/`owner`
    /// is written on every commit; labels under other keys are kept.
    pub async fn commit<K: Managed>(
        &mut self,
        staged: Staged<K>,
        component: &str,
        owner: &str,
    ) -> Result<(K, CommitOutcome)> {
        let Staged {
            mut object,
            existed,
            namespace,
            name,
        } = staged;

        labels::merge_managed_labels(
            &mut object.meta_mut().labels,
            &labels::managed_labels(component, owner),
        );

        let key = Self::key::<K>(&namespace, &name);

        if !existed {
            let created = self.client.create(&namespace, &object).await?;
            self.observed.insert(key, serde_json::to_value(&created)?);
            debug!(kind = %K::kind(&()), namespace = %namespace, name = %name, "Created");
            return Ok((created, CommitOutcome::Created));
        }

        let desired = serde_json::to_value(&object)?;
        if self.observed.get(&key) == Some(&desired) {
            return Ok((object, CommitOutcome::Unchanged));
        }

        let updated = self.client.replace(&namespace, &object).await?;
        self.observed.insert(key, serde_json::to_value(&updated)?);
        debug!(kind = %K::kind(&()), namespace = %namespace, name = %name, "Updated");
        Ok((updated, CommitOutcome::Updated))
    }
}
