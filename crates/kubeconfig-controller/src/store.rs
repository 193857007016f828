//! Object store for subordinate objects
//!
//! Get, create-or-update and delete by identity. The kube-backed store uses
//! server-side apply for writes and treats 404 on delete as success, so every
//! operation is safe to repeat.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use kubeconfig_common::kube_utils::{dynamic_api, is_not_found};
use kubeconfig_common::{Error, FIELD_MANAGER, MANAGED_TYPE_LABEL, MANAGED_TYPE_PERMISSION};

use crate::manifest::{ManagedObject, Ownership};
use crate::resource::ObjectKey;

/// What the controller needs to know about a live object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiveObject {
    /// Identity of the object
    pub key: ObjectKey,
    /// Labels currently on the object
    pub labels: BTreeMap<String, String>,
}

impl LiveObject {
    /// Returns true if the object carries the managed-permission marker
    pub fn is_managed_permission(&self) -> bool {
        self.labels.get(MANAGED_TYPE_LABEL).map(String::as_str) == Some(MANAGED_TYPE_PERMISSION)
    }
}

/// Trait abstracting reads and writes of subordinate objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object by identity, `None` when it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<LiveObject>, Error>;

    /// Create or update an object with the given ownership
    async fn upsert(&self, object: &ManagedObject, ownership: &Ownership) -> Result<(), Error>;

    /// Delete an object by identity; deleting a missing object succeeds
    async fn delete(&self, key: &ObjectKey) -> Result<(), Error>;
}

/// Object store backed by the Kubernetes API
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<LiveObject>, Error> {
        let api = dynamic_api(&self.client, &key.kind.api_resource(), key.namespace.as_deref());
        let found = api.get_opt(&key.name).await?;
        Ok(found.map(|obj| LiveObject {
            key: key.clone(),
            labels: obj.metadata.labels.unwrap_or_default(),
        }))
    }

    async fn upsert(&self, object: &ManagedObject, ownership: &Ownership) -> Result<(), Error> {
        let mut object = object.clone();
        ownership.apply_to(object.metadata_mut());
        let key = object.key();
        let manifest = object.to_manifest()?;

        let api = dynamic_api(&self.client, &key.kind.api_resource(), key.namespace.as_deref());
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&key.name, &params, &Patch::Apply(&manifest)).await?;
        debug!(object = %key, "Applied object");
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), Error> {
        let api = dynamic_api(&self.client, &key.kind.api_resource(), key.namespace.as_deref());
        match api.delete(&key.name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!(object = %key, "Deleted object");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(object = %key, "Object already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKind;

    fn live(labels: &[(&str, &str)]) -> LiveObject {
        LiveObject {
            key: ObjectKey::cluster(ResourceKind::ClusterRole, "foobar-default"),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn marker_label_identifies_managed_objects() {
        assert!(live(&[(MANAGED_TYPE_LABEL, MANAGED_TYPE_PERMISSION)]).is_managed_permission());
        assert!(!live(&[]).is_managed_permission());
        assert!(!live(&[(MANAGED_TYPE_LABEL, "other")]).is_managed_permission());
    }
}
