//! Stale object detection
//!
//! Native cascade deletion cannot reach cluster-scoped or cross-namespace
//! objects, so every pass compares the references recorded in status with
//! the desired set and deletes what is no longer wanted.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use kubeconfig_common::crd::TypedObjectRef;
use kubeconfig_common::Error;

use crate::resource::ObjectKey;
use crate::store::ObjectStore;

/// Result of resolving previously owned objects against the desired set
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StaleSet {
    /// Live, marked objects that are no longer desired
    pub delete: Vec<ObjectKey>,
    /// References whose object is already gone
    pub vanished: Vec<ObjectKey>,
}

/// Identity difference `actual - desired`, in the order of `actual`
pub fn stale_keys(actual: &[ObjectKey], desired: &BTreeSet<ObjectKey>) -> Vec<ObjectKey> {
    actual
        .iter()
        .filter(|key| !desired.contains(key))
        .cloned()
        .collect()
}

/// Resolve recorded references and find the objects to delete
///
/// References outside the managed kinds are ignored. Candidates that no
/// longer exist are reported as vanished rather than failing the pass.
/// Candidates without the managed-permission marker are never deleted.
pub async fn find_stale(
    store: &dyn ObjectStore,
    recorded: &[TypedObjectRef],
    desired: &BTreeSet<ObjectKey>,
) -> Result<StaleSet, Error> {
    let mut actual = Vec::with_capacity(recorded.len());
    for r in recorded {
        match ObjectKey::from_ref(r) {
            Some(key) => actual.push(key),
            None => warn!(reference = %r, "Ignoring reference to unmanaged kind"),
        }
    }

    let mut stale = StaleSet::default();
    for key in stale_keys(&actual, desired) {
        match store.get(&key).await? {
            None => {
                warn!(object = %key, "Previously owned object not found, skipping");
                stale.vanished.push(key);
            }
            Some(live) if !live.is_managed_permission() => {
                debug!(object = %key, "Object lacks the permission marker, leaving it alone");
            }
            Some(_) => stale.delete.push(key),
        }
    }
    Ok(stale)
}
