//! State handlers for the Kubeconfig controller.
//!
//! A pass walks a fixed sequence of states. Each handler does its work
//! against the collaborators in [`Context`](crate::controller::Context) and
//! records the outcome in the working status carried by [`Pass`]; the driver
//! persists that status between states.

mod provision_credential;
mod provision_principal;
mod reconcile_permissions;

pub use provision_credential::handle_provision_credential;
pub use provision_principal::handle_provision_principal;
pub use reconcile_permissions::handle_reconcile_permissions;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use kube::ResourceExt;

use kubeconfig_common::crd::{
    condition_types, Condition, ConditionStatus, Kubeconfig, KubeconfigStatus, TypedObjectRef,
};
use kubeconfig_common::Error;

use crate::manifest::DesiredObject;
use crate::resource::ObjectKey;

/// Steps of a reconciliation pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Apply the ServiceAccount, token Secret and RBAC objects
    ProvisionPrincipal,
    /// Delete previously owned objects that are no longer desired
    ReconcilePermissions,
    /// Issue a token if needed and write the kubeconfig Secret
    ProvisionCredential,
}

impl State {
    /// First state of a pass
    ///
    /// Deletion always enters at [`State::ReconcilePermissions`] with nothing
    /// desired, whatever state the object was in when it was deleted.
    pub fn initial(deleting: bool) -> Self {
        if deleting {
            Self::ReconcilePermissions
        } else {
            Self::ProvisionPrincipal
        }
    }

    /// State following a successful `self`, `None` when the pass is done
    pub fn next(self, deleting: bool) -> Option<Self> {
        match (self, deleting) {
            (Self::ProvisionPrincipal, _) => Some(Self::ReconcilePermissions),
            (Self::ReconcilePermissions, true) => None,
            (Self::ReconcilePermissions, false) => Some(Self::ProvisionCredential),
            (Self::ProvisionCredential, _) => None,
        }
    }

    /// Condition reporting the outcome of this state
    pub fn condition_type(self) -> &'static str {
        match self {
            Self::ProvisionPrincipal => condition_types::SERVICE_ACCOUNT_PROVISIONED,
            Self::ReconcilePermissions => condition_types::STALE_PERMISSIONS_REMOVED,
            Self::ProvisionCredential => condition_types::KUBECONFIG_PROVISIONED,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProvisionPrincipal => write!(f, "ProvisionPrincipal"),
            Self::ReconcilePermissions => write!(f, "ReconcilePermissions"),
            Self::ProvisionCredential => write!(f, "ProvisionCredential"),
        }
    }
}

/// Working state of one reconciliation pass
pub struct Pass<'a> {
    /// The request being reconciled
    pub kubeconfig: &'a Kubeconfig,
    /// Request name
    pub name: String,
    /// Request namespace
    pub namespace: String,
    /// Whether the request is being deleted
    pub deleting: bool,
    /// Clock reading taken at the start of the pass
    pub now: DateTime<Utc>,
    /// Status as it will be persisted at the next boundary
    pub status: KubeconfigStatus,
    /// Objects built by [`State::ProvisionPrincipal`]; empty when deleting
    pub desired: Vec<DesiredObject>,
}

impl<'a> Pass<'a> {
    /// Start a pass from the persisted status
    pub fn new(kubeconfig: &'a Kubeconfig, now: DateTime<Utc>) -> Result<Self, Error> {
        let name = kubeconfig.name_any();
        let namespace = kubeconfig
            .namespace()
            .ok_or_else(|| Error::validation_for(&name, "Kubeconfig must be namespaced"))?;
        Ok(Self {
            kubeconfig,
            name,
            namespace,
            deleting: kubeconfig.is_deleting(),
            now,
            status: kubeconfig.status.clone().unwrap_or_default(),
            desired: Vec::new(),
        })
    }

    /// Identities of the desired objects
    pub fn desired_keys(&self) -> BTreeSet<ObjectKey> {
        self.desired.iter().map(DesiredObject::key).collect()
    }

    /// Add references for objects that now exist
    ///
    /// Returns the number of references that were not yet recorded.
    pub fn record_present(&mut self, keys: impl IntoIterator<Item = ObjectKey>) -> usize {
        let mut refs: BTreeSet<TypedObjectRef> =
            self.status.resource_refs.drain(..).collect();
        let before = refs.len();
        refs.extend(keys.into_iter().map(|k| k.to_ref()));
        let added = refs.len() - before;
        self.status.resource_refs = refs.into_iter().collect();
        added
    }

    /// Drop references for objects that no longer exist
    pub fn record_absent<'k>(&mut self, keys: impl IntoIterator<Item = &'k ObjectKey>) {
        let gone: BTreeSet<TypedObjectRef> = keys.into_iter().map(ObjectKey::to_ref).collect();
        self.status.resource_refs.retain(|r| !gone.contains(r));
        if let Some(sa) = &self.status.service_account_ref {
            if gone.contains(sa) {
                self.status.service_account_ref = None;
            }
        }
    }

    /// Set a condition stamped with the pass clock
    pub fn set_condition(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) {
        self.status
            .set_condition(Condition::new_at(type_, status, reason, message, self.now));
    }

    /// Mark a successful, non-deleting pass as complete
    pub fn complete(&mut self) {
        if self.deleting {
            return;
        }
        self.set_condition(
            condition_types::READY,
            ConditionStatus::True,
            "Reconciled",
            "Kubeconfig is up to date",
        );
        self.status.observed_generation = self.kubeconfig.metadata.generation;
    }

    /// Record a failed state on its condition and the summary condition
    pub fn fail(&mut self, state: State, error: &Error) {
        let message = error.to_string();
        self.set_condition(
            state.condition_type(),
            ConditionStatus::False,
            error.reason(),
            message.clone(),
        );
        self.set_condition(
            condition_types::READY,
            ConditionStatus::False,
            error.reason(),
            message,
        );
        self.status.observed_generation = self.kubeconfig.metadata.generation;
    }
}
