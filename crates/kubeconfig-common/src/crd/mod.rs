//! Custom Resource Definitions for the kubeconfig operator

mod kubeconfig;
mod types;

pub use kubeconfig::{
    condition_types, ClusterPermissions, Kubeconfig, KubeconfigSpec, KubeconfigStatus,
    NamespacedPermissions,
};
pub use types::{set_condition, Condition, ConditionStatus, PolicyRule, TypedObjectRef};
