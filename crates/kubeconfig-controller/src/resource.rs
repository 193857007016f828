//! Closed registry of the kinds this controller reads, writes and deletes
//!
//! Every object the controller touches is one of a fixed set of kinds, so
//! kind lookups resolve against this enum instead of API discovery.

use kube::discovery::ApiResource;
use kubeconfig_common::crd::TypedObjectRef;
use kubeconfig_common::kube_utils::build_api_resource;

const CORE_GROUP: &str = "";
const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

/// Kinds managed by the controller
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    /// The request itself
    Kubeconfig,
    /// Principal tokens are issued for
    ServiceAccount,
    /// Token carrier or generated kubeconfig
    Secret,
    /// Namespaced permissions
    Role,
    /// Binds a Role to the ServiceAccount
    RoleBinding,
    /// Cluster-wide permissions
    ClusterRole,
    /// Binds a ClusterRole to the ServiceAccount
    ClusterRoleBinding,
}

impl ResourceKind {
    /// Every managed kind
    pub const ALL: [ResourceKind; 7] = [
        Self::Kubeconfig,
        Self::ServiceAccount,
        Self::Secret,
        Self::Role,
        Self::RoleBinding,
        Self::ClusterRole,
        Self::ClusterRoleBinding,
    ];

    /// API group, empty for the core group
    pub fn group(&self) -> &'static str {
        match self {
            Self::Kubeconfig => kubeconfig_common::API_GROUP,
            Self::ServiceAccount | Self::Secret => CORE_GROUP,
            Self::Role | Self::RoleBinding | Self::ClusterRole | Self::ClusterRoleBinding => {
                RBAC_GROUP
            }
        }
    }

    /// API version within the group
    pub fn version(&self) -> &'static str {
        match self {
            Self::Kubeconfig => kubeconfig_common::API_VERSION,
            _ => "v1",
        }
    }

    /// Kind name as it appears in manifests
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Kubeconfig => "Kubeconfig",
            Self::ServiceAccount => "ServiceAccount",
            Self::Secret => "Secret",
            Self::Role => "Role",
            Self::RoleBinding => "RoleBinding",
            Self::ClusterRole => "ClusterRole",
            Self::ClusterRoleBinding => "ClusterRoleBinding",
        }
    }

    /// Lowercase plural used in API paths
    pub fn plural(&self) -> &'static str {
        match self {
            Self::Kubeconfig => "kubeconfigs",
            Self::ServiceAccount => "serviceaccounts",
            Self::Secret => "secrets",
            Self::Role => "roles",
            Self::RoleBinding => "rolebindings",
            Self::ClusterRole => "clusterroles",
            Self::ClusterRoleBinding => "clusterrolebindings",
        }
    }

    /// Returns false for cluster-scoped kinds
    pub fn is_namespaced(&self) -> bool {
        !matches!(self, Self::ClusterRole | Self::ClusterRoleBinding)
    }

    /// Resolve a kind from its group and kind name
    pub fn from_group_kind(group: &str, kind: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.group() == group && k.kind() == kind)
    }

    /// ApiResource for dynamic API access
    pub fn api_resource(&self) -> ApiResource {
        build_api_resource(self.group(), self.version(), self.kind(), self.plural())
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

/// Identity of a managed object: kind, namespace and name
///
/// Two objects with the same key are the same object regardless of content.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    /// Kind of the object
    pub kind: ResourceKind,
    /// Namespace, `None` for cluster-scoped kinds
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key of a namespaced object
    pub fn namespaced(
        kind: ResourceKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of a cluster-scoped object
    pub fn cluster(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: None,
            name: name.into(),
        }
    }

    /// Resolve a status reference to a key
    ///
    /// Returns `None` for kinds outside the registry or references whose
    /// scope does not match the kind.
    pub fn from_ref(r: &TypedObjectRef) -> Option<Self> {
        let kind = ResourceKind::from_group_kind(&r.group, &r.kind)?;
        if kind.version() != r.version || kind.is_namespaced() != r.namespace.is_some() {
            return None;
        }
        Some(Self {
            kind,
            namespace: r.namespace.clone(),
            name: r.name.clone(),
        })
    }

    /// Status reference for this key
    pub fn to_ref(&self) -> TypedObjectRef {
        TypedObjectRef {
            group: self.kind.group().to_string(),
            version: self.kind.version().to_string(),
            kind: self.kind.kind().to_string(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    /// Returns true if native cascade deletion can reach this object from a
    /// request living in `request_namespace`
    pub fn can_be_parent_linked(&self, request_namespace: &str) -> bool {
        self.namespace.as_deref() == Some(request_namespace)
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}
