//! Desired object set for a Kubeconfig
//!
//! Maps a request to the ServiceAccount, its token Secret and the RBAC objects
//! granting the requested permissions. Pure: the same request always yields
//! the same ordered list.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule as RbacPolicyRule, Role, RoleBinding, RoleRef,
    Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use serde_json::Value;

use kubeconfig_common::crd::{Kubeconfig, PolicyRule};
use kubeconfig_common::{
    cluster_scoped_name, token_secret_name, Error, MANAGED_TYPE_LABEL, MANAGED_TYPE_PERMISSION,
    SERVICE_ACCOUNT_NAME_ANNOTATION,
};

use crate::resource::{ObjectKey, ResourceKind};

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";
const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";

/// An object of one of the subordinate kinds
#[derive(Clone, Debug, PartialEq)]
pub enum ManagedObject {
    /// Principal
    ServiceAccount(ServiceAccount),
    /// Token carrier or credential bundle
    Secret(Secret),
    /// Namespaced rules
    Role(Role),
    /// Namespaced binding
    RoleBinding(RoleBinding),
    /// Cluster-wide rules
    ClusterRole(ClusterRole),
    /// Cluster-wide binding
    ClusterRoleBinding(ClusterRoleBinding),
}

impl ManagedObject {
    /// Kind of the wrapped object
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::ServiceAccount(_) => ResourceKind::ServiceAccount,
            Self::Secret(_) => ResourceKind::Secret,
            Self::Role(_) => ResourceKind::Role,
            Self::RoleBinding(_) => ResourceKind::RoleBinding,
            Self::ClusterRole(_) => ResourceKind::ClusterRole,
            Self::ClusterRoleBinding(_) => ResourceKind::ClusterRoleBinding,
        }
    }

    /// Metadata of the wrapped object
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::ServiceAccount(o) => o.meta(),
            Self::Secret(o) => o.meta(),
            Self::Role(o) => o.meta(),
            Self::RoleBinding(o) => o.meta(),
            Self::ClusterRole(o) => o.meta(),
            Self::ClusterRoleBinding(o) => o.meta(),
        }
    }

    /// Mutable metadata of the wrapped object
    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::ServiceAccount(o) => o.meta_mut(),
            Self::Secret(o) => o.meta_mut(),
            Self::Role(o) => o.meta_mut(),
            Self::RoleBinding(o) => o.meta_mut(),
            Self::ClusterRole(o) => o.meta_mut(),
            Self::ClusterRoleBinding(o) => o.meta_mut(),
        }
    }

    /// Identity of the wrapped object
    pub fn key(&self) -> ObjectKey {
        let meta = self.metadata();
        ObjectKey {
            kind: self.kind(),
            namespace: meta.namespace.clone(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }

    /// Labels of the wrapped object
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.metadata().labels.clone().unwrap_or_default()
    }

    /// Serialize to a manifest including `apiVersion` and `kind`
    pub fn to_manifest(&self) -> Result<Value, Error> {
        let value = match self {
            Self::ServiceAccount(o) => serde_json::to_value(o),
            Self::Secret(o) => serde_json::to_value(o),
            Self::Role(o) => serde_json::to_value(o),
            Self::RoleBinding(o) => serde_json::to_value(o),
            Self::ClusterRole(o) => serde_json::to_value(o),
            Self::ClusterRoleBinding(o) => serde_json::to_value(o),
        };
        value.map_err(|e| Error::serialization_for_kind(self.kind().kind(), e.to_string()))
    }
}

/// Whether an applied object carries a parent link to the request
#[derive(Clone, Debug, PartialEq)]
pub enum Ownership {
    /// Same-namespace object, removed by native cascade deletion
    ParentLink(OwnerReference),
    /// Cluster-scoped or cross-namespace object, removed by the differ
    Detached,
}

impl Ownership {
    /// Pick the ownership for `key` given the request's owner reference
    pub fn for_key(key: &ObjectKey, request_namespace: &str, owner: &OwnerReference) -> Self {
        if key.can_be_parent_linked(request_namespace) {
            Self::ParentLink(owner.clone())
        } else {
            Self::Detached
        }
    }

    /// Apply this ownership to object metadata
    pub fn apply_to(&self, meta: &mut ObjectMeta) {
        match self {
            Self::ParentLink(owner) => meta.owner_references = Some(vec![owner.clone()]),
            Self::Detached => meta.owner_references = None,
        }
    }
}

/// An object the request wants to exist, with its ownership
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredObject {
    /// The object to apply
    pub object: ManagedObject,
    /// Parent link policy for the apply
    pub ownership: Ownership,
}

impl DesiredObject {
    /// Identity of the desired object
    pub fn key(&self) -> ObjectKey {
        self.object.key()
    }
}

/// Controller owner reference pointing at the request
pub fn owner_reference(kc: &Kubeconfig) -> Result<OwnerReference, Error> {
    kc.controller_owner_ref(&()).ok_or_else(|| {
        Error::invariant(kc.name_any(), "Kubeconfig has no uid to build an owner reference")
    })
}

/// Identity of the ServiceAccount tokens are issued for
pub fn principal_key(kc: &Kubeconfig) -> ObjectKey {
    ObjectKey::namespaced(
        ResourceKind::ServiceAccount,
        kc.namespace().unwrap_or_default(),
        kc.name_any(),
    )
}

fn permission_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(
        MANAGED_TYPE_LABEL.to_string(),
        MANAGED_TYPE_PERMISSION.to_string(),
    )])
}

fn permission_meta(name: String, namespace: Option<String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace,
        labels: Some(permission_labels()),
        ..Default::default()
    }
}

fn rbac_rules(rules: &[PolicyRule]) -> Option<Vec<RbacPolicyRule>> {
    Some(rules.iter().map(RbacPolicyRule::from).collect())
}

fn service_account_subject(name: &str, namespace: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: name.to_string(),
        namespace: Some(namespace.to_string()),
        api_group: None,
    }
}

/// Build the ordered list of objects the request wants to exist
///
/// Order: ServiceAccount, token Secret, one Role and RoleBinding per
/// namespaced entry in spec order, then the ClusterRole and
/// ClusterRoleBinding when cluster permissions are present.
pub fn build_desired(kc: &Kubeconfig) -> Result<Vec<DesiredObject>, Error> {
    let name = kc.name_any();
    let namespace = kc
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "Kubeconfig must be namespaced"))?;
    let owner = owner_reference(kc)?;

    let mut objects = Vec::new();

    objects.push(ManagedObject::ServiceAccount(ServiceAccount {
        metadata: permission_meta(name.clone(), Some(namespace.clone())),
        ..Default::default()
    }));

    let mut token_meta = permission_meta(token_secret_name(&name), Some(namespace.clone()));
    token_meta.annotations = Some(BTreeMap::from([(
        SERVICE_ACCOUNT_NAME_ANNOTATION.to_string(),
        name.clone(),
    )]));
    objects.push(ManagedObject::Secret(Secret {
        metadata: token_meta,
        type_: Some(SERVICE_ACCOUNT_TOKEN_TYPE.to_string()),
        ..Default::default()
    }));

    let subject = service_account_subject(&name, &namespace);

    for entry in &kc.spec.namespaced_permissions {
        objects.push(ManagedObject::Role(Role {
            metadata: permission_meta(name.clone(), Some(entry.namespace.clone())),
            rules: rbac_rules(&entry.rules),
        }));
        objects.push(ManagedObject::RoleBinding(RoleBinding {
            metadata: permission_meta(name.clone(), Some(entry.namespace.clone())),
            role_ref: RoleRef {
                api_group: RBAC_API_GROUP.to_string(),
                kind: "Role".to_string(),
                name: name.clone(),
            },
            subjects: Some(vec![subject.clone()]),
        }));
    }

    if let Some(cluster) = &kc.spec.cluster_permissions {
        let cluster_name = cluster_scoped_name(&name, &namespace);
        objects.push(ManagedObject::ClusterRole(ClusterRole {
            metadata: permission_meta(cluster_name.clone(), None),
            rules: rbac_rules(&cluster.rules),
            aggregation_rule: None,
        }));
        objects.push(ManagedObject::ClusterRoleBinding(ClusterRoleBinding {
            metadata: permission_meta(cluster_name.clone(), None),
            role_ref: RoleRef {
                api_group: RBAC_API_GROUP.to_string(),
                kind: "ClusterRole".to_string(),
                name: cluster_name,
            },
            subjects: Some(vec![subject]),
        }));
    }

    Ok(objects
        .into_iter()
        .map(|mut object| {
            let ownership = Ownership::for_key(&object.key(), &namespace, &owner);
            ownership.apply_to(object.metadata_mut());
            DesiredObject { object, ownership }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubeconfig_common::crd::{ClusterPermissions, KubeconfigSpec, NamespacedPermissions};

    fn rule(resource: &str) -> PolicyRule {
        PolicyRule {
            api_groups: vec!["".to_string()],
            resources: vec![resource.to_string()],
            verbs: vec!["get".to_string()],
            ..Default::default()
        }
    }

    fn request(namespaces: &[&str], cluster: bool) -> Kubeconfig {
        let mut kc = Kubeconfig::new(
            "foobar",
            KubeconfigSpec {
                server: "https://127.0.0.1:6443".to_string(),
                cluster_name: "kubernetes".to_string(),
                expiration_ttl: "365d".to_string(),
                namespaced_permissions: namespaces
                    .iter()
                    .map(|ns| NamespacedPermissions {
                        namespace: ns.to_string(),
                        rules: vec![rule("pods")],
                    })
                    .collect(),
                cluster_permissions: cluster.then(|| ClusterPermissions {
                    rules: vec![rule("namespaces")],
                }),
            },
        );
        kc.metadata.namespace = Some("default".to_string());
        kc.metadata.uid = Some("uid-1234".to_string());
        kc
    }

    fn keys(objects: &[DesiredObject]) -> Vec<String> {
        objects.iter().map(|o| o.key().to_string()).collect()
    }

    #[test]
    fn builds_full_object_graph_in_order() {
        let objects = build_desired(&request(&["default", "kube-system"], true)).unwrap();
        assert_eq!(
            keys(&objects),
            vec![
                "ServiceAccount/default/foobar",
                "Secret/default/foobar-token",
                "Role/default/foobar",
                "RoleBinding/default/foobar",
                "Role/kube-system/foobar",
                "RoleBinding/kube-system/foobar",
                "ClusterRole/foobar-default",
                "ClusterRoleBinding/foobar-default",
            ]
        );
    }

    #[test]
    fn principal_only_without_permissions() {
        let objects = build_desired(&request(&[], false)).unwrap();
        assert_eq!(
            keys(&objects),
            vec!["ServiceAccount/default/foobar", "Secret/default/foobar-token"]
        );
        assert_eq!(principal_key(&request(&[], false)), objects[0].key());
    }

    #[test]
    fn output_is_deterministic() {
        let kc = request(&["default", "kube-system"], true);
        assert_eq!(build_desired(&kc).unwrap(), build_desired(&kc).unwrap());
    }

    #[test]
    fn every_object_carries_the_permission_marker() {
        for object in build_desired(&request(&["default", "kube-system"], true)).unwrap() {
            assert_eq!(
                object.object.labels().get(MANAGED_TYPE_LABEL).map(String::as_str),
                Some(MANAGED_TYPE_PERMISSION),
                "{} is missing the marker label",
                object.key()
            );
        }
    }

    #[test]
    fn parent_links_only_for_same_namespace_objects() {
        let objects = build_desired(&request(&["default", "kube-system"], true)).unwrap();
        for object in &objects {
            let key = object.key();
            let linked = matches!(object.ownership, Ownership::ParentLink(_));
            assert_eq!(linked, key.namespace.as_deref() == Some("default"), "{}", key);
            assert_eq!(object.object.metadata().owner_references.is_some(), linked);
        }
        match &objects[0].ownership {
            Ownership::ParentLink(owner) => {
                assert_eq!(owner.kind, "Kubeconfig");
                assert_eq!(owner.uid, "uid-1234");
                assert_eq!(owner.controller, Some(true));
            }
            Ownership::Detached => panic!("ServiceAccount should be parent-linked"),
        }
    }

    #[test]
    fn token_secret_is_bound_to_the_service_account() {
        let objects = build_desired(&request(&[], false)).unwrap();
        let ManagedObject::Secret(secret) = &objects[1].object else {
            panic!("expected token Secret");
        };
        assert_eq!(secret.type_.as_deref(), Some(SERVICE_ACCOUNT_TOKEN_TYPE));
        assert_eq!(
            secret
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(SERVICE_ACCOUNT_NAME_ANNOTATION))
                .map(String::as_str),
            Some("foobar")
        );
    }

    #[test]
    fn bindings_reference_role_and_service_account() {
        let objects = build_desired(&request(&["kube-system"], true)).unwrap();

        let ManagedObject::RoleBinding(binding) = &objects[3].object else {
            panic!("expected RoleBinding");
        };
        assert_eq!(binding.role_ref.kind, "Role");
        assert_eq!(binding.role_ref.name, "foobar");
        let subject = &binding.subjects.as_ref().unwrap()[0];
        assert_eq!(subject.kind, "ServiceAccount");
        assert_eq!(subject.name, "foobar");
        assert_eq!(subject.namespace.as_deref(), Some("default"));

        let ManagedObject::ClusterRoleBinding(binding) = &objects[5].object else {
            panic!("expected ClusterRoleBinding");
        };
        assert_eq!(binding.role_ref.kind, "ClusterRole");
        assert_eq!(binding.role_ref.name, "foobar-default");

        let ManagedObject::ClusterRole(role) = &objects[4].object else {
            panic!("expected ClusterRole");
        };
        assert_eq!(
            role.rules.as_ref().unwrap()[0].resources,
            Some(vec!["namespaces".to_string()])
        );
    }

    #[test]
    fn manifests_include_type_information() {
        let objects = build_desired(&request(&[], true)).unwrap();
        let manifest = objects.last().unwrap().object.to_manifest().unwrap();
        assert_eq!(manifest["apiVersion"], "rbac.authorization.k8s.io/v1");
        assert_eq!(manifest["kind"], "ClusterRoleBinding");
        assert_eq!(manifest["metadata"]["name"], "foobar-default");
    }

    #[test]
    fn missing_uid_is_an_error() {
        let mut kc = request(&[], false);
        kc.metadata.uid = None;
        assert!(matches!(build_desired(&kc), Err(Error::Invariant { .. })));
    }
}
