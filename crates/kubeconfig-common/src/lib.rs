//! Common types for the kubeconfig operator: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod telemetry;
pub mod ttl;

pub use error::Error;

/// API group of the Kubeconfig CRD
pub const API_GROUP: &str = "klaud.works";

/// API version of the Kubeconfig CRD
pub const API_VERSION: &str = "v1alpha1";

/// Field manager used for every server-side apply and status patch
pub const FIELD_MANAGER: &str = "kubeconfig-operator";

/// Finalizer guarding cleanup of cluster-scoped and cross-namespace objects
pub const KUBECONFIG_FINALIZER: &str = "klaud.works/kubeconfig-cleanup";

/// Label key marking objects this operator owns
pub const MANAGED_TYPE_LABEL: &str = "kubeconfig-operator/type";

/// Label value for identity and RBAC objects eligible for stale cleanup
pub const MANAGED_TYPE_PERMISSION: &str = "permission";

/// Annotation binding a token Secret to its ServiceAccount
pub const SERVICE_ACCOUNT_NAME_ANNOTATION: &str = "kubernetes.io/service-account.name";

/// Secret key holding the serialized kubeconfig
pub const KUBECONFIG_SECRET_KEY: &str = "kubeconfig";

/// Secret key holding the raw bearer token
pub const TOKEN_SECRET_KEY: &str = "token";

/// Secret key holding the cluster CA certificate
pub const CA_SECRET_KEY: &str = "ca.crt";

/// Name of the Secret carrying the generated kubeconfig for a request
pub fn kubeconfig_secret_name(request_name: &str) -> String {
    format!("{}-kubeconfig", request_name)
}

/// Name of the service-account token Secret for a request
pub fn token_secret_name(request_name: &str) -> String {
    format!("{}-token", request_name)
}

/// Name shared by the ClusterRole and ClusterRoleBinding of a request
///
/// Cluster-scoped names are qualified with the namespace so two requests with
/// the same name in different namespaces never collide.
pub fn cluster_scoped_name(request_name: &str, request_namespace: &str) -> String {
    format!("{}-{}", request_name, request_namespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_names() {
        assert_eq!(kubeconfig_secret_name("foobar"), "foobar-kubeconfig");
        assert_eq!(token_secret_name("foobar"), "foobar-token");
        assert_eq!(cluster_scoped_name("foobar", "default"), "foobar-default");
    }
}
