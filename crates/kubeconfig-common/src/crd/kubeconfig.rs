//! Kubeconfig CRD for requesting time-bounded cluster credentials
//!
//! A Kubeconfig asks the operator for a ServiceAccount with the listed RBAC
//! permissions and a rotating token, delivered as a ready-to-use kubeconfig
//! Secret next to the request.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{set_condition, Condition, PolicyRule, TypedObjectRef};
use crate::ttl::parse_expiration_ttl;
use crate::Error;

/// Condition types written by the reconciler
pub mod condition_types {
    /// ServiceAccount, token Secret and RBAC objects were applied
    pub const SERVICE_ACCOUNT_PROVISIONED: &str = "ServiceAccountProvisioned";
    /// Objects no longer desired were deleted
    pub const STALE_PERMISSIONS_REMOVED: &str = "StalePermissionsRemoved";
    /// The kubeconfig Secret holds a valid token
    pub const KUBECONFIG_PROVISIONED: &str = "KubeconfigProvisioned";
    /// Summary of the last reconciliation pass
    pub const READY: &str = "Ready";
}

fn default_cluster_name() -> String {
    "kubernetes".to_string()
}

fn default_expiration_ttl() -> String {
    "365d".to_string()
}

/// Kubeconfig requests a ServiceAccount-backed kubeconfig with scoped RBAC.
///
/// Example:
/// ```yaml
/// apiVersion: klaud.works/v1alpha1
/// kind: Kubeconfig
/// metadata:
///   name: ci-deployer
///   namespace: default
/// spec:
///   server: https://api.example.com:6443
///   expirationTTL: 30d
///   namespacedPermissions:
///     - namespace: default
///       rules:
///         - apiGroups: ["apps"]
///           resources: ["deployments"]
///           verbs: ["get", "list", "patch"]
///   clusterPermissions:
///     rules:
///       - apiGroups: [""]
///         resources: ["namespaces"]
///         verbs: ["get", "list"]
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "klaud.works",
    version = "v1alpha1",
    kind = "Kubeconfig",
    namespaced,
    status = "KubeconfigStatus",
    shortname = "kc",
    printcolumn = r#"{"name":"Issued","type":"date","jsonPath":".status.serviceAccountTokenIssuedAt"}"#,
    printcolumn = r#"{"name":"Expires","type":"date","jsonPath":".status.serviceAccountTokenExpiresAt"}"#,
    printcolumn = r#"{"name":"Refreshes","type":"date","jsonPath":".status.serviceAccountTokenRefreshesAt"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KubeconfigSpec {
    /// API server URL written into the generated kubeconfig
    pub server: String,

    /// Cluster and context name used inside the generated kubeconfig
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// Token lifetime as `<n><unit>` with unit one of s, m, h, d
    #[serde(rename = "expirationTTL", default = "default_expiration_ttl")]
    pub expiration_ttl: String,

    /// Role/RoleBinding pairs to create, one per namespace
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaced_permissions: Vec<NamespacedPermissions>,

    /// ClusterRole/ClusterRoleBinding rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_permissions: Option<ClusterPermissions>,
}

/// Rules granted in a single namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NamespacedPermissions {
    /// Namespace the Role and RoleBinding are created in
    pub namespace: String,

    /// Rules of the Role
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

/// Rules granted cluster-wide
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPermissions {
    /// Rules of the ClusterRole
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

/// Observed state of a Kubeconfig
///
/// Optional fields serialize as `null` so a merge patch of the whole status
/// clears values that are no longer set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeconfigStatus {
    /// Generation of the spec the status was computed from
    #[serde(default)]
    pub observed_generation: Option<i64>,

    /// Per-step and summary conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Every object currently owned by this request
    #[serde(default)]
    pub resource_refs: Vec<TypedObjectRef>,

    /// The ServiceAccount tokens are issued for
    #[serde(default)]
    pub service_account_ref: Option<TypedObjectRef>,

    /// The Secret holding the generated kubeconfig
    #[serde(default)]
    pub kubeconfig_secret_ref: Option<TypedObjectRef>,

    /// When the current token was issued
    #[serde(default)]
    pub service_account_token_issued_at: Option<DateTime<Utc>>,

    /// When the current token expires
    #[serde(default)]
    pub service_account_token_expires_at: Option<DateTime<Utc>>,

    /// When the current token will be replaced
    #[serde(default)]
    pub service_account_token_refreshes_at: Option<DateTime<Utc>>,
}

impl KubeconfigStatus {
    /// Look up a condition by type
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Returns true if the condition of the given type is True
    pub fn is_condition_true(&self, type_: &str) -> bool {
        self.condition(type_).is_some_and(Condition::is_true)
    }

    /// Set a condition, replacing any existing entry of the same type
    pub fn set_condition(&mut self, condition: Condition) {
        set_condition(&mut self.conditions, condition);
    }

    /// Returns true if the last pass completed successfully
    pub fn is_ready(&self) -> bool {
        self.is_condition_true(condition_types::READY)
    }
}

impl Kubeconfig {
    /// Returns true once deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Token lifetime in seconds
    pub fn expiration_ttl_seconds(&self) -> Result<i64, Error> {
        parse_expiration_ttl(&self.spec.expiration_ttl)
            .map_err(|e| Error::invalid_ttl(self.name_any(), e))
    }

    /// Validate the spec beyond what the schema enforces
    pub fn validate(&self) -> Result<(), Error> {
        let name = self.name_any();
        let spec = &self.spec;

        if spec.server.trim().is_empty() {
            return Err(Error::validation_for_field(
                &name,
                "spec.server",
                "server is required",
            ));
        }
        if !(spec.server.starts_with("https://") || spec.server.starts_with("http://")) {
            return Err(Error::validation_for_field(
                &name,
                "spec.server",
                format!("server must be an http(s) URL, got '{}'", spec.server),
            ));
        }
        if spec.cluster_name.trim().is_empty() {
            return Err(Error::validation_for_field(
                &name,
                "spec.clusterName",
                "clusterName must not be empty",
            ));
        }

        self.expiration_ttl_seconds()?;

        let mut seen = BTreeSet::new();
        for (i, entry) in spec.namespaced_permissions.iter().enumerate() {
            let field = format!("spec.namespacedPermissions[{}]", i);
            if entry.namespace.trim().is_empty() {
                return Err(Error::validation_for_field(
                    &name,
                    format!("{}.namespace", field),
                    "namespace must not be empty",
                ));
            }
            if !seen.insert(entry.namespace.as_str()) {
                return Err(Error::validation_for_field(
                    &name,
                    format!("{}.namespace", field),
                    format!("namespace '{}' is listed more than once", entry.namespace),
                ));
            }
            validate_rules(&name, &field, &entry.rules)?;
        }

        if let Some(cluster) = &spec.cluster_permissions {
            validate_rules(&name, "spec.clusterPermissions", &cluster.rules)?;
        }

        Ok(())
    }
}

fn validate_rules(name: &str, field: &str, rules: &[PolicyRule]) -> Result<(), Error> {
    for (i, rule) in rules.iter().enumerate() {
        if rule.verbs.is_empty() {
            return Err(Error::validation_for_field(
                name,
                format!("{}.rules[{}].verbs", field, i),
                "rule must list at least one verb",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ConditionStatus;
    use kube::CustomResourceExt;

    fn rule(verbs: &[&str]) -> PolicyRule {
        PolicyRule {
            api_groups: vec!["".to_string()],
            resources: vec!["pods".to_string()],
            verbs: verbs.iter().map(|v| v.to_string()).collect(),
            ..Default::default()
        }
    }

    fn sample() -> Kubeconfig {
        let mut kc = Kubeconfig::new(
            "foobar",
            KubeconfigSpec {
                server: "https://127.0.0.1:6443".to_string(),
                cluster_name: default_cluster_name(),
                expiration_ttl: default_expiration_ttl(),
                namespaced_permissions: vec![NamespacedPermissions {
                    namespace: "default".to_string(),
                    rules: vec![rule(&["get"])],
                }],
                cluster_permissions: Some(ClusterPermissions {
                    rules: vec![rule(&["list"])],
                }),
            },
        );
        kc.metadata.namespace = Some("default".to_string());
        kc
    }

    fn field_of(err: Error) -> Option<String> {
        match err {
            Error::Validation { field, .. } => field,
            other => panic!("Expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn defaults_apply_when_fields_are_omitted() {
        let spec: KubeconfigSpec = serde_json::from_value(serde_json::json!({
            "server": "https://example.com"
        }))
        .unwrap();
        assert_eq!(spec.cluster_name, "kubernetes");
        assert_eq!(spec.expiration_ttl, "365d");
        assert!(spec.namespaced_permissions.is_empty());
        assert!(spec.cluster_permissions.is_none());
    }

    #[test]
    fn spec_uses_expiration_ttl_field_name() {
        let json = serde_json::to_value(&sample().spec).unwrap();
        assert_eq!(json["expirationTTL"], "365d");
        assert_eq!(json["clusterName"], "kubernetes");
        assert!(json["namespacedPermissions"].is_array());
    }

    #[test]
    fn valid_spec_passes() {
        assert!(sample().validate().is_ok());
        assert_eq!(sample().expiration_ttl_seconds().unwrap(), 31_536_000);
    }

    #[test]
    fn server_must_be_http_url() {
        let mut kc = sample();
        kc.spec.server = "".to_string();
        assert_eq!(field_of(kc.validate().unwrap_err()).as_deref(), Some("spec.server"));

        kc.spec.server = "example.com:6443".to_string();
        assert_eq!(field_of(kc.validate().unwrap_err()).as_deref(), Some("spec.server"));
    }

    #[test]
    fn bad_ttl_is_a_validation_error() {
        let mut kc = sample();
        kc.spec.expiration_ttl = "5x".to_string();
        assert_eq!(
            field_of(kc.validate().unwrap_err()).as_deref(),
            Some("spec.expirationTTL")
        );
    }

    #[test]
    fn duplicate_namespaces_are_rejected() {
        let mut kc = sample();
        kc.spec
            .namespaced_permissions
            .push(kc.spec.namespaced_permissions[0].clone());
        assert_eq!(
            field_of(kc.validate().unwrap_err()).as_deref(),
            Some("spec.namespacedPermissions[1].namespace")
        );
    }

    #[test]
    fn rules_need_verbs() {
        let mut kc = sample();
        kc.spec.cluster_permissions = Some(ClusterPermissions {
            rules: vec![rule(&[])],
        });
        assert_eq!(
            field_of(kc.validate().unwrap_err()).as_deref(),
            Some("spec.clusterPermissions.rules[0].verbs")
        );
    }

    #[test]
    fn empty_cluster_name_is_rejected() {
        let mut kc = sample();
        kc.spec.cluster_name = " ".to_string();
        assert_eq!(
            field_of(kc.validate().unwrap_err()).as_deref(),
            Some("spec.clusterName")
        );
    }

    #[test]
    fn status_serializes_unset_fields_as_null() {
        let json = serde_json::to_value(KubeconfigStatus::default()).unwrap();
        assert!(json["serviceAccountRef"].is_null());
        assert!(json.get("serviceAccountRef").is_some());
        assert_eq!(json["resourceRefs"], serde_json::json!([]));
    }

    #[test]
    fn ready_reflects_summary_condition() {
        let mut status = KubeconfigStatus::default();
        assert!(!status.is_ready());
        status.set_condition(Condition::new(
            condition_types::READY,
            ConditionStatus::True,
            "Reconciled",
            "",
        ));
        assert!(status.is_ready());
        assert!(!status.is_condition_true(condition_types::KUBECONFIG_PROVISIONED));
    }

    #[test]
    fn crd_is_namespaced_in_klaud_works_group() {
        let crd = Kubeconfig::crd();
        assert_eq!(crd.spec.group, "klaud.works");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.names.kind, "Kubeconfig");
        assert_eq!(crd.spec.versions[0].name, "v1alpha1");
    }

    #[test]
    fn deletion_is_detected_from_metadata() {
        let mut kc = sample();
        assert!(!kc.is_deleting());
        kc.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            Utc::now(),
        ));
        assert!(kc.is_deleting());
    }
}
