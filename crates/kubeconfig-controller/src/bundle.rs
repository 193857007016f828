//! Kubeconfig rendering and the Secret that carries it

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use serde::{Deserialize, Serialize};

use kubeconfig_common::{Error, CA_SECRET_KEY, KUBECONFIG_SECRET_KEY, TOKEN_SECRET_KEY};

use crate::manifest::ManagedObject;

/// Kubeconfig file structure
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct KubeconfigFile {
    /// API version
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    /// Kind (always "Config")
    pub kind: String,
    /// Clusters
    pub clusters: Vec<NamedCluster>,
    /// Users
    pub users: Vec<NamedUser>,
    /// Contexts
    pub contexts: Vec<NamedContext>,
    /// Current context
    pub current_context: String,
}

/// Cluster entry in kubeconfig
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct NamedCluster {
    /// Cluster name
    pub name: String,
    /// Cluster config
    pub cluster: ClusterConfig,
}

/// Cluster configuration
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterConfig {
    /// API server URL
    pub server: String,
    /// CA certificate (base64 encoded)
    pub certificate_authority_data: String,
}

/// User entry in kubeconfig
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct NamedUser {
    /// User name
    pub name: String,
    /// User config
    pub user: UserConfig,
}

/// User configuration
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct UserConfig {
    /// Bearer token
    pub token: String,
}

/// Context entry in kubeconfig
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct NamedContext {
    /// Context name
    pub name: String,
    /// Context config
    pub context: ContextConfig,
}

/// Context configuration
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ContextConfig {
    /// Cluster name (reference)
    pub cluster: String,
    /// User name (reference)
    pub user: String,
    /// Default namespace
    pub namespace: String,
}

/// Inputs for a single-cluster kubeconfig
#[derive(Clone, Copy)]
pub struct BundleParams<'a> {
    /// API server URL
    pub server: &'a str,
    /// Cluster display name
    pub cluster_name: &'a str,
    /// Default namespace of the context
    pub namespace: &'a str,
    /// ServiceAccount name, used as the user entry
    pub principal: &'a str,
    /// Bearer token
    pub token: &'a str,
    /// PEM-encoded cluster CA
    pub ca_data: &'a [u8],
}

/// Context name for a principal on a cluster
pub fn context_name(principal: &str, cluster_name: &str) -> String {
    format!("{}@{}", principal, cluster_name)
}

/// Build the kubeconfig document
///
/// Fails before producing anything when the CA data or token is empty.
pub fn build_kubeconfig(params: &BundleParams<'_>) -> Result<KubeconfigFile, Error> {
    if params.ca_data.is_empty() {
        return Err(Error::internal_with_context(
            "kubeconfig",
            "CA certificate data is required",
        ));
    }
    if params.token.is_empty() {
        return Err(Error::internal_with_context("kubeconfig", "token is required"));
    }

    let context = context_name(params.principal, params.cluster_name);
    Ok(KubeconfigFile {
        api_version: "v1".to_string(),
        kind: "Config".to_string(),
        clusters: vec![NamedCluster {
            name: params.cluster_name.to_string(),
            cluster: ClusterConfig {
                server: params.server.to_string(),
                certificate_authority_data: STANDARD.encode(params.ca_data),
            },
        }],
        users: vec![NamedUser {
            name: params.principal.to_string(),
            user: UserConfig {
                token: params.token.to_string(),
            },
        }],
        contexts: vec![NamedContext {
            name: context.clone(),
            context: ContextConfig {
                cluster: params.cluster_name.to_string(),
                user: params.principal.to_string(),
                namespace: params.namespace.to_string(),
            },
        }],
        current_context: context,
    })
}

/// Render the kubeconfig as YAML
pub fn render_kubeconfig(params: &BundleParams<'_>) -> Result<String, Error> {
    let file = build_kubeconfig(params)?;
    serde_yaml::to_string(&file).map_err(|e| Error::serialization_for_kind("Config", e.to_string()))
}

/// Build the Secret carrying the kubeconfig, token and CA
///
/// The Secret has no managed-permission marker, so stale cleanup never
/// selects it; it is removed by cascade deletion with the request.
pub fn credential_secret(
    secret_name: &str,
    params: &BundleParams<'_>,
) -> Result<ManagedObject, Error> {
    let kubeconfig = render_kubeconfig(params)?;
    let data = BTreeMap::from([
        (
            KUBECONFIG_SECRET_KEY.to_string(),
            ByteString(kubeconfig.into_bytes()),
        ),
        (
            TOKEN_SECRET_KEY.to_string(),
            ByteString(params.token.as_bytes().to_vec()),
        ),
        (CA_SECRET_KEY.to_string(), ByteString(params.ca_data.to_vec())),
    ]);

    Ok(ManagedObject::Secret(Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.to_string()),
            namespace: Some(params.namespace.to_string()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    }))
}
