//! Shared Kubernetes helpers using kube-rs

use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::{json, Value};

/// Returns true if the error is a 404 from the API server
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Returns true if the error is a 409 optimistic concurrency conflict
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Build an ApiResource from its group, version, kind and plural name
pub fn build_api_resource(group: &str, version: &str, kind: &str, plural: &str) -> ApiResource {
    let api_version = if group.is_empty() {
        version.to_string()
    } else {
        format!("{}/{}", group, version)
    };
    ApiResource {
        group: group.to_string(),
        version: version.to_string(),
        api_version,
        kind: kind.to_string(),
        plural: plural.to_string(),
    }
}

/// Dynamic API handle for a namespaced or cluster-scoped resource
pub fn dynamic_api(
    client: &Client,
    ar: &ApiResource,
    namespace: Option<&str>,
) -> Api<DynamicObject> {
    match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, ar),
        None => Api::all_with(client.clone(), ar),
    }
}

/// Merge patch body replacing the status and pinning the resource version
///
/// With a resource version set the API server rejects the write with 409 if
/// the object changed since it was read.
pub fn status_patch(resource_version: Option<&str>, status: &impl serde::Serialize) -> Value {
    match resource_version {
        Some(rv) => json!({ "metadata": { "resourceVersion": rv }, "status": status }),
        None => json!({ "status": status }),
    }
}

/// Merge patch body replacing the finalizer list and pinning the resource version
pub fn finalizers_patch(resource_version: Option<&str>, finalizers: &[String]) -> Value {
    match resource_version {
        Some(rv) => json!({ "metadata": { "resourceVersion": rv, "finalizers": finalizers } }),
        None => json!({ "metadata": { "finalizers": finalizers } }),
    }
}

/// Patch the status sub-resource of a namespaced resource
///
/// Returns the resource version after the write.
pub async fn patch_resource_status<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    resource_version: Option<&str>,
    status: &impl serde::Serialize,
    field_manager: &str,
) -> std::result::Result<Option<String>, kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = status_patch(resource_version, status);
    let updated = api
        .patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(updated.meta().resource_version.clone())
}
