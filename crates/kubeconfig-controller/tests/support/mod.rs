//! In-memory collaborators for driving full reconciliation passes

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use kubeconfig_common::crd::{
    ClusterPermissions, Kubeconfig, KubeconfigSpec, KubeconfigStatus, NamespacedPermissions,
    PolicyRule, TypedObjectRef,
};
use kubeconfig_common::Error;
use kubeconfig_controller::manifest::{ManagedObject, Ownership};
use kubeconfig_controller::{
    Clock, Context, KubeClient, LiveObject, ObjectKey, ObjectStore, TokenInfo, TokenIssuer,
};

pub const NAMESPACE: &str = "default";
pub const NAME: &str = "foobar";
pub const CA_PEM: &[u8] = b"-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

/// Base instant all tests count from
pub fn t(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn rule(resource: &str, verb: &str) -> PolicyRule {
    PolicyRule {
        resources: vec![resource.to_string()],
        verbs: vec![verb.to_string()],
        ..Default::default()
    }
}

pub fn namespaced(namespace: &str) -> NamespacedPermissions {
    NamespacedPermissions {
        namespace: namespace.to_string(),
        rules: vec![rule("pods", "get")],
    }
}

pub fn cluster_wide() -> ClusterPermissions {
    ClusterPermissions {
        rules: vec![rule("nodes", "list")],
    }
}

pub fn spec(
    namespaced_permissions: Vec<NamespacedPermissions>,
    cluster_permissions: Option<ClusterPermissions>,
) -> KubeconfigSpec {
    KubeconfigSpec {
        server: "https://127.0.0.1:6443".to_string(),
        cluster_name: "kubernetes".to_string(),
        expiration_ttl: "100s".to_string(),
        namespaced_permissions,
        cluster_permissions,
    }
}

// =============================================================================
// Clock
// =============================================================================

/// Clock moved forward by hand
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// =============================================================================
// Token issuer
// =============================================================================

/// Issues `token-1`, `token-2`, ... valid from the clock reading
pub struct SequentialIssuer {
    clock: Arc<ManualClock>,
    issued: AtomicUsize,
}

impl SequentialIssuer {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            issued: AtomicUsize::new(0),
        }
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenIssuer for SequentialIssuer {
    async fn request_token(
        &self,
        _principal: &TypedObjectRef,
        lifetime_secs: i64,
    ) -> Result<TokenInfo, Error> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let issued_at = self.clock.now();
        Ok(TokenInfo {
            token: format!("token-{}", n),
            issued_at,
            expires_at: issued_at + Duration::seconds(lifetime_secs),
        })
    }
}

// =============================================================================
// Object store
// =============================================================================

/// Subordinate objects keyed by identity
///
/// Counts writes that changed something, so repeated passes can be checked
/// for idempotence.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<ObjectKey, ManagedObject>>,
    writes: AtomicUsize,
    rejected_namespace: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn object(&self, key: &ObjectKey) -> Option<ManagedObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    /// Fail every apply into `namespace`, as the API server does for a
    /// namespace that does not exist
    pub fn reject_namespace(&self, namespace: &str) {
        *self.rejected_namespace.lock().unwrap() = Some(namespace.to_string());
    }

    /// Remove an object behind the controller's back
    pub fn remove(&self, key: &ObjectKey) {
        self.objects.lock().unwrap().remove(key);
    }

    /// Drop the marker label from an object
    pub fn strip_labels(&self, key: &ObjectKey) {
        if let Some(object) = self.objects.lock().unwrap().get_mut(key) {
            object.metadata_mut().labels = None;
        }
    }

    /// Native cascade deletion of everything parent-linked to `uid`
    pub fn cascade(&self, uid: &str) {
        self.objects.lock().unwrap().retain(|_, object| {
            !object
                .metadata()
                .owner_references
                .iter()
                .flatten()
                .any(|owner| owner.uid == uid)
        });
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<LiveObject>, Error> {
        Ok(self.objects.lock().unwrap().get(key).map(|object| LiveObject {
            key: key.clone(),
            labels: object.labels(),
        }))
    }

    async fn upsert(&self, object: &ManagedObject, ownership: &Ownership) -> Result<(), Error> {
        let key = object.key();
        if key.namespace.is_some() && key.namespace == *self.rejected_namespace.lock().unwrap() {
            return Err(Error::internal(format!("namespace of {} not found", key)));
        }
        let mut object = object.clone();
        ownership.apply_to(object.metadata_mut());
        let mut objects = self.objects.lock().unwrap();
        if objects.get(&object.key()) != Some(&object) {
            self.writes.fetch_add(1, Ordering::SeqCst);
            objects.insert(object.key(), object);
        }
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), Error> {
        if self.objects.lock().unwrap().remove(key).is_some() {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// =============================================================================
// Kubeconfig API
// =============================================================================

/// Single Kubeconfig object with resource-version checks on every write
pub struct MemoryApi {
    object: Mutex<Option<Kubeconfig>>,
    status_writes: AtomicUsize,
}

fn conflict() -> Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: "the object has been modified".to_string(),
        reason: "Conflict".to_string(),
        code: 409,
    })
    .into()
}

fn bump(kc: &mut Kubeconfig) -> Option<String> {
    let next = kc
        .metadata
        .resource_version
        .as_deref()
        .and_then(|rv| rv.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    kc.metadata.resource_version = Some(next.to_string());
    kc.metadata.resource_version.clone()
}

impl MemoryApi {
    pub fn new(spec: KubeconfigSpec) -> Self {
        let mut kc = Kubeconfig::new(NAME, spec);
        kc.metadata.namespace = Some(NAMESPACE.to_string());
        kc.metadata.uid = Some("uid-foobar".to_string());
        kc.metadata.resource_version = Some("1".to_string());
        kc.metadata.generation = Some(1);
        Self {
            object: Mutex::new(Some(kc)),
            status_writes: AtomicUsize::new(0),
        }
    }

    /// Current object, `None` once it has been removed
    pub fn get(&self) -> Option<Kubeconfig> {
        self.object.lock().unwrap().clone()
    }

    pub fn status(&self) -> KubeconfigStatus {
        self.get().and_then(|kc| kc.status).unwrap_or_default()
    }

    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    /// Edit the spec as the owning actor would
    pub fn update_spec(&self, edit: impl FnOnce(&mut KubeconfigSpec)) {
        if let Some(kc) = self.object.lock().unwrap().as_mut() {
            edit(&mut kc.spec);
            kc.metadata.generation = kc.metadata.generation.map(|g| g + 1);
            bump(kc);
        }
    }

    /// Request deletion; the object stays until its finalizers are gone
    pub fn delete(&self, at: DateTime<Utc>) {
        let mut object = self.object.lock().unwrap();
        let finalized = match object.as_mut() {
            Some(kc) => {
                kc.metadata.deletion_timestamp = Some(Time(at));
                bump(kc);
                kc.metadata.finalizers.as_ref().map_or(true, Vec::is_empty)
            }
            None => false,
        };
        if finalized {
            *object = None;
        }
    }
}

#[async_trait]
impl KubeClient for MemoryApi {
    async fn patch_status(
        &self,
        _name: &str,
        _namespace: &str,
        resource_version: Option<String>,
        status: &KubeconfigStatus,
    ) -> Result<Option<String>, Error> {
        let mut object = self.object.lock().unwrap();
        let kc = object.as_mut().ok_or_else(|| Error::internal("not found"))?;
        if resource_version.is_some() && resource_version != kc.metadata.resource_version {
            return Err(conflict());
        }
        kc.status = Some(status.clone());
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(bump(kc))
    }

    async fn set_finalizers(
        &self,
        _name: &str,
        _namespace: &str,
        finalizers: Vec<String>,
        resource_version: Option<String>,
    ) -> Result<Option<String>, Error> {
        let mut object = self.object.lock().unwrap();
        let kc = object.as_mut().ok_or_else(|| Error::internal("not found"))?;
        if resource_version.is_some() && resource_version != kc.metadata.resource_version {
            return Err(conflict());
        }
        let release = kc.metadata.deletion_timestamp.is_some() && finalizers.is_empty();
        kc.metadata.finalizers = Some(finalizers);
        let rv = bump(kc);
        if release {
            *object = None;
        }
        Ok(rv)
    }
}

// =============================================================================
// Harness
// =============================================================================

/// Wires the in-memory collaborators into a controller context
pub struct Harness {
    pub api: Arc<MemoryApi>,
    pub store: Arc<MemoryStore>,
    pub issuer: Arc<SequentialIssuer>,
    pub clock: Arc<ManualClock>,
    pub ctx: Arc<Context>,
}

impl Harness {
    pub fn new(spec: KubeconfigSpec) -> Self {
        let api = Arc::new(MemoryApi::new(spec));
        let store = Arc::new(MemoryStore::default());
        let clock = Arc::new(ManualClock::at(t(0)));
        let issuer = Arc::new(SequentialIssuer::new(clock.clone()));
        let ctx = Arc::new(
            Context::from_parts(api.clone(), store.clone(), issuer.clone(), CA_PEM.to_vec())
                .with_clock(clock.clone()),
        );
        Self {
            api,
            store,
            issuer,
            clock,
            ctx,
        }
    }

    /// Run the reconciler once against the current object
    pub async fn reconcile(&self) -> Result<kube::runtime::controller::Action, Error> {
        let kc = self.api.get().ok_or_else(|| Error::internal("object removed"))?;
        kubeconfig_controller::reconcile(Arc::new(kc), self.ctx.clone()).await
    }

    /// Kinds of every stored object, with namespace and name
    pub fn inventory(&self) -> Vec<String> {
        self.store.keys().iter().map(ToString::to_string).collect()
    }

    /// Kubeconfig document stored in the credential Secret
    pub fn kubeconfig_yaml(&self) -> Option<String> {
        let key = ObjectKey::namespaced(
            kubeconfig_controller::ResourceKind::Secret,
            NAMESPACE,
            format!("{}-kubeconfig", NAME),
        );
        match self.store.object(&key)? {
            ManagedObject::Secret(secret) => secret
                .data?
                .get("kubeconfig")
                .and_then(|b| String::from_utf8(b.0.clone()).ok()),
            _ => None,
        }
    }
}
