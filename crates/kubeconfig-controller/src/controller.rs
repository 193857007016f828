//! Kubeconfig controller implementation
//!
//! This module drives a [`Kubeconfig`] through the states defined in
//! [`crate::phases`]. Every external effect goes through a trait held by
//! [`Context`] so passes can run against mocks or in-memory stores.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use kubeconfig_common::crd::{Kubeconfig, KubeconfigStatus};
use kubeconfig_common::events::{
    actions, reasons, EventPublisher, KubeEventPublisher, NoopEventPublisher,
};
use kubeconfig_common::kube_utils::{finalizers_patch, patch_resource_status};
use kubeconfig_common::{Error, FIELD_MANAGER, KUBECONFIG_FINALIZER};

use crate::phases::{
    handle_provision_credential, handle_provision_principal, handle_reconcile_permissions, Pass,
    State,
};
use crate::store::{KubeObjectStore, ObjectStore};
use crate::token::{ServiceAccountTokenIssuer, TokenIssuer};

/// Name the controller reports in Kubernetes Events
pub const CONTROLLER_NAME: &str = "kubeconfig-controller";

/// Shortest delay before the next scheduled pass
const MIN_REQUEUE_SECS: i64 = 5;
/// Longest delay before the next scheduled pass
const MAX_REQUEUE_SECS: i64 = 600;
/// Retry delay for errors a retry can fix
const RETRY_SECS: u64 = 5;
/// Retry delay for errors that need a spec change
const BACKOFF_SECS: u64 = 300;

/// Trait abstracting writes to the Kubeconfig resource itself
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Replace the status of a Kubeconfig
    ///
    /// With `resource_version` set the write fails with a conflict when the
    /// object changed since it was read. Returns the new resource version.
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        resource_version: Option<String>,
        status: &KubeconfigStatus,
    ) -> Result<Option<String>, Error>;

    /// Replace the finalizer list of a Kubeconfig
    async fn set_finalizers(
        &self,
        name: &str,
        namespace: &str,
        finalizers: Vec<String>,
        resource_version: Option<String>,
    ) -> Result<Option<String>, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        resource_version: Option<String>,
        status: &KubeconfigStatus,
    ) -> Result<Option<String>, Error> {
        Ok(patch_resource_status::<Kubeconfig>(
            &self.client,
            name,
            namespace,
            resource_version.as_deref(),
            status,
            FIELD_MANAGER,
        )
        .await?)
    }

    async fn set_finalizers(
        &self,
        name: &str,
        namespace: &str,
        finalizers: Vec<String>,
        resource_version: Option<String>,
    ) -> Result<Option<String>, Error> {
        let api: Api<Kubeconfig> = Api::namespaced(self.client.clone(), namespace);
        let patch = finalizers_patch(resource_version.as_deref(), &finalizers);
        let updated = api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(updated.resource_version())
    }
}

/// Source of the current time for a pass
#[cfg_attr(test, automock)]
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Controller context containing shared state and clients
///
/// Use [`ContextBuilder`] to construct instances against a cluster:
///
/// ```text
/// let ctx = Context::builder(client, ca_pem).build();
/// ```
pub struct Context {
    /// Writes to the Kubeconfig resource
    pub kube: Arc<dyn KubeClient>,
    /// Subordinate object access
    pub store: Arc<dyn ObjectStore>,
    /// Token issuance for the principal
    pub issuer: Arc<dyn TokenIssuer>,
    /// Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Time source
    pub clock: Arc<dyn Clock>,
    /// PEM-encoded cluster CA embedded in every kubeconfig
    pub ca_data: Vec<u8>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, ca_data: Vec<u8>) -> ContextBuilder {
        ContextBuilder::new(client, ca_data)
    }

    /// Assemble a context from explicit collaborators
    ///
    /// Events are discarded and the wall clock is used unless overridden
    /// with [`Context::with_events`] and [`Context::with_clock`].
    pub fn from_parts(
        kube: Arc<dyn KubeClient>,
        store: Arc<dyn ObjectStore>,
        issuer: Arc<dyn TokenIssuer>,
        ca_data: Vec<u8>,
    ) -> Self {
        Self {
            kube,
            store,
            issuer,
            events: Arc::new(NoopEventPublisher),
            clock: Arc::new(SystemClock),
            ca_data,
        }
    }

    /// Replace the event publisher
    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    ca_data: Vec<u8>,
    kube: Option<Arc<dyn KubeClient>>,
    store: Option<Arc<dyn ObjectStore>>,
    issuer: Option<Arc<dyn TokenIssuer>>,
    events: Option<Arc<dyn EventPublisher>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ContextBuilder {
    fn new(client: Client, ca_data: Vec<u8>) -> Self {
        Self {
            client,
            ca_data,
            kube: None,
            store: None,
            issuer: None,
            events: None,
            clock: None,
        }
    }

    /// Override the Kubeconfig client
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the object store
    pub fn object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the token issuer
    pub fn token_issuer(mut self, issuer: Arc<dyn TokenIssuer>) -> Self {
        self.issuer = Some(issuer);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the clock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let client = self.client;
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(client.clone()))),
            store: self
                .store
                .unwrap_or_else(|| Arc::new(KubeObjectStore::new(client.clone()))),
            issuer: self
                .issuer
                .unwrap_or_else(|| Arc::new(ServiceAccountTokenIssuer::new(client.clone()))),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME))
            }),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            ca_data: self.ca_data,
        }
    }
}

/// Result of a completed pass
#[derive(Debug)]
pub struct PassOutcome {
    /// Status as persisted at the end of the pass
    pub status: KubeconfigStatus,
    /// Resource version after the last write
    pub resource_version: Option<String>,
}

/// Run one pass of the state machine and persist status at each boundary
///
/// A failing state stops the pass. Its condition and `Ready` are set False,
/// the status is persisted best effort and the error is returned.
pub async fn run_pass(
    kubeconfig: &Kubeconfig,
    ctx: &Context,
    resource_version: Option<String>,
) -> Result<PassOutcome, Error> {
    let mut pass = Pass::new(kubeconfig, ctx.clock.now())?;
    let mut persisted = kubeconfig.status.clone().unwrap_or_default();
    let mut resource_version = resource_version;
    let mut state = Some(State::initial(pass.deleting));

    while let Some(current) = state {
        debug!(state = %current, "Running state");
        if let Err(e) = run_state(current, &mut pass, ctx).await {
            pass.fail(current, &e);
            if let Err(persist_err) =
                persist(ctx, &pass, &mut persisted, &mut resource_version).await
            {
                warn!(error = %persist_err, "Failed to record failure in status");
            }
            ctx.events
                .publish(
                    &kubeconfig.object_ref(&()),
                    EventType::Warning,
                    reasons::RECONCILE_FAILED,
                    actions::RECONCILE,
                    Some(format!("{} failed: {}", current, e)),
                )
                .await;
            return Err(e);
        }

        state = current.next(pass.deleting);
        if state.is_none() {
            pass.complete();
        }
        persist(ctx, &pass, &mut persisted, &mut resource_version).await?;
    }

    Ok(PassOutcome {
        status: pass.status,
        resource_version,
    })
}

async fn run_state(state: State, pass: &mut Pass<'_>, ctx: &Context) -> Result<(), Error> {
    match state {
        State::ProvisionPrincipal => handle_provision_principal(pass, ctx).await,
        State::ReconcilePermissions => handle_reconcile_permissions(pass, ctx).await,
        State::ProvisionCredential => handle_provision_credential(pass, ctx).await,
    }
}

async fn persist(
    ctx: &Context,
    pass: &Pass<'_>,
    persisted: &mut KubeconfigStatus,
    resource_version: &mut Option<String>,
) -> Result<(), Error> {
    if pass.status == *persisted {
        return Ok(());
    }
    let updated = ctx
        .kube
        .patch_status(
            &pass.name,
            &pass.namespace,
            resource_version.clone(),
            &pass.status,
        )
        .await?;
    if updated.is_some() {
        *resource_version = updated;
    }
    *persisted = pass.status.clone();
    Ok(())
}

/// Delay until the next pass should run
pub fn requeue_after(refreshes_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
    let secs = refreshes_at
        .map(|at| (at - now).num_seconds())
        .unwrap_or(MAX_REQUEUE_SECS)
        .clamp(MIN_REQUEUE_SECS, MAX_REQUEUE_SECS);
    Duration::from_secs(secs as u64)
}

/// Reconcile a Kubeconfig resource
///
/// Live objects get the finalizer before anything is created, then run a
/// full pass and requeue at the token refresh instant. Deleted objects run
/// the cleanup pass and release the finalizer.
#[instrument(
    skip(kubeconfig, ctx),
    fields(kubeconfig = %kubeconfig.name_any(), namespace = ?kubeconfig.namespace())
)]
pub async fn reconcile(kubeconfig: Arc<Kubeconfig>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = kubeconfig.name_any();
    let namespace = kubeconfig
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "Kubeconfig must be namespaced"))?;
    let has_finalizer = kubeconfig
        .finalizers()
        .iter()
        .any(|f| f == KUBECONFIG_FINALIZER);
    let mut resource_version = kubeconfig.resource_version();

    if kubeconfig.is_deleting() {
        if !has_finalizer {
            debug!("Deleting without finalizer, nothing to clean up");
            return Ok(Action::await_change());
        }

        let outcome = run_pass(&kubeconfig, &ctx, resource_version).await?;
        ctx.events
            .publish(
                &kubeconfig.object_ref(&()),
                EventType::Normal,
                reasons::CLEANUP_COMPLETE,
                actions::CLEANUP,
                Some("Owned permissions removed".to_string()),
            )
            .await;

        let remaining: Vec<String> = kubeconfig
            .finalizers()
            .iter()
            .filter(|f| *f != KUBECONFIG_FINALIZER)
            .cloned()
            .collect();
        ctx.kube
            .set_finalizers(&name, &namespace, remaining, outcome.resource_version)
            .await?;
        info!("Cleanup complete, finalizer removed");
        return Ok(Action::await_change());
    }

    if !has_finalizer {
        let mut finalizers = kubeconfig.finalizers().to_vec();
        finalizers.push(KUBECONFIG_FINALIZER.to_string());
        let updated = ctx
            .kube
            .set_finalizers(&name, &namespace, finalizers, resource_version.clone())
            .await?;
        if updated.is_some() {
            resource_version = updated;
        }
        debug!("Finalizer added");
    }

    let outcome = run_pass(&kubeconfig, &ctx, resource_version).await?;
    let delay = requeue_after(
        outcome.status.service_account_token_refreshes_at,
        ctx.clock.now(),
    );
    debug!(requeue_secs = delay.as_secs(), "Pass complete");
    Ok(Action::requeue(delay))
}

/// Error policy for the controller
///
/// Retryable errors come back quickly; the rest wait for a spec change or
/// the long backoff, whichever is first.
pub fn error_policy(kubeconfig: Arc<Kubeconfig>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        kubeconfig = %kubeconfig.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(Duration::from_secs(RETRY_SECS))
    } else {
        Action::requeue(Duration::from_secs(BACKOFF_SECS))
    }
}
