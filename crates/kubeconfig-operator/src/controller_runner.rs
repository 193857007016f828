//! Controller runner - wires the Kubeconfig reconciler into kube-runtime

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use kubeconfig_common::crd::Kubeconfig;
use kubeconfig_controller::{error_policy, reconcile, Context};

/// Server-side watch timeout, kept below the client's 30s read timeout so idle
/// watches are closed by the API server first
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Run the Kubeconfig controller until a shutdown signal arrives
///
/// Owned Secrets are watched too, so deleting a kubeconfig Secret triggers
/// a pass that reissues it.
pub async fn run_kubeconfig_controller(
    client: Client,
    ca_data: Vec<u8>,
    watch_namespace: Option<String>,
) {
    let ctx = Arc::new(Context::builder(client.clone(), ca_data).build());

    let (kubeconfigs, secrets): (Api<Kubeconfig>, Api<Secret>) = match &watch_namespace {
        Some(ns) => {
            tracing::info!(namespace = %ns, "Watching a single namespace");
            (
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client, ns),
            )
        }
        None => (Api::all(client.clone()), Api::all(client)),
    };

    tracing::info!("- Kubeconfig controller");

    Controller::new(
        kubeconfigs,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .owns(secrets, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(log_reconcile_result("Kubeconfig"))
    .await;
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
