//! ProvisionCredential state handler.
//!
//! Keeps the current token while it is fresh. Otherwise requests a new one,
//! writes the kubeconfig Secret and records the token timestamps.

use kube::runtime::events::EventType;
use kube::Resource;
use tracing::{debug, info};

use kubeconfig_common::crd::ConditionStatus;
use kubeconfig_common::events::{actions, reasons};
use kubeconfig_common::{kubeconfig_secret_name, Error};

use crate::bundle::{credential_secret, BundleParams};
use crate::controller::Context;
use crate::manifest::{owner_reference, Ownership};
use crate::phases::{Pass, State};
use crate::resource::{ObjectKey, ResourceKind};
use crate::token::{decide, TokenDecision};

const READY_REASON: &str = "TokenValid";
const READY_MESSAGE: &str = "Kubeconfig secret holds a valid token";

/// Rotate the token when due and keep the kubeconfig Secret in place.
pub async fn handle_provision_credential(pass: &mut Pass<'_>, ctx: &Context) -> Result<(), Error> {
    let principal = pass.status.service_account_ref.clone().ok_or_else(|| {
        Error::invariant(&pass.name, "service account reference missing from status")
    })?;
    let lifetime = pass.kubeconfig.expiration_ttl_seconds()?;

    let secret_key = ObjectKey::namespaced(
        ResourceKind::Secret,
        &pass.namespace,
        kubeconfig_secret_name(&pass.name),
    );
    let credential_present = ctx.store.get(&secret_key).await?.is_some();

    let reason = match decide(&pass.status, pass.now, credential_present) {
        TokenDecision::Reuse { refreshes_at } => {
            debug!(%refreshes_at, "Token still valid");
            pass.set_condition(
                State::ProvisionCredential.condition_type(),
                ConditionStatus::True,
                READY_REASON,
                READY_MESSAGE,
            );
            return Ok(());
        }
        TokenDecision::Rotate(reason) => reason,
    };

    info!(%reason, service_account = %principal.name, "Requesting new token");
    let token = ctx.issuer.request_token(&principal, lifetime).await?;

    let spec = &pass.kubeconfig.spec;
    let params = BundleParams {
        server: &spec.server,
        cluster_name: &spec.cluster_name,
        namespace: &pass.namespace,
        principal: &principal.name,
        token: &token.token,
        ca_data: &ctx.ca_data,
    };
    let secret = credential_secret(&secret_key.name, &params)?;
    let owner = owner_reference(pass.kubeconfig)?;
    ctx.store
        .upsert(&secret, &Ownership::ParentLink(owner))
        .await?;

    let refreshes_at = token.refreshes_at();
    pass.record_present([secret_key.clone()]);
    pass.status.kubeconfig_secret_ref = Some(secret_key.to_ref());
    pass.status.service_account_token_issued_at = Some(token.issued_at);
    pass.status.service_account_token_expires_at = Some(token.expires_at);
    pass.status.service_account_token_refreshes_at = Some(refreshes_at);
    pass.set_condition(
        State::ProvisionCredential.condition_type(),
        ConditionStatus::True,
        READY_REASON,
        READY_MESSAGE,
    );

    info!(
        expires_at = %token.expires_at,
        %refreshes_at,
        "Kubeconfig secret written"
    );
    ctx.events
        .publish(
            &pass.kubeconfig.object_ref(&()),
            EventType::Normal,
            reasons::TOKEN_ROTATED,
            actions::ROTATE,
            Some(format!(
                "Issued token ({}), refreshes at {}",
                reason, refreshes_at
            )),
        )
        .await;

    Ok(())
}
