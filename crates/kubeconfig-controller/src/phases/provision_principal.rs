//! ProvisionPrincipal state handler.
//!
//! Applies the ServiceAccount, its token Secret and the requested RBAC
//! objects, then carries the desired set to the next state.

use kube::runtime::events::EventType;
use kube::Resource;
use tracing::{debug, info};

use kubeconfig_common::crd::ConditionStatus;
use kubeconfig_common::events::{actions, reasons};
use kubeconfig_common::Error;

use crate::controller::Context;
use crate::manifest::{build_desired, principal_key};
use crate::phases::{Pass, State};

/// Apply every desired object and record the principal in status.
pub async fn handle_provision_principal(pass: &mut Pass<'_>, ctx: &Context) -> Result<(), Error> {
    pass.kubeconfig.validate()?;
    let desired = build_desired(pass.kubeconfig)?;

    // Every written object is in resource_refs, even when a later apply fails.
    let mut added = 0;
    for object in &desired {
        ctx.store.upsert(&object.object, &object.ownership).await?;
        added += pass.record_present([object.key()]);
        debug!(object = %object.key(), "Object applied");
    }

    pass.status.service_account_ref = Some(principal_key(pass.kubeconfig).to_ref());
    pass.set_condition(
        State::ProvisionPrincipal.condition_type(),
        ConditionStatus::True,
        "Provisioned",
        "ServiceAccount and permissions are applied",
    );

    if added > 0 {
        info!(count = added, "Provisioned new permission objects");
        ctx.events
            .publish(
                &pass.kubeconfig.object_ref(&()),
                EventType::Normal,
                reasons::PERMISSIONS_PROVISIONED,
                actions::RECONCILE,
                Some(format!("Applied {} new objects", added)),
            )
            .await;
    }

    pass.desired = desired;
    Ok(())
}
