//! ReconcilePermissions state handler.
//!
//! Deletes objects recorded in status that are no longer desired. This is
//! also the entry point of the deletion path, where nothing is desired and
//! every owned object is removed before the finalizer is released.

use kube::runtime::events::EventType;
use kube::Resource;
use tracing::info;

use kubeconfig_common::crd::ConditionStatus;
use kubeconfig_common::events::{actions, reasons};
use kubeconfig_common::Error;

use crate::controller::Context;
use crate::differ::find_stale;
use crate::phases::{Pass, State};

/// Delete stale objects and drop their references from status.
pub async fn handle_reconcile_permissions(
    pass: &mut Pass<'_>,
    ctx: &Context,
) -> Result<(), Error> {
    let desired = pass.desired_keys();
    let stale = find_stale(ctx.store.as_ref(), &pass.status.resource_refs, &desired).await?;

    for key in &stale.delete {
        ctx.store.delete(key).await?;
        info!(object = %key, "Deleted stale object");
    }

    pass.record_absent(stale.delete.iter().chain(stale.vanished.iter()));
    pass.set_condition(
        State::ReconcilePermissions.condition_type(),
        ConditionStatus::True,
        "Reconciled",
        "No stale permissions remain",
    );

    if !stale.delete.is_empty() {
        let (action, verb) = if pass.deleting {
            (actions::CLEANUP, "Cleaned up")
        } else {
            (actions::RECONCILE, "Removed")
        };
        ctx.events
            .publish(
                &pass.kubeconfig.object_ref(&()),
                EventType::Normal,
                reasons::STALE_PERMISSIONS_REMOVED,
                action,
                Some(format!("{} {} objects", verb, stale.delete.len())),
            )
            .await;
    }

    Ok(())
}
