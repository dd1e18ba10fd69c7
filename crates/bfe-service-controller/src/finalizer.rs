//! Deletion protection for Services that own remote pools
//!
//! Both operations are no-ops when the finalizer is already in the wanted
//! state, and both fail with a conflict if the Service changed since it was
//! read.

use tracing::info;

use crate::model::ManagedService;
use crate::store::{MetadataMutation, ServiceStore, StoreError};

pub const FINALIZER_NAME: &str = "k8s.bfenetworks.com/delete-protection";

/// Add the finalizer, returning the updated Service if a write was needed
pub async fn attach(
    store: &dyn ServiceStore,
    service: &ManagedService,
) -> Result<Option<ManagedService>, StoreError> {
    if service.has_finalizer(FINALIZER_NAME) {
        return Ok(None);
    }

    let mut finalizers = service.finalizers.clone();
    finalizers.push(FINALIZER_NAME.to_string());
    let updated = store
        .patch_metadata(service, MetadataMutation::SetFinalizers(finalizers))
        .await?;
    info!(service = %service.key(), "Attached finalizer");
    Ok(Some(updated))
}

/// Remove the finalizer, returning the updated Service if a write was needed
pub async fn release(
    store: &dyn ServiceStore,
    service: &ManagedService,
) -> Result<Option<ManagedService>, StoreError> {
    if !service.has_finalizer(FINALIZER_NAME) {
        return Ok(None);
    }

    let finalizers = service
        .finalizers
        .iter()
        .filter(|f| *f != FINALIZER_NAME)
        .cloned()
        .collect();
    let updated = store
        .patch_metadata(service, MetadataMutation::SetFinalizers(finalizers))
        .await?;
    info!(service = %service.key(), "Released finalizer");
    Ok(Some(updated))
}
