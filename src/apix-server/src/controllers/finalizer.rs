//! owns the Terminating condition and the instance purge that gates the
//! cleanup finalizer

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use tracing::info;

use apix_store::KeyValueStore;
use apix_store::ResourceStore;
use apix_types::options::DeleteOptions;
use apix_types::options::ListOptions;
use apix_types::ApiError;
use apix_types::ConditionStatus;
use apix_types::CrdCondition;
use apix_types::CrdConditionType;
use apix_types::CustomResourceDefinition;

use super::Reconciler;
use crate::crdstore::CrdStore;

pub struct FinalizerController {
    crds: Arc<CrdStore>,
    kv: Arc<dyn KeyValueStore>,
}

impl FinalizerController {
    pub fn new(crds: Arc<CrdStore>, kv: Arc<dyn KeyValueStore>) -> Arc<Self> {
        Arc::new(Self { crds, kv })
    }

    fn instance_store(&self, crd: &CustomResourceDefinition) -> ResourceStore {
        let names = if crd.status.accepted_names.plural.is_empty() {
            &crd.spec.names
        } else {
            &crd.status.accepted_names
        };
        ResourceStore::new(
            self.kv.clone(),
            &crd.spec.group,
            &names.plural,
            crd.spec.scope.is_namespaced(),
        )
    }
}

#[async_trait]
impl Reconciler for FinalizerController {
    fn name(&self) -> &'static str {
        "finalizer"
    }

    async fn reconcile(&self, crd_name: &str) -> Result<(), ApiError> {
        let Some(cached) = self.crds.cached(crd_name) else {
            return Ok(());
        };
        if cached.metadata.deletion_timestamp.is_none() {
            return Ok(());
        }
        let mut crd = (*cached).clone();

        if crd.set_condition(CrdCondition::new(
            CrdConditionType::Terminating,
            ConditionStatus::True,
            "InstanceDeletionInProgress",
            "instances are being deleted",
        )) {
            crd = self.crds.update_status(crd).await?;
        }

        // purge every instance, cluster wide; objects with their own
        // finalizers only get a deletion timestamp here and block the
        // definition until they clear
        let store = self.instance_store(&crd);
        let instances = store.list(None, &ListOptions::default(), &[]).await?;
        let mut remaining = 0usize;
        for item in &instances.items {
            let namespace = if item.namespace().is_empty() {
                None
            } else {
                Some(item.namespace())
            };
            match store
                .delete(namespace, item.name(), &DeleteOptions::default())
                .await
            {
                Ok((_, pending)) => {
                    if pending {
                        remaining += 1;
                    }
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        if remaining > 0 {
            debug!(crd = crd_name, remaining, "instances still terminating");
            return Err(ApiError::unavailable(format!(
                "{remaining} instances of {crd_name} are still terminating"
            )));
        }

        info!(crd = crd_name, "all instances purged, releasing finalizer");
        self.crds.release_finalizer(crd_name).await
    }
}
