//! owns the Established condition: flips once serving info is installed

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use apix_types::ApiError;
use apix_types::ConditionStatus;
use apix_types::CrdCondition;
use apix_types::CrdConditionType;

use super::Reconciler;
use crate::crdstore::CrdStore;
use crate::handler::CrdDispatcher;

/// grace period for peer servers to observe the definition in
/// multi-master deployments
const PEER_OBSERVATION_DELAY: Duration = Duration::from_secs(5);

pub struct EstablishController {
    crds: Arc<CrdStore>,
    dispatcher: Arc<CrdDispatcher>,
    master_count: u32,
}

impl EstablishController {
    pub fn new(
        crds: Arc<CrdStore>,
        dispatcher: Arc<CrdDispatcher>,
        master_count: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            crds,
            dispatcher,
            master_count,
        })
    }
}

#[async_trait]
impl Reconciler for EstablishController {
    fn name(&self) -> &'static str {
        "establishing"
    }

    async fn reconcile(&self, crd_name: &str) -> Result<(), ApiError> {
        let Some(cached) = self.crds.cached(crd_name) else {
            return Ok(());
        };
        let mut crd = (*cached).clone();

        if !crd.names_accepted() {
            if crd.set_condition(CrdCondition::new(
                CrdConditionType::Established,
                ConditionStatus::False,
                "NotAccepted",
                "the names are not accepted",
            )) {
                self.crds.update_status(crd).await?;
            }
            return Ok(());
        }
        if crd.is_established() {
            return Ok(());
        }

        // serving info must be installed before the type is queryable
        if !self.dispatcher.snapshot().contains_key(crd.uid()) {
            return Err(ApiError::unavailable(format!(
                "serving info for {crd_name} is not installed yet"
            )));
        }

        if self.master_count > 1 {
            tokio::time::sleep(PEER_OBSERVATION_DELAY).await;
        }

        if crd.set_condition(CrdCondition::new(
            CrdConditionType::Established,
            ConditionStatus::True,
            "InitialNamesAccepted",
            "the initial names have been accepted",
        )) {
            info!(crd = crd_name, "established");
            self.crds.update_status(crd).await?;
        }
        Ok(())
    }
}
