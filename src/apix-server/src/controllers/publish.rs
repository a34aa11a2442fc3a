//! the two publication controllers: discovery documents and OpenAPI
//! documents, rebuilt whenever any established definition changes

use std::sync::Arc;

use async_trait::async_trait;

use apix_types::ApiError;
use apix_types::CustomResourceDefinition;

use super::Reconciler;
use crate::crdstore::CrdStore;
use crate::discovery::DiscoveryPublisher;
use crate::openapi::OpenApiPublisher;

fn established(crds: &CrdStore) -> Vec<Arc<CustomResourceDefinition>> {
    crds.cached_all()
        .into_iter()
        .filter(|crd| crd.is_established() && crd.metadata.deletion_timestamp.is_none())
        .collect()
}

pub struct DiscoveryController {
    crds: Arc<CrdStore>,
    publisher: Arc<DiscoveryPublisher>,
}

impl DiscoveryController {
    pub fn new(crds: Arc<CrdStore>, publisher: Arc<DiscoveryPublisher>) -> Arc<Self> {
        Arc::new(Self { crds, publisher })
    }
}

#[async_trait]
impl Reconciler for DiscoveryController {
    fn name(&self) -> &'static str {
        "discovery"
    }

    async fn reconcile(&self, _crd_name: &str) -> Result<(), ApiError> {
        self.publisher.rebuild(&established(&self.crds));
        Ok(())
    }
}

pub struct SchemaPublicationController {
    crds: Arc<CrdStore>,
    publisher: Arc<OpenApiPublisher>,
}

impl SchemaPublicationController {
    pub fn new(crds: Arc<CrdStore>, publisher: Arc<OpenApiPublisher>) -> Arc<Self> {
        Arc::new(Self { crds, publisher })
    }
}

#[async_trait]
impl Reconciler for SchemaPublicationController {
    fn name(&self) -> &'static str {
        "schema-publication"
    }

    async fn reconcile(&self, _crd_name: &str) -> Result<(), ApiError> {
        self.publisher.rebuild(&established(&self.crds));
        Ok(())
    }
}
