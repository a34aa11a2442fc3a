//!
//! # Composition root
//!
//! Wires the registry, the dispatcher, the publishers and the seven
//! controllers over one key value store, and routes incoming requests to
//! whichever subsystem owns the path.
//!
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use apix_store::KeyValueStore;
use apix_store::MemoryStore;

use crate::admin::AdminApi;
use crate::config::ServerConfig;
use crate::controllers;
use crate::controllers::ApprovalController;
use crate::controllers::DiscoveryController;
use crate::controllers::EstablishController;
use crate::controllers::FinalizerController;
use crate::controllers::NamingController;
use crate::controllers::NonStructuralController;
use crate::controllers::SchemaPublicationController;
use crate::crdstore::CrdStore;
use crate::discovery::DiscoveryPublisher;
use crate::handler::CrdDispatcher;
use crate::openapi::OpenApiPublisher;
use crate::request::ApiRequest;
use crate::request::ApiResponse;

pub struct ApiServer {
    config: ServerConfig,
    crds: Arc<CrdStore>,
    dispatcher: Arc<CrdDispatcher>,
    discovery: Arc<DiscoveryPublisher>,
    openapi: Arc<OpenApiPublisher>,
    admin: AdminApi,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ApiServer {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Self::with_store(MemoryStore::shared(), config)
    }

    pub fn with_store(kv: Arc<dyn KeyValueStore>, config: ServerConfig) -> Arc<Self> {
        let crds = CrdStore::new(kv.clone());
        let dispatcher = CrdDispatcher::new(crds.clone(), kv.clone(), config.clone());
        let server = Arc::new(Self {
            crds: crds.clone(),
            dispatcher,
            discovery: DiscoveryPublisher::new(),
            openapi: OpenApiPublisher::new(),
            admin: AdminApi::new(crds),
            config,
            tasks: std::sync::Mutex::new(vec![]),
        });
        server.spawn_background(kv);
        server
    }

    pub fn crds(&self) -> Arc<CrdStore> {
        self.crds.clone()
    }

    pub fn dispatcher(&self) -> Arc<CrdDispatcher> {
        self.dispatcher.clone()
    }

    fn spawn_background(self: &Arc<Self>, kv: Arc<dyn KeyValueStore>) {
        let mut tasks = self.tasks.lock().expect("task lock");

        // the informer feeds the cache everything else reads
        tasks.push(tokio::spawn(self.crds.clone().run_informer()));

        // the reconfiguration observer is the single snapshot writer
        let dispatcher = self.dispatcher.clone();
        let mut events = self.crds.subscribe();
        tasks.push(tokio::spawn(async move {
            dispatcher.rebuild();
            loop {
                match events.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        dispatcher.rebuild();
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }));

        let crds = &self.crds;
        tasks.extend(controllers::spawn_controller(
            NamingController::new(crds.clone()),
            crds.clone(),
        ));
        tasks.extend(controllers::spawn_controller(
            NonStructuralController::new(crds.clone()),
            crds.clone(),
        ));
        tasks.extend(controllers::spawn_controller(
            ApprovalController::new(crds.clone()),
            crds.clone(),
        ));
        tasks.extend(controllers::spawn_controller(
            EstablishController::new(
                crds.clone(),
                self.dispatcher.clone(),
                self.config.master_count,
            ),
            crds.clone(),
        ));
        tasks.extend(controllers::spawn_controller(
            FinalizerController::new(crds.clone(), kv),
            crds.clone(),
        ));
        tasks.extend(controllers::spawn_controller(
            DiscoveryController::new(crds.clone(), self.discovery.clone()),
            crds.clone(),
        ));
        tasks.extend(controllers::spawn_controller(
            SchemaPublicationController::new(crds.clone(), self.openapi.clone()),
            crds.clone(),
        ));
        info!("api extension server started");
    }

    /// the single entry point: route a resolved request to the owning
    /// subsystem, falling back to the configured delegate
    pub async fn handle(&self, request: ApiRequest) -> ApiResponse {
        if let Some(response) = self.openapi.handle(&request) {
            return response;
        }
        if AdminApi::owns(&request.path) {
            return self.admin.handle(request).await;
        }
        if let Some(response) = self.discovery.handle(&request) {
            return response;
        }
        self.dispatcher.handle(request).await
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        for task in self.tasks.lock().expect("task lock").drain(..) {
            task.abort();
        }
    }
}
