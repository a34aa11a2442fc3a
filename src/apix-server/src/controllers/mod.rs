//!
//! # Lifecycle controllers
//!
//! Seven reconcilers, each owning specific status conditions or published
//! documents. They never call each other; coordination happens through
//! the conditions they read and write. Each runs a bounded worker pool
//! over a rate limited work queue fed by the definition informer.
//!
mod approval;
mod establish;
mod finalizer;
mod naming;
mod nonstructural;
mod publish;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use apix_types::ApiError;

use crate::crdstore::CrdStore;

pub use approval::ApprovalController;
pub use establish::EstablishController;
pub use finalizer::FinalizerController;
pub use naming::NamingController;
pub use nonstructural::NonStructuralController;
pub use publish::DiscoveryController;
pub use publish::SchemaPublicationController;

pub const WORKERS_PER_CONTROLLER: usize = 5;
const BASE_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// idempotent: reconciling an already achieved state writes nothing
    async fn reconcile(&self, crd_name: &str) -> Result<(), ApiError>;
}

struct Queue {
    sender: mpsc::UnboundedSender<String>,
    receiver: Mutex<mpsc::UnboundedReceiver<String>>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl Queue {
    fn new() -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            sender,
            receiver: Mutex::new(receiver),
            attempts: Mutex::new(HashMap::new()),
        })
    }

    fn add(&self, name: String) {
        let _ = self.sender.send(name);
    }

    async fn next(&self) -> Option<String> {
        self.receiver.lock().await.recv().await
    }

    async fn backoff(&self, name: &str) -> Duration {
        let mut attempts = self.attempts.lock().await;
        let count = attempts.entry(name.to_owned()).or_insert(0);
        *count += 1;
        let factor = 2u32.saturating_pow((*count - 1).min(16));
        (BASE_BACKOFF * factor).min(MAX_BACKOFF)
    }

    async fn forget(&self, name: &str) {
        self.attempts.lock().await.remove(name);
    }
}

/// wire a reconciler to the definition informer: one feeder, a fixed
/// worker pool, exponential backoff requeue on error
pub fn spawn_controller(
    reconciler: Arc<dyn Reconciler>,
    crds: Arc<CrdStore>,
) -> Vec<JoinHandle<()>> {
    let queue = Queue::new();
    let mut handles = vec![];

    // feeder: initial sync plus every informer event
    let feeder_queue = queue.clone();
    let feeder_crds = crds.clone();
    let mut events = crds.subscribe();
    handles.push(tokio::spawn(async move {
        for crd in feeder_crds.cached_all() {
            feeder_queue.add(crd.metadata.name.clone());
        }
        loop {
            match events.recv().await {
                Ok(event) => feeder_queue.add(event.name),
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    // resync everything after falling behind
                    for crd in feeder_crds.cached_all() {
                        feeder_queue.add(crd.metadata.name.clone());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }));

    for worker in 0..WORKERS_PER_CONTROLLER {
        let queue = queue.clone();
        let reconciler = reconciler.clone();
        handles.push(tokio::spawn(async move {
            while let Some(name) = queue.next().await {
                match reconciler.reconcile(&name).await {
                    Ok(()) => queue.forget(&name).await,
                    Err(err) => {
                        let delay = queue.backoff(&name).await;
                        debug!(
                            controller = reconciler.name(),
                            worker,
                            name,
                            %err,
                            ?delay,
                            "reconcile failed, requeueing"
                        );
                        let requeue = queue.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            requeue.add(name);
                        });
                    }
                }
            }
        }));
    }

    handles
}
