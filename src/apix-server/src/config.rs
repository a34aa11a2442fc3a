//! server construction inputs and the external seams the dispatcher
//! consumes without implementing

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use apix_conversion::AnonymousAuthResolver;
use apix_conversion::AuthInfoResolver;
use apix_conversion::ClusterServiceResolver;
use apix_conversion::ServiceResolver;
use apix_types::ApiError;
use apix_types::Unstructured;

use crate::request::ApiRequest;
use crate::request::ApiResponse;

const WEBHOOK_TIMEOUT_FLOOR: Duration = Duration::from_secs(1);
const WEBHOOK_TIMEOUT_CEILING: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ServerConfig {
    /// default deadline imposed on non-watch requests
    pub request_timeout: Duration,
    /// lower bound for long running (watch) requests
    pub min_request_timeout: Duration,
    /// request size ceiling, also the denominator for rule cardinality
    /// estimation
    pub max_request_body_bytes: u64,
    /// above one, the establishing controller waits for peers
    pub master_count: u32,
    pub webhook_timeout: Duration,
    pub service_resolver: Arc<dyn ServiceResolver>,
    pub auth_info_resolver: Arc<dyn AuthInfoResolver>,
    pub admission: Arc<dyn AdmissionChain>,
    pub delegate: Arc<dyn Delegate>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            min_request_timeout: Duration::from_secs(1800),
            max_request_body_bytes: 3 * 1024 * 1024,
            master_count: 1,
            webhook_timeout: Duration::from_secs(10),
            service_resolver: Arc::new(ClusterServiceResolver),
            auth_info_resolver: Arc::new(AnonymousAuthResolver),
            admission: Arc::new(NoopAdmission),
            delegate: Arc::new(NotFoundDelegate),
        }
    }
}

impl ServerConfig {
    /// per-definition webhook timeouts are clamped into sane bounds
    pub fn clamp_webhook_timeout(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.webhook_timeout)
            .clamp(WEBHOOK_TIMEOUT_FLOOR, WEBHOOK_TIMEOUT_CEILING)
    }
}

/// where requests for unowned paths fall through to
#[async_trait]
pub trait Delegate: Send + Sync {
    async fn handle(&self, request: ApiRequest) -> ApiResponse;
}

pub struct NotFoundDelegate;

#[async_trait]
impl Delegate for NotFoundDelegate {
    async fn handle(&self, request: ApiRequest) -> ApiResponse {
        ApiResponse::error(&ApiError::not_found("path", &request.path))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionOperation {
    Create,
    Update,
    Delete,
}

pub struct AdmissionAttributes<'a> {
    pub operation: AdmissionOperation,
    pub group: &'a str,
    pub version: &'a str,
    pub resource: &'a str,
    pub subresource: &'a str,
    pub namespace: &'a str,
    pub name: &'a str,
}

/// the configured mutating and validating plugin chains; consumed here,
/// implemented elsewhere
#[async_trait]
pub trait AdmissionChain: Send + Sync {
    async fn mutate(
        &self,
        attributes: &AdmissionAttributes<'_>,
        object: &mut Unstructured,
        old: Option<&Unstructured>,
    ) -> Result<(), ApiError>;

    async fn validate(
        &self,
        attributes: &AdmissionAttributes<'_>,
        object: &Unstructured,
        old: Option<&Unstructured>,
    ) -> Result<(), ApiError>;
}

pub struct NoopAdmission;

#[async_trait]
impl AdmissionChain for NoopAdmission {
    async fn mutate(
        &self,
        _attributes: &AdmissionAttributes<'_>,
        _object: &mut Unstructured,
        _old: Option<&Unstructured>,
    ) -> Result<(), ApiError> {
        Ok(())
    }

    async fn validate(
        &self,
        _attributes: &AdmissionAttributes<'_>,
        _object: &Unstructured,
        _old: Option<&Unstructured>,
    ) -> Result<(), ApiError> {
        Ok(())
    }
}
