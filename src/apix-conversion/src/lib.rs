//!
//! # Object conversion between served versions
//!
//! One converter per definition. The `None` strategy rewrites only
//! `apiVersion`; the webhook strategy ships batches of objects through
//! the ConversionReview protocol over HTTPS. Either way the stored
//! identity fields of an object are untouchable.
//!
mod client;
mod review;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use apix_types::ApiError;
use apix_types::ConversionStrategy;
use apix_types::CrdConversion;
use apix_types::Unstructured;

pub use client::AnonymousAuthResolver;
pub use client::AuthInfoResolver;
pub use client::ClusterServiceResolver;
pub use client::ServiceResolver;
pub use client::WebhookClient;
pub use review::negotiate_review_version;
pub use review::ConversionRequest;
pub use review::ConversionResponse;
pub use review::ConversionReview;
pub use review::ReviewStatus;
pub use review::SUPPORTED_REVIEW_VERSIONS;

pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("bad webhook client config: {0}")]
    BadClientConfig(String),
    #[error("webhook call timed out after {0:?}")]
    Timeout(Duration),
    #[error("webhook transport failure: {0}")]
    Transport(String),
    #[error("webhook protocol failure: {0}")]
    Protocol(String),
}

/// metadata a webhook must return unchanged
const IMMUTABLE_METADATA: [&str; 4] = [
    "uid",
    "resourceVersion",
    "creationTimestamp",
    "managedFields",
];

pub enum Converter {
    /// identity or apiVersion-only rewrite
    Nop,
    Webhook(WebhookConverter),
}

pub struct WebhookConverter {
    client: WebhookClient,
    url: String,
    review_versions: Vec<String>,
}

impl Converter {
    pub fn nop() -> Self {
        Self::Nop
    }

    /// build the converter a definition declares
    pub fn from_crd(
        conversion: Option<&CrdConversion>,
        resolver: &dyn ServiceResolver,
        auth: Arc<dyn AuthInfoResolver>,
        timeout: Duration,
    ) -> Result<Self, ConversionError> {
        let Some(conversion) = conversion else {
            return Ok(Self::Nop);
        };
        match conversion.strategy {
            ConversionStrategy::None => Ok(Self::Nop),
            ConversionStrategy::Webhook => {
                let webhook = conversion.webhook.as_ref().ok_or_else(|| {
                    ConversionError::BadClientConfig(
                        "webhook strategy requires a webhook block".to_owned(),
                    )
                })?;
                let config = &webhook.client_config;
                let url = match (&config.url, &config.service) {
                    (Some(url), _) => url.clone(),
                    (None, Some(service)) => resolver.resolve(service)?,
                    (None, None) => {
                        return Err(ConversionError::BadClientConfig(
                            "webhook requires url or service".to_owned(),
                        ))
                    }
                };
                let client = WebhookClient::new(config.ca_bundle.as_deref(), auth, timeout)?;
                Ok(Self::Webhook(WebhookConverter {
                    client,
                    url,
                    review_versions: webhook.conversion_review_versions.clone(),
                }))
            }
        }
    }

    pub async fn convert_one(
        &self,
        object: Unstructured,
        target_api_version: &str,
    ) -> Result<Unstructured, ApiError> {
        let mut converted = self.convert(vec![object], target_api_version).await?;
        converted
            .pop()
            .ok_or_else(|| ApiError::internal("conversion returned no object"))
    }

    /// convert a batch to the target version, amortizing the webhook RTT
    /// across list and watch payloads
    pub async fn convert(
        &self,
        objects: Vec<Unstructured>,
        target_api_version: &str,
    ) -> Result<Vec<Unstructured>, ApiError> {
        match self {
            Self::Nop => Ok(objects
                .into_iter()
                .map(|mut object| {
                    if object.api_version() != target_api_version {
                        object.set_api_version(target_api_version);
                    }
                    object
                })
                .collect()),
            Self::Webhook(webhook) => webhook.convert(objects, target_api_version).await,
        }
    }
}

impl WebhookConverter {
    fn error(&self, err: ConversionError) -> ApiError {
        ApiError::internal(format!("conversion webhook \"{}\": {err}", self.url))
    }

    async fn convert(
        &self,
        mut objects: Vec<Unstructured>,
        target_api_version: &str,
    ) -> Result<Vec<Unstructured>, ApiError> {
        let pending: Vec<usize> = objects
            .iter()
            .enumerate()
            .filter(|(_, object)| object.api_version() != target_api_version)
            .map(|(idx, _)| idx)
            .collect();
        if pending.is_empty() {
            return Ok(objects);
        }

        let review_version = negotiate_review_version(&self.review_versions)
            .ok_or_else(|| {
                self.error(ConversionError::Protocol(format!(
                    "no common conversionReviewVersions in {:?}",
                    self.review_versions
                )))
            })?;
        let uid = random_uid();
        let payload: Vec<Value> = pending
            .iter()
            .map(|&idx| objects[idx].value().clone())
            .collect();
        debug!(
            url = %self.url,
            count = payload.len(),
            target = target_api_version,
            "converting via webhook"
        );

        let review = ConversionReview::new_request(
            review_version,
            uid.clone(),
            target_api_version.to_owned(),
            payload,
        );
        let body = serde_json::to_vec(&review)
            .map_err(|err| self.error(ConversionError::Protocol(err.to_string())))?;
        let raw = self
            .client
            .post_review(&self.url, body)
            .await
            .map_err(|err| self.error(err))?;

        let parsed: ConversionReview = serde_json::from_slice(&raw)
            .map_err(|err| self.error(ConversionError::Protocol(format!("bad response: {err}"))))?;
        let response = parsed.response.ok_or_else(|| {
            self.error(ConversionError::Protocol("response block missing".to_owned()))
        })?;
        if response.uid != uid {
            return Err(self.error(ConversionError::Protocol(format!(
                "uid mismatch: sent {uid}, got {}",
                response.uid
            ))));
        }
        if !response.result.is_success() {
            return Err(self.error(ConversionError::Protocol(format!(
                "webhook reported failure: {}",
                response.result.message.as_deref().unwrap_or("no message")
            ))));
        }
        if response.converted_objects.len() != pending.len() {
            return Err(self.error(ConversionError::Protocol(format!(
                "sent {} objects, got {} back",
                pending.len(),
                response.converted_objects.len()
            ))));
        }

        for (&idx, converted) in pending.iter().zip(response.converted_objects) {
            let converted = Unstructured::new(converted);
            verify_converted(&objects[idx], &converted, target_api_version)
                .map_err(|err| self.error(err))?;
            objects[idx] = converted;
        }
        Ok(objects)
    }
}

/// webhooks that mutate stored identity fields are treated as failed
pub fn verify_converted(
    original: &Unstructured,
    converted: &Unstructured,
    target_api_version: &str,
) -> Result<(), ConversionError> {
    if converted.api_version() != target_api_version {
        return Err(ConversionError::Protocol(format!(
            "object converted to \"{}\" instead of \"{}\"",
            converted.api_version(),
            target_api_version
        )));
    }
    for field in IMMUTABLE_METADATA {
        let pointer = format!("/metadata/{field}");
        let before = original.value().pointer(&pointer);
        let after = converted.value().pointer(&pointer);
        if before != after {
            return Err(ConversionError::Protocol(format!(
                "webhook mutated metadata.{field}"
            )));
        }
    }
    Ok(())
}

fn random_uid() -> String {
    let mut rng = rand::thread_rng();
    (0..32).map(|_| format!("{:x}", rng.gen_range(0..16u8))).collect()
}
