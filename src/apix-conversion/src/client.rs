//! HTTPS client for conversion webhooks, trusted through the
//! definition's CA bundle

use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use hyper::body::to_bytes;
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::Body;
use hyper::Request;
use hyper::Uri;
use tracing::debug;
use tracing::trace;

use apix_types::ServiceReference;

use crate::ConversionError;

/// maps webhook service references to concrete URLs; the default resolver
/// uses cluster DNS names
pub trait ServiceResolver: Send + Sync {
    fn resolve(&self, service: &ServiceReference) -> Result<String, ConversionError>;
}

#[derive(Debug, Default)]
pub struct ClusterServiceResolver;

impl ServiceResolver for ClusterServiceResolver {
    fn resolve(&self, service: &ServiceReference) -> Result<String, ConversionError> {
        if service.name.is_empty() || service.namespace.is_empty() {
            return Err(ConversionError::BadClientConfig(
                "service reference requires name and namespace".to_owned(),
            ));
        }
        let port = service.port.unwrap_or(443);
        let path = service.path.as_deref().unwrap_or("");
        Ok(format!(
            "https://{}.{}.svc:{}{}",
            service.name, service.namespace, port, path
        ))
    }
}

/// supplies bearer credentials for webhook hosts; the default resolver
/// sends none
pub trait AuthInfoResolver: Send + Sync {
    fn bearer_token(&self, host: &str) -> Option<String>;
}

#[derive(Debug, Default)]
pub struct AnonymousAuthResolver;

impl AuthInfoResolver for AnonymousAuthResolver {
    fn bearer_token(&self, _host: &str) -> Option<String> {
        None
    }
}

type HttpsClient = hyper::Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>;

pub struct WebhookClient {
    client: HttpsClient,
    auth: Arc<dyn AuthInfoResolver>,
    timeout: Duration,
}

impl WebhookClient {
    /// `ca_bundle` is the base64 encoded PEM bundle from the definition;
    /// without one the system trust roots apply
    pub fn new(
        ca_bundle: Option<&str>,
        auth: Arc<dyn AuthInfoResolver>,
        timeout: Duration,
    ) -> Result<Self, ConversionError> {
        let builder = hyper_rustls::HttpsConnectorBuilder::new();
        let connector = match ca_bundle {
            Some(encoded) => {
                let pem = base64::engine::general_purpose::STANDARD
                    .decode(encoded.trim())
                    .map_err(|err| {
                        ConversionError::BadClientConfig(format!("caBundle is not base64: {err}"))
                    })?;
                let mut roots = rustls::RootCertStore::empty();
                let mut reader = BufReader::new(pem.as_slice());
                let certs = rustls_pemfile::certs(&mut reader).map_err(|err| {
                    ConversionError::BadClientConfig(format!("caBundle is not PEM: {err}"))
                })?;
                if certs.is_empty() {
                    return Err(ConversionError::BadClientConfig(
                        "caBundle holds no certificates".to_owned(),
                    ));
                }
                for cert in certs {
                    roots.add(&rustls::Certificate(cert)).map_err(|err| {
                        ConversionError::BadClientConfig(format!("bad CA certificate: {err}"))
                    })?;
                }
                let config = rustls::ClientConfig::builder()
                    .with_safe_defaults()
                    .with_root_certificates(roots)
                    .with_no_client_auth();
                builder
                    .with_tls_config(config)
                    .https_or_http()
                    .enable_http1()
                    .build()
            }
            None => builder
                .with_native_roots()
                .https_or_http()
                .enable_http1()
                .build(),
        };
        Ok(Self {
            client: hyper::Client::builder().build(connector),
            auth,
            timeout,
        })
    }

    pub async fn post_review(
        &self,
        url: &str,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, ConversionError> {
        let uri: Uri = url
            .parse()
            .map_err(|err| ConversionError::BadClientConfig(format!("bad url \"{url}\": {err}")))?;
        debug!(%uri, "calling conversion webhook");

        let mut request = Request::post(uri.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .map_err(|err| ConversionError::Transport(err.to_string()))?;
        if let Some(token) = self.auth.bearer_token(uri.host().unwrap_or_default()) {
            request.headers_mut().insert(
                hyper::header::AUTHORIZATION,
                format!("Bearer {token}")
                    .parse()
                    .map_err(|_| ConversionError::Transport("bad auth token".to_owned()))?,
            );
        }

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| ConversionError::Timeout(self.timeout))?
            .map_err(|err| ConversionError::Transport(err.to_string()))?;

        let status = response.status();
        let bytes = to_bytes(response.into_body())
            .await
            .map_err(|err| ConversionError::Transport(err.to_string()))?;
        trace!(status = %status, len = bytes.len(), "webhook response");
        if !status.is_success() {
            return Err(ConversionError::Transport(format!(
                "webhook returned status {status}"
            )));
        }
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_cluster_resolver() {
        let resolver = ClusterServiceResolver;
        let url = resolver
            .resolve(&ServiceReference {
                namespace: "default".to_owned(),
                name: "converter".to_owned(),
                path: Some("/convert".to_owned()),
                port: Some(8443),
            })
            .expect("resolve");
        assert_eq!(url, "https://converter.default.svc:8443/convert");
    }

    #[test]
    fn test_resolver_requires_identity() {
        let resolver = ClusterServiceResolver;
        assert!(resolver.resolve(&ServiceReference::default()).is_err());
    }

    #[test]
    fn test_bad_ca_bundle_rejected() {
        let result = WebhookClient::new(
            Some("!!!not-base64!!!"),
            Arc::new(AnonymousAuthResolver),
            Duration::from_secs(10),
        );
        assert!(matches!(result, Err(ConversionError::BadClientConfig(_))));
    }
}
