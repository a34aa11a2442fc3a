//!
//! # Request and response boundary
//!
//! The core begins at a resolved (method, path, body) tuple; the network
//! listener in front of it is someone else's concern. Path parsing is the
//! mirror image of the URI construction a client does.
//!
use bytes::Bytes;
use futures_util::stream::BoxStream;
use http::header;
use http::HeaderMap;
use http::Method;
use http::StatusCode;
use serde::Deserialize;

use apix_types::ApiError;
use apix_types::Status;

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// path without the query string
    pub path: String,
    pub query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiRequest {
    pub fn new(method: Method, uri: &str) -> Self {
        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path.to_owned(), query.to_owned()),
            None => (uri.to_owned(), String::new()),
        };
        Self {
            method,
            path,
            query,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: header::HeaderName, value: &str) -> Self {
        if let Ok(value) = value.parse() {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn content_type(&self) -> &str {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
    }

    pub fn accept(&self) -> &str {
        self.headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
    }

    pub fn options<'de, T: Deserialize<'de>>(&'de self) -> Result<T, ApiError> {
        serde_qs::from_str(&self.query)
            .map_err(|err| ApiError::bad_request(format!("invalid query string: {err}")))
    }
}

pub enum ResponseBody {
    Full(Bytes),
    /// newline delimited frames for watches
    Stream(BoxStream<'static, Bytes>),
}

pub struct ApiResponse {
    pub status: StatusCode,
    pub content_type: String,
    pub warning: Option<String>,
    pub body: ResponseBody,
}

impl ApiResponse {
    pub fn json(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: "application/json".to_owned(),
            warning: None,
            body: ResponseBody::Full(body.into()),
        }
    }

    pub fn full(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: content_type.to_owned(),
            warning: None,
            body: ResponseBody::Full(body.into()),
        }
    }

    pub fn stream(content_type: &str, frames: BoxStream<'static, Bytes>) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: content_type.to_owned(),
            warning: None,
            body: ResponseBody::Stream(frames),
        }
    }

    pub fn error(error: &ApiError) -> Self {
        let status: Status = error.to_status();
        let body = serde_json::to_vec(&status).unwrap_or_default();
        Self::json(error.http_code(), body)
    }

    pub fn with_warning(mut self, warning: Option<String>) -> Self {
        self.warning = warning;
        self
    }

    /// full body bytes; empty for streams
    pub fn bytes(&self) -> &[u8] {
        match &self.body {
            ResponseBody::Full(bytes) => bytes,
            ResponseBody::Stream(_) => &[],
        }
    }
}

/// a parsed `/apis/{group}/{version}/...` path
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestInfo {
    pub group: String,
    pub version: String,
    pub resource: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub subresource: Option<String>,
}

impl RequestInfo {
    /// parse paths of the form
    /// `/apis/{group}/{version}[/namespaces/{ns}]/{resource}[/{name}[/{subresource}]]`
    pub fn parse(path: &str) -> Option<Self> {
        let mut parts = path.trim_matches('/').split('/');
        if parts.next()? != "apis" {
            return None;
        }
        let group = parts.next()?.to_owned();
        let version = parts.next()?.to_owned();

        let mut info = RequestInfo {
            group,
            version,
            ..Default::default()
        };

        let mut next = parts.next()?.to_owned();
        if next == "namespaces" {
            info.namespace = Some(parts.next()?.to_owned());
            next = parts.next()?.to_owned();
        }
        info.resource = next;
        if let Some(name) = parts.next() {
            info.name = Some(name.to_owned());
            if let Some(subresource) = parts.next() {
                info.subresource = Some(subresource.to_owned());
            }
        }
        if parts.next().is_some() {
            return None;
        }
        Some(info)
    }

    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }

    pub fn subresource(&self) -> &str {
        self.subresource.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_cluster_scoped_paths() {
        let info = RequestInfo::parse("/apis/example.com/v1/widgets").expect("parse");
        assert_eq!(info.group, "example.com");
        assert_eq!(info.version, "v1");
        assert_eq!(info.resource, "widgets");
        assert_eq!(info.namespace, None);
        assert_eq!(info.name, None);

        let info = RequestInfo::parse("/apis/example.com/v1/widgets/a/status").expect("parse");
        assert_eq!(info.name.as_deref(), Some("a"));
        assert_eq!(info.subresource.as_deref(), Some("status"));
    }

    #[test]
    fn test_namespaced_paths() {
        let info =
            RequestInfo::parse("/apis/example.com/v1/namespaces/default/widgets/a").expect("parse");
        assert_eq!(info.namespace.as_deref(), Some("default"));
        assert_eq!(info.resource, "widgets");
        assert_eq!(info.name.as_deref(), Some("a"));
        assert_eq!(info.api_version(), "example.com/v1");
    }

    #[test]
    fn test_rejects_foreign_paths() {
        assert!(RequestInfo::parse("/api/v1/pods").is_none());
        assert!(RequestInfo::parse("/apis/example.com").is_none());
        assert!(RequestInfo::parse("/apis/example.com/v1/widgets/a/status/extra").is_none());
    }

    #[test]
    fn test_query_options() {
        let request = ApiRequest::new(Method::GET, "/apis/g/v1/widgets?watch=true&limit=5");
        let options: apix_types::options::ListOptions = request.options().expect("options");
        assert!(options.is_watch());
        assert_eq!(options.limit, Some(5));
    }
}
