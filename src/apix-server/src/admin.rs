//!
//! # Definition administration endpoints
//!
//! `/apis/apiextensions.k8s.io/v1/customresourcedefinitions` with the
//! usual verbs plus the status subresource. Unlike the dynamic types
//! these endpoints decode into a compile time known schema; they share
//! the registry and storage the dynamic side serves from.
//!
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use http::Method;
use http::StatusCode;
use serde_json::json;

use apix_types::options::DeleteOptions;
use apix_types::options::ListOptions;
use apix_types::ApiError;
use apix_types::CustomResourceDefinition;
use apix_types::Status;
use apix_types::API_GROUP;
use apix_types::API_VERSION;
use apix_types::CRD_PLURAL;

use crate::crdstore::CrdStore;
use crate::request::ApiRequest;
use crate::request::ApiResponse;
use crate::request::RequestInfo;

pub struct AdminApi {
    crds: Arc<CrdStore>,
}

impl AdminApi {
    pub fn new(crds: Arc<CrdStore>) -> Self {
        Self { crds }
    }

    pub fn owns(path: &str) -> bool {
        RequestInfo::parse(path)
            .map(|info| info.group == API_GROUP)
            .unwrap_or(false)
    }

    pub async fn handle(&self, request: ApiRequest) -> ApiResponse {
        match self.dispatch(&request).await {
            Ok(response) => response,
            Err(err) => ApiResponse::error(&err),
        }
    }

    async fn dispatch(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let info = RequestInfo::parse(&request.path)
            .ok_or_else(|| ApiError::not_found("path", &request.path))?;
        if info.version != "v1" || info.resource != CRD_PLURAL || info.namespace.is_some() {
            return Err(ApiError::not_found(&info.resource, &info.version));
        }
        let subresource = info.subresource();
        if !matches!(subresource, "" | "status") {
            return Err(ApiError::not_found("subresource", subresource));
        }

        let method = &request.method;
        if *method == Method::GET {
            return match &info.name {
                Some(name) => {
                    let crd = self.crds.get(name).await?;
                    encode(StatusCode::OK, &crd)
                }
                None => {
                    let options: ListOptions = request.options()?;
                    if options.is_watch() {
                        return self.watch(&options).await;
                    }
                    let list = self.crds.list().await?;
                    encode(
                        StatusCode::OK,
                        &json!({
                            "apiVersion": API_VERSION,
                            "kind": "CustomResourceDefinitionList",
                            "items": list,
                        }),
                    )
                }
            };
        }
        if *method == Method::POST && info.name.is_none() && subresource.is_empty() {
            let crd = decode(&request.body)?;
            let created = self.crds.create(crd).await?;
            return encode(StatusCode::CREATED, &created);
        }
        if *method == Method::PUT {
            if let Some(name) = &info.name {
                let mut crd = decode(&request.body)?;
                if crd.metadata.name.is_empty() {
                    crd.metadata.name = name.clone();
                }
                if &crd.metadata.name != name {
                    return Err(ApiError::bad_request(format!(
                        "name \"{}\" does not match the request path",
                        crd.metadata.name
                    )));
                }
                let updated = if subresource == "status" {
                    self.crds.update_status(crd).await?
                } else {
                    self.crds.update(crd).await?
                };
                return encode(StatusCode::OK, &updated);
            }
        }
        if *method == Method::DELETE && subresource.is_empty() {
            if let Some(name) = &info.name {
                let options: DeleteOptions = if request.body.is_empty() {
                    DeleteOptions::default()
                } else {
                    serde_json::from_slice(&request.body).map_err(|err| {
                        ApiError::bad_request(format!("invalid delete options: {err}"))
                    })?
                };
                let (crd, pending) = self.crds.delete(name, &options).await?;
                return if pending {
                    encode(StatusCode::OK, &crd)
                } else {
                    encode(StatusCode::OK, &Status::success())
                };
            }
        }
        Err(ApiError::bad_request(format!(
            "method {} is not supported on this path",
            request.method
        )))
    }

    async fn watch(&self, options: &ListOptions) -> Result<ApiResponse, ApiError> {
        let events = self.crds.watch_objects(options).await?;
        let frames = events
            .map(|event| {
                let mut frame = serde_json::to_vec(&event).unwrap_or_default();
                frame.push(b'\n');
                Bytes::from(frame)
            })
            .boxed();
        Ok(ApiResponse::stream("application/json", frames))
    }
}

fn decode(body: &[u8]) -> Result<CustomResourceDefinition, ApiError> {
    if body.is_empty() {
        return Err(ApiError::bad_request("request body is required"));
    }
    serde_json::from_slice(body)
        .or_else(|_| serde_yaml::from_slice(body))
        .map_err(|err: serde_yaml::Error| {
            ApiError::bad_request(format!("malformed definition: {err}"))
        })
}

fn encode<T: serde::Serialize>(status: StatusCode, body: &T) -> Result<ApiResponse, ApiError> {
    let bytes =
        serde_json::to_vec(body).map_err(|err| ApiError::internal(format!("encode: {err}")))?;
    Ok(ApiResponse::json(status, bytes))
}
