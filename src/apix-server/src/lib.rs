mod admin;
mod config;
pub mod controllers;
mod crdstore;
mod discovery;
mod handler;
mod openapi;
mod request;
mod server;
mod serving;
mod version;

pub use self::admin::AdminApi;
pub use self::config::*;
pub use self::crdstore::{CrdEvent, CrdEventKind, CrdStore};
pub use self::discovery::DiscoveryPublisher;
pub use self::handler::CrdDispatcher;
pub use self::openapi::OpenApiPublisher;
pub use self::request::{ApiRequest, ApiResponse, RequestInfo, ResponseBody};
pub use self::server::ApiServer;
pub use self::serving::{CompiledVersion, ServingInfo, Snapshot};
pub use self::version::{compare_versions, sort_versions, storage_version_hash};
