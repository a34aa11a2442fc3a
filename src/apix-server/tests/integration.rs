//! end to end scenarios over the in-memory store: the full pipeline from
//! a resolved request through defaulting, validation, conversion and
//! storage, plus the controller driven lifecycle

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use http::header;
use http::Method;
use http::StatusCode;
use serde_json::json;
use serde_json::Value;

use apix_server::ApiRequest;
use apix_server::ApiResponse;
use apix_server::ApiServer;
use apix_server::ResponseBody;
use apix_server::ServerConfig;

const CRD_PATH: &str = "/apis/apiextensions.k8s.io/v1/customresourcedefinitions";

fn widget_crd() -> Value {
    json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": { "name": "widgets.example.com" },
        "spec": {
            "group": "example.com",
            "scope": "Namespaced",
            "names": { "plural": "widgets", "singular": "widget", "kind": "Widget" },
            "versions": [
                {
                    "name": "v1", "served": true, "storage": true,
                    "subresources": { "status": {} },
                    "schema": { "openAPIV3Schema": {
                        "type": "object",
                        "properties": {
                            "spec": {
                                "type": "object",
                                "properties": {
                                    "replicas": {
                                        "type": "integer",
                                        "x-kubernetes-validations": [
                                            {
                                                "rule": "self >= 0",
                                                "message": "replicas must be non-negative"
                                            },
                                            {
                                                "rule": "self >= oldSelf",
                                                "message": "replicas cannot decrease",
                                                "optionalOldSelf": true
                                            }
                                        ]
                                    },
                                    "mode": { "type": "string", "default": "auto" }
                                }
                            },
                            "status": {
                                "type": "object",
                                "properties": {
                                    "ready": { "type": "boolean" }
                                }
                            }
                        }
                    } }
                }
            ]
        }
    })
}

fn request(method: Method, path: &str) -> ApiRequest {
    ApiRequest::new(method, path)
}

fn json_request(method: Method, path: &str, body: &Value) -> ApiRequest {
    ApiRequest::new(method, path)
        .with_header(header::CONTENT_TYPE, "application/json")
        .with_body(serde_json::to_vec(body).expect("body"))
}

fn parse(response: &ApiResponse) -> Value {
    serde_json::from_slice(response.bytes()).expect("json response")
}

async fn create_crd(server: &Arc<ApiServer>, crd: Value) {
    let response = server
        .handle(json_request(Method::POST, CRD_PATH, &crd))
        .await;
    assert_eq!(response.status, StatusCode::CREATED, "{:?}", parse(&response));
}

async fn get_crd(server: &Arc<ApiServer>, name: &str) -> Value {
    let response = server
        .handle(request(Method::GET, &format!("{CRD_PATH}/{name}")))
        .await;
    assert_eq!(response.status, StatusCode::OK);
    parse(&response)
}

fn condition<'a>(crd: &'a Value, kind: &str) -> Option<&'a Value> {
    crd.pointer("/status/conditions")?
        .as_array()?
        .iter()
        .find(|c| c["type"] == kind)
}

type Check = std::pin::Pin<Box<dyn std::future::Future<Output = bool>>>;

async fn wait_for<F>(what: &str, mut check: F)
where
    F: FnMut() -> Check,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_established(server: &Arc<ApiServer>, name: &str) {
    let server = server.clone();
    let name = name.to_owned();
    wait_for("establishment", move || {
        let server = server.clone();
        let name = name.clone();
        Box::pin(async move {
            let crd = get_crd(&server, &name).await;
            condition(&crd, "Established")
                .map(|c| c["status"] == "True")
                .unwrap_or(false)
        })
    })
    .await;
}

async fn established_server() -> Arc<ApiServer> {
    let server = ApiServer::new(ServerConfig::default());
    create_crd(&server, widget_crd()).await;
    wait_established(&server, "widgets.example.com").await;
    server
}

fn widget(name: &str, replicas: i64) -> Value {
    json!({
        "apiVersion": "example.com/v1",
        "kind": "Widget",
        "metadata": { "name": name, "namespace": "default" },
        "spec": { "replicas": replicas }
    })
}

const WIDGETS: &str = "/apis/example.com/v1/namespaces/default/widgets";

#[tokio::test]
async fn test_create_under_rule_rejects_invalid_object() {
    let server = established_server().await;

    let response = server
        .handle(json_request(Method::POST, WIDGETS, &widget("a", -1)))
        .await;
    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
    let status = parse(&response);
    let cause = &status["details"]["causes"][0];
    assert_eq!(cause["field"], "spec.replicas");
    assert_eq!(cause["reason"], "FieldValueInvalid");
    assert_eq!(cause["message"], "replicas must be non-negative");
}

#[tokio::test]
async fn test_create_get_list_roundtrip_with_defaults() {
    let server = established_server().await;

    let response = server
        .handle(json_request(Method::POST, WIDGETS, &widget("a", 2)))
        .await;
    assert_eq!(response.status, StatusCode::CREATED, "{:?}", parse(&response));
    let created = parse(&response);
    assert_eq!(created["spec"]["mode"], "auto");
    assert_eq!(created["metadata"]["generation"], 1);
    assert!(created["metadata"]["uid"].is_string());

    let response = server
        .handle(request(Method::GET, &format!("{WIDGETS}/a")))
        .await;
    assert_eq!(response.status, StatusCode::OK);
    let fetched = parse(&response);
    assert_eq!(fetched["spec"]["replicas"], 2);
    assert_eq!(fetched["apiVersion"], "example.com/v1");

    let response = server.handle(request(Method::GET, WIDGETS)).await;
    let list = parse(&response);
    assert_eq!(list["kind"], "WidgetList");
    assert_eq!(list["items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_fields_are_pruned() {
    let server = established_server().await;

    let mut body = widget("a", 1);
    body["spec"]["surprise"] = json!("gone");
    let response = server.handle(json_request(Method::POST, WIDGETS, &body)).await;
    assert_eq!(response.status, StatusCode::CREATED);
    let created = parse(&response);
    assert!(created["spec"].get("surprise").is_none());
}

#[tokio::test]
async fn test_update_with_transition_rule() {
    let server = established_server().await;

    let response = server
        .handle(json_request(Method::POST, WIDGETS, &widget("a", 3)))
        .await;
    let created = parse(&response);
    let version = created["metadata"]["resourceVersion"].as_str().unwrap();

    let mut decrease = created.clone();
    decrease["spec"]["replicas"] = json!(2);
    let response = server
        .handle(json_request(Method::PUT, &format!("{WIDGETS}/a"), &decrease))
        .await;
    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
    let status = parse(&response);
    assert_eq!(status["details"]["causes"][0]["field"], "spec.replicas");
    assert_eq!(
        status["details"]["causes"][0]["message"],
        "replicas cannot decrease"
    );

    let mut increase = created.clone();
    increase["spec"]["replicas"] = json!(5);
    let response = server
        .handle(json_request(Method::PUT, &format!("{WIDGETS}/a"), &increase))
        .await;
    assert_eq!(response.status, StatusCode::OK, "{:?}", parse(&response));
    let updated = parse(&response);
    assert_eq!(updated["spec"]["replicas"], 5);
    assert_eq!(updated["metadata"]["generation"], 2);
    assert_ne!(updated["metadata"]["resourceVersion"].as_str().unwrap(), version);
}

#[tokio::test]
async fn test_stale_resource_version_conflicts() {
    let server = established_server().await;

    let created = parse(
        &server
            .handle(json_request(Method::POST, WIDGETS, &widget("a", 1)))
            .await,
    );

    let mut first = created.clone();
    first["spec"]["replicas"] = json!(2);
    let response = server
        .handle(json_request(Method::PUT, &format!("{WIDGETS}/a"), &first))
        .await;
    assert_eq!(response.status, StatusCode::OK);

    // same resourceVersion again: exactly one writer wins
    let mut second = created.clone();
    second["spec"]["replicas"] = json!(3);
    let response = server
        .handle(json_request(Method::PUT, &format!("{WIDGETS}/a"), &second))
        .await;
    assert_eq!(response.status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_status_subresource_isolation() {
    let server = established_server().await;

    let created = parse(
        &server
            .handle(json_request(Method::POST, WIDGETS, &widget("a", 1)))
            .await,
    );

    // a main-scope write cannot smuggle status in
    let mut with_status = created.clone();
    with_status["status"] = json!({ "ready": true });
    let response = server
        .handle(json_request(Method::PUT, &format!("{WIDGETS}/a"), &with_status))
        .await;
    assert_eq!(response.status, StatusCode::OK);
    let updated = parse(&response);
    assert!(updated.get("status").is_none());
    assert_eq!(updated["metadata"]["generation"], 1);

    // the status scope writes only status and never bumps generation
    let mut status_write = updated.clone();
    status_write["status"] = json!({ "ready": true });
    status_write["spec"]["replicas"] = json!(99);
    let response = server
        .handle(json_request(
            Method::PUT,
            &format!("{WIDGETS}/a/status"),
            &status_write,
        ))
        .await;
    assert_eq!(response.status, StatusCode::OK, "{:?}", parse(&response));
    let after_status = parse(&response);
    assert_eq!(after_status["status"]["ready"], true);
    assert_eq!(after_status["spec"]["replicas"], 1);
    assert_eq!(after_status["metadata"]["generation"], 1);
}

#[tokio::test]
async fn test_merge_patch() {
    let server = established_server().await;

    server
        .handle(json_request(Method::POST, WIDGETS, &widget("a", 1)))
        .await;
    let patch = ApiRequest::new(Method::PATCH, &format!("{WIDGETS}/a"))
        .with_header(header::CONTENT_TYPE, "application/merge-patch+json")
        .with_body(serde_json::to_vec(&json!({ "spec": { "replicas": 4 } })).unwrap());
    let response = server.handle(patch).await;
    assert_eq!(response.status, StatusCode::OK, "{:?}", parse(&response));
    let patched = parse(&response);
    assert_eq!(patched["spec"]["replicas"], 4);
    assert_eq!(patched["spec"]["mode"], "auto");
}

#[tokio::test]
async fn test_server_side_apply_create_and_conflict() {
    let server = established_server().await;

    let apply = |manager: &str, replicas: i64, force: bool| {
        let path = format!(
            "{WIDGETS}/a?fieldManager={manager}{}",
            if force { "&force=true" } else { "" }
        );
        ApiRequest::new(Method::PATCH, &path)
            .with_header(header::CONTENT_TYPE, "application/apply-patch+yaml")
            .with_body(
                serde_json::to_vec(&json!({
                    "apiVersion": "example.com/v1",
                    "kind": "Widget",
                    "metadata": { "name": "a", "namespace": "default" },
                    "spec": { "replicas": replicas }
                }))
                .unwrap(),
            )
    };

    // apply against a missing object creates it
    let response = server.handle(apply("alpha", 2, false)).await;
    assert_eq!(response.status, StatusCode::CREATED, "{:?}", parse(&response));

    // a second manager changing an owned field conflicts
    let response = server.handle(apply("beta", 7, false)).await;
    assert_eq!(response.status, StatusCode::CONFLICT);
    let status = parse(&response);
    assert!(status["message"].as_str().unwrap().contains("spec.replicas"));

    // force takes ownership
    let response = server.handle(apply("beta", 7, true)).await;
    assert_eq!(response.status, StatusCode::OK, "{:?}", parse(&response));
    let forced = parse(&response);
    assert_eq!(forced["spec"]["replicas"], 7);
}

#[tokio::test]
async fn test_delete_and_watch_stream() {
    let server = established_server().await;

    let watch = server
        .handle(request(Method::GET, &format!("{WIDGETS}?watch=true")))
        .await;
    assert_eq!(watch.status, StatusCode::OK);
    let ResponseBody::Stream(mut frames) = watch.body else {
        panic!("watch must stream");
    };

    server
        .handle(json_request(Method::POST, WIDGETS, &widget("a", 1)))
        .await;
    let response = server
        .handle(request(Method::DELETE, &format!("{WIDGETS}/a")))
        .await;
    assert_eq!(response.status, StatusCode::OK);

    let added = tokio::time::timeout(Duration::from_secs(5), frames.next())
        .await
        .expect("added event")
        .expect("frame");
    let added: Value = serde_json::from_slice(&added).expect("event json");
    assert_eq!(added["type"], "ADDED");
    assert_eq!(added["object"]["metadata"]["name"], "a");
    assert_eq!(added["object"]["apiVersion"], "example.com/v1");

    let deleted = tokio::time::timeout(Duration::from_secs(5), frames.next())
        .await
        .expect("deleted event")
        .expect("frame");
    let deleted: Value = serde_json::from_slice(&deleted).expect("event json");
    assert_eq!(deleted["type"], "DELETED");

    let first = added["object"]["metadata"]["resourceVersion"]
        .as_str().unwrap().parse::<u64>().unwrap();
    let second = deleted["object"]["metadata"]["resourceVersion"]
        .as_str().unwrap().parse::<u64>().unwrap();
    assert!(first < second);
}

#[tokio::test]
async fn test_watch_survives_crd_update_and_new_version_serves() {
    let server = established_server().await;

    let watch = server
        .handle(request(Method::GET, &format!("{WIDGETS}?watch=true")))
        .await;
    let ResponseBody::Stream(mut frames) = watch.body else {
        panic!("watch must stream");
    };

    // add a served v2 alongside v1
    let mut crd = get_crd(&server, "widgets.example.com").await;
    crd["spec"]["versions"]
        .as_array_mut()
        .unwrap()
        .push(json!({ "name": "v2", "served": true, "storage": false }));
    let response = server
        .handle(json_request(
            Method::PUT,
            &format!("{CRD_PATH}/widgets.example.com"),
            &crd,
        ))
        .await;
    assert_eq!(response.status, StatusCode::OK, "{:?}", parse(&response));

    let server_ref = server.clone();
    wait_for("v2 to serve", move || {
        let server = server_ref.clone();
        Box::pin(async move {
            let response = server
                .handle(request(
                    Method::GET,
                    "/apis/example.com/v2/namespaces/default/widgets",
                ))
                .await;
            response.status == StatusCode::OK
        })
    })
    .await;

    // the old watch keeps delivering without reconnection
    server
        .handle(json_request(Method::POST, WIDGETS, &widget("a", 1)))
        .await;
    let event = tokio::time::timeout(Duration::from_secs(5), frames.next())
        .await
        .expect("event after swap")
        .expect("frame");
    let event: Value = serde_json::from_slice(&event).expect("event json");
    assert_eq!(event["type"], "ADDED");
}

#[tokio::test]
async fn test_finalizer_cleanup_on_crd_delete() {
    let server = established_server().await;

    for name in ["a", "b", "c"] {
        let response = server
            .handle(json_request(Method::POST, WIDGETS, &widget(name, 1)))
            .await;
        assert_eq!(response.status, StatusCode::CREATED);
    }

    let response = server
        .handle(request(
            Method::DELETE,
            &format!("{CRD_PATH}/widgets.example.com"),
        ))
        .await;
    assert_eq!(response.status, StatusCode::OK);

    // the definition disappears only after all instances are purged
    let server_ref = server.clone();
    wait_for("definition removal", move || {
        let server = server_ref.clone();
        Box::pin(async move {
            let response = server
                .handle(request(
                    Method::GET,
                    &format!("{CRD_PATH}/widgets.example.com"),
                ))
                .await;
            response.status == StatusCode::NOT_FOUND
        })
    })
    .await;

    let response = server.handle(request(Method::GET, WIDGETS)).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_protected_group_approval_condition() {
    let server = ApiServer::new(ServerConfig::default());
    let mut crd = widget_crd();
    crd["metadata"]["name"] = json!("widgets.foo.k8s.io");
    crd["spec"]["group"] = json!("foo.k8s.io");
    create_crd(&server, crd).await;
    wait_established(&server, "widgets.foo.k8s.io").await;

    let server_ref = server.clone();
    wait_for("approval condition", move || {
        let server = server_ref.clone();
        Box::pin(async move {
            let crd = get_crd(&server, "widgets.foo.k8s.io").await;
            condition(&crd, "KubernetesAPIApprovalPolicyConformant")
                .map(|c| c["status"] == "False" && c["reason"] == "MissingAnnotation")
                .unwrap_or(false)
        })
    })
    .await;

    // the type still serves while unapproved
    let response = server
        .handle(request(
            Method::GET,
            "/apis/foo.k8s.io/v1/namespaces/default/widgets",
        ))
        .await;
    assert_eq!(response.status, StatusCode::OK);

    // adding the annotation flips the condition
    let mut crd = get_crd(&server, "widgets.foo.k8s.io").await;
    crd["metadata"]["annotations"] = json!({
        "api-approved.kubernetes.io": "https://github.com/kubernetes/enhancements/pull/1111"
    });
    let response = server
        .handle(json_request(
            Method::PUT,
            &format!("{CRD_PATH}/widgets.foo.k8s.io"),
            &crd,
        ))
        .await;
    assert_eq!(response.status, StatusCode::OK, "{:?}", parse(&response));

    let server_ref = server.clone();
    wait_for("approval flip", move || {
        let server = server_ref.clone();
        Box::pin(async move {
            let crd = get_crd(&server, "widgets.foo.k8s.io").await;
            condition(&crd, "KubernetesAPIApprovalPolicyConformant")
                .map(|c| c["status"] == "True")
                .unwrap_or(false)
        })
    })
    .await;
}

#[tokio::test]
async fn test_stored_versions_progression() {
    let server = established_server().await;

    server
        .handle(json_request(Method::POST, WIDGETS, &widget("a", 1)))
        .await;
    let crd = get_crd(&server, "widgets.example.com").await;
    assert_eq!(crd["status"]["storedVersions"], json!(["v1"]));

    // move storage to v2; the next write records the new version
    let mut updated = crd.clone();
    updated["spec"]["versions"] = json!([
        { "name": "v1", "served": true, "storage": false },
        { "name": "v2", "served": true, "storage": true }
    ]);
    let response = server
        .handle(json_request(
            Method::PUT,
            &format!("{CRD_PATH}/widgets.example.com"),
            &updated,
        ))
        .await;
    assert_eq!(response.status, StatusCode::OK, "{:?}", parse(&response));

    let server_ref = server.clone();
    wait_for("v2 serving", move || {
        let server = server_ref.clone();
        Box::pin(async move {
            let response = server
                .handle(request(
                    Method::GET,
                    "/apis/example.com/v2/namespaces/default/widgets",
                ))
                .await;
            response.status == StatusCode::OK
        })
    })
    .await;

    let response = server
        .handle(json_request(
            Method::POST,
            "/apis/example.com/v2/namespaces/default/widgets",
            &json!({
                "apiVersion": "example.com/v2",
                "kind": "Widget",
                "metadata": { "name": "b", "namespace": "default" }
            }),
        ))
        .await;
    assert_eq!(response.status, StatusCode::CREATED, "{:?}", parse(&response));

    let server_ref = server.clone();
    wait_for("stored version append", move || {
        let server = server_ref.clone();
        Box::pin(async move {
            let crd = get_crd(&server, "widgets.example.com").await;
            crd["status"]["storedVersions"] == json!(["v1", "v2"])
        })
    })
    .await;

    // dropping v1 from the spec is rejected while storedVersions names it
    let crd = get_crd(&server, "widgets.example.com").await;
    let mut dropped = crd.clone();
    dropped["spec"]["versions"] = json!([
        { "name": "v2", "served": true, "storage": true }
    ]);
    let response = server
        .handle(json_request(
            Method::PUT,
            &format!("{CRD_PATH}/widgets.example.com"),
            &dropped,
        ))
        .await;
    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);

    // an administrator trims storedVersions through the status
    // subresource, after which the spec change is accepted
    let mut trimmed = get_crd(&server, "widgets.example.com").await;
    trimmed["status"]["storedVersions"] = json!(["v2"]);
    let response = server
        .handle(json_request(
            Method::PUT,
            &format!("{CRD_PATH}/widgets.example.com/status"),
            &trimmed,
        ))
        .await;
    assert_eq!(response.status, StatusCode::OK, "{:?}", parse(&response));

    let mut dropped = get_crd(&server, "widgets.example.com").await;
    dropped["spec"]["versions"] = json!([
        { "name": "v2", "served": true, "storage": true }
    ]);
    let response = server
        .handle(json_request(
            Method::PUT,
            &format!("{CRD_PATH}/widgets.example.com"),
            &dropped,
        ))
        .await;
    assert_eq!(response.status, StatusCode::OK, "{:?}", parse(&response));
}

#[tokio::test]
async fn test_discovery_and_openapi_publication() {
    let server = established_server().await;

    let server_ref = server.clone();
    wait_for("discovery", move || {
        let server = server_ref.clone();
        Box::pin(async move {
            let response = server.handle(request(Method::GET, "/apis")).await;
            let doc = parse(&response);
            doc["groups"]
                .as_array()
                .map(|groups| groups.iter().any(|g| g["name"] == "example.com"))
                .unwrap_or(false)
        })
    })
    .await;

    let response = server
        .handle(request(Method::GET, "/apis/example.com/v1"))
        .await;
    assert_eq!(response.status, StatusCode::OK);
    let resources = parse(&response);
    let names: Vec<&str> = resources["resources"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"widgets"));
    assert!(names.contains(&"widgets/status"));

    let server_ref = server.clone();
    wait_for("openapi", move || {
        let server = server_ref.clone();
        Box::pin(async move {
            let response = server.handle(request(Method::GET, "/openapi/v2")).await;
            let doc = parse(&response);
            doc["definitions"].get("example.com.v1.Widget").is_some()
        })
    })
    .await;
}

#[tokio::test]
async fn test_deprecated_version_warning() {
    let server = ApiServer::new(ServerConfig::default());
    let mut crd = widget_crd();
    crd["spec"]["versions"][0]["deprecated"] = json!(true);
    crd["spec"]["versions"][0]["deprecationWarning"] =
        json!("example.com/v1 Widget is deprecated; use v2");
    create_crd(&server, crd).await;
    wait_established(&server, "widgets.example.com").await;

    let response = server
        .handle(json_request(Method::POST, WIDGETS, &widget("a", 1)))
        .await;
    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(
        response.warning.as_deref(),
        Some("example.com/v1 Widget is deprecated; use v2")
    );
}

#[tokio::test]
async fn test_yaml_negotiation() {
    let server = established_server().await;

    let yaml = "apiVersion: example.com/v1\nkind: Widget\nmetadata:\n  name: a\n  namespace: default\nspec:\n  replicas: 1\n";
    let response = server
        .handle(
            ApiRequest::new(Method::POST, WIDGETS)
                .with_header(header::CONTENT_TYPE, "application/yaml")
                .with_header(header::ACCEPT, "application/yaml")
                .with_body(yaml),
        )
        .await;
    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(response.content_type, "application/yaml");
    let doc: Value = serde_yaml::from_slice(response.bytes()).expect("yaml response");
    assert_eq!(doc["spec"]["replicas"], 1);

    // a protobuf-only client cannot be satisfied
    let response = server
        .handle(
            request(Method::GET, &format!("{WIDGETS}/a"))
                .with_header(header::ACCEPT, "application/vnd.kubernetes.protobuf"),
        )
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_scale_subresource() {
    let server = ApiServer::new(ServerConfig::default());
    let mut crd = widget_crd();
    crd["spec"]["versions"][0]["subresources"] = json!({
        "status": {},
        "scale": {
            "specReplicasPath": ".spec.replicas",
            "statusReplicasPath": ".status.replicas"
        }
    });
    create_crd(&server, crd).await;
    wait_established(&server, "widgets.example.com").await;

    server
        .handle(json_request(Method::POST, WIDGETS, &widget("a", 2)))
        .await;

    let response = server
        .handle(request(Method::GET, &format!("{WIDGETS}/a/scale")))
        .await;
    assert_eq!(response.status, StatusCode::OK);
    let scale = parse(&response);
    assert_eq!(scale["kind"], "Scale");
    assert_eq!(scale["spec"]["replicas"], 2);
    let version = scale["metadata"]["resourceVersion"].as_str().unwrap().to_owned();

    let response = server
        .handle(json_request(
            Method::PUT,
            &format!("{WIDGETS}/a/scale"),
            &json!({
                "apiVersion": "autoscaling/v1",
                "kind": "Scale",
                "metadata": { "name": "a", "namespace": "default", "resourceVersion": version },
                "spec": { "replicas": 6 }
            }),
        ))
        .await;
    assert_eq!(response.status, StatusCode::OK, "{:?}", parse(&response));

    let response = server
        .handle(request(Method::GET, &format!("{WIDGETS}/a")))
        .await;
    let widget = parse(&response);
    assert_eq!(widget["spec"]["replicas"], 6);
}

#[tokio::test]
async fn test_unserved_version_not_found_and_unknown_type_delegates() {
    let server = established_server().await;

    let response = server
        .handle(request(
            Method::GET,
            "/apis/example.com/v9/namespaces/default/widgets",
        ))
        .await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);

    // unknown group falls through to the delegate
    let response = server
        .handle(request(
            Method::GET,
            "/apis/unknown.io/v1/namespaces/default/things",
        ))
        .await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}
