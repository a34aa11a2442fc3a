//! scale subresource projection: the stored document stays the source of
//! truth, the Scale object is a view through the configured JSON paths

use serde_json::json;
use serde_json::Value;

use apix_types::ApiError;
use apix_types::ScaleSubresource;
use apix_types::Unstructured;

/// ".spec.replicas" style path into a JSON pointer
fn dotted_pointer(path: &str) -> String {
    let trimmed = path.trim_start_matches('.');
    format!("/{}", trimmed.replace('.', "/"))
}

pub fn read_scale(object: &Unstructured, subresource: &ScaleSubresource) -> Value {
    let spec_replicas = object
        .value()
        .pointer(&dotted_pointer(&subresource.spec_replicas_path))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let status_replicas = object
        .value()
        .pointer(&dotted_pointer(&subresource.status_replicas_path))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let selector = subresource
        .label_selector_path
        .as_deref()
        .and_then(|path| object.value().pointer(&dotted_pointer(path)))
        .and_then(Value::as_str)
        .unwrap_or("");

    json!({
        "apiVersion": "autoscaling/v1",
        "kind": "Scale",
        "metadata": {
            "name": object.name(),
            "namespace": object.namespace(),
            "uid": object.uid(),
            "resourceVersion": object.resource_version(),
        },
        "spec": { "replicas": spec_replicas },
        "status": { "replicas": status_replicas, "selector": selector }
    })
}

/// write the desired replica count back through the spec path, creating
/// intermediate objects as needed
pub fn apply_scale(
    object: &mut Unstructured,
    subresource: &ScaleSubresource,
    scale: &Value,
) -> Result<(), ApiError> {
    let replicas = scale
        .pointer("/spec/replicas")
        .and_then(Value::as_i64)
        .ok_or_else(|| ApiError::bad_request("scale.spec.replicas must be an integer"))?;
    if replicas < 0 {
        return Err(ApiError::bad_request("scale.spec.replicas must not be negative"));
    }

    let pointer = dotted_pointer(&subresource.spec_replicas_path);
    let mut current = object.value_mut();
    let segments: Vec<&str> = pointer.trim_start_matches('/').split('/').collect();
    for (idx, segment) in segments.iter().enumerate() {
        if !current.is_object() {
            *current = json!({});
        }
        let fields = current.as_object_mut().unwrap();
        if idx == segments.len() - 1 {
            fields.insert((*segment).to_owned(), json!(replicas));
            return Ok(());
        }
        current = fields
            .entry((*segment).to_owned())
            .or_insert_with(|| json!({}));
    }
    Err(ApiError::internal("empty scale replicas path"))
}

#[cfg(test)]
mod test {

    use serde_json::json;

    use super::*;

    fn subresource() -> ScaleSubresource {
        ScaleSubresource {
            spec_replicas_path: ".spec.replicas".to_owned(),
            status_replicas_path: ".status.replicas".to_owned(),
            label_selector_path: Some(".status.selector".to_owned()),
        }
    }

    #[test]
    fn test_read_scale() {
        let object = Unstructured::new(json!({
            "metadata": { "name": "a", "namespace": "default", "resourceVersion": "7" },
            "spec": { "replicas": 3 },
            "status": { "replicas": 2, "selector": "app=a" }
        }));
        let scale = read_scale(&object, &subresource());
        assert_eq!(scale["kind"], "Scale");
        assert_eq!(scale["spec"]["replicas"], 3);
        assert_eq!(scale["status"]["replicas"], 2);
        assert_eq!(scale["status"]["selector"], "app=a");
        assert_eq!(scale["metadata"]["resourceVersion"], "7");
    }

    #[test]
    fn test_apply_scale() {
        let mut object = Unstructured::new(json!({
            "metadata": { "name": "a" }
        }));
        apply_scale(
            &mut object,
            &subresource(),
            &json!({ "spec": { "replicas": 5 } }),
        )
        .expect("apply");
        assert_eq!(object.value().pointer("/spec/replicas"), Some(&json!(5)));
    }

    #[test]
    fn test_apply_scale_rejects_bad_input() {
        let mut object = Unstructured::new(json!({}));
        assert!(apply_scale(&mut object, &subresource(), &json!({ "spec": {} })).is_err());
        assert!(apply_scale(
            &mut object,
            &subresource(),
            &json!({ "spec": { "replicas": -1 } })
        )
        .is_err());
    }
}
