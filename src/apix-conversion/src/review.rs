//! ConversionReview wire protocol

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

pub const REVIEW_KIND: &str = "ConversionReview";
pub const REVIEW_GROUP: &str = "apiextensions.k8s.io";

/// review versions this server can speak, newest first
pub const SUPPORTED_REVIEW_VERSIONS: [&str; 2] = ["v1", "v1beta1"];

/// pick the newest review version both sides advertise
pub fn negotiate_review_version(declared: &[String]) -> Option<&'static str> {
    if declared.is_empty() {
        return Some(SUPPORTED_REVIEW_VERSIONS[0]);
    }
    SUPPORTED_REVIEW_VERSIONS
        .iter()
        .find(|candidate| declared.iter().any(|d| d == *candidate))
        .copied()
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ConversionReview {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<ConversionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ConversionResponse>,
}

impl ConversionReview {
    pub fn new_request(
        review_version: &str,
        uid: String,
        desired_api_version: String,
        objects: Vec<Value>,
    ) -> Self {
        Self {
            api_version: format!("{REVIEW_GROUP}/{review_version}"),
            kind: REVIEW_KIND.to_owned(),
            request: Some(ConversionRequest {
                uid,
                desired_api_version,
                objects,
            }),
            response: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ConversionRequest {
    pub uid: String,
    #[serde(rename = "desiredAPIVersion")]
    pub desired_api_version: String,
    pub objects: Vec<Value>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ConversionResponse {
    pub uid: String,
    pub result: ReviewStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub converted_objects: Vec<Value>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ReviewStatus {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ReviewStatus {
    pub fn is_success(&self) -> bool {
        self.status == "Success"
    }
}

#[cfg(test)]
mod test {

    use serde_json::json;

    use super::*;

    #[test]
    fn test_negotiation_prefers_newest() {
        let declared = vec!["v1beta1".to_owned(), "v1".to_owned()];
        assert_eq!(negotiate_review_version(&declared), Some("v1"));

        let beta_only = vec!["v1beta1".to_owned()];
        assert_eq!(negotiate_review_version(&beta_only), Some("v1beta1"));

        let unknown = vec!["v2".to_owned()];
        assert_eq!(negotiate_review_version(&unknown), None);

        assert_eq!(negotiate_review_version(&[]), Some("v1"));
    }

    #[test]
    fn test_request_wire_shape() {
        let review = ConversionReview::new_request(
            "v1",
            "abc".to_owned(),
            "example.com/v1".to_owned(),
            vec![json!({ "kind": "Widget" })],
        );
        let wire = serde_json::to_value(&review).expect("serialize");
        assert_eq!(wire["apiVersion"], "apiextensions.k8s.io/v1");
        assert_eq!(wire["kind"], "ConversionReview");
        assert_eq!(wire["request"]["uid"], "abc");
        assert_eq!(wire["request"]["desiredAPIVersion"], "example.com/v1");
        assert_eq!(wire["request"]["objects"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_response_round_trip() {
        let raw = json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "ConversionReview",
            "response": {
                "uid": "abc",
                "result": { "status": "Success" },
                "convertedObjects": [ { "kind": "Widget" } ]
            }
        });
        let review: ConversionReview = serde_json::from_value(raw).expect("parse");
        let response = review.response.expect("response");
        assert!(response.result.is_success());
        assert_eq!(response.converted_objects.len(), 1);
    }
}
