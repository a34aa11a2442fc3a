use serde::Deserialize;
use serde::Serialize;

/// goes as query parameters on list and watch requests
#[derive(Deserialize, Serialize, Default, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct ListOptions {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub limit: Option<u32>,
    #[serde(rename = "continue")]
    pub continue_token: Option<String>,
    pub resource_version: Option<String>,
    pub watch: Option<bool>,
    pub allow_watch_bookmarks: Option<bool>,
    pub timeout_seconds: Option<u32>,
}

impl ListOptions {
    pub fn is_watch(&self) -> bool {
        self.watch.unwrap_or(false)
    }
}

#[derive(Deserialize, Serialize, Debug, Default, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_period_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preconditions: Option<Preconditions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub propagation_policy: Option<PropagationPolicy>,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct Preconditions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

/// dependent handling requested by the client. The storage layer records
/// the policy on the deleted object as the matching finalizer; the
/// garbage collector acting on it is external.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationPolicy {
    Orphan,
    Background,
    Foreground,
}

impl PropagationPolicy {
    /// the finalizer that keeps the object pending until the collector
    /// has honored the policy; Background needs none
    pub fn finalizer(&self) -> Option<&'static str> {
        match self {
            Self::Orphan => Some("orphan"),
            Self::Background => None,
            Self::Foreground => Some("foregroundDeletion"),
        }
    }
}

#[derive(Deserialize, Serialize, Default, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateOptions {
    pub field_manager: Option<String>,
}

#[derive(Deserialize, Serialize, Default, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct PatchOptions {
    pub field_manager: Option<String>,
    pub force: Option<bool>,
}

/// content type negotiated patch flavors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchType {
    Json,
    Merge,
    StrategicMerge,
    Apply,
}

impl PatchType {
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        match content_type.split(';').next().map(str::trim) {
            Some("application/json-patch+json") => Some(Self::Json),
            Some("application/merge-patch+json") => Some(Self::Merge),
            Some("application/strategic-merge-patch+json") => Some(Self::StrategicMerge),
            Some("application/apply-patch+yaml") => Some(Self::Apply),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json-patch+json",
            Self::Merge => "application/merge-patch+json",
            Self::StrategicMerge => "application/strategic-merge-patch+json",
            Self::Apply => "application/apply-patch+yaml",
        }
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_list_options_query() {
        let opt: ListOptions =
            serde_json::from_str(r#"{"watch": true, "resourceVersion": "12", "limit": 5}"#)
                .expect("options");
        assert!(opt.is_watch());
        assert_eq!(opt.resource_version.as_deref(), Some("12"));
        assert_eq!(opt.limit, Some(5));
    }

    #[test]
    fn test_propagation_finalizers() {
        assert_eq!(PropagationPolicy::Foreground.finalizer(), Some("foregroundDeletion"));
        assert_eq!(PropagationPolicy::Orphan.finalizer(), Some("orphan"));
        assert_eq!(PropagationPolicy::Background.finalizer(), None);
    }

    #[test]
    fn test_patch_type_negotiation() {
        assert_eq!(
            PatchType::from_content_type("application/merge-patch+json"),
            Some(PatchType::Merge)
        );
        assert_eq!(
            PatchType::from_content_type("application/apply-patch+yaml; charset=utf-8"),
            Some(PatchType::Apply)
        );
        assert_eq!(PatchType::from_content_type("text/plain"), None);
    }
}
