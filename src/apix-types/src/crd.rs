//!
//! # CustomResourceDefinition object model
//!
//! The persistent declaration of a dynamically served type: identity,
//! versions with schemas, conversion policy, and the status conditions
//! the lifecycle controllers coordinate through.
//!
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::metadata::now_timestamp;
use crate::metadata::ObjectMeta;

pub const API_GROUP: &str = "apiextensions.k8s.io";
pub const API_VERSION: &str = "apiextensions.k8s.io/v1";
pub const CRD_KIND: &str = "CustomResourceDefinition";
pub const CRD_PLURAL: &str = "customresourcedefinitions";

/// finalizer the server places on every definition so instances are
/// purged before the definition itself goes away
pub const CLEANUP_FINALIZER: &str = "apiextensions.k8s.io/instance-cleanup";

/// annotation required on definitions claiming a protected group
pub const APPROVAL_ANNOTATION: &str = "api-approved.kubernetes.io";

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CustomResourceDefinition {
    #[serde(default = "crd_api_version")]
    pub api_version: String,
    #[serde(default = "crd_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: CrdSpec,
    pub status: CrdStatus,
}

fn crd_api_version() -> String {
    API_VERSION.to_owned()
}

fn crd_kind() -> String {
    CRD_KIND.to_owned()
}

impl CustomResourceDefinition {
    /// `<plural>.<group>`, the only legal object name for a definition
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.spec.names.plural, self.spec.group)
    }

    pub fn uid(&self) -> &str {
        &self.metadata.uid
    }

    pub fn version(&self, name: &str) -> Option<&CrdVersion> {
        self.spec.versions.iter().find(|v| v.name == name)
    }

    pub fn storage_version(&self) -> Option<&CrdVersion> {
        self.spec.versions.iter().find(|v| v.storage)
    }

    pub fn served_versions(&self) -> impl Iterator<Item = &CrdVersion> {
        self.spec.versions.iter().filter(|v| v.served)
    }

    pub fn has_served_version(&self, name: &str) -> bool {
        self.version(name).map(|v| v.served).unwrap_or(false)
    }

    pub fn condition(&self, kind: CrdConditionType) -> Option<&CrdCondition> {
        self.status.conditions.iter().find(|c| c.r#type == kind)
    }

    pub fn condition_true(&self, kind: CrdConditionType) -> bool {
        self.condition(kind)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    pub fn is_established(&self) -> bool {
        self.condition_true(CrdConditionType::Established)
    }

    pub fn names_accepted(&self) -> bool {
        self.condition_true(CrdConditionType::NamesAccepted)
    }

    /// set a condition; writing an identical condition keeps the previous
    /// transition time and reports no change so reconciles stay idempotent
    pub fn set_condition(&mut self, condition: CrdCondition) -> bool {
        if let Some(existing) = self
            .status
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            if existing.status == condition.status
                && existing.reason == condition.reason
                && existing.message == condition.message
            {
                return false;
            }
            let transition = if existing.status == condition.status {
                existing.last_transition_time.clone()
            } else {
                condition.last_transition_time.clone()
            };
            *existing = condition;
            existing.last_transition_time = transition;
            true
        } else {
            self.status.conditions.push(condition);
            true
        }
    }

    pub fn remove_condition(&mut self, kind: CrdConditionType) -> bool {
        let before = self.status.conditions.len();
        self.status.conditions.retain(|c| c.r#type != kind);
        before != self.status.conditions.len()
    }
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CrdSpec {
    pub group: String,
    pub names: CrdNames,
    pub scope: CrdScope,
    pub versions: Vec<CrdVersion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversion: Option<CrdConversion>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub preserve_unknown_fields: bool,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CrdNames {
    pub plural: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub singular: String,
    pub kind: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub list_kind: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub short_names: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
}

impl CrdNames {
    /// fill derived names left empty by the client
    pub fn canonicalize(&mut self) {
        if self.singular.is_empty() {
            self.singular = self.kind.to_lowercase();
        }
        if self.list_kind.is_empty() {
            self.list_kind = format!("{}List", self.kind);
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrdScope {
    #[default]
    Namespaced,
    Cluster,
}

impl CrdScope {
    pub fn is_namespaced(&self) -> bool {
        matches!(self, Self::Namespaced)
    }
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CrdVersion {
    pub name: String,
    pub served: bool,
    pub storage: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deprecated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deprecation_warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<CrdValidation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subresources: Option<Subresources>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub additional_printer_columns: Vec<PrinterColumn>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub selectable_fields: Vec<SelectableField>,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CrdValidation {
    #[serde(rename = "openAPIV3Schema", skip_serializing_if = "Option::is_none")]
    pub open_api_v3_schema: Option<Value>,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Subresources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusSubresource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<ScaleSubresource>,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
pub struct StatusSubresource {}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ScaleSubresource {
    pub spec_replicas_path: String,
    pub status_replicas_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_selector_path: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PrinterColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub format: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    pub json_path: String,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SelectableField {
    pub json_path: String,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CrdConversion {
    pub strategy: ConversionStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookConversion>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversionStrategy {
    #[default]
    None,
    Webhook,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookConversion {
    pub client_config: WebhookClientConfig,
    pub conversion_review_versions: Vec<String>,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookClientConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceReference>,
    /// base64 encoded PEM bundle used to verify the webhook endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceReference {
    pub namespace: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CrdStatus {
    pub accepted_names: CrdNames,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stored_versions: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<CrdCondition>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CrdCondition {
    pub r#type: CrdConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_transition_time: String,
}

impl CrdCondition {
    pub fn new(
        kind: CrdConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            r#type: kind,
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: now_timestamp(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrdConditionType {
    NamesAccepted,
    Established,
    NonStructuralSchema,
    #[serde(rename = "KubernetesAPIApprovalPolicyConformant")]
    ApprovalPolicyConformant,
    Terminating,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

#[cfg(test)]
mod test {

    use serde_json::json;

    use super::*;

    fn sample_crd() -> CustomResourceDefinition {
        serde_json::from_value(json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": { "name": "widgets.example.com" },
            "spec": {
                "group": "example.com",
                "scope": "Namespaced",
                "names": { "plural": "widgets", "singular": "widget", "kind": "Widget" },
                "versions": [
                    { "name": "v1beta1", "served": true, "storage": false },
                    { "name": "v1", "served": true, "storage": true }
                ]
            }
        }))
        .expect("crd")
    }

    #[test]
    fn test_storage_version() {
        let crd = sample_crd();
        assert_eq!(crd.storage_version().unwrap().name, "v1");
        assert_eq!(crd.served_versions().count(), 2);
        assert_eq!(crd.qualified_name(), "widgets.example.com");
    }

    #[test]
    fn test_set_condition_idempotent() {
        let mut crd = sample_crd();
        let cond = CrdCondition::new(
            CrdConditionType::NamesAccepted,
            ConditionStatus::True,
            "NoConflicts",
            "no conflicts found",
        );
        assert!(crd.set_condition(cond.clone()));
        assert!(!crd.set_condition(cond));
        assert!(crd.names_accepted());
    }

    #[test]
    fn test_condition_transition_keeps_time_on_same_status() {
        let mut crd = sample_crd();
        let mut first = CrdCondition::new(
            CrdConditionType::Established,
            ConditionStatus::True,
            "InitialNamesAccepted",
            "install ok",
        );
        first.last_transition_time = "2024-01-01T00:00:00Z".to_owned();
        crd.set_condition(first);

        let second = CrdCondition::new(
            CrdConditionType::Established,
            ConditionStatus::True,
            "InstanceInstalled",
            "serving",
        );
        assert!(crd.set_condition(second));
        let cond = crd.condition(CrdConditionType::Established).unwrap();
        assert_eq!(cond.last_transition_time, "2024-01-01T00:00:00Z");
        assert_eq!(cond.reason, "InstanceInstalled");
    }

    #[test]
    fn test_names_canonicalize() {
        let mut names = CrdNames {
            plural: "widgets".to_owned(),
            kind: "Widget".to_owned(),
            ..Default::default()
        };
        names.canonicalize();
        assert_eq!(names.singular, "widget");
        assert_eq!(names.list_kind, "WidgetList");
    }

    #[test]
    fn test_condition_type_wire_name() {
        let ser = serde_json::to_string(&CrdConditionType::ApprovalPolicyConformant).unwrap();
        assert_eq!(ser, "\"KubernetesAPIApprovalPolicyConformant\"");
    }
}
