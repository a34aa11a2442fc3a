//! owns the KubernetesAPIApprovalPolicyConformant condition for
//! definitions claiming protected groups

use std::sync::Arc;

use async_trait::async_trait;

use apix_types::ApiError;
use apix_types::ConditionStatus;
use apix_types::CrdCondition;
use apix_types::CrdConditionType;
use apix_types::APPROVAL_ANNOTATION;

use super::Reconciler;
use crate::crdstore::CrdStore;

pub struct ApprovalController {
    crds: Arc<CrdStore>,
}

impl ApprovalController {
    pub fn new(crds: Arc<CrdStore>) -> Arc<Self> {
        Arc::new(Self { crds })
    }
}

pub fn is_protected_group(group: &str) -> bool {
    group == "k8s.io"
        || group.ends_with(".k8s.io")
        || group == "kubernetes.io"
        || group.ends_with(".kubernetes.io")
}

fn evaluate_annotation(value: Option<&str>) -> (ConditionStatus, &'static str, String) {
    match value {
        None => (
            ConditionStatus::False,
            "MissingAnnotation",
            format!("protected groups must have the {APPROVAL_ANNOTATION} annotation"),
        ),
        Some(value) if value.starts_with("https://") || value.starts_with("http://") => (
            ConditionStatus::True,
            "ApprovedAnnotation",
            format!("approved in {value}"),
        ),
        Some(value) if value.starts_with("unapproved") => (
            ConditionStatus::False,
            "UnapprovedAnnotation",
            format!("not approved: {value}"),
        ),
        Some(value) => (
            ConditionStatus::False,
            "InvalidAnnotation",
            format!(
                "the {APPROVAL_ANNOTATION} annotation must be a URL or start with \"unapproved\"; \
                 found \"{value}\""
            ),
        ),
    }
}

#[async_trait]
impl Reconciler for ApprovalController {
    fn name(&self) -> &'static str {
        "approval"
    }

    async fn reconcile(&self, crd_name: &str) -> Result<(), ApiError> {
        let Some(cached) = self.crds.cached(crd_name) else {
            return Ok(());
        };
        let mut crd = (*cached).clone();

        let changed = if is_protected_group(&crd.spec.group) {
            let annotation = crd
                .metadata
                .annotations
                .get(APPROVAL_ANNOTATION)
                .map(String::as_str);
            let (status, reason, message) = evaluate_annotation(annotation);
            crd.set_condition(CrdCondition::new(
                CrdConditionType::ApprovalPolicyConformant,
                status,
                reason,
                message,
            ))
        } else {
            crd.remove_condition(CrdConditionType::ApprovalPolicyConformant)
        };

        if changed {
            self.crds.update_status(crd).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_protected_groups() {
        assert!(is_protected_group("foo.k8s.io"));
        assert!(is_protected_group("kubernetes.io"));
        assert!(!is_protected_group("example.com"));
        assert!(!is_protected_group("k8s.iodine.example"));
    }

    #[test]
    fn test_annotation_evaluation() {
        let (status, reason, _) = evaluate_annotation(None);
        assert_eq!(status, ConditionStatus::False);
        assert_eq!(reason, "MissingAnnotation");

        let (status, reason, _) =
            evaluate_annotation(Some("https://github.com/kubernetes/enhancements/pull/1111"));
        assert_eq!(status, ConditionStatus::True);
        assert_eq!(reason, "ApprovedAnnotation");

        let (status, reason, _) = evaluate_annotation(Some("unapproved, experimental"));
        assert_eq!(status, ConditionStatus::False);
        assert_eq!(reason, "UnapprovedAnnotation");

        let (status, reason, _) = evaluate_annotation(Some("yes please"));
        assert_eq!(status, ConditionStatus::False);
        assert_eq!(reason, "InvalidAnnotation");
    }
}
