//! owns the NonStructuralSchema condition

use std::sync::Arc;

use async_trait::async_trait;

use apix_schema::Structural;
use apix_types::ApiError;
use apix_types::ConditionStatus;
use apix_types::CrdCondition;
use apix_types::CrdConditionType;

use super::Reconciler;
use crate::crdstore::CrdStore;

pub struct NonStructuralController {
    crds: Arc<CrdStore>,
}

impl NonStructuralController {
    pub fn new(crds: Arc<CrdStore>) -> Arc<Self> {
        Arc::new(Self { crds })
    }
}

#[async_trait]
impl Reconciler for NonStructuralController {
    fn name(&self) -> &'static str {
        "nonstructural-schema"
    }

    async fn reconcile(&self, crd_name: &str) -> Result<(), ApiError> {
        let Some(cached) = self.crds.cached(crd_name) else {
            return Ok(());
        };
        let mut crd = (*cached).clone();

        let mut violations = vec![];
        for version in &crd.spec.versions {
            let Some(document) = version
                .schema
                .as_ref()
                .and_then(|s| s.open_api_v3_schema.as_ref())
            else {
                continue;
            };
            match Structural::parse(document) {
                Ok(parsed) => {
                    for violation in parsed.violations {
                        violations.push(format!("version {}: {violation}", version.name));
                    }
                }
                Err(err) => violations.push(format!("version {}: {err}", version.name)),
            }
        }

        // condition True means "has violations"
        let condition = if violations.is_empty() {
            CrdCondition::new(
                CrdConditionType::NonStructuralSchema,
                ConditionStatus::False,
                "NoViolations",
                "all declared schemas are structural",
            )
        } else {
            CrdCondition::new(
                CrdConditionType::NonStructuralSchema,
                ConditionStatus::True,
                "Violations",
                violations.join("; "),
            )
        };

        if crd.set_condition(condition) {
            self.crds.update_status(crd).await?;
        }
        Ok(())
    }
}
