//! owns the NamesAccepted condition and status.acceptedNames

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use apix_types::names;
use apix_types::ApiError;
use apix_types::ConditionStatus;
use apix_types::CrdCondition;
use apix_types::CrdConditionType;
use apix_types::CrdNames;

use super::Reconciler;
use crate::crdstore::CrdStore;

pub struct NamingController {
    crds: Arc<CrdStore>,
}

impl NamingController {
    pub fn new(crds: Arc<CrdStore>) -> Arc<Self> {
        Arc::new(Self { crds })
    }

    /// names another definition in the same group already claims
    fn conflicts(&self, this_name: &str, group: &str, requested: &CrdNames) -> Vec<String> {
        let mut conflicts = vec![];
        for other in self.crds.cached_all() {
            if other.metadata.name == this_name || other.spec.group != group {
                continue;
            }
            let theirs = if other.status.accepted_names.plural.is_empty() {
                &other.spec.names
            } else {
                &other.status.accepted_names
            };
            if theirs.plural == requested.plural {
                conflicts.push(format!(
                    "plural \"{}\" is already claimed by {}",
                    requested.plural, other.metadata.name
                ));
            }
            if !requested.singular.is_empty() && theirs.singular == requested.singular {
                conflicts.push(format!(
                    "singular \"{}\" is already claimed by {}",
                    requested.singular, other.metadata.name
                ));
            }
            if theirs.kind == requested.kind {
                conflicts.push(format!(
                    "kind \"{}\" is already claimed by {}",
                    requested.kind, other.metadata.name
                ));
            }
            for short in &requested.short_names {
                if theirs.short_names.contains(short) {
                    conflicts.push(format!(
                        "short name \"{short}\" is already claimed by {}",
                        other.metadata.name
                    ));
                }
            }
        }
        conflicts
    }
}

#[async_trait]
impl Reconciler for NamingController {
    fn name(&self) -> &'static str {
        "naming"
    }

    async fn reconcile(&self, crd_name: &str) -> Result<(), ApiError> {
        let Some(cached) = self.crds.cached(crd_name) else {
            return Ok(());
        };
        let mut crd = (*cached).clone();

        let mut requested = crd.spec.names.clone();
        requested.canonicalize();

        let mut problems = vec![];
        if crd.metadata.name != crd.qualified_name() {
            problems.push(format!("name must be \"{}\"", crd.qualified_name()));
        }
        if !names::is_dns1123_label(&requested.plural) {
            problems.push(names::dns1123_label_error("plural", &requested.plural));
        }
        if !names::is_dns1123_label(&requested.singular) {
            problems.push(names::dns1123_label_error("singular", &requested.singular));
        }
        if !names::is_kind_name(&requested.kind) {
            problems.push(format!("kind \"{}\" must be CamelCase", requested.kind));
        }
        problems.extend(self.conflicts(&crd.metadata.name, &crd.spec.group, &requested));

        let mut changed = false;
        if problems.is_empty() {
            if crd.status.accepted_names != requested {
                crd.status.accepted_names = requested;
                changed = true;
            }
            changed |= crd.set_condition(CrdCondition::new(
                CrdConditionType::NamesAccepted,
                ConditionStatus::True,
                "NoConflicts",
                "no conflicts found",
            ));
        } else {
            // previous accepted names stay in effect on conflict
            changed |= crd.set_condition(CrdCondition::new(
                CrdConditionType::NamesAccepted,
                ConditionStatus::False,
                "NotAccepted",
                problems.join("; "),
            ));
        }

        if changed {
            debug!(crd = crd_name, accepted = problems.is_empty(), "naming status update");
            self.crds.update_status(crd).await?;
        }
        Ok(())
    }
}
