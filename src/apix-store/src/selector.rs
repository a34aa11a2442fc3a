//! label and field selector parsing and matching

use serde_json::Value;

use apix_types::ApiError;
use apix_types::Unstructured;

#[derive(Debug, Clone, PartialEq)]
enum Requirement {
    Eq(String, String),
    NotEq(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    NotExists(String),
}

/// equality and set based label selector terms, comma separated
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn parse(selector: &str) -> Result<Self, ApiError> {
        let mut requirements = vec![];
        for term in split_terms(selector) {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            requirements.push(parse_term(term)?);
        }
        Ok(Self { requirements })
    }

    pub fn matches(&self, labels: Option<&serde_json::Map<String, Value>>) -> bool {
        let get = |key: &str| -> Option<&str> {
            labels.and_then(|map| map.get(key)).and_then(Value::as_str)
        };
        self.requirements.iter().all(|req| match req {
            Requirement::Eq(key, value) => get(key) == Some(value),
            Requirement::NotEq(key, value) => get(key) != Some(value),
            Requirement::In(key, values) => {
                get(key).map(|v| values.iter().any(|c| c == v)).unwrap_or(false)
            }
            Requirement::NotIn(key, values) => {
                get(key).map(|v| !values.iter().any(|c| c == v)).unwrap_or(true)
            }
            Requirement::Exists(key) => get(key).is_some(),
            Requirement::NotExists(key) => get(key).is_none(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}

/// split on commas that are not inside an `in (...)` value list
fn split_terms(selector: &str) -> Vec<&str> {
    let mut terms = vec![];
    let mut depth = 0usize;
    let mut start = 0usize;
    for (idx, c) in selector.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                terms.push(&selector[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    terms.push(&selector[start..]);
    terms
}

fn parse_term(term: &str) -> Result<Requirement, ApiError> {
    let bad = || ApiError::bad_request(format!("invalid label selector term \"{term}\""));

    if let Some(rest) = term.strip_prefix('!') {
        return Ok(Requirement::NotExists(rest.trim().to_owned()));
    }
    for (separator, set) in [(" notin ", false), (" in ", true)] {
        if let Some((key, values)) = term.split_once(separator) {
            let values = values.trim();
            let inner = values
                .strip_prefix('(')
                .and_then(|v| v.strip_suffix(')'))
                .ok_or_else(bad)?;
            let values: Vec<String> =
                inner.split(',').map(|v| v.trim().to_owned()).collect();
            let key = key.trim().to_owned();
            return Ok(if set {
                Requirement::In(key, values)
            } else {
                Requirement::NotIn(key, values)
            });
        }
    }
    if let Some((key, value)) = term.split_once("!=") {
        return Ok(Requirement::NotEq(key.trim().to_owned(), value.trim().to_owned()));
    }
    if let Some((key, value)) = term.split_once("==") {
        return Ok(Requirement::Eq(key.trim().to_owned(), value.trim().to_owned()));
    }
    if let Some((key, value)) = term.split_once('=') {
        return Ok(Requirement::Eq(key.trim().to_owned(), value.trim().to_owned()));
    }
    Ok(Requirement::Exists(term.to_owned()))
}

/// field selectors are equality terms over `metadata.name`,
/// `metadata.namespace` and whatever paths the definition declares
/// selectable
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldSelector {
    terms: Vec<(String, String, bool)>,
}

impl FieldSelector {
    pub fn parse(selector: &str) -> Result<Self, ApiError> {
        let mut terms = vec![];
        for term in selector.split(',') {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            if let Some((field, value)) = term.split_once("!=") {
                terms.push((field.trim().to_owned(), value.trim().to_owned(), false));
            } else if let Some((field, value)) = term.split_once("==") {
                terms.push((field.trim().to_owned(), value.trim().to_owned(), true));
            } else if let Some((field, value)) = term.split_once('=') {
                terms.push((field.trim().to_owned(), value.trim().to_owned(), true));
            } else {
                return Err(ApiError::bad_request(format!(
                    "invalid field selector term \"{term}\""
                )));
            }
        }
        Ok(Self { terms })
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// `selectable` lists the dotted paths the definition allows beyond
    /// the metadata pair
    pub fn matches(&self, object: &Unstructured, selectable: &[String]) -> Result<bool, ApiError> {
        for (field, expected, want_equal) in &self.terms {
            let allowed = field == "metadata.name"
                || field == "metadata.namespace"
                || selectable.iter().any(|s| s == field);
            if !allowed {
                return Err(ApiError::bad_request(format!(
                    "field selector \"{field}\" is not a selectable field"
                )));
            }
            let pointer = format!("/{}", field.replace('.', "/"));
            let actual = object
                .value()
                .pointer(&pointer)
                .map(render_scalar)
                .unwrap_or_default();
            if (actual == *expected) != *want_equal {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod test {

    use serde_json::json;

    use super::*;

    fn labels(doc: serde_json::Value) -> serde_json::Map<String, Value> {
        doc.as_object().unwrap().clone()
    }

    #[test]
    fn test_equality_terms() {
        let selector = LabelSelector::parse("app=web,tier!=cache").expect("parse");
        assert!(selector.matches(Some(&labels(json!({ "app": "web", "tier": "frontend" })))));
        assert!(!selector.matches(Some(&labels(json!({ "app": "web", "tier": "cache" })))));
        assert!(!selector.matches(None));
    }

    #[test]
    fn test_set_terms() {
        let selector = LabelSelector::parse("env in (prod, staging),!legacy").expect("parse");
        assert!(selector.matches(Some(&labels(json!({ "env": "prod" })))));
        assert!(!selector.matches(Some(&labels(json!({ "env": "dev" })))));
        assert!(!selector.matches(Some(&labels(json!({ "env": "prod", "legacy": "1" })))));
    }

    #[test]
    fn test_exists_term() {
        let selector = LabelSelector::parse("app").expect("parse");
        assert!(selector.matches(Some(&labels(json!({ "app": "x" })))));
        assert!(!selector.matches(None));
    }

    #[test]
    fn test_field_selector() {
        let selector = FieldSelector::parse("metadata.name=a,spec.phase!=Done").expect("parse");
        let object = Unstructured::new(json!({
            "metadata": { "name": "a" },
            "spec": { "phase": "Running" }
        }));
        let selectable = vec!["spec.phase".to_owned()];
        assert!(selector.matches(&object, &selectable).expect("match"));

        let undeclared = FieldSelector::parse("spec.other=1").expect("parse");
        assert!(undeclared.matches(&object, &selectable).is_err());
    }
}
