//!
//! # Expression rule integration
//!
//! Compiles the `x-kubernetes-validations` rules of a structural schema
//! once per definition version and evaluates them per request with a cost
//! budget. The expression language itself is supplied by the interpreter
//! library; this crate owns variable binding, anchoring, and budgeting.
//!
mod cost;

use std::collections::HashMap;

use cel_interpreter::Context;
use cel_interpreter::Program;
use cel_interpreter::Value as CelValue;
use serde_json::Value;
use tracing::trace;

use apix_schema::FieldPath;
use apix_schema::ListType;
use apix_schema::Structural;
use apix_schema::ValidationRule;
use apix_types::Cause;

pub use cost::expression_ops;
pub use cost::observed_cardinality;
pub use cost::CostEstimator;
pub use cost::DEFAULT_REQUEST_SIZE_CEILING;
pub use cost::PER_RULE_BUDGET;

/// a rule that failed to compile; reported on the definition's conditions
/// without tearing down serving
#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub location: String,
    pub rule: String,
    pub message: String,
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let location = if self.location.is_empty() {
            "<root>"
        } else {
            &self.location
        };
        write!(f, "{}: rule \"{}\": {}", location, self.rule, self.message)
    }
}

struct CompiledRule {
    source: ValidationRule,
    program: Program,
    message_program: Option<Program>,
    uses_old_self: bool,
    ops: u64,
}

/// compiled programs keyed by their schema node
#[derive(Default)]
pub struct RuleSet {
    by_node: HashMap<String, Vec<CompiledRule>>,
    count: usize,
}

impl RuleSet {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn len(&self) -> usize {
        self.count
    }
}

pub struct Compilation {
    pub rules: RuleSet,
    pub errors: Vec<CompileError>,
}

/// compile every rule reachable in the schema; rules that do not compile
/// or price out of the budget land in `errors`, the rest are kept
pub fn compile(schema: &Structural, estimator: &CostEstimator) -> Compilation {
    let mut rules = RuleSet::default();
    let mut errors = vec![];
    compile_node(schema, String::new(), estimator, &mut rules, &mut errors);
    Compilation { rules, errors }
}

fn compile_node(
    schema: &Structural,
    key: String,
    estimator: &CostEstimator,
    rules: &mut RuleSet,
    errors: &mut Vec<CompileError>,
) {
    for rule in &schema.rules {
        match compile_rule(schema, rule, &key, estimator) {
            Ok(compiled) => {
                rules.count += 1;
                rules.by_node.entry(key.clone()).or_default().push(compiled);
            }
            Err(err) => errors.push(err),
        }
    }

    for (name, child) in &schema.properties {
        compile_node(child, node_key(&key, name), estimator, rules, errors);
    }
    if let Some(values) = schema.map_values() {
        compile_node(values, format!("{key}.{{*}}"), estimator, rules, errors);
    }
    if let Some(items) = &schema.items {
        compile_node(items, format!("{key}[*]"), estimator, rules, errors);
    }
}

fn node_key(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_owned()
    } else {
        format!("{parent}.{name}")
    }
}

fn compile_rule(
    schema: &Structural,
    rule: &ValidationRule,
    key: &str,
    estimator: &CostEstimator,
) -> Result<CompiledRule, CompileError> {
    let fail = |message: String| CompileError {
        location: key.to_owned(),
        rule: rule.rule.clone(),
        message,
    };

    if rule.rule.trim().is_empty() {
        return Err(fail("rule must not be empty".to_owned()));
    }

    let program =
        Program::compile(&rule.rule).map_err(|err| fail(format!("compile error: {err}")))?;

    let message_program = match &rule.message_expression {
        Some(expr) => Some(
            Program::compile(expr)
                .map_err(|err| fail(format!("messageExpression compile error: {err}")))?,
        ),
        None => None,
    };

    let estimated = estimator.estimate(schema, &rule.rule);
    if estimated > PER_RULE_BUDGET {
        return Err(fail(format!(
            "estimated cost {estimated} exceeds budget {PER_RULE_BUDGET}; \
             bound the data with maxLength/maxItems/maxProperties"
        )));
    }

    Ok(CompiledRule {
        // the interpreter has no static environment, so oldSelf usage is
        // detected textually
        uses_old_self: rule.rule.contains("oldSelf")
            || rule
                .message_expression
                .as_deref()
                .map(|m| m.contains("oldSelf"))
                .unwrap_or(false),
        ops: expression_ops(&rule.rule),
        source: rule.clone(),
        program,
        message_program,
    })
}

/// a rule evaluation failure, anchored at the rule's node plus its
/// declared fieldPath
#[derive(Debug, Clone, PartialEq)]
pub struct RuleFailure {
    pub path: FieldPath,
    pub reason: String,
    pub detail: String,
}

impl RuleFailure {
    pub fn to_cause(&self) -> Cause {
        Cause::new(
            self.reason.clone(),
            self.detail.clone(),
            self.path.to_string(),
        )
    }
}

/// evaluate all rules against an instance; `old` is the pre-image on
/// updates. Transition rules (those referencing `oldSelf`) are evaluated
/// only at positions where the pre-image is correlatable.
pub fn evaluate(
    rules: &RuleSet,
    schema: &Structural,
    instance: &Value,
    old: Option<&Value>,
) -> Vec<RuleFailure> {
    let mut failures = vec![];
    if rules.is_empty() {
        return failures;
    }
    evaluate_node(
        rules,
        schema,
        "",
        instance,
        old,
        &FieldPath::root(),
        &mut failures,
    );
    failures
}

#[allow(clippy::too_many_arguments)]
fn evaluate_node(
    rules: &RuleSet,
    schema: &Structural,
    key: &str,
    value: &Value,
    old: Option<&Value>,
    path: &FieldPath,
    failures: &mut Vec<RuleFailure>,
) {
    if let Some(compiled) = rules.by_node.get(key) {
        for rule in compiled {
            evaluate_rule(rule, value, old, path, failures);
        }
    }

    match value {
        Value::Object(fields) => {
            for (name, child_value) in fields {
                let old_child = old.and_then(|o| o.get(name));
                let (child_schema, child_key) = match schema.property(name) {
                    Some(child) => (Some(child), node_key(key, name)),
                    None => match schema.map_values() {
                        Some(values) => (Some(values), format!("{key}.{{*}}")),
                        None => (None, String::new()),
                    },
                };
                if let Some(child_schema) = child_schema {
                    evaluate_node(
                        rules,
                        child_schema,
                        &child_key,
                        child_value,
                        old_child,
                        &path.child(name),
                        failures,
                    );
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = &schema.items {
                let child_key = format!("{key}[*]");
                for (idx, item) in items.iter().enumerate() {
                    let old_item = correlate_item(schema, item, idx, old);
                    evaluate_node(
                        rules,
                        item_schema,
                        &child_key,
                        item,
                        old_item,
                        &path.index(idx),
                        failures,
                    );
                }
            }
        }
        _ => {}
    }
}

/// find the pre-image of a list item: keyed lookup for map lists, index
/// for everything else
fn correlate_item<'a>(
    schema: &Structural,
    item: &Value,
    idx: usize,
    old: Option<&'a Value>,
) -> Option<&'a Value> {
    let old_items = old.and_then(Value::as_array)?;
    if schema.list_type() == ListType::Map && !schema.extensions.list_map_keys.is_empty() {
        let keys = &schema.extensions.list_map_keys;
        let wanted: Vec<Option<&Value>> = keys.iter().map(|k| item.get(k)).collect();
        old_items
            .iter()
            .find(|candidate| keys.iter().map(|k| candidate.get(k)).collect::<Vec<_>>() == wanted)
    } else {
        old_items.get(idx)
    }
}

fn evaluate_rule(
    rule: &CompiledRule,
    value: &Value,
    old: Option<&Value>,
    path: &FieldPath,
    failures: &mut Vec<RuleFailure>,
) {
    if rule.uses_old_self && old.is_none() {
        // transition rule without a correlatable pre-image
        return;
    }

    let anchor = if rule.source.field_path.is_empty() {
        path.clone()
    } else {
        path.join(&rule.source.field_path)
    };

    let runtime_cost = rule.ops.saturating_mul(observed_cardinality(value));
    if runtime_cost > PER_RULE_BUDGET {
        failures.push(RuleFailure {
            path: anchor,
            reason: "RuleCostExceeded".to_owned(),
            detail: format!(
                "rule evaluation cost {runtime_cost} exceeds budget {PER_RULE_BUDGET}"
            ),
        });
        return;
    }

    let mut context = Context::default();
    if let Err(err) = context.add_variable("self", value.clone()) {
        failures.push(RuleFailure {
            path: anchor,
            reason: "InternalError".to_owned(),
            detail: format!("binding self: {err}"),
        });
        return;
    }
    if let Some(old_value) = old {
        if let Err(err) = context.add_variable("oldSelf", old_value.clone()) {
            failures.push(RuleFailure {
                path: anchor,
                reason: "InternalError".to_owned(),
                detail: format!("binding oldSelf: {err}"),
            });
            return;
        }
    }

    match rule.program.execute(&context) {
        Ok(CelValue::Bool(true)) => {}
        Ok(CelValue::Bool(false)) => {
            trace!(rule = %rule.source.rule, path = %anchor, "rule failed");
            failures.push(RuleFailure {
                path: anchor,
                reason: rule
                    .source
                    .reason
                    .clone()
                    .unwrap_or_else(|| "FieldValueInvalid".to_owned()),
                detail: failure_message(rule, &context),
            });
        }
        Ok(_) => failures.push(RuleFailure {
            path: anchor,
            reason: "FieldValueInvalid".to_owned(),
            detail: format!("rule \"{}\" must evaluate to a boolean", rule.source.rule),
        }),
        Err(err) => failures.push(RuleFailure {
            path: anchor,
            reason: "FieldValueInvalid".to_owned(),
            detail: format!("rule \"{}\" evaluation error: {err}", rule.source.rule),
        }),
    }
}

/// static message, or the message expression when it evaluates to a non
/// empty string, or the rule text as a last resort
fn failure_message(rule: &CompiledRule, context: &Context) -> String {
    if let Some(program) = &rule.message_program {
        if let Ok(CelValue::String(text)) = program.execute(context) {
            if !text.is_empty() {
                return text.as_ref().clone();
            }
        }
    }
    if !rule.source.message.is_empty() {
        return rule.source.message.clone();
    }
    format!("failed rule: {}", rule.source.rule)
}
