//! worst case cost estimation for expression rules
//!
//! The estimate is the product of the expression's operation count proxy
//! and the worst case cardinality of the data the rule can touch, derived
//! from schema bounds. Missing bounds fall back to the request size
//! ceiling, so rules over unbounded collections price out of the budget.

use serde_json::Value;

use apix_schema::SchemaType;
use apix_schema::Structural;

/// abstract cost units a single rule evaluation may spend
pub const PER_RULE_BUDGET: u64 = 1_000_000;

/// matches the default request body ceiling of the server configuration
pub const DEFAULT_REQUEST_SIZE_CEILING: u64 = 3 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct CostEstimator {
    pub request_size_ceiling: u64,
}

impl Default for CostEstimator {
    fn default() -> Self {
        Self {
            request_size_ceiling: DEFAULT_REQUEST_SIZE_CEILING,
        }
    }
}

impl CostEstimator {
    pub fn new(request_size_ceiling: u64) -> Self {
        Self {
            request_size_ceiling,
        }
    }

    /// worst case number of addressable elements under a node
    pub fn worst_case_cardinality(&self, schema: &Structural) -> u64 {
        if schema.extensions.int_or_string {
            return 1;
        }
        match schema.schema_type {
            Some(SchemaType::String) => schema
                .validation
                .max_length
                .map(|l| l + 1)
                .unwrap_or(self.request_size_ceiling),
            Some(SchemaType::Integer)
            | Some(SchemaType::Number)
            | Some(SchemaType::Boolean) => 1,
            Some(SchemaType::Array) => {
                let item_size = schema
                    .items
                    .as_deref()
                    .map(|s| self.min_serialized_size(s))
                    .unwrap_or(1);
                let length = schema
                    .validation
                    .max_items
                    .unwrap_or_else(|| self.request_size_ceiling / item_size.max(1));
                let item_cardinality = schema
                    .items
                    .as_deref()
                    .map(|s| self.worst_case_cardinality(s))
                    .unwrap_or(1);
                length.saturating_mul(item_cardinality)
            }
            Some(SchemaType::Object) => {
                if let Some(values) = schema.map_values() {
                    let entry_size = self.min_serialized_size(values).saturating_add(2);
                    let entries = schema
                        .validation
                        .max_properties
                        .unwrap_or_else(|| self.request_size_ceiling / entry_size.max(1));
                    entries.saturating_mul(self.worst_case_cardinality(values))
                } else if schema.properties.is_empty() {
                    // untyped object; priced by the ceiling
                    self.request_size_ceiling
                } else {
                    schema
                        .properties
                        .values()
                        .fold(1u64, |acc, child| {
                            acc.saturating_add(self.worst_case_cardinality(child))
                        })
                }
            }
            None => self.request_size_ceiling,
        }
    }

    /// smallest serialized footprint of a value of this schema, used as
    /// the denominator when a collection declares no length bound
    fn min_serialized_size(&self, schema: &Structural) -> u64 {
        match schema.schema_type {
            Some(SchemaType::String) => schema.validation.min_length.unwrap_or(0) + 2,
            Some(SchemaType::Integer) | Some(SchemaType::Number) => 1,
            Some(SchemaType::Boolean) => 4,
            Some(SchemaType::Array) => 2,
            Some(SchemaType::Object) => {
                2 + schema
                    .validation
                    .required
                    .iter()
                    .filter_map(|name| schema.property(name))
                    .map(|child| self.min_serialized_size(child))
                    .sum::<u64>()
            }
            None => 1,
        }
    }

    pub fn estimate(&self, schema: &Structural, expression: &str) -> u64 {
        expression_ops(expression).saturating_mul(self.worst_case_cardinality(schema))
    }
}

/// proxy for the compiled expression's operation count
pub fn expression_ops(expression: &str) -> u64 {
    expression.chars().filter(|c| !c.is_whitespace()).count().max(1) as u64
}

/// actual cardinality of an instance value, charged at evaluation time
pub fn observed_cardinality(value: &Value) -> u64 {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => 1,
        Value::String(text) => (text.len() as u64).max(1),
        Value::Array(items) => items
            .iter()
            .fold(1u64, |acc, item| acc.saturating_add(observed_cardinality(item))),
        Value::Object(fields) => fields
            .values()
            .fold(1u64, |acc, item| acc.saturating_add(observed_cardinality(item))),
    }
}
