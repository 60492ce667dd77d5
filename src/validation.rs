//! Schema validation helpers.
//!
//! This module validates `serde_json::Value` configuration against a
//! [`Schema`] before any remote call is made, reporting every problem as a
//! [`Diagnostic`].
//!
//! # Example
//!
//! ```
//! use udb_provider::schema::{Attribute, Constraint, Schema};
//! use udb_provider::validation::validate;
//! use serde_json::json;
//!
//! let schema = Schema::v0()
//!     .with_attribute("name", Attribute::required_string())
//!     .with_attribute(
//!         "instance_storage",
//!         Attribute::required_int64().with_constraint(Constraint::int_range(20, 3000)),
//!     );
//!
//! let diagnostics = validate(&schema, &json!({"name": "orders", "instance_storage": 40}));
//! assert!(diagnostics.is_empty());
//!
//! // Out of range
//! let diagnostics = validate(&schema, &json!({"name": "orders", "instance_storage": 10}));
//! assert_eq!(diagnostics.len(), 1);
//! assert_eq!(diagnostics[0].attribute, Some("instance_storage".to_string()));
//! ```

use crate::schema::{
    Attribute, AttributeType, Block, Constraint, Diagnostic, NestedBlock, Schema,
};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

/// Compiled `Pattern` constraints, keyed by pattern text.
static PATTERNS: LazyLock<Mutex<HashMap<String, Regex>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn compiled(pattern: &str) -> Result<Regex, regex::Error> {
    let mut cache = PATTERNS.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(re) = cache.get(pattern) {
        return Ok(re.clone());
    }
    let re = Regex::new(pattern)?;
    cache.insert(pattern.to_string(), re.clone());
    Ok(re)
}

/// Validate a JSON value against a schema.
///
/// Returns a list of diagnostics for any validation errors found.
/// An empty list means the value is valid.
///
/// # Validation Rules
///
/// - Required attributes must be present and non-null
/// - Optional attributes may be absent or null
/// - Computed-only attributes are skipped (provider sets these)
/// - Attribute types must match the schema
/// - Attribute constraints must hold, element-wise for lists and sets
/// - Nested blocks are validated recursively with min/max item constraints
pub fn validate(schema: &Schema, value: &Value) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    validate_block(&schema.block, value, "", &mut diagnostics);
    diagnostics
}

/// Validate a JSON value against a schema, returning Ok if valid or Err with diagnostics.
pub fn validate_result(schema: &Schema, value: &Value) -> Result<(), Vec<Diagnostic>> {
    let diagnostics = validate(schema, value);
    if diagnostics.is_empty() {
        Ok(())
    } else {
        Err(diagnostics)
    }
}

/// Check if a JSON value is valid against a schema.
pub fn is_valid(schema: &Schema, value: &Value) -> bool {
    validate(schema, value).is_empty()
}

/// Check a single value against a constraint.
///
/// Returns a human-readable reason when the value is rejected. Values of the
/// wrong JSON type are left to the type check.
pub fn check_constraint(constraint: &Constraint, value: &Value) -> Result<(), String> {
    match constraint {
        Constraint::OneOf { choices } => match value.as_str() {
            Some(s) if !choices.iter().any(|c| c == s) => {
                Err(format!("expected one of {:?}, got {:?}", choices, s))
            },
            _ => Ok(()),
        },
        Constraint::IntRange { min, max } => match value.as_i64() {
            Some(n) if n < *min || n > *max => {
                Err(format!("expected a value in {}..={}, got {}", min, max, n))
            },
            _ => Ok(()),
        },
        Constraint::Pattern { pattern, hint } => {
            let Some(s) = value.as_str() else {
                return Ok(());
            };
            let re = compiled(pattern).map_err(|e| format!("invalid pattern: {}", e))?;
            if re.is_match(s) {
                Ok(())
            } else {
                Err(format!("{:?} is invalid, {}", s, hint))
            }
        },
    }
}

fn validate_block(block: &Block, value: &Value, path: &str, diagnostics: &mut Vec<Diagnostic>) {
    let obj = match value {
        Value::Object(map) => map,
        Value::Null => {
            // Null is valid for optional blocks, but we can't validate further
            return;
        },
        _ => {
            diagnostics.push(
                Diagnostic::error("Expected object")
                    .with_detail(format!("Got {}", value_type_name(value)))
                    .with_attribute_if_not_empty(path),
            );
            return;
        },
    };

    for (name, attr) in &block.attributes {
        let attr_path = join_path(path, name);
        validate_attribute(attr, obj.get(name), &attr_path, diagnostics);
    }

    for (name, nested_block) in &block.blocks {
        let block_path = join_path(path, name);
        validate_nested_block(nested_block, obj.get(name), &block_path, diagnostics);
    }
}

fn validate_attribute(
    attr: &Attribute,
    value: Option<&Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    // Skip computed-only attributes (provider sets these)
    if attr.flags.is_computed_only() {
        return;
    }

    match value {
        None | Some(Value::Null) => {
            if attr.flags.required {
                diagnostics.push(
                    Diagnostic::error(format!("Missing required attribute '{}'", path))
                        .with_detail("This attribute is required and must be provided")
                        .with_attribute(path),
                );
            }
        },
        Some(v) => {
            let before = diagnostics.len();
            validate_attribute_type(&attr.attr_type, v, path, diagnostics);
            if diagnostics.len() == before {
                if let Some(constraint) = &attr.constraint {
                    validate_constraint(constraint, v, path, diagnostics);
                }
            }
        },
    }
}

fn validate_constraint(
    constraint: &Constraint,
    value: &Value,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    if let Value::Array(items) = value {
        for (i, item) in items.iter().enumerate() {
            validate_constraint(constraint, item, &format!("{}.{}", path, i), diagnostics);
        }
        return;
    }
    if let Err(reason) = check_constraint(constraint, value) {
        diagnostics.push(
            Diagnostic::error(format!("Invalid value for '{}'", path))
                .with_detail(reason)
                .with_attribute(path),
        );
    }
}

fn validate_attribute_type(
    attr_type: &AttributeType,
    value: &Value,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match attr_type {
        AttributeType::String => {
            if !value.is_string() {
                diagnostics.push(type_error(path, "string", value));
            }
        },
        AttributeType::Int64 => {
            if !is_int64(value) {
                diagnostics.push(type_error(path, "int64", value));
            }
        },
        AttributeType::Bool => {
            if !value.is_boolean() {
                diagnostics.push(type_error(path, "bool", value));
            }
        },
        AttributeType::List(element_type) | AttributeType::Set(element_type) => {
            // Sets are represented as arrays in JSON
            if let Some(arr) = value.as_array() {
                for (i, elem) in arr.iter().enumerate() {
                    let elem_path = format!("{}.{}", path, i);
                    validate_attribute_type(element_type, elem, &elem_path, diagnostics);
                }
            } else {
                let expected = if matches!(attr_type, AttributeType::Set(_)) {
                    "set"
                } else {
                    "list"
                };
                diagnostics.push(type_error(path, expected, value));
            }
        },
        AttributeType::Object(attrs) => {
            if let Some(obj) = value.as_object() {
                validate_object_type(attrs, obj, path, diagnostics);
            } else {
                diagnostics.push(type_error(path, "object", value));
            }
        },
    }
}

fn validate_object_type(
    attrs: &HashMap<String, AttributeType>,
    obj: &serde_json::Map<String, Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    for (name, attr_type) in attrs {
        let attr_path = join_path(path, name);
        if let Some(value) = obj.get(name) {
            validate_attribute_type(attr_type, value, &attr_path, diagnostics);
        }
    }
}

fn validate_nested_block(
    nested: &NestedBlock,
    value: Option<&Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    // Lists and sets of blocks are both arrays in JSON
    match value {
        None | Some(Value::Null) => {
            if nested.min_items > 0 {
                diagnostics.push(
                    Diagnostic::error(format!(
                        "Block '{}' requires at least {} item(s)",
                        path, nested.min_items
                    ))
                    .with_attribute(path),
                );
            }
        },
        Some(Value::Array(arr)) => {
            let len = arr.len() as u32;

            if len < nested.min_items {
                diagnostics.push(
                    Diagnostic::error(format!(
                        "Block '{}' requires at least {} item(s), got {}",
                        path, nested.min_items, len
                    ))
                    .with_attribute(path),
                );
            }

            // max_items of 0 means unlimited
            if nested.max_items > 0 && len > nested.max_items {
                diagnostics.push(
                    Diagnostic::error(format!(
                        "Block '{}' allows at most {} item(s), got {}",
                        path, nested.max_items, len
                    ))
                    .with_attribute(path),
                );
            }

            for (i, item) in arr.iter().enumerate() {
                let item_path = format!("{}.{}", path, i);
                validate_block(&nested.block, item, &item_path, diagnostics);
            }
        },
        Some(v) => {
            diagnostics.push(
                Diagnostic::error(format!("Expected list for block '{}'", path))
                    .with_detail(format!("Got {}", value_type_name(v)))
                    .with_attribute(path),
            );
        },
    }
}

// Helper functions

fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", base, name)
    }
}

fn is_int64(value: &Value) -> bool {
    value.is_i64() || value.is_u64() && value.as_u64().is_some_and(|n| n <= i64::MAX as u64)
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_error(path: &str, expected: &str, got: &Value) -> Diagnostic {
    Diagnostic::error(format!("Invalid type for '{}'", path))
        .with_detail(format!(
            "Expected {}, got {}",
            expected,
            value_type_name(got)
        ))
        .with_attribute(path)
}

trait DiagnosticExt {
    fn with_attribute_if_not_empty(self, path: &str) -> Self;
}

impl DiagnosticExt for Diagnostic {
    fn with_attribute_if_not_empty(self, path: &str) -> Self {
        if path.is_empty() {
            self
        } else {
            self.with_attribute(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Attribute, AttributeFlags, Block, NestedBlock};
    use serde_json::json;

    fn blacklist_schema() -> Schema {
        Schema::v0().with_attribute(
            "backup_black_list",
            Attribute::new(
                AttributeType::set(AttributeType::String),
                AttributeFlags::optional_computed(),
            )
            .with_constraint(Constraint::pattern(r"^[^.;\s]+\.[^.;\s]+$", "expected db.table")),
        )
    }

    #[test]
    fn test_required_attribute_missing() {
        let schema = Schema::v0().with_attribute("name", Attribute::required_string());

        let diagnostics = validate(&schema, &json!({}));
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].summary.contains("Missing required attribute"));
        assert_eq!(diagnostics[0].attribute, Some("name".to_string()));

        let diagnostics = validate(&schema, &json!({"name": null}));
        assert_eq!(diagnostics.len(), 1);
    }

    #[test]
    fn test_computed_attributes_skipped() {
        let schema = Schema::v0()
            .with_attribute("name", Attribute::required_string())
            .with_attribute("status", Attribute::computed_string());

        assert!(validate(&schema, &json!({"name": "x", "status": 42})).is_empty());
    }

    #[test]
    fn test_type_mismatches() {
        let schema = Schema::v0()
            .with_attribute("name", Attribute::required_string())
            .with_attribute("port", Attribute::optional_int64())
            .with_attribute("region_flag", Attribute::optional_bool());

        let diagnostics = validate(
            &schema,
            &json!({"name": 1, "port": "3306", "region_flag": "yes"}),
        );
        assert_eq!(diagnostics.len(), 3);
        assert!(diagnostics
            .iter()
            .all(|d| d.summary.starts_with("Invalid type")));
    }

    #[test]
    fn test_one_of_constraint() {
        let schema = Schema::v0().with_attribute(
            "engine",
            Attribute::required_string()
                .with_constraint(Constraint::one_of(&["mysql", "percona", "postgresql"])),
        );

        assert!(is_valid(&schema, &json!({"engine": "percona"})));
        let diagnostics = validate(&schema, &json!({"engine": "oracle"}));
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0]
            .detail
            .as_deref()
            .unwrap()
            .contains("oracle"));
    }

    #[test]
    fn test_constraint_skipped_on_type_error() {
        let schema = Schema::v0().with_attribute(
            "port",
            Attribute::optional_int64().with_constraint(Constraint::int_range(3306, 65535)),
        );
        let diagnostics = validate(&schema, &json!({"port": "80"}));
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].summary.starts_with("Invalid type"));

        let diagnostics = validate(&schema, &json!({"port": 80}));
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].summary.starts_with("Invalid value"));
    }

    #[test]
    fn test_pattern_constraint_applies_to_set_elements() {
        let schema = blacklist_schema();
        assert!(is_valid(
            &schema,
            &json!({"backup_black_list": ["test.%", "app.logs"]})
        ));

        let diagnostics = validate(
            &schema,
            &json!({"backup_black_list": ["test.%", "no-dot", "a;b.c"]}),
        );
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(
            diagnostics[0].attribute,
            Some("backup_black_list.1".to_string())
        );
        assert_eq!(
            diagnostics[1].attribute,
            Some("backup_black_list.2".to_string())
        );
    }

    #[test]
    fn test_pattern_compiled_once() {
        let pattern = r"^[a-z]+\.[a-z%]+$";
        let constraint = Constraint::pattern(pattern, "expected db.table");
        for value in ["app.logs", "test.%", "orders.items"] {
            assert!(check_constraint(&constraint, &json!(value)).is_ok());
        }
        assert!(check_constraint(&constraint, &json!("nodot")).is_err());

        let first = compiled(pattern).unwrap();
        let again = compiled(pattern).unwrap();
        assert_eq!(first.as_str(), again.as_str());
        assert!(PATTERNS.lock().unwrap().contains_key(pattern));
    }

    #[test]
    fn test_check_constraint_reports_bad_pattern() {
        let err = check_constraint(&Constraint::pattern("(", "anything"), &json!("x")).unwrap_err();
        assert!(err.contains("invalid pattern"));
    }

    #[test]
    fn test_nested_set_block() {
        let schema = Schema::v0().with_block(
            "parameter_input",
            NestedBlock::set(
                Block::new()
                    .with_attribute("key", Attribute::required_string())
                    .with_attribute("value", Attribute::required_string()),
            )
            .with_max_items(2),
        );

        assert!(is_valid(
            &schema,
            &json!({"parameter_input": [{"key": "max_connections", "value": "2000"}]})
        ));

        let diagnostics = validate(
            &schema,
            &json!({"parameter_input": [{"key": "a"}, {"key": "b", "value": "1"}, {"key": "c", "value": "2"}]}),
        );
        assert_eq!(diagnostics.len(), 2);
        assert!(diagnostics
            .iter()
            .any(|d| d.attribute == Some("parameter_input.0.value".to_string())));
        assert!(diagnostics
            .iter()
            .any(|d| d.summary.contains("at most 2")));

        let diagnostics = validate(&schema, &json!({"parameter_input": {"key": "a"}}));
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].summary.contains("Expected list"));
    }

    #[test]
    fn test_nested_block_min_items() {
        let schema = Schema::v0().with_block(
            "parameter_input",
            NestedBlock::list(Block::new().with_attribute("key", Attribute::required_string()))
                .with_min_items(1),
        );

        let diagnostics = validate(&schema, &json!({}));
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].summary.contains("at least 1"));

        let diagnostics = validate(&schema, &json!({"parameter_input": []}));
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].summary.contains("got 0"));
    }

    #[test]
    fn test_validate_result() {
        let schema = Schema::v0().with_attribute("name", Attribute::required_string());
        assert!(validate_result(&schema, &json!({"name": "x"})).is_ok());
        assert_eq!(validate_result(&schema, &json!({})).unwrap_err().len(), 1);
        assert_eq!(validate(&schema, &json!("scalar")).len(), 1);
    }
}
