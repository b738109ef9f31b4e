//! JSON-Schema subset → Python type mapping.
//!
//! Record schemas become `@dataclass` definitions named after their
//! property path; everything else maps structurally (`list[...]`,
//! `dict[str, ...]`, unions, `Literal[...]`). Constructs outside the
//! subset fall back to `Any` rather than failing generation.

use std::collections::HashSet;

use serde_json::{Map, Value};

use super::ident::{py_class_name, py_ident};

/// How a field's value is rebuilt from (or flattened to) plain JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldShape {
    /// Plain value, passed through.
    Raw,
    /// A nested record of the named class.
    Record(String),
    /// A list of nested records of the named class.
    RecordList(String),
}

#[derive(Debug, Clone)]
pub struct PyField {
    pub py_name: String,
    pub json_name: String,
    /// Full annotation, including `| None` for optional fields.
    pub annotation: String,
    pub required: bool,
    /// Rendered default literal for optional fields.
    pub default_literal: Option<String>,
    /// Rendered string literals for enum membership checks.
    pub enum_literals: Option<Vec<String>>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub shape: FieldShape,
}

#[derive(Debug, Clone)]
pub struct PyClass {
    pub name: String,
    pub fields: Vec<PyField>,
}

/// Collects dataclass definitions while mapping schemas to type
/// expressions. Nested classes are pushed before their parent, so
/// rendering the list in order keeps every reference defined.
pub struct TypeMapper {
    pub classes: Vec<PyClass>,
    used_names: HashSet<String>,
    pub uses_literal: bool,
    pub uses_any: bool,
}

impl TypeMapper {
    pub fn new() -> Self {
        Self {
            classes: Vec::new(),
            used_names: HashSet::new(),
            uses_literal: false,
            uses_any: false,
        }
    }

    /// Build a dataclass for a record schema and return its name.
    pub fn record_class(&mut self, parts: &[&str], schema: &Map<String, Value>) -> String {
        let name = self.claim_name(py_class_name(parts));

        let required: HashSet<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|fields| fields.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let empty = Map::new();
        let props = schema
            .get("properties")
            .and_then(Value::as_object)
            .unwrap_or(&empty);

        // Required fields first, each group sorted, so generated
        // dataclass field order is deterministic and legal.
        let mut names: Vec<&String> = props.keys().collect();
        names.sort();
        let ordered: Vec<&String> = names
            .iter()
            .filter(|n| required.contains(n.as_str()))
            .chain(names.iter().filter(|n| !required.contains(n.as_str())))
            .copied()
            .collect();

        let mut fields = Vec::with_capacity(ordered.len());
        for prop in ordered {
            let prop_schema = &props[prop];
            let is_required = required.contains(prop.as_str());

            let mut child_parts: Vec<&str> = parts.to_vec();
            child_parts.push(prop);
            let (base_annotation, shape) = self.type_expr(prop_schema, &child_parts);

            let default_literal = if is_required {
                None
            } else {
                Some(
                    prop_schema
                        .get("default")
                        .and_then(py_literal)
                        .unwrap_or_else(|| "None".to_string()),
                )
            };
            let annotation = if is_required {
                base_annotation
            } else {
                format!("{base_annotation} | None")
            };

            let enum_literals = prop_schema
                .get("enum")
                .and_then(Value::as_array)
                .map(|values| values.iter().filter_map(py_literal).collect::<Vec<_>>())
                .filter(|literals: &Vec<String>| !literals.is_empty());

            fields.push(PyField {
                py_name: py_ident(prop),
                json_name: prop.clone(),
                annotation,
                required: is_required,
                default_literal,
                enum_literals,
                minimum: prop_schema.get("minimum").and_then(Value::as_f64),
                maximum: prop_schema.get("maximum").and_then(Value::as_f64),
                shape,
            });
        }

        self.classes.push(PyClass {
            name: name.clone(),
            fields,
        });
        name
    }

    /// Type expression for one schema node.
    fn type_expr(&mut self, schema: &Value, parts: &[&str]) -> (String, FieldShape) {
        let Some(obj) = schema.as_object() else {
            self.uses_any = true;
            return ("Any".to_string(), FieldShape::Raw);
        };

        if let Some(values) = obj.get("enum").and_then(Value::as_array) {
            let literals: Vec<String> = values.iter().filter_map(py_literal).collect();
            if literals.len() == values.len() && !literals.is_empty() {
                self.uses_literal = true;
                return (format!("Literal[{}]", literals.join(", ")), FieldShape::Raw);
            }
            self.uses_any = true;
            return ("Any".to_string(), FieldShape::Raw);
        }

        if let Some(value) = obj.get("const") {
            if let Some(literal) = py_literal(value) {
                self.uses_literal = true;
                return (format!("Literal[{literal}]"), FieldShape::Raw);
            }
        }

        for key in ["oneOf", "anyOf"] {
            if let Some(branches) = obj.get(key).and_then(Value::as_array) {
                let rendered: Vec<String> = branches
                    .iter()
                    .map(|branch| self.type_expr(branch, parts).0)
                    .collect();
                if rendered.is_empty() {
                    self.uses_any = true;
                    return ("Any".to_string(), FieldShape::Raw);
                }
                return (rendered.join(" | "), FieldShape::Raw);
            }
        }

        match obj.get("type").and_then(Value::as_str) {
            Some("string") => ("str".to_string(), FieldShape::Raw),
            Some("integer") => ("int".to_string(), FieldShape::Raw),
            Some("number") => ("float".to_string(), FieldShape::Raw),
            Some("boolean") => ("bool".to_string(), FieldShape::Raw),
            Some("null") => ("None".to_string(), FieldShape::Raw),
            Some("array") => {
                let item_schema = obj.get("items").cloned().unwrap_or(Value::Null);
                if let Some(item_obj) = item_schema.as_object().filter(|_| is_record(&item_schema))
                {
                    let class_name = self.record_class(parts, item_obj);
                    (
                        format!("list[{class_name}]"),
                        FieldShape::RecordList(class_name),
                    )
                } else {
                    let (inner, _) = self.type_expr(&item_schema, parts);
                    (format!("list[{inner}]"), FieldShape::Raw)
                }
            }
            Some("object") => {
                if is_record(schema) {
                    let class_name = self.record_class(parts, obj);
                    (class_name.clone(), FieldShape::Record(class_name))
                } else if let Some(additional) = obj.get("additionalProperties") {
                    if additional.is_object() {
                        let (inner, _) = self.type_expr(additional, parts);
                        (format!("dict[str, {inner}]"), FieldShape::Raw)
                    } else {
                        self.uses_any = true;
                        ("dict[str, Any]".to_string(), FieldShape::Raw)
                    }
                } else {
                    self.uses_any = true;
                    ("dict[str, Any]".to_string(), FieldShape::Raw)
                }
            }
            _ => {
                self.uses_any = true;
                ("Any".to_string(), FieldShape::Raw)
            }
        }
    }

    fn claim_name(&mut self, base: String) -> String {
        let mut candidate = base.clone();
        let mut suffix = 1usize;
        while !self.used_names.insert(candidate.clone()) {
            suffix += 1;
            candidate = format!("{base}{suffix}");
        }
        candidate
    }
}

impl Default for TypeMapper {
    fn default() -> Self {
        Self::new()
    }
}

fn is_record(schema: &Value) -> bool {
    schema
        .as_object()
        .is_some_and(|obj| {
            obj.get("type").and_then(Value::as_str) == Some("object")
                && obj.get("properties").is_some()
        })
}

/// Render a JSON scalar as a Python literal.
fn py_literal(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(format!(
            "\"{}\"",
            s.replace('\\', "\\\\").replace('"', "\\\"")
        )),
        Value::Bool(true) => Some("True".to_string()),
        Value::Bool(false) => Some("False".to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => Some("None".to_string()),
        _ => None,
    }
}
