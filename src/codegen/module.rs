//! Rendering of generated Python modules.
//!
//! One module per tool: a `Params` dataclass mirroring the input
//! schema, an optional `Result` dataclass when the tool declares an
//! output schema, and a synchronous `run` entry point that calls the
//! tool service through the shared preamble.

use serde_json::Map;

use super::pytype::{FieldShape, PyClass, TypeMapper};
use sandcell_providers::Tool;

/// Shared preamble module: tool service address, bearer secret, and the
/// HTTP plumbing every tool module calls into.
pub fn render_preamble(base_url: &str, secret: &str) -> String {
    format!(
        r#""""Tool service connection data for generated tool modules.

Rewritten on every session start; do not edit.
"""
import json
import urllib.request

BASE_URL = "{base_url}"
SECRET = "{secret}"


class ToolCallError(RuntimeError):
    """A tool invocation failed; `kind` mirrors the coordinator's error kinds."""

    def __init__(self, kind, message):
        super().__init__(f"{{kind}}: {{message}}")
        self.kind = kind
        self.message = message


def call(provider, tool, args):
    body = json.dumps({{"provider": provider, "tool": tool, "args": args}}).encode()
    request = urllib.request.Request(
        BASE_URL + "/run",
        data=body,
        headers={{
            "Content-Type": "application/json",
            "Authorization": "Bearer " + SECRET,
        }},
    )
    with urllib.request.urlopen(request) as response:
        payload = json.loads(response.read().decode())
    if payload.get("ok"):
        return payload.get("result")
    error = payload.get("error") or {{}}
    raise ToolCallError(error.get("kind", "internal"), error.get("message", ""))
"#
    )
}

/// `tools/__init__.py`, written once.
pub fn render_tools_init() -> String {
    "\"\"\"Generated tool packages. Contents are rewritten by the coordinator.\"\"\"\n"
        .to_string()
}

/// Aggregator module for one provider, re-exporting its tool modules.
pub fn render_aggregator(provider: &str, module_idents: &[String]) -> String {
    let mut out = format!("\"\"\"Generated tool modules for provider `{provider}`.\"\"\"\n");
    if module_idents.is_empty() {
        return out;
    }
    out.push('\n');
    for ident in module_idents {
        out.push_str(&format!("from . import {ident}\n"));
    }
    out.push_str("\n__all__ = [");
    out.push_str(
        &module_idents
            .iter()
            .map(|ident| format!("\"{ident}\""))
            .collect::<Vec<_>>()
            .join(", "),
    );
    out.push_str("]\n");
    out
}

/// Render the module for one tool.
pub fn render_tool_module(provider: &str, tool: &Tool) -> String {
    let mut mapper = TypeMapper::new();

    let input_schema: &Map<_, _> = &tool.input_schema;
    mapper.record_class(&["params"], input_schema);
    let params_end = mapper.classes.len();

    let has_result = match tool.output_schema.as_deref() {
        Some(schema) => {
            mapper.record_class(&["result"], schema);
            true
        }
        None => false,
    };

    let mut out = String::new();

    // Docstring.
    let tool_name = tool.name.as_ref();
    out.push_str(&format!(
        "\"\"\"Client for tool `{tool_name}` on provider `{provider}`.\n"
    ));
    if let Some(description) = tool.description.as_deref() {
        let description = description.trim().replace("\"\"\"", "'''");
        if !description.is_empty() {
            out.push_str(&format!("\n{description}\n"));
        }
    }
    out.push_str("\nRewritten whenever the provider's tools are regenerated; do not edit.\n\"\"\"\n");
    out.push_str("from __future__ import annotations\n\n");

    // Imports.
    out.push_str("import json\n");
    out.push_str("from dataclasses import dataclass\n");
    let mut typing_imports = Vec::new();
    if mapper.uses_any {
        typing_imports.push("Any");
    }
    if mapper.uses_literal {
        typing_imports.push("Literal");
    }
    if !typing_imports.is_empty() {
        out.push_str(&format!("from typing import {}\n", typing_imports.join(", ")));
    }
    out.push('\n');
    out.push_str("from .. import _preamble\n");
    if has_result {
        out.push_str("from .._preamble import ToolCallError\n");
    }
    out.push('\n');
    out.push_str(&format!("PROVIDER = \"{}\"\n", py_escape(provider)));
    out.push_str(&format!("TOOL = \"{}\"\n", py_escape(tool_name)));

    for (index, class) in mapper.classes.iter().enumerate() {
        out.push_str("\n\n");
        render_class(&mut out, class, index < params_end);
    }

    out.push_str("\n\n");
    if has_result {
        out.push_str(&format!(
            r#"def run(params: Params) -> Result:
    """Invoke `{tool_name}` and decode its typed result."""
    value = _preamble.call(PROVIDER, TOOL, params._to_obj())
    if isinstance(value, str):
        try:
            value = json.loads(value)
        except ValueError as exc:
            raise ToolCallError("tool", f"undecodable result: {{exc}}") from None
    return Result._from_obj(value)
"#
        ));
    } else {
        out.push_str(&format!(
            r#"def run_raw(params: Params) -> str:
    """Invoke `{tool_name}` and return the provider's raw text."""
    value = _preamble.call(PROVIDER, TOOL, params._to_obj())
    if isinstance(value, str):
        return value
    return json.dumps(value)


def run(params: Params) -> str:
    """Parsed variant of `run_raw`; currently the identity."""
    return run_raw(params)
"#
        ));
    }

    out
}

/// Render one dataclass. Params-side classes get `_to_obj`, result-side
/// classes get `_from_obj`.
fn render_class(out: &mut String, class: &PyClass, params_side: bool) {
    out.push_str("@dataclass\n");
    out.push_str(&format!("class {}:\n", class.name));

    if class.fields.is_empty() {
        out.push_str("    pass\n");
    }
    for field in &class.fields {
        match &field.default_literal {
            Some(default) => out.push_str(&format!(
                "    {}: {} = {}\n",
                field.py_name, field.annotation, default
            )),
            None => out.push_str(&format!("    {}: {}\n", field.py_name, field.annotation)),
        }
    }

    // Runtime validation for enum membership and numeric bounds.
    let mut checks = Vec::new();
    for field in &class.fields {
        let name = &field.py_name;
        let guard = if field.required {
            String::new()
        } else {
            format!("self.{name} is not None and ")
        };
        if let Some(literals) = &field.enum_literals {
            let tuple = literals.join(", ");
            checks.push(format!(
                "        if {guard}self.{name} not in ({tuple},):\n            raise ValueError(\"{name} must be one of: {}\")\n",
                py_escape(&literals.join(", "))
            ));
        }
        if let Some(minimum) = field.minimum {
            checks.push(format!(
                "        if {guard}self.{name} < {}:\n            raise ValueError(\"{name} must be >= {}\")\n",
                py_number(minimum),
                py_number(minimum)
            ));
        }
        if let Some(maximum) = field.maximum {
            checks.push(format!(
                "        if {guard}self.{name} > {}:\n            raise ValueError(\"{name} must be <= {}\")\n",
                py_number(maximum),
                py_number(maximum)
            ));
        }
    }
    if !checks.is_empty() {
        out.push_str("\n    def __post_init__(self) -> None:\n");
        for check in checks {
            out.push_str(&check);
        }
    }

    if params_side {
        out.push_str("\n    def _to_obj(self) -> dict:\n");
        out.push_str("        obj: dict = {}\n");
        for field in &class.fields {
            let name = &field.py_name;
            let json_name = py_escape(&field.json_name);
            let value = match &field.shape {
                FieldShape::Raw => format!("self.{name}"),
                FieldShape::Record(_) => format!("self.{name}._to_obj()"),
                FieldShape::RecordList(_) => {
                    format!("[item._to_obj() for item in self.{name}]")
                }
            };
            if field.required {
                out.push_str(&format!("        obj[\"{json_name}\"] = {value}\n"));
            } else {
                out.push_str(&format!(
                    "        if self.{name} is not None:\n            obj[\"{json_name}\"] = {value}\n"
                ));
            }
        }
        out.push_str("        return obj\n");
    } else {
        out.push_str("\n    @classmethod\n");
        out.push_str(&format!(
            "    def _from_obj(cls, obj) -> \"{}\":\n",
            class.name
        ));
        out.push_str("        if not isinstance(obj, dict):\n");
        out.push_str(
            "            raise ValueError(f\"expected object, got {type(obj).__name__}\")\n",
        );
        if class.fields.is_empty() {
            out.push_str("        return cls()\n");
        } else {
            out.push_str("        return cls(\n");
            for field in &class.fields {
                let name = &field.py_name;
                let json_name = py_escape(&field.json_name);
                let value = match &field.shape {
                    FieldShape::Raw => format!("obj.get(\"{json_name}\")"),
                    FieldShape::Record(class_name) => format!(
                        "{class_name}._from_obj(obj[\"{json_name}\"]) if obj.get(\"{json_name}\") is not None else None"
                    ),
                    FieldShape::RecordList(class_name) => format!(
                        "[{class_name}._from_obj(item) for item in obj[\"{json_name}\"]] if obj.get(\"{json_name}\") is not None else None"
                    ),
                };
                out.push_str(&format!("            {name}={value},\n"));
            }
            out.push_str("        )\n");
        }
    }
}

fn py_escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

fn py_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    fn tool(name: &str, input: serde_json::Value, output: Option<serde_json::Value>) -> Tool {
        Tool {
            name: Cow::Owned(name.to_string()),
            title: None,
            description: Some(Cow::Owned(format!("Test tool: {name}"))),
            input_schema: Arc::new(input.as_object().cloned().unwrap_or_default()),
            output_schema: output.map(|o| Arc::new(o.as_object().cloned().unwrap_or_default())),
            annotations: None,
            icons: None,
        }
    }

    #[test]
    fn typed_tool_gets_params_and_result() {
        let tool = tool(
            "echo",
            json!({
                "type": "object",
                "properties": {"input": {"type": "string"}},
                "required": ["input"]
            }),
            Some(json!({
                "type": "object",
                "properties": {"echoed": {"type": "string"}},
                "required": ["echoed"]
            })),
        );

        let module = render_tool_module("demo", &tool);
        assert!(module.contains("class Params:"));
        assert!(module.contains("    input: str\n"));
        assert!(module.contains("class Result:"));
        assert!(module.contains("    echoed: str\n"));
        assert!(module.contains("def run(params: Params) -> Result:"));
        assert!(module.contains("PROVIDER = \"demo\""));
        assert!(module.contains("TOOL = \"echo\""));
        assert!(!module.contains("run_raw"));
    }

    #[test]
    fn untyped_tool_returns_raw_string() {
        let tool = tool(
            "shout",
            json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }),
            None,
        );

        let module = render_tool_module("demo", &tool);
        assert!(module.contains("def run_raw(params: Params) -> str:"));
        assert!(module.contains("def run(params: Params) -> str:"));
        assert!(module.contains("return run_raw(params)"));
        assert!(!module.contains("class Result"));
    }

    #[test]
    fn optional_fields_get_none_defaults() {
        let tool = tool(
            "search",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "limit": {"type": "integer", "default": 10}
                },
                "required": ["query"]
            }),
            None,
        );

        let module = render_tool_module("demo", &tool);
        assert!(module.contains("    query: str\n"));
        assert!(module.contains("    limit: int | None = 10\n"));
        // Optional fields are omitted from the wire when unset.
        assert!(module.contains("if self.limit is not None:"));
    }

    #[test]
    fn enums_become_literals_with_validation() {
        let tool = tool(
            "set_mode",
            json!({
                "type": "object",
                "properties": {"mode": {"enum": ["fast", "slow"]}},
                "required": ["mode"]
            }),
            None,
        );

        let module = render_tool_module("demo", &tool);
        assert!(module.contains("mode: Literal[\"fast\", \"slow\"]"));
        assert!(module.contains("from typing import Literal"));
        assert!(module.contains("if self.mode not in (\"fast\", \"slow\",):"));
    }

    #[test]
    fn integer_bounds_are_validated() {
        let tool = tool(
            "page",
            json!({
                "type": "object",
                "properties": {"n": {"type": "integer", "minimum": 1, "maximum": 100}},
                "required": ["n"]
            }),
            None,
        );

        let module = render_tool_module("demo", &tool);
        assert!(module.contains("if self.n < 1:"));
        assert!(module.contains("if self.n > 100:"));
    }

    #[test]
    fn nested_records_become_named_dataclasses() {
        let tool = tool(
            "create_contact",
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "address": {
                        "type": "object",
                        "properties": {
                            "city": {"type": "string"},
                            "street": {"type": "string"}
                        },
                        "required": ["city"]
                    }
                },
                "required": ["name"]
            }),
            None,
        );

        let module = render_tool_module("demo", &tool);
        // Nested class is defined before Params references it.
        let nested_pos = module.find("class ParamsAddress:").unwrap();
        let params_pos = module.find("class Params:").unwrap();
        assert!(nested_pos < params_pos);
        assert!(module.contains("address: ParamsAddress | None = None"));
        assert!(module.contains("obj[\"address\"] = self.address._to_obj()"));
    }

    #[test]
    fn result_decoding_rebuilds_nested_records() {
        let tool = tool(
            "get_tree",
            json!({"type": "object", "properties": {}}),
            Some(json!({
                "type": "object",
                "properties": {
                    "label": {"type": "string"},
                    "children": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {"label": {"type": "string"}}
                        }
                    }
                },
                "required": ["label"]
            })),
        );

        let module = render_tool_module("demo", &tool);
        assert!(module.contains("class ResultChildren:"));
        assert!(module.contains("children: list[ResultChildren] | None = None"));
        assert!(module.contains("_from_obj"));
        assert!(module.contains(
            "[ResultChildren._from_obj(item) for item in obj[\"children\"]]"
        ));
    }

    #[test]
    fn empty_input_schema_yields_empty_params() {
        let tool = tool("ping", json!({}), None);
        let module = render_tool_module("demo", &tool);
        assert!(module.contains("class Params:\n    pass\n"));
        assert!(module.contains("return obj"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let make = || {
            render_tool_module(
                "demo",
                &tool(
                    "echo",
                    json!({
                        "type": "object",
                        "properties": {
                            "b": {"type": "string"},
                            "a": {"type": "integer"},
                            "c": {"type": "boolean"}
                        },
                        "required": ["b"]
                    }),
                    None,
                ),
            )
        };
        assert_eq!(make(), make());
    }

    #[test]
    fn aggregator_lists_modules() {
        let rendered = render_aggregator(
            "demo",
            &["echo".to_string(), "search".to_string()],
        );
        assert!(rendered.contains("from . import echo\n"));
        assert!(rendered.contains("from . import search\n"));
        assert!(rendered.contains("__all__ = [\"echo\", \"search\"]"));
    }

    #[test]
    fn preamble_embeds_address_and_secret() {
        let rendered = render_preamble("http://127.0.0.1:4567", "sekrit");
        assert!(rendered.contains("BASE_URL = \"http://127.0.0.1:4567\""));
        assert!(rendered.contains("SECRET = \"sekrit\""));
        assert!(rendered.contains("class ToolCallError"));
        assert!(rendered.contains("Authorization"));
    }
}
