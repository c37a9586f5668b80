//! Diagram tool contract: definitions exposed to the model and typed decoding
//! of the inputs it produces.
//!
//! All three tools run on the client. The service only declares them and
//! checks that an input has the right shape before relaying it.

use std::fmt;

use diagram_provider::ToolDefinition;
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Marker key carried by inputs that could not be recovered.
pub const ERROR_MARKER: &str = "_error";

const DISPLAY_DIAGRAM_DESCRIPTION: &str = r#"Display a diagram on draw.io. Pass ONLY the mxCell elements - wrapper tags and root cells are added automatically.

VALIDATION RULES (XML will be rejected if violated):
1. Generate ONLY mxCell elements - NO wrapper tags (<mxfile>, <mxGraphModel>, <root>)
2. Do NOT include root cells (id="0" or id="1") - they are added automatically
3. All mxCell elements must be siblings - never nested
4. Every mxCell needs a unique id (start from "2")
5. Every mxCell needs a valid parent attribute (use "1" for top-level)
6. Escape special chars in values: &lt; &gt; &amp; &quot;

Example (generate ONLY this - no wrapper tags):
<mxCell id="lane1" value="Frontend" style="swimlane;" vertex="1" parent="1">
  <mxGeometry x="40" y="40" width="200" height="200" as="geometry"/>
</mxCell>
<mxCell id="step1" value="Step 1" style="rounded=1;" vertex="1" parent="lane1">
  <mxGeometry x="20" y="60" width="160" height="40" as="geometry"/>
</mxCell>
<mxCell id="lane2" value="Backend" style="swimlane;" vertex="1" parent="1">
  <mxGeometry x="280" y="40" width="200" height="200" as="geometry"/>
</mxCell>
<mxCell id="step2" value="Step 2" style="rounded=1;" vertex="1" parent="lane2">
  <mxGeometry x="20" y="60" width="160" height="40" as="geometry"/>
</mxCell>
<mxCell id="edge1" style="edgeStyle=orthogonalEdgeStyle;endArrow=classic;" edge="1" parent="1" source="step1" target="step2">
  <mxGeometry relative="1" as="geometry"/>
</mxCell>

Notes:
- For AWS diagrams, use **AWS 2025 icons**.
- For animated connectors, add "flowAnimation=1" to edge style.
"#;

const EDIT_DIAGRAM_DESCRIPTION: &str = r#"Edit the current diagram by ID-based operations (update/add/delete cells).

Operations:
- update: Replace an existing cell by its id. Provide cell_id and complete new_xml.
- add: Add a new cell. Provide cell_id (new unique id) and new_xml.
- delete: Remove a cell by its id. Only cell_id is needed.

For update/add, new_xml must be a complete mxCell XML element including mxGeometry.

⚠️ JSON ESCAPING: Every " inside new_xml MUST be escaped as \\". Example: id=\\"5\\" value=\\"Label\\""#;

const APPEND_DIAGRAM_DESCRIPTION: &str = r#"Continue generating diagram XML when previous display_diagram output was truncated due to length limits.

WHEN TO USE: Only call this tool after display_diagram was truncated (you'll see an error message about truncation).

CRITICAL INSTRUCTIONS:
1. Do NOT include any wrapper tags - just continue the mxCell elements
2. Continue from EXACTLY where your previous output stopped
3. Complete the remaining mxCell elements
4. If still truncated, call append_diagram again with the next fragment

Example: If previous output ended with '<mxCell id="x" style="rounded=1', continue with ';" vertex="1">...' and complete the remaining elements."#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagramTool {
    Display,
    Edit,
    Append,
}

impl DiagramTool {
    pub const ALL: [DiagramTool; 3] = [
        DiagramTool::Display,
        DiagramTool::Edit,
        DiagramTool::Append,
    ];

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Display => "display_diagram",
            Self::Edit => "edit_diagram",
            Self::Append => "append_diagram",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.name() == name)
    }

    /// Tools whose inputs carry full diagram XML in history.
    #[must_use]
    pub fn produces_diagram_xml(&self) -> bool {
        matches!(self, Self::Display | Self::Edit)
    }

    fn description(&self) -> &'static str {
        match self {
            Self::Display => DISPLAY_DIAGRAM_DESCRIPTION,
            Self::Edit => EDIT_DIAGRAM_DESCRIPTION,
            Self::Append => APPEND_DIAGRAM_DESCRIPTION,
        }
    }

    fn input_schema(&self) -> Value {
        let schema = match self {
            Self::Display => schema_for!(DisplayDiagramInput),
            Self::Edit => schema_for!(EditDiagramInput),
            Self::Append => schema_for!(AppendDiagramInput),
        };
        let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| json!({"type": "object"}));
        if let Some(object) = value.as_object_mut() {
            object.remove("$schema");
            object.remove("title");
        }
        inline_definitions(value)
    }
}

impl fmt::Display for DiagramTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DisplayDiagramInput {
    /// XML string to be displayed on draw.io
    pub xml: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EditDiagramInput {
    /// Array of operations to apply
    pub operations: Vec<EditOperation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EditOperation {
    /// Operation type
    #[serde(rename = "type")]
    pub kind: EditOperationKind,
    /// The id of the mxCell. Must match the id attribute in new_xml.
    pub cell_id: String,
    /// Complete mxCell XML element (required for update/add)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_xml: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum EditOperationKind {
    Update,
    Add,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AppendDiagramInput {
    /// Continuation XML fragment to append (NO wrapper tags)
    pub xml: String,
}

/// A decoded, rule-checked tool input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagramToolInput {
    Display(DisplayDiagramInput),
    Edit(EditDiagramInput),
    Append(AppendDiagramInput),
    /// Input that carries the `_error` marker from a failed repair.
    Failed { tool: DiagramTool, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolContractError {
    #[error("Model tried to call unavailable tool '{0}'")]
    UnknownTool(String),
    #[error("Invalid input for tool {tool}: {message}")]
    InvalidInput { tool: DiagramTool, message: String },
}

impl DiagramToolInput {
    /// Decodes `value` for `tool_name` and checks the per-tool rules.
    pub fn parse(tool_name: &str, value: &Value) -> Result<Self, ToolContractError> {
        let tool = DiagramTool::from_name(tool_name)
            .ok_or_else(|| ToolContractError::UnknownTool(tool_name.to_string()))?;

        if let Some(message) = value.get(ERROR_MARKER).and_then(Value::as_str) {
            return Ok(Self::Failed {
                tool,
                message: message.to_string(),
            });
        }

        let invalid = |message: String| ToolContractError::InvalidInput { tool, message };

        match tool {
            DiagramTool::Display => {
                let input: DisplayDiagramInput = decode(value).map_err(invalid)?;
                if input.xml.trim().is_empty() {
                    return Err(invalid("xml must not be empty".to_string()));
                }
                Ok(Self::Display(input))
            }
            DiagramTool::Edit => {
                let input: EditDiagramInput = decode(value).map_err(invalid)?;
                for (index, operation) in input.operations.iter().enumerate() {
                    check_operation(index, operation).map_err(invalid)?;
                }
                Ok(Self::Edit(input))
            }
            DiagramTool::Append => {
                let input: AppendDiagramInput = decode(value).map_err(invalid)?;
                if input.xml.is_empty() {
                    return Err(invalid("xml must not be empty".to_string()));
                }
                Ok(Self::Append(input))
            }
        }
    }
}

fn decode<T: DeserializeOwned>(value: &Value) -> Result<T, String> {
    T::deserialize(value).map_err(|error| error.to_string())
}

fn check_operation(index: usize, operation: &EditOperation) -> Result<(), String> {
    if operation.cell_id.trim().is_empty() {
        return Err(format!("operations[{index}].cell_id must not be empty"));
    }
    let needs_xml = matches!(
        operation.kind,
        EditOperationKind::Update | EditOperationKind::Add
    );
    let has_xml = operation
        .new_xml
        .as_deref()
        .is_some_and(|xml| !xml.trim().is_empty());
    if needs_xml && !has_xml {
        return Err(format!(
            "operations[{index}].new_xml is required for {} operations",
            match operation.kind {
                EditOperationKind::Update => "update",
                _ => "add",
            }
        ));
    }
    Ok(())
}

/// The three diagram tools as exposed to a backend.
#[must_use]
pub fn tool_definitions() -> Vec<ToolDefinition> {
    DiagramTool::ALL
        .into_iter()
        .map(|tool| ToolDefinition {
            name: tool.name().to_string(),
            description: Some(tool.description().to_string()),
            input_schema: tool.input_schema(),
        })
        .collect()
}

/// Deterministic stand-in input for a call that could not be recovered.
///
/// Only `display_diagram` and `edit_diagram` have one.
#[must_use]
pub fn placeholder_input(tool_name: &str, message: &str) -> Option<Value> {
    match DiagramTool::from_name(tool_name)? {
        DiagramTool::Edit => Some(json!({ "operations": [], ERROR_MARKER: message })),
        DiagramTool::Display => Some(json!({ "xml": "", ERROR_MARKER: message })),
        DiagramTool::Append => None,
    }
}

/// Replaces local `$ref`s with their definitions so providers that do not
/// resolve references still see the full shape.
fn inline_definitions(mut schema: Value) -> Value {
    let definitions = schema
        .as_object_mut()
        .and_then(|object| {
            object
                .remove("$defs")
                .or_else(|| object.remove("definitions"))
        })
        .and_then(|definitions| match definitions {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default();

    if definitions.is_empty() {
        return schema;
    }
    resolve_refs(schema, &definitions, 0)
}

fn resolve_refs(value: Value, definitions: &Map<String, Value>, depth: usize) -> Value {
    if depth > 16 {
        return value;
    }
    match value {
        Value::Object(object) => {
            let reference = object
                .get("$ref")
                .and_then(Value::as_str)
                .and_then(|reference| reference.rsplit('/').next())
                .and_then(|name| definitions.get(name));
            if let Some(definition) = reference {
                return resolve_refs(definition.clone(), definitions, depth + 1);
            }
            Value::Object(
                object
                    .into_iter()
                    .map(|(key, value)| (key, resolve_refs(value, definitions, depth + 1)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| resolve_refs(item, definitions, depth + 1))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn definition(name: &str) -> ToolDefinition {
        tool_definitions()
            .into_iter()
            .find(|tool| tool.name == name)
            .expect("tool is defined")
    }

    #[test]
    fn exposes_three_tools_in_fixed_order() {
        let names: Vec<String> = tool_definitions().into_iter().map(|tool| tool.name).collect();
        assert_eq!(names, vec!["display_diagram", "edit_diagram", "append_diagram"]);
    }

    #[test]
    fn schemas_are_plain_objects_with_required_fields() {
        let display = definition("display_diagram").input_schema;
        assert_eq!(display["type"], "object");
        assert_eq!(display["required"], json!(["xml"]));
        assert!(display.get("$schema").is_none());

        let edit = definition("edit_diagram").input_schema;
        let operation = &edit["properties"]["operations"]["items"];
        assert_eq!(operation["type"], "object");
        assert!(operation["properties"]["type"].is_object());
        assert!(operation["properties"]["cell_id"].is_object());
        assert!(!edit.to_string().contains("$ref"));
    }

    #[test]
    fn descriptions_carry_validation_rules() {
        let display = definition("display_diagram").description.unwrap_or_default();
        assert!(display.contains("start from \"2\""));
        assert!(display.contains("&lt; &gt; &amp; &quot;"));

        let edit = definition("edit_diagram").description.unwrap_or_default();
        assert!(edit.contains("new_xml"));
    }

    #[test]
    fn parse_accepts_valid_edit_operations() {
        let input = DiagramToolInput::parse(
            "edit_diagram",
            &json!({"operations": [
                {"type": "update", "cell_id": "3", "new_xml": "<mxCell id=\"3\"/>"},
                {"type": "delete", "cell_id": "4"}
            ]}),
        )
        .expect("valid edit");

        let DiagramToolInput::Edit(edit) = input else {
            panic!("expected edit input");
        };
        assert_eq!(edit.operations.len(), 2);
        assert_eq!(edit.operations[1].kind, EditOperationKind::Delete);
        assert_eq!(edit.operations[1].new_xml, None);
    }

    #[test]
    fn parse_requires_new_xml_for_add_and_update() {
        let error = DiagramToolInput::parse(
            "edit_diagram",
            &json!({"operations": [{"type": "add", "cell_id": "9"}]}),
        )
        .expect_err("add without xml");

        assert_eq!(
            error.to_string(),
            "Invalid input for tool edit_diagram: operations[0].new_xml is required for add operations"
        );
    }

    #[test]
    fn parse_rejects_blank_cell_id_and_empty_display() {
        assert!(DiagramToolInput::parse(
            "edit_diagram",
            &json!({"operations": [{"type": "delete", "cell_id": " "}]}),
        )
        .is_err());
        assert!(DiagramToolInput::parse("display_diagram", &json!({"xml": ""})).is_err());
        assert!(DiagramToolInput::parse("display_diagram", &json!({"svg": "<svg/>"})).is_err());
    }

    #[test]
    fn parse_reports_unknown_tools() {
        assert_eq!(
            DiagramToolInput::parse("google_search", &json!({"query": "x"})),
            Err(ToolContractError::UnknownTool("google_search".to_string()))
        );
    }

    #[test]
    fn error_marker_decodes_as_failed() {
        let placeholder = placeholder_input("display_diagram", "JSON repair failed - empty diagram")
            .expect("display has a placeholder");

        assert_eq!(
            DiagramToolInput::parse("display_diagram", &placeholder),
            Ok(DiagramToolInput::Failed {
                tool: DiagramTool::Display,
                message: "JSON repair failed - empty diagram".to_string(),
            })
        );
    }

    #[test]
    fn placeholders_exist_only_for_display_and_edit() {
        assert_eq!(
            placeholder_input("edit_diagram", "failed"),
            Some(json!({"operations": [], "_error": "failed"}))
        );
        assert_eq!(placeholder_input("append_diagram", "failed"), None);
        assert_eq!(placeholder_input("unknown", "failed"), None);
    }
}
