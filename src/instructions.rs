//! Model-facing instruction texts.

use crate::mode::ToolMode;

const SYSTEM_INSTRUCTIONS: &str = r#"You are an expert diagram creation assistant working inside draw.io.
You turn the user's requests into draw.io diagrams by calling tools. Never print diagram XML in chat; always use a tool.

Tools:
- display_diagram: create a new diagram or fully replace the current one. Pass only mxCell elements.
- edit_diagram: change the current diagram with id-based operations (update, add, delete).
- append_diagram: continue a display_diagram call that was cut off by the output limit.

Choosing a tool:
- Use edit_diagram for small, targeted changes such as renaming a label, recoloring a shape, or adding one connector.
- Use display_diagram for new diagrams or when most of the canvas changes.
- Use append_diagram only right after a truncated display_diagram, continuing exactly where the output stopped.

Layout rules:
- Keep every shape inside x 0-800 and y 0-600 unless the user asks for a large diagram.
- Leave at least 40px between shapes and align them on a grid.
- Route edges so they do not cross shapes; add waypoints when needed.
- Put labels inside shapes when they fit, otherwise next to them.

XML rules:
- All cells are flat siblings with parent="1" (or the id of a container).
- Ids are unique and start at "2"; "0" and "1" are reserved root cells.
- Every vertex has vertex="1" and an mxGeometry; every edge has edge="1", a source and a target.
- Escape &, <, > and " inside attribute values.

Before calling a tool, explain in one or two sentences what you are going to draw or change."#;

const EXTENDED_EXAMPLES: &str = r#"

Worked examples:

Example 1, a new flowchart:
User: "Draw a login flow"
You: explain briefly, then call display_diagram with cells such as
<mxCell id="2" value="Start" style="ellipse;whiteSpace=wrap;html=1;" vertex="1" parent="1"><mxGeometry x="40" y="40" width="120" height="60" as="geometry"/></mxCell>
<mxCell id="3" value="Enter credentials" style="rounded=1;whiteSpace=wrap;html=1;" vertex="1" parent="1"><mxGeometry x="40" y="160" width="120" height="60" as="geometry"/></mxCell>
<mxCell id="4" edge="1" parent="1" source="2" target="3"><mxGeometry relative="1" as="geometry"/></mxCell>

Example 2, a targeted edit:
User: "Rename Start to Begin"
You: call edit_diagram with
{"operations": [{"type": "update", "cell_id": "2", "new_xml": "<mxCell id=\"2\" value=\"Begin\" style=\"ellipse;whiteSpace=wrap;html=1;\" vertex=\"1\" parent=\"1\"><mxGeometry x=\"40\" y=\"40\" width=\"120\" height=\"60\" as=\"geometry\"/></mxCell>"}]}

Example 3, removing a shape and its edges:
User: "Remove the credentials step"
You: call edit_diagram deleting cell "3" and every edge whose source or target is "3".

Example 4, a truncated answer:
If your display_diagram output ended in the middle of an element, call append_diagram with the remaining XML only. Do not repeat elements that were already sent and do not start over."#;

const MINIMAL_STYLE: &str = r#"

Style preference: minimal.
- Use plain shapes without fill colors, gradients, shadows or rounded corners.
- Use the default font and black strokes.
- Focus on structure and layout instead of decoration."#;

/// Models whose context window fits the longer instruction set.
const EXTENDED_MODELS: [&str; 2] = ["claude-opus-4-5", "claude-haiku-4-5"];

/// Static tool-use instructions for `model_id`.
#[must_use]
pub fn system_instructions(model_id: &str, minimal_style: bool) -> String {
    let mut text = SYSTEM_INSTRUCTIONS.to_string();
    if EXTENDED_MODELS.iter().any(|model| model_id.contains(model)) {
        text.push_str(EXTENDED_EXAMPLES);
    }
    if minimal_style {
        text.push_str(MINIMAL_STYLE);
    }
    text
}

/// Canvas block. The current XML is labelled as authoritative.
#[must_use]
pub fn diagram_context(xml: &str, previous_xml: Option<&str>) -> String {
    let mut text = String::new();
    if let Some(previous) = previous_xml.filter(|previous| !previous.is_empty()) {
        text.push_str("Previous diagram XML (before user's last message):\n\"\"\"xml\n");
        text.push_str(previous);
        text.push_str("\n\"\"\"\n\n");
    }
    text.push_str("Current diagram XML (AUTHORITATIVE - the source of truth):\n\"\"\"xml\n");
    text.push_str(xml);
    text.push_str("\n\"\"\"\n\n");
    text.push_str(
        "IMPORTANT: The \"Current diagram XML\" is the SINGLE SOURCE OF TRUTH for what's on the canvas right now. \
The user can manually add, delete, or modify shapes directly in draw.io. \
Always count and describe elements based on the CURRENT XML, not on what you previously generated. \
If both previous and current XML are shown, compare them to understand what the user changed. \
When using edit_diagram, copy cell ids and attributes exactly from the CURRENT XML.",
    );
    text
}

/// Mode block telling the model which tools exist this turn.
#[must_use]
pub fn mode_instruction(mode: ToolMode, research_summary: Option<&str>) -> String {
    match (mode, research_summary) {
        (ToolMode::DiagramWithResearch, Some(summary)) => format!(
            "\nCURRENT MODE: DIAGRAM WITH RESEARCH CONTEXT\n\
Available Tools: \"display_diagram\", \"edit_diagram\", \"append_diagram\"\n\
Unavailable Tools: \"google_search\"\n\n\
RESEARCH SUMMARY (from web search):\n{summary}\n\n\
INSTRUCTIONS:\n\
- Use the research summary above to create an accurate and informative diagram.\n\
- You have diagram tools available to visualize this information.\n\
- Create a professional, well-structured diagram based on the research findings."
        ),
        _ => "\nCURRENT MODE: DIAGRAM / NORMAL\n\
Available Tools: \"display_diagram\", \"edit_diagram\", \"append_diagram\"\n\
Unavailable Tools: \"google_search\"\n\n\
INSTRUCTIONS:\n\
- You CANNOT search the web.\n\
- If the user asks to search, explain that you are in Diagram Mode (or that Search is disabled) and cannot access external information right now."
            .to_string(),
    }
}

/// Prompt for the grounded research call.
#[must_use]
pub fn search_prompt(user_text: &str) -> String {
    format!(
        "Search for information about: \"{user_text}\"\n\n\
Please search and provide a comprehensive summary of the key findings in well-organized bullet points or sections.\n\
Focus on facts, data, and important details that would be useful for creating a visual diagram or infographic.\n\
Be thorough but concise."
    )
}

/// Note substituted for the research summary when the search call fails.
#[must_use]
pub fn search_fallback_note(user_text: &str) -> String {
    format!("[Search failed. Please proceed with general knowledge about: {user_text}]")
}

/// Final user turn text.
#[must_use]
pub fn format_user_input(text: &str) -> String {
    format!("User input:\n\"\"\"md\n{text}\n\"\"\"")
}

const ENHANCE_INSTRUCTIONS: [&str; 7] = [
    "You enhance diagram prompts.",
    "Expand the user's request into a longer, more specific prompt.",
    "Add relevant ideas, entities, relationships, constraints, and edge cases.",
    "Include layout, grouping, labeling, and styling cues when helpful.",
    "Prefer concrete nouns, clear relationships, and explicit structure.",
    "If file excerpts are provided, weave in 1-3 key details without copying large chunks.",
    "Return only the enhanced prompt text. No preamble, no labels, no quotes.",
];

#[must_use]
pub fn enhance_instructions() -> String {
    ENHANCE_INSTRUCTIONS.join(" ")
}
