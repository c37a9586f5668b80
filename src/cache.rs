//! Recorded diagrams replayed for well-known first prompts.
//!
//! The table is built once at startup from the built-in entries plus an
//! optional JSON file and is read-only afterwards.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::stream::UiEvent;
use crate::tools::DiagramTool;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub prompt: String,
    #[serde(default)]
    pub has_attachment: bool,
    pub xml: String,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to read cache file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse cache file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

const CAT_XML: &str = concat!(
    r#"<mxCell id="2" value="" style="ellipse;whiteSpace=wrap;html=1;fillColor=#FFE0B2;strokeColor=#E65100;" vertex="1" parent="1"><mxGeometry x="300" y="260" width="200" height="160" as="geometry"/></mxCell>"#,
    r#"<mxCell id="3" value="" style="ellipse;whiteSpace=wrap;html=1;fillColor=#FFE0B2;strokeColor=#E65100;" vertex="1" parent="1"><mxGeometry x="320" y="120" width="160" height="140" as="geometry"/></mxCell>"#,
    r#"<mxCell id="4" value="" style="triangle;whiteSpace=wrap;html=1;direction=north;fillColor=#FFE0B2;strokeColor=#E65100;" vertex="1" parent="1"><mxGeometry x="330" y="90" width="40" height="50" as="geometry"/></mxCell>"#,
    r#"<mxCell id="5" value="" style="triangle;whiteSpace=wrap;html=1;direction=north;fillColor=#FFE0B2;strokeColor=#E65100;" vertex="1" parent="1"><mxGeometry x="430" y="90" width="40" height="50" as="geometry"/></mxCell>"#,
    r#"<mxCell id="6" value="" style="ellipse;whiteSpace=wrap;html=1;fillColor=#000000;" vertex="1" parent="1"><mxGeometry x="360" y="170" width="16" height="16" as="geometry"/></mxCell>"#,
    r#"<mxCell id="7" value="" style="ellipse;whiteSpace=wrap;html=1;fillColor=#000000;" vertex="1" parent="1"><mxGeometry x="424" y="170" width="16" height="16" as="geometry"/></mxCell>"#,
    r#"<mxCell id="8" value="" style="triangle;whiteSpace=wrap;html=1;direction=south;fillColor=#F48FB1;strokeColor=#AD1457;" vertex="1" parent="1"><mxGeometry x="390" y="200" width="20" height="12" as="geometry"/></mxCell>"#,
    r#"<mxCell id="9" value="" style="curved=1;endArrow=none;html=1;strokeWidth=6;strokeColor=#E65100;" edge="1" parent="1"><mxGeometry width="50" height="50" relative="1" as="geometry"><mxPoint x="500" y="380" as="sourcePoint"/><mxPoint x="560" y="260" as="targetPoint"/><Array as="points"><mxPoint x="580" y="360"/></Array></mxGeometry></mxCell>"#,
);

static BUILT_IN: Lazy<Vec<CacheEntry>> = Lazy::new(|| {
    vec![CacheEntry {
        prompt: "Draw a cat for me".to_string(),
        has_attachment: false,
        xml: CAT_XML.to_string(),
    }]
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTable {
    entries: Vec<CacheEntry>,
}

impl CacheTable {
    /// Table holding only the built-in entries.
    #[must_use]
    pub fn built_in() -> Self {
        Self {
            entries: BUILT_IN.clone(),
        }
    }

    /// Built-in entries followed by the entries of `path`, if given.
    pub fn load(path: Option<&Path>) -> Result<Self, CacheError> {
        let mut table = Self::built_in();
        let Some(path) = path else {
            return Ok(table);
        };

        let text = fs::read_to_string(path).map_err(|source| CacheError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let extra: Vec<CacheEntry> =
            serde_json::from_str(&text).map_err(|source| CacheError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        tracing::info!(path = %path.display(), entries = extra.len(), "loaded cached diagrams");
        table.entries.extend(extra);
        Ok(table)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact prompt match with the same attachment flag.
    #[must_use]
    pub fn lookup(&self, prompt: &str, has_attachment: bool) -> Option<&CacheEntry> {
        self.entries
            .iter()
            .find(|entry| entry.prompt == prompt && entry.has_attachment == has_attachment)
    }
}

impl Default for CacheTable {
    fn default() -> Self {
        Self::built_in()
    }
}

/// True when the canvas holds no user-created cell.
#[must_use]
pub fn is_empty_canvas(xml: &str) -> bool {
    let stripped: String = xml.chars().filter(|ch| !ch.is_whitespace()).collect();
    !stripped.contains(r#"id="2""#)
}

/// A turn may use the cache only as the first message on an empty canvas.
#[must_use]
pub fn is_eligible(message_count: usize, xml: &str) -> bool {
    message_count == 1 && is_empty_canvas(xml)
}

/// Synthetic stream replaying `xml` as one `display_diagram` call.
#[must_use]
pub fn replay_events(xml: &str) -> Vec<UiEvent> {
    replay_events_with_id(xml, &format!("cached-{}", unix_millis()))
}

fn replay_events_with_id(xml: &str, tool_call_id: &str) -> Vec<UiEvent> {
    let tool_name = DiagramTool::Display.name().to_string();
    vec![
        UiEvent::Start,
        UiEvent::ToolInputStart {
            tool_call_id: tool_call_id.to_string(),
            tool_name: tool_name.clone(),
        },
        UiEvent::ToolInputDelta {
            tool_call_id: tool_call_id.to_string(),
            input_text_delta: xml.to_string(),
        },
        UiEvent::ToolInputAvailable {
            tool_call_id: tool_call_id.to_string(),
            tool_name,
            input: json!({ "xml": xml }),
        },
        UiEvent::Finish {
            message_metadata: None,
        },
    ]
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn built_in_cat_matches_exact_prompt_without_attachment() {
        let table = CacheTable::built_in();
        assert!(table.lookup("Draw a cat for me", false).is_some());
        assert!(table.lookup("Draw a cat for me", true).is_none());
        assert!(table.lookup("draw a cat for me", false).is_none());
    }

    #[test]
    fn canvas_with_only_root_cells_is_empty() {
        assert!(is_empty_canvas(""));
        assert!(is_empty_canvas(
            r#"<mxGraphModel><root><mxCell id="0"/><mxCell id="1" parent="0"/></root></mxGraphModel>"#
        ));
        assert!(!is_empty_canvas("<mxCell\n  id=\"2\"\n/>"));
        assert!(!is_empty_canvas(r#"<root><mxCell id="2" vertex="1"/></root>"#));
    }

    #[test]
    fn eligibility_requires_a_single_message() {
        assert!(is_eligible(1, ""));
        assert!(!is_eligible(2, ""));
        assert!(!is_eligible(1, r#"<mxCell id="2"/>"#));
    }

    #[test]
    fn replay_emits_display_call_shape() {
        let events = replay_events_with_id("<a/>", "cached-1");
        assert_eq!(events.len(), 5);
        assert_eq!(events[0], UiEvent::Start);
        assert_eq!(
            events[3],
            UiEvent::ToolInputAvailable {
                tool_call_id: "cached-1".to_string(),
                tool_name: "display_diagram".to_string(),
                input: json!({"xml": "<a/>"}),
            }
        );
        assert!(events[4].is_terminal());
    }

    #[test]
    fn replay_ids_use_cached_prefix() {
        let events = replay_events("<a/>");
        match &events[1] {
            UiEvent::ToolInputStart { tool_call_id, .. } => {
                assert!(tool_call_id.starts_with("cached-"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn load_extends_built_in_entries() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"[{{"prompt": "Draw a dog", "hasAttachment": true, "xml": "<dog/>"}}]"#
        )
        .expect("write cache file");

        let table = CacheTable::load(Some(file.path())).expect("cache file loads");
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.lookup("Draw a dog", true).map(|entry| entry.xml.as_str()),
            Some("<dog/>")
        );
    }

    #[test]
    fn malformed_cache_file_is_reported() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "not json").expect("write cache file");

        assert!(matches!(
            CacheTable::load(Some(file.path())),
            Err(CacheError::Parse { .. })
        ));
    }
}
