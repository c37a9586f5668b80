//! Step loop for the main generation call.
//!
//! Each step is one backend `generate` call whose stream parts are relayed as
//! UI events. Diagram tools run on the client, so a step that hands the
//! client at least one usable call ends the turn. Calls that break the tool
//! contract get an error result and the model gets another step, up to
//! [`MAX_STEPS`].

use diagram_provider::{
    BackendError, CancelSignal, ContentPart, FinishReason, GenerationRequest, ModelBackend,
    ModelMessage, RequestOptions, StepOutcome, StreamPart, Usage,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::ChatError;
use crate::prompt::is_usable_tool_input;
use crate::repair::{recover_tool_input, RepairOutcome, ToolCallError};
use crate::stream::{FinishMetadata, UiEvent};
use crate::tools::{tool_definitions, DiagramToolInput};

pub const MAX_STEPS: u32 = 5;

/// Inputs of one turn after prompt assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnPlan {
    pub messages: Vec<ModelMessage>,
    pub options: RequestOptions,
    /// Grounding metadata from the research step, reported on `finish`.
    pub grounding_metadata: Option<Value>,
}

/// What the turn produced, for telemetry.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnSummary {
    pub text: String,
    pub usage: Usage,
    pub finish_reason: FinishReason,
    pub steps: u32,
    pub tool_calls: usize,
}

/// How the host disposed of one completed tool call.
#[derive(Debug, Clone, PartialEq)]
enum Disposition {
    /// Relayed to the client, which executes it.
    Client,
    /// Rejected here; the model sees `message` as an error result.
    Rejected { message: String },
}

#[derive(Debug, Clone, PartialEq)]
struct CompletedCall {
    call_id: String,
    tool_name: String,
    input: Value,
    disposition: Disposition,
}

/// Per-step relay state between backend parts and UI events.
#[derive(Default)]
struct StepRelay {
    text_id: Option<String>,
    reasoning_id: Option<String>,
    started_calls: Vec<String>,
    text: String,
    calls: Vec<CompletedCall>,
}

impl StepRelay {
    fn on_part(&mut self, part: StreamPart, emit: &mut dyn FnMut(UiEvent)) {
        match part {
            StreamPart::TextDelta { text } => {
                self.close_reasoning(emit);
                let id = self.text_id.get_or_insert_with(|| {
                    let id = block_id("txt");
                    emit(UiEvent::TextStart { id: id.clone() });
                    id
                });
                self.text.push_str(&text);
                emit(UiEvent::TextDelta {
                    id: id.clone(),
                    delta: text,
                });
            }
            StreamPart::ReasoningDelta { text } => {
                self.close_text(emit);
                let id = self.reasoning_id.get_or_insert_with(|| {
                    let id = block_id("rsn");
                    emit(UiEvent::ReasoningStart { id: id.clone() });
                    id
                });
                emit(UiEvent::ReasoningDelta {
                    id: id.clone(),
                    delta: text,
                });
            }
            StreamPart::ToolInputStart { call_id, tool_name } => {
                self.close_blocks(emit);
                self.started_calls.push(call_id.clone());
                emit(UiEvent::ToolInputStart {
                    tool_call_id: call_id,
                    tool_name,
                });
            }
            StreamPart::ToolInputDelta { call_id, delta } => {
                emit(UiEvent::ToolInputDelta {
                    tool_call_id: call_id,
                    input_text_delta: delta,
                });
            }
            StreamPart::ToolCall {
                call_id,
                tool_name,
                input,
            } => {
                self.close_blocks(emit);
                if !self.started_calls.contains(&call_id) {
                    self.started_calls.push(call_id.clone());
                    emit(UiEvent::ToolInputStart {
                        tool_call_id: call_id.clone(),
                        tool_name: tool_name.clone(),
                    });
                }
                let call = complete_call(call_id, tool_name, &input);
                emit(call_event(&call));
                self.calls.push(call);
            }
        }
    }

    fn close_text(&mut self, emit: &mut dyn FnMut(UiEvent)) {
        if let Some(id) = self.text_id.take() {
            emit(UiEvent::TextEnd { id });
        }
    }

    fn close_reasoning(&mut self, emit: &mut dyn FnMut(UiEvent)) {
        if let Some(id) = self.reasoning_id.take() {
            emit(UiEvent::ReasoningEnd { id });
        }
    }

    fn close_blocks(&mut self, emit: &mut dyn FnMut(UiEvent)) {
        self.close_reasoning(emit);
        self.close_text(emit);
    }

    /// Whether the model should get another step to react to error results.
    fn needs_follow_up(&self, finish_reason: FinishReason) -> bool {
        finish_reason == FinishReason::ToolCalls
            && !self.calls.is_empty()
            && self
                .calls
                .iter()
                .all(|call| matches!(call.disposition, Disposition::Rejected { .. }))
    }

    /// Assistant turn plus error results appended before the next step.
    fn follow_up_messages(&self) -> [ModelMessage; 2] {
        let mut parts = Vec::new();
        if !self.text.is_empty() {
            parts.push(ContentPart::text(self.text.clone()));
        }
        let mut results = Vec::new();
        for call in &self.calls {
            parts.push(ContentPart::ToolCall {
                call_id: call.call_id.clone(),
                tool_name: call.tool_name.clone(),
                input: call.input.clone(),
            });
            if let Disposition::Rejected { message } = &call.disposition {
                results.push(ContentPart::ToolResult {
                    call_id: call.call_id.clone(),
                    tool_name: call.tool_name.clone(),
                    output: Value::String(message.clone()),
                    is_error: true,
                });
            }
        }
        [ModelMessage::assistant(parts), ModelMessage::tool(results)]
    }
}

fn block_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

/// Runs recovery and contract checks for one streamed call.
fn complete_call(call_id: String, tool_name: String, raw: &str) -> CompletedCall {
    let outcome = recover_tool_input(&tool_name, raw);
    tracing::debug!(
        call_id = %call_id,
        tool = %tool_name,
        outcome = outcome.label(),
        "tool call completed"
    );

    let (input, disposition) = match outcome {
        RepairOutcome::Parsed(input)
        | RepairOutcome::Repaired(input)
        | RepairOutcome::Placeholder(input) => match DiagramToolInput::parse(&tool_name, &input) {
            Ok(_) => (input, Disposition::Client),
            Err(error) => (
                input,
                Disposition::Rejected {
                    message: error.to_string(),
                },
            ),
        },
        RepairOutcome::Dropped(error) => {
            match &error {
                ToolCallError::NoSuchTool(_) => {
                    tracing::warn!(tool = %tool_name, "model called an unknown tool");
                }
                ToolCallError::InvalidToolInput { .. } => {
                    tracing::warn!(tool = %tool_name, "dropping unrepairable tool input");
                }
            }
            (
                rejected_input(raw),
                Disposition::Rejected {
                    message: error.to_string(),
                },
            )
        }
    };

    CompletedCall {
        call_id,
        tool_name,
        input,
        disposition,
    }
}

/// Object stand-in for input that never parsed, so history stays valid.
fn rejected_input(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) if is_usable_tool_input(&value) => value,
        _ => json!({ "raw": raw }),
    }
}

fn call_event(call: &CompletedCall) -> UiEvent {
    match &call.disposition {
        Disposition::Client => UiEvent::ToolInputAvailable {
            tool_call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            input: call.input.clone(),
        },
        Disposition::Rejected { message } => UiEvent::ToolInputError {
            tool_call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            input: call.input.clone(),
            error_text: message.clone(),
        },
    }
}

/// Drives up to [`MAX_STEPS`] generation steps and relays their output.
///
/// Emits `start` first and `finish` last on success. On failure nothing
/// terminal is emitted and the error is returned for the caller to report.
pub fn run_turn(
    backend: &dyn ModelBackend,
    plan: TurnPlan,
    cancel: CancelSignal,
    emit: &mut dyn FnMut(UiEvent),
) -> Result<TurnSummary, ChatError> {
    let TurnPlan {
        mut messages,
        options,
        grounding_metadata,
    } = plan;
    let tools = tool_definitions();

    let mut usage = Usage::default();
    let mut text = String::new();
    let mut tool_calls = 0;
    let mut last = StepOutcome::new(FinishReason::Stop);
    let mut steps = 0;

    emit(UiEvent::Start);

    for step in 1..=MAX_STEPS {
        steps = step;
        emit(UiEvent::StartStep);

        let mut relay = StepRelay::default();
        let request = GenerationRequest {
            step,
            messages: messages.clone(),
            tools: tools.clone(),
            options: options.clone(),
        };
        let outcome = backend
            .generate(request, cancel.clone(), &mut |part| relay.on_part(part, emit))
            .map_err(|error| {
                if error != BackendError::Cancelled {
                    tracing::error!(step, %error, "generation step failed");
                }
                ChatError::from(error)
            })?;
        relay.close_blocks(emit);
        emit(UiEvent::FinishStep);

        usage.add(outcome.usage);
        text.push_str(&relay.text);
        tool_calls += relay.calls.len();
        tracing::debug!(
            step,
            finish_reason = outcome.finish_reason.as_str(),
            calls = relay.calls.len(),
            "step finished"
        );

        let follow_up = relay.needs_follow_up(outcome.finish_reason);
        last = outcome;
        if !follow_up {
            break;
        }
        if step == MAX_STEPS {
            tracing::warn!(max_steps = MAX_STEPS, "step budget exhausted; ending turn");
            break;
        }
        messages.extend(relay.follow_up_messages());
    }

    emit(UiEvent::Finish {
        message_metadata: Some(FinishMetadata {
            input_tokens: usage.total_input_tokens(),
            output_tokens: usage.output_tokens,
            finish_reason: last.finish_reason.as_str().to_string(),
            provider_metadata: finish_provider_metadata(last.provider_metadata, grounding_metadata),
        }),
    });

    Ok(TurnSummary {
        text,
        usage,
        finish_reason: last.finish_reason,
        steps,
        tool_calls,
    })
}

/// Step metadata, with research grounding folded in under `google` when the
/// step reported none of its own.
fn finish_provider_metadata(step: Option<Value>, grounding: Option<Value>) -> Option<Value> {
    let Some(grounding) = grounding else {
        return step;
    };
    let mut metadata = step.unwrap_or_else(|| json!({}));
    if let Some(object) = metadata.as_object_mut() {
        let google = object.entry("google").or_insert_with(|| json!({}));
        if let Some(google) = google.as_object_mut() {
            google
                .entry("groundingMetadata")
                .or_insert(grounding);
        }
    }
    Some(metadata)
}
