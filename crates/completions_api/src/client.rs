use std::future::Future;
use std::sync::{atomic::AtomicBool, atomic::Ordering, Arc};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, RequestBuilder, Response, StatusCode};

use crate::config::CompletionsApiConfig;
use crate::error::{has_rate_limit_message, parse_error_message, CompletionsApiError};
use crate::events::{CompletionFinishReason, CompletionStreamEvent};
use crate::grounding::{GroundedSearchRequest, GroundedSearchResponse};
use crate::headers::{build_headers, AuthScheme};
use crate::payload::{ChatCompletionRequest, StreamOptions};
use crate::retry::{is_retryable_http_error, retry_delay, MAX_RETRIES};
use crate::sse::SseStreamParser;
use crate::url::{normalize_completions_url, normalize_generate_content_url};

/// Optional cancellation signal shared across request and stream loops.
pub type CancellationSignal = Arc<AtomicBool>;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug)]
pub struct CompletionsApiClient {
    http: Client,
    config: CompletionsApiConfig,
}

#[derive(Debug, Clone)]
pub struct StreamResult {
    pub events: Vec<CompletionStreamEvent>,
    pub finish_reason: Option<CompletionFinishReason>,
}

impl CompletionsApiClient {
    pub fn new(config: CompletionsApiConfig) -> Result<Self, CompletionsApiError> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().map_err(CompletionsApiError::from)?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &CompletionsApiConfig {
        &self.config
    }

    pub fn normalized_endpoint(&self) -> String {
        normalize_completions_url(&self.config.base_url)
    }

    pub fn build_headers(
        &self,
        scheme: AuthScheme,
        streaming: bool,
    ) -> Result<HeaderMap, CompletionsApiError> {
        let headers = build_headers(&self.config, scheme, streaming)?;
        let mut out = HeaderMap::new();
        for (key, value) in headers {
            out.insert(
                HeaderName::from_bytes(key.as_bytes()).map_err(|_| {
                    CompletionsApiError::InvalidHeader(format!("invalid header key: {key}"))
                })?,
                HeaderValue::from_str(&value).map_err(|_| {
                    CompletionsApiError::InvalidHeader(format!("invalid header value for {key}"))
                })?,
            );
        }
        Ok(out)
    }

    pub fn build_request(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<RequestBuilder, CompletionsApiError> {
        validate_request_payload_shape(request)?;

        let headers = self.build_headers(AuthScheme::Bearer, true)?;
        let payload = request_with_transport_defaults(request);
        Ok(self
            .http
            .post(self.normalized_endpoint())
            .headers(headers)
            .json(&payload))
    }

    pub async fn send_with_retry(
        &self,
        request: &ChatCompletionRequest,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<Response, CompletionsApiError> {
        self.send_builder_with_retry(|| self.build_request(request), cancellation)
            .await
    }

    async fn send_builder_with_retry<B>(
        &self,
        build: B,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<Response, CompletionsApiError>
    where
        B: Fn() -> Result<RequestBuilder, CompletionsApiError>,
    {
        let mut last_status: Option<StatusCode> = None;
        let mut last_error = None;

        for attempt in 0..=MAX_RETRIES {
            if is_cancelled(cancellation) {
                return Err(CompletionsApiError::Cancelled);
            }

            let response = build()?.send();
            let response = await_or_cancel(response, cancellation)
                .await?
                .map_err(CompletionsApiError::from);

            match response {
                Ok(response) => {
                    if response.status().is_success() {
                        return Ok(response);
                    }

                    let status = response.status();
                    last_status = Some(status);
                    let body = await_or_cancel(response.text(), cancellation)
                        .await?
                        .unwrap_or_default();
                    let message = parse_error_message(status, &body);
                    last_error = Some(message.clone());

                    let retryable = is_retryable_http_error(status.as_u16(), &body)
                        && !is_quota_exhausted(&body);
                    if attempt < MAX_RETRIES && retryable {
                        tracing::debug!(
                            status = status.as_u16(),
                            attempt,
                            rate_limited = has_rate_limit_message(&message),
                            "retrying completions request"
                        );
                        await_or_cancel(tokio::time::sleep(retry_delay(attempt)), cancellation)
                            .await?;
                        continue;
                    }

                    return Err(CompletionsApiError::Status {
                        status,
                        message,
                        body,
                    });
                }
                Err(error) => {
                    last_error = Some(error.to_string());
                    if attempt < MAX_RETRIES {
                        await_or_cancel(tokio::time::sleep(retry_delay(attempt)), cancellation)
                            .await?;
                        continue;
                    }
                    return Err(CompletionsApiError::RetryExhausted {
                        status: last_status,
                        last_error,
                    });
                }
            }
        }

        Err(CompletionsApiError::RetryExhausted {
            status: last_status,
            last_error,
        })
    }

    /// Stream a chat completion, handing each parsed event to `on_event`.
    ///
    /// Returns the last finish reason seen on the stream.
    pub async fn stream_with_handler<F>(
        &self,
        request: &ChatCompletionRequest,
        cancellation: Option<&CancellationSignal>,
        mut on_event: F,
    ) -> Result<Option<CompletionFinishReason>, CompletionsApiError>
    where
        F: FnMut(CompletionStreamEvent),
    {
        let response = self.send_with_retry(request, cancellation).await?;
        let mut bytes = response.bytes_stream();
        let mut parser = SseStreamParser::default();
        let mut finish_reason = None;

        loop {
            let Some(chunk) = await_or_cancel(bytes.next(), cancellation).await? else {
                break;
            };
            if is_cancelled(cancellation) {
                return Err(CompletionsApiError::Cancelled);
            }
            let chunk = chunk.map_err(CompletionsApiError::from)?;
            for event in parser.feed(&chunk) {
                process_stream_event(event, &mut finish_reason, &mut on_event)?;
            }
        }

        if is_cancelled(cancellation) {
            return Err(CompletionsApiError::Cancelled);
        }

        Ok(finish_reason)
    }

    pub async fn stream(
        &self,
        request: &ChatCompletionRequest,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<StreamResult, CompletionsApiError> {
        let mut events = Vec::new();
        let finish_reason = self
            .stream_with_handler(request, cancellation, |event| {
                events.push(event);
            })
            .await?;

        Ok(StreamResult {
            events,
            finish_reason,
        })
    }

    /// Run one grounded web search against the native Gemini endpoint.
    pub async fn grounded_search(
        &self,
        request: &GroundedSearchRequest,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<GroundedSearchResponse, CompletionsApiError> {
        if request.model_id.trim().is_empty() {
            return Err(CompletionsApiError::InvalidRequestPayload(
                "'model' must be a non-empty string".to_owned(),
            ));
        }

        let endpoint = normalize_generate_content_url(
            self.config.search_base_url.as_deref(),
            &request.model_id,
        );
        let body = request.to_body();
        let response = self
            .send_builder_with_retry(
                || {
                    let headers = self.build_headers(AuthScheme::GoogApiKey, false)?;
                    Ok(self.http.post(&endpoint).headers(headers).json(&body))
                },
                cancellation,
            )
            .await?;

        let text = await_or_cancel(response.text(), cancellation)
            .await?
            .map_err(CompletionsApiError::from)?;
        GroundedSearchResponse::from_body(&text).map_err(CompletionsApiError::from)
    }
}

fn request_with_transport_defaults(request: &ChatCompletionRequest) -> ChatCompletionRequest {
    let mut payload = request.clone();
    payload.stream = true;
    payload.stream_options = Some(StreamOptions {
        include_usage: true,
    });
    if payload.tools.is_empty() {
        payload.tool_choice = None;
    } else if payload.tool_choice.is_none() {
        payload.tool_choice = Some("auto".to_owned());
    }
    payload
}

fn validate_request_payload_shape(
    request: &ChatCompletionRequest,
) -> Result<(), CompletionsApiError> {
    if request.model.trim().is_empty() {
        return Err(CompletionsApiError::InvalidRequestPayload(
            "'model' must be a non-empty string".to_owned(),
        ));
    }
    if request.messages.is_empty() {
        return Err(CompletionsApiError::InvalidRequestPayload(
            "'messages' must contain at least one message".to_owned(),
        ));
    }
    if let Some(position) = request.messages.iter().position(|message| !message.is_object()) {
        return Err(CompletionsApiError::InvalidRequestPayload(format!(
            "'messages[{position}]' must be a JSON object"
        )));
    }
    Ok(())
}

fn process_stream_event<F>(
    event: CompletionStreamEvent,
    finish_reason: &mut Option<CompletionFinishReason>,
    on_event: &mut F,
) -> Result<(), CompletionsApiError>
where
    F: FnMut(CompletionStreamEvent),
{
    if let CompletionStreamEvent::Error { code, message } = &event {
        return Err(CompletionsApiError::StreamFailed {
            code: code.clone(),
            message: message
                .clone()
                .or_else(|| code.clone())
                .unwrap_or_else(|| "completion stream failed".to_owned()),
        });
    }

    if let CompletionStreamEvent::Finished {
        reason: Some(reason),
    } = &event
    {
        *finish_reason = Some(*reason);
    }

    on_event(event);
    Ok(())
}

fn is_cancelled(cancel: Option<&CancellationSignal>) -> bool {
    cancel.is_some_and(|token| token.load(Ordering::Acquire))
}

fn is_quota_exhausted(body: &str) -> bool {
    body.contains("insufficient_quota")
}

async fn await_or_cancel<F>(
    future: F,
    cancellation: Option<&CancellationSignal>,
) -> Result<F::Output, CompletionsApiError>
where
    F: Future,
{
    if cancellation.is_none() {
        return Ok(future.await);
    }

    let mut future = Box::pin(future);

    loop {
        if is_cancelled(cancellation) {
            return Err(CompletionsApiError::Cancelled);
        }

        if let Ok(output) = tokio::time::timeout(CANCEL_POLL_INTERVAL, &mut future).await {
            if is_cancelled(cancellation) {
                return Err(CompletionsApiError::Cancelled);
            }
            return Ok(output);
        }
    }
}
