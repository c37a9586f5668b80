//! Axum routes for the chat and prompt-enhancement endpoints.
//!
//! A chat turn runs on a blocking worker. The handler waits for the first
//! content event before committing to a `200` event stream; a failure before
//! that point is answered with a JSON error and its status code, a failure
//! after it becomes an `error` event followed by `[DONE]`.

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use diagram_provider::CancelSignal;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};

use crate::error::{ChatError, EnhanceError};
use crate::mode::search_intent_from_header;
use crate::resolver::ClientOverrides;
use crate::service::{ChatService, PreparedTurn, TurnHeaders, TurnStart};
use crate::stream::{UiEvent, DONE_SENTINEL, STREAM_PROTOCOL_HEADER, STREAM_PROTOCOL_VERSION};

pub const CHAT_ROUTE: &str = "/api/chat";
pub const ENHANCE_ROUTE: &str = "/api/enhance-prompt";

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
/// Room for five base64 attachments at the per-file cap plus history.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Messages from the generation worker to the response stream.
enum TurnMessage {
    Event(UiEvent),
    Failed(ChatError),
}

pub fn router(service: Arc<ChatService>) -> Router {
    Router::new()
        .route(CHAT_ROUTE, post(chat))
        .route(ENHANCE_ROUTE, post(enhance_prompt))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(service)
}

/// Serves until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    service: Arc<ChatService>,
    shutdown: F,
) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn chat(
    State(service): State<Arc<ChatService>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let development = service.config().development;

    match service.prepare(turn_headers(&headers), &body) {
        Ok(TurnStart::Cached(events)) => {
            let frames = events
                .iter()
                .map(sse_event)
                .chain(std::iter::once(done_event()))
                .collect::<Vec<_>>();
            event_stream(tokio_stream::iter(frames))
        }
        Ok(TurnStart::Generate(turn)) => generate(service, *turn).await,
        Err(error) => {
            tracing::warn!(status = %error.status(), %error, "chat request rejected");
            error.into_response_with(development)
        }
    }
}

async fn generate(service: Arc<ChatService>, turn: PreparedTurn) -> Response {
    let development = service.config().development;
    let max_duration = service.config().max_duration;
    let cancel: CancelSignal = Arc::new(AtomicBool::new(false));
    let (sender, mut receiver) = mpsc::unbounded_channel();
    tracing::info!(
        provider = turn.selection().provider.as_str(),
        model = %turn.selection().model_id,
        "starting chat turn"
    );

    let worker = spawn_worker(
        Arc::clone(&service),
        turn,
        Arc::clone(&cancel),
        sender.clone(),
    );
    tokio::spawn(watch_turn(worker, sender, Arc::clone(&cancel), max_duration));

    let mut committed = Vec::new();
    loop {
        match receiver.recv().await {
            Some(TurnMessage::Event(event)) => {
                let content = event.is_content();
                committed.push(event);
                if content {
                    break;
                }
            }
            Some(TurnMessage::Failed(error)) => {
                tracing::error!(status = %error.status(), %error, "chat turn failed");
                return error.into_response_with(development);
            }
            None => break,
        }
    }

    let (frames, frame_receiver) = mpsc::unbounded_channel();
    tokio::spawn(relay_turn(committed, receiver, frames, cancel));
    event_stream(UnboundedReceiverStream::new(frame_receiver))
}

fn spawn_worker(
    service: Arc<ChatService>,
    turn: PreparedTurn,
    cancel: CancelSignal,
    sender: UnboundedSender<TurnMessage>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            service.execute(turn, cancel, &mut |event| {
                let _ = sender.send(TurnMessage::Event(event));
            })
        }));

        let failure = match outcome {
            Ok(Ok(_)) => return,
            Ok(Err(error)) => error,
            Err(_) => ChatError::Internal("generation worker panicked".to_string()),
        };
        let _ = sender.send(TurnMessage::Failed(failure));
    })
}

/// Cancels the worker when the client goes away or the turn runs too long.
async fn watch_turn(
    worker: JoinHandle<()>,
    sender: UnboundedSender<TurnMessage>,
    cancel: CancelSignal,
    max_duration: Duration,
) {
    tokio::select! {
        joined = worker => {
            if let Err(error) = joined {
                tracing::error!(%error, "generation worker did not complete");
            }
        }
        () = sender.closed() => {
            tracing::info!("client disconnected, cancelling turn");
            cancel.store(true, Ordering::SeqCst);
        }
        () = tokio::time::sleep(max_duration) => {
            tracing::warn!(seconds = max_duration.as_secs(), "turn exceeded maximum duration");
            // Queued before cancelling so it precedes the worker's own failure.
            let _ = sender.send(TurnMessage::Failed(ChatError::Timeout(max_duration.as_secs())));
            cancel.store(true, Ordering::SeqCst);
        }
    }
}

/// Forwards worker output as SSE frames until the worker is done or fails.
/// Raises `cancel` as soon as the response stream is dropped, even while the
/// worker is silent.
async fn relay_turn(
    committed: Vec<UiEvent>,
    mut receiver: UnboundedReceiver<TurnMessage>,
    frames: UnboundedSender<Event>,
    cancel: CancelSignal,
) {
    for event in &committed {
        if frames.send(sse_event(event)).is_err() {
            abandon_turn(&cancel);
            return;
        }
    }

    loop {
        let message = tokio::select! {
            message = receiver.recv() => message,
            () = frames.closed() => {
                abandon_turn(&cancel);
                return;
            }
        };
        let Some(message) = message else {
            break;
        };
        match message {
            TurnMessage::Event(event) => {
                if frames.send(sse_event(&event)).is_err() {
                    abandon_turn(&cancel);
                    return;
                }
            }
            TurnMessage::Failed(error) => {
                tracing::error!(%error, "chat turn failed after streaming started");
                let event = UiEvent::Error {
                    error_text: error.public_message(),
                };
                let _ = frames.send(sse_event(&event));
                break;
            }
        }
    }
    let _ = frames.send(done_event());
}

fn abandon_turn(cancel: &CancelSignal) {
    tracing::info!("client disconnected, cancelling turn");
    cancel.store(true, Ordering::SeqCst);
}

fn event_stream<S>(frames: S) -> Response
where
    S: Stream<Item = Event> + Send + 'static,
{
    let stream = frames.map(Ok::<_, Infallible>);
    (
        [(STREAM_PROTOCOL_HEADER, STREAM_PROTOCOL_VERSION)],
        Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)),
    )
        .into_response()
}

fn sse_event(event: &UiEvent) -> Event {
    Event::default().data(event.to_json())
}

fn done_event() -> Event {
    Event::default().data(DONE_SENTINEL)
}

async fn enhance_prompt(
    State(service): State<Arc<ChatService>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, EnhanceError> {
    let access_code = header_value(&headers, "x-access-code");
    let worker =
        tokio::task::spawn_blocking(move || service.enhance(access_code.as_deref(), &body));

    match worker.await {
        Ok(Ok(response)) => Ok(Json(response).into_response()),
        Ok(Err(error)) => Err(error),
        Err(error) => {
            tracing::error!(%error, "prompt enhancement worker did not complete");
            Err(EnhanceError::Failed)
        }
    }
}

fn turn_headers(headers: &HeaderMap) -> TurnHeaders {
    TurnHeaders {
        access_code: header_value(headers, "x-access-code"),
        overrides: ClientOverrides {
            provider: header_value(headers, "x-ai-provider"),
            base_url: header_value(headers, "x-ai-base-url"),
            api_key: header_value(headers, "x-ai-api-key"),
            model_id: header_value(headers, "x-ai-model"),
        },
        minimal_style: header_value(headers, "x-minimal-style").as_deref() == Some("true"),
        search_intent: search_intent_from_header(
            header_value(headers, "x-search-enabled").as_deref(),
        ),
        forwarded_for: header_value(headers, "x-forwarded-for"),
    }
}

/// Trimmed header value; blank and non-ASCII values count as absent.
fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
