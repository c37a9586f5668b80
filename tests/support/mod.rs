#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clarify::{
    BackendFactory, CacheTable, ChatError, ChatService, ProviderSelection, ServerConfig,
};
use diagram_provider::{
    BackendError, BackendProfile, CancelSignal, GenerationRequest, ModelBackend, StepOutcome,
    StreamPart,
};
use diagram_provider_mock::MockBackend;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Hands the same backend to every route and counts factory calls.
pub struct SharedFactory {
    backend: Arc<dyn ModelBackend>,
    pub chat_calls: AtomicUsize,
    pub search_calls: AtomicUsize,
}

impl SharedFactory {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            chat_calls: AtomicUsize::new(0),
            search_calls: AtomicUsize::new(0),
        })
    }
}

impl BackendFactory for SharedFactory {
    fn chat_backend(
        &self,
        _selection: &ProviderSelection,
    ) -> Result<Arc<dyn ModelBackend>, ChatError> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&self.backend))
    }

    fn search_backend(
        &self,
        _selection: &ProviderSelection,
    ) -> Result<Arc<dyn ModelBackend>, ChatError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&self.backend))
    }

    fn enhance_backend(&self) -> Result<Arc<dyn ModelBackend>, ChatError> {
        Ok(Arc::clone(&self.backend))
    }
}

/// Optionally emits one text delta, then waits for cancellation.
#[derive(Default)]
pub struct StallingBackend {
    lead: Option<String>,
    observed_cancel: AtomicBool,
}

impl StallingBackend {
    pub fn silent() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn after_delta(text: &str) -> Arc<Self> {
        Arc::new(Self {
            lead: Some(text.to_string()),
            observed_cancel: AtomicBool::new(false),
        })
    }

    /// Whether `generate` returned because its cancel flag was raised.
    pub fn observed_cancel(&self) -> bool {
        self.observed_cancel.load(Ordering::SeqCst)
    }
}

impl ModelBackend for StallingBackend {
    fn profile(&self) -> BackendProfile {
        BackendProfile {
            provider_id: "stall".to_string(),
            model_id: "stall".to_string(),
            supports_prompt_caching: false,
            supports_grounded_search: false,
        }
    }

    fn generate(
        &self,
        _request: GenerationRequest,
        cancel: CancelSignal,
        emit: &mut dyn FnMut(StreamPart),
    ) -> Result<StepOutcome, BackendError> {
        if let Some(text) = &self.lead {
            emit(StreamPart::TextDelta { text: text.clone() });
        }
        while !cancel.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(10));
        }
        self.observed_cancel.store(true, Ordering::SeqCst);
        Err(BackendError::Cancelled)
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub client: reqwest::Client,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    pub async fn start(vars: &[(&str, &str)], factory: Arc<dyn BackendFactory>) -> Self {
        let config = ServerConfig::from_vars(vars.iter().copied()).expect("test config is valid");
        let service = Arc::new(ChatService::new(
            Arc::new(config),
            CacheTable::built_in(),
            factory,
        ));
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("local TCP listener should bind");
        let addr = listener.local_addr().expect("resolved local listener address");
        let (shutdown, signal) = oneshot::channel::<()>();

        let handle = tokio::spawn(clarify::server::serve(listener, service, async move {
            let _ = signal.await;
        }));

        Self {
            addr,
            client: reqwest::Client::new(),
            shutdown: Some(shutdown),
            handle,
        }
    }

    pub async fn with_mock(vars: &[(&str, &str)], backend: Arc<MockBackend>) -> Self {
        Self::start(vars, SharedFactory::new(backend)).await
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub async fn post_chat(&self, headers: &[(&str, &str)], body: &Value) -> reqwest::Response {
        let mut request = self.client.post(self.url("/api/chat")).json(body);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        request.send().await.expect("chat request completes")
    }

    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), &mut self.handle).await;
    }
}

pub const MOCK_VARS: [(&str, &str); 2] = [("AI_PROVIDER", "mock"), ("AI_MODEL", "mock")];

pub fn user_turn(text: &str) -> Value {
    json!({
        "messages": [{
            "id": "m1",
            "role": "user",
            "parts": [{"type": "text", "text": text}]
        }],
        "xml": ""
    })
}

pub fn turn_with_files(text: &str, urls: &[String]) -> Value {
    let mut parts = vec![json!({"type": "text", "text": text})];
    parts.extend(urls.iter().map(|url| {
        json!({"type": "file", "url": url, "mediaType": "image/png", "filename": "shot.png"})
    }));
    json!({
        "messages": [{"id": "m1", "role": "user", "parts": parts}],
        "xml": ""
    })
}

/// Splits an SSE body into its `data:` payloads.
pub fn sse_payloads(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.trim_start().to_string())
        .collect()
}

/// Event objects with the trailing `[DONE]` removed.
pub fn sse_events(body: &str) -> Vec<Value> {
    sse_payloads(body)
        .into_iter()
        .filter(|payload| payload != "[DONE]")
        .map(|payload| serde_json::from_str(&payload).expect("SSE payload is JSON"))
        .collect()
}

pub fn event_types(events: &[Value]) -> Vec<String> {
    events
        .iter()
        .map(|event| event["type"].as_str().unwrap_or_default().to_string())
        .collect()
}
