//! LLM Gateway Actor - single owner of language-model I/O.
//!
//! This actor handles:
//! - OpenAI-compatible chat completions (bearer auth, SSE streaming)
//! - Ollama chat completions (newline-delimited JSON streaming)
//! - Per-call timeouts and cooperative cancellation
//!
//! Model calls are treated exactly like DB calls: typed request and
//! response, bounded by a timeout, never retried here (the retry budget
//! belongs to the correction loop).

use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;

use crate::protocol::Message;
use crate::settings::{LlmProvider, LlmSettings};

#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("language model call timed out")]
    Timeout,
    #[error("language model unavailable: {0}")]
    Unavailable(String),
    #[error("language model error: {0}")]
    Api(String),
    #[error("call cancelled")]
    Cancelled,
}

impl From<LlmError> for crate::error::EngineError {
    fn from(err: LlmError) -> Self {
        use crate::error::EngineError;
        match err {
            LlmError::Timeout => EngineError::Timeout { component: "llm" },
            LlmError::Unavailable(msg) | LlmError::Api(msg) => EngineError::Upstream(msg),
            LlmError::Cancelled => EngineError::Upstream("request cancelled".to_string()),
        }
    }
}

/// A chat completion request. `temperature`/`max_tokens` default from
/// settings when not set.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }
}

/// Messages for the LLM Gateway Actor
pub enum LlmMsg {
    /// Whole-response completion
    Complete {
        request: CompletionRequest,
        respond_to: oneshot::Sender<Result<String, LlmError>>,
    },
    /// Streaming completion: tokens forwarded as they arrive, full text
    /// returned at the end
    CompleteStreaming {
        request: CompletionRequest,
        token_tx: mpsc::UnboundedSender<String>,
        cancel_rx: watch::Receiver<bool>,
        respond_to: oneshot::Sender<Result<String, LlmError>>,
    },
}

/// Cloneable handle used by the pipeline (and by test doubles, which
/// simply service the channel with scripted replies).
#[derive(Clone)]
pub struct LlmHandle {
    tx: mpsc::Sender<LlmMsg>,
}

impl LlmHandle {
    pub fn from_channel(tx: mpsc::Sender<LlmMsg>) -> Self {
        Self { tx }
    }

    /// Spawn the gateway actor and return its handle.
    pub fn spawn(settings: LlmSettings) -> Self {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(LlmGatewayActor::new(rx, settings).run());
        Self { tx }
    }

    pub async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(LlmMsg::Complete {
                request,
                respond_to: tx,
            })
            .await
            .map_err(|_| LlmError::Unavailable("gateway actor stopped".to_string()))?;
        rx.await
            .map_err(|_| LlmError::Unavailable("gateway actor dropped the reply".to_string()))?
    }

    pub async fn complete_streaming(
        &self,
        request: CompletionRequest,
        token_tx: mpsc::UnboundedSender<String>,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<String, LlmError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(LlmMsg::CompleteStreaming {
                request,
                token_tx,
                cancel_rx,
                respond_to: tx,
            })
            .await
            .map_err(|_| LlmError::Unavailable("gateway actor stopped".to_string()))?;
        rx.await
            .map_err(|_| LlmError::Unavailable("gateway actor dropped the reply".to_string()))?
    }
}

/// Stream one completion, forwarding tokens to the emitter on the given
/// channel as they arrive. Returns the full text.
pub async fn stream_to_emitter(
    llm: &LlmHandle,
    request: CompletionRequest,
    channel: crate::protocol::TokenChannel,
    emitter: &mut crate::protocol::EventEmitter,
    cancel_rx: &watch::Receiver<bool>,
) -> Result<String, LlmError> {
    let (token_tx, mut token_rx) = mpsc::unbounded_channel();
    let fut = llm.complete_streaming(request, token_tx, cancel_rx.clone());
    tokio::pin!(fut);

    let mut tokens_done = false;
    let result = loop {
        tokio::select! {
            biased;
            token = token_rx.recv(), if !tokens_done => {
                match token {
                    Some(token) => emitter.token(channel, token),
                    None => tokens_done = true,
                }
            }
            result = &mut fut => break result,
        }
    };
    while let Ok(token) = token_rx.try_recv() {
        emitter.token(channel, token);
    }
    result
}

/// LLM Gateway Actor
pub struct LlmGatewayActor {
    rx: mpsc::Receiver<LlmMsg>,
    settings: LlmSettings,
    http_client: reqwest::Client,
}

impl LlmGatewayActor {
    pub fn new(rx: mpsc::Receiver<LlmMsg>, settings: LlmSettings) -> Self {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            rx,
            settings,
            http_client,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(provider = %self.settings.provider, "llm gateway started");

        while let Some(msg) = self.rx.recv().await {
            match msg {
                LlmMsg::Complete {
                    request,
                    respond_to,
                } => {
                    let result = self.complete(&request).await;
                    let _ = respond_to.send(result);
                }
                LlmMsg::CompleteStreaming {
                    request,
                    token_tx,
                    cancel_rx,
                    respond_to,
                } => {
                    let result = self.complete_streaming(&request, token_tx, cancel_rx).await;
                    let _ = respond_to.send(result);
                }
            }
        }

        tracing::info!("llm gateway stopped");
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.request_timeout_secs)
    }

    fn messages_json(&self, request: &CompletionRequest) -> Vec<Value> {
        request
            .messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let fut = async {
            match self.settings.provider {
                LlmProvider::OpenAi => self.openai_complete(request, false).await,
                LlmProvider::Ollama => self.ollama_complete(request).await,
            }
        };
        timeout(self.call_timeout(), fut)
            .await
            .map_err(|_| LlmError::Timeout)?
    }

    async fn complete_streaming(
        &self,
        request: &CompletionRequest,
        token_tx: mpsc::UnboundedSender<String>,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<String, LlmError> {
        let fut = async {
            match self.settings.provider {
                LlmProvider::OpenAi => self.openai_stream(request, token_tx, cancel_rx).await,
                LlmProvider::Ollama => self.ollama_stream(request, token_tx, cancel_rx).await,
            }
        };
        timeout(self.call_timeout(), fut)
            .await
            .map_err(|_| LlmError::Timeout)?
    }

    // ========== OpenAI-compatible provider ==========

    fn openai_body(&self, request: &CompletionRequest, stream: bool) -> Value {
        json!({
            "model": self.settings.openai_model,
            "messages": self.messages_json(request),
            "temperature": request.temperature.unwrap_or(self.settings.openai_temperature),
            "max_tokens": request.max_tokens.unwrap_or(self.settings.max_output_tokens),
            "stream": stream,
        })
    }

    async fn openai_send(
        &self,
        request: &CompletionRequest,
        stream: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let url = format!(
            "{}/v1/chat/completions",
            self.settings.openai_base_url.trim_end_matches('/')
        );
        let mut builder = self.http_client.post(&url).json(&self.openai_body(request, stream));
        if let Some(key) = &self.settings.openai_api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| LlmError::Unavailable(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("HTTP {}: {}", status, text)));
        }
        Ok(response)
    }

    async fn openai_complete(
        &self,
        request: &CompletionRequest,
        stream: bool,
    ) -> Result<String, LlmError> {
        let response = self.openai_send(request, stream).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Api(format!("malformed response: {}", e)))?;
        body.pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| LlmError::Api("response carried no content".to_string()))
    }

    async fn openai_stream(
        &self,
        request: &CompletionRequest,
        token_tx: mpsc::UnboundedSender<String>,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Result<String, LlmError> {
        let mut response = self.openai_send(request, true).await?;
        let mut buffer = String::new();
        let mut full_text = String::new();
        // A dropped cancel sender means the caller went away entirely.
        let mut cancel_alive = true;

        'stream_loop: loop {
            tokio::select! {
                changed = cancel_rx.changed(), if cancel_alive => {
                    match changed {
                        Ok(()) if *cancel_rx.borrow() => {
                            tracing::debug!("openai stream cancelled");
                            return Err(LlmError::Cancelled);
                        }
                        Ok(()) => {}
                        Err(_) => cancel_alive = false,
                    }
                }
                chunk_result = response.chunk() => {
                    match chunk_result {
                        Ok(Some(chunk)) => {
                            if let Ok(s) = String::from_utf8(chunk.to_vec()) {
                                buffer.push_str(&s);
                                while let Some(idx) = buffer.find('\n') {
                                    let line = buffer[..idx].trim().to_string();
                                    buffer = buffer[idx + 1..].to_string();
                                    let Some(data) = line.strip_prefix("data: ") else {
                                        continue;
                                    };
                                    if data == "[DONE]" {
                                        break 'stream_loop;
                                    }
                                    if let Ok(json) = serde_json::from_str::<Value>(data) {
                                        if let Some(content) = json
                                            .pointer("/choices/0/delta/content")
                                            .and_then(|v| v.as_str())
                                        {
                                            if !content.is_empty() {
                                                full_text.push_str(content);
                                                let _ = token_tx.send(content.to_string());
                                            }
                                        }
                                    }
                                }
                            }
                        }
                        Ok(None) => break 'stream_loop,
                        Err(e) => return Err(LlmError::Unavailable(e.to_string())),
                    }
                }
            }
        }

        Ok(full_text)
    }

    // ========== Ollama provider ==========

    fn ollama_body(&self, request: &CompletionRequest, stream: bool) -> Value {
        json!({
            "model": self.settings.ollama_model,
            "messages": self.messages_json(request),
            "stream": stream,
            "options": {
                "temperature": request.temperature.unwrap_or(self.settings.openai_temperature),
                "num_predict": request.max_tokens.unwrap_or(self.settings.max_output_tokens),
            },
        })
    }

    async fn ollama_send(
        &self,
        request: &CompletionRequest,
        stream: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let url = format!(
            "{}/api/chat",
            self.settings.ollama_base_url.trim_end_matches('/')
        );
        let response = self
            .http_client
            .post(&url)
            .json(&self.ollama_body(request, stream))
            .send()
            .await
            .map_err(|e| LlmError::Unavailable(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("HTTP {}: {}", status, text)));
        }
        Ok(response)
    }

    async fn ollama_complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let response = self.ollama_send(request, false).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Api(format!("malformed response: {}", e)))?;
        body.pointer("/message/content")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| LlmError::Api("response carried no content".to_string()))
    }

    async fn ollama_stream(
        &self,
        request: &CompletionRequest,
        token_tx: mpsc::UnboundedSender<String>,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Result<String, LlmError> {
        let mut response = self.ollama_send(request, true).await?;
        let mut buffer = String::new();
        let mut full_text = String::new();
        let mut cancel_alive = true;

        'stream_loop: loop {
            tokio::select! {
                changed = cancel_rx.changed(), if cancel_alive => {
                    match changed {
                        Ok(()) if *cancel_rx.borrow() => {
                            tracing::debug!("ollama stream cancelled");
                            return Err(LlmError::Cancelled);
                        }
                        Ok(()) => {}
                        Err(_) => cancel_alive = false,
                    }
                }
                chunk_result = response.chunk() => {
                    match chunk_result {
                        Ok(Some(chunk)) => {
                            if let Ok(s) = String::from_utf8(chunk.to_vec()) {
                                buffer.push_str(&s);
                                while let Some(idx) = buffer.find('\n') {
                                    let line = buffer[..idx].trim().to_string();
                                    buffer = buffer[idx + 1..].to_string();
                                    if line.is_empty() {
                                        continue;
                                    }
                                    let Ok(json) = serde_json::from_str::<Value>(&line) else {
                                        continue;
                                    };
                                    if let Some(content) =
                                        json.pointer("/message/content").and_then(|v| v.as_str())
                                    {
                                        if !content.is_empty() {
                                            full_text.push_str(content);
                                            let _ = token_tx.send(content.to_string());
                                        }
                                    }
                                    if json.get("done").and_then(|v| v.as_bool()) == Some(true) {
                                        break 'stream_loop;
                                    }
                                }
                            }
                        }
                        Ok(None) => break 'stream_loop,
                        Err(e) => return Err(LlmError::Unavailable(e.to_string())),
                    }
                }
            }
        }

        Ok(full_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_reports_stopped_actor() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = LlmHandle::from_channel(tx);
        let err = handle
            .complete(CompletionRequest::new(vec![Message::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_scripted_double_services_handle() {
        // The channel seam is the mock point: a task drains LlmMsg and
        // answers with scripted text, no trait machinery needed.
        let (tx, mut rx) = mpsc::channel(4);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let LlmMsg::Complete { respond_to, .. } = msg {
                    let _ = respond_to.send(Ok("sql".to_string()));
                }
            }
        });
        let handle = LlmHandle::from_channel(tx);
        let reply = handle
            .complete(CompletionRequest::new(vec![Message::user("route me")]))
            .await
            .unwrap();
        assert_eq!(reply, "sql");
    }
}
