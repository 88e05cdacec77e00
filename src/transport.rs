//! the only way to reach the completion service.
//!
//! `HttpTransport` talks to `{base}/chat` (one-shot json) and
//! `{base}/chat/stream` (newline-delimited json fragments). ureq is blocking,
//! so the io runs on tokio's blocking pool and fragments cross back through a
//! flume channel, one line at a time, in arrival order.

use crate::error::ChatError;
use crate::model::{ChatRequest, ChatResponse, CompletionFragment};
use async_trait::async_trait;
use bevy::log::{debug, warn};
use futures_lite::StreamExt;
use futures_lite::stream::Boxed;
use serde_json::Value;
use std::io::{BufRead, BufReader};

/// fragments in the order the service produced them; ends with the response.
pub type FragmentStream = Boxed<Result<CompletionFragment, ChatError>>;

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// non-streaming entry point: one response payload.
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError>;

    /// streaming entry point: fragments until the stream ends.
    async fn stream(&self, request: &ChatRequest) -> Result<FragmentStream, ChatError>;
}

/// decodes one payload of either entry point. an `{ "error": ... }` object
/// becomes `ChatError::Service`.
fn check_error(value: Value) -> Result<Value, ChatError> {
    match value.get("error") {
        Some(Value::String(msg)) => Err(ChatError::Service(msg.clone())),
        Some(other) if !other.is_null() => Err(ChatError::Service(other.to_string())),
        _ => Ok(value),
    }
}

pub fn decode_response(body: &str) -> Result<ChatResponse, ChatError> {
    let value = check_error(serde_json::from_str(body)?)?;
    Ok(serde_json::from_value(value)?)
}

/// one ndjson line. `Ok(None)` for blank lines. json of an unexpected shape
/// is merged as an empty fragment; text that is not json fails.
pub fn decode_fragment_line(line: &str) -> Result<Option<CompletionFragment>, ChatError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let value = check_error(serde_json::from_str(line)?)?;
    match serde_json::from_value(value) {
        Ok(fragment) => Ok(Some(fragment)),
        Err(err) => {
            warn!(target: "bevy_rag_chat", "ignoring malformed fragment: {err}");
            Ok(Some(CompletionFragment::default()))
        }
    }
}

#[derive(Clone)]
pub struct HttpTransport {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            agent: ureq::Agent::new_with_defaults(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn chat_url(&self) -> String {
        format!("{}/chat", self.base_url)
    }

    pub fn stream_url(&self) -> String {
        format!("{}/chat/stream", self.base_url)
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError> {
        let agent = self.agent.clone();
        let url = self.chat_url();
        let request = request.clone();

        let body = tokio::task::spawn_blocking(move || -> Result<String, ChatError> {
            let res = agent
                .post(&url)
                .header("accept", "application/json")
                .send_json(&request)?;
            Ok(res.into_body().read_to_string()?)
        })
        .await
        .map_err(|e| ChatError::Runtime(e.to_string()))??;

        decode_response(&body)
    }

    async fn stream(&self, request: &ChatRequest) -> Result<FragmentStream, ChatError> {
        let agent = self.agent.clone();
        let url = self.stream_url();
        let request = request.clone();
        let (tx, rx) = flume::bounded::<Result<CompletionFragment, ChatError>>(256);

        // the handshake (status line + headers) is awaited here so transport
        // failures surface from `stream()` itself rather than as a first item.
        let (ready_tx, ready_rx) = flume::bounded::<Result<(), ChatError>>(1);

        tokio::task::spawn_blocking(move || {
            let res = match agent
                .post(&url)
                .header("accept", "application/x-ndjson")
                .send_json(&request)
            {
                Ok(res) => res,
                Err(err) => {
                    let _ = ready_tx.send(Err(err.into()));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            let reader = BufReader::new(res.into_body().into_reader());
            for line in reader.lines() {
                let item = match line {
                    Ok(line) => match decode_fragment_line(&line) {
                        Ok(Some(fragment)) => Ok(fragment),
                        Ok(None) => continue,
                        Err(err) => Err(err),
                    },
                    Err(err) => Err(ChatError::from(err)),
                };
                let failed = item.is_err();
                // receiver dropped: the exchange was superseded, stop reading
                if tx.send(item).is_err() || failed {
                    debug!(target: "bevy_rag_chat", "stream reader stopping (failed={failed})");
                    return;
                }
            }
        });

        ready_rx
            .recv_async()
            .await
            .map_err(|_| ChatError::Runtime("stream worker exited before connecting".into()))??;

        Ok(rx.into_stream().boxed())
    }
}
