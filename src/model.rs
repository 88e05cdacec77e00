//! data model shared by the merger, the parser and the coordinator, plus the
//! wire shapes of the `/chat` protocol.
//!
//! side-channel payloads (data points, thoughts, session state) stay as
//! `serde_json::Value`: the client only looks things up by key and passes
//! them through.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// one turn of the conversation as sent to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub content: String,
    pub role: Role,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self { content: content.into(), role: Role::User }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { content: content.into(), role: Role::Assistant }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    #[default]
    Hybrid,
    Vectors,
    Text,
}

/// per-request overrides, serialized under `context.overrides`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatOptions {
    pub use_advanced_flow: bool,
    pub retrieval_mode: RetrievalMode,
    /// how many rows the retriever should return.
    pub top: u32,
    pub temperature: f64,
    #[serde(skip_serializing_if = "template_is_blank")]
    pub prompt_template: Option<String>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            use_advanced_flow: true,
            retrieval_mode: RetrievalMode::Hybrid,
            top: 3,
            temperature: 0.3,
            prompt_template: None,
        }
    }
}

fn template_is_blank(template: &Option<String>) -> bool {
    template.as_deref().is_none_or(str::is_empty)
}

/// a retrieved item (name, brand, price, description, ...). opaque to the
/// parser beyond its key in the data point map.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentRecord(pub Value);

impl DocumentRecord {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// the `name` field, when the service sent one as a string.
    pub fn name(&self) -> Option<&str> {
        self.field("name").and_then(Value::as_str)
    }
}

impl From<Value> for DocumentRecord {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// citation key -> retrieved document.
pub type DataPoints = BTreeMap<String, DocumentRecord>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThoughtStep {
    pub title: String,
    #[serde(default)]
    pub description: Value,
    #[serde(default)]
    pub props: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RagContext {
    #[serde(default)]
    pub data_points: DataPoints,
    #[serde(default)]
    pub followup_questions: Option<Vec<String>>,
    #[serde(default)]
    pub thoughts: Vec<ThoughtStep>,
}

/// a partial `RagContext` carried by a stream fragment. absent (or null)
/// fields leave the accumulated value alone.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextPatch {
    pub data_points: Option<DataPoints>,
    pub followup_questions: Option<Vec<String>>,
    pub thoughts: Option<Vec<ThoughtStep>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Delta {
    pub role: Option<Role>,
    pub content: Option<String>,
}

/// one unit of the streaming response: `{ delta?, context?, sessionState? }`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionFragment {
    pub delta: Option<Delta>,
    pub context: Option<ContextPatch>,
    #[serde(rename = "sessionState")]
    pub session_state: Option<Value>,
}

impl CompletionFragment {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            delta: Some(Delta { role: None, content: Some(text.into()) }),
            ..Default::default()
        }
    }

    pub fn role(role: Role) -> Self {
        Self {
            delta: Some(Delta { role: Some(role), content: None }),
            ..Default::default()
        }
    }

    pub fn context(patch: ContextPatch) -> Self {
        Self { context: Some(patch), ..Default::default() }
    }

    pub fn delta_role(&self) -> Option<Role> {
        self.delta.as_ref().and_then(|d| d.role)
    }

    pub fn delta_content(&self) -> Option<&str> {
        self.delta.as_ref().and_then(|d| d.content.as_deref())
    }

    /// fragments that grow the visible answer; only these trigger a publish.
    pub fn is_content_bearing(&self) -> bool {
        self.delta_content().is_some_and(|c| !c.is_empty())
    }
}

/// the answer assembled so far for one exchange.
///
/// never mutated after it is handed out: the merger builds a fresh value per
/// fragment and the coordinator publishes it behind a new `Arc`, so
/// `Arc::ptr_eq` tells a consumer whether anything changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccumulatedCompletion {
    pub role: Role,
    pub content: String,
    pub context: RagContext,
    #[serde(rename = "sessionState")]
    pub session_state: Option<Value>,
}

impl Default for AccumulatedCompletion {
    fn default() -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            context: RagContext::default(),
            session_state: None,
        }
    }
}

/// identifies one exchange; the coordinator discards work for any id that is
/// no longer the active one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeId(pub u64);

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeStatus {
    Pending,
    Streaming,
    Complete,
    Failed,
    /// a newer question (or a clear) took over while this one was in flight.
    Superseded,
}

impl ExchangeStatus {
    pub fn is_in_flight(self) -> bool {
        matches!(self, ExchangeStatus::Pending | ExchangeStatus::Streaming)
    }
}

/// one user turn and the answer it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub id: ExchangeId,
    pub question: String,
    pub answer: Arc<AccumulatedCompletion>,
    pub status: ExchangeStatus,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RequestContext {
    pub overrides: ChatOptions,
}

/// body posted to `/chat` and `/chat/stream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub context: RequestContext,
    #[serde(rename = "sessionState")]
    pub session_state: Option<Value>,
}

impl ChatRequest {
    /// full prior turns, then the new question. the session state rides along
    /// from the most recent exchange.
    pub fn for_question(question: &str, history: &[Exchange], options: &ChatOptions) -> Self {
        let mut messages = Vec::with_capacity(history.len() * 2 + 1);
        for exchange in history {
            messages.push(Message::user(exchange.question.clone()));
            messages.push(Message::assistant(exchange.answer.content.clone()));
        }
        messages.push(Message::user(question));

        Self {
            messages,
            context: RequestContext { overrides: options.clone() },
            session_state: history.last().and_then(|e| e.answer.session_state.clone()),
        }
    }
}

/// non-streaming answer: `{ message, context, sessionState }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub message: Message,
    #[serde(default)]
    pub context: RagContext,
    #[serde(default, rename = "sessionState")]
    pub session_state: Option<Value>,
}

impl From<ChatResponse> for AccumulatedCompletion {
    fn from(resp: ChatResponse) -> Self {
        Self {
            role: resp.message.role,
            content: resp.message.content,
            context: resp.context,
            session_state: resp.session_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn done(question: &str, answer: &str, state: Option<Value>) -> Exchange {
        Exchange {
            id: ExchangeId(1),
            question: question.into(),
            answer: Arc::new(AccumulatedCompletion {
                content: answer.into(),
                session_state: state,
                ..Default::default()
            }),
            status: ExchangeStatus::Complete,
        }
    }

    #[test]
    fn request_carries_history_overrides_and_session_state() {
        let history = vec![
            done("first?", "one", None),
            done("second?", "two", Some(json!({"turn": 2}))),
        ];
        let req = ChatRequest::for_question("third?", &history, &ChatOptions::default());

        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({
                "messages": [
                    {"content": "first?", "role": "user"},
                    {"content": "one", "role": "assistant"},
                    {"content": "second?", "role": "user"},
                    {"content": "two", "role": "assistant"},
                    {"content": "third?", "role": "user"},
                ],
                "context": {
                    "overrides": {
                        "use_advanced_flow": true,
                        "retrieval_mode": "hybrid",
                        "top": 3,
                        "temperature": 0.3,
                    },
                },
                "sessionState": {"turn": 2},
            })
        );
    }

    #[test]
    fn blank_prompt_template_is_omitted() {
        let mut options = ChatOptions { prompt_template: Some(String::new()), ..Default::default() };
        let v = serde_json::to_value(&options).unwrap();
        assert!(v.get("prompt_template").is_none());

        options.prompt_template = Some("answer briefly".into());
        let v = serde_json::to_value(&options).unwrap();
        assert_eq!(v["prompt_template"], json!("answer briefly"));
    }

    #[test]
    fn first_request_has_null_session_state() {
        let req = ChatRequest::for_question("hi", &[], &ChatOptions::default());
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["sessionState"], Value::Null);
        assert_eq!(req.messages, vec![Message::user("hi")]);
    }

    #[test]
    fn fragment_decodes_wire_shape() {
        let f: CompletionFragment = serde_json::from_value(json!({
            "delta": {"role": "assistant", "content": "The "},
            "context": {"data_points": {"1": {"name": "TrailRunner"}}},
            "sessionState": null,
        }))
        .unwrap();
        assert_eq!(f.delta_role(), Some(Role::Assistant));
        assert_eq!(f.delta_content(), Some("The "));
        let dp = f.context.unwrap().data_points.unwrap();
        assert_eq!(dp["1"].name(), Some("TrailRunner"));
        assert!(f.session_state.is_none());
    }

    #[test]
    fn response_converts_into_completion() {
        let resp: ChatResponse = serde_json::from_value(json!({
            "message": {"content": "Try [7].", "role": "assistant"},
            "context": {
                "data_points": {"7": {"name": "Summit Pack", "price": 89.5}},
                "thoughts": [{"title": "Search query", "description": "packs"}],
                "followup_questions": null,
            },
            "sessionState": "abc",
        }))
        .unwrap();
        let completion = AccumulatedCompletion::from(resp);
        assert_eq!(completion.content, "Try [7].");
        assert_eq!(completion.context.thoughts[0].title, "Search query");
        assert_eq!(completion.context.data_points["7"].field("price"), Some(&json!(89.5)));
        assert_eq!(completion.session_state, Some(json!("abc")));
    }
}
