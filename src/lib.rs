//! bevy_rag_chat: a bevy client for a retrieval-augmented chat service.
//!
//! - `merge` folds streamed fragments into one answer snapshot.
//! - `citation` turns answer text + data points into sanitized html with
//!   clickable `[key]` references and an ordered citation list.
//! - `coordinator` runs one exchange at a time, throttles visible updates and
//!   drops work for exchanges a newer question (or a clear) superseded.
//! - the plugin below wires all of that into bevy events. it never blocks the
//!   main thread: requests run on a tiny tokio runtime and report back through
//!   a bounded inbox that is drained once per frame.
//!
//! wire protocol: POST `{base}/chat` (one json answer) or `{base}/chat/stream`
//! (ndjson fragments `{ delta, context, sessionState }`).

pub mod citation;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod merge;
pub mod model;
pub mod transport;

pub use citation::{ParsedAnswer, parse_answer};
pub use config::ChatClientConfig;
pub use coordinator::{ExchangeObserver, StreamCoordinator, Throttle};
pub use error::ChatError;
pub use merge::{merge, merge_all};
pub use model::{
    AccumulatedCompletion, ChatOptions, CompletionFragment, ContextPatch, DataPoints, DocumentRecord, Exchange,
    ExchangeId, ExchangeStatus, Message, RagContext, RetrievalMode, Role, ThoughtStep,
};
pub use transport::{ChatTransport, FragmentStream, HttpTransport};

use bevy::prelude::*;
use flume::{Receiver, Sender, TryRecvError};
use std::collections::HashMap;
use std::sync::Arc;

/// the shared coordinator. insert before (or after) adding the plugin.
#[derive(Resource, Clone)]
pub struct ChatBackend {
    pub coordinator: StreamCoordinator,
}

impl ChatBackend {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self { coordinator: StreamCoordinator::new(transport) }
    }

    /// http transport + throttle from config.
    pub fn http(config: &ChatClientConfig) -> Self {
        let transport = Arc::new(HttpTransport::new(config.base_url.clone()));
        Self {
            coordinator: StreamCoordinator::new(transport).with_throttle(config.throttle()),
        }
    }
}

/// tiny tokio runtime that drives requests (and the throttle timer) so the
/// bevy schedule never waits on the network.
#[derive(Resource, Clone)]
pub struct TokioRt(pub Arc<tokio::runtime::Runtime>);

impl Default for TokioRt {
    fn default() -> Self {
        info!(target: "bevy_rag_chat", "RagChatPlugin: initializing Tokio multi-thread runtime");
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("tokio runtime");
        Self(Arc::new(rt))
    }
}

/// system ordering so uis can run after we emit events
#[derive(SystemSet, Debug, Hash, PartialEq, Eq, Clone)]
pub enum RagChatSet {
    /// inbox is drained and events are emitted here (in `Update`)
    Drain,
}

/// attach to an entity you want to chat on.
#[derive(Component, Clone, Debug)]
#[require(Conversation)]
pub struct ChatSession {
    /// streaming (`/chat/stream`) or one-shot (`/chat`).
    pub stream: bool,
    pub options: ChatOptions,
}

impl Default for ChatSession {
    fn default() -> Self {
        Self { stream: true, options: ChatOptions::default() }
    }
}

impl ChatSession {
    pub fn from_config(config: &ChatClientConfig) -> Self {
        Self { stream: config.stream, options: config.options.clone() }
    }
}

/// the exchange currently being answered for a session.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub id: ExchangeId,
    pub question: String,
    pub status: ExchangeStatus,
    pub latest: Option<Arc<AccumulatedCompletion>>,
}

impl InFlight {
    /// partial parse of the newest snapshot, if any arrived yet.
    pub fn parsed(&self) -> Option<ParsedAnswer> {
        self.latest
            .as_ref()
            .map(|c| parse_answer(&c.content, &c.context.data_points, true))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub question: String,
    pub error: String,
}

/// completed turns of one chat plus whatever is in flight.
#[derive(Component, Clone, Debug, Default)]
pub struct Conversation {
    exchanges: Vec<Exchange>,
    in_flight: Option<InFlight>,
    last_failure: Option<Failure>,
}

impl Conversation {
    pub fn exchanges(&self) -> &[Exchange] {
        &self.exchanges
    }

    pub fn in_flight(&self) -> Option<&InFlight> {
        self.in_flight.as_ref()
    }

    pub fn last_failure(&self) -> Option<&Failure> {
        self.last_failure.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.in_flight.is_none()
    }

    fn start(&mut self, id: ExchangeId, question: String) {
        self.last_failure = None;
        self.in_flight = Some(InFlight { id, question, status: ExchangeStatus::Pending, latest: None });
    }

    fn in_flight_mut(&mut self, id: ExchangeId) -> Option<&mut InFlight> {
        self.in_flight.as_mut().filter(|f| f.id == id)
    }

    fn complete(&mut self, exchange: Exchange) {
        self.in_flight = None;
        self.exchanges.push(exchange);
    }

    fn fail(&mut self, question: String, error: String) {
        self.in_flight = None;
        self.last_failure = Some(Failure { question, error });
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// insert this component to ask a question on the session entity.
#[derive(Component, Clone, Debug)]
pub struct QuestionRequest {
    pub question: String,
}

/// insert this component to clear the session's chat.
#[derive(Component, Clone, Copy, Debug, Default)]
pub struct ClearRequest;

/// helper to enqueue a question on a session entity.
pub fn send_question(commands: &mut Commands, target: Entity, text: impl Into<String>) {
    let question = text.into();
    info!(target: "bevy_rag_chat", "send_question -> '{}' (len={})", question, question.len());
    commands.entity(target).insert(QuestionRequest { question });
}

/// helper to clear a session: drops history and supersedes anything in flight.
pub fn clear_chat(commands: &mut Commands, target: Entity) {
    commands.entity(target).insert(ClearRequest);
}

/// re-asks the question that last failed. returns false if nothing failed.
pub fn retry_last(commands: &mut Commands, target: Entity, conversation: &Conversation) -> bool {
    match conversation.last_failure() {
        Some(failure) => {
            send_question(commands, target, failure.question.clone());
            true
        }
        None => false,
    }
}

/// the citation the user opened, if any. cleared whenever a question is
/// asked or the chat is cleared.
#[derive(Resource, Debug, Clone, Default, PartialEq)]
pub struct ActiveCitation(pub Option<SelectedCitation>);

#[derive(Debug, Clone, PartialEq)]
pub struct SelectedCitation {
    pub entity: Entity,
    /// position of the answer in the conversation.
    pub answer_index: usize,
    pub key: String,
}

/// events emitted by the plugin.
#[derive(Event, Debug, Clone)]
pub struct ExchangeStatusEvt {
    pub entity: Entity,
    pub exchange: ExchangeId,
    pub status: ExchangeStatus,
}
#[derive(Event, Debug, Clone)]
pub struct AnswerSnapshotEvt {
    pub entity: Entity,
    pub exchange: ExchangeId,
    /// newest snapshot this frame; a new `Arc` per publish.
    pub completion: Arc<AccumulatedCompletion>,
}
#[derive(Event, Debug, Clone)]
pub struct ExchangeCompletedEvt {
    pub entity: Entity,
    pub exchange: Exchange,
}
#[derive(Event, Debug, Clone)]
pub struct ExchangeFailedEvt {
    pub entity: Entity,
    pub exchange: ExchangeId,
    pub question: String,
    /// shown to the user as is.
    pub error: String,
}
/// send this from the ui when a citation anchor is clicked.
#[derive(Event, Debug, Clone)]
pub struct CitationClickedEvt {
    pub entity: Entity,
    pub answer_index: usize,
    pub key: String,
}

/// cross-thread inbox; workers send, the main thread drains.
/// bounded so a stalled frame applies backpressure instead of growing.
#[derive(Resource, Clone)]
struct StreamInbox {
    tx: Sender<InboxMsg>,
    rx: Receiver<InboxMsg>,
}

impl Default for StreamInbox {
    fn default() -> Self {
        let (tx, rx) = flume::bounded(2048);
        Self { tx, rx }
    }
}

#[derive(Debug)]
enum InboxMsg {
    Status { entity: Entity, exchange: ExchangeId, status: ExchangeStatus },
    Snapshot { entity: Entity, exchange: ExchangeId, completion: Arc<AccumulatedCompletion> },
    Done { entity: Entity, exchange: Exchange },
    Err { entity: Entity, exchange: ExchangeId, question: String, error: String },
}

impl InboxMsg {
    fn exchange_id(&self) -> ExchangeId {
        match self {
            InboxMsg::Status { exchange, .. }
            | InboxMsg::Snapshot { exchange, .. }
            | InboxMsg::Err { exchange, .. } => *exchange,
            InboxMsg::Done { exchange, .. } => exchange.id,
        }
    }
}

/// send to inbox (ignore disconnected)
fn push_inbox(tx: &Sender<InboxMsg>, msg: InboxMsg) {
    let _ = tx.send(msg);
}

/// forwards coordinator output for one session entity into the inbox.
struct InboxObserver {
    entity: Entity,
    tx: Sender<InboxMsg>,
}

impl ExchangeObserver for InboxObserver {
    fn on_status(&mut self, id: ExchangeId, status: ExchangeStatus) {
        // pending is announced by the spawning system itself
        if status == ExchangeStatus::Pending {
            return;
        }
        push_inbox(&self.tx, InboxMsg::Status { entity: self.entity, exchange: id, status });
    }

    fn on_snapshot(&mut self, id: ExchangeId, snapshot: Arc<AccumulatedCompletion>) {
        push_inbox(&self.tx, InboxMsg::Snapshot { entity: self.entity, exchange: id, completion: snapshot });
    }
}

/// bevy plugin: wires systems, events, resources.
/// requires a `ChatBackend` resource.
pub struct RagChatPlugin;

impl Plugin for RagChatPlugin {
    fn build(&self, app: &mut App) {
        info!(target: "bevy_rag_chat", "RagChatPlugin: build()");
        app.init_resource::<StreamInbox>()
            .init_resource::<ActiveCitation>()
            .add_event::<ExchangeStatusEvt>()
            .add_event::<AnswerSnapshotEvt>()
            .add_event::<ExchangeCompletedEvt>()
            .add_event::<ExchangeFailedEvt>()
            .add_event::<CitationClickedEvt>()
            .configure_sets(Update, RagChatSet::Drain)
            .add_systems(Update, drain_stream_inbox.in_set(RagChatSet::Drain))
            // new exchanges begin after the drain, so everything an exchange
            // reported before being superseded still lands this frame
            .add_systems(
                Update,
                (apply_clear_requests, spawn_chat_requests)
                    .chain()
                    .after(RagChatSet::Drain),
            )
            .add_systems(Update, select_citations.after(RagChatSet::Drain));

        if app.world().get_resource::<TokioRt>().is_none() {
            app.insert_resource(TokioRt::default());
        }
    }
}

/// ends whichever session's exchange is active right now (it may live on a
/// different entity than the one asking). `begin`/`supersede` must follow.
fn supersede_in_flight(
    backend: &ChatBackend,
    conversations: &mut Query<(Entity, &mut Conversation)>,
    ev_status: &mut EventWriter<ExchangeStatusEvt>,
) {
    let Some(active) = backend.coordinator.active() else {
        return;
    };
    for (entity, mut conversation) in conversations.iter_mut() {
        if conversation.in_flight.as_ref().is_some_and(|f| f.id == active) {
            info!(target: "bevy_rag_chat", "exchange {} on entity={:?} superseded", active, entity);
            conversation.in_flight = None;
            ev_status.write(ExchangeStatusEvt { entity, exchange: active, status: ExchangeStatus::Superseded });
        }
    }
}

fn apply_clear_requests(
    mut commands: Commands,
    backend: Res<ChatBackend>,
    mut active_citation: ResMut<ActiveCitation>,
    requests: Query<Entity, With<ClearRequest>>,
    mut conversations: Query<(Entity, &mut Conversation)>,
    mut ev_status: EventWriter<ExchangeStatusEvt>,
) {
    for e in requests.iter() {
        commands.entity(e).remove::<ClearRequest>();
        supersede_in_flight(&backend, &mut conversations, &mut ev_status);
        backend.coordinator.supersede();
        if let Ok((_, mut conversation)) = conversations.get_mut(e) {
            info!(target: "bevy_rag_chat", "clear_chat: entity={:?} exchanges={}", e, conversation.exchanges.len());
            conversation.clear();
        }
        active_citation.0 = None;
    }
}

/// starts one exchange per pending `QuestionRequest`. the newest one wins.
fn spawn_chat_requests(
    mut commands: Commands,
    backend: Res<ChatBackend>,
    inbox: Res<StreamInbox>,
    rt: Res<TokioRt>,
    mut active_citation: ResMut<ActiveCitation>,
    requests: Query<(Entity, &ChatSession, &QuestionRequest)>,
    mut conversations: Query<(Entity, &mut Conversation)>,
    mut ev_status: EventWriter<ExchangeStatusEvt>,
) {
    for (e, session, req) in requests.iter() {
        commands.entity(e).remove::<QuestionRequest>();
        active_citation.0 = None;

        supersede_in_flight(&backend, &mut conversations, &mut ev_status);
        let id = backend.coordinator.begin();

        let Ok((_, mut conversation)) = conversations.get_mut(e) else {
            warn!(target: "bevy_rag_chat", "spawn_chat_requests: entity={:?} has no Conversation", e);
            continue;
        };
        info!(target: "bevy_rag_chat",
            "spawn_chat_requests: entity={:?} exchange={} stream={} history={}",
            e, id, session.stream, conversation.exchanges.len()
        );
        conversation.start(id, req.question.clone());
        ev_status.write(ExchangeStatusEvt { entity: e, exchange: id, status: ExchangeStatus::Pending });

        let coordinator = backend.coordinator.clone();
        let tx = inbox.tx.clone();
        let question = req.question.clone();
        let history = conversation.exchanges.clone();
        let options = session.options.clone();
        let stream = session.stream;

        rt.0.spawn(async move {
            let mut observer = InboxObserver { entity: e, tx: tx.clone() };
            match coordinator
                .run_exchange(id, &question, &history, &options, stream, &mut observer)
                .await
            {
                Ok(exchange) if exchange.status == ExchangeStatus::Complete => {
                    push_inbox(&tx, InboxMsg::Done { entity: e, exchange });
                }
                Ok(exchange) => {
                    debug!(target: "bevy_rag_chat", "exchange {} ended as {:?}", exchange.id, exchange.status);
                }
                Err(err) => {
                    push_inbox(&tx, InboxMsg::Err { entity: e, exchange: id, question, error: err.to_string() });
                }
            }
        });
    }
}

/// drains the inbox and emits user-facing events. anything reported for an
/// exchange that is no longer the active one is dropped here.
fn drain_stream_inbox(
    inbox: Res<StreamInbox>,
    backend: Res<ChatBackend>,
    mut conversations: Query<&mut Conversation>,
    mut ev_status: EventWriter<ExchangeStatusEvt>,
    mut ev_snapshot: EventWriter<AnswerSnapshotEvt>,
    mut ev_done: EventWriter<ExchangeCompletedEvt>,
    mut ev_err: EventWriter<ExchangeFailedEvt>,
) {
    // drain up to a cap per frame to avoid long frames on bursty streams
    const MAX_PER_FRAME: usize = 512;
    let mut drained = Vec::with_capacity(64);
    for _ in 0..MAX_PER_FRAME {
        match inbox.rx.try_recv() {
            Ok(m) => drained.push(m),
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => break,
        }
    }
    if drained.is_empty() {
        return;
    }

    // only the newest snapshot per entity is worth rendering this frame
    let mut latest: HashMap<Entity, (ExchangeId, Arc<AccumulatedCompletion>)> = HashMap::new();
    let mut dones: Vec<(Entity, Exchange)> = Vec::new();
    let mut errs: Vec<(Entity, ExchangeId, String, String)> = Vec::new();

    for msg in drained {
        if !backend.coordinator.is_active(msg.exchange_id()) {
            debug!(target: "bevy_rag_chat", "dropping inbox message for stale exchange {}", msg.exchange_id());
            continue;
        }
        match msg {
            InboxMsg::Status { entity, exchange, status } => {
                if let Ok(mut conversation) = conversations.get_mut(entity)
                    && let Some(in_flight) = conversation.in_flight_mut(exchange) {
                        in_flight.status = status;
                }
                ev_status.write(ExchangeStatusEvt { entity, exchange, status });
            }
            InboxMsg::Snapshot { entity, exchange, completion } => {
                latest.insert(entity, (exchange, completion));
            }
            InboxMsg::Done { entity, exchange } => dones.push((entity, exchange)),
            InboxMsg::Err { entity, exchange, question, error } => errs.push((entity, exchange, question, error)),
        }
    }

    for (entity, (exchange, completion)) in latest {
        if let Ok(mut conversation) = conversations.get_mut(entity)
            && let Some(in_flight) = conversation.in_flight_mut(exchange) {
                in_flight.latest = Some(Arc::clone(&completion));
        }
        ev_snapshot.write(AnswerSnapshotEvt { entity, exchange, completion });
    }
    // ensure snapshots land before "done" for the same frame
    for (entity, exchange) in dones {
        if let Ok(mut conversation) = conversations.get_mut(entity) {
            conversation.complete(exchange.clone());
        }
        ev_done.write(ExchangeCompletedEvt { entity, exchange });
    }
    for (entity, exchange, question, error) in errs {
        if let Ok(mut conversation) = conversations.get_mut(entity) {
            conversation.fail(question.clone(), error.clone());
        }
        ev_err.write(ExchangeFailedEvt { entity, exchange, question, error });
    }
}

/// clicking the citation that is already open closes it.
fn select_citations(mut clicks: EventReader<CitationClickedEvt>, mut active: ResMut<ActiveCitation>) {
    for click in clicks.read() {
        let selected = SelectedCitation {
            entity: click.entity,
            answer_index: click.answer_index,
            key: click.key.clone(),
        };
        if active.0.as_ref() == Some(&selected) {
            active.0 = None;
        } else {
            debug!(target: "bevy_rag_chat", "citation selected: {} (answer {})", selected.key, selected.answer_index);
            active.0 = Some(selected);
        }
    }
}
