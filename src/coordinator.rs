//! drives one exchange end to end: request, merge fragments, publish
//! throttled snapshots, finish or fail.
//!
//! at most one exchange is active process-wide. `begin` hands out a fresh id
//! and makes it the active one; every publish re-checks the id, so work that
//! belongs to a superseded exchange (late fragments, a throttle sleep that
//! wakes up after a newer question) ends as a silent no-op.

use crate::error::ChatError;
use crate::merge::merge;
use crate::model::{AccumulatedCompletion, ChatOptions, ChatRequest, Exchange, ExchangeId, ExchangeStatus};
use crate::transport::ChatTransport;
use bevy::log::{debug, error, info};
use futures_lite::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// spacing between visible updates while streaming (~30hz).
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(33);

const NO_EXCHANGE: u64 = 0;

/// receives what the coordinator publishes for the active exchange.
pub trait ExchangeObserver: Send {
    fn on_status(&mut self, _id: ExchangeId, _status: ExchangeStatus) {}
    fn on_snapshot(&mut self, id: ExchangeId, snapshot: Arc<AccumulatedCompletion>);
}

impl<F> ExchangeObserver for F
where
    F: FnMut(ExchangeId, Arc<AccumulatedCompletion>) + Send,
{
    fn on_snapshot(&mut self, id: ExchangeId, snapshot: Arc<AccumulatedCompletion>) {
        self(id, snapshot)
    }
}

/// keeps successive publishes at least `interval` apart. it only delays;
/// every caller of `ready` gets to publish.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    pub async fn ready(&mut self) {
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                tokio::time::sleep(self.interval - elapsed).await;
            }
        }
        self.last = Some(Instant::now());
    }
}

#[derive(Clone)]
pub struct StreamCoordinator {
    transport: Arc<dyn ChatTransport>,
    active: Arc<AtomicU64>,
    next_id: Arc<AtomicU64>,
    throttle: Duration,
}

impl StreamCoordinator {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            transport,
            active: Arc::new(AtomicU64::new(NO_EXCHANGE)),
            next_id: Arc::new(AtomicU64::new(NO_EXCHANGE)),
            throttle: DEFAULT_THROTTLE,
        }
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    /// allocates an id for a new exchange and makes it the active one,
    /// superseding whatever was in flight.
    pub fn begin(&self) -> ExchangeId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self.active.swap(id, Ordering::SeqCst);
        if previous != NO_EXCHANGE {
            debug!(target: "bevy_rag_chat", "exchange #{previous} superseded by #{id}");
        }
        ExchangeId(id)
    }

    /// leaves no exchange active (chat cleared).
    pub fn supersede(&self) {
        self.active.store(NO_EXCHANGE, Ordering::SeqCst);
    }

    pub fn is_active(&self, id: ExchangeId) -> bool {
        self.active.load(Ordering::SeqCst) == id.0
    }

    pub fn active(&self) -> Option<ExchangeId> {
        match self.active.load(Ordering::SeqCst) {
            NO_EXCHANGE => None,
            id => Some(ExchangeId(id)),
        }
    }

    /// `begin` + `run_exchange`.
    pub async fn run<O>(
        &self,
        question: &str,
        history: &[Exchange],
        options: &ChatOptions,
        streaming: bool,
        observer: &mut O,
    ) -> Result<Exchange, ChatError>
    where
        O: ExchangeObserver + ?Sized,
    {
        let id = self.begin();
        self.run_exchange(id, question, history, options, streaming, observer).await
    }

    /// runs an exchange whose id came from `begin`.
    ///
    /// returns the exchange as `Complete`, or as `Superseded` if another
    /// exchange took over meanwhile. transport and payload failures come back
    /// as `Err` after a `Failed` status; nothing is retried.
    pub async fn run_exchange<O>(
        &self,
        id: ExchangeId,
        question: &str,
        history: &[Exchange],
        options: &ChatOptions,
        streaming: bool,
        observer: &mut O,
    ) -> Result<Exchange, ChatError>
    where
        O: ExchangeObserver + ?Sized,
    {
        let request = ChatRequest::for_question(question, history, options);
        info!(target: "bevy_rag_chat",
            "exchange {id}: stream={streaming} history={} session_state={}",
            history.len(), request.session_state.is_some()
        );

        let mut exchange = Exchange {
            id,
            question: question.to_string(),
            answer: Arc::new(AccumulatedCompletion::default()),
            status: ExchangeStatus::Pending,
        };
        // a clear or newer question may land before the task gets scheduled
        if !self.is_active(id) {
            self.mark_superseded(&mut exchange);
            return Ok(exchange);
        }
        observer.on_status(id, ExchangeStatus::Pending);

        let result = if streaming {
            self.consume_stream(&mut exchange, &request, observer).await
        } else {
            self.consume_single(&mut exchange, &request, observer).await
        };

        match result {
            Ok(()) => Ok(exchange),
            Err(_) if !self.is_active(id) => {
                self.mark_superseded(&mut exchange);
                Ok(exchange)
            }
            Err(err) => {
                error!(target: "bevy_rag_chat", "exchange {id} failed: {err}");
                exchange.status = ExchangeStatus::Failed;
                observer.on_status(id, ExchangeStatus::Failed);
                Err(err)
            }
        }
    }

    async fn consume_stream<O>(
        &self,
        exchange: &mut Exchange,
        request: &ChatRequest,
        observer: &mut O,
    ) -> Result<(), ChatError>
    where
        O: ExchangeObserver + ?Sized,
    {
        let id = exchange.id;
        let mut fragments = self.transport.stream(request).await?;
        let mut throttle = Throttle::new(self.throttle);

        while let Some(item) = fragments.next().await {
            if !self.is_active(id) {
                self.mark_superseded(exchange);
                return Ok(());
            }
            let fragment = item?;

            if exchange.status == ExchangeStatus::Pending {
                debug!(target: "bevy_rag_chat", "exchange {id}: first fragment");
                exchange.status = ExchangeStatus::Streaming;
                observer.on_status(id, ExchangeStatus::Streaming);
            }

            exchange.answer = Arc::new(merge(&exchange.answer, &fragment));

            if fragment.is_content_bearing() {
                throttle.ready().await;
                if !self.is_active(id) {
                    self.mark_superseded(exchange);
                    return Ok(());
                }
                observer.on_snapshot(id, Arc::clone(&exchange.answer));
            }
        }

        if !self.is_active(id) {
            self.mark_superseded(exchange);
            return Ok(());
        }
        self.finish(exchange, observer);
        Ok(())
    }

    async fn consume_single<O>(
        &self,
        exchange: &mut Exchange,
        request: &ChatRequest,
        observer: &mut O,
    ) -> Result<(), ChatError>
    where
        O: ExchangeObserver + ?Sized,
    {
        let response = self.transport.complete(request).await?;
        if !self.is_active(exchange.id) {
            self.mark_superseded(exchange);
            return Ok(());
        }
        exchange.answer = Arc::new(response.into());
        self.finish(exchange, observer);
        Ok(())
    }

    /// final, unthrottled publish.
    fn finish<O>(&self, exchange: &mut Exchange, observer: &mut O)
    where
        O: ExchangeObserver + ?Sized,
    {
        exchange.status = ExchangeStatus::Complete;
        info!(target: "bevy_rag_chat",
            "exchange {}: complete, content_len={} data_points={}",
            exchange.id, exchange.answer.content.len(), exchange.answer.context.data_points.len()
        );
        observer.on_snapshot(exchange.id, Arc::clone(&exchange.answer));
        observer.on_status(exchange.id, ExchangeStatus::Complete);
    }

    fn mark_superseded(&self, exchange: &mut Exchange) {
        info!(target: "bevy_rag_chat", "exchange {}: superseded, dropping further fragments", exchange.id);
        exchange.status = ExchangeStatus::Superseded;
    }
}
