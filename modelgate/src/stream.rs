//! Streaming plumbing: one producer task per call writing canonical events
//! into a bounded channel.

use crate::context::CallContext;
use crate::decoder::StreamDecoder;
use crate::error::{ErrorKind, ProviderError};
use crate::retry::compute_backoff;
use crate::transport::{RequestSpec, Transport};
use crate::types::{Event, EventKind};
use futures::{Stream, StreamExt};
use reqwest::header::HeaderMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, warn};

/// Channel capacity. A slow consumer applies backpressure to the producer.
pub const EVENT_BUFFER: usize = 64;

/// Builds a fresh decoder for each connection, from the response headers.
pub type DecoderFactory = fn(&HeaderMap) -> Box<dyn StreamDecoder>;

/// Canonical events of one streaming call.
///
/// Ends after exactly one terminal event, or without one if the call was
/// cancelled. Once cancelled, events still buffered are discarded. Dropping
/// the stream stops the producer.
pub struct EventStream {
    rx: ReceiverStream<Event>,
    producer: JoinHandle<()>,
    cancel: CancellationToken,
}

impl EventStream {
    /// True once the producer task has exited.
    pub fn is_producer_finished(&self) -> bool {
        self.producer.is_finished()
    }

    /// Build a stream from already-decoded events. Used by tests and by
    /// callers that replay a recorded turn.
    pub fn from_events(events: Vec<Event>) -> Self {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        let producer = tokio::spawn(async move {
            for event in events {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });
        Self {
            rx: ReceiverStream::new(rx),
            producer,
            cancel: CancellationToken::new(),
        }
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        if self.cancel.is_cancelled() {
            self.rx.close();
            return Poll::Ready(None);
        }
        self.rx.poll_next_unpin(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

/// Spawn the producer for a connected response.
///
/// Until the first visible event (text or thinking) is delivered, events are
/// held back; a retryable failure in that window reconnects with `request`
/// instead of surfacing, so the caller never sees a duplicate prelude.
pub(crate) fn spawn(
    ctx: CallContext,
    transport: Arc<Transport>,
    request: RequestSpec,
    response: reqwest::Response,
    decoder: DecoderFactory,
) -> EventStream {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let cancel = ctx.token().clone();
    let span = debug_span!("stream", provider = transport.provider(), request_id = %uuid::Uuid::new_v4());
    let producer = tokio::spawn(
        async move {
            let producer = Producer {
                ctx,
                transport,
                request,
                tx,
                held: Vec::new(),
                visible: false,
            };
            producer.run(response, decoder).await;
            debug!("producer finished");
        }
        .instrument(span),
    );
    EventStream {
        rx: ReceiverStream::new(rx),
        producer,
        cancel,
    }
}

struct Producer {
    ctx: CallContext,
    transport: Arc<Transport>,
    request: RequestSpec,
    tx: mpsc::Sender<Event>,
    held: Vec<Event>,
    visible: bool,
}

enum Step {
    Continue,
    Stop,
    Reconnect(ErrorKind, String),
}

impl Producer {
    async fn run(mut self, mut response: reqwest::Response, factory: DecoderFactory) {
        let max_retries = self.transport.retrier().config().max_retries;
        let mut reconnects = 0u32;
        loop {
            let (kind, message) = match self.pump(response, factory).await {
                Step::Reconnect(kind, message) => (kind, message),
                Step::Continue | Step::Stop => return,
            };
            if reconnects >= max_retries {
                self.emit_error(kind, message).await;
                return;
            }
            let delay = compute_backoff(self.transport.retrier().config(), reconnects, None);
            warn!(%kind, %message, reconnects, "stream failed before output, reconnecting");
            reconnects += 1;
            self.held.clear();

            let connect = async {
                self.ctx.sleep(delay).await?;
                self.transport.send(&self.ctx, &self.request).await
            };
            response = match connect.await {
                Ok(resp) => resp,
                Err(ProviderError::Cancelled) => return,
                Err(err) => {
                    self.emit_error(err.kind(), err.message()).await;
                    return;
                }
            };
        }
    }

    /// Decode one connection until a terminal event, a reconnect, or
    /// cancellation.
    async fn pump(&mut self, response: reqwest::Response, factory: DecoderFactory) -> Step {
        let decoder = factory(response.headers());
        let mut batches = std::pin::pin!(decoded(response, decoder));
        loop {
            let kinds = tokio::select! {
                biased;
                _ = self.ctx.cancelled() => return Step::Stop,
                _ = self.ctx.expired() => {
                    self.emit_timeout();
                    return Step::Stop;
                }
                batch = batches.next() => match batch {
                    Some(kinds) => kinds,
                    None => return Step::Stop,
                },
            };
            for kind in kinds {
                match self.deliver(kind).await {
                    Step::Continue => {}
                    other => return other,
                }
            }
        }
    }

    async fn deliver(&mut self, kind: EventKind) -> Step {
        if let EventKind::Error { kind: error_kind, message } = &kind {
            if !self.visible && error_kind.is_retryable() {
                return Step::Reconnect(*error_kind, message.clone());
            }
        }
        let event = Event::new(kind);
        let terminal = event.is_terminal();
        if !self.visible {
            if !event.is_visible() && !terminal {
                self.held.push(event);
                return Step::Continue;
            }
            self.visible = event.is_visible();
            for held in std::mem::take(&mut self.held) {
                if !self.send(held).await {
                    return Step::Stop;
                }
            }
        }
        if !self.send(event).await {
            return Step::Stop;
        }
        if terminal { Step::Stop } else { Step::Continue }
    }

    /// False if the consumer is gone or the call was cancelled.
    async fn send(&self, event: Event) -> bool {
        tokio::select! {
            biased;
            _ = self.ctx.cancelled() => false,
            _ = self.ctx.expired() => {
                self.emit_timeout();
                false
            }
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    async fn emit_error(&mut self, kind: ErrorKind, message: String) {
        for held in std::mem::take(&mut self.held) {
            if !self.send(held).await {
                return;
            }
        }
        self.send(Event::new(EventKind::Error { kind, message })).await;
    }

    /// Best effort: the consumer may be too slow to take it.
    fn emit_timeout(&self) {
        let _ = self.tx.try_send(Event::new(EventKind::Error {
            kind: ErrorKind::Timeout,
            message: "deadline exceeded while streaming".into(),
        }));
    }
}

/// Body chunks run through `decoder`, ending with its flush at end of body.
/// A transport failure yields one `Error` and ends the stream.
fn decoded(
    response: reqwest::Response,
    mut decoder: Box<dyn StreamDecoder>,
) -> impl Stream<Item = Vec<EventKind>> + Send {
    async_stream::stream! {
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => yield decoder.decode(&bytes),
                Err(e) => {
                    let err = ProviderError::Network(e.without_url());
                    yield vec![EventKind::Error {
                        kind: err.kind(),
                        message: err.to_string(),
                    }];
                    return;
                }
            }
        }
        yield decoder.finish();
    }
}
