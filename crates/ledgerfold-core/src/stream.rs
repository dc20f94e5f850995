//! Filterable event streams and the fan-out pipe that feeds them.
//!
//! An [`EventStream`] is a finite, forward-only sequence of events with an
//! optional allow-list of names. An [`EventPipe`] hands every record it
//! receives to all attached downstream streams before accepting the next one;
//! each downstream filters independently.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::StorageError;
use crate::event::Event;

/// Item produced by an event stream. An `Err` is the stream's error signal.
pub type EventItem = Result<Event, StorageError>;

/// Allow-list of qualified event names.
#[derive(Debug, Clone)]
pub struct NameFilter(Arc<HashSet<String>>);

impl NameFilter {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        NameFilter(Arc::new(names.into_iter().map(Into::into).collect()))
    }

    pub fn allows(&self, name: &str) -> bool {
        self.0.contains(name)
    }
}

/// A lazy, ordered, non-restartable sequence of events.
pub struct EventStream {
    inner: BoxStream<'static, EventItem>,
    filter: Option<NameFilter>,
}

impl EventStream {
    /// Wrap any stream of event items. No filter is applied.
    pub fn new<S>(inner: S) -> Self
    where
        S: Stream<Item = EventItem> + Send + 'static,
    {
        Self {
            inner: inner.boxed(),
            filter: None,
        }
    }

    /// A finite stream over already-loaded events.
    pub fn from_events(events: Vec<Event>) -> Self {
        Self::new(stream::iter(events.into_iter().map(Ok)))
    }

    pub fn empty() -> Self {
        Self::new(stream::empty())
    }

    /// A stream fed by hand through the returned sink.
    ///
    /// The stream ends once the sink is dropped or [`EventSink::end`] is called.
    pub fn channel() -> (EventSink, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink { tx }, Self::new(UnboundedReceiverStream::new(rx)))
    }

    /// Only forward events whose name is in `filter`; others are dropped silently.
    pub fn filtered(self, filter: NameFilter) -> Self {
        if self.filter.is_none() {
            Self {
                inner: self.inner,
                filter: Some(filter),
            }
        } else {
            Self {
                inner: self.boxed(),
                filter: Some(filter),
            }
        }
    }

    /// Forward every item of `self`, then every item of `next`.
    pub fn chain(self, next: EventStream) -> Self {
        Self::new(StreamExt::chain(self, next))
    }

    fn allows(&self, event: &Event) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |filter| filter.allows(&event.name))
    }
}

impl Stream for EventStream {
    type Item = EventItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match self.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(event))) if !self.allows(&event) => continue,
                other => return other,
            }
        }
    }
}

/// Writing end of [`EventStream::channel`].
pub struct EventSink {
    tx: UnboundedSender<EventItem>,
}

impl EventSink {
    /// Push an event. Returns `false` if the stream has been dropped.
    pub fn write(&self, event: Event) -> bool {
        self.tx.send(Ok(event)).is_ok()
    }

    /// Push the error signal.
    pub fn fail(&self, error: StorageError) -> bool {
        self.tx.send(Err(error)).is_ok()
    }

    /// Signal end-of-stream.
    pub fn end(self) {}
}

struct Downstream {
    tx: UnboundedSender<EventItem>,
}

/// Fan-out point: one upstream, many independently filtered downstreams.
#[derive(Clone, Default)]
pub struct EventPipe {
    downstreams: Arc<Mutex<Vec<Downstream>>>,
}

impl EventPipe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new downstream. `None` means no filter.
    pub fn attach(&self, filter: Option<NameFilter>) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.downstreams.lock().push(Downstream { tx });

        let stream = EventStream::new(UnboundedReceiverStream::new(rx));
        match filter {
            Some(filter) => stream.filtered(filter),
            None => stream,
        }
    }

    /// Hand `event` to every attached downstream.
    ///
    /// Downstreams whose stream has been dropped are detached.
    pub fn write(&self, event: &Event) {
        self.downstreams
            .lock()
            .retain(|downstream| downstream.tx.send(Ok(event.clone())).is_ok());
    }

    /// Send the error signal to every downstream, then end them.
    pub fn fail(&self, error: StorageError) {
        let downstreams = std::mem::take(&mut *self.downstreams.lock());
        for downstream in downstreams {
            let _ = downstream.tx.send(Err(error.clone()));
        }
    }

    /// End every attached downstream. The pipe stays usable for new attachments.
    pub fn end(&self) {
        self.downstreams.lock().clear();
    }

    /// Number of live downstreams.
    pub fn downstream_count(&self) -> usize {
        let mut downstreams = self.downstreams.lock();
        downstreams.retain(|downstream| !downstream.tx.is_closed());
        downstreams.len()
    }

    /// Drive `upstream` to exhaustion through the pipe, propagating its end or
    /// error signal to all downstreams.
    pub async fn pump(&self, mut upstream: EventStream) {
        while let Some(item) = upstream.next().await {
            match item {
                Ok(event) => self.write(&event),
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }
        self.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn make_event(name: &str, stamp: u64) -> Event {
        Event {
            name: name.to_string(),
            aggregate: "id1".to_string(),
            payload: json!({ "stamp": stamp }),
            version: stamp,
            stamp,
            date: Utc::now(),
        }
    }

    async fn names(stream: EventStream) -> Vec<String> {
        stream
            .map(|item| item.unwrap().name)
            .collect::<Vec<_>>()
            .await
    }

    #[tokio::test]
    async fn test_without_filter() {
        let (sink, stream) = EventStream::channel();
        sink.write(make_event("a.one", 1));
        sink.write(make_event("b.two", 2));
        sink.end();

        assert_eq!(names(stream).await, vec!["a.one", "b.two"]);
    }

    #[tokio::test]
    async fn test_with_filter() {
        let (sink, stream) = EventStream::channel();
        let stream = stream.filtered(NameFilter::new(["b.two"]));
        sink.write(make_event("a.one", 1));
        sink.write(make_event("b.two", 2));
        sink.write(make_event("c.three", 3));
        sink.end();

        assert_eq!(names(stream).await, vec!["b.two"]);
    }

    #[tokio::test]
    async fn test_nested_filters_intersect() {
        let stream = EventStream::from_events(vec![
            make_event("a.one", 1),
            make_event("b.two", 2),
            make_event("c.three", 3),
        ])
        .filtered(NameFilter::new(["a.one", "b.two"]))
        .filtered(NameFilter::new(["b.two", "c.three"]));

        assert_eq!(names(stream).await, vec!["b.two"]);
    }

    #[tokio::test]
    async fn test_pipe_single() {
        let pipe = EventPipe::new();
        let downstream = pipe.attach(None);

        pipe.pump(EventStream::from_events(vec![
            make_event("a.one", 1),
            make_event("a.two", 2),
        ]))
        .await;

        assert_eq!(names(downstream).await, vec!["a.one", "a.two"]);
    }

    #[tokio::test]
    async fn test_pipe_disjoint_filters_do_not_leak() {
        let pipe = EventPipe::new();
        let first = pipe.attach(Some(NameFilter::new(["a.one", "a.three"])));
        let second = pipe.attach(Some(NameFilter::new(["b.two", "b.four"])));

        pipe.pump(EventStream::from_events(vec![
            make_event("a.one", 1),
            make_event("b.two", 2),
            make_event("a.three", 3),
            make_event("b.four", 4),
        ]))
        .await;

        assert_eq!(names(first).await, vec!["a.one", "a.three"]);
        assert_eq!(names(second).await, vec!["b.two", "b.four"]);
    }

    #[tokio::test]
    async fn test_pipe_propagates_error() {
        let pipe = EventPipe::new();
        let first = pipe.attach(None);
        let second = pipe.attach(None);

        let (sink, upstream) = EventStream::channel();
        sink.write(make_event("a.one", 1));
        sink.fail(StorageError::Database("broken".to_string()));
        sink.end();
        pipe.pump(upstream).await;

        for downstream in [first, second] {
            let items: Vec<EventItem> = downstream.collect().await;
            assert_eq!(items.len(), 2);
            assert!(items[0].is_ok());
            assert_eq!(
                items[1],
                Err(StorageError::Database("broken".to_string()))
            );
        }
        assert_eq!(pipe.downstream_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_downstream_is_detached() {
        let pipe = EventPipe::new();
        let kept = pipe.attach(None);
        drop(pipe.attach(None));

        pipe.write(&make_event("a.one", 1));
        assert_eq!(pipe.downstream_count(), 1);

        pipe.end();
        assert_eq!(names(kept).await, vec!["a.one"]);
    }

    #[tokio::test]
    async fn test_chain_preserves_order() {
        let stream = EventStream::from_events(vec![make_event("a.one", 1)])
            .chain(EventStream::from_events(vec![make_event("a.two", 2)]));

        assert_eq!(names(stream).await, vec!["a.one", "a.two"]);
    }
}
