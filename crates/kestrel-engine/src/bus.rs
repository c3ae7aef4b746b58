//! Cursor-ordered event bus with replay.
//!
//! Every emitted event gets the next cursor, lands in a bounded in-memory
//! timeline, is handed to an ordered persistence worker and is fanned out to
//! live subscribers. Subscribers may start from any past cursor: the part of
//! history older than the in-memory window is read back from the store.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use kestrel_core::errors::ErrorKind;
use kestrel_core::events::{AgentEvent, Bookmark, Channel, Envelope};
use kestrel_core::ids::SessionId;
use kestrel_store::{EventQuery, Store, StoreError};

pub const DEFAULT_EVENT_CAPACITY: usize = 10_000;

pub type EventStream = BoxStream<'static, Envelope>;

/// Replay and filtering options for [`EventBus::subscribe`].
#[derive(Clone, Debug, Default)]
pub struct SubscribeOptions {
    /// Replay events with a cursor strictly greater than this first.
    pub since: Option<u64>,
    /// Only these event kinds (`text`, `tool_result`, ...).
    pub kinds: Option<Vec<String>>,
}

impl SubscribeOptions {
    pub fn since(cursor: u64) -> Self {
        Self {
            since: Some(cursor),
            kinds: None,
        }
    }

    pub fn with_kinds(mut self, kinds: &[&str]) -> Self {
        self.kinds = Some(kinds.iter().map(|k| k.to_string()).collect());
        self
    }
}

#[derive(Clone, Debug)]
struct Filter {
    channels: Vec<Channel>,
    kinds: Option<Vec<String>>,
}

impl Filter {
    fn matches(&self, envelope: &Envelope) -> bool {
        (self.channels.is_empty() || self.channels.contains(&envelope.channel))
            && self
                .kinds
                .as_ref()
                .map_or(true, |k| k.iter().any(|k| k == envelope.event.kind()))
    }
}

struct Subscriber {
    filter: Filter,
    tx: mpsc::UnboundedSender<Envelope>,
}

struct BusState {
    cursor: u64,
    timeline: VecDeque<Envelope>,
    subscribers: Vec<Subscriber>,
}

enum PersistJob {
    Append(Envelope),
    Drain(oneshot::Sender<()>),
}

struct Durable {
    session_id: SessionId,
    store: Arc<dyn Store>,
    jobs: mpsc::UnboundedSender<PersistJob>,
}

pub struct EventBus {
    capacity: usize,
    state: Mutex<BusState>,
    durable: Option<Durable>,
    failed: Arc<Mutex<Vec<Envelope>>>,
}

impl EventBus {
    /// Memory-only bus.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            state: Mutex::new(BusState {
                cursor: 0,
                timeline: VecDeque::new(),
                subscribers: Vec::new(),
            }),
            durable: None,
            failed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Bus mirrored into `store`. Must be called inside a tokio runtime.
    pub fn with_store(session_id: SessionId, store: Arc<dyn Store>, capacity: usize) -> Self {
        let mut bus = Self::new(capacity);
        let (jobs, rx) = mpsc::unbounded_channel();
        tokio::spawn(persist_worker(
            session_id.clone(),
            Arc::clone(&store),
            rx,
            Arc::clone(&bus.failed),
        ));
        bus.durable = Some(Durable {
            session_id,
            store,
            jobs,
        });
        bus
    }

    /// Stamp, record, persist and fan out one event.
    pub fn emit(&self, event: AgentEvent) -> Bookmark {
        let mut state = self.state.lock();
        state.cursor += 1;
        let envelope = Envelope::new(state.cursor, event);

        state.timeline.push_back(envelope.clone());
        if state.timeline.len() > self.capacity {
            let remove = state.timeline.len() - self.capacity / 2;
            state.timeline.drain(..remove);
            debug!(cursor = envelope.cursor, kept = state.timeline.len(), "event timeline truncated");
        }

        if let Some(durable) = &self.durable {
            if durable.jobs.send(PersistJob::Append(envelope.clone())).is_err() {
                self.failed.lock().push(envelope.clone());
            }
        }

        state
            .subscribers
            .retain(|s| !s.filter.matches(&envelope) || s.tx.send(envelope.clone()).is_ok());

        envelope.bookmark()
    }

    /// Stream of matching events. An empty `channels` slice means every channel.
    ///
    /// With `since`, history after that cursor is replayed first, then live
    /// events follow in cursor order without gaps or duplicates. If the store
    /// cannot supply the older part, the stream yields a single
    /// `error{StoreError}` envelope stamped with `since` and ends.
    pub fn subscribe(&self, channels: &[Channel], opts: SubscribeOptions) -> EventStream {
        let filter = Filter {
            channels: channels.to_vec(),
            kinds: opts.kinds,
        };
        let (tx, rx) = mpsc::unbounded_channel();

        let (memory, gap) = {
            let mut state = self.state.lock();
            let mut memory = Vec::new();
            let mut gap = None;
            if let Some(since) = opts.since {
                memory = state
                    .timeline
                    .iter()
                    .filter(|e| e.cursor > since && filter.matches(e))
                    .cloned()
                    .collect();
                let oldest = state.timeline.front().map_or(state.cursor + 1, |e| e.cursor);
                if since + 1 < oldest {
                    gap = Some((since, oldest - 1));
                }
            }
            state.subscribers.push(Subscriber {
                filter: filter.clone(),
                tx,
            });
            (memory, gap)
        };

        let memory = stream::iter(memory);
        let live = UnboundedReceiverStream::new(rx);
        let (Some((since, until)), Some(durable)) = (gap, &self.durable) else {
            return memory.chain(live).boxed();
        };

        let store = Arc::clone(&durable.store);
        let session_id = durable.session_id.clone();
        let jobs = durable.jobs.clone();
        let failed = Arc::clone(&self.failed);
        stream::once(async move {
            drain(&jobs).await;
            let query = EventQuery {
                channel: None,
                since: Some(since),
                until: Some(until),
            };
            let mut events = match store.read_events(&session_id, &query).await {
                Ok(events) => events,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "event replay from store failed, ending subscription");
                    return stream::iter([replay_failure(since, &e)]).boxed();
                }
            };
            events.extend(
                failed
                    .lock()
                    .iter()
                    .filter(|e| query.matches(e.channel, e.cursor))
                    .cloned(),
            );
            events.sort_by_key(|e| e.cursor);
            events.dedup_by_key(|e| e.cursor);
            events.retain(|e| filter.matches(e));
            stream::iter(events).chain(memory).chain(live).boxed()
        })
        .flatten()
        .boxed()
    }

    /// In-memory events after `since`.
    pub fn timeline(&self, since: Option<u64>) -> Vec<Envelope> {
        let since = since.unwrap_or(0);
        self.state
            .lock()
            .timeline
            .iter()
            .filter(|e| e.cursor > since)
            .cloned()
            .collect()
    }

    pub fn cursor(&self) -> u64 {
        self.state.lock().cursor
    }

    /// Continue numbering after a durable cursor (used on resume).
    pub fn seed_cursor(&self, cursor: u64) {
        let mut state = self.state.lock();
        state.cursor = state.cursor.max(cursor);
    }

    /// Drop the timeline and every subscriber. The cursor keeps counting.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.timeline.clear();
        state.subscribers.clear();
    }

    /// Wait until every event emitted so far has been handed to the store.
    pub async fn drain(&self) {
        if let Some(durable) = &self.durable {
            drain(&durable.jobs).await;
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn failed_event_count(&self) -> usize {
        self.failed.lock().len()
    }

    /// Retry failed durable appends in cursor order. Events that fail again
    /// stay queued and the last error is returned.
    pub async fn flush_failed_events(&self) -> Result<(), StoreError> {
        let Some(durable) = &self.durable else {
            return Ok(());
        };
        let mut pending = std::mem::take(&mut *self.failed.lock());
        pending.sort_by_key(|e| e.cursor);

        let mut kept = Vec::new();
        let mut last_error = None;
        for envelope in pending {
            if let Err(e) = durable.store.append_event(&durable.session_id, &envelope).await {
                kept.push(envelope);
                last_error = Some(e);
            }
        }

        if !kept.is_empty() {
            let mut failed = self.failed.lock();
            kept.append(&mut failed);
            *failed = kept;
        }
        last_error.map_or(Ok(()), Err)
    }
}

async fn drain(jobs: &mpsc::UnboundedSender<PersistJob>) {
    let (tx, rx) = oneshot::channel();
    if jobs.send(PersistJob::Drain(tx)).is_ok() {
        let _ = rx.await;
    }
}

async fn persist_worker(
    session_id: SessionId,
    store: Arc<dyn Store>,
    mut jobs: mpsc::UnboundedReceiver<PersistJob>,
    failed: Arc<Mutex<Vec<Envelope>>>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            PersistJob::Append(envelope) => {
                if let Err(e) = store.append_event(&session_id, &envelope).await {
                    warn!(
                        session_id = %session_id,
                        cursor = envelope.cursor,
                        kind = envelope.event.kind(),
                        error = %e,
                        "event persistence failed, queued for retry"
                    );
                    failed.lock().push(envelope);
                }
            }
            PersistJob::Drain(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Terminal envelope for a subscription whose replay could not be read.
fn replay_failure(since: u64, error: &StoreError) -> Envelope {
    Envelope::new(
        since,
        AgentEvent::Error {
            kind: ErrorKind::StoreError,
            message: format!("event replay failed: {error}"),
            hint: None,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FlakyStore;
    use kestrel_core::events::{DoneReason, SessionState};
    use kestrel_store::{FileStore, FileStoreOptions};
    use std::sync::atomic::Ordering;

    fn text(n: usize) -> AgentEvent {
        AgentEvent::Text {
            text: format!("e{n}"),
        }
    }

    fn file_store(dir: &tempfile::TempDir) -> Arc<FileStore> {
        Arc::new(FileStore::new(
            dir.path(),
            FileStoreOptions::default().with_recover_on_open(false),
        ))
    }

    #[test]
    fn cursors_are_strictly_increasing() {
        let bus = EventBus::new(DEFAULT_EVENT_CAPACITY);
        let a = bus.emit(text(1));
        let b = bus.emit(AgentEvent::State { state: SessionState::Busy });
        let c = bus.emit(text(2));
        assert_eq!((a.seq, b.seq, c.seq), (1, 2, 3));
        assert_eq!(bus.cursor(), 3);
    }

    #[tokio::test]
    async fn since_is_exclusive_and_live_follows_replay() {
        let bus = EventBus::new(DEFAULT_EVENT_CAPACITY);
        for i in 0..5 {
            let _ = bus.emit(text(i));
        }
        let mut stream = bus.subscribe(&[], SubscribeOptions::since(2));
        let _ = bus.emit(text(5));

        let cursors: Vec<u64> = stream.by_ref().take(4).map(|e| e.cursor).collect().await;
        assert_eq!(cursors, vec![3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn filters_by_channel_and_kind() {
        let bus = EventBus::new(DEFAULT_EVENT_CAPACITY);
        let progress = bus.subscribe(&[Channel::Progress], SubscribeOptions::since(0));
        let done_only = bus.subscribe(&[], SubscribeOptions::since(0).with_kinds(&["done"]));

        let _ = bus.emit(AgentEvent::State { state: SessionState::Busy });
        let _ = bus.emit(text(1));
        let _ = bus.emit(AgentEvent::Done { step: 1, reason: DoneReason::Completed });

        let kinds: Vec<&str> = progress.take(2).map(|e| e.event.kind()).collect().await;
        assert_eq!(kinds, vec!["text", "done"]);
        let first = done_only.take(1).collect::<Vec<_>>().await;
        assert_eq!(first[0].cursor, 3);
    }

    #[test]
    fn timeline_truncates_to_half_above_capacity() {
        let bus = EventBus::new(10);
        for i in 0..11 {
            let _ = bus.emit(text(i));
        }
        let timeline = bus.timeline(None);
        assert_eq!(timeline.len(), 5);
        assert_eq!(timeline[0].cursor, 7);
        assert_eq!(bus.timeline(Some(9)).len(), 2);
    }

    #[tokio::test]
    async fn dropped_stream_unsubscribes() {
        let bus = EventBus::new(DEFAULT_EVENT_CAPACITY);
        let stream = bus.subscribe(&[], SubscribeOptions::default());
        assert_eq!(bus.subscriber_count(), 1);
        drop(stream);
        let _ = bus.emit(text(0));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn reset_keeps_counting() {
        let bus = EventBus::new(DEFAULT_EVENT_CAPACITY);
        let _ = bus.emit(text(0));
        bus.reset();
        assert!(bus.timeline(None).is_empty());
        assert_eq!(bus.emit(text(1)).seq, 2);
    }

    #[tokio::test]
    async fn replays_past_the_memory_window_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        let bus = EventBus::with_store(SessionId::from_raw("s1"), store, 10_000);
        for i in 0..12_000 {
            let _ = bus.emit(text(i));
        }
        assert!(bus.timeline(None).len() <= 10_000);

        let cursors: Vec<u64> = bus
            .subscribe(&[], SubscribeOptions::since(0))
            .take(12_000)
            .map(|e| e.cursor)
            .collect()
            .await;
        assert_eq!(cursors.len(), 12_000);
        assert!(cursors.iter().enumerate().all(|(i, c)| *c == i as u64 + 1));
    }

    #[tokio::test]
    async fn failed_appends_reach_subscribers_and_retry() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::new(dir.path()));
        store.fail_events.store(true, Ordering::SeqCst);
        let bus = EventBus::with_store(SessionId::from_raw("s1"), store.clone(), 100);

        let live = bus.subscribe(&[], SubscribeOptions::default());
        let _ = bus.emit(AgentEvent::Done { step: 1, reason: DoneReason::Completed });
        let _ = bus.emit(text(1));
        bus.drain().await;

        let seen: Vec<u64> = live.take(2).map(|e| e.cursor).collect().await;
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(bus.failed_event_count(), 2);

        assert!(bus.flush_failed_events().await.is_err());
        assert_eq!(bus.failed_event_count(), 2);

        store.fail_events.store(false, Ordering::SeqCst);
        bus.flush_failed_events().await.unwrap();
        assert_eq!(bus.failed_event_count(), 0);

        let stored = store
            .read_events(&SessionId::from_raw("s1"), &EventQuery::default())
            .await
            .unwrap();
        assert_eq!(stored.iter().map(|e| e.cursor).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn unreadable_replay_ends_the_stream_instead_of_skipping() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::new(dir.path()));
        let bus = EventBus::with_store(SessionId::from_raw("s1"), store.clone(), 10);
        for i in 0..11 {
            let _ = bus.emit(text(i));
        }
        store.fail_reads.store(true, Ordering::SeqCst);

        let stream = bus.subscribe(&[], SubscribeOptions::since(0));
        let _ = bus.emit(text(11));
        let seen: Vec<Envelope> = stream.collect().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].cursor, 0);
        assert!(matches!(
            &seen[0].event,
            AgentEvent::Error { kind: ErrorKind::StoreError, message, .. } if message.starts_with("event replay failed")
        ));

        let _ = bus.emit(text(12));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn seeded_cursor_continues_numbering() {
        let bus = EventBus::new(DEFAULT_EVENT_CAPACITY);
        bus.seed_cursor(41);
        assert_eq!(bus.emit(text(0)).seq, 42);
        bus.seed_cursor(3);
        assert_eq!(bus.cursor(), 42);
    }
}
