use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use events::{EventBus, EventEnvelope};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::wrappers::BroadcastStream;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::state::AppState;

pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 1000;
pub const SSE_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize, IntoParams)]
pub struct EventsQuery {
    /// Only forward events of this session (settings events always pass)
    pub session_id: Option<Uuid>,
}

/// Recent envelopes kept for clients reconnecting with `Last-Event-ID`.
pub struct EventBuffer {
    events: VecDeque<EventEnvelope>,
    max_size: usize,
}

impl EventBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_size),
            max_size,
        }
    }

    pub fn push(&mut self, envelope: EventEnvelope) {
        if self.events.len() >= self.max_size {
            self.events.pop_front();
        }
        self.events.push_back(envelope);
    }

    pub fn events_after(&self, sequence: u64) -> Vec<EventEnvelope> {
        self.events
            .iter()
            .filter(|envelope| envelope.sequence > sequence)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

pub type SharedEventBuffer = Arc<RwLock<EventBuffer>>;

/// Copy every bus event into `buffer` until the bus is dropped.
pub fn spawn_event_recorder(bus: &EventBus, buffer: SharedEventBuffer) {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => buffer
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(envelope),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event recorder lagged behind the bus");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn matches_session(envelope: &EventEnvelope, session_id: Option<Uuid>) -> bool {
    match (session_id, envelope.event.session_id()) {
        (Some(wanted), Some(actual)) => wanted == actual,
        _ => true,
    }
}

fn envelope_to_sse_event(envelope: &EventEnvelope) -> Result<Event, Infallible> {
    let data = serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_string());

    Ok(Event::default()
        .id(envelope.sequence.to_string())
        .event(envelope.event.event_type())
        .data(data))
}

#[utoipa::path(
    get,
    path = "/api/events",
    params(EventsQuery),
    responses(
        (status = 200, description = "SSE event stream"),
    ),
    tag = "events"
)]
pub async fn events_stream(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session_id = query.session_id;
    let last_event_id = headers
        .get("Last-Event-ID")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());

    let rx = state.event_bus.subscribe();

    let missed_events = match last_event_id {
        Some(sequence) => state
            .event_buffer
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .events_after(sequence),
        None => vec![],
    };
    let replayed_up_to = missed_events.last().map(|e| e.sequence).unwrap_or(0);

    let missed_stream = futures::stream::iter(
        missed_events
            .into_iter()
            .filter(move |e| matches_session(e, session_id))
            .map(|e| envelope_to_sse_event(&e)),
    );

    let live_stream = BroadcastStream::new(rx).filter_map(move |result| async move {
        match result {
            Ok(envelope) => {
                if envelope.sequence <= replayed_up_to || !matches_session(&envelope, session_id) {
                    return None;
                }
                Some(envelope_to_sse_event(&envelope))
            }
            Err(e) => {
                tracing::warn!("SSE broadcast error: {:?}", e);
                None
            }
        }
    });

    Sse::new(missed_stream.chain(live_stream)).keep_alive(
        KeepAlive::new()
            .interval(SSE_KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use events::Event as BusEvent;

    fn envelope(sequence: u64, session_id: Uuid) -> EventEnvelope {
        EventEnvelope::new(BusEvent::StopRequested { session_id }).with_sequence(sequence)
    }

    #[test]
    fn test_event_buffer_events_after() {
        let session = Uuid::new_v4();
        let mut buffer = EventBuffer::new(3);
        buffer.push(envelope(1, session));
        buffer.push(envelope(2, session));
        buffer.push(envelope(3, session));

        let after_first = buffer.events_after(1);
        assert_eq!(after_first.len(), 2);
        assert_eq!(after_first[0].sequence, 2);

        assert!(buffer.events_after(3).is_empty());
        assert_eq!(buffer.events_after(0).len(), 3);
    }

    #[test]
    fn test_event_buffer_evicts_oldest() {
        let session = Uuid::new_v4();
        let mut buffer = EventBuffer::new(2);
        buffer.push(envelope(1, session));
        buffer.push(envelope(2, session));
        buffer.push(envelope(3, session));

        assert_eq!(buffer.len(), 2);
        let all: Vec<u64> = buffer.events_after(0).iter().map(|e| e.sequence).collect();
        assert_eq!(all, vec![2, 3]);
    }

    #[test]
    fn test_session_filter() {
        let wanted = Uuid::new_v4();
        let other = Uuid::new_v4();

        assert!(matches_session(&envelope(1, wanted), Some(wanted)));
        assert!(!matches_session(&envelope(1, other), Some(wanted)));
        assert!(matches_session(&envelope(1, other), None));

        let settings = EventEnvelope::new(BusEvent::SettingsChanged {
            concurrency: 2,
            visible: true,
        });
        assert!(matches_session(&settings, Some(wanted)));
    }

    #[test]
    fn test_envelope_to_sse_event_does_not_panic() {
        let _event = envelope_to_sse_event(&envelope(7, Uuid::new_v4())).unwrap();
    }

    #[tokio::test]
    async fn test_recorder_fills_buffer() {
        let bus = EventBus::new();
        let buffer = Arc::new(RwLock::new(EventBuffer::new(10)));
        spawn_event_recorder(&bus, Arc::clone(&buffer));

        bus.emit(BusEvent::SettingsChanged {
            concurrency: 3,
            visible: false,
        });

        for _ in 0..50 {
            if !buffer.read().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(buffer.read().unwrap().len(), 1);
    }
}
