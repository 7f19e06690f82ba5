//! Server-to-client message stream of one session.
//!
//! Every outgoing message is appended to a bounded replay log under a
//! monotonic event id and, when a GET stream is attached, written to it as an
//! SSE frame. A client reconnecting with `mcp-last-event-id` gets the logged
//! events newer than that id before live delivery resumes.

use axum::body::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, error, warn};

use super::shim::{ResponseSink, ShimError};

/// An event kept for replay.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub id: u64,
    pub data: String,
}

impl StoredEvent {
    /// Encode as an SSE frame.
    pub fn to_sse(&self) -> Bytes {
        Bytes::from(format!(
            "id: {}\nevent: message\ndata: {}\n\n",
            self.id, self.data
        ))
    }
}

/// Bounded ring buffer of emitted events.
#[derive(Debug)]
pub struct EventLog {
    next_id: u64,
    capacity: usize,
    events: VecDeque<StoredEvent>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            next_id: 1,
            capacity,
            events: VecDeque::with_capacity(capacity),
        }
    }

    /// Append an event, evicting the oldest one when full.
    pub fn push(&mut self, data: String) -> StoredEvent {
        let event = StoredEvent {
            id: self.next_id,
            data,
        };
        self.next_id += 1;
        if self.capacity == 0 {
            return event;
        }
        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event.clone());
        event
    }

    /// Events with an id greater than `last_id`, oldest first.
    pub fn since(&self, last_id: u64) -> Vec<StoredEvent> {
        self.events
            .iter()
            .filter(|e| e.id > last_id)
            .cloned()
            .collect()
    }

    /// Whether events after `last_id` have already been evicted.
    pub fn has_gap_after(&self, last_id: u64) -> bool {
        match self.events.front() {
            Some(oldest) => oldest.id > last_id.saturating_add(1),
            None => self.next_id > last_id.saturating_add(1),
        }
    }

}

struct AttachedStream {
    generation: u64,
    sink: Box<dyn ResponseSink>,
}

struct OutboxInner {
    log: EventLog,
    stream: Option<AttachedStream>,
    generations: u64,
}

/// Outgoing message channel of one session.
pub struct Outbox {
    session_id: String,
    inner: Mutex<OutboxInner>,
}

impl Outbox {
    pub fn new(session_id: impl Into<String>, buffer_size: usize) -> Self {
        Self {
            session_id: session_id.into(),
            inner: Mutex::new(OutboxInner {
                log: EventLog::new(buffer_size),
                stream: None,
                generations: 0,
            }),
        }
    }

    /// Log a message and deliver it to the attached stream, if any.
    ///
    /// A stream that cannot take the frame, including one that is backed up,
    /// is ended so the client reconnects and replays from its last event id.
    /// Returns the event id assigned to the message.
    pub fn send<T: Serialize>(&self, message: &T) -> Result<u64, serde_json::Error> {
        let data = serde_json::to_string(message)?;
        let mut inner = self.inner.lock();
        let event = inner.log.push(data);
        if let Some(stream) = inner.stream.as_mut() {
            if let Err(e) = stream.sink.write(event.to_sse()) {
                error!(
                    "[{}] Ending event stream, event {} not delivered: {}",
                    self.session_id, event.id, e
                );
                if let Some(mut stream) = inner.stream.take() {
                    stream.sink.end();
                }
            }
        }
        Ok(event.id)
    }

    /// Attach a stream, replaying logged events newer than `last_event_id`.
    ///
    /// A previously attached stream is ended. Returns the generation number
    /// identifying this attachment for [`Outbox::detach`].
    pub fn attach(&self, mut sink: Box<dyn ResponseSink>, last_event_id: Option<&str>) -> u64 {
        let mut inner = self.inner.lock();

        if let Some(raw) = last_event_id {
            match raw.trim().parse::<u64>() {
                Ok(last) => {
                    if inner.log.has_gap_after(last) {
                        warn!(
                            "[{}] Events after {} were evicted; replaying the remaining ones",
                            self.session_id, last
                        );
                    }
                    for event in inner.log.since(last) {
                        if let Err(e) = sink.write(event.to_sse()) {
                            warn!(
                                "[{}] Replay of event {} failed: {}",
                                self.session_id, event.id, e
                            );
                            break;
                        }
                    }
                }
                Err(_) => warn!(
                    "[{}] Ignoring unparseable mcp-last-event-id '{}'",
                    self.session_id, raw
                ),
            }
        }

        if let Some(mut previous) = inner.stream.take() {
            debug!(
                "[{}] Replacing event stream generation {}",
                self.session_id, previous.generation
            );
            previous.sink.end();
        }

        inner.generations += 1;
        let generation = inner.generations;
        inner.stream = Some(AttachedStream { generation, sink });
        generation
    }

    /// Detach the stream if it is still the given generation.
    pub fn detach(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner
            .stream
            .as_ref()
            .is_some_and(|s| s.generation == generation)
        {
            if let Some(mut stream) = inner.stream.take() {
                stream.sink.end();
            }
            true
        } else {
            false
        }
    }

    /// Write an SSE comment to keep intermediaries from timing out the stream.
    pub fn keep_alive(&self, generation: u64) -> Result<(), ShimError> {
        let mut inner = self.inner.lock();
        match inner.stream.as_mut() {
            Some(stream) if stream.generation == generation => match stream
                .sink
                .write(Bytes::from_static(b": keep-alive\n\n"))
            {
                Ok(()) | Err(ShimError::Full) => Ok(()),
                Err(e) => Err(e),
            },
            _ => Err(ShimError::Ended),
        }
    }

    /// End the attached stream, if any.
    pub fn close(&self) {
        if let Some(mut stream) = self.inner.lock().stream.take() {
            stream.sink.end();
        }
    }

    pub fn has_stream(&self) -> bool {
        self.inner.lock().stream.is_some()
    }

    pub fn buffered_events(&self) -> usize {
        self.inner.lock().log.events.len()
    }
}
