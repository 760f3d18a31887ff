//! Event Bus implementation: broadcast fan-out (the teacher's
//! `EventBus`/`SinkPool` dummy-receiver idiom) extended with a monotonic
//! sequence counter and a bounded replay ring (spec §4.3, SPEC_FULL §D).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;

use super::event::{Event, EventKind};

/// A gap marker delivered to one lagging subscriber; other subscribers are
/// unaffected (spec §4.3, §8 boundary behavior).
#[derive(Debug, Clone, Copy)]
pub struct Gap {
    pub from: u64,
}

/// What a subscriber receives from the bus: either a replayed/live event,
/// or a gap notice for messages this subscriber alone missed.
#[derive(Debug, Clone)]
pub enum BusMessage {
    Event(Event),
    Gap(Gap),
}

struct EventBusInner {
    sender: broadcast::Sender<Event>,
    _receiver: broadcast::Receiver<Event>,
    ring: RwLock<VecDeque<Event>>,
    capacity: usize,
    sequence: AtomicU64,
}

/// In-process fan-out of domain events (C3). Cheap to clone; clones share
/// the same ring and sequence counter.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl EventBus {
    /// `capacity` is `event_buffer_size` from the Agent Configuration; the
    /// live broadcast channel tracks it directly so a slow subscriber lags
    /// at exactly that many unread events (spec §8 boundary behavior).
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(EventBusInner {
                sender,
                _receiver,
                ring: RwLock::new(VecDeque::with_capacity(capacity)),
                capacity,
                sequence: AtomicU64::new(0),
            }),
        }
    }

    /// Assign the next sequence number, push to the replay ring, and fan
    /// out to all live subscribers. Never blocks: subscribers that can't
    /// keep up lag independently (see `subscribe`).
    pub fn emit(&self, kind: EventKind, container_id: Option<String>, payload: Value) -> Event {
        let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let event = Event::new(sequence, kind, container_id, payload);

        {
            let mut ring = self.inner.ring.write();
            if ring.len() >= self.inner.capacity {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }

        // No receivers is not an error: the emitter never blocks on a
        // slow/absent subscriber.
        let _ = self.inner.sender.send(event.clone());
        event
    }

    pub fn emit_agent_started(&self) -> Event {
        self.emit(EventKind::AgentStarted, None, serde_json::json!({}))
    }

    pub fn emit_agent_stopped(&self) -> Event {
        self.emit(EventKind::AgentStopped, None, serde_json::json!({}))
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }

    pub fn current_sequence(&self) -> u64 {
        self.inner.sequence.load(Ordering::SeqCst)
    }

    /// Replay any buffered events with sequence ≥ `from_sequence` (if still
    /// in the ring), returning them alongside a live receiver for whatever
    /// comes next. `from_sequence = None` subscribes to only live events.
    pub fn subscribe(&self, from_sequence: Option<u64>) -> (Vec<Event>, broadcast::Receiver<Event>) {
        let receiver = self.inner.sender.subscribe();
        let replay = match from_sequence {
            Some(from) => {
                let ring = self.inner.ring.read();
                ring.iter().filter(|e| e.sequence >= from).cloned().collect()
            }
            None => Vec::new(),
        };
        (replay, receiver)
    }
}

/// Turn a `broadcast::Receiver` lag into the "gap starting at sequence N"
/// control message spec §4.3 calls for, tracking the last sequence this
/// particular subscriber actually observed.
pub struct GapTrackingReceiver {
    receiver: broadcast::Receiver<Event>,
    last_delivered: u64,
}

impl GapTrackingReceiver {
    pub fn new(receiver: broadcast::Receiver<Event>, last_delivered: u64) -> Self {
        Self { receiver, last_delivered }
    }

    pub async fn recv(&mut self) -> Option<BusMessage> {
        match self.receiver.recv().await {
            Ok(event) => {
                self.last_delivered = event.sequence;
                Some(BusMessage::Event(event))
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {
                Some(BusMessage::Gap(Gap { from: self.last_delivered + 1 }))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequence_is_monotonic_and_starts_at_one() {
        let bus = EventBus::new(16);
        let e1 = bus.emit(EventKind::AgentStarted, None, serde_json::json!({}));
        let e2 = bus.emit(EventKind::AgentStopped, None, serde_json::json!({}));
        assert_eq!(e1.sequence, 1);
        assert_eq!(e2.sequence, 2);
    }

    #[tokio::test]
    async fn subscribe_from_zero_replays_ring() {
        let bus = EventBus::new(16);
        bus.emit(EventKind::AgentStarted, None, serde_json::json!({}));
        bus.emit(EventKind::AgentStopped, None, serde_json::json!({}));
        let (replay, _rx) = bus.subscribe(Some(0));
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].sequence, 1);
    }

    #[tokio::test]
    async fn ring_evicts_oldest_past_capacity() {
        let bus = EventBus::new(2);
        bus.emit(EventKind::AgentStarted, None, serde_json::json!({}));
        bus.emit(EventKind::AgentStarted, None, serde_json::json!({}));
        bus.emit(EventKind::AgentStarted, None, serde_json::json!({}));
        let (replay, _rx) = bus.subscribe(Some(0));
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].sequence, 2);
        assert_eq!(replay[1].sequence, 3);
    }

    #[tokio::test]
    async fn lagged_subscriber_receives_gap_not_block() {
        let bus = EventBus::new(4);
        let (_, rx) = bus.subscribe(None);
        let mut tracking = GapTrackingReceiver::new(rx, 0);

        for _ in 0..10 {
            bus.emit(EventKind::AgentStarted, None, serde_json::json!({}));
        }

        match tracking.recv().await {
            Some(BusMessage::Gap(g)) => assert_eq!(g.from, 1),
            other => panic!("expected a gap, got {other:?}"),
        }
    }
}
