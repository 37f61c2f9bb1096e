//! Global event heap.

use lwsim_common::{Event, EventId, EventKind, EventPayload, NodeId, SimTime, TimeQuantizer};
use std::collections::BinaryHeap;

/// Min-heap of pending events with time quantization and id allocation.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Event>,
    quantizer: TimeQuantizer,
    next_id: u64,
}

impl EventQueue {
    /// Create an empty queue.
    pub fn new(quantizer: TimeQuantizer) -> Self {
        EventQueue {
            heap: BinaryHeap::new(),
            quantizer,
            next_id: 0,
        }
    }

    /// The quantizer applied to every scheduled time.
    pub fn quantizer(&self) -> TimeQuantizer {
        self.quantizer
    }

    /// Allocate a fresh event id.
    pub fn next_id(&mut self) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Insert an event after quantizing its time.
    pub fn schedule(&mut self, mut event: Event) {
        event.time = self.quantizer.quantize(event.time);
        self.heap.push(event);
    }

    /// Schedule a new event with a fresh id and return the id.
    pub fn schedule_new(
        &mut self,
        time: SimTime,
        kind: EventKind,
        node_id: NodeId,
        payload: EventPayload,
    ) -> EventId {
        let id = self.next_id();
        self.schedule(Event::new(time, kind, id, node_id).with_payload(payload));
        id
    }

    /// Remove the earliest event.
    pub fn pop(&mut self) -> Option<Event> {
        self.heap.pop()
    }

    /// Time of the earliest event.
    pub fn peek_time(&self) -> Option<SimTime> {
        self.heap.peek().map(|e| e.time)
    }

    /// Number of pending events.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether no events are pending.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
