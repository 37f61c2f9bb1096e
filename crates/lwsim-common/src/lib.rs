//! # lwsim-common
//!
//! Common types for the lwsim LoRaWAN network simulator.
//!
//! This crate provides core simulation primitives including:
//! - Time representation ([`SimTime`]) and optional tick quantization ([`TimeQuantizer`])
//! - Identifiers ([`NodeId`], [`GatewayId`], [`EventId`])
//! - Event system ([`Event`], [`EventKind`], [`EventPayload`])
//! - The shared error type ([`SimError`])
//! - Deterministic random number generation ([`seeded_rng`])

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Simulation errors.
#[derive(Debug, Error)]
pub enum SimError {
    /// Node not found.
    #[error("Node not found: {0}")]
    UnknownNode(NodeId),

    /// Gateway not found.
    #[error("Gateway not found: {0}")]
    UnknownGateway(GatewayId),

    /// An event was scheduled before the current simulation clock.
    #[error("Event scheduled at {event_time} but the clock is already at {now}")]
    TimeWentBackwards {
        /// Requested event time.
        event_time: SimTime,
        /// Current simulation time.
        now: SimTime,
    },

    /// No Class B ping slot could be found for a downlink.
    #[error("Scheduling infeasible for node {node}: no free ping slot after {attempts} attempts")]
    PingSlotExhausted {
        /// Node the downlink was destined for.
        node: NodeId,
        /// Number of ping slots tried.
        attempts: u32,
    },

    /// A configuration or physical parameter is out of range.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

// ============================================================================
// Time Types
// ============================================================================

/// Simulation time in seconds since simulation start.
///
/// Times are totally ordered (`f64::total_cmp`), so they can key a heap.
/// Construct through [`SimTime::from_secs`] or a [`TimeQuantizer`] so that
/// equal logical instants compare equal.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SimTime(f64);

impl SimTime {
    /// Zero time.
    pub const ZERO: SimTime = SimTime(0.0);

    /// Create from seconds.
    pub fn from_secs(s: f64) -> Self {
        debug_assert!(!s.is_nan(), "simulation time must not be NaN");
        // Normalise -0.0 so it compares equal to 0.0 under total_cmp.
        SimTime(s + 0.0)
    }

    /// Create from milliseconds.
    pub fn from_millis(ms: u64) -> Self {
        SimTime::from_secs(ms as f64 / 1_000.0)
    }

    /// Create from microseconds.
    pub fn from_micros(us: u64) -> Self {
        SimTime::from_secs(us as f64 / 1_000_000.0)
    }

    /// Get as seconds.
    pub fn as_secs(&self) -> f64 {
        self.0
    }

    /// Get as whole microseconds (rounded).
    pub fn as_micros(&self) -> i64 {
        (self.0 * 1_000_000.0).round() as i64
    }

    /// The later of two instants.
    pub fn max(self, other: SimTime) -> SimTime {
        if other > self {
            other
        } else {
            self
        }
    }

    /// The earlier of two instants.
    pub fn min(self, other: SimTime) -> SimTime {
        if other < self {
            other
        } else {
            self
        }
    }

    /// Absolute distance between two instants, in seconds.
    pub fn abs_diff(self, other: SimTime) -> f64 {
        (self.0 - other.0).abs()
    }
}

impl PartialEq for SimTime {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SimTime {}

impl PartialOrd for SimTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SimTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl std::ops::Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Self) -> Self::Output {
        SimTime::from_secs(self.0 + rhs.0)
    }
}

impl std::ops::Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: Self) -> Self::Output {
        SimTime::from_secs(self.0 - rhs.0)
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}s", self.0)
    }
}

/// Optional quantization of simulation time to a fixed tick.
///
/// Without a tick every time is kept as a continuous second count. With
/// `tick_ns` every scheduled time is rounded to the nearest multiple of
/// `tick_ns` nanoseconds before it enters the event queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeQuantizer {
    tick_ns: Option<u64>,
}

impl TimeQuantizer {
    /// Continuous time (no quantization).
    pub fn continuous() -> Self {
        TimeQuantizer { tick_ns: None }
    }

    /// Quantize to multiples of `tick_ns` nanoseconds.
    pub fn with_tick_ns(tick_ns: u64) -> Result<Self, SimError> {
        if tick_ns == 0 {
            return Err(SimError::InvalidParameter(
                "tick_ns must be a positive number of nanoseconds".to_string(),
            ));
        }
        Ok(TimeQuantizer {
            tick_ns: Some(tick_ns),
        })
    }

    /// Build from an optional tick, validating it.
    pub fn from_option(tick_ns: Option<u64>) -> Result<Self, SimError> {
        match tick_ns {
            Some(tick) => Self::with_tick_ns(tick),
            None => Ok(Self::continuous()),
        }
    }

    /// The configured tick, if any.
    pub fn tick_ns(&self) -> Option<u64> {
        self.tick_ns
    }

    /// Quantize a time.
    pub fn quantize(&self, time: SimTime) -> SimTime {
        match self.tick_ns {
            None => time,
            Some(tick_ns) => {
                let tick = tick_ns as f64;
                let ticks = (time.as_secs() * 1e9 / tick).round();
                SimTime::from_secs(ticks * tick / 1e9)
            }
        }
    }

    /// Quantize a time given in seconds.
    pub fn quantize_secs(&self, secs: f64) -> SimTime {
        self.quantize(SimTime::from_secs(secs))
    }
}

// ============================================================================
// Identifier Types
// ============================================================================

/// Identifier of an end device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Placeholder node id for network-wide events (beacons).
    pub const BROADCAST: NodeId = NodeId(u64::MAX);

    /// Create a new node ID.
    pub fn new(id: u64) -> Self {
        NodeId(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == NodeId::BROADCAST {
            write!(f, "broadcast")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Identifier of a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GatewayId(pub u64);

impl GatewayId {
    /// Create a new gateway ID.
    pub fn new(id: u64) -> Self {
        GatewayId(id)
    }
}

impl fmt::Display for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an event.
///
/// A transmission's `TxStart` and `TxEnd` events share one id, which is also
/// the id the network server deduplicates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Devices
// ============================================================================

/// LoRaWAN device class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    /// Receives only in the two windows after each uplink.
    #[default]
    A,
    /// Additionally listens in beacon-synchronised ping slots.
    B,
    /// Listens continuously.
    C,
}

impl DeviceClass {
    /// Metric label value.
    pub const fn as_label(self) -> &'static str {
        match self {
            DeviceClass::A => "class_a",
            DeviceClass::B => "class_b",
            DeviceClass::C => "class_c",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Planar position in metres.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Position {
    /// East coordinate.
    pub x: f64,
    /// North coordinate.
    pub y: f64,
}

impl Position {
    /// Create a position.
    pub const fn new(x: f64, y: f64) -> Self {
        Position { x, y }
    }

    /// Euclidean distance in metres.
    pub fn distance_to(&self, other: &Position) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Kind of a simulation event.
///
/// The declaration order is the tie-break rank for events sharing a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A node starts an uplink transmission.
    TxStart,
    /// An uplink transmission ends.
    TxEnd,
    /// A node moves.
    Mobility,
    /// A Class A receive window opens, or a Class C node wakes for a queued frame.
    RxWindow,
    /// A beacon period starts.
    Beacon,
    /// A Class B ping slot opens.
    PingSlot,
    /// A gateway's copy of an uplink reaches the network server.
    ServerRx,
    /// The network server processes a deduplicated uplink.
    ServerProcess,
}

impl EventKind {
    /// Tie-break rank among events at the same instant.
    pub const fn rank(self) -> u8 {
        match self {
            EventKind::TxStart => 0,
            EventKind::TxEnd => 1,
            EventKind::Mobility => 2,
            EventKind::RxWindow => 3,
            EventKind::Beacon => 4,
            EventKind::PingSlot => 5,
            EventKind::ServerRx => 6,
            EventKind::ServerProcess => 7,
        }
    }

    /// Lowercase label for logs and metrics.
    pub const fn as_str(self) -> &'static str {
        match self {
            EventKind::TxStart => "tx_start",
            EventKind::TxEnd => "tx_end",
            EventKind::Mobility => "mobility",
            EventKind::RxWindow => "rx_window",
            EventKind::Beacon => "beacon",
            EventKind::PingSlot => "ping_slot",
            EventKind::ServerRx => "server_rx",
            EventKind::ServerProcess => "server_process",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which receive window an `RxWindow` event opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RxWindow {
    /// First Class A window.
    Rx1,
    /// Second Class A window.
    Rx2,
    /// Class C continuous reception, armed for a queued frame.
    ClassC,
}

/// Data carried by an event. Not part of the event ordering.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum EventPayload {
    /// No extra data.
    #[default]
    None,
    /// Receive window being opened.
    RxWindow(RxWindow),
    /// A gateway copy of an uplink forwarded to the network server.
    ServerRx {
        /// The uplink transmission.
        uplink: EventId,
        /// Forwarding gateway.
        gateway: GatewayId,
    },
    /// Deferred processing of a deduplicated uplink.
    ServerProcess {
        /// The uplink transmission.
        uplink: EventId,
    },
}

/// A simulation event.
///
/// Events are totally ordered by `(time, kind rank, id, node_id)`. The
/// payload does not take part in the ordering.
#[derive(Debug, Clone)]
pub struct Event {
    /// Time when the event occurs.
    pub time: SimTime,
    /// Kind of event.
    pub kind: EventKind,
    /// Event id.
    pub id: EventId,
    /// Node the event concerns ([`NodeId::BROADCAST`] for network-wide events).
    pub node_id: NodeId,
    /// Event payload.
    pub payload: EventPayload,
}

impl Event {
    /// Create an event without payload.
    pub fn new(time: SimTime, kind: EventKind, id: EventId, node_id: NodeId) -> Self {
        Event {
            time,
            kind,
            id,
            node_id,
            payload: EventPayload::None,
        }
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: EventPayload) -> Self {
        self.payload = payload;
        self
    }

    /// The ordering key `(time, kind rank, id, node_id)`.
    pub fn sort_key(&self) -> (SimTime, u8, EventId, NodeId) {
        (self.time, self.kind.rank(), self.id, self.node_id)
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest event first)
        other.sort_key().cmp(&self.sort_key())
    }
}

// ============================================================================
// Random Numbers
// ============================================================================

/// Random number generator used throughout the simulation.
pub type SimRng = ChaCha8Rng;

/// Create the deterministic simulation RNG for a seed.
pub fn seeded_rng(seed: u64) -> SimRng {
    ChaCha8Rng::seed_from_u64(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::collections::BinaryHeap;

    #[test]
    fn test_sim_time_conversions() {
        let time = SimTime::from_secs(1.5);
        assert_eq!(time.as_micros(), 1_500_000);
        assert_eq!(SimTime::from_millis(1500), time);
        assert_eq!(SimTime::from_micros(250), SimTime::from_secs(0.00025));
    }

    #[test]
    fn test_sim_time_arithmetic() {
        let t1 = SimTime::from_millis(100);
        let t2 = SimTime::from_millis(50);
        assert_eq!((t1 + t2).as_micros(), 150_000);
        assert_eq!((t1 - t2).as_micros(), 50_000);
        assert_eq!(t1.max(t2), t1);
        assert_eq!(t1.min(t2), t2);
    }

    #[test]
    fn test_negative_zero_equals_zero() {
        assert_eq!(SimTime::from_secs(-0.0), SimTime::ZERO);
    }

    #[test]
    fn test_quantizer_rounds_to_tick() {
        let q = TimeQuantizer::with_tick_ns(1_000).unwrap();
        assert_eq!(q.quantize_secs(0.000_001_4), SimTime::from_secs(0.000_001));
        assert_eq!(q.quantize_secs(0.000_001_6), SimTime::from_secs(0.000_002));
        // Two different float paths to the same instant compare equal.
        assert_eq!(q.quantize_secs(0.1 + 0.2), q.quantize_secs(0.3));
    }

    #[test]
    fn test_quantizer_rejects_zero_tick() {
        assert!(matches!(
            TimeQuantizer::with_tick_ns(0),
            Err(SimError::InvalidParameter(_))
        ));
        assert!(TimeQuantizer::from_option(None).unwrap().tick_ns().is_none());
    }

    #[test]
    fn test_event_heap_pops_by_total_order() {
        let t = SimTime::from_secs(1.0);
        let mut heap = BinaryHeap::new();
        heap.push(Event::new(t, EventKind::RxWindow, EventId(1), NodeId(0)));
        heap.push(Event::new(t, EventKind::TxEnd, EventId(9), NodeId(0)));
        heap.push(Event::new(t, EventKind::TxEnd, EventId(3), NodeId(5)));
        heap.push(Event::new(t, EventKind::TxEnd, EventId(3), NodeId(2)));
        heap.push(Event::new(SimTime::from_secs(0.5), EventKind::ServerProcess, EventId(100), NodeId(0)));

        let order: Vec<_> = std::iter::from_fn(|| heap.pop())
            .map(|e| (e.kind, e.id.0, e.node_id.0))
            .collect();
        assert_eq!(
            order,
            vec![
                (EventKind::ServerProcess, 100, 0),
                (EventKind::TxEnd, 3, 2),
                (EventKind::TxEnd, 3, 5),
                (EventKind::TxEnd, 9, 0),
                (EventKind::RxWindow, 1, 0),
            ]
        );
    }

    #[test]
    fn test_payload_does_not_affect_ordering() {
        let t = SimTime::from_secs(2.0);
        let a = Event::new(t, EventKind::ServerRx, EventId(4), NodeId(1));
        let b = a.clone().with_payload(EventPayload::ServerProcess { uplink: EventId(7) });
        assert_eq!(a, b);
    }

    #[test]
    fn test_kind_ranks_are_distinct_and_ordered() {
        let kinds = [
            EventKind::TxStart,
            EventKind::TxEnd,
            EventKind::Mobility,
            EventKind::RxWindow,
            EventKind::Beacon,
            EventKind::PingSlot,
            EventKind::ServerRx,
            EventKind::ServerProcess,
        ];
        for pair in kinds.windows(2) {
            assert!(pair[0].rank() < pair[1].rank());
        }
    }

    #[test]
    fn test_position_distance() {
        let a = Position::new(0.0, 0.0);
        let b = Position::new(300.0, 400.0);
        assert_eq!(a.distance_to(&b), 500.0);
    }

    #[test]
    fn test_seeded_rng_is_reproducible() {
        let mut a = seeded_rng(42);
        let mut b = seeded_rng(42);
        let xs: Vec<u32> = (0..8).map(|_| a.gen()).collect();
        let ys: Vec<u32> = (0..8).map(|_| b.gen()).collect();
        assert_eq!(xs, ys);
    }
}
