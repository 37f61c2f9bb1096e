//! Metrics for the lwsim LoRaWAN simulator.
//!
//! Every metric the simulator emits is declared once in [`metric_defs`] as a
//! [`Metric`] constant, so names cannot drift between emitters and the
//! `lwsim metrics` listing. Emission goes through the `metrics` facade; with
//! no recorder installed it is a no-op.
//!
//! ```rust,ignore
//! use lwsim_metrics::{metric_defs, metrics, MetricLabels};
//!
//! let labels = MetricLabels::new("7", "class_a");
//! metrics::counter!(metric_defs::UPLINK_SENT.name, &labels.to_labels()).increment(1);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// The kind of metric (counter, gauge, or histogram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// A monotonically increasing counter.
    Counter,
    /// A gauge that can go up and down.
    Gauge,
    /// A histogram for recording distributions.
    Histogram,
}

impl MetricKind {
    /// Returns the kind as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metric declaration with its metadata.
///
/// ```rust
/// use lwsim_metrics::{Metric, MetricKind};
/// use metrics::Unit;
///
/// const FRAMES: Metric = Metric::counter("lwsim.example.frames")
///     .with_description("Frames seen")
///     .with_unit(Unit::Count)
///     .with_labels(&["gateway"]);
///
/// assert_eq!(FRAMES.kind, MetricKind::Counter);
/// ```
#[derive(Debug, Clone)]
pub struct Metric {
    /// The metric name (e.g., "lwsim.uplink.sent").
    pub name: &'static str,
    /// The kind of metric.
    pub kind: MetricKind,
    /// Human-readable description.
    pub description: &'static str,
    /// The unit of measurement (optional).
    pub unit: Option<Unit>,
    /// Expected label keys.
    pub labels: &'static [&'static str],
}

impl Metric {
    const fn with_kind(name: &'static str, kind: MetricKind) -> Self {
        Self {
            name,
            kind,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Declare a counter.
    pub const fn counter(name: &'static str) -> Self {
        Self::with_kind(name, MetricKind::Counter)
    }

    /// Declare a gauge.
    pub const fn gauge(name: &'static str) -> Self {
        Self::with_kind(name, MetricKind::Gauge)
    }

    /// Declare a histogram.
    pub const fn histogram(name: &'static str) -> Self {
        Self::with_kind(name, MetricKind::Histogram)
    }

    /// Sets the description.
    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Sets the unit.
    pub const fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Sets the expected label keys.
    pub const fn with_labels(mut self, labels: &'static [&'static str]) -> Self {
        self.labels = labels;
        self
    }

    /// Registers this metric's description with the installed recorder.
    pub fn describe(&self) {
        match (self.kind, self.unit) {
            (MetricKind::Counter, Some(unit)) => describe_counter!(self.name, unit, self.description),
            (MetricKind::Counter, None) => describe_counter!(self.name, self.description),
            (MetricKind::Gauge, Some(unit)) => describe_gauge!(self.name, unit, self.description),
            (MetricKind::Gauge, None) => describe_gauge!(self.name, self.description),
            (MetricKind::Histogram, Some(unit)) => {
                describe_histogram!(self.name, unit, self.description)
            }
            (MetricKind::Histogram, None) => describe_histogram!(self.name, self.description),
        }
    }

    /// Returns the unit as a human-readable string.
    pub fn unit_str(&self) -> &'static str {
        match self.unit {
            Some(Unit::Count) => "count",
            Some(Unit::Percent) => "percent",
            Some(Unit::Seconds) => "seconds",
            Some(Unit::Milliseconds) => "milliseconds",
            Some(Unit::Microseconds) => "microseconds",
            Some(Unit::Bytes) => "bytes",
            Some(_) => "other",
            None => "",
        }
    }
}

/// All metric definitions for the simulator.
pub mod metric_defs {
    use super::{Metric, Unit};

    /// Labels present on all node-scoped metrics.
    pub const NODE_LABELS: &[&str] = &["node", "node_class"];

    /// Labels present on all gateway-scoped metrics.
    pub const GATEWAY_LABELS: &[&str] = &["gateway"];

    // ========================================================================
    // Uplink
    // ========================================================================

    /// Uplink transmissions started.
    pub const UPLINK_SENT: Metric = Metric::counter("lwsim.uplink.sent")
        .with_description("Uplink transmissions started")
        .with_unit(Unit::Count)
        .with_labels(&["node", "node_class", "sf"]);

    /// Uplinks decoded by at least one gateway.
    pub const UPLINK_DELIVERED: Metric = Metric::counter("lwsim.uplink.delivered")
        .with_description("Uplinks decoded by at least one gateway")
        .with_unit(Unit::Count)
        .with_labels(&["node", "node_class", "sf"]);

    /// Uplinks heard but lost to interference everywhere.
    pub const UPLINK_COLLISION_LOSS: Metric = Metric::counter("lwsim.uplink.collision_loss")
        .with_description("Uplinks heard but lost to interference")
        .with_unit(Unit::Count)
        .with_labels(&["node", "node_class", "sf"]);

    /// Uplinks no gateway could detect.
    pub const UPLINK_NO_COVERAGE: Metric = Metric::counter("lwsim.uplink.no_coverage")
        .with_description("Uplinks no gateway detected")
        .with_unit(Unit::Count)
        .with_labels(&["node", "node_class", "sf"]);

    /// Confirmed-uplink retransmissions.
    pub const UPLINK_RETRANSMISSIONS: Metric = Metric::counter("lwsim.uplink.retransmissions")
        .with_description("Confirmed uplink retransmissions")
        .with_unit(Unit::Count)
        .with_labels(&["node", "node_class"]);

    /// Uplink airtime in microseconds.
    pub const UPLINK_AIRTIME: Metric = Metric::counter("lwsim.uplink.airtime_us")
        .with_description("Total uplink airtime in microseconds")
        .with_unit(Unit::Microseconds)
        .with_labels(&["node", "node_class", "sf"]);

    // ========================================================================
    // Gateway
    // ========================================================================

    /// Receptions a gateway decoded.
    pub const GATEWAY_RECEIVED: Metric = Metric::counter("lwsim.gateway.received")
        .with_description("Uplinks decoded by the gateway")
        .with_unit(Unit::Count)
        .with_labels(&["gateway", "sf"]);

    /// Receptions a gateway detected but lost.
    pub const GATEWAY_COLLISIONS: Metric = Metric::counter("lwsim.gateway.collisions")
        .with_description("Detected receptions lost to interference")
        .with_unit(Unit::Count)
        .with_labels(&["gateway", "sf"]);

    /// RSSI of decoded uplinks.
    pub const GATEWAY_RSSI: Metric = Metric::histogram("lwsim.gateway.rssi_dbm")
        .with_description("RSSI of decoded uplinks in dBm")
        .with_labels(&["gateway"]);

    /// Interference-aware SNR of decoded uplinks.
    pub const GATEWAY_SNIR: Metric = Metric::histogram("lwsim.gateway.snir_db")
        .with_description("SNIR of decoded uplinks in dB")
        .with_labels(&["gateway"]);

    /// In-flight candidate receptions.
    pub const GATEWAY_ACTIVE_RECEPTIONS: Metric = Metric::gauge("lwsim.gateway.active_receptions")
        .with_description("Candidate receptions currently in flight")
        .with_unit(Unit::Count)
        .with_labels(&["gateway"]);

    // ========================================================================
    // Downlink
    // ========================================================================

    /// Downlink frames placed on a gateway's airtime.
    pub const DOWNLINK_SCHEDULED: Metric = Metric::counter("lwsim.downlink.scheduled")
        .with_description("Downlink frames scheduled")
        .with_unit(Unit::Count)
        .with_labels(&["node", "node_class", "frame"]);

    /// Downlink frames handed to a node.
    pub const DOWNLINK_DELIVERED: Metric = Metric::counter("lwsim.downlink.delivered")
        .with_description("Downlink frames delivered to nodes")
        .with_unit(Unit::Count)
        .with_labels(&["node", "node_class", "frame"]);

    /// Delay between a downlink request and its transmit time.
    pub const DOWNLINK_DELAY: Metric = Metric::histogram("lwsim.downlink.delay_s")
        .with_description("Delay from downlink request to transmission")
        .with_unit(Unit::Seconds)
        .with_labels(&["node_class"]);

    /// Class B beacons transmitted.
    pub const DOWNLINK_BEACONS: Metric = Metric::counter("lwsim.downlink.beacons")
        .with_description("Beacons transmitted")
        .with_unit(Unit::Count)
        .with_labels(&["gateway"]);

    // ========================================================================
    // Network Server
    // ========================================================================

    /// Unique uplinks the server processed.
    pub const SERVER_UPLINKS: Metric = Metric::counter("lwsim.server.uplinks")
        .with_description("Unique uplinks received by the network server")
        .with_unit(Unit::Count);

    /// Extra copies of an uplink received through other gateways.
    pub const SERVER_DUPLICATES: Metric = Metric::counter("lwsim.server.duplicates")
        .with_description("Duplicate uplink copies")
        .with_unit(Unit::Count);

    /// ACKs issued for confirmed uplinks.
    pub const SERVER_ACKS: Metric = Metric::counter("lwsim.server.acks")
        .with_description("ACKs issued for confirmed uplinks")
        .with_unit(Unit::Count);

    /// Join accepts issued.
    pub const SERVER_JOIN_ACCEPTS: Metric = Metric::counter("lwsim.server.join_accepts")
        .with_description("Join accepts issued")
        .with_unit(Unit::Count);

    // ========================================================================
    // ADR
    // ========================================================================

    /// ADR commands issued.
    pub const ADR_COMMANDS: Metric = Metric::counter("lwsim.adr.commands")
        .with_description("LinkADRReq commands issued")
        .with_unit(Unit::Count)
        .with_labels(&["node", "strategy"]);

    // ========================================================================
    // Simulation
    // ========================================================================

    /// Events dispatched by the kernel.
    pub const SIM_EVENTS: Metric = Metric::counter("lwsim.simulation.events")
        .with_description("Events dispatched")
        .with_unit(Unit::Count)
        .with_labels(&["kind"]);

    /// Pending events in the queue.
    pub const SIM_QUEUE_DEPTH: Metric = Metric::gauge("lwsim.simulation.queue_depth")
        .with_description("Pending events")
        .with_unit(Unit::Count);

    /// Current simulation time.
    pub const SIM_TIME: Metric = Metric::gauge("lwsim.simulation.time_s")
        .with_description("Current simulation time")
        .with_unit(Unit::Seconds);

    /// Returns a slice of all defined metrics.
    pub const ALL: &[&Metric] = &[
        &UPLINK_SENT,
        &UPLINK_DELIVERED,
        &UPLINK_COLLISION_LOSS,
        &UPLINK_NO_COVERAGE,
        &UPLINK_RETRANSMISSIONS,
        &UPLINK_AIRTIME,
        &GATEWAY_RECEIVED,
        &GATEWAY_COLLISIONS,
        &GATEWAY_RSSI,
        &GATEWAY_SNIR,
        &GATEWAY_ACTIVE_RECEPTIONS,
        &DOWNLINK_SCHEDULED,
        &DOWNLINK_DELIVERED,
        &DOWNLINK_DELAY,
        &DOWNLINK_BEACONS,
        &SERVER_UPLINKS,
        &SERVER_DUPLICATES,
        &SERVER_ACKS,
        &SERVER_JOIN_ACCEPTS,
        &ADR_COMMANDS,
        &SIM_EVENTS,
        &SIM_QUEUE_DEPTH,
        &SIM_TIME,
    ];
}

/// Labels attached to node-scoped metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricLabels {
    /// Node identifier.
    pub node: String,
    /// LoRaWAN device class (`class_a`, `class_b`, `class_c`).
    pub node_class: String,
}

impl MetricLabels {
    /// Labels for one node.
    pub fn new(node: impl Into<String>, node_class: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            node_class: node_class.into(),
        }
    }

    /// Converts to the `metrics` crate label format.
    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        vec![
            ("node", self.node.clone()),
            ("node_class", self.node_class.clone()),
        ]
    }

    /// Labels with additional key-value pairs.
    pub fn with(&self, extra: &[(&'static str, String)]) -> Vec<(&'static str, String)> {
        let mut labels = self.to_labels();
        labels.extend_from_slice(extra);
        labels
    }
}

/// Labels for a gateway-scoped metric.
pub fn gateway_labels(gateway: u64) -> Vec<(&'static str, String)> {
    vec![("gateway", gateway.to_string())]
}

/// Registers every metric description with the installed recorder.
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}
