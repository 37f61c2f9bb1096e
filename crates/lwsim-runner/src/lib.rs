//! # lwsim-runner library
//!
//! The discrete-event kernel of the lwsim LoRaWAN simulator and the pieces
//! it drives: gateways with their capture engines, end devices, the network
//! server, and the downlink scheduler.
//!
//! A run is fully determined by its model and seed. Build a [`Simulator`]
//! from a loaded model and drive it with [`Simulator::run`] or
//! [`Simulator::step`]:
//!
//! ```rust,ignore
//! let model = lwsim_model::load_model(Path::new("scenario.yaml"))?;
//! let mut sim = Simulator::new(&model)?;
//! let stats = sim.run(SimTime::from_secs(model.simulation.duration_s))?;
//! println!("{}", serde_json::to_string_pretty(&stats)?);
//! ```

pub mod adr;
pub mod downlink_scheduler;
pub mod event_log;
pub mod event_queue;
pub mod gateway;
pub mod mobility;
pub mod network_server;
pub mod node;
pub mod simulator;

pub use adr::{strategy_by_name, AdrStrategy};
pub use downlink_scheduler::{DownlinkFrame, DownlinkScheduler, FrameKind, ScheduledDownlink};
pub use event_log::{EventLog, EventLogRow};
pub use event_queue::EventQueue;
pub use gateway::{Gateway, GatewayReception};
pub use lwsim_common::SimTime;
pub use network_server::NetworkServer;
pub use node::EndDevice;
pub use simulator::Simulator;

use lwsim_common::DeviceClass;
use lwsim_model::Model;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during simulation.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Model error.
    #[error("Model error: {0}")]
    Model(#[from] lwsim_model::ModelError),

    /// Simulation error.
    #[error("Simulation error: {0}")]
    Simulation(#[from] lwsim_common::SimError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// ============================================================================
// Simulation Statistics
// ============================================================================

/// Per-node statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeStats {
    /// Device class.
    pub class: DeviceClass,
    /// Uplinks transmitted, retransmissions included.
    pub sent: u64,
    /// Uplinks decoded by at least one gateway.
    pub delivered: u64,
    /// Uplinks lost to interference.
    pub collision_losses: u64,
    /// Uplinks no gateway could hear.
    pub no_coverage: u64,
    /// Retransmissions of unacknowledged confirmed uplinks.
    pub retransmissions: u64,
    /// Downlinks received in a receive window or ping slot.
    pub downlinks_received: u64,
    /// Packet delivery ratio, `delivered / sent`.
    pub pdr: f64,
}

/// Statistics collected during simulation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationStats {
    /// Total events processed.
    pub total_events: u64,
    /// Uplinks transmitted.
    pub uplinks_sent: u64,
    /// Uplinks decoded by at least one gateway.
    pub uplinks_delivered: u64,
    /// Uplinks lost to interference.
    pub collision_losses: u64,
    /// Uplinks no gateway could hear.
    pub no_coverage: u64,
    /// Distinct uplinks accepted by the network server.
    pub server_packets_received: u64,
    /// Extra gateway copies dropped by deduplication.
    pub duplicates: u64,
    /// Retransmissions of confirmed uplinks.
    pub retransmissions: u64,
    /// Downlinks placed by the scheduler, beacons excluded.
    pub downlinks_scheduled: u64,
    /// Downlinks received by their node.
    pub downlinks_delivered: u64,
    /// Downlinks still queued when the snapshot was taken.
    pub downlinks_undelivered: u64,
    /// Class B downlinks dropped for want of a ping slot.
    pub downlinks_dropped: u64,
    /// Beacons transmitted.
    pub beacons_sent: u64,
    /// ADR commands issued.
    pub adr_commands: u64,
    /// Join accepts issued.
    pub join_accepts: u64,
    /// Final simulation time in seconds.
    pub simulation_time_s: f64,
    /// Per-node breakdown, keyed by node id.
    pub nodes: BTreeMap<u64, NodeStats>,
}

impl SimulationStats {
    /// Network-wide packet delivery ratio.
    pub fn pdr(&self) -> f64 {
        if self.uplinks_sent == 0 {
            0.0
        } else {
            self.uplinks_delivered as f64 / self.uplinks_sent as f64
        }
    }
}

// ============================================================================
// Entry Points
// ============================================================================

/// Build a simulator for a model.
pub fn build_simulation(model: &Model) -> Result<Simulator, RunnerError> {
    Simulator::new(model)
}

/// Run a model for its configured duration.
pub fn run_model(
    model: &Model,
    stop_flag: Option<Arc<AtomicBool>>,
) -> Result<SimulationStats, RunnerError> {
    let mut sim = build_simulation(model)?;
    let until = SimTime::from_secs(model.simulation.duration_s);
    Ok(sim.run_with_stop_flag(until, stop_flag)?)
}
