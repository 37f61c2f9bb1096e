//! Propagation models.
//!
//! The kernel only talks to a [`Channel`]; it never inspects how RSSI is
//! produced.

use crate::{sample_gaussian, thermal_noise_dbm, time_on_air, LoraParams};
use lwsim_common::{GatewayId, NodeId, SimRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything a channel model may use to compute one link budget.
#[derive(Debug, Clone, Copy)]
pub struct LinkContext {
    /// Transmitting node.
    pub node: NodeId,
    /// Receiving gateway.
    pub gateway: GatewayId,
    /// Distance between node and gateway in metres.
    pub distance_m: f64,
    /// Transmit power in dBm.
    pub tx_power_dbm: f64,
    /// Carrier frequency in Hz.
    pub frequency_hz: u32,
    /// Radio settings of the transmission.
    pub params: LoraParams,
}

/// Propagation and noise collaborator.
pub trait Channel: Send {
    /// Received signal strength and SNR, in dBm and dB, for one link.
    fn compute_rssi(&self, link: &LinkContext, rng: &mut SimRng) -> (f64, f64);

    /// Time on air in seconds.
    fn airtime(&self, params: &LoraParams, payload_len: usize) -> f64 {
        time_on_air(params, payload_len)
    }

    /// Receiver noise floor in dBm.
    fn noise_floor_dbm(&self, bandwidth_hz: u32) -> f64;
}

/// Log-distance path loss with optional log-normal shadowing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogDistanceChannel {
    /// Path loss at the reference distance, in dB.
    pub reference_loss_db: f64,
    /// Reference distance in metres.
    pub reference_distance_m: f64,
    /// Path loss exponent.
    pub exponent: f64,
    /// Standard deviation of shadowing in dB (0 disables it).
    pub shadowing_std_db: f64,
    /// Receiver noise figure in dB.
    pub noise_figure_db: f64,
}

impl Default for LogDistanceChannel {
    fn default() -> Self {
        LogDistanceChannel {
            reference_loss_db: 127.41,
            reference_distance_m: 40.0,
            exponent: 2.08,
            shadowing_std_db: 3.57,
            noise_figure_db: 6.0,
        }
    }
}

impl LogDistanceChannel {
    /// Mean path loss in dB at a distance.
    pub fn path_loss_db(&self, distance_m: f64) -> f64 {
        let d = distance_m.max(1.0);
        self.reference_loss_db + 10.0 * self.exponent * (d / self.reference_distance_m).log10()
    }
}

impl Channel for LogDistanceChannel {
    fn compute_rssi(&self, link: &LinkContext, rng: &mut SimRng) -> (f64, f64) {
        let loss = sample_gaussian(rng, self.path_loss_db(link.distance_m), self.shadowing_std_db);
        let rssi = link.tx_power_dbm - loss;
        let snr = rssi - self.noise_floor_dbm(link.params.bandwidth_hz);
        (rssi, snr)
    }

    fn noise_floor_dbm(&self, bandwidth_hz: u32) -> f64 {
        thermal_noise_dbm(bandwidth_hz, self.noise_figure_db)
    }
}

/// Fixed per-link RSSI table. Links missing from the table are never heard.
///
/// Used for scripted scenarios where exact received powers matter more than
/// geometry.
#[derive(Debug, Clone, Default)]
pub struct LinkTableChannel {
    links: BTreeMap<(NodeId, GatewayId), f64>,
    noise_floor_dbm: f64,
    fixed_airtime_s: Option<f64>,
}

impl LinkTableChannel {
    /// Create an empty table with a flat noise floor.
    pub fn new(noise_floor_dbm: f64) -> Self {
        LinkTableChannel {
            links: BTreeMap::new(),
            noise_floor_dbm,
            fixed_airtime_s: None,
        }
    }

    /// Add or replace the RSSI of one link.
    pub fn with_link(mut self, node: NodeId, gateway: GatewayId, rssi_dbm: f64) -> Self {
        self.set_link(node, gateway, rssi_dbm);
        self
    }

    /// Use the same airtime for every frame instead of the LoRa formula.
    pub fn with_fixed_airtime(mut self, airtime_s: f64) -> Self {
        self.fixed_airtime_s = Some(airtime_s);
        self
    }

    /// Add or replace the RSSI of one link.
    pub fn set_link(&mut self, node: NodeId, gateway: GatewayId, rssi_dbm: f64) {
        self.links.insert((node, gateway), rssi_dbm);
    }

    /// Number of configured links.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

impl Channel for LinkTableChannel {
    fn compute_rssi(&self, link: &LinkContext, _rng: &mut SimRng) -> (f64, f64) {
        let rssi = self
            .links
            .get(&(link.node, link.gateway))
            .copied()
            .unwrap_or(f64::NEG_INFINITY);
        (rssi, rssi - self.noise_floor_dbm)
    }

    fn airtime(&self, params: &LoraParams, payload_len: usize) -> f64 {
        match self.fixed_airtime_s {
            Some(airtime) => airtime,
            None => time_on_air(params, payload_len),
        }
    }

    fn noise_floor_dbm(&self, _bandwidth_hz: u32) -> f64 {
        self.noise_floor_dbm
    }
}
