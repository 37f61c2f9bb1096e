//! YAML section types.
//!
//! Every section is optional in a file and falls back to its defaults.

use lwsim_common::{DeviceClass, Position};
use lwsim_phy::{CaptureMode, LogDistanceChannel};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// EU868 default channels.
pub const DEFAULT_FREQUENCIES: [u32; 3] = [868_100_000, 868_300_000, 868_500_000];

// ============================================================================
// Simulation-wide sections
// ============================================================================

/// `simulation:` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationSection {
    /// RNG seed.
    pub seed: u64,
    /// Simulated duration in seconds.
    pub duration_s: f64,
    /// Optional time quantization in nanoseconds.
    pub tick_ns: Option<u64>,
    /// Abort the run on the first collaborator error instead of logging it.
    pub stop_on_first_error: bool,
}

impl Default for SimulationSection {
    fn default() -> Self {
        SimulationSection {
            seed: 0,
            duration_s: 3_600.0,
            tick_ns: None,
            stop_on_first_error: true,
        }
    }
}

/// `capture:` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureSection {
    /// `capture` or `aloha`.
    pub mode: CaptureMode,
    /// Treat different SFs as perfectly orthogonal.
    pub orthogonal_sf: bool,
    /// Clean preamble symbols needed for lock-on.
    pub capture_window_symbols: u32,
    /// Co-SF capture margin in dB.
    pub capture_threshold_db: f64,
    /// Inline 6x6 inter-SF matrix.
    pub matrix: Option<Vec<Vec<f64>>>,
    /// Path to a text file holding the 6x6 matrix.
    pub matrix_file: Option<PathBuf>,
}

impl Default for CaptureSection {
    fn default() -> Self {
        CaptureSection {
            mode: CaptureMode::Capture,
            orthogonal_sf: true,
            capture_window_symbols: 5,
            capture_threshold_db: 6.0,
            matrix: None,
            matrix_file: None,
        }
    }
}

/// `radio:` section: settings shared by every transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RadioSection {
    /// Bandwidth in Hz.
    pub bandwidth_hz: u32,
    /// Coding rate denominator (5-8).
    pub coding_rate: u8,
    /// Preamble length in symbols.
    pub preamble_symbols: u32,
    /// Demodulation SNR floors for SF7-SF12.
    pub snr_thresholds_db: [f64; 6],
    /// Sensitivity override for SF7-SF12.
    pub sensitivity_dbm: Option<[f64; 6]>,
    /// Energy-detection level in dBm.
    pub energy_detection_dbm: Option<f64>,
}

impl Default for RadioSection {
    fn default() -> Self {
        RadioSection {
            bandwidth_hz: 125_000,
            coding_rate: 5,
            preamble_symbols: 8,
            snr_thresholds_db: [-7.5, -10.0, -12.5, -15.0, -17.5, -20.0],
            sensitivity_dbm: None,
            energy_detection_dbm: None,
        }
    }
}

/// `timing:` section. All values in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingSection {
    /// Delay from uplink end to RX1.
    pub rx1_delay_s: f64,
    /// Delay from uplink end to RX2.
    pub rx2_delay_s: f64,
    /// How long a receive window stays open.
    pub rx_window_duration_s: f64,
    /// Fixed latency added to every scheduled downlink.
    pub link_delay_s: f64,
    /// Gateway to network server forwarding delay.
    pub server_rx_delay_s: f64,
    /// Network server deduplication and processing delay.
    pub server_process_delay_s: f64,
    /// Extra wait after RX2 before a confirmed uplink is retried.
    pub ack_timeout_s: f64,
}

impl Default for TimingSection {
    fn default() -> Self {
        TimingSection {
            rx1_delay_s: 1.0,
            rx2_delay_s: 2.0,
            rx_window_duration_s: 0.2,
            link_delay_s: 0.0,
            server_rx_delay_s: 0.01,
            server_process_delay_s: 0.05,
            ack_timeout_s: 2.0,
        }
    }
}

/// `class_b:` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassBSection {
    /// Nominal beacon period in seconds.
    pub beacon_interval_s: f64,
    /// Guard time before each beacon in seconds.
    pub beacon_guard_s: f64,
    /// Relative beacon clock drift (0.0001 stretches each period by 100 ppm).
    pub beacon_drift: f64,
    /// Spacing of a node's ping slots in seconds.
    pub ping_slot_interval_s: f64,
    /// Offset of the first ping slot after the beacon in seconds.
    pub ping_slot_offset_s: f64,
}

impl Default for ClassBSection {
    fn default() -> Self {
        ClassBSection {
            beacon_interval_s: 128.0,
            beacon_guard_s: 3.0,
            beacon_drift: 0.0,
            ping_slot_interval_s: 32.0,
            ping_slot_offset_s: 2.0,
        }
    }
}

impl ClassBSection {
    /// Beacon period after applying the configured drift.
    pub fn effective_beacon_interval_s(&self) -> f64 {
        self.beacon_interval_s * (1.0 + self.beacon_drift)
    }
}

/// One fixed link of a link-table channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkDef {
    /// Node id.
    pub node: u64,
    /// Gateway id.
    pub gateway: u64,
    /// Received power in dBm.
    pub rssi_dbm: f64,
}

/// `channel:` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelSection {
    /// Log-distance path loss with shadowing.
    LogDistance(LogDistanceChannel),
    /// Fixed RSSI per (node, gateway) pair.
    LinkTable {
        /// Flat noise floor in dBm.
        noise_floor_dbm: f64,
        /// Use this airtime for every frame instead of the LoRa formula.
        #[serde(default)]
        fixed_airtime_s: Option<f64>,
        /// Links; missing pairs are never heard.
        #[serde(default)]
        links: Vec<LinkDef>,
    },
}

impl Default for ChannelSection {
    fn default() -> Self {
        ChannelSection::LogDistance(LogDistanceChannel::default())
    }
}

/// `adr:` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdrSection {
    /// Strategy name (`none`, `lorawan-avg`, `lorawan-max`).
    pub strategy: String,
    /// Installation margin in dB.
    pub margin_db: f64,
    /// Uplinks of SNR history before the strategy acts.
    pub history_len: usize,
}

impl Default for AdrSection {
    fn default() -> Self {
        AdrSection {
            strategy: "lorawan-avg".to_string(),
            margin_db: 10.0,
            history_len: 20,
        }
    }
}

// ============================================================================
// Gateways and nodes
// ============================================================================

/// One gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayDef {
    /// Unique gateway id.
    pub id: u64,
    /// Location.
    #[serde(default)]
    pub position: Position,
}

/// Uplink traffic generator of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrafficDef {
    /// Exponential inter-arrival times.
    Poisson {
        /// Mean interval in seconds.
        mean_interval_s: f64,
    },
    /// Fixed interval.
    Periodic {
        /// Interval in seconds.
        interval_s: f64,
        /// First uplink time in seconds.
        #[serde(default)]
        offset_s: f64,
    },
    /// Only the listed uplink times.
    Manual {
        /// Uplink times in seconds.
        #[serde(default)]
        at_s: Vec<f64>,
    },
}

impl Default for TrafficDef {
    fn default() -> Self {
        TrafficDef::Poisson {
            mean_interval_s: 300.0,
        }
    }
}

/// Mobility model of a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MobilityDef {
    /// Never moves.
    #[default]
    Static,
    /// Bounded random walk.
    RandomWalk {
        /// Maximum step length in metres.
        step_m: f64,
        /// Time between steps in seconds.
        interval_s: f64,
        /// `[min_x, min_y, max_x, max_y]` in metres.
        bounds: [f64; 4],
    },
}

/// Network activation procedure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// Pre-provisioned session; data uplinks from the start.
    #[default]
    Abp,
    /// Join request first; data uplinks after the JoinAccept.
    Otaa,
}

/// One end device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeDef {
    /// Unique node id.
    pub id: u64,
    /// Device class.
    pub class: DeviceClass,
    /// Location.
    pub position: Position,
    /// Initial spreading factor.
    pub sf: u8,
    /// Initial transmit power in dBm.
    pub tx_power_dbm: f64,
    /// Uplink channels in Hz.
    pub frequencies: Vec<u32>,
    /// Application payload size in bytes.
    pub payload_bytes: usize,
    /// Send confirmed uplinks.
    pub confirmed: bool,
    /// Retries of an unacknowledged confirmed uplink.
    pub max_retransmissions: u32,
    /// Duty-cycle fraction in (0, 1].
    pub duty_cycle: f64,
    /// Let the network server adapt SF and power.
    pub adr: bool,
    /// Activation procedure.
    pub activation: Activation,
    /// Traffic generator.
    pub traffic: TrafficDef,
    /// Mobility model.
    pub mobility: MobilityDef,
}

impl Default for NodeDef {
    fn default() -> Self {
        NodeDef {
            id: 0,
            class: DeviceClass::A,
            position: Position::default(),
            sf: 7,
            tx_power_dbm: 14.0,
            frequencies: DEFAULT_FREQUENCIES.to_vec(),
            payload_bytes: 20,
            confirmed: false,
            max_retransmissions: 3,
            duty_cycle: 0.01,
            adr: true,
            activation: Activation::Abp,
            traffic: TrafficDef::default(),
            mobility: MobilityDef::Static,
        }
    }
}
