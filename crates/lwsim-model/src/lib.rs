//! # lwsim-model
//!
//! YAML scenario loading for lwsim.
//!
//! A scenario is one or more YAML files. Later files override whole
//! sections of earlier ones and replace gateways or nodes with the same id.
//! Everything is validated here, once, so the simulator never sees an
//! out-of-range parameter.
//!
//! ```yaml
//! simulation: { seed: 7, duration_s: 600 }
//! capture: { orthogonal_sf: false }
//! gateways:
//!   - id: 0
//! nodes:
//!   - id: 1
//!     class: C
//!     position: { x: 250.0, y: 0.0 }
//!     traffic: { type: periodic, interval_s: 60 }
//! ```

pub mod sections;

pub use sections::*;

use lwsim_common::TimeQuantizer;
use lwsim_phy::{CaptureConfig, CaptureMatrix, CaptureMode, LoraParams, LoraPhyConfig, PhyError};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while loading a model.
#[derive(Debug, Error)]
pub enum ModelError {
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// A PHY parameter is out of range.
    #[error("Invalid radio parameter: {0}")]
    Phy(#[from] PhyError),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Two nodes share an id.
    #[error("Duplicate node id: {0}")]
    DuplicateNode(u64),

    /// Two gateways share an id.
    #[error("Duplicate gateway id: {0}")]
    DuplicateGateway(u64),

    /// A reference to a node that does not exist.
    #[error("Unknown node id: {0}")]
    UnknownNode(u64),

    /// A reference to a gateway that does not exist.
    #[error("Unknown gateway id: {0}")]
    UnknownGateway(u64),
}

fn invalid(msg: impl Into<String>) -> ModelError {
    ModelError::InvalidConfig(msg.into())
}

// ============================================================================
// File Format
// ============================================================================

/// One YAML file as written.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelYaml {
    #[serde(default)]
    simulation: Option<SimulationSection>,
    #[serde(default)]
    capture: Option<CaptureSection>,
    #[serde(default)]
    radio: Option<RadioSection>,
    #[serde(default)]
    timing: Option<TimingSection>,
    #[serde(default)]
    class_b: Option<ClassBSection>,
    #[serde(default)]
    channel: Option<ChannelSection>,
    #[serde(default)]
    adr: Option<AdrSection>,
    #[serde(default)]
    gateways: Vec<GatewayDef>,
    #[serde(default)]
    nodes: Vec<NodeDef>,
}

impl ModelYaml {
    fn parse(yaml: &str, base_dir: Option<&Path>) -> Result<Self, ModelError> {
        let mut parsed: ModelYaml = serde_yaml::from_str(yaml)?;
        check_unique(parsed.nodes.iter().map(|n| n.id), ModelError::DuplicateNode)?;
        check_unique(parsed.gateways.iter().map(|g| g.id), ModelError::DuplicateGateway)?;

        if let (Some(dir), Some(capture)) = (base_dir, parsed.capture.as_mut()) {
            if let Some(file) = capture.matrix_file.as_mut() {
                if file.is_relative() {
                    *file = dir.join(&*file);
                }
            }
        }
        Ok(parsed)
    }

    /// Overlay `other` on top of `self`.
    fn merge(&mut self, other: ModelYaml) {
        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        overlay!(simulation, capture, radio, timing, class_b, channel, adr);

        for gateway in other.gateways {
            match self.gateways.iter_mut().find(|g| g.id == gateway.id) {
                Some(existing) => *existing = gateway,
                None => self.gateways.push(gateway),
            }
        }
        for node in other.nodes {
            match self.nodes.iter_mut().find(|n| n.id == node.id) {
                Some(existing) => *existing = node,
                None => self.nodes.push(node),
            }
        }
    }
}

fn check_unique(
    ids: impl Iterator<Item = u64>,
    err: impl Fn(u64) -> ModelError,
) -> Result<(), ModelError> {
    let mut seen = BTreeSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(err(id));
        }
    }
    Ok(())
}

// ============================================================================
// Loaded Model
// ============================================================================

/// A loaded and validated scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    /// Run settings.
    pub simulation: SimulationSection,
    /// Collision resolution settings.
    pub capture: CaptureSection,
    /// Shared radio settings.
    pub radio: RadioSection,
    /// MAC timing constants.
    pub timing: TimingSection,
    /// Beacon and ping slot settings.
    pub class_b: ClassBSection,
    /// Propagation model.
    pub channel: ChannelSection,
    /// ADR settings.
    pub adr: AdrSection,
    /// Gateways in declaration order.
    pub gateways: Vec<GatewayDef>,
    /// Nodes in declaration order.
    pub nodes: Vec<NodeDef>,
    /// Inter-SF matrix resolved from `matrix`, `matrix_file` or the default.
    pub capture_matrix: CaptureMatrix,
    /// Time quantizer resolved from `tick_ns`.
    pub quantizer: TimeQuantizer,
}

impl Model {
    fn resolve(yaml: ModelYaml) -> Result<Self, ModelError> {
        let capture = yaml.capture.unwrap_or_default();
        let capture_matrix = match (&capture.matrix, &capture.matrix_file) {
            (Some(_), Some(_)) => {
                return Err(invalid("capture: set either matrix or matrix_file, not both"))
            }
            (Some(rows), None) => CaptureMatrix::from_rows(rows)?,
            (None, Some(path)) => {
                let text = std::fs::read_to_string(path)?;
                CaptureMatrix::parse(&text)?
            }
            (None, None) => CaptureMatrix::default(),
        };

        let simulation = yaml.simulation.unwrap_or_default();
        let quantizer = TimeQuantizer::from_option(simulation.tick_ns)
            .map_err(|e| invalid(format!("simulation.tick_ns: {}", e)))?;

        let model = Model {
            simulation,
            capture,
            radio: yaml.radio.unwrap_or_default(),
            timing: yaml.timing.unwrap_or_default(),
            class_b: yaml.class_b.unwrap_or_default(),
            channel: yaml.channel.unwrap_or_default(),
            adr: yaml.adr.unwrap_or_default(),
            gateways: yaml.gateways,
            nodes: yaml.nodes,
            capture_matrix,
            quantizer,
        };
        model.validate()?;
        debug!(
            nodes = model.nodes.len(),
            gateways = model.gateways.len(),
            "model loaded"
        );
        Ok(model)
    }

    /// Capture engine settings.
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            mode: self.capture.mode,
            orthogonal_sf: self.capture.orthogonal_sf,
            capture_window_symbols: self.capture.capture_window_symbols,
            capture_threshold_db: self.capture.capture_threshold_db,
            matrix: self.capture_matrix,
        }
    }

    /// Receiver thresholds.
    pub fn phy_config(&self) -> LoraPhyConfig {
        LoraPhyConfig {
            preamble_symbols: self.radio.preamble_symbols,
            snr_thresholds: self.radio.snr_thresholds_db,
            sensitivity_dbm: self.radio.sensitivity_dbm,
            energy_detection_dbm: self.radio.energy_detection_dbm,
        }
    }

    /// Radio settings of a transmission on `sf`.
    pub fn radio_params(&self, sf: u8) -> LoraParams {
        LoraParams {
            spreading_factor: sf,
            bandwidth_hz: self.radio.bandwidth_hz,
            coding_rate: self.radio.coding_rate,
            preamble_symbols: self.radio.preamble_symbols,
        }
    }

    /// Look up a node by id.
    pub fn node(&self, id: u64) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Check every parameter the simulator depends on.
    pub fn validate(&self) -> Result<(), ModelError> {
        let sim = &self.simulation;
        if !(sim.duration_s.is_finite() && sim.duration_s > 0.0) {
            return Err(invalid("simulation.duration_s must be positive"));
        }

        let capture = &self.capture;
        if capture.capture_window_symbols == 0 {
            return Err(invalid("capture.capture_window_symbols must be positive"));
        }
        if !capture.capture_threshold_db.is_finite() {
            return Err(invalid("capture.capture_threshold_db must be finite"));
        }

        self.radio_params(7).validate()?;
        if self.radio.preamble_symbols == 0 {
            return Err(invalid("radio.preamble_symbols must be positive"));
        }
        if capture.mode == CaptureMode::Capture
            && self.radio.preamble_symbols < capture.capture_window_symbols
        {
            return Err(invalid(format!(
                "radio.preamble_symbols ({}) is shorter than capture.capture_window_symbols ({})",
                self.radio.preamble_symbols, capture.capture_window_symbols
            )));
        }

        let timing = &self.timing;
        for (name, value) in [
            ("rx1_delay_s", timing.rx1_delay_s),
            ("rx2_delay_s", timing.rx2_delay_s),
            ("rx_window_duration_s", timing.rx_window_duration_s),
            ("link_delay_s", timing.link_delay_s),
            ("server_rx_delay_s", timing.server_rx_delay_s),
            ("server_process_delay_s", timing.server_process_delay_s),
            ("ack_timeout_s", timing.ack_timeout_s),
        ] {
            non_negative(&format!("timing.{}", name), value)?;
        }
        if timing.rx2_delay_s <= timing.rx1_delay_s {
            return Err(invalid("timing.rx2_delay_s must be later than rx1_delay_s"));
        }

        let class_b = &self.class_b;
        positive("class_b.beacon_interval_s", class_b.beacon_interval_s)?;
        positive("class_b.ping_slot_interval_s", class_b.ping_slot_interval_s)?;
        non_negative("class_b.ping_slot_offset_s", class_b.ping_slot_offset_s)?;
        non_negative("class_b.beacon_guard_s", class_b.beacon_guard_s)?;
        if !(class_b.beacon_drift.is_finite() && class_b.beacon_drift > -1.0) {
            return Err(invalid("class_b.beacon_drift must be greater than -1"));
        }
        let period = class_b.effective_beacon_interval_s();
        if class_b.beacon_guard_s >= period {
            return Err(invalid("class_b.beacon_guard_s must be shorter than the beacon period"));
        }
        if class_b.ping_slot_offset_s >= period {
            return Err(invalid("class_b.ping_slot_offset_s must fall inside the beacon period"));
        }

        if self.adr.history_len == 0 {
            return Err(invalid("adr.history_len must be positive"));
        }
        if !self.adr.margin_db.is_finite() {
            return Err(invalid("adr.margin_db must be finite"));
        }

        if self.gateways.is_empty() {
            return Err(invalid("at least one gateway is required"));
        }
        check_unique(self.gateways.iter().map(|g| g.id), ModelError::DuplicateGateway)?;
        check_unique(self.nodes.iter().map(|n| n.id), ModelError::DuplicateNode)?;

        for node in &self.nodes {
            self.validate_node(node)?;
        }

        match &self.channel {
            ChannelSection::LogDistance(channel) => {
                positive("channel.reference_distance_m", channel.reference_distance_m)?;
                non_negative("channel.shadowing_std_db", channel.shadowing_std_db)?;
            }
            ChannelSection::LinkTable {
                fixed_airtime_s,
                links,
                ..
            } => {
                if let Some(airtime) = fixed_airtime_s {
                    positive("channel.fixed_airtime_s", *airtime)?;
                }
                for link in links {
                    if self.node(link.node).is_none() {
                        return Err(ModelError::UnknownNode(link.node));
                    }
                    if !self.gateways.iter().any(|g| g.id == link.gateway) {
                        return Err(ModelError::UnknownGateway(link.gateway));
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_node(&self, node: &NodeDef) -> Result<(), ModelError> {
        let ctx = |field: &str| format!("node {}: {}", node.id, field);
        self.radio_params(node.sf).validate()?;
        if node.frequencies.is_empty() {
            return Err(invalid(ctx("frequencies must not be empty")));
        }
        if !(node.duty_cycle > 0.0 && node.duty_cycle <= 1.0) {
            return Err(invalid(ctx("duty_cycle must be in (0, 1]")));
        }
        if !node.tx_power_dbm.is_finite() {
            return Err(invalid(ctx("tx_power_dbm must be finite")));
        }
        match &node.traffic {
            TrafficDef::Poisson { mean_interval_s } => positive(&ctx("traffic.mean_interval_s"), *mean_interval_s)?,
            TrafficDef::Periodic {
                interval_s,
                offset_s,
            } => {
                positive(&ctx("traffic.interval_s"), *interval_s)?;
                non_negative(&ctx("traffic.offset_s"), *offset_s)?;
            }
            TrafficDef::Manual { at_s } => {
                for t in at_s {
                    non_negative(&ctx("traffic.at_s"), *t)?;
                }
            }
        }
        if let MobilityDef::RandomWalk {
            step_m,
            interval_s,
            bounds,
        } = &node.mobility
        {
            non_negative(&ctx("mobility.step_m"), *step_m)?;
            positive(&ctx("mobility.interval_s"), *interval_s)?;
            if !(bounds[0] <= bounds[2] && bounds[1] <= bounds[3]) {
                return Err(invalid(ctx("mobility.bounds must be [min_x, min_y, max_x, max_y]")));
            }
        }
        Ok(())
    }
}

fn positive(name: &str, value: f64) -> Result<(), ModelError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(format!("{} must be positive, got {}", name, value)))
    }
}

fn non_negative(name: &str, value: f64) -> Result<(), ModelError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(invalid(format!("{} must be non-negative, got {}", name, value)))
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Load a model from a YAML file.
pub fn load_model(path: &Path) -> Result<Model, ModelError> {
    load_models(&[path])
}

/// Load a model from a YAML string.
pub fn load_model_from_str(yaml_str: &str) -> Result<Model, ModelError> {
    load_models_from_str(&[yaml_str])
}

/// Load and merge several YAML files, later files overriding earlier ones.
///
/// A relative `matrix_file` is resolved against the directory of the file
/// that names it.
pub fn load_models(paths: &[&Path]) -> Result<Model, ModelError> {
    if paths.is_empty() {
        return Err(invalid("No model files provided"));
    }
    let mut merged = ModelYaml::default();
    for path in paths {
        let text = std::fs::read_to_string(path)?;
        let base_dir: Option<PathBuf> = path.parent().map(Path::to_path_buf);
        merged.merge(ModelYaml::parse(&text, base_dir.as_deref())?);
    }
    Model::resolve(merged)
}

/// Load and merge several YAML strings, later strings overriding earlier ones.
pub fn load_models_from_str(yaml_strs: &[&str]) -> Result<Model, ModelError> {
    if yaml_strs.is_empty() {
        return Err(invalid("No model strings provided"));
    }
    let mut merged = ModelYaml::default();
    for yaml in yaml_strs {
        merged.merge(ModelYaml::parse(yaml, None)?);
    }
    Model::resolve(merged)
}
