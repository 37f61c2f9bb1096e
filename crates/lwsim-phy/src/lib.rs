//! # lwsim-phy
//!
//! LoRa radio layer for lwsim.
//!
//! This crate provides:
//! - Per-transmission radio settings ([`LoraParams`]) and PHY calculations
//!   ([`symbol_time`], [`time_on_air`])
//! - Receiver thresholds ([`LoraPhyConfig`])
//! - The propagation collaborator ([`channel::Channel`])
//! - Interference accounting ([`power_timeline::PowerTimeline`])
//! - Collision and capture resolution ([`capture::CaptureEngine`])

pub mod capture;
pub mod channel;
pub mod power_timeline;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use capture::{
    ActiveReception, CaptureConfig, CaptureEngine, CaptureMatrix, CaptureMode, TxOutcome,
};
pub use channel::{Channel, LinkContext, LinkTableChannel, LogDistanceChannel};
pub use power_timeline::{PowerEntry, PowerTimeline};

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by PHY parameter validation.
#[derive(Debug, Error, PartialEq)]
pub enum PhyError {
    /// Spreading factor outside 7..=12.
    #[error("Invalid spreading factor {0}: expected 7..=12")]
    InvalidSpreadingFactor(u8),

    /// Bandwidth must be positive.
    #[error("Invalid bandwidth {0} Hz")]
    InvalidBandwidth(u32),

    /// Coding rate denominator outside 5..=8.
    #[error("Invalid coding rate 4/{0}: expected denominator 5..=8")]
    InvalidCodingRate(u8),

    /// The capture matrix is not a 6x6 table of finite values.
    #[error("Malformed capture matrix: {0}")]
    MalformedMatrix(String),
}

/// Lowest supported spreading factor.
pub const MIN_SF: u8 = 7;
/// Highest supported spreading factor.
pub const MAX_SF: u8 = 12;

/// Check that a spreading factor is in 7..=12.
pub fn validate_sf(sf: u8) -> Result<(), PhyError> {
    if (MIN_SF..=MAX_SF).contains(&sf) {
        Ok(())
    } else {
        Err(PhyError::InvalidSpreadingFactor(sf))
    }
}

/// Index of a spreading factor in the 6-entry SF tables.
///
/// Out-of-range values are clamped; callers validate at the configuration boundary.
pub fn sf_index(sf: u8) -> usize {
    (sf.clamp(MIN_SF, MAX_SF) - MIN_SF) as usize
}

// ============================================================================
// Radio Parameters
// ============================================================================

/// Radio settings of a single LoRa transmission.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoraParams {
    /// Spreading factor (7-12).
    pub spreading_factor: u8,
    /// Bandwidth in Hz.
    pub bandwidth_hz: u32,
    /// Coding rate denominator (5-8, i.e. 4/5 to 4/8).
    pub coding_rate: u8,
    /// Number of programmed preamble symbols.
    pub preamble_symbols: u32,
}

impl Default for LoraParams {
    fn default() -> Self {
        LoraParams {
            spreading_factor: 7,
            bandwidth_hz: 125_000,
            coding_rate: 5,
            preamble_symbols: LoraPhyConfig::DEFAULT_PREAMBLE_SYMBOLS,
        }
    }
}

impl LoraParams {
    /// Same settings on another spreading factor.
    pub fn with_sf(self, spreading_factor: u8) -> Self {
        LoraParams {
            spreading_factor,
            ..self
        }
    }

    /// Validate all fields.
    pub fn validate(&self) -> Result<(), PhyError> {
        validate_sf(self.spreading_factor)?;
        if self.bandwidth_hz == 0 {
            return Err(PhyError::InvalidBandwidth(self.bandwidth_hz));
        }
        if !(5..=8).contains(&self.coding_rate) {
            return Err(PhyError::InvalidCodingRate(self.coding_rate));
        }
        Ok(())
    }

    /// Symbol duration in seconds.
    pub fn symbol_time(&self) -> f64 {
        symbol_time(self.spreading_factor, self.bandwidth_hz)
    }

    /// Time on air in seconds for a payload of `payload_len` bytes.
    pub fn time_on_air(&self, payload_len: usize) -> f64 {
        time_on_air(self, payload_len)
    }
}

// ============================================================================
// PHY Calculations
// ============================================================================

/// Duration of one LoRa symbol in seconds: `2^SF / BW`.
pub fn symbol_time(spreading_factor: u8, bandwidth_hz: u32) -> f64 {
    2.0_f64.powi(spreading_factor as i32) / bandwidth_hz as f64
}

/// LoRa time on air in seconds (explicit header, CRC on).
///
/// Low data rate optimisation is enabled automatically when the symbol time
/// reaches 16 ms (SF11/SF12 at 125 kHz).
pub fn time_on_air(params: &LoraParams, payload_len: usize) -> f64 {
    let sf = params.spreading_factor as f64;
    let t_sym = params.symbol_time();
    let de = if t_sym >= 0.016 { 1.0 } else { 0.0 };
    let crc = 1.0;
    let header = 0.0;

    let t_preamble = (params.preamble_symbols as f64 + 4.25) * t_sym;

    let pl = payload_len as f64;
    let numerator = 8.0 * pl - 4.0 * sf + 28.0 + 16.0 * crc - 20.0 * header;
    let denominator = 4.0 * (sf - 2.0 * de);
    let payload_symbols =
        8.0 + ((numerator / denominator).ceil() * params.coding_rate as f64).max(0.0);

    t_preamble + payload_symbols * t_sym
}

/// Convert dBm to milliwatts.
pub fn dbm_to_mw(dbm: f64) -> f64 {
    10.0_f64.powf(dbm / 10.0)
}

/// Convert milliwatts to dBm. Zero power maps to negative infinity.
pub fn mw_to_dbm(mw: f64) -> f64 {
    10.0 * mw.log10()
}

/// Thermal noise floor in dBm for a bandwidth and receiver noise figure.
pub fn thermal_noise_dbm(bandwidth_hz: u32, noise_figure_db: f64) -> f64 {
    -174.0 + 10.0 * (bandwidth_hz as f64).log10() + noise_figure_db
}

/// Sample a value from a Gaussian (normal) distribution.
/// Uses the Box-Muller transform for deterministic simulation.
pub fn sample_gaussian<R: Rng>(rng: &mut R, mean: f64, std_dev: f64) -> f64 {
    if std_dev == 0.0 {
        return mean;
    }
    let u1: f64 = rng.gen();
    let u2: f64 = rng.gen();

    // Avoid log(0)
    let u1 = if u1 == 0.0 { f64::MIN_POSITIVE } else { u1 };

    let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    mean + std_dev * z0
}

// ============================================================================
// Receiver Thresholds
// ============================================================================

/// Receiver thresholds used to decide whether a signal is heard at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraPhyConfig {
    /// Number of preamble symbols.
    pub preamble_symbols: u32,
    /// Demodulation SNR floor for SF7-SF12, indexed as [SF-7].
    pub snr_thresholds: [f64; 6],
    /// Sensitivity override for SF7-SF12 in dBm. When absent the built-in
    /// table for the transmission's bandwidth is used.
    pub sensitivity_dbm: Option<[f64; 6]>,
    /// Optional energy-detection level in dBm below which nothing registers.
    pub energy_detection_dbm: Option<f64>,
}

impl LoraPhyConfig {
    /// Default preamble symbol count.
    pub const DEFAULT_PREAMBLE_SYMBOLS: u32 = 8;

    /// Default demodulation SNR floors for SF7-SF12.
    pub const DEFAULT_SNR_THRESHOLDS: [f64; 6] = [-7.5, -10.0, -12.5, -15.0, -17.5, -20.0];

    /// Sensitivity table at 125 kHz for SF7-SF12.
    pub const SENSITIVITY_125KHZ: [f64; 6] = [-126.5, -127.25, -131.25, -132.75, -134.5, -133.25];
    /// Sensitivity table at 250 kHz for SF7-SF12.
    pub const SENSITIVITY_250KHZ: [f64; 6] = [-124.25, -126.75, -128.25, -130.25, -132.75, -132.25];
    /// Sensitivity table at 500 kHz for SF7-SF12.
    pub const SENSITIVITY_500KHZ: [f64; 6] = [-120.75, -124.0, -127.5, -128.75, -128.75, -132.25];

    /// Get the SNR threshold for a spreading factor.
    pub fn snr_threshold(&self, spreading_factor: u8) -> f64 {
        self.snr_thresholds[sf_index(spreading_factor)]
    }

    /// Receiver sensitivity in dBm for a spreading factor and bandwidth.
    ///
    /// Bandwidths without a table fall back to thermal noise (6 dB noise
    /// figure) plus the SF's SNR floor.
    pub fn sensitivity_dbm(&self, spreading_factor: u8, bandwidth_hz: u32) -> f64 {
        let idx = sf_index(spreading_factor);
        if let Some(table) = &self.sensitivity_dbm {
            return table[idx];
        }
        match bandwidth_hz {
            125_000 => Self::SENSITIVITY_125KHZ[idx],
            250_000 => Self::SENSITIVITY_250KHZ[idx],
            500_000 => Self::SENSITIVITY_500KHZ[idx],
            other => thermal_noise_dbm(other, 6.0) + self.snr_thresholds[idx],
        }
    }

    /// Whether a signal clears sensitivity, SNR floor and energy detection.
    pub fn detects(&self, params: &LoraParams, rssi_dbm: f64, snr_db: f64) -> bool {
        if rssi_dbm < self.sensitivity_dbm(params.spreading_factor, params.bandwidth_hz) {
            return false;
        }
        if snr_db < self.snr_threshold(params.spreading_factor) {
            return false;
        }
        match self.energy_detection_dbm {
            Some(level) => rssi_dbm >= level,
            None => true,
        }
    }
}

impl Default for LoraPhyConfig {
    fn default() -> Self {
        LoraPhyConfig {
            preamble_symbols: Self::DEFAULT_PREAMBLE_SYMBOLS,
            snr_thresholds: Self::DEFAULT_SNR_THRESHOLDS,
            sensitivity_dbm: None,
            energy_detection_dbm: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_symbol_time() {
        assert!((symbol_time(7, 125_000) - 0.001024).abs() < 1e-12);
        assert!((symbol_time(12, 125_000) - 0.032768).abs() < 1e-12);
    }

    #[test]
    fn test_time_on_air_matches_reference_values() {
        // SF7/125kHz/4:5, 20 byte payload: 56.576 ms
        let sf7 = LoraParams::default();
        assert!((sf7.time_on_air(20) - 0.056576).abs() < 1e-9);

        // SF12/125kHz/4:5, 20 byte payload uses low data rate optimisation: 1318.912 ms
        let sf12 = sf7.with_sf(12);
        assert!((sf12.time_on_air(20) - 1.318912).abs() < 1e-9);
    }

    #[test]
    fn test_time_on_air_grows_with_sf() {
        let base = LoraParams::default();
        let mut last = 0.0;
        for sf in 7..=12 {
            let toa = base.with_sf(sf).time_on_air(12);
            assert!(toa > last, "SF{} should take longer than SF{}", sf, sf - 1);
            last = toa;
        }
    }

    #[test]
    fn test_validate_rejects_bad_parameters() {
        assert_eq!(
            LoraParams::default().with_sf(6).validate(),
            Err(PhyError::InvalidSpreadingFactor(6))
        );
        let zero_bw = LoraParams {
            bandwidth_hz: 0,
            ..LoraParams::default()
        };
        assert_eq!(zero_bw.validate(), Err(PhyError::InvalidBandwidth(0)));
        let bad_cr = LoraParams {
            coding_rate: 4,
            ..LoraParams::default()
        };
        assert_eq!(bad_cr.validate(), Err(PhyError::InvalidCodingRate(4)));
    }

    #[test]
    fn test_power_conversions() {
        assert!((dbm_to_mw(0.0) - 1.0).abs() < 1e-12);
        assert!((dbm_to_mw(-30.0) - 0.001).abs() < 1e-15);
        assert!((mw_to_dbm(100.0) - 20.0).abs() < 1e-12);
        assert_eq!(mw_to_dbm(0.0), f64::NEG_INFINITY);
    }

    #[test]
    fn test_detection_thresholds() {
        let config = LoraPhyConfig::default();
        let params = LoraParams::default();
        assert!(config.detects(&params, -120.0, 5.0));
        // Below sensitivity
        assert!(!config.detects(&params, -130.0, 5.0));
        // Below SF7 SNR floor
        assert!(!config.detects(&params, -120.0, -8.0));

        let gated = LoraPhyConfig {
            energy_detection_dbm: Some(-100.0),
            ..LoraPhyConfig::default()
        };
        assert!(!gated.detects(&params, -110.0, 5.0));
        assert!(gated.detects(&params, -90.0, 5.0));
    }

    #[test]
    fn test_sensitivity_table_fallback() {
        let config = LoraPhyConfig::default();
        assert_eq!(config.sensitivity_dbm(9, 250_000), -128.25);
        let fallback = config.sensitivity_dbm(7, 62_500);
        let expected = thermal_noise_dbm(62_500, 6.0) - 7.5;
        assert!((fallback - expected).abs() < 1e-9);
    }

    #[test]
    fn test_gaussian_sampling() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mean = 10.0;
        let std_dev = 1.8;

        let samples: Vec<f64> = (0..1000).map(|_| sample_gaussian(&mut rng, mean, std_dev)).collect();
        let sample_mean: f64 = samples.iter().sum::<f64>() / samples.len() as f64;

        assert!((sample_mean - mean).abs() < 0.2, "Sample mean {} should be close to {}", sample_mean, mean);
    }
}
