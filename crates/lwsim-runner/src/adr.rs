//! Adaptive data rate strategies.
//!
//! Strategies are looked up by name through [`strategy_by_name`] and run by
//! the network server once a node has enough uplink history.

use crate::downlink_scheduler::LinkAdrReq;
use lwsim_phy::{MAX_SF, MIN_SF};

/// Names accepted by [`strategy_by_name`].
pub const STRATEGY_NAMES: &[&str] = &["none", "lorawan-avg", "lorawan-max"];

/// Highest transmit power a command may restore, in dBm.
pub const MAX_TX_POWER_DBM: f64 = 14.0;
/// Lowest transmit power a command may set, in dBm.
pub const MIN_TX_POWER_DBM: f64 = 2.0;
/// Transmit power step in dB.
pub const TX_POWER_STEP_DB: f64 = 2.0;
/// Link margin consumed by one adjustment step, in dB.
pub const MARGIN_STEP_DB: f64 = 3.0;

/// What a strategy sees about one node.
#[derive(Debug, Clone, Copy)]
pub struct AdrInput<'a> {
    /// Recent uplink SNIR values, oldest first.
    pub snr_history: &'a [f64],
    /// Current spreading factor.
    pub spreading_factor: u8,
    /// Current transmit power in dBm.
    pub tx_power_dbm: f64,
    /// Demodulation floor of the current spreading factor.
    pub required_snr_db: f64,
    /// Installation margin in dB.
    pub margin_db: f64,
}

/// An ADR algorithm.
pub trait AdrStrategy: Send {
    /// Registry name.
    fn name(&self) -> &'static str;

    /// New link settings for the node, if they should change.
    fn evaluate(&self, input: &AdrInput<'_>) -> Option<LinkAdrReq>;
}

/// Never changes anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAdr;

impl AdrStrategy for NoAdr {
    fn name(&self) -> &'static str {
        "none"
    }

    fn evaluate(&self, _input: &AdrInput<'_>) -> Option<LinkAdrReq> {
        None
    }
}

/// How the SNR history is reduced to one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnrAggregate {
    /// Arithmetic mean.
    Average,
    /// Best value.
    Maximum,
}

/// The network-server algorithm from the LoRaWAN ADR recommendation.
///
/// The spare margin is cut into 3 dB steps. Positive steps first lower the
/// spreading factor, then the transmit power. Negative steps raise the
/// transmit power back up to its maximum.
#[derive(Debug, Clone, Copy)]
pub struct LorawanAdr {
    aggregate: SnrAggregate,
}

impl LorawanAdr {
    /// Create the strategy with a history reduction.
    pub fn new(aggregate: SnrAggregate) -> Self {
        LorawanAdr { aggregate }
    }
}

impl AdrStrategy for LorawanAdr {
    fn name(&self) -> &'static str {
        match self.aggregate {
            SnrAggregate::Average => "lorawan-avg",
            SnrAggregate::Maximum => "lorawan-max",
        }
    }

    fn evaluate(&self, input: &AdrInput<'_>) -> Option<LinkAdrReq> {
        if input.snr_history.is_empty() {
            return None;
        }
        let snr = match self.aggregate {
            SnrAggregate::Average => {
                input.snr_history.iter().sum::<f64>() / input.snr_history.len() as f64
            }
            SnrAggregate::Maximum => input
                .snr_history
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max),
        };

        let spare = snr - input.required_snr_db - input.margin_db;
        let mut steps = (spare / MARGIN_STEP_DB).floor() as i32;
        let mut sf = input.spreading_factor.clamp(MIN_SF, MAX_SF);
        let mut power = input.tx_power_dbm;

        while steps > 0 && sf > MIN_SF {
            sf -= 1;
            steps -= 1;
        }
        while steps > 0 && power - TX_POWER_STEP_DB >= MIN_TX_POWER_DBM {
            power -= TX_POWER_STEP_DB;
            steps -= 1;
        }
        while steps < 0 && power + TX_POWER_STEP_DB <= MAX_TX_POWER_DBM {
            power += TX_POWER_STEP_DB;
            steps += 1;
        }

        if sf == input.spreading_factor && power == input.tx_power_dbm {
            return None;
        }
        Some(LinkAdrReq {
            spreading_factor: sf,
            tx_power_dbm: power,
        })
    }
}

/// Resolve a strategy by registry name.
pub fn strategy_by_name(name: &str) -> Option<Box<dyn AdrStrategy>> {
    match name {
        "none" => Some(Box::new(NoAdr)),
        "lorawan-avg" => Some(Box::new(LorawanAdr::new(SnrAggregate::Average))),
        "lorawan-max" => Some(Box::new(LorawanAdr::new(SnrAggregate::Maximum))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(history: &[f64], sf: u8, power: f64) -> AdrInput<'_> {
        AdrInput {
            snr_history: history,
            spreading_factor: sf,
            tx_power_dbm: power,
            required_snr_db: -20.0,
            margin_db: 10.0,
        }
    }

    #[test]
    fn test_registry_resolves_all_names() {
        for name in STRATEGY_NAMES {
            let strategy = strategy_by_name(name).unwrap();
            assert_eq!(strategy.name(), *name);
        }
        assert!(strategy_by_name("aggressive").is_none());
    }

    #[test]
    fn test_strong_link_lowers_sf_first() {
        // spare = 5 - (-20) - 10 = 15 dB -> 5 steps.
        let history = [5.0; 20];
        let cmd = LorawanAdr::new(SnrAggregate::Average)
            .evaluate(&input(&history, 12, 14.0))
            .unwrap();
        assert_eq!(cmd.spreading_factor, 7);
        assert_eq!(cmd.tx_power_dbm, 14.0);
    }

    #[test]
    fn test_remaining_steps_lower_power() {
        // spare = 10 - (-20) - 10 = 20 dB -> 6 steps; 5 go to SF, 1 to power.
        let history = [10.0; 20];
        let cmd = LorawanAdr::new(SnrAggregate::Average)
            .evaluate(&input(&history, 12, 14.0))
            .unwrap();
        assert_eq!(cmd.spreading_factor, 7);
        assert_eq!(cmd.tx_power_dbm, 12.0);
    }

    #[test]
    fn test_power_floor() {
        let history = [60.0; 20];
        let cmd = LorawanAdr::new(SnrAggregate::Average)
            .evaluate(&input(&history, 7, 14.0))
            .unwrap();
        assert_eq!(cmd.tx_power_dbm, MIN_TX_POWER_DBM);
    }

    #[test]
    fn test_weak_link_raises_power() {
        let history = [-25.0; 20];
        let cmd = LorawanAdr::new(SnrAggregate::Average)
            .evaluate(&input(&history, 9, 8.0))
            .unwrap();
        assert_eq!(cmd.spreading_factor, 9);
        assert_eq!(cmd.tx_power_dbm, MAX_TX_POWER_DBM);
    }

    #[test]
    fn test_no_change_returns_none() {
        let history = [-9.0; 20];
        assert!(LorawanAdr::new(SnrAggregate::Average)
            .evaluate(&input(&history, 9, 14.0))
            .is_none());
        assert!(NoAdr.evaluate(&input(&history, 12, 14.0)).is_none());
    }

    #[test]
    fn test_max_aggregate_uses_best_value() {
        let mut history = [-30.0; 20];
        history[7] = 5.0;
        let avg = LorawanAdr::new(SnrAggregate::Average).evaluate(&input(&history, 12, 14.0));
        let max = LorawanAdr::new(SnrAggregate::Maximum).evaluate(&input(&history, 12, 14.0));
        assert!(avg.is_none());
        assert_eq!(max.unwrap().spreading_factor, 7);
    }
}
