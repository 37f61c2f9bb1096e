//! Gateway receive path.

use lwsim_common::{EventId, GatewayId, NodeId, Position, SimTime};
use lwsim_phy::{
    dbm_to_mw, mw_to_dbm, ActiveReception, CaptureConfig, CaptureEngine, LoraParams,
    LoraPhyConfig, PowerTimeline, TxOutcome,
};
use std::collections::BTreeMap;
use tracing::debug;

/// One uplink as seen by one gateway.
#[derive(Debug, Clone, Copy)]
pub struct IncomingSignal {
    /// Transmission id.
    pub event_id: EventId,
    /// Transmitting node.
    pub node_id: NodeId,
    /// Radio settings.
    pub params: LoraParams,
    /// Carrier frequency in Hz.
    pub frequency_hz: u32,
    /// Received power in dBm.
    pub rssi_dbm: f64,
    /// SNR against the noise floor in dB.
    pub snr_db: f64,
    /// Start time.
    pub start: SimTime,
    /// End time.
    pub end: SimTime,
}

/// Final verdict of one gateway on one uplink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GatewayReception {
    /// Reporting gateway.
    pub gateway: GatewayId,
    /// Outcome at this gateway.
    pub outcome: TxOutcome,
    /// Received power in dBm.
    pub rssi_dbm: f64,
    /// SNR against the noise floor in dB.
    pub snr_db: f64,
    /// Signal to noise-plus-interference ratio in dB, when it was computed.
    pub snir_db: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    start: SimTime,
    rssi_dbm: f64,
    snr_db: f64,
}

/// A gateway: one capture engine plus a power timeline per frequency.
#[derive(Debug)]
pub struct Gateway {
    /// Gateway id.
    pub id: GatewayId,
    /// Location.
    pub position: Position,
    capture: CaptureEngine,
    timelines: BTreeMap<u32, PowerTimeline>,
    in_flight: BTreeMap<EventId, InFlight>,
}

impl Gateway {
    /// Create an idle gateway.
    pub fn new(id: GatewayId, position: Position, capture: CaptureConfig) -> Self {
        Gateway {
            id,
            position,
            capture: CaptureEngine::new(capture),
            timelines: BTreeMap::new(),
            in_flight: BTreeMap::new(),
        }
    }

    /// The gateway's capture engine.
    pub fn capture(&self) -> &CaptureEngine {
        &self.capture
    }

    /// Power timeline of one frequency, if anything was heard on it.
    pub fn timeline(&self, frequency_hz: u32) -> Option<&PowerTimeline> {
        self.timelines.get(&frequency_hz)
    }

    /// Signal arrives at the gateway.
    ///
    /// The signal always adds to the interference on its frequency. It only
    /// becomes a capture candidate when `detected`. Returns whether the
    /// candidate is already lost, or `None` if it was not registered.
    pub fn begin_reception(&mut self, signal: &IncomingSignal, detected: bool) -> Option<bool> {
        if signal.rssi_dbm.is_finite() {
            self.timelines.entry(signal.frequency_hz).or_default().add(
                signal.event_id,
                signal.start,
                signal.end,
                dbm_to_mw(signal.rssi_dbm),
            );
        }
        self.in_flight.insert(
            signal.event_id,
            InFlight {
                start: signal.start,
                rssi_dbm: signal.rssi_dbm,
                snr_db: signal.snr_db,
            },
        );
        if !detected {
            return None;
        }

        let reception = ActiveReception::new(
            signal.event_id,
            signal.node_id,
            &signal.params,
            signal.frequency_hz,
            signal.rssi_dbm,
            signal.snr_db,
            signal.start,
            signal.end,
        );
        Some(self.capture.register(reception))
    }

    /// Signal ends; decide the outcome at this gateway.
    ///
    /// A candidate that survived capture still fails when its SNIR over the
    /// whole frame is below the demodulation floor of its spreading factor.
    pub fn end_reception(
        &mut self,
        event_id: EventId,
        frequency_hz: u32,
        now: SimTime,
        noise_floor_dbm: f64,
        phy: &LoraPhyConfig,
    ) -> GatewayReception {
        let flight = self.in_flight.remove(&event_id);
        let (rssi_dbm, snr_db) = flight
            .map(|f| (f.rssi_dbm, f.snr_db))
            .unwrap_or((f64::NEG_INFINITY, f64::NEG_INFINITY));

        let mut result = GatewayReception {
            gateway: self.id,
            outcome: TxOutcome::NoCoverage,
            rssi_dbm,
            snr_db,
            snir_db: None,
        };

        if let Some(reception) = self.capture.finalize(event_id) {
            if reception.lost {
                result.outcome = TxOutcome::CollisionLoss;
            } else {
                let noise_mw = dbm_to_mw(noise_floor_dbm);
                let interference_mw = self
                    .timelines
                    .get(&frequency_hz)
                    .map(|t| {
                        t.average_interference(
                            reception.start_time,
                            reception.end_time,
                            noise_mw,
                            event_id,
                        )
                    })
                    .unwrap_or(noise_mw);
                let snir = reception.rssi_dbm - mw_to_dbm(interference_mw);
                result.snir_db = Some(snir);
                result.outcome = if snir >= phy.snr_threshold(reception.spreading_factor) {
                    TxOutcome::Success
                } else {
                    debug!(
                        gateway = %self.id,
                        event_id = %event_id,
                        snir_db = snir,
                        "reception below SNIR floor"
                    );
                    TxOutcome::CollisionLoss
                };
            }
        }

        self.prune(now);
        result
    }

    /// Drop timeline entries that can no longer overlap an in-flight signal.
    fn prune(&mut self, now: SimTime) {
        let horizon = self
            .in_flight
            .values()
            .map(|f| f.start)
            .fold(now, SimTime::min);
        for timeline in self.timelines.values_mut() {
            timeline.prune(horizon);
        }
        self.timelines.retain(|_, t| !t.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FREQ: u32 = 868_100_000;

    fn signal(id: u64, rssi: f64, start: f64, end: f64) -> IncomingSignal {
        IncomingSignal {
            event_id: EventId(id),
            node_id: NodeId(id),
            params: LoraParams::default(),
            frequency_hz: FREQ,
            rssi_dbm: rssi,
            snr_db: rssi + 120.0,
            start: SimTime::from_secs(start),
            end: SimTime::from_secs(end),
        }
    }

    fn gateway() -> Gateway {
        Gateway::new(GatewayId(0), Position::default(), CaptureConfig::default())
    }

    #[test]
    fn test_clean_reception_succeeds() {
        let mut gw = gateway();
        let phy = LoraPhyConfig::default();
        assert_eq!(gw.begin_reception(&signal(1, -80.0, 0.0, 0.1), true), Some(false));
        let rx = gw.end_reception(EventId(1), FREQ, SimTime::from_secs(0.1), -120.0, &phy);
        assert_eq!(rx.outcome, TxOutcome::Success);
        assert!((rx.snir_db.unwrap() - 40.0).abs() < 1e-9);
        assert!(gw.timeline(FREQ).is_none());
    }

    #[test]
    fn test_undetected_signal_is_no_coverage_but_interferes() {
        let mut gw = gateway();
        let phy = LoraPhyConfig::default();
        assert_eq!(gw.begin_reception(&signal(1, -80.0, 0.0, 0.1), true), Some(false));
        assert_eq!(gw.begin_reception(&signal(2, -70.0, 0.0, 0.1), false), None);

        let weak = gw.end_reception(EventId(2), FREQ, SimTime::from_secs(0.1), -120.0, &phy);
        assert_eq!(weak.outcome, TxOutcome::NoCoverage);

        // The undetected signal is 10 dB stronger, so SNIR falls below 0 dB
        // and then below the SF7 floor once more noise is added.
        let strong = gw.end_reception(EventId(1), FREQ, SimTime::from_secs(0.1), -120.0, &phy);
        assert!(strong.snir_db.unwrap() < -9.9);
        assert_eq!(strong.outcome, TxOutcome::CollisionLoss);
    }

    #[test]
    fn test_interference_is_weighted_by_overlap() {
        let mut gw = gateway();
        let phy = LoraPhyConfig::default();
        gw.begin_reception(&signal(1, -80.0, 0.0, 1.0), true);
        // Half-overlapping interferer on another SF so capture keeps both.
        let mut other = signal(2, -80.0, 0.5, 1.5);
        other.params = other.params.with_sf(12);
        gw.begin_reception(&other, false);

        let rx = gw.end_reception(EventId(1), FREQ, SimTime::from_secs(1.0), -200.0, &phy);
        // Average interference is half the interferer's power: +3 dB SNIR.
        assert!((rx.snir_db.unwrap() - 3.0103).abs() < 1e-3);
        assert_eq!(rx.outcome, TxOutcome::Success);
    }

    #[test]
    fn test_timeline_kept_while_overlapping_signal_in_flight() {
        let mut gw = gateway();
        let phy = LoraPhyConfig::default();
        gw.begin_reception(&signal(1, -80.0, 0.0, 0.2), true);
        let mut late = signal(2, -90.0, 0.1, 0.4);
        late.params = late.params.with_sf(9);
        gw.begin_reception(&late, true);

        gw.end_reception(EventId(1), FREQ, SimTime::from_secs(0.2), -120.0, &phy);
        // Entry 1 ended but still overlaps entry 2, which started at 0.1.
        assert_eq!(gw.timeline(FREQ).unwrap().len(), 2);

        gw.end_reception(EventId(2), FREQ, SimTime::from_secs(0.4), -120.0, &phy);
        assert!(gw.timeline(FREQ).is_none());
    }
}
