//! End devices.

use crate::downlink_scheduler::{DownlinkFrame, FrameKind, MAC_OVERHEAD_BYTES};
use crate::mobility::{self, MobilityModel};
use lwsim_common::{DeviceClass, EventId, NodeId, Position, SimRng, SimTime};
use lwsim_model::{Activation, NodeDef, TimingSection, TrafficDef};
use lwsim_phy::LoraParams;
use rand::Rng;
use rand_distr::{Distribution, Exp};
use tracing::{debug, warn};

/// Uplink frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkKind {
    /// Application data.
    Data,
    /// OTAA join request.
    JoinRequest,
}

/// The MAC-level content of one uplink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UplinkFrame {
    /// Frame type.
    pub kind: UplinkKind,
    /// Uplink frame counter.
    pub fcnt: u32,
    /// Requests an acknowledgement.
    pub confirmed: bool,
    /// ADR bit.
    pub adr: bool,
    /// PHY payload length in bytes.
    pub payload_len: usize,
    /// 0 for the first transmission, then the retransmission number.
    pub attempt: u32,
}

/// One transmission in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct Uplink {
    /// Shared id of the `TxStart` and `TxEnd` events.
    pub id: EventId,
    /// Transmitting node.
    pub node: NodeId,
    /// Frame content.
    pub frame: UplinkFrame,
    /// Radio settings.
    pub params: LoraParams,
    /// Carrier frequency in Hz.
    pub frequency_hz: u32,
    /// Transmit power in dBm.
    pub tx_power_dbm: f64,
    /// Start time.
    pub start: SimTime,
    /// End time.
    pub end: SimTime,
}

impl Uplink {
    /// Time on air in seconds.
    pub fn airtime_s(&self) -> f64 {
        (self.end - self.start).as_secs()
    }
}

/// Arrival process of a node's application traffic.
#[derive(Debug, Clone)]
enum Traffic {
    Poisson(Exp<f64>),
    Periodic { interval_s: f64, offset_s: f64 },
    Manual { at_s: Vec<f64>, next: usize },
}

impl Traffic {
    fn from_def(def: &TrafficDef) -> Self {
        match def {
            TrafficDef::Poisson { mean_interval_s } => match Exp::new(1.0 / mean_interval_s) {
                Ok(exp) => Traffic::Poisson(exp),
                // Unreachable after model validation.
                Err(_) => Traffic::Manual {
                    at_s: Vec::new(),
                    next: 0,
                },
            },
            TrafficDef::Periodic {
                interval_s,
                offset_s,
            } => Traffic::Periodic {
                interval_s: *interval_s,
                offset_s: *offset_s,
            },
            TrafficDef::Manual { at_s } => {
                let mut at_s = at_s.clone();
                at_s.sort_by(f64::total_cmp);
                Traffic::Manual { at_s, next: 0 }
            }
        }
    }

    /// The arrival following `previous` (or the first one).
    fn next_arrival(&mut self, previous: Option<f64>, rng: &mut SimRng) -> Option<f64> {
        match self {
            Traffic::Poisson(exp) => Some(previous.unwrap_or(0.0) + exp.sample(rng)),
            Traffic::Periodic {
                interval_s,
                offset_s,
            } => Some(match previous {
                Some(prev) => prev + *interval_s,
                None => *offset_s,
            }),
            Traffic::Manual { at_s, next } => {
                let t = at_s.get(*next).copied();
                *next += 1;
                t
            }
        }
    }
}

/// A frame waiting for its acknowledgement (or join accept).
#[derive(Debug, Clone, Copy)]
struct AwaitingAck {
    frame: UplinkFrame,
}

/// Effect of one received downlink on the device.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DownlinkEffect {
    /// An outstanding confirmed uplink was acknowledged.
    pub acked: bool,
    /// The device completed its join.
    pub joined: bool,
    /// The device applied an ADR command.
    pub adr_applied: bool,
}

/// A simulated LoRaWAN end device.
pub struct EndDevice {
    /// Node id.
    pub id: NodeId,
    /// Device class.
    pub class: DeviceClass,
    /// Current location.
    pub position: Position,
    /// Current spreading factor.
    pub sf: u8,
    /// Current transmit power in dBm.
    pub tx_power_dbm: f64,
    base_params: LoraParams,
    frequencies: Vec<u32>,
    payload_bytes: usize,
    confirmed: bool,
    max_retransmissions: u32,
    duty_cycle: f64,
    adr: bool,
    joined: bool,
    traffic: Traffic,
    mobility: Box<dyn MobilityModel>,
    fcnt_up: u32,
    last_arrival: Option<f64>,
    silent_until: SimTime,
    awaiting: Option<AwaitingAck>,
    retry_pending: bool,
}

impl EndDevice {
    /// Create a device from its definition and the shared radio settings.
    pub fn new(def: &NodeDef, base_params: LoraParams) -> Self {
        EndDevice {
            id: NodeId(def.id),
            class: def.class,
            position: def.position,
            sf: def.sf,
            tx_power_dbm: def.tx_power_dbm,
            base_params,
            frequencies: def.frequencies.clone(),
            payload_bytes: def.payload_bytes,
            confirmed: def.confirmed,
            max_retransmissions: def.max_retransmissions,
            duty_cycle: def.duty_cycle,
            adr: def.adr,
            joined: def.activation == Activation::Abp,
            traffic: Traffic::from_def(&def.traffic),
            mobility: mobility::from_def(&def.mobility),
            fcnt_up: 0,
            last_arrival: None,
            silent_until: SimTime::ZERO,
            awaiting: None,
            retry_pending: false,
        }
    }

    /// Radio settings of the next uplink.
    pub fn params(&self) -> LoraParams {
        self.base_params.with_sf(self.sf)
    }

    /// Whether the device has a network session.
    pub fn is_joined(&self) -> bool {
        self.joined
    }

    /// Whether the device asked the server to run ADR.
    pub fn adr_enabled(&self) -> bool {
        self.adr
    }

    /// Earliest time the duty cycle lets the device transmit again.
    pub fn silent_until(&self) -> SimTime {
        self.silent_until
    }

    /// Seconds between mobility steps, if the device moves.
    pub fn mobility_interval_s(&self) -> Option<f64> {
        self.mobility.interval_s()
    }

    /// Advance the mobility model by one step.
    pub fn move_step(&mut self, rng: &mut SimRng) {
        self.position = self.mobility.step(self.position, rng);
    }

    /// Time of the first application uplink.
    pub fn first_arrival(&mut self, rng: &mut SimRng) -> Option<SimTime> {
        self.ensure_arrival(SimTime::ZERO, rng)
    }

    /// Draw the next arrival of the traffic model, clamped to `not_before`.
    fn ensure_arrival(&mut self, not_before: SimTime, rng: &mut SimRng) -> Option<SimTime> {
        let arrival = self.traffic.next_arrival(self.last_arrival, rng)?;
        self.last_arrival = Some(arrival);
        Some(SimTime::from_secs(arrival).max(not_before))
    }

    /// Check a `TxStart` against an acknowledgement that arrived after the
    /// retry was planned.
    ///
    /// Returns `None` when the device should transmit now. Otherwise the
    /// retry slot is released and the inner value is the next traffic
    /// arrival, if any.
    pub fn skip_acked_retry(&mut self, now: SimTime, rng: &mut SimRng) -> Option<Option<SimTime>> {
        if !self.retry_pending || self.awaiting.is_some() {
            return None;
        }
        self.retry_pending = false;
        Some(self.ensure_arrival(self.silent_until.max(now), rng))
    }

    /// Build the uplink sent by a `TxStart` at `now`.
    ///
    /// A pending retransmission repeats the unacknowledged frame.
    pub fn begin_uplink(
        &mut self,
        id: EventId,
        now: SimTime,
        airtime_s: impl Fn(&LoraParams, usize) -> f64,
        rng: &mut SimRng,
    ) -> Uplink {
        let retry = std::mem::take(&mut self.retry_pending);
        let frame = match (retry, self.awaiting) {
            (true, Some(mut awaiting)) => {
                awaiting.frame.attempt += 1;
                self.awaiting = Some(awaiting);
                awaiting.frame
            }
            _ => self.fresh_frame(),
        };

        let params = self.params();
        let frequency_hz = self.frequencies[rng.gen_range(0..self.frequencies.len())];
        let end = SimTime::from_secs(now.as_secs() + airtime_s(&params, frame.payload_len));
        Uplink {
            id,
            node: self.id,
            frame,
            params,
            frequency_hz,
            tx_power_dbm: self.tx_power_dbm,
            start: now,
            end,
        }
    }

    fn fresh_frame(&mut self) -> UplinkFrame {
        let frame = if self.joined {
            self.fcnt_up = self.fcnt_up.wrapping_add(1);
            UplinkFrame {
                kind: UplinkKind::Data,
                fcnt: self.fcnt_up,
                confirmed: self.confirmed,
                adr: self.adr,
                payload_len: self.payload_bytes + MAC_OVERHEAD_BYTES,
                attempt: 0,
            }
        } else {
            UplinkFrame {
                kind: UplinkKind::JoinRequest,
                fcnt: 0,
                confirmed: true,
                adr: false,
                payload_len: JOIN_REQUEST_BYTES,
                attempt: 0,
            }
        };
        self.awaiting = frame.confirmed.then_some(AwaitingAck { frame });
        frame
    }

    /// Close an uplink and return the time of the device's next `TxStart`.
    ///
    /// Unacknowledged confirmed frames are retried after the RX2 window and
    /// the acknowledgement timeout. Otherwise the traffic model supplies the
    /// next arrival. Both are held back by the duty cycle.
    pub fn end_uplink(
        &mut self,
        uplink: &Uplink,
        timing: &TimingSection,
        rng: &mut SimRng,
    ) -> Option<SimTime> {
        let airtime = uplink.airtime_s();
        self.silent_until =
            SimTime::from_secs(uplink.end.as_secs() + airtime * (1.0 / self.duty_cycle - 1.0));

        if let Some(awaiting) = self.awaiting {
            if awaiting.frame.attempt < self.max_retransmissions {
                self.retry_pending = true;
                let retry_at = SimTime::from_secs(
                    uplink.end.as_secs()
                        + timing.rx2_delay_s
                        + timing.rx_window_duration_s
                        + timing.ack_timeout_s,
                );
                return Some(retry_at.max(self.silent_until));
            }
            warn!(
                node = %self.id,
                fcnt = awaiting.frame.fcnt,
                attempts = awaiting.frame.attempt + 1,
                "retransmissions exhausted without acknowledgement"
            );
            self.awaiting = None;
        }

        self.ensure_arrival(self.silent_until, rng)
    }

    /// Apply a downlink received in one of the device's windows.
    pub fn handle_downlink(&mut self, frame: &DownlinkFrame) -> DownlinkEffect {
        let mut effect = DownlinkEffect::default();
        match frame.kind {
            FrameKind::JoinAccept => {
                effect.joined = !self.joined;
                self.joined = true;
                if matches!(self.awaiting, Some(a) if a.frame.kind == UplinkKind::JoinRequest) {
                    self.awaiting = None;
                    effect.acked = true;
                }
            }
            FrameKind::Data => {
                if frame.ack && self.awaiting.is_some() {
                    self.awaiting = None;
                    effect.acked = true;
                }
                if let Some(cmd) = frame.link_adr {
                    self.sf = cmd.spreading_factor;
                    self.tx_power_dbm = cmd.tx_power_dbm;
                    effect.adr_applied = true;
                }
            }
            FrameKind::Beacon => {}
        }
        if effect != DownlinkEffect::default() {
            debug!(
                node = %self.id,
                acked = effect.acked,
                joined = effect.joined,
                sf = self.sf,
                tx_power_dbm = self.tx_power_dbm,
                "downlink applied"
            );
        }
        effect
    }
}

/// PHY payload of a join request.
pub const JOIN_REQUEST_BYTES: usize = 23;
