//! Downlink placement and gateway airtime serialization.
//!
//! Every gateway has a single radio. The scheduler keeps, per gateway, the
//! instant its radio becomes free and places each downlink in a window that
//! is legal for the receiving device's class without overlapping anything
//! already on that gateway. Placed frames wait in a per-node queue until the
//! node opens a receive window.

use lwsim_common::{GatewayId, NodeId, SimError, SimTime, TimeQuantizer};
use lwsim_phy::LoraParams;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use tracing::debug;

/// Ping slots tried before Class B placement gives up.
pub const MAX_PING_SLOT_ATTEMPTS: u32 = 128;

/// Two downlinks of one node closer than this are considered the same slot.
const SLOT_CONFLICT_TOLERANCE_S: f64 = 1e-6;

/// MHDR, FHDR, FPort and MIC bytes around every data frame.
pub const MAC_OVERHEAD_BYTES: usize = 13;

/// `LinkADRReq` command payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkAdrReq {
    /// New spreading factor.
    pub spreading_factor: u8,
    /// New transmit power in dBm.
    pub tx_power_dbm: f64,
}

/// What a downlink frame carries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameKind {
    /// Application or MAC data for one node.
    Data,
    /// Answer to an OTAA join request.
    JoinAccept,
    /// Class B network beacon.
    Beacon,
}

impl FrameKind {
    /// Label for logs and metrics.
    pub const fn as_str(self) -> &'static str {
        match self {
            FrameKind::Data => "data",
            FrameKind::JoinAccept => "join_accept",
            FrameKind::Beacon => "beacon",
        }
    }
}

/// A downlink frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkFrame {
    /// Frame type.
    pub kind: FrameKind,
    /// Acknowledges the last confirmed uplink.
    pub ack: bool,
    /// Piggybacked ADR command.
    pub link_adr: Option<LinkAdrReq>,
    /// The frame itself requests an acknowledgement.
    pub confirmed: bool,
    /// Downlink frame counter.
    pub fcnt: u32,
    /// PHY payload length in bytes.
    pub payload_len: usize,
    /// Radio settings used for the transmission.
    pub params: LoraParams,
    /// Time on air in seconds.
    pub airtime_s: f64,
}

impl DownlinkFrame {
    /// A frame of `kind` with no MAC content.
    pub fn new(kind: FrameKind, params: LoraParams, payload_len: usize, airtime_s: f64) -> Self {
        DownlinkFrame {
            kind,
            ack: false,
            link_adr: None,
            confirmed: false,
            fcnt: 0,
            payload_len,
            params,
            airtime_s,
        }
    }

    /// Queue priority; lower is more urgent.
    ///
    /// Acknowledgements, MAC commands, confirmed frames and join accepts
    /// go before plain data scheduled for the same instant.
    pub fn priority(&self) -> u8 {
        let mac_critical = self.ack
            || self.link_adr.is_some()
            || self.confirmed
            || matches!(self.kind, FrameKind::JoinAccept | FrameKind::Beacon);
        if mac_critical {
            0
        } else {
            1
        }
    }
}

/// A frame placed at a transmit time on a gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledDownlink {
    /// Transmit time.
    pub time: SimTime,
    /// Queue priority.
    pub priority: u8,
    /// Insertion order.
    pub sequence: u64,
    /// The frame.
    pub frame: DownlinkFrame,
    /// Transmitting gateway.
    pub gateway: GatewayId,
}

impl ScheduledDownlink {
    fn key(&self) -> (SimTime, u8, u64) {
        (self.time, self.priority, self.sequence)
    }
}

impl Eq for ScheduledDownlink {}

impl PartialOrd for ScheduledDownlink {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledDownlink {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap
        other.key().cmp(&self.key())
    }
}

/// Class B ping slot layout relative to a beacon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingSlotTiming {
    /// Effective beacon period in seconds.
    pub beacon_interval_s: f64,
    /// Spacing of ping slots in seconds.
    pub ping_slot_interval_s: f64,
    /// Offset of the first ping slot after the beacon in seconds.
    pub ping_slot_offset_s: f64,
}

impl PingSlotTiming {
    /// Ping slot times of the period that starts at `beacon`.
    pub fn slots_after(&self, beacon: SimTime) -> impl Iterator<Item = SimTime> + '_ {
        let first = beacon.as_secs() + self.ping_slot_offset_s;
        let end = beacon.as_secs() + self.beacon_interval_s;
        (0u64..)
            .map(move |k| first + k as f64 * self.ping_slot_interval_s)
            .take_while(move |t| *t < end)
            .map(SimTime::from_secs)
    }
}

/// Per-node downlink queues and per-gateway radio reservations.
#[derive(Debug, Default)]
pub struct DownlinkScheduler {
    queues: BTreeMap<NodeId, BinaryHeap<ScheduledDownlink>>,
    gateway_busy: BTreeMap<GatewayId, SimTime>,
    link_delay_s: f64,
    quantizer: TimeQuantizer,
    sequence: u64,
}

impl DownlinkScheduler {
    /// Create a scheduler adding `link_delay_s` to every transmit time.
    pub fn new(link_delay_s: f64, quantizer: TimeQuantizer) -> Self {
        DownlinkScheduler {
            queues: BTreeMap::new(),
            gateway_busy: BTreeMap::new(),
            link_delay_s,
            quantizer,
            sequence: 0,
        }
    }

    /// Instant at which `gateway`'s radio is free.
    pub fn gateway_busy(&self, gateway: GatewayId) -> SimTime {
        self.gateway_busy.get(&gateway).copied().unwrap_or(SimTime::ZERO)
    }

    /// Reserve `gateway`'s radio until `until`. Never moves the reservation back.
    pub fn reserve_gateway(&mut self, gateway: GatewayId, until: SimTime) {
        let busy = self.gateway_busy.entry(gateway).or_insert(SimTime::ZERO);
        *busy = (*busy).max(until);
    }

    /// Frames queued for `node`.
    pub fn pending(&self, node: NodeId) -> usize {
        self.queues.get(&node).map(|q| q.len()).unwrap_or(0)
    }

    /// Frames queued for all nodes.
    pub fn pending_total(&self) -> usize {
        self.queues.values().map(|q| q.len()).sum()
    }

    /// Transmit time of the next frame queued for `node`.
    pub fn next_time(&self, node: NodeId) -> Option<SimTime> {
        self.queues.get(&node)?.peek().map(|d| d.time)
    }

    /// Place a Class A downlink in RX1 or RX2.
    ///
    /// Uses the earliest window not before `after_time` and the gateway's
    /// free instant, or that instant itself if both windows have passed.
    pub fn schedule_class_a(
        &mut self,
        node: NodeId,
        after_time: SimTime,
        rx1: SimTime,
        rx2: SimTime,
        frame: DownlinkFrame,
        gateway: GatewayId,
    ) -> SimTime {
        let earliest = after_time.max(self.gateway_busy(gateway));
        let slot = [rx1, rx2]
            .into_iter()
            .find(|w| *w >= earliest)
            .unwrap_or(earliest);
        self.enqueue(node, slot, frame, gateway)
    }

    /// Place a Class B downlink in the node's next free ping slot.
    ///
    /// A slot is skipped when the node already has a frame queued at that
    /// instant or the gateway is still busy. Fails after
    /// [`MAX_PING_SLOT_ATTEMPTS`] skipped slots.
    pub fn schedule_class_b(
        &mut self,
        node: NodeId,
        after_time: SimTime,
        frame: DownlinkFrame,
        gateway: GatewayId,
        timing: &PingSlotTiming,
        last_beacon: SimTime,
    ) -> Result<SimTime, SimError> {
        let first_slot = last_beacon.as_secs() + timing.ping_slot_offset_s;
        let elapsed = after_time.as_secs() - first_slot;
        let mut k = if elapsed <= 0.0 {
            0.0
        } else {
            (elapsed / timing.ping_slot_interval_s).ceil()
        };

        let busy = self.gateway_busy(gateway);
        for _ in 0..MAX_PING_SLOT_ATTEMPTS {
            let slot = SimTime::from_secs(first_slot + k * timing.ping_slot_interval_s);
            let tx_time = self.transmit_time(slot);
            let taken = self.queues.get(&node).is_some_and(|q| {
                q.iter()
                    .any(|d| d.time.abs_diff(tx_time) < SLOT_CONFLICT_TOLERANCE_S)
            });
            if !taken && tx_time >= busy {
                return Ok(self.enqueue(node, slot, frame, gateway));
            }
            k += 1.0;
        }
        Err(SimError::PingSlotExhausted {
            node,
            attempts: MAX_PING_SLOT_ATTEMPTS,
        })
    }

    /// Place a Class C downlink as soon as the gateway is free.
    pub fn schedule_class_c(
        &mut self,
        node: NodeId,
        time: SimTime,
        frame: DownlinkFrame,
        gateway: GatewayId,
    ) -> SimTime {
        let slot = time.max(self.gateway_busy(gateway));
        self.enqueue(node, slot, frame, gateway)
    }

    /// Place a beacon on the first interval boundary strictly after
    /// `after_time` at which the gateway is free.
    pub fn schedule_beacon(
        &mut self,
        after_time: SimTime,
        frame: DownlinkFrame,
        gateway: GatewayId,
        beacon_interval_s: f64,
    ) -> SimTime {
        let busy = self.gateway_busy(gateway);
        let mut k = (after_time.as_secs() / beacon_interval_s).floor() + 1.0;
        let mut slot = SimTime::from_secs(k * beacon_interval_s);
        while slot <= after_time || self.transmit_time(slot) < busy {
            k += 1.0;
            slot = SimTime::from_secs(k * beacon_interval_s);
        }
        self.enqueue(NodeId::BROADCAST, slot, frame, gateway)
    }

    /// Pop the earliest frame for `node` due at or before `now`.
    pub fn pop_ready(&mut self, node: NodeId, now: SimTime) -> Option<ScheduledDownlink> {
        let queue = self.queues.get_mut(&node)?;
        if queue.peek()?.time > now {
            return None;
        }
        let ready = queue.pop();
        if queue.is_empty() {
            self.queues.remove(&node);
        }
        ready
    }

    fn transmit_time(&self, slot: SimTime) -> SimTime {
        self.quantizer
            .quantize(SimTime::from_secs(slot.as_secs() + self.link_delay_s))
    }

    fn enqueue(
        &mut self,
        node: NodeId,
        slot: SimTime,
        frame: DownlinkFrame,
        gateway: GatewayId,
    ) -> SimTime {
        let time = self.transmit_time(slot);
        let end = self
            .quantizer
            .quantize(SimTime::from_secs(time.as_secs() + frame.airtime_s));
        self.reserve_gateway(gateway, end);

        debug!(
            node = %node,
            gateway = %gateway,
            time = %time,
            kind = frame.kind.as_str(),
            "downlink placed"
        );

        let entry = ScheduledDownlink {
            time,
            priority: frame.priority(),
            sequence: self.sequence,
            frame,
            gateway,
        };
        self.sequence += 1;
        self.queues.entry(node).or_default().push(entry);
        time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GW: GatewayId = GatewayId(0);

    fn frame(airtime_s: f64) -> DownlinkFrame {
        DownlinkFrame::new(FrameKind::Data, LoraParams::default(), 13, airtime_s)
    }

    fn secs(s: f64) -> SimTime {
        SimTime::from_secs(s)
    }

    fn timing() -> PingSlotTiming {
        PingSlotTiming {
            beacon_interval_s: 128.0,
            ping_slot_interval_s: 32.0,
            ping_slot_offset_s: 2.0,
        }
    }

    #[test]
    fn test_class_a_prefers_rx1() {
        let mut sched = DownlinkScheduler::new(0.0, TimeQuantizer::continuous());
        let t = sched.schedule_class_a(NodeId(1), secs(0.5), secs(1.0), secs(2.0), frame(0.1), GW);
        assert_eq!(t, secs(1.0));
        assert_eq!(sched.gateway_busy(GW), secs(1.1));
    }

    #[test]
    fn test_class_a_falls_back_to_rx2_when_gateway_busy() {
        let mut sched = DownlinkScheduler::new(0.0, TimeQuantizer::continuous());
        sched.reserve_gateway(GW, secs(1.05));
        let t = sched.schedule_class_a(NodeId(1), secs(0.5), secs(1.0), secs(2.0), frame(0.1), GW);
        assert_eq!(t, secs(2.0));
    }

    #[test]
    fn test_class_a_after_both_windows_uses_earliest_free() {
        let mut sched = DownlinkScheduler::new(0.0, TimeQuantizer::continuous());
        sched.reserve_gateway(GW, secs(2.5));
        let t = sched.schedule_class_a(NodeId(1), secs(0.5), secs(1.0), secs(2.0), frame(0.1), GW);
        assert_eq!(t, secs(2.5));
    }

    #[test]
    fn test_class_c_waits_for_busy_gateway() {
        let mut sched = DownlinkScheduler::new(0.0, TimeQuantizer::continuous());
        sched.reserve_gateway(GW, secs(1.5));
        let t = sched.schedule_class_c(NodeId(3), secs(1.0), frame(0.2), GW);
        assert_eq!(t, secs(1.5));

        let idle = sched.schedule_class_c(NodeId(3), secs(5.0), frame(0.2), GW);
        assert_eq!(idle, secs(5.0));
    }

    #[test]
    fn test_link_delay_is_added() {
        let mut sched = DownlinkScheduler::new(0.25, TimeQuantizer::continuous());
        let t = sched.schedule_class_c(NodeId(3), secs(1.0), frame(0.5), GW);
        assert_eq!(t, secs(1.25));
        assert_eq!(sched.gateway_busy(GW), secs(1.75));
    }

    #[test]
    fn test_reservation_never_moves_back() {
        let mut sched = DownlinkScheduler::new(0.0, TimeQuantizer::continuous());
        assert_eq!(sched.gateway_busy(GW), SimTime::ZERO);
        sched.reserve_gateway(GW, secs(3.0));
        sched.reserve_gateway(GW, secs(1.0));
        assert_eq!(sched.gateway_busy(GW), secs(3.0));
        sched.reserve_gateway(GW, secs(4.5));
        assert_eq!(sched.gateway_busy(GW), secs(4.5));
        assert_eq!(sched.gateway_busy(GatewayId(1)), SimTime::ZERO);
    }

    #[test]
    fn test_class_b_uses_next_ping_slot() {
        let mut sched = DownlinkScheduler::new(0.0, TimeQuantizer::continuous());
        let t = sched
            .schedule_class_b(NodeId(2), secs(130.5), frame(0.1), GW, &timing(), secs(128.0))
            .unwrap();
        assert_eq!(t, secs(162.0));
    }

    #[test]
    fn test_class_b_skips_taken_slot() {
        let mut sched = DownlinkScheduler::new(0.0, TimeQuantizer::continuous());
        let first = sched
            .schedule_class_b(NodeId(2), secs(1.0), frame(0.1), GW, &timing(), SimTime::ZERO)
            .unwrap();
        let second = sched
            .schedule_class_b(NodeId(2), secs(1.0), frame(0.1), GW, &timing(), SimTime::ZERO)
            .unwrap();
        assert_eq!(first, secs(2.0));
        assert_eq!(second, secs(34.0));
    }

    #[test]
    fn test_class_b_exhaustion_is_an_error() {
        let mut sched = DownlinkScheduler::new(0.0, TimeQuantizer::continuous());
        sched.reserve_gateway(GW, secs(1.0e6));
        let err = sched
            .schedule_class_b(NodeId(2), secs(1.0), frame(0.1), GW, &timing(), SimTime::ZERO)
            .unwrap_err();
        assert!(matches!(
            err,
            SimError::PingSlotExhausted {
                node: NodeId(2),
                attempts: MAX_PING_SLOT_ATTEMPTS
            }
        ));
        assert_eq!(sched.pending(NodeId(2)), 0);
    }

    #[test]
    fn test_beacon_strictly_after() {
        let mut sched = DownlinkScheduler::new(0.0, TimeQuantizer::continuous());
        let beacon = DownlinkFrame::new(FrameKind::Beacon, LoraParams::default(), 17, 0.1);
        assert_eq!(sched.schedule_beacon(secs(128.0), beacon.clone(), GW, 128.0), secs(256.0));
        assert_eq!(sched.schedule_beacon(secs(300.0), beacon, GW, 128.0), secs(384.0));
    }

    #[test]
    fn test_pop_ready_orders_by_time_priority_sequence() {
        let mut sched = DownlinkScheduler::new(0.0, TimeQuantizer::continuous());
        let node = NodeId(4);
        let gws = [GatewayId(0), GatewayId(1), GatewayId(2)];
        let mut ack = frame(0.1);
        ack.ack = true;

        sched.schedule_class_c(node, secs(1.0), frame(0.1), gws[0]);
        sched.schedule_class_c(node, secs(1.0), ack, gws[1]);
        sched.schedule_class_c(node, secs(1.0), frame(0.1), gws[2]);

        assert!(sched.pop_ready(node, secs(0.5)).is_none());
        let first = sched.pop_ready(node, secs(1.0)).unwrap();
        assert!(first.frame.ack);
        assert_eq!(sched.pop_ready(node, secs(1.0)).unwrap().gateway, gws[0]);
        assert_eq!(sched.pop_ready(node, secs(1.0)).unwrap().gateway, gws[2]);
        assert!(sched.pop_ready(node, secs(9.0)).is_none());
        assert_eq!(sched.pending_total(), 0);
    }

    #[test]
    fn test_gateway_never_overlaps() {
        let mut sched = DownlinkScheduler::new(0.0, TimeQuantizer::continuous());
        let mut placed = Vec::new();
        for i in 0..20u64 {
            let node = NodeId(i % 4);
            let t = match i % 3 {
                0 => sched.schedule_class_c(node, secs(i as f64 * 0.05), frame(0.3), GW),
                1 => sched.schedule_class_a(
                    node,
                    secs(i as f64 * 0.05),
                    secs(1.0),
                    secs(2.0),
                    frame(0.3),
                    GW,
                ),
                _ => sched
                    .schedule_class_b(node, secs(0.0), frame(0.3), GW, &timing(), SimTime::ZERO)
                    .unwrap(),
            };
            placed.push((t.as_secs(), t.as_secs() + 0.3));
        }
        placed.sort_by(|a, b| a.0.total_cmp(&b.0));
        for pair in placed.windows(2) {
            assert!(pair[0].1 <= pair[1].0 + 1e-12, "{:?} overlaps {:?}", pair[0], pair[1]);
        }
    }
}
