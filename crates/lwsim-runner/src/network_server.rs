//! Network server.
//!
//! Gateways forward every decoded uplink. The server keeps the best copy per
//! uplink, processes it once, and answers with at most one downlink through
//! the gateway that heard the node best.

use crate::adr::{AdrInput, AdrStrategy};
use crate::downlink_scheduler::{DownlinkFrame, FrameKind, MAC_OVERHEAD_BYTES};
use crate::node::{UplinkFrame, UplinkKind};
use lwsim_common::{EventId, GatewayId, NodeId, SimTime};
use lwsim_metrics::metric_defs;
use lwsim_phy::{Channel, LoraParams, LoraPhyConfig};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, trace};

/// PHY payload of a join accept.
pub const JOIN_ACCEPT_BYTES: usize = 17;
/// Extra bytes a `LinkADRReq` adds to a downlink.
pub const LINK_ADR_REQ_BYTES: usize = 5;

/// A gateway's copy of one uplink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UplinkCopy {
    /// Uplink transmission id.
    pub uplink: EventId,
    /// Transmitting node.
    pub node: NodeId,
    /// Forwarding gateway.
    pub gateway: GatewayId,
    /// RSSI at the gateway in dBm.
    pub rssi_dbm: f64,
    /// SNIR at the gateway in dB.
    pub snir_db: f64,
    /// Frame content.
    pub frame: UplinkFrame,
    /// Radio settings of the uplink.
    pub params: LoraParams,
    /// Transmit power of the uplink in dBm.
    pub tx_power_dbm: f64,
    /// End of the uplink.
    pub end_time: SimTime,
}

/// A downlink the server wants delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkRequest {
    /// Destination node.
    pub node: NodeId,
    /// Gateway to transmit from.
    pub gateway: GatewayId,
    /// The frame.
    pub frame: DownlinkFrame,
    /// End of the uplink being answered; anchors RX1 and RX2.
    pub uplink_end: SimTime,
}

/// ADR settings of the server.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdrSettings {
    /// Installation margin in dB.
    pub margin_db: f64,
    /// SNIR values collected before the strategy runs.
    pub history_len: usize,
}

#[derive(Debug, Default)]
struct DeviceSession {
    node_class: &'static str,
    adr: bool,
    snr_history: VecDeque<f64>,
    fcnt_down: u32,
}

/// Counters kept by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerCounters {
    /// Unique uplinks received.
    pub packets_received: u64,
    /// Extra copies of already received uplinks.
    pub duplicates: u64,
    /// Acknowledgements issued.
    pub acks: u64,
    /// Join accepts issued.
    pub join_accepts: u64,
    /// ADR commands issued.
    pub adr_commands: u64,
}

/// Deduplicating network server with ADR.
pub struct NetworkServer {
    strategy: Box<dyn AdrStrategy>,
    adr: AdrSettings,
    phy: LoraPhyConfig,
    devices: BTreeMap<NodeId, DeviceSession>,
    pending: BTreeMap<EventId, UplinkCopy>,
    processed: BTreeSet<EventId>,
    counters: ServerCounters,
}

impl NetworkServer {
    /// Create a server running `strategy`.
    pub fn new(strategy: Box<dyn AdrStrategy>, adr: AdrSettings, phy: LoraPhyConfig) -> Self {
        NetworkServer {
            strategy,
            adr,
            phy,
            devices: BTreeMap::new(),
            pending: BTreeMap::new(),
            processed: BTreeSet::new(),
            counters: ServerCounters::default(),
        }
    }

    /// Make a device known to the server.
    pub fn register_device(&mut self, node: NodeId, node_class: &'static str, adr: bool) {
        self.devices.insert(
            node,
            DeviceSession {
                node_class,
                adr,
                ..DeviceSession::default()
            },
        );
    }

    /// Name of the active ADR strategy.
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Unique uplinks received.
    pub fn packets_received(&self) -> u64 {
        self.counters.packets_received
    }

    /// All counters.
    pub fn counters(&self) -> ServerCounters {
        self.counters
    }

    /// SNIR history of a node.
    pub fn snr_history(&self, node: NodeId) -> Vec<f64> {
        self.devices
            .get(&node)
            .map(|d| d.snr_history.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Accept a gateway copy. Returns `true` for the first copy of an uplink.
    pub fn receive(&mut self, copy: UplinkCopy) -> bool {
        if self.processed.contains(&copy.uplink) {
            self.count_duplicate(&copy);
            return false;
        }
        if let Some(best) = self.pending.get_mut(&copy.uplink) {
            if copy.snir_db > best.snir_db {
                *best = copy;
            }
            self.count_duplicate(&copy);
            return false;
        }

        trace!(
            uplink = %copy.uplink,
            node = %copy.node,
            gateway = %copy.gateway,
            snir_db = copy.snir_db,
            "uplink received"
        );
        self.pending.insert(copy.uplink, copy);
        self.counters.packets_received += 1;
        metrics::counter!(metric_defs::SERVER_UPLINKS.name).increment(1);
        true
    }

    fn count_duplicate(&mut self, copy: &UplinkCopy) {
        self.counters.duplicates += 1;
        metrics::counter!(metric_defs::SERVER_DUPLICATES.name).increment(1);
        trace!(uplink = %copy.uplink, gateway = %copy.gateway, "duplicate copy");
    }

    /// Process a deduplicated uplink and build the answer, if any.
    pub fn process(&mut self, uplink: EventId, channel: &dyn Channel) -> Option<DownlinkRequest> {
        let copy = self.pending.remove(&uplink)?;
        self.processed.insert(uplink);
        let session = self.devices.entry(copy.node).or_default();

        let mut frame = match copy.frame.kind {
            UplinkKind::JoinRequest => {
                self.counters.join_accepts += 1;
                metrics::counter!(metric_defs::SERVER_JOIN_ACCEPTS.name).increment(1);
                session.snr_history.clear();
                DownlinkFrame::new(FrameKind::JoinAccept, copy.params, JOIN_ACCEPT_BYTES, 0.0)
            }
            UplinkKind::Data => {
                session.snr_history.push_back(copy.snir_db);
                while session.snr_history.len() > self.adr.history_len {
                    session.snr_history.pop_front();
                }

                let link_adr = if session.adr
                    && copy.frame.adr
                    && session.snr_history.len() >= self.adr.history_len
                {
                    let history: Vec<f64> = session.snr_history.iter().copied().collect();
                    let input = AdrInput {
                        snr_history: &history,
                        spreading_factor: copy.params.spreading_factor,
                        tx_power_dbm: copy.tx_power_dbm,
                        required_snr_db: self.phy.snr_threshold(copy.params.spreading_factor),
                        margin_db: self.adr.margin_db,
                    };
                    self.strategy.evaluate(&input)
                } else {
                    None
                };

                if !copy.frame.confirmed && link_adr.is_none() {
                    return None;
                }

                let mut payload_len = MAC_OVERHEAD_BYTES;
                if let Some(cmd) = link_adr {
                    payload_len += LINK_ADR_REQ_BYTES;
                    session.snr_history.clear();
                    self.counters.adr_commands += 1;
                    let labels = vec![
                        ("node", copy.node.to_string()),
                        ("strategy", self.strategy.name().to_string()),
                    ];
                    metrics::counter!(metric_defs::ADR_COMMANDS.name, &labels).increment(1);
                    debug!(
                        node = %copy.node,
                        sf = cmd.spreading_factor,
                        tx_power_dbm = cmd.tx_power_dbm,
                        "ADR command issued"
                    );
                }
                if copy.frame.confirmed {
                    self.counters.acks += 1;
                    metrics::counter!(metric_defs::SERVER_ACKS.name).increment(1);
                }

                let mut frame = DownlinkFrame::new(FrameKind::Data, copy.params, payload_len, 0.0);
                frame.ack = copy.frame.confirmed;
                frame.link_adr = link_adr;
                frame
            }
        };

        frame.fcnt = session.fcnt_down;
        session.fcnt_down = session.fcnt_down.wrapping_add(1);
        frame.airtime_s = channel.airtime(&frame.params, frame.payload_len);

        debug!(
            node = %copy.node,
            class = session.node_class,
            gateway = %copy.gateway,
            kind = frame.kind.as_str(),
            ack = frame.ack,
            "downlink requested"
        );
        Some(DownlinkRequest {
            node: copy.node,
            gateway: copy.gateway,
            frame,
            uplink_end: copy.end_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adr::{strategy_by_name, NoAdr};
    use lwsim_phy::LinkTableChannel;

    fn server(strategy: Box<dyn AdrStrategy>, history_len: usize) -> NetworkServer {
        let mut server = NetworkServer::new(
            strategy,
            AdrSettings {
                margin_db: 10.0,
                history_len,
            },
            LoraPhyConfig::default(),
        );
        server.register_device(NodeId(1), "class_a", true);
        server
    }

    fn copy(uplink: u64, gateway: u64, snir_db: f64, confirmed: bool) -> UplinkCopy {
        UplinkCopy {
            uplink: EventId(uplink),
            node: NodeId(1),
            gateway: GatewayId(gateway),
            rssi_dbm: -90.0,
            snir_db,
            frame: UplinkFrame {
                kind: UplinkKind::Data,
                fcnt: uplink as u32,
                confirmed,
                adr: true,
                payload_len: 33,
                attempt: 0,
            },
            params: LoraParams::default().with_sf(12),
            tx_power_dbm: 14.0,
            end_time: SimTime::from_secs(1.0),
        }
    }

    #[test]
    fn test_deduplicates_and_keeps_best_gateway() {
        let mut ns = server(Box::new(NoAdr), 20);
        let channel = LinkTableChannel::new(-120.0);
        assert!(ns.receive(copy(5, 0, 3.0, true)));
        assert!(!ns.receive(copy(5, 1, 9.0, true)));
        assert!(!ns.receive(copy(5, 2, 1.0, true)));
        assert_eq!(ns.packets_received(), 1);
        assert_eq!(ns.counters().duplicates, 2);

        let req = ns.process(EventId(5), &channel).unwrap();
        assert_eq!(req.gateway, GatewayId(1));
        assert!(req.frame.ack);
        assert!(req.frame.airtime_s > 0.0);

        // A straggler after processing is still a duplicate.
        assert!(!ns.receive(copy(5, 3, 20.0, true)));
        assert_eq!(ns.counters().duplicates, 3);
        assert!(ns.process(EventId(5), &channel).is_none());
    }

    #[test]
    fn test_unconfirmed_without_adr_needs_no_downlink() {
        let mut ns = server(Box::new(NoAdr), 20);
        let channel = LinkTableChannel::new(-120.0);
        ns.receive(copy(1, 0, 3.0, false));
        assert!(ns.process(EventId(1), &channel).is_none());
        assert_eq!(ns.snr_history(NodeId(1)), vec![3.0]);
    }

    #[test]
    fn test_adr_command_after_full_history() {
        let mut ns = server(strategy_by_name("lorawan-avg").unwrap(), 3);
        let channel = LinkTableChannel::new(-120.0);
        for id in 0..2 {
            ns.receive(copy(id, 0, 10.0, false));
            assert!(ns.process(EventId(id), &channel).is_none());
        }
        ns.receive(copy(2, 0, 10.0, false));
        let req = ns.process(EventId(2), &channel).unwrap();
        let cmd = req.frame.link_adr.unwrap();
        assert_eq!(cmd.spreading_factor, 7);
        assert!(!req.frame.ack);
        assert_eq!(ns.counters().adr_commands, 1);
        assert!(ns.snr_history(NodeId(1)).is_empty());
    }

    #[test]
    fn test_join_request_gets_join_accept() {
        let mut ns = server(Box::new(NoAdr), 20);
        let channel = LinkTableChannel::new(-120.0);
        let mut join = copy(9, 0, 0.0, true);
        join.frame.kind = UplinkKind::JoinRequest;
        ns.receive(join);
        let req = ns.process(EventId(9), &channel).unwrap();
        assert_eq!(req.frame.kind, FrameKind::JoinAccept);
        assert_eq!(req.frame.priority(), 0);
        assert_eq!(ns.counters().join_accepts, 1);
    }
}
