//! The event kernel.
//!
//! [`Simulator`] owns logical time and every piece of mutable network state.
//! Each call to [`Simulator::step`] pops the earliest event, advances the
//! clock to it and runs exactly one state transition. Events sharing a
//! timestamp are dispatched in `(kind rank, id, node id)` order, so a run is
//! fully determined by the model and its seed.

use crate::adr::strategy_by_name;
use crate::downlink_scheduler::{DownlinkFrame, DownlinkScheduler, FrameKind, PingSlotTiming};
use crate::event_log::{EventLog, EventLogRow};
use crate::event_queue::EventQueue;
use crate::gateway::{Gateway, GatewayReception, IncomingSignal};
use crate::network_server::{AdrSettings, DownlinkRequest, NetworkServer, UplinkCopy};
use crate::node::{EndDevice, Uplink};
use crate::{NodeStats, RunnerError, SimulationStats};
use lwsim_common::{
    seeded_rng, DeviceClass, Event, EventId, EventKind, EventPayload, GatewayId, NodeId, RxWindow,
    SimError, SimRng, SimTime,
};
use lwsim_metrics::{gateway_labels, metric_defs, MetricLabels};
use lwsim_model::{ChannelSection, ClassBSection, Model, TimingSection};
use lwsim_phy::{Channel, LinkContext, LinkTableChannel, LoraParams, LoraPhyConfig, TxOutcome};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Beacon PHY payload length.
pub const BEACON_BYTES: usize = 17;
/// Spreading factor of the Class B beacon.
pub const BEACON_SF: u8 = 9;

/// Build the channel described by the model.
pub fn channel_from_model(model: &Model) -> Box<dyn Channel> {
    match &model.channel {
        ChannelSection::LogDistance(channel) => Box::new(channel.clone()),
        ChannelSection::LinkTable {
            noise_floor_dbm,
            fixed_airtime_s,
            links,
        } => {
            let mut channel = LinkTableChannel::new(*noise_floor_dbm);
            for link in links {
                channel.set_link(NodeId(link.node), GatewayId(link.gateway), link.rssi_dbm);
            }
            match fixed_airtime_s {
                Some(airtime) => Box::new(channel.with_fixed_airtime(*airtime)),
                None => Box::new(channel),
            }
        }
    }
}

/// The discrete-event LoRaWAN network simulator.
pub struct Simulator {
    queue: EventQueue,
    now: SimTime,
    running: bool,
    rng: SimRng,
    channel: Box<dyn Channel>,
    phy: LoraPhyConfig,
    timing: TimingSection,
    class_b: ClassBSection,
    ping_timing: PingSlotTiming,
    beacon_params: LoraParams,
    stop_on_first_error: bool,
    gateways: Vec<Gateway>,
    nodes: BTreeMap<NodeId, EndDevice>,
    labels: BTreeMap<NodeId, MetricLabels>,
    scheduler: DownlinkScheduler,
    server: NetworkServer,
    in_flight: BTreeMap<EventId, Uplink>,
    forwarded: BTreeMap<(EventId, GatewayId), UplinkCopy>,
    last_beacon: SimTime,
    stats: SimulationStats,
    node_stats: BTreeMap<NodeId, NodeStats>,
    event_log: Option<EventLog>,
}

impl Simulator {
    /// Build a simulator from a validated model.
    pub fn new(model: &Model) -> Result<Self, RunnerError> {
        Self::with_channel(model, channel_from_model(model))
    }

    /// Build a simulator with a custom propagation model.
    pub fn with_channel(model: &Model, channel: Box<dyn Channel>) -> Result<Self, RunnerError> {
        let strategy = strategy_by_name(&model.adr.strategy).ok_or_else(|| {
            RunnerError::ConfigError(format!(
                "unknown ADR strategy '{}', expected one of {:?}",
                model.adr.strategy,
                crate::adr::STRATEGY_NAMES
            ))
        })?;
        let phy = model.phy_config();
        let mut server = NetworkServer::new(
            strategy,
            AdrSettings {
                margin_db: model.adr.margin_db,
                history_len: model.adr.history_len,
            },
            phy.clone(),
        );

        let capture = model.capture_config();
        let mut gateways: Vec<Gateway> = model
            .gateways
            .iter()
            .map(|g| Gateway::new(GatewayId(g.id), g.position, capture.clone()))
            .collect();
        // Per-gateway channel draws follow this order.
        gateways.sort_by_key(|g| g.id);

        let mut nodes = BTreeMap::new();
        let mut labels = BTreeMap::new();
        let mut node_stats = BTreeMap::new();
        for def in &model.nodes {
            let node = EndDevice::new(def, model.radio_params(def.sf));
            server.register_device(node.id, node.class.as_label(), node.adr_enabled());
            labels.insert(
                node.id,
                MetricLabels::new(node.id.to_string(), node.class.as_label()),
            );
            node_stats.insert(
                node.id,
                NodeStats {
                    class: node.class,
                    ..NodeStats::default()
                },
            );
            nodes.insert(node.id, node);
        }

        let class_b = model.class_b.clone();
        let ping_timing = PingSlotTiming {
            beacon_interval_s: class_b.effective_beacon_interval_s(),
            ping_slot_interval_s: class_b.ping_slot_interval_s,
            ping_slot_offset_s: class_b.ping_slot_offset_s,
        };

        let mut sim = Simulator {
            queue: EventQueue::new(model.quantizer),
            now: SimTime::ZERO,
            running: true,
            rng: seeded_rng(model.simulation.seed),
            channel,
            phy,
            timing: model.timing.clone(),
            class_b,
            ping_timing,
            beacon_params: model.radio_params(BEACON_SF),
            stop_on_first_error: model.simulation.stop_on_first_error,
            gateways,
            nodes,
            labels,
            scheduler: DownlinkScheduler::new(model.timing.link_delay_s, model.quantizer),
            server,
            in_flight: BTreeMap::new(),
            forwarded: BTreeMap::new(),
            last_beacon: SimTime::ZERO,
            stats: SimulationStats::default(),
            node_stats,
            event_log: None,
        };
        sim.schedule_initial_events();
        info!(
            nodes = sim.nodes.len(),
            gateways = sim.gateways.len(),
            seed = model.simulation.seed,
            adr = sim.server.strategy_name(),
            "simulation built"
        );
        Ok(sim)
    }

    fn schedule_initial_events(&mut self) {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in ids {
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            if let Some(first) = node.first_arrival(&mut self.rng) {
                self.queue
                    .schedule_new(first, EventKind::TxStart, id, EventPayload::None);
            }
            if let Some(interval) = node.mobility_interval_s() {
                self.queue.schedule_new(
                    SimTime::from_secs(interval),
                    EventKind::Mobility,
                    id,
                    EventPayload::None,
                );
            }
        }

        if self.nodes.values().any(|n| n.class == DeviceClass::B) {
            self.arm_ping_slots(SimTime::ZERO);
            let first = self.ping_timing.beacon_interval_s - self.class_b.beacon_guard_s;
            self.queue.schedule_new(
                SimTime::from_secs(first),
                EventKind::Beacon,
                NodeId::BROADCAST,
                EventPayload::None,
            );
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Current simulation time.
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Pending events.
    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    /// The network server.
    pub fn server(&self) -> &NetworkServer {
        &self.server
    }

    /// The downlink scheduler.
    pub fn scheduler(&self) -> &DownlinkScheduler {
        &self.scheduler
    }

    /// Mutable access to the downlink scheduler.
    pub fn scheduler_mut(&mut self) -> &mut DownlinkScheduler {
        &mut self.scheduler
    }

    /// Gateways in ascending id order.
    pub fn gateways(&self) -> &[Gateway] {
        &self.gateways
    }

    /// Look up a node.
    pub fn node(&self, id: NodeId) -> Option<&EndDevice> {
        self.nodes.get(&id)
    }

    /// Time of the last beacon the nodes synchronized to.
    pub fn last_beacon(&self) -> SimTime {
        self.last_beacon
    }

    /// Start recording the per-transmission event log.
    pub fn enable_event_log(&mut self) {
        self.event_log.get_or_insert_with(EventLog::default);
    }

    /// The event log, if enabled.
    pub fn event_log(&self) -> Option<&EventLog> {
        self.event_log.as_ref()
    }

    /// Allocate a fresh event id for an externally scheduled event.
    pub fn next_event_id(&mut self) -> EventId {
        self.queue.next_id()
    }

    /// Snapshot of the statistics.
    pub fn stats(&self) -> SimulationStats {
        let counters = self.server.counters();
        let mut stats = self.stats.clone();
        stats.duplicates = counters.duplicates;
        stats.server_packets_received = counters.packets_received;
        stats.join_accepts = counters.join_accepts;
        stats.adr_commands = counters.adr_commands;
        stats.downlinks_undelivered = (self.scheduler.pending_total()
            - self.scheduler.pending(NodeId::BROADCAST)) as u64;
        stats.simulation_time_s = self.now.as_secs();
        stats.nodes = self
            .node_stats
            .iter()
            .map(|(id, s)| {
                let mut s = s.clone();
                s.pdr = if s.sent > 0 {
                    s.delivered as f64 / s.sent as f64
                } else {
                    0.0
                };
                (id.0, s)
            })
            .collect();
        stats
    }

    // ========================================================================
    // Run Control
    // ========================================================================

    /// Insert an event into the queue.
    pub fn schedule(&mut self, event: Event) {
        self.queue.schedule(event);
    }

    /// Stop the run; the next [`step`](Self::step) returns `false`.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Dispatch the earliest event.
    ///
    /// Returns `Ok(false)` exactly when the queue is empty or the run was
    /// stopped.
    pub fn step(&mut self) -> Result<bool, SimError> {
        if !self.running {
            return Ok(false);
        }
        let Some(event) = self.queue.pop() else {
            return Ok(false);
        };
        if event.time < self.now {
            return Err(SimError::TimeWentBackwards {
                event_time: event.time,
                now: self.now,
            });
        }
        self.now = event.time;
        self.stats.total_events += 1;

        trace!(
            time = %event.time,
            kind = %event.kind,
            id = %event.id,
            node = %event.node_id,
            "dispatch"
        );
        metrics::counter!(metric_defs::SIM_EVENTS.name, "kind" => event.kind.as_str()).increment(1);

        match event.kind {
            EventKind::TxStart => self.on_tx_start(&event)?,
            EventKind::TxEnd => self.on_tx_end(&event)?,
            EventKind::Mobility => self.on_mobility(&event)?,
            EventKind::RxWindow => self.on_rx_window(&event)?,
            EventKind::Beacon => self.on_beacon()?,
            EventKind::PingSlot => self.on_ping_slot(&event)?,
            EventKind::ServerRx => self.on_server_rx(&event),
            EventKind::ServerProcess => self.on_server_process(&event)?,
        }

        metrics::gauge!(metric_defs::SIM_QUEUE_DEPTH.name).set(self.queue.len() as f64);
        metrics::gauge!(metric_defs::SIM_TIME.name).set(self.now.as_secs());
        Ok(true)
    }

    /// Run every event up to and including `until`.
    pub fn run(&mut self, until: SimTime) -> Result<SimulationStats, SimError> {
        self.run_with_stop_flag(until, None)
    }

    /// Run up to `until`, stopping early once `stop_flag` is set.
    pub fn run_with_stop_flag(
        &mut self,
        until: SimTime,
        stop_flag: Option<Arc<AtomicBool>>,
    ) -> Result<SimulationStats, SimError> {
        loop {
            if let Some(flag) = &stop_flag {
                if flag.load(Ordering::Relaxed) {
                    info!(time = %self.now, "stop requested");
                    self.stop();
                    break;
                }
            }
            match self.queue.peek_time() {
                Some(t) if t <= until => {
                    if !self.step()? {
                        break;
                    }
                }
                _ => break,
            }
        }
        if self.running {
            self.now = self.now.max(until);
        }
        self.drain_beacons();
        Ok(self.stats())
    }

    // ========================================================================
    // Uplinks
    // ========================================================================

    fn node_mut(&mut self, id: NodeId) -> Result<&mut EndDevice, SimError> {
        self.nodes.get_mut(&id).ok_or(SimError::UnknownNode(id))
    }

    fn on_tx_start(&mut self, event: &Event) -> Result<(), SimError> {
        let now = self.now;
        let quantizer = self.queue.quantizer();
        let channel = &self.channel;
        let node = self
            .nodes
            .get_mut(&event.node_id)
            .ok_or(SimError::UnknownNode(event.node_id))?;
        if let Some(next) = node.skip_acked_retry(now, &mut self.rng) {
            if let Some(next) = next {
                self.queue
                    .schedule_new(next, EventKind::TxStart, event.node_id, EventPayload::None);
            }
            return Ok(());
        }
        let mut uplink = node.begin_uplink(
            event.id,
            now,
            |params, len| channel.airtime(params, len),
            &mut self.rng,
        );
        uplink.end = quantizer.quantize(uplink.end);
        let position = node.position;

        let labels = self.node_labels(event.node_id, Some(uplink.params.spreading_factor));
        metrics::counter!(metric_defs::UPLINK_SENT.name, &labels).increment(1);
        metrics::counter!(metric_defs::UPLINK_AIRTIME.name, &labels)
            .increment((uplink.airtime_s() * 1e6).round() as u64);
        self.stats.uplinks_sent += 1;
        let node_stats = self.node_stats.entry(event.node_id).or_default();
        node_stats.sent += 1;
        if uplink.frame.attempt > 0 {
            node_stats.retransmissions += 1;
            self.stats.retransmissions += 1;
            metrics::counter!(metric_defs::UPLINK_RETRANSMISSIONS.name, &labels).increment(1);
        }

        for gateway in &mut self.gateways {
            let link = LinkContext {
                node: uplink.node,
                gateway: gateway.id,
                distance_m: position.distance_to(&gateway.position),
                tx_power_dbm: uplink.tx_power_dbm,
                frequency_hz: uplink.frequency_hz,
                params: uplink.params,
            };
            let (rssi_dbm, snr_db) = self.channel.compute_rssi(&link, &mut self.rng);
            let detected = self.phy.detects(&uplink.params, rssi_dbm, snr_db);
            let signal = IncomingSignal {
                event_id: uplink.id,
                node_id: uplink.node,
                params: uplink.params,
                frequency_hz: uplink.frequency_hz,
                rssi_dbm,
                snr_db,
                start: uplink.start,
                end: uplink.end,
            };
            let lost = gateway.begin_reception(&signal, detected);
            trace!(
                gateway = %gateway.id,
                id = %uplink.id,
                rssi_dbm,
                snr_db,
                detected,
                lost_on_arrival = lost.unwrap_or(false),
                "signal arrives"
            );
            metrics::gauge!(
                metric_defs::GATEWAY_ACTIVE_RECEPTIONS.name,
                &gateway_labels(gateway.id.0)
            )
            .set(gateway.capture().active_count() as f64);
        }

        self.queue
            .schedule(Event::new(uplink.end, EventKind::TxEnd, uplink.id, uplink.node));
        for (delay, window) in [
            (self.timing.rx1_delay_s, RxWindow::Rx1),
            (self.timing.rx2_delay_s, RxWindow::Rx2),
        ] {
            self.queue.schedule_new(
                SimTime::from_secs(uplink.end.as_secs() + delay),
                EventKind::RxWindow,
                uplink.node,
                EventPayload::RxWindow(window),
            );
        }

        self.log_row(&uplink, "pending", None);
        self.in_flight.insert(uplink.id, uplink);
        Ok(())
    }

    fn on_tx_end(&mut self, event: &Event) -> Result<(), SimError> {
        let Some(uplink) = self.in_flight.remove(&event.id) else {
            warn!(id = %event.id, "TxEnd without a transmission in flight");
            return Ok(());
        };

        let noise_floor_dbm = self.channel.noise_floor_dbm(uplink.params.bandwidth_hz);
        let sf_label = uplink.params.spreading_factor.to_string();
        let mut outcome = TxOutcome::NoCoverage;
        let mut receptions: Vec<GatewayReception> = Vec::with_capacity(self.gateways.len());
        for gateway in &mut self.gateways {
            let rx = gateway.end_reception(
                uplink.id,
                uplink.frequency_hz,
                self.now,
                noise_floor_dbm,
                &self.phy,
            );
            outcome = outcome.merge(rx.outcome);
            let gw_labels = gateway_labels(gateway.id.0);
            match rx.outcome {
                TxOutcome::Success => {
                    let labels = vec![
                        ("gateway", gateway.id.to_string()),
                        ("sf", sf_label.clone()),
                    ];
                    metrics::counter!(metric_defs::GATEWAY_RECEIVED.name, &labels).increment(1);
                    metrics::histogram!(metric_defs::GATEWAY_RSSI.name, &gw_labels)
                        .record(rx.rssi_dbm);
                    if let Some(snir) = rx.snir_db {
                        metrics::histogram!(metric_defs::GATEWAY_SNIR.name, &gw_labels)
                            .record(snir);
                    }
                }
                TxOutcome::CollisionLoss => {
                    let labels = vec![
                        ("gateway", gateway.id.to_string()),
                        ("sf", sf_label.clone()),
                    ];
                    metrics::counter!(metric_defs::GATEWAY_COLLISIONS.name, &labels).increment(1);
                }
                TxOutcome::NoCoverage => {}
            }
            receptions.push(rx);
        }

        let labels = self.node_labels(uplink.node, Some(uplink.params.spreading_factor));
        let node_stats = self.node_stats.entry(uplink.node).or_default();
        match outcome {
            TxOutcome::Success => {
                self.stats.uplinks_delivered += 1;
                node_stats.delivered += 1;
                metrics::counter!(metric_defs::UPLINK_DELIVERED.name, &labels).increment(1);
            }
            TxOutcome::CollisionLoss => {
                self.stats.collision_losses += 1;
                node_stats.collision_losses += 1;
                metrics::counter!(metric_defs::UPLINK_COLLISION_LOSS.name, &labels).increment(1);
            }
            TxOutcome::NoCoverage => {
                self.stats.no_coverage += 1;
                node_stats.no_coverage += 1;
                metrics::counter!(metric_defs::UPLINK_NO_COVERAGE.name, &labels).increment(1);
            }
        }
        debug!(
            id = %uplink.id,
            node = %uplink.node,
            sf = uplink.params.spreading_factor,
            outcome = outcome.as_str(),
            "uplink finished"
        );

        for rx in receptions.iter().filter(|r| r.outcome == TxOutcome::Success) {
            let copy = UplinkCopy {
                uplink: uplink.id,
                node: uplink.node,
                gateway: rx.gateway,
                rssi_dbm: rx.rssi_dbm,
                snir_db: rx.snir_db.unwrap_or(rx.snr_db),
                frame: uplink.frame,
                params: uplink.params,
                tx_power_dbm: uplink.tx_power_dbm,
                end_time: uplink.end,
            };
            self.forwarded.insert((uplink.id, rx.gateway), copy);
            self.queue.schedule_new(
                SimTime::from_secs(self.now.as_secs() + self.timing.server_rx_delay_s),
                EventKind::ServerRx,
                uplink.node,
                EventPayload::ServerRx {
                    uplink: uplink.id,
                    gateway: rx.gateway,
                },
            );
        }

        let best = receptions
            .iter()
            .filter(|r| r.outcome == TxOutcome::Success)
            .max_by(|a, b| {
                a.snir_db
                    .unwrap_or(a.snr_db)
                    .total_cmp(&b.snir_db.unwrap_or(b.snr_db))
            })
            .or_else(|| {
                receptions
                    .iter()
                    .filter(|r| r.rssi_dbm.is_finite())
                    .max_by(|a, b| a.rssi_dbm.total_cmp(&b.rssi_dbm))
            })
            .copied();
        self.log_row(&uplink, outcome.as_str(), best);

        let node = self
            .nodes
            .get_mut(&uplink.node)
            .ok_or(SimError::UnknownNode(uplink.node))?;
        if let Some(next) = node.end_uplink(&uplink, &self.timing, &mut self.rng) {
            self.queue
                .schedule_new(next, EventKind::TxStart, uplink.node, EventPayload::None);
        }
        Ok(())
    }

    fn log_row(&mut self, uplink: &Uplink, result: &str, best: Option<GatewayReception>) {
        let Some(log) = self.event_log.as_mut() else {
            return;
        };
        log.push(EventLogRow {
            event_id: uplink.id.0,
            node_id: uplink.node.0,
            sf: uplink.params.spreading_factor,
            start_time: uplink.start.as_secs(),
            end_time: uplink.end.as_secs(),
            frequency: uplink.frequency_hz,
            result: result.to_string(),
            gateway_id: best.map(|r| r.gateway.0),
            rssi: best.map(|r| r.rssi_dbm),
            snr: best.map(|r| r.snir_db.unwrap_or(r.snr_db)),
        });
    }

    fn on_mobility(&mut self, event: &Event) -> Result<(), SimError> {
        let node = self
            .nodes
            .get_mut(&event.node_id)
            .ok_or(SimError::UnknownNode(event.node_id))?;
        node.move_step(&mut self.rng);
        trace!(node = %node.id, x = node.position.x, y = node.position.y, "moved");
        if let Some(interval) = node.mobility_interval_s() {
            let next = SimTime::from_secs(self.now.as_secs() + interval);
            self.queue
                .schedule_new(next, EventKind::Mobility, event.node_id, EventPayload::None);
        }
        Ok(())
    }

    // ========================================================================
    // Network Server
    // ========================================================================

    fn on_server_rx(&mut self, event: &Event) {
        let EventPayload::ServerRx { uplink, gateway } = event.payload else {
            warn!(id = %event.id, "ServerRx without payload");
            return;
        };
        let Some(copy) = self.forwarded.remove(&(uplink, gateway)) else {
            return;
        };
        if self.server.receive(copy) {
            self.queue.schedule_new(
                SimTime::from_secs(self.now.as_secs() + self.timing.server_process_delay_s),
                EventKind::ServerProcess,
                copy.node,
                EventPayload::ServerProcess { uplink },
            );
        }
    }

    fn on_server_process(&mut self, event: &Event) -> Result<(), SimError> {
        let EventPayload::ServerProcess { uplink } = event.payload else {
            warn!(id = %event.id, "ServerProcess without payload");
            return Ok(());
        };
        match self.server.process(uplink, self.channel.as_ref()) {
            Some(request) => self.send_downlink(request).map(|_| ()),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Downlinks
    // ========================================================================

    /// Place a downlink according to the destination's device class.
    ///
    /// Returns the transmit time, or `None` when a Class B frame found no
    /// ping slot and the model tolerates that. Otherwise exhaustion is an
    /// error.
    pub fn send_downlink(&mut self, request: DownlinkRequest) -> Result<Option<SimTime>, SimError> {
        let class = self
            .nodes
            .get(&request.node)
            .map(|n| n.class)
            .ok_or(SimError::UnknownNode(request.node))?;
        if self
            .gateways
            .binary_search_by_key(&request.gateway, |g| g.id)
            .is_err()
        {
            return Err(SimError::UnknownGateway(request.gateway));
        }
        let kind = request.frame.kind;

        let time = match class {
            DeviceClass::A => {
                let end = request.uplink_end.as_secs();
                self.scheduler.schedule_class_a(
                    request.node,
                    self.now,
                    SimTime::from_secs(end + self.timing.rx1_delay_s),
                    SimTime::from_secs(end + self.timing.rx2_delay_s),
                    request.frame,
                    request.gateway,
                )
            }
            DeviceClass::B => match self.scheduler.schedule_class_b(
                request.node,
                self.now,
                request.frame,
                request.gateway,
                &self.ping_timing,
                self.last_beacon,
            ) {
                Ok(time) => time,
                Err(err) if self.stop_on_first_error => return Err(err),
                Err(err) => {
                    warn!(node = %request.node, error = %err, "downlink dropped");
                    self.stats.downlinks_dropped += 1;
                    return Ok(None);
                }
            },
            DeviceClass::C => {
                let time = self.scheduler.schedule_class_c(
                    request.node,
                    self.now,
                    request.frame,
                    request.gateway,
                );
                self.queue.schedule_new(
                    time,
                    EventKind::RxWindow,
                    request.node,
                    EventPayload::RxWindow(RxWindow::ClassC),
                );
                time
            }
        };

        self.stats.downlinks_scheduled += 1;
        let labels = self
            .node_labels(request.node, None)
            .into_iter()
            .chain(std::iter::once(("frame", kind.as_str().to_string())))
            .collect::<Vec<_>>();
        metrics::counter!(metric_defs::DOWNLINK_SCHEDULED.name, &labels).increment(1);
        metrics::histogram!(metric_defs::DOWNLINK_DELAY.name, "node_class" => class.as_label())
            .record((time - self.now).as_secs());
        Ok(Some(time))
    }

    fn on_rx_window(&mut self, event: &Event) -> Result<(), SimError> {
        let delivered = self.deliver_downlink(event.node_id)?;
        if delivered && event.payload == EventPayload::RxWindow(RxWindow::ClassC) {
            if let Some(next) = self.scheduler.next_time(event.node_id) {
                self.queue.schedule_new(
                    next.max(self.now),
                    EventKind::RxWindow,
                    event.node_id,
                    EventPayload::RxWindow(RxWindow::ClassC),
                );
            }
        }
        Ok(())
    }

    fn on_ping_slot(&mut self, event: &Event) -> Result<(), SimError> {
        self.deliver_downlink(event.node_id).map(|_| ())
    }

    /// Hand the node the first frame due within the window opening now.
    fn deliver_downlink(&mut self, node_id: NodeId) -> Result<bool, SimError> {
        let window_end = SimTime::from_secs(self.now.as_secs() + self.timing.rx_window_duration_s);
        let Some(downlink) = self.scheduler.pop_ready(node_id, window_end) else {
            return Ok(false);
        };
        let labels = self
            .node_labels(node_id, None)
            .into_iter()
            .chain(std::iter::once(("frame", downlink.frame.kind.as_str().to_string())))
            .collect::<Vec<_>>();
        let node = self.node_mut(node_id)?;
        let effect = node.handle_downlink(&downlink.frame);
        trace!(
            node = %node_id,
            gateway = %downlink.gateway,
            acked = effect.acked,
            "downlink delivered"
        );

        self.stats.downlinks_delivered += 1;
        self.node_stats.entry(node_id).or_default().downlinks_received += 1;
        metrics::counter!(metric_defs::DOWNLINK_DELIVERED.name, &labels).increment(1);
        Ok(true)
    }

    // ========================================================================
    // Class B
    // ========================================================================

    fn on_beacon(&mut self) -> Result<(), SimError> {
        self.drain_beacons();
        // Gateways are sorted, so the beacon comes from the lowest id.
        let Some(gateway) = self.gateways.first().map(|g| g.id) else {
            return Ok(());
        };

        let period = self.ping_timing.beacon_interval_s;
        let target = ((self.now.as_secs() + self.class_b.beacon_guard_s) / period).round();
        let airtime = self.channel.airtime(&self.beacon_params, BEACON_BYTES);
        let frame = DownlinkFrame::new(FrameKind::Beacon, self.beacon_params, BEACON_BYTES, airtime);
        let beacon = self.scheduler.schedule_beacon(
            SimTime::from_secs((target - 0.5) * period),
            frame,
            gateway,
            period,
        );
        self.last_beacon = beacon;
        self.arm_ping_slots(beacon);

        let index = ((beacon.as_secs() - self.timing.link_delay_s) / period).round();
        self.queue.schedule_new(
            SimTime::from_secs((index + 1.0) * period - self.class_b.beacon_guard_s),
            EventKind::Beacon,
            NodeId::BROADCAST,
            EventPayload::None,
        );
        debug!(beacon = %beacon, gateway = %gateway, "beacon scheduled");
        Ok(())
    }

    /// Count beacons whose transmit time has passed.
    fn drain_beacons(&mut self) {
        while let Some(beacon) = self.scheduler.pop_ready(NodeId::BROADCAST, self.now) {
            self.stats.beacons_sent += 1;
            metrics::counter!(
                metric_defs::DOWNLINK_BEACONS.name,
                &gateway_labels(beacon.gateway.0)
            )
            .increment(1);
        }
    }

    /// Schedule every Class B node's ping slots for the period starting at `beacon`.
    fn arm_ping_slots(&mut self, beacon: SimTime) {
        let class_b: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.class == DeviceClass::B)
            .map(|n| n.id)
            .collect();
        let slots: Vec<SimTime> = self.ping_timing.slots_after(beacon).collect();
        for node in class_b {
            for slot in &slots {
                self.queue
                    .schedule_new(*slot, EventKind::PingSlot, node, EventPayload::None);
            }
        }
    }

    fn node_labels(&self, node: NodeId, sf: Option<u8>) -> Vec<(&'static str, String)> {
        let mut labels = self
            .labels
            .get(&node)
            .map(|l| l.to_labels())
            .unwrap_or_else(|| vec![("node", node.to_string())]);
        if let Some(sf) = sf {
            labels.push(("sf", sf.to_string()));
        }
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lwsim_model::load_model_from_str;

    fn simulator(yaml: &str) -> Simulator {
        let model = load_model_from_str(yaml).unwrap();
        Simulator::new(&model).unwrap()
    }

    const ONE_NODE: &str = r#"
simulation:
  seed: 7
channel:
  type: link_table
  noise_floor_dbm: -120
  fixed_airtime_s: 0.1
  links:
    - { node: 1, gateway: 0, rssi_dbm: -80 }
gateways:
  - id: 0
nodes:
  - id: 1
    frequencies: [868100000]
    duty_cycle: 1.0
    adr: false
    traffic: { type: manual, at_s: [1.0] }
"#;

    #[test]
    fn test_single_uplink_is_delivered() {
        let mut sim = simulator(ONE_NODE);
        sim.enable_event_log();
        let stats = sim.run(SimTime::from_secs(10.0)).unwrap();

        assert_eq!(stats.uplinks_sent, 1);
        assert_eq!(stats.uplinks_delivered, 1);
        assert_eq!(sim.server().packets_received(), 1);
        assert_eq!(stats.nodes[&1u64].pdr, 1.0);

        let rows = sim.event_log().unwrap().rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].result, "pending");
        assert_eq!(rows[1].result, "success");
        assert_eq!(rows[1].gateway_id, Some(0));
        assert!((rows[1].snr.unwrap() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_step_reports_empty_queue() {
        let mut sim = simulator(ONE_NODE);
        while sim.step().unwrap() {}
        assert_eq!(sim.pending_events(), 0);
        assert!(!sim.step().unwrap());
    }

    #[test]
    fn test_event_in_the_past_is_an_error() {
        let mut sim = simulator(ONE_NODE);
        sim.run(SimTime::from_secs(5.0)).unwrap();
        let id = sim.next_event_id();
        sim.schedule(Event::new(
            SimTime::from_secs(1.0),
            EventKind::Mobility,
            id,
            NodeId(1),
        ));
        assert!(matches!(
            sim.step(),
            Err(SimError::TimeWentBackwards { .. })
        ));
    }

    #[test]
    fn test_stop_halts_the_run() {
        let mut sim = simulator(ONE_NODE);
        sim.stop();
        assert!(!sim.step().unwrap());
        let flag = Arc::new(AtomicBool::new(true));
        let stats = sim
            .run_with_stop_flag(SimTime::from_secs(10.0), Some(flag))
            .unwrap();
        assert_eq!(stats.total_events, 0);
    }

    #[test]
    fn test_confirmed_uplink_is_acked_in_rx1() {
        let yaml = ONE_NODE.replace("    adr: false", "    adr: false\n    confirmed: true");
        let mut sim = simulator(&yaml);
        let stats = sim.run(SimTime::from_secs(20.0)).unwrap();

        assert_eq!(stats.uplinks_sent, 1);
        assert_eq!(stats.retransmissions, 0);
        assert_eq!(stats.downlinks_scheduled, 1);
        assert_eq!(stats.downlinks_delivered, 1);
        assert_eq!(stats.nodes[&1u64].downlinks_received, 1);
        assert_eq!(stats.downlinks_undelivered, 0);
    }

    #[test]
    fn test_unacked_uplink_is_retried() {
        let yaml = ONE_NODE
            .replace("rssi_dbm: -80", "rssi_dbm: -200")
            .replace("    adr: false", "    adr: false\n    confirmed: true\n    max_retransmissions: 2");
        let mut sim = simulator(&yaml);
        let stats = sim.run(SimTime::from_secs(60.0)).unwrap();

        assert_eq!(stats.uplinks_sent, 3);
        assert_eq!(stats.retransmissions, 2);
        assert_eq!(stats.no_coverage, 3);
        assert_eq!(stats.downlinks_scheduled, 0);
    }

    #[test]
    fn test_class_c_downlink_goes_out_immediately() {
        let yaml = ONE_NODE.replace(
            "    adr: false",
            "    adr: false\n    class: C\n    confirmed: true",
        );
        let mut sim = simulator(&yaml);
        sim.run(SimTime::from_secs(1.5)).unwrap();
        // Uplink ends at 1.1, forwarded at 1.11, processed at 1.16.
        assert_eq!(sim.stats().downlinks_delivered, 1);
        assert!(sim.now() < SimTime::from_secs(2.1));
    }

    #[test]
    fn test_beacons_only_with_class_b_nodes() {
        let mut sim = simulator(ONE_NODE);
        let stats = sim.run(SimTime::from_secs(300.0)).unwrap();
        assert_eq!(stats.beacons_sent, 0);

        let yaml = ONE_NODE.replace("    adr: false", "    adr: false\n    class: B");
        let mut sim = simulator(&yaml);
        let stats = sim.run(SimTime::from_secs(300.0)).unwrap();
        // Beacons at 128 and 256.
        assert_eq!(stats.beacons_sent, 2);
        assert_eq!(sim.last_beacon(), SimTime::from_secs(256.0));
    }

    #[test]
    fn test_downlink_via_unknown_gateway_is_rejected() {
        let mut sim = simulator(ONE_NODE);
        let request = DownlinkRequest {
            node: NodeId(1),
            gateway: GatewayId(9),
            frame: DownlinkFrame::new(FrameKind::Data, LoraParams::default(), 13, 0.05),
            uplink_end: SimTime::ZERO,
        };
        assert!(matches!(
            sim.send_downlink(request),
            Err(SimError::UnknownGateway(GatewayId(9)))
        ));
        assert_eq!(sim.stats().downlinks_scheduled, 0);
    }

    #[test]
    fn test_beacon_comes_from_lowest_gateway_id() {
        let yaml = ONE_NODE
            .replace("gateways:\n  - id: 0\n", "gateways:\n  - id: 3\n  - id: 1\n")
            .replace("gateway: 0,", "gateway: 1,")
            .replace("    adr: false", "    adr: false\n    class: B");
        let mut sim = simulator(&yaml);
        let ids: Vec<u64> = sim.gateways().iter().map(|g| g.id.0).collect();
        assert_eq!(ids, vec![1, 3]);

        let stats = sim.run(SimTime::from_secs(200.0)).unwrap();
        assert_eq!(stats.beacons_sent, 1);
        assert!(sim.scheduler().gateway_busy(GatewayId(1)) > SimTime::from_secs(128.0));
        assert_eq!(sim.scheduler().gateway_busy(GatewayId(3)), SimTime::ZERO);
    }
}
