//! Loading the bundled scenario files and building simulators from them.

use std::path::{Path, PathBuf};

use lwsim_common::{DeviceClass, NodeId};
use lwsim_model::{load_model, load_models, ChannelSection, TrafficDef};
use lwsim_runner::{run_model, Simulator};

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/models")
        .join(name)
}

#[test]
fn test_city_fixture_loads() {
    let model = load_model(&fixture("city.yaml")).expect("city.yaml should load");

    assert_eq!(model.simulation.seed, 42);
    assert_eq!(model.simulation.duration_s, 1800.0);
    assert_eq!(model.quantizer.tick_ns(), Some(1000));
    assert_eq!(model.gateways.len(), 2);
    assert_eq!(model.nodes.len(), 12);
    assert!(matches!(model.channel, ChannelSection::LogDistance(_)));

    let count = |class| model.nodes.iter().filter(|n| n.class == class).count();
    assert_eq!(count(DeviceClass::A), 8);
    assert_eq!(count(DeviceClass::B), 2);
    assert_eq!(count(DeviceClass::C), 2);
}

#[test]
fn test_override_replaces_node_and_simulation() {
    let base = fixture("city.yaml");
    let overlay = fixture("override.yaml");
    let model = load_models(&[base.as_path(), overlay.as_path()])
        .expect("merged models should load");

    assert_eq!(model.simulation.seed, 7);
    assert_eq!(model.simulation.duration_s, 600.0);
    assert_eq!(model.nodes.len(), 12);
    assert_eq!(model.gateways.len(), 2);

    let node = model
        .nodes
        .iter()
        .find(|n| n.id == 1)
        .expect("node 1 survives the merge");
    assert_eq!(node.class, DeviceClass::C);
    assert_eq!(node.sf, 7);
    assert_eq!(node.position.x, 100.0);
    assert!(matches!(
        node.traffic,
        TrafficDef::Periodic { interval_s, .. } if interval_s == 60.0
    ));

    // Untouched sections keep the base file's values.
    assert_eq!(model.timing.link_delay_s, 0.002);
    assert_eq!(model.adr.strategy, "lorawan-avg");
}

#[test]
fn test_simulator_registers_every_device() {
    let model = load_model(&fixture("city.yaml")).unwrap();
    let sim = Simulator::new(&model).unwrap();

    assert_eq!(sim.gateways().len(), 2);
    assert_eq!(sim.server().strategy_name(), "lorawan-avg");
    for def in &model.nodes {
        let node = sim.node(NodeId(def.id)).expect("node registered");
        assert_eq!(node.class, def.class);
    }
    assert!(sim.pending_events() >= model.nodes.len());
}

#[test]
fn test_run_model_uses_configured_duration() {
    let mut model = load_model(&fixture("city.yaml")).unwrap();
    model.simulation.duration_s = 600.0;

    let stats = run_model(&model, None).unwrap();
    assert_eq!(stats.simulation_time_s, 600.0);
    assert!(stats.uplinks_sent > 0);
    assert!(stats.uplinks_delivered > 0, "devices are within gateway range");
    assert!(stats.beacons_sent >= 4, "two class B nodes need beacons");
    assert_eq!(stats.nodes.len(), 12);
}

#[test]
fn test_unknown_adr_strategy_is_rejected() {
    let mut model = load_model(&fixture("city.yaml")).unwrap();
    model.adr.strategy = "does-not-exist".to_string();
    assert!(Simulator::new(&model).is_err());
}
