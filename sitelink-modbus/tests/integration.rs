//! Integration tests for the Modbus agent pipeline.
//!
//! Devices are simulated by an in-memory register map per host; the broker
//! by a gateway double. The delivery queue is a real SQLite file.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::watch;

use sitelink_common::{Clock, ManualClock, RetryPolicy, SitePayload, format_timestamp};
use sitelink_delivery::{AgentConfig, ConnectionState, DeliveryError, DeliveryQueue, PublishGateway};
use sitelink_modbus::config::{Endpoint, RegisterType, SiteConfig};
use sitelink_modbus::decoder::{ByteOrder, encode_float};
use sitelink_modbus::{CycleOutcome, DevicePoller, PollerError, PollingScheduler, RegisterTransport};

const EXAMPLE_CONFIG: &str = include_str!("../sitelink.example.json5");

/// Register maps of every simulated device, keyed by host.
#[derive(Clone, Default)]
struct SimulatedBus {
    devices: Arc<Mutex<HashMap<String, HashMap<u16, u16>>>>,
    current: Option<String>,
}

impl SimulatedBus {
    fn set(&self, host: &str, address: u16, words: &[u16]) {
        let mut devices = self.devices.lock().unwrap();
        let registers = devices.entry(host.to_string()).or_default();
        for (offset, word) in words.iter().enumerate() {
            registers.insert(address + offset as u16, *word);
        }
    }

    fn set_float(&self, host: &str, address: u16, value: f32, byte_order: ByteOrder) {
        self.set(host, address, &encode_float(value, byte_order));
    }
}

#[async_trait]
impl RegisterTransport for SimulatedBus {
    async fn connect(&mut self, endpoint: &Endpoint) -> Result<(), PollerError> {
        if !self.devices.lock().unwrap().contains_key(&endpoint.host) {
            return Err(PollerError::Connection(format!("{} unreachable", endpoint)));
        }
        self.current = Some(endpoint.host.clone());
        Ok(())
    }

    async fn read_registers(
        &mut self,
        _register_type: RegisterType,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, PollerError> {
        let host = self
            .current
            .clone()
            .ok_or_else(|| PollerError::Connection("not connected".to_string()))?;
        let devices = self.devices.lock().unwrap();
        let registers = &devices[&host];

        (address..address + count)
            .map(|a| {
                registers
                    .get(&a)
                    .copied()
                    .ok_or_else(|| PollerError::Read("Exception: IllegalDataAddress".to_string()))
            })
            .collect()
    }

    async fn close(&mut self) {
        self.current = None;
    }
}

/// Broker double recording delivered payloads.
struct RecordingGateway {
    state_tx: watch::Sender<ConnectionState>,
    published: Mutex<Vec<SitePayload>>,
}

impl RecordingGateway {
    fn new(state: ConnectionState) -> Arc<Self> {
        let (state_tx, _) = watch::channel(state);
        Arc::new(Self {
            state_tx,
            published: Mutex::new(Vec::new()),
        })
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn published(&self) -> Vec<SitePayload> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl PublishGateway for RecordingGateway {
    async fn publish(&self, payload: &SitePayload) -> Result<(), DeliveryError> {
        if !self.is_connected() {
            return Err(DeliveryError::NotConnected);
        }
        self.published.lock().unwrap().push(payload.clone());
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    async fn close(&self) {}
}

/// Populate the registers of the example site.
fn example_bus() -> SimulatedBus {
    let bus = SimulatedBus::default();

    bus.set_float("192.168.10.21", 0, 76.25, ByteOrder::BigEndian);
    bus.set_float("192.168.10.21", 2, 231.5, ByteOrder::BigEndian);
    bus.set("192.168.10.21", 4, &[1234]);

    bus.set("192.168.10.22", 100, &[0xFFF6]);
    bus.set_float("192.168.10.22", 102, 97.5, ByteOrder::WordSwapped);

    bus.set_float("192.168.10.30", 3000, 12.75, ByteOrder::LittleEndian);
    bus.set_float("192.168.10.30", 3012, 0.5, ByteOrder::BigEndian);

    bus
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 7, 1, 6, 0, 0).unwrap(),
    ))
}

fn build_scheduler(
    config: &SiteConfig,
    bus: SimulatedBus,
    gateway: Arc<RecordingGateway>,
    queue: Arc<DeliveryQueue>,
    clock: Arc<ManualClock>,
) -> PollingScheduler {
    let poller = DevicePoller::from_config(Box::new(bus), &config.polling, clock.clone());
    PollingScheduler::new(config, poller, gateway, queue, clock)
}

fn example_config(dir: &tempfile::TempDir) -> SiteConfig {
    let mut config = SiteConfig::parse(EXAMPLE_CONFIG).expect("example config must parse");
    config.store.path = Some(dir.path().join("queue.db"));
    config
}

#[tokio::test]
async fn test_example_site_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let config = example_config(&dir);
    let clock = clock();
    let gateway = RecordingGateway::new(ConnectionState::Connected);
    let queue = Arc::new(DeliveryQueue::open(&config.store, clock.clone()).await.unwrap());

    let mut scheduler =
        build_scheduler(&config, example_bus(), gateway.clone(), queue.clone(), clock);

    assert_eq!(scheduler.run_cycle().await, CycleOutcome::Published);

    let published = gateway.published();
    assert_eq!(published.len(), 1);

    let payload = &published[0];
    assert_eq!(payload.site_id, 12);
    assert_eq!(payload.timestamp, "2024-07-01T06:00:00.000Z");

    let bess = &payload.components["bess"];
    assert_eq!(bess.name, "Battery Energy Storage");
    assert_eq!(bess.metrics["soc"], 76.25);
    assert_eq!(bess.metrics["voltage_phase_r"], 231.5);
    assert_eq!(bess.metrics["active_power"], 123.4);
    assert_eq!(bess.metrics["cell_temp_max"], -1.0);
    assert_eq!(bess.metrics["soh"], 97.5);

    let grid = &payload.components["grid"];
    assert_eq!(grid.metrics["current_phase_r"], 12.75);
    assert_eq!(grid.metrics["power_factor"], 0.5);

    queue.close().await;
}

#[tokio::test]
async fn test_failing_register_is_absent_after_retries() {
    let dir = tempfile::tempdir().unwrap();
    let config = example_config(&dir);
    let clock = clock();
    let gateway = RecordingGateway::new(ConnectionState::Connected);
    let queue = Arc::new(DeliveryQueue::open(&config.store, clock.clone()).await.unwrap());

    let bus = example_bus();
    bus.devices
        .lock()
        .unwrap()
        .get_mut("192.168.10.30")
        .unwrap()
        .remove(&3012);

    let mut scheduler =
        build_scheduler(&config, bus, gateway.clone(), queue.clone(), clock.clone());
    assert_eq!(scheduler.run_cycle().await, CycleOutcome::Published);

    let published = gateway.published();
    let grid = &published[0].components["grid"];
    assert_eq!(grid.metrics["current_phase_r"], 12.75);
    assert!(!grid.metrics.contains_key("power_factor"));

    // Three attempts with 500 ms base backoff between them.
    let sleeps = clock.sleeps();
    assert!(sleeps.contains(&Duration::from_millis(500)));
    assert!(sleeps.contains(&Duration::from_millis(1000)));

    queue.close().await;
}

#[tokio::test]
async fn test_unreachable_device_omits_its_component() {
    let dir = tempfile::tempdir().unwrap();
    let config = example_config(&dir);
    let clock = clock();
    let gateway = RecordingGateway::new(ConnectionState::Connected);
    let queue = Arc::new(DeliveryQueue::open(&config.store, clock.clone()).await.unwrap());

    let bus = example_bus();
    bus.devices.lock().unwrap().remove("192.168.10.30");

    let mut scheduler = build_scheduler(&config, bus, gateway.clone(), queue.clone(), clock);
    assert_eq!(scheduler.run_cycle().await, CycleOutcome::Published);

    let published = gateway.published();
    let payload = &published[0];
    assert!(payload.components.contains_key("bess"));
    assert!(!payload.components.contains_key("grid"));

    queue.close().await;
}

#[tokio::test]
async fn test_offline_payloads_survive_restart_and_drain_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = example_config(&dir);
    let clock = clock();
    let gateway = RecordingGateway::new(ConnectionState::Disconnected);
    let second_stamp;

    {
        let queue = Arc::new(DeliveryQueue::open(&config.store, clock.clone()).await.unwrap());
        let mut scheduler = build_scheduler(
            &config,
            example_bus(),
            gateway.clone(),
            queue.clone(),
            clock.clone(),
        );

        assert_eq!(scheduler.run_cycle().await, CycleOutcome::Queued);
        clock.advance(Duration::from_secs(10));
        // Inter-read delays of the first cycle also moved the clock.
        second_stamp = format_timestamp(clock.now());
        assert_eq!(scheduler.run_cycle().await, CycleOutcome::Queued);

        assert!(gateway.published().is_empty());
        queue.close().await;
    }

    // Restarted agent finds the backlog on disk.
    let queue = Arc::new(DeliveryQueue::open(&config.store, clock.clone()).await.unwrap());
    assert_eq!(queue.stats().await.unwrap().pending, 2);

    gateway.set_state(ConnectionState::Connected);
    let mut scheduler = build_scheduler(
        &config,
        example_bus(),
        gateway.clone(),
        queue.clone(),
        clock.clone(),
    );

    let report = scheduler.drain().await.unwrap();
    assert_eq!(report.published, 2);

    let published = gateway.published();
    assert_eq!(published[0].timestamp, "2024-07-01T06:00:00.000Z");
    assert!(second_stamp.starts_with("2024-07-01T06:00:10."));
    assert_eq!(published[1].timestamp, second_stamp);
    assert_eq!(queue.stats().await.unwrap().total(), 0);

    queue.close().await;
}

#[tokio::test]
async fn test_later_device_wins_shared_metric() {
    let config = SiteConfig::parse(
        r#"{
            site_id: 3,
            components: { bess: { name: "Battery" } },
            devices: [
                {
                    name: "pcs", host: "10.0.0.1", component: "bess", byte_order: "big_endian",
                    registers: [{ address: 1, description: "temperature", data_type: "int16" }],
                },
                {
                    name: "bms", host: "10.0.0.2", component: "bess", byte_order: "big_endian",
                    registers: [{ address: 1, description: "temperature", data_type: "int16" }],
                },
            ],
        }"#,
    )
    .unwrap();

    let bus = SimulatedBus::default();
    bus.set("10.0.0.1", 0, &[31]);
    bus.set("10.0.0.2", 0, &[29]);

    let clock = clock();
    let gateway = RecordingGateway::new(ConnectionState::Connected);
    let queue = Arc::new(
        DeliveryQueue::open_in_memory(RetryPolicy::new(3, Duration::from_millis(10)), clock.clone())
            .await
            .unwrap(),
    );

    let mut scheduler = build_scheduler(&config, bus, gateway.clone(), queue, clock);
    assert_eq!(scheduler.run_cycle().await, CycleOutcome::Published);

    let published = gateway.published();
    let metrics = &published[0].components["bess"].metrics;
    assert_eq!(metrics["temperature"], 29.0);
}
