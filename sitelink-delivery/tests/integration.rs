//! Integration tests for sitelink-delivery.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use tokio::sync::watch;

use sitelink_common::{ComponentPayload, ManualClock};
use sitelink_delivery::{
    AgentConfig, AgentError, BrokerConfig, ConnectionState, DeliveryError, DeliveryQueue,
    LoggingConfig, PublishGateway, SitePayload, StoreConfig,
};

#[derive(Debug, Deserialize)]
struct MeterAgentConfig {
    site_id: u32,
    #[serde(default)]
    broker: BrokerConfig,
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    logging: LoggingConfig,
    meters: Vec<String>,
}

impl AgentConfig for MeterAgentConfig {
    fn broker(&self) -> &BrokerConfig {
        &self.broker
    }

    fn store(&self) -> &StoreConfig {
        &self.store
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn site_id(&self) -> u32 {
        self.site_id
    }

    fn validate(&self) -> sitelink_delivery::Result<()> {
        if self.meters.is_empty() {
            return Err(AgentError::validation("at least one meter required"));
        }
        Ok(())
    }
}

/// Gateway whose connectivity and publish outcome are switched by the test.
struct SwitchGateway {
    state_tx: watch::Sender<ConnectionState>,
    failing: AtomicBool,
    delivered: AtomicUsize,
}

impl SwitchGateway {
    fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        Self {
            state_tx,
            failing: AtomicBool::new(false),
            delivered: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PublishGateway for SwitchGateway {
    async fn publish(&self, _payload: &SitePayload) -> Result<(), DeliveryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeliveryError::Rejected("quota exceeded".to_string()));
        }
        self.delivered.fetch_add(1, Ordering::SeqCst);
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

fn payload(minute: u32) -> SitePayload {
    let mut components = BTreeMap::new();
    components.insert(
        "grid".to_string(),
        ComponentPayload {
            name: "Grid Connection".to_string(),
            metrics: [("frequency".to_string(), 50.01)].into_iter().collect(),
        },
    );
    SitePayload::new(
        Utc.with_ymd_and_hms(2024, 9, 2, 14, minute, 0).unwrap(),
        21,
        components,
    )
}

#[test]
fn test_load_agent_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{
            // Minimal deployment
            site_id: 21,
            broker: {{ host: "broker.local", qos: 2 }},
            store: {{ path: "/var/lib/sitelink/queue.db", max_retries: 4 }},
            meters: ["main"],
        }}"#
    )
    .unwrap();

    let config = MeterAgentConfig::load(file.path()).unwrap();
    assert_eq!(config.site_id(), 21);
    assert_eq!(config.broker().host, "broker.local");
    assert_eq!(config.broker().qos, 2);
    assert_eq!(config.store().max_retries, 4);
    assert_eq!(config.topics().telemetry(), "sitelink/site/21/telemetry");
}

#[test]
fn test_load_rejects_missing_and_invalid() {
    let missing = MeterAgentConfig::load("/nonexistent/sitelink.json5");
    assert!(matches!(missing, Err(AgentError::ConfigNotFound { .. })));

    let no_meters = MeterAgentConfig::parse("{ site_id: 1, meters: [] }");
    assert!(matches!(no_meters, Err(AgentError::ConfigValidation(_))));

    let bad_qos = MeterAgentConfig::parse("{ site_id: 1, broker: { qos: 3 }, meters: ['m'] }");
    assert!(matches!(bad_qos, Err(AgentError::ConfigValidation(_))));

    let garbage = MeterAgentConfig::parse("{ site_id: ");
    assert!(matches!(garbage, Err(AgentError::ConfigParse(_))));
}

#[tokio::test]
async fn test_rejected_payloads_become_dead_letters_and_expire() {
    let dir = tempfile::tempdir().unwrap();
    let store = StoreConfig {
        path: Some(dir.path().join("spool").join("queue.db")),
        max_retries: 2,
        retry_base_delay_ms: 50,
        ..StoreConfig::default()
    };

    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 9, 2, 14, 0, 0).unwrap(),
    ));
    let queue = DeliveryQueue::open(&store, clock.clone()).await.unwrap();
    let gateway = SwitchGateway::new();

    for minute in 0..3 {
        queue.enqueue(&payload(minute)).await.unwrap();
    }

    // Two failing passes exhaust the retries of every row.
    gateway.failing.store(true, Ordering::SeqCst);
    queue.drain(&gateway, 10).await.unwrap();
    let report = queue.drain(&gateway, 10).await.unwrap();
    assert_eq!(report.dead_lettered, 3);

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.dead_letter, 3);

    // Dead letters are never retried, even once the broker accepts again.
    gateway.failing.store(false, Ordering::SeqCst);
    let report = queue.drain(&gateway, 10).await.unwrap();
    assert_eq!(report.attempted(), 0);
    assert_eq!(gateway.delivered.load(Ordering::SeqCst), 0);

    let dead = queue.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 3);
    assert!(dead.iter().all(|row| row.retries == 2));

    // Retention purges them regardless of retry state.
    clock.advance(Duration::from_secs(8 * 24 * 3600));
    let removed = queue.cleanup(Duration::from_secs(7 * 24 * 3600)).await.unwrap();
    assert_eq!(removed, 3);
    assert_eq!(queue.stats().await.unwrap().total(), 0);

    queue.close().await;
}
