//! Polling scheduler.
//!
//! Drives the site loop: every poll interval all devices are polled in
//! order, their readings assembled into one payload and the payload either
//! published live or handed to the delivery queue. Connectivity changes
//! reported by the gateway trigger a drain of queued payloads, and old rows
//! are purged on the retention cadence.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sitelink_common::{Clock, SitePayload};
use sitelink_delivery::{
    ConnectionState, DeliveryQueue, DrainReport, PublishGateway, PublishStats, StorageError,
};

use crate::assembler::PayloadAssembler;
use crate::config::{DeviceConfig, SiteConfig};
use crate::poller::DevicePoller;

/// Timing of the scheduler loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub drain_batch: u32,
    pub retention: Duration,
    pub cleanup_interval: Duration,
}

impl From<&SiteConfig> for SchedulerSettings {
    fn from(config: &SiteConfig) -> Self {
        let store = &config.store;
        Self {
            poll_interval: config.poll_interval(),
            drain_batch: store.drain_batch,
            retention: store.retention(),
            cleanup_interval: store.cleanup_interval(),
        }
    }
}

/// What happened to the payload of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Delivered live.
    Published,
    /// Persisted for later delivery.
    Queued,
    /// No device produced a value; nothing was sent or stored.
    NoData,
    /// Neither delivered nor persisted.
    Lost,
}

/// Sequential site polling loop.
pub struct PollingScheduler {
    devices: Vec<DeviceConfig>,
    poller: DevicePoller,
    assembler: PayloadAssembler,
    gateway: Arc<dyn PublishGateway>,
    queue: Arc<DeliveryQueue>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    stats: PublishStats,
    last_cleanup: Option<DateTime<Utc>>,
}

impl PollingScheduler {
    pub fn new(
        config: &SiteConfig,
        poller: DevicePoller,
        gateway: Arc<dyn PublishGateway>,
        queue: Arc<DeliveryQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            devices: config.devices.clone(),
            poller,
            assembler: PayloadAssembler::from_config(config),
            gateway,
            queue,
            clock,
            settings: SchedulerSettings::from(config),
            stats: PublishStats::default(),
            last_cleanup: None,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Live publish statistics since start.
    pub fn stats(&self) -> PublishStats {
        self.stats
    }

    /// Run one polling cycle.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let timestamp = self.clock.now();
        let mut readings = Vec::with_capacity(self.devices.len());

        for device in &self.devices {
            let reading = self.poller.poll(device).await;
            if !reading.has_data() {
                warn!(device = %device.name, "Device returned no data this cycle");
            }
            readings.push(reading);
        }

        let payload = self.assembler.assemble(timestamp, &readings);
        if !payload.is_valid() {
            warn!("No device produced data, skipping cycle");
            return CycleOutcome::NoData;
        }

        debug!(
            components = payload.components.len(),
            metrics = payload.metric_count(),
            "Payload assembled"
        );

        self.deliver(payload).await
    }

    async fn deliver(&mut self, payload: SitePayload) -> CycleOutcome {
        if self.gateway.is_connected() {
            let result = self.gateway.publish(&payload).await;
            self.stats.record(&result);

            match result {
                Ok(()) => {
                    debug!(timestamp = %payload.timestamp, "Payload published");
                    self.drain_if_pending().await;
                    return CycleOutcome::Published;
                }
                Err(e) => warn!(error = %e, "Live publish failed, queueing payload"),
            }
        } else {
            debug!("Broker offline, queueing payload");
        }

        match self.queue.enqueue(&payload).await {
            Ok(Some(id)) => {
                debug!(id, "Payload queued for later delivery");
                CycleOutcome::Queued
            }
            Ok(None) => CycleOutcome::Lost,
            Err(e) => {
                error!(error = %e, timestamp = %payload.timestamp, "Failed to queue payload, data lost");
                CycleOutcome::Lost
            }
        }
    }

    async fn drain_if_pending(&mut self) {
        match self.queue.stats().await {
            Ok(stats) if stats.pending > 0 => {
                self.drain().await;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to read queue stats"),
        }
    }

    /// Deliver a batch of queued payloads.
    pub async fn drain(&mut self) -> Option<DrainReport> {
        match self
            .queue
            .drain(self.gateway.as_ref(), self.settings.drain_batch)
            .await
        {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "Queue drain failed");
                None
            }
        }
    }

    /// Purge expired rows if a cleanup interval has elapsed since the last one.
    pub async fn maybe_cleanup(&mut self) -> Result<Option<u64>, StorageError> {
        let now = self.clock.now();
        let due = match self.last_cleanup {
            None => true,
            Some(last) => now
                .signed_duration_since(last)
                .to_std()
                .map(|elapsed| elapsed >= self.settings.cleanup_interval)
                .unwrap_or(false),
        };

        if !due {
            return Ok(None);
        }

        self.last_cleanup = Some(now);
        let removed = self.queue.cleanup(self.settings.retention).await?;
        if removed > 0 {
            info!(removed, "Expired queued payloads removed");
        }
        Ok(Some(removed))
    }

    async fn cleanup_logged(&mut self) {
        if let Err(e) = self.maybe_cleanup().await {
            warn!(error = %e, "Queue cleanup failed");
        }
    }

    /// Run cycles until `shutdown` is cancelled.
    ///
    /// Cycles start on a fixed cadence measured from the previous cycle's
    /// start. A cycle that overruns the interval is followed by a full
    /// interval wait from its completion. Each transition of the gateway to
    /// connected drains the queue.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!(
            devices = self.devices.len(),
            interval = ?self.settings.poll_interval,
            "Polling scheduler started"
        );

        let mut state_rx = Some(self.gateway.watch_state());

        self.cleanup_logged().await;
        if self.gateway.is_connected() {
            self.drain().await;
        }

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let started = self.clock.now();
            let outcome = self.run_cycle().await;
            debug!(?outcome, "Cycle finished");

            self.cleanup_logged().await;

            let deadline = next_deadline(started, self.clock.now(), self.settings.poll_interval);
            if !self.wait_for_tick(deadline, &shutdown, &mut state_rx).await {
                break;
            }
        }

        self.poller.close().await;
        info!(
            published = self.stats.success,
            failed = self.stats.failed,
            "Polling scheduler stopped"
        );
    }

    /// Run a single cycle, draining first when the broker is reachable.
    pub async fn run_once(&mut self) -> CycleOutcome {
        if self.gateway.is_connected() {
            self.drain().await;
        }
        let outcome = self.run_cycle().await;
        self.poller.close().await;
        outcome
    }

    /// Wait for `deadline`, draining on reconnects meanwhile.
    ///
    /// Returns false when shutdown was requested.
    async fn wait_for_tick(
        &mut self,
        deadline: DateTime<Utc>,
        shutdown: &CancellationToken,
        state_rx: &mut Option<watch::Receiver<ConnectionState>>,
    ) -> bool {
        loop {
            let remaining = deadline
                .signed_duration_since(self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                return !shutdown.is_cancelled();
            }

            let connected = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return false,
                connected = reconnected(state_rx) => connected,
                _ = self.clock.sleep(remaining) => return !shutdown.is_cancelled(),
            };

            if connected {
                info!("Broker reconnected, draining queue");
                self.drain().await;
            }
        }
    }
}

/// Next cycle start.
fn next_deadline(
    started: DateTime<Utc>,
    finished: DateTime<Utc>,
    interval: Duration,
) -> DateTime<Utc> {
    let interval = chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::MAX);
    let scheduled = started.checked_add_signed(interval).unwrap_or(finished);
    if scheduled > finished {
        scheduled
    } else {
        finished.checked_add_signed(interval).unwrap_or(finished)
    }
}

/// Resolve on the next connectivity change; true when it is a connect.
///
/// A closed channel disables further notifications and leaves this pending.
async fn reconnected(state_rx: &mut Option<watch::Receiver<ConnectionState>>) -> bool {
    let Some(rx) = state_rx.as_mut() else {
        return std::future::pending().await;
    };

    match rx.changed().await {
        Ok(()) => rx.borrow_and_update().is_connected(),
        Err(_) => {
            *state_rx = None;
            std::future::pending().await
        }
    }
}
