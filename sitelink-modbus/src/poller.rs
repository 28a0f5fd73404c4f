//! Modbus device polling.
//!
//! One [`DevicePoller`] serves every device of the site, one after the other:
//! it opens a session, reads each configured register in order and always
//! closes the session before moving on. Connect and each register read are
//! retried with exponential backoff; a register that still fails is recorded
//! as absent and the remaining registers are read anyway.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, warn};

use sitelink_common::{Clock, MetricSample, RetryPolicy, retry_with_backoff};

use crate::config::{DeviceConfig, PollingConfig, RegisterConfig};
use crate::decoder::{self, DecodeError};
use crate::transport::RegisterTransport;

/// Error type for polling operations.
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Read failed: {0}")]
    Read(String),
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("Decode failed: {0}")]
    Decode(#[from] DecodeError),
}

/// Result of polling one device for one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReading {
    /// Device name from configuration.
    pub device: String,
    /// Scaled values by register description.
    pub sample: MetricSample,
}

impl DeviceReading {
    /// False when every register of the device came back absent.
    pub fn has_data(&self) -> bool {
        self.sample.has_data()
    }
}

/// Sequential register poller.
pub struct DevicePoller {
    transport: Box<dyn RegisterTransport>,
    retry: RetryPolicy,
    inter_read_delay: Duration,
    clock: Arc<dyn Clock>,
}

impl DevicePoller {
    pub fn new(
        transport: Box<dyn RegisterTransport>,
        retry: RetryPolicy,
        inter_read_delay: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transport,
            retry,
            inter_read_delay,
            clock,
        }
    }

    /// Create a poller with the retry and pacing of the polling section.
    pub fn from_config(
        transport: Box<dyn RegisterTransport>,
        config: &PollingConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(
            transport,
            config.retry_policy(),
            config.inter_read_delay(),
            clock,
        )
    }

    /// Read every register of `device`.
    ///
    /// Never fails: connection and read errors end up as absent metrics.
    pub async fn poll(&mut self, device: &DeviceConfig) -> DeviceReading {
        let mut sample = MetricSample::new();

        match self.connect(device).await {
            Ok(()) => {
                for (index, register) in device.registers.iter().enumerate() {
                    if index > 0 && !self.inter_read_delay.is_zero() {
                        self.clock.sleep(self.inter_read_delay).await;
                    }

                    match self.read(device, register).await {
                        Ok(value) => sample.record(&register.description, value),
                        Err(e) => {
                            warn!(
                                device = %device.name,
                                register = %register.description,
                                address = register.address,
                                error = %e,
                                "Register unavailable this cycle"
                            );
                            sample.record_absent(&register.description);
                        }
                    }
                }
            }
            Err(e) => {
                warn!(device = %device.name, error = %e, "Device unreachable this cycle");
                for register in &device.registers {
                    sample.record_absent(&register.description);
                }
            }
        }

        self.transport.close().await;

        debug!(
            device = %device.name,
            present = sample.present_count(),
            absent = sample.absent_count(),
            "Device polled"
        );

        DeviceReading {
            device: device.name.clone(),
            sample,
        }
    }

    /// Release any open session.
    pub async fn close(&mut self) {
        self.transport.close().await;
    }

    async fn connect(&mut self, device: &DeviceConfig) -> Result<(), PollerError> {
        let endpoint = device.endpoint();
        let operation = format!("connect {}", device.name);

        retry_with_backoff(
            &self.retry,
            self.clock.as_ref(),
            &operation,
            self.transport.as_mut(),
            |transport| {
                let endpoint = endpoint.clone();
                async move { transport.connect(&endpoint).await }.boxed()
            },
        )
        .await
    }

    /// Read and decode one register, scaled by its multiplier.
    async fn read(
        &mut self,
        device: &DeviceConfig,
        register: &RegisterConfig,
    ) -> Result<f64, PollerError> {
        let register_type = register.register_type;
        let address = register.wire_address();
        let count = register.word_count();
        let data_type = register.data_type;
        let byte_order = register.byte_order_on(device);
        let operation = format!("read {}/{}", device.name, register.description);

        let raw = retry_with_backoff(
            &self.retry,
            self.clock.as_ref(),
            &operation,
            self.transport.as_mut(),
            move |transport| {
                async move {
                    let words = transport
                        .read_registers(register_type, address, count)
                        .await?;
                    decoder::decode(&words, data_type, byte_order).map_err(PollerError::from)
                }
                .boxed()
            },
        )
        .await?;

        Ok(decoder::scale(raw, register.multiplier))
    }
}
