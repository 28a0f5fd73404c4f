//! Register transports.
//!
//! [`RegisterTransport`] is the only thing the poller needs from a Modbus
//! backend: open a session to a device, read a run of 16-bit registers, and
//! release the session. [`TcpTransport`] implements it over `tokio-modbus`.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio_modbus::client::{Context, Reader};
use tokio_modbus::prelude::*;
use tracing::debug;

use crate::config::{Endpoint, PollingConfig, RegisterType};
use crate::poller::PollerError;

/// Minimal capability set of a register-reading backend.
#[async_trait]
pub trait RegisterTransport: Send {
    /// Open a session with the device, replacing any previous one.
    async fn connect(&mut self, endpoint: &Endpoint) -> Result<(), PollerError>;

    /// Read `count` words starting at the zero-based `address`.
    async fn read_registers(
        &mut self,
        register_type: RegisterType,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, PollerError>;

    /// Release the session. Safe to call when nothing is open.
    async fn close(&mut self);
}

/// Socket and timeout settings of [`TcpTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub keepalive: bool,
}

impl From<&PollingConfig> for TransportSettings {
    fn from(config: &PollingConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            keepalive: config.keepalive,
        }
    }
}

/// Modbus TCP transport.
///
/// A read that times out or fails at the transport level drops the session,
/// since a late response would desynchronize the stream; the next read
/// reconnects to the same endpoint.
pub struct TcpTransport {
    settings: TransportSettings,
    endpoint: Option<Endpoint>,
    ctx: Option<Context>,
}

impl TcpTransport {
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            settings,
            endpoint: None,
            ctx: None,
        }
    }

    async fn open(&mut self, endpoint: &Endpoint) -> Result<(), PollerError> {
        let timeout = self.settings.connect_timeout;
        let connecting = open_stream(endpoint, self.settings.keepalive);
        let stream = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| PollerError::Timeout {
                operation: "connect",
                after: timeout,
            })??;

        self.ctx = Some(tcp::attach_slave(stream, Slave(endpoint.unit_id)));
        debug!(endpoint = %endpoint, "Modbus session opened");
        Ok(())
    }

    async fn context(&mut self) -> Result<&mut Context, PollerError> {
        if self.ctx.is_none() {
            let endpoint = self
                .endpoint
                .clone()
                .ok_or_else(|| PollerError::Connection("Not connected".to_string()))?;
            self.open(&endpoint).await?;
        }

        self.ctx
            .as_mut()
            .ok_or_else(|| PollerError::Connection("Not connected".to_string()))
    }
}

#[async_trait]
impl RegisterTransport for TcpTransport {
    async fn connect(&mut self, endpoint: &Endpoint) -> Result<(), PollerError> {
        self.ctx = None;
        self.endpoint = Some(endpoint.clone());
        self.open(endpoint).await
    }

    async fn read_registers(
        &mut self,
        register_type: RegisterType,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, PollerError> {
        let timeout = self.settings.read_timeout;
        let ctx = self.context().await?;

        let request = async {
            match register_type {
                RegisterType::Holding => ctx.read_holding_registers(address, count).await,
                RegisterType::Input => ctx.read_input_registers(address, count).await,
            }
        };

        let outcome = tokio::time::timeout(timeout, request).await;
        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.ctx = None;
                return Err(PollerError::Read(e.to_string()));
            }
            Err(_) => {
                self.ctx = None;
                return Err(PollerError::Timeout {
                    operation: "read",
                    after: timeout,
                });
            }
        };

        // A Modbus exception leaves the session usable.
        response.map_err(|e| PollerError::Read(format!("Exception: {:?}", e)))
    }

    async fn close(&mut self) {
        self.endpoint = None;
        if self.ctx.take().is_some() {
            debug!("Modbus session closed");
        }
    }
}

/// Resolve the endpoint and connect to the first address that accepts.
async fn open_stream(endpoint: &Endpoint, keepalive: bool) -> Result<TcpStream, PollerError> {
    let target = format!("{}:{}", endpoint.host, endpoint.port);
    let addrs = lookup_host(target.as_str())
        .await
        .map_err(|e| PollerError::Connection(format!("Cannot resolve {}: {}", target, e)))?;

    let mut last_error = None;
    for addr in addrs {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| PollerError::Connection(e.to_string()))?;

        socket
            .set_keepalive(keepalive)
            .map_err(|e| PollerError::Connection(e.to_string()))?;

        match socket.connect(addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(PollerError::Connection(match last_error {
        Some(e) => format!("{}: {}", target, e),
        None => format!("{}: no address resolved", target),
    }))
}
