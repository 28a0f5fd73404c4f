//! Modbus TCP telemetry agent.
//!
//! Polls the registers of every configured device on a fixed interval,
//! decodes and scales them, merges the values into one site payload per
//! cycle and delivers it over MQTT, falling back to the durable queue of
//! `sitelink-delivery` while the broker is unreachable.
//!
//! # Pipeline
//!
//! ```text
//! transport -> poller -> decoder -> assembler -> scheduler -> gateway | queue
//! ```

pub mod assembler;
pub mod config;
pub mod decoder;
pub mod poller;
pub mod scheduler;
pub mod transport;

pub use assembler::{ComponentMap, PayloadAssembler, assemble};
pub use config::SiteConfig;
pub use decoder::{ByteOrder, DataType, DecodeError};
pub use poller::{DevicePoller, DeviceReading, PollerError};
pub use scheduler::{CycleOutcome, PollingScheduler, SchedulerSettings};
pub use transport::{RegisterTransport, TcpTransport, TransportSettings};
