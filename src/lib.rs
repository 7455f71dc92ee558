//! # leasewire
//!
//! A DHCP-style address leasing client and server over a fixed 576-byte
//! message format.
//!
//! ## Features
//!
//! - DISCOVER, OFFER, REQUEST, ACK, NAK and RELEASE exchanges
//! - Transaction-id correlation with bounded waits and retries on the client
//! - A fixed address pool with owner tracking and time-based expiry
//! - A periodic expiry sweep running beside the single-threaded accept loop
//! - Async/await with Tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use leasewire::{Config, DhcpServer};
//!
//! #[tokio::main]
//! async fn main() -> leasewire::Result<()> {
//!     let config = Config::load_or_create("config.json")?;
//!     let server = DhcpServer::new(config)?;
//!     let _sweeper = server.spawn_sweeper();
//!     server.operate().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Config`] / [`ClientConfig`] - Server and client settings
//! - [`OptionsList`] - TLV options region codec
//! - [`Message`] - The 576-byte message envelope and its codec
//! - [`LeasePool`] / [`Leases`] - Address pool and its shared, locked handle
//! - [`Transport`] - Datagram send/receive, implemented by [`UdpTransport`]
//! - [`DhcpClient`] - Acquire, renew and release
//! - [`DhcpServer`] - Accept loop and expiry sweeper

pub mod client;
pub mod config;
pub mod error;
pub mod lease;
pub mod message;
pub mod options;
pub mod server;
pub mod transport;

pub use client::{ClientLease, ClientState, DhcpClient};
pub use config::{ClientConfig, Config};
pub use error::{Error, Result};
pub use lease::{LeasePool, LeaseRecord, Leases, MAX_POOL_SIZE};
pub use message::{HardwareAddress, MESSAGE_SIZE, Message, MessageBuilder, OpCode};
pub use options::{DhcpOption, MessageType, OptionCode, OptionsList};
pub use server::DhcpServer;
pub use transport::{Transport, UdpTransport};
