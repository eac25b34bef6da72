//! # dhcp-engine
//!
//! Server-side DHCPv4 engine (RFC 2131 / RFC 2132): datagram validation,
//! the DISCOVER/OFFER/REQUEST/ACK handshake, and a lease pool with timed
//! expiry, driven by an event-loop-style timer reactor.
//!
//! ## Features
//!
//! - DISCOVER, REQUEST, RELEASE, DECLINE and INFORM handling
//! - Lease pool with offer timeout, lease expiry and DECLINE quarantine
//! - Relay agent support (giaddr replies, Option 82 echo)
//! - Option overload (Option 52) decoding
//! - Shared server handle with attach/detach/start/stop lifecycle
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dhcp_engine::{Config, DhcpServer, Event, UdpTransport};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> dhcp_engine::Result<()> {
//!     let config = Config::load_or_create("config.json")?;
//!     let transport = Arc::new(UdpTransport::bind(&config)?);
//!
//!     let server = DhcpServer::new(config)?;
//!     let event = Event::new();
//!     let _attachment = server.attach_event(Some(event.clone()), 0)?;
//!     server.set_transport(transport.clone());
//!     server.start()?;
//!
//!     let mut buffer = [0u8; 1500];
//!     loop {
//!         tokio::select! {
//!             _ = event.run() => {}
//!             received = transport.recv_from(&mut buffer) => {
//!                 let (size, _) = received?;
//!                 server.receive(&buffer[..size])?;
//!             }
//!         }
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`options`] - TLV option codec
//! - [`DhcpPacket`] - datagram decoding, validation and encoding
//! - [`LeasePool`] - address allocation and lease state
//! - [`PacketHandler`] - protocol state machine
//! - [`Event`] / [`ExpiryTimers`] - timer reactor and lease timers
//! - [`DhcpServer`] - shared server handle and lifecycle

pub mod config;
pub mod error;
pub mod event;
pub mod expiry;
pub mod handler;
pub mod lease;
pub mod options;
pub mod packet;
pub mod server;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
pub use event::{Event, TimerSource};
pub use expiry::ExpiryTimers;
pub use handler::{LeaseChange, Outcome, PacketHandler, Reply};
pub use lease::{ClientId, Lease, LeasePool, LeaseSnapshot, LeaseState};
pub use options::{DhcpOption, MessageType};
pub use packet::{DhcpPacket, Rejection};
pub use server::{DhcpServer, Disposition, EventAttachment};
pub use transport::{Transport, UdpTransport};
