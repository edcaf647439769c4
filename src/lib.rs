//! # Harbor - A DHCPv4 Server and Relay Agent
//!
//! Harbor leases IPv4 addresses from a configured pool and relays DHCP
//! traffic between client subnets and a remote server. Both roles are
//! synchronous state machines driven by an asynchronous daemon that owns
//! the sockets and the lease expiry timer.
//!
//! ## Features
//!
//! - DISCOVER/OFFER/REQUEST/ACK/NACK handling with lease expiry and reclaim
//! - Static reservations
//! - Multi-subnet relaying keyed by `giaddr`
//! - JSON configuration files
//!
//! ## Example
//!
//! ```rust,no_run
//! use harbor::{network, Daemon, DhcpServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let interfaces = network::local_interfaces()?;
//!     let server = DhcpServer::new(&ServerConfig::default(), &interfaces)?;
//!     let mut daemon = Daemon::new(server, &interfaces)?;
//!     daemon.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod daemon;
pub mod error;
pub mod network;
pub mod v4;

pub use config::{Args, RelayConfig, ServerConfig};
pub use daemon::{Action, Daemon, DhcpEngine, Event, PeriodicTask};
pub use error::HarborError;
pub use v4::{DhcpRelay, DhcpServer};
