//! DHCPv4 protocol implementation
//!
//! This module contains the DHCPv4-specific implementation including:
//! - Message model and wire codec
//! - Lease table and address pool
//! - Server and relay state machines

pub mod codec;
pub mod lease;
pub mod message;
pub mod relay;
pub mod server;


pub use lease::{Allocation, LeaseTable, Renewal};
pub use message::{ClientId, Message, MessageType};
pub use relay::{DhcpRelay, RelayInterfaceEntry};
pub use server::DhcpServer;
