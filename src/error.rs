use crate::{network::SocketError, v4::codec::CodecError};
use std::{io, net::Ipv4Addr};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarborError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Address {address} is not in the pool [{first}, {last}]")]
    OutOfRange {
        address: Ipv4Addr,
        first: Ipv4Addr,
        last: Ipv4Addr,
    },

    #[error("Conflicting reservation: {0}")]
    Conflict(String),

    #[error("Socket operation failed")]
    Socket(#[from] SocketError),

    #[error("I/O error")]
    Io(#[from] io::Error),

    #[error("DHCP codec error")]
    Codec(#[from] CodecError),

    #[error("Failed to read configuration file")]
    Json(#[from] serde_json::Error),

    #[error("Failed to parse hardware address: {0}")]
    HwAddressParse(String),

    #[error("Interface '{0}' not found or has no IPv4 address")]
    InterfaceInvalid(String),
}
