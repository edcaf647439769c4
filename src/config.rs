use crate::{
    error::HarborError,
    network::network_of,
    v4::{codec::is_contiguous_mask, message::CLIENT_PORT, message::SERVER_PORT},
};
use bytes::{BufMut, Bytes, BytesMut};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, net::Ipv4Addr, path::Path, path::PathBuf};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Log filter used when RUST_LOG is not set (e.g. 'info', 'harbor=debug')
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Lease addresses from a pool
    Server {
        /// Path to the server JSON configuration
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Forward client traffic to a remote server
    Relay {
        /// Path to the relay JSON configuration
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Validate a configuration file and print it with defaults filled in
    ShowConfig {
        #[arg(short, long, value_enum)]
        role: Role,
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    Server,
    Relay,
}

/// A permanent client-to-address reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticEntry {
    /// Hardware address, e.g. "0a:1b:2c:3d:4e:5f".
    pub hw_address: String,
    pub address: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to serve on. Defaults to the one whose address lies in the pool network.
    pub interface: Option<String>,
    pub pool_network: Ipv4Addr,
    pub pool_mask: Ipv4Addr,
    pub first_address: Ipv4Addr,
    pub last_address: Ipv4Addr,
    /// Default gateway advertised to clients.
    pub gateway: Option<Ipv4Addr>,
    pub lease_seconds: u32,
    pub renew_seconds: u32,
    pub rebind_seconds: u32,
    pub static_entries: Vec<StaticEntry>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            interface: None,
            pool_network: Ipv4Addr::new(10, 0, 0, 0),
            pool_mask: Ipv4Addr::new(255, 255, 255, 0),
            first_address: Ipv4Addr::new(10, 0, 0, 2),
            last_address: Ipv4Addr::new(10, 0, 0, 254),
            gateway: None,
            lease_seconds: 30,
            renew_seconds: 15,
            rebind_seconds: 25,
            static_entries: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, HarborError> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), HarborError> {
        if self.first_address >= self.last_address {
            return Err(HarborError::Config(format!(
                "first_address {} must be lower than last_address {}",
                self.first_address, self.last_address
            )));
        }
        if !is_contiguous_mask(self.pool_mask) {
            return Err(HarborError::Config(format!(
                "pool_mask {} is not a valid netmask",
                self.pool_mask
            )));
        }

        let network = network_of(self.pool_network, self.pool_mask);
        for bound in [self.first_address, self.last_address] {
            if network_of(bound, self.pool_mask) != network {
                return Err(HarborError::Config(format!(
                    "{bound} is outside the pool network {network}/{}",
                    self.pool_mask
                )));
            }
        }

        if self.lease_seconds == 0 {
            return Err(HarborError::Config(
                "lease_seconds must be greater than 0".to_string(),
            ));
        }
        if self.renew_seconds > self.rebind_seconds || self.rebind_seconds > self.lease_seconds {
            return Err(HarborError::Config(format!(
                "timers must satisfy renew ({}) <= rebind ({}) <= lease ({})",
                self.renew_seconds, self.rebind_seconds, self.lease_seconds
            )));
        }

        for entry in &self.static_entries {
            parse_hw_address(&entry.hw_address)?;
        }
        Ok(())
    }
}

/// One client-facing subnet served by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySubnet {
    pub interface: String,
    /// The relay's own address on that subnet, stamped into `giaddr`.
    pub gateway: Ipv4Addr,
    pub mask: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Interface facing the DHCP server.
    pub upstream_interface: String,
    pub server_address: Ipv4Addr,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default = "default_client_port")]
    pub client_port: u16,
    pub subnets: Vec<RelaySubnet>,
}

fn default_server_port() -> u16 {
    SERVER_PORT
}

fn default_client_port() -> u16 {
    CLIENT_PORT
}

impl RelayConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, HarborError> {
        let content = std::fs::read_to_string(path)?;
        let config: RelayConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), HarborError> {
        if self.subnets.is_empty() {
            return Err(HarborError::Config(
                "relay needs at least one client subnet".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for subnet in &self.subnets {
            if !is_contiguous_mask(subnet.mask) {
                return Err(HarborError::Config(format!(
                    "mask {} of subnet on {} is not a valid netmask",
                    subnet.mask, subnet.interface
                )));
            }
            if subnet.interface == self.upstream_interface {
                return Err(HarborError::Config(format!(
                    "{} cannot face both clients and the server",
                    subnet.interface
                )));
            }
            let network = network_of(subnet.gateway, subnet.mask);
            if !seen.insert((network, subnet.mask)) {
                return Err(HarborError::Config(format!(
                    "subnet {network}/{} is configured twice",
                    subnet.mask
                )));
            }
        }
        Ok(())
    }
}

/// Parses a hardware address string (e.g., "0a:1b:2c:3d:4e:5f") into a `Bytes` object.
pub fn parse_hw_address(hw_str: &str) -> Result<Bytes, HarborError> {
    let mut bytes = BytesMut::new();
    for byte_str in hw_str.trim().split(':') {
        let byte = u8::from_str_radix(byte_str, 16)
            .map_err(|e| HarborError::HwAddressParse(format!("{hw_str}: {e}")))?;
        bytes.put_u8(byte);
    }
    if bytes.len() > crate::v4::message::CHADDR_LEN {
        return Err(HarborError::HwAddressParse(format!(
            "{hw_str}: longer than 16 bytes"
        )));
    }
    Ok(bytes.freeze())
}
