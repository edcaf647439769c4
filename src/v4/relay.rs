//! DHCPv4 relay agent
//!
//! Client broadcasts arriving on a client-facing interface are stamped with
//! that subnet's gateway address and unicast to the server. Server replies
//! are rebroadcast on the interface whose gateway address they echo.

use super::message::{Message, CLIENT_PORT, SERVER_PORT};
use crate::{
    config::RelayConfig,
    daemon::{Action, DhcpEngine, Event},
    error::HarborError,
    network::{find_by_name, network_of, InterfaceId, LocalInterface},
};
use std::{
    collections::{HashMap, VecDeque},
    net::{Ipv4Addr, SocketAddrV4},
};

/// Upper bound on remembered transaction ids.
pub const MAX_PENDING_TRANSACTIONS: usize = 1024;

/// A client subnet the relay bridges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayInterfaceEntry {
    pub interface: InterfaceId,
    pub gateway_address: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
}

impl RelayInterfaceEntry {
    fn subnet(&self) -> (Ipv4Addr, Ipv4Addr) {
        (
            network_of(self.gateway_address, self.subnet_mask),
            self.subnet_mask,
        )
    }
}

pub struct DhcpRelay {
    server: SocketAddrV4,
    client_port: u16,
    upstream: InterfaceId,
    entries: Vec<RelayInterfaceEntry>,
    // Fallback route for replies whose giaddr matches no entry.
    pending: HashMap<u32, InterfaceId>,
    pending_order: VecDeque<u32>,
}

impl DhcpRelay {
    /// A relay with no client subnets yet, forwarding to `server` through `upstream`.
    pub fn new(server: SocketAddrV4, upstream: InterfaceId) -> Self {
        Self {
            server,
            client_port: CLIENT_PORT,
            upstream,
            entries: Vec::new(),
            pending: HashMap::new(),
            pending_order: VecDeque::new(),
        }
    }

    pub fn from_config(
        config: &RelayConfig,
        interfaces: &[LocalInterface],
    ) -> Result<Self, HarborError> {
        config.validate()?;

        let upstream = find_by_name(interfaces, &config.upstream_interface)
            .ok_or_else(|| HarborError::InterfaceInvalid(config.upstream_interface.clone()))?;
        let mut relay = Self::new(
            SocketAddrV4::new(config.server_address, config.server_port),
            upstream.id,
        );
        relay.client_port = config.client_port;

        for subnet in &config.subnets {
            let iface = find_by_name(interfaces, &subnet.interface)
                .ok_or_else(|| HarborError::InterfaceInvalid(subnet.interface.clone()))?;
            relay.add_relay_interface(iface.id, subnet.gateway, subnet.mask)?;
        }
        Ok(relay)
    }

    /// Adds a client subnet. Each subnet may only be served once.
    pub fn add_relay_interface(
        &mut self,
        interface: InterfaceId,
        gateway_address: Ipv4Addr,
        subnet_mask: Ipv4Addr,
    ) -> Result<(), HarborError> {
        if interface == self.upstream {
            return Err(HarborError::Config(format!(
                "{interface} already faces the server"
            )));
        }

        let entry = RelayInterfaceEntry {
            interface,
            gateway_address,
            subnet_mask,
        };
        if self.entries.iter().any(|e| e.subnet() == entry.subnet()) {
            let (network, mask) = entry.subnet();
            return Err(HarborError::Conflict(format!(
                "subnet {network}/{mask} is already relayed"
            )));
        }

        tracing::info!("Relaying {gateway_address}/{subnet_mask} on {interface}");
        self.entries.push(entry);
        Ok(())
    }

    pub fn interfaces(&self) -> &[RelayInterfaceEntry] {
        &self.entries
    }

    pub fn server(&self) -> SocketAddrV4 {
        self.server
    }

    fn forward_to_server(&mut self, mut message: Message, interface: InterfaceId) -> Action {
        let Some(entry) = self.entries.iter().find(|e| e.interface == interface).copied() else {
            tracing::debug!(
                "Ignoring {} on non-client interface {interface}",
                message.message_type
            );
            return Action::Ignore;
        };

        self.remember(message.transaction_id, interface);
        message.gateway_addr = entry.gateway_address;
        message.subnet_mask = entry.subnet_mask;
        tracing::info!(
            "Relaying {} xid {:#010x} from {} to {}",
            message.message_type,
            message.transaction_id,
            interface,
            self.server
        );

        Action::Send {
            message,
            destination: self.server,
            interface: self.upstream,
        }
    }

    fn forward_to_client(&mut self, message: Message, interface: InterfaceId) -> Action {
        if interface != self.upstream {
            tracing::debug!("Ignoring {} from the client side", message.message_type);
            return Action::Ignore;
        }

        let xid = message.transaction_id;
        let egress = self
            .entries
            .iter()
            .find(|e| e.gateway_address == message.gateway_addr)
            .map(|e| e.interface)
            .or_else(|| self.pending.get(&xid).copied());

        if message.message_type.is_final_reply() {
            self.forget(xid);
        }

        let Some(egress) = egress else {
            tracing::debug!(
                "No client interface for {} with giaddr {}",
                message.message_type,
                message.gateway_addr
            );
            return Action::Ignore;
        };
        tracing::info!(
            "Broadcasting {} xid {:#010x} on {}",
            message.message_type,
            xid,
            egress
        );

        Action::Send {
            message,
            destination: SocketAddrV4::new(Ipv4Addr::BROADCAST, self.client_port),
            interface: egress,
        }
    }

    fn remember(&mut self, xid: u32, interface: InterfaceId) {
        if self.pending.insert(xid, interface).is_none() {
            self.pending_order.push_back(xid);
        }
        while self.pending_order.len() > MAX_PENDING_TRANSACTIONS {
            if let Some(oldest) = self.pending_order.pop_front() {
                self.pending.remove(&oldest);
            }
        }
    }

    fn forget(&mut self, xid: u32) {
        if self.pending.remove(&xid).is_some() {
            self.pending_order.retain(|pending| *pending != xid);
        }
    }
}

impl DhcpEngine for DhcpRelay {
    fn handle_event(&mut self, event: Event) -> Action {
        match event {
            Event::Tick => Action::Ignore,
            Event::Received {
                message,
                interface,
                ..
            } => {
                if message.message_type.is_client_message() {
                    self.forward_to_server(message, interface)
                } else {
                    self.forward_to_client(message, interface)
                }
            }
        }
    }

    fn role(&self) -> &'static str {
        "dhcp-relay"
    }

    fn bindings(&self) -> Vec<(InterfaceId, u16)> {
        let mut bindings = Vec::new();
        for entry in &self.entries {
            if !bindings.iter().any(|(id, _)| *id == entry.interface) {
                bindings.push((entry.interface, SERVER_PORT));
            }
        }
        // Server replies are broadcast to the port we forwarded from.
        bindings.push((self.upstream, self.client_port));
        bindings
    }
}
