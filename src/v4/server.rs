//! DHCPv4 server state machine
//!
//! Answers DISCOVER with OFFER and REQUEST with ACK or NACK out of a single
//! [`LeaseTable`], and ages the table on every tick.

use super::{
    lease::{Allocation, LeaseTable, Renewal},
    message::{ClientId, Message, MessageType, SERVER_PORT},
};
use crate::{
    config::{parse_hw_address, ServerConfig},
    daemon::{Action, DhcpEngine, Event},
    error::HarborError,
    network::{find_for_prefix, InterfaceId, LocalInterface},
};
use std::{
    net::{Ipv4Addr, SocketAddrV4},
    time::Duration,
};

/// Leases are aged once per second.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

pub struct DhcpServer {
    interface: LocalInterface,
    pool_mask: Ipv4Addr,
    gateway: Option<Ipv4Addr>,
    lease_seconds: u32,
    renew_seconds: u32,
    rebind_seconds: u32,
    leases: LeaseTable,
    /// Seconds since start; stamped into replies.
    clock: u32,
}

impl DhcpServer {
    /// Builds a server for the pool in `config`, running on the local
    /// interface that sits inside the pool network.
    pub fn new(config: &ServerConfig, interfaces: &[LocalInterface]) -> Result<Self, HarborError> {
        config.validate()?;

        if let Some(name) = &config.interface {
            if !interfaces.iter().any(|iface| &iface.name == name) {
                return Err(HarborError::InterfaceInvalid(name.clone()));
            }
        }

        let candidates: Vec<LocalInterface> = interfaces
            .iter()
            .filter(|iface| {
                config
                    .interface
                    .as_ref()
                    .map_or(true, |name| &iface.name == name)
            })
            .cloned()
            .collect();
        let interface = find_for_prefix(&candidates, config.pool_network, config.pool_mask)
            .cloned()
            .ok_or_else(|| {
                HarborError::Config(format!(
                    "no interface in {}/{}; the server must sit on its pool subnet",
                    config.pool_network, config.pool_mask
                ))
            })?;

        let leases = LeaseTable::initialize(
            config.first_address,
            config.last_address,
            interface.address,
            config.lease_seconds,
        )?;
        tracing::info!(
            "Serving {}-{} on {} as {}",
            config.first_address,
            config.last_address,
            interface.name,
            interface.address
        );

        let mut server = Self {
            interface,
            pool_mask: config.pool_mask,
            gateway: config.gateway,
            lease_seconds: config.lease_seconds,
            renew_seconds: config.renew_seconds,
            rebind_seconds: config.rebind_seconds,
            leases,
            clock: 0,
        };

        for entry in &config.static_entries {
            let hw_addr = parse_hw_address(&entry.hw_address)?;
            server.add_static_entry(&hw_addr, entry.address)?;
        }
        Ok(server)
    }

    /// Reserves `address` for the client with `hw_addr` forever.
    pub fn add_static_entry(
        &mut self,
        hw_addr: &[u8],
        address: Ipv4Addr,
    ) -> Result<(), HarborError> {
        let client = ClientId::from_hw_addr(hw_addr).ok_or_else(|| {
            HarborError::HwAddressParse(format!("{} bytes do not fit in chaddr", hw_addr.len()))
        })?;
        self.leases.add_static_entry(client, address)?;
        tracing::info!("Static entry: {client} -> {address}");
        Ok(())
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    pub fn own_address(&self) -> Ipv4Addr {
        self.interface.address
    }

    fn handle_discover(
        &mut self,
        request: &Message,
        source: SocketAddrV4,
        interface: InterfaceId,
    ) -> Action {
        if request.is_relayed() {
            tracing::info!(
                "DHCP DISCOVER from: {} source port: {} via relay {}",
                source.ip(),
                source.port(),
                request.gateway_addr
            );
        } else {
            tracing::info!(
                "DHCP DISCOVER from: {} source port: {}",
                source.ip(),
                source.port()
            );
        }
        let Some(client) = request.client_id() else {
            return Action::Ignore;
        };

        let offered = match self.leases.allocate(client) {
            Allocation::Assigned(address) => address,
            Allocation::Exhausted => {
                tracing::warn!("Address pool exhausted, not answering {client}");
                return Action::Ignore;
            }
        };

        let mut offer = self.reply(request, MessageType::Offer);
        offer.your_addr = offered;
        offer.lease_seconds = self.lease_seconds;
        offer.renew_seconds = self.renew_seconds;
        offer.rebind_seconds = self.rebind_seconds;
        offer.router = self.gateway;
        tracing::info!("DHCP OFFER Offered Address: {offered}");

        // The relay, not the server, picks unicast or broadcast on the client side.
        Action::Send {
            message: offer,
            destination: SocketAddrV4::new(Ipv4Addr::BROADCAST, source.port()),
            interface,
        }
    }

    fn handle_request(
        &mut self,
        request: &Message,
        source: SocketAddrV4,
        interface: InterfaceId,
    ) -> Action {
        let requested = request.requested_addr;
        if !self.leases.contains(requested) {
            tracing::debug!("Ignoring REQUEST for {requested}, outside the pool");
            return Action::Ignore;
        }
        tracing::info!(
            "DHCP REQUEST from: {} source port: {} - refreshed addr: {}",
            source.ip(),
            source.port(),
            requested
        );
        let Some(client) = request.client_id() else {
            return Action::Ignore;
        };

        let reply = match self.leases.renew(client, requested) {
            Renewal::Ack(address) => {
                let mut ack = self.reply(request, MessageType::Ack);
                ack.your_addr = address;
                ack.lease_seconds = self.lease_seconds;
                ack.renew_seconds = self.renew_seconds;
                ack.rebind_seconds = self.rebind_seconds;
                ack.router = self.gateway;
                tracing::info!("DHCP ACK {address} to {client}");
                ack
            }
            Renewal::Nack => {
                let mut nack = self.reply(request, MessageType::Nack);
                nack.your_addr = requested;
                tracing::info!(
                    "DHCP NACK {requested} to {client}: address does not exist or was released"
                );
                nack
            }
        };

        // A client that already owns the address talks to us directly; answer in kind.
        let destination = if *source.ip() == requested {
            source
        } else {
            SocketAddrV4::new(Ipv4Addr::BROADCAST, source.port())
        };
        Action::Send {
            message: reply,
            destination,
            interface,
        }
    }

    /// Reply skeleton shared by OFFER, ACK and NACK. A relay's `giaddr` and
    /// subnet mask are echoed untouched so it can route the reply back.
    fn reply(&self, request: &Message, message_type: MessageType) -> Message {
        let mut reply = Message::reply_to(request, message_type);
        reply.server_addr = self.interface.address;
        reply.gateway_addr = request.gateway_addr;
        reply.subnet_mask = if request.subnet_mask.is_unspecified() {
            self.pool_mask
        } else {
            request.subnet_mask
        };
        reply.timestamp = self.clock;
        reply
    }
}

impl DhcpEngine for DhcpServer {
    fn handle_event(&mut self, event: Event) -> Action {
        match event {
            Event::Tick => {
                self.clock = self.clock.wrapping_add(1);
                self.leases.tick();
                Action::Ignore
            }
            Event::Received {
                message,
                source,
                interface,
            } => match message.message_type {
                MessageType::Discover => self.handle_discover(&message, source, interface),
                MessageType::Request => self.handle_request(&message, source, interface),
                other => {
                    tracing::debug!("Ignoring {other} from {source}");
                    Action::Ignore
                }
            },
        }
    }

    fn role(&self) -> &'static str {
        "dhcp-server"
    }

    fn bindings(&self) -> Vec<(InterfaceId, u16)> {
        vec![(self.interface.id, SERVER_PORT)]
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(TICK_INTERVAL)
    }
}
