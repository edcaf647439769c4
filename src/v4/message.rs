//! The parsed form of a DHCPv4 datagram as the server and relay see it.

use bytes::Bytes;
use std::{fmt, net::Ipv4Addr};

/// UDP port servers (and the upstream side of a relay) listen on.
pub const SERVER_PORT: u16 = 67;
/// UDP port clients (and the downstream side of a relay) listen on.
pub const CLIENT_PORT: u16 = 68;
/// Length of the `chaddr` field; client ids are canonicalized to it.
pub const CHADDR_LEN: usize = 16;

/// The five message types the engines understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Discover,
    Offer,
    Request,
    Ack,
    Nack,
}

impl MessageType {
    /// Whether a client (or a relay on its behalf) originates this type.
    pub fn is_client_message(self) -> bool {
        matches!(self, MessageType::Discover | MessageType::Request)
    }

    /// ACK and NACK end a transaction.
    pub fn is_final_reply(self) -> bool {
        matches!(self, MessageType::Ack | MessageType::Nack)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Discover => "DHCPDISCOVER",
            MessageType::Offer => "DHCPOFFER",
            MessageType::Request => "DHCPREQUEST",
            MessageType::Ack => "DHCPACK",
            MessageType::Nack => "DHCPNACK",
        };
        f.write_str(name)
    }
}

/// Hardware address normalized to a fixed 16 byte, zero padded key.
///
/// Two hardware addresses with different declared lengths but the same
/// leading bytes produce the same `ClientId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId([u8; CHADDR_LEN]);

impl ClientId {
    /// Canonicalizes a hardware address. Returns `None` if it does not fit in `chaddr`.
    pub fn from_hw_addr(hw_addr: &[u8]) -> Option<Self> {
        if hw_addr.len() > CHADDR_LEN {
            return None;
        }
        let mut buffer = [0u8; CHADDR_LEN];
        buffer[..hw_addr.len()].copy_from_slice(hw_addr);
        Some(Self(buffer))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Trailing padding is noise in logs; always show at least an Ethernet-sized prefix.
        let significant = self
            .0
            .iter()
            .rposition(|b| *b != 0)
            .map_or(0, |i| i + 1)
            .max(6);
        for (i, byte) in self.0[..significant].iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A decoded DHCP message.
///
/// Unset addresses are `0.0.0.0`; unset durations and masks are zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    pub transaction_id: u32,
    pub client_hw_addr: Bytes,
    pub your_addr: Ipv4Addr,
    pub server_addr: Ipv4Addr,
    pub gateway_addr: Ipv4Addr,
    /// Address a REQUEST asks for (option 50, or `ciaddr` when renewing).
    pub requested_addr: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub router: Option<Ipv4Addr>,
    pub lease_seconds: u32,
    pub renew_seconds: u32,
    pub rebind_seconds: u32,
    pub timestamp: u32,
}

impl Message {
    pub fn new(message_type: MessageType, transaction_id: u32, client_hw_addr: Bytes) -> Self {
        Self {
            message_type,
            transaction_id,
            client_hw_addr,
            your_addr: Ipv4Addr::UNSPECIFIED,
            server_addr: Ipv4Addr::UNSPECIFIED,
            gateway_addr: Ipv4Addr::UNSPECIFIED,
            requested_addr: Ipv4Addr::UNSPECIFIED,
            subnet_mask: Ipv4Addr::UNSPECIFIED,
            router: None,
            lease_seconds: 0,
            renew_seconds: 0,
            rebind_seconds: 0,
            timestamp: 0,
        }
    }

    /// Builds a reply of `message_type` that keeps the request's client identity.
    pub fn reply_to(request: &Message, message_type: MessageType) -> Self {
        Self::new(
            message_type,
            request.transaction_id,
            request.client_hw_addr.clone(),
        )
    }

    pub fn client_id(&self) -> Option<ClientId> {
        ClientId::from_hw_addr(&self.client_hw_addr)
    }

    /// True when a relay has stamped this message with its gateway address.
    pub fn is_relayed(&self) -> bool {
        !self.gateway_addr.is_unspecified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_ignores_declared_length() {
        let short = ClientId::from_hw_addr(&[0x00, 0x0c, 0x29, 0xa8, 0x92, 0xf4]).unwrap();
        let padded = ClientId::from_hw_addr(&[
            0x00, 0x0c, 0x29, 0xa8, 0x92, 0xf4, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        ])
        .unwrap();
        assert_eq!(short, padded);
        assert_eq!(short.to_string(), "00:0c:29:a8:92:f4");
    }

    #[test]
    fn client_id_rejects_oversized_hw_addr() {
        assert!(ClientId::from_hw_addr(&[1u8; 17]).is_none());
    }

    #[test]
    fn reply_keeps_transaction_and_chaddr() {
        let mac = Bytes::from_static(&[0x02, 0, 0, 0, 0, 1]);
        let mut request = Message::new(MessageType::Discover, 0xdead_beef, mac.clone());
        request.gateway_addr = Ipv4Addr::new(192, 168, 1, 1);

        let reply = Message::reply_to(&request, MessageType::Offer);
        assert_eq!(reply.transaction_id, 0xdead_beef);
        assert_eq!(reply.client_hw_addr, mac);
        assert!(request.is_relayed());
        assert!(!reply.is_relayed());
    }
}
