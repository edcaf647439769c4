//! Conversion between [`Message`] and RFC 2131 datagrams.
//!
//! The byte layout itself is delegated to `dhcproto`; this module only maps
//! the fields the engines care about onto BOOTP header fields and options.
//!
//! `Message::timestamp` is local bookkeeping and is not encoded: no standard
//! field or option carries it, so a decoded message always has 0 there.

use super::message::{Message, MessageType, CHADDR_LEN};
use bytes::Bytes;
use dhcproto::{
    error::{DecodeError, EncodeError},
    v4::{self, DhcpOption, OptionCode},
    Decodable, Decoder, Encodable, Encoder,
};
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Failed to decode DHCP datagram")]
    Decode(#[from] DecodeError),

    #[error("Failed to encode DHCP message")]
    Encode(#[from] EncodeError),

    #[error("Datagram carries no DHCP message type option")]
    MissingMessageType,

    #[error("Unsupported DHCP message type {0:?}")]
    UnsupportedType(v4::MessageType),

    #[error("Hardware address of {0} bytes does not fit in chaddr")]
    HwAddrTooLong(usize),
}

impl From<MessageType> for v4::MessageType {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Discover => v4::MessageType::Discover,
            MessageType::Offer => v4::MessageType::Offer,
            MessageType::Request => v4::MessageType::Request,
            MessageType::Ack => v4::MessageType::Ack,
            MessageType::Nack => v4::MessageType::Nak,
        }
    }
}

impl TryFrom<v4::MessageType> for MessageType {
    type Error = CodecError;

    fn try_from(kind: v4::MessageType) -> Result<Self, Self::Error> {
        match kind {
            v4::MessageType::Discover => Ok(MessageType::Discover),
            v4::MessageType::Offer => Ok(MessageType::Offer),
            v4::MessageType::Request => Ok(MessageType::Request),
            v4::MessageType::Ack => Ok(MessageType::Ack),
            v4::MessageType::Nak => Ok(MessageType::Nack),
            other => Err(CodecError::UnsupportedType(other)),
        }
    }
}

/// Serializes a message into a datagram payload.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    if message.client_hw_addr.len() > CHADDR_LEN {
        return Err(CodecError::HwAddrTooLong(message.client_hw_addr.len()));
    }

    let mut msg = v4::Message::default();
    let opcode = if message.message_type.is_client_message() {
        v4::Opcode::BootRequest
    } else {
        v4::Opcode::BootReply
    };
    msg.set_opcode(opcode)
        .set_htype(v4::HType::Eth)
        .set_chaddr(&message.client_hw_addr)
        .set_xid(message.transaction_id)
        .set_yiaddr(message.your_addr)
        .set_siaddr(message.server_addr)
        .set_giaddr(message.gateway_addr);

    if message.message_type.is_client_message() {
        msg.set_flags(v4::Flags::default().set_broadcast());
    }

    let opts = msg.opts_mut();
    opts.insert(DhcpOption::MessageType(message.message_type.into()));

    if !message.requested_addr.is_unspecified() {
        opts.insert(DhcpOption::RequestedIpAddress(message.requested_addr));
    }
    if !message.subnet_mask.is_unspecified() {
        opts.insert(DhcpOption::SubnetMask(message.subnet_mask));
    }
    if let Some(router) = message.router {
        opts.insert(DhcpOption::Router(vec![router]));
    }
    if !message.message_type.is_client_message() && !message.server_addr.is_unspecified() {
        opts.insert(DhcpOption::ServerIdentifier(message.server_addr));
    }
    if message.lease_seconds != 0 {
        opts.insert(DhcpOption::AddressLeaseTime(message.lease_seconds));
    }
    if message.renew_seconds != 0 {
        opts.insert(DhcpOption::Renewal(message.renew_seconds));
    }
    if message.rebind_seconds != 0 {
        opts.insert(DhcpOption::Rebinding(message.rebind_seconds));
    }

    let mut buffer = Vec::new();
    let mut encoder = Encoder::new(&mut buffer);
    msg.encode(&mut encoder)?;
    Ok(buffer)
}

/// Parses a datagram payload. Only the five modeled message types are accepted.
pub fn decode(data: &[u8]) -> Result<Message, CodecError> {
    let msg = v4::Message::decode(&mut Decoder::new(data))?;

    let message_type = match msg.opts().get(OptionCode::MessageType) {
        Some(DhcpOption::MessageType(kind)) => MessageType::try_from(*kind)?,
        _ => return Err(CodecError::MissingMessageType),
    };

    // chaddr() slices by hlen, which the decoder does not bound.
    let hlen = usize::from(msg.hlen());
    if hlen > CHADDR_LEN {
        return Err(CodecError::HwAddrTooLong(hlen));
    }

    let mut message = Message::new(
        message_type,
        msg.xid(),
        Bytes::copy_from_slice(msg.chaddr()),
    );
    message.your_addr = msg.yiaddr();
    message.server_addr = msg.siaddr();
    message.gateway_addr = msg.giaddr();

    // Renewing clients leave option 50 out and put their address in ciaddr.
    message.requested_addr = match msg.opts().get(OptionCode::RequestedIpAddress) {
        Some(DhcpOption::RequestedIpAddress(ip)) => *ip,
        _ => msg.ciaddr(),
    };

    if let Some(DhcpOption::ServerIdentifier(ip)) = msg.opts().get(OptionCode::ServerIdentifier) {
        if message.server_addr.is_unspecified() {
            message.server_addr = *ip;
        }
    }
    if let Some(DhcpOption::SubnetMask(mask)) = msg.opts().get(OptionCode::SubnetMask) {
        message.subnet_mask = *mask;
    }
    if let Some(DhcpOption::Router(routers)) = msg.opts().get(OptionCode::Router) {
        message.router = routers.first().copied();
    }
    if let Some(DhcpOption::AddressLeaseTime(secs)) = msg.opts().get(OptionCode::AddressLeaseTime)
    {
        message.lease_seconds = *secs;
    }
    if let Some(DhcpOption::Renewal(secs)) = msg.opts().get(OptionCode::Renewal) {
        message.renew_seconds = *secs;
    }
    if let Some(DhcpOption::Rebinding(secs)) = msg.opts().get(OptionCode::Rebinding) {
        message.rebind_seconds = *secs;
    }

    Ok(message)
}

/// Returns `true` if `mask` is a valid contiguous netmask (e.g. 255.255.255.0).
pub fn is_contiguous_mask(mask: Ipv4Addr) -> bool {
    let bits = u32::from(mask);
    bits.leading_ones() + bits.trailing_zeros() == 32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac() -> Bytes {
        Bytes::from_static(&[0x00, 0x0c, 0x29, 0xa8, 0x92, 0xf4])
    }

    #[test]
    fn relayed_offer_keeps_gateway_and_timers() {
        let mut offer = Message::new(MessageType::Offer, 0x1234_5678, mac());
        offer.your_addr = Ipv4Addr::new(10, 0, 0, 2);
        offer.server_addr = Ipv4Addr::new(10, 0, 0, 1);
        offer.gateway_addr = Ipv4Addr::new(192, 168, 1, 1);
        offer.subnet_mask = Ipv4Addr::new(255, 255, 255, 0);
        offer.router = Some(Ipv4Addr::new(10, 0, 0, 254));
        offer.lease_seconds = 30;
        offer.renew_seconds = 15;
        offer.rebind_seconds = 25;

        let packet = encode(&offer).unwrap();

        // The wire form must be a plain BOOTREPLY that other stacks can read.
        let raw = v4::Message::decode(&mut Decoder::new(&packet)).unwrap();
        assert_eq!(raw.opcode(), v4::Opcode::BootReply);
        assert_eq!(raw.giaddr(), Ipv4Addr::new(192, 168, 1, 1));
        assert!(matches!(
            raw.opts().get(OptionCode::ServerIdentifier),
            Some(DhcpOption::ServerIdentifier(ip)) if *ip == Ipv4Addr::new(10, 0, 0, 1)
        ));

        let decoded = decode(&packet).unwrap();
        assert_eq!(decoded, offer);
    }

    #[test]
    fn request_without_option_50_uses_ciaddr() {
        let mut raw = v4::Message::default();
        raw.set_opcode(v4::Opcode::BootRequest)
            .set_htype(v4::HType::Eth)
            .set_chaddr(&mac())
            .set_xid(7)
            .set_ciaddr(Ipv4Addr::new(10, 0, 0, 3));
        raw.opts_mut()
            .insert(DhcpOption::MessageType(v4::MessageType::Request));
        let mut buffer = Vec::new();
        raw.encode(&mut Encoder::new(&mut buffer)).unwrap();

        let decoded = decode(&buffer).unwrap();
        assert_eq!(decoded.message_type, MessageType::Request);
        assert_eq!(decoded.requested_addr, Ipv4Addr::new(10, 0, 0, 3));
    }

    #[test]
    fn release_is_unsupported() {
        let mut raw = v4::Message::default();
        raw.set_opcode(v4::Opcode::BootRequest).set_chaddr(&mac());
        raw.opts_mut()
            .insert(DhcpOption::MessageType(v4::MessageType::Release));
        let mut buffer = Vec::new();
        raw.encode(&mut Encoder::new(&mut buffer)).unwrap();

        assert!(matches!(
            decode(&buffer),
            Err(CodecError::UnsupportedType(v4::MessageType::Release))
        ));
    }

    #[test]
    fn oversized_hlen_is_rejected() {
        let discover = Message::new(MessageType::Discover, 9, mac());
        let mut packet = encode(&discover).unwrap();
        packet[2] = 17;

        assert!(matches!(decode(&packet), Err(CodecError::HwAddrTooLong(17))));
    }

    #[test]
    fn truncated_datagram_is_rejected() {
        assert!(decode(&[0x01, 0x01, 0x06]).is_err());
    }

    #[test]
    fn contiguous_masks() {
        assert!(is_contiguous_mask(Ipv4Addr::new(255, 255, 255, 0)));
        assert!(is_contiguous_mask(Ipv4Addr::new(255, 255, 255, 252)));
        assert!(!is_contiguous_mask(Ipv4Addr::new(255, 0, 255, 0)));
    }
}
