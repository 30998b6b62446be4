//! Header flattener
//!
//! Turns the IPv6, UDP and CoAP headers of a packet into ordered columns:
//! one entry per header field with its bit length and its value as
//! right-aligned big-endian bytes. Columns are what the matcher compares
//! against rule fields and what the field actions pack into the residue.

use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::udp::UdpPacket;

use crate::coap::{CoapMessage, PAYLOAD_MARKER};
use crate::error::{Result, SchcError};
use crate::field_id::FieldId;

pub const IPV6_HEADER_LEN: usize = 40;
pub const UDP_HEADER_LEN: usize = 8;
pub const UDP_PROTOCOL: u8 = 17;

// =============================================================================
// Direction
// =============================================================================

/// Packet direction for directional field resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,   // DEV -> APP
    Down, // APP -> DEV
}

// =============================================================================
// Link Layer Configuration
// =============================================================================

/// Link layer type for captured packets
///
/// Specifies how much of the packet prefix to skip before the IPv6 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkLayer {
    /// No link layer header (raw IP packets)
    None,
    /// Standard Ethernet header (14 bytes: 6 dst + 6 src + 2 ethertype)
    #[default]
    Ethernet,
    /// Custom link layer with specified header length in bytes
    Custom(usize),
}

impl LinkLayer {
    pub fn header_len(&self) -> usize {
        match self {
            LinkLayer::None => 0,
            LinkLayer::Ethernet => 14,
            LinkLayer::Custom(len) => *len,
        }
    }

    /// The network packet behind the link layer header.
    pub fn strip<'a>(&self, frame: &'a [u8]) -> Result<&'a [u8]> {
        frame.get(self.header_len()..).ok_or_else(|| {
            SchcError::InvalidPacket(format!(
                "frame of {} bytes is shorter than its {}-byte link header",
                frame.len(),
                self.header_len()
            ))
        })
    }
}

// =============================================================================
// Columns
// =============================================================================

/// One flattened header field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub fid: FieldId,
    /// Field length in bits.
    pub bits: u16,
    /// `ceil(bits/8)` bytes, right-aligned.
    pub value: Vec<u8>,
}

impl Column {
    pub fn new(fid: FieldId, bits: u16, value: Vec<u8>) -> Self {
        Self { fid, bits, value }
    }

    /// Column for a `bits`-wide unsigned field.
    pub fn from_uint(fid: FieldId, bits: u16, value: u64) -> Self {
        let width = (bits as usize).div_ceil(8);
        let be = value.to_be_bytes();
        Self::new(fid, bits, be[be.len() - width..].to_vec())
    }

    /// Column holding whole bytes, at most `MAX_COLUMN_BYTES` of them.
    pub fn from_bytes(fid: FieldId, value: &[u8]) -> Self {
        Self::new(fid, (value.len() * 8) as u16, value.to_vec())
    }

    pub fn byte_len(&self) -> usize {
        self.value.len()
    }

    /// Value as an integer, for fields of at most 64 bits.
    pub fn as_u64(&self) -> u64 {
        self.value
            .iter()
            .rev()
            .take(8)
            .rev()
            .fold(0, |acc, &b| (acc << 8) | b as u64)
    }
}

// =============================================================================
// IPv6
// =============================================================================

/// Flatten a 40-byte IPv6 header.
///
/// The device address is the source for uplink and the destination for
/// downlink; columns always list the device side first.
pub fn flatten_ipv6(data: &[u8], direction: Direction, columns: &mut Vec<Column>) -> Result<()> {
    columns.clear();
    let ipv6 = Ipv6Packet::new(data).ok_or_else(|| {
        SchcError::InvalidPacket(format!("{} bytes is too short for IPv6", data.len()))
    })?;

    if ipv6.get_version() != 6 {
        return Err(SchcError::InvalidPacket(format!(
            "IP version {} is not 6",
            ipv6.get_version()
        )));
    }
    if ipv6.get_next_header().0 != UDP_PROTOCOL {
        return Err(SchcError::InvalidPacket(format!(
            "next header {} is not UDP",
            ipv6.get_next_header().0
        )));
    }

    let (dev, app) = match direction {
        Direction::Up => (ipv6.get_source(), ipv6.get_destination()),
        Direction::Down => (ipv6.get_destination(), ipv6.get_source()),
    };
    let dev = dev.octets();
    let app = app.octets();

    columns.extend([
        Column::from_uint(FieldId::Ipv6Ver, 4, ipv6.get_version() as u64),
        Column::from_uint(FieldId::Ipv6Tc, 8, ipv6.get_traffic_class() as u64),
        Column::from_uint(FieldId::Ipv6Fl, 20, ipv6.get_flow_label() as u64),
        Column::from_uint(FieldId::Ipv6Len, 16, ipv6.get_payload_length() as u64),
        Column::from_uint(FieldId::Ipv6Nxt, 8, ipv6.get_next_header().0 as u64),
        Column::from_uint(FieldId::Ipv6HopLmt, 8, ipv6.get_hop_limit() as u64),
        Column::from_bytes(FieldId::Ipv6DevPrefix, &dev[..8]),
        Column::from_bytes(FieldId::Ipv6DevIid, &dev[8..]),
        Column::from_bytes(FieldId::Ipv6AppPrefix, &app[..8]),
        Column::from_bytes(FieldId::Ipv6AppIid, &app[8..]),
    ]);
    Ok(())
}

// =============================================================================
// UDP
// =============================================================================

/// Flatten an 8-byte UDP header, device port first.
pub fn flatten_udp(data: &[u8], direction: Direction, columns: &mut Vec<Column>) -> Result<()> {
    columns.clear();
    let udp = UdpPacket::new(data).ok_or_else(|| {
        SchcError::InvalidPacket(format!("{} bytes is too short for UDP", data.len()))
    })?;

    let (dev_port, app_port) = match direction {
        Direction::Up => (udp.get_source(), udp.get_destination()),
        Direction::Down => (udp.get_destination(), udp.get_source()),
    };

    columns.extend([
        Column::from_uint(FieldId::UdpDevPort, 16, dev_port as u64),
        Column::from_uint(FieldId::UdpAppPort, 16, app_port as u64),
        Column::from_uint(FieldId::UdpLen, 16, udp.get_length() as u64),
        Column::from_uint(FieldId::UdpCksum, 16, udp.get_checksum() as u64),
    ]);
    Ok(())
}

// =============================================================================
// CoAP
// =============================================================================

/// Widest value whose bit length fits `Column::bits`.
pub const MAX_COLUMN_BYTES: usize = u16::MAX as usize / 8;

/// Flatten a CoAP message header.
///
/// Returns the length of the header in bytes, payload marker included; the
/// payload starts right after it. A token column is only produced when TKL is
/// non-zero.
pub fn flatten_coap(data: &[u8], columns: &mut Vec<Column>) -> Result<usize> {
    columns.clear();
    let msg = CoapMessage::parse(data)?;

    columns.extend([
        Column::from_uint(FieldId::CoapVer, 2, msg.version() as u64),
        Column::from_uint(FieldId::CoapType, 2, msg.message_type() as u64),
        Column::from_uint(FieldId::CoapTkl, 4, msg.token_length() as u64),
        Column::from_uint(FieldId::CoapCode, 8, msg.code() as u64),
        Column::from_uint(FieldId::CoapMid, 16, msg.message_id() as u64),
    ]);
    if !msg.token().is_empty() {
        columns.push(Column::from_bytes(FieldId::CoapToken, msg.token()));
    }

    for option in msg.options() {
        let fid = FieldId::from_coap_option(option.number).ok_or_else(|| {
            SchcError::InvalidPacket(format!("CoAP option {} has no field id", option.number))
        })?;
        if option.value.len() > MAX_COLUMN_BYTES {
            return Err(SchcError::InvalidPacket(format!(
                "CoAP option {} is {} bytes, wider than a field",
                option.number,
                option.value.len()
            )));
        }
        columns.push(Column::from_bytes(fid, &option.value));
    }

    if !msg.payload().is_empty() {
        columns.push(Column::from_bytes(FieldId::CoapPayloadMarker, &[PAYLOAD_MARKER]));
    }

    Ok(data.len() - msg.payload().len())
}
