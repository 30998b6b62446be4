//! Packet Header Builder
//!
//! Reconstructs IPv6, UDP and CoAP headers from decompressed columns, and
//! patches the length and checksum fields that were left as zero
//! placeholders by `compute-length` / `compute-checksum`.

use pnet::packet::ipv6::MutableIpv6Packet;
use pnet::packet::udp::MutableUdpPacket;

use crate::bits::copy_bits;
use crate::coap::{CoapMessage, PAYLOAD_MARKER};
use crate::error::{Result, SchcError};
use crate::field_id::FieldId;
use crate::parser::{Column, Direction, IPV6_HEADER_LEN, UDP_HEADER_LEN, UDP_PROTOCOL};

/// Fields left as placeholders during decompression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deferred {
    pub length: bool,
    pub checksum: bool,
}

fn column(columns: &[Column], fid: FieldId) -> Result<&Column> {
    columns
        .iter()
        .find(|c| c.fid == fid)
        .ok_or_else(|| SchcError::Decompression(format!("{fid} missing from decompressed fields")))
}

/// OR the low `column.bits` bits of a column into `header` at bit `pos`.
fn place(header: &mut [u8], pos: usize, col: &Column) -> Result<()> {
    let bits = col.bits as usize;
    copy_bits(header, pos, &col.value, col.byte_len() * 8 - bits, bits)
}

// =============================================================================
// IPv6 Header Construction
// =============================================================================

/// Build an IPv6 header from decompressed columns
///
/// ```text
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |Version| Traffic Class |           Flow Label                  |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Payload Length        |  Next Header  |   Hop Limit   |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                 Source Address (128 bits)                     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |               Destination Address (128 bits)                  |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
pub fn build_ipv6_header(columns: &[Column], direction: Direction) -> Result<[u8; IPV6_HEADER_LEN]> {
    let mut header = [0u8; IPV6_HEADER_LEN];

    place(&mut header, 0, column(columns, FieldId::Ipv6Ver)?)?;
    place(&mut header, 4, column(columns, FieldId::Ipv6Tc)?)?;
    place(&mut header, 12, column(columns, FieldId::Ipv6Fl)?)?;
    place(&mut header, 32, column(columns, FieldId::Ipv6Len)?)?;
    place(&mut header, 48, column(columns, FieldId::Ipv6Nxt)?)?;
    place(&mut header, 56, column(columns, FieldId::Ipv6HopLmt)?)?;

    // Source address starts at bit 64, destination at bit 192
    let (dev, app) = match direction {
        Direction::Up => (64, 192),
        Direction::Down => (192, 64),
    };
    place(&mut header, dev, column(columns, FieldId::Ipv6DevPrefix)?)?;
    place(&mut header, dev + 64, column(columns, FieldId::Ipv6DevIid)?)?;
    place(&mut header, app, column(columns, FieldId::Ipv6AppPrefix)?)?;
    place(&mut header, app + 64, column(columns, FieldId::Ipv6AppIid)?)?;

    Ok(header)
}

// =============================================================================
// UDP Header Construction
// =============================================================================

/// Build a UDP header from decompressed columns
///
/// ```text
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |          Source Port          |       Destination Port        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |            Length             |           Checksum            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
pub fn build_udp_header(columns: &[Column], direction: Direction) -> Result<[u8; UDP_HEADER_LEN]> {
    let mut header = [0u8; UDP_HEADER_LEN];

    let (dev, app) = match direction {
        Direction::Up => (0, 16),
        Direction::Down => (16, 0),
    };
    place(&mut header, dev, column(columns, FieldId::UdpDevPort)?)?;
    place(&mut header, app, column(columns, FieldId::UdpAppPort)?)?;
    place(&mut header, 32, column(columns, FieldId::UdpLen)?)?;
    place(&mut header, 48, column(columns, FieldId::UdpCksum)?)?;

    Ok(header)
}

// =============================================================================
// CoAP Header Construction
// =============================================================================

/// Build a CoAP header (up to and including the payload marker)
pub fn build_coap_header(columns: &[Column]) -> Result<Vec<u8>> {
    let mut msg = CoapMessage::new();
    let mut tkl = None;
    let mut marker = false;

    for col in columns {
        let value = col.as_u64();
        match col.fid {
            FieldId::CoapVer => msg.set_version(value as u8),
            FieldId::CoapType => msg.set_message_type(value as u8),
            FieldId::CoapTkl => tkl = Some(value as usize),
            FieldId::CoapCode => msg.set_code(value as u8),
            FieldId::CoapMid => msg.set_message_id(value as u16),
            FieldId::CoapToken => msg.set_token(col.value.clone())?,
            FieldId::CoapPayloadMarker => marker = true,
            fid => match fid.coap_option_number() {
                Some(number) => msg.add_option(number, col.value.clone()),
                None => {
                    return Err(SchcError::Decompression(format!(
                        "{fid} cannot appear in a CoAP header"
                    )));
                }
            },
        }
    }

    let tkl = tkl.ok_or_else(|| SchcError::Decompression("COAP.TKL missing".to_string()))?;
    if tkl != msg.token().len() {
        return Err(SchcError::Decompression(format!(
            "TKL {tkl} disagrees with a {}-byte token",
            msg.token().len()
        )));
    }

    let mut header = msg.to_bytes();
    if marker {
        header.push(PAYLOAD_MARKER);
    }
    Ok(header)
}

// =============================================================================
// Length and Checksum Patching
// =============================================================================

fn check_udp_packet(packet: &[u8]) -> Result<()> {
    if packet.len() < IPV6_HEADER_LEN + UDP_HEADER_LEN {
        return Err(SchcError::InvalidPacket(format!(
            "{} bytes is too short for IPv6/UDP",
            packet.len()
        )));
    }
    Ok(())
}

fn length_u16(len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| SchcError::InvalidPacket(format!("length {len} exceeds 16 bits")))
}

/// Fill in zero IPv6 payload length and UDP length fields.
pub fn compute_length(packet: &mut [u8]) -> Result<()> {
    check_udp_packet(packet)?;
    let payload_len = length_u16(packet.len() - IPV6_HEADER_LEN)?;

    if let Some(mut ipv6) = MutableIpv6Packet::new(&mut packet[..IPV6_HEADER_LEN])
        && ipv6.get_payload_length() == 0
    {
        ipv6.set_payload_length(payload_len);
    }
    if let Some(mut udp) = MutableUdpPacket::new(&mut packet[IPV6_HEADER_LEN..])
        && udp.get_length() == 0
    {
        udp.set_length(payload_len);
    }
    Ok(())
}

/// Fill in a zero UDP checksum.
pub fn compute_checksum(packet: &mut [u8]) -> Result<()> {
    check_udp_packet(packet)?;
    let (ip_header, udp) = packet.split_at_mut(IPV6_HEADER_LEN);
    if udp[6..8] != [0, 0] {
        return Ok(());
    }
    let udp_len = length_u16(udp.len())?;
    let checksum = compute_udp_checksum(ip_header, udp_len, udp);
    udp[6..8].copy_from_slice(&checksum.to_be_bytes());
    Ok(())
}

/// Run the patchers requested by the deferred fields.
pub fn apply_deferred(packet: &mut [u8], deferred: Deferred) -> Result<()> {
    if deferred.length {
        compute_length(packet)?;
    }
    if deferred.checksum {
        compute_checksum(packet)?;
    }
    Ok(())
}

/// Compute UDP checksum over the IPv6 pseudo-header (RFC 768, RFC 8200)
///
/// `datagram` is the UDP header followed by its payload; its checksum field
/// is skipped.
pub fn compute_udp_checksum(ip_header: &[u8], udp_len: u16, datagram: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    // IPv6 pseudo-header: src (16) + dst (16) + udp_len (4) + zeros (3) + next_header (1)
    for i in (8..IPV6_HEADER_LEN).step_by(2) {
        sum = sum.wrapping_add(((ip_header[i] as u32) << 8) | (ip_header[i + 1] as u32));
    }
    sum = sum.wrapping_add(udp_len as u32);
    sum = sum.wrapping_add(UDP_PROTOCOL as u32);

    for i in (0..datagram.len()).step_by(2) {
        if i == 6 {
            continue; // Skip checksum field
        }
        let word = if i + 1 < datagram.len() {
            ((datagram[i] as u32) << 8) | (datagram[i + 1] as u32)
        } else {
            (datagram[i] as u32) << 8
        };
        sum = sum.wrapping_add(word);
    }

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    // A zero checksum is transmitted as 0xFFFF
    match !sum as u16 {
        0 => 0xFFFF,
        checksum => checksum,
    }
}

// =============================================================================
// Tests
// =============================================================================
