//! Decompression Logic
//!
//! Reverses the compression actions: reads residues from a bounds-checked
//! cursor, rebuilds the columns of each layer and reassembles
//! `IPv6 | UDP | CoAP | payload`, patching deferred lengths and checksums.

use tracing::{debug, trace};

use crate::bit_buffer::BitBuffer;
use crate::bits::{clear_bits, copy_bits};
use crate::context::CompressionContext;
use crate::error::{Result, SchcError};
use crate::field_id::{FieldId, Layer};
use crate::packet_builder::{
    Deferred, apply_deferred, build_coap_header, build_ipv6_header, build_udp_header,
};
use crate::parser::{Column, Direction, IPV6_HEADER_LEN, UDP_HEADER_LEN};
use crate::rule::{
    CompressionAction, CompressionRule, DeviceContext, Field, FieldLength, MatchingOperator, Rule,
    RuleIdMode,
};
use crate::rule_id::LayeredRuleId;

// =============================================================================
// Rule ID Matching
// =============================================================================

/// Composite rule id found at the start of a compressed packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleIdMatch<'a> {
    Compressed(&'a CompressionRule),
    Uncompressed,
}

fn id_matches(bits: &mut BitBuffer, rule_id: u32, length: u8) -> bool {
    bits.set_position(0);
    let mask = (1u64 << length) - 1;
    bits.read_bits(length as usize)
        .is_ok_and(|v| v == rule_id as u64 & mask)
}

/// Match the leading composite rule id, trying the widest ids first
pub fn match_rule_id<'a>(data: &[u8], device: &'a DeviceContext) -> Result<RuleIdMatch<'a>> {
    if data.is_empty() {
        return Err(SchcError::Decompression("Empty compressed data".to_string()));
    }

    let mut bits = BitBuffer::from_bytes(data);

    let mut sorted_rules: Vec<&CompressionRule> = device.compression_rules.iter().collect();
    sorted_rules.sort_by(|a, b| b.rule_id_length.cmp(&a.rule_id_length));

    let uncompressed_len = device.uncompressed_rule_id_length;
    let mut uncompressed_tried = false;

    for rule in sorted_rules {
        if !uncompressed_tried && uncompressed_len > rule.rule_id_length {
            uncompressed_tried = true;
            if id_matches(&mut bits, device.uncompressed_rule_id, uncompressed_len) {
                return Ok(RuleIdMatch::Uncompressed);
            }
        }
        if id_matches(&mut bits, rule.rule_id, rule.rule_id_length) {
            return Ok(RuleIdMatch::Compressed(rule));
        }
    }

    if !uncompressed_tried && id_matches(&mut bits, device.uncompressed_rule_id, uncompressed_len) {
        return Ok(RuleIdMatch::Uncompressed);
    }

    Err(SchcError::UnknownRuleId)
}

// =============================================================================
// Main Decompression Entry Point
// =============================================================================

/// Result of decompressing a packet
#[derive(Debug, Clone)]
pub struct DecompressedPacket {
    pub data: Vec<u8>,
    pub rule_id: u32,
    pub rule_id_length: u8,
    pub layered: Option<LayeredRuleId>,
}

/// Decompress a SCHC packet for a device
pub fn decompress_packet(
    device: &DeviceContext,
    ctx: &CompressionContext,
    data: &[u8],
) -> Result<DecompressedPacket> {
    match device.mode {
        RuleIdMode::Layered => {
            let first = *data
                .first()
                .ok_or_else(|| SchcError::Decompression("Empty compressed data".to_string()))?;
            let id = LayeredRuleId::from_byte(first);
            let layer_id = |v: u8| (v != 0).then_some(v as u32);
            let packet = decompress_layers(
                device,
                ctx,
                [layer_id(id.network), layer_id(id.transport), layer_id(id.application)],
                &data[1..],
            )?;
            Ok(DecompressedPacket {
                data: packet,
                rule_id: first as u32,
                rule_id_length: 8,
                layered: Some(id),
            })
        }
        RuleIdMode::Composite => {
            let (rule_id, rule_id_length, packet) = match match_rule_id(data, device)? {
                RuleIdMatch::Uncompressed => {
                    let skip = (device.uncompressed_rule_id_length as usize).div_ceil(8);
                    debug!("uncompressed rule ID, packet sent verbatim");
                    (
                        device.uncompressed_rule_id,
                        device.uncompressed_rule_id_length,
                        data[skip..].to_vec(),
                    )
                }
                RuleIdMatch::Compressed(rule) => {
                    let skip = (rule.rule_id_length as usize).div_ceil(8);
                    let packet = decompress_layers(
                        device,
                        ctx,
                        [rule.ipv6, rule.udp, rule.coap],
                        &data[skip..],
                    )?;
                    (rule.rule_id, rule.rule_id_length, packet)
                }
            };
            Ok(DecompressedPacket {
                data: packet,
                rule_id,
                rule_id_length,
                layered: None,
            })
        }
    }
}

/// Residue size in bytes of a fixed-layout layer rule.
pub fn residue_len(rule: &Rule, direction: Direction) -> Result<usize> {
    let mut len = 0;
    for field in rule.fields_for(direction) {
        let FieldLength::Fixed(bits) = field.fl else {
            return Err(SchcError::Decompression(format!(
                "{} has no fixed length",
                field.fid
            )));
        };
        len += match (field.cda, field.mo) {
            (CompressionAction::ValueSent, _) => (bits as usize).div_ceil(8),
            (CompressionAction::MappingSent, _) => 1,
            (CompressionAction::Lsb, MatchingOperator::Msb(msb)) => {
                (bits as usize).saturating_sub(msb as usize).div_ceil(8)
            }
            _ => 0,
        };
    }
    Ok(len)
}

fn slice_part(body: &[u8], start: usize, len: usize) -> Result<&[u8]> {
    body.get(start..start + len)
        .ok_or(SchcError::CursorOverrun {
            needed: len * 8,
            position: start * 8,
            remaining: body.len().saturating_sub(start) * 8,
        })
}

/// Rebuild `IPv6 | UDP | CoAP | payload` from the per-layer parts.
///
/// `ids` holds the IPv6, UDP and CoAP rule ids; `None` marks a layer that
/// was sent verbatim.
fn decompress_layers(
    device: &DeviceContext,
    ctx: &CompressionContext,
    ids: [Option<u32>; 3],
    body: &[u8],
) -> Result<Vec<u8>> {
    let [ipv6_id, udp_id, coap_id] = ids;
    let ipv6_rule = ipv6_id.map(|id| device.rule(Layer::Network, id)).transpose()?;
    let udp_rule = udp_id.map(|id| device.rule(Layer::Transport, id)).transpose()?;
    let coap_rule = coap_id.map(|id| device.rule(Layer::Application, id)).transpose()?;

    let ipv6_len = match ipv6_rule {
        Some(rule) => residue_len(rule, ctx.direction)?,
        None => IPV6_HEADER_LEN,
    };
    let udp_len = match udp_rule {
        Some(rule) => residue_len(rule, ctx.direction)?,
        None => UDP_HEADER_LEN,
    };
    let ipv6_part = slice_part(body, 0, ipv6_len)?;
    let udp_part = slice_part(body, ipv6_len, udp_len)?;
    let coap_part = &body[ipv6_len + udp_len..];

    let mut deferred = Deferred::default();

    // CoAP first: the end of its residue is where the payload starts
    let coap = match coap_rule {
        Some(rule) => {
            let mut cursor = BitBuffer::from_bytes(coap_part);
            let columns = decompress_with_rule(rule, ctx, &mut cursor, &mut deferred)?;
            let mut coap = build_coap_header(&columns)?;
            coap.extend_from_slice(&coap_part[cursor.byte_position()..]);
            coap
        }
        None => coap_part.to_vec(),
    };

    let udp = match udp_rule {
        Some(rule) => {
            let mut cursor = BitBuffer::from_bytes(udp_part);
            let columns = decompress_with_rule(rule, ctx, &mut cursor, &mut deferred)?;
            build_udp_header(&columns, ctx.direction)?.to_vec()
        }
        None => udp_part.to_vec(),
    };

    let ipv6 = match ipv6_rule {
        Some(rule) => {
            let mut cursor = BitBuffer::from_bytes(ipv6_part);
            let columns = decompress_with_rule(rule, ctx, &mut cursor, &mut deferred)?;
            build_ipv6_header(&columns, ctx.direction)?.to_vec()
        }
        None => ipv6_part.to_vec(),
    };

    let mut packet = Vec::with_capacity(ipv6.len() + udp.len() + coap.len());
    packet.extend_from_slice(&ipv6);
    packet.extend_from_slice(&udp);
    packet.extend_from_slice(&coap);
    apply_deferred(&mut packet, deferred)?;

    debug!(
        ipv6 = ?ipv6_id,
        udp = ?udp_id,
        coap = ?coap_id,
        len = packet.len(),
        "packet decompressed"
    );
    Ok(packet)
}

// =============================================================================
// Field Decompression
// =============================================================================

/// Decompress the fields of one layer rule from the cursor.
pub fn decompress_with_rule(
    rule: &Rule,
    ctx: &CompressionContext,
    cursor: &mut BitBuffer,
    deferred: &mut Deferred,
) -> Result<Vec<Column>> {
    let mut columns = Vec::with_capacity(rule.fields.len());
    for field in rule.fields_for(ctx.direction) {
        let column = decompress_field(field, &columns, ctx, cursor, deferred)?;
        trace!(
            field = %field.fid,
            cda = field.cda.as_str(),
            value = %hex::encode(&column.value),
            "field decompressed"
        );
        columns.push(column);
    }
    Ok(columns)
}

fn decompress_field(
    field: &Field,
    previous: &[Column],
    ctx: &CompressionContext,
    cursor: &mut BitBuffer,
    deferred: &mut Deferred,
) -> Result<Column> {
    match field.cda {
        CompressionAction::NotSent => restore_from_tv(field),
        CompressionAction::ValueSent => read_field_value(cursor, field, previous),
        CompressionAction::MappingSent => decompress_mapping(cursor, field),
        CompressionAction::Lsb => decompress_lsb(cursor, field),
        CompressionAction::ComputeLength | CompressionAction::ComputeChecksum => {
            if field.cda == CompressionAction::ComputeLength {
                deferred.length = true;
            } else {
                deferred.checksum = true;
            }
            let bits = fixed_bits(field)?;
            Ok(Column::new(field.fid, bits, vec![0; (bits as usize).div_ceil(8)]))
        }
        CompressionAction::DevIid => {
            let iid = ctx.node_iid().ok_or_else(|| {
                SchcError::Decompression("DevIID needs the device address".to_string())
            })?;
            Ok(Column::from_bytes(field.fid, &iid))
        }
        CompressionAction::AppIid => Err(SchcError::UnsupportedAction("AppIID")),
    }
}

fn fixed_bits(field: &Field) -> Result<u16> {
    field.fixed_bits().ok_or_else(|| {
        SchcError::Decompression(format!("{} needs a fixed length", field.fid))
    })
}

/// Column for a target value, sized by the field length.
fn column_for(field: &Field, value: &[u8]) -> Column {
    match field.fl {
        FieldLength::Fixed(bits) => Column::new(field.fid, bits, value.to_vec()),
        _ => Column::from_bytes(field.fid, value),
    }
}

fn restore_from_tv(field: &Field) -> Result<Column> {
    let tv = field.tv.single().ok_or_else(|| {
        SchcError::Decompression(format!("{} has no target value", field.fid))
    })?;
    Ok(column_for(field, tv))
}

fn read_field_value(cursor: &mut BitBuffer, field: &Field, previous: &[Column]) -> Result<Column> {
    match field.fl {
        FieldLength::Fixed(bits) => {
            let mut value = cursor.read_bytes((bits as usize).div_ceil(8))?;
            // Unused high bits of the first byte
            let pad = value.len() * 8 - bits as usize;
            clear_bits(&mut value, 0, pad)?;
            Ok(Column::new(field.fid, bits, value))
        }
        FieldLength::TokenLength => {
            let tkl = previous
                .iter()
                .find(|c| c.fid == FieldId::CoapTkl)
                .map(Column::as_u64)
                .ok_or_else(|| {
                    SchcError::Decompression("token length needs COAP.TKL first".to_string())
                })?;
            let value = cursor.read_bytes(tkl as usize)?;
            Ok(Column::from_bytes(field.fid, &value))
        }
        FieldLength::Variable => {
            let len = cursor.read_u8()?;
            let value = cursor.read_bytes(len as usize)?;
            Ok(Column::from_bytes(field.fid, &value))
        }
    }
}

fn decompress_mapping(cursor: &mut BitBuffer, field: &Field) -> Result<Column> {
    let candidates = field.tv.mapping().ok_or_else(|| {
        SchcError::Decompression(format!("{} has no mapping", field.fid))
    })?;
    let index = cursor.read_u8()? as usize;
    let value = candidates.get(index).ok_or_else(|| {
        SchcError::Decompression(format!(
            "{}: mapping index {index} out of range ({} entries)",
            field.fid,
            candidates.len()
        ))
    })?;
    Ok(column_for(field, value))
}

/// Rebuild a field from its target value and the received low bits.
fn decompress_lsb(cursor: &mut BitBuffer, field: &Field) -> Result<Column> {
    let (MatchingOperator::Msb(msb), Some(tv)) = (field.mo, field.tv.single()) else {
        return Err(SchcError::Decompression(format!(
            "{} uses LSB without an MSB target value",
            field.fid
        )));
    };
    let bits = fixed_bits(field)? as usize;
    let lsb = bits.saturating_sub(msb as usize);

    let mut value = tv.to_vec();
    let width = value.len() * 8;
    clear_bits(&mut value, width - lsb, lsb)?;

    let received = cursor.read_bytes(lsb.div_ceil(8))?;
    copy_bits(&mut value, width - lsb, &received, received.len() * 8 - lsb, lsb)?;

    Ok(Column::new(field.fid, bits as u16, value))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{RuleSet, TargetValue};

    fn create_field(fid: FieldId, mo: MatchingOperator, tv: TargetValue, cda: CompressionAction) -> Field {
        Field {
            fid,
            fl: fid
                .default_size_bits()
                .map(FieldLength::Fixed)
                .unwrap_or(FieldLength::Variable),
            di: None,
            mo,
            tv,
            cda,
        }
    }

    fn composite_device(ids: &[(u32, u8)], uncompressed: (u32, u8)) -> DeviceContext {
        let rules: Vec<String> = ids
            .iter()
            .map(|(id, len)| format!(r#"{{ "RuleID": {id}, "RuleIDLength": {len} }}"#))
            .collect();
        let json = format!(
            r#"{{ "Devices": [{{ "DeviceID": 1, "RuleIDMode": "composite",
                "UncompressedRuleID": {}, "UncompressedRuleIDLength": {},
                "CompressionRules": [{}] }}]}}"#,
            uncompressed.0,
            uncompressed.1,
            rules.join(",")
        );
        RuleSet::from_json(&json).unwrap().devices.remove(0)
    }

    fn decompress_one(field: &Field, data: &[u8]) -> Result<Column> {
        let ctx = CompressionContext::new(Direction::Up);
        let mut cursor = BitBuffer::from_bytes(data);
        decompress_field(field, &[], &ctx, &mut cursor, &mut Deferred::default())
    }

    // =========================================================================
    // Rule ID Matching Tests
    // =========================================================================

    #[test]
    fn test_match_rule_id_8bit() {
        let device = composite_device(&[(1, 8), (2, 8)], (0, 8));

        match match_rule_id(&[0x01, 0x00], &device).unwrap() {
            RuleIdMatch::Compressed(rule) => assert_eq!(rule.rule_id, 1),
            other => panic!("unexpected {other:?}"),
        }
        match match_rule_id(&[0x02, 0x00], &device).unwrap() {
            RuleIdMatch::Compressed(rule) => assert_eq!(rule.rule_id, 2),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(match_rule_id(&[0x00], &device).unwrap(), RuleIdMatch::Uncompressed);
    }

    #[test]
    fn test_match_rule_id_variable_length() {
        let device = composite_device(&[(1, 2), (4, 3), (12, 4)], (0, 2));

        // 2-bit uncompressed id = 0 (binary: 00...)
        assert_eq!(match_rule_id(&[0b0000_0000], &device).unwrap(), RuleIdMatch::Uncompressed);

        // 4-bit rule ID = 12 (binary: 1100...)
        match match_rule_id(&[0b1100_0000], &device).unwrap() {
            RuleIdMatch::Compressed(rule) => {
                assert_eq!(rule.rule_id, 12);
                assert_eq!(rule.rule_id_length, 4);
            }
            other => panic!("unexpected {other:?}"),
        }

        // 3-bit rule ID = 4 (binary: 100...)
        match match_rule_id(&[0b1000_0000], &device).unwrap() {
            RuleIdMatch::Compressed(rule) => assert_eq!(rule.rule_id, 4),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_match_rule_id_no_match() {
        let device = composite_device(&[(1, 8)], (0, 8));
        assert!(matches!(match_rule_id(&[0x02], &device), Err(SchcError::UnknownRuleId)));
        assert!(match_rule_id(&[], &device).is_err());
    }

    // =========================================================================
    // CDA Decompression Tests
    // =========================================================================

    #[test]
    fn test_decompress_not_sent() {
        let field = create_field(
            FieldId::Ipv6Ver,
            MatchingOperator::Equal,
            TargetValue::Single(vec![6]),
            CompressionAction::NotSent,
        );
        let col = decompress_one(&field, &[]).unwrap();
        assert_eq!(col, Column::new(FieldId::Ipv6Ver, 4, vec![6]));
    }

    #[test]
    fn test_decompress_value_sent() {
        let field = create_field(FieldId::UdpDevPort, MatchingOperator::Ignore, TargetValue::None, CompressionAction::ValueSent);
        let col = decompress_one(&field, &[0x1F, 0x90]).unwrap();
        assert_eq!(col.as_u64(), 8080);

        // High bits beyond the field length are dropped
        let field = create_field(FieldId::Ipv6Fl, MatchingOperator::Ignore, TargetValue::None, CompressionAction::ValueSent);
        let col = decompress_one(&field, &[0xFA, 0xBC, 0xDE]).unwrap();
        assert_eq!(col.value, vec![0x0A, 0xBC, 0xDE]);

        let field = create_field(FieldId::CoapUriPath, MatchingOperator::Ignore, TargetValue::None, CompressionAction::ValueSent);
        let col = decompress_one(&field, b"\x05usage").unwrap();
        assert_eq!(col.value, b"usage");
        assert_eq!(col.bits, 40);
    }

    #[test]
    fn test_decompress_token_uses_tkl() {
        let mut field = create_field(FieldId::CoapToken, MatchingOperator::Ignore, TargetValue::None, CompressionAction::ValueSent);
        field.fl = FieldLength::TokenLength;
        let ctx = CompressionContext::new(Direction::Up);
        let tkl = [Column::from_uint(FieldId::CoapTkl, 4, 3)];
        let mut cursor = BitBuffer::from_bytes(&[0xAA, 0xBB, 0xCC, 0xDD]);
        let col = decompress_field(&field, &tkl, &ctx, &mut cursor, &mut Deferred::default()).unwrap();
        assert_eq!(col.value, vec![0xAA, 0xBB, 0xCC]);
        assert_eq!(cursor.remaining(), 8);

        let mut cursor = BitBuffer::from_bytes(&[0xAA]);
        assert!(decompress_field(&field, &[], &ctx, &mut cursor, &mut Deferred::default()).is_err());
    }

    #[test]
    fn test_decompress_mapping_sent() {
        let field = create_field(
            FieldId::Ipv6HopLmt,
            MatchingOperator::MatchMapping,
            TargetValue::Mapping(vec![vec![64], vec![128], vec![255]]),
            CompressionAction::MappingSent,
        );
        assert_eq!(decompress_one(&field, &[1]).unwrap().value, vec![128]);
        assert!(matches!(decompress_one(&field, &[3]), Err(SchcError::Decompression(_))));
    }

    #[test]
    fn test_decompress_lsb() {
        let field = create_field(
            FieldId::Ipv6Fl,
            MatchingOperator::Msb(6),
            TargetValue::Single(vec![0x0A, 0xBF, 0xFF]),
            CompressionAction::Lsb,
        );
        // Target bits 1010 10.. and received 14 bits 00 0001 0010 0011
        let col = decompress_one(&field, &[0x01, 0x23]).unwrap();
        assert_eq!(col.value, vec![0x0A, 0x81, 0x23]);
    }

    #[test]
    fn test_decompress_compute_defers() {
        let field = create_field(FieldId::UdpCksum, MatchingOperator::Ignore, TargetValue::None, CompressionAction::ComputeChecksum);
        let ctx = CompressionContext::new(Direction::Up);
        let mut deferred = Deferred::default();
        let col = decompress_field(&field, &[], &ctx, &mut BitBuffer::new(), &mut deferred).unwrap();
        assert_eq!(col.value, vec![0, 0]);
        assert!(deferred.checksum);
        assert!(!deferred.length);
    }

    #[test]
    fn test_decompress_overrun() {
        let field = create_field(FieldId::UdpDevPort, MatchingOperator::Ignore, TargetValue::None, CompressionAction::ValueSent);
        assert!(matches!(
            decompress_one(&field, &[0x1F]),
            Err(SchcError::CursorOverrun { needed: 16, .. })
        ));
    }

    #[test]
    fn test_residue_len() {
        let rule = Rule {
            rule_id: 1,
            comment: None,
            fields: vec![
                create_field(FieldId::UdpDevPort, MatchingOperator::Msb(12), TargetValue::Single(vec![0x16, 0x30]), CompressionAction::Lsb),
                create_field(FieldId::UdpAppPort, MatchingOperator::Ignore, TargetValue::None, CompressionAction::ValueSent),
                create_field(FieldId::UdpLen, MatchingOperator::Ignore, TargetValue::None, CompressionAction::ComputeLength),
                create_field(FieldId::UdpCksum, MatchingOperator::Ignore, TargetValue::None, CompressionAction::ComputeChecksum),
            ],
        };
        assert_eq!(residue_len(&rule, Direction::Up).unwrap(), 3);
    }
}
