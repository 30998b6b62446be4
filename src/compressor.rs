//! Compression Logic
//!
//! Implements the SCHC compression actions (CDAs) that turn matched columns
//! into residue bytes, and the layered pipeline that compresses an
//! IPv6/UDP/CoAP packet into `[rule id][IPv6][UDP][CoAP][payload]`.

use tracing::{debug, trace};

use crate::bit_buffer::BitBuffer;
use crate::bits::copy_bits;
use crate::context::CompressionContext;
use crate::error::{Result, SchcError};
use crate::field_id::Layer;
use crate::matcher::{mapping_index, select_rule};
use crate::parser::{
    Column, IPV6_HEADER_LEN, UDP_HEADER_LEN, flatten_coap, flatten_ipv6, flatten_udp,
};
use crate::rule::{
    CompressionAction, DeviceContext, Field, FieldLength, MatchingOperator, Rule, RuleIdMode,
};
use crate::rule_id::{FRAG_SHIFT, LayeredRuleId};

// =============================================================================
// Compressed Packet
// =============================================================================

/// Header sizes before and after compression
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionStats {
    pub original_header_bits: usize,
    pub compressed_header_bits: usize,
}

impl CompressionStats {
    /// Savings in bits
    pub fn savings_bits(&self) -> i64 {
        self.original_header_bits as i64 - self.compressed_header_bits as i64
    }

    /// Savings displayed as bytes (with fractional precision)
    pub fn savings_bytes(&self) -> f64 {
        self.savings_bits() as f64 / 8.0
    }
}

/// Final compressed packet output
#[derive(Debug, Clone)]
pub struct CompressedPacket {
    pub data: Vec<u8>,
    pub rule_id: u32,
    pub rule_id_length: u8,
    /// Per-layer rule ids when the device uses the layered rule id.
    pub layered: Option<LayeredRuleId>,
    pub stats: CompressionStats,
}

impl CompressedPacket {
    /// Set or clear the FRAG bit of a layered rule id.
    pub fn set_fragmented(&mut self, fragmented: bool) -> Result<()> {
        let (Some(layered), Some(first)) = (self.layered.as_mut(), self.data.first_mut()) else {
            return Err(SchcError::Compression(
                "only layered rule IDs carry a FRAG bit".to_string(),
            ));
        };
        layered.fragmented = fragmented;
        *first = (*first & !(1 << FRAG_SHIFT)) | ((fragmented as u8) << FRAG_SHIFT);
        Ok(())
    }
}

// =============================================================================
// Field Compression
// =============================================================================

/// Compress the columns of one layer with a matched rule.
pub fn compress_with_rule(
    rule: &Rule,
    columns: &[Column],
    ctx: &CompressionContext,
    out: &mut BitBuffer,
) -> Result<()> {
    for (field, column) in rule.fields_for(ctx.direction).zip(columns) {
        let before = out.len();
        compress_field(field, column, ctx, out)?;
        trace!(
            field = %field.fid,
            cda = field.cda.as_str(),
            sent_bits = out.len() - before,
            "field compressed"
        );
    }
    Ok(())
}

/// Compress a single field according to its CDA
fn compress_field(
    field: &Field,
    column: &Column,
    ctx: &CompressionContext,
    out: &mut BitBuffer,
) -> Result<()> {
    match field.cda {
        CompressionAction::NotSent
        | CompressionAction::ComputeLength
        | CompressionAction::ComputeChecksum => {}
        CompressionAction::ValueSent => send_value(field, column, out)?,
        CompressionAction::MappingSent => {
            let index = field
                .tv
                .mapping()
                .and_then(|candidates| mapping_index(column, candidates))
                .ok_or_else(|| {
                    SchcError::Compression(format!("{} has no mapping entry", field.fid))
                })?;
            out.write_u8(index as u8);
        }
        CompressionAction::Lsb => {
            let MatchingOperator::Msb(msb) = field.mo else {
                return Err(SchcError::Compression(format!(
                    "{} uses LSB without MSB",
                    field.fid
                )));
            };
            out.write_all_bytes(&lsb_residue(column, msb)?);
        }
        CompressionAction::DevIid => {
            let iid = ctx.node_iid().ok_or_else(|| {
                SchcError::Compression("DevIID needs the device address".to_string())
            })?;
            if column.value != iid {
                return Err(SchcError::Compression(
                    "interface id differs from the device address".to_string(),
                ));
            }
        }
        CompressionAction::AppIid => return Err(SchcError::UnsupportedAction("AppIID")),
    }
    Ok(())
}

/// Send the full field value
fn send_value(field: &Field, column: &Column, out: &mut BitBuffer) -> Result<()> {
    match field.fl {
        FieldLength::Fixed(_) | FieldLength::TokenLength => out.write_all_bytes(&column.value),
        FieldLength::Variable => {
            let len = u8::try_from(column.byte_len()).map_err(|_| {
                SchcError::Compression(format!(
                    "{} is {} bytes, too long for a length prefix",
                    field.fid,
                    column.byte_len()
                ))
            })?;
            out.write_u8(len);
            out.write_all_bytes(&column.value);
        }
    }
    Ok(())
}

/// The low `bits - msb` bits of a column, right-aligned in whole bytes.
pub fn lsb_residue(column: &Column, msb: u8) -> Result<Vec<u8>> {
    let lsb = (column.bits as usize).saturating_sub(msb as usize);
    let mut residue = vec![0u8; lsb.div_ceil(8)];
    if lsb > 0 {
        let start = residue.len() * 8 - lsb;
        copy_bits(&mut residue, start, &column.value, column.byte_len() * 8 - lsb, lsb)?;
    }
    Ok(residue)
}

// =============================================================================
// Layer Pipeline
// =============================================================================

/// Outcome of compressing one layer
struct LayerPart {
    rule_id: Option<u32>,
    bytes: Vec<u8>,
    /// Bytes of the input covered by this part.
    consumed: usize,
}

impl LayerPart {
    fn verbatim(data: &[u8]) -> Self {
        Self {
            rule_id: None,
            bytes: data.to_vec(),
            consumed: data.len(),
        }
    }
}

fn flatten(layer: Layer, data: &[u8], ctx: &mut CompressionContext) -> Result<usize> {
    match layer {
        Layer::Network => flatten_ipv6(data, ctx.direction, &mut ctx.columns).map(|_| data.len()),
        Layer::Transport => flatten_udp(data, ctx.direction, &mut ctx.columns).map(|_| data.len()),
        Layer::Application => flatten_coap(data, &mut ctx.columns),
    }
}

/// Compress one layer, falling back to a verbatim copy of `data`.
///
/// For CoAP, `data` is the whole message; a compressed part only covers its
/// header and the payload is appended separately.
fn compress_layer(
    device: &DeviceContext,
    ctx: &mut CompressionContext,
    layer: Layer,
    data: &[u8],
) -> LayerPart {
    let header_len = match flatten(layer, data, ctx) {
        Ok(len) => len,
        Err(e) => {
            debug!(%layer, error = %e, "layer not parsable, sending verbatim");
            return LayerPart::verbatim(data);
        }
    };

    let Some(rule) = select_rule(device.rules(layer), &ctx.columns, ctx.direction) else {
        debug!(%layer, "no rule matched, sending verbatim");
        return LayerPart::verbatim(data);
    };

    let mut out = BitBuffer::new();
    if let Err(e) = compress_with_rule(rule, &ctx.columns, ctx, &mut out) {
        debug!(%layer, rule_id = rule.rule_id, error = %e, "compression failed, sending verbatim");
        return LayerPart::verbatim(data);
    }

    LayerPart {
        rule_id: Some(rule.rule_id),
        bytes: out.into_vec(),
        consumed: header_len,
    }
}

/// Compress an IPv6/UDP/CoAP packet for a device.
pub fn compress_packet(
    device: &DeviceContext,
    ctx: &mut CompressionContext,
    packet: &[u8],
) -> Result<CompressedPacket> {
    if packet.len() < IPV6_HEADER_LEN + UDP_HEADER_LEN {
        return Err(SchcError::InvalidPacket(format!(
            "{} bytes is too short for IPv6/UDP",
            packet.len()
        )));
    }
    let (ip, rest) = packet.split_at(IPV6_HEADER_LEN);
    let (udp, coap) = rest.split_at(UDP_HEADER_LEN);

    let ipv6_part = compress_layer(device, ctx, Layer::Network, ip);
    let udp_part = compress_layer(device, ctx, Layer::Transport, udp);
    let coap_part = compress_layer(device, ctx, Layer::Application, coap);
    let payload = &coap[coap_part.consumed..];

    let mut out = BitBuffer::new();
    let (rule_id, rule_id_length, layered) = match device.mode {
        RuleIdMode::Layered => {
            let id = LayeredRuleId::new(
                ipv6_part.rule_id.unwrap_or(0) as u8,
                udp_part.rule_id.unwrap_or(0) as u8,
                coap_part.rule_id.unwrap_or(0) as u8,
            );
            out.write_u8(id.to_byte());
            (id.to_byte() as u32, 8, Some(id))
        }
        RuleIdMode::Composite => {
            match device.composite_for(ipv6_part.rule_id, udp_part.rule_id, coap_part.rule_id) {
                Some(composite) => {
                    out.write_bits(composite.rule_id as u64, composite.rule_id_length as usize);
                    (composite.rule_id, composite.rule_id_length, None)
                }
                None => {
                    debug!("no compression rule covers the selected layer rules");
                    return finish(
                        ctx,
                        packet,
                        uncompressed(device, packet),
                        device.uncompressed_rule_id,
                        device.uncompressed_rule_id_length,
                        0,
                    );
                }
            }
        }
    };
    out.pad_to_byte();

    let mut data = out.into_vec();
    for part in [&ipv6_part, &udp_part, &coap_part] {
        data.extend_from_slice(&part.bytes);
    }
    data.extend_from_slice(payload);

    debug!(
        rule_id,
        ipv6 = ?ipv6_part.rule_id,
        udp = ?udp_part.rule_id,
        coap = ?coap_part.rule_id,
        "packet compressed"
    );

    let mut compressed = finish(ctx, packet, data, rule_id, rule_id_length, payload.len())?;
    compressed.layered = layered;
    Ok(compressed)
}

/// Uncompressed fallback: rule id followed by the whole packet.
fn uncompressed(device: &DeviceContext, packet: &[u8]) -> Vec<u8> {
    let mut out = BitBuffer::new();
    out.write_bits(
        device.uncompressed_rule_id as u64,
        device.uncompressed_rule_id_length as usize,
    );
    out.pad_to_byte();
    let mut data = out.into_vec();
    data.extend_from_slice(packet);
    data
}

fn finish(
    ctx: &CompressionContext,
    packet: &[u8],
    data: Vec<u8>,
    rule_id: u32,
    rule_id_length: u8,
    payload_len: usize,
) -> Result<CompressedPacket> {
    if let Some(capacity) = ctx.capacity
        && data.len() > capacity
    {
        return Err(SchcError::BufferTooSmall {
            needed: data.len(),
            capacity,
        });
    }

    let stats = CompressionStats {
        original_header_bits: (packet.len() - payload_len) * 8,
        compressed_header_bits: (data.len() - payload_len) * 8,
    };
    Ok(CompressedPacket {
        data,
        rule_id,
        rule_id_length,
        layered: None,
        stats,
    })
}
