//! SCHC rule structures and parsing
//!
//! A rule file describes a set of devices. Each device carries one rule table
//! per layer (IPv6, UDP, CoAP), the composite compression rules tying layer
//! rules together, and the rule id mode used on the wire. Target values are
//! normalised to right-aligned bytes when the file is loaded so that the
//! matcher and the field actions only ever compare byte strings.

use std::fs;
use std::net::Ipv6Addr;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{Result, SchcError};
use crate::field_id::{FieldId, Layer};
use crate::parser::Direction;

/// Maximum number of entries in a match-mapping table (index is one byte).
pub const MAX_MAPPING_ENTRIES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldLength {
    /// Length in bits.
    Fixed(u16),
    /// Length given by the CoAP TKL field, in bytes.
    TokenLength,
    /// Length carried in the compressed residue.
    Variable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchingOperator {
    Equal,
    Ignore,
    Msb(u8),
    MatchMapping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAction {
    NotSent,
    ValueSent,
    MappingSent,
    Lsb,
    ComputeLength,
    ComputeChecksum,
    DevIid,
    AppIid,
}

impl CompressionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionAction::NotSent => "not-sent",
            CompressionAction::ValueSent => "value-sent",
            CompressionAction::MappingSent => "mapping-sent",
            CompressionAction::Lsb => "LSB",
            CompressionAction::ComputeLength => "compute-length",
            CompressionAction::ComputeChecksum => "compute-checksum",
            CompressionAction::DevIid => "DevIID",
            CompressionAction::AppIid => "AppIID",
        }
    }
}

/// Target value, normalised to right-aligned big-endian bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TargetValue {
    #[default]
    None,
    Single(Vec<u8>),
    Mapping(Vec<Vec<u8>>),
}

impl TargetValue {
    pub fn single(&self) -> Option<&[u8]> {
        match self {
            TargetValue::Single(v) => Some(v),
            _ => None,
        }
    }

    pub fn mapping(&self) -> Option<&[Vec<u8>]> {
        match self {
            TargetValue::Mapping(v) => Some(v),
            _ => None,
        }
    }
}

/// Field descriptor within a rule
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawField")]
pub struct Field {
    pub fid: FieldId,
    pub fl: FieldLength,
    /// `None` applies to both directions.
    pub di: Option<Direction>,
    pub mo: MatchingOperator,
    pub tv: TargetValue,
    pub cda: CompressionAction,
}

impl Field {
    pub fn applies_to(&self, direction: Direction) -> bool {
        self.di.is_none_or(|di| di == direction)
    }

    /// Field length in bits for fixed-length fields.
    pub fn fixed_bits(&self) -> Option<u16> {
        match self.fl {
            FieldLength::Fixed(bits) => Some(bits),
            _ => None,
        }
    }
}

/// Field as written in the rule file.
#[derive(Debug, Deserialize)]
struct RawField {
    #[serde(rename = "FID")]
    fid: FieldId,
    #[serde(rename = "FL")]
    fl: Option<Value>,
    #[serde(rename = "DI")]
    di: Option<String>,
    #[serde(rename = "TV")]
    tv: Option<Value>,
    #[serde(rename = "MO")]
    mo: String,
    #[serde(rename = "MO.val")]
    mo_val: Option<u8>,
    #[serde(rename = "CDA")]
    cda: String,
}

fn invalid(fid: FieldId, msg: impl std::fmt::Display) -> SchcError {
    SchcError::RuleValidation(format!("Field {fid}: {msg}"))
}

impl TryFrom<RawField> for Field {
    type Error = SchcError;

    fn try_from(raw: RawField) -> Result<Self> {
        let fid = raw.fid;
        let fl = parse_field_length(fid, raw.fl.as_ref())?;

        let di = match raw.di.as_deref() {
            None | Some("BI") => None,
            Some("UP") => Some(Direction::Up),
            Some("DOWN") => Some(Direction::Down),
            Some(other) => return Err(invalid(fid, format!("unknown direction {other:?}"))),
        };

        let mo = match raw.mo.as_str() {
            "equal" => MatchingOperator::Equal,
            "ignore" => MatchingOperator::Ignore,
            "match-mapping" => MatchingOperator::MatchMapping,
            "MSB" => {
                let mo_val = raw
                    .mo_val
                    .ok_or_else(|| invalid(fid, "MSB requires MO.val"))?;
                let FieldLength::Fixed(bits) = fl else {
                    return Err(invalid(fid, "MSB requires a fixed field length"));
                };
                if mo_val as u16 > bits {
                    return Err(invalid(
                        fid,
                        format!("MO.val ({mo_val}) exceeds field length ({bits} bits)"),
                    ));
                }
                MatchingOperator::Msb(mo_val)
            }
            other => return Err(invalid(fid, format!("unknown MO {other:?}"))),
        };

        let cda = match raw.cda.as_str() {
            "not-sent" => CompressionAction::NotSent,
            "value-sent" => CompressionAction::ValueSent,
            "mapping-sent" => CompressionAction::MappingSent,
            "LSB" => CompressionAction::Lsb,
            "compute-length" => CompressionAction::ComputeLength,
            "compute-checksum" => CompressionAction::ComputeChecksum,
            "DevIID" => CompressionAction::DevIid,
            "AppIID" => CompressionAction::AppIid,
            other => return Err(invalid(fid, format!("unknown CDA {other:?}"))),
        };

        let tv = match (mo, raw.tv.as_ref()) {
            (_, None | Some(Value::Null)) => TargetValue::None,
            (MatchingOperator::MatchMapping, Some(Value::Array(items))) => {
                if items.is_empty() || items.len() > MAX_MAPPING_ENTRIES {
                    return Err(invalid(
                        fid,
                        format!("mapping needs 1 to {MAX_MAPPING_ENTRIES} entries, got {}", items.len()),
                    ));
                }
                let values = items
                    .iter()
                    .map(|item| normalize_value(item, fid, fl))
                    .collect::<Result<Vec<_>>>()?;
                TargetValue::Mapping(values)
            }
            (MatchingOperator::MatchMapping, Some(_)) => {
                return Err(invalid(fid, "match-mapping requires an array TV"));
            }
            (_, Some(value)) => TargetValue::Single(normalize_value(value, fid, fl)?),
        };

        let field = Field {
            fid,
            fl,
            di,
            mo,
            tv,
            cda,
        };
        check_combination(&field)?;
        Ok(field)
    }
}

fn parse_field_length(fid: FieldId, fl: Option<&Value>) -> Result<FieldLength> {
    let fl = match fl {
        None => match (fid.default_size_bits(), fid) {
            (Some(bits), _) => FieldLength::Fixed(bits),
            (None, FieldId::CoapToken) => FieldLength::TokenLength,
            (None, _) => FieldLength::Variable,
        },
        Some(Value::Number(n)) => {
            let bits = n
                .as_u64()
                .and_then(|b| u16::try_from(b).ok())
                .filter(|&b| b > 0)
                .ok_or_else(|| invalid(fid, format!("bad field length {n}")))?;
            FieldLength::Fixed(bits)
        }
        Some(Value::String(s)) if s == "tkl" => FieldLength::TokenLength,
        Some(Value::String(s)) if s == "var" => FieldLength::Variable,
        Some(other) => return Err(invalid(fid, format!("bad field length {other}"))),
    };

    match (fid.default_size_bits(), fl) {
        (Some(default), FieldLength::Fixed(bits)) if bits != default => Err(invalid(
            fid,
            format!("length {bits} differs from the header's {default} bits"),
        )),
        (Some(_), FieldLength::TokenLength | FieldLength::Variable) => {
            Err(invalid(fid, "header field cannot have a variable length"))
        }
        (None, FieldLength::Fixed(bits)) if bits % 8 != 0 => {
            Err(invalid(fid, "option and token lengths must be whole bytes"))
        }
        (_, FieldLength::TokenLength) if fid != FieldId::CoapToken => {
            Err(invalid(fid, "only COAP.TOKEN can take its length from TKL"))
        }
        _ => Ok(fl),
    }
}

/// Check that the MO/CDA/TV triple can be executed.
fn check_combination(field: &Field) -> Result<()> {
    let fid = field.fid;
    match field.cda {
        CompressionAction::NotSent if field.tv.single().is_none() => {
            Err(invalid(fid, "not-sent requires a single TV"))
        }
        CompressionAction::MappingSent if field.mo != MatchingOperator::MatchMapping => {
            Err(invalid(fid, "mapping-sent requires match-mapping"))
        }
        CompressionAction::Lsb if !matches!(field.mo, MatchingOperator::Msb(_)) => {
            Err(invalid(fid, "LSB requires MSB"))
        }
        CompressionAction::ComputeLength
            if !matches!(fid, FieldId::Ipv6Len | FieldId::UdpLen) =>
        {
            Err(invalid(fid, "compute-length only applies to length fields"))
        }
        CompressionAction::ComputeChecksum if fid != FieldId::UdpCksum => {
            Err(invalid(fid, "compute-checksum only applies to UDP.CKSUM"))
        }
        CompressionAction::DevIid if fid != FieldId::Ipv6DevIid => {
            Err(invalid(fid, "DevIID only applies to IPV6.DEV_IID"))
        }
        CompressionAction::AppIid if fid != FieldId::Ipv6AppIid => {
            Err(invalid(fid, "AppIID only applies to IPV6.APP_IID"))
        }
        _ => match field.mo {
            MatchingOperator::Equal | MatchingOperator::Msb(_) if field.tv.single().is_none() => {
                Err(invalid(fid, "equal and MSB require a single TV"))
            }
            MatchingOperator::MatchMapping if field.tv.mapping().is_none() => {
                Err(invalid(fid, "match-mapping requires a TV list"))
            }
            _ => Ok(()),
        },
    }
}

/// Turn a JSON target value into right-aligned bytes for the field.
fn normalize_value(value: &Value, fid: FieldId, fl: FieldLength) -> Result<Vec<u8>> {
    let name = fid.as_str();
    let bytes = match value {
        Value::Number(n) => {
            let n = n
                .as_u64()
                .ok_or_else(|| invalid(fid, format!("TV {n} is not an unsigned integer")))?;
            let be = n.to_be_bytes();
            let first = be.iter().position(|&b| b != 0).unwrap_or(be.len());
            be[first..].to_vec()
        }
        Value::String(s) if name.ends_with("PREFIX") => {
            let prefix = s.split('/').next().unwrap_or(s);
            let prefix = if prefix.is_empty() { "::" } else { prefix };
            let addr: Ipv6Addr = prefix
                .parse()
                .map_err(|_| invalid(fid, format!("bad prefix {s:?}")))?;
            addr.octets()[..8].to_vec()
        }
        Value::String(s) if name.ends_with("IID") && s.contains(':') => {
            let addr: Ipv6Addr = s
                .parse()
                .map_err(|_| invalid(fid, format!("bad interface id {s:?}")))?;
            addr.octets()[8..].to_vec()
        }
        Value::String(s) => match s.strip_prefix("0x") {
            Some(digits) => {
                hex::decode(digits).map_err(|e| invalid(fid, format!("bad hex TV {s:?}: {e}")))?
            }
            None => s.as_bytes().to_vec(),
        },
        other => return Err(invalid(fid, format!("unsupported TV {other}"))),
    };

    match fl {
        FieldLength::Fixed(bits) => fit_to_width(fid, bytes, bits),
        _ => Ok(bytes),
    }
}

/// Right-align `bytes` into `ceil(bits/8)` bytes, rejecting values wider than the field.
fn fit_to_width(fid: FieldId, bytes: Vec<u8>, bits: u16) -> Result<Vec<u8>> {
    let width = (bits as usize).div_ceil(8);
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    let significant = &bytes[first..];
    let pad_bits = width * 8 - bits as usize;

    let too_wide = significant.len() > width
        || (significant.len() == width && pad_bits > 0 && significant[0] >> (8 - pad_bits) != 0);
    if too_wide {
        return Err(invalid(fid, format!("TV does not fit in {bits} bits")));
    }

    let mut out = vec![0u8; width - significant.len()];
    out.extend_from_slice(significant);
    Ok(out)
}

/// Per-layer SCHC rule
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Rule {
    #[serde(rename = "RuleID")]
    pub rule_id: u32,

    #[serde(rename = "Comment", default)]
    pub comment: Option<String>,

    #[serde(rename = "Fields")]
    pub fields: Vec<Field>,
}

impl Rule {
    pub fn fields_for(&self, direction: Direction) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(move |f| f.applies_to(direction))
    }

    pub fn up_count(&self) -> usize {
        self.fields_for(Direction::Up).count()
    }

    pub fn down_count(&self) -> usize {
        self.fields_for(Direction::Down).count()
    }

    pub fn total_count(&self) -> usize {
        self.fields.len()
    }
}

const IPV6_ORDER: &[FieldId] = &[
    FieldId::Ipv6Ver,
    FieldId::Ipv6Tc,
    FieldId::Ipv6Fl,
    FieldId::Ipv6Len,
    FieldId::Ipv6Nxt,
    FieldId::Ipv6HopLmt,
    FieldId::Ipv6DevPrefix,
    FieldId::Ipv6DevIid,
    FieldId::Ipv6AppPrefix,
    FieldId::Ipv6AppIid,
];

const UDP_ORDER: &[FieldId] = &[
    FieldId::UdpDevPort,
    FieldId::UdpAppPort,
    FieldId::UdpLen,
    FieldId::UdpCksum,
];

/// Canonical field order of a fixed-layout layer, `None` for CoAP.
pub fn canonical_order(layer: Layer) -> Option<&'static [FieldId]> {
    match layer {
        Layer::Network => Some(IPV6_ORDER),
        Layer::Transport => Some(UDP_ORDER),
        Layer::Application => None,
    }
}

fn validate_layer_rule(rule: &Rule, layer: Layer) -> Result<()> {
    if rule.rule_id == 0 {
        return Err(SchcError::RuleValidation(format!(
            "{layer} rule ID 0 is reserved for uncompressed layers"
        )));
    }
    if let Some(field) = rule.fields.iter().find(|f| f.fid.layer() != layer) {
        return Err(SchcError::RuleValidation(format!(
            "{layer} rule {} contains {} field {}",
            rule.rule_id,
            field.fid.layer(),
            field.fid
        )));
    }
    if let Some(order) = canonical_order(layer) {
        for direction in [Direction::Up, Direction::Down] {
            let fids: Vec<FieldId> = rule.fields_for(direction).map(|f| f.fid).collect();
            if fids != order {
                return Err(SchcError::RuleValidation(format!(
                    "{layer} rule {} does not list every header field in order for {direction:?}",
                    rule.rule_id
                )));
            }
        }
    }
    Ok(())
}

/// How rule ids are put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleIdMode {
    /// One byte carrying a 2/2/3-bit rule id per layer.
    #[default]
    Layered,
    /// The id of a composite compression rule.
    Composite,
}

/// Composite rule binding one rule per layer to a single rule id
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CompressionRule {
    #[serde(rename = "RuleID")]
    pub rule_id: u32,

    #[serde(rename = "RuleIDLength", default = "default_rule_id_length")]
    pub rule_id_length: u8,

    #[serde(rename = "Comment", default)]
    pub comment: Option<String>,

    #[serde(rename = "IPv6", default)]
    pub ipv6: Option<u32>,

    #[serde(rename = "UDP", default)]
    pub udp: Option<u32>,

    #[serde(rename = "CoAP", default)]
    pub coap: Option<u32>,
}

impl CompressionRule {
    pub fn layer_rule(&self, layer: Layer) -> Option<u32> {
        match layer {
            Layer::Network => self.ipv6,
            Layer::Transport => self.udp,
            Layer::Application => self.coap,
        }
    }
}

fn default_rule_id_length() -> u8 {
    8
}

/// Everything both ends know about one device
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceContext {
    #[serde(rename = "DeviceID")]
    pub device_id: u32,

    #[serde(rename = "RuleIDMode", default)]
    pub mode: RuleIdMode,

    #[serde(rename = "UncompressedRuleID", default)]
    pub uncompressed_rule_id: u32,

    #[serde(rename = "UncompressedRuleIDLength", default = "default_rule_id_length")]
    pub uncompressed_rule_id_length: u8,

    /// Address of the device, used by `DevIID`.
    #[serde(rename = "DeviceAddress", default)]
    pub device_address: Option<Ipv6Addr>,

    #[serde(rename = "IPv6Rules", default)]
    pub ipv6_rules: Vec<Rule>,

    #[serde(rename = "UDPRules", default)]
    pub udp_rules: Vec<Rule>,

    #[serde(rename = "CoAPRules", default)]
    pub coap_rules: Vec<Rule>,

    #[serde(rename = "CompressionRules", default)]
    pub compression_rules: Vec<CompressionRule>,
}

impl DeviceContext {
    /// Rules of one layer, in declared order.
    pub fn rules(&self, layer: Layer) -> &[Rule] {
        match layer {
            Layer::Network => &self.ipv6_rules,
            Layer::Transport => &self.udp_rules,
            Layer::Application => &self.coap_rules,
        }
    }

    pub fn rule(&self, layer: Layer, rule_id: u32) -> Result<&Rule> {
        self.rules(layer)
            .iter()
            .find(|r| r.rule_id == rule_id)
            .ok_or(SchcError::RuleNotFound { layer, rule_id })
    }

    /// First composite rule bound to exactly this per-layer selection.
    pub fn composite_for(
        &self,
        ipv6: Option<u32>,
        udp: Option<u32>,
        coap: Option<u32>,
    ) -> Option<&CompressionRule> {
        self.compression_rules
            .iter()
            .find(|c| c.ipv6 == ipv6 && c.udp == udp && c.coap == coap)
    }

    fn validate(&self) -> Result<()> {
        for layer in [Layer::Network, Layer::Transport, Layer::Application] {
            for rule in self.rules(layer) {
                validate_layer_rule(rule, layer)?;
            }
            if self.mode == RuleIdMode::Layered {
                let max = crate::rule_id::max_layer_rule_id(layer);
                if let Some(rule) = self.rules(layer).iter().find(|r| r.rule_id > max) {
                    return Err(SchcError::RuleValidation(format!(
                        "device {}: {layer} rule ID {} does not fit the layered rule ID (max {max})",
                        self.device_id, rule.rule_id
                    )));
                }
            }
        }

        for composite in &self.compression_rules {
            if composite.rule_id_length == 0 || composite.rule_id_length > 32 {
                return Err(SchcError::RuleValidation(format!(
                    "device {}: rule {} has invalid RuleIDLength {}",
                    self.device_id, composite.rule_id, composite.rule_id_length
                )));
            }
            warn_if_too_wide(self.device_id, composite.rule_id, composite.rule_id_length);
            for layer in [Layer::Network, Layer::Transport, Layer::Application] {
                if let Some(id) = composite.layer_rule(layer) {
                    self.rule(layer, id)?;
                }
            }
        }

        if self.mode == RuleIdMode::Composite {
            if self.uncompressed_rule_id_length == 0 || self.uncompressed_rule_id_length > 32 {
                return Err(SchcError::RuleValidation(format!(
                    "device {}: invalid UncompressedRuleIDLength {}",
                    self.device_id, self.uncompressed_rule_id_length
                )));
            }
            warn_if_too_wide(
                self.device_id,
                self.uncompressed_rule_id,
                self.uncompressed_rule_id_length,
            );

            // Ids are read longest first from a zero-padded byte, so no id may
            // be a bit prefix of another.
            let mut ids: Vec<(u32, u8)> = self
                .compression_rules
                .iter()
                .map(|c| (c.rule_id, c.rule_id_length))
                .collect();
            ids.push((self.uncompressed_rule_id, self.uncompressed_rule_id_length));
            for (i, &a) in ids.iter().enumerate() {
                for &b in &ids[i + 1..] {
                    if rule_ids_overlap(a, b) {
                        return Err(SchcError::RuleValidation(format!(
                            "device {}: rule ID {}/{} and rule ID {}/{} share a prefix",
                            self.device_id, a.0, a.1, b.0, b.1
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// True when the shorter `(id, length)` equals the top bits of the longer one.
fn rule_ids_overlap(a: (u32, u8), b: (u32, u8)) -> bool {
    let (short, long) = if a.1 <= b.1 { (a, b) } else { (b, a) };
    let masked = |(id, len): (u32, u8)| id as u64 & ((1u64 << len) - 1);
    masked(long) >> (long.1 - short.1) == masked(short)
}

fn warn_if_too_wide(device_id: u32, rule_id: u32, length: u8) {
    let max_rule_id = (1u64 << length) - 1;
    if rule_id as u64 > max_rule_id {
        warn!(
            device_id,
            rule_id, length, max_rule_id, "rule ID exceeds its bit width and will be truncated"
        );
    }
}

/// Collection of device contexts
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSet {
    #[serde(rename = "Devices")]
    pub devices: Vec<DeviceContext>,
}

impl RuleSet {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let set: RuleSet = serde_json::from_str(json)?;
        for device in &set.devices {
            device.validate()?;
        }
        Ok(set)
    }

    pub fn device(&self, device_id: u32) -> Result<&DeviceContext> {
        self.devices
            .iter()
            .find(|d| d.device_id == device_id)
            .ok_or(SchcError::UnknownDevice(device_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(json: &str) -> Result<Field> {
        Ok(serde_json::from_str(json)?)
    }

    fn udp_rule_json(port_field: &str) -> String {
        format!(
            r#"{{ "Devices": [{{
                "DeviceID": 1,
                "UDPRules": [{{ "RuleID": 1, "Fields": [
                    {port_field},
                    {{ "FID": "UDP.APP_PORT", "TV": 5683, "MO": "equal", "CDA": "not-sent" }},
                    {{ "FID": "UDP.LEN", "MO": "ignore", "CDA": "compute-length" }},
                    {{ "FID": "UDP.CKSUM", "MO": "ignore", "CDA": "compute-checksum" }}
                ]}}]
            }}]}}"#
        )
    }

    // =========================================================================
    // MO.val validation tests
    // =========================================================================

    #[test]
    fn test_mo_val_valid_within_field_length() {
        let json = udp_rule_json(
            r#"{ "FID": "UDP.DEV_PORT", "TV": 5680, "MO": "MSB", "CDA": "LSB", "MO.val": 8 }"#,
        );
        assert!(RuleSet::from_json(&json).is_ok());
    }

    #[test]
    fn test_mo_val_equal_to_field_length() {
        let json = udp_rule_json(
            r#"{ "FID": "UDP.DEV_PORT", "TV": 5680, "MO": "MSB", "CDA": "LSB", "MO.val": 16 }"#,
        );
        assert!(RuleSet::from_json(&json).is_ok());
    }

    #[test]
    fn test_mo_val_exceeds_field_length_error() {
        let json = udp_rule_json(
            r#"{ "FID": "UDP.DEV_PORT", "TV": 5680, "MO": "MSB", "CDA": "LSB", "MO.val": 20 }"#,
        );
        let err_msg = RuleSet::from_json(&json).unwrap_err().to_string();
        assert!(err_msg.contains("MO.val"), "{err_msg}");
        assert!(err_msg.contains("20"), "{err_msg}");
    }

    #[test]
    fn test_msb_without_mo_val_error() {
        assert!(field(r#"{ "FID": "UDP.DEV_PORT", "TV": 5680, "MO": "MSB", "CDA": "LSB" }"#).is_err());
    }

    #[test]
    fn test_non_msb_mo_ignores_mo_val() {
        let f = field(
            r#"{ "FID": "UDP.APP_PORT", "TV": 5680, "MO": "equal", "CDA": "not-sent", "MO.val": 100 }"#,
        )
        .unwrap();
        assert_eq!(f.mo, MatchingOperator::Equal);
    }

    // =========================================================================
    // Field combination tests
    // =========================================================================

    #[test]
    fn test_lsb_requires_msb() {
        let err = field(r#"{ "FID": "UDP.DEV_PORT", "TV": 5680, "MO": "equal", "CDA": "LSB" }"#)
            .unwrap_err();
        assert!(err.to_string().contains("LSB requires MSB"));
    }

    #[test]
    fn test_not_sent_requires_tv() {
        assert!(field(r#"{ "FID": "IPV6.VER", "MO": "ignore", "CDA": "not-sent" }"#).is_err());
    }

    #[test]
    fn test_mapping_sent_requires_match_mapping() {
        assert!(field(r#"{ "FID": "COAP.CODE", "TV": 1, "MO": "equal", "CDA": "mapping-sent" }"#).is_err());
    }

    #[test]
    fn test_mapping_table_limits() {
        let too_many: Vec<u32> = (0..257).collect();
        let json = format!(
            r#"{{ "FID": "COAP.MID", "TV": {}, "MO": "match-mapping", "CDA": "mapping-sent" }}"#,
            serde_json::to_string(&too_many).unwrap()
        );
        assert!(field(&json).is_err());
        assert!(field(r#"{ "FID": "COAP.MID", "TV": [], "MO": "match-mapping", "CDA": "mapping-sent" }"#).is_err());
    }

    #[test]
    fn test_compute_actions_are_tied_to_their_fields() {
        assert!(field(r#"{ "FID": "UDP.CKSUM", "MO": "ignore", "CDA": "compute-length" }"#).is_err());
        assert!(field(r#"{ "FID": "IPV6.LEN", "MO": "ignore", "CDA": "compute-length" }"#).is_ok());
        assert!(field(r#"{ "FID": "IPV6.APP_IID", "MO": "ignore", "CDA": "DevIID" }"#).is_err());
    }

    #[test]
    fn test_unknown_mo_and_cda_are_rejected() {
        assert!(field(r#"{ "FID": "IPV6.VER", "TV": 6, "MO": "greater", "CDA": "not-sent" }"#).is_err());
        assert!(field(r#"{ "FID": "IPV6.VER", "TV": 6, "MO": "equal", "CDA": "compute" }"#).is_err());
    }

    // =========================================================================
    // Target value normalisation tests
    // =========================================================================

    #[test]
    fn test_number_tv_is_right_aligned() {
        let f = field(r#"{ "FID": "IPV6.FL", "TV": 74565, "MO": "equal", "CDA": "not-sent" }"#).unwrap();
        assert_eq!(f.fl, FieldLength::Fixed(20));
        assert_eq!(f.tv, TargetValue::Single(vec![0x01, 0x23, 0x45]));

        let f = field(r#"{ "FID": "IPV6.VER", "TV": 6, "MO": "equal", "CDA": "not-sent" }"#).unwrap();
        assert_eq!(f.tv, TargetValue::Single(vec![0x06]));
    }

    #[test]
    fn test_number_tv_wider_than_field_error() {
        assert!(field(r#"{ "FID": "IPV6.VER", "TV": 16, "MO": "equal", "CDA": "not-sent" }"#).is_err());
        assert!(field(r#"{ "FID": "IPV6.FL", "TV": 1048576, "MO": "equal", "CDA": "not-sent" }"#).is_err());
    }

    #[test]
    fn test_prefix_and_iid_tv() {
        let f = field(r#"{ "FID": "IPV6.DEV_PREFIX", "TV": "2001:db8::/64", "MO": "equal", "CDA": "not-sent" }"#)
            .unwrap();
        assert_eq!(f.tv, TargetValue::Single(vec![0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0]));

        let f = field(r#"{ "FID": "IPV6.APP_IID", "TV": "::1", "MO": "equal", "CDA": "not-sent" }"#).unwrap();
        assert_eq!(f.tv, TargetValue::Single(vec![0, 0, 0, 0, 0, 0, 0, 1]));
    }

    #[test]
    fn test_string_and_hex_tv_for_options() {
        let f = field(r#"{ "FID": "COAP.URI_PATH", "TV": "usage", "MO": "equal", "CDA": "not-sent" }"#).unwrap();
        assert_eq!(f.fl, FieldLength::Variable);
        assert_eq!(f.tv, TargetValue::Single(b"usage".to_vec()));

        let f = field(r#"{ "FID": "COAP.TOKEN", "TV": "0x21fa01fb", "MO": "equal", "CDA": "not-sent" }"#).unwrap();
        assert_eq!(f.fl, FieldLength::TokenLength);
        assert_eq!(f.tv, TargetValue::Single(vec![0x21, 0xFA, 0x01, 0xFB]));

        // Option integers use their minimal encoding
        let f = field(r#"{ "FID": "COAP.CONTENT_FORMAT", "TV": 0, "MO": "equal", "CDA": "not-sent" }"#).unwrap();
        assert_eq!(f.tv, TargetValue::Single(vec![]));
    }

    #[test]
    fn test_field_length_overrides() {
        let f = field(r#"{ "FID": "COAP.URI_PATH", "FL": 40, "TV": "usage", "MO": "equal", "CDA": "not-sent" }"#)
            .unwrap();
        assert_eq!(f.fl, FieldLength::Fixed(40));
        assert!(field(r#"{ "FID": "IPV6.VER", "FL": 8, "TV": 6, "MO": "equal", "CDA": "not-sent" }"#).is_err());
        assert!(field(r#"{ "FID": "COAP.URI_PATH", "FL": 12, "MO": "ignore", "CDA": "value-sent" }"#).is_err());
        assert!(field(r#"{ "FID": "COAP.URI_PATH", "FL": "tkl", "MO": "ignore", "CDA": "value-sent" }"#).is_err());
    }

    #[test]
    fn test_direction_parsing() {
        let f = field(r#"{ "FID": "COAP.TYPE", "DI": "UP", "TV": 0, "MO": "equal", "CDA": "not-sent" }"#).unwrap();
        assert_eq!(f.di, Some(Direction::Up));
        assert!(f.applies_to(Direction::Up));
        assert!(!f.applies_to(Direction::Down));
        let f = field(r#"{ "FID": "COAP.TYPE", "DI": "BI", "TV": 0, "MO": "equal", "CDA": "not-sent" }"#).unwrap();
        assert!(f.applies_to(Direction::Down));
        assert!(field(r#"{ "FID": "COAP.TYPE", "DI": "SIDEWAYS", "MO": "ignore", "CDA": "value-sent" }"#).is_err());
    }

    // =========================================================================
    // Device validation tests
    // =========================================================================

    #[test]
    fn test_udp_rule_must_be_complete() {
        let json = r#"{ "Devices": [{ "DeviceID": 1, "UDPRules": [{ "RuleID": 1, "Fields": [
            { "FID": "UDP.DEV_PORT", "TV": 5683, "MO": "equal", "CDA": "not-sent" },
            { "FID": "UDP.APP_PORT", "TV": 5683, "MO": "equal", "CDA": "not-sent" }
        ]}]}]}"#;
        assert!(matches!(RuleSet::from_json(json), Err(SchcError::RuleValidation(_))));
    }

    #[test]
    fn test_layered_rule_id_must_fit() {
        let json = udp_rule_json(r#"{ "FID": "UDP.DEV_PORT", "TV": 5683, "MO": "equal", "CDA": "not-sent" }"#)
            .replace(r#""RuleID": 1"#, r#""RuleID": 4"#);
        let err = RuleSet::from_json(&json).unwrap_err().to_string();
        assert!(err.contains("layered"), "{err}");
    }

    #[test]
    fn test_composite_must_reference_existing_rules() {
        let json = r#"{ "Devices": [{ "DeviceID": 7, "RuleIDMode": "composite",
            "CompressionRules": [{ "RuleID": 1, "RuleIDLength": 8, "CoAP": 3 }] }]}"#;
        assert!(matches!(
            RuleSet::from_json(json),
            Err(SchcError::RuleNotFound { layer: Layer::Application, rule_id: 3 })
        ));
    }

    #[test]
    fn test_uncompressed_rule_id_clash() {
        let json = r#"{ "Devices": [{ "DeviceID": 7, "RuleIDMode": "composite",
            "UncompressedRuleID": 1, "UncompressedRuleIDLength": 8,
            "CompressionRules": [{ "RuleID": 1, "RuleIDLength": 8 }] }]}"#;
        assert!(RuleSet::from_json(json).is_err());
    }

    fn composite_ids_json(ids: &[(u32, u8)], uncompressed: (u32, u8)) -> String {
        let rules: Vec<String> = ids
            .iter()
            .map(|(id, len)| format!(r#"{{ "RuleID": {id}, "RuleIDLength": {len} }}"#))
            .collect();
        format!(
            r#"{{ "Devices": [{{ "DeviceID": 7, "RuleIDMode": "composite",
                "UncompressedRuleID": {}, "UncompressedRuleIDLength": {},
                "CompressionRules": [{}] }}]}}"#,
            uncompressed.0,
            uncompressed.1,
            rules.join(",")
        )
    }

    #[test]
    fn test_rule_id_prefix_of_another_is_rejected() {
        // 01 pads to 0x40, which also reads as the 3-bit id 010
        let json = composite_ids_json(&[(1, 2), (2, 3)], (3, 2));
        let err = RuleSet::from_json(&json).unwrap_err().to_string();
        assert!(err.contains("share a prefix"), "{err}");

        // Uncompressed id 0/2 is a prefix of 1/8 (0000_0001)
        let json = composite_ids_json(&[(1, 8)], (0, 2));
        assert!(matches!(RuleSet::from_json(&json), Err(SchcError::RuleValidation(_))));

        // 01, 100, 1100 and 00 are prefix free
        let json = composite_ids_json(&[(1, 2), (4, 3), (12, 4)], (0, 2));
        assert!(RuleSet::from_json(&json).is_ok());
    }

    #[test]
    fn test_rule_ids_overlap() {
        assert!(rule_ids_overlap((1, 2), (2, 3)));
        assert!(rule_ids_overlap((2, 3), (1, 2)));
        assert!(rule_ids_overlap((5, 8), (5, 8)));
        assert!(!rule_ids_overlap((5, 8), (6, 8)));
        assert!(!rule_ids_overlap((1, 2), (4, 3)));
        // Ids wider than their length are truncated on the wire
        assert!(rule_ids_overlap((0x101, 8), (1, 8)));
    }

    #[test]
    fn test_device_lookup() {
        let json = udp_rule_json(r#"{ "FID": "UDP.DEV_PORT", "TV": 5683, "MO": "equal", "CDA": "not-sent" }"#);
        let set = RuleSet::from_json(&json).unwrap();
        let device = set.device(1).unwrap();
        assert_eq!(device.mode, RuleIdMode::Layered);
        assert_eq!(device.rule(Layer::Transport, 1).unwrap().total_count(), 4);
        assert!(matches!(set.device(2), Err(SchcError::UnknownDevice(2))));
        assert!(matches!(
            device.rule(Layer::Network, 1),
            Err(SchcError::RuleNotFound { layer: Layer::Network, rule_id: 1 })
        ));
    }

    #[test]
    fn test_field_counts_by_direction() {
        let json = r#"{ "RuleID": 1, "Fields": [
            { "FID": "COAP.VER", "TV": 1, "MO": "equal", "CDA": "not-sent" },
            { "FID": "COAP.TYPE", "DI": "UP", "TV": 0, "MO": "equal", "CDA": "not-sent" },
            { "FID": "COAP.TYPE", "DI": "DOWN", "TV": 2, "MO": "equal", "CDA": "not-sent" }
        ]}"#;
        let rule: Rule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.up_count(), 2);
        assert_eq!(rule.down_count(), 2);
        assert_eq!(rule.total_count(), 3);
    }
}
