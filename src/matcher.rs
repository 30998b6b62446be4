//! Field Matching Logic
//!
//! Matching operators (equal, ignore, MSB, match-mapping) applied to
//! flattened columns, and per-layer rule selection: the first rule whose
//! fields line up with the columns and whose operators all hold wins.

use tracing::{debug, trace};

use crate::bits::compare_bits_aligned;
use crate::parser::{Column, Direction};
use crate::rule::{Field, FieldLength, MatchingOperator, Rule};

// =============================================================================
// Value Matching Functions
// =============================================================================

/// Byte-exact comparison of a column with a target value
#[inline]
pub fn values_match(column: &Column, target: &[u8]) -> bool {
    column.value == target
}

/// Compare the top `n` bits of a column with the target value.
///
/// The field occupies the low `bits` bits of its right-aligned bytes, so the
/// comparison starts at bit `8*bytes - bits` on both sides.
#[inline]
pub fn msb_match(column: &Column, target: &[u8], n: u8) -> bool {
    if target.len() != column.byte_len() || n as u16 > column.bits {
        return false;
    }
    if n as u16 == column.bits {
        return values_match(column, target);
    }
    let offset = column.byte_len() * 8 - column.bits as usize;
    compare_bits_aligned(&column.value, offset, target, offset, n as usize).unwrap_or(false)
}

/// Smallest index of a mapping entry equal to the column
#[inline]
pub fn mapping_index(column: &Column, candidates: &[Vec<u8>]) -> Option<usize> {
    candidates.iter().position(|c| values_match(column, c))
}

fn length_matches(field: &Field, column: &Column) -> bool {
    match field.fl {
        FieldLength::Fixed(bits) => column.bits == bits,
        FieldLength::TokenLength | FieldLength::Variable => column.bits % 8 == 0,
    }
}

/// Check a column against one rule field
pub fn field_matches(field: &Field, column: &Column) -> bool {
    if field.fid != column.fid || !length_matches(field, column) {
        return false;
    }
    match field.mo {
        MatchingOperator::Ignore => true,
        MatchingOperator::Equal => field
            .tv
            .single()
            .is_some_and(|tv| values_match(column, tv)),
        MatchingOperator::Msb(n) => field
            .tv
            .single()
            .is_some_and(|tv| msb_match(column, tv, n)),
        MatchingOperator::MatchMapping => field
            .tv
            .mapping()
            .is_some_and(|candidates| mapping_index(column, candidates).is_some()),
    }
}

// =============================================================================
// Rule Selection
// =============================================================================

/// Check whether a rule accepts the flattened header in this direction
pub fn rule_matches(rule: &Rule, columns: &[Column], direction: Direction) -> bool {
    if rule.fields_for(direction).count() != columns.len() {
        return false;
    }
    if !rule
        .fields_for(direction)
        .zip(columns)
        .all(|(f, c)| f.fid == c.fid)
    {
        return false;
    }

    for (field, column) in rule.fields_for(direction).zip(columns) {
        if !field_matches(field, column) {
            trace!(
                rule_id = rule.rule_id,
                field = %field.fid,
                value = %hex::encode(&column.value),
                "field mismatch"
            );
            return false;
        }
    }
    true
}

/// First rule, in declared order, that accepts the columns
pub fn select_rule<'r>(rules: &'r [Rule], columns: &[Column], direction: Direction) -> Option<&'r Rule> {
    let selected = rules.iter().find(|r| rule_matches(r, columns, direction));
    match selected {
        Some(rule) => debug!(rule_id = rule.rule_id, ?direction, "rule selected"),
        None => debug!(candidates = rules.len(), ?direction, "no rule matched"),
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_id::FieldId;
    use crate::rule::{CompressionAction, TargetValue};

    fn field(fid: FieldId, mo: MatchingOperator, tv: TargetValue) -> Field {
        Field {
            fid,
            fl: fid
                .default_size_bits()
                .map(FieldLength::Fixed)
                .unwrap_or(FieldLength::Variable),
            di: None,
            mo,
            tv,
            cda: CompressionAction::ValueSent,
        }
    }

    fn port(value: u64) -> Column {
        Column::from_uint(FieldId::UdpDevPort, 16, value)
    }

    // =========================================================================
    // values_match tests
    // =========================================================================

    #[test]
    fn test_values_match_bytes() {
        let col = Column::from_bytes(FieldId::CoapUriPath, b"usage");
        assert!(values_match(&col, b"usage"));
        assert!(!values_match(&col, b"usag"));
        assert!(!values_match(&col, b"usagf"));
    }

    #[test]
    fn test_values_match_boundary_values() {
        assert!(values_match(&port(65535), &[0xFF, 0xFF]));
        assert!(values_match(&port(0), &[0x00, 0x00]));
        assert!(!values_match(&port(0), &[0x00]));
    }

    // =========================================================================
    // msb_match tests
    // =========================================================================

    #[test]
    fn test_msb_match_basic() {
        let col = port(0xAB12);
        assert!(msb_match(&col, &[0xAB, 0x00], 8));
        assert!(!msb_match(&col, &[0xAB, 0x00], 12));
    }

    #[test]
    fn test_msb_match_exact() {
        assert!(msb_match(&port(0x1234), &[0x12, 0x34], 16));
        assert!(!msb_match(&port(0x1234), &[0x12, 0x35], 16));
    }

    #[test]
    fn test_msb_match_single_bit() {
        assert!(msb_match(&port(0x8000), &[0x80, 0x00], 1));
        assert!(!msb_match(&port(0x7FFF), &[0x80, 0x00], 1));
    }

    #[test]
    fn test_msb_match_unaligned_field() {
        // 20-bit flow label 0x12345 sits in bytes 01 23 45
        let col = Column::from_uint(FieldId::Ipv6Fl, 20, 0x12345);
        assert!(msb_match(&col, &[0x01, 0x23, 0x40], 16));
        assert!(!msb_match(&col, &[0x01, 0x33, 0x40], 16));
        assert!(msb_match(&col, &[0x01, 0xFF, 0xFF], 4));
    }

    #[test]
    fn test_msb_match_bits_exceeds_field() {
        let col = Column::from_uint(FieldId::Ipv6HopLmt, 8, 0xFF);
        assert!(!msb_match(&col, &[0xFF], 16));
    }

    #[test]
    fn test_msb_match_zero_bits() {
        assert!(msb_match(&port(0xFFFF), &[0x00, 0x00], 0));
    }

    // =========================================================================
    // match-mapping tests
    // =========================================================================

    #[test]
    fn test_mapping_picks_smallest_index() {
        let candidates = vec![vec![0x00, 0x01], vec![0x16, 0x33], vec![0x16, 0x33]];
        assert_eq!(mapping_index(&port(5683), &candidates), Some(1));
        assert_eq!(mapping_index(&port(1), &candidates), Some(0));
        assert_eq!(mapping_index(&port(2), &candidates), None);
    }

    // =========================================================================
    // Rule selection tests
    // =========================================================================

    fn udp_rule(rule_id: u32, dev_port: MatchingOperator, tv: TargetValue) -> Rule {
        Rule {
            rule_id,
            comment: None,
            fields: vec![
                field(FieldId::UdpDevPort, dev_port, tv),
                field(FieldId::UdpAppPort, MatchingOperator::Ignore, TargetValue::None),
                field(FieldId::UdpLen, MatchingOperator::Ignore, TargetValue::None),
                field(FieldId::UdpCksum, MatchingOperator::Ignore, TargetValue::None),
            ],
        }
    }

    fn udp_columns(dev_port: u64) -> Vec<Column> {
        vec![
            Column::from_uint(FieldId::UdpDevPort, 16, dev_port),
            Column::from_uint(FieldId::UdpAppPort, 16, 5683),
            Column::from_uint(FieldId::UdpLen, 16, 20),
            Column::from_uint(FieldId::UdpCksum, 16, 0x1234),
        ]
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let rules = vec![
            udp_rule(1, MatchingOperator::Equal, TargetValue::Single(vec![0x00, 0x50])),
            udp_rule(2, MatchingOperator::Msb(12), TargetValue::Single(vec![0x16, 0x30])),
            udp_rule(3, MatchingOperator::Ignore, TargetValue::None),
        ];

        assert_eq!(select_rule(&rules, &udp_columns(80), Direction::Up).unwrap().rule_id, 1);
        assert_eq!(select_rule(&rules, &udp_columns(5683), Direction::Up).unwrap().rule_id, 2);
        assert_eq!(select_rule(&rules, &udp_columns(9), Direction::Up).unwrap().rule_id, 3);
    }

    #[test]
    fn test_no_rule_matches() {
        let rules = vec![udp_rule(1, MatchingOperator::Equal, TargetValue::Single(vec![0x00, 0x50]))];
        assert!(select_rule(&rules, &udp_columns(81), Direction::Up).is_none());
        assert!(select_rule(&[], &udp_columns(81), Direction::Up).is_none());
    }

    #[test]
    fn test_field_sequence_must_line_up() {
        let rule = udp_rule(1, MatchingOperator::Ignore, TargetValue::None);
        let mut cols = udp_columns(1);
        cols.pop();
        assert!(!rule_matches(&rule, &cols, Direction::Up));

        let mut cols = udp_columns(1);
        cols.swap(0, 1);
        assert!(!rule_matches(&rule, &cols, Direction::Up));
    }

    #[test]
    fn test_direction_filters_fields() {
        let mut rule = udp_rule(1, MatchingOperator::Ignore, TargetValue::None);
        let mut down_only = field(
            FieldId::UdpAppPort,
            MatchingOperator::Equal,
            TargetValue::Single(vec![0x00, 0x01]),
        );
        down_only.di = Some(Direction::Down);
        rule.fields[1].di = Some(Direction::Up);
        rule.fields.insert(2, down_only);

        assert!(rule_matches(&rule, &udp_columns(1), Direction::Up));
        assert!(!rule_matches(&rule, &udp_columns(1), Direction::Down));
    }

    #[test]
    fn test_fixed_length_must_agree() {
        let mut f = field(FieldId::CoapUriPath, MatchingOperator::Ignore, TargetValue::None);
        f.fl = FieldLength::Fixed(40);
        assert!(field_matches(&f, &Column::from_bytes(FieldId::CoapUriPath, b"usage")));
        assert!(!field_matches(&f, &Column::from_bytes(FieldId::CoapUriPath, b"temp")));
    }
}
