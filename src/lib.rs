//! # SCHC Library - Static Context Header Compression
//!
//! Layered SCHC for IPv6/UDP/CoAP: each layer is matched against its own rule
//! table and compressed independently, and the three rule ids travel in one
//! identifier in front of the residues.

// Bit-level building blocks
pub mod bit_buffer;
pub mod bits;

pub mod error;
pub mod field_id;
pub mod rule;
pub mod rule_id;

// Core functional modules
pub mod coap;
pub mod compressor;
pub mod context;
pub mod decompressor;
pub mod matcher;
pub mod packet_builder;
pub mod parser;

// Core error/result types
pub use error::{Result, SchcError};
pub use field_id::{FieldId, Layer};
pub use rule::{
    CompressionAction, CompressionRule, DeviceContext, Field, FieldLength, MatchingOperator, Rule,
    RuleIdMode, RuleSet, TargetValue,
};
pub use rule_id::LayeredRuleId;

pub use coap::CoapMessage;
pub use context::CompressionContext;
pub use parser::{Column, Direction, LinkLayer};

// Compression / decompression entry points
pub use compressor::{CompressedPacket, CompressionStats, compress_packet};
pub use decompressor::{DecompressedPacket, RuleIdMatch, decompress_packet, match_rule_id};
pub use packet_builder::{compute_checksum, compute_length};
