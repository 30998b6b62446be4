//! Layered rule identifier
//!
//! ```text
//!   7   6   5   4   3   2   1   0
//! +---+-----------+-------+-------+
//! | F |    APL    |  TPL  |  NWL  |
//! +---+-----------+-------+-------+
//! ```
//!
//! A per-layer id of 0 means the layer travels uncompressed.

use crate::field_id::Layer;

pub const NWL_SHIFT: u8 = 0;
pub const TPL_SHIFT: u8 = 2;
pub const APL_SHIFT: u8 = 4;
pub const FRAG_SHIFT: u8 = 7;

const NWL_MASK: u8 = 0b11;
const TPL_MASK: u8 = 0b11;
const APL_MASK: u8 = 0b111;

/// Largest rule id a layer can carry in the layered byte.
pub fn max_layer_rule_id(layer: Layer) -> u32 {
    match layer {
        Layer::Network => NWL_MASK as u32,
        Layer::Transport => TPL_MASK as u32,
        Layer::Application => APL_MASK as u32,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LayeredRuleId {
    pub fragmented: bool,
    pub network: u8,
    pub transport: u8,
    pub application: u8,
}

impl LayeredRuleId {
    pub fn new(network: u8, transport: u8, application: u8) -> Self {
        Self {
            fragmented: false,
            network,
            transport,
            application,
        }
    }

    pub fn layer(&self, layer: Layer) -> u8 {
        match layer {
            Layer::Network => self.network,
            Layer::Transport => self.transport,
            Layer::Application => self.application,
        }
    }

    pub fn to_byte(self) -> u8 {
        ((self.fragmented as u8) << FRAG_SHIFT)
            | ((self.application & APL_MASK) << APL_SHIFT)
            | ((self.transport & TPL_MASK) << TPL_SHIFT)
            | ((self.network & NWL_MASK) << NWL_SHIFT)
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            fragmented: (byte >> FRAG_SHIFT) & 1 == 1,
            network: (byte >> NWL_SHIFT) & NWL_MASK,
            transport: (byte >> TPL_SHIFT) & TPL_MASK,
            application: (byte >> APL_SHIFT) & APL_MASK,
        }
    }
}
