//! Per-call compression state
//!
//! Runtime knobs for one link: direction, the device's own address (used by
//! `DevIID`), the largest compressed packet the link accepts, and column
//! scratch storage reused across calls.

use std::net::Ipv6Addr;

use crate::parser::{Column, Direction};
use crate::rule::DeviceContext;

#[derive(Debug, Clone)]
pub struct CompressionContext {
    pub direction: Direction,
    pub node_address: Option<Ipv6Addr>,
    /// Largest compressed packet, in bytes, the caller can transmit.
    pub capacity: Option<usize>,
    pub(crate) columns: Vec<Column>,
}

impl CompressionContext {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            node_address: None,
            capacity: None,
            columns: Vec::with_capacity(32),
        }
    }

    /// Context for a device, taking its address from the device context.
    pub fn for_device(device: &DeviceContext, direction: Direction) -> Self {
        let mut ctx = Self::new(direction);
        ctx.node_address = device.device_address;
        ctx
    }

    pub fn with_node_address(mut self, address: Ipv6Addr) -> Self {
        self.node_address = Some(address);
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Low 64 bits of the node address.
    pub fn node_iid(&self) -> Option<[u8; 8]> {
        let octets = self.node_address?.octets();
        let mut iid = [0u8; 8];
        iid.copy_from_slice(&octets[8..]);
        Some(iid)
    }
}
